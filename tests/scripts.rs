//! End-to-end tests: compile and run whole scripts through the public API,
//! the same way the CLI driver does, and check exactly what they print —
//! not just whether they ran.

use rlox::error::InterpretationError;
use rlox::gc::ActiveGC;
use rlox::vm::{SharedBuffer, VM};
use serial_test::serial;

fn run(source: &str) -> rlox::Result<()> {
    let gc = ActiveGC::install();
    let mut vm = VM::default();
    vm.interpret(source, &gc)
}

/// Runs `source` against a [SharedBuffer] sink and returns the result
/// alongside exactly what was printed.
fn run_capturing(source: &str) -> (rlox::Result<()>, String) {
    let gc = ActiveGC::install();
    let buffer = SharedBuffer::new();
    let mut vm = VM::with_output(buffer.clone());
    let result = vm.interpret(source, &gc);
    (result, buffer.contents())
}

fn assert_prints(source: &str, expected: &str) {
    let (result, output) = run_capturing(source);
    assert!(result.is_ok(), "expected {source:?} to run, got {result:?}");
    assert_eq!(format!("{expected}\n"), output);
}

// The six end-to-end scenarios, numbered to match their source → expected
// stdout table.

#[test]
#[serial]
fn scenario_1_arithmetic_precedence() {
    assert_prints("print 1 + 2 * 3;", "7");
}

#[test]
#[serial]
fn scenario_2_variable_reassignment() {
    assert_prints("var a = 2; var b = 3; a = a + b; print a;", "5");
}

#[test]
#[serial]
fn scenario_3_for_loop_sum() {
    assert_prints(
        "var n = 0; for (var i = 0; i < 3; i = i + 1) { n = n + i; } print n;",
        "3",
    );
}

#[test]
#[serial]
fn scenario_4_and_short_circuit() {
    assert_prints(
        r#"var x = 10; if (x > 5 and x < 20) print "ok"; else print "no";"#,
        "ok",
    );
}

#[test]
#[serial]
fn scenario_5_function_call() {
    assert_prints("fun add(a, b) { print a + b; } add(2, 3);", "5");
}

#[test]
#[serial]
fn scenario_6_string_concatenation() {
    assert_prints(r#"var s = "foo" + "bar"; print s;"#, "foobar");
}

// A few more scenarios beyond the core six, still checked on exact output.

#[test]
#[serial]
fn or_short_circuits_to_the_left_operand_path() {
    assert_prints(r#"if (false or true) print "yes"; else print "no";"#, "yes");
}

#[test]
#[serial]
fn nested_blocks_shadow_independently() {
    assert_prints(
        "var a = 1; { var a = 2; { var a = 3; print a; } print a; } print a;",
        "3\n2\n1",
    );
}

#[test]
#[serial]
fn while_loop_counts_to_three() {
    assert_prints("var i = 0; while (i < 3) { i = i + 1; } print i;", "3");
}

#[test]
#[serial]
fn implicit_nil_return_prints_as_nil() {
    assert_prints("fun noop() {} print noop();", "nil");
}

// Fatal-expected scenarios from §8's table: must exit non-zero, not print.

#[test]
#[serial]
fn adding_number_and_string_is_fatal() {
    let result = run(r#"1 + "x";"#);
    assert!(matches!(result, Err(InterpretationError::RuntimeError { .. })));
}

#[test]
#[serial]
fn reading_a_variable_in_its_own_initializer_is_fatal() {
    let result = run("var a = a;");
    assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
}

#[test]
#[serial]
fn redeclaring_a_variable_in_the_same_scope_is_fatal() {
    let result = run("var a = 1; var a = 2;");
    assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
}

#[test]
#[serial]
fn assigning_to_a_non_lvalue_is_fatal() {
    let result = run("(1 + 2) = 3;");
    assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
}

#[test]
#[serial]
fn printing_an_undefined_variable_is_fatal() {
    let result = run("print undefined;");
    assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
}

#[test]
#[serial]
fn calling_with_the_wrong_arity_is_fatal() {
    let result = run("fun add(a, b) { print a + b; } add(1);");
    assert!(matches!(result, Err(InterpretationError::RuntimeError { .. })));
}

#[test]
#[serial]
fn error_render_includes_file_and_line() {
    let result = run("print undefined;");
    let err = result.unwrap_err();
    let rendered = err.render("script.lox");
    assert!(rendered.starts_with("[File : script.lox][Line : "));
}
