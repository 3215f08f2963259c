//! The bytecode virtual machine.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::compiler;
use crate::gc::ActiveGC;
use crate::prelude::{InterpretationError, OpCode, Value};
use crate::value::Function;

/// Used as the minimum capacity of the stack.
/// Since we're using a growable [Vec], the stack size can be arbitrarily large.
const STACK_SIZE: usize = 256;

/// An in-memory `print` sink, cheaply cloneable so a test can hand one end
/// to [VM::with_output] and keep the other to read back what was written.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far, decoded as UTF-8.
    ///
    /// # Panics
    ///
    /// Panics if the buffer doesn't contain valid UTF-8 — every `Print`
    /// opcode writes a [Value]'s [std::fmt::Display] output, which is always
    /// valid UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("program output must be valid UTF-8")
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

/// One activation of a [Function]: which function it is, where execution is
/// up to in its chunk, and where its locals start in the shared value stack.
struct CallFrame {
    function: Rc<Function>,
    ip: usize,
    /// Index into the value stack of this frame's local slot 0 (its first
    /// parameter, if any). The `Function` value itself lives one slot below,
    /// at `frame_base - 1`.
    frame_base: usize,
}

/// Maintains state for the Lox virtual machine.
pub struct VM {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    /// Where `print` statements write. Defaults to stdout; tests substitute
    /// a [SharedBuffer] via [VM::with_output] so they can assert on exactly
    /// what a script printed, not just whether it ran.
    output: Box<dyn Write>,
}

impl Default for VM {
    fn default() -> Self {
        VM::with_output(std::io::stdout())
    }
}

impl VM {
    /// Creates a VM whose `print` output goes to `writer` instead of stdout.
    pub fn with_output(writer: impl Write + 'static) -> Self {
        VM {
            frames: Vec::new(),
            stack: Vec::new(),
            output: Box::new(writer),
        }
    }

    /// Compile and interpret `source`.
    ///
    /// Requires an installed [ActiveGC]: string literals (and strings
    /// produced at runtime by `+`) are interned there.
    pub fn interpret(&mut self, source: &str, gc: &ActiveGC) -> crate::Result<()> {
        log::debug!("compiling");
        let function = compiler::compile(source, gc)?;
        log::debug!("running");

        self.frames.clear();
        self.stack.clear();
        self.stack.reserve(STACK_SIZE);

        self.frames.push(CallFrame {
            function: Rc::new(function),
            ip: 0,
            frame_base: 0,
        });

        self.run()
    }

    /// The main opcode interpreter loop.
    fn run(&mut self) -> crate::Result<()> {
        use OpCode::*;

        loop {
            if self.current_frame().ip >= self.current_frame().function.chunk.len() {
                // The frame's bytecode ran out without an explicit return (there is none in this
                // language): treat it as returning `nil`.
                if self.frames.len() == 1 {
                    log::trace!("script finished");
                    return Ok(());
                }

                let finished = self.frames.pop().expect("just checked len() > 1");
                self.stack.truncate(finished.frame_base - 1);
                self.push(Value::Nil);
                continue;
            }

            if cfg!(feature = "trace") {
                use crate::debug::disassemble_instruction;

                print!("        ");
                for value in self.stack.iter() {
                    print!("[ {value:?} ]")
                }
                println!();

                disassemble_instruction(&self.current_frame().function.chunk, self.current_frame().ip);
            }

            let opcode_offset = self.current_frame().ip;
            let opcode = self.read_opcode(opcode_offset)?;

            match opcode {
                Value => {
                    let index = self.read_byte();
                    let constant = self
                        .current_frame()
                        .function
                        .chunk
                        .constants
                        .get(index as usize)
                        .expect("constant index out of range");
                    self.push(constant);
                }
                Add => self.add(opcode_offset)?,
                Subtract => self.binary_number_op(opcode_offset, |a, b| a - b)?,
                Multiply => self.binary_number_op(opcode_offset, |a, b| a * b)?,
                Divide => self.binary_number_op(opcode_offset, |a, b| a / b)?,
                Less => self.binary_comparison_op(opcode_offset, |a, b| a < b)?,
                LessEqual => self.binary_comparison_op(opcode_offset, |a, b| a <= b)?,
                Greater => self.binary_comparison_op(opcode_offset, |a, b| a > b)?,
                GreaterEqual => self.binary_comparison_op(opcode_offset, |a, b| a >= b)?,
                EqualEqual => self.equality_op(opcode_offset, |a, b| a == b)?,
                BangEqual => self.equality_op(opcode_offset, |a, b| a != b)?,
                Not => {
                    let value = self.pop();
                    self.push(value.is_falsy().into());
                }
                Negate => {
                    let operand = self.pop();
                    if let Value::Number(number) = operand {
                        self.push((-number).into());
                    } else {
                        return self.runtime_error(opcode_offset, "Operand must be a number");
                    }
                }
                GetLocal => {
                    let slot = self.read_byte();
                    let value = self.stack[self.current_frame().frame_base + slot as usize].clone();
                    self.push(value);
                }
                SetLocal => {
                    let slot = self.read_byte();
                    let value = self.peek(0).clone();
                    let index = self.current_frame().frame_base + slot as usize;
                    self.stack[index] = value;
                }
                Pop => {
                    self.pop();
                }
                Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                JumpIfFalse => {
                    let offset = self.read_u16();
                    let condition = self.pop();
                    if condition.is_falsy() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                JumpBackward => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                Print => {
                    let value = self.pop();
                    writeln!(self.output, "{value}").expect("writing program output failed");
                }
                Call => {
                    let arity = self.read_byte();
                    self.call(opcode_offset, arity)?;
                }
            }
        }
    }

    /// Begins a new [CallFrame] for the function `arity` arguments down the
    /// stack, with the callee itself one slot below that.
    fn call(&mut self, opcode_offset: usize, arity: u8) -> crate::Result<()> {
        let frame_base = self.stack.len() - arity as usize;
        let callee = self.stack[frame_base - 1].clone();

        let function = match callee {
            Value::Function(function) => function,
            _ => return self.runtime_error(opcode_offset, "Can only call functions"),
        };

        if function.arity != arity {
            let message = format!(
                "Expected {} arguments but got {}",
                function.arity, arity
            );
            return self.runtime_error(opcode_offset, &message);
        }

        if self.frames.len() >= STACK_SIZE {
            return self.runtime_error(opcode_offset, "Stack overflow");
        }

        self.frames.push(CallFrame {
            function,
            ip: 0,
            frame_base,
        });
        Ok(())
    }

    /// `+`: numeric addition, or string concatenation (the result is interned
    /// in the active GC, the same as a string literal).
    fn add(&mut self, opcode_offset: usize) -> crate::Result<()> {
        let rhs = self.pop();
        let lhs = self.pop();

        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => self.push((a + b).into()),
            (Value::String(a), Value::String(b)) => {
                let combined = format!("{a}{b}");
                let stored = ActiveGC::store_string(combined);
                self.push(Value::String(stored));
            }
            _ => return self.runtime_error(opcode_offset, "Operands must be two numbers or two strings"),
        }
        Ok(())
    }

    /// Pops two numeric operands and pushes a numeric result.
    fn binary_number_op<F>(&mut self, opcode_offset: usize, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> f64,
    {
        let rhs = self.pop();
        let lhs = self.pop();

        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(op(a, b).into());
                Ok(())
            }
            _ => self.runtime_error(opcode_offset, "Operands must be numbers"),
        }
    }

    /// Pops two numeric operands and pushes a boolean comparison result.
    fn binary_comparison_op<F>(&mut self, opcode_offset: usize, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> bool,
    {
        let rhs = self.pop();
        let lhs = self.pop();

        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(op(a, b).into());
                Ok(())
            }
            _ => self.runtime_error(opcode_offset, "Operands must be numbers"),
        }
    }

    /// `==`/`!=`: restricted to numeric operands — comparing anything else is
    /// fatal rather than silently returning `false` (see DESIGN.md).
    fn equality_op<F>(&mut self, opcode_offset: usize, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> bool,
    {
        let rhs = self.pop();
        let lhs = self.pop();

        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(op(a, b).into());
                Ok(())
            }
            _ => self.runtime_error(opcode_offset, "Operands must be numbers"),
        }
    }

    fn runtime_error<T>(&mut self, opcode_offset: usize, message: &str) -> crate::Result<T> {
        let line = self
            .current_frame()
            .function
            .chunk
            .line_number_for(opcode_offset)
            .unwrap_or(0);

        log::debug!("runtime error at line {line}: {message}");

        Err(InterpretationError::RuntimeError {
            message: message.to_owned(),
            line,
        })
    }

    #[inline(always)]
    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("VM has no active call frame")
    }

    #[inline(always)]
    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("VM has no active call frame")
    }

    /// Reads the opcode at `offset` (which must equal the current frame's
    /// `ip`) and advances `ip` past it.
    fn read_opcode(&mut self, offset: usize) -> crate::Result<OpCode> {
        let opcode = self
            .current_frame()
            .function
            .chunk
            .get(offset)
            .expect("ip within range")
            .as_opcode();

        self.current_frame_mut().ip += 1;

        opcode.ok_or_else(|| InterpretationError::RuntimeError {
            message: "invalid opcode in compiled bytecode".to_owned(),
            line: self
                .current_frame()
                .function
                .chunk
                .line_number_for(offset)
                .unwrap_or(0),
        })
    }

    /// Reads one raw operand byte, advancing `ip` past it.
    fn read_byte(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let byte = frame
            .function
            .chunk
            .get(frame.ip)
            .expect("operand byte within range")
            .as_constant_index() as u8;
        frame.ip += 1;
        byte
    }

    /// Reads a big-endian two-byte jump operand, advancing `ip` past it.
    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    /// Pushes a [Value] on to the value stack.
    #[inline(always)]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed Lox bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Peeks at the value relative to the top of the stack, without popping it.
    ///
    /// # Panics
    ///
    ///  * When the stack is empty
    ///  * When the distance goes off the end of the stack
    #[inline(always)]
    fn peek(&self, distance: usize) -> &Value {
        self.stack
            .get(self.stack.len() - 1 - distance)
            .expect("peeked escaped bounds of the stack")
    }
}

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;

    fn run(source: &str) -> crate::Result<()> {
        let gc = ActiveGC::install();
        let mut vm = VM::default();
        vm.interpret(source, &gc)
    }

    /// Runs `source` against a [SharedBuffer] sink and returns the result
    /// alongside exactly what was printed.
    fn run_capturing(source: &str) -> (crate::Result<()>, String) {
        let gc = ActiveGC::install();
        let buffer = SharedBuffer::new();
        let mut vm = VM::with_output(buffer.clone());
        let result = vm.interpret(source, &gc);
        (result, buffer.contents())
    }

    #[test]
    #[serial]
    fn arithmetic_and_print() {
        let (result, output) = run_capturing("print 1 + 2 * 3;");
        assert!(result.is_ok());
        assert_eq!("7\n", output);
    }

    #[test]
    #[serial]
    fn variable_assignment() {
        assert!(run("var a = 2; var b = 3; a = a + b; print a;").is_ok());
    }

    #[test]
    #[serial]
    fn for_loop_runs() {
        assert!(run("var total = 0; for (var i = 0; i < 5; i = i + 1) { total = total + i; } print total;").is_ok());
    }

    #[test]
    #[serial]
    fn and_short_circuits() {
        assert!(run("print false and (1/0 == 0);").is_ok());
    }

    #[test]
    #[serial]
    fn or_short_circuits() {
        assert!(run("print true or (1/0 == 0);").is_ok());
    }

    #[test]
    #[serial]
    fn function_call() {
        assert!(run("fun add(a, b) { print a + b; } add(2, 3);").is_ok());
    }

    #[test]
    #[serial]
    fn string_concatenation() {
        assert!(run(r#"print "foo" + "bar";"#).is_ok());
    }

    #[test]
    #[serial]
    fn adding_number_and_string_is_a_runtime_error() {
        let result = run(r#"1 + "x";"#);
        assert!(matches!(result, Err(InterpretationError::RuntimeError { .. })));
    }

    #[test]
    #[serial]
    fn calling_a_non_function_is_a_runtime_error() {
        let result = run("var a = 1; a();");
        assert!(matches!(result, Err(InterpretationError::RuntimeError { .. })));
    }

    #[test]
    #[serial]
    fn implicit_nil_return_does_not_crash() {
        assert!(run("fun noop() {} noop(); print 1;").is_ok());
    }
}
