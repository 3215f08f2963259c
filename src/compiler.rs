//! The single-pass parser and bytecode compiler.
//!
//! There is no intermediate AST: every production in the grammar emits
//! bytecode directly into the function currently being compiled, and
//! variable names are resolved to stack slots as they're parsed (see
//! [Compiler::resolve_local]). There is no global-variable path at all —
//! every variable, including ones declared at the top level of a script,
//! is a local of some [FunctionCompiler] (the outermost one is the
//! synthetic `__main__` function the VM starts executing).
use std::rc::Rc;

use crate::gc::ActiveGC;
use crate::prelude::*;
use crate::value::Function;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given source code and, if successful, returns the finished
/// top-level [Function] (`__main__`). An [ActiveGC] is required because
/// string literals are allocated and owned by the GC.
pub fn compile(source: &str, gc: &'_ ActiveGC) -> crate::Result<Function> {
    let parser = Parser::new(source, gc);
    let compiler = Compiler::new(parser);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

const U8_COUNT: usize = u8::MAX as usize + 1;

/// Compiler state for one function currently being compiled: its own
/// in-progress [Function], its own locals table, and its own scope depth.
/// Chained through `enclosing` the way the teacher's `Compiler` chains to an
/// outer one, except ownership moves through the chain (via [Box]) instead
/// of a C-style linked list of raw pointers.
struct FunctionCompiler<'a> {
    function: Function,
    locals: Vec<Local<'a>>,
    scope_depth: isize,
    enclosing: Option<Box<FunctionCompiler<'a>>>,
}

impl<'a> FunctionCompiler<'a> {
    fn new(name: impl Into<String>, enclosing: Option<Box<FunctionCompiler<'a>>>) -> Self {
        FunctionCompiler {
            function: Function::new(name),
            locals: Vec::with_capacity(U8_COUNT),
            scope_depth: 0,
            enclosing,
        }
    }
}

/// Contains the compiler state: the [Parser] and the chain of
/// [FunctionCompiler]s (one per function currently being compiled, innermost
/// first).
struct Compiler<'a> {
    parser: Parser<'a>,
    current: Box<FunctionCompiler<'a>>,
}

#[derive(Clone, Copy)]
struct Local<'a> {
    name: Lexeme<'a>,
    depth: Option<isize>,
}

/// Contains the parser state. For some strange reason, this also includes
/// error status.
///
/// The reference to [ActiveGC] is required, but never accessed, because
/// having a reference to it guarantees that the static (global) garbage
/// collector is installed. We need this so that string literals can be
/// owned by the GC for the running program.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    /// The first error encountered, rendered and ready to hand back as an
    /// [InterpretationError] — unlike the teacher, which prints errors to
    /// stderr the moment they're found, this repo's driver owns rendering
    /// (it needs to substitute the source file path), so the parser just
    /// remembers the first one.
    first_error: Option<(String, usize)>,
    // We keep a reference to the active GC to make sure it exists, but we don't explicitly use it.
    _active_gc: &'a ActiveGC,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Precedence rules for [Token]s in this language.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for use
/// in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-`
    Unary,
    /// `()`
    Call,
    /// Literals, and groupings
    Primary,
}

///////////////////////////////////////// Implementations /////////////////////////////////////////

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher-level of precedence than the maximum,
    /// [Precedence::Primary], which is the precedence of literals and l-values.
    #[inline]
    fn higher_precedence(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    /// See [Precedence::higher_precedence()].
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code.
    /// Note that parsing string literals requires an active GC.
    fn new(source: &'a str, active_gc: &'a ActiveGC) -> Parser<'a> {
        let mut scanner = Scanner::new(source);
        let first_token = scanner.scan_token();
        let placeholder = Lexeme::placeholder("<before first token>");

        Parser {
            scanner,
            previous: placeholder,
            current: first_token,
            had_error: false,
            panic_mode: false,
            first_error: None,
            _active_gc: active_gc,
        }
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current;

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error message is printed.
    fn consume(&mut self, desired_token: Token, message: &'static str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Scan the next token. Advances if the token matches `desired_token`. Returns whether
    /// `desired_token` was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        if self.first_error.is_none() {
            let context = if lexeme.token() == Token::Eof {
                " at end".to_owned()
            } else if lexeme.token() == Token::Error {
                String::new()
            } else {
                format!(" at '{}'", lexeme.text())
            };
            self.first_error = Some((format!("{message}{context}"), lexeme.line()));
        }
    }

    /// Synchronize after being in panic mode.
    ///
    /// The heuristic is that we're going to gobble up and discard tokens until we **think** we're
    /// a point that makes sense in the grammar. Points that make sense in a grammar are the start
    /// of statements (statement boundaries). We could be wrong!
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            match self.current.token() {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => (), // continue panicing
            }

            self.advance();
        }
    }
}

impl<'a> Compiler<'a> {
    /// Creates a new compiler with the given [Parser], ready to build the
    /// synthetic top-level `__main__` function.
    fn new(parser: Parser<'a>) -> Compiler<'a> {
        Compiler {
            parser,
            current: Box::new(FunctionCompiler::new("__main__", None)),
        }
    }

    /// Takes ownership of the compiler, and returns the finished top-level function.
    fn compile(mut self) -> crate::Result<Function> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }

        if cfg!(feature = "trace") && !self.parser.had_error {
            crate::debug::disassemble_chunk(&self.current.function.chunk, &self.current.function.name);
        }

        if self.parser.had_error {
            let (message, line) = self
                .parser
                .first_error
                .unwrap_or_else(|| ("compilation failed".to_owned(), 0));
            return Err(InterpretationError::CompileError { message, line });
        }

        Ok(self.current.function)
    }

    /// Swaps in a brand new [FunctionCompiler] for `name`, remembering the
    /// current one as its `enclosing` compiler.
    fn begin_function(&mut self, name: &str) {
        let new_compiler = Box::new(FunctionCompiler::new(name, None));
        let outer = std::mem::replace(&mut self.current, new_compiler);
        self.current.enclosing = Some(outer);
    }

    /// Finishes the innermost [FunctionCompiler], restoring its enclosing
    /// one as current, and returns the finished [Function].
    ///
    /// # Panics
    ///
    /// Panics if called without a matching [Compiler::begin_function] — an
    /// internal compiler invariant, never reachable from source code.
    fn end_function(&mut self) -> Function {
        let enclosing = self
            .current
            .enclosing
            .take()
            .expect("end_function called without a matching begin_function");
        let finished = std::mem::replace(&mut self.current, enclosing);

        if cfg!(feature = "trace") {
            crate::debug::disassemble_chunk(&finished.function.chunk, &finished.function.name);
        }

        finished.function
    }

    /// Create a new block scope. Make sure to decrement it later.
    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    /// Pop one scope from the block.
    fn end_scope(&mut self) {
        assert!(self.current.scope_depth > 0);
        self.current.scope_depth -= 1;

        // Clean up all local variables: the compile-time vector of locals
        // parallels the runtime stack, so popping one pops the other.
        while self.has_locals_beyond_current_scope() {
            self.current.locals.pop();
            self.emit_opcode(OpCode::Pop);
        }
    }

    /// Returns true if there is a local variable at a scope that is no longer accessible.
    fn has_locals_beyond_current_scope(&self) -> bool {
        self.current
            .locals
            .last()
            .and_then(|local| local.depth)
            .map(|depth| depth > self.current.scope_depth)
            .unwrap_or(false)
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;

        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser
                .error("Could not figure out how to understand symbol in this context");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    /// Finds the stack slot for a local, or `None` if there's no local by
    /// that name (an undefined-variable error, since there is no global
    /// fallback in this language).
    fn resolve_local(&mut self, name: Lexeme) -> Option<u8> {
        for (i, local) in self.current.locals.iter().enumerate().rev() {
            if local.text() == name.text() {
                if local.is_uninitialized() {
                    let message = format!("Cannot use `{}` in its own initializer", name.text());
                    self.parser.error(&message);
                }
                return u8::try_from(i).ok();
            }
        }
        None
    }

    /// Reserve a slot for a new local variable, rejecting a redeclaration in
    /// the same scope. Unlike the teacher, this runs unconditionally — every
    /// variable, including those at the top level of a script, is a local of
    /// the current function; there is no separate global path.
    ///
    /// Returns whether a [Local] was actually pushed — `false` once the
    /// 256-local cap is hit, in which case callers must not go on to call
    /// [Compiler::mark_initialized]/[Compiler::define_variable] for this
    /// variable, since there's no new local for them to initialize.
    fn declare_variable(&mut self) -> bool {
        let name = self.parser.previous;

        for local in self.current.locals.iter().rev() {
            if local.in_outer_scope(self.current.scope_depth) {
                // It's okay to shadow a variable from an outer scope.
                break;
            }

            if name.text() == local.text() {
                let message = format!("Already a variable called `{}` in this scope", name.text());
                self.parser.error(&message);
            }
        }

        self.add_local(name)
    }

    /// Pushes a new [Local], unless the current function already has 256 of
    /// them (the most a one-byte `OP_GET_LOCAL`/`OP_SET_LOCAL` operand can
    /// address). Returns whether it was pushed.
    fn add_local(&mut self, name: Lexeme<'a>) -> bool {
        if self.current.locals.len() >= U8_COUNT {
            self.parser
                .error("Internal limit reached: too many variables declared");
            return false;
        }

        assert_eq!(Token::Identifier, name.token());
        self.current.locals.push(Local { name, depth: None });
        true
    }

    /// Consume the next identifier and declare it as a local. Returns
    /// whether it was actually declared (see [Compiler::declare_variable]).
    fn parse_variable(&mut self, error_message: &'static str) -> bool {
        self.parser.consume(Token::Identifier, error_message);
        self.declare_variable()
    }

    /// Mark the last local as being initialized (available for use).
    ///
    /// # Panics
    ///
    /// Panics if no local was ever pushed (an internal compiler invariant —
    /// callers must only reach this after a successful
    /// [Compiler::declare_variable]/[Compiler::add_local]).
    fn mark_initialized(&mut self) {
        let depth = self.current.scope_depth;
        self.current
            .locals
            .last_mut()
            .expect("mark_initialized called with no local declared")
            .initialize_scope_with(depth);
    }

    /// Finish defining the most recently declared local: its initializer
    /// value is already on the stack, so all that's left is making it
    /// readable. A no-op if `declared` is `false` — the 256-local cap was
    /// already hit and reported, so there's no local left to initialize.
    fn define_variable(&mut self, declared: bool) {
        if declared {
            self.mark_initialized();
        }
    }

    /// Parse a variable. This could either be a variable access or an assignment, depending on
    /// `can_assign` and the syntactic context.
    fn named_variable(&mut self, name: Lexeme, can_assign: bool) {
        let arg = match self.resolve_local(name) {
            Some(arg) => arg,
            None => {
                let message = format!("Undefined variable `{}`", name.text());
                self.parser.error(&message);
                0
            }
        };

        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            self.emit_opcode_with_operand(OpCode::SetLocal, arg);
        } else {
            self.emit_opcode_with_operand(OpCode::GetLocal, arg);
        }
    }

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.check_unsupported_keyword() {
            self.reject_unsupported_keyword();
        } else if self.match_and_advance(Token::Fun) {
            self.fun_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_statement();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// `class`, `return`, `super`, and `this` are tokenized but never given
    /// compiler handling; using one is accepted by the lexer but rejected
    /// here.
    fn check_unsupported_keyword(&self) -> bool {
        matches!(
            self.parser.current.token(),
            Token::Class | Token::Return | Token::Super | Token::This
        )
    }

    fn reject_unsupported_keyword(&mut self) {
        log::warn!(
            "line {}: unimplemented language feature `{}`",
            self.parser.current.line(),
            self.parser.current.text()
        );
        self.advance();
        self.parser.error("unimplemented language feature");
    }

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse a block. Assumes the opening `{` has already been consumed, and
    /// that a new scope has already been created for this block (or, for a
    /// function body, deliberately not — see [Compiler::function]).
    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "expected '}' to end block");
    }

    /// Parse a variable declaration. Assumes `var` has already been consumed.
    fn var_statement(&mut self) {
        let declared = self.parse_variable("need a variable name after var");

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            self.emit_constant(Value::Nil);
        }

        self.parser
            .consume(Token::Semicolon, "expect ; after this variable declaration");

        self.define_variable(declared);
    }

    /// Parse a function declaration. Assumes `fun` has already been consumed.
    fn fun_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "expect function name");
        let name = self.parser.previous;

        // The function's own name is a local of the *enclosing* scope. It's
        // marked initialized right away (its value is pushed as soon as the
        // body finishes compiling, below) — there is no closure support, so
        // the name isn't visible from inside the function's own body anyway.
        let declared = self.declare_variable();
        self.define_variable(declared);

        self.function(name.text());
    }

    /// Compile one function's parameter list and body, leaving the finished
    /// [Function] as a constant pushed onto the *enclosing* function's stack.
    fn function(&mut self, name: &str) {
        self.begin_function(name);

        self.parser
            .consume(Token::LeftParen, "expect '(' after function name");
        if !self.parser.check(Token::RightParen) {
            loop {
                if self.current.function.arity == u8::MAX {
                    self.parser.error("Can't have more than 255 parameters");
                } else {
                    self.current.function.arity += 1;
                }
                let declared = self.parse_variable("expect parameter name");
                self.define_variable(declared);

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "expect ')' after parameters");
        self.parser
            .consume(Token::LeftBrace, "expect '{' before function body");
        self.block();

        let function = self.end_function();
        self.emit_constant(Value::Function(Rc::new(function)));
    }

    /// Parse an `if` statement. Assumes `if` has already been consumed.
    fn if_statement(&mut self) {
        self.parser
            .consume(Token::LeftParen, "expect '(' after 'if'");
        self.expression();
        self.parser
            .consume(Token::RightParen, "expect ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);

        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// Parse a `while` statement. Assumes `while` has already been consumed.
    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.parser
            .consume(Token::LeftParen, "expect '(' after 'while'");
        self.expression();
        self.parser
            .consume(Token::RightParen, "expect ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
    }

    /// Parse a `for` statement. Assumes `for` has already been consumed.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser
            .consume(Token::LeftParen, "expect '(' after 'for'");

        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_statement();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "expect ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
        }

        if !self.parser.check(Token::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();

            self.expression();
            self.emit_opcode(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "expect ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.parser
                .consume(Token::RightParen, "expect ')' after for clauses");
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }

        self.end_scope();
    }

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        self.parser.consume(
            Token::Semicolon,
            "expected semicolon to end this statement",
        );
        // Expressions leave one value on the stack; a statement can't, so pop it.
        self.emit_opcode(OpCode::Pop);
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.parser.consume(
            Token::Semicolon,
            "expected semicolon to end print statement",
        );
        self.emit_opcode(OpCode::Print);
    }

    /// Appends a constant-load instruction for `value` to the current [Chunk].
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_opcode_with_operand(OpCode::Value, index);
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant index is greater than 255 (and thus can no longer be represented as a
    /// u8), this signals a compiler error and returns `0u8`. The current [Chunk] can still be
    /// appended to, however, it is invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().constants.write(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk");
            0
        }
    }

    /// Writes an [OpCode] (with no operand) to the current [Chunk]. Returns the offset it was
    /// written at.
    fn emit_opcode(&mut self, opcode: OpCode) -> usize {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Writes a raw operand byte, following whichever opcode was just emitted.
    fn emit_byte(&mut self, byte: u8) {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_byte(byte, line);
    }

    /// Writes an [OpCode] followed by its one-byte operand.
    fn emit_opcode_with_operand(&mut self, opcode: OpCode, operand: u8) {
        self.emit_opcode(opcode);
        self.emit_byte(operand);
    }

    /// Writes a jump opcode plus a placeholder operand. Returns the
    /// placeholder's offset, to be passed later to [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line);
        self.current_chunk().write_jump_placeholder(line)
    }

    /// Back-patches a jump emitted by [Compiler::emit_jump] to land here.
    fn patch_jump(&mut self, offset: usize) {
        if self.current_chunk().patch_jump(offset).is_none() {
            self.parser.error("Jump distance too large to encode");
        }
    }

    /// Emits a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line_number_of_prefix();
        if self.current_chunk().emit_loop(loop_start, line).is_none() {
            self.parser.error("Loop body too large to encode");
        }
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current.function.chunk
    }

    /// Advance one token in scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule for the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule for the current token (used to decide whether to keep parsing infix).
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

impl<'a> Local<'a> {
    /// Returns true if the variable is not available for use yet.
    ///
    /// Use [Local::initialize_scope_with()] to initialize.
    #[inline(always)]
    fn is_uninitialized(&self) -> bool {
        self.depth.is_none()
    }

    /// Set the scope of this local. Note: the variable must not have an existing scope.
    #[inline]
    fn initialize_scope_with(&mut self, scope_depth: isize) {
        debug_assert!(self.is_uninitialized());
        self.depth = Some(scope_depth);
    }

    /// Returns true when the local is in an outer scope (thus, is accessible).
    #[inline(always)]
    fn in_outer_scope(&self, scope_depth: isize) -> bool {
        matches!(self.depth, Some(depth) if depth < scope_depth)
    }

    /// Return the name of this local.
    fn text(&self) -> &'a str {
        self.name.text()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn get_rule(token: Token) -> ParserRule {
    use Token::*;
    match token {
        //                     Prefix          Infix         Precedence
        LeftParen    => rule!{ Some(grouping), Some(call),   Precedence::Call },
        RightParen   => rule!{ None,           None,         Precedence::None },
        LeftBrace    => rule!{ None,           None,         Precedence::None },
        RightBrace   => rule!{ None,           None,         Precedence::None },
        Comma        => rule!{ None,           None,         Precedence::None },
        Dot          => rule!{ None,           None,         Precedence::None },
        Minus        => rule!{ Some(unary),    Some(binary), Precedence::Term },
        Plus         => rule!{ None,           Some(binary), Precedence::Term },
        Semicolon    => rule!{ None,           None,         Precedence::None },
        Slash        => rule!{ None,           Some(binary), Precedence::Factor },
        Star         => rule!{ None,           Some(binary), Precedence::Factor },
        Bang         => rule!{ Some(unary),    None,         Precedence::None },
        BangEqual    => rule!{ None,           Some(binary), Precedence::Equality },
        Equal        => rule!{ None,           None,         Precedence::None },
        EqualEqual   => rule!{ None,           Some(binary), Precedence::Equality },
        Greater      => rule!{ None,           Some(binary), Precedence::Comparison },
        GreaterEqual => rule!{ None,           Some(binary), Precedence::Comparison },
        Less         => rule!{ None,           Some(binary), Precedence::Comparison },
        LessEqual    => rule!{ None,           Some(binary), Precedence::Comparison },
        Identifier   => rule!{ Some(variable), None,         Precedence::None },
        StrLiteral   => rule!{ Some(string),   None,         Precedence::None },
        Number       => rule!{ Some(number),   None,         Precedence::None },
        And          => rule!{ None,           Some(and_),   Precedence::And },
        Class        => rule!{ None,           None,         Precedence::None },
        Else         => rule!{ None,           None,         Precedence::None },
        False        => rule!{ Some(literal),  None,         Precedence::None },
        For          => rule!{ None,           None,         Precedence::None },
        Fun          => rule!{ None,           None,         Precedence::None },
        If           => rule!{ None,           None,         Precedence::None },
        Nil          => rule!{ Some(literal),  None,         Precedence::None },
        Or           => rule!{ None,           Some(or_),    Precedence::Or },
        Print        => rule!{ None,           None,         Precedence::None },
        Return       => rule!{ None,           None,         Precedence::None },
        Super        => rule!{ None,           None,         Precedence::None },
        This         => rule!{ None,           None,         Precedence::None },
        True         => rule!{ Some(literal),  None,         Precedence::None },
        Var          => rule!{ None,           None,         Precedence::None },
        While        => rule!{ None,           None,         Precedence::None },
        Error        => rule!{ None,           None,         Precedence::None },
        Eof          => rule!{ None,           None,         Precedence::None },
    }
}

/// Parse '(' as a prefix. Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after grouping.");
}

/// Parse '(' as an infix, i.e., a function call. Assumes '(' has been consumed and the callee is
/// already on the stack.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = argument_list(compiler);
    compiler.emit_opcode_with_operand(OpCode::Call, arg_count);
}

/// Parse a comma-separated argument list, up to the closing ')'. Assumes the opening '(' has been
/// consumed.
fn argument_list(compiler: &mut Compiler) -> u8 {
    let mut count: u8 = 0;
    if !compiler.parser.check(Token::RightParen) {
        loop {
            compiler.expression();
            if count == u8::MAX {
                compiler.parser.error("Can't have more than 255 arguments");
            } else {
                count += 1;
            }
            if !compiler.match_and_advance(Token::Comma) {
                break;
            }
        }
    }
    compiler
        .parser
        .consume(Token::RightParen, "expect ')' after arguments");
    count
}

/// Parse a number literal as a prefix. Assumes number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Internal error: Token::Number MUST parse as a float, but didn't?");
    compiler.emit_constant(value.into());
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_opcode(OpCode::Not),
        Token::Minus => compiler.emit_opcode(OpCode::Negate),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    compiler.parse_precedence(rule.higher_precedence());
    let opcode = match operator {
        Token::BangEqual => OpCode::BangEqual,
        Token::EqualEqual => OpCode::EqualEqual,
        Token::Greater => OpCode::Greater,
        Token::GreaterEqual => OpCode::GreaterEqual,
        Token::Less => OpCode::Less,
        Token::LessEqual => OpCode::LessEqual,
        Token::Plus => OpCode::Add,
        Token::Minus => OpCode::Subtract,
        Token::Star => OpCode::Multiply,
        Token::Slash => OpCode::Divide,
        _ => unreachable!(),
    };
    compiler.emit_opcode(opcode);
}

/// Parse `and`. Assumes the left operand is already compiled and on the stack.
///
/// `OP_JUMP_IF_FALSE` always pops, so the short-circuited value can't simply
/// be left on the stack the way Crafting Interpreters does it — this emits
/// an explicit canonical `false`/`true` on whichever path doesn't evaluate
/// the right operand, preserving "exactly one value pushed" either way. See
/// DESIGN.md for why this differs from a textbook Pratt `and_`.
fn and_(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.parse_precedence(get_rule(Token::And).higher_precedence());
    let skip_false = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(end_jump);
    compiler.emit_constant(Value::Boolean(false));

    compiler.patch_jump(skip_false);
}

/// Parse `or`. See [and_] for why this needs an explicit canonical push on
/// the short-circuit path.
fn or_(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_constant(Value::Boolean(true));
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.parse_precedence(get_rule(Token::Or).higher_precedence());

    compiler.patch_jump(end_jump);
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_constant(Value::Boolean(false)),
        Token::Nil => compiler.emit_constant(Value::Nil),
        Token::True => compiler.emit_constant(Value::Boolean(true)),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Its contents (quotes stripped) are interned in
/// the active GC, and the resulting `&'static str` is added to the constant
/// pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));

    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];
    let stored = ActiveGC::store_string(contents.to_owned());
    compiler.emit_constant(Value::String(stored));
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.parser.previous, can_assign);
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;

    #[test]
    fn precedence_confidence_check() {
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);

        assert!(Precedence::Call > Precedence::Factor);
        assert!(Precedence::Factor > Precedence::Term);

        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    #[serial]
    fn compiles_simple_arithmetic() {
        let gc = ActiveGC::install();
        let result = compile("print 1 + 2 * 3;", &gc);
        assert!(result.is_ok());
    }

    #[test]
    #[serial]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("{ var a = 1; var a = 2; }", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn redeclaring_a_top_level_variable_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("var a = 1; var a = 2;", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn shadowing_in_an_inner_scope_is_fine() {
        let gc = ActiveGC::install();
        let result = compile("var a = 1; { var a = 2; print a; }", &gc);
        assert!(result.is_ok());
    }

    #[test]
    #[serial]
    fn reflexive_initializer_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("var a = a;", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn undefined_variable_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("print undefined;", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn invalid_assignment_target_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("(1 + 2) = 3;", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn function_declaration_and_call_compiles() {
        let gc = ActiveGC::install();
        let result = compile("fun add(a, b) { print a + b; } add(2, 3);", &gc);
        assert!(result.is_ok());
    }

    #[test]
    #[serial]
    fn unimplemented_keyword_is_an_error() {
        let gc = ActiveGC::install();
        let result = compile("class Foo {}", &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }

    #[test]
    #[serial]
    fn for_loop_compiles() {
        let gc = ActiveGC::install();
        let source = "var n = 0; for (var i = 0; i < 3; i = i + 1) { n = n + i; } print n;";
        assert!(compile(source, &gc).is_ok());
    }

    #[test]
    #[serial]
    fn exceeding_the_local_variable_cap_is_an_error_not_a_panic() {
        let gc = ActiveGC::install();
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        let result = compile(&source, &gc);
        assert!(matches!(result, Err(InterpretationError::CompileError { .. })));
    }
}
