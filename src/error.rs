//! Provides [InterpretationError], the error that most things return.
//!
//! Every variant carries its own `message`/`line`, rather than the file path:
//! the compiler and VM only ever know line numbers, and the source file path
//! is threaded in by the driver at the point the error is printed (see
//! [InterpretationError::render]), matching how the original C `CHECK` macro
//! captured `__FILE__`/`__LINE__` but left the message itself to the caller.
use thiserror::Error;

/// Any error that can occur during interpretation.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error: a syntax error, a name error, or an unsupported
    /// language feature (`class`/`return`/`super`/`this`).
    #[error("{message}")]
    CompileError { message: String, line: usize },
    /// A runtime error: a type error, stack overflow, or similar.
    #[error("{message}")]
    RuntimeError { message: String, line: usize },
    /// Failure to read the source file.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl InterpretationError {
    /// Renders this error in the `[File : <path>][Line : <n>] <message>`
    /// format, substituting `path` for whatever file was being interpreted
    /// (an `Io` error has no line, and is rendered as line 0).
    pub fn render(&self, path: &str) -> String {
        match self {
            InterpretationError::CompileError { message, line } => {
                format!("[File : {path}][Line : {line}] {message}")
            }
            InterpretationError::RuntimeError { message, line } => {
                format!("[File : {path}][Line : {line}] {message}")
            }
            InterpretationError::Io(e) => {
                format!("[File : {path}][Line : 0] {e}")
            }
        }
    }
}
