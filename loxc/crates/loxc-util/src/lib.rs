//! loxc-util - shared error and diagnostic types
//!
//! Every other crate in this workspace reports failures through the two
//! taxonomies defined here: a [`CompileError`] for anything the compiler
//! rejects before a single opcode runs, and a [`RuntimeError`] for anything
//! the VM rejects while executing. Both carry only a line number and a
//! message; the formatting in [`render_compile_error`] / the `Display` impl
//! of `RuntimeError` is the single place that wording is owned, so the rest
//! of the workspace never re-derives the "[line L] Error ..." text.

use std::fmt;

use thiserror::Error;

/// A single compile-time diagnostic, as produced by the parser/emitter.
///
/// `lexeme` is `None` for the synthetic "at end of file" position and for
/// messages that are not anchored to a specific token (none currently are,
/// but the field exists so callers don't need a sentinel string).
#[derive(Debug, Clone, Error)]
#[error("{}", render_compile_error(line, lexeme.as_deref(), message))]
pub struct CompileError {
    pub line: u32,
    pub lexeme: Option<String>,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, lexeme: Option<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            lexeme,
            message: message.into(),
        }
    }
}

/// Renders a compile error exactly as spec.md §7 requires:
/// `[line L] Error at '<lexeme>': <message>` or ` at end` for EOF.
pub fn render_compile_error(line: u32, lexeme: Option<&str>, message: &str) -> String {
    match lexeme {
        None => format!("[line {line}] Error at end: {message}"),
        Some(lex) => format!("[line {line}] Error at '{lex}': {message}"),
    }
}

/// A runtime failure: type mismatch, undefined variable, uncallable callee,
/// arity mismatch, stack overflow, property access on a non-instance, etc.
/// Carries the frame-by-frame backtrace the VM assembled at the point of
/// failure (innermost frame first), per spec.md §4.4/§7.
#[derive(Debug, Clone, Error)]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Vec<BacktraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, backtrace: Vec<BacktraceFrame>) -> Self {
        Self {
            message: message.into(),
            backtrace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runtime Error: {}", self.message)?;
        for (i, frame) in self.backtrace.iter().enumerate() {
            let sep = if i + 1 == self.backtrace.len() { "" } else { "\n" };
            write!(f, "{frame}{sep}")?;
        }
        Ok(())
    }
}

/// One line of a runtime backtrace: `[line <L>] in <name>()` or
/// `[line <L>] in script`, innermost frame first.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub line: u32,
    /// `None` means the top-level script frame.
    pub function_name: Option<String>,
}

impl fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// The top-level outcome the driver matches on to choose a process exit
/// code (spec.md §6.3). `loxc-compiler`/`loxc-runtime` never construct this
/// directly; it is assembled by the embedding crate (`loxc-runtime::Vm`)
/// from the two error taxonomies above.
#[derive(Debug, Error)]
pub enum LoxError {
    #[error("{0}")]
    Compile(#[from] CompileErrors),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

/// A non-empty batch of compile errors accumulated during one compilation
/// (panic-mode recovery means more than one can surface per run).
#[derive(Debug, Clone, Error)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
