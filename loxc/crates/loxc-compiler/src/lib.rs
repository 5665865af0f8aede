//! The single-pass lexer-driven Pratt compiler (spec.md §4.2): turns Lox
//! source directly into a [`loxc_gc::LoxFunction`] with no intermediate AST.

mod compiler;
mod rules;

pub use compiler::compile;
