//! Error handling for the `loxt` CLI.
//!
//! Distinct from [`loxc_util::LoxError`], which carries the compile/runtime
//! errors a Lox *script* can produce: this type is for failures in driving
//! the CLI itself (bad paths, I/O, REPL setup) that never reach the script
//! engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoxtError {
    #[error("could not read script '{path}': {source}")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("REPL error: {0}")]
    Repl(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, LoxtError>;
