//! Crate-wide error taxonomy.
//!
//! One `thiserror` enum covers every fallible boundary in the matching core;
//! `anyhow` is used only at the process edge (`main.rs`, `src/bin/verify.rs`)
//! where errors are displayed, never matched on.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("parse error at position {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("field {field} is invalid: {message}")]
    InvalidField { field: String, message: String },

    #[error("field {field} is missing")]
    MissingField { field: String },

    #[error("rule evaluation failed: {0}")]
    RuleEvaluation(String),

    #[error("router has no usable dynamic backend")]
    RouterNotDynamic,

    #[error("router's dynamic backend is not connected")]
    RouterNotConnected,

    #[error("remote I/O error: {0}")]
    RemoteIo(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
