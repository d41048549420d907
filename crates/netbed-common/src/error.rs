//! Failure taxonomy for the harness.
//!
//! Configuration and lookup errors are fatal and propagate immediately.
//! Subprocess failures carry the command and its captured stderr so a
//! failed bring-up can be diagnosed from the log alone. Timeouts are a
//! distinct variant: a bounded wait that expired is not the same thing
//! as a command that ran and failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing topology entry, unresolvable reference.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An OS-level command exited non-zero where success was required.
    #[error("command `{command}` exited with status {status}: {stderr}")]
    SubprocessFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// A blocking wait exceeded its bound.
    #[error("timed out after {seconds}s waiting for {operation}")]
    SubprocessTimeout { operation: String, seconds: u64 },

    /// Lookup of a host/interface/fixture/capture handle by name failed.
    #[error("not found: {0}")]
    ObjectNotFound(String),

    /// Caller-supplied combination of arguments is invalid.
    #[error("argument mismatch: {0}")]
    ArgMismatch(String),

    /// An address string failed to parse.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
