//! Crate-wide error type.
//!
//! Every variant corresponds to one of the error kinds enumerated for
//! exit-code and message policy: user-visible validation, config-file
//! parse/validation, subprocess failures, retrieval/IO, the "lock held
//! elsewhere" concurrency kind, and internal invariant violations.

use std::path::PathBuf;

pub type TransientResult<T> = Result<T, TransientError>;

#[derive(Debug, thiserror::Error)]
pub enum TransientError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{path}{}: {message}", line.map(|l| format!(":{l}")).unwrap_or_default())]
    Config {
        path: PathBuf,
        line: Option<usize>,
        message: String,
    },

    #[error("command `{command}` failed{}: {stderr}", status.map(|s| format!(" (exit {s})")).unwrap_or_default())]
    Subprocess {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Retrieval {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("VM state lock held elsewhere: {path}")]
    LockHeldElsewhere { path: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransientError {
    pub fn validation(message: impl Into<String>) -> Self {
        TransientError::Validation {
            message: message.into(),
        }
    }

    pub fn retrieval(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TransientError::Retrieval {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn subprocess(command: impl Into<String>, output: &std::process::Output) -> Self {
        TransientError::Subprocess {
            command: command.into(),
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Exit code a top-level caller should use for this error.
    ///
    /// "run" with an SSH console and "ssh" itself override this with the
    /// forwarded session's own exit code; every other path uses this value.
    pub fn exit_code(&self) -> i32 {
        match self {
            TransientError::Subprocess {
                status: Some(code), ..
            } => *code,
            _ => 1,
        }
    }
}
