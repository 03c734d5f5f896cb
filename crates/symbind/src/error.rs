use thiserror::Error;

use crate::pattern::PatternError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("Invalid mapping '{name}': {message}")]
    InvalidMapping { name: String, message: String },

    #[error("Failed to read memory at address {address:#x} (size: {size})")]
    MemoryReadFailed { address: u64, size: usize },

    #[error("Not a {expected} instruction at {address:#x}")]
    NotAnInstruction {
        address: u64,
        expected: &'static str,
    },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("PE parse error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("Failed to change page protection at {address:#x}: {message}")]
    ProtectFailed { address: u64, message: String },

    #[error("Hook '{name}' failed: {message}")]
    HookFailed { name: String, message: String },

    #[error("Thread control failed: {0}")]
    ThreadControl(String),

    #[cfg(target_os = "windows")]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Decode mismatches are expected while scanning and never escalate on their own.
    pub fn is_decode_mismatch(&self) -> bool {
        matches!(
            self,
            Error::NotAnInstruction { .. } | Error::MemoryReadFailed { .. }
        )
    }

    pub(crate) fn hook(name: &str, message: impl Into<String>) -> Self {
        Error::HookFailed {
            name: name.to_string(),
            message: message.into(),
        }
    }
}
