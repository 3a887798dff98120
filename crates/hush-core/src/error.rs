use thiserror::Error;

pub type HushResult<T> = Result<T, HushError>;

/// Error categories surfaced to callers outside the core.
///
/// Verification failures carry no detail: the message a user sees for any
/// signature, MAC or recovery-proof mismatch is the same.
#[derive(Debug, Error)]
pub enum HushError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("cannot decrypt")]
    Verification,

    #[error("upload failed, nothing was stored: {0}")]
    UploadFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
