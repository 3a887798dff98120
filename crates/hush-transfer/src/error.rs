use hush_core::HushError;
use hush_crypto::CryptoError;
use hush_storage::StoreError;
use thiserror::Error;

use crate::handler::HandlerState;

pub type TransferResult<T> = Result<T, TransferError>;

/// Why a multipart upload stopped. Whatever the variant, the store session
/// has been aborted and nothing was finalized.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("part {index} failed: {source}")]
    Part {
        index: u64,
        #[source]
        source: StoreError,
    },

    #[error("finalize failed: {0}")]
    Finalize(#[source] StoreError),

    #[error("reading ciphertext: {0}")]
    Source(String),

    #[error("invalid schedule: {0}")]
    InvalidParams(String),

    #[error("upload cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("user {0} already exists")]
    AlreadyExists(String),

    #[error("account backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("operation not valid in state {0:?}")]
    InvalidState(HandlerState),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upload failed, nothing was stored: {0}")]
    Upload(#[from] SchedulerError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Authentication failures: terminal, never retried, no detail shown.
    pub fn is_verification(&self) -> bool {
        matches!(self, TransferError::Crypto(e) if e.is_verification())
    }
}

impl From<TransferError> for HushError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Crypto(CryptoError::Verification) => HushError::Verification,
            TransferError::Crypto(e) => HushError::Validation(e.to_string()),
            TransferError::InvalidState(_) | TransferError::Validation(_) => {
                HushError::Validation(e.to_string())
            }
            TransferError::Store(e) => e.into(),
            TransferError::Upload(SchedulerError::Cancelled) | TransferError::Cancelled => {
                HushError::Cancelled
            }
            TransferError::Upload(e) => HushError::UploadFailed(e.to_string()),
            TransferError::Account(e) => HushError::Other(e.into()),
            TransferError::Io(e) => HushError::Io(e),
        }
    }
}
