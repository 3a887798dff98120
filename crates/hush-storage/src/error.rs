use hush_core::HushError;
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[from] opendal::Error),

    #[error("transfer {0} not found")]
    NotFound(Uuid),

    #[error("transfer {0} has expired")]
    Expired(Uuid),

    #[error("transfer {0} already exists")]
    AlreadyExists(Uuid),

    #[error("unknown upload session {0}")]
    UnknownUpload(String),

    #[error("upload already finalized")]
    AlreadyFinalized,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("quota exceeded: {requested} bytes requested, limit {limit}")]
    QuotaExceeded { requested: u64, limit: u64 },

    #[error("part too large: {size} bytes, limit {limit}")]
    PartTooLarge { size: u64, limit: u64 },

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Policy rejections are returned to the caller as values, not retried.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            StoreError::QuotaExceeded { .. } | StoreError::PartTooLarge { .. } | StoreError::Expired(_)
        )
    }
}

impl From<StoreError> for HushError {
    fn from(e: StoreError) -> Self {
        if e.is_policy() {
            HushError::Policy(e.to_string())
        } else {
            HushError::Storage(e.to_string())
        }
    }
}
