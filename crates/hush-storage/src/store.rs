//! The storage collaborator contract

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use hush_core::{FinalizedTransfer, TransferEnvelope};
use uuid::Uuid;

use crate::error::StoreResult;

/// Ciphertext parts in index order
pub type PartStream = BoxStream<'static, StoreResult<Bytes>>;

/// Handle of one in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadId {
    pub transfer_id: Uuid,
    pub session: Uuid,
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.transfer_id, self.session)
    }
}

/// Store/fetch ciphertext by transfer id.
///
/// Implementations must keep a transfer invisible to `fetch_*` until
/// `finalize_upload` succeeds, reject a second `finalize_upload` with
/// `AlreadyFinalized`, and leave nothing fetchable after `abort_upload`.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Open a session for a signed envelope.
    async fn begin_upload(&self, envelope: &TransferEnvelope) -> StoreResult<UploadId>;

    /// Store one part. Parts may arrive out of order and concurrently;
    /// exactly one part is flagged `last`.
    async fn upload_part(
        &self,
        upload: &UploadId,
        index: u64,
        bytes: Bytes,
        last: bool,
    ) -> StoreResult<()>;

    async fn finalize_upload(&self, upload: &UploadId) -> StoreResult<FinalizedTransfer>;

    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()>;

    /// The signed envelope of a finalized, unexpired transfer.
    async fn fetch_preview(&self, transfer_id: Uuid) -> StoreResult<TransferEnvelope>;

    async fn fetch_parts(&self, transfer_id: Uuid) -> StoreResult<PartStream>;

    async fn delete(&self, transfer_id: Uuid) -> StoreResult<()>;
}
