//! [`TransferStore`] over an OpenDAL [`Operator`].
//!
//! Session bookkeeping (received parts, byte totals) lives in memory for the
//! lifetime of the store; only envelopes, parts and completion markers are
//! persisted. An upload interrupted by a restart cannot be resumed and is
//! never fetchable.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hush_core::config::HushConfig;
use hush_core::types::unix_now;
use hush_core::{FinalizedTransfer, TransferEnvelope};
use opendal::Operator;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{PartStream, TransferStore, UploadId};

const TRANSFERS_ROOT: &str = "transfers/";

/// Server-side policy applied to every upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_part_bytes: u64,
    /// Largest total ciphertext per transfer, `None` for unlimited
    pub quota_bytes: Option<u64>,
    pub max_lifetime_hours: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: 64 * 1024 * 1024,
            quota_bytes: Some(2048 * 1024 * 1024),
            max_lifetime_hours: 168,
        }
    }
}

impl StoreLimits {
    pub fn from_config(cfg: &HushConfig) -> Self {
        Self {
            max_part_bytes: cfg.transfer.upload_buffer_bytes(),
            quota_bytes: cfg.storage.quota_bytes(),
            max_lifetime_hours: cfg.transfer.max_lifetime_hours,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Finalizing,
}

#[derive(Debug)]
struct Session {
    id: Uuid,
    envelope: TransferEnvelope,
    /// index → size of every part accepted (or being written)
    parts: BTreeMap<u64, u64>,
    last_index: Option<u64>,
    received: u64,
    state: SessionState,
}

fn transfer_prefix(id: Uuid) -> String {
    format!("{TRANSFERS_ROOT}{id}/")
}

fn envelope_path(id: Uuid) -> String {
    format!("{TRANSFERS_ROOT}{id}/envelope.json")
}

fn complete_path(id: Uuid) -> String {
    format!("{TRANSFERS_ROOT}{id}/complete.json")
}

fn part_path(id: Uuid, index: u64) -> String {
    format!("{TRANSFERS_ROOT}{id}/parts/{index:08}")
}

pub struct OpendalStore {
    op: Operator,
    limits: StoreLimits,
    sessions: Mutex<HashMap<Uuid, Session>>,
    clock: fn() -> u64,
}

impl OpendalStore {
    pub fn new(op: Operator, limits: StoreLimits) -> Self {
        Self {
            op,
            limits,
            sessions: Mutex::new(HashMap::new()),
            clock: unix_now,
        }
    }

    /// Replace the wall clock (Unix seconds) used for expiry.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &str, id: Uuid) -> StoreResult<T> {
        match self.op.read(path).await {
            Ok(buf) => Ok(serde_json::from_slice(&buf.to_bytes())?),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Completion marker of a fetchable transfer.
    async fn load_finalized(&self, id: Uuid) -> StoreResult<FinalizedTransfer> {
        let finalized: FinalizedTransfer = self.read_json(&complete_path(id), id).await?;
        if finalized.expires_at <= (self.clock)() {
            debug!(transfer_id = %id, expires_at = finalized.expires_at, "transfer expired");
            return Err(StoreError::Expired(id));
        }
        Ok(finalized)
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<()> {
        let entries = match self.op.list_with(prefix).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            if entry.metadata().is_file() {
                self.op.delete(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Why a session lookup failed: a finalized transfer or an unknown id.
    async fn missing_session(&self, upload: &UploadId) -> StoreError {
        match self.op.exists(&complete_path(upload.transfer_id)).await {
            Ok(true) => StoreError::AlreadyFinalized,
            Ok(false) => StoreError::UnknownUpload(upload.to_string()),
            Err(e) => e.into(),
        }
    }

    /// Delete every finalized transfer whose expiry has passed. Returns the
    /// number removed.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let entries = match self.op.list(TRANSFERS_ROOT).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = (self.clock)();
        let mut purged = 0;
        for entry in entries {
            let Ok(id) = Uuid::parse_str(entry.name().trim_end_matches('/')) else {
                continue;
            };
            let finalized: FinalizedTransfer = match self.read_json(&complete_path(id), id).await {
                Ok(f) => f,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if finalized.expires_at <= now {
                self.remove_prefix(&transfer_prefix(id)).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "purged expired transfers");
        }
        Ok(purged)
    }
}

#[async_trait]
impl TransferStore for OpendalStore {
    async fn begin_upload(&self, envelope: &TransferEnvelope) -> StoreResult<UploadId> {
        if !envelope.is_signed() {
            return Err(StoreError::InvalidEnvelope("envelope is not signed".into()));
        }
        if envelope.expiration_hours == 0
            || envelope.expiration_hours > self.limits.max_lifetime_hours
        {
            return Err(StoreError::InvalidEnvelope(format!(
                "expiration_hours must be in 1..={}, got {}",
                self.limits.max_lifetime_hours, envelope.expiration_hours
            )));
        }
        if let Some(limit) = self.limits.quota_bytes {
            if envelope.ciphertext_size > limit {
                return Err(StoreError::QuotaExceeded {
                    requested: envelope.ciphertext_size,
                    limit,
                });
            }
        }

        let id = envelope.id;
        if self.op.exists(&envelope_path(id)).await? {
            return Err(StoreError::AlreadyExists(id));
        }

        let upload = UploadId {
            transfer_id: id,
            session: Uuid::new_v4(),
        };
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            sessions.insert(
                id,
                Session {
                    id: upload.session,
                    envelope: envelope.clone(),
                    parts: BTreeMap::new(),
                    last_index: None,
                    received: 0,
                    state: SessionState::Open,
                },
            );
        }

        let written = match serde_json::to_vec(envelope) {
            Ok(body) => self.op.write(&envelope_path(id), body).await.map_err(StoreError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            self.sessions.lock().await.remove(&id);
            return Err(e);
        }

        info!(
            transfer_id = %id,
            ciphertext_size = envelope.ciphertext_size,
            chunks = envelope.chunk_count,
            "upload session opened"
        );
        Ok(upload)
    }

    async fn upload_part(
        &self,
        upload: &UploadId,
        index: u64,
        bytes: Bytes,
        last: bool,
    ) -> StoreResult<()> {
        let size = bytes.len() as u64;
        if size > self.limits.max_part_bytes {
            return Err(StoreError::PartTooLarge {
                size,
                limit: self.limits.max_part_bytes,
            });
        }

        let reserved = {
            let mut sessions = self.sessions.lock().await;
            match sessions
                .get_mut(&upload.transfer_id)
                .filter(|s| s.id == upload.session)
            {
                None => None,
                Some(session) => {
                    if session.state != SessionState::Open {
                        return Err(StoreError::AlreadyFinalized);
                    }
                    if session.parts.contains_key(&index) {
                        return Err(StoreError::InvalidUpload(format!("duplicate part {index}")));
                    }
                    if last && session.last_index.is_some() {
                        return Err(StoreError::InvalidUpload(
                            "more than one part flagged last".into(),
                        ));
                    }
                    let received = session.received + size;
                    if let Some(limit) = self.limits.quota_bytes {
                        if received > limit {
                            return Err(StoreError::QuotaExceeded {
                                requested: received,
                                limit,
                            });
                        }
                    }
                    if received > session.envelope.ciphertext_size {
                        return Err(StoreError::InvalidUpload(format!(
                            "received {received} bytes, envelope declares {}",
                            session.envelope.ciphertext_size
                        )));
                    }

                    session.parts.insert(index, size);
                    session.received = received;
                    if last {
                        session.last_index = Some(index);
                    }
                    Some(())
                }
            }
        };
        if reserved.is_none() {
            return Err(self.missing_session(upload).await);
        }

        if let Err(e) = self.op.write(&part_path(upload.transfer_id, index), bytes).await {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions
                .get_mut(&upload.transfer_id)
                .filter(|s| s.id == upload.session)
            {
                session.parts.remove(&index);
                session.received -= size;
                if session.last_index == Some(index) {
                    session.last_index = None;
                }
            }
            return Err(e.into());
        }

        debug!(transfer_id = %upload.transfer_id, index, size, last, "part stored");
        Ok(())
    }

    async fn finalize_upload(&self, upload: &UploadId) -> StoreResult<FinalizedTransfer> {
        let checked = {
            let mut sessions = self.sessions.lock().await;
            match sessions
                .get_mut(&upload.transfer_id)
                .filter(|s| s.id == upload.session)
            {
                None => None,
                Some(session) => {
                    if session.state != SessionState::Open {
                        return Err(StoreError::AlreadyFinalized);
                    }
                    let Some(last_index) = session.last_index else {
                        return Err(StoreError::InvalidUpload("no part flagged last".into()));
                    };
                    let count = last_index + 1;
                    let contiguous = session.parts.len() as u64 == count
                        && session.parts.keys().next_back() == Some(&last_index);
                    if !contiguous {
                        return Err(StoreError::InvalidUpload(format!(
                            "expected parts 0..={last_index}, have {}",
                            session.parts.len()
                        )));
                    }
                    if session.received != session.envelope.ciphertext_size {
                        return Err(StoreError::InvalidUpload(format!(
                            "received {} bytes, envelope declares {}",
                            session.received, session.envelope.ciphertext_size
                        )));
                    }
                    session.state = SessionState::Finalizing;
                    Some((session.envelope.clone(), count))
                }
            }
        };
        let Some((envelope, parts)) = checked else {
            return Err(self.missing_session(upload).await);
        };

        let finalized = FinalizedTransfer {
            transfer_id: envelope.id,
            expires_at: (self.clock)() + u64::from(envelope.expiration_hours) * 3600,
            ciphertext_size: envelope.ciphertext_size,
            parts,
        };

        let written = match serde_json::to_vec(&finalized) {
            Ok(body) => self
                .op
                .write(&complete_path(envelope.id), body)
                .await
                .map_err(StoreError::from),
            Err(e) => Err(e.into()),
        };

        let mut sessions = self.sessions.lock().await;
        if let Err(e) = written {
            if let Some(session) = sessions.get_mut(&envelope.id) {
                session.state = SessionState::Open;
            }
            return Err(e);
        }
        sessions.remove(&envelope.id);

        info!(
            transfer_id = %envelope.id,
            parts,
            expires_at = finalized.expires_at,
            "upload finalized"
        );
        Ok(finalized)
    }

    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()> {
        {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&upload.transfer_id) {
                Some(session) if session.id != upload.session => {
                    return Err(StoreError::UnknownUpload(upload.to_string()));
                }
                Some(session) if session.state == SessionState::Finalizing => {
                    return Err(StoreError::AlreadyFinalized);
                }
                Some(_) => {
                    sessions.remove(&upload.transfer_id);
                }
                None => {
                    if self.op.exists(&complete_path(upload.transfer_id)).await? {
                        return Err(StoreError::AlreadyFinalized);
                    }
                }
            }
        }

        self.remove_prefix(&transfer_prefix(upload.transfer_id)).await?;
        warn!(transfer_id = %upload.transfer_id, "upload aborted, stored parts removed");
        Ok(())
    }

    async fn fetch_preview(&self, transfer_id: Uuid) -> StoreResult<TransferEnvelope> {
        self.load_finalized(transfer_id).await?;
        self.read_json(&envelope_path(transfer_id), transfer_id).await
    }

    async fn fetch_parts(&self, transfer_id: Uuid) -> StoreResult<PartStream> {
        let finalized = self.load_finalized(transfer_id).await?;
        let op = self.op.clone();
        let paths: Vec<String> = (0..finalized.parts)
            .map(|index| part_path(transfer_id, index))
            .collect();

        let parts = futures::stream::iter(paths)
            .then(move |path| {
                let op = op.clone();
                async move {
                    let buf = op.read(&path).await?;
                    Ok::<_, StoreError>(buf.to_bytes())
                }
            })
            .boxed();
        Ok(parts)
    }

    async fn delete(&self, transfer_id: Uuid) -> StoreResult<()> {
        self.sessions.lock().await.remove(&transfer_id);
        self.remove_prefix(&transfer_prefix(transfer_id)).await?;
        info!(transfer_id = %transfer_id, "transfer deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use futures::TryStreamExt;
    use hush_core::types::{ENVELOPE_NONCE_SIZE, ENVELOPE_VERSION};
    use hush_core::{ItemType, UserType};

    use super::*;
    use crate::operator::memory_operator;

    fn envelope(ciphertext_size: u64) -> TransferEnvelope {
        TransferEnvelope {
            version: ENVELOPE_VERSION,
            id: Uuid::new_v4(),
            item_type: ItemType::File,
            user_type: UserType::Anonymous,
            sender_public_key: [1u8; 32],
            sender_verifying_key: [2u8; 32],
            nonce: [3u8; ENVELOPE_NONCE_SIZE],
            signature: Some([4u8; 64]),
            expiration_hours: 24,
            compressed: false,
            chunk_size: 36,
            chunk_count: 1,
            ciphertext_size,
            ciphertext_digest: [5u8; 32],
        }
    }

    fn store() -> OpendalStore {
        OpendalStore::new(memory_operator().unwrap(), StoreLimits::default())
    }

    async fn upload_all(store: &OpendalStore, env: &TransferEnvelope, parts: &[&[u8]]) -> UploadId {
        let upload = store.begin_upload(env).await.unwrap();
        // deliberately out of order
        for (i, part) in parts.iter().enumerate().rev() {
            store
                .upload_part(&upload, i as u64, Bytes::copy_from_slice(part), i + 1 == parts.len())
                .await
                .unwrap();
        }
        upload
    }

    #[tokio::test]
    async fn test_upload_finalize_fetch() {
        let store = store();
        let env = envelope(9);
        let upload = upload_all(&store, &env, &[b"abc", b"def", b"ghi"]).await;

        let finalized = store.finalize_upload(&upload).await.unwrap();
        assert_eq!(finalized.transfer_id, env.id);
        assert_eq!(finalized.parts, 3);

        assert_eq!(store.fetch_preview(env.id).await.unwrap(), env);
        let parts: Vec<Bytes> = store
            .fetch_parts(env.id)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(parts.concat(), b"abcdefghi");
    }

    #[tokio::test]
    async fn test_expiry_is_lifetime_ahead() {
        let store = store();
        let env = envelope(3);
        let upload = upload_all(&store, &env, &[b"abc"]).await;

        let before = unix_now();
        let finalized = store.finalize_upload(&upload).await.unwrap();
        assert!(finalized.expires_at >= before + 24 * 3600);
        assert!(finalized.expires_at <= unix_now() + 24 * 3600);
    }

    #[tokio::test]
    async fn test_not_fetchable_before_finalize() {
        let store = store();
        let env = envelope(3);
        upload_all(&store, &env, &[b"abc"]).await;

        assert!(matches!(
            store.fetch_preview(env.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.fetch_parts(env.id).await.is_err());
    }

    #[tokio::test]
    async fn test_double_finalize_rejected() {
        let store = store();
        let env = envelope(3);
        let upload = upload_all(&store, &env, &[b"abc"]).await;

        store.finalize_upload(&upload).await.unwrap();
        assert!(matches!(
            store.finalize_upload(&upload).await,
            Err(StoreError::AlreadyFinalized)
        ));
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing() {
        let store = store();
        let env = envelope(6);
        let upload = store.begin_upload(&env).await.unwrap();
        store
            .upload_part(&upload, 0, Bytes::from_static(b"abc"), false)
            .await
            .unwrap();

        store.abort_upload(&upload).await.unwrap();

        assert!(store.fetch_preview(env.id).await.is_err());
        assert!(!store.operator().exists(&part_path(env.id, 0)).await.unwrap());
        assert!(matches!(
            store.finalize_upload(&upload).await,
            Err(StoreError::UnknownUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_rejects_gap() {
        let store = store();
        let env = envelope(6);
        let upload = store.begin_upload(&env).await.unwrap();
        store
            .upload_part(&upload, 0, Bytes::from_static(b"abc"), false)
            .await
            .unwrap();
        store
            .upload_part(&upload, 2, Bytes::from_static(b"def"), true)
            .await
            .unwrap();

        assert!(matches!(
            store.finalize_upload(&upload).await,
            Err(StoreError::InvalidUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_rejects_short_upload() {
        let store = store();
        let env = envelope(9);
        let upload = upload_all(&store, &env, &[b"abc", b"def"]).await;
        assert!(matches!(
            store.finalize_upload(&upload).await,
            Err(StoreError::InvalidUpload(_))
        ));
    }

    #[tokio::test]
    async fn test_part_too_large() {
        let store = OpendalStore::new(
            memory_operator().unwrap(),
            StoreLimits {
                max_part_bytes: 4,
                ..Default::default()
            },
        );
        let upload = store.begin_upload(&envelope(5)).await.unwrap();
        let err = store
            .upload_part(&upload, 0, Bytes::from_static(b"abcde"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PartTooLarge { size: 5, limit: 4 }));
        assert!(err.is_policy());
    }

    #[tokio::test]
    async fn test_quota_exceeded_at_begin() {
        let store = OpendalStore::new(
            memory_operator().unwrap(),
            StoreLimits {
                quota_bytes: Some(8),
                ..Default::default()
            },
        );
        assert!(matches!(
            store.begin_upload(&envelope(9)).await,
            Err(StoreError::QuotaExceeded {
                requested: 9,
                limit: 8
            })
        ));
    }

    #[tokio::test]
    async fn test_unsigned_envelope_rejected() {
        let store = store();
        let mut env = envelope(3);
        env.signature = None;
        assert!(matches!(
            store.begin_upload(&env).await,
            Err(StoreError::InvalidEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected() {
        let store = store();
        let env = envelope(3);
        store.begin_upload(&env).await.unwrap();
        assert!(matches!(
            store.begin_upload(&env).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_lifetime_limit() {
        let store = store();
        let mut env = envelope(3);
        env.expiration_hours = 1000;
        assert!(matches!(
            store.begin_upload(&env).await,
            Err(StoreError::InvalidEnvelope(_))
        ));
    }

    static EXPIRY_NOW: AtomicU64 = AtomicU64::new(1_000_000);

    fn expiry_clock() -> u64 {
        EXPIRY_NOW.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_expired_transfer_not_served_and_purged() {
        let store = store().with_clock(expiry_clock);
        let env = envelope(3);
        let upload = upload_all(&store, &env, &[b"abc"]).await;
        let finalized = store.finalize_upload(&upload).await.unwrap();
        assert_eq!(finalized.expires_at, 1_000_000 + 24 * 3600);

        assert!(store.fetch_preview(env.id).await.is_ok());
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        EXPIRY_NOW.store(finalized.expires_at, Ordering::SeqCst);
        assert!(matches!(
            store.fetch_preview(env.id).await,
            Err(StoreError::Expired(_))
        ));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(matches!(
            store.fetch_preview(env.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        let env = envelope(3);
        let upload = upload_all(&store, &env, &[b"abc"]).await;
        store.finalize_upload(&upload).await.unwrap();

        store.delete(env.id).await.unwrap();
        assert!(matches!(
            store.fetch_preview(env.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
