//! Upload and download handler state machines.
//!
//! ```text
//! upload:   Uninitialized ─► SenderConfigured | RecipientConfigured ─► KeysDerived
//!             ─► Encrypting ─► AwaitingUpload ─► Complete
//! download: Uninitialized ─► SenderConfigured (preview verified) ─► KeysDerived
//!             ─► Fetching ─► Decrypting ─► Complete
//! ```
//!
//! Any error other than calling an operation in the wrong state moves the
//! handler to `Failed`, which is terminal.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use hush_core::config::TransferConfig;
use hush_core::types::ENVELOPE_VERSION;
use hush_core::{CoreEvent, ItemType, TransferEnvelope, UserType};
use hush_crypto::stream::EncryptingReader;
use hush_crypto::{
    decrypt_chunks, derive_transmission_keys, generate_transfer_nonce, ChunkReader, CryptoError,
    KeyPair, Role, SigningKeyPair, StreamOptions, TransmissionKeyRing,
};
use hush_storage::TransferStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::account::{AccountDirectory, UserKeys};
use crate::envelope::{check_digest, check_framing, sign_envelope, verify_envelope};
use crate::error::{TransferError, TransferResult};
use crate::events::EventSink;
use crate::item::{self, TransferItem};
use crate::scheduler::{MultipartScheduler, ProgressFn, ScheduleParams, UploadSummary};
use crate::spool::CipherSpool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    Uninitialized,
    SenderConfigured,
    RecipientConfigured,
    KeysDerived,
    Encrypting,
    AwaitingUpload,
    Fetching,
    Decrypting,
    Complete,
    Failed,
}

#[derive(Debug)]
pub enum SenderInfo {
    /// Fresh ephemeral X25519 and Ed25519 pairs for this transfer only
    Anonymous,
    User(UserKeys),
}

#[derive(Debug, Clone)]
pub enum RecipientInfo {
    PublicKey([u8; 32]),
    /// Looked up in the account directory; unknown users get an ephemeral key
    Username(String),
    /// An ephemeral key whose private half is handed back for out-of-band delivery
    Anonymous,
}

/// What a completed upload hands back to the sender
pub struct UploadReceipt {
    pub transfer_id: Uuid,
    pub expires_at: u64,
    pub envelope: TransferEnvelope,
    /// Private key the recipient needs when no registered key was used
    pub ephemeral_recipient_key: Option<Zeroizing<[u8; 32]>>,
    pub summary: UploadSummary,
}

impl std::fmt::Debug for UploadReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadReceipt")
            .field("transfer_id", &self.transfer_id)
            .field("expires_at", &self.expires_at)
            .field(
                "ephemeral_recipient_key",
                &self.ephemeral_recipient_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("summary", &self.summary)
            .finish()
    }
}

/// Builds handlers that share one store, config and account directory.
pub struct TransferFactory<S: ?Sized> {
    store: Arc<S>,
    config: TransferConfig,
    accounts: Arc<dyn AccountDirectory>,
    events: EventSink,
}

impl<S: TransferStore + ?Sized> TransferFactory<S> {
    pub fn new(
        store: Arc<S>,
        config: TransferConfig,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Self {
        Self {
            store,
            config,
            accounts,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn upload_handler(&self, item: Box<dyn TransferItem>) -> UploadHandler<S> {
        UploadHandler {
            store: self.store.clone(),
            config: self.config.clone(),
            accounts: self.accounts.clone(),
            events: self.events.clone(),
            item,
            state: HandlerState::Uninitialized,
            transfer_id: Uuid::new_v4(),
            expiration_hours: self.config.lifetime_hours,
            sender: None,
            recipient_public: None,
            ephemeral_recipient: None,
            keys: None,
            nonce: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn download_handler(&self, transfer_id: Uuid) -> DownloadHandler<S> {
        DownloadHandler {
            store: self.store.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            transfer_id,
            state: HandlerState::Uninitialized,
            envelope: None,
            keys: None,
            cancel: CancellationToken::new(),
        }
    }
}

struct SenderKeys {
    user_type: UserType,
    key_pair: KeyPair,
    signing: SigningKeyPair,
}

fn guard(state: HandlerState, allowed: &[HandlerState]) -> TransferResult<()> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(TransferError::InvalidState(state))
    }
}

pub struct UploadHandler<S: ?Sized> {
    store: Arc<S>,
    config: TransferConfig,
    accounts: Arc<dyn AccountDirectory>,
    events: EventSink,
    item: Box<dyn TransferItem>,
    state: HandlerState,
    transfer_id: Uuid,
    expiration_hours: u32,
    sender: Option<SenderKeys>,
    recipient_public: Option<[u8; 32]>,
    ephemeral_recipient: Option<KeyPair>,
    keys: Option<TransmissionKeyRing>,
    nonce: Option<[u8; 24]>,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl<S: TransferStore + ?Sized> UploadHandler<S> {
    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    /// Token that stops the upload; a cancelled upload is aborted in the store.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_progress(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    pub fn with_expiration_hours(&mut self, hours: u32) -> TransferResult<()> {
        guard(
            self.state,
            &[
                HandlerState::Uninitialized,
                HandlerState::SenderConfigured,
                HandlerState::RecipientConfigured,
                HandlerState::KeysDerived,
            ],
        )?;
        if hours == 0 || hours > self.config.max_lifetime_hours {
            return Err(TransferError::Validation(format!(
                "expiration must be 1..={} hours",
                self.config.max_lifetime_hours
            )));
        }
        self.expiration_hours = hours;
        Ok(())
    }

    pub fn set_sender_info(&mut self, info: SenderInfo) -> TransferResult<()> {
        guard(
            self.state,
            &[HandlerState::Uninitialized, HandlerState::RecipientConfigured],
        )?;
        self.sender = Some(match info {
            SenderInfo::Anonymous => SenderKeys {
                user_type: UserType::Anonymous,
                key_pair: KeyPair::generate(),
                signing: SigningKeyPair::generate(),
            },
            SenderInfo::User(keys) => SenderKeys {
                user_type: UserType::User,
                key_pair: keys.key_pair,
                signing: keys.signing,
            },
        });

        if self.recipient_public.is_some() {
            let result = self.derive_keys();
            self.settle(result)
        } else {
            self.state = HandlerState::SenderConfigured;
            Ok(())
        }
    }

    pub async fn set_recipient_info(&mut self, info: RecipientInfo) -> TransferResult<()> {
        guard(
            self.state,
            &[HandlerState::Uninitialized, HandlerState::SenderConfigured],
        )?;
        let result = self.resolve_recipient(info).await;
        self.settle(result)?;

        if self.sender.is_some() {
            let result = self.derive_keys();
            self.settle(result)
        } else {
            self.state = HandlerState::RecipientConfigured;
            Ok(())
        }
    }

    async fn resolve_recipient(&mut self, info: RecipientInfo) -> TransferResult<()> {
        let public = match info {
            RecipientInfo::PublicKey(public) => public,
            RecipientInfo::Username(username) => {
                match self.accounts.public_key(&username).await? {
                    Some(public) => public,
                    None => {
                        info!(
                            transfer_id = %self.transfer_id,
                            "recipient has no registered key, issuing an ephemeral one"
                        );
                        self.issue_ephemeral_recipient()
                    }
                }
            }
            RecipientInfo::Anonymous => self.issue_ephemeral_recipient(),
        };
        self.recipient_public = Some(public);
        Ok(())
    }

    fn issue_ephemeral_recipient(&mut self) -> [u8; 32] {
        let pair = KeyPair::generate();
        let public = pair.public_bytes();
        self.ephemeral_recipient = Some(pair);
        public
    }

    fn derive_keys(&mut self) -> TransferResult<()> {
        let (Some(sender), Some(recipient)) = (self.sender.as_ref(), self.recipient_public) else {
            return Err(TransferError::InvalidState(self.state));
        };
        let nonce = generate_transfer_nonce();
        let ring = derive_transmission_keys(&sender.key_pair, &recipient, &nonce, Role::Sender)?;
        self.keys = Some(ring);
        self.nonce = Some(nonce);
        self.state = HandlerState::KeysDerived;
        debug!(transfer_id = %self.transfer_id, "transmission keys derived");
        Ok(())
    }

    fn settle<T>(&mut self, result: TransferResult<T>) -> TransferResult<T> {
        if let Err(e) = &result {
            if !matches!(e, TransferError::InvalidState(_)) {
                warn!(transfer_id = %self.transfer_id, error = %e, "upload handler failed");
                self.state = HandlerState::Failed;
                self.keys = None;
                self.sender = None;
                self.ephemeral_recipient = None;
            }
        }
        result
    }

    /// Encrypt, sign and upload the item.
    pub async fn upload(&mut self) -> TransferResult<UploadReceipt> {
        guard(self.state, &[HandlerState::KeysDerived])?;
        let result = self.run_upload().await;
        match &result {
            Ok(receipt) => {
                self.state = HandlerState::Complete;
                self.events.emit(CoreEvent::TransferUploaded {
                    transfer_id: receipt.transfer_id,
                    expires_at: receipt.expires_at,
                });
                if receipt.ephemeral_recipient_key.is_some() {
                    self.events.emit(CoreEvent::EphemeralRecipientIssued {
                        transfer_id: receipt.transfer_id,
                    });
                }
            }
            Err(e) => {
                self.events.emit(CoreEvent::UploadAborted {
                    transfer_id: self.transfer_id,
                    reason: e.to_string(),
                });
            }
        }
        self.settle(result)
    }

    async fn run_upload(&mut self) -> TransferResult<UploadReceipt> {
        self.state = HandlerState::Encrypting;
        let (Some(ring), Some(sender), Some(nonce)) =
            (self.keys.take(), self.sender.take(), self.nonce.take())
        else {
            return Err(TransferError::InvalidState(self.state));
        };

        let options = StreamOptions::new(self.config.max_read_size, self.config.pad_size)?;
        let chunk_size = u32::try_from(options.chunk_size())
            .map_err(|_| TransferError::Validation("max_read_size too large".into()))?;
        let buffer = self.config.upload_buffer_bytes();

        let size = self.item.compute_size().await?;
        let compressed = self.item.compress() && size <= buffer;
        let mut spool = CipherSpool::new(buffer);

        let chunk_count = if compressed {
            let mut plain = Zeroizing::new(Vec::with_capacity(size as usize));
            self.item
                .stream_plaintext()
                .await?
                .read_to_end(&mut plain)
                .await?;
            let packed = item::compress(&plain)?;
            debug!(plain = plain.len(), packed = packed.len(), "plaintext compressed");
            encrypt_to_spool(Cursor::new(packed), ring.send_key(), options, &mut spool, &self.cancel)
                .await?
        } else {
            let reader = self.item.stream_plaintext().await?;
            encrypt_to_spool(reader, ring.send_key(), options, &mut spool, &self.cancel).await?
        };

        let mut envelope = TransferEnvelope {
            version: ENVELOPE_VERSION,
            id: self.transfer_id,
            item_type: self.item.item_type(),
            user_type: sender.user_type,
            sender_public_key: sender.key_pair.public_bytes(),
            sender_verifying_key: sender.signing.verifying_bytes(),
            nonce,
            signature: None,
            expiration_hours: self.expiration_hours,
            compressed,
            chunk_size,
            chunk_count,
            ciphertext_size: spool.len(),
            ciphertext_digest: spool.digest(),
        };
        sign_envelope(&mut envelope, &sender.signing);
        drop(sender);
        drop(ring);

        info!(
            transfer_id = %self.transfer_id,
            chunks = chunk_count,
            bytes = envelope.ciphertext_size,
            spilled = spool.is_spilled(),
            "item encrypted"
        );

        self.state = HandlerState::AwaitingUpload;
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let upload_id = self.store.begin_upload(&envelope).await?;
        let mut chunks = ChunkReader::new(
            spool.into_reader().await?,
            chunk_size as usize,
            chunk_count,
            envelope.ciphertext_size,
        )?;

        let mut scheduler = MultipartScheduler::new(ScheduleParams::from_config(&self.config));
        if let Some(progress) = self.progress.take() {
            scheduler = scheduler.with_progress(progress);
        }
        let summary = scheduler
            .upload(self.store.as_ref(), &upload_id, &mut chunks, &self.cancel)
            .await?;

        Ok(UploadReceipt {
            transfer_id: self.transfer_id,
            expires_at: summary.finalized.expires_at,
            envelope,
            ephemeral_recipient_key: self.ephemeral_recipient.take().map(|pair| pair.private_bytes()),
            summary,
        })
    }
}

/// Encrypt `reader` chunk by chunk into `spool`; returns the chunk count.
async fn encrypt_to_spool<R: AsyncRead + Unpin>(
    reader: R,
    key: &[u8; 32],
    options: StreamOptions,
    spool: &mut CipherSpool,
    cancel: &CancellationToken,
) -> TransferResult<u64> {
    let mut source = EncryptingReader::new(reader, key, options);
    let mut count = 0u64;
    while let Some(chunk) = source.next_chunk().await? {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        spool.write(&chunk.bytes).await?;
        count += 1;
    }
    Ok(count)
}

pub struct DownloadHandler<S: ?Sized> {
    store: Arc<S>,
    config: TransferConfig,
    events: EventSink,
    transfer_id: Uuid,
    state: HandlerState,
    envelope: Option<TransferEnvelope>,
    keys: Option<TransmissionKeyRing>,
    cancel: CancellationToken,
}

impl<S: TransferStore + ?Sized> DownloadHandler<S> {
    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The verified envelope, once previewed.
    pub fn envelope(&self) -> Option<&TransferEnvelope> {
        self.envelope.as_ref()
    }

    /// Fetch the envelope and check its signature.
    pub async fn fetch_preview(&mut self) -> TransferResult<TransferEnvelope> {
        guard(self.state, &[HandlerState::Uninitialized])?;
        let result = self.load_preview().await;
        self.settle(result)
    }

    async fn load_preview(&mut self) -> TransferResult<TransferEnvelope> {
        let envelope = self.store.fetch_preview(self.transfer_id).await?;
        verify_envelope(&envelope)?;
        if envelope.id != self.transfer_id {
            debug!(transfer_id = %self.transfer_id, "envelope belongs to another transfer");
            return Err(CryptoError::Verification.into());
        }
        check_framing(&envelope, self.config.max_chunk_len())?;
        self.envelope = Some(envelope.clone());
        self.state = HandlerState::SenderConfigured;
        Ok(envelope)
    }

    /// Supply the recipient key pair and derive the transmission keys.
    pub fn set_recipient_info(&mut self, recipient: &KeyPair) -> TransferResult<()> {
        guard(self.state, &[HandlerState::SenderConfigured])?;
        let result = match self.envelope.as_ref() {
            Some(envelope) => derive_transmission_keys(
                recipient,
                &envelope.sender_public_key,
                &envelope.nonce,
                Role::Recipient,
            )
            .map_err(TransferError::from),
            None => Err(TransferError::InvalidState(self.state)),
        };
        let ring = self.settle(result)?;
        self.keys = Some(ring);
        self.state = HandlerState::KeysDerived;
        Ok(())
    }

    /// Download a file item to `dest`. Nothing appears at `dest` unless the
    /// whole transfer authenticates.
    pub async fn receive_file(&mut self, dest: &Path) -> TransferResult<u64> {
        self.check_ready(ItemType::File)?;
        let result = self.download_file(dest).await;
        self.finish(result)
    }

    /// Download a message item.
    pub async fn receive_message(&mut self) -> TransferResult<String> {
        self.check_ready(ItemType::Message)?;
        let result = self.download_message().await;
        self.finish(result)
    }

    fn check_ready(&self, expected: ItemType) -> TransferResult<()> {
        guard(self.state, &[HandlerState::KeysDerived])?;
        match &self.envelope {
            Some(envelope) if envelope.item_type == expected => Ok(()),
            Some(envelope) => Err(TransferError::Validation(format!(
                "transfer carries a {:?}, not a {expected:?}",
                envelope.item_type
            ))),
            None => Err(TransferError::InvalidState(self.state)),
        }
    }

    async fn download_file(&mut self, dest: &Path) -> TransferResult<u64> {
        let (envelope, ring, mut chunks) = self.fetch_verified().await?;
        self.state = HandlerState::Decrypting;

        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let (std_file, staging) = tempfile::NamedTempFile::new_in(parent)?.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let written = if envelope.compressed {
            let plain =
                decrypt_compressed(&mut chunks, &ring, self.config.upload_buffer_bytes()).await?;
            file.write_all(plain.as_slice()).await?;
            plain.len() as u64
        } else {
            let (out, written) = decrypt_chunks(&mut chunks, ring.receive_key(), file).await?;
            file = out;
            written
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        staging.persist(dest).map_err(|e| TransferError::Io(e.error))?;
        Ok(written)
    }

    async fn download_message(&mut self) -> TransferResult<String> {
        let (envelope, ring, mut chunks) = self.fetch_verified().await?;
        self.state = HandlerState::Decrypting;

        let mut plain = if envelope.compressed {
            decrypt_compressed(&mut chunks, &ring, self.config.upload_buffer_bytes()).await?
        } else {
            let (out, _) = decrypt_chunks(&mut chunks, ring.receive_key(), Vec::new()).await?;
            Zeroizing::new(out)
        };
        String::from_utf8(std::mem::take(&mut *plain))
            .map_err(|_| TransferError::Validation("message is not valid UTF-8".into()))
    }

    /// Fetch every part into a spool and check size and digest against the
    /// signed envelope before handing out a chunk reader.
    async fn fetch_verified(
        &mut self,
    ) -> TransferResult<(
        TransferEnvelope,
        TransmissionKeyRing,
        ChunkReader<crate::spool::SpoolReader>,
    )> {
        let (Some(envelope), Some(ring)) = (self.envelope.clone(), self.keys.take()) else {
            return Err(TransferError::InvalidState(self.state));
        };
        self.state = HandlerState::Fetching;

        let mut parts = self.store.fetch_parts(self.transfer_id).await?;
        let mut spool = CipherSpool::new(self.config.upload_buffer_bytes());
        loop {
            let part = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                part = parts.next() => part,
            };
            let Some(part) = part else { break };
            let part = part?;
            if spool.len() + part.len() as u64 > envelope.ciphertext_size {
                debug!(transfer_id = %self.transfer_id, "more ciphertext than the envelope declares");
                return Err(CryptoError::Verification.into());
            }
            spool.write(&part).await?;
        }
        check_digest(&envelope, spool.len(), &spool.digest())?;

        let chunks = ChunkReader::new(
            spool.into_reader().await?,
            envelope.chunk_size as usize,
            envelope.chunk_count,
            envelope.ciphertext_size,
        )?;
        Ok((envelope, ring, chunks))
    }

    fn finish<T>(&mut self, result: TransferResult<T>) -> TransferResult<T> {
        let result = self.settle(result);
        if result.is_ok() {
            self.state = HandlerState::Complete;
            self.events.emit(CoreEvent::TransferDownloaded {
                transfer_id: self.transfer_id,
            });
            info!(transfer_id = %self.transfer_id, "transfer downloaded");
        }
        result
    }

    fn settle<T>(&mut self, result: TransferResult<T>) -> TransferResult<T> {
        if let Err(e) = &result {
            if !matches!(e, TransferError::InvalidState(_)) {
                warn!(transfer_id = %self.transfer_id, error = %e, "download handler failed");
                self.state = HandlerState::Failed;
                self.keys = None;
            }
        }
        result
    }
}

async fn decrypt_compressed<R: AsyncRead + Unpin>(
    chunks: &mut ChunkReader<R>,
    ring: &TransmissionKeyRing,
    limit: u64,
) -> TransferResult<Zeroizing<Vec<u8>>> {
    let (packed, _) = decrypt_chunks(chunks, ring.receive_key(), Vec::new()).await?;
    let packed = Zeroizing::new(packed);
    Ok(item::decompress_bounded(&packed, limit)?)
}
