use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{b64_array, b64_option};

/// Size of the per-transfer key-exchange nonce
pub const ENVELOPE_NONCE_SIZE: usize = 24;

/// Current envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

const SIGNING_DOMAIN: &[u8] = b"hushdrop/envelope/v1";

/// What a transfer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Message,
}

impl ItemType {
    fn tag(self) -> u8 {
        match self {
            ItemType::File => 1,
            ItemType::Message => 2,
        }
    }
}

/// Whether the sender is a registered account or an ephemeral identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserType {
    Anonymous,
    User,
}

impl UserType {
    fn tag(self) -> u8 {
        match self {
            UserType::Anonymous => 1,
            UserType::User => 2,
        }
    }
}

/// Signed metadata describing one transfer.
///
/// Everything except `signature` is covered by the signature, including the
/// chunk framing (`chunk_size`, `chunk_count`) a receiver needs to split the
/// fetched parts back into cipher chunks and the BLAKE3 digest of the whole
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub version: u32,
    pub id: Uuid,
    pub item_type: ItemType,
    pub user_type: UserType,
    /// X25519 key the recipient combines with its own private key
    #[serde(with = "b64_array")]
    pub sender_public_key: [u8; 32],
    /// Ed25519 key the signature is checked against
    #[serde(with = "b64_array")]
    pub sender_verifying_key: [u8; 32],
    #[serde(with = "b64_array")]
    pub nonce: [u8; ENVELOPE_NONCE_SIZE],
    #[serde(default, with = "b64_option")]
    pub signature: Option<[u8; 64]>,
    pub expiration_hours: u32,
    /// Plaintext was zstd-compressed before encryption
    pub compressed: bool,
    /// Ciphertext size of every chunk but the last
    pub chunk_size: u32,
    pub chunk_count: u64,
    pub ciphertext_size: u64,
    #[serde(with = "b64_array")]
    pub ciphertext_digest: [u8; 32],
}

impl TransferEnvelope {
    /// Canonical byte string the Ed25519 signature covers.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNING_DOMAIN.len() + 200);
        out.extend_from_slice(SIGNING_DOMAIN);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out.push(self.item_type.tag());
        out.push(self.user_type.tag());
        out.extend_from_slice(&self.sender_public_key);
        out.extend_from_slice(&self.sender_verifying_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.expiration_hours.to_be_bytes());
        out.push(u8::from(self.compressed));
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out.extend_from_slice(&self.chunk_count.to_be_bytes());
        out.extend_from_slice(&self.ciphertext_size.to_be_bytes());
        out.extend_from_slice(&self.ciphertext_digest);
        out
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("envelope serialization: {e}"))
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("envelope deserialization: {e}"))
    }
}

/// What the storage collaborator returns once a multipart upload is assembled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedTransfer {
    pub transfer_id: Uuid,
    /// Unix timestamp (seconds) after which the transfer is no longer served
    pub expires_at: u64,
    pub ciphertext_size: u64,
    pub parts: u64,
}

/// Typed events the core emits for an external dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    TransferUploaded { transfer_id: Uuid, expires_at: u64 },
    TransferDownloaded { transfer_id: Uuid },
    UploadAborted { transfer_id: Uuid, reason: String },
    EphemeralRecipientIssued { transfer_id: Uuid },
    MasterKeyRewrapped { username: String },
    MasterKeyRegenerated { username: String },
    PasswordMigrated { username: String, from: u32, to: u32 },
}

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
