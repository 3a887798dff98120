//! hush-crypto: client-side E2E encryption for hushdrop transfers
//!
//! Pipeline: X25519 key agreement → directional BLAKE3 transmission keys →
//! chunked XChaCha20-Poly1305 stream → Ed25519-signed envelope
//!
//! Key hierarchy:
//! ```text
//! Password ──Argon2id(version)──► VersionedPassword
//!   ├── password wrapping key ──wraps──► Master Key (256-bit random)
//!   │                                     └──wraps──► X25519 + Ed25519 private keys
//!   └── Recovery Key = BLAKE3(master ‖ username ‖ password hash)
//!         └──wraps──► Master Key (recovery copy), proof stored server-side
//!
//! Per transfer:
//!   X25519(local, remote) ‖ nonce ‖ sender_pk ‖ recipient_pk
//!     ├── upstream key   (sender → recipient)
//!     └── downstream key (recipient → sender)
//! ```

pub mod error;
pub mod kdf;
pub mod keys;
pub mod kex;
pub mod master;
pub mod primitives;
pub mod recovery;
pub mod stream;

pub use error::{CryptoError, CryptoResult};
pub use kdf::{hash_password, normalize_username, KdfParams, PasswordPolicy, VersionedPassword};
pub use keys::{unwrap_key, wrap_key, EncryptedKeyPair, WrappedKey};
pub use kex::{derive_transmission_keys, generate_transfer_nonce, Role, TransmissionKeyRing};
pub use master::{MasterKey, MasterKeyRecord};
pub use primitives::{generic_hash, verify_signature, KeyPair, SigningKeyPair};
pub use recovery::{
    derive_recovery_key, derive_recovery_key_versioned, migrate_password, recovery_proof,
    submit_recovery, OnMismatch, RecoveryKey, RecoveryOutcome,
};
pub use stream::{
    decrypt_all, decrypt_chunks, encrypt_all, encrypt_reader, ChunkReader, DecryptingWriter,
    EncryptingReader, StreamDecryptor, StreamEncryptor, StreamOptions, StreamSummary,
    CHUNK_OVERHEAD,
};

/// Size of every symmetric key and X25519/Ed25519 public key (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;
