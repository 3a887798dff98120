//! Master key and its at-rest record.
//!
//! The record holds two wrapped copies of the same master key: one under a
//! key derived from the user's versioned password hash, one under the user's
//! recovery key. The server stores the record but can open neither copy.

use hush_core::encoding::b64_array;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::VersionedPassword;
use crate::keys::{unwrap_key, wrap_key, WrappedKey};
use crate::primitives::{ct_eq, random_bytes};
use crate::recovery::{derive_recovery_key_versioned, recovery_proof, RecoveryKey};
use crate::KEY_SIZE;

const CTX_PASSWORD_WRAPPING: &str = "hushdrop 2026-01 password wrapping key";
const AAD_PASSWORD_COPY: &[u8] = b"hushdrop/master-key/password";
const AAD_RECOVERY_COPY: &[u8] = b"hushdrop/master-key/recovery";

/// 256-bit account master key. Wraps the user's private keys.
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn generate() -> Self {
        Self {
            bytes: random_bytes::<KEY_SIZE>(),
        }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

fn password_wrapping_key(password: &VersionedPassword) -> Zeroizing<[u8; KEY_SIZE]> {
    Zeroizing::new(blake3::derive_key(CTX_PASSWORD_WRAPPING, password.as_bytes()))
}

/// Stored form of a master key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterKeyRecord {
    /// Master key wrapped by the password wrapping key
    pub encrypted_key: WrappedKey,
    /// Master key wrapped by the recovery key
    pub recovery_encrypted_key: WrappedKey,
    /// One-way commitment to the recovery key
    #[serde(with = "b64_array")]
    pub recovery_proof: [u8; KEY_SIZE],
    /// Password version whose hash wraps `encrypted_key`
    pub password_version: u32,
}

impl MasterKeyRecord {
    /// Wrap `master` for `username` under `password` and derive the matching
    /// recovery key.
    ///
    /// The recovery key depends on the password hash, so every password
    /// change yields a new one.
    pub fn seal(
        master: &MasterKey,
        username: &str,
        password: &VersionedPassword,
    ) -> CryptoResult<(Self, RecoveryKey)> {
        let recovery_key = derive_recovery_key_versioned(master, username, password);
        let wrapping = password_wrapping_key(password);

        let record = Self {
            encrypted_key: wrap_key(&wrapping, master.as_bytes(), AAD_PASSWORD_COPY)?,
            recovery_encrypted_key: wrap_key(
                recovery_key.as_bytes(),
                master.as_bytes(),
                AAD_RECOVERY_COPY,
            )?,
            recovery_proof: recovery_proof(&recovery_key),
            password_version: password.version(),
        };
        Ok((record, recovery_key))
    }

    /// Unwrap the password copy.
    pub fn open(&self, password: &VersionedPassword) -> CryptoResult<MasterKey> {
        if password.version() != self.password_version {
            tracing::debug!(
                stored = self.password_version,
                supplied = password.version(),
                "password version mismatch"
            );
            return Err(CryptoError::Verification);
        }
        let wrapping = password_wrapping_key(password);
        let bytes = unwrap_key(&wrapping, &self.encrypted_key, AAD_PASSWORD_COPY)?;
        Ok(MasterKey::from_bytes(*bytes))
    }

    /// Constant-time check of `recovery_key` against the stored proof.
    pub fn verify_recovery_key(&self, recovery_key: &RecoveryKey) -> bool {
        ct_eq(&recovery_proof(recovery_key), &self.recovery_proof)
    }

    /// Unwrap the recovery copy after checking the proof.
    pub fn open_with_recovery_key(&self, recovery_key: &RecoveryKey) -> CryptoResult<MasterKey> {
        if !self.verify_recovery_key(recovery_key) {
            tracing::debug!("recovery proof mismatch");
            return Err(CryptoError::Verification);
        }
        let bytes = unwrap_key(
            recovery_key.as_bytes(),
            &self.recovery_encrypted_key,
            AAD_RECOVERY_COPY,
        )?;
        Ok(MasterKey::from_bytes(*bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password(version: u32, byte: u8) -> VersionedPassword {
        VersionedPassword::from_parts(version, [byte; KEY_SIZE])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let master = MasterKey::generate();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &password(2, 1)).unwrap();

        let opened = record.open(&password(2, 1)).unwrap();
        assert_eq!(opened.as_bytes(), master.as_bytes());
        assert_eq!(record.password_version, 2);
    }

    #[test]
    fn test_open_wrong_password() {
        let master = MasterKey::generate();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &password(2, 1)).unwrap();
        assert!(matches!(
            record.open(&password(2, 2)),
            Err(CryptoError::Verification)
        ));
    }

    #[test]
    fn test_open_wrong_version() {
        let master = MasterKey::generate();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &password(2, 1)).unwrap();
        assert!(record.open(&password(1, 1)).is_err());
    }

    #[test]
    fn test_recovery_copy_opens() {
        let master = MasterKey::generate();
        let (record, recovery_key) =
            MasterKeyRecord::seal(&master, "alice", &password(2, 1)).unwrap();

        assert!(record.verify_recovery_key(&recovery_key));
        let opened = record.open_with_recovery_key(&recovery_key).unwrap();
        assert_eq!(opened.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_recovery_copy_rejects_other_key() {
        let master = MasterKey::generate();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &password(2, 1)).unwrap();
        let other = RecoveryKey::from_bytes([7u8; KEY_SIZE]);

        assert!(!record.verify_recovery_key(&other));
        assert!(record.open_with_recovery_key(&other).is_err());
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let (record, _) =
            MasterKeyRecord::seal(&MasterKey::generate(), "alice", &password(2, 1)).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let restored: MasterKeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_master_key_debug_redacted() {
        let rendered = format!("{:?}", MasterKey::from_bytes([0xAB; KEY_SIZE]));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
