//! Recovery keys: derivation, BIP-39 display form, and the recovery
//! submission that re-wraps a master key under a new password.
//!
//! The recovery key is deterministic in (master key, username, password):
//!
//! ```text
//! recovery_key   = BLAKE3-derive_key(CTX_RECOVERY_KEY, master ‖ normalize(username) ‖ argon2id(password))
//! recovery_proof = BLAKE3-derive_key(CTX_RECOVERY_PROOF, recovery_key)
//! ```
//!
//! Only the proof is stored server-side. The user writes the 24-word
//! mnemonic down.

use bip39::Mnemonic;
use secrecy::SecretString;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{fixed, CryptoError, CryptoResult};
use crate::kdf::{hash_password, normalize_username, PasswordPolicy, VersionedPassword};
use crate::master::{MasterKey, MasterKeyRecord};
use crate::KEY_SIZE;

const CTX_RECOVERY_KEY: &str = "hushdrop 2026-01 recovery key";
const CTX_RECOVERY_PROOF: &str = "hushdrop 2026-01 recovery proof";

/// A 256-bit recovery key
pub struct RecoveryKey([u8; KEY_SIZE]);

impl RecoveryKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// 24-word BIP-39 rendering (256 bits of entropy).
    pub fn to_mnemonic(&self) -> CryptoResult<Zeroizing<String>> {
        let mnemonic = Mnemonic::from_entropy(&self.0).map_err(|e| {
            tracing::debug!("BIP-39 encoding failed: {e}");
            CryptoError::InvalidMnemonic
        })?;
        Ok(Zeroizing::new(mnemonic.to_string()))
    }

    /// Parse a 24-word phrase back into a key. Surrounding whitespace and
    /// letter case are ignored.
    pub fn from_mnemonic(words: &str) -> CryptoResult<Self> {
        let normalized = Zeroizing::new(words.trim().to_lowercase());
        let mnemonic = Mnemonic::parse(normalized.as_str()).map_err(|e| {
            tracing::debug!("BIP-39 parse failed: {e}");
            CryptoError::InvalidMnemonic
        })?;
        let (mut entropy, len) = mnemonic.to_entropy_array();
        let bytes = fixed::<KEY_SIZE>(&entropy[..len]).map_err(|_| CryptoError::InvalidMnemonic);
        entropy.zeroize();
        Ok(Self(bytes?))
    }
}

impl Drop for RecoveryKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryKey([REDACTED])")
    }
}

/// Hash `password` with the latest version of `policy`, then derive.
///
/// Runs Argon2id; async callers should use `spawn_blocking`.
pub fn derive_recovery_key(
    master: &MasterKey,
    username: &str,
    password: &SecretString,
    policy: &PasswordPolicy,
) -> CryptoResult<RecoveryKey> {
    let versioned = hash_password(password, username, policy.latest_version(), policy)?;
    Ok(derive_recovery_key_versioned(master, username, &versioned))
}

/// Derive from an already hashed password.
pub fn derive_recovery_key_versioned(
    master: &MasterKey,
    username: &str,
    password: &VersionedPassword,
) -> RecoveryKey {
    let normalized = normalize_username(username);
    let mut hasher = blake3::Hasher::new_derive_key(CTX_RECOVERY_KEY);
    hasher.update(master.as_bytes());
    hasher.update(&(normalized.len() as u64).to_be_bytes());
    hasher.update(normalized.as_bytes());
    hasher.update(password.as_bytes());
    RecoveryKey(*hasher.finalize().as_bytes())
}

/// One-way commitment to a recovery key.
pub fn recovery_proof(recovery_key: &RecoveryKey) -> [u8; KEY_SIZE] {
    blake3::derive_key(CTX_RECOVERY_PROOF, recovery_key.as_bytes())
}

/// What to do when a submitted recovery key does not match the stored proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnMismatch {
    #[default]
    Fail,
    /// Discard the old master key and start over. Everything it wrapped
    /// becomes unreadable.
    RegenerateMasterKey,
}

/// Result of a recovery submission
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Master key preserved, re-wrapped under the new password
    Rewrapped {
        record: MasterKeyRecord,
        recovery_key: RecoveryKey,
    },
    /// Recovery key did not match and the caller asked for a fresh master key
    Regenerated {
        record: MasterKeyRecord,
        recovery_key: RecoveryKey,
        master_key: MasterKey,
    },
}

impl RecoveryOutcome {
    pub fn record(&self) -> &MasterKeyRecord {
        match self {
            RecoveryOutcome::Rewrapped { record, .. } => record,
            RecoveryOutcome::Regenerated { record, .. } => record,
        }
    }

    pub fn recovery_key(&self) -> &RecoveryKey {
        match self {
            RecoveryOutcome::Rewrapped { recovery_key, .. } => recovery_key,
            RecoveryOutcome::Regenerated { recovery_key, .. } => recovery_key,
        }
    }
}

/// Re-wrap the master key in `record` under `new_password` using
/// `recovery_key` instead of the old password.
///
/// A mismatching key is an error unless `on_mismatch` explicitly asks for a
/// new master key. Runs Argon2id.
pub fn submit_recovery(
    record: &MasterKeyRecord,
    username: &str,
    recovery_key: &RecoveryKey,
    new_password: &SecretString,
    policy: &PasswordPolicy,
    on_mismatch: OnMismatch,
) -> CryptoResult<RecoveryOutcome> {
    let new_hash = hash_password(new_password, username, policy.latest_version(), policy)?;

    if record.verify_recovery_key(recovery_key) {
        let master = record.open_with_recovery_key(recovery_key)?;
        let (record, recovery_key) = MasterKeyRecord::seal(&master, username, &new_hash)?;
        tracing::info!(
            password_version = record.password_version,
            "master key re-wrapped via recovery key"
        );
        return Ok(RecoveryOutcome::Rewrapped {
            record,
            recovery_key,
        });
    }

    match on_mismatch {
        OnMismatch::Fail => {
            tracing::debug!("recovery key rejected");
            Err(CryptoError::Verification)
        }
        OnMismatch::RegenerateMasterKey => {
            let master_key = MasterKey::generate();
            let (record, recovery_key) = MasterKeyRecord::seal(&master_key, username, &new_hash)?;
            tracing::warn!("recovery key rejected, master key regenerated on request");
            Ok(RecoveryOutcome::Regenerated {
                record,
                recovery_key,
                master_key,
            })
        }
    }
}

/// Re-wrap a record from an old password hash to a new one, e.g. when the
/// client's password version is behind the policy.
pub fn migrate_password(
    record: &MasterKeyRecord,
    username: &str,
    old_password: &VersionedPassword,
    new_password: &VersionedPassword,
) -> CryptoResult<(MasterKeyRecord, RecoveryKey)> {
    let master = record.open(old_password)?;
    MasterKeyRecord::seal(&master, username, new_password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::test_support::fast_policy;

    #[test]
    fn test_recovery_key_deterministic() {
        let master = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let policy = fast_policy();
        let pw = SecretString::from("hunter2");

        let a = derive_recovery_key(&master, "alice", &pw, &policy).unwrap();
        let b = derive_recovery_key(&master, "alice", &pw, &policy).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_username_normalization() {
        let master = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let pw = VersionedPassword::from_parts(2, [3u8; KEY_SIZE]);

        let a = derive_recovery_key_versioned(&master, "  Alice", &pw);
        let b = derive_recovery_key_versioned(&master, "alice", &pw);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_inputs_change_key() {
        let master = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let pw = VersionedPassword::from_parts(2, [3u8; KEY_SIZE]);
        let base = derive_recovery_key_versioned(&master, "alice", &pw);

        let other_master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        let other_pw = VersionedPassword::from_parts(2, [4u8; KEY_SIZE]);
        assert_ne!(
            base.as_bytes(),
            derive_recovery_key_versioned(&other_master, "alice", &pw).as_bytes()
        );
        assert_ne!(
            base.as_bytes(),
            derive_recovery_key_versioned(&master, "bob", &pw).as_bytes()
        );
        assert_ne!(
            base.as_bytes(),
            derive_recovery_key_versioned(&master, "alice", &other_pw).as_bytes()
        );
    }

    #[test]
    fn test_mnemonic_roundtrip() {
        let key = RecoveryKey::from_bytes([0x5A; KEY_SIZE]);
        let words = key.to_mnemonic().unwrap();
        assert_eq!(words.split_whitespace().count(), 24);

        let parsed = RecoveryKey::from_mnemonic(&words.to_uppercase()).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_invalid_mnemonic() {
        let result = RecoveryKey::from_mnemonic("not a valid mnemonic at all");
        assert!(matches!(result, Err(CryptoError::InvalidMnemonic)));
    }

    #[test]
    fn test_twelve_word_mnemonic_rejected() {
        let short = Mnemonic::from_entropy(&[7u8; 16]).unwrap().to_string();
        assert!(matches!(
            RecoveryKey::from_mnemonic(&short),
            Err(CryptoError::InvalidMnemonic)
        ));
    }

    #[test]
    fn test_proof_is_not_the_key() {
        let key = RecoveryKey::from_bytes([9u8; KEY_SIZE]);
        assert_ne!(&recovery_proof(&key), key.as_bytes());
    }

    #[test]
    fn test_submit_recovery_preserves_master() {
        let policy = fast_policy();
        let master = MasterKey::generate();
        let old = hash_password(&SecretString::from("old"), "alice", 2, &policy).unwrap();
        let (record, recovery_key) = MasterKeyRecord::seal(&master, "alice", &old).unwrap();

        let new_pw = SecretString::from("new");
        let outcome = submit_recovery(
            &record,
            "alice",
            &recovery_key,
            &new_pw,
            &policy,
            OnMismatch::Fail,
        )
        .unwrap();

        let RecoveryOutcome::Rewrapped {
            record: new_record,
            recovery_key: new_recovery_key,
        } = outcome
        else {
            panic!("expected re-wrap");
        };
        let new_hash = hash_password(&new_pw, "alice", 2, &policy).unwrap();
        assert_eq!(new_record.open(&new_hash).unwrap().as_bytes(), master.as_bytes());
        assert_ne!(new_recovery_key.as_bytes(), recovery_key.as_bytes());
        assert!(new_record.open(&old).is_err());
    }

    #[test]
    fn test_submit_recovery_wrong_key_fails() {
        let policy = fast_policy();
        let master = MasterKey::generate();
        let old = hash_password(&SecretString::from("old"), "alice", 2, &policy).unwrap();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &old).unwrap();

        let result = submit_recovery(
            &record,
            "alice",
            &RecoveryKey::from_bytes([0u8; KEY_SIZE]),
            &SecretString::from("new"),
            &policy,
            OnMismatch::Fail,
        );
        assert!(matches!(result, Err(CryptoError::Verification)));
    }

    #[test]
    fn test_submit_recovery_regenerates_only_on_request() {
        let policy = fast_policy();
        let master = MasterKey::generate();
        let old = hash_password(&SecretString::from("old"), "alice", 2, &policy).unwrap();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &old).unwrap();

        let outcome = submit_recovery(
            &record,
            "alice",
            &RecoveryKey::from_bytes([0u8; KEY_SIZE]),
            &SecretString::from("new"),
            &policy,
            OnMismatch::RegenerateMasterKey,
        )
        .unwrap();

        match outcome {
            RecoveryOutcome::Regenerated { master_key, record, .. } => {
                assert_ne!(master_key.as_bytes(), master.as_bytes());
                let new_hash =
                    hash_password(&SecretString::from("new"), "alice", 2, &policy).unwrap();
                assert_eq!(
                    record.open(&new_hash).unwrap().as_bytes(),
                    master_key.as_bytes()
                );
            }
            other => panic!("expected regeneration, got {other:?}"),
        }
    }

    #[test]
    fn test_migrate_password() {
        let policy = fast_policy();
        let master = MasterKey::generate();
        let pw = SecretString::from("pw");
        let v1 = hash_password(&pw, "alice", 1, &policy).unwrap();
        let v2 = hash_password(&pw, "alice", 2, &policy).unwrap();
        let (record, _) = MasterKeyRecord::seal(&master, "alice", &v1).unwrap();

        let (migrated, _) = migrate_password(&record, "alice", &v1, &v2).unwrap();
        assert_eq!(migrated.password_version, 2);
        assert_eq!(migrated.open(&v2).unwrap().as_bytes(), master.as_bytes());
    }
}
