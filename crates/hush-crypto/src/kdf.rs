//! Password hashing: Argon2id with versioned cost parameters

use std::collections::BTreeMap;

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::primitives::generic_hash;
use crate::KEY_SIZE;

const SALT_CONTEXT: &str = "hushdrop 2026-01 password salt";

/// Argon2id parameters for one password version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Parameters of version 1, kept so old hashes can still be reproduced.
pub fn legacy_v1_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 19456,
        time_cost: 2,
        parallelism: 1,
    }
}

/// Maps password versions to Argon2id parameters.
///
/// A client whose stored hash is older than `latest_version` is asked to
/// migrate; that is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    latest_version: u32,
    versions: BTreeMap<u32, KdfParams>,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self::new(2, KdfParams::default())
    }
}

impl PasswordPolicy {
    /// Policy whose newest version uses `latest_params`; version 1 keeps its
    /// legacy parameters whenever `latest_version > 1`.
    pub fn new(latest_version: u32, latest_params: KdfParams) -> Self {
        let mut versions = BTreeMap::new();
        if latest_version > 1 {
            versions.insert(1, legacy_v1_params());
        }
        versions.insert(latest_version, latest_params);
        Self {
            latest_version,
            versions,
        }
    }

    /// Register (or override) the parameters of an intermediate version.
    pub fn with_version(mut self, version: u32, params: KdfParams) -> Self {
        self.versions.insert(version, params);
        self
    }

    pub fn latest_version(&self) -> u32 {
        self.latest_version
    }

    pub fn params(&self, version: u32) -> CryptoResult<&KdfParams> {
        self.versions
            .get(&version)
            .ok_or(CryptoError::UnknownPasswordVersion(version))
    }

    pub fn needs_migration(&self, client_version: u32) -> bool {
        client_version < self.latest_version
    }
}

/// A password already run through Argon2id, tagged with the version whose
/// parameters produced it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VersionedPassword {
    #[zeroize(skip)]
    version: u32,
    hash: [u8; KEY_SIZE],
}

impl VersionedPassword {
    pub fn from_parts(version: u32, hash: [u8; KEY_SIZE]) -> Self {
        Self { version, hash }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.hash
    }
}

impl std::fmt::Debug for VersionedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedPassword")
            .field("version", &self.version)
            .field("hash", &"[REDACTED]")
            .finish()
    }
}

/// Canonical form of a username as fed into every derivation.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Hash `password` for `username` with the parameters of `version`.
///
/// The salt is derived from the normalized username, so the same
/// (password, username, version) always yields the same hash and nothing
/// extra has to be stored. This is CPU-bound; async callers should run it
/// under `spawn_blocking`.
pub fn hash_password(
    password: &SecretString,
    username: &str,
    version: u32,
    policy: &PasswordPolicy,
) -> CryptoResult<VersionedPassword> {
    let params = policy.params(version)?;
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let normalized = normalize_username(username);
    let salt = generic_hash(SALT_CONTEXT, &[normalized.as_bytes()]);

    let mut hash = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), &salt[..16], &mut hash)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id failed: {e}")))?;

    Ok(VersionedPassword { version, hash })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Cheap parameters so tests do not spend seconds in Argon2id.
    pub fn fast_policy() -> PasswordPolicy {
        let fast = KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        PasswordPolicy::new(2, fast.clone()).with_version(1, KdfParams {
            mem_cost_kib: 512,
            ..fast
        })
    }
}
