//! Primitive provider: X25519 key agreement pairs, Ed25519 signing pairs,
//! domain-separated BLAKE3 hashing and CSPRNG helpers.
//!
//! Everything above this module talks to curves and hashes only through
//! these wrappers, so key material is zeroized on drop and never shows up in
//! `Debug` output.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{fixed, CryptoError, CryptoResult};
use crate::{KEY_SIZE, SIGNATURE_SIZE};

/// An X25519 key pair used for transmission key agreement.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from its 32-byte private scalar.
    pub fn from_private_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from untrusted slices, checking lengths and that the
    /// public half actually belongs to the private half.
    pub fn from_slices(private: &[u8], public: &[u8]) -> CryptoResult<Self> {
        let private = Zeroizing::new(fixed::<KEY_SIZE>(private)?);
        let public = fixed::<KEY_SIZE>(public)?;
        let pair = Self::from_private_bytes(*private);
        if pair.public_bytes() != public {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(pair)
    }

    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Export the private scalar (e.g. to hand an ephemeral recipient key to
    /// the person who will download).
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 scalar multiplication with point validation.
    ///
    /// Rejects remote keys that produce a non-contributory shared secret
    /// (identity and other small-order points).
    pub fn diffie_hellman(
        &self,
        remote_public: &[u8; KEY_SIZE],
    ) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
        let remote = PublicKey::from(*remote_public);
        let shared = self.secret.diffie_hellman(&remote);
        if !shared.was_contributory() {
            tracing::debug!("rejecting non-contributory X25519 public key");
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hush_core::encoding::encode(self.public.as_bytes()))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// An Ed25519 key pair used to sign transfer envelopes.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn verifying_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("verifying", &hush_core::encoding::encode(&self.verifying_bytes()))
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

/// Verify an Ed25519 signature.
///
/// A malformed verifying key is a validation error; a signature that does
/// not verify is a generic verification failure.
pub fn verify_signature(
    verifying_key: &[u8; KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> CryptoResult<()> {
    let key = VerifyingKey::from_bytes(verifying_key).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(signature);
    key.verify_strict(message, &signature).map_err(|_| {
        tracing::debug!("envelope signature rejected");
        CryptoError::Verification
    })
}

/// Domain-separated BLAKE3 hash over length-prefixed parts.
///
/// Length prefixes keep `["ab", "c"]` and `["a", "bc"]` distinct.
pub fn generic_hash(context: &str, parts: &[&[u8]]) -> [u8; KEY_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time equality for 32-byte values.
pub fn ct_eq(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> bool {
    blake3::Hash::from(*a) == blake3::Hash::from(*b)
}

/// Fill an array from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}
