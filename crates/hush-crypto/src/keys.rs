//! Key wrapping: sealing 32-byte keys under another key, and the
//! at-rest form of a user's long-lived key pairs.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hush_core::encoding::{b64_array, b64_vec};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::primitives::{random_bytes, KeyPair, SigningKeyPair};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const AAD_KEY_PAIR: &[u8] = b"hushdrop/user-key-pair/x25519";
const AAD_SIGNING_KEY: &[u8] = b"hushdrop/user-key-pair/ed25519";

/// A key encrypted with XChaCha20-Poly1305 under a wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "b64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the 16-byte tag
    #[serde(with = "b64_vec")]
    pub ciphertext: Vec<u8>,
}

/// Wrap (encrypt) `key` under `wrapping_key` with a random nonce.
///
/// `aad` binds the wrapped key to its purpose so a wrapped master key cannot
/// be passed off as a wrapped private key.
pub fn wrap_key(
    wrapping_key: &[u8; KEY_SIZE],
    key: &[u8; KEY_SIZE],
    aad: &[u8],
) -> CryptoResult<WrappedKey> {
    let cipher = XChaCha20Poly1305::new(wrapping_key.into());
    let nonce = random_bytes::<NONCE_SIZE>();

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: key.as_ref(),
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    Ok(WrappedKey { nonce, ciphertext })
}

/// Unwrap (decrypt) a key produced by [`wrap_key`].
pub fn unwrap_key(
    wrapping_key: &[u8; KEY_SIZE],
    wrapped: &WrappedKey,
    aad: &[u8],
) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.ciphertext.len() != KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE + TAG_SIZE,
            actual: wrapped.ciphertext.len(),
        });
    }

    let cipher = XChaCha20Poly1305::new(wrapping_key.into());
    let mut plaintext = cipher
        .decrypt(
            XNonce::from_slice(&wrapped.nonce),
            Payload {
                msg: &wrapped.ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            tracing::debug!("key unwrap failed");
            CryptoError::Verification
        })?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(key)
}

/// A user's long-lived key material as it is stored by the account
/// collaborator: public halves in the clear, private halves wrapped by the
/// master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyPair {
    #[serde(with = "b64_array")]
    pub public_key: [u8; KEY_SIZE],
    #[serde(with = "b64_array")]
    pub verifying_key: [u8; KEY_SIZE],
    pub wrapped_private_key: WrappedKey,
    pub wrapped_signing_key: WrappedKey,
}

impl EncryptedKeyPair {
    pub fn seal(
        master_key: &[u8; KEY_SIZE],
        key_pair: &KeyPair,
        signing: &SigningKeyPair,
    ) -> CryptoResult<Self> {
        Ok(Self {
            public_key: key_pair.public_bytes(),
            verifying_key: signing.verifying_bytes(),
            wrapped_private_key: wrap_key(master_key, &key_pair.private_bytes(), AAD_KEY_PAIR)?,
            wrapped_signing_key: wrap_key(master_key, &signing.to_bytes(), AAD_SIGNING_KEY)?,
        })
    }

    /// Unwrap both private halves and check they match the stored public halves.
    pub fn open(&self, master_key: &[u8; KEY_SIZE]) -> CryptoResult<(KeyPair, SigningKeyPair)> {
        let private = unwrap_key(master_key, &self.wrapped_private_key, AAD_KEY_PAIR)?;
        let key_pair = KeyPair::from_slices(private.as_slice(), &self.public_key)?;

        let signing_bytes = unwrap_key(master_key, &self.wrapped_signing_key, AAD_SIGNING_KEY)?;
        let signing = SigningKeyPair::from_bytes(&signing_bytes);
        if signing.verifying_bytes() != self.verifying_key {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok((key_pair, signing))
    }
}
