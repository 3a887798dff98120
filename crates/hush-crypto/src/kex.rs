//! Transmission key derivation.
//!
//! Both parties run X25519 over their own private key and the other side's
//! public key, then derive two directional keys from the shared secret, the
//! per-transfer nonce and both public keys:
//!
//! ```text
//! upstream   = BLAKE3-derive_key(CTX_UPSTREAM,   shared ‖ nonce ‖ sender_pk ‖ recipient_pk)
//! downstream = BLAKE3-derive_key(CTX_DOWNSTREAM, shared ‖ nonce ‖ sender_pk ‖ recipient_pk)
//! ```
//!
//! The sender encrypts with upstream; the recipient decrypts with it.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::primitives::{random_bytes, KeyPair};
use crate::{KEY_SIZE, NONCE_SIZE};

const CTX_UPSTREAM: &str = "hushdrop 2026-01 transmission key upstream";
const CTX_DOWNSTREAM: &str = "hushdrop 2026-01 transmission key downstream";

/// Which end of the transfer the local key pair belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Recipient,
}

/// Directional symmetric keys for one transfer. Never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransmissionKeyRing {
    send_key: [u8; KEY_SIZE],
    receive_key: [u8; KEY_SIZE],
}

impl TransmissionKeyRing {
    pub fn send_key(&self) -> &[u8; KEY_SIZE] {
        &self.send_key
    }

    pub fn receive_key(&self) -> &[u8; KEY_SIZE] {
        &self.receive_key
    }
}

impl std::fmt::Debug for TransmissionKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionKeyRing")
            .field("send_key", &"[REDACTED]")
            .field("receive_key", &"[REDACTED]")
            .finish()
    }
}

/// Fresh random per-transfer nonce.
pub fn generate_transfer_nonce() -> [u8; NONCE_SIZE] {
    random_bytes::<NONCE_SIZE>()
}

/// Derive the key ring for `local` talking to `remote_public`.
///
/// Deterministic: the same inputs always produce the same ring, and the
/// sender's `send_key` equals the recipient's `receive_key`.
pub fn derive_transmission_keys(
    local: &KeyPair,
    remote_public: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    role: Role,
) -> CryptoResult<TransmissionKeyRing> {
    if nonce.iter().all(|b| *b == 0) {
        return Err(CryptoError::InvalidNonce);
    }

    let shared = local.diffie_hellman(remote_public)?;
    let local_public = local.public_bytes();
    let (sender_pk, recipient_pk) = match role {
        Role::Sender => (&local_public, remote_public),
        Role::Recipient => (remote_public, &local_public),
    };

    let derive = |context: &str| {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(shared.as_slice());
        hasher.update(nonce);
        hasher.update(sender_pk);
        hasher.update(recipient_pk);
        *hasher.finalize().as_bytes()
    };
    let upstream = derive(CTX_UPSTREAM);
    let downstream = derive(CTX_DOWNSTREAM);

    let ring = match role {
        Role::Sender => TransmissionKeyRing {
            send_key: upstream,
            receive_key: downstream,
        },
        Role::Recipient => TransmissionKeyRing {
            send_key: downstream,
            receive_key: upstream,
        },
    };
    tracing::trace!(?role, "derived transmission keys");
    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_and_recipient_agree() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let nonce = generate_transfer_nonce();

        let s = derive_transmission_keys(&sender, &recipient.public_bytes(), &nonce, Role::Sender)
            .unwrap();
        let r = derive_transmission_keys(
            &recipient,
            &sender.public_bytes(),
            &nonce,
            Role::Recipient,
        )
        .unwrap();

        assert_eq!(s.send_key(), r.receive_key());
        assert_eq!(s.receive_key(), r.send_key());
    }

    #[test]
    fn test_directions_differ() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let nonce = generate_transfer_nonce();

        let s = derive_transmission_keys(&sender, &recipient.public_bytes(), &nonce, Role::Sender)
            .unwrap();
        assert_ne!(s.send_key(), s.receive_key());
    }

    #[test]
    fn test_directional_even_with_same_key_pair() {
        let pair = KeyPair::generate();
        let nonce = generate_transfer_nonce();

        let s = derive_transmission_keys(&pair, &pair.public_bytes(), &nonce, Role::Sender).unwrap();
        let r =
            derive_transmission_keys(&pair, &pair.public_bytes(), &nonce, Role::Recipient).unwrap();

        assert_ne!(s.send_key(), r.send_key());
        assert_eq!(s.send_key(), r.receive_key());
    }

    #[test]
    fn test_deterministic() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let nonce = [5u8; NONCE_SIZE];

        let a = derive_transmission_keys(&sender, &recipient.public_bytes(), &nonce, Role::Sender)
            .unwrap();
        let b = derive_transmission_keys(&sender, &recipient.public_bytes(), &nonce, Role::Sender)
            .unwrap();
        assert_eq!(a.send_key(), b.send_key());
        assert_eq!(a.receive_key(), b.receive_key());
    }

    #[test]
    fn test_nonce_changes_keys() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();

        let a = derive_transmission_keys(&sender, &recipient.public_bytes(), &[1u8; 24], Role::Sender)
            .unwrap();
        let b = derive_transmission_keys(&sender, &recipient.public_bytes(), &[2u8; 24], Role::Sender)
            .unwrap();
        assert_ne!(a.send_key(), b.send_key());
    }

    #[test]
    fn test_rejects_zero_nonce() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let result =
            derive_transmission_keys(&sender, &recipient.public_bytes(), &[0u8; 24], Role::Sender);
        assert!(matches!(result, Err(CryptoError::InvalidNonce)));
    }

    #[test]
    fn test_rejects_small_order_public_key() {
        let sender = KeyPair::generate();
        let result = derive_transmission_keys(&sender, &[0u8; 32], &[1u8; 24], Role::Sender);
        assert!(matches!(result, Err(CryptoError::InvalidPublicKey)));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let sender = KeyPair::generate();
        let recipient = KeyPair::generate();
        let ring =
            derive_transmission_keys(&sender, &recipient.public_bytes(), &[1u8; 24], Role::Sender)
                .unwrap();
        assert!(format!("{ring:?}").contains("[REDACTED]"));
    }
}
