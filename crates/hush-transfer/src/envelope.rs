//! Envelope signing and pre-decryption checks.

use hush_core::types::ENVELOPE_VERSION;
use hush_core::TransferEnvelope;
use hush_crypto::primitives::ct_eq;
use hush_crypto::{verify_signature, CryptoError, SigningKeyPair};

/// Sign `envelope` in place. The verifying key must already be the signer's.
pub fn sign_envelope(envelope: &mut TransferEnvelope, signer: &SigningKeyPair) {
    envelope.signature = Some(signer.sign(&envelope.signing_payload()));
}

/// Check the envelope is a version we understand and carries a valid
/// signature by its own verifying key.
pub fn verify_envelope(envelope: &TransferEnvelope) -> Result<(), CryptoError> {
    if envelope.version != ENVELOPE_VERSION {
        tracing::debug!(version = envelope.version, "unsupported envelope version");
        return Err(CryptoError::Verification);
    }
    let Some(signature) = envelope.signature.as_ref() else {
        tracing::debug!(transfer_id = %envelope.id, "envelope is unsigned");
        return Err(CryptoError::Verification);
    };
    verify_signature(
        &envelope.sender_verifying_key,
        &envelope.signing_payload(),
        signature,
    )
}

/// Compare the digest of the fetched ciphertext against the signed one.
pub fn check_digest(envelope: &TransferEnvelope, size: u64, digest: &[u8; 32]) -> Result<(), CryptoError> {
    if size != envelope.ciphertext_size || !ct_eq(digest, &envelope.ciphertext_digest) {
        tracing::debug!(
            transfer_id = %envelope.id,
            expected_size = envelope.ciphertext_size,
            actual_size = size,
            "ciphertext does not match envelope"
        );
        return Err(CryptoError::Verification);
    }
    Ok(())
}

/// Check the declared chunk framing stays within `max_chunk_len` for every
/// chunk, the final one included, so a receiver never buffers more than one
/// bounded chunk at a time.
pub fn check_framing(
    envelope: &TransferEnvelope,
    max_chunk_len: usize,
) -> Result<(), CryptoError> {
    let chunk_size = envelope.chunk_size as u64;
    let final_len = envelope
        .chunk_count
        .checked_sub(1)
        .and_then(|full| full.checked_mul(chunk_size))
        .and_then(|head| envelope.ciphertext_size.checked_sub(head));

    match final_len {
        Some(final_len)
            if chunk_size <= max_chunk_len as u64 && final_len <= max_chunk_len as u64 =>
        {
            Ok(())
        }
        _ => {
            tracing::debug!(
                chunk_size = envelope.chunk_size,
                chunk_count = envelope.chunk_count,
                ciphertext_size = envelope.ciphertext_size,
                max_chunk_len,
                "chunk framing exceeds the local limit"
            );
            Err(CryptoError::Verification)
        }
    }
}
