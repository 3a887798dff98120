use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid nonce")]
    InvalidNonce,

    /// Any authentication failure: chunk MAC, signature, digest, key unwrap,
    /// recovery proof. Deliberately carries no detail.
    #[error("cannot decrypt")]
    Verification,

    #[error("invalid stream options: {0}")]
    InvalidOptions(String),

    #[error("encryption failed")]
    Encryption,

    #[error("stream already finished")]
    StreamFinished,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("unknown password version {0}")]
    UnknownPasswordVersion(u32),

    #[error("invalid recovery phrase")]
    InvalidMnemonic,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// True for failures that must never be retried.
    pub fn is_verification(&self) -> bool {
        matches!(self, CryptoError::Verification)
    }
}

/// Check that a slice is exactly `N` bytes long.
pub fn fixed<const N: usize>(bytes: &[u8]) -> CryptoResult<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        actual: bytes.len(),
    })
}
