//! Chunked XChaCha20-Poly1305 stream cipher.
//!
//! A payload is cut into plaintext windows of `max_read_size` bytes and every
//! window becomes one cipher chunk:
//!
//! ```text
//! chunk[i] = XChaCha20-Poly1305(
//!     key   = transmission key,
//!     nonce = 0^16 ‖ u64_be(i),
//!     aad   = u64_be(i) ‖ final_flag,
//!     msg   = u32_be(pad_len) ‖ data ‖ random[pad_len],
//! )
//! ```
//!
//! Only the final chunk is padded, up to the next multiple of `pad_size`.
//! Because the index and the final flag are authenticated, reordering,
//! dropping, truncating or extending the chunk sequence fails verification.
//! Every chunk but the last holds exactly `max_read_size` bytes of data, so
//! a receiver can re-split a concatenated ciphertext with [`ChunkReader`].

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Size of the authenticated pad-length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Bytes a chunk adds on top of its data and padding
pub const CHUNK_OVERHEAD: usize = LENGTH_PREFIX_SIZE + TAG_SIZE;

const _: () = assert!(CHUNK_OVERHEAD == hush_core::config::CHUNK_OVERHEAD);

/// Default plaintext window
pub const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;

/// Default padding bucket
pub const DEFAULT_PAD_SIZE: usize = 256;

/// Window and padding parameters of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub max_read_size: usize,
    /// 0 disables padding
    pub pad_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_read_size: DEFAULT_MAX_READ_SIZE,
            pad_size: DEFAULT_PAD_SIZE,
        }
    }
}

impl StreamOptions {
    pub fn new(max_read_size: usize, pad_size: usize) -> CryptoResult<Self> {
        if max_read_size == 0 || max_read_size > u32::MAX as usize - CHUNK_OVERHEAD {
            return Err(CryptoError::InvalidOptions(format!(
                "max_read_size out of range: {max_read_size}"
            )));
        }
        if pad_size > u32::MAX as usize {
            return Err(CryptoError::InvalidOptions(format!(
                "pad_size out of range: {pad_size}"
            )));
        }
        Ok(Self {
            max_read_size,
            pad_size,
        })
    }

    /// Ciphertext length of every chunk except the last.
    pub fn chunk_size(&self) -> usize {
        self.max_read_size + CHUNK_OVERHEAD
    }

    /// Upper bound on the length of any chunk, the last included.
    pub fn max_chunk_len(&self) -> usize {
        self.max_read_size + self.pad_size.saturating_sub(1) + CHUNK_OVERHEAD
    }
}

/// Number of padding bytes appended to a final chunk holding `len` bytes.
pub fn pad_len(len: usize, pad_size: usize) -> usize {
    if pad_size == 0 {
        return 0;
    }
    (pad_size - len % pad_size) % pad_size
}

fn chunk_nonce(index: u64) -> XNonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&index.to_be_bytes());
    XNonce::from(nonce)
}

fn chunk_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(last);
    aad
}

/// Encrypts chunks in order under one transmission key.
pub struct StreamEncryptor {
    cipher: XChaCha20Poly1305,
    index: u64,
    pad_size: usize,
    finished: bool,
}

impl StreamEncryptor {
    pub fn new(key: &[u8; KEY_SIZE], pad_size: usize) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
            index: 0,
            pad_size,
            finished: false,
        }
    }

    /// Encrypt the next window. Once a chunk with `last = true` has been
    /// produced the stream is closed.
    pub fn encrypt_chunk(&mut self, data: &[u8], last: bool) -> CryptoResult<Vec<u8>> {
        if self.finished {
            return Err(CryptoError::StreamFinished);
        }

        let pad = if last { pad_len(data.len(), self.pad_size) } else { 0 };
        let pad_prefix = u32::try_from(pad).map_err(|_| CryptoError::Encryption)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(LENGTH_PREFIX_SIZE + data.len() + pad));
        plaintext.extend_from_slice(&pad_prefix.to_be_bytes());
        plaintext.extend_from_slice(data);
        let data_end = plaintext.len();
        plaintext.resize(data_end + pad, 0);
        OsRng.fill_bytes(&mut plaintext[data_end..]);

        let ciphertext = self
            .cipher
            .encrypt(
                &chunk_nonce(self.index),
                Payload {
                    msg: &plaintext,
                    aad: &chunk_aad(self.index, last),
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        self.index = self.index.checked_add(1).ok_or(CryptoError::Encryption)?;
        self.finished = last;
        Ok(ciphertext)
    }

    pub fn chunks_written(&self) -> u64 {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Decrypts chunks in order under one transmission key.
///
/// Every failure is reported as [`CryptoError::Verification`]; the caller
/// must discard any plaintext already produced by this stream.
pub struct StreamDecryptor {
    cipher: XChaCha20Poly1305,
    index: u64,
    finished: bool,
}

impl StreamDecryptor {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
            index: 0,
            finished: false,
        }
    }

    pub fn decrypt_chunk(&mut self, chunk: &[u8], last: bool) -> CryptoResult<Vec<u8>> {
        if self.finished {
            tracing::debug!(index = self.index, "chunk after final chunk");
            return Err(CryptoError::Verification);
        }
        if chunk.len() < CHUNK_OVERHEAD {
            tracing::debug!(index = self.index, len = chunk.len(), "chunk too short");
            return Err(CryptoError::Verification);
        }

        let mut plaintext = self
            .cipher
            .decrypt(
                &chunk_nonce(self.index),
                Payload {
                    msg: chunk,
                    aad: &chunk_aad(self.index, last),
                },
            )
            .map_err(|_| {
                tracing::debug!(index = self.index, last, "chunk authentication failed");
                CryptoError::Verification
            })?;

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&plaintext[..LENGTH_PREFIX_SIZE]);
        let pad = u32::from_be_bytes(prefix) as usize;
        let body_len = plaintext.len() - LENGTH_PREFIX_SIZE;
        if pad > body_len || (!last && pad != 0) {
            tracing::debug!(index = self.index, pad, "invalid padding");
            return Err(CryptoError::Verification);
        }

        plaintext.truncate(plaintext.len() - pad);
        plaintext.drain(..LENGTH_PREFIX_SIZE);

        self.index += 1;
        self.finished = last;
        Ok(plaintext)
    }

    /// Fails unless the final chunk has been seen.
    pub fn finish(&self) -> CryptoResult<()> {
        if !self.finished {
            tracing::debug!(chunks = self.index, "stream ended without final chunk");
            return Err(CryptoError::Verification);
        }
        Ok(())
    }

    pub fn chunks_read(&self) -> u64 {
        self.index
    }
}

/// One chunk produced by [`EncryptingReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    pub index: u64,
    pub last: bool,
    pub bytes: Vec<u8>,
}

/// Pull-based encryptor over an async reader.
///
/// Reads one byte ahead so a payload that is an exact multiple of the window
/// does not end with an empty chunk. An empty reader yields a single final
/// chunk.
pub struct EncryptingReader<R> {
    reader: R,
    encryptor: StreamEncryptor,
    max_read_size: usize,
    carry: Option<u8>,
    plaintext_size: u64,
}

impl<R: AsyncRead + Unpin> EncryptingReader<R> {
    pub fn new(reader: R, key: &[u8; KEY_SIZE], options: StreamOptions) -> Self {
        Self {
            reader,
            encryptor: StreamEncryptor::new(key, options.pad_size),
            max_read_size: options.max_read_size,
            carry: None,
            plaintext_size: 0,
        }
    }

    pub async fn next_chunk(&mut self) -> CryptoResult<Option<EncryptedChunk>> {
        if self.encryptor.is_finished() {
            return Ok(None);
        }

        let mut window = Zeroizing::new(vec![0u8; self.max_read_size]);
        let mut filled = 0;
        if let Some(byte) = self.carry.take() {
            window[0] = byte;
            filled = 1;
        }
        while filled < self.max_read_size {
            let n = self.reader.read(&mut window[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        let last = if filled < self.max_read_size {
            true
        } else {
            let mut peek = [0u8; 1];
            if self.reader.read(&mut peek).await? == 0 {
                true
            } else {
                self.carry = Some(peek[0]);
                false
            }
        };

        let index = self.encryptor.chunks_written();
        let bytes = self.encryptor.encrypt_chunk(&window[..filled], last)?;
        self.plaintext_size += filled as u64;
        Ok(Some(EncryptedChunk { index, last, bytes }))
    }

    pub fn plaintext_size(&self) -> u64 {
        self.plaintext_size
    }
}

/// Totals reported by the async drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub chunk_count: u64,
    pub plaintext_size: u64,
    pub ciphertext_size: u64,
}

/// Encrypt everything `reader` yields and write the concatenated chunks to
/// `sink`.
pub async fn encrypt_reader<R, W>(
    reader: R,
    key: &[u8; KEY_SIZE],
    options: StreamOptions,
    sink: &mut W,
) -> CryptoResult<StreamSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut source = EncryptingReader::new(reader, key, options);
    let mut summary = StreamSummary::default();
    while let Some(chunk) = source.next_chunk().await? {
        sink.write_all(&chunk.bytes).await?;
        summary.chunk_count += 1;
        summary.ciphertext_size += chunk.bytes.len() as u64;
    }
    sink.flush().await?;
    summary.plaintext_size = source.plaintext_size();
    Ok(summary)
}

/// Re-splits a concatenated ciphertext into its chunks using the framing
/// recorded at upload time.
///
/// Every chunk but the last is `chunk_size` bytes; the last one takes
/// whatever `ciphertext_size` leaves. Short reads and trailing bytes are
/// verification failures.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    final_len: usize,
    remaining: u64,
    total_size: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(
        reader: R,
        chunk_size: usize,
        chunk_count: u64,
        ciphertext_size: u64,
    ) -> CryptoResult<Self> {
        let final_len = chunk_count
            .checked_sub(1)
            .and_then(|full| full.checked_mul(chunk_size as u64))
            .and_then(|head| ciphertext_size.checked_sub(head))
            .and_then(|tail| usize::try_from(tail).ok())
            .filter(|tail| *tail >= CHUNK_OVERHEAD && chunk_size >= CHUNK_OVERHEAD);

        let Some(final_len) = final_len else {
            tracing::debug!(chunk_size, chunk_count, ciphertext_size, "inconsistent framing");
            return Err(CryptoError::Verification);
        };

        Ok(Self {
            reader,
            chunk_size,
            final_len,
            remaining: chunk_count,
            total_size: ciphertext_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Next chunk and whether it is the final one.
    pub async fn next_chunk(&mut self) -> CryptoResult<Option<(Vec<u8>, bool)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let last = self.remaining == 1;
        let len = if last { self.final_len } else { self.chunk_size };

        let mut chunk = vec![0u8; len];
        self.reader.read_exact(&mut chunk).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                tracing::debug!("ciphertext shorter than its framing");
                CryptoError::Verification
            } else {
                CryptoError::Io(e)
            }
        })?;

        if last {
            let mut trailing = [0u8; 1];
            if self.reader.read(&mut trailing).await? != 0 {
                tracing::debug!("ciphertext longer than its framing");
                return Err(CryptoError::Verification);
            }
        }

        self.remaining -= 1;
        Ok(Some((chunk, last)))
    }
}

/// Decrypts chunks into an async writer.
pub struct DecryptingWriter<W> {
    writer: W,
    decryptor: StreamDecryptor,
    written: u64,
}

impl<W: AsyncWrite + Unpin> DecryptingWriter<W> {
    pub fn new(writer: W, key: &[u8; KEY_SIZE]) -> Self {
        Self {
            writer,
            decryptor: StreamDecryptor::new(key),
            written: 0,
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8], last: bool) -> CryptoResult<()> {
        let plaintext = Zeroizing::new(self.decryptor.decrypt_chunk(chunk, last)?);
        self.writer.write_all(&plaintext).await?;
        self.written += plaintext.len() as u64;
        Ok(())
    }

    /// Check the stream was complete and flush. Returns the writer and the
    /// number of plaintext bytes written.
    pub async fn finish(mut self) -> CryptoResult<(W, u64)> {
        self.decryptor.finish()?;
        self.writer.flush().await?;
        Ok((self.writer, self.written))
    }
}

/// Decrypt every chunk of `chunks` into `writer`.
///
/// Whatever reached `writer` is untrusted until this returns `Ok`.
pub async fn decrypt_chunks<R, W>(
    chunks: &mut ChunkReader<R>,
    key: &[u8; KEY_SIZE],
    writer: W,
) -> CryptoResult<(W, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = DecryptingWriter::new(writer, key);
    while let Some((chunk, last)) = chunks.next_chunk().await? {
        sink.write_chunk(&chunk, last).await?;
    }
    sink.finish().await
}

/// Encrypt an in-memory payload into separate chunks.
pub fn encrypt_all(
    key: &[u8; KEY_SIZE],
    data: &[u8],
    options: StreamOptions,
) -> CryptoResult<Vec<Vec<u8>>> {
    let mut encryptor = StreamEncryptor::new(key, options.pad_size);
    if data.is_empty() {
        return Ok(vec![encryptor.encrypt_chunk(&[], true)?]);
    }

    let windows: Vec<&[u8]> = data.chunks(options.max_read_size).collect();
    let total = windows.len();
    windows
        .into_iter()
        .enumerate()
        .map(|(i, window)| encryptor.encrypt_chunk(window, i + 1 == total))
        .collect()
}

/// Decrypt chunks produced by [`encrypt_all`] or [`encrypt_reader`].
pub fn decrypt_all<C: AsRef<[u8]>>(key: &[u8; KEY_SIZE], chunks: &[C]) -> CryptoResult<Vec<u8>> {
    let mut decryptor = StreamDecryptor::new(key);
    let mut out = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        out.extend_from_slice(&decryptor.decrypt_chunk(chunk.as_ref(), i + 1 == chunks.len())?);
    }
    decryptor.finish()?;
    Ok(out)
}
