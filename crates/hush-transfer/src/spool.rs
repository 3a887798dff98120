//! Ciphertext staging between encryption and upload (and between fetch and
//! decryption).
//!
//! Bytes are kept in memory up to a limit and spill to an anonymous temp
//! file beyond it. A BLAKE3 digest of everything written is accumulated on
//! the way in.

use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, BufReader, ReadBuf};

enum Backing {
    Memory(Vec<u8>),
    File { file: File, path: TempPath },
}

pub struct CipherSpool {
    backing: Backing,
    len: u64,
    memory_limit: u64,
    hasher: blake3::Hasher,
}

impl CipherSpool {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            len: 0,
            memory_limit,
            hasher: blake3::Hasher::new(),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        let new_len = self.len + bytes.len() as u64;

        if let Backing::Memory(buf) = &mut self.backing {
            if new_len <= self.memory_limit {
                buf.extend_from_slice(bytes);
                self.len = new_len;
                return Ok(());
            }
            let (std_file, path) = tempfile::NamedTempFile::new()?.into_parts();
            let mut file = File::from_std(std_file);
            file.write_all(buf).await?;
            tracing::debug!(
                buffered = buf.len(),
                limit = self.memory_limit,
                "spool spilled to temp file"
            );
            self.backing = Backing::File { file, path };
        }

        if let Backing::File { file, .. } = &mut self.backing {
            file.write_all(bytes).await?;
        }
        self.len = new_len;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    /// BLAKE3 digest of everything written so far.
    pub fn digest(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }

    /// Read everything back from the start.
    pub async fn into_reader(self) -> io::Result<SpoolReader> {
        match self.backing {
            Backing::Memory(buf) => Ok(SpoolReader::Memory(Cursor::new(buf))),
            Backing::File { mut file, path } => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(SpoolReader::File(BufReader::new(file), path))
            }
        }
    }
}

impl std::fmt::Debug for CipherSpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSpool")
            .field("len", &self.len)
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Reader over a finished spool. The temp file, if any, is removed on drop.
pub enum SpoolReader {
    Memory(Cursor<Vec<u8>>),
    File(BufReader<File>, TempPath),
}

impl AsyncRead for SpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SpoolReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            SpoolReader::File(reader, _) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}
