//! What a transfer carries: files and text messages.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hush_core::ItemType;
use tokio::io::AsyncRead;
use zeroize::Zeroizing;

/// zstd level used for compressible items
pub const COMPRESSION_LEVEL: i32 = 3;

pub type PlaintextReader = Box<dyn AsyncRead + Send + Unpin>;

/// Capabilities the upload handler needs from an item.
#[async_trait]
pub trait TransferItem: Send + Sync {
    fn item_type(&self) -> ItemType;

    /// Whether the plaintext is worth compressing before encryption
    fn compress(&self) -> bool {
        false
    }

    /// Plaintext size in bytes
    async fn compute_size(&self) -> io::Result<u64>;

    async fn stream_plaintext(&self) -> io::Result<PlaintextReader>;
}

#[derive(Debug, Clone)]
pub struct FileItem {
    path: PathBuf,
}

impl FileItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TransferItem for FileItem {
    fn item_type(&self) -> ItemType {
        ItemType::File
    }

    async fn compute_size(&self) -> io::Result<u64> {
        let meta = tokio::fs::metadata(&self.path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", self.path.display()),
            ));
        }
        Ok(meta.len())
    }

    async fn stream_plaintext(&self) -> io::Result<PlaintextReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }
}

pub struct MessageItem {
    text: Zeroizing<String>,
}

impl MessageItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Zeroizing::new(text.into()),
        }
    }
}

impl std::fmt::Debug for MessageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageItem")
            .field("len", &self.text.len())
            .finish()
    }
}

#[async_trait]
impl TransferItem for MessageItem {
    fn item_type(&self) -> ItemType {
        ItemType::Message
    }

    fn compress(&self) -> bool {
        true
    }

    async fn compute_size(&self) -> io::Result<u64> {
        Ok(self.text.len() as u64)
    }

    async fn stream_plaintext(&self) -> io::Result<PlaintextReader> {
        Ok(Box::new(io::Cursor::new(self.text.as_bytes().to_vec())))
    }
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::encode_all(data, COMPRESSION_LEVEL)
}

/// Decompress a zstd stream, refusing to produce more than `limit` bytes.
pub fn decompress_bounded(data: &[u8], limit: u64) -> io::Result<Zeroizing<Vec<u8>>> {
    let decoder = zstd::stream::read::Decoder::new(data)?;
    let mut out = Zeroizing::new(Vec::new());
    decoder.take(limit.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}
