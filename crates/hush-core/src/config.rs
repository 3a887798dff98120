use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HushError, HushResult};

/// Upper bound on a single plaintext window
pub const MAX_READ_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Bytes every cipher chunk adds to its plaintext (length prefix + tag)
pub const CHUNK_OVERHEAD: usize = 20;

/// Top-level configuration (loaded from hush.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HushConfig {
    pub transfer: TransferConfig,
    pub crypto: CryptoConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl HushConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> HushResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| HushError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HushResult<()> {
        self.transfer.validate()?;
        self.crypto.validate()
    }
}

/// Transfer pipeline tuning: chunking, padding and multipart scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Ciphertext spooled in memory up to this size, spilled to a temp file
    /// beyond it. Also the largest part a single request may carry.
    #[serde(alias = "MaximumUploadBufferSizeMB")]
    pub maximum_upload_buffer_size_mb: u64,
    /// Upper bound on cipher chunks per part request
    #[serde(alias = "MaximumMultipartReadBlocks")]
    pub maximum_multipart_read_blocks: u32,
    /// Cipher chunks per part request before any latency sample exists
    #[serde(alias = "InitialMultipartReadBlocks")]
    pub initial_multipart_read_blocks: u32,
    /// Concurrent part requests per upload
    #[serde(alias = "MaximumMultipartParallelism")]
    pub maximum_multipart_parallelism: usize,
    /// Request duration the scheduler steers towards
    #[serde(alias = "TargetMultipartUploadMilliseconds")]
    pub target_multipart_upload_milliseconds: u64,
    /// Plaintext window size in bytes
    #[serde(alias = "MaxReadSize")]
    pub max_read_size: usize,
    /// Final-chunk padding bucket in bytes (0 disables padding)
    #[serde(alias = "PadSize")]
    pub pad_size: usize,
    /// Default transfer lifetime
    pub lifetime_hours: u32,
    /// Longest lifetime a sender may request
    pub max_lifetime_hours: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            maximum_upload_buffer_size_mb: 64,
            maximum_multipart_read_blocks: 64,
            initial_multipart_read_blocks: 4,
            maximum_multipart_parallelism: 4,
            target_multipart_upload_milliseconds: 2000,
            max_read_size: 64 * 1024,
            pad_size: 256,
            lifetime_hours: 72,
            max_lifetime_hours: 168,
        }
    }
}

impl TransferConfig {
    pub fn upload_buffer_bytes(&self) -> u64 {
        self.maximum_upload_buffer_size_mb.saturating_mul(1024 * 1024)
    }

    /// Largest cipher chunk this client produces or accepts, padding included.
    pub fn max_chunk_len(&self) -> usize {
        self.max_read_size
            .saturating_add(self.pad_size)
            .saturating_add(CHUNK_OVERHEAD)
    }

    pub fn validate(&self) -> HushResult<()> {
        if self.maximum_upload_buffer_size_mb == 0 {
            return Err(HushError::Config(
                "transfer.maximum_upload_buffer_size_mb must be at least 1".into(),
            ));
        }
        if self.maximum_multipart_read_blocks == 0 {
            return Err(HushError::Config(
                "transfer.maximum_multipart_read_blocks must be at least 1".into(),
            ));
        }
        if self.initial_multipart_read_blocks == 0
            || self.initial_multipart_read_blocks > self.maximum_multipart_read_blocks
        {
            return Err(HushError::Config(format!(
                "transfer.initial_multipart_read_blocks must be in 1..={}",
                self.maximum_multipart_read_blocks
            )));
        }
        if self.maximum_multipart_parallelism == 0 {
            return Err(HushError::Config(
                "transfer.maximum_multipart_parallelism must be at least 1".into(),
            ));
        }
        if self.target_multipart_upload_milliseconds == 0 {
            return Err(HushError::Config(
                "transfer.target_multipart_upload_milliseconds must be positive".into(),
            ));
        }
        if self.max_read_size == 0 || self.max_read_size > MAX_READ_SIZE_LIMIT {
            return Err(HushError::Config(format!(
                "transfer.max_read_size must be in 1..={MAX_READ_SIZE_LIMIT}"
            )));
        }
        if self.pad_size > self.max_read_size {
            return Err(HushError::Config(
                "transfer.pad_size must not exceed transfer.max_read_size".into(),
            ));
        }
        let largest_chunk = self.max_chunk_len() as u64;
        if largest_chunk > self.upload_buffer_bytes() {
            return Err(HushError::Config(
                "transfer.max_read_size plus padding must fit in the upload buffer".into(),
            ));
        }
        if self.lifetime_hours == 0 || self.lifetime_hours > self.max_lifetime_hours {
            return Err(HushError::Config(format!(
                "transfer.lifetime_hours must be in 1..={}",
                self.max_lifetime_hours
            )));
        }
        Ok(())
    }
}

/// Password hashing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Password version new hashes are produced with
    pub latest_password_version: u32,
    /// Argon2id memory cost in KiB for the latest version (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            latest_password_version: 2,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl CryptoConfig {
    pub fn validate(&self) -> HushResult<()> {
        if self.latest_password_version == 0 {
            return Err(HushError::Config(
                "crypto.latest_password_version starts at 1".into(),
            ));
        }
        if self.argon2_time_cost == 0 || self.argon2_parallelism == 0 {
            return Err(HushError::Config(
                "crypto.argon2_time_cost and crypto.argon2_parallelism must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Which OpenDAL service backs the transfer store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the fs backend, key prefix for s3
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Largest ciphertext a single transfer may store, in MB (0 = unlimited)
    pub quota_mb: u64,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("~/.local/share/hush/store"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "hush".into(),
            quota_mb: 2048,
            enforce_tls: false,
        }
    }
}

impl StorageConfig {
    pub fn quota_bytes(&self) -> Option<u64> {
        (self.quota_mb > 0).then(|| self.quota_mb.saturating_mul(1024 * 1024))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[transfer]
maximum_upload_buffer_size_mb = 32
maximum_multipart_read_blocks = 128
initial_multipart_read_blocks = 8
maximum_multipart_parallelism = 6
target_multipart_upload_milliseconds = 1500
max_read_size = 131072
pad_size = 512
lifetime_hours = 24

[crypto]
latest_password_version = 3
argon2_mem_cost_kib = 131072

[storage]
backend = "s3"
endpoint = "https://s3.example.com:8333"
bucket = "drops"
quota_mb = 0
enforce_tls = true

[logging]
level = "debug"
format = "json"
"#;
        let config: HushConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.transfer.maximum_upload_buffer_size_mb, 32);
        assert_eq!(config.transfer.maximum_multipart_read_blocks, 128);
        assert_eq!(config.transfer.initial_multipart_read_blocks, 8);
        assert_eq!(config.transfer.maximum_multipart_parallelism, 6);
        assert_eq!(config.transfer.max_read_size, 131072);
        assert_eq!(config.transfer.pad_size, 512);
        assert_eq!(config.crypto.latest_password_version, 3);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.quota_bytes(), None);
        assert!(config.storage.enforce_tls);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: HushConfig = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.transfer.max_read_size, 64 * 1024);
        assert_eq!(config.transfer.pad_size, 256);
        assert_eq!(config.transfer.initial_multipart_read_blocks, 4);
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.storage.quota_bytes(), Some(2048 * 1024 * 1024));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_pascal_case_aliases() {
        let toml_str = r#"
[transfer]
MaximumUploadBufferSizeMB = 16
MaximumMultipartReadBlocks = 10
InitialMultipartReadBlocks = 2
MaximumMultipartParallelism = 3
TargetMultipartUploadMilliseconds = 750
MaxReadSize = 4096
PadSize = 64
"#;
        let config: HushConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.transfer.maximum_upload_buffer_size_mb, 16);
        assert_eq!(config.transfer.maximum_multipart_read_blocks, 10);
        assert_eq!(config.transfer.initial_multipart_read_blocks, 2);
        assert_eq!(config.transfer.maximum_multipart_parallelism, 3);
        assert_eq!(config.transfer.target_multipart_upload_milliseconds, 750);
        assert_eq!(config.transfer.max_read_size, 4096);
        assert_eq!(config.transfer.pad_size, 64);
    }

    #[test]
    fn test_validate_rejects_initial_above_max() {
        let config = TransferConfig {
            initial_multipart_read_blocks: 10,
            maximum_multipart_read_blocks: 5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial_multipart_read_blocks"));
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = TransferConfig {
            maximum_multipart_parallelism: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_padding() {
        let config = TransferConfig {
            max_read_size: 1024,
            pad_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = HushConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.transfer.lifetime_hours, 72);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hush.toml");
        std::fs::write(&path, "[transfer]\nmaximum_multipart_parallelism = 0\n").unwrap();

        let err = HushConfig::load(&path).unwrap_err();
        assert!(matches!(err, HushError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = HushConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HushConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.transfer.max_read_size, parsed.transfer.max_read_size);
        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.storage.backend, parsed.storage.backend);
    }
}
