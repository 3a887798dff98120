//! OpenDAL Operator factory for hushdrop storage backends

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hush_core::config::{StorageBackend, StorageConfig};
use opendal::Operator;

/// S3 access credentials, loaded by the caller (usually from the environment)
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok()?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok()?,
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// In-process store, used by tests and the `memory` backend.
pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}

/// Build an operator for the configured backend.
///
/// Network backends get a `RetryLayer`; retrying transient failures is the
/// storage layer's job, the upload scheduler never retries a part itself.
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an
/// error. Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_operator(cfg: &StorageConfig, credentials: Option<&S3Credentials>) -> Result<Operator> {
    match cfg.backend {
        StorageBackend::Memory => memory_operator(),
        StorageBackend::Fs => {
            let root = expand_home(&cfg.root);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating storage root {}", root.display()))?;
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            let op = Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        StorageBackend::S3 => {
            if cfg.endpoint.starts_with("http://") {
                if cfg.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                        cfg.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %cfg.endpoint,
                    "S3 endpoint uses plaintext HTTP; set storage.enforce_tls = true and use HTTPS in production"
                );
            }

            let credentials = credentials
                .context("S3 backend requires AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY")?;

            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let builder = opendal::services::S3::default()
                .root(&cfg.root.to_string_lossy())
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .access_key_id(&credentials.access_key_id)
                .secret_access_key(&credentials.secret_access_key);

            let op = Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish();
            Ok(op)
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
