//! hush: hushdrop command-line client
//!
//! Commands:
//!   keygen                 - create a password-protected identity file
//!   send-file <path>       - encrypt and upload a file
//!   send-message <text>    - encrypt and upload a text message
//!   preview <id>           - show the verified envelope of a transfer
//!   receive <id>           - download and decrypt a transfer
//!   recovery-key           - print the recovery words of an identity
//!   health                 - check the storage backend is reachable
//!   config show            - display current configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hush_core::config::HushConfig;
use hush_core::encoding::{decode_array, encode};
use hush_core::ItemType;
use hush_crypto::KeyPair;
use hush_storage::{build_operator, check_health, OpendalStore, S3Credentials, StoreLimits};
use hush_transfer::{
    policy_from_config, AccountDirectory, AccountService, FileItem, InMemoryAccountDirectory,
    MessageItem, PasswordVersionStatus, RecipientInfo, SenderInfo, TransferFactory, TransferItem,
    UserKeys, UserRecord,
};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "hush",
    version,
    about = "hushdrop end-to-end encrypted transfers",
    long_about = "hush: send files and messages that only the recipient can decrypt"
)]
struct Cli {
    /// Path to hush.toml configuration file
    #[arg(long, short = 'c', env = "HUSH_CONFIG", default_value = "hush.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(long, env = "HUSH_LOG")]
    log: Option<String>,

    /// Log format; overrides [logging] format
    #[arg(long, env = "HUSH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account identity: fresh key pairs wrapped under a password
    ///
    /// The password is read from HUSH_PASSWORD or prompted for.
    Keygen {
        #[arg(long, short = 'u')]
        username: String,
        /// Where to write the identity file
        #[arg(long, short = 'i', env = "HUSH_IDENTITY", default_value = "identity.json")]
        identity: PathBuf,
    },

    /// Encrypt and upload a file
    #[command(name = "send-file")]
    SendFile {
        path: PathBuf,
        #[command(flatten)]
        send: SendArgs,
    },

    /// Encrypt and upload a text message
    #[command(name = "send-message")]
    SendMessage {
        text: String,
        #[command(flatten)]
        send: SendArgs,
    },

    /// Show the verified envelope of a transfer
    Preview { id: Uuid },

    /// Download and decrypt a transfer
    Receive {
        id: Uuid,
        /// Recipient private key (base64), as printed by send-* for anonymous recipients
        #[arg(long, env = "HUSH_RECIPIENT_KEY", conflicts_with = "identity")]
        key: Option<String>,
        /// Identity file of a registered recipient
        #[arg(long, short = 'i', env = "HUSH_IDENTITY")]
        identity: Option<PathBuf>,
        /// Destination for file transfers (default: ./<id>)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// Print the recovery words of an identity
    #[command(name = "recovery-key")]
    RecoveryKey {
        #[arg(long, short = 'i', env = "HUSH_IDENTITY", default_value = "identity.json")]
        identity: PathBuf,
    },

    /// Check the storage backend is reachable
    Health,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    /// Recipient X25519 public key (base64); omitted: issue an ephemeral key
    #[arg(long)]
    to: Option<String>,
    /// Send as the registered user of this identity instead of anonymously
    #[arg(long, short = 'i')]
    identity: Option<PathBuf>,
    /// Hours until the transfer expires (default: [transfer] lifetime_hours)
    #[arg(long)]
    hours: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HushConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        backend = ?config.storage.backend,
        "hush starting"
    );

    match cli.command {
        Commands::Keygen { username, identity } => cmd_keygen(&config, &username, &identity).await,
        Commands::SendFile { path, send } => {
            cmd_send(&config, Box::new(FileItem::new(path)), &send).await
        }
        Commands::SendMessage { text, send } => {
            cmd_send(&config, Box::new(MessageItem::new(text)), &send).await
        }
        Commands::Preview { id } => cmd_preview(&config, id).await,
        Commands::Receive {
            id,
            key,
            identity,
            out,
        } => cmd_receive(&config, id, key.as_deref(), identity.as_deref(), out).await,
        Commands::RecoveryKey { identity } => cmd_recovery_key(&config, &identity).await,
        Commands::Health => cmd_health(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared plumbing ───────────────────────────────────────────────────────────

fn open_store(config: &HushConfig) -> Result<Arc<OpendalStore>> {
    let credentials = S3Credentials::from_env();
    let op = build_operator(&config.storage, credentials.as_ref())
        .context("building storage operator")?;
    Ok(Arc::new(OpendalStore::new(op, StoreLimits::from_config(config))))
}

fn factory(
    config: &HushConfig,
    directory: Arc<InMemoryAccountDirectory>,
) -> Result<TransferFactory<OpendalStore>> {
    Ok(TransferFactory::new(
        open_store(config)?,
        config.transfer.clone(),
        directory,
    ))
}

/// Account material kept on disk between invocations
#[derive(Debug, Serialize, Deserialize)]
struct Identity {
    username: String,
    record: UserRecord,
}

impl Identity {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing identity: {}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serializing identity")?;
        std::fs::write(path, json).with_context(|| format!("writing identity: {}", path.display()))
    }
}

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(password) = std::env::var("HUSH_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(password))
}

/// Unlock an identity file, rewriting it if the password hash was migrated.
async fn unlock(
    config: &HushConfig,
    path: &Path,
    directory: &Arc<InMemoryAccountDirectory>,
) -> Result<UserKeys> {
    let identity = Identity::load(path)?;
    directory
        .create_user(&identity.username, identity.record.clone())
        .await?;
    let accounts = AccountService::new(directory.clone(), policy_from_config(&config.crypto));

    let password = read_password(&format!("password for {}: ", identity.username))?;
    let login = accounts
        .login(&identity.username, &password)
        .await
        .context("unlocking identity")?;

    if let PasswordVersionStatus::MigrationRequired { from, to } = login.status {
        let record = directory.load_user(&identity.username).await?;
        Identity {
            username: identity.username.clone(),
            record,
        }
        .save(path)?;
        println!("password hash upgraded (v{from} -> v{to}); identity rewritten");
        if let Some(recovery) = &login.new_recovery_key {
            println!("your recovery words changed:");
            println!("  {}", recovery.to_mnemonic()?.as_str());
        }
    }
    Ok(login.keys)
}

fn parse_key(b64: &str, what: &str) -> Result<[u8; 32]> {
    decode_array::<32>(b64.trim()).map_err(|e| anyhow::anyhow!("invalid {what}: {e}"))
}

fn make_spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .context("progress template")?,
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_keygen(config: &HushConfig, username: &str, path: &Path) -> Result<()> {
    if path.exists() {
        bail!("identity already exists: {}", path.display());
    }
    let password = read_password("new password: ")?;

    let directory = Arc::new(InMemoryAccountDirectory::new(
        config.crypto.latest_password_version,
    ));
    let accounts = AccountService::new(directory.clone(), policy_from_config(&config.crypto));
    let (keys, recovery) = accounts.register(username, &password).await?;

    let record = directory.load_user(&keys.username).await?;
    Identity {
        username: keys.username.clone(),
        record,
    }
    .save(path)?;

    println!("identity:    {}", path.display());
    println!("username:    {}", keys.username);
    println!("public key:  {}", encode(&keys.key_pair.public_bytes()));
    println!();
    println!("recovery words (store them offline, they are shown once):");
    println!("  {}", recovery.to_mnemonic()?.as_str());
    Ok(())
}

async fn cmd_send(config: &HushConfig, item: Box<dyn TransferItem>, args: &SendArgs) -> Result<()> {
    let directory = Arc::new(InMemoryAccountDirectory::new(
        config.crypto.latest_password_version,
    ));
    let sender = match &args.identity {
        Some(path) => SenderInfo::User(unlock(config, path, &directory).await?),
        None => SenderInfo::Anonymous,
    };
    let recipient = match &args.to {
        Some(b64) => RecipientInfo::PublicKey(parse_key(b64, "recipient key")?),
        None => RecipientInfo::Anonymous,
    };

    let size = item.compute_size().await.context("reading item")?;
    let factory = factory(config, directory)?;
    let mut upload = factory.upload_handler(item);
    if let Some(hours) = args.hours {
        upload.with_expiration_hours(hours)?;
    }
    upload.set_sender_info(sender)?;
    upload.set_recipient_info(recipient).await?;

    let pb = make_spinner("send")?;
    pb.set_message(format!("encrypting {}", fmt_bytes(size)));
    let pb_clone = pb.clone();
    upload.set_progress(Box::new(move |done, total, msg| {
        pb_clone.set_message(format!("{} / {} ({msg})", fmt_bytes(done), fmt_bytes(total)));
    }));

    let receipt = match upload.upload().await {
        Ok(receipt) => receipt,
        Err(e) => {
            pb.finish_and_clear();
            return Err(hush_core::HushError::from(e).into());
        }
    };
    pb.finish_with_message("done".to_string());

    println!("transfer:    {}", receipt.transfer_id);
    println!("expires at:  {} (unix)", receipt.expires_at);
    println!("ciphertext:  {}", fmt_bytes(receipt.summary.bytes));
    println!("parts:       {}", receipt.summary.parts);
    if let Some(private) = &receipt.ephemeral_recipient_key {
        println!();
        println!("recipient key (deliver out of band, it is not stored anywhere):");
        println!("  {}", encode(private.as_slice()));
    }
    Ok(())
}

async fn cmd_preview(config: &HushConfig, id: Uuid) -> Result<()> {
    let factory = factory(config, Arc::new(InMemoryAccountDirectory::default()))?;
    let mut download = factory.download_handler(id);
    let envelope = download
        .fetch_preview()
        .await
        .map_err(hush_core::HushError::from)?;

    println!("transfer:    {}", envelope.id);
    println!("item:        {:?}", envelope.item_type);
    println!("sender:      {:?} {}", envelope.user_type, encode(&envelope.sender_public_key));
    println!("expires in:  {}h after upload", envelope.expiration_hours);
    println!("ciphertext:  {} in {} chunks", fmt_bytes(envelope.ciphertext_size), envelope.chunk_count);
    println!("compressed:  {}", envelope.compressed);
    println!("signature:   valid");
    Ok(())
}

async fn cmd_receive(
    config: &HushConfig,
    id: Uuid,
    key: Option<&str>,
    identity: Option<&Path>,
    out: Option<PathBuf>,
) -> Result<()> {
    let directory = Arc::new(InMemoryAccountDirectory::new(
        config.crypto.latest_password_version,
    ));
    let recipient = match (key, identity) {
        (Some(b64), _) => KeyPair::from_private_bytes(parse_key(b64, "recipient key")?),
        (None, Some(path)) => unlock(config, path, &directory).await?.key_pair,
        (None, None) => bail!("pass --key or --identity"),
    };

    let factory = factory(config, directory)?;
    let mut download = factory.download_handler(id);
    let envelope = download
        .fetch_preview()
        .await
        .map_err(hush_core::HushError::from)?;
    download.set_recipient_info(&recipient)?;

    match envelope.item_type {
        ItemType::Message => {
            let text = download
                .receive_message()
                .await
                .map_err(hush_core::HushError::from)?;
            println!("{text}");
        }
        ItemType::File => {
            let dest = out.unwrap_or_else(|| PathBuf::from(id.to_string()));
            let pb = make_spinner("receive")?;
            pb.set_message(format!("{} → {}", fmt_bytes(envelope.ciphertext_size), dest.display()));
            let result = download.receive_file(&dest).await;
            pb.finish_and_clear();
            let written = result.map_err(hush_core::HushError::from)?;
            println!("received {} → {}", fmt_bytes(written), dest.display());
        }
    }
    Ok(())
}

async fn cmd_recovery_key(config: &HushConfig, path: &Path) -> Result<()> {
    let identity = Identity::load(path)?;
    let directory = Arc::new(InMemoryAccountDirectory::new(
        config.crypto.latest_password_version,
    ));
    directory
        .create_user(&identity.username, identity.record)
        .await?;
    let accounts = AccountService::new(directory, policy_from_config(&config.crypto));

    let password = read_password(&format!("password for {}: ", identity.username))?;
    let recovery = accounts
        .recovery_key(&identity.username, &password)
        .await
        .map_err(hush_core::HushError::from)?;
    println!("{}", recovery.to_mnemonic()?.as_str());
    Ok(())
}

async fn cmd_health(config: &HushConfig) -> Result<()> {
    let credentials = S3Credentials::from_env();
    let op = build_operator(&config.storage, credentials.as_ref())
        .context("building storage operator")?;
    check_health(&op)
        .await
        .with_context(|| format!("{:?} backend unreachable", config.storage.backend))?;
    println!("storage: ok ({:?})", config.storage.backend);
    Ok(())
}

fn cmd_config_show(config: &HushConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
