//! hush-transfer: the client side of a hushdrop transfer
//!
//! - `handler`: upload/download state machines built by `TransferFactory`
//! - `scheduler`: adaptive multipart upload of ciphertext chunks
//! - `spool`: memory-then-tempfile ciphertext staging with a running digest
//! - `envelope`: Ed25519 envelope signing and pre-decryption checks
//! - `item`: the `TransferItem` capability trait, files and messages
//! - `account`: account key material, password migration and recovery

pub mod account;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handler;
pub mod item;
pub mod scheduler;
pub mod spool;

pub use account::{
    policy_from_config, AccountDirectory, AccountService, InMemoryAccountDirectory,
    LoginOutcome, PasswordVersionStatus, RecoveredAccount, UserKeys, UserRecord,
};
pub use error::{AccountError, SchedulerError, TransferError, TransferResult};
pub use events::EventSink;
pub use handler::{
    DownloadHandler, HandlerState, RecipientInfo, SenderInfo, TransferFactory, UploadHandler,
    UploadReceipt,
};
pub use item::{FileItem, MessageItem, TransferItem};
pub use scheduler::{
    ChunkSource, MultipartScheduler, ProgressFn, ScheduleParams, UploadScheduleState,
    UploadSummary,
};
pub use spool::CipherSpool;
