//! hush-core: shared types, configuration schema and error taxonomy for
//! the hushdrop transfer pipeline.

pub mod config;
pub mod encoding;
pub mod error;
pub mod types;

pub use error::{HushError, HushResult};
pub use types::{CoreEvent, FinalizedTransfer, ItemType, TransferEnvelope, UserType};
