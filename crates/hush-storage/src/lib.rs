//! hush-storage: byte-level ciphertext store for hushdrop transfers
//!
//! The store only ever sees signed envelopes and ciphertext parts. Layout
//! under the operator root:
//!
//! ```text
//! transfers/{id}/envelope.json     signed TransferEnvelope
//! transfers/{id}/parts/{index:08}  ciphertext part
//! transfers/{id}/complete.json     FinalizedTransfer, written last
//! ```
//!
//! A transfer is fetchable only once `complete.json` exists.

pub mod error;
pub mod health;
pub mod opendal_store;
pub mod operator;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use health::check_health;
pub use opendal_store::{OpendalStore, StoreLimits};
pub use operator::{build_operator, memory_operator, S3Credentials};
pub use store::{PartStream, TransferStore, UploadId};
