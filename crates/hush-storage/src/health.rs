//! Storage health check

use opendal::Operator;

use crate::error::StoreResult;

/// Verify the storage backend is reachable by listing the root
pub async fn check_health(op: &Operator) -> StoreResult<()> {
    op.list("/").await?;
    Ok(())
}
