//! Store-level error taxonomy. Subset and store operations keep
//! returning `bool`/`Result<bool, StoreError>` for their success
//! contract -- these variants categorize *why* an operation failed for
//! logging, they don't replace that boolean aggregation.

use thiserror::Error;

use crate::fs::FsError;
use crate::hash::HashError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("save of subset {subset_id:#06x} failed: data offset {offset} not found while removing index entry")]
    IndexOffsetNotFound { subset_id: u16, offset: u64 },

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("record deserialization failed: {0}")]
    Deserialize(#[source] std::io::Error),
}
