use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{partition::PartitionKey, store::StoreError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("spill directory {path} is unusable: {source}")]
    SpillDirUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("undecodable row in {partition}: {reason}")]
    CorruptRow {
        partition: PartitionKey,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
