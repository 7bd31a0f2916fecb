use std::path::PathBuf;
use std::time::Duration;

use crate::types::{PartitionId, QueryId};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not create cache directory {path}: {source}")]
    CacheDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not open cache file {path}: {source}")]
    CacheFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown partition: {0}")]
    UnknownPartition(PartitionId),

    #[error("Query not found: {0}")]
    QueryNotFound(QueryId),

    #[error("Query {0} has not been initialized")]
    NotInitialized(QueryId),

    #[error("Query {0} was already initialized")]
    AlreadyInitialized(QueryId),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Malformed match record: {0}")]
    MalformedRecord(String),

    #[error("Pattern parse error: {0}")]
    Pattern(String),

    #[error("Tree parse error: {0}")]
    Tree(String),

    #[error("Annotation error: {0}")]
    Annotation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Faults raised by the external query engine for a single call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("engine IO error: {0}")]
    Io(String),

    #[error("engine response could not be decoded: {0}")]
    Decode(String),

    #[error("engine returned a malformed response: {0}")]
    Malformed(String),

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
}
