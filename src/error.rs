//! Error types for the lookup cache

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Scanning the source file or writing the spill file failed.
    /// Nothing is registered in the cache when this is returned.
    #[error("Failed to build lookup index for {file}: {reason}")]
    Build { file: String, reason: String },

    /// Probing an already built index failed. The entry stays resident.
    #[error("Lookup in {file} failed: {reason}")]
    Lookup { file: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Lookup cache is closed")]
    Closed,
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Config(err.to_string())
    }
}
