use thiserror::Error;

/// Failures of the key-value persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed value for key {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage is read-only")]
    ReadOnly,
}

/// Synchronous errors returned by library mutations.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// A station with the same dedup identity is already in the library.
    #[error("station already in library: {identity}")]
    Duplicate { identity: String },

    #[error("invalid station: {0}")]
    Validation(String),

    #[error("no station with id {0}")]
    NotFound(String),

    #[error(transparent)]
    Persistence(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// Errors raised while decoding share links and export files.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import payload: {0}")]
    Validation(String),

    #[error("could not decode share data: {0}")]
    Decode(String),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Errors from the external station catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned HTTP {0}")]
    Status(u16),

    #[error("unexpected catalog response: {0}")]
    Decode(String),
}
