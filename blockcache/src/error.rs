use std::path::PathBuf;

/// Errors produced by the cache, the metadata facade, and backends.
///
/// Temporary backend failures are expected to be retried *inside* the
/// backend implementation; by the time an error reaches the cache it is
/// either recoverable at the cache's own level (a missing object) or fatal.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error("backend object {key:?} does not exist")]
    NotFound { key: String },

    #[error("backend reported a temporary failure for {key:?}: {message}")]
    TempFailure { key: String, message: String },

    #[error("object {key:?} failed a post-download integrity check: {message}")]
    CorruptedObject { key: String, message: String },

    #[error("no live upload worker threads remain")]
    NoWorkerThreads,

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
