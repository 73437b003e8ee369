use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset file not found: {0} (also tried the .gz variant)")]
    MissingDatasetFile(PathBuf),

    #[error("malformed dataset file {path}: {reason}")]
    MalformedDataset { path: PathBuf, reason: String },

    #[error("no checkpoint directory found at {0}")]
    NoCheckpointDir(PathBuf),

    #[error("checkpoint does not match the network: {0}")]
    CheckpointMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    // Attach the offending path to an io::Error. Used as `.map_err(Error::io(&path))`.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }
}
