//! Error taxonomy shared by the store, translator, session and handler.

use std::path::PathBuf;

use crate::loader::LoaderError;
use crate::store::CheckpointFamily;

/// Errors surfaced by checkpoint management and generation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{family} checkpoint '{id}' not found in {}", dir.display())]
    NotFound {
        family: CheckpointFamily,
        id: String,
        dir: PathBuf,
    },

    #[error("cannot convert '{key}': {detail}")]
    Conversion { key: String, detail: String },

    #[error(
        "checkpoint '{checkpoint}' has {} keys the target does not recognize: {keys:?}",
        .keys.len()
    )]
    UnexpectedKeys {
        checkpoint: String,
        keys: Vec<String>,
    },

    #[error("invalid seed '{0}': expected an integer")]
    InvalidSeed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("failed to encode video: {0}")]
    Video(#[from] gif::EncodingError),

    #[error("generation queue is full")]
    QueueFull,

    #[error("generation queue has shut down")]
    QueueClosed,

    #[error("parameter map lock poisoned")]
    Poisoned,
}

impl Error {
    /// Shape mismatch between an incoming tensor and a live parameter
    pub(crate) fn shape_mismatch(key: &str, expected: &[usize], actual: &[usize]) -> Self {
        Error::Conversion {
            key: key.to_string(),
            detail: format!("model expects shape {expected:?}, checkpoint has {actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
