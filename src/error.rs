use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every failure the captioning core can report.
///
/// `Backend` is the only variant that crosses the backend adapter boundary;
/// the registry wraps whatever a provider raised into it so callers always
/// see which backend failed.
#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("{backend} failed: {message}")]
    Backend { backend: String, message: String },

    #[error("Unknown captioning backend: {0}")]
    UnknownBackend(String),

    #[error("{backend} needs an API key in the {env_var} environment variable")]
    MissingCredential { backend: String, env_var: String },

    #[error("{backend} returned an empty caption")]
    EmptyCaption { backend: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[cfg(feature = "local-model")]
    #[error("Model runtime error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl CaptionError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Tags an arbitrary failure with the backend that produced it.
    ///
    /// Already-tagged failures keep their original backend name.
    pub fn tagged(self, backend: &str) -> Self {
        match self {
            tagged @ Self::Backend { .. } => tagged,
            other => Self::Backend {
                backend: backend.to_string(),
                message: other.to_string(),
            },
        }
    }
}
