use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("webdriver error: {0}")]
    Surface(String),

    #[error("timed out waiting for {0}")]
    NavigationTimeout(String),

    #[error("extraction failed for {url}: {reason}")]
    Extraction { url: String, reason: String },

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("{tool} failed (code={code:?}): {stderr}")]
    StreamDownload {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted by user")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl ScrapeError {
    /// Only setup problems and a user interrupt stop the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScrapeError::Setup(_) | ScrapeError::Interrupted)
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScrapeError::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
