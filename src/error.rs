use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImageCycleError>;

#[derive(Error, Debug)]
pub enum ImageCycleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry or cluster unreachable, or a response body that is not
    /// JSON at all (gateway error pages and the like).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A response body that is JSON but not the shape we expect.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] kube::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Auth challenge failed: {0}")]
    AuthChallenge(String),

    #[error("Pod '{pod}' did not complete within the poll budget")]
    PrepullTimeout { pod: String },

    #[error("Prepull run exceeded its wall-clock budget")]
    PrepullRunTimeout,

    #[error("No scan completed within the startup deadline")]
    ScanNotReady,
}

impl From<reqwest::Error> for ImageCycleError {
    fn from(e: reqwest::Error) -> Self {
        ImageCycleError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ImageCycleError {
    fn from(e: serde_json::Error) -> Self {
        ImageCycleError::Decode(e.to_string())
    }
}
