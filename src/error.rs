#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Server cache refresh failed: {0}")]
    ServerCache(String),

    #[error("{0}")]
    General(String),
}

impl ExplorerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExplorerError::NotFound(_))
    }
}
