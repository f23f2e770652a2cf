/// Shared error type used across all skillrun crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("network: {0}")]
    Network(String),

    #[error("engine: {0}")]
    Engine(String),

    /// The engine stopped because its cancellation signal tripped. The
    /// message is whatever the engine reported, which is often just
    /// "Aborted" with the original reason lost.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Credit billing reported an insufficient balance. Raised only after
    /// the invocation's terminal status is already durable.
    #[error("credit balance insufficient for user {uid}")]
    QuotaExceeded { uid: String },

    #[error("config: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}
