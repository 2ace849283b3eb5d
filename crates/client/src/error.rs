use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by backends and persistence. Stores catch these at their
/// boundary and record the message; they never escape a store operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote service answered with an error.
    #[error("{message}")]
    Remote { code: u16, message: String },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("document not found: {0}")]
    NotFound(String),

    /// A remote payload could not be interpreted.
    #[error("malformed response: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not signed in")]
    Unauthenticated,
}

impl Error {
    pub fn remote(code: u16, message: impl Into<String>) -> Self {
        Error::Remote {
            code,
            message: message.into(),
        }
    }
}
