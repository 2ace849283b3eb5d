//! Firebase REST clients: Identity Toolkit for accounts, Firestore for
//! documents.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Error, Result};

mod auth;
mod firestore;
pub mod value;

pub use auth::FirebaseAuth;
pub use firestore::Firestore;

/// Supplies the bearer token Firestore requests are authorised with.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn id_token(&self) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Map a failed response body to [`Error::Remote`].
///
/// Google APIs answer `{"error": {"code": 400, "message": "EMAIL_EXISTS"}}`;
/// anything else keeps the raw body as the message.
pub(crate) fn remote_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error }) => {
            let message = error
                .message
                .or(error.status)
                .unwrap_or_else(|| format!("HTTP {status}"));
            Error::remote(error.code.unwrap_or(status), message)
        }
        Err(_) if body.trim().is_empty() => Error::remote(status, format!("HTTP {status}")),
        Err(_) => Error::remote(status, body.trim().to_string()),
    }
}

/// Decode a successful JSON response or turn a failed one into an error.
pub(crate) async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(remote_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| Error::Decode(e.to_string()))
}

/// Like [`read_json`] for calls whose response body is irrelevant.
pub(crate) async fn expect_success(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await?;
    Err(remote_error(status.as_u16(), &body))
}
