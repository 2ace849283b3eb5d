//! Contracts for the two remote services the stores talk to, plus the
//! in-memory and Firebase implementations of them.

use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::UserIdentity;
use tokio::sync::watch;

use crate::error::Result;

pub mod firebase;
pub mod memory;

pub use firebase::{FirebaseAuth, Firestore};
pub use memory::{MemoryDocuments, MemoryIdentity};

/// JSON payload of a document, keyed by field name.
pub type Fields = Map<String, Value>;

/// What the identity service currently knows about the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Startup state has not been settled yet.
    Unknown,
    SignedOut,
    SignedIn(UserIdentity),
}

impl SessionSignal {
    pub fn from_user(user: Option<UserIdentity>) -> Self {
        match user {
            Some(user) => SessionSignal::SignedIn(user),
            None => SessionSignal::SignedOut,
        }
    }
}

/// Publish `signal` only if it differs from the current one, so subscribers
/// wake once per actual session change.
pub(crate) fn publish(sender: &watch::Sender<SessionSignal>, signal: SessionSignal) {
    sender.send_if_modified(|current| {
        if *current == signal {
            false
        } else {
            *current = signal;
            true
        }
    });
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn create_account(&self, email: &str, password: &str) -> Result<UserIdentity>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<UserIdentity>;

    async fn sign_out(&self) -> Result<()>;

    /// Set the display name of the signed-in `user` and return the updated
    /// identity.
    async fn update_display_name(
        &self,
        user: &UserIdentity,
        display_name: &str,
    ) -> Result<UserIdentity>;

    /// Settle the startup state, re-establishing a previous session if the
    /// backend kept one. Afterwards the signal is never `Unknown`.
    async fn restore(&self) -> Result<()>;

    /// Session-change notifications, current value included.
    fn subscribe(&self) -> watch::Receiver<SessionSignal>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a new document and return its server-assigned id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<String>;

    async fn get(&self, collection: &str, id: &str) -> Result<Document>;

    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    /// Overwrite only the given fields of an existing document.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Remove a document. Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}
