//! Process-local backends. They honour the same contracts as the Firebase
//! clients, including the error codes, and can be switched to an
//! unavailable mode to exercise failure paths.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use shared::UserIdentity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

use super::{publish, Document, DocumentStore, Fields, IdentityService, SessionSignal};
use crate::error::{Error, Result};

const MIN_PASSWORD_LEN: usize = 6;
const UNAVAILABLE: &str = "UNAVAILABLE: backend is offline";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    email: String,
    password_hash: String,
    display_name: Option<String>,
}

impl Account {
    fn identity(&self) -> UserIdentity {
        UserIdentity {
            uid: self.uid.clone(),
            email: Some(self.email.clone()),
            display_name: self.display_name.clone(),
        }
    }
}

/// In-memory identity provider with argon2-hashed passwords.
#[derive(Clone)]
pub struct MemoryIdentity {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
    signal: Arc<watch::Sender<SessionSignal>>,
    unavailable: Arc<AtomicBool>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        let (signal, _) = watch::channel(SessionSignal::Unknown);
        Self {
            accounts: Arc::default(),
            signal: Arc::new(signal),
            unavailable: Arc::default(),
        }
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// End the current session from the provider side, as a revoked token
    /// would.
    pub fn expire_session(&self) {
        publish(&self.signal, SessionSignal::SignedOut);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::remote(503, UNAVAILABLE))
        } else {
            Ok(())
        }
    }

    fn hasher() -> Argon2<'static> {
        // Light parameters: these accounts never leave the process.
        let params = Params::new(4096, 1, 1, None).unwrap_or_default();
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }
}

#[async_trait]
impl IdentityService for MemoryIdentity {
    async fn create_account(&self, email: &str, password: &str) -> Result<UserIdentity> {
        self.check_available()?;
        let key = email.trim().to_lowercase();
        if key.is_empty() {
            return Err(Error::remote(400, "MISSING_EMAIL"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(Error::remote(
                400,
                "WEAK_PASSWORD : Password should be at least 6 characters",
            ));
        }
        if lock(&self.accounts).contains_key(&key) {
            return Err(Error::remote(400, "EMAIL_EXISTS"));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Self::hasher()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::remote(500, e.to_string()))?
            .to_string();

        let account = Account {
            uid: Uuid::new_v4().simple().to_string(),
            email: key.clone(),
            password_hash,
            display_name: None,
        };
        let user = account.identity();
        {
            let mut accounts = lock(&self.accounts);
            if accounts.contains_key(&key) {
                return Err(Error::remote(400, "EMAIL_EXISTS"));
            }
            accounts.insert(key, account);
        }

        tracing::debug!("Created account {}", user.uid);
        publish(&self.signal, SessionSignal::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<UserIdentity> {
        self.check_available()?;
        let account = lock(&self.accounts)
            .get(&email.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| Error::remote(400, "INVALID_LOGIN_CREDENTIALS"))?;

        let parsed = PasswordHash::new(&account.password_hash)
            .map_err(|e| Error::remote(500, e.to_string()))?;
        Self::hasher()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| Error::remote(400, "INVALID_LOGIN_CREDENTIALS"))?;

        let user = account.identity();
        publish(&self.signal, SessionSignal::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.check_available()?;
        publish(&self.signal, SessionSignal::SignedOut);
        Ok(())
    }

    async fn update_display_name(
        &self,
        user: &UserIdentity,
        display_name: &str,
    ) -> Result<UserIdentity> {
        self.check_available()?;
        let updated = {
            let mut accounts = lock(&self.accounts);
            let account = accounts
                .values_mut()
                .find(|a| a.uid == user.uid)
                .ok_or_else(|| Error::remote(400, "USER_NOT_FOUND"))?;
            account.display_name = Some(display_name.to_string());
            account.identity()
        };
        publish(&self.signal, SessionSignal::SignedIn(updated.clone()));
        Ok(updated)
    }

    async fn restore(&self) -> Result<()> {
        // Nothing outlives the process, so an unsettled session is signed out.
        self.signal.send_if_modified(|current| {
            if *current == SessionSignal::Unknown {
                *current = SessionSignal::SignedOut;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<SessionSignal> {
        self.signal.subscribe()
    }
}

// ============================================================================
// Documents
// ============================================================================

/// In-memory document database; collections keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocuments {
    collections: Arc<Mutex<HashMap<String, Vec<Document>>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        lock(&self.collections).get(collection).map_or(0, Vec::len)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::remote(503, UNAVAILABLE))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    async fn add(&self, collection: &str, fields: Fields) -> Result<String> {
        self.check_available()?;
        let id = Uuid::new_v4().simple().to_string();
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push(Document {
                id: id.clone(),
                fields,
            });
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Document> {
        self.check_available()?;
        lock(&self.collections)
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        self.check_available()?;
        Ok(lock(&self.collections)
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.check_available()?;
        let mut collections = lock(&self.collections);
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
        doc.fields.extend(fields);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_available()?;
        if let Some(docs) = lock(&self.collections).get_mut(collection) {
            docs.retain(|d| d.id != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_account_lifecycle() {
        let identity = MemoryIdentity::new();
        let signals = identity.subscribe();
        assert_eq!(*signals.borrow(), SessionSignal::Unknown);

        identity.restore().await.unwrap();
        assert_eq!(*signals.borrow(), SessionSignal::SignedOut);

        let user = identity.create_account("Ann@X.com", "secret1").await.unwrap();
        assert_eq!(user.email.as_deref(), Some("ann@x.com"));
        assert_eq!(*signals.borrow(), SessionSignal::SignedIn(user.clone()));

        let named = identity.update_display_name(&user, "Ann").await.unwrap();
        assert_eq!(named.display_name.as_deref(), Some("Ann"));

        identity.sign_out().await.unwrap();
        assert_eq!(*signals.borrow(), SessionSignal::SignedOut);

        let again = identity.sign_in("ann@x.com", "secret1").await.unwrap();
        assert_eq!(again, named);
    }

    #[tokio::test]
    async fn test_identity_rejections() {
        let identity = MemoryIdentity::new();
        identity.create_account("a@x.com", "secret1").await.unwrap();

        let err = identity.create_account("a@x.com", "secret2").await.unwrap_err();
        assert_eq!(err.to_string(), "EMAIL_EXISTS");

        let err = identity.create_account("b@x.com", "123").await.unwrap_err();
        assert!(err.to_string().starts_with("WEAK_PASSWORD"));

        let err = identity.sign_in("a@x.com", "wrong").await.unwrap_err();
        assert_eq!(err.to_string(), "INVALID_LOGIN_CREDENTIALS");

        let err = identity.sign_in("nobody@x.com", "secret1").await.unwrap_err();
        assert_eq!(err.to_string(), "INVALID_LOGIN_CREDENTIALS");

        identity.set_unavailable(true);
        assert!(identity.sign_in("a@x.com", "secret1").await.is_err());
    }

    #[tokio::test]
    async fn test_documents_crud() {
        let docs = MemoryDocuments::new();
        let first = docs.add("students", fields(json!({"name": "Ann"}))).await.unwrap();
        let second = docs.add("students", fields(json!({"name": "Bob"}))).await.unwrap();
        assert_ne!(first, second);

        docs.update("students", &first, fields(json!({"roll": "7"})))
            .await
            .unwrap();
        let doc = docs.get("students", &first).await.unwrap();
        assert_eq!(doc.fields["name"], "Ann");
        assert_eq!(doc.fields["roll"], "7");

        let listed = docs.list("students").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, [first.as_str(), second.as_str()]);

        docs.delete("students", &first).await.unwrap();
        docs.delete("students", &first).await.unwrap();
        assert_eq!(docs.len("students"), 1);
        assert!(matches!(
            docs.get("students", &first).await,
            Err(Error::NotFound(_))
        ));
        assert!(docs.update("students", &first, Fields::new()).await.is_err());
        assert!(docs.list("courses").await.unwrap().is_empty());
    }
}
