use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::UserIdentity;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{read_json, TokenSource};
use crate::backend::{publish, IdentityService, SessionSignal};
use crate::config::FirebaseConfig;
use crate::error::{Error, Result};
use crate::persist::{self, KeyValueStore};

/// Key the refresh credential is kept under, next to the store snapshots.
const CREDENTIAL_KEY: &str = "identity-session";

/// Lifetime Firebase gives id tokens when a response omits `expiresIn`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Id tokens are refreshed this long before they actually expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    user: UserIdentity,
    refresh_token: String,
}

struct ActiveSession {
    user: UserIdentity,
    id_token: String,
    refresh_token: String,
    /// When `id_token` should be replaced.
    refresh_at: Instant,
}

impl ActiveSession {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.refresh_at
    }
}

enum CurrentToken {
    Fresh(String),
    Stale { refresh_token: String },
}

/// Firebase sends lifetimes as a string of seconds.
fn refresh_deadline(expires_in: Option<&str>, now: Instant) -> Instant {
    let lifetime = expires_in
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    now + lifetime.saturating_sub(REFRESH_MARGIN)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

impl AccountResponse {
    fn identity(&self) -> UserIdentity {
        UserIdentity {
            uid: self.local_id.clone(),
            email: non_empty(self.email.clone()),
            display_name: non_empty(self.display_name.clone()),
        }
    }

    fn into_session(self) -> Result<ActiveSession> {
        let user = self.identity();
        let refresh_at = refresh_deadline(self.expires_in.as_deref(), Instant::now());
        match (self.id_token, self.refresh_token) {
            (Some(id_token), Some(refresh_token)) => Ok(ActiveSession {
                user,
                id_token,
                refresh_token,
                refresh_at,
            }),
            _ => Err(Error::Decode("account response carries no tokens".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<AccountResponse>,
}

/// Firebase reports a missing display name as an empty string.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Email/password accounts through the Identity Toolkit REST API.
#[derive(Clone)]
pub struct FirebaseAuth {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    token_url: String,
    storage: Arc<dyn KeyValueStore>,
    session: Mutex<Option<ActiveSession>>,
    /// Serializes id token renewal.
    renewing: tokio::sync::Mutex<()>,
    signal: watch::Sender<SessionSignal>,
}

impl FirebaseAuth {
    pub fn new(config: &FirebaseConfig, storage: Arc<dyn KeyValueStore>) -> Self {
        let (signal, _) = watch::channel(SessionSignal::Unknown);
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                api_key: config.api_key.clone(),
                identity_url: config.identity_url.trim_end_matches('/').to_string(),
                token_url: config.token_url.trim_end_matches('/').to_string(),
                storage,
                session: Mutex::new(None),
                renewing: tokio::sync::Mutex::new(()),
                signal,
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.inner.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accounts_url(&self, method: &str) -> String {
        format!("{}/accounts:{}", self.inner.identity_url, method)
    }

    async fn call_accounts(&self, method: &str, body: serde_json::Value) -> Result<AccountResponse> {
        let resp = self
            .inner
            .http
            .post(self.accounts_url(method))
            .query(&[("key", &self.inner.api_key)])
            .json(&body)
            .send()
            .await?;
        read_json(resp).await
    }

    /// Make `session` current, remember its refresh credential and notify
    /// subscribers.
    async fn establish(&self, session: ActiveSession) -> UserIdentity {
        let user = session.user.clone();
        let credential = StoredCredential {
            user: user.clone(),
            refresh_token: session.refresh_token.clone(),
        };
        *self.session() = Some(session);
        self.remember(Some(credential)).await;
        publish(&self.inner.signal, SessionSignal::SignedIn(user.clone()));
        user
    }

    async fn clear(&self) {
        *self.session() = None;
        self.remember(None).await;
        publish(&self.inner.signal, SessionSignal::SignedOut);
    }

    async fn remember(&self, credential: Option<StoredCredential>) {
        if let Err(e) = persist::save(self.inner.storage.as_ref(), CREDENTIAL_KEY, &credential).await
        {
            tracing::warn!("Failed to persist identity credential: {}", e);
        }
    }

    /// Trade a refresh token for a new id token.
    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse> {
        let resp = self
            .inner
            .http
            .post(format!("{}/token", self.inner.token_url))
            .query(&[("key", &self.inner.api_key)])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        read_json(resp).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ActiveSession> {
        let tokens = self.exchange(refresh_token).await?;

        let lookup: LookupResponse = {
            let resp = self
                .inner
                .http
                .post(self.accounts_url("lookup"))
                .query(&[("key", &self.inner.api_key)])
                .json(&json!({ "idToken": tokens.id_token }))
                .send()
                .await?;
            read_json(resp).await?
        };
        let user = lookup
            .users
            .first()
            .map(AccountResponse::identity)
            .ok_or_else(|| Error::Decode("lookup returned no user".to_string()))?;

        Ok(ActiveSession {
            user,
            refresh_at: refresh_deadline(tokens.expires_in.as_deref(), Instant::now()),
            id_token: tokens.id_token,
            refresh_token: tokens.refresh_token,
        })
    }

    fn current_token(&self) -> Option<CurrentToken> {
        let session = self.session();
        let active = session.as_ref()?;
        Some(if active.is_fresh(Instant::now()) {
            CurrentToken::Fresh(active.id_token.clone())
        } else {
            CurrentToken::Stale {
                refresh_token: active.refresh_token.clone(),
            }
        })
    }

    /// Id token for the signed-in user, renewed through the Secure Token
    /// endpoint when it is about to expire. `None` when signed out or when
    /// renewal fails.
    async fn fresh_id_token(&self) -> Option<String> {
        if let CurrentToken::Fresh(token) = self.current_token()? {
            return Some(token);
        }
        let _renewing = self.inner.renewing.lock().await;
        // Another caller may have renewed while we waited.
        let refresh_token = match self.current_token()? {
            CurrentToken::Fresh(token) => return Some(token),
            CurrentToken::Stale { refresh_token } => refresh_token,
        };

        let tokens = match self.exchange(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Failed to renew id token: {}", e);
                return None;
            }
        };
        let credential = {
            let mut session = self.session();
            match session.as_mut() {
                // Signed out or switched user while renewing.
                Some(active) if active.refresh_token == refresh_token => {
                    active.id_token = tokens.id_token.clone();
                    active.refresh_token = tokens.refresh_token.clone();
                    active.refresh_at =
                        refresh_deadline(tokens.expires_in.as_deref(), Instant::now());
                    Some(StoredCredential {
                        user: active.user.clone(),
                        refresh_token: tokens.refresh_token.clone(),
                    })
                }
                _ => None,
            }
        };
        let credential = credential?;
        tracing::debug!("Renewed id token for {}", credential.user.uid);
        self.remember(Some(credential)).await;
        Some(tokens.id_token)
    }
}

#[async_trait]
impl IdentityService for FirebaseAuth {
    async fn create_account(&self, email: &str, password: &str) -> Result<UserIdentity> {
        let resp = self
            .call_accounts(
                "signUp",
                json!({ "email": email, "password": password, "returnSecureToken": true }),
            )
            .await?;
        let user = self.establish(resp.into_session()?).await;
        tracing::info!("Created Firebase account {}", user.uid);
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<UserIdentity> {
        let resp = self
            .call_accounts(
                "signInWithPassword",
                json!({ "email": email, "password": password, "returnSecureToken": true }),
            )
            .await?;
        Ok(self.establish(resp.into_session()?).await)
    }

    async fn sign_out(&self) -> Result<()> {
        // Firebase sessions are client-held; dropping the tokens ends them.
        self.clear().await;
        Ok(())
    }

    async fn update_display_name(
        &self,
        user: &UserIdentity,
        display_name: &str,
    ) -> Result<UserIdentity> {
        let id_token = match self.session().as_ref() {
            Some(active) if active.user.uid == user.uid => active.id_token.clone(),
            _ => return Err(Error::Unauthenticated),
        };
        let resp = self
            .call_accounts(
                "update",
                json!({
                    "idToken": id_token,
                    "displayName": display_name,
                    "returnSecureToken": false,
                }),
            )
            .await?;

        let updated = resp.identity();
        let credential = {
            let mut session = self.session();
            match session.as_mut() {
                Some(active) if active.user.uid == updated.uid => {
                    active.user = updated.clone();
                    Some(StoredCredential {
                        user: updated.clone(),
                        refresh_token: active.refresh_token.clone(),
                    })
                }
                _ => None,
            }
        };
        if credential.is_some() {
            self.remember(credential).await;
            publish(&self.inner.signal, SessionSignal::SignedIn(updated.clone()));
        }
        Ok(updated)
    }

    async fn restore(&self) -> Result<()> {
        if *self.inner.signal.borrow() != SessionSignal::Unknown {
            return Ok(());
        }
        let stored: Option<StoredCredential> =
            persist::load::<Option<StoredCredential>>(self.inner.storage.as_ref(), CREDENTIAL_KEY)
                .await?
                .flatten();
        let Some(stored) = stored else {
            publish(&self.inner.signal, SessionSignal::SignedOut);
            return Ok(());
        };

        match self.refresh(&stored.refresh_token).await {
            Ok(session) => {
                let user = self.establish(session).await;
                tracing::info!("Restored Firebase session for {}", user.uid);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Could not restore session for {}: {}", stored.user.uid, e);
                self.clear().await;
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<SessionSignal> {
        self.inner.signal.subscribe()
    }
}

#[async_trait]
impl TokenSource for FirebaseAuth {
    async fn id_token(&self) -> Option<String> {
        self.fresh_id_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStorage;

    fn config() -> FirebaseConfig {
        FirebaseConfig {
            api_key: "test-key".to_string(),
            project_id: "roster-test".to_string(),
            identity_url: "http://127.0.0.1:9/v1/".to_string(),
            token_url: "http://127.0.0.1:9/v1/".to_string(),
            ..FirebaseConfig::default()
        }
    }

    fn install(auth: &FirebaseAuth, refresh_at: Instant) {
        *auth.session() = Some(ActiveSession {
            user: UserIdentity {
                uid: "u1".to_string(),
                email: Some("a@x.com".to_string()),
                display_name: None,
            },
            id_token: "id-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            refresh_at,
        });
    }

    #[test]
    fn test_refresh_deadline_leaves_margin() {
        let now = Instant::now();
        assert_eq!(
            refresh_deadline(Some("3600"), now),
            now + Duration::from_secs(3540)
        );
        assert_eq!(
            refresh_deadline(Some("soon"), now),
            now + DEFAULT_TOKEN_LIFETIME - REFRESH_MARGIN
        );
        assert_eq!(refresh_deadline(Some("30"), now), now);
    }

    #[test]
    fn test_sign_in_response_sets_token_deadline() {
        let before = Instant::now();
        let resp: AccountResponse = serde_json::from_str(
            r#"{"localId":"u1","idToken":"t","refreshToken":"r","expiresIn":"3600"}"#,
        )
        .unwrap();
        let session = resp.into_session().unwrap();
        assert!(session.is_fresh(before + Duration::from_secs(3000)));
        assert!(!session.is_fresh(before + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_fresh_id_token_is_served_locally() {
        let auth = FirebaseAuth::new(&config(), Arc::new(MemoryStorage::new()));
        install(&auth, Instant::now() + Duration::from_secs(600));
        assert_eq!(auth.id_token().await.as_deref(), Some("id-1"));
    }

    #[tokio::test]
    async fn test_expired_id_token_is_renewed_before_use() {
        let auth = FirebaseAuth::new(&config(), Arc::new(MemoryStorage::new()));
        install(&auth, Instant::now());

        // The token endpoint is unreachable, so the stale token is withheld
        // rather than sent, and the session survives for a later retry.
        assert!(auth.id_token().await.is_none());
        let session = auth.session();
        let active = session.as_ref().unwrap();
        assert_eq!(active.refresh_token, "refresh-1");
        assert_eq!(active.id_token, "id-1");
    }

    #[test]
    fn test_account_response_normalises_blank_names() {
        let resp: AccountResponse = serde_json::from_str(
            r#"{"localId":"u1","email":"a@x.com","displayName":"","idToken":"t","refreshToken":"r"}"#,
        )
        .unwrap();
        let session = resp.into_session().unwrap();
        assert_eq!(session.user.uid, "u1");
        assert_eq!(session.user.email.as_deref(), Some("a@x.com"));
        assert!(session.user.display_name.is_none());
        assert_eq!(session.id_token, "t");
    }

    #[test]
    fn test_account_response_without_tokens() {
        let resp: AccountResponse = serde_json::from_str(r#"{"localId":"u1"}"#).unwrap();
        assert!(matches!(resp.into_session(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_accounts_url_strips_trailing_slash() {
        let auth = FirebaseAuth::new(&config(), Arc::new(MemoryStorage::new()));
        assert_eq!(
            auth.accounts_url("signUp"),
            "http://127.0.0.1:9/v1/accounts:signUp"
        );
    }

    #[tokio::test]
    async fn test_restore_without_credential_signs_out() {
        let auth = FirebaseAuth::new(&config(), Arc::new(MemoryStorage::new()));
        assert_eq!(*auth.subscribe().borrow(), SessionSignal::Unknown);

        auth.restore().await.unwrap();
        assert_eq!(*auth.subscribe().borrow(), SessionSignal::SignedOut);
        assert!(auth.id_token().await.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_forgets_credential() {
        let storage = MemoryStorage::new();
        let auth = FirebaseAuth::new(&config(), Arc::new(storage.clone()));
        let credential = StoredCredential {
            user: UserIdentity {
                uid: "u1".to_string(),
                email: None,
                display_name: None,
            },
            refresh_token: "r".to_string(),
        };
        persist::save(&storage, CREDENTIAL_KEY, &Some(credential))
            .await
            .unwrap();

        auth.sign_out().await.unwrap();
        let stored = persist::load::<Option<StoredCredential>>(&storage, CREDENTIAL_KEY)
            .await
            .unwrap();
        assert!(matches!(stored, Some(None)));
        assert_eq!(*auth.subscribe().borrow(), SessionSignal::SignedOut);
    }

    #[tokio::test]
    async fn test_update_display_name_requires_session() {
        let auth = FirebaseAuth::new(&config(), Arc::new(MemoryStorage::new()));
        let user = UserIdentity {
            uid: "u1".to_string(),
            email: None,
            display_name: None,
        };
        assert!(matches!(
            auth.update_display_name(&user, "Ann").await,
            Err(Error::Unauthenticated)
        ));
    }
}
