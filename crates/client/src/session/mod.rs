//! Session store: who is signed in.
//!
//! Every operation runs in three phases. The enter phase (`loading = true`,
//! `error = None`) is applied before the first suspension point, the
//! identity service is awaited, and the outcome is applied as one event.
//! Failures are recorded in [`SessionState::error`] and never returned.

use shared::UserIdentity;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::backend::{IdentityService, SessionSignal};
use crate::persist::{self, KeyValueStore};

mod state;

pub use state::{PersistedSession, SessionEvent, SessionState};

/// Key the session snapshot is persisted under.
pub const SESSION_KEY: &str = "auth-store";

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityService>,
    storage: Arc<dyn KeyValueStore>,
    state: watch::Sender<SessionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Held while a snapshot is being written.
    saving: AsyncMutex<()>,
}

impl SessionStore {
    pub fn new(identity: Arc<dyn IdentityService>, storage: Arc<dyn KeyValueStore>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                identity,
                storage,
                state,
                listener: Mutex::new(None),
                saving: AsyncMutex::new(()),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Restore the persisted snapshot. Only the first call has an effect.
    pub async fn hydrate(&self) {
        if self.inner.state.borrow().hydrated {
            tracing::debug!("Session store already hydrated");
            return;
        }
        let persisted =
            match persist::load::<PersistedSession>(self.inner.storage.as_ref(), SESSION_KEY).await {
                Ok(persisted) => persisted,
                Err(e) => {
                    tracing::warn!("Failed to read persisted session: {}", e);
                    None
                }
            };
        self.commit(SessionEvent::Rehydrated(persisted)).await;
    }

    pub async fn sign_up(&self, email: &str, password: &str, display_name: &str) {
        self.commit(SessionEvent::Started).await;
        let result: crate::error::Result<UserIdentity> = async {
            let user = self.inner.identity.create_account(email, password).await?;
            self.inner
                .identity
                .update_display_name(&user, display_name)
                .await
        }
        .await;
        match result {
            Ok(user) => {
                tracing::info!("Signed up {}", user.uid);
                self.commit(SessionEvent::SignedUp(user)).await;
            }
            Err(e) => {
                tracing::warn!("Sign-up failed: {}", e);
                self.commit(SessionEvent::Failed(e.to_string())).await;
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) {
        self.commit(SessionEvent::Started).await;
        match self.inner.identity.sign_in(email, password).await {
            Ok(user) => {
                tracing::info!("Logged in {}", user.uid);
                self.commit(SessionEvent::LoggedIn(user)).await;
            }
            Err(e) => {
                tracing::warn!("Login failed: {}", e);
                self.commit(SessionEvent::LoginFailed(e.to_string())).await;
            }
        }
    }

    pub async fn logout(&self) {
        self.commit(SessionEvent::Started).await;
        match self.inner.identity.sign_out().await {
            Ok(()) => {
                tracing::info!("Logged out");
                self.commit(SessionEvent::LoggedOut).await;
            }
            Err(e) => {
                tracing::warn!("Logout failed: {}", e);
                self.commit(SessionEvent::Failed(e.to_string())).await;
            }
        }
    }

    /// Begin mirroring the identity service's session changes into this
    /// store. The current session is delivered first. Must run inside a
    /// tokio runtime; calling it while already listening does nothing.
    pub fn start(&self) {
        let mut listener = self.listener();
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let mut signals = self.inner.identity.subscribe();
        signals.mark_changed();
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(listen(weak, signals)));
        tracing::debug!("Session listener started");
    }

    /// Stop mirroring session changes.
    pub fn stop(&self) {
        if let Some(handle) = self.listener().take() {
            handle.abort();
            tracing::debug!("Session listener stopped");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `event` atomically, then persist the surviving subset.
    async fn commit(&self, event: SessionEvent) {
        self.inner
            .state
            .send_modify(|state| *state = state.clone().apply(event));
        self.persist().await;
    }

    /// Write the state as it is once the previous write has finished, so the
    /// last write to land always holds the newest state.
    async fn persist(&self) {
        let _saving = self.inner.saving.lock().await;
        let persisted = self.inner.state.borrow().persisted();
        if let Err(e) = persist::save(self.inner.storage.as_ref(), SESSION_KEY, &persisted).await {
            tracing::warn!("Failed to persist session: {}", e);
        }
    }
}

async fn listen(store: Weak<Inner>, mut signals: watch::Receiver<SessionSignal>) {
    let mut last: Option<Option<UserIdentity>> = None;
    while signals.changed().await.is_ok() {
        let user = match &*signals.borrow_and_update() {
            SessionSignal::Unknown => continue,
            SessionSignal::SignedOut => None,
            SessionSignal::SignedIn(user) => Some(user.clone()),
        };
        if last.as_ref() == Some(&user) {
            continue;
        }
        let Some(inner) = store.upgrade() else {
            break;
        };
        tracing::debug!(
            "Session changed: {}",
            user.as_ref().map_or("signed out", |u| u.uid.as_str())
        );
        last = Some(user.clone());
        SessionStore { inner }
            .commit(SessionEvent::SessionChanged(user))
            .await;
    }
}
