use serde::{Deserialize, Serialize};
use shared::UserIdentity;

/// Observable state of the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user: Option<UserIdentity>,
    /// Never true while `user` is `None`.
    pub authenticated: bool,
    pub loading: bool,
    pub error: Option<String>,
    pub hydrated: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        // Loading until the identity service reports its first session state.
        Self {
            user: None,
            authenticated: false,
            loading: true,
            error: None,
            hydrated: false,
        }
    }
}

/// The part of [`SessionState`] that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub user: Option<UserIdentity>,
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An operation began.
    Started,
    SignedUp(UserIdentity),
    LoggedIn(UserIdentity),
    LoggedOut,
    /// Sign-up or logout failed.
    Failed(String),
    /// Login failed; also revokes `authenticated`.
    LoginFailed(String),
    /// The identity service reported a session change on its own.
    SessionChanged(Option<UserIdentity>),
    /// Persisted state was restored (or found absent) at startup.
    Rehydrated(Option<PersistedSession>),
}

impl SessionState {
    pub fn apply(self, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Started => Self {
                loading: true,
                error: None,
                ..self
            },
            SessionEvent::SignedUp(user) | SessionEvent::LoggedIn(user) => Self {
                user: Some(user),
                authenticated: true,
                loading: false,
                ..self
            },
            SessionEvent::LoggedOut => Self {
                user: None,
                authenticated: false,
                loading: false,
                ..self
            },
            SessionEvent::Failed(message) => Self {
                error: Some(message),
                loading: false,
                ..self
            },
            SessionEvent::LoginFailed(message) => Self {
                error: Some(message),
                loading: false,
                authenticated: false,
                ..self
            },
            SessionEvent::SessionChanged(user) => Self {
                authenticated: user.is_some(),
                user,
                loading: false,
                ..self
            },
            SessionEvent::Rehydrated(_) if self.hydrated => self,
            SessionEvent::Rehydrated(persisted) => {
                let persisted = persisted.unwrap_or_default();
                Self {
                    authenticated: persisted.authenticated && persisted.user.is_some(),
                    user: persisted.user,
                    hydrated: true,
                    ..self
                }
            }
        }
    }

    pub fn persisted(&self) -> PersistedSession {
        PersistedSession {
            user: self.user.clone(),
            authenticated: self.authenticated,
        }
    }
}
