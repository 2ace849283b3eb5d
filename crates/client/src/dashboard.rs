use anyhow::{bail, Context, Result};
use shared::{StudentProfile, STUDENTS_COLLECTION};
use std::sync::Arc;

use crate::backend::firebase::TokenSource;
use crate::backend::{
    DocumentStore, FirebaseAuth, Firestore, IdentityService, MemoryDocuments, MemoryIdentity,
};
use crate::config::{BackendKind, ClientConfig};
use crate::persist::{FileStorage, KeyValueStore};
use crate::records::RecordStore;
use crate::session::SessionStore;

/// The two stores a dashboard screen reads from, wired to one set of
/// backends.
#[derive(Clone)]
pub struct Dashboard {
    session: SessionStore,
    records: RecordStore,
    identity: Arc<dyn IdentityService>,
}

impl Dashboard {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        documents: Arc<dyn DocumentStore>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            session: SessionStore::new(identity.clone(), storage.clone()),
            records: RecordStore::new(documents, storage),
            identity,
        }
    }

    /// Build the backends `config` names, persisting to its storage dir.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let dir = config.storage_dir()?;
        let storage: Arc<dyn KeyValueStore> = Arc::new(FileStorage::new(&dir));
        tracing::debug!("Persisting stores under {}", dir.display());

        match config.backend {
            BackendKind::Memory => {
                tracing::info!("Using in-memory backends");
                Ok(Self::new(
                    Arc::new(MemoryIdentity::new()),
                    Arc::new(MemoryDocuments::new()),
                    storage,
                ))
            }
            BackendKind::Firebase => {
                let firebase = &config.firebase;
                if firebase.api_key.is_empty() {
                    bail!("Firebase backend needs an api_key (or ROSTER_FIREBASE_API_KEY)");
                }
                if firebase.project_id.is_empty() {
                    bail!("Firebase backend needs a project_id (or ROSTER_FIREBASE_PROJECT_ID)");
                }
                tracing::info!("Using Firebase project {}", firebase.project_id);

                let auth = FirebaseAuth::new(firebase, storage.clone());
                let tokens: Arc<dyn TokenSource> = Arc::new(auth.clone());
                let documents = Firestore::new(firebase, tokens)
                    .with_timestamp_fields(STUDENTS_COLLECTION, StudentProfile::TIMESTAMP_FIELDS);
                Ok(Self::new(Arc::new(auth), Arc::new(documents), storage))
            }
        }
    }

    /// Load configuration from the usual places and build from it.
    pub fn from_env() -> Result<Self> {
        let config = ClientConfig::load().context("Failed to load configuration")?;
        Self::from_config(&config)
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Restore both stores, settle the identity backend's startup session,
    /// then start following session changes. Must run inside a tokio runtime.
    pub async fn start(&self) {
        futures::join!(self.session.hydrate(), self.records.hydrate());

        if let Err(e) = self.identity.restore().await {
            tracing::warn!("Could not restore previous session: {}", e);
        }
        self.session.start();
        tracing::info!("Dashboard started");
    }

    pub fn stop(&self) {
        self.session.stop();
        tracing::info!("Dashboard stopped");
    }
}
