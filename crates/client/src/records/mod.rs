//! Record store: the cached student roster.
//!
//! The cache only ever reflects confirmed remote state. Each operation marks
//! the store loading, awaits the document store, and applies the confirmed
//! outcome as a single event. Failures land in [`RecordState::error`] with the
//! cache untouched.

use shared::{Student, StudentId, StudentPatch, StudentProfile, STUDENTS_COLLECTION};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::backend::DocumentStore;
use crate::error::{Error, Result};
use crate::persist::{self, KeyValueStore};

mod state;

pub use state::{PersistedRecords, RecordEvent, RecordState};

/// Key the roster snapshot is persisted under.
pub const RECORDS_KEY: &str = "student-store";

#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

struct Inner {
    documents: Arc<dyn DocumentStore>,
    storage: Arc<dyn KeyValueStore>,
    state: watch::Sender<RecordState>,
    /// Held while a snapshot is being written.
    saving: Mutex<()>,
}

impl RecordStore {
    pub fn new(documents: Arc<dyn DocumentStore>, storage: Arc<dyn KeyValueStore>) -> Self {
        let (state, _) = watch::channel(RecordState::default());
        Self {
            inner: Arc::new(Inner {
                documents,
                storage,
                state,
                saving: Mutex::new(()),
            }),
        }
    }

    pub fn snapshot(&self) -> RecordState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordState> {
        self.inner.state.subscribe()
    }

    /// Restore the persisted roster. Only the first call has an effect.
    pub async fn hydrate(&self) {
        if self.inner.state.borrow().hydrated {
            tracing::debug!("Record store already hydrated");
            return;
        }
        let persisted =
            match persist::load::<PersistedRecords>(self.inner.storage.as_ref(), RECORDS_KEY).await {
                Ok(persisted) => persisted,
                Err(e) => {
                    tracing::warn!("Failed to read persisted records: {}", e);
                    None
                }
            };
        self.commit(RecordEvent::Rehydrated(persisted)).await;
    }

    /// Add a record and cache it once the store has confirmed it.
    pub async fn create_student(&self, draft: StudentProfile) {
        self.commit(RecordEvent::Started).await;
        match self.add(draft).await {
            Ok(student) => {
                tracing::info!("Created student {}", student.id);
                self.commit(RecordEvent::Created(student)).await;
            }
            Err(e) => {
                tracing::warn!("Failed to create student: {}", e);
                self.commit(RecordEvent::Failed(e.to_string())).await;
            }
        }
    }

    /// Write only the fields `patch` sets, then merge them into the cached
    /// record with the same id.
    pub async fn update_student(&self, patch: StudentPatch, id: &StudentId) {
        self.commit(RecordEvent::Started).await;
        let result = match patch.to_fields() {
            Ok(fields) => {
                self.inner
                    .documents
                    .update(STUDENTS_COLLECTION, id.as_str(), fields)
                    .await
            }
            Err(e) => Err(Error::from(e)),
        };
        match result {
            Ok(()) => {
                let cached_name = self
                    .inner
                    .state
                    .borrow()
                    .get(id)
                    .map(|student| student.profile.name.clone());
                match cached_name {
                    Some(name) => tracing::info!(
                        "Updated student {} {} ({})",
                        id,
                        name,
                        patch.field_names().join(", ")
                    ),
                    None => tracing::warn!("Updated student {} is not in the cache", id),
                }
                self.commit(RecordEvent::Updated {
                    id: id.clone(),
                    patch,
                })
                .await;
            }
            Err(e) => {
                tracing::warn!("Failed to update student {}: {}", id, e);
                self.commit(RecordEvent::Failed(e.to_string())).await;
            }
        }
    }

    pub async fn delete_student(&self, id: &StudentId) {
        self.commit(RecordEvent::Started).await;
        match self
            .inner
            .documents
            .delete(STUDENTS_COLLECTION, id.as_str())
            .await
        {
            Ok(()) => {
                tracing::info!("Deleted student {}", id);
                self.commit(RecordEvent::Deleted(id.clone())).await;
            }
            Err(e) => {
                tracing::warn!("Failed to delete student {}: {}", id, e);
                self.commit(RecordEvent::Failed(e.to_string())).await;
            }
        }
    }

    /// Replace the cache with the full remote roster.
    pub async fn get_all_students(&self) {
        self.commit(RecordEvent::Started).await;
        match self.inner.documents.list(STUDENTS_COLLECTION).await {
            Ok(documents) => {
                let total = documents.len();
                let students: Vec<Student> = documents
                    .into_iter()
                    .filter_map(|doc| {
                        let id = doc.id.clone();
                        match Student::from_document(StudentId::new(doc.id), doc.fields) {
                            Ok(student) => Some(student),
                            Err(e) => {
                                tracing::warn!("Skipping undecodable student {}: {}", id, e);
                                None
                            }
                        }
                    })
                    .collect();
                tracing::info!("Fetched {} of {} students", students.len(), total);
                self.commit(RecordEvent::Replaced(students)).await;
            }
            Err(e) => {
                tracing::warn!("Failed to fetch students: {}", e);
                self.commit(RecordEvent::Failed(e.to_string())).await;
            }
        }
    }

    /// Store `draft` and read it back so the cache holds what the server kept.
    async fn add(&self, draft: StudentProfile) -> Result<Student> {
        let documents = &self.inner.documents;
        let id = documents.add(STUDENTS_COLLECTION, draft.to_fields()?).await?;
        let doc = documents.get(STUDENTS_COLLECTION, &id).await?;
        Student::from_document(StudentId::new(doc.id), doc.fields)
            .map_err(|e| Error::Decode(format!("student {id}: {e}")))
    }

    /// Apply `event` atomically, then persist the roster.
    async fn commit(&self, event: RecordEvent) {
        self.inner
            .state
            .send_modify(|state| *state = state.clone().apply(event));
        self.persist().await;
    }

    /// Write the roster as it is once the previous write has finished, so
    /// the last write to land always holds the newest state.
    async fn persist(&self) {
        let _saving = self.inner.saving.lock().await;
        let persisted = self.inner.state.borrow().persisted();
        if let Err(e) = persist::save(self.inner.storage.as_ref(), RECORDS_KEY, &persisted).await {
            tracing::warn!("Failed to persist records: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Document, Fields, MemoryDocuments};
    use crate::persist::{FileStorage, MemoryStorage};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use shared::{Gender, Grade, Status};
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Document store whose listing, and updates that set a gated name, wait
    /// until the test opens the matching gate.
    #[derive(Clone)]
    struct GatedDocuments {
        inner: MemoryDocuments,
        gates: Arc<std::sync::Mutex<HashMap<String, Arc<Notify>>>>,
    }

    impl GatedDocuments {
        fn new() -> Self {
            Self {
                inner: MemoryDocuments::new(),
                gates: Arc::default(),
            }
        }

        fn gate(&self, key: &str) -> Arc<Notify> {
            self.gates
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .clone()
        }

        async fn pass(&self, key: &str) {
            let gate = self.gates.lock().unwrap().get(key).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl DocumentStore for GatedDocuments {
        async fn add(&self, collection: &str, fields: Fields) -> Result<String> {
            self.inner.add(collection, fields).await
        }
        async fn get(&self, collection: &str, id: &str) -> Result<Document> {
            self.inner.get(collection, id).await
        }
        async fn list(&self, collection: &str) -> Result<Vec<Document>> {
            self.pass("list").await;
            self.inner.list(collection).await
        }
        async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
            if let Some(name) = fields.get("name").and_then(|v| v.as_str()) {
                self.pass(name).await;
            }
            self.inner.update(collection, id, fields).await
        }
        async fn delete(&self, collection: &str, id: &str) -> Result<()> {
            self.inner.delete(collection, id).await
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<RecordState>,
        pred: impl Fn(&RecordState) -> bool,
    ) -> RecordState {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
            .await
            .expect("state never matched")
            .expect("store dropped")
            .clone()
    }

    fn draft(name: &str) -> StudentProfile {
        StudentProfile {
            name: name.to_string(),
            email: format!("{}@x.com", name.to_lowercase()),
            phone: "1234567890".to_string(),
            class: "10".to_string(),
            section: "A".to_string(),
            roll: "7".to_string(),
            school: "Springfield High".to_string(),
            gender: Gender::Female,
            status: Status::Pursuing,
            grade: Grade::APlus,
            address: "12 Elm St".to_string(),
            date: NaiveDate::from_ymd_opt(2008, 5, 17),
        }
    }

    fn memory_store() -> (RecordStore, MemoryDocuments, MemoryStorage) {
        let documents = MemoryDocuments::new();
        let storage = MemoryStorage::new();
        let store = RecordStore::new(Arc::new(documents.clone()), Arc::new(storage.clone()));
        (store, documents, storage)
    }

    #[tokio::test]
    async fn test_create_assigns_unique_ids() {
        let (store, documents, _) = memory_store();
        for name in ["Ann", "Bob", "Cid", "Dee"] {
            store.create_student(draft(name)).await;
        }

        let state = store.snapshot();
        assert_eq!(state.students.len(), 4);
        assert_eq!(documents.len(STUDENTS_COLLECTION), 4);
        let ids: HashSet<_> = state.students.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        assert!(state.students.iter().all(|s| !s.id.as_str().is_empty()));
        let names: Vec<_> = state.students.iter().map(|s| s.profile.name.as_str()).collect();
        assert_eq!(names, ["Ann", "Bob", "Cid", "Dee"]);
        assert!(!state.loading);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let (store, _, _) = memory_store();
        store.create_student(draft("Ann")).await;

        let state = store.snapshot();
        assert_eq!(state.students.len(), 1);
        assert_eq!(state.students[0].profile.name, "Ann");
        let id = state.students[0].id.clone();

        store.delete_student(&id).await;
        assert!(store.snapshot().students.is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_only_patch_fields() {
        let (store, documents, _) = memory_store();
        store.create_student(draft("Ann")).await;
        store.create_student(draft("Bob")).await;
        let before = store.snapshot();
        let id = before.students[1].id.clone();

        let patch = StudentPatch {
            grade: Some(Grade::C),
            address: Some("9 Oak Ave".to_string()),
            ..Default::default()
        };
        store.update_student(patch, &id).await;

        let after = store.snapshot();
        assert_eq!(after.students[0], before.students[0]);
        let mut expected = before.students[1].clone();
        expected.profile.grade = Grade::C;
        expected.profile.address = "9 Oak Ave".to_string();
        assert_eq!(after.students[1], expected);

        let doc = documents.get(STUDENTS_COLLECTION, id.as_str()).await.unwrap();
        assert_eq!(doc.fields["grade"], json!("C"));
        assert_eq!(doc.fields["name"], json!("Bob"));
    }

    #[tokio::test]
    async fn test_update_unknown_id_leaves_cache() {
        let (store, documents, _) = memory_store();
        store.create_student(draft("Ann")).await;
        let before = store.snapshot().students;

        // Present remotely but never fetched into the cache.
        let stray = documents
            .add(STUDENTS_COLLECTION, draft("Eve").to_fields().unwrap())
            .await
            .unwrap();
        let patch = StudentPatch {
            name: Some("Evelyn".to_string()),
            ..Default::default()
        };
        store.update_student(patch.clone(), &StudentId::new(stray)).await;
        let state = store.snapshot();
        assert_eq!(state.students, before);
        assert!(state.error.is_none());

        // Missing on both sides.
        store.update_student(patch, &StudentId::new("missing")).await;
        let state = store.snapshot();
        assert_eq!(state.students, before);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _, _) = memory_store();
        store.create_student(draft("Ann")).await;
        store.create_student(draft("Bob")).await;
        let id = store.snapshot().students[0].id.clone();

        store.delete_student(&id).await;
        let once = store.snapshot();
        assert_eq!(once.students.len(), 1);
        assert_eq!(once.students[0].profile.name, "Bob");

        store.delete_student(&id).await;
        let twice = store.snapshot();
        assert_eq!(twice.students, once.students);
        assert!(twice.error.is_none());
    }

    #[tokio::test]
    async fn test_get_all_is_idempotent() {
        let (store, documents, _) = memory_store();
        for name in ["Ann", "Bob"] {
            documents
                .add(STUDENTS_COLLECTION, draft(name).to_fields().unwrap())
                .await
                .unwrap();
        }

        store.get_all_students().await;
        let first = store.snapshot();
        store.get_all_students().await;
        let second = store.snapshot();

        assert_eq!(first.students.len(), 2);
        assert_eq!(first.students, second.students);
        assert!(!second.loading);
    }

    #[tokio::test]
    async fn test_get_all_uses_document_id_and_skips_garbage() {
        let (store, documents, _) = memory_store();
        let mut fields = draft("Ann").to_fields().unwrap();
        fields.insert("id".to_string(), json!("stale-id"));
        let id = documents.add(STUDENTS_COLLECTION, fields).await.unwrap();
        documents
            .add(
                STUDENTS_COLLECTION,
                json!({"name": "half a record"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();

        store.get_all_students().await;
        let state = store.snapshot();
        assert_eq!(state.students.len(), 1);
        assert_eq!(state.students[0].id.as_str(), id);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_failures_leave_cache() {
        let (store, documents, _) = memory_store();
        store.create_student(draft("Ann")).await;
        let before = store.snapshot().students;
        let id = before[0].id.clone();

        documents.set_unavailable(true);
        store.create_student(draft("Bob")).await;
        assert_eq!(store.snapshot().students, before);

        store
            .update_student(
                StudentPatch {
                    name: Some("Annie".to_string()),
                    ..Default::default()
                },
                &id,
            )
            .await;
        assert_eq!(store.snapshot().students, before);

        store.delete_student(&id).await;
        assert_eq!(store.snapshot().students, before);

        store.get_all_students().await;
        let state = store.snapshot();
        assert_eq!(state.students, before);
        assert!(!state.loading);
        assert!(state.error.as_deref().unwrap().contains("UNAVAILABLE"));

        documents.set_unavailable(false);
        store.get_all_students().await;
        assert!(store.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn test_retry_clears_error() {
        let (store, documents, _) = memory_store();
        documents.set_unavailable(true);
        store.get_all_students().await;
        assert!(store.snapshot().error.is_some());

        documents.set_unavailable(false);
        store.get_all_students().await;
        let state = store.snapshot();
        assert!(state.error.is_none());
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_roster_persists_and_rehydrates() {
        let (store, _, storage) = memory_store();
        store.create_student(draft("Ann")).await;
        store.create_student(draft("Bob")).await;

        let reopened = RecordStore::new(Arc::new(MemoryDocuments::new()), Arc::new(storage.clone()));
        reopened.hydrate().await;
        let state = reopened.snapshot();
        assert!(state.hydrated);
        assert_eq!(state.students, store.snapshot().students);

        // A second hydrate is ignored even if the blob changed since.
        store.delete_student(&state.students[0].id.clone()).await;
        reopened.hydrate().await;
        assert_eq!(reopened.snapshot().students.len(), 2);
    }

    #[tokio::test]
    async fn test_hydrate_discards_other_versions() {
        let storage = MemoryStorage::new();
        storage
            .set(RECORDS_KEY, r#"{"state":{"students":[]},"version":7}"#.to_string())
            .await
            .unwrap();
        let store = RecordStore::new(Arc::new(MemoryDocuments::new()), Arc::new(storage));

        store.hydrate().await;
        let state = store.snapshot();
        assert!(state.hydrated);
        assert!(state.students.is_empty());
    }

    #[tokio::test]
    async fn test_enter_phase_visible_before_documents_settle() {
        let documents = GatedDocuments::new();
        let list_gate = documents.gate("list");
        documents
            .add(STUDENTS_COLLECTION, draft("Ann").to_fields().unwrap())
            .await
            .unwrap();
        let store = RecordStore::new(Arc::new(documents), Arc::new(MemoryStorage::new()));

        let patch = StudentPatch {
            name: Some("Ghost".to_string()),
            ..Default::default()
        };
        store.update_student(patch, &StudentId::new("missing")).await;
        let state = store.snapshot();
        assert!(!state.loading);
        assert!(state.error.is_some());

        let mut rx = store.subscribe();
        let task = {
            let store = store.clone();
            tokio::spawn(async move { store.get_all_students().await })
        };
        let seen = wait_for(&mut rx, |s| s.loading).await;
        assert!(seen.error.is_none());
        assert!(seen.students.is_empty());

        list_gate.notify_one();
        task.await.unwrap();
        let state = store.snapshot();
        assert!(!state.loading);
        assert_eq!(state.students.len(), 1);
    }

    #[tokio::test]
    async fn test_last_settled_update_wins() {
        let documents = GatedDocuments::new();
        let store = RecordStore::new(Arc::new(documents.clone()), Arc::new(MemoryStorage::new()));
        store.create_student(draft("Ann")).await;
        let id = store.snapshot().students[0].id.clone();

        let first_gate = documents.gate("First");
        let second_gate = documents.gate("Second");
        let rename = |name: &str| {
            let store = store.clone();
            let id = id.clone();
            let patch = StudentPatch {
                name: Some(name.to_string()),
                ..Default::default()
            };
            tokio::spawn(async move { store.update_student(patch, &id).await })
        };
        let first = rename("First");
        let second = rename("Second");

        second_gate.notify_one();
        second.await.unwrap();
        assert_eq!(store.snapshot().get(&id).unwrap().profile.name, "Second");

        first_gate.notify_one();
        first.await.unwrap();
        let state = store.snapshot();
        assert_eq!(state.get(&id).unwrap().profile.name, "First");
        assert!(!state.loading);
        assert!(state.error.is_none());

        let doc = documents.get(STUDENTS_COLLECTION, id.as_str()).await.unwrap();
        assert_eq!(doc.fields["name"], json!("First"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_creates_persist_latest_roster() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let store = RecordStore::new(Arc::new(MemoryDocuments::new()), Arc::new(storage.clone()));

        for round in 0..5 {
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let store = store.clone();
                    let name = format!("S{round}n{i}");
                    tokio::spawn(async move { store.create_student(draft(&name)).await })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let students = store.snapshot().students;
            assert_eq!(students.len(), (round + 1) * 8);
            let saved = persist::load::<PersistedRecords>(&storage, RECORDS_KEY)
                .await
                .unwrap()
                .expect("roster was saved");
            assert_eq!(saved.students, students);
        }

        let reopened = RecordStore::new(
            Arc::new(MemoryDocuments::new()),
            Arc::new(FileStorage::new(dir.path())),
        );
        reopened.hydrate().await;
        assert_eq!(reopened.snapshot().students, store.snapshot().students);
    }
}
