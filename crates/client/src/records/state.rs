use serde::{Deserialize, Serialize};
use shared::{Student, StudentId, StudentPatch};

/// Observable state of the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordState {
    /// Cached records in the order they were confirmed or listed.
    pub students: Vec<Student>,
    pub loading: bool,
    pub error: Option<String>,
    pub hydrated: bool,
}

impl Default for RecordState {
    fn default() -> Self {
        // Loading until the first fetch settles.
        Self {
            students: Vec::new(),
            loading: true,
            error: None,
            hydrated: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecords {
    pub students: Vec<Student>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Started,
    /// The remote store confirmed a new record.
    Created(Student),
    /// The remote store accepted a partial update.
    Updated { id: StudentId, patch: StudentPatch },
    Deleted(StudentId),
    /// A full fetch replaced the cache.
    Replaced(Vec<Student>),
    Failed(String),
    Rehydrated(Option<PersistedRecords>),
}

impl RecordState {
    pub fn apply(mut self, event: RecordEvent) -> Self {
        match event {
            RecordEvent::Started => {
                self.loading = true;
                self.error = None;
            }
            RecordEvent::Created(student) => {
                // A concurrent fetch may already have cached it; ids stay unique.
                match self.position(&student.id) {
                    Some(index) => self.students[index] = student,
                    None => self.students.push(student),
                }
                self.loading = false;
            }
            RecordEvent::Updated { id, patch } => {
                if let Some(index) = self.position(&id) {
                    patch.apply_to(&mut self.students[index].profile);
                }
                self.loading = false;
            }
            RecordEvent::Deleted(id) => {
                self.students.retain(|s| s.id != id);
                self.loading = false;
            }
            RecordEvent::Replaced(students) => {
                self.students = students;
                self.loading = false;
            }
            RecordEvent::Failed(message) => {
                self.error = Some(message);
                self.loading = false;
            }
            RecordEvent::Rehydrated(_) if self.hydrated => {}
            RecordEvent::Rehydrated(persisted) => {
                if let Some(persisted) = persisted {
                    self.students = persisted.students;
                }
                self.hydrated = true;
            }
        }
        self
    }

    pub fn get(&self, id: &StudentId) -> Option<&Student> {
        self.students.iter().find(|s| &s.id == id)
    }

    pub fn persisted(&self) -> PersistedRecords {
        PersistedRecords {
            students: self.students.clone(),
        }
    }

    fn position(&self, id: &StudentId) -> Option<usize> {
        self.students.iter().position(|s| &s.id == id)
    }
}
