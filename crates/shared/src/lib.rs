pub mod identity;
pub mod student;
pub mod validation;

pub use identity::*;
pub use student::*;
pub use validation::ValidationErrors;

/// Name of the remote collection holding student documents.
pub const STUDENTS_COLLECTION: &str = "students";
