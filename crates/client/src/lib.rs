//! Client-side state for the student roster dashboard.
//!
//! A [`Dashboard`] owns a [`SessionStore`] (who is signed in) and a
//! [`RecordStore`] (the cached student records). Both mediate every call to
//! their remote backend, publish immutable snapshots over a watch channel,
//! and persist what should survive a restart.

pub mod backend;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod persist;
pub mod records;
pub mod session;
pub mod telemetry;

pub use config::ClientConfig;
pub use dashboard::Dashboard;
pub use error::{Error, Result};
pub use records::{RecordState, RecordStore};
pub use session::{SessionState, SessionStore};
