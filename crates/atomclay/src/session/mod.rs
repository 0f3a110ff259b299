//! Session tracking.
//!
//! Only the most recent session is remembered. Observing a different session
//! id resets the shared workspace.

mod models;
mod tracker;

pub use models::{Session, SessionTransition};
pub use tracker::SessionTracker;
