//! Structure files: persisting uploads and resolving the agent's latest result.

mod models;
mod persist;
mod resolver;

pub use models::{DEFAULT_STRUCTURE_NAME, STRUCTURE_PATTERNS, StructureFile, StructurePayload};
pub use persist::persist;
pub use resolver::latest;
