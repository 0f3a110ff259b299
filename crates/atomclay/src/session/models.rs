//! Session data types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the random part of generated identifiers.
const ID_SUFFIX_LEN: usize = 6;

/// One user/agent interaction, identified by a `(user_id, session_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
}

impl Session {
    /// Generate a fresh pair of identifiers (`u_xxxxxx`, `s_xxxxxx`).
    pub fn generate() -> Self {
        Self {
            user_id: short_id("u"),
            session_id: short_id("s"),
        }
    }
}

fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..ID_SUFFIX_LEN])
}

/// Result of checking an incoming session id against the active one.
#[derive(Debug, Clone)]
pub enum SessionTransition {
    /// The id matches the active session; nothing happened.
    Unchanged,
    /// A new session became active and the workspace was reset.
    Started {
        previous: Option<String>,
        report: crate::workspace::CleanupReport,
    },
}

impl SessionTransition {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_prefix_and_length() {
        let session = Session::generate();
        assert!(session.user_id.starts_with("u_"));
        assert!(session.session_id.starts_with("s_"));
        assert_eq!(session.user_id.len(), 2 + ID_SUFFIX_LEN);
        assert_eq!(session.session_id.len(), 2 + ID_SUFFIX_LEN);
        assert!(session.session_id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
