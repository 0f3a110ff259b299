//! Structure payloads and resolved structure files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name used when an uploaded structure does not carry a usable one.
pub const DEFAULT_STRUCTURE_NAME: &str = "structure.poscar";

/// Glob patterns of recognized structure file names.
pub const STRUCTURE_PATTERNS: [&str; 7] = [
    "*.cif", "*.poscar", "*.extxyz", "*.vasp", "*.xyz", "*.POSCAR", "*.pdb",
];

/// Structure embedded in a run request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructurePayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Number of atoms as sent by the client. Clients send numbers or strings.
    #[serde(default)]
    pub atom_count: Option<Value>,
}

impl StructurePayload {
    /// Atom count as an integer, if the client sent something numeric.
    ///
    /// Floats are truncated toward zero; strings must hold an integer.
    pub fn parsed_atom_count(&self) -> Option<i64> {
        match self.atom_count.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Base name to write under `inputs/`. Directory components are dropped.
    pub fn target_file_name(&self) -> String {
        self.file_name
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_STRUCTURE_NAME)
            .to_string()
    }
}

/// A structure artifact found in the workspace.
#[derive(Debug, Clone, Serialize)]
pub struct StructureFile {
    pub path: PathBuf,
    pub file_name: String,
    /// Extension without the dot, e.g. `cif`.
    pub format: String,
    pub modified: DateTime<Utc>,
    pub content: String,
}
