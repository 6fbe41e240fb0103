//! Content-addressed artifact storage.
//!
//! Artifact identifiers are SHA-256 digests over a canonical JSON form of
//! the inputs that determine a stage's output, so identical canonical inputs
//! always map to the identical identifier. Stores are append-only: an id is
//! never overwritten in place.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Result, SmelterError};

/// Serialize a JSON value canonically: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, value) in map {
                sorted.insert(key, canonical_json(value));
            }
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{v}", serde_json::to_string(k).unwrap_or_default()))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Compute the deterministic artifact identifier for canonicalized inputs.
pub fn artifact_id(inputs: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(inputs).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content-addressed get/put contract. No in-place update.
pub trait ArtifactStore {
    fn get(&self, id: &str) -> Result<Option<Value>>;
    fn put(&mut self, id: &str, data: &Value) -> Result<()>;
}

/// In-memory artifact store.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: IndexMap<String, Value>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.artifacts.get(id).cloned())
    }

    fn put(&mut self, id: &str, data: &Value) -> Result<()> {
        // Append-only: identical id means identical content by construction.
        self.artifacts
            .entry(id.to_string())
            .or_insert_with(|| data.clone());
        Ok(())
    }
}

/// Artifact store backed by one JSON file per identifier.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    /// Create a store rooted at the given directory (created on first put).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

impl ArtifactStore for FileArtifactStore {
    fn get(&self, id: &str) -> Result<Option<Value>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|source| SmelterError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }

    fn put(&mut self, id: &str, data: &Value) -> Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|source| SmelterError::Io {
            path: self.root.clone(),
            source,
        })?;
        let file = File::create(&path).map_err(|source| SmelterError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::to_writer(BufWriter::new(file), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 2, "a": 1});
        assert_eq!(canonical_json(&value), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_artifact_id_deterministic_and_order_insensitive() {
        let a = json!({"profile": "p", "docs": ["x.json"]});
        let b = json!({"docs": ["x.json"], "profile": "p"});

        assert_eq!(artifact_id(&a), artifact_id(&b));
        assert_eq!(artifact_id(&a), artifact_id(&a));
        assert_ne!(artifact_id(&a), artifact_id(&json!({"profile": "q"})));
    }

    #[test]
    fn test_memory_store_append_only() {
        let mut store = MemoryArtifactStore::new();
        store.put("id1", &json!({"v": 1})).unwrap();
        store.put("id1", &json!({"v": 2})).unwrap();

        assert_eq!(store.get("id1").unwrap(), Some(json!({"v": 1})));
        assert_eq!(store.get("absent").unwrap(), None);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileArtifactStore::new(dir.path().join("artifacts"));

        let data = json!({"rows": [1, 2, 3]});
        store.put("abc123", &data).unwrap();
        assert_eq!(store.get("abc123").unwrap(), Some(data));
        assert_eq!(store.get("missing").unwrap(), None);
    }
}
