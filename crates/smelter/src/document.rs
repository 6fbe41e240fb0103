//! Source document boundary: adapters that decode files into content trees,
//! plus the restricted path grammar evaluated against those trees.
//!
//! The engine never touches raw bytes; format decoding lives entirely behind
//! [`SourceAdapter`]. Adapters are registered on an explicitly constructed
//! [`AdapterRegistry`] value passed into the engine at startup.

use std::fs::File;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{Result, SmelterError};

/// Identifies a source document within a run.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Relative path to the document.
    pub path: PathBuf,
}

impl SourceDescriptor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File name without directories.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parent directory portion of the path.
    pub fn parent_path(&self) -> String {
        self.path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Full relative path.
    pub fn full_path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Lowercased file extension, used for adapter dispatch.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }
}

/// Decodes a document into a content tree of nested maps/sequences/scalars.
pub trait SourceAdapter: Send + Sync {
    /// Format tag this adapter handles (matched against file extension).
    fn format(&self) -> &str;

    /// Load and decode the document at `path`.
    fn load(&self, path: &Path) -> Result<Value>;
}

/// Adapter for JSON documents.
pub struct JsonAdapter;

impl SourceAdapter for JsonAdapter {
    fn format(&self) -> &str {
        "json"
    }

    fn load(&self, path: &Path) -> Result<Value> {
        let file = File::open(path).map_err(|source| SmelterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Adapter for CSV documents.
///
/// Rows decode to an array of objects keyed by header, so downstream
/// strategies see the same content-tree shape as JSON sources.
pub struct CsvAdapter {
    delimiter: u8,
}

impl CsvAdapter {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for CsvAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceAdapter for CsvAdapter {
    fn format(&self) -> &str {
        "csv"
    }

    fn load(&self, path: &Path) -> Result<Value> {
        let file = File::open(path).map_err(|source| SmelterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .from_reader(file);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut object = Map::new();
            for (header, field) in headers.iter().zip(record.iter()) {
                object.insert(header.clone(), Value::String(field.to_string()));
            }
            rows.push(Value::Object(object));
        }

        Ok(Value::Array(rows))
    }
}

/// Explicitly constructed adapter registry, keyed by format tag.
///
/// No module-level singletons: callers build one and hand it to the engine.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the bundled JSON and CSV adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JsonAdapter);
        registry.register(CsvAdapter::new());
        registry
    }

    /// Register an adapter under its format tag.
    pub fn register(&mut self, adapter: impl SourceAdapter + 'static) {
        self.adapters
            .insert(adapter.format().to_string(), Box::new(adapter));
    }

    /// Find the adapter for a document, by extension.
    pub fn adapter_for(&self, descriptor: &SourceDescriptor) -> Result<&dyn SourceAdapter> {
        let ext = descriptor.extension();
        self.adapters
            .get(ext.as_str())
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                SmelterError::Configuration(format!(
                    "no source adapter registered for format '{ext}'"
                ))
            })
    }

    /// Load a document through its matching adapter.
    pub fn load(&self, descriptor: &SourceDescriptor) -> Result<Value> {
        self.adapter_for(descriptor)?.load(&descriptor.path)
    }
}

/// Evaluate a restricted path expression against a content tree.
///
/// Grammar: dot-separated segments; `name[3]` or a bare numeric segment
/// indexes into arrays. An empty path selects the root. Returns `None` when
/// any segment fails to resolve.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        let (name, index) = split_index(segment);

        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                Value::Array(items) => {
                    let i: usize = name.parse().ok()?;
                    items.get(i)?
                }
                _ => return None,
            };
        }

        if let Some(i) = index {
            current = match current {
                Value::Array(items) => items.get(i)?,
                _ => return None,
            };
        }
    }
    Some(current)
}

/// Split `name[3]` into `("name", Some(3))`; plain segments pass through.
fn split_index(segment: &str) -> (&str, Option<usize>) {
    if let Some(open) = segment.find('[') {
        if let Some(stripped) = segment[open..].strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Ok(i) = stripped.parse() {
                return (&segment[..open], Some(i));
            }
        }
    }
    (segment, None)
}
