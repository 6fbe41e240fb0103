//! Smelter: profile-driven extraction of tabular data from heterogeneous
//! source documents.
//!
//! A declarative extraction profile names the tables to pull out of each
//! document, the contextual metadata to resolve around them, and the
//! validation, normalization, and output rules to apply. The engine runs the
//! profile over a batch of documents and accumulates everything into a
//! single report.
//!
//! # Core Principles
//!
//! - **Declarative**: the profile is data; the engine has no per-dataset code
//! - **Deterministic**: identical inputs produce identical tables and ids
//! - **Non-destructive**: stage artifacts are content-addressed and append-only
//!
//! # Example
//!
//! ```no_run
//! use indexmap::IndexMap;
//! use smelter::{ExtractionProfile, Smelter, SourceDescriptor};
//!
//! let json = std::fs::read_to_string("profiles/etch.profile.json").unwrap();
//! let profile = ExtractionProfile::from_json(&json).unwrap();
//! let documents = vec![SourceDescriptor::new("runs/lot_42.json")];
//!
//! let smelter = Smelter::new();
//! let report = smelter
//!     .run_level(&profile, "run", &documents, &IndexMap::new())
//!     .unwrap();
//!
//! println!("Tables: {}", report.tables.len());
//! println!("Errors: {}", report.errors.len());
//! ```

pub mod context;
pub mod document;
pub mod error;
pub mod extract;
pub mod output;
pub mod profile;
pub mod stage;
pub mod table;
pub mod transform;
pub mod validate;

mod run;

pub use context::{ContextLayer, ContextResolver, ExtractionContext, Resolution};
pub use document::{AdapterRegistry, SourceAdapter, SourceDescriptor};
pub use error::{Result, SmelterError};
pub use profile::{ExtractionProfile, FileProfileStore, ProfileStore, SelectSpec, TableSpec};
pub use run::{CancellationToken, RunReport, Smelter, SmelterConfig};
pub use stage::{ArtifactStore, FileArtifactStore, MemoryArtifactStore, StageDef, StageGraph, StageState};
pub use table::ExtractedTable;
pub use validate::{ValidationEngine, ValidationResult};
