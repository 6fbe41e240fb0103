//! The orchestration facade: drives a full level run from profile to report.
//!
//! A level run is resolve, extract, validate, then normalize and transform,
//! with every per-document and per-table failure that is not fatal
//! accumulated into the [`RunReport`] instead of aborting. Fatal conditions
//! are a failed mandatory table and a `stop` validation policy firing.
//! Cancellation and the run deadline end the document loop early but keep
//! every fully-processed document; the report comes back flagged
//! `cancelled`, with partially-processed documents discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::{ContextResolver, ExtractionContext, Resolution};
use crate::document::{AdapterRegistry, SourceDescriptor};
use crate::error::{Result, SmelterError};
use crate::extract::ExtractionEngine;
use crate::output::OutputBuilder;
use crate::profile::{ExtractionProfile, FailAction, Level, TableSpec};
use crate::stage::StageGraph;
use crate::table::ExtractedTable;
use crate::transform::TransformPipeline;
use crate::validate::{ValidationEngine, ValidationResult};

/// Cooperative cancellation flag, checked between documents and between
/// strategy invocations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SmelterError::Cancelled);
        }
        Ok(())
    }
}

/// Engine configuration independent of any one profile.
#[derive(Debug, Clone, Default)]
pub struct SmelterConfig {
    /// Cap on concurrent document workers. Zero or one means sequential;
    /// the profile's own `worker_limit` lowers but never raises this.
    pub worker_limit: usize,
    pub cancellation: CancellationToken,
}

/// The report of one level run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub level: String,
    /// Number of source documents offered to the run.
    pub document_count: usize,
    /// Accumulated tables, keyed by table id, merged in source-document
    /// order.
    pub tables: IndexMap<String, ExtractedTable>,
    /// Resolved context per document path.
    pub contexts: IndexMap<String, ExtractionContext>,
    pub validations: Vec<ValidationResult>,
    /// Documents excluded by a `skip_file` context rule.
    pub skipped: Vec<String>,
    /// Tables removed by the `quarantine` validation policy.
    pub quarantined: Vec<String>,
    /// Non-fatal errors, document- or table-scoped.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// True when cancellation or the deadline ended the run early. Only
    /// fully-processed documents are present.
    #[serde(default)]
    pub cancelled: bool,
}

/// The engine facade.
pub struct Smelter {
    config: SmelterConfig,
    adapters: AdapterRegistry,
    resolver: ContextResolver,
    extractor: ExtractionEngine,
    validator: ValidationEngine,
    pipeline: TransformPipeline,
}

impl Smelter {
    pub fn new() -> Self {
        Self::with_config(SmelterConfig::default())
    }

    pub fn with_config(config: SmelterConfig) -> Self {
        Self {
            config,
            adapters: AdapterRegistry::with_builtins(),
            resolver: ContextResolver::new(),
            extractor: ExtractionEngine::new(),
            validator: ValidationEngine::new(),
            pipeline: TransformPipeline::new(),
        }
    }

    /// Replace the source adapter registry.
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Table ids a level would produce, in declaration order.
    pub fn declared_tables(profile: &ExtractionProfile, level: &str) -> Vec<String> {
        profile
            .level(level)
            .map(|l| l.tables.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Execute one level over a set of source documents.
    ///
    /// The profile is validated first; limits are enforced before any
    /// document is read. Documents are processed in input order and their
    /// per-table results merged diagonally in that order, regardless of the
    /// worker count. On cancellation the report is returned with `cancelled`
    /// set, retaining only the documents whose extraction fully finished.
    pub fn run_level(
        &self,
        profile: &ExtractionProfile,
        level_name: &str,
        documents: &[SourceDescriptor],
        overrides: &IndexMap<String, Value>,
    ) -> Result<RunReport> {
        profile.validate()?;
        let level = profile.level(level_name).ok_or_else(|| {
            SmelterError::Configuration(format!("profile has no level '{level_name}'"))
        })?;

        if documents.len() > profile.limits.max_files {
            return Err(SmelterError::Configuration(format!(
                "{} documents exceed the max_files limit of {}",
                documents.len(),
                profile.limits.max_files
            )));
        }

        let deadline = Instant::now() + Duration::from_secs(profile.limits.timeout_secs);
        let token = &self.config.cancellation;
        let workers = self
            .config
            .worker_limit
            .max(1)
            .min(profile.limits.worker_limit.max(1));

        info!(
            level = level_name,
            documents = documents.len(),
            workers,
            "starting level run"
        );

        let mut report = RunReport {
            level: level_name.to_string(),
            document_count: documents.len(),
            ..RunReport::default()
        };

        let mut outcomes = Vec::with_capacity(documents.len());
        let mut cancelled = false;
        'documents: for chunk in documents.chunks(workers) {
            if token.is_cancelled() || Instant::now() > deadline {
                warn!(level = level_name, "run interrupted; keeping completed documents");
                cancelled = true;
                break;
            }

            if workers == 1 {
                match self.process_document(profile, level, &chunk[0], overrides) {
                    Ok(outcome) => outcomes.push(outcome),
                    // A mid-document interruption discards that document only.
                    Err(SmelterError::Cancelled) => {
                        cancelled = true;
                        break;
                    }
                    Err(error) => return Err(error),
                }
            } else {
                let batch: Vec<Result<DocumentOutcome>> = thread::scope(|scope| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|descriptor| {
                            scope.spawn(move || {
                                self.process_document(profile, level, descriptor, overrides)
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| match handle.join() {
                            Ok(outcome) => outcome,
                            Err(panic) => std::panic::resume_unwind(panic),
                        })
                        .collect()
                });
                for outcome in batch {
                    match outcome {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(SmelterError::Cancelled) => {
                            cancelled = true;
                            break 'documents;
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
        report.cancelled = cancelled;

        // Merge in document order so concatenated row order is stable.
        for outcome in outcomes {
            match outcome {
                DocumentOutcome::Skipped { path, field } => {
                    info!(path = %path, field, "document skipped by context rule");
                    report.skipped.push(path);
                }
                DocumentOutcome::Failed { path, message } => {
                    report.errors.push(format!("{path}: {message}"));
                }
                DocumentOutcome::Extracted {
                    path,
                    context,
                    tables,
                } => {
                    report.contexts.insert(path.clone(), context);
                    for (spec, extracted) in tables {
                        match extracted {
                            Ok(table) => {
                                report
                                    .tables
                                    .entry(spec.id.clone())
                                    .or_insert_with(ExtractedTable::empty)
                                    .union_concat(table);
                            }
                            Err(error) if spec.mandatory => return Err(error),
                            Err(error) => {
                                report.errors.push(format!("{path}: {error}"));
                            }
                        }
                    }
                }
            }
        }

        self.validate_and_transform(profile, level, &mut report)?;
        info!(
            level = level_name,
            tables = report.tables.len(),
            errors = report.errors.len(),
            "level run finished"
        );
        Ok(report)
    }

    /// Prepend resolved context fields as leading columns of a table.
    ///
    /// Context application is a caller-controlled step, distinct from
    /// extraction; tables come out of a run context-free.
    pub fn apply_context(&self, table: &mut ExtractedTable, context: &ExtractionContext) {
        let fields: Vec<(String, Value)> = context
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        table.prepend_columns(&fields);
    }

    /// Assemble the profile's declared deliverables from a run report.
    pub fn build_outputs(
        &self,
        profile: &ExtractionProfile,
        report: &RunReport,
    ) -> Result<IndexMap<String, ExtractedTable>> {
        let builder = OutputBuilder::new();
        let mut outputs = IndexMap::new();
        for spec in &profile.outputs {
            let table = builder.build(spec, &report.tables)?;
            outputs.insert(spec.name().to_string(), table);
        }
        Ok(outputs)
    }

    /// Execute a level run as a stage body, reusing a stored artifact when
    /// the inputs are unchanged.
    pub fn run_stage(
        &self,
        graph: &mut StageGraph,
        stage: &str,
        profile: &ExtractionProfile,
        level_name: &str,
        documents: &[SourceDescriptor],
        overrides: &IndexMap<String, Value>,
    ) -> Result<RunReport> {
        let inputs = json!({
            "profile": profile,
            "level": level_name,
            "documents": documents.iter().map(|d| d.full_path()).collect::<Vec<_>>(),
            "overrides": overrides,
        });

        let id = graph.lock(stage, &inputs, || {
            let report = self.run_level(profile, level_name, documents, overrides)?;
            // A partial report must not become the stage's artifact; the
            // failed body leaves the stage unlocked for a clean retry.
            if report.cancelled {
                return Err(SmelterError::Cancelled);
            }
            Ok(serde_json::to_value(report)?)
        })?;

        let data = graph
            .artifact_by_id(&id)?
            .ok_or_else(|| SmelterError::StageGraph(format!("artifact '{id}' missing")))?;
        Ok(serde_json::from_value(data)?)
    }

    fn process_document(
        &self,
        profile: &ExtractionProfile,
        level: &Level,
        descriptor: &SourceDescriptor,
        overrides: &IndexMap<String, Value>,
    ) -> Result<DocumentOutcome> {
        let token = &self.config.cancellation;
        token.check()?;
        let path = descriptor.full_path();

        let content = match self.adapters.load(descriptor) {
            Ok(content) => content,
            Err(error) => {
                return Ok(DocumentOutcome::Failed {
                    path,
                    message: error.to_string(),
                });
            }
        };

        let context = match self.resolver.resolve(
            &profile.context_defaults,
            descriptor,
            &content,
            overrides,
        ) {
            Ok(Resolution::Resolved(context)) => context,
            Ok(Resolution::Skipped { field }) => {
                return Ok(DocumentOutcome::Skipped { path, field });
            }
            Err(error @ SmelterError::Context { .. }) => {
                return Ok(DocumentOutcome::Failed {
                    path,
                    message: error.to_string(),
                });
            }
            Err(error) => return Err(error),
        };

        let mut tables = Vec::with_capacity(level.tables.len());
        for spec in &level.tables {
            token.check()?;
            tables.push((spec.clone(), self.extractor.extract(spec, &content)));
        }

        Ok(DocumentOutcome::Extracted {
            path,
            context,
            tables,
        })
    }

    /// Validate accumulated tables, apply the failure policy, then run
    /// normalization, per-table transforms, and profile transformations.
    fn validate_and_transform(
        &self,
        profile: &ExtractionProfile,
        level: &Level,
        report: &mut RunReport,
    ) -> Result<()> {
        for spec in &level.tables {
            let Some(table) = report.tables.get(&spec.id) else {
                continue;
            };
            let result = self.validator.validate(table, spec, &profile.validation);
            let invalid = !result.valid;
            report.validations.push(result);

            if invalid {
                match profile.validation.on_validation_fail {
                    FailAction::Continue => {}
                    FailAction::Stop => {
                        return Err(SmelterError::extraction(
                            &spec.id,
                            "validation failed with stop policy",
                        ));
                    }
                    FailAction::Quarantine => {
                        report.tables.shift_remove(&spec.id);
                        report.quarantined.push(spec.id.clone());
                    }
                }
            }
        }

        for spec in &level.tables {
            let Some(table) = report.tables.get_mut(&spec.id) else {
                continue;
            };
            self.pipeline.normalize(table, &profile.normalization);
            let mut warnings = self
                .pipeline
                .apply_column_transforms(table, &spec.column_transforms);
            warnings.extend(self.pipeline.apply_transformations(
                &spec.id,
                table,
                &profile.transformations,
            ));
            report
                .warnings
                .extend(warnings.into_iter().map(|w| format!("{}: {w}", spec.id)));
        }

        Ok(())
    }
}

impl Default for Smelter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-document result, produced by workers and merged in input order.
enum DocumentOutcome {
    Skipped {
        path: String,
        field: String,
    },
    Failed {
        path: String,
        message: String,
    },
    Extracted {
        path: String,
        context: ExtractionContext,
        tables: Vec<(TableSpec, Result<ExtractedTable>)>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_shared_across_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(SmelterError::Cancelled)));
    }

    #[test]
    fn test_declared_tables_in_order() {
        let profile = ExtractionProfile::from_json(
            r#"{
                "schema_version": "1.0",
                "name": "p",
                "levels": [{"name": "run", "tables": [
                    {"id": "b", "select": {"strategy": "flat_object", "path": "x"}},
                    {"id": "a", "select": {"strategy": "flat_object", "path": "y"}}
                ]}]
            }"#,
        )
        .unwrap();

        assert_eq!(Smelter::declared_tables(&profile, "run"), vec!["b", "a"]);
        assert!(Smelter::declared_tables(&profile, "absent").is_empty());
    }

    #[test]
    fn test_unknown_level_is_configuration_error() {
        let profile = ExtractionProfile::from_json(
            r#"{"schema_version": "1.0", "name": "p"}"#,
        )
        .unwrap();

        let err = Smelter::new()
            .run_level(&profile, "nope", &[], &IndexMap::new())
            .unwrap_err();
        assert!(matches!(err, SmelterError::Configuration(_)));
    }
}
