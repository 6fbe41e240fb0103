//! Stage lifecycle state machine.
//!
//! Stages transition `Unlocked -> Locked -> Completed` along declared edges
//! only. Locking gates on dependencies, computes a content-addressed
//! artifact identifier from canonicalized inputs, and either reuses the
//! stored artifact verbatim or executes the stage body. Unlocking cascades
//! to downstream dependents; artifacts are never deleted, so re-locking with
//! unchanged inputs is free.

mod artifact;

pub use artifact::{
    artifact_id, canonical_json, ArtifactStore, FileArtifactStore, MemoryArtifactStore,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SmelterError};

/// Lifecycle state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Editable; no committed artifact contributes to gating.
    Unlocked,
    /// Body executed or reused; contributes to downstream gating.
    Locked,
    /// Terminal success marker. A mere lock can represent partial or
    /// cancelled work; completion cannot.
    Completed,
}

/// Per-run, per-stage state. Created on the first lock attempt, mutated only
/// by graph operations, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub state: StageState,
    /// Identifier of the stage's artifact, once locked.
    pub artifact_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    fn new(stage: &str) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.to_string(),
            state: StageState::Unlocked,
            artifact_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, state: StageState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// A dependency edge of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub stage: String,
    /// The dependency must be `Completed`, not merely `Locked`.
    #[serde(default)]
    pub must_complete: bool,
}

/// Declaration of one stage and its hard dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
}

impl StageDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
        }
    }

    /// Add a hard dependency.
    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(Dependency {
            stage: stage.into(),
            must_complete: false,
        });
        self
    }

    /// Add a hard dependency that must also be completed.
    pub fn after_completed(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(Dependency {
            stage: stage.into(),
            must_complete: true,
        });
        self
    }
}

/// The orchestrating state machine for a run's stages.
pub struct StageGraph {
    defs: IndexMap<String, StageDef>,
    records: IndexMap<String, StageRecord>,
    /// Static cascade table: stage -> transitive downstream dependents.
    dependents: IndexMap<String, Vec<String>>,
    store: Box<dyn ArtifactStore>,
}

impl StageGraph {
    /// Build a graph from stage declarations.
    ///
    /// Dependencies must reference declared stages; edges must be acyclic
    /// (declaration order is construction order, so a forward reference is
    /// rejected as a configuration error).
    pub fn new(defs: Vec<StageDef>, store: Box<dyn ArtifactStore>) -> Result<Self> {
        let mut map: IndexMap<String, StageDef> = IndexMap::new();
        for def in defs {
            for dep in &def.depends_on {
                if !map.contains_key(&dep.stage) {
                    return Err(SmelterError::Configuration(format!(
                        "stage '{}' depends on undeclared stage '{}'",
                        def.id, dep.stage
                    )));
                }
            }
            if map.insert(def.id.clone(), def).is_some() {
                return Err(SmelterError::Configuration(
                    "duplicate stage id".to_string(),
                ));
            }
        }

        // Transitive closure of the reverse dependency edges.
        let mut dependents: IndexMap<String, Vec<String>> =
            map.keys().map(|k| (k.clone(), Vec::new())).collect();
        for (id, def) in &map {
            for dep in &def.depends_on {
                let mut queue = vec![dep.stage.clone()];
                while let Some(upstream) = queue.pop() {
                    let downstream = dependents.get_mut(&upstream).expect("declared stage");
                    if !downstream.contains(id) {
                        downstream.push(id.clone());
                    }
                    if let Some(up_def) = map.get(&upstream) {
                        queue.extend(up_def.depends_on.iter().map(|d| d.stage.clone()));
                    }
                }
            }
        }

        Ok(Self {
            defs: map,
            records: IndexMap::new(),
            dependents,
            store,
        })
    }

    /// Current state of a stage. Stages with no record yet are `Unlocked`.
    pub fn state(&self, stage: &str) -> StageState {
        self.records
            .get(stage)
            .map(|r| r.state)
            .unwrap_or(StageState::Unlocked)
    }

    /// The stage's record, if a lock was ever attempted.
    pub fn record(&self, stage: &str) -> Option<&StageRecord> {
        self.records.get(stage)
    }

    /// Fetch a stage's stored artifact data.
    pub fn artifact(&self, stage: &str) -> Result<Option<Value>> {
        match self.records.get(stage).and_then(|r| r.artifact_id.as_ref()) {
            Some(id) => self.store.get(id),
            None => Ok(None),
        }
    }

    /// Fetch artifact data directly by identifier.
    pub fn artifact_by_id(&self, id: &str) -> Result<Option<Value>> {
        self.store.get(id)
    }

    /// Lock a stage.
    ///
    /// Gating: every hard dependency must be `Locked` (or `Completed` when
    /// flagged `must_complete`); otherwise this fails synchronously with no
    /// state change. On a permitted attempt the artifact identifier is
    /// computed from the canonicalized inputs; an existing artifact is
    /// reused verbatim without running the body. Locking an already-locked
    /// stage with identical canonical inputs is an idempotent no-op that
    /// returns the same identifier.
    pub fn lock<F>(&mut self, stage: &str, inputs: &Value, body: F) -> Result<String>
    where
        F: FnOnce() -> Result<Value>,
    {
        let def = self.defs.get(stage).ok_or_else(|| {
            SmelterError::StageGraph(format!("unknown stage '{stage}'"))
        })?;

        if self.state(stage) != StageState::Unlocked {
            let record = self.records.get(stage).expect("locked stage has a record");
            let id = artifact_id(inputs);
            // Identical inputs: the stored artifact stands, the body never
            // runs, and the state (Locked or Completed) is untouched.
            if record.artifact_id.as_deref() == Some(id.as_str()) {
                debug!(stage, artifact = %id, "idempotent re-lock");
                return Ok(id);
            }
            return Err(SmelterError::StageGraph(format!(
                "stage '{stage}' is locked with different inputs; unlock it first"
            )));
        }

        for dep in &def.depends_on {
            let state = self.state(&dep.stage);
            let satisfied = match dep.must_complete {
                true => state == StageState::Completed,
                false => state == StageState::Locked || state == StageState::Completed,
            };
            if !satisfied {
                return Err(SmelterError::StageGraph(format!(
                    "stage '{stage}' requires '{}' to be {}",
                    dep.stage,
                    if dep.must_complete { "completed" } else { "locked" }
                )));
            }
        }

        // Record exists from the first lock attempt onward.
        self.records
            .entry(stage.to_string())
            .or_insert_with(|| StageRecord::new(stage));

        let id = artifact_id(inputs);
        let reused = self.store.get(&id)?.is_some();
        if !reused {
            // Body failure or cancellation leaves the stage unlocked.
            let data = body()?;
            self.store.put(&id, &data)?;
        }
        debug!(stage, artifact = %id, reused, "stage locked");

        let record = self.records.get_mut(stage).expect("record created above");
        record.artifact_id = Some(id.clone());
        record.transition(StageState::Locked);
        Ok(id)
    }

    /// Mark a locked stage as completed.
    pub fn complete(&mut self, stage: &str) -> Result<()> {
        if self.state(stage) != StageState::Locked {
            return Err(SmelterError::StageGraph(format!(
                "stage '{stage}' must be locked before completion"
            )));
        }
        self.records
            .get_mut(stage)
            .expect("locked stage has a record")
            .transition(StageState::Completed);
        Ok(())
    }

    /// Unlock a stage and cascade to its downstream dependents.
    ///
    /// Every currently locked or completed dependent returns to `Unlocked`.
    /// Stored artifacts are untouched, so re-locking with unchanged inputs
    /// reuses them without re-execution. Returns the stages that changed
    /// state, cascade targets included.
    pub fn unlock(&mut self, stage: &str) -> Result<Vec<String>> {
        if !self.defs.contains_key(stage) {
            return Err(SmelterError::StageGraph(format!("unknown stage '{stage}'")));
        }

        let mut changed = Vec::new();
        let mut targets = vec![stage.to_string()];
        if let Some(downstream) = self.dependents.get(stage) {
            targets.extend(downstream.iter().cloned());
        }

        for target in targets {
            if let Some(record) = self.records.get_mut(&target) {
                if record.state != StageState::Unlocked {
                    record.transition(StageState::Unlocked);
                    debug!(stage = %target, "stage unlocked");
                    changed.push(target);
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn chain_graph() -> StageGraph {
        StageGraph::new(
            vec![
                StageDef::new("a"),
                StageDef::new("b").after("a"),
                StageDef::new("c").after("b"),
            ],
            Box::new(MemoryArtifactStore::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_lock_gated_on_dependencies() {
        let mut graph = chain_graph();

        let err = graph.lock("b", &json!(1), || Ok(json!("body"))).unwrap_err();
        assert!(matches!(err, SmelterError::StageGraph(_)));
        // Zero state mutation on a rejected lock.
        assert_eq!(graph.state("b"), StageState::Unlocked);
        assert!(graph.record("b").is_none() || graph.record("b").unwrap().artifact_id.is_none());

        graph.lock("a", &json!(1), || Ok(json!("a-out"))).unwrap();
        graph.lock("b", &json!(2), || Ok(json!("b-out"))).unwrap();
        assert_eq!(graph.state("b"), StageState::Locked);
    }

    #[test]
    fn test_idempotent_relock_runs_body_once() {
        let mut graph = chain_graph();
        let calls = Cell::new(0);

        let id1 = graph
            .lock("a", &json!({"docs": ["x"]}), || {
                calls.set(calls.get() + 1);
                Ok(json!("result"))
            })
            .unwrap();
        graph.unlock("a").unwrap();
        let id2 = graph
            .lock("a", &json!({"docs": ["x"]}), || {
                calls.set(calls.get() + 1);
                Ok(json!("result"))
            })
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_relock_without_unlock_is_idempotent() {
        let mut graph = chain_graph();
        let calls = Cell::new(0);
        let inputs = json!({"docs": ["x"]});

        let id1 = graph
            .lock("a", &inputs, || {
                calls.set(calls.get() + 1);
                Ok(json!("out"))
            })
            .unwrap();
        let id2 = graph
            .lock("a", &inputs, || {
                calls.set(calls.get() + 1);
                Ok(json!("out"))
            })
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(calls.get(), 1);
        assert_eq!(graph.state("a"), StageState::Locked);

        // Still idempotent once completed; different inputs need an unlock.
        graph.complete("a").unwrap();
        let id3 = graph.lock("a", &inputs, || Ok(json!("out"))).unwrap();
        assert_eq!(id3, id1);
        assert_eq!(graph.state("a"), StageState::Completed);

        let err = graph
            .lock("a", &json!({"docs": ["y"]}), || Ok(json!("other")))
            .unwrap_err();
        assert!(matches!(err, SmelterError::StageGraph(_)));
        assert_eq!(graph.state("a"), StageState::Completed);
    }

    #[test]
    fn test_cascade_unlock_preserves_artifacts() {
        let mut graph = chain_graph();
        graph.lock("a", &json!("a"), || Ok(json!("a-data"))).unwrap();
        graph.lock("b", &json!("b"), || Ok(json!("b-data"))).unwrap();
        graph.lock("c", &json!("c"), || Ok(json!("c-data"))).unwrap();

        let changed = graph.unlock("a").unwrap();
        assert_eq!(changed, vec!["a", "b", "c"]);
        for stage in ["a", "b", "c"] {
            assert_eq!(graph.state(stage), StageState::Unlocked);
        }

        // Artifacts survive the cascade.
        assert_eq!(graph.artifact("b").unwrap(), Some(json!("b-data")));
        assert_eq!(graph.artifact("c").unwrap(), Some(json!("c-data")));
    }

    #[test]
    fn test_must_complete_gating() {
        let mut graph = StageGraph::new(
            vec![
                StageDef::new("extract"),
                StageDef::new("report").after_completed("extract"),
            ],
            Box::new(MemoryArtifactStore::new()),
        )
        .unwrap();

        graph.lock("extract", &json!(1), || Ok(json!("x"))).unwrap();
        assert!(graph.lock("report", &json!(2), || Ok(json!("r"))).is_err());

        graph.complete("extract").unwrap();
        graph.lock("report", &json!(2), || Ok(json!("r"))).unwrap();
    }

    #[test]
    fn test_body_failure_leaves_stage_unlocked() {
        let mut graph = chain_graph();
        let err = graph
            .lock("a", &json!(1), || Err(SmelterError::Cancelled))
            .unwrap_err();
        assert!(matches!(err, SmelterError::Cancelled));
        assert_eq!(graph.state("a"), StageState::Unlocked);
        // The record itself exists from the first attempt.
        assert!(graph.record("a").is_some());
    }

    #[test]
    fn test_complete_requires_locked() {
        let mut graph = chain_graph();
        assert!(graph.complete("a").is_err());
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let result = StageGraph::new(
            vec![StageDef::new("b").after("a"), StageDef::new("a")],
            Box::new(MemoryArtifactStore::new()),
        );
        assert!(result.is_err());
    }
}
