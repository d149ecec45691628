//! The filesystem half of the persisted-state layout in the run-manifest
//! contract: `runs/{run_id}/manifest.json`, one verdict per candidate
//! under `runs/{run_id}/verdicts/{query_id}/`, and the candidate SQL
//! itself under `runs/{run_id}/candidates/{query_id}/`, kept separate from
//! the run-independent verdict cache so a run's provenance trail survives
//! even if the cache is cleared.
//!
//! This is a concrete, optional collaborator -- [`Engine::run`] returns a
//! [`crate::RunOutcome`] whether or not a caller chooses to persist it.
//! Writing the layout is a separate step a caller opts into via
//! [`RunStore::save`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::candidate::Candidate;
use crate::error::Result;
use crate::manifest::RunManifest;
use crate::validation::ValidationVerdict;

/// Durable storage for one run's manifest, candidates, and verdicts.
/// Implementations only need to honor the path layout; *how* bytes reach
/// disk (plain files, an object store, whatever) is up to them.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_manifest(&self, manifest: &RunManifest) -> Result<()>;
    async fn save_candidate(&self, query_id: &str, run_id: &str, candidate: &Candidate) -> Result<()>;
    async fn save_verdict(&self, query_id: &str, run_id: &str, verdict: &ValidationVerdict) -> Result<()>;
    async fn load_manifest(&self, run_id: &str) -> Result<Option<RunManifest>>;
}

/// Writes the layout described in the run-manifest contract directly
/// under a root directory:
///
/// ```text
/// {root}/runs/{run_id}/manifest.json
/// {root}/runs/{run_id}/verdicts/{query_id}/{candidate_id}.json
/// {root}/runs/{run_id}/candidates/{query_id}/{candidate_id}.sql
/// ```
pub struct FileSystemRunStore {
    root: PathBuf,
}

impl FileSystemRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    async fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| crate::error::Error::cache(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(path, json).await.map_err(|e| crate::error::Error::cache(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileSystemRunStore {
    async fn save_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.run_dir(&manifest.run_id).join("manifest.json");
        Self::write_json(&path, manifest).await
    }

    async fn save_candidate(&self, query_id: &str, run_id: &str, candidate: &Candidate) -> Result<()> {
        let path = self
            .run_dir(run_id)
            .join("candidates")
            .join(query_id)
            .join(format!("{}.sql", candidate.candidate_id));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| crate::error::Error::cache(e.to_string()))?;
        }
        fs::write(&path, candidate.sql.as_bytes())
            .await
            .map_err(|e| crate::error::Error::cache(e.to_string()))?;
        Ok(())
    }

    async fn save_verdict(&self, query_id: &str, run_id: &str, verdict: &ValidationVerdict) -> Result<()> {
        let path = self
            .run_dir(run_id)
            .join("verdicts")
            .join(query_id)
            .join(format!("{}.json", verdict.candidate_id));
        Self::write_json(&path, verdict).await
    }

    async fn load_manifest(&self, run_id: &str) -> Result<Option<RunManifest>> {
        let path = self.run_dir(run_id).join("manifest.json");
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::error::Error::cache(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{EngineEnvironment, Lineage, TransformPolicy};
    use crate::strategy::StrategyPolicy;
    use crate::validation::{GateName, GateOutcome, Status, ValidationPolicy};

    fn manifest() -> RunManifest {
        RunManifest::new(
            "run-1",
            "bench-1",
            EngineEnvironment {
                engine_name: "duckdb".into(),
                engine_version: "1.1.0".into(),
                dataset_id: "tpch".into(),
                scale_factor: 1.0,
                settings: serde_json::json!({}),
            },
            "beam",
            &StrategyPolicy::default(),
            &ValidationPolicy::default(),
            TransformPolicy::default(),
            Lineage::default(),
            "kv-1",
            chrono::Utc::now(),
        )
    }

    fn verdict() -> ValidationVerdict {
        ValidationVerdict {
            candidate_id: "cand-1".into(),
            query_id: "q1".into(),
            run_fingerprint: "run-1".into(),
            status: Status::Win,
            speedup: Some(1.2),
            gate_outcomes: vec![GateOutcome::pass(GateName::Static, "ok")],
            gate_failed: None,
            semantic_confidence: None,
            perf: None,
            baseline_explain: None,
            candidate_explain: None,
            reason: "1.2x faster".into(),
            computed_at: chrono::Utc::now(),
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn manifest_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemRunStore::new(dir.path());
        let m = manifest();
        store.save_manifest(&m).await.unwrap();

        let loaded = store.load_manifest(&m.run_id).await.unwrap().expect("manifest was saved");
        assert_eq!(loaded.run_id, m.run_id);
        assert_eq!(loaded.benchmark_id, m.benchmark_id);
    }

    #[tokio::test]
    async fn missing_manifest_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemRunStore::new(dir.path());
        assert!(store.load_manifest("no-such-run").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verdict_is_written_under_query_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemRunStore::new(dir.path());
        store.save_verdict("q1", "run-1", &verdict()).await.unwrap();

        let path = dir.path().join("runs/run-1/verdicts/q1/cand-1.json");
        assert!(path.exists());
        let bytes = std::fs::read(&path).unwrap();
        let loaded: ValidationVerdict = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(loaded.candidate_id, "cand-1");
    }
}
