//! Pipeline run store
//!
//! Active runs by id and a bounded history of finished runs, with retention
//! based cleanup.

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::{MAX_ACTIVE_RUNS, MAX_RUN_HISTORY};
use crate::domain::pipeline::{PipelineRun, PipelineState};

pub struct RunStore {
    active: RwLock<HashMap<String, PipelineRun>>,
    history: RwLock<VecDeque<PipelineRun>>,
    max_active: usize,
    max_history: usize,
    retention: Duration,
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_config(MAX_ACTIVE_RUNS, MAX_RUN_HISTORY, 24)
    }

    pub fn with_config(max_active: usize, max_history: usize, retention_hours: i64) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_active,
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    pub async fn create(&self, run: PipelineRun) -> String {
        let id = run.id.clone();
        self.active.write().await.insert(id.clone(), run);
        id
    }

    /// Active run snapshot
    pub async fn get(&self, run_id: &str) -> Option<PipelineRun> {
        self.active.read().await.get(run_id).cloned()
    }

    /// Active run first, then history
    pub async fn get_any(&self, run_id: &str) -> Option<PipelineRun> {
        if let Some(run) = self.get(run_id).await {
            return Some(run);
        }
        let history = self.history.read().await;
        history.iter().find(|r| r.id == run_id).cloned()
    }

    /// Mutate an active run in place
    ///
    /// Returns `None` when the run is not active.
    pub async fn update<F, R>(&self, run_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut PipelineRun) -> R,
    {
        let mut active = self.active.write().await;
        active.get_mut(run_id).map(f)
    }

    /// Move a terminal run from the active set into history
    pub async fn archive(&self, run_id: &str) {
        let run = {
            let mut active = self.active.write().await;
            match active.get(run_id) {
                Some(run) if run.state.is_terminal() => active.remove(run_id),
                _ => None,
            }
        };

        if let Some(run) = run {
            let mut history = self.history.write().await;
            history.push_front(run);
            while history.len() > self.max_history {
                history.pop_back();
            }
        }
    }

    pub async fn active_runs(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<PipelineRun> = self.active.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Newest first: active runs, then history
    pub async fn recent(&self, limit: usize, state: Option<PipelineState>) -> Vec<PipelineRun> {
        let mut runs = self.active_runs().await;
        runs.extend(self.history.read().await.iter().cloned());
        runs.into_iter()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .take(limit)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn history_count(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn is_at_capacity(&self) -> bool {
        self.active_count().await >= self.max_active
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Drop history entries older than the retention window
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut history = self.history.write().await;
        history.retain(|run| run.finished_at.map_or(true, |t| t > cutoff));
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::DeployGate;

    fn run(id: &str) -> PipelineRun {
        PipelineRun::new(
            id.to_string(),
            "main".to_string(),
            None,
            "main".to_string(),
            DeployGate::Automatic,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = RunStore::new();
        store.create(run("run-1")).await;

        store
            .update("run-1", |r| {
                r.advance(PipelineState::Building).unwrap();
                r.fail("build failed").unwrap();
            })
            .await
            .unwrap();

        store.archive("run-1").await;
        assert!(store.get("run-1").await.is_none());

        let archived = store.get_any("run-1").await.unwrap();
        assert_eq!(archived.state, PipelineState::Failed);
        assert_eq!(store.recent(10, Some(PipelineState::Failed)).await.len(), 1);
        assert!(store.recent(10, Some(PipelineState::Done)).await.is_empty());
    }

    #[tokio::test]
    async fn test_archive_ignores_live_runs() {
        let store = RunStore::new();
        store.create(run("run-1")).await;
        store.archive("run-1").await;
        assert!(store.get("run-1").await.is_some());
    }

    #[tokio::test]
    async fn test_history_limit_and_capacity() {
        let store = RunStore::with_config(2, 3, 24);
        for i in 0..5 {
            let id = format!("run-{}", i);
            store.create(run(&id)).await;
            store
                .update(&id, |r| r.advance(PipelineState::Cancelled).unwrap())
                .await;
            store.archive(&id).await;
        }
        assert_eq!(store.history_count().await, 3);
        assert_eq!(store.recent(10, None).await[0].id, "run-4");

        store.create(run("a")).await;
        assert!(!store.is_at_capacity().await);
        store.create(run("b")).await;
        assert!(store.is_at_capacity().await);
    }
}
