use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::models::{Execution, LogEntry};

/// Persistence for execution records and their log entries.
///
/// Every method is a single atomic write or read; callers never need their
/// own locking.
#[async_trait]
pub trait RunRecordStore: Send + Sync {
    async fn insert(&self, execution: Execution) -> Result<Execution>;

    async fn get(&self, execution_id: &str) -> Result<Option<Execution>>;

    /// Record the terminal outcome. `Ok(None)` if the execution does not exist.
    async fn finish(
        &self,
        execution_id: &str,
        exit_code: i64,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<Execution>>;

    /// Store one log entry. `Ok(false)` when its execution no longer exists;
    /// the entry is then discarded.
    async fn append_log(&self, entry: LogEntry) -> Result<bool>;

    /// Log entries of one execution, oldest first.
    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>>;

    /// Drop every execution (and its logs) that belongs to `executable_id`.
    async fn delete_by_executable(&self, executable_id: &str) -> Result<usize>;
}

/// JSON-file backed [`RunRecordStore`]. Without a path it stays in memory.
#[derive(Debug, Clone)]
pub struct RunStore {
    path: Option<PathBuf>,
    state: Arc<RwLock<RunDb>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RunDb {
    executions: HashMap<String, Execution>,
    logs: HashMap<String, Vec<LogEntry>>,
}

impl RunStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading run store at {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| "parsing run store JSON")?
        } else {
            RunDb::default()
        };

        Ok(Self {
            path: Some(path),
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Arc::new(RwLock::new(RunDb::default())),
        }
    }

    async fn persist(&self, db: &RunDb) -> Result<()> {
        match &self.path {
            Some(path) => persist(path, db.clone()).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RunRecordStore for RunStore {
    async fn insert(&self, execution: Execution) -> Result<Execution> {
        let mut guard = self.state.write().await;
        let previous = guard
            .executions
            .insert(execution.id.clone(), execution.clone());
        if let Err(err) = self.persist(&guard).await {
            match previous {
                Some(previous) => guard.executions.insert(execution.id.clone(), previous),
                None => guard.executions.remove(&execution.id),
            };
            return Err(err);
        }
        Ok(execution)
    }

    async fn get(&self, execution_id: &str) -> Result<Option<Execution>> {
        let guard = self.state.read().await;
        Ok(guard.executions.get(execution_id).cloned())
    }

    async fn finish(
        &self,
        execution_id: &str,
        exit_code: i64,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<Execution>> {
        let mut guard = self.state.write().await;
        let Some(record) = guard.executions.get_mut(execution_id) else {
            return Ok(None);
        };
        let before = record.clone();
        if !record.finish(exit_code, finished_at) {
            debug!(execution = %execution_id, "execution already terminal; finish ignored");
            return Ok(Some(before));
        }
        let updated = record.clone();
        if let Err(err) = self.persist(&guard).await {
            guard.executions.insert(before.id.clone(), before);
            return Err(err);
        }
        Ok(Some(updated))
    }

    async fn append_log(&self, entry: LogEntry) -> Result<bool> {
        let mut guard = self.state.write().await;
        if !guard.executions.contains_key(&entry.execution_id) {
            return Ok(false);
        }
        let execution_id = entry.execution_id.clone();
        guard
            .logs
            .entry(execution_id.clone())
            .or_default()
            .push(entry);
        if let Err(err) = self.persist(&guard).await {
            if let Some(entries) = guard.logs.get_mut(&execution_id) {
                entries.pop();
                if entries.is_empty() {
                    guard.logs.remove(&execution_id);
                }
            }
            return Err(err);
        }
        Ok(true)
    }

    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>> {
        let guard = self.state.read().await;
        let mut entries = guard.logs.get(execution_id).cloned().unwrap_or_default();
        // Stable: entries sharing a timestamp keep append order.
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn delete_by_executable(&self, executable_id: &str) -> Result<usize> {
        let mut guard = self.state.write().await;
        let doomed: Vec<String> = guard
            .executions
            .values()
            .filter(|execution| execution.executable_id == executable_id)
            .map(|execution| execution.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for id in &doomed {
            let execution = guard.executions.remove(id);
            let logs = guard.logs.remove(id);
            removed.push((id.clone(), execution, logs));
        }
        if let Err(err) = self.persist(&guard).await {
            for (id, execution, logs) in removed {
                if let Some(execution) = execution {
                    guard.executions.insert(id.clone(), execution);
                }
                if let Some(logs) = logs {
                    guard.logs.insert(id, logs);
                }
            }
            return Err(err);
        }
        Ok(doomed.len())
    }
}

/// Write the whole snapshot. Runs on the blocking pool while the caller
/// still holds the write lock.
async fn persist(path: &Path, db: RunDb) -> Result<()> {
    let target = path.to_path_buf();
    let write = tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = target.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {} for execution records", dir.display()))?;
        }
        let snapshot = serde_json::to_vec(&db).context("encoding execution snapshot")?;
        std::fs::write(&target, snapshot)
            .with_context(|| format!("cannot write execution snapshot {}", target.display()))
    });
    write.await.context("execution snapshot writer panicked")?
}
