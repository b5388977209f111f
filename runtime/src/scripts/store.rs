use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_loader::LanguageTable;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::UserId;

/// The read-only view of a script that executions need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub id: String,
    pub owner: UserId,
    pub image: String,
    pub source_path: PathBuf,
    pub language: String,
}

/// Lookup of executables scoped to their owner.
#[async_trait]
pub trait ExecutableStore: Send + Sync {
    /// `Ok(None)` both when the id is unknown and when it belongs to someone else.
    async fn lookup(&self, executable_id: &str, owner: UserId) -> Result<Option<Executable>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRecord {
    pub id: String,
    pub owner: UserId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    pub docker_image: String,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ScriptRecord {
    pub fn executable(&self) -> Executable {
        Executable {
            id: self.id.clone(),
            owner: self.owner,
            image: self.docker_image.clone(),
            source_path: self.file_path.clone(),
            language: self.language.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewScript {
    pub name: String,
    pub description: String,
    pub language: String,
    pub body: Vec<u8>,
}

/// Script metadata in a JSON index plus script bodies on disk:
/// `<root>/scripts.json` and `<root>/scripts/<id>/script<ext>`.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    root: PathBuf,
    languages: Arc<LanguageTable>,
    state: Arc<RwLock<ScriptDb>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScriptDb {
    scripts: HashMap<String, ScriptRecord>,
}

impl ScriptStore {
    pub fn open(root: PathBuf, languages: Arc<LanguageTable>) -> Result<Self> {
        let index = root.join("scripts.json");
        let state = if index.exists() {
            let raw = std::fs::read_to_string(&index)
                .with_context(|| format!("reading script index at {}", index.display()))?;
            serde_json::from_str(&raw).with_context(|| "parsing script index JSON")?
        } else {
            ScriptDb::default()
        };

        Ok(Self {
            root,
            languages,
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("scripts.json")
    }

    fn script_dir(&self, id: &str) -> PathBuf {
        self.root.join("scripts").join(id)
    }

    pub async fn create(&self, owner: UserId, script: NewScript) -> ServiceResult<ScriptRecord> {
        let name = script.name.trim();
        let language = script.language.trim();
        if name.is_empty() || language.is_empty() {
            return Err(ServiceError::validation("name and language are required"));
        }
        let spec = self.languages.get(language).ok_or_else(|| {
            let supported: Vec<&str> = self.languages.languages().collect();
            ServiceError::validation(format!(
                "unsupported language: {} (supported: {})",
                language,
                supported.join(", ")
            ))
        })?;
        if script.body.is_empty() {
            return Err(ServiceError::validation("file is required"));
        }

        let id = Uuid::new_v4().to_string();
        let dir = self.script_dir(&id);
        let file_path = dir.join(format!("script{}", spec.extension));
        write_script(&dir, &file_path, script.body).await?;

        let record = ScriptRecord {
            id: id.clone(),
            owner,
            name: name.to_string(),
            description: script.description,
            language: language.to_string(),
            docker_image: spec.image.clone(),
            file_path,
            created_at: Utc::now(),
        };

        let mut guard = self.state.write().await;
        guard.scripts.insert(id.clone(), record.clone());
        if let Err(err) = persist(&self.index_path(), guard.clone()).await {
            guard.scripts.remove(&id);
            drop(guard);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!(script = %id, error = %cleanup, "failed to roll back script directory");
            }
            return Err(err.into());
        }

        debug!(script = %id, owner, language = %record.language, "script stored");
        Ok(record)
    }

    /// Scripts of `owner`, newest first.
    pub async fn list(&self, owner: UserId) -> Vec<ScriptRecord> {
        let guard = self.state.read().await;
        let mut scripts: Vec<ScriptRecord> = guard
            .scripts
            .values()
            .filter(|script| script.owner == owner)
            .cloned()
            .collect();
        scripts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        scripts
    }

    pub async fn get(&self, id: &str, owner: UserId) -> Option<ScriptRecord> {
        let guard = self.state.read().await;
        guard
            .scripts
            .get(id)
            .filter(|script| script.owner == owner)
            .cloned()
    }

    /// Remove the script and its directory. `Ok(None)` if not found for `owner`.
    pub async fn delete(&self, id: &str, owner: UserId) -> Result<Option<ScriptRecord>> {
        let mut guard = self.state.write().await;
        let owned = guard
            .scripts
            .get(id)
            .map(|script| script.owner == owner)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        let removed = guard.scripts.remove(id);
        persist(&self.index_path(), guard.clone()).await?;
        drop(guard);

        let dir = self.script_dir(id);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            warn!(script = %id, error = %err, "failed to remove script directory");
        }
        Ok(removed)
    }
}

#[async_trait]
impl ExecutableStore for ScriptStore {
    async fn lookup(&self, executable_id: &str, owner: UserId) -> Result<Option<Executable>> {
        Ok(self
            .get(executable_id, owner)
            .await
            .map(|script| script.executable()))
    }
}

async fn write_script(dir: &Path, file_path: &Path, body: Vec<u8>) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating script directory {}", dir.display()))?;
    if let Err(err) = tokio::fs::write(file_path, body).await {
        let _ = tokio::fs::remove_dir_all(dir).await;
        return Err(err).with_context(|| format!("writing script to {}", file_path.display()));
    }
    Ok(())
}

async fn persist(path: &Path, db: ScriptDb) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&db).context("serializing script index")?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing script index to {}", path.display()))?;
        Ok::<(), anyhow::Error>(())
    })
    .await
    .context("joining script index persistence task")??;

    Ok(())
}
