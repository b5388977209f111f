use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use config_loader::LanguageTable;
use tracing::info;
use uuid::Uuid;

use super::container::ContainerRuntime;
use super::models::{Execution, LogEntry};
use super::session::ContainerSession;
use super::store::RunRecordStore;
use crate::error::{ServiceError, ServiceResult};
use crate::scripts::{Executable, ExecutableStore};
use crate::UserId;

/// Accepts run requests and answers status/log queries.
///
/// `submit` returns after one store write; the container lifecycle runs on a
/// detached task whose only output is what it writes to the store.
#[derive(Clone)]
pub struct ExecutionService {
    executables: Arc<dyn ExecutableStore>,
    store: Arc<dyn RunRecordStore>,
    session: ContainerSession,
}

impl ExecutionService {
    pub fn new(
        executables: Arc<dyn ExecutableStore>,
        store: Arc<dyn RunRecordStore>,
        runtime: Arc<dyn ContainerRuntime>,
        languages: Arc<LanguageTable>,
    ) -> Self {
        let session = ContainerSession::new(runtime, Arc::clone(&store), languages);
        Self {
            executables,
            store,
            session,
        }
    }

    pub async fn submit(&self, executable_id: &str, user: UserId) -> ServiceResult<String> {
        if executable_id.trim().is_empty() {
            return Err(ServiceError::validation("script id is required"));
        }

        let executable = self
            .executables
            .lookup(executable_id, user)
            .await?
            .ok_or(ServiceError::NotFound("Script"))?;

        if executable.image.trim().is_empty() {
            return Err(ServiceError::validation("script has no container image"));
        }
        if executable.source_path.as_os_str().is_empty() {
            return Err(ServiceError::validation("script has no source file"));
        }

        let mut execution =
            Execution::pending(Uuid::new_v4().to_string(), executable.id.clone(), user);
        execution.mark_running(Utc::now());

        let execution = self
            .store
            .insert(execution)
            .await
            .context("persisting execution record")?;

        self.spawn_session(execution.id.clone(), executable);

        Ok(execution.id)
    }

    pub async fn get_status(&self, execution_id: &str, user: UserId) -> ServiceResult<Execution> {
        self.owned_execution(execution_id, user).await
    }

    pub async fn get_logs(&self, execution_id: &str, user: UserId) -> ServiceResult<Vec<LogEntry>> {
        let execution = self.owned_execution(execution_id, user).await?;
        let logs = self
            .store
            .logs(&execution.id)
            .await
            .context("loading execution logs")?;
        Ok(logs)
    }

    /// Remove every execution of a deleted executable.
    pub async fn forget_executable(&self, executable_id: &str) -> ServiceResult<usize> {
        let removed = self
            .store
            .delete_by_executable(executable_id)
            .await
            .context("deleting executions of removed script")?;
        Ok(removed)
    }

    async fn owned_execution(&self, execution_id: &str, user: UserId) -> ServiceResult<Execution> {
        let execution = self
            .store
            .get(execution_id)
            .await
            .context("loading execution record")?
            .filter(|execution| execution.user_id == user)
            .ok_or(ServiceError::NotFound("Execution"))?;

        // Ownership is decided through the executable, as for submission.
        self.executables
            .lookup(&execution.executable_id, user)
            .await?
            .ok_or(ServiceError::NotFound("Execution"))?;

        Ok(execution)
    }

    fn spawn_session(&self, execution_id: String, executable: Executable) {
        let session = self.session.clone();
        tokio::spawn(async move {
            info!(execution = %execution_id, script = %executable.id, image = %executable.image, "starting execution task");
            session.run(&execution_id, &executable).await;
        });
    }
}
