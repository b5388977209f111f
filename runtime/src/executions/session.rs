use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use config_loader::LanguageTable;
use tracing::{debug, error, info, warn};

use super::container::{ContainerHandle, ContainerRuntime, ContainerSpec};
use super::models::{LogEntry, LogStream, EXIT_CODE_UNAVAILABLE};
use super::normalize::normalize;
use super::store::RunRecordStore;
use crate::scripts::Executable;

/// Directory inside the container where the script is mounted.
pub const SCRIPT_MOUNT_DIR: &str = "/app";

/// Drives one container lifecycle per execution and writes the outcome back
/// through the run record store.
#[derive(Clone)]
pub struct ContainerSession {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RunRecordStore>,
    languages: Arc<LanguageTable>,
}

impl ContainerSession {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RunRecordStore>,
        languages: Arc<LanguageTable>,
    ) -> Self {
        Self {
            runtime,
            store,
            languages,
        }
    }

    /// Run `executable` to completion for `execution_id`.
    ///
    /// Never fails: every runtime error ends in a terminal record, either the
    /// real exit code or [`EXIT_CODE_UNAVAILABLE`].
    pub async fn run(&self, execution_id: &str, executable: &Executable) {
        let spec = match self.container_spec(execution_id, executable) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(execution = %execution_id, error = %err, "cannot resolve script path");
                self.finalize(execution_id, EXIT_CODE_UNAVAILABLE).await;
                return;
            }
        };
        debug!(execution = %execution_id, command = ?spec.command, binds = ?spec.binds, "resolved container spec");

        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(execution = %execution_id, image = %spec.image, error = %err, "container create failed");
                self.finalize(execution_id, EXIT_CODE_UNAVAILABLE).await;
                return;
            }
        };

        let exit_code = self.drive(execution_id, &handle).await;

        if let Err(err) = self.runtime.remove(&handle).await {
            debug!(execution = %execution_id, container = %handle.id, error = %err, "container removal failed");
        }

        self.finalize(execution_id, exit_code).await;
    }

    /// Start, wait and collect. Returns the exit code to record.
    async fn drive(&self, execution_id: &str, handle: &ContainerHandle) -> i64 {
        if let Err(err) = self.runtime.start(handle).await {
            warn!(execution = %execution_id, container = %handle.id, error = %err, "container start failed");
            return EXIT_CODE_UNAVAILABLE;
        }
        info!(execution = %execution_id, container = %handle.id, "container started");

        let exit_code = match self.runtime.wait(handle).await {
            Ok(code) => code,
            Err(err) => {
                warn!(execution = %execution_id, container = %handle.id, error = %err, "container wait failed");
                EXIT_CODE_UNAVAILABLE
            }
        };

        match self.runtime.logs(handle).await {
            Ok(raw) => {
                // Both streams are merged into one stdout entry.
                let entry = LogEntry::new(execution_id, LogStream::Stdout, normalize(&raw));
                match self.store.append_log(entry).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(execution = %execution_id, "execution removed while running; output discarded");
                    }
                    Err(err) => {
                        error!(execution = %execution_id, error = %err, "failed to persist execution output");
                    }
                }
            }
            Err(err) => {
                debug!(execution = %execution_id, error = %err, "container output unavailable");
            }
        }

        exit_code
    }

    async fn finalize(&self, execution_id: &str, exit_code: i64) {
        match self.store.finish(execution_id, exit_code, Utc::now()).await {
            Ok(Some(record)) => {
                info!(execution = %execution_id, status = record.status.as_str(), exit_code, "execution finished");
            }
            Ok(None) => {
                warn!(execution = %execution_id, "execution record vanished before completion");
            }
            Err(err) => {
                error!(execution = %execution_id, error = %err, "failed to persist completion metadata");
            }
        }
    }

    pub fn container_spec(
        &self,
        execution_id: &str,
        executable: &Executable,
    ) -> std::io::Result<ContainerSpec> {
        let target = container_script_path(&executable.source_path);
        let host = absolute_path(&executable.source_path)?;

        Ok(ContainerSpec {
            name: execution_id.to_string(),
            image: executable.image.clone(),
            command: resolve_command(&self.languages, &executable.language, &target),
            binds: vec![format!("{}:{}:ro", host.display(), target)],
        })
    }
}

/// Interpreter invocation for `language`; unmapped languages run under `sh`.
pub fn resolve_command(languages: &LanguageTable, language: &str, script: &str) -> Vec<String> {
    let mut command = match languages.get(language) {
        Some(spec) => spec.interpreter.clone(),
        None => vec!["sh".to_string()],
    };
    command.push(script.to_string());
    command
}

/// `/app/script<ext>`, keeping the host file's extension.
pub fn container_script_path(source: &Path) -> String {
    match source.extension() {
        Some(ext) => format!("{}/script.{}", SCRIPT_MOUNT_DIR, ext.to_string_lossy()),
        None => format!("{}/script", SCRIPT_MOUNT_DIR),
    }
}

fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
