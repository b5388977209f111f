#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use config_loader::LanguageTable;
use scriptbox_runtime::executions::{
    ContainerHandle, ContainerRuntime, ContainerSpec, Execution, ExecutionService, RunStore,
    RuntimeError,
};
use scriptbox_runtime::scripts::{NewScript, ScriptRecord, ScriptStore};
use scriptbox_runtime::UserId;
use tokio::sync::Notify;

/// Container runtime double whose every step outcome is chosen by the test.
pub struct ScriptedRuntime {
    fail_create: bool,
    fail_start: bool,
    exit: Result<i64, String>,
    output: Option<Vec<u8>>,
    fail_remove: bool,
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<&'static str>>,
    specs: Mutex<Vec<ContainerSpec>>,
}

impl ScriptedRuntime {
    pub fn exiting(code: i64) -> Self {
        Self {
            fail_create: false,
            fail_start: false,
            exit: Ok(code),
            output: Some(Vec::new()),
            fail_remove: false,
            gate: None,
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::exiting(0)
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_wait(mut self, message: &str) -> Self {
        self.exit = Err(message.to_string());
        self
    }

    pub fn failing_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    pub fn with_output(mut self, raw: Vec<u8>) -> Self {
        self.output = Some(raw);
        self
    }

    pub fn without_output(mut self) -> Self {
        self.output = None;
        self
    }

    /// `wait` blocks until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

fn refused(operation: &'static str) -> RuntimeError {
    RuntimeError::Status {
        operation,
        status: 500,
        message: format!("{} refused by test runtime", operation),
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.record("create");
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail_create {
            return Err(RuntimeError::Status {
                operation: "create",
                status: 404,
                message: format!("No such image: {}", spec.image),
            });
        }
        Ok(ContainerHandle {
            id: format!("ctr-{}", spec.name),
        })
    }

    async fn start(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record("start");
        if self.fail_start {
            return Err(refused("start"));
        }
        Ok(())
    }

    async fn wait(&self, _handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        self.record("wait");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.exit.clone().map_err(RuntimeError::Wait)
    }

    async fn logs(&self, _handle: &ContainerHandle) -> Result<Vec<u8>, RuntimeError> {
        self.record("logs");
        self.output.clone().ok_or_else(|| refused("logs"))
    }

    async fn remove(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record("remove");
        if self.fail_remove {
            return Err(refused("remove"));
        }
        Ok(())
    }
}

/// One multiplexed output frame: 8-byte header then payload.
/// Keep payloads off length 10, whose header byte would read as a newline.
pub fn frame(stream: u8, payload: &str) -> Vec<u8> {
    let mut bytes = vec![stream, 0, 0, 0];
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload.as_bytes());
    bytes
}

pub struct Harness {
    pub service: ExecutionService,
    pub scripts: ScriptStore,
    pub runs: RunStore,
    pub runtime: Arc<ScriptedRuntime>,
    pub _dir: tempfile::TempDir,
}

pub fn harness(runtime: ScriptedRuntime) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let languages = Arc::new(LanguageTable::default());
    let scripts = ScriptStore::open(dir.path().to_path_buf(), Arc::clone(&languages)).unwrap();
    let runs = RunStore::in_memory();
    let runtime = Arc::new(runtime);

    let service = ExecutionService::new(
        Arc::new(scripts.clone()),
        Arc::new(runs.clone()),
        runtime.clone(),
        languages,
    );

    Harness {
        service,
        scripts,
        runs,
        runtime,
        _dir: dir,
    }
}

pub async fn upload(scripts: &ScriptStore, owner: UserId, language: &str) -> ScriptRecord {
    scripts
        .create(
            owner,
            NewScript {
                name: format!("{}-script", language),
                description: "test script".to_string(),
                language: language.to_string(),
                body: b"echo hello\n".to_vec(),
            },
        )
        .await
        .unwrap()
}

/// Poll until the execution reaches a terminal status.
pub async fn wait_for_terminal(
    service: &ExecutionService,
    execution_id: &str,
    user: UserId,
) -> Execution {
    for _ in 0..200 {
        let execution = service.get_status(execution_id, user).await.unwrap();
        if execution.status.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached a terminal status", execution_id);
}

pub fn mount_source(spec: &ContainerSpec) -> &str {
    spec.binds[0].split(':').next().unwrap()
}

pub fn is_absolute(path: &str) -> bool {
    Path::new(path).is_absolute()
}
