//! Resource-limited execution runner

use crate::loader::{LoadError, LoadingUnit};
use crate::output::{CapturedOutput, Console, OutputLine, OutputSink};
use crate::permissions::{Permission, PermissionDecision};
use crate::plugin::{PluginError, PluginResults};
use crate::registry::{ConfinementError, ConfinementRegistry, ConfinementToken};
use crate::task::{
    ExecutionArguments, ExecutionTask, Fault, SandboxContext, TaskShared, MAIN_THREAD_INDEX,
};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Harness-side failures. Task failures are reported in [`ExecutionResult`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("permission {0} can never be granted")]
    UnsafePermission(Permission),

    #[error("class {0} not found")]
    ClassNotFound(String),

    #[error("method {class}.{method} not found")]
    MethodNotFound { class: String, method: String },

    #[error("entry point {0} must be static and take no parameters")]
    InvalidEntryPoint(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Confinement(#[from] ConfinementError),

    #[error("failed to start task thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("task thread panicked: {0}")]
    WorkerPanicked(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// An error that ended the task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub completed: bool,
    pub timed_out: bool,
    pub failed: bool,
    pub killed: bool,
    pub kill_reason: Option<String>,
    pub error: Option<TaskError>,
    pub permission_denied: bool,
    /// What the work unit returned, when it returned normally
    pub returned: Option<serde_json::Value>,
    pub output_lines: Vec<OutputLine>,
    pub truncated_lines: usize,
    pub permission_log: Vec<PermissionDecision>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub execution_millis: u64,
    pub plugin_results: PluginResults,
}

impl ExecutionResult {
    fn lines(&self, console: Console) -> String {
        self.output_lines
            .iter()
            .filter(|line| line.console == console)
            .map(|line| line.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stdout(&self) -> String {
        self.lines(Console::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.lines(Console::Stderr)
    }

    /// Both streams merged in timestamp order
    pub fn output(&self) -> String {
        let mut lines: Vec<&OutputLine> = self.output_lines.iter().collect();
        lines.sort_by_key(|line| line.timestamp);
        lines
            .iter()
            .map(|line| line.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Releases the confinement exactly once, on every exit path
struct ConfinementGuard<'a> {
    registry: &'a ConfinementRegistry,
    token: Option<ConfinementToken>,
    loader: &'a LoadingUnit,
}

impl ConfinementGuard<'_> {
    fn release(&mut self) -> std::result::Result<Vec<PermissionDecision>, ConfinementError> {
        match self.token.take() {
            Some(token) => self.registry.release(&token, self.loader),
            None => Err(ConfinementError::NotConfined(self.loader.id())),
        }
    }
}

impl Drop for ConfinementGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.registry.release(&token, self.loader) {
                warn!(error = %e, "failed to release confinement");
            }
        }
    }
}

type WorkOutcome = std::thread::Result<std::result::Result<Value, Fault>>;

pub struct Sandbox {
    registry: Arc<ConfinementRegistry>,
    shutdown_retries: u32,
    shutdown_delay: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox {
    /// Runner backed by the process-wide registry
    pub fn new() -> Self {
        Self::with_registry(ConfinementRegistry::global())
    }

    pub fn with_registry(registry: Arc<ConfinementRegistry>) -> Self {
        Self {
            registry,
            shutdown_retries: 10,
            shutdown_delay: Duration::from_millis(10),
        }
    }

    /// How long to wait for task threads to observe cancellation
    pub fn with_shutdown(mut self, retries: u32, delay: Duration) -> Self {
        self.shutdown_retries = retries;
        self.shutdown_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<ConfinementRegistry> {
        &self.registry
    }

    /// Run the task's entry point
    pub fn execute(&self, task: ExecutionTask) -> Result<ExecutionResult> {
        let entry = task.entry.clone();
        let class = task
            .loader
            .find_class(&entry.class)
            .ok_or_else(|| SandboxError::ClassNotFound(entry.class.clone()))?;
        let method = class
            .method(&entry.method)
            .ok_or_else(|| SandboxError::MethodNotFound {
                class: entry.class.clone(),
                method: entry.method.clone(),
            })?;
        if !method.def.is_static || !method.def.params.is_empty() {
            return Err(SandboxError::InvalidEntryPoint(
                method.def.descriptor(&entry.class),
            ));
        }

        self.execute_with(task.loader, task.arguments, move |context| {
            context.invoke(&entry.class, &entry.method, Vec::new())
        })
    }

    /// Run trusted `work` on a confined task thread
    pub fn execute_with<F>(
        &self,
        loader: Arc<LoadingUnit>,
        arguments: ExecutionArguments,
        work: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce(&mut SandboxContext<'_>) -> std::result::Result<Value, Fault> + Send + 'static,
    {
        if let Some(permission) = arguments.permissions.first_unsafe() {
            return Err(SandboxError::UnsafePermission(permission.clone()));
        }
        let plugins = loader.plugins().create_initial_data(&arguments)?;

        let token = self.registry.confine(&loader, arguments.permissions.clone())?;
        let mut guard = ConfinementGuard {
            registry: &self.registry,
            token: Some(token.clone()),
            loader: &loader,
        };
        let capability = self.registry.capability(&token)?;

        let capture = arguments
            .capture_output
            .then(|| Arc::new(CapturedOutput::new(arguments.max_output_lines)));
        let sink = match &capture {
            Some(capture) => OutputSink::Captured(capture.clone()),
            None => OutputSink::Console,
        };

        let task = Arc::new(TaskShared::new(
            loader.clone(),
            capability,
            sink,
            plugins,
            arguments.max_extra_threads,
        ));
        info!(task = %task.id, loader = %loader.id(), timeout_ms = arguments.timeout_ms, "starting confined task");

        let started = Utc::now();
        let clock = Instant::now();
        let (sender, receiver) = mpsc::channel::<WorkOutcome>();
        let worker = Arc::clone(&task);
        let handle = thread::Builder::new()
            .name(task.thread_name(MAIN_THREAD_INDEX))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut thread = worker.thread_context(MAIN_THREAD_INDEX);
                    let mut context = SandboxContext::new(&worker, &mut thread);
                    worker.plugins.execution_started(&mut context);
                    work(&mut context)
                }));
                let _ = sender.send(outcome);
            })?;
        task.adopt_main_thread(handle);

        let mut timed_out = false;
        let outcome = match receiver.recv_timeout(Duration::from_millis(arguments.timeout_ms)) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                timed_out = true;
                debug!(task = %task.id, "task timed out");
                None
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let panic: Box<dyn std::any::Any + Send> =
                    Box::new("task thread exited without a result");
                Some(Err(panic))
            }
        };
        let ended = Utc::now();
        let execution_millis = clock.elapsed().as_millis() as u64;

        let abandoned = task.shut_down(self.shutdown_retries, self.shutdown_delay);
        if abandoned > 0 {
            warn!(task = %task.id, abandoned, "task threads abandoned");
        }
        let released = guard.release();
        let (output_lines, truncated_lines) = match &capture {
            Some(capture) => capture.finish(),
            None => (Vec::new(), 0),
        };
        let plugin_results = task.plugins.create_final_data()?;
        let permission_log = released?;

        let kill_reason = task.kill_reason();
        let killed = kill_reason.is_some();
        let timed_out = timed_out && !killed;
        let mut returned = None;
        let mut error = None;
        match outcome {
            None => {}
            Some(Ok(Ok(value))) => returned = Some(value.to_json()),
            Some(Ok(Err(Fault::Threw(exception)))) => {
                error = Some(TaskError {
                    kind: exception.kind,
                    message: exception.message,
                })
            }
            Some(Ok(Err(Fault::Security(permission)))) => {
                error = Some(TaskError {
                    kind: "SecurityException".to_string(),
                    message: permission.to_string(),
                })
            }
            Some(Ok(Err(Fault::Cancelled))) => {}
            Some(Ok(Err(Fault::Confinement(e)))) => return Err(e.into()),
            Some(Err(panic)) => return Err(SandboxError::WorkerPanicked(panic_message(panic))),
        }

        let permission_denied = permission_log.iter().any(|d| !d.granted);
        let result = ExecutionResult {
            task_id: task.id,
            completed: returned.is_some() && !permission_denied && !killed && !timed_out,
            timed_out,
            failed: error.is_some(),
            killed,
            kill_reason,
            error,
            permission_denied,
            returned,
            output_lines,
            truncated_lines,
            permission_log,
            started,
            ended,
            execution_millis,
            plugin_results,
        };
        info!(
            task = %result.task_id,
            completed = result.completed,
            timed_out = result.timed_out,
            killed = result.killed,
            millis = result.execution_millis,
            "confined task finished"
        );
        Ok(result)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
