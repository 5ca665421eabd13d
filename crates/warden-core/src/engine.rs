//! Async facade over the sandbox runner

use crate::config::{ConfigError, EngineConfig};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use warden_sandbox::{
    CompiledUnit, EntryPoint, ExecutionArguments, ExecutionResult, ExecutionTask, LoadError,
    LoadingUnit, PermissionSet, PluginError, PluginSet, Sandbox, SandboxError,
};
use warden_trace::{LineTrace, MethodTrace};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("engine is shut down")]
    Closed,

    #[error("runner task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One program to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub compiled: Arc<CompiledUnit>,
    pub entry: EntryPoint,
    pub permissions: PermissionSet,
    /// Falls back to the configured default
    pub timeout_ms: Option<u64>,
    pub max_extra_threads: usize,
    pub capture_output: bool,
}

impl RunRequest {
    pub fn new(compiled: Arc<CompiledUnit>) -> Self {
        Self {
            compiled,
            entry: EntryPoint::default(),
            permissions: PermissionSet::new(),
            timeout_ms: None,
            max_extra_threads: 0,
            capture_output: true,
        }
    }

    pub fn with_entry(mut self, entry: EntryPoint) -> Self {
        self.entry = entry;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_extra_threads(mut self, max_extra_threads: usize) -> Self {
        self.max_extra_threads = max_extra_threads;
        self
    }
}

pub struct Engine {
    config: EngineConfig,
    sandbox: Arc<Sandbox>,
    permits: Arc<Semaphore>,
    library: Option<Arc<LoadingUnit>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_sandbox(config, Sandbox::new())
    }

    pub fn with_sandbox(config: EngineConfig, sandbox: Sandbox) -> Result<Self> {
        config.validate()?;
        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            default_timeout_ms = config.default_timeout_ms,
            "engine ready"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            sandbox: Arc::new(sandbox),
            library: None,
            config,
        })
    }

    /// Trusted classes confined programs may delegate to
    pub fn with_library(mut self, library: Arc<LoadingUnit>) -> Self {
        self.library = Some(library);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Plugins enabled in the configuration
    pub fn plugins(&self) -> Result<PluginSet> {
        let settings = &self.config.plugins;
        let mut plugins = PluginSet::new();
        if settings.line_trace {
            plugins.add_with(LineTrace, settings.line_trace_arguments.clone())?;
        }
        if settings.method_trace {
            plugins.add_with(MethodTrace, settings.method_trace_arguments.clone())?;
        }
        Ok(plugins)
    }

    /// Fresh loading unit for `compiled`
    pub fn load(&self, compiled: Arc<CompiledUnit>) -> Result<Arc<LoadingUnit>> {
        let mut builder = LoadingUnit::builder(compiled)
            .config(self.config.loader.clone())
            .plugins(self.plugins()?);
        if let Some(library) = &self.library {
            builder = builder.parent(Arc::clone(library));
        }
        Ok(Arc::new(builder.build()?))
    }

    /// Run one program, waiting for a free slot first
    pub async fn run(&self, request: RunRequest) -> Result<ExecutionResult> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Closed)?;
        let loader = self.load(request.compiled)?;
        let arguments = ExecutionArguments::default()
            .with_timeout(request.timeout_ms.unwrap_or(self.config.default_timeout_ms))
            .with_permissions(request.permissions)
            .with_max_extra_threads(request.max_extra_threads)
            .with_capture_output(request.capture_output)
            .with_max_output_lines(self.config.max_output_lines);
        let task = ExecutionTask::new(loader, request.entry).with_arguments(arguments);
        debug!(available = self.permits.available_permits(), "running confined task");

        let sandbox = Arc::clone(&self.sandbox);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            sandbox.execute(task)
        })
        .await??;
        Ok(result)
    }

    /// Stop admitting new runs
    pub fn close(&self) {
        self.permits.close();
    }
}
