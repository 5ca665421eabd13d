//! Bytecode instrumentation plugin protocol
//!
//! A plugin rewrites classes before they are loaded, inserting
//! [`Insn::Hook`](crate::bytecode::Insn::Hook) calls. At run time each hook
//! lands in [`SandboxPlugin::on_hook`] with the plugin's per-task working
//! data. When the task ends the working data is collapsed into a
//! serializable result.

use crate::bytecode::ClassFile;
use crate::loader::LoaderConfig;
use crate::task::{ExecutionArguments, HookContext, SandboxContext};
use crate::value::{Exception, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub(crate) type AnyArc = Arc<dyn Any + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {0} registered twice")]
    Duplicate(String),

    #[error("plugin {plugin} must run after {after}")]
    Ordering { plugin: String, after: String },

    #[error("plugin {plugin} refused to run: {reason}")]
    Refused { plugin: String, reason: String },

    #[error("plugin {plugin} failed to rewrite {class}: {reason}")]
    Rewrite {
        plugin: String,
        class: String,
        reason: String,
    },

    #[error("plugin {0} was handed data of the wrong type")]
    DataMismatch(String),

    #[error("plugin {plugin} produced an unserializable result: {reason}")]
    Result { plugin: String, reason: String },
}

/// Where the class being rewritten came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewritingContext {
    Untrusted,
    /// Library code loaded into a trusted unit
    Trusted,
}

/// A hook invocation from instrumented code
#[derive(Debug)]
pub struct HookCall<'a> {
    pub name: &'a str,
    pub args: &'a [Value],
}

/// How a hook interrupts the program
#[derive(Debug, Clone)]
pub enum HookSignal {
    /// Raise an exception at the hook site
    Throw(Exception),
    /// Stop the whole task
    Kill(String),
}

pub trait SandboxPlugin: Send + Sync + 'static {
    const ID: &'static str;

    type Arguments: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
    type InstrumentationData: Send + Sync + 'static;
    type WorkingData: Send + Sync + 'static;
    type Result: Serialize + DeserializeOwned + 'static;

    /// Plugins that must be registered before this one when present
    fn runs_after(&self) -> &'static [&'static str] {
        &[]
    }

    fn create_default_arguments(&self) -> Self::Arguments;

    fn create_instrumentation_data(
        &self,
        arguments: &Self::Arguments,
        loader_config: &LoaderConfig,
        active_plugins: &[&'static str],
    ) -> Result<Self::InstrumentationData, PluginError>;

    /// Rewrite one class. May only add instructions.
    fn transform_before_sandbox(
        &self,
        class: ClassFile,
        instrumentation_data: &Self::InstrumentationData,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError>;

    fn create_initial_data(
        &self,
        instrumentation_data: &Arc<Self::InstrumentationData>,
        execution_arguments: &ExecutionArguments,
    ) -> Result<Self::WorkingData, PluginError>;

    /// Runs on the main task thread before the work unit
    fn execution_started_in_sandbox(
        &self,
        _working_data: &Arc<Self::WorkingData>,
        _context: &mut SandboxContext<'_>,
    ) {
    }

    fn on_hook(
        &self,
        working_data: &Self::WorkingData,
        call: &HookCall<'_>,
        context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal>;

    fn create_final_data(&self, working_data: &Self::WorkingData) -> Self::Result;
}

/// Object-safe view of a registered plugin
pub(crate) trait ErasedPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn runs_after(&self) -> &'static [&'static str];
    fn create_instrumentation_data(
        &self,
        loader_config: &LoaderConfig,
        active: &[&'static str],
    ) -> Result<AnyArc, PluginError>;
    fn transform(
        &self,
        class: ClassFile,
        data: &AnyArc,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError>;
    fn create_initial_data(
        &self,
        data: &AnyArc,
        arguments: &ExecutionArguments,
    ) -> Result<AnyArc, PluginError>;
    fn execution_started(&self, working: &AnyArc, context: &mut SandboxContext<'_>);
    fn on_hook(
        &self,
        working: &AnyArc,
        call: &HookCall<'_>,
        context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal>;
    fn create_final_data(&self, working: &AnyArc) -> Result<serde_json::Value, PluginError>;
}

struct Registered<P: SandboxPlugin> {
    plugin: P,
    arguments: P::Arguments,
}

impl<P: SandboxPlugin> Registered<P> {
    fn downcast<T: Send + Sync + 'static>(data: &AnyArc) -> Result<Arc<T>, PluginError> {
        Arc::clone(data)
            .downcast::<T>()
            .map_err(|_| PluginError::DataMismatch(P::ID.to_string()))
    }
}

impl<P: SandboxPlugin> ErasedPlugin for Registered<P> {
    fn id(&self) -> &'static str {
        P::ID
    }

    fn runs_after(&self) -> &'static [&'static str] {
        self.plugin.runs_after()
    }

    fn create_instrumentation_data(
        &self,
        loader_config: &LoaderConfig,
        active: &[&'static str],
    ) -> Result<AnyArc, PluginError> {
        let data = self
            .plugin
            .create_instrumentation_data(&self.arguments, loader_config, active)?;
        Ok(Arc::new(data))
    }

    fn transform(
        &self,
        class: ClassFile,
        data: &AnyArc,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError> {
        let data = data
            .downcast_ref::<P::InstrumentationData>()
            .ok_or_else(|| PluginError::DataMismatch(P::ID.to_string()))?;
        self.plugin.transform_before_sandbox(class, data, context)
    }

    fn create_initial_data(
        &self,
        data: &AnyArc,
        arguments: &ExecutionArguments,
    ) -> Result<AnyArc, PluginError> {
        let data = Self::downcast::<P::InstrumentationData>(data)?;
        Ok(Arc::new(self.plugin.create_initial_data(&data, arguments)?))
    }

    fn execution_started(&self, working: &AnyArc, context: &mut SandboxContext<'_>) {
        if let Ok(working) = Self::downcast::<P::WorkingData>(working) {
            self.plugin.execution_started_in_sandbox(&working, context);
        }
    }

    fn on_hook(
        &self,
        working: &AnyArc,
        call: &HookCall<'_>,
        context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal> {
        match working.downcast_ref::<P::WorkingData>() {
            Some(working) => self.plugin.on_hook(working, call, context),
            None => Ok(()),
        }
    }

    fn create_final_data(&self, working: &AnyArc) -> Result<serde_json::Value, PluginError> {
        let working = working
            .downcast_ref::<P::WorkingData>()
            .ok_or_else(|| PluginError::DataMismatch(P::ID.to_string()))?;
        serde_json::to_value(self.plugin.create_final_data(working)).map_err(|e| {
            PluginError::Result {
                plugin: P::ID.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Plugins registered for a loading unit, in application order
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn ErasedPlugin>>,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.id()))
            .finish()
    }
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` with its default arguments
    pub fn add<P: SandboxPlugin>(&mut self, plugin: P) -> Result<(), PluginError> {
        let arguments = plugin.create_default_arguments();
        self.add_with(plugin, arguments)
    }

    pub fn add_with<P: SandboxPlugin>(
        &mut self,
        plugin: P,
        arguments: P::Arguments,
    ) -> Result<(), PluginError> {
        if self.contains(P::ID) {
            return Err(PluginError::Duplicate(P::ID.to_string()));
        }
        if let Some(earlier) = self
            .plugins
            .iter()
            .find(|p| p.runs_after().contains(&P::ID))
        {
            return Err(PluginError::Ordering {
                plugin: earlier.id().to_string(),
                after: P::ID.to_string(),
            });
        }
        self.plugins.push(Arc::new(Registered { plugin, arguments }));
        Ok(())
    }

    pub fn with<P: SandboxPlugin>(mut self, plugin: P) -> Result<Self, PluginError> {
        self.add(plugin)?;
        Ok(self)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.iter().any(|p| p.id() == id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Build instrumentation data for one loading unit
    pub(crate) fn instrument(&self, config: &LoaderConfig) -> Result<InstrumentedPlugins, PluginError> {
        let active = self.ids();
        let mut entries = Vec::with_capacity(self.plugins.len());
        for plugin in &self.plugins {
            let data = plugin.create_instrumentation_data(config, &active)?;
            entries.push((plugin.clone(), data));
        }
        Ok(InstrumentedPlugins { entries })
    }
}

/// Plugins bound to the instrumentation data of one loading unit
#[derive(Default)]
pub(crate) struct InstrumentedPlugins {
    entries: Vec<(Arc<dyn ErasedPlugin>, AnyArc)>,
}

impl InstrumentedPlugins {
    pub fn ids(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(p, _)| p.id()).collect()
    }

    pub fn transform(
        &self,
        mut class: ClassFile,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError> {
        for (plugin, data) in &self.entries {
            class = plugin.transform(class, data, context)?;
        }
        Ok(class)
    }

    /// Fresh working data for one task
    pub fn create_initial_data(
        &self,
        arguments: &ExecutionArguments,
    ) -> Result<TaskPlugins, PluginError> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (plugin, data) in &self.entries {
            let working = plugin.create_initial_data(data, arguments)?;
            entries.push(TaskPlugin {
                plugin: plugin.clone(),
                working,
            });
        }
        Ok(TaskPlugins { entries })
    }
}

pub(crate) struct TaskPlugin {
    pub plugin: Arc<dyn ErasedPlugin>,
    pub working: AnyArc,
}

/// Working data of every plugin active in one task
#[derive(Default)]
pub(crate) struct TaskPlugins {
    entries: Vec<TaskPlugin>,
}

impl TaskPlugins {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.plugin.id() == id)
    }

    pub fn get(&self, index: usize) -> Option<&TaskPlugin> {
        self.entries.get(index)
    }

    pub fn working_data<P: SandboxPlugin>(&self) -> Option<Arc<P::WorkingData>> {
        let index = self.position(P::ID)?;
        Arc::clone(&self.entries[index].working)
            .downcast::<P::WorkingData>()
            .ok()
    }

    pub fn execution_started(&self, context: &mut SandboxContext<'_>) {
        for entry in &self.entries {
            debug!(plugin = entry.plugin.id(), "plugin active in task");
            entry.plugin.execution_started(&entry.working, context);
        }
    }

    /// Collapse working data into results, keyed by plugin id
    pub fn create_final_data(&self) -> Result<PluginResults, PluginError> {
        let mut results = BTreeMap::new();
        for entry in &self.entries {
            results.insert(
                entry.plugin.id().to_string(),
                entry.plugin.create_final_data(&entry.working)?,
            );
        }
        Ok(PluginResults(results))
    }
}

/// Final plugin results of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginResults(BTreeMap<String, serde_json::Value>);

impl PluginResults {
    pub fn get<P: SandboxPlugin>(&self) -> Option<P::Result> {
        self.0
            .get(P::ID)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn raw(&self, id: &str) -> Option<&serde_json::Value> {
        self.0.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CompiledUnit, HookArg, Insn};
    use crate::loader::LoadingUnit;
    use crate::runner::Sandbox;
    use crate::task::{EntryPoint, ExecutionTask};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts hook calls at the start of every method
    struct EntryCounter;

    impl SandboxPlugin for EntryCounter {
        const ID: &'static str = "entry-counter";
        type Arguments = u64;
        type InstrumentationData = u64;
        type WorkingData = AtomicU64;
        type Result = u64;

        fn create_default_arguments(&self) -> u64 {
            1
        }

        fn create_instrumentation_data(
            &self,
            arguments: &u64,
            _loader_config: &LoaderConfig,
            _active_plugins: &[&'static str],
        ) -> Result<u64, PluginError> {
            Ok(*arguments)
        }

        fn transform_before_sandbox(
            &self,
            mut class: ClassFile,
            step: &u64,
            context: RewritingContext,
        ) -> Result<ClassFile, PluginError> {
            if context == RewritingContext::Trusted {
                return Ok(class);
            }
            for method in &mut class.methods {
                method.code.insert(
                    0,
                    Insn::Hook {
                        plugin: Self::ID.to_string(),
                        name: "enter".to_string(),
                        args: vec![HookArg::Const(crate::bytecode::Constant::Int(*step as i64))],
                    },
                );
            }
            Ok(class)
        }

        fn create_initial_data(
            &self,
            _data: &Arc<u64>,
            _arguments: &ExecutionArguments,
        ) -> Result<AtomicU64, PluginError> {
            Ok(AtomicU64::new(0))
        }

        fn on_hook(
            &self,
            working: &AtomicU64,
            call: &HookCall<'_>,
            _context: &mut HookContext<'_>,
        ) -> Result<(), HookSignal> {
            if let Some(Value::Int(step)) = call.args.first() {
                working.fetch_add(*step as u64, Ordering::Relaxed);
            }
            Ok(())
        }

        fn create_final_data(&self, working: &AtomicU64) -> u64 {
            working.load(Ordering::Relaxed)
        }
    }

    struct After;

    impl SandboxPlugin for After {
        const ID: &'static str = "after";
        type Arguments = ();
        type InstrumentationData = ();
        type WorkingData = ();
        type Result = ();

        fn runs_after(&self) -> &'static [&'static str] {
            &[EntryCounter::ID]
        }

        fn create_default_arguments(&self) {}

        fn create_instrumentation_data(
            &self,
            _arguments: &(),
            _loader_config: &LoaderConfig,
            active_plugins: &[&'static str],
        ) -> Result<(), PluginError> {
            assert!(active_plugins.contains(&Self::ID));
            Ok(())
        }

        fn transform_before_sandbox(
            &self,
            class: ClassFile,
            _data: &(),
            _context: RewritingContext,
        ) -> Result<ClassFile, PluginError> {
            Ok(class)
        }

        fn create_initial_data(
            &self,
            _data: &Arc<()>,
            _arguments: &ExecutionArguments,
        ) -> Result<(), PluginError> {
            Ok(())
        }

        fn on_hook(
            &self,
            _working: &(),
            _call: &HookCall<'_>,
            _context: &mut HookContext<'_>,
        ) -> Result<(), HookSignal> {
            Ok(())
        }

        fn create_final_data(&self, _working: &()) {}
    }

    #[test]
    fn test_duplicate_plugins_rejected() {
        let mut plugins = PluginSet::new();
        plugins.add(EntryCounter).unwrap();
        assert_eq!(
            plugins.add(EntryCounter),
            Err(PluginError::Duplicate("entry-counter".to_string()))
        );
    }

    #[test]
    fn test_ordering_checked_at_registration() {
        let mut ok = PluginSet::new();
        ok.add(EntryCounter).unwrap();
        ok.add(After).unwrap();
        assert_eq!(ok.ids(), vec!["entry-counter", "after"]);

        let mut wrong = PluginSet::new();
        wrong.add(After).unwrap();
        assert!(matches!(
            wrong.add(EntryCounter),
            Err(PluginError::Ordering { .. })
        ));
    }

    #[test]
    fn test_hooks_reach_working_data() {
        let compiled = CompiledUnit::from_assembly(
            r#"
.class Main
.method static main
  invoke Main.helper
  invoke Main.helper
  return
.end
.method static helper
  return
.end
"#,
        )
        .unwrap();
        let mut plugins = PluginSet::new();
        plugins.add_with(EntryCounter, 5).unwrap();
        let unit = LoadingUnit::builder(Arc::new(compiled))
            .plugins(plugins)
            .build()
            .unwrap();
        let result = Sandbox::new()
            .execute(ExecutionTask::new(
                Arc::new(unit),
                EntryPoint::new("Main", "main"),
            ))
            .unwrap();
        assert!(result.completed);
        assert_eq!(result.plugin_results.get::<EntryCounter>(), Some(15));
    }
}
