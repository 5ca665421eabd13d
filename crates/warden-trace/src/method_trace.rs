//! Method-entry tracer
//!
//! Records `{method, receiver, arguments}` at the entry of every method
//! with reachable code. When [`LineTrace`] is active too, its line feed is
//! merged into the same step sequence.

use crate::line_trace::{LineCallback, LineEvent, LineTrace};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use warden_sandbox::bytecode::{Constant, HookArg};
use warden_sandbox::{
    ClassFile, ExecutionArguments, HookCall, HookContext, HookSignal, Insn, LoaderConfig,
    PluginError, RewritingContext, SandboxContext, SandboxPlugin, Value,
};

pub const DEFAULT_RECORDED_STEP_LIMIT: usize = 5_000;

const ENTER_HOOK: &str = "enter";
const RUNS_AFTER: &[&str] = &[LineTrace::ID];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodTraceArguments {
    pub recorded_step_limit: usize,
}

impl Default for MethodTraceArguments {
    fn default() -> Self {
        Self {
            recorded_step_limit: DEFAULT_RECORDED_STEP_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentValue {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionStep {
    Line {
        source: String,
        line: u32,
    },
    Enter {
        method: String,
        receiver: Option<serde_json::Value>,
        arguments: Vec<ArgumentValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodTraceResult {
    pub arguments: MethodTraceArguments,
    pub steps: Vec<ExecutionStep>,
}

/// What an entry hook site was bound to at rewrite time
#[derive(Debug, Clone)]
struct EntrySite {
    descriptor: String,
    has_receiver: bool,
    params: Vec<String>,
}

pub struct MethodTraceInstrumentation {
    arguments: MethodTraceArguments,
    line_trace_active: bool,
    sites: Mutex<Vec<EntrySite>>,
}

impl MethodTraceInstrumentation {
    fn bind(&self, site: EntrySite) -> i64 {
        let mut sites = self.sites.lock().unwrap_or_else(|e| e.into_inner());
        sites.push(site);
        (sites.len() - 1) as i64
    }

    fn site(&self, id: i64) -> Option<EntrySite> {
        let sites = self.sites.lock().unwrap_or_else(|e| e.into_inner());
        usize::try_from(id).ok().and_then(|id| sites.get(id).cloned())
    }
}

pub struct MethodTraceWorkingData {
    instrumentation: Arc<MethodTraceInstrumentation>,
    steps: Mutex<Vec<ExecutionStep>>,
}

impl MethodTraceWorkingData {
    fn record(&self, step: ExecutionStep) {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        if steps.len() < self.instrumentation.arguments.recorded_step_limit {
            steps.push(step);
        }
    }
}

/// Records method entries with their argument values. Single-threaded tasks
/// only.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodTrace;

impl SandboxPlugin for MethodTrace {
    const ID: &'static str = "method-trace";

    type Arguments = MethodTraceArguments;
    type InstrumentationData = MethodTraceInstrumentation;
    type WorkingData = MethodTraceWorkingData;
    type Result = MethodTraceResult;

    fn runs_after(&self) -> &'static [&'static str] {
        RUNS_AFTER
    }

    fn create_default_arguments(&self) -> MethodTraceArguments {
        MethodTraceArguments::default()
    }

    fn create_instrumentation_data(
        &self,
        arguments: &MethodTraceArguments,
        _loader_config: &LoaderConfig,
        active_plugins: &[&'static str],
    ) -> Result<MethodTraceInstrumentation, PluginError> {
        Ok(MethodTraceInstrumentation {
            arguments: arguments.clone(),
            line_trace_active: active_plugins.contains(&LineTrace::ID),
            sites: Mutex::new(Vec::new()),
        })
    }

    fn transform_before_sandbox(
        &self,
        mut class: ClassFile,
        data: &MethodTraceInstrumentation,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError> {
        if context != RewritingContext::Untrusted {
            return Ok(class);
        }
        for method in &mut class.methods {
            if !method.has_reachable_code() {
                continue;
            }
            let site = data.bind(EntrySite {
                descriptor: method.descriptor(&class.name),
                has_receiver: !method.is_static,
                params: method.params.clone(),
            });
            let mut args = vec![HookArg::Const(Constant::Int(site))];
            if !method.is_static {
                args.push(HookArg::Local(0));
            }
            let first = method.first_param_local();
            args.extend((0..method.params.len() as u16).map(|i| HookArg::Local(first + i)));
            method.code.insert(
                0,
                Insn::Hook {
                    plugin: Self::ID.to_string(),
                    name: ENTER_HOOK.to_string(),
                    args,
                },
            );
        }
        Ok(class)
    }

    fn create_initial_data(
        &self,
        data: &Arc<MethodTraceInstrumentation>,
        execution_arguments: &ExecutionArguments,
    ) -> Result<MethodTraceWorkingData, PluginError> {
        if execution_arguments.max_extra_threads > 0 {
            return Err(PluginError::Refused {
                plugin: Self::ID.to_string(),
                reason: "method tracing does not support extra threads".to_string(),
            });
        }
        Ok(MethodTraceWorkingData {
            instrumentation: Arc::clone(data),
            steps: Mutex::new(Vec::new()),
        })
    }

    fn execution_started_in_sandbox(
        &self,
        working: &Arc<MethodTraceWorkingData>,
        context: &mut SandboxContext<'_>,
    ) {
        if !working.instrumentation.line_trace_active {
            return;
        }
        let working = Arc::clone(working);
        let callback: LineCallback = Arc::new(move |event: &LineEvent| {
            working.record(ExecutionStep::Line {
                source: event.source.clone(),
                line: event.line,
            });
        });
        LineTrace::add_line_callback(context, callback);
    }

    fn on_hook(
        &self,
        working: &MethodTraceWorkingData,
        call: &HookCall<'_>,
        _context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal> {
        if call.name != ENTER_HOOK {
            return Ok(());
        }
        let (site, values) = match call.args.split_first() {
            Some((Value::Int(site), values)) => (*site, values),
            _ => return Ok(()),
        };
        let site = match working.instrumentation.site(site) {
            Some(site) => site,
            None => return Ok(()),
        };
        let (receiver, values) = match (site.has_receiver, values.split_first()) {
            (true, Some((receiver, rest))) => (Some(receiver.to_json()), rest),
            _ => (None, values),
        };
        let arguments = site
            .params
            .into_iter()
            .zip(values)
            .map(|(name, value)| ArgumentValue {
                name,
                value: value.to_json(),
            })
            .collect();
        working.record(ExecutionStep::Enter {
            method: site.descriptor,
            receiver,
            arguments,
        });
        Ok(())
    }

    fn create_final_data(&self, working: &MethodTraceWorkingData) -> MethodTraceResult {
        MethodTraceResult {
            arguments: working.instrumentation.arguments.clone(),
            steps: working
                .steps
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
