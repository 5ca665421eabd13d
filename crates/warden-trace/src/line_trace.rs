//! Line-level tracer
//!
//! Every labelled line of a class with a source file gets a hook call
//! `(source, method, label sequence, line)`. The hook coalesces split
//! lines, enforces the run-line limit and records steps into a buffer
//! owned by the executing thread.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;
use warden_sandbox::bytecode::{Constant, HookArg, LabelId};
use warden_sandbox::{
    ClassFile, Exception, HookCall, HookContext, HookSignal, Insn, LoaderConfig, MethodDef,
    PluginError, RewritingContext, SandboxContext, SandboxPlugin, Value,
};

pub const DEFAULT_RECORDED_STEP_LIMIT: usize = 100_000;
pub const DEFAULT_MAX_UNSYNCHRONIZED_LINES: u64 = 1_000;
pub const LINE_LIMIT_EXCEPTION: &str = "LineLimitExceeded";
pub const KILL_REASON: &str = "run line limit exceeded";

const LINE_HOOK: &str = "line";

/// What happens when the run-line limit is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLineLimitAction {
    #[default]
    KillSandbox,
    /// Raise `LineLimitExceeded` in the offending thread. Untrusted handlers
    /// cannot catch it.
    ThrowError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineTraceArguments {
    /// Steps kept per thread
    pub recorded_step_limit: usize,
    pub run_line_limit: Option<u64>,
    pub run_line_limit_action: RunLineLimitAction,
    pub coalesce_duplicates: bool,
    /// Local increments between reconciliations with the other threads.
    /// `0` reconciles on every line.
    pub max_unsynchronized_lines: u64,
}

impl Default for LineTraceArguments {
    fn default() -> Self {
        Self {
            recorded_step_limit: DEFAULT_RECORDED_STEP_LIMIT,
            run_line_limit: None,
            run_line_limit_action: RunLineLimitAction::default(),
            coalesce_duplicates: true,
            max_unsynchronized_lines: DEFAULT_MAX_UNSYNCHRONIZED_LINES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStep {
    pub source: String,
    pub line: u32,
    pub thread_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTraceResult {
    pub arguments: LineTraceArguments,
    /// Each thread's steps in program order, threads in index order
    pub steps: Vec<LineStep>,
    pub lines_run: u64,
}

/// One traced line, as seen by line callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub source: String,
    pub line: u32,
    pub thread_index: usize,
}

pub type LineCallback = Arc<dyn Fn(&LineEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastLine {
    method: u64,
    sequence: i64,
    line: u32,
}

#[derive(Default)]
struct ThreadBuffer {
    steps: Vec<LineStep>,
    last: Option<LastLine>,
    others_seen: u64,
    unsynchronized: u64,
}

/// Counters and steps of one thread
struct ThreadLines {
    thread_index: usize,
    lines_run: AtomicU64,
    buffer: Mutex<ThreadBuffer>,
}

impl ThreadLines {
    fn buffer(&self) -> MutexGuard<'_, ThreadBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LineTraceWorkingData {
    arguments: LineTraceArguments,
    threads: Mutex<Vec<Arc<ThreadLines>>>,
    callbacks: RwLock<Vec<LineCallback>>,
}

impl LineTraceWorkingData {
    fn threads(&self) -> MutexGuard<'_, Vec<Arc<ThreadLines>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_thread(&self, thread_index: usize) -> Arc<ThreadLines> {
        let lines = Arc::new(ThreadLines {
            thread_index,
            lines_run: AtomicU64::new(0),
            buffer: Mutex::new(ThreadBuffer::default()),
        });
        self.threads().push(Arc::clone(&lines));
        lines
    }

    fn lines_run_by_others(&self, thread_index: usize) -> u64 {
        self.threads()
            .iter()
            .filter(|t| t.thread_index != thread_index)
            .map(|t| t.lines_run.load(Ordering::Acquire))
            .sum()
    }

    pub fn add_line_callback(&self, callback: LineCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    fn report(&self) -> LineTraceResult {
        let mut threads: Vec<Arc<ThreadLines>> = self.threads().clone();
        threads.sort_by_key(|t| t.thread_index);
        let mut steps = Vec::new();
        let mut lines_run = 0;
        for thread in &threads {
            lines_run += thread.lines_run.load(Ordering::Acquire);
            steps.extend(thread.buffer().steps.iter().cloned());
        }
        LineTraceResult {
            arguments: self.arguments.clone(),
            steps,
            lines_run,
        }
    }

    fn reset(&self) {
        let threads: Vec<Arc<ThreadLines>> = self.threads().clone();
        for thread in &threads {
            let mut buffer = thread.buffer();
            thread.lines_run.store(0, Ordering::Release);
            buffer.others_seen = 0;
            buffer.unsynchronized = 0;
        }
    }

    fn on_line(
        &self,
        method: u64,
        sequence: i64,
        source: &str,
        line: u32,
        context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal> {
        let thread = context.thread_state(|index| self.register_thread(index));
        let mut buffer = thread.buffer();

        let current = LastLine {
            method,
            sequence,
            line,
        };
        if self.arguments.coalesce_duplicates {
            if let Some(last) = buffer.last {
                if last.method == method && last.line == line && sequence == last.sequence + 1 {
                    buffer.last = Some(current);
                    return Ok(());
                }
            }
        }
        buffer.last = Some(current);

        if let Some(limit) = self.arguments.run_line_limit {
            if buffer.unsynchronized >= self.arguments.max_unsynchronized_lines {
                buffer.others_seen = self.lines_run_by_others(thread.thread_index);
                buffer.unsynchronized = 0;
            }
            let total = thread.lines_run.load(Ordering::Acquire) + buffer.others_seen;
            if total >= limit {
                debug!(thread = thread.thread_index, total, limit, "run line limit reached");
                return Err(match self.arguments.run_line_limit_action {
                    RunLineLimitAction::KillSandbox => HookSignal::Kill(KILL_REASON.to_string()),
                    RunLineLimitAction::ThrowError => HookSignal::Throw(Exception::uncatchable(
                        LINE_LIMIT_EXCEPTION,
                        format!("exceeded {} lines", limit),
                    )),
                });
            }
        }
        thread.lines_run.fetch_add(1, Ordering::AcqRel);
        buffer.unsynchronized += 1;

        if buffer.steps.len() < self.arguments.recorded_step_limit {
            buffer.steps.push(LineStep {
                source: source.to_string(),
                line,
                thread_index: thread.thread_index,
            });
        }
        drop(buffer);

        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        if !callbacks.is_empty() {
            let event = LineEvent {
                source: source.to_string(),
                line,
                thread_index: thread.thread_index,
            };
            for callback in callbacks.iter() {
                callback(&event);
            }
        }
        Ok(())
    }
}

pub struct LineTraceInstrumentation {
    arguments: LineTraceArguments,
    methods: Mutex<Vec<String>>,
}

impl LineTraceInstrumentation {
    fn method_id(&self, name: String) -> u64 {
        let mut methods = self.methods.lock().unwrap_or_else(|e| e.into_inner());
        match methods.iter().position(|m| *m == name) {
            Some(index) => index as u64,
            None => {
                methods.push(name);
                (methods.len() - 1) as u64
            }
        }
    }
}

/// Records every source line reached by untrusted code
#[derive(Debug, Clone, Copy, Default)]
pub struct LineTrace;

impl LineTrace {
    /// Steps and counts so far, from trusted code inside the task
    pub fn current_report(context: &SandboxContext<'_>) -> Option<LineTraceResult> {
        context
            .working_data::<LineTrace>()
            .map(|working| working.report())
    }

    /// Zero the line counters of every thread. Recorded steps are kept.
    pub fn reset_line_counts(context: &SandboxContext<'_>) -> bool {
        match context.working_data::<LineTrace>() {
            Some(working) => {
                working.reset();
                true
            }
            None => false,
        }
    }

    /// Subscribe to every recorded line of the task
    pub fn add_line_callback(context: &SandboxContext<'_>, callback: LineCallback) -> bool {
        match context.working_data::<LineTrace>() {
            Some(working) => {
                working.add_line_callback(callback);
                true
            }
            None => false,
        }
    }
}

/// Labels that carry a line number, with their appearance order and
/// whether a frame follows them
struct LineLabels {
    lines: HashMap<LabelId, (i64, u32)>,
    wait_for_frame: HashSet<LabelId>,
}

fn scan(method: &MethodDef) -> LineLabels {
    let mut lines = HashMap::new();
    let mut wait_for_frame = HashSet::new();
    let mut sequence: HashMap<LabelId, i64> = HashMap::new();
    for insn in &method.code {
        if let Insn::Label(label) = insn {
            let next = sequence.len() as i64;
            sequence.entry(*label).or_insert(next);
        }
    }
    for insn in &method.code {
        if let Insn::LineNumber { line, start } = insn {
            if let Some(seq) = sequence.get(start) {
                lines.insert(*start, (*seq, *line));
            }
        }
    }

    let mut pending: Vec<LabelId> = Vec::new();
    for insn in &method.code {
        match insn {
            Insn::Label(label) => pending.push(*label),
            Insn::LineNumber { .. } => {}
            Insn::Frame { .. } => wait_for_frame.extend(pending.drain(..)),
            _ => pending.clear(),
        }
    }
    LineLabels {
        lines,
        wait_for_frame,
    }
}

fn line_hook(source: &str, method: u64, sequence: i64, line: u32) -> Insn {
    Insn::Hook {
        plugin: LineTrace::ID.to_string(),
        name: LINE_HOOK.to_string(),
        args: vec![
            HookArg::Const(Constant::Str(source.to_string())),
            HookArg::Const(Constant::Int(method as i64)),
            HookArg::Const(Constant::Int(sequence)),
            HookArg::Const(Constant::Int(line as i64)),
        ],
    }
}

impl SandboxPlugin for LineTrace {
    const ID: &'static str = "line-trace";

    type Arguments = LineTraceArguments;
    type InstrumentationData = LineTraceInstrumentation;
    type WorkingData = LineTraceWorkingData;
    type Result = LineTraceResult;

    fn create_default_arguments(&self) -> LineTraceArguments {
        LineTraceArguments::default()
    }

    fn create_instrumentation_data(
        &self,
        arguments: &LineTraceArguments,
        _loader_config: &LoaderConfig,
        _active_plugins: &[&'static str],
    ) -> Result<LineTraceInstrumentation, PluginError> {
        Ok(LineTraceInstrumentation {
            arguments: arguments.clone(),
            methods: Mutex::new(Vec::new()),
        })
    }

    fn transform_before_sandbox(
        &self,
        mut class: ClassFile,
        data: &LineTraceInstrumentation,
        context: RewritingContext,
    ) -> Result<ClassFile, PluginError> {
        if context != RewritingContext::Untrusted {
            return Ok(class);
        }
        let source = match class.source_file.clone() {
            Some(source) => source,
            None => return Ok(class),
        };

        for method in &mut class.methods {
            let labels = scan(method);
            if labels.lines.is_empty() {
                continue;
            }
            let method_id = data.method_id(format!("{}.{}", class.name, method.name));
            let mut code = Vec::with_capacity(method.code.len() + labels.lines.len());
            let mut deferred = Vec::new();
            for insn in method.code.drain(..) {
                match &insn {
                    Insn::Label(label) => {
                        let traced = labels.lines.get(label).copied();
                        let wait = labels.wait_for_frame.contains(label);
                        code.push(insn);
                        if let Some((sequence, line)) = traced {
                            let hook = line_hook(&source, method_id, sequence, line);
                            if wait {
                                deferred.push(hook);
                            } else {
                                code.push(hook);
                            }
                        }
                    }
                    Insn::Frame { .. } => {
                        code.push(insn);
                        code.append(&mut deferred);
                    }
                    _ => code.push(insn),
                }
            }
            method.code = code;
        }
        Ok(class)
    }

    fn create_initial_data(
        &self,
        data: &Arc<LineTraceInstrumentation>,
        _execution_arguments: &warden_sandbox::ExecutionArguments,
    ) -> Result<LineTraceWorkingData, PluginError> {
        Ok(LineTraceWorkingData {
            arguments: data.arguments.clone(),
            threads: Mutex::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
        })
    }

    fn on_hook(
        &self,
        working: &LineTraceWorkingData,
        call: &HookCall<'_>,
        context: &mut HookContext<'_>,
    ) -> Result<(), HookSignal> {
        if call.name != LINE_HOOK {
            return Ok(());
        }
        match call.args {
            [Value::Str(source), Value::Int(method), Value::Int(sequence), Value::Int(line)] => {
                working.on_line(*method as u64, *sequence, source, *line as u32, context)
            }
            _ => Ok(()),
        }
    }

    fn create_final_data(&self, working: &LineTraceWorkingData) -> LineTraceResult {
        working.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_sandbox::{
        CompiledUnit, EntryPoint, ExecutionArguments, ExecutionResult, ExecutionTask, LoadingUnit,
        PluginSet, Sandbox,
    };

    fn unit(source: &str, arguments: LineTraceArguments) -> Arc<LoadingUnit> {
        let compiled = CompiledUnit::from_assembly(source).unwrap();
        let mut plugins = PluginSet::new();
        plugins.add_with(LineTrace, arguments).unwrap();
        Arc::new(
            LoadingUnit::builder(Arc::new(compiled))
                .plugins(plugins)
                .build()
                .unwrap(),
        )
    }

    fn run(source: &str, arguments: LineTraceArguments, execution: ExecutionArguments) -> ExecutionResult {
        Sandbox::new()
            .execute(ExecutionTask::new(unit(source, arguments), EntryPoint::default()).with_arguments(execution))
            .unwrap()
    }

    fn lines(result: &ExecutionResult) -> Vec<u32> {
        result
            .plugin_results
            .get::<LineTrace>()
            .unwrap()
            .steps
            .iter()
            .map(|s| s.line)
            .collect()
    }

    const SPLIT_LINES: &str = r#"
.class Main
.source Main.java
.method static main
L0:
  line 1
  push 1
  pop
L1:
  line 2
  push 2
  pop
L2:
  line 2
  push 3
  pop
L3:
  line 3
  push "done"
  println
  return
.end
"#;

    const INFINITE: &str = r#"
.class Main
.source Main.java
.method static main
L0:
  line 1
  push "Here"
  println
L1:
  line 2
  frame
  jump L1
.end
"#;

    #[test]
    fn test_coalesces_split_lines() {
        let result = run(SPLIT_LINES, LineTraceArguments::default(), ExecutionArguments::default());
        assert!(result.completed);
        assert_eq!(lines(&result), vec![1, 2, 3]);
        let trace = result.plugin_results.get::<LineTrace>().unwrap();
        assert_eq!(trace.lines_run, 3);
        assert!(trace.steps.iter().all(|s| s.source == "Main.java" && s.thread_index == 0));
    }

    #[test]
    fn test_without_coalescing_every_label_counts() {
        let arguments = LineTraceArguments {
            coalesce_duplicates: false,
            ..LineTraceArguments::default()
        };
        let result = run(SPLIT_LINES, arguments, ExecutionArguments::default());
        assert_eq!(lines(&result), vec![1, 2, 2, 3]);
    }

    #[test]
    fn test_loop_lines_are_not_coalesced() {
        let source = r#"
.class Main
.source Main.java
.method static main
.locals 1
L0:
  line 1
  push 0
  store 0
L1:
  line 2
  frame
  load 0
  push 3
  lt
  jumpifnot L2
L3:
  line 3
  load 0
  push 1
  add
  store 0
  jump L1
L2:
  line 4
  frame
  return
.end
"#;
        let result = run(source, LineTraceArguments::default(), ExecutionArguments::default());
        assert!(result.completed);
        assert_eq!(lines(&result), vec![1, 2, 3, 2, 3, 2, 3, 2, 4]);
    }

    #[test]
    fn test_hook_deferred_past_frame() {
        let unit = unit(INFINITE, LineTraceArguments::default());
        let class = ClassFile::decode(unit.instrumented_bytecode("Main").unwrap()).unwrap();
        let code = &class.methods[0].code;
        let frame = code
            .iter()
            .position(|i| matches!(i, Insn::Frame { .. }))
            .unwrap();
        assert!(matches!(code[frame + 1], Insn::Hook { .. }));
        assert!(matches!(code[frame - 1], Insn::LineNumber { line: 2, .. }));
        let hooks = code.iter().filter(|i| matches!(i, Insn::Hook { .. })).count();
        assert_eq!(hooks, 2);
    }

    #[test]
    fn test_classes_without_source_are_untouched() {
        let source = ".class Main\n.method static main\nL0:\nline 1\nreturn\n.end\n";
        let unit = unit(source, LineTraceArguments::default());
        let class = ClassFile::decode(unit.instrumented_bytecode("Main").unwrap()).unwrap();
        assert!(!class.methods[0]
            .code
            .iter()
            .any(|i| matches!(i, Insn::Hook { .. })));
    }

    #[test]
    fn test_recorded_step_limit() {
        let arguments = LineTraceArguments {
            recorded_step_limit: 2,
            ..LineTraceArguments::default()
        };
        let result = run(SPLIT_LINES, arguments, ExecutionArguments::default());
        let trace = result.plugin_results.get::<LineTrace>().unwrap();
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.lines_run, 3);
    }

    #[test]
    fn test_run_line_limit_kills() {
        for max_unsynchronized_lines in [0, 1_000] {
            let arguments = LineTraceArguments {
                run_line_limit: Some(500),
                max_unsynchronized_lines,
                ..LineTraceArguments::default()
            };
            let result = run(INFINITE, arguments, ExecutionArguments::default().with_timeout(5_000));
            assert!(result.killed);
            assert!(!result.timed_out);
            assert!(!result.completed);
            assert_eq!(result.kill_reason.as_deref(), Some(KILL_REASON));
            assert_eq!(result.stdout(), "Here");
            let trace = result.plugin_results.get::<LineTrace>().unwrap();
            assert_eq!(trace.lines_run, 500);
        }
    }

    #[test]
    fn test_run_line_limit_throws() {
        let arguments = LineTraceArguments {
            run_line_limit: Some(100),
            run_line_limit_action: RunLineLimitAction::ThrowError,
            ..LineTraceArguments::default()
        };
        let source = r#"
.class Main
.source Main.java
.method static main
.catch L0 L2 L3
L0:
  line 1
  frame
  jump L0
L2:
  return
L3:
  frame 1
  pop
  push "caught"
  println
  return
.end
"#;
        let result = run(source, arguments, ExecutionArguments::default().with_timeout(5_000));
        assert!(result.failed);
        assert!(!result.killed);
        assert_eq!(result.error.as_ref().unwrap().kind, LINE_LIMIT_EXCEPTION);
        assert_eq!(result.stdout(), "");
    }

    #[test]
    fn test_run_line_limit_across_threads() {
        let source = r#"
.class Main
.source Main.java
.method static main
L0:
  line 1
  spawn Main.spin
  pop
  spawn Main.spin
  pop
L1:
  line 2
  frame
  jump L1
.end
.method static spin
L0:
  line 10
  frame
  jump L0
.end
"#;
        for max_unsynchronized_lines in [0u64, 1_000] {
            let limit = 5_000;
            let arguments = LineTraceArguments {
                run_line_limit: Some(limit),
                max_unsynchronized_lines,
                ..LineTraceArguments::default()
            };
            let execution = ExecutionArguments::default()
                .with_max_extra_threads(2)
                .with_timeout(10_000);
            let result = run(source, arguments, execution);
            assert!(result.killed, "limit not enforced with batching {}", max_unsynchronized_lines);
            let trace = result.plugin_results.get::<LineTrace>().unwrap();
            assert!(trace.lines_run >= limit - 3 * (max_unsynchronized_lines + 1));
            assert!(trace.lines_run <= limit + 3 * (max_unsynchronized_lines + 1));
            let mut threads: Vec<usize> = trace.steps.iter().map(|s| s.thread_index).collect();
            let sorted = {
                let mut sorted = threads.clone();
                sorted.sort();
                sorted
            };
            assert_eq!(threads, sorted);
            threads.dedup();
            assert_eq!(threads[0], 0);
        }
    }

    #[test]
    fn test_snapshot_and_reset_from_trusted_code() {
        let unit = unit(SPLIT_LINES, LineTraceArguments::default());
        let result = Sandbox::new()
            .execute_with(unit, ExecutionArguments::default(), |context| {
                context.invoke("Main", "main", Vec::new())?;
                let report = LineTrace::current_report(context).unwrap();
                assert_eq!(report.lines_run, 3);
                assert!(LineTrace::reset_line_counts(context));
                assert_eq!(LineTrace::current_report(context).unwrap().lines_run, 0);
                context.invoke("Main", "main", Vec::new())
            })
            .unwrap();
        assert!(result.completed);
        let trace = result.plugin_results.get::<LineTrace>().unwrap();
        assert_eq!(trace.lines_run, 3);
        assert_eq!(trace.steps.len(), 6);
    }

    #[test]
    fn test_line_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unit = unit(SPLIT_LINES, LineTraceArguments::default());
        let result = Sandbox::new()
            .execute_with(unit, ExecutionArguments::default(), move |context| {
                let callback: LineCallback = Arc::new(move |event: &LineEvent| {
                    sink.lock().unwrap().push(event.line);
                });
                assert!(LineTrace::add_line_callback(context, callback));
                context.invoke("Main", "main", Vec::new())
            })
            .unwrap();
        assert!(result.completed);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
