//! Confined tasks: arguments, thread tracking and the contexts handed to
//! trusted code and plugin hooks

use crate::interpreter::Interpreter;
use crate::loader::LoadingUnit;
use crate::output::{Console, OutputSink};
use crate::permissions::{Permission, PermissionSet};
use crate::plugin::{AnyArc, SandboxPlugin, TaskPlugins};
use crate::registry::{Capability, ConfinementError};
use crate::value::{Exception, Value};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Thread index of the thread that runs the work unit
pub const MAIN_THREAD_INDEX: usize = 0;

pub const DEFAULT_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_MAX_EXTRA_THREADS: usize = 0;
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 1024;

/// Limits and grants for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionArguments {
    pub timeout_ms: u64,
    pub permissions: PermissionSet,
    pub max_extra_threads: usize,
    pub capture_output: bool,
    pub max_output_lines: usize,
}

impl Default for ExecutionArguments {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            permissions: PermissionSet::new(),
            max_extra_threads: DEFAULT_MAX_EXTRA_THREADS,
            capture_output: true,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
        }
    }
}

impl ExecutionArguments {
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_max_extra_threads(mut self, max_extra_threads: usize) -> Self {
        self.max_extra_threads = max_extra_threads;
        self
    }

    pub fn with_capture_output(mut self, capture_output: bool) -> Self {
        self.capture_output = capture_output;
        self
    }

    pub fn with_max_output_lines(mut self, max_output_lines: usize) -> Self {
        self.max_output_lines = max_output_lines;
        self
    }
}

/// Static, parameterless method a task starts in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub class: String,
    pub method: String,
}

impl EntryPoint {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self::new("Main", "main")
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub loader: Arc<LoadingUnit>,
    pub entry: EntryPoint,
    pub arguments: ExecutionArguments,
}

impl ExecutionTask {
    pub fn new(loader: Arc<LoadingUnit>, entry: EntryPoint) -> Self {
        Self {
            loader,
            entry,
            arguments: ExecutionArguments::default(),
        }
    }

    pub fn with_arguments(mut self, arguments: ExecutionArguments) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Why interpreted code stopped abnormally
#[derive(Debug, Clone)]
pub enum Fault {
    /// An exception nothing caught
    Threw(Exception),
    /// A denied permission check aborted the thread
    Security(Permission),
    /// The task was cancelled (timeout or kill)
    Cancelled,
    /// The confinement protocol was violated
    Confinement(ConfinementError),
}

#[derive(Default)]
struct ThreadTracking {
    next_index: usize,
    handles: HashMap<usize, JoinHandle<()>>,
    finished: HashSet<usize>,
}

/// State shared by every thread of one task
pub(crate) struct TaskShared {
    pub id: Uuid,
    pub loader: Arc<LoadingUnit>,
    pub capability: Capability,
    pub output: OutputSink,
    pub plugins: TaskPlugins,
    max_extra_threads: usize,
    cancelled: AtomicBool,
    kill_reason: Mutex<Option<String>>,
    tracking: Mutex<ThreadTracking>,
    thread_done: Condvar,
}

impl TaskShared {
    pub fn new(
        loader: Arc<LoadingUnit>,
        capability: Capability,
        output: OutputSink,
        plugins: TaskPlugins,
        max_extra_threads: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loader,
            capability,
            output,
            plugins,
            max_extra_threads,
            cancelled: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
            tracking: Mutex::new(ThreadTracking {
                next_index: MAIN_THREAD_INDEX + 1,
                ..ThreadTracking::default()
            }),
            thread_done: Condvar::new(),
        }
    }

    pub fn thread_context(&self, index: usize) -> ThreadContext {
        ThreadContext {
            index,
            slots: vec![None; self.plugins.len()],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.thread_done.notify_all();
    }

    /// Stop the task. The first reason wins.
    pub fn kill(&self, reason: impl Into<String>) {
        let mut kill_reason = self.kill_reason.lock().unwrap_or_else(|e| e.into_inner());
        if kill_reason.is_none() {
            let reason = reason.into();
            debug!(task = %self.id, %reason, "task killed");
            *kill_reason = Some(reason);
        }
        drop(kill_reason);
        self.cancel();
    }

    pub fn kill_reason(&self) -> Option<String> {
        self.kill_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn thread_name(&self, index: usize) -> String {
        let id = self.id.simple().to_string();
        format!("warden-{}-{}", &id[..8], index)
    }

    /// Track the main thread's handle so shutdown joins it too
    pub fn adopt_main_thread(&self, handle: JoinHandle<()>) {
        let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
        tracking.handles.insert(MAIN_THREAD_INDEX, handle);
    }

    /// Take the next thread index. Fails while `limit` extra threads are
    /// still running; indexes are never reused.
    fn register_locked(
        tracking: &mut ThreadTracking,
        limit: usize,
    ) -> Result<usize, ConfinementError> {
        let live = tracking
            .handles
            .keys()
            .filter(|index| **index != MAIN_THREAD_INDEX && !tracking.finished.contains(index))
            .count();
        if live >= limit {
            return Err(ConfinementError::ThreadLimit { limit });
        }
        let index = tracking.next_index;
        tracking.next_index += 1;
        Ok(index)
    }

    /// Start an extra task thread running `class.method`
    pub fn spawn_thread(self: &Arc<Self>, class: &str, method: &str) -> Result<usize, Fault> {
        if self.is_cancelled() {
            return Err(Fault::Cancelled);
        }
        let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
        let registered = Self::register_locked(&mut tracking, self.max_extra_threads);
        self.capability
            .record(Permission::CreateThread, registered.is_ok());
        let index = match registered {
            Ok(index) => index,
            Err(ConfinementError::ThreadLimit { .. }) => {
                return Err(Fault::Security(Permission::CreateThread))
            }
            Err(e) => return Err(Fault::Confinement(e)),
        };

        let task = Arc::clone(self);
        let (class, method) = (class.to_string(), method.to_string());
        let handle = thread::Builder::new()
            .name(self.thread_name(index))
            .spawn(move || task.run_extra_thread(index, &class, &method))
            .map_err(|e| {
                Fault::Threw(Exception::uncatchable(
                    "OutOfMemoryError",
                    format!("unable to create thread: {}", e),
                ))
            })?;
        tracking.handles.insert(index, handle);
        Ok(index)
    }

    fn run_extra_thread(self: &Arc<Self>, index: usize, class: &str, method: &str) {
        let mut thread = self.thread_context(index);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            Interpreter::new(self, &mut thread).invoke(class, method, Vec::new())
        }));
        match outcome {
            Ok(Ok(_)) | Ok(Err(Fault::Cancelled)) => {}
            Ok(Err(Fault::Threw(exception))) => {
                let message = format!("Exception in thread {}: {}\n", index, exception);
                self.output.write(Console::Stderr, &message, index);
            }
            Ok(Err(fault)) => debug!(task = %self.id, index, ?fault, "task thread stopped"),
            Err(_) => warn!(task = %self.id, index, "task thread panicked"),
        }
        self.finish_thread(index);
    }

    fn finish_thread(&self, index: usize) {
        let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
        tracking.finished.insert(index);
        self.thread_done.notify_all();
    }

    /// Wait for thread `index` to finish, or for cancellation
    pub fn join_thread(&self, index: usize) -> Result<(), Fault> {
        let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
        if index == MAIN_THREAD_INDEX || index >= tracking.next_index {
            return Err(Fault::Threw(Exception::new(
                "IllegalArgumentException",
                format!("no joinable thread {}", index),
            )));
        }
        loop {
            if tracking.finished.contains(&index) {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(Fault::Cancelled);
            }
            let (guard, _) = self
                .thread_done
                .wait_timeout(tracking, Duration::from_millis(10))
                .unwrap_or_else(|e| e.into_inner());
            tracking = guard;
        }
    }

    /// Cancel and join every task thread. Threads still running after
    /// `retries` polls are abandoned; returns how many were abandoned.
    pub fn shut_down(&self, retries: u32, delay: Duration) -> usize {
        self.cancel();
        self.output.shut_down();
        for attempt in 0..=retries {
            let finished: Vec<JoinHandle<()>> = {
                let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
                let done: Vec<usize> = tracking
                    .handles
                    .iter()
                    .filter(|(_, handle)| handle.is_finished())
                    .map(|(index, _)| *index)
                    .collect();
                done.iter()
                    .filter_map(|index| tracking.handles.remove(index))
                    .collect()
            };
            for handle in finished {
                let _ = handle.join();
            }
            let remaining = self
                .tracking
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handles
                .len();
            if remaining == 0 {
                return 0;
            }
            if attempt < retries {
                thread::sleep(delay);
            }
        }
        let mut tracking = self.tracking.lock().unwrap_or_else(|e| e.into_inner());
        let abandoned = tracking.handles.len();
        tracking.handles.clear();
        warn!(task = %self.id, abandoned, "abandoning task threads that ignored cancellation");
        abandoned
    }
}

/// Per-thread interpreter state: the thread index and the thread-local
/// slot of every active plugin
pub struct ThreadContext {
    index: usize,
    slots: Vec<Option<AnyArc>>,
}

impl ThreadContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn slot_mut(&mut self, plugin: usize) -> Option<&mut Option<AnyArc>> {
        self.slots.get_mut(plugin)
    }
}

/// Handle given to trusted code running on the main task thread
pub struct SandboxContext<'a> {
    task: &'a Arc<TaskShared>,
    thread: &'a mut ThreadContext,
}

impl<'a> SandboxContext<'a> {
    pub(crate) fn new(task: &'a Arc<TaskShared>, thread: &'a mut ThreadContext) -> Self {
        Self { task, thread }
    }

    pub fn thread_index(&self) -> usize {
        self.thread.index
    }

    pub fn loader(&self) -> &LoadingUnit {
        &self.task.loader
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Run `class.method` inside the confinement
    pub fn invoke(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        Interpreter::new(self.task, self.thread).invoke(class, method, args)
    }

    /// Working data of plugin `P`, when active in this task
    pub fn working_data<P: SandboxPlugin>(&self) -> Option<Arc<P::WorkingData>> {
        self.task.plugins.working_data::<P>()
    }

    /// This thread's state for plugin `P`, if a hook has created it
    pub fn thread_state<P: SandboxPlugin, T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let index = self.task.plugins.position(P::ID)?;
        let slot = self.thread.slots.get(index)?.as_ref()?;
        Arc::clone(slot).downcast::<T>().ok()
    }
}

/// Handle given to a plugin hook
pub struct HookContext<'a> {
    task: &'a TaskShared,
    thread_index: usize,
    slot: &'a mut Option<AnyArc>,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(task: &'a TaskShared, thread_index: usize, slot: &'a mut Option<AnyArc>) -> Self {
        Self {
            task,
            thread_index,
            slot,
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// This thread's plugin state, created by `init` on first touch
    pub fn thread_state<T: Any + Send + Sync>(&mut self, init: impl FnOnce(usize) -> Arc<T>) -> Arc<T> {
        if let Some(existing) = self.slot.as_ref() {
            if let Ok(state) = Arc::clone(existing).downcast::<T>() {
                return state;
            }
        }
        let state = init(self.thread_index);
        *self.slot = Some(state.clone() as AnyArc);
        state
    }
}
