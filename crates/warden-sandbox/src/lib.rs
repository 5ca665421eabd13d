//! Warden Sandbox - confined execution of untrusted bytecode
//!
//! Programs are loaded into an isolated loading unit, confined with an
//! explicit permission set, and run on their own threads with a hard
//! timeout. Every permission request is answered from the task's
//! capability and logged.

pub mod asm;
pub mod bytecode;
pub mod disasm;
mod interpreter;
pub mod loader;
pub mod output;
pub mod permissions;
pub mod plugin;
pub mod registry;
pub mod runner;
pub mod task;
pub mod value;
pub mod verify;

pub use asm::{assemble, AssembleError};
pub use bytecode::{ClassFile, CompiledUnit, Insn, MethodDef};
pub use disasm::disassemble;
pub use loader::{LoadError, LoaderConfig, LoaderId, LoadingUnit, PERMANENTLY_BLOCKED_CLASSES};
pub use output::{Console, OutputLine};
pub use permissions::{Permission, PermissionDecision, PermissionSet};
pub use plugin::{
    HookCall, HookSignal, PluginError, PluginResults, PluginSet, RewritingContext, SandboxPlugin,
};
pub use registry::{Capability, ConfinementError, ConfinementRegistry, ConfinementToken};
pub use runner::{ExecutionResult, Result, Sandbox, SandboxError, TaskError};
pub use task::{
    EntryPoint, ExecutionArguments, ExecutionTask, Fault, HookContext, SandboxContext,
    ThreadContext,
};
pub use value::{Exception, Object, Value};
pub use verify::{verify_class, VerifyError, VerifyMode};
