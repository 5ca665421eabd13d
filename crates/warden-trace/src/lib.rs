//! Warden Trace - instrumentation plugins for the warden sandbox
//!
//! [`LineTrace`] records every source line reached by untrusted code and
//! enforces run-line limits. [`MethodTrace`] records method entries with
//! their arguments and can merge the line feed into the same sequence.

pub mod line_trace;
pub mod method_trace;

pub use line_trace::{
    LineCallback, LineEvent, LineStep, LineTrace, LineTraceArguments, LineTraceResult,
    RunLineLimitAction,
};
pub use method_trace::{
    ArgumentValue, ExecutionStep, MethodTrace, MethodTraceArguments, MethodTraceResult,
};
