//! Bytecode interpreter
//!
//! Runs one activation chain on the current thread with an explicit frame
//! stack. Cancellation is observed before every instruction, every hook and
//! inside blocking host calls. All security-sensitive host calls go through
//! the task's [`Capability`](crate::registry::Capability).

use crate::bytecode::{BinaryOp, HookArg, Insn, NativeOp};
use crate::loader::LoadedClass;
use crate::output::Console;
use crate::permissions::Permission;
use crate::plugin::{HookCall, HookSignal};
use crate::task::{Fault, HookContext, TaskShared, ThreadContext};
use crate::value::{Exception, Object, Value};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MAX_CALL_DEPTH: usize = 512;
pub const MAX_STACK_DEPTH: usize = 1 << 16;
pub const MAX_STRING_LENGTH: usize = 1 << 20;

const SLEEP_SLICE: Duration = Duration::from_millis(5);

enum Raise {
    Throw(Arc<Exception>),
    Fault(Fault),
}

impl From<Fault> for Raise {
    fn from(fault: Fault) -> Self {
        Raise::Fault(fault)
    }
}

fn throw(kind: &str, message: impl Into<String>) -> Raise {
    Raise::Throw(Arc::new(Exception::new(kind, message)))
}

fn verify_error(message: impl Into<String>) -> Raise {
    Raise::Throw(Arc::new(Exception::uncatchable("VerifyError", message)))
}

enum Flow {
    Next,
    Call(Frame),
    Return(Option<Value>),
}

struct Frame {
    class: Arc<LoadedClass>,
    method: usize,
    pc: usize,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, Raise> {
        self.stack
            .pop()
            .ok_or_else(|| verify_error("operand stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Raise> {
        if self.stack.len() < n {
            return Err(verify_error("operand stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn push(&mut self, value: Value) -> Result<(), Raise> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(throw("OutOfMemoryError", "operand stack exhausted"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop_str(&mut self) -> Result<String, Raise> {
        match self.pop()? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(throw(
                "TypeError",
                format!("expected string, found {}", other.type_name()),
            )),
        }
    }

    fn pop_int(&mut self) -> Result<i64, Raise> {
        match self.pop()? {
            Value::Int(i) => Ok(i),
            other => Err(throw(
                "TypeError",
                format!("expected int, found {}", other.type_name()),
            )),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, Raise> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            other => Err(throw(
                "TypeError",
                format!("expected bool, found {}", other.type_name()),
            )),
        }
    }

    fn pop_object(&mut self) -> Result<Arc<Object>, Raise> {
        match self.pop()? {
            Value::Object(object) => Ok(object),
            Value::Null => Err(throw("NullPointerException", "")),
            other => Err(throw(
                "TypeError",
                format!("expected object, found {}", other.type_name()),
            )),
        }
    }

    fn jump(&mut self, label: crate::bytecode::LabelId) -> Result<(), Raise> {
        let target = self.class.methods[self.method]
            .label_pc(label)
            .ok_or_else(|| verify_error(format!("unknown label {}", label)))?;
        self.pc = target;
        Ok(())
    }
}

pub(crate) struct Interpreter<'a> {
    task: &'a Arc<TaskShared>,
    thread: &'a mut ThreadContext,
    classes: HashMap<String, Arc<LoadedClass>>,
}

impl<'a> Interpreter<'a> {
    pub fn new(task: &'a Arc<TaskShared>, thread: &'a mut ThreadContext) -> Self {
        Self {
            task,
            thread,
            classes: HashMap::new(),
        }
    }

    /// Run `class.method` to completion. Instance methods take the
    /// receiver as the first argument.
    pub fn invoke(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let frame = self
            .resolve(class)
            .and_then(|class| call_frame(class, method, args, None));
        match frame {
            Ok(frame) => self.run(frame),
            Err(Raise::Throw(exception)) => Err(Fault::Threw((*exception).clone())),
            Err(Raise::Fault(fault)) => Err(fault),
        }
    }

    fn run(&mut self, entry: Frame) -> Result<Value, Fault> {
        let mut frames = vec![entry];
        loop {
            if self.task.is_cancelled() {
                return Err(Fault::Cancelled);
            }
            let frame = match frames.last_mut() {
                Some(frame) => frame,
                None => return Ok(Value::Null),
            };
            match self.step(frame) {
                Ok(Flow::Next) => {}
                Ok(Flow::Call(callee)) => {
                    if frames.len() >= MAX_CALL_DEPTH {
                        let overflow = Arc::new(Exception::new("StackOverflowError", ""));
                        self.unwind(&mut frames, overflow)?;
                    } else {
                        frames.push(callee);
                    }
                }
                Ok(Flow::Return(value)) => {
                    frames.pop();
                    match frames.last_mut() {
                        None => return Ok(value.unwrap_or(Value::Null)),
                        Some(caller) => {
                            if let Some(value) = value {
                                caller.stack.push(value);
                            }
                        }
                    }
                }
                Err(Raise::Throw(exception)) => self.unwind(&mut frames, exception)?,
                Err(Raise::Fault(fault)) => return Err(fault),
            }
        }
    }

    /// Transfer control to the innermost matching handler, or fail with
    /// the exception once every frame is gone
    fn unwind(&self, frames: &mut Vec<Frame>, exception: Arc<Exception>) -> Result<(), Fault> {
        let catchable = !exception.uncatchable
            && !self
                .task
                .loader
                .config()
                .is_unsafe_exception(&exception.kind);
        while let Some(frame) = frames.last_mut() {
            if catchable {
                let pc = frame.pc.saturating_sub(1);
                let target = frame.class.methods[frame.method]
                    .handlers
                    .iter()
                    .find(|h| {
                        pc >= h.start
                            && pc < h.end
                            && h.kind.as_ref().map_or(true, |k| *k == exception.kind)
                    })
                    .map(|h| h.target);
                if let Some(target) = target {
                    frame.stack.clear();
                    frame.stack.push(Value::Exception(exception));
                    frame.pc = target;
                    return Ok(());
                }
            }
            frames.pop();
        }
        Err(Fault::Threw((*exception).clone()))
    }

    fn resolve(&mut self, name: &str) -> Result<Arc<LoadedClass>, Raise> {
        if let Some(class) = self.classes.get(name) {
            return Ok(class.clone());
        }
        let class = self
            .task
            .loader
            .load_class(name, Some(&self.task.capability))
            .map_err(|_| throw("ClassNotFoundException", name))?;
        self.classes.insert(name.to_string(), class.clone());
        Ok(class)
    }

    fn step(&mut self, frame: &mut Frame) -> Result<Flow, Raise> {
        let class = Arc::clone(&frame.class);
        let insn = match class.methods[frame.method].def.code.get(frame.pc) {
            Some(insn) => insn,
            None => return Ok(Flow::Return(None)),
        };
        frame.pc += 1;

        match insn {
            Insn::Label(_) | Insn::LineNumber { .. } => {}
            Insn::Frame { stack } => {
                if frame.stack.len() != *stack as usize {
                    return Err(verify_error(format!(
                        "stack depth {} at frame expecting {}",
                        frame.stack.len(),
                        stack
                    )));
                }
            }
            Insn::Push(constant) => frame.push(Value::from(constant))?,
            Insn::Load(index) => {
                let value = frame
                    .locals
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| verify_error(format!("local {} out of range", index)))?;
                frame.push(value)?;
            }
            Insn::Store(index) => {
                let value = frame.pop()?;
                let slot = frame
                    .locals
                    .get_mut(*index as usize)
                    .ok_or_else(|| verify_error(format!("local {} out of range", index)))?;
                *slot = value;
            }
            Insn::Binary(op) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary(*op, left, right)?)?;
            }
            Insn::Neg => {
                let value = frame.pop_int()?;
                frame.push(Value::Int(value.wrapping_neg()))?;
            }
            Insn::Not => {
                let value = frame.pop_bool()?;
                frame.push(Value::Bool(!value))?;
            }
            Insn::Dup => {
                let value = frame.pop()?;
                frame.push(value.clone())?;
                frame.push(value)?;
            }
            Insn::Pop => {
                frame.pop()?;
            }
            Insn::Swap => {
                let top = frame.pop()?;
                let below = frame.pop()?;
                frame.push(top)?;
                frame.push(below)?;
            }
            Insn::Jump(label) => frame.jump(*label)?,
            Insn::JumpIf(label) => {
                if frame.pop_bool()? {
                    frame.jump(*label)?;
                }
            }
            Insn::JumpIfNot(label) => {
                if !frame.pop_bool()? {
                    frame.jump(*label)?;
                }
            }
            Insn::InvokeStatic { class, method } => {
                let target = self.resolve(class)?;
                let count = match target.method(method) {
                    Some(m) if m.def.is_static => m.def.params.len(),
                    _ => {
                        return Err(throw(
                            "NoSuchMethodError",
                            format!("static {}.{}", class, method),
                        ))
                    }
                };
                let args = frame.pop_n(count)?;
                return Ok(Flow::Call(call_frame(target, method, args, Some(true))?));
            }
            Insn::InvokeVirtual { method, args } => {
                let mut call_args = frame.pop_n(*args as usize)?;
                let receiver = frame.pop_object()?;
                let target = self.resolve(&receiver.class)?;
                call_args.insert(0, Value::Object(receiver));
                return Ok(Flow::Call(call_frame(target, method, call_args, Some(false))?));
            }
            Insn::New(name) => {
                let target = self.resolve(name)?;
                frame.push(Value::Object(Arc::new(Object::new(target.name.clone()))))?;
            }
            Insn::GetField(field) => {
                let object = frame.pop_object()?;
                frame.push(object.get(field))?;
            }
            Insn::PutField(field) => {
                let value = frame.pop()?;
                let object = frame.pop_object()?;
                object.set(field, value);
            }
            Insn::NewException(kind) => {
                let message = match frame.pop()? {
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                frame.push(Value::Exception(Arc::new(Exception::new(
                    kind.clone(),
                    message,
                ))))?;
            }
            Insn::Throw => {
                return match frame.pop()? {
                    Value::Exception(exception) => Err(Raise::Throw(exception)),
                    Value::Null => Err(throw("NullPointerException", "throw null")),
                    other => Err(throw(
                        "TypeError",
                        format!("cannot throw {}", other.type_name()),
                    )),
                };
            }
            Insn::Return => return Ok(Flow::Return(None)),
            Insn::ReturnValue => return Ok(Flow::Return(Some(frame.pop()?))),
            Insn::Native(op) => self.native(frame, op)?,
            Insn::Hook { plugin, name, args } => self.hook(frame, plugin, name, args)?,
        }
        Ok(Flow::Next)
    }

    /// Check `permission`; a denial aborts the thread
    fn require(&self, permission: Permission) -> Result<(), Raise> {
        if self.task.capability.check(permission.clone()) {
            Ok(())
        } else {
            Err(Fault::Security(permission).into())
        }
    }

    fn native(&mut self, frame: &mut Frame, op: &NativeOp) -> Result<(), Raise> {
        let thread = self.thread.index();
        match op {
            NativeOp::Print | NativeOp::Println | NativeOp::Eprint | NativeOp::Eprintln => {
                let mut text = frame.pop()?.to_string();
                if matches!(op, NativeOp::Println | NativeOp::Eprintln) {
                    text.push('\n');
                }
                let console = match op {
                    NativeOp::Eprint | NativeOp::Eprintln => Console::Stderr,
                    _ => Console::Stdout,
                };
                self.task.output.write(console, &text, thread);
            }
            NativeOp::ReadFile => {
                let path = frame.pop_str()?;
                let permission = Permission::ReadFile(PathBuf::from(&path));
                match self.task.loader.class_file_bytes(&path) {
                    Some(bytes) => {
                        self.task.capability.record(permission, true);
                        frame.push(Value::str(String::from_utf8_lossy(bytes)))?;
                    }
                    None => {
                        self.task.capability.record(permission.clone(), false);
                        return Err(Fault::Security(permission).into());
                    }
                }
            }
            NativeOp::WriteFile => {
                let contents = frame.pop()?.to_string();
                let path = frame.pop_str()?;
                self.require(Permission::WriteFile(PathBuf::from(&path)))?;
                std::fs::write(&path, contents).map_err(|e| throw("IOException", e.to_string()))?;
            }
            NativeOp::GetEnv => {
                let name = frame.pop_str()?;
                self.require(Permission::EnvVar(name.clone()))?;
                let value = std::env::var(&name).map(Value::str).unwrap_or(Value::Null);
                frame.push(value)?;
            }
            NativeOp::GetProperty => {
                let name = frame.pop_str()?;
                self.require(Permission::ReadProperty(name.clone()))?;
                frame.push(property(&name).map(Value::str).unwrap_or(Value::Null))?;
            }
            NativeOp::Exit => {
                frame.pop_int()?;
                self.require(Permission::Exit)?;
            }
            NativeOp::SetIo => self.require(Permission::SetIo)?,
            NativeOp::Spawn { class, method } => {
                let index = self.task.spawn_thread(class, method)?;
                frame.push(Value::Int(index as i64))?;
            }
            NativeOp::Join => {
                let index = frame.pop_int()?;
                if index < 0 {
                    return Err(throw("IllegalArgumentException", "negative thread index"));
                }
                self.task.join_thread(index as usize).map_err(|fault| match fault {
                    Fault::Threw(exception) => Raise::Throw(Arc::new(exception)),
                    other => Raise::Fault(other),
                })?;
            }
            NativeOp::Sleep => {
                let millis = frame.pop_int()?;
                if millis < 0 {
                    return Err(throw("IllegalArgumentException", "negative sleep"));
                }
                let deadline = Instant::now() + Duration::from_millis(millis as u64);
                loop {
                    if self.task.is_cancelled() {
                        return Err(Fault::Cancelled.into());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(SLEEP_SLICE.min(deadline - now));
                }
            }
            NativeOp::Time => frame.push(Value::Int(Utc::now().timestamp_millis()))?,
            NativeOp::LoadClass => {
                let name = frame.pop_str()?;
                let class = self.resolve(&name)?;
                frame.push(Value::str(&class.name))?;
            }
        }
        Ok(())
    }

    fn hook(
        &mut self,
        frame: &Frame,
        plugin: &str,
        name: &str,
        args: &[HookArg],
    ) -> Result<(), Raise> {
        let task: &'a Arc<TaskShared> = self.task;
        let index = match task.plugins.position(plugin) {
            Some(index) => index,
            None => return Ok(()),
        };
        if task.is_cancelled() {
            return Err(Fault::Cancelled.into());
        }
        let values: Vec<Value> = args
            .iter()
            .map(|arg| match arg {
                HookArg::Const(constant) => Value::from(constant),
                HookArg::Local(local) => frame
                    .locals
                    .get(*local as usize)
                    .cloned()
                    .unwrap_or(Value::Null),
            })
            .collect();
        let entry = match task.plugins.get(index) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let thread_index = self.thread.index();
        let slot = match self.thread.slot_mut(index) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let mut context = HookContext::new(task, thread_index, slot);
        let call = HookCall {
            name,
            args: &values,
        };
        match entry.plugin.on_hook(&entry.working, &call, &mut context) {
            Ok(()) => Ok(()),
            Err(HookSignal::Throw(exception)) => Err(Raise::Throw(Arc::new(exception))),
            Err(HookSignal::Kill(reason)) => {
                task.kill(reason);
                Err(Fault::Cancelled.into())
            }
        }
    }
}

/// Frame for calling `method` on `class`. `want_static` restricts the kind
/// of method; `None` accepts either.
fn call_frame(
    class: Arc<LoadedClass>,
    method: &str,
    args: Vec<Value>,
    want_static: Option<bool>,
) -> Result<Frame, Raise> {
    let index = class
        .methods
        .iter()
        .position(|m| m.def.name == method)
        .ok_or_else(|| throw("NoSuchMethodError", format!("{}.{}", class.name, method)))?;
    let def = &class.methods[index].def;
    if want_static.map_or(false, |s| s != def.is_static) || args.len() != def.min_locals() {
        return Err(throw(
            "NoSuchMethodError",
            def.descriptor(&class.name),
        ));
    }
    let mut locals = args;
    locals.resize(def.max_locals as usize, Value::Null);
    Ok(Frame {
        class,
        method: index,
        pc: 0,
        locals,
        stack: Vec::new(),
    })
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, Raise> {
    match (op, &left, &right) {
        (BinaryOp::Concat, _, _) => {
            let joined = format!("{}{}", left, right);
            if joined.len() > MAX_STRING_LENGTH {
                return Err(throw("OutOfMemoryError", "string too long"));
            }
            Ok(Value::str(joined))
        }
        (BinaryOp::Eq, _, _) => Ok(Value::Bool(left.same(&right))),
        (BinaryOp::Ne, _, _) => Ok(Value::Bool(!left.same(&right))),
        (_, Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            Ok(match op {
                BinaryOp::Add => Value::Int(a.wrapping_add(b)),
                BinaryOp::Sub => Value::Int(a.wrapping_sub(b)),
                BinaryOp::Mul => Value::Int(a.wrapping_mul(b)),
                BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                    return Err(throw("ArithmeticException", "/ by zero"))
                }
                BinaryOp::Div => Value::Int(a.wrapping_div(b)),
                BinaryOp::Rem => Value::Int(a.wrapping_rem(b)),
                BinaryOp::Lt => Value::Bool(a < b),
                BinaryOp::Le => Value::Bool(a <= b),
                BinaryOp::Gt => Value::Bool(a > b),
                BinaryOp::Ge => Value::Bool(a >= b),
                BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Concat => Value::Null,
            })
        }
        _ => Err(throw(
            "TypeError",
            format!(
                "cannot {} {} and {}",
                op.mnemonic(),
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

/// Runtime properties visible to programs
fn property(name: &str) -> Option<String> {
    match name {
        "os.name" => Some(std::env::consts::OS.to_string()),
        "os.arch" => Some(std::env::consts::ARCH.to_string()),
        "line.separator" => Some("\n".to_string()),
        "file.separator" => Some(std::path::MAIN_SEPARATOR.to_string()),
        "runtime.version" => Some(env!("CARGO_PKG_VERSION").to_string()),
        "user.dir" => std::env::current_dir()
            .ok()
            .map(|dir| dir.display().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompiledUnit;
    use crate::loader::{LoaderConfig, LoadingUnit};
    use crate::output::{CapturedOutput, OutputLine, OutputSink};
    use crate::permissions::PermissionSet;
    use crate::plugin::TaskPlugins;
    use crate::registry::ConfinementRegistry;

    fn run_with(
        source: &str,
        permissions: PermissionSet,
        config: LoaderConfig,
    ) -> (Result<Value, Fault>, Vec<OutputLine>) {
        let compiled = CompiledUnit::from_assembly(source).unwrap();
        let loader = Arc::new(
            LoadingUnit::builder(Arc::new(compiled))
                .config(config)
                .build()
                .unwrap(),
        );
        let registry = ConfinementRegistry::new();
        let token = registry.confine(&loader, permissions).unwrap();
        let capture = Arc::new(CapturedOutput::new(100));
        let task = Arc::new(TaskShared::new(
            loader.clone(),
            registry.capability(&token).unwrap(),
            OutputSink::Captured(capture.clone()),
            TaskPlugins::default(),
            0,
        ));
        let mut thread = task.thread_context(0);
        let result = Interpreter::new(&task, &mut thread).invoke("Main", "main", Vec::new());
        registry.release(&token, &loader).unwrap();
        (result, capture.finish().0)
    }

    fn run(source: &str) -> (Result<Value, Fault>, Vec<OutputLine>) {
        run_with(source, PermissionSet::new(), LoaderConfig::default())
    }

    #[test]
    fn test_arithmetic_and_calls() {
        let (result, _) = run(r#"
.class Main
.method static main
  push 6
  push 7
  invoke Main.mul
  push 2
  sub
  returnvalue
.end
.method static mul a b
  load 0
  load 1
  mul
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Int(40))));
    }

    #[test]
    fn test_loop_with_locals() {
        let (result, output) = run(r#"
.class Main
.method static main
.locals 1
  push 0
  store 0
L0:
  frame
  load 0
  push 3
  lt
  jumpifnot L1
  load 0
  println
  load 0
  push 1
  add
  store 0
  jump L0
L1:
  frame
  push "done"
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Str(s)) if &*s == "done"));
        let lines: Vec<_> = output.iter().map(|l| l.line.as_str()).collect();
        assert_eq!(lines, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_objects_and_virtual_calls() {
        let (result, _) = run(r#"
.class Main
.method static main
  new Counter
  dup
  push 41
  putfield count
  dup
  invokevirtual bump 0
  pop
  getfield count
  returnvalue
.end
.class Counter
.method bump
.locals 1
  load 0
  load 0
  getfield count
  push 1
  add
  putfield count
  push true
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Int(42))));
    }

    #[test]
    fn test_caught_exception() {
        let (result, _) = run(r#"
.class Main
.method static main
.catch start end handler ArithmeticException
start:
  push 1
  push 0
  div
  returnvalue
end:
handler:
  frame 1
  push "caught"
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Str(s)) if &*s == "caught"));
    }

    #[test]
    fn test_uncaught_exception_crosses_frames() {
        let (result, _) = run(r#"
.class Main
.method static main
  invoke Main.boom
  return
.end
.method static boom
  push "bad"
  exception IllegalStateException
  throw
.end
"#);
        match result {
            Err(Fault::Threw(exception)) => {
                assert_eq!(exception.kind, "IllegalStateException");
                assert_eq!(exception.message, "bad");
            }
            other => panic!("unexpected {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_unsafe_exceptions_cannot_be_caught() {
        let (result, _) = run(r#"
.class Main
.method static main
.catch start end handler
start:
  invoke Main.recurse
  return
end:
handler:
  frame 1
  push "caught"
  returnvalue
.end
.method static recurse
  invoke Main.recurse
  return
.end
"#);
        assert!(matches!(result, Err(Fault::Threw(e)) if e.kind == "StackOverflowError"));
    }

    #[test]
    fn test_denied_operations_abort() {
        let source = r#"
.class Main
.method static main
  push "HOME"
  getenv
  println
  return
.end
"#;
        let (result, output) = run(source);
        assert!(matches!(
            result,
            Err(Fault::Security(Permission::EnvVar(ref name))) if name == "HOME"
        ));
        assert!(output.is_empty());

        let (result, _) = run_with(
            source,
            PermissionSet::new().with_env_var("HOME"),
            LoaderConfig::default(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_exit_and_setio_always_denied() {
        let (result, _) = run(".class Main\n.method static main\npush 0\nexit\nreturn\n.end\n");
        assert!(matches!(result, Err(Fault::Security(Permission::Exit))));
        let (result, _) = run(".class Main\n.method static main\nsetio\nreturn\n.end\n");
        assert!(matches!(result, Err(Fault::Security(Permission::SetIo))));
    }

    #[test]
    fn test_reads_limited_to_own_class_files() {
        let (result, _) = run(r#"
.class Main
.method static main
  push "Main.class"
  readfile
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Str(s)) if s.contains("\"name\":\"Main\"")));

        let (result, _) = run(r#"
.class Main
.method static main
  push "/etc/hostname"
  readfile
  returnvalue
.end
"#);
        assert!(matches!(result, Err(Fault::Security(Permission::ReadFile(_)))));
    }

    #[test]
    fn test_blocked_class_raises_catchable_not_found() {
        let (result, _) = run(r#"
.class Main
.method static main
.catch start end handler ClassNotFoundException
start:
  push "warden.Secret"
  loadclass
  returnvalue
end:
handler:
  frame 1
  push "blocked"
  returnvalue
.end
"#);
        assert!(matches!(result, Ok(Value::Str(s)) if &*s == "blocked"));
    }

    #[test]
    fn test_frame_depth_checked() {
        let (result, _) = run(r#"
.class Main
.method static main
  push 1
L0:
  frame 0
  return
.end
"#);
        assert!(matches!(result, Err(Fault::Threw(e)) if e.kind == "VerifyError"));
    }

    #[test]
    fn test_binary_type_errors() {
        assert!(matches!(
            binary(BinaryOp::Add, Value::Int(1), Value::str("x")),
            Err(Raise::Throw(e)) if e.kind == "TypeError"
        ));
        assert!(matches!(
            binary(BinaryOp::Concat, Value::Int(1), Value::str("x")),
            Ok(Value::Str(s)) if &*s == "1x"
        ));
        assert!(matches!(
            binary(BinaryOp::Rem, Value::Int(1), Value::Int(0)),
            Err(Raise::Throw(e)) if e.kind == "ArithmeticException"
        ));
    }
}
