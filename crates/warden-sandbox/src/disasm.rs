//! Disassembly of class images back into assembler text

use crate::bytecode::{ClassFile, Constant, HookArg, Insn, MethodDef, NativeOp};
use std::fmt::Write;

/// Render a class image in the form accepted by [`crate::asm::assemble`]
pub fn disassemble(class: &ClassFile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, ".class {}", class.name);
    if let Some(source) = &class.source_file {
        let _ = writeln!(out, ".source {}", source);
    }
    for method in &class.methods {
        out.push('\n');
        write_method(&mut out, method);
    }
    out
}

/// Decode and disassemble raw class bytes
pub fn disassemble_bytes(bytes: &[u8]) -> Result<String, serde_json::Error> {
    Ok(disassemble(&ClassFile::decode(bytes)?))
}

fn write_method(out: &mut String, method: &MethodDef) {
    let _ = write!(out, ".method ");
    if method.is_static {
        let _ = write!(out, "static ");
    }
    let _ = write!(out, "{}", method.name);
    for param in &method.params {
        let _ = write!(out, " {}", param);
    }
    out.push('\n');
    let _ = writeln!(out, ".locals {}", method.max_locals);
    for handler in &method.handlers {
        let _ = write!(
            out,
            ".catch {} {} {}",
            handler.start, handler.end, handler.target
        );
        if let Some(kind) = &handler.kind {
            let _ = write!(out, " {}", kind);
        }
        out.push('\n');
    }
    for insn in &method.code {
        match insn {
            Insn::Label(label) => {
                let _ = writeln!(out, "{}:", label);
            }
            other => {
                let _ = writeln!(out, "  {}", render(other));
            }
        }
    }
    let _ = writeln!(out, ".end");
}

fn render(insn: &Insn) -> String {
    match insn {
        Insn::Label(label) => format!("{}:", label),
        Insn::LineNumber { line, start } => format!("line {} {}", line, start),
        Insn::Frame { stack } => format!("frame {}", stack),
        Insn::Push(constant) => format!("push {}", constant_text(constant)),
        Insn::Load(index) => format!("load {}", index),
        Insn::Store(index) => format!("store {}", index),
        Insn::Binary(op) => op.mnemonic().to_string(),
        Insn::Neg => "neg".to_string(),
        Insn::Not => "not".to_string(),
        Insn::Dup => "dup".to_string(),
        Insn::Pop => "pop".to_string(),
        Insn::Swap => "swap".to_string(),
        Insn::Jump(label) => format!("jump {}", label),
        Insn::JumpIf(label) => format!("jumpif {}", label),
        Insn::JumpIfNot(label) => format!("jumpifnot {}", label),
        Insn::InvokeStatic { class, method } => format!("invoke {}.{}", class, method),
        Insn::InvokeVirtual { method, args } => format!("invokevirtual {} {}", method, args),
        Insn::New(class) => format!("new {}", class),
        Insn::GetField(field) => format!("getfield {}", field),
        Insn::PutField(field) => format!("putfield {}", field),
        Insn::NewException(kind) => format!("exception {}", kind),
        Insn::Throw => "throw".to_string(),
        Insn::Return => "return".to_string(),
        Insn::ReturnValue => "returnvalue".to_string(),
        Insn::Native(NativeOp::Spawn { class, method }) => format!("spawn {}.{}", class, method),
        Insn::Native(op) => op.mnemonic().to_string(),
        Insn::Hook { plugin, name, args } => {
            let mut text = format!("hook {} {}", plugin, name);
            for arg in args {
                text.push(' ');
                match arg {
                    HookArg::Const(constant) => text.push_str(&constant_text(constant)),
                    HookArg::Local(index) => {
                        let _ = write!(text, "@{}", index);
                    }
                }
            }
            text
        }
    }
}

fn constant_text(constant: &Constant) -> String {
    match constant {
        Constant::Str(s) => {
            let mut quoted = String::with_capacity(s.len() + 2);
            quoted.push('"');
            for c in s.chars() {
                match c {
                    '\n' => quoted.push_str("\\n"),
                    '\r' => quoted.push_str("\\r"),
                    '\t' => quoted.push_str("\\t"),
                    '"' => quoted.push_str("\\\""),
                    '\\' => quoted.push_str("\\\\"),
                    other => quoted.push(other),
                }
            }
            quoted.push('"');
            quoted
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    const PROGRAM: &str = r#"
.class Main
.source Main.java
.method static main
.catch L0 L1 L2 ArithmeticException
L0:
  line 3
  push "a\tb \"q\""
  push 10
  push 0
  div
  pop
  println
L1:
  return
L2:
  frame 1
  pop
  hook line-trace line "Main.java" 0 2 7
  return
.end

.method describe who
.locals 3
  load 1
  store 2
  returnvalue
.end
"#;

    #[test]
    fn test_disassembly_reassembles_to_same_class() {
        let classes = assemble(PROGRAM).unwrap();
        let text = disassemble(&classes[0]);
        let again = assemble(&text).unwrap();
        assert_eq!(again, classes);
    }

    #[test]
    fn test_disassembly_text() {
        let classes = assemble(PROGRAM).unwrap();
        let text = disassemble(&classes[0]);
        assert!(text.starts_with(".class Main\n.source Main.java\n"));
        assert!(text.contains(".method static main\n"));
        assert!(text.contains(".catch L0 L1 L2 ArithmeticException\n"));
        assert!(text.contains("  line 3 L0\n"));
        assert!(text.contains("  push \"a\\tb \\\"q\\\"\"\n"));
        assert!(text.contains("  hook line-trace line \"Main.java\" 0 2 7\n"));
        assert!(text.contains(".method describe who\n.locals 3\n"));
    }

    #[test]
    fn test_disassemble_bytes_rejects_garbage() {
        assert!(disassemble_bytes(b"not a class").is_err());
        let bytes = assemble(PROGRAM).unwrap()[0].encode().unwrap();
        assert!(disassemble_bytes(&bytes).unwrap().contains(".class Main"));
    }
}
