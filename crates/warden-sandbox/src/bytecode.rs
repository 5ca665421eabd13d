//! Class images: the bytecode format executed inside the sandbox
//!
//! A compiled program is a set of class images keyed by class name. Each
//! image is stored as raw bytes (`serde_json` encoding of [`ClassFile`]) so
//! that instrumentation plugins and provenance tracking work on exactly the
//! bytes that are handed to the interpreter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A literal operand pushed by [`Insn::Push`] or passed to a hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Control-flow label, unique within one method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Concat,
}

impl BinaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::Concat => "concat",
        }
    }
}

/// Host calls. Every security-sensitive operation a program can attempt is
/// one of these, so the interpreter is the single place permissions are
/// checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeOp {
    Print,
    Println,
    Eprint,
    Eprintln,
    /// path -> contents
    ReadFile,
    /// path, contents ->
    WriteFile,
    /// name -> value or null
    GetEnv,
    /// name -> value or null
    GetProperty,
    /// code ->
    Exit,
    /// Attempt to replace the process output streams
    SetIo,
    /// Start a task thread running a static no-argument method; pushes the thread index
    Spawn { class: String, method: String },
    /// thread index ->
    Join,
    /// millis ->
    Sleep,
    /// -> epoch millis
    Time,
    /// class name -> class name
    LoadClass,
}

impl NativeOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            NativeOp::Print => "print",
            NativeOp::Println => "println",
            NativeOp::Eprint => "eprint",
            NativeOp::Eprintln => "eprintln",
            NativeOp::ReadFile => "readfile",
            NativeOp::WriteFile => "writefile",
            NativeOp::GetEnv => "getenv",
            NativeOp::GetProperty => "property",
            NativeOp::Exit => "exit",
            NativeOp::SetIo => "setio",
            NativeOp::Spawn { .. } => "spawn",
            NativeOp::Join => "join",
            NativeOp::Sleep => "sleep",
            NativeOp::Time => "time",
            NativeOp::LoadClass => "loadclass",
        }
    }
}

/// Operand of a plugin hook call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookArg {
    Const(Constant),
    Local(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Insn {
    // Pseudo instructions: they mark positions and never execute anything
    // observable except the frame depth check.
    Label(LabelId),
    LineNumber { line: u32, start: LabelId },
    /// Verification frame. Must directly follow the label(s) it describes.
    Frame { stack: u16 },

    Push(Constant),
    Load(u16),
    Store(u16),
    Binary(BinaryOp),
    Neg,
    Not,
    Dup,
    Pop,
    Swap,
    Jump(LabelId),
    JumpIf(LabelId),
    JumpIfNot(LabelId),
    InvokeStatic { class: String, method: String },
    InvokeVirtual { method: String, args: u16 },
    New(String),
    GetField(String),
    PutField(String),
    /// message -> exception of the given kind
    NewException(String),
    Throw,
    Return,
    ReturnValue,
    Native(NativeOp),
    /// Call into a trusted plugin hook. Only instrumentation may emit these.
    Hook {
        plugin: String,
        name: String,
        args: Vec<HookArg>,
    },
}

impl Insn {
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            Insn::Label(_) | Insn::LineNumber { .. } | Insn::Frame { .. }
        )
    }

    /// Labels this instruction may transfer control to
    pub fn jump_target(&self) -> Option<LabelId> {
        match self {
            Insn::Jump(l) | Insn::JumpIf(l) | Insn::JumpIfNot(l) => Some(*l),
            _ => None,
        }
    }
}

/// Exception handler covering `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handler {
    pub start: LabelId,
    pub end: LabelId,
    pub target: LabelId,
    /// `None` catches every catchable exception
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub is_static: bool,
    /// Declared parameter names, in local slot order
    pub params: Vec<String>,
    pub max_locals: u16,
    pub code: Vec<Insn>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
}

impl MethodDef {
    /// Local slot of the first declared parameter; slot 0 holds the receiver
    /// of instance methods.
    pub fn first_param_local(&self) -> u16 {
        if self.is_static {
            0
        } else {
            1
        }
    }

    /// Slots needed for the receiver and the parameters
    pub fn min_locals(&self) -> usize {
        self.params.len() + self.first_param_local() as usize
    }

    pub fn has_reachable_code(&self) -> bool {
        self.code.iter().any(|insn| !insn.is_pseudo())
    }

    /// Human-readable descriptor, e.g. `static Main.add(a, b)`
    pub fn descriptor(&self, class: &str) -> String {
        format!(
            "{}{}.{}({})",
            if self.is_static { "static " } else { "" },
            class,
            self.name,
            self.params.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFile {
    pub name: String,
    pub source_file: Option<String>,
    pub methods: Vec<MethodDef>,
}

impl ClassFile {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn method(&self, name: &str) -> Option<(usize, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, method)| method.name == name)
    }
}

/// The output of the (external) compiler: bytecode for every class of one
/// submission plus a digest of the source it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledUnit {
    id: Uuid,
    classes: BTreeMap<String, Vec<u8>>,
    source_digest: String,
}

impl CompiledUnit {
    pub fn new(classes: BTreeMap<String, Vec<u8>>, source: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            classes,
            source_digest: source_digest(source),
        }
    }

    /// Encode already-built class images
    pub fn from_classes(
        classes: impl IntoIterator<Item = ClassFile>,
        source: &str,
    ) -> Result<Self, serde_json::Error> {
        let mut encoded = BTreeMap::new();
        for class in classes {
            encoded.insert(class.name.clone(), class.encode()?);
        }
        Ok(Self::new(encoded, source))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn classes(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.classes
    }

    pub fn bytecode(&self, name: &str) -> Option<&[u8]> {
        self.classes.get(name).map(Vec::as_slice)
    }

    pub fn source_digest(&self) -> &str {
        &self.source_digest
    }
}

/// Hex SHA-256 of a submission's source text
pub fn source_digest(source: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, source.as_bytes());
    digest
        .as_ref()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> ClassFile {
        ClassFile {
            name: "Main".to_string(),
            source_file: Some("Main.java".to_string()),
            methods: vec![MethodDef {
                name: "main".to_string(),
                is_static: true,
                params: vec![],
                max_locals: 0,
                code: vec![
                    Insn::Label(LabelId(0)),
                    Insn::LineNumber {
                        line: 1,
                        start: LabelId(0),
                    },
                    Insn::Push(Constant::Str("hi".to_string())),
                    Insn::Native(NativeOp::Println),
                    Insn::Return,
                ],
                handlers: vec![],
            }],
        }
    }

    #[test]
    fn test_class_file_decodes_what_it_encodes() {
        let class = sample_class();
        let bytes = class.encode().unwrap();
        assert_eq!(ClassFile::decode(&bytes).unwrap(), class);
    }

    #[test]
    fn test_source_digest_is_stable_hex() {
        let digest = source_digest("class Main {}");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, source_digest("class Main {}"));
        assert_ne!(digest, source_digest("class Other {}"));
    }

    #[test]
    fn test_descriptor_marks_static_methods() {
        let mut method = sample_class().methods.remove(0);
        method.params = vec!["a".to_string(), "b".to_string()];
        assert_eq!(method.descriptor("Main"), "static Main.main(a, b)");
        method.is_static = false;
        assert_eq!(method.descriptor("Main"), "Main.main(a, b)");
        assert_eq!(method.first_param_local(), 1);
        assert_eq!(method.min_locals(), 3);
    }

    #[test]
    fn test_compiled_units_get_distinct_ids() {
        let a = CompiledUnit::from_classes(vec![sample_class()], "src").unwrap();
        let b = CompiledUnit::from_classes(vec![sample_class()], "src").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.source_digest(), b.source_digest());
        assert!(a.bytecode("Main").is_some());
    }
}
