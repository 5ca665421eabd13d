//! Text assembler for class images
//!
//! ```text
//! .class Main
//! .source Main.java
//! .method static main
//! .locals 1
//! L0:
//!   line 1
//!   push "Here"
//!   println
//! L1:
//!   line 2
//!   frame 0
//!   jump L1
//! .end
//! ```
//!
//! `;` starts a comment. Label names are local to a method. `line N` binds
//! to the most recently defined label unless one is given explicitly.
//! Hook operands are constants or `@N` for local slot `N`.

use crate::bytecode::{
    BinaryOp, ClassFile, CompiledUnit, Constant, Handler, HookArg, Insn, LabelId, MethodDef,
    NativeOp,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct AssembleError {
    pub line: usize,
    pub message: String,
}

impl AssembleError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

type Result<T> = std::result::Result<T, AssembleError>;

/// Assemble every class in `text`
pub fn assemble(text: &str) -> Result<Vec<ClassFile>> {
    let mut assembler = Assembler::default();
    for (number, raw) in text.lines().enumerate() {
        let line = number + 1;
        let tokens = tokenize(raw).map_err(|message| AssembleError::new(line, message))?;
        if tokens.is_empty() {
            continue;
        }
        assembler.line = line;
        assembler.statement(tokens)?;
    }
    assembler.finish()
}

impl CompiledUnit {
    /// Assemble `text` into a unit whose digest is taken over the text
    pub fn from_assembly(text: &str) -> Result<Self> {
        let classes = assemble(text)?;
        CompiledUnit::from_classes(classes, text)
            .map_err(|e| AssembleError::new(0, format!("encoding failed: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Word(w) | Token::Str(w) => w,
        }
    }
}

fn tokenize(line: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == ';' {
            break;
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => s.push('\n'),
                        Some('r') => s.push('\r'),
                        Some('t') => s.push('\t'),
                        Some('"') => s.push('"'),
                        Some('\\') => s.push('\\'),
                        Some(other) => return Err(format!("unknown escape \\{}", other)),
                        None => return Err("unterminated string".to_string()),
                    },
                    Some(other) => s.push(other),
                    None => return Err("unterminated string".to_string()),
                }
            }
            tokens.push(Token::Str(s));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ';' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

struct PendingMethod {
    def: MethodDef,
    labels: HashMap<String, LabelId>,
    last_label: Option<LabelId>,
}

impl PendingMethod {
    fn label(&mut self, name: &str) -> LabelId {
        let next = LabelId(self.labels.len() as u32);
        *self.labels.entry(name.to_string()).or_insert(next)
    }
}

#[derive(Default)]
struct Assembler {
    line: usize,
    classes: Vec<ClassFile>,
    class: Option<ClassFile>,
    method: Option<PendingMethod>,
}

impl Assembler {
    fn err(&self, message: impl Into<String>) -> AssembleError {
        AssembleError::new(self.line, message)
    }

    fn statement(&mut self, tokens: Vec<Token>) -> Result<()> {
        let head = match &tokens[0] {
            Token::Word(w) => w.clone(),
            Token::Str(_) => return Err(self.err("statement cannot start with a string")),
        };
        let rest = &tokens[1..];

        if let Some(directive) = head.strip_prefix('.') {
            return self.directive(directive, rest);
        }
        if let Some(name) = head.strip_suffix(':') {
            if !rest.is_empty() {
                return Err(self.err("a label must be on its own line"));
            }
            let method = self.method_mut()?;
            let label = method.label(name);
            method.last_label = Some(label);
            method.def.code.push(Insn::Label(label));
            return Ok(());
        }
        let insn = self.instruction(&head, rest)?;
        self.method_mut()?.def.code.push(insn);
        Ok(())
    }

    fn method_mut(&mut self) -> Result<&mut PendingMethod> {
        let line = self.line;
        self.method
            .as_mut()
            .ok_or_else(|| AssembleError::new(line, "instruction outside of .method"))
    }

    fn directive(&mut self, directive: &str, args: &[Token]) -> Result<()> {
        match directive {
            "class" => {
                if self.method.is_some() {
                    return Err(self.err(".class inside a method"));
                }
                let name = self.word(args, 0)?;
                if let Some(done) = self.class.take() {
                    self.classes.push(done);
                }
                self.class = Some(ClassFile {
                    name,
                    source_file: None,
                    methods: Vec::new(),
                });
            }
            "source" => {
                let file = self.word(args, 0)?;
                let line = self.line;
                let class = self
                    .class
                    .as_mut()
                    .ok_or_else(|| AssembleError::new(line, ".source outside of .class"))?;
                class.source_file = Some(file);
            }
            "method" => {
                if self.class.is_none() {
                    return Err(self.err(".method outside of .class"));
                }
                if self.method.is_some() {
                    return Err(self.err("missing .end before .method"));
                }
                let mut words = args.iter().map(Token::text);
                let mut name = words.next().ok_or_else(|| self.err("missing method name"))?;
                let is_static = name == "static";
                if is_static {
                    name = words.next().ok_or_else(|| self.err("missing method name"))?;
                }
                let params: Vec<String> = words.map(str::to_string).collect();
                let max_locals = (params.len() + usize::from(!is_static)) as u16;
                self.method = Some(PendingMethod {
                    def: MethodDef {
                        name: name.to_string(),
                        is_static,
                        params,
                        max_locals,
                        code: Vec::new(),
                        handlers: Vec::new(),
                    },
                    labels: HashMap::new(),
                    last_label: None,
                });
            }
            "locals" => {
                let count = self.number(args, 0)?;
                self.method_mut()?.def.max_locals = count;
            }
            "catch" => {
                let start = self.word(args, 0)?;
                let end = self.word(args, 1)?;
                let target = self.word(args, 2)?;
                let kind = args.get(3).map(|t| t.text().to_string());
                let method = self.method_mut()?;
                let handler = Handler {
                    start: method.label(&start),
                    end: method.label(&end),
                    target: method.label(&target),
                    kind,
                };
                method.def.handlers.push(handler);
            }
            "end" => {
                let method = self
                    .method
                    .take()
                    .ok_or_else(|| self.err(".end without .method"))?;
                if let Some(class) = self.class.as_mut() {
                    class.methods.push(method.def);
                }
            }
            other => return Err(self.err(format!("unknown directive .{}", other))),
        }
        Ok(())
    }

    fn instruction(&mut self, mnemonic: &str, args: &[Token]) -> Result<Insn> {
        let insn = match mnemonic {
            "push" => Insn::Push(self.constant(args.first())?),
            "load" => Insn::Load(self.number(args, 0)?),
            "store" => Insn::Store(self.number(args, 0)?),
            "neg" => Insn::Neg,
            "not" => Insn::Not,
            "dup" => Insn::Dup,
            "pop" => Insn::Pop,
            "swap" => Insn::Swap,
            "jump" | "jumpif" | "jumpifnot" => {
                let name = self.word(args, 0)?;
                let label = self.method_mut()?.label(&name);
                match mnemonic {
                    "jump" => Insn::Jump(label),
                    "jumpif" => Insn::JumpIf(label),
                    _ => Insn::JumpIfNot(label),
                }
            }
            "invoke" => {
                let (class, method) = self.qualified(args)?;
                Insn::InvokeStatic { class, method }
            }
            "invokevirtual" => Insn::InvokeVirtual {
                method: self.word(args, 0)?,
                args: self.number(args, 1)?,
            },
            "new" => Insn::New(self.word(args, 0)?),
            "getfield" => Insn::GetField(self.word(args, 0)?),
            "putfield" => Insn::PutField(self.word(args, 0)?),
            "exception" => Insn::NewException(self.word(args, 0)?),
            "throw" => Insn::Throw,
            "return" => Insn::Return,
            "returnvalue" => Insn::ReturnValue,
            "frame" => Insn::Frame {
                stack: if args.is_empty() {
                    0
                } else {
                    self.number(args, 0)?
                },
            },
            "line" => {
                let line = self.number(args, 0)?;
                let at = self.line;
                let method = self.method_mut()?;
                let start = match args.get(1) {
                    Some(token) => method.label(token.text()),
                    None => method.last_label.ok_or_else(|| {
                        AssembleError::new(at, "line number needs a preceding label")
                    })?,
                };
                Insn::LineNumber { line, start }
            }
            "spawn" => {
                let (class, method) = self.qualified(args)?;
                Insn::Native(NativeOp::Spawn { class, method })
            }
            "hook" => {
                let plugin = self.word(args, 0)?;
                let name = self.word(args, 1)?;
                let mut hook_args = Vec::new();
                for token in &args[2..] {
                    let arg = match token {
                        Token::Word(w) if w.starts_with('@') => HookArg::Local(
                            w[1..]
                                .parse()
                                .map_err(|_| self.err(format!("bad local {}", w)))?,
                        ),
                        other => HookArg::Const(self.constant(Some(other))?),
                    };
                    hook_args.push(arg);
                }
                Insn::Hook {
                    plugin,
                    name,
                    args: hook_args,
                }
            }
            other => {
                if let Some(op) = binary_op(other) {
                    Insn::Binary(op)
                } else if let Some(op) = native_op(other) {
                    Insn::Native(op)
                } else {
                    return Err(self.err(format!("unknown instruction {}", other)));
                }
            }
        };
        Ok(insn)
    }

    fn word(&self, args: &[Token], index: usize) -> Result<String> {
        args.get(index)
            .map(|t| t.text().to_string())
            .ok_or_else(|| self.err(format!("missing operand {}", index + 1)))
    }

    fn number<T: std::str::FromStr>(&self, args: &[Token], index: usize) -> Result<T> {
        let word = self.word(args, index)?;
        word.parse()
            .map_err(|_| self.err(format!("expected a number, found {}", word)))
    }

    fn qualified(&self, args: &[Token]) -> Result<(String, String)> {
        let target = self.word(args, 0)?;
        match target.rsplit_once('.') {
            Some((class, method)) if !class.is_empty() && !method.is_empty() => {
                Ok((class.to_string(), method.to_string()))
            }
            _ => Err(self.err(format!("expected Class.method, found {}", target))),
        }
    }

    fn constant(&self, token: Option<&Token>) -> Result<Constant> {
        match token {
            Some(Token::Str(s)) => Ok(Constant::Str(s.clone())),
            Some(Token::Word(w)) => match w.as_str() {
                "null" => Ok(Constant::Null),
                "true" => Ok(Constant::Bool(true)),
                "false" => Ok(Constant::Bool(false)),
                number => number
                    .parse()
                    .map(Constant::Int)
                    .map_err(|_| self.err(format!("bad constant {}", number))),
            },
            None => Err(self.err("missing constant")),
        }
    }

    fn finish(mut self) -> Result<Vec<ClassFile>> {
        if self.method.is_some() {
            return Err(self.err("missing .end at end of input"));
        }
        if let Some(class) = self.class.take() {
            self.classes.push(class);
        }
        Ok(self.classes)
    }
}

fn binary_op(mnemonic: &str) -> Option<BinaryOp> {
    Some(match mnemonic {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "div" => BinaryOp::Div,
        "rem" => BinaryOp::Rem,
        "lt" => BinaryOp::Lt,
        "le" => BinaryOp::Le,
        "gt" => BinaryOp::Gt,
        "ge" => BinaryOp::Ge,
        "eq" => BinaryOp::Eq,
        "ne" => BinaryOp::Ne,
        "concat" => BinaryOp::Concat,
        _ => return None,
    })
}

fn native_op(mnemonic: &str) -> Option<NativeOp> {
    Some(match mnemonic {
        "print" => NativeOp::Print,
        "println" => NativeOp::Println,
        "eprint" => NativeOp::Eprint,
        "eprintln" => NativeOp::Eprintln,
        "readfile" => NativeOp::ReadFile,
        "writefile" => NativeOp::WriteFile,
        "getenv" => NativeOp::GetEnv,
        "property" => NativeOp::GetProperty,
        "exit" => NativeOp::Exit,
        "setio" => NativeOp::SetIo,
        "join" => NativeOp::Join,
        "sleep" => NativeOp::Sleep,
        "time" => NativeOp::Time,
        "loadclass" => NativeOp::LoadClass,
        _ => return None,
    })
}
