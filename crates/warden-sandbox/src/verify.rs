//! Structural bytecode verification
//!
//! Runs on every class before it can be loaded, and again after plugins
//! rewrite it. Stack depth at frames is checked by the interpreter when the
//! frame executes.

use crate::bytecode::{ClassFile, HookArg, Insn, LabelId, MethodDef};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{class}: duplicate method {method}")]
    DuplicateMethod { class: String, method: String },

    #[error("{location}: {max_locals} locals cannot hold {required} parameter slots")]
    TooFewLocals {
        location: String,
        max_locals: u16,
        required: usize,
    },

    #[error("{location}: label {label} defined more than once")]
    DuplicateLabel { location: String, label: LabelId },

    #[error("{location}: label {label} is referenced but never defined")]
    UndefinedLabel { location: String, label: LabelId },

    #[error("{location}: frame at instruction {index} does not follow a label")]
    FrameWithoutLabel { location: String, index: usize },

    #[error("{location}: branch target {label} has no frame")]
    MissingFrame { location: String, label: LabelId },

    #[error("{location}: local {index} out of range (max_locals {max_locals})")]
    LocalOutOfRange {
        location: String,
        index: u16,
        max_locals: u16,
    },

    #[error("{location}: hook instructions are not allowed in untrusted code")]
    HookInUntrustedCode { location: String },
}

/// Which instructions a class may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Code as submitted. Hooks are forbidden.
    Untrusted,
    /// Code after plugin rewriting.
    Instrumented,
}

pub fn verify_class(class: &ClassFile, mode: VerifyMode) -> Result<(), VerifyError> {
    let mut names = HashSet::new();
    for method in &class.methods {
        if !names.insert(method.name.as_str()) {
            return Err(VerifyError::DuplicateMethod {
                class: class.name.clone(),
                method: method.name.clone(),
            });
        }
        verify_method(&class.name, method, mode)?;
    }
    Ok(())
}

fn verify_method(class: &str, method: &MethodDef, mode: VerifyMode) -> Result<(), VerifyError> {
    let location = format!("{}.{}", class, method.name);

    if (method.max_locals as usize) < method.min_locals() {
        return Err(VerifyError::TooFewLocals {
            location,
            max_locals: method.max_locals,
            required: method.min_locals(),
        });
    }

    let mut defined = HashSet::new();
    for insn in &method.code {
        if let Insn::Label(label) = insn {
            if !defined.insert(*label) {
                return Err(VerifyError::DuplicateLabel {
                    location,
                    label: *label,
                });
            }
        }
    }

    let mut targets = HashSet::new();
    let mut referenced = Vec::new();
    for insn in &method.code {
        if let Some(target) = insn.jump_target() {
            targets.insert(target);
            referenced.push(target);
        }
        if let Insn::LineNumber { start, .. } = insn {
            referenced.push(*start);
        }
    }
    for handler in &method.handlers {
        targets.insert(handler.target);
        referenced.extend([handler.start, handler.end, handler.target]);
    }
    if let Some(label) = referenced.into_iter().find(|l| !defined.contains(l)) {
        return Err(VerifyError::UndefinedLabel { location, label });
    }

    check_frames(&location, method, &targets)?;

    for insn in &method.code {
        match insn {
            Insn::Load(index) | Insn::Store(index) => {
                check_local(&location, *index, method.max_locals)?;
            }
            Insn::Hook { args, .. } => {
                if mode == VerifyMode::Untrusted {
                    return Err(VerifyError::HookInUntrustedCode { location });
                }
                for arg in args {
                    if let HookArg::Local(index) = arg {
                        check_local(&location, *index, method.max_locals)?;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

/// Frames may only follow labels; every branch target needs one before the
/// next real instruction.
fn check_frames(
    location: &str,
    method: &MethodDef,
    targets: &HashSet<LabelId>,
) -> Result<(), VerifyError> {
    let mut pending: HashMap<LabelId, bool> = HashMap::new();

    for (index, insn) in method.code.iter().enumerate() {
        match insn {
            Insn::Label(label) => {
                pending.insert(*label, false);
            }
            Insn::LineNumber { .. } => {}
            Insn::Frame { .. } => {
                if pending.is_empty() {
                    return Err(VerifyError::FrameWithoutLabel {
                        location: location.to_string(),
                        index,
                    });
                }
                pending.values_mut().for_each(|framed| *framed = true);
            }
            _ => {
                missing_frame(location, &pending, targets)?;
                pending.clear();
            }
        }
    }
    missing_frame(location, &pending, targets)
}

fn missing_frame(
    location: &str,
    pending: &HashMap<LabelId, bool>,
    targets: &HashSet<LabelId>,
) -> Result<(), VerifyError> {
    let mut unframed: Vec<_> = pending
        .iter()
        .filter(|(label, framed)| !**framed && targets.contains(label))
        .map(|(label, _)| *label)
        .collect();
    unframed.sort();
    match unframed.first() {
        Some(label) => Err(VerifyError::MissingFrame {
            location: location.to_string(),
            label: *label,
        }),
        None => Ok(()),
    }
}

fn check_local(location: &str, index: u16, max_locals: u16) -> Result<(), VerifyError> {
    if index >= max_locals {
        return Err(VerifyError::LocalOutOfRange {
            location: location.to_string(),
            index,
            max_locals,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, Handler};

    fn method(code: Vec<Insn>) -> MethodDef {
        MethodDef {
            name: "main".to_string(),
            is_static: true,
            params: vec![],
            max_locals: 1,
            code,
            handlers: vec![],
        }
    }

    fn class(methods: Vec<MethodDef>) -> ClassFile {
        ClassFile {
            name: "Main".to_string(),
            source_file: Some("Main.java".to_string()),
            methods,
        }
    }

    #[test]
    fn test_accepts_framed_loop() {
        let code = vec![
            Insn::Label(LabelId(0)),
            Insn::LineNumber {
                line: 1,
                start: LabelId(0),
            },
            Insn::Frame { stack: 0 },
            Insn::Jump(LabelId(0)),
        ];
        assert!(verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).is_ok());
    }

    #[test]
    fn test_branch_target_needs_frame() {
        let code = vec![Insn::Label(LabelId(0)), Insn::Jump(LabelId(0))];
        let err = verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::MissingFrame { label: LabelId(0), .. }));
    }

    #[test]
    fn test_handler_target_needs_frame() {
        let mut m = method(vec![
            Insn::Label(LabelId(0)),
            Insn::Return,
            Insn::Label(LabelId(1)),
            Insn::Label(LabelId(2)),
            Insn::Pop,
            Insn::Return,
        ]);
        m.handlers.push(Handler {
            start: LabelId(0),
            end: LabelId(1),
            target: LabelId(2),
            kind: None,
        });
        let err = verify_class(&class(vec![m]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::MissingFrame { label: LabelId(2), .. }));
    }

    #[test]
    fn test_frame_must_follow_label() {
        let code = vec![Insn::Push(Constant::Int(1)), Insn::Frame { stack: 1 }];
        let err = verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::FrameWithoutLabel { index: 1, .. }));
    }

    #[test]
    fn test_rejects_undefined_and_duplicate_labels() {
        let code = vec![Insn::Jump(LabelId(7))];
        let err = verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::UndefinedLabel { .. }));

        let code = vec![Insn::Label(LabelId(1)), Insn::Label(LabelId(1))];
        let err = verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::DuplicateLabel { .. }));
    }

    #[test]
    fn test_hooks_only_in_instrumented_code() {
        let code = vec![Insn::Hook {
            plugin: "line-trace".to_string(),
            name: "line".to_string(),
            args: vec![HookArg::Local(0)],
        }];
        let c = class(vec![method(code)]);
        assert!(matches!(
            verify_class(&c, VerifyMode::Untrusted),
            Err(VerifyError::HookInUntrustedCode { .. })
        ));
        assert!(verify_class(&c, VerifyMode::Instrumented).is_ok());
    }

    #[test]
    fn test_locals_checked() {
        let code = vec![Insn::Load(1)];
        let err = verify_class(&class(vec![method(code)]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::LocalOutOfRange { index: 1, .. }));

        let mut m = method(vec![]);
        m.params = vec!["a".to_string(), "b".to_string()];
        let err = verify_class(&class(vec![m]), VerifyMode::Untrusted).unwrap_err();
        assert!(matches!(err, VerifyError::TooFewLocals { required: 2, .. }));
    }

    #[test]
    fn test_duplicate_method_names() {
        let err = verify_class(
            &class(vec![method(vec![]), method(vec![])]),
            VerifyMode::Untrusted,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::DuplicateMethod { .. }));
    }
}
