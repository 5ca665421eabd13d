//! Isolated code-loading units
//!
//! A loading unit owns the (instrumented) classes of one compiled program.
//! Its identity is process-unique, so two units built from identical
//! bytecode never share a confinement entry.

use crate::bytecode::{ClassFile, CompiledUnit, Insn, LabelId, MethodDef};
use crate::plugin::{InstrumentedPlugins, PluginError, PluginSet, RewritingContext};
use crate::registry::Capability;
use crate::permissions::Permission;
use crate::verify::{verify_class, VerifyError, VerifyMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Class-name prefixes no configuration can make loadable
pub const PERMANENTLY_BLOCKED_CLASSES: &[&str] = &["warden."];

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderId(u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("class {0} not found")]
    NotFound(String),

    #[error("class {0} is not loadable from confined code")]
    Blocked(String),

    #[error("failed to decode class {name}: {message}")]
    Decode { name: String, message: String },

    #[error("class {expected} contains class {found}")]
    NameMismatch { expected: String, found: String },

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("invalid loader configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Which delegated classes confined code may load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Prefixes that may be loaded from the parent; empty means no allow-list
    pub allowed_classes: Vec<String>,
    /// Prefixes that may not be loaded from the parent
    pub blocked_classes: Vec<String>,
    /// Exception kinds untrusted handlers can never catch
    pub unsafe_exceptions: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            allowed_classes: Vec::new(),
            blocked_classes: Vec::new(),
            unsafe_exceptions: vec![
                "StackOverflowError".to_string(),
                "OutOfMemoryError".to_string(),
            ],
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), LoadError> {
        if !self.allowed_classes.is_empty() && !self.blocked_classes.is_empty() {
            return Err(LoadError::Config(
                "can't set both a class allow-list and block-list".to_string(),
            ));
        }
        if let Some(allowed) = self
            .allowed_classes
            .iter()
            .find(|allowed| is_permanently_blocked(allowed))
        {
            return Err(LoadError::Config(format!(
                "attempt to allow access to unsafe classes: {}",
                allowed
            )));
        }
        Ok(())
    }

    /// Whether confined code may load `name` from outside its own unit
    pub fn may_delegate(&self, name: &str) -> bool {
        if is_permanently_blocked(name) {
            return false;
        }
        if !self.allowed_classes.is_empty() {
            return self.allowed_classes.iter().any(|p| name.starts_with(p.as_str()));
        }
        !self.blocked_classes.iter().any(|p| name.starts_with(p.as_str()))
    }

    pub fn is_unsafe_exception(&self, kind: &str) -> bool {
        self.unsafe_exceptions.iter().any(|k| k == kind)
    }
}

fn is_permanently_blocked(name: &str) -> bool {
    PERMANENTLY_BLOCKED_CLASSES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Exception handler with labels resolved to instruction indices
#[derive(Debug, Clone)]
pub struct ResolvedHandler {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub kind: Option<String>,
}

#[derive(Debug)]
pub struct LoadedMethod {
    pub def: MethodDef,
    pub handlers: Vec<ResolvedHandler>,
    labels: HashMap<LabelId, usize>,
}

impl LoadedMethod {
    fn resolve(def: MethodDef) -> Self {
        let labels: HashMap<LabelId, usize> = def
            .code
            .iter()
            .enumerate()
            .filter_map(|(pc, insn)| match insn {
                Insn::Label(label) => Some((*label, pc)),
                _ => None,
            })
            .collect();
        // Labels are checked by the verifier before resolution
        let handlers = def
            .handlers
            .iter()
            .map(|h| ResolvedHandler {
                start: labels.get(&h.start).copied().unwrap_or(0),
                end: labels.get(&h.end).copied().unwrap_or(0),
                target: labels.get(&h.target).copied().unwrap_or(0),
                kind: h.kind.clone(),
            })
            .collect();
        Self {
            def,
            handlers,
            labels,
        }
    }

    pub fn label_pc(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }
}

/// A class ready for execution
#[derive(Debug)]
pub struct LoadedClass {
    pub name: String,
    pub source_file: Option<String>,
    pub methods: Vec<LoadedMethod>,
}

impl LoadedClass {
    fn new(class: ClassFile) -> Self {
        Self {
            name: class.name,
            source_file: class.source_file,
            methods: class.methods.into_iter().map(LoadedMethod::resolve).collect(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&LoadedMethod> {
        self.methods.iter().find(|m| m.def.name == name)
    }
}

pub struct LoadingUnitBuilder {
    compiled: Arc<CompiledUnit>,
    parent: Option<Arc<LoadingUnit>>,
    config: LoaderConfig,
    plugins: PluginSet,
    trusted: bool,
}

impl LoadingUnitBuilder {
    /// Delegate unknown classes to a trusted library unit
    pub fn parent(mut self, parent: Arc<LoadingUnit>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = plugins;
        self
    }

    /// Library code: plugins see [`RewritingContext::Trusted`]
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    pub fn build(self) -> Result<LoadingUnit, LoadError> {
        self.config.validate()?;
        let instrumented_plugins = self.plugins.instrument(&self.config)?;
        let context = if self.trusted {
            RewritingContext::Trusted
        } else {
            RewritingContext::Untrusted
        };

        let mut classes = HashMap::new();
        let mut provenance = BTreeMap::new();
        for (name, bytes) in self.compiled.classes() {
            let class = ClassFile::decode(bytes).map_err(|e| LoadError::Decode {
                name: name.clone(),
                message: e.to_string(),
            })?;
            if &class.name != name {
                return Err(LoadError::NameMismatch {
                    expected: name.clone(),
                    found: class.name,
                });
            }
            verify_class(&class, VerifyMode::Untrusted)?;

            let class = instrumented_plugins.transform(class, context)?;
            verify_class(&class, VerifyMode::Instrumented)?;

            let rewritten = class.encode().map_err(|e| LoadError::Decode {
                name: name.clone(),
                message: e.to_string(),
            })?;
            provenance.insert(name.clone(), rewritten);
            classes.insert(name.clone(), Arc::new(LoadedClass::new(class)));
        }

        let id = LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed));
        debug!(loader = %id, classes = classes.len(), plugins = ?instrumented_plugins.ids(), "loading unit built");
        Ok(LoadingUnit {
            id,
            compiled: self.compiled,
            parent: self.parent,
            config: self.config,
            plugins: instrumented_plugins,
            classes,
            provenance,
            provided: Mutex::new(BTreeSet::new()),
            loaded: Mutex::new(BTreeSet::new()),
        })
    }
}

pub struct LoadingUnit {
    id: LoaderId,
    compiled: Arc<CompiledUnit>,
    parent: Option<Arc<LoadingUnit>>,
    config: LoaderConfig,
    plugins: InstrumentedPlugins,
    classes: HashMap<String, Arc<LoadedClass>>,
    /// Exact bytes handed out for each class of this unit
    provenance: BTreeMap<String, Vec<u8>>,
    provided: Mutex<BTreeSet<String>>,
    loaded: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for LoadingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingUnit")
            .field("id", &self.id)
            .field("compiled", &self.compiled.id())
            .field("classes", &self.provenance.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoadingUnit {
    pub fn builder(compiled: Arc<CompiledUnit>) -> LoadingUnitBuilder {
        LoadingUnitBuilder {
            compiled,
            parent: None,
            config: LoaderConfig::default(),
            plugins: PluginSet::new(),
            trusted: false,
        }
    }

    /// A trusted library unit for sharing code between programs
    pub fn library(compiled: Arc<CompiledUnit>) -> Result<Arc<LoadingUnit>, LoadError> {
        Ok(Arc::new(Self::builder(compiled).trusted().build()?))
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn compiled(&self) -> &Arc<CompiledUnit> {
        &self.compiled
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub(crate) fn plugins(&self) -> &InstrumentedPlugins {
        &self.plugins
    }

    /// Resolve `name` for code running under `capability`. The unit's own
    /// classes win; other names are delegated to the parent subject to the
    /// allow / block lists, and refusals are logged.
    pub fn load_class(
        &self,
        name: &str,
        capability: Option<&Capability>,
    ) -> Result<Arc<LoadedClass>, LoadError> {
        if let Some(class) = self.classes.get(name) {
            self.note(&self.provided, name);
            self.note(&self.loaded, name);
            return Ok(class.clone());
        }
        if !self.config.may_delegate(name) {
            if let Some(capability) = capability {
                capability.record(Permission::LoadClass(name.to_string()), false);
            }
            return Err(LoadError::Blocked(name.to_string()));
        }
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let class = parent.load_class(name, None)?;
        self.note(&self.loaded, name);
        Ok(class)
    }

    /// Resolve `name` the way `load_class` would, without recording the
    /// load or any refusal
    pub fn find_class(&self, name: &str) -> Option<Arc<LoadedClass>> {
        if let Some(class) = self.classes.get(name) {
            return Some(class.clone());
        }
        if !self.config.may_delegate(name) {
            return None;
        }
        self.parent.as_ref()?.find_class(name)
    }

    fn note(&self, set: &Mutex<BTreeSet<String>>, name: &str) {
        let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
        if !set.contains(name) {
            set.insert(name.to_string());
        }
    }

    /// Look up the bytes of one of this unit's classes by file name:
    /// `Main.class`, `pkg/Main.class` or `pkg.Main.class`
    pub fn class_file_bytes(&self, path: &str) -> Option<&[u8]> {
        let trimmed = path.trim_start_matches("./").trim_start_matches('/');
        let stem = trimmed.strip_suffix(".class")?;
        let name = stem.replace('/', ".");
        self.provenance.get(&name).map(Vec::as_slice)
    }

    /// Instrumented bytecode of one of this unit's classes
    pub fn instrumented_bytecode(&self, name: &str) -> Option<&[u8]> {
        self.provenance.get(name).map(Vec::as_slice)
    }

    /// Classes this unit defines
    pub fn defined_classes(&self) -> BTreeSet<String> {
        self.provenance.keys().cloned().collect()
    }

    /// Own classes handed out so far
    pub fn provided_classes(&self) -> BTreeSet<String> {
        self.provided
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All classes resolved so far, own and delegated
    pub fn loaded_classes(&self) -> BTreeSet<String> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = r#"
.class Main
.source Main.java
.method static main
L0:
  line 1
  push "hi"
  println
  return
.end
"#;

    const LIBRARY: &str = r#"
.class lib.Util
.method static answer
  push 42
  returnvalue
.end

.class warden.Internal
.method static secret
  return
.end
"#;

    fn unit_with(config: LoaderConfig) -> LoadingUnit {
        let library = LoadingUnit::library(Arc::new(CompiledUnit::from_assembly(LIBRARY).unwrap()))
            .unwrap();
        LoadingUnit::builder(Arc::new(CompiledUnit::from_assembly(MAIN).unwrap()))
            .parent(library)
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn test_units_have_distinct_ids() {
        let compiled = Arc::new(CompiledUnit::from_assembly(MAIN).unwrap());
        let a = LoadingUnit::builder(compiled.clone()).build().unwrap();
        let b = LoadingUnit::builder(compiled).build().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_own_classes_and_delegation() {
        let unit = unit_with(LoaderConfig::default());
        assert_eq!(unit.load_class("Main", None).unwrap().name, "Main");
        assert_eq!(unit.load_class("lib.Util", None).unwrap().name, "lib.Util");
        assert!(matches!(
            unit.load_class("Missing", None),
            Err(LoadError::NotFound(_))
        ));

        assert_eq!(unit.defined_classes().into_iter().collect::<Vec<_>>(), vec!["Main"]);
        assert_eq!(unit.provided_classes().into_iter().collect::<Vec<_>>(), vec!["Main"]);
        assert_eq!(
            unit.loaded_classes().into_iter().collect::<Vec<_>>(),
            vec!["Main", "lib.Util"]
        );
    }

    #[test]
    fn test_find_class_leaves_no_trace() {
        let unit = unit_with(LoaderConfig::default());
        assert_eq!(unit.find_class("Main").unwrap().name, "Main");
        assert_eq!(unit.find_class("lib.Util").unwrap().name, "lib.Util");
        assert!(unit.find_class("warden.Internal").is_none());
        assert!(unit.find_class("Missing").is_none());
        assert!(unit.provided_classes().is_empty());
        assert!(unit.loaded_classes().is_empty());
    }

    #[test]
    fn test_permanently_blocked_prefix() {
        let unit = unit_with(LoaderConfig::default());
        assert!(matches!(
            unit.load_class("warden.Internal", None),
            Err(LoadError::Blocked(_))
        ));

        let config = LoaderConfig {
            allowed_classes: vec!["warden.".to_string()],
            ..LoaderConfig::default()
        };
        assert!(matches!(config.validate(), Err(LoadError::Config(_))));
    }

    #[test]
    fn test_allow_list_and_block_list() {
        let allow = unit_with(LoaderConfig {
            allowed_classes: vec!["lib.".to_string()],
            ..LoaderConfig::default()
        });
        assert!(allow.load_class("lib.Util", None).is_ok());
        assert!(matches!(
            allow.load_class("other.Thing", None),
            Err(LoadError::Blocked(_))
        ));

        let block = unit_with(LoaderConfig {
            blocked_classes: vec!["lib.".to_string()],
            ..LoaderConfig::default()
        });
        assert!(matches!(
            block.load_class("lib.Util", None),
            Err(LoadError::Blocked(_))
        ));

        let both = LoaderConfig {
            allowed_classes: vec!["a.".to_string()],
            blocked_classes: vec!["b.".to_string()],
            ..LoaderConfig::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_class_file_lookup() {
        let unit = unit_with(LoaderConfig::default());
        let bytes = unit.class_file_bytes("Main.class").unwrap();
        assert_eq!(bytes, unit.instrumented_bytecode("Main").unwrap());
        assert!(unit.class_file_bytes("./Main.class").is_some());
        assert!(unit.class_file_bytes("Main.java").is_none());
        assert!(unit.class_file_bytes("lib/Util.class").is_none());
        assert!(unit.class_file_bytes("/etc/passwd").is_none());
    }

    #[test]
    fn test_rejects_hooks_in_submitted_code() {
        let compiled = CompiledUnit::from_assembly(
            ".class Main\n.method static main\nhook line-trace line 1\nreturn\n.end\n",
        )
        .unwrap();
        let err = LoadingUnit::builder(Arc::new(compiled)).build().unwrap_err();
        assert!(matches!(
            err,
            LoadError::Verify(VerifyError::HookInUntrustedCode { .. })
        ));
    }

    #[test]
    fn test_labels_resolve_to_instruction_indices() {
        let unit = unit_with(LoaderConfig::default());
        let main = unit.load_class("Main", None).unwrap();
        let method = main.method("main").unwrap();
        assert_eq!(method.label_pc(LabelId(0)), Some(0));
        assert_eq!(method.label_pc(LabelId(9)), None);
    }
}
