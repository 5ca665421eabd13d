//! Permission model for confined code
//!
//! A run is granted a set of permissions up front; everything else is
//! denied. Every decision made on behalf of confined code is recorded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Operations confined code can request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Permission {
    /// Read a file. Only the loading unit's own class files are ever readable.
    ReadFile(PathBuf),

    /// Write a file (a granted directory covers everything beneath it)
    WriteFile(PathBuf),

    /// Read one environment variable (`*` for all)
    EnvVar(String),

    /// Read one runtime property (`*` for all)
    ReadProperty(String),

    /// Start an extra task thread
    CreateThread,

    /// Load a class by name
    LoadClass(String),

    /// Terminate the host process
    Exit,

    /// Replace the host's standard streams
    SetIo,
}

impl Permission {
    /// Permissions that may never be granted to confined code
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Permission::Exit | Permission::SetIo)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ReadFile(path) => write!(f, "read file {}", path.display()),
            Permission::WriteFile(path) => write!(f, "write file {}", path.display()),
            Permission::EnvVar(name) => write!(f, "read environment variable {}", name),
            Permission::ReadProperty(name) => write!(f, "read property {}", name),
            Permission::CreateThread => write!(f, "create thread"),
            Permission::LoadClass(name) => write!(f, "load class {}", name),
            Permission::Exit => write!(f, "exit"),
            Permission::SetIo => write!(f, "set io"),
        }
    }
}

/// One recorded check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionDecision {
    pub permission: Permission,
    pub granted: bool,
}

/// Permissions granted to one run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    permissions: HashSet<Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    pub fn with(mut self, permission: Permission) -> Self {
        self.grant(permission);
        self
    }

    pub fn with_write_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.with(Permission::WriteFile(dir.into()))
    }

    pub fn with_env_var(self, name: impl Into<String>) -> Self {
        self.with(Permission::EnvVar(name.into()))
    }

    pub fn with_property(self, name: impl Into<String>) -> Self {
        self.with(Permission::ReadProperty(name.into()))
    }

    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    /// First granted permission that must never be granted
    pub fn first_unsafe(&self) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.is_unsafe())
    }

    /// Whether the set allows `requested`
    pub fn implies(&self, requested: &Permission) -> bool {
        match requested {
            // Reads are governed by the class file rule, never by grants
            Permission::ReadFile(_) => false,
            Permission::WriteFile(path) => self.can_write_file(path),
            Permission::EnvVar(name) => self.permissions.iter().any(|p| match p {
                Permission::EnvVar(granted) => granted == "*" || granted == name,
                _ => false,
            }),
            Permission::ReadProperty(name) => self.permissions.iter().any(|p| match p {
                Permission::ReadProperty(granted) => granted == "*" || granted == name,
                _ => false,
            }),
            Permission::Exit | Permission::SetIo => false,
            other => self.has(other),
        }
    }

    /// Check if a file write is allowed
    pub fn can_write_file(&self, path: &Path) -> bool {
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return false;
        }
        self.permissions.iter().any(|p| match p {
            Permission::WriteFile(granted) => path.starts_with(granted),
            _ => false,
        })
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}
