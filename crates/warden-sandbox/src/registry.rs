//! Confinement registry
//!
//! Maps each live loading unit to its permission set and decision log.
//! Confined threads hold a [`Capability`] pointing at their entry, so
//! permission checks never touch the registry lock.

use crate::loader::{LoaderId, LoadingUnit};
use crate::permissions::{Permission, PermissionDecision, PermissionSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Misuse of the confinement protocol by the harness. Never absorbed into
/// an execution result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfinementError {
    #[error("loading unit {0} is already confined")]
    AlreadyConfined(LoaderId),

    #[error("loading unit {0} is not confined")]
    NotConfined(LoaderId),

    #[error("token does not match the live confinement of loading unit {0}")]
    StaleToken(LoaderId),

    #[error("thread registration beyond the limit of {limit} extra threads")]
    ThreadLimit { limit: usize },
}

/// Proof of a `confine` call, required to release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinementToken {
    loader: LoaderId,
    nonce: Uuid,
}

impl ConfinementToken {
    pub fn loader(&self) -> LoaderId {
        self.loader
    }
}

#[derive(Debug)]
struct ConfinementEntry {
    loader: LoaderId,
    nonce: Uuid,
    permissions: PermissionSet,
    decisions: Mutex<Vec<PermissionDecision>>,
    revoked: AtomicBool,
}

/// A confined thread's handle on its entry
#[derive(Debug, Clone)]
pub struct Capability {
    entry: Arc<ConfinementEntry>,
}

impl Capability {
    pub fn loader(&self) -> LoaderId {
        self.entry.loader
    }

    /// Evaluate `permission` against the granted set and log the decision.
    /// Everything is denied once the entry has been released.
    pub fn check(&self, permission: Permission) -> bool {
        let granted = !self.is_revoked() && self.entry.permissions.implies(&permission);
        self.record(permission, granted);
        granted
    }

    /// Log a decision made by a rule outside the permission set
    pub fn record(&self, permission: Permission, granted: bool) {
        if !granted {
            debug!(loader = %self.entry.loader, %permission, "permission denied");
        }
        let mut decisions = self
            .entry
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        decisions.push(PermissionDecision {
            permission,
            granted,
        });
    }

    pub fn is_revoked(&self) -> bool {
        self.entry.revoked.load(Ordering::Acquire)
    }

    /// Decisions logged so far
    pub fn decisions(&self) -> Vec<PermissionDecision> {
        self.entry
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Default)]
pub struct ConfinementRegistry {
    entries: Mutex<HashMap<LoaderId, Arc<ConfinementEntry>>>,
}

impl ConfinementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> Arc<ConfinementRegistry> {
        static GLOBAL: OnceLock<Arc<ConfinementRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(ConfinementRegistry::new()))
            .clone()
    }

    /// Register `unit` with `permissions`
    pub fn confine(
        &self,
        unit: &LoadingUnit,
        permissions: PermissionSet,
    ) -> Result<ConfinementToken, ConfinementError> {
        let loader = unit.id();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&loader) {
            warn!(%loader, "attempt to confine a loading unit twice");
            return Err(ConfinementError::AlreadyConfined(loader));
        }
        let nonce = Uuid::new_v4();
        entries.insert(
            loader,
            Arc::new(ConfinementEntry {
                loader,
                nonce,
                permissions,
                decisions: Mutex::new(Vec::new()),
                revoked: AtomicBool::new(false),
            }),
        );
        debug!(%loader, live = entries.len(), "loading unit confined");
        Ok(ConfinementToken { loader, nonce })
    }

    /// Capability for threads running under `token`
    pub fn capability(&self, token: &ConfinementToken) -> Result<Capability, ConfinementError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(&token.loader)
            .ok_or(ConfinementError::NotConfined(token.loader))?;
        if entry.nonce != token.nonce {
            return Err(ConfinementError::StaleToken(token.loader));
        }
        Ok(Capability {
            entry: entry.clone(),
        })
    }

    /// Remove the entry of `unit` and return its full decision log
    pub fn release(
        &self,
        token: &ConfinementToken,
        unit: &LoadingUnit,
    ) -> Result<Vec<PermissionDecision>, ConfinementError> {
        let loader = unit.id();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(&loader)
            .ok_or(ConfinementError::NotConfined(loader))?;
        if token.loader != loader || entry.nonce != token.nonce {
            warn!(%loader, "release with a stale or forged token");
            return Err(ConfinementError::StaleToken(loader));
        }
        let entry = match entries.remove(&loader) {
            Some(entry) => entry,
            None => return Err(ConfinementError::NotConfined(loader)),
        };
        drop(entries);

        entry.revoked.store(true, Ordering::Release);
        let mut decisions = entry.decisions.lock().unwrap_or_else(|e| e.into_inner());
        debug!(%loader, decisions = decisions.len(), "loading unit released");
        Ok(std::mem::take(&mut *decisions))
    }

    /// Whether any loading unit is confined
    pub fn is_active(&self) -> bool {
        !self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn is_confined(&self, unit: &LoadingUnit) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&unit.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompiledUnit;
    use std::path::PathBuf;

    fn unit() -> LoadingUnit {
        let compiled = CompiledUnit::from_assembly(
            ".class Main\n.source Main.java\n.method static main\nreturn\n.end\n",
        )
        .unwrap();
        LoadingUnit::builder(Arc::new(compiled)).build().unwrap()
    }

    #[test]
    fn test_confine_and_release() {
        let registry = ConfinementRegistry::new();
        let unit = unit();
        assert!(!registry.is_active());

        let token = registry.confine(&unit, PermissionSet::new()).unwrap();
        assert!(registry.is_active());
        assert!(registry.is_confined(&unit));

        let cap = registry.capability(&token).unwrap();
        assert!(!cap.check(Permission::CreateThread));

        let log = registry.release(&token, &unit).unwrap();
        assert_eq!(
            log,
            vec![PermissionDecision {
                permission: Permission::CreateThread,
                granted: false
            }]
        );
        assert!(!registry.is_active());
    }

    #[test]
    fn test_double_confine_rejected() {
        let registry = ConfinementRegistry::new();
        let unit = unit();
        let token = registry.confine(&unit, PermissionSet::new()).unwrap();
        assert_eq!(
            registry.confine(&unit, PermissionSet::new()),
            Err(ConfinementError::AlreadyConfined(unit.id()))
        );
        registry.release(&token, &unit).unwrap();
    }

    #[test]
    fn test_double_and_forged_release_rejected() {
        let registry = ConfinementRegistry::new();
        let unit = unit();
        let token = registry.confine(&unit, PermissionSet::new()).unwrap();

        let forged = ConfinementToken {
            loader: unit.id(),
            nonce: Uuid::new_v4(),
        };
        assert_eq!(
            registry.release(&forged, &unit),
            Err(ConfinementError::StaleToken(unit.id()))
        );
        assert!(registry.is_confined(&unit));

        registry.release(&token, &unit).unwrap();
        assert_eq!(
            registry.release(&token, &unit),
            Err(ConfinementError::NotConfined(unit.id()))
        );
    }

    #[test]
    fn test_token_for_other_unit_is_stale() {
        let registry = ConfinementRegistry::new();
        let first = unit();
        let second = unit();
        let first_token = registry.confine(&first, PermissionSet::new()).unwrap();
        let second_token = registry.confine(&second, PermissionSet::new()).unwrap();
        assert_eq!(
            registry.release(&first_token, &second),
            Err(ConfinementError::StaleToken(second.id()))
        );
        registry.release(&first_token, &first).unwrap();
        registry.release(&second_token, &second).unwrap();
    }

    #[test]
    fn test_identical_units_get_separate_logs() {
        let registry = ConfinementRegistry::new();
        let a = unit();
        let b = unit();
        assert_ne!(a.id(), b.id());

        let granted = PermissionSet::new().with_env_var("HOME");
        let ta = registry.confine(&a, granted).unwrap();
        let tb = registry.confine(&b, PermissionSet::new()).unwrap();
        let ca = registry.capability(&ta).unwrap();
        let cb = registry.capability(&tb).unwrap();

        assert!(ca.check(Permission::EnvVar("HOME".to_string())));
        assert!(!cb.check(Permission::EnvVar("HOME".to_string())));
        assert!(!cb.check(Permission::WriteFile(PathBuf::from("/tmp/x"))));

        assert_eq!(registry.release(&ta, &a).unwrap().len(), 1);
        assert_eq!(registry.release(&tb, &b).unwrap().len(), 2);
    }

    #[test]
    fn test_released_capability_denies_everything() {
        let registry = ConfinementRegistry::new();
        let unit = unit();
        let token = registry
            .confine(&unit, PermissionSet::new().with_env_var("*"))
            .unwrap();
        let cap = registry.capability(&token).unwrap();
        assert!(cap.check(Permission::EnvVar("PATH".to_string())));

        registry.release(&token, &unit).unwrap();
        assert!(cap.is_revoked());
        assert!(!cap.check(Permission::EnvVar("PATH".to_string())));
        assert!(registry.capability(&token).is_err());
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = ConfinementRegistry::global();
        let b = ConfinementRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
