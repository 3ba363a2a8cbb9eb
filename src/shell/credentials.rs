//! In-guest credentials, kept for the lifetime of the shell.
//!
//! Entries are keyed by `(vm, username)`. A per-VM index remembers the
//! path the VM was authenticated under (for `list_auth`) and the usernames
//! stored for it; the index entry is pruned as soon as its last username
//! is cleared.

use std::collections::{BTreeMap, BTreeSet};
use crate::vim::{ManagedObjectRef, NamePasswordAuthentication};

/// A VM as seen through one connection
pub type VmKey = (String, ManagedObjectRef);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No credentials found. You must authenticate before executing this command.")]
    Missing,
}

#[derive(Debug)]
struct VmCredentials {
    path: String,
    usernames: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: BTreeMap<(VmKey, String), NamePasswordAuthentication>,
    vms: BTreeMap<VmKey, VmCredentials>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an already validated credential, replacing any previous one for the same user
    pub fn insert(&mut self, vm: VmKey, path: &str, auth: NamePasswordAuthentication) {
        let index = self.vms.entry(vm.clone()).or_insert_with(|| VmCredentials {
            path: path.to_string(),
            usernames: BTreeSet::new(),
        });
        index.path = path.to_string();
        index.usernames.insert(auth.username.clone());
        self.entries.insert((vm, auth.username.clone()), auth);
    }

    pub fn get(&self, vm: &VmKey, username: &str) -> Result<&NamePasswordAuthentication, CredentialError> {
        self.entries.get(&(vm.clone(), username.to_string())).ok_or(CredentialError::Missing)
    }

    /// Remove one entry. Returns whether anything was removed.
    pub fn clear(&mut self, vm: &VmKey, username: &str) -> bool {
        let removed = self.entries.remove(&(vm.clone(), username.to_string())).is_some();
        if let Some(index) = self.vms.get_mut(vm) {
            index.usernames.remove(username);
            if index.usernames.is_empty() {
                self.vms.remove(vm);
            }
        }
        removed
    }

    /// `(path, usernames)` for one VM, or for all of them
    pub fn list(&self, vm: Option<&VmKey>) -> Vec<(&str, Vec<&str>)> {
        self.vms.iter()
            .filter(|(key, _)| vm.is_none_or(|wanted| *key == wanted))
            .map(|(_, index)| (index.path.as_str(), index.usernames.iter().map(String::as_str).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str) -> VmKey {
        ("vc".to_string(), ManagedObjectRef::new("VirtualMachine", id))
    }

    fn auth(username: &str, password: &str) -> NamePasswordAuthentication {
        NamePasswordAuthentication {
            username: username.to_string(),
            password: password.to_string(),
            interactive_session: false,
        }
    }

    #[test]
    fn test_get_after_insert() {
        let mut cache = CredentialCache::new();
        cache.insert(vm("vm-1"), "/vc/lab/vms/web01", auth("root", "secret"));
        assert_eq!(cache.get(&vm("vm-1"), "root").unwrap().password, "secret");
        assert_eq!(cache.get(&vm("vm-1"), "admin"), Err(CredentialError::Missing));
        assert_eq!(cache.get(&vm("vm-2"), "root"), Err(CredentialError::Missing));
    }

    #[test]
    fn test_clear_then_get_fails() {
        let mut cache = CredentialCache::new();
        cache.insert(vm("vm-1"), "/vc/lab/vms/web01", auth("root", "secret"));
        cache.insert(vm("vm-1"), "/vc/lab/vms/web01", auth("admin", "hunter2"));

        assert!(cache.clear(&vm("vm-1"), "root"));
        let err = cache.get(&vm("vm-1"), "root").unwrap_err();
        assert_eq!(err.to_string(), "No credentials found. You must authenticate before executing this command.");
        assert_eq!(cache.list(Some(&vm("vm-1"))), vec![("/vc/lab/vms/web01", vec!["admin"])]);

        assert!(cache.clear(&vm("vm-1"), "admin"));
        assert!(cache.list(None).is_empty());
        assert!(!cache.clear(&vm("vm-1"), "admin"));
    }

    #[test]
    fn test_list() {
        let mut cache = CredentialCache::new();
        cache.insert(vm("vm-1"), "/vc/lab/vms/web01", auth("root", "a"));
        cache.insert(vm("vm-1"), "/vc/lab/vms/web01", auth("admin", "b"));
        cache.insert(vm("vm-2"), "/vc/lab/vms/db01", auth("root", "c"));

        assert_eq!(cache.list(None).len(), 2);
        assert_eq!(cache.list(Some(&vm("vm-1"))), vec![("/vc/lab/vms/web01", vec!["admin", "root"])]);
        assert!(cache.list(Some(&vm("vm-9"))).is_empty());
    }
}
