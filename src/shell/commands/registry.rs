use std::collections::HashMap;
use std::sync::Arc;
use super::command_trait::Command;
use super::{basic, host, vm, vm_guest};

/// Registry that holds all available commands
pub struct CommandRegistry {
    /// Commands in registration order, which is also `help` order
    commands: Vec<Arc<dyn Command>>,
    /// `module.name` and every alias, pointing into `commands`
    index: HashMap<String, usize>,
}

impl CommandRegistry {
    /// Create a new empty command registry
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Every module the shell ships with
    pub fn standard() -> Self {
        let mut registry = Self::new();
        basic::register(&mut registry);
        vm::register(&mut registry);
        host::register(&mut registry);
        vm_guest::register(&mut registry);
        registry
    }

    pub fn register_command(&mut self, command: Arc<dyn Command>) {
        let slot = self.commands.len();
        self.index.insert(command.qualified_name(), slot);
        for alias in command.aliases() {
            // `module.alias` works too, unless a real command already has that name
            let qualified = format!("{}.{}", command.module(), alias);
            if !self.index.contains_key(&qualified) {
                self.index.insert(qualified, slot);
            }
            if let Some(previous) = self.index.insert(alias.to_string(), slot).filter(|&previous| previous != slot) {
                log::warn!("alias {} of {} shadows {}", alias, command.qualified_name(), self.commands[previous].qualified_name());
            }
        }
        self.commands.push(command);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.index.get(name).map(|&slot| &self.commands[slot])
    }

    pub fn commands(&self) -> impl Iterator<Item = &Arc<dyn Command>> {
        self.commands.iter()
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.commands.iter().any(|c| c.module() == module)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_resolves_aliases() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.get("l").unwrap().qualified_name(), "basic.ls");
        assert_eq!(registry.get("k").unwrap().qualified_name(), "vm.kill");
        assert_eq!(registry.get("vm.disconnect").unwrap().module(), "vm");
        assert_eq!(registry.get("host.disconnect").unwrap().module(), "host");
        assert!(registry.has_module("vm_guest"));
        assert!(registry.get("perfstats").is_none());
    }

    #[test]
    fn test_aliases_work_with_module_prefix() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.get("basic.show").unwrap().qualified_name(), "basic.info");
        assert_eq!(registry.get("show").unwrap().qualified_name(), "basic.info");
        assert_eq!(registry.get("vm.extraConfig").unwrap().qualified_name(), "vm.extra_config");
        assert_eq!(registry.get("vm.setExtraConfig").unwrap().qualified_name(), "vm.set_extra_config");
        assert_eq!(registry.get("vm.r").unwrap().qualified_name(), "vm.reset");
    }

    #[test]
    fn test_registration_order_starts_with_basic() {
        let registry = CommandRegistry::standard();
        let modules: Vec<&str> = registry.commands().map(|c| c.module()).collect();
        assert_eq!(modules.first(), Some(&"basic"));
        let first_vm = modules.iter().position(|m| *m == "vm").unwrap();
        let first_host = modules.iter().position(|m| *m == "host").unwrap();
        assert!(first_vm < first_host);
    }

    #[test]
    fn test_every_command_has_a_summary() {
        let registry = CommandRegistry::standard();
        for command in registry.commands() {
            assert!(!command.summary().is_empty(), "{} has no summary", command.qualified_name());
        }
    }
}
