//! Modules exporting functions callable from scripts.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::env::EnvStore;
use crate::error::ShellResult;
use crate::stdlib::StdFunction;

/// Source of module-exported functions consulted by the engine's hybrid mode.
pub trait ModuleManager: Send + Sync {
    fn is_exported_function(&self, name: &str) -> bool;

    /// Invoke an export; `None` when no loaded module exports `name`.
    fn call_exported(
        &self,
        name: &str,
        args: &[String],
        env: &mut dyn EnvStore,
    ) -> Option<ShellResult<String>>;
}

/// A named set of exports.
#[derive(Clone, Default)]
pub struct Module {
    pub name: String,
    exports: BTreeMap<String, Arc<dyn StdFunction>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exports: BTreeMap::new(),
        }
    }

    pub fn export<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[String], &mut dyn EnvStore) -> ShellResult<String> + Send + Sync + 'static,
    {
        self.exports.insert(name.to_string(), Arc::new(function));
        self
    }

    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }

    // Exports may be declared function-style, as `name()`
    fn lookup(&self, name: &str) -> Option<&Arc<dyn StdFunction>> {
        self.exports
            .get(name)
            .or_else(|| self.exports.get(&format!("{name}()")))
    }
}

/// Default [`ModuleManager`]: modules registered in process.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a module.
    pub fn load(&mut self, module: Module) {
        shrun_log_debug!(module = %module.name, "module loaded");
        self.modules.insert(module.name.clone(), module);
    }

    pub fn unload(&mut self, name: &str) -> bool {
        self.modules.remove(name).is_some()
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }
}

impl ModuleManager for ModuleRegistry {
    fn is_exported_function(&self, name: &str) -> bool {
        self.modules.values().any(|m| m.lookup(name).is_some())
    }

    fn call_exported(
        &self,
        name: &str,
        args: &[String],
        env: &mut dyn EnvStore,
    ) -> Option<ShellResult<String>> {
        self.modules
            .values()
            .find_map(|m| m.lookup(name))
            .map(|f| f.invoke(args, env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentManager;

    fn greeter() -> Module {
        Module::new("greet")
            .export("Hello", |args: &[String], _: &mut dyn EnvStore| {
                Ok(format!("hello {}", args.join(" ")))
            })
            .export("Bye()", |_: &[String], _: &mut dyn EnvStore| Ok("bye".to_string()))
    }

    #[test]
    fn exact_and_function_style_exports_are_found() {
        let mut registry = ModuleRegistry::new();
        registry.load(greeter());
        assert!(registry.is_exported_function("Hello"));
        assert!(registry.is_exported_function("Bye"));
        assert!(!registry.is_exported_function("Missing"));
    }

    #[test]
    fn call_exported_invokes_handler() {
        let mut registry = ModuleRegistry::new();
        registry.load(greeter());
        let mut env = EnvironmentManager::new();
        let out = registry
            .call_exported("Hello", &["world".to_string()], &mut env)
            .unwrap()
            .unwrap();
        assert_eq!(out, "hello world");
        assert!(registry.call_exported("Missing", &[], &mut env).is_none());
    }

    #[test]
    fn unload_removes_exports() {
        let mut registry = ModuleRegistry::new();
        registry.load(greeter());
        assert_eq!(registry.module_names(), vec!["greet"]);
        assert_eq!(
            registry.module("greet").unwrap().export_names().collect::<Vec<_>>(),
            vec!["Bye()", "Hello"]
        );
        assert!(registry.unload("greet"));
        assert!(!registry.is_exported_function("Hello"));
    }
}
