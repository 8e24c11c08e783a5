//! Name-to-factory lookup tables.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::info;

/// A registry of named factories.
///
/// One instance each exists for producers, databases, and telemetry
/// drivers. Registration happens once at boot; afterwards the table is
/// read-only under the reader half of the lock.
#[derive(Debug)]
pub struct Registrar<F> {
    entries: RwLock<HashMap<String, F>>,
}

impl<F> Default for Registrar<F> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<F: Clone> Registrar<F> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a factory under `name`. `vendor` is informational.
    pub fn register(&self, name: &str, vendor: &str, factory: F) {
        info!(name = %name, vendor = %vendor, "register");
        self.entries
            .write()
            .expect("registrar lock poisoned")
            .insert(name.to_owned(), factory);
    }

    /// Looks up the factory registered under `name`.
    pub fn get(&self, name: &str) -> Option<F> {
        self.entries
            .read()
            .expect("registrar lock poisoned")
            .get(name)
            .cloned()
    }

    /// True when a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("registrar lock poisoned")
            .contains_key(name)
    }

    /// Registered names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registrar lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Factory = fn() -> &'static str;

    #[test]
    fn register_and_get() {
        let registrar: Registrar<Factory> = Registrar::new();
        registrar.register("juniper.gnmi", "juniper", || "gnmi");

        assert!(registrar.contains("juniper.gnmi"));
        assert_eq!(registrar.get("juniper.gnmi").unwrap()(), "gnmi");
        assert!(registrar.get("cisco.mdt").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let registrar: Registrar<Factory> = Registrar::new();
        registrar.register("console", "builtin", || "first");
        registrar.register("console", "builtin", || "second");

        assert_eq!(registrar.get("console").unwrap()(), "second");
        assert_eq!(registrar.names(), vec!["console".to_owned()]);
    }
}
