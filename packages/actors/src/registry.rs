//! Registry of running monitors.

use std::collections::HashMap;
use std::sync::RwLock;

use ractor::ActorRef;

use crate::messages::SupervisorMessage;

/// Global registry of monitor supervisors by name.
///
/// Lets a front end reach a monitor it did not start, for instance a signal
/// handler shutting everything down.
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, ActorRef<SupervisorMessage>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a monitor supervisor.
    pub fn register(&self, name: &str, supervisor: ActorRef<SupervisorMessage>) {
        self.monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), supervisor);
    }

    pub fn unregister(&self, name: &str) {
        self.monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }

    /// Get a monitor supervisor by name.
    pub fn get(&self, name: &str) -> Option<ActorRef<SupervisorMessage>> {
        self.monitors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Names of all registered monitors.
    pub fn names(&self) -> Vec<String> {
        self.monitors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: std::sync::LazyLock<MonitorRegistry> =
    std::sync::LazyLock::new(MonitorRegistry::new);

/// Get the global monitor registry.
pub fn global_registry() -> &'static MonitorRegistry {
    &REGISTRY
}
