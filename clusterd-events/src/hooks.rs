use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::exec::CommandExecutor;

/// The wildcard event id matching every event.
pub static ALL_EVENTS: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An external command triggered by events.
pub struct HookConfig {
    pub name: String,
    /// Event ids this hook fires on, or [ALL_EVENTS].
    #[serde(default)]
    pub events: Vec<String>,
    /// The argv of the command. The event JSON is written to its stdin.
    #[serde(default)]
    pub command: Vec<String>,
}

impl HookConfig {
    #[inline]
    pub fn matches(&self, event_id: &str) -> bool {
        self.events
            .iter()
            .any(|id| id == event_id || id == ALL_EVENTS)
    }
}

/// Delivers events to the configured hooks.
pub struct HookRunner {
    hooks: RwLock<Vec<HookConfig>>,
    executor: Arc<dyn CommandExecutor>,
}

impl HookRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            executor,
        }
    }

    /// Replaces the set of configured hooks.
    pub fn set_hooks(&self, hooks: Vec<HookConfig>) {
        *self.hooks.write() = hooks;
    }

    pub fn hooks(&self) -> Vec<HookConfig> {
        self.hooks.read().clone()
    }

    #[inline]
    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Runs every hook matching the event.
    ///
    /// Failures are logged and otherwise ignored. Returns the number of
    /// hooks which were started.
    pub fn run(&self, event: &Event) -> usize {
        let matching = self
            .hooks
            .read()
            .iter()
            .filter(|hook| hook.matches(&event.data.id))
            .cloned()
            .collect::<Vec<_>>();

        if matching.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(
                    event_id = %event.data.id,
                    error = ?error,
                    "Failed to serialize event for hooks.",
                );
                return 0;
            },
        };

        let mut started = 0;
        for hook in matching {
            match self.executor.spawn(&hook.command, Some(payload.clone())) {
                Ok(()) => {
                    debug!(hook = %hook.name, event_id = %event.data.id, "Event hook started.");
                    started += 1;
                },
                Err(error) => {
                    warn!(
                        hook = %hook.name,
                        event_id = %event.data.id,
                        error = %error,
                        "Failed to execute event hook."
                    );
                },
            }
        }

        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_matching() {
        let hook = HookConfig {
            name: "audit".to_string(),
            events: vec!["forget_peer".to_string()],
            command: vec!["/bin/true".to_string()],
        };
        assert!(hook.matches("forget_peer"));
        assert!(!hook.matches("crash"));

        let hook = HookConfig {
            events: vec![ALL_EVENTS.to_string()],
            ..hook
        };
        assert!(hook.matches("crash"));
        assert!(hook.matches("anything"));

        let hook = HookConfig {
            events: Vec::new(),
            ..hook
        };
        assert!(!hook.matches("crash"));
    }
}
