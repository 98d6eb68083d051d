use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::Level;

#[derive(Default)]
/// Logs a message only when it differs from the last one logged under the same key.
///
/// Reconciliation passes repeat the same reasoning many times a minute,
/// this keeps the log to one line per actual change.
pub struct DupLog {
    last: Mutex<HashMap<String, String>>,
}

impl DupLog {
    /// Returns `true` if the message was logged.
    pub fn log(&self, level: Level, key: &str, message: String) -> bool {
        {
            let mut last = self.last.lock();
            if last.get(key) == Some(&message) {
                return false;
            }
            last.insert(key.to_string(), message.clone());
        }

        match level {
            Level::ERROR => error!(key = %key, "{}", message),
            Level::WARN => warn!(key = %key, "{}", message),
            Level::INFO => info!(key = %key, "{}", message),
            Level::DEBUG => debug!(key = %key, "{}", message),
            Level::TRACE => trace!(key = %key, "{}", message),
        }
        true
    }

    /// Forgets the last message of a key so the next one is logged.
    pub fn reset(&self, key: &str) {
        self.last.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup() {
        let duplog = DupLog::default();
        assert!(duplog.log(Level::INFO, "web", "placement leader: leader".into()));
        assert!(!duplog.log(Level::INFO, "web", "placement leader: leader".into()));
        assert!(duplog.log(Level::INFO, "db", "placement leader: leader".into()));
        assert!(duplog.log(Level::INFO, "web", "placement leader: not leader".into()));
        assert!(duplog.log(Level::INFO, "web", "placement leader: leader".into()));

        duplog.reset("web");
        assert!(duplog.log(Level::INFO, "web", "placement leader: leader".into()));
    }
}
