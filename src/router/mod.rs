//! Routing of incoming message bodies to registered callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

/// A handler invoked with the body of every matching message.
pub type Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// The table of registered callbacks, keyed by their (channel, key)
/// pattern. An empty string in either component is a wildcard, and
/// several handlers may share one pattern.
pub struct CallbackTable {
    handlers: RwLock<HashMap<(String, String), Vec<Callback>>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        CallbackTable {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, channel: &str, key: &str, callback: Callback) {
        self.handlers
            .write()
            .entry((channel.to_owned(), key.to_owned()))
            .or_default()
            .push(callback);
    }

    /// Every handler whose pattern matches the concrete topic
    /// `(channel, key)`. Wildcard matching is linear over the map.
    pub fn matching(&self, channel: &str, key: &str) -> SmallVec<[Callback; 4]> {
        let handlers = self.handlers.read();
        let mut matched = SmallVec::new();
        for ((pat_channel, pat_key), callbacks) in handlers.iter() {
            if (pat_channel.is_empty() || pat_channel == channel)
                && (pat_key.is_empty() || pat_key == key)
            {
                matched.extend(callbacks.iter().cloned());
            }
        }
        matched
    }
}
