use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A partial module state: a plain key-value object.
///
/// Every commit, every staged shared state and every delta handed to a
/// render sink is one of these. Values are ordinary JSON values so they can
/// cross the durable-storage boundary without a separate encoding step.
pub type PartialState = Map<String, Value>;

/// Reserved module whose recognized keys may grow after registration.
pub const MODULE_GLOBAL: &str = "$$global";

/// Reserved module that never holds shared state.
pub const MODULE_VOID: &str = "$$void";

/// Merge `delta` into `target`, overwriting existing keys.
pub fn merge_into(target: &mut PartialState, delta: &PartialState) {
    for (k, v) in delta {
        target.insert(k.clone(), v.clone());
    }
}

/// Sorted key list of a partial state.
pub fn sorted_keys(state: &PartialState) -> Vec<String> {
    let mut keys: Vec<String> = state.keys().cloned().collect();
    keys.sort();
    keys
}

/// Unique identity of a mounted subscriber: `"<class_key>$<key>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(String);

static NEXT_AUTO_KEY: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    /// Build an id from a class key and an instance key.
    pub fn new(class_key: &str, key: &str) -> Self {
        Self(format!("{class_key}${key}"))
    }

    /// Build an id with a generated instance key.
    pub fn generate(class_key: &str) -> Self {
        let n = NEXT_AUTO_KEY.fetch_add(1, Ordering::Relaxed);
        Self::new(class_key, &format!("auto{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique handle for a signal handler, returned by `SignalBus::on()`.
///
/// Use this to remove the handler later via `SignalBus::off()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);
