use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::debug;

use crate::extract::extract_by_keys;
use crate::value::{MODULE_GLOBAL, PartialState, SubscriberId, merge_into};

/// Options for `Store::set_state`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetStateOptions {
    /// Stage only. The caller persists later via `save_shared_state`.
    pub no_save: bool,
}

/// Module-partitioned shared state.
///
/// - `root`: current state of every module.
/// - `prev`: per-module shadow copy taken right before the latest save.
/// - `ver`: per-module key registration record (every value is 1).
/// - `keys`: recognized (shared) keys of every module.
/// - `refs`: per-subscriber materialized cache of stored keys.
///
/// All five live behind one lock, so a save updates `prev` and `root`
/// atomically: no reader observes one without the other.
pub struct Store {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    root: BTreeMap<String, PartialState>,
    prev: BTreeMap<String, PartialState>,
    ver: BTreeMap<String, BTreeMap<String, u8>>,
    keys: HashMap<String, Vec<String>>,
    refs: HashMap<SubscriberId, PartialState>,
}

impl Store {
    /// Create an empty store with no modules.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    // ====================================================================
    // Module registration
    // ====================================================================

    /// Install the initial state of a module.
    ///
    /// Replaces any previous state of the module. `prev` starts as a copy
    /// of `state`. The global module is extended instead: its state is
    /// merged and its recognized keys only grow.
    pub(crate) fn install_module(&self, module: &str, state: PartialState) {
        let mut inner = self.inner.write().unwrap();
        let keys: Vec<String> = state.keys().cloned().collect();

        if module == MODULE_GLOBAL {
            merge_into(inner.root.entry(module.to_string()).or_default(), &state);
            merge_into(inner.prev.entry(module.to_string()).or_default(), &state);
            let ver = inner.ver.entry(module.to_string()).or_default();
            for k in &keys {
                ver.insert(k.clone(), 1);
            }
            let global = inner.keys.entry(module.to_string()).or_default();
            for k in keys {
                if !global.contains(&k) {
                    global.push(k);
                }
            }
            return;
        }

        inner
            .ver
            .insert(module.to_string(), keys.iter().map(|k| (k.clone(), 1)).collect());
        inner.prev.insert(module.to_string(), state.clone());
        inner.root.insert(module.to_string(), state);
        inner.keys.insert(module.to_string(), keys);
    }

    /// Whether a module is registered.
    pub fn has_module(&self, module: &str) -> bool {
        self.inner.read().unwrap().root.contains_key(module)
    }

    /// Names of all registered modules, ordered.
    pub fn modules(&self) -> Vec<String> {
        self.inner.read().unwrap().root.keys().cloned().collect()
    }

    /// Recognized shared keys of a module. Empty for unknown modules.
    pub fn state_keys(&self, module: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .keys
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    // ====================================================================
    // Writes
    // ====================================================================

    /// Stage a shared-state change for `module`.
    ///
    /// An empty `partial` is returned untouched and nothing is written.
    /// With `no_save` the staged object is returned without touching the
    /// root state; the caller must call `save_shared_state` later.
    pub fn set_state(&self, module: &str, partial: PartialState, opts: SetStateOptions) -> PartialState {
        if partial.is_empty() {
            return partial;
        }
        if !opts.no_save {
            self.save_shared_state(module, partial.clone(), false);
        }
        partial
    }

    /// Persist `shared` into the root state of `module`.
    ///
    /// With `re_extract` the shared subset is derived again from the
    /// module's recognized keys first, dropping anything a middleware added
    /// that the module does not own. The pre-merge module state becomes the
    /// new `prev` snapshot. Returns the state actually saved, or `None`
    /// when there was nothing to save.
    pub fn save_shared_state(&self, module: &str, shared: PartialState, re_extract: bool) -> Option<PartialState> {
        let mut inner = self.inner.write().unwrap();

        let to_save = if re_extract {
            let keys = inner.keys.get(module).cloned().unwrap_or_default();
            extract_by_keys(&shared, &keys, true).partial_state
        } else {
            shared
        };
        if to_save.is_empty() {
            return None;
        }

        let current = inner.root.entry(module.to_string()).or_default();
        let before = current.clone();
        merge_into(current, &to_save);
        inner.prev.insert(module.to_string(), before);

        let ver = inner.ver.entry(module.to_string()).or_default();
        for k in to_save.keys() {
            ver.insert(k.clone(), 1);
        }

        debug!(module, keys = to_save.len(), "shared state saved");
        Some(to_save)
    }

    /// Merge `partial` into the materialized stored-key cache of a subscriber.
    pub fn set_ref_state(&self, id: &SubscriberId, partial: &PartialState) {
        let mut inner = self.inner.write().unwrap();
        let cached = inner.refs.entry(id.clone()).or_default();
        merge_into(cached, partial);
    }

    /// Drop the stored-key cache of a subscriber.
    pub fn remove_ref_state(&self, id: &SubscriberId) -> Option<PartialState> {
        self.inner.write().unwrap().refs.remove(id)
    }

    // ====================================================================
    // Reads
    // ====================================================================

    /// Current state of a module (clone).
    pub fn get_state(&self, module: &str) -> Option<PartialState> {
        self.inner.read().unwrap().root.get(module).cloned()
    }

    /// Snapshot of the whole root state.
    pub fn get_root_state(&self) -> BTreeMap<String, PartialState> {
        self.inner.read().unwrap().root.clone()
    }

    /// Module state as it was right before the most recent save.
    pub fn get_prev_state(&self, module: &str) -> PartialState {
        self.inner
            .read()
            .unwrap()
            .prev
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Key registration record of a module.
    pub fn get_state_ver(&self, module: &str) -> BTreeMap<String, u8> {
        self.inner
            .read()
            .unwrap()
            .ver
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Stored-key cache of a subscriber.
    pub fn get_ref_state(&self, id: &SubscriberId) -> Option<PartialState> {
        self.inner.read().unwrap().refs.get(id).cloned()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
