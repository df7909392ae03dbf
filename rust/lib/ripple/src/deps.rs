use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::subscriber::{ConnectKeys, Subscriber};
use crate::value::{PartialState, SubscriberId, sorted_keys};

/// Subscribers affected by a shared-state change, as found by
/// `DependencyIndex::find_update_refs`.
#[derive(Debug, Default)]
pub struct UpdateRefs {
    /// Subscribers owned by the changed module.
    pub belong: Vec<Arc<Subscriber>>,
    /// Subscribers of other modules whose declarations read a changed key.
    pub connect: Vec<Arc<Subscriber>>,
    /// The changed keys, sorted.
    pub shared_state_keys: Vec<String>,
}

/// Bipartite graph of subscribers and the `(module, key)` pairs they read.
///
/// Built at mount from each subscriber's owning module and its connect,
/// computed and watch declarations on other modules; queried at broadcast
/// time. Groups are returned in mount order.
pub struct DependencyIndex {
    inner: RwLock<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    next_seq: u64,
    seq_by_id: HashMap<SubscriberId, u64>,
    subscribers: BTreeMap<u64, Arc<Subscriber>>,
    /// module -> subscribers owned by it
    belong: HashMap<String, BTreeSet<u64>>,
    /// module -> subscriber -> keys read from it
    connect: HashMap<String, BTreeMap<u64, ConnectKeys>>,
}

/// Keys of `module` a subscriber depends on without owning it.
fn dependency_edges(sub: &Subscriber) -> BTreeMap<String, ConnectKeys> {
    let mut edges: BTreeMap<String, ConnectKeys> = BTreeMap::new();

    let mut add = |module: &str, keys: &[String]| {
        if module == sub.module() {
            return;
        }
        let entry = edges
            .entry(module.to_string())
            .or_insert_with(|| ConnectKeys::Keys(Vec::new()));
        if keys.is_empty() {
            *entry = ConnectKeys::All;
        } else if let ConnectKeys::Keys(existing) = entry {
            for k in keys {
                if !existing.contains(k) {
                    existing.push(k.clone());
                }
            }
        }
    };

    for (module, keys) in sub.connections() {
        match keys {
            ConnectKeys::All => add(module, &[]),
            ConnectKeys::Keys(keys) => add(module, keys),
        }
    }
    for def in sub.computed_defs() {
        add(def.module(), def.deps());
    }
    for def in sub.watch_defs() {
        add(def.module(), def.keys());
    }
    edges
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Register a subscriber. A subscriber with the same id is replaced.
    pub fn insert(&self, sub: Arc<Subscriber>) {
        let edges = dependency_edges(&sub);
        let mut inner = self.inner.write().unwrap();
        inner.remove_id(sub.id());

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq_by_id.insert(sub.id().clone(), seq);
        inner
            .belong
            .entry(sub.module().to_string())
            .or_default()
            .insert(seq);
        for (module, keys) in edges {
            inner.connect.entry(module).or_default().insert(seq, keys);
        }
        inner.subscribers.insert(seq, sub);
    }

    /// Unregister a subscriber. Returns it when it was registered.
    pub fn remove(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.inner.write().unwrap().remove_id(id)
    }

    pub fn get(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        let inner = self.inner.read().unwrap();
        let seq = inner.seq_by_id.get(id)?;
        inner.subscribers.get(seq).cloned()
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.inner.read().unwrap().seq_by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the subscribers to update after `changed_state` was saved to
    /// `module`.
    ///
    /// With a `render_key`, belonging subscribers in scope must carry that
    /// same render key. Scope is the classes in `render_key_classes` (`"*"`
    /// for all); subscribers of other classes are not filtered. Connected
    /// subscribers are included only when a key they read changed.
    pub fn find_update_refs(
        &self,
        module: &str,
        changed_state: &PartialState,
        render_key: Option<&str>,
        render_key_classes: &[String],
    ) -> UpdateRefs {
        let inner = self.inner.read().unwrap();
        let shared_state_keys = sorted_keys(changed_state);
        let all_classes = render_key_classes.iter().any(|c| c == "*");

        let belong = inner
            .belong
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|seq| inner.subscribers.get(seq))
            .filter(|sub| match render_key {
                Some(rk) => {
                    let in_scope = all_classes || render_key_classes.iter().any(|c| c == sub.class_key());
                    !in_scope || sub.render_key() == Some(rk)
                }
                None => true,
            })
            .cloned()
            .collect();

        let connect = inner
            .connect
            .get(module)
            .into_iter()
            .flatten()
            .filter(|(_, keys)| shared_state_keys.iter().any(|k| keys.contains(k)))
            .filter_map(|(seq, _)| inner.subscribers.get(seq))
            .cloned()
            .collect();

        UpdateRefs {
            belong,
            connect,
            shared_state_keys,
        }
    }
}

impl IndexInner {
    fn remove_id(&mut self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        let seq = self.seq_by_id.remove(id)?;
        for set in self.belong.values_mut() {
            set.remove(&seq);
        }
        for map in self.connect.values_mut() {
            map.remove(&seq);
        }
        self.subscribers.remove(&seq)
    }
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}
