use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::compare::Compare;
use crate::computed::{ComputedCell, ComputedDef};
use crate::config::RippleConfig;
use crate::value::{PartialState, SubscriberId, merge_into};
use crate::watch::WatchDef;

/// Render/update capability of a mounted UI instance.
///
/// The engine only decides *whether* and *with what delta* these are
/// called; what they do is up to the host.
pub trait RenderSink: Send + Sync {
    /// Apply a state delta. `should_render` is false when watchers vetoed
    /// the re-render; the delta is still applied.
    fn apply_delta(&self, delta: &PartialState, should_render: bool);

    /// Re-render with no delta. The instance pulls fresh values itself.
    fn force_rerender(&self);
}

/// A sink that does nothing, for headless subscribers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl RenderSink for NoopSink {
    fn apply_delta(&self, _delta: &PartialState, _should_render: bool) {}
    fn force_rerender(&self) {}
}

/// Keys of another module a subscriber reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectKeys {
    All,
    Keys(Vec<String>),
}

impl ConnectKeys {
    pub fn keys(keys: &[&str]) -> Self {
        ConnectKeys::Keys(keys.iter().map(|k| k.to_string()).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            ConnectKeys::All => true,
            ConnectKeys::Keys(keys) => keys.iter().any(|k| k == key),
        }
    }

    /// Restrict `state` to these keys.
    pub fn select(&self, state: &PartialState) -> PartialState {
        state
            .iter()
            .filter(|(k, _)| self.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Record of a delta that reached a subscriber, consumed by effect triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    pub module: String,
    pub keys: Vec<String>,
}

// ============================================================================
// SubscriberSpec
// ============================================================================

/// Declarations of a subscriber, given at mount.
#[derive(Debug, Clone)]
pub struct SubscriberSpec {
    pub(crate) class_key: String,
    pub(crate) key: Option<String>,
    pub(crate) module: String,
    pub(crate) render_key: Option<String>,
    pub(crate) render_key_classes: Vec<String>,
    pub(crate) stored_keys: Vec<String>,
    pub(crate) persist_stored_keys: bool,
    pub(crate) private_state: PartialState,
    pub(crate) connect: BTreeMap<String, ConnectKeys>,
    pub(crate) computed: Vec<ComputedDef>,
    pub(crate) watch: Vec<WatchDef>,
}

impl SubscriberSpec {
    /// A subscriber of class `class_key` owned by `module`.
    pub fn new(class_key: &str, module: &str) -> Self {
        Self {
            class_key: class_key.to_string(),
            key: None,
            module: module.to_string(),
            render_key: None,
            render_key_classes: Vec::new(),
            stored_keys: Vec::new(),
            persist_stored_keys: false,
            private_state: PartialState::new(),
            connect: BTreeMap::new(),
            computed: Vec::new(),
            watch: Vec::new(),
        }
    }

    /// Instance key; the id becomes `"<class_key>$<key>"`.
    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn render_key(mut self, render_key: &str) -> Self {
        self.render_key = Some(render_key.to_string());
        self
    }

    /// Classes a render key committed by this subscriber applies to during
    /// broadcast, besides its own. `"*"` means every class.
    pub fn render_key_classes(mut self, classes: &[&str]) -> Self {
        self.render_key_classes = classes.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Keys kept in the subscriber-local cache, and written to durable
    /// storage when `persist` is set.
    pub fn stored_keys(mut self, keys: &[&str], persist: bool) -> Self {
        self.stored_keys = keys.iter().map(|k| k.to_string()).collect();
        self.persist_stored_keys = persist;
        self
    }

    /// Local fields that never reach the store.
    pub fn private_state(mut self, state: PartialState) -> Self {
        self.private_state = state;
        self
    }

    pub fn connect(mut self, module: &str, keys: ConnectKeys) -> Self {
        self.connect.insert(module.to_string(), keys);
        self
    }

    pub fn computed(mut self, def: ComputedDef) -> Self {
        self.computed.push(def);
        self
    }

    pub fn watch(mut self, def: WatchDef) -> Self {
        self.watch.push(def);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Fill declaration settings left unset with the engine defaults.
    pub(crate) fn resolve_defaults(&mut self, config: &RippleConfig) {
        for def in &mut self.computed {
            def.compare
                .get_or_insert_with(|| Compare::from_flag(config.computed_compare));
        }
        for def in &mut self.watch {
            def.compare
                .get_or_insert_with(|| Compare::from_flag(config.watch_compare));
            def.immediate.get_or_insert(config.watch_immediate);
        }
    }

    pub(crate) fn resolve_id(&self) -> SubscriberId {
        match &self.key {
            Some(key) => SubscriberId::new(&self.class_key, key),
            None => SubscriberId::generate(&self.class_key),
        }
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// One mounted UI instance.
///
/// Declarations are fixed at mount. The mutable part (materialized state,
/// connected views, computed cache, applied records) sits behind one
/// mutex, which is never held while user callbacks or the sink run.
pub struct Subscriber {
    id: SubscriberId,
    spec: SubscriberSpec,
    sink: Arc<dyn RenderSink>,
    mounted: AtomicBool,
    inner: Mutex<SubscriberState>,
}

#[derive(Default)]
struct SubscriberState {
    state: PartialState,
    connected: HashMap<String, PartialState>,
    computed: HashMap<(String, String), ComputedCell>,
    applied: Vec<AppliedRecord>,
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriberId,
        spec: SubscriberSpec,
        sink: Arc<dyn RenderSink>,
        state: PartialState,
        connected: HashMap<String, PartialState>,
    ) -> Self {
        Self {
            id,
            spec,
            sink,
            mounted: AtomicBool::new(true),
            inner: Mutex::new(SubscriberState {
                state,
                connected,
                ..Default::default()
            }),
        }
    }

    /// A mounted subscriber outside any engine, for exercising the
    /// computed and watch engines directly.
    #[cfg(test)]
    pub(crate) fn detached(spec: SubscriberSpec) -> Self {
        let id = spec.resolve_id();
        Self::new(id, spec, Arc::new(NoopSink), PartialState::new(), HashMap::new())
    }

    // ====================================================================
    // Declarations
    // ====================================================================

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    pub fn class_key(&self) -> &str {
        &self.spec.class_key
    }

    pub fn module(&self) -> &str {
        &self.spec.module
    }

    pub fn render_key(&self) -> Option<&str> {
        self.spec.render_key.as_deref()
    }

    pub fn render_key_classes(&self) -> &[String] {
        &self.spec.render_key_classes
    }

    pub fn stored_keys(&self) -> &[String] {
        &self.spec.stored_keys
    }

    pub fn persist_stored_keys(&self) -> bool {
        self.spec.persist_stored_keys
    }

    pub fn connections(&self) -> &BTreeMap<String, ConnectKeys> {
        &self.spec.connect
    }

    pub fn computed_defs(&self) -> &[ComputedDef] {
        &self.spec.computed
    }

    pub fn watch_defs(&self) -> &[WatchDef] {
        &self.spec.watch
    }

    pub(crate) fn sink(&self) -> &Arc<dyn RenderSink> {
        &self.sink
    }

    // ====================================================================
    // Lifecycle
    // ====================================================================

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unmounted(&self) {
        self.mounted.store(false, Ordering::Release);
    }

    // ====================================================================
    // Materialized state
    // ====================================================================

    /// Current local state (module keys plus private fields).
    pub fn state(&self) -> PartialState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Injected view of a connected module.
    pub fn connected_state(&self, module: &str) -> Option<PartialState> {
        self.inner.lock().unwrap().connected.get(module).cloned()
    }

    /// Cached value of a computed declaration.
    pub fn computed_value(&self, module: &str, name: &str) -> Option<Value> {
        self.computed_cell(module, name).map(|c| c.value)
    }

    /// Records applied since the last drain, oldest first.
    pub fn applied(&self) -> Vec<AppliedRecord> {
        self.inner.lock().unwrap().applied.clone()
    }

    /// Take every pending applied record.
    pub fn drain_applied(&self) -> Vec<AppliedRecord> {
        std::mem::take(&mut self.inner.lock().unwrap().applied)
    }

    pub(crate) fn merge_state(&self, delta: &PartialState) {
        merge_into(&mut self.inner.lock().unwrap().state, delta);
    }

    pub(crate) fn record_applied(&self, module: &str, keys: Vec<String>) {
        self.inner.lock().unwrap().applied.push(AppliedRecord {
            module: module.to_string(),
            keys,
        });
    }

    /// Refresh the injected view of `module` from its full state.
    pub(crate) fn reinject_connected_state(&self, module: &str, module_state: &PartialState) {
        let Some(keys) = self.spec.connect.get(module) else {
            return;
        };
        let view = keys.select(module_state);
        self.inner
            .lock()
            .unwrap()
            .connected
            .insert(module.to_string(), view);
    }

    pub(crate) fn computed_cell(&self, module: &str, name: &str) -> Option<ComputedCell> {
        self.inner
            .lock()
            .unwrap()
            .computed
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    pub(crate) fn set_computed_cell(&self, module: &str, name: &str, cell: ComputedCell) {
        self.inner
            .lock()
            .unwrap()
            .computed
            .insert((module.to_string(), name.to_string()), cell);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("module", &self.spec.module)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

/// Sink that records every call, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) deltas: Mutex<Vec<(PartialState, bool)>>,
    pub(crate) rerenders: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RenderSink for RecordingSink {
    fn apply_delta(&self, delta: &PartialState, should_render: bool) {
        self.deltas.lock().unwrap().push((delta.clone(), should_render));
    }

    fn force_rerender(&self) {
        self.rerenders.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> PartialState {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn spec_builds_id_from_key() {
        let spec = SubscriberSpec::new("Counter", "counter").key("left");
        assert_eq!(spec.resolve_id().as_str(), "Counter$left");
    }

    #[test]
    fn spec_without_key_generates_id() {
        let spec = SubscriberSpec::new("Counter", "counter");
        assert!(spec.resolve_id().as_str().starts_with("Counter$"));
    }

    #[test]
    fn resolve_defaults_fills_only_unset() {
        let config = RippleConfig {
            watch_immediate: true,
            computed_compare: false,
            ..Default::default()
        };
        let mut spec = SubscriberSpec::new("Panel", "panel")
            .computed(crate::computed::ComputedDef::new("counter", "c", &[], |_| json!(0)))
            .watch(crate::watch::WatchDef::new("counter", &[], |_| None))
            .watch(crate::watch::WatchDef::new("counter", &[], |_| None).immediate(false));
        spec.resolve_defaults(&config);

        assert!(matches!(spec.computed[0].compare, Some(Compare::Always)));
        assert_eq!(spec.watch[0].immediate, Some(true));
        assert_eq!(spec.watch[1].immediate, Some(false));
        assert!(matches!(spec.watch[0].compare, Some(Compare::Value)));
    }

    #[test]
    fn connect_keys_select() {
        let state = obj(json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(ConnectKeys::keys(&["a", "c"]).select(&state), obj(json!({"a": 1, "c": 3})));
        assert_eq!(ConnectKeys::All.select(&state), state);
    }

    #[test]
    fn applied_records_drain() {
        let sub = Subscriber::detached(SubscriberSpec::new("Counter", "counter"));
        sub.record_applied("counter", vec!["count".into()]);
        sub.record_applied("user", vec!["name".into()]);

        assert_eq!(sub.applied().len(), 2);
        let drained = sub.drain_applied();
        assert_eq!(drained[0].module, "counter");
        assert_eq!(drained[1].keys, vec!["name"]);
        assert!(sub.applied().is_empty());
    }

    #[test]
    fn reinject_uses_connect_keys() {
        let spec = SubscriberSpec::new("Panel", "panel").connect("user", ConnectKeys::keys(&["name"]));
        let sub = Subscriber::detached(spec);
        sub.reinject_connected_state("user", &obj(json!({"name": "x", "age": 3})));
        assert_eq!(sub.connected_state("user").unwrap(), obj(json!({"name": "x"})));

        // Not connected: ignored.
        sub.reinject_connected_state("counter", &obj(json!({"count": 1})));
        assert!(sub.connected_state("counter").is_none());
    }

    #[test]
    fn unmount_flag() {
        let sub = Subscriber::detached(SubscriberSpec::new("Counter", "counter"));
        assert!(sub.is_mounted());
        sub.mark_unmounted();
        assert!(!sub.is_mounted());
    }

    #[test]
    fn merge_state_overwrites() {
        let sub = Subscriber::detached(SubscriberSpec::new("Counter", "counter"));
        sub.merge_state(&obj(json!({"count": 1, "draft": "a"})));
        sub.merge_state(&obj(json!({"count": 2})));
        assert_eq!(sub.state(), obj(json!({"count": 2, "draft": "a"})));
    }
}
