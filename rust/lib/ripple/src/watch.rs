use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::compare::Compare;
use crate::envelope::CallInfo;
use crate::subscriber::Subscriber;
use crate::value::PartialState;

/// Watch callback. The return value is a re-render hint:
/// `Some(true)` forces a re-render, `Some(false)` vetoes the default one,
/// `None` leaves the decision alone. A force beats a veto.
pub type WatchFn = Arc<dyn Fn(&WatchEvent<'_>) -> Option<bool> + Send + Sync>;

/// One observed key change.
pub struct WatchEvent<'a> {
    pub module: &'a str,
    pub key: &'a str,
    pub new_value: &'a Value,
    /// `None` on the first (immediate) firing or when the key is new.
    pub old_value: Option<&'a Value>,
    pub info: &'a CallInfo,
}

/// A callback bound to keys of one module.
#[derive(Clone)]
pub struct WatchDef {
    pub(crate) module: String,
    /// Watched keys. Empty means every key of the module.
    pub(crate) keys: Vec<String>,
    pub(crate) immediate: Option<bool>,
    pub(crate) compare: Option<Compare>,
    pub(crate) callback: WatchFn,
}

impl WatchDef {
    pub fn new<F>(module: &str, keys: &[&str], callback: F) -> Self
    where
        F: Fn(&WatchEvent<'_>) -> Option<bool> + Send + Sync + 'static,
    {
        Self {
            module: module.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            immediate: None,
            compare: None,
            callback: Arc::new(callback),
        }
    }

    /// Fire once at mount with the current value.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn compare(mut self, compare: Compare) -> Self {
        self.compare = Some(compare);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    fn watched<'s>(&'s self, state: &'s PartialState) -> Vec<&'s str> {
        if self.keys.is_empty() {
            state.keys().map(String::as_str).collect()
        } else {
            self.keys
                .iter()
                .map(String::as_str)
                .filter(|k| state.contains_key(*k))
                .collect()
        }
    }
}

impl fmt::Debug for WatchDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchDef")
            .field("module", &self.module)
            .field("keys", &self.keys)
            .field("immediate", &self.immediate)
            .field("compare", &self.compare)
            .finish()
    }
}

/// Run the subscriber's watchers on `module` for the keys in `new_state`.
///
/// Each watched key that changed between `prev_state` and `new_state`
/// fires its callback with `(new, old, info)`. Returns whether the
/// subscriber should re-render: `default_render` unless a callback
/// forced or vetoed it.
pub fn watch_key_for_ref(
    sub: &Subscriber,
    module: &str,
    prev_state: &PartialState,
    new_state: &PartialState,
    info: &CallInfo,
    default_render: bool,
) -> bool {
    let mut forced = false;
    let mut vetoed = false;

    for def in sub.watch_defs().iter().filter(|d| d.module == module) {
        let compare = def.compare.clone().unwrap_or(Compare::Value);
        for key in def.watched(new_state) {
            let new_value = &new_state[key];
            let old_value = prev_state.get(key);
            if !compare.changed(old_value, new_value) {
                continue;
            }
            let hint = (def.callback)(&WatchEvent {
                module,
                key,
                new_value,
                old_value,
                info,
            });
            debug!(subscriber = %sub.id(), module, key, ?hint, "watcher fired");
            match hint {
                Some(true) => forced = true,
                Some(false) => vetoed = true,
                None => {}
            }
        }
    }

    forced || (default_render && !vetoed)
}

/// Fire the immediate watchers of a freshly mounted subscriber.
///
/// `module_state` resolves the current state of a watched module.
pub(crate) fn fire_immediate<F>(sub: &Subscriber, module_state: F, info: &CallInfo)
where
    F: Fn(&str) -> PartialState,
{
    for def in sub.watch_defs().iter().filter(|d| d.immediate == Some(true)) {
        let state = module_state(&def.module);
        for key in def.watched(&state) {
            (def.callback)(&WatchEvent {
                module: &def.module,
                key,
                new_value: &state[key],
                old_value: None,
                info,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::SubscriberSpec;
    use serde_json::json;
    use std::sync::Mutex;

    fn obj(v: Value) -> PartialState {
        v.as_object().cloned().unwrap()
    }

    fn subscriber_with(defs: Vec<WatchDef>) -> Subscriber {
        let mut spec = SubscriberSpec::new("Panel", "counter");
        for d in defs {
            spec = spec.watch(d);
        }
        Subscriber::detached(spec)
    }

    type Seen = Arc<Mutex<Vec<(String, Value, Option<Value>)>>>;

    fn recorder(seen: &Seen, hint: Option<bool>) -> impl Fn(&WatchEvent<'_>) -> Option<bool> + Send + Sync + 'static {
        let seen = seen.clone();
        move |e| {
            seen.lock()
                .unwrap()
                .push((e.key.to_string(), e.new_value.clone(), e.old_value.cloned()));
            hint
        }
    }

    // ========================================================================
    // Firing
    // ========================================================================

    #[test]
    fn fires_on_change_with_old_and_new() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![WatchDef::new("counter", &["count"], recorder(&seen, None))]);

        let render = watch_key_for_ref(&sub, "counter", &obj(json!({"count": 1})), &obj(json!({"count": 2})), &CallInfo::default(), true);
        assert!(render);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("count".to_string(), json!(2), Some(json!(1)))]);
    }

    #[test]
    fn unchanged_key_does_not_fire() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![WatchDef::new("counter", &["count"], recorder(&seen, Some(true)))]);

        let render = watch_key_for_ref(&sub, "counter", &obj(json!({"count": 1})), &obj(json!({"count": 1})), &CallInfo::default(), false);
        assert!(!render);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn always_compare_fires_on_equal_values() {
        let seen: Seen = Default::default();
        let def = WatchDef::new("counter", &["count"], recorder(&seen, None)).compare(Compare::Always);
        let sub = subscriber_with(vec![def]);

        watch_key_for_ref(&sub, "counter", &obj(json!({"count": 1})), &obj(json!({"count": 1})), &CallInfo::default(), true);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_keys_watch_everything() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![WatchDef::new("counter", &[], recorder(&seen, None))]);

        watch_key_for_ref(&sub, "counter", &PartialState::new(), &obj(json!({"a": 1, "b": 2})), &CallInfo::default(), true);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    // ========================================================================
    // Re-render hints
    // ========================================================================

    #[test]
    fn force_overrides_default() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![WatchDef::new("counter", &["count"], recorder(&seen, Some(true)))]);
        let render = watch_key_for_ref(&sub, "counter", &PartialState::new(), &obj(json!({"count": 2})), &CallInfo::default(), false);
        assert!(render);
    }

    #[test]
    fn veto_suppresses_default() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![WatchDef::new("counter", &["count"], recorder(&seen, Some(false)))]);
        let render = watch_key_for_ref(&sub, "counter", &PartialState::new(), &obj(json!({"count": 2})), &CallInfo::default(), true);
        assert!(!render);
    }

    #[test]
    fn force_beats_veto() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![
            WatchDef::new("counter", &["count"], recorder(&seen, Some(false))),
            WatchDef::new("counter", &["step"], recorder(&seen, Some(true))),
        ]);
        let render = watch_key_for_ref(
            &sub,
            "counter",
            &PartialState::new(),
            &obj(json!({"count": 2, "step": 3})),
            &CallInfo::default(),
            true,
        );
        assert!(render);
    }

    // ========================================================================
    // Immediate
    // ========================================================================

    #[test]
    fn immediate_fires_with_no_old_value() {
        let seen: Seen = Default::default();
        let sub = subscriber_with(vec![
            WatchDef::new("counter", &["count"], recorder(&seen, None)).immediate(true),
            WatchDef::new("counter", &["step"], recorder(&seen, None)),
        ]);

        fire_immediate(&sub, |_| obj(json!({"count": 7, "step": 1})), &CallInfo::default());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("count".to_string(), json!(7), None)]);
    }
}
