use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::compare::Compare;
use crate::envelope::CallInfo;
use crate::subscriber::Subscriber;
use crate::value::{PartialState, merge_into};

/// Derivation function of a computed declaration.
pub type ComputeFn = Arc<dyn Fn(&ComputeInput<'_>) -> Value + Send + Sync>;

/// What a derivation sees.
pub struct ComputeInput<'a> {
    /// Module state after the change (old state overlaid with the delta).
    pub new_state: &'a PartialState,
    /// Module state before the change.
    pub old_state: &'a PartialState,
    pub info: &'a CallInfo,
}

/// A value derived from keys of one module.
#[derive(Clone)]
pub struct ComputedDef {
    pub(crate) module: String,
    pub(crate) name: String,
    /// Keys the derivation reads. Empty means every key of the module.
    pub(crate) deps: Vec<String>,
    pub(crate) compare: Option<Compare>,
    pub(crate) compute: ComputeFn,
}

impl ComputedDef {
    pub fn new<F>(module: &str, name: &str, deps: &[&str], compute: F) -> Self
    where
        F: Fn(&ComputeInput<'_>) -> Value + Send + Sync + 'static,
    {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            compare: None,
            compute: Arc::new(compute),
        }
    }

    /// Override the engine's default comparator for this declaration.
    pub fn compare(mut self, compare: Compare) -> Self {
        self.compare = Some(compare);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    fn reads_any(&self, changed: &PartialState) -> bool {
        self.deps.is_empty() || self.deps.iter().any(|k| changed.contains_key(k))
    }

    fn inputs(&self, state: &PartialState) -> Vec<Value> {
        if self.deps.is_empty() {
            return state.values().cloned().collect();
        }
        self.deps
            .iter()
            .map(|k| state.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl fmt::Debug for ComputedDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedDef")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("compare", &self.compare)
            .finish()
    }
}

/// Cached result of one computed declaration on one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ComputedCell {
    inputs: Vec<Value>,
    pub(crate) value: Value,
}

/// Re-evaluate the subscriber's computed declarations on `module`.
///
/// Only declarations reading a key present in `new_state` run. A
/// declaration whose inputs equal the cached inputs is not evaluated again
/// and reports no change, so repeating a call with identical states yields
/// an empty delta. Returns the changed computed values keyed by
/// declaration name.
pub fn compute_value_for_ref(
    sub: &Subscriber,
    module: &str,
    prev_state: &PartialState,
    new_state: &PartialState,
    info: &CallInfo,
) -> PartialState {
    let mut delta = PartialState::new();
    let defs: Vec<&ComputedDef> = sub
        .computed_defs()
        .iter()
        .filter(|d| d.module == module && d.reads_any(new_state))
        .collect();
    if defs.is_empty() {
        return delta;
    }

    let mut merged = prev_state.clone();
    merge_into(&mut merged, new_state);

    for def in defs {
        let inputs = def.inputs(&merged);
        let cached = sub.computed_cell(module, &def.name);

        if cached.as_ref().is_some_and(|cell| cell.inputs == inputs) {
            continue;
        }

        let value = (def.compute)(&ComputeInput {
            new_state: &merged,
            old_state: prev_state,
            info,
        });
        let compare = def.compare.clone().unwrap_or(Compare::Value);
        let changed = compare.changed(cached.as_ref().map(|c| &c.value), &value);
        if changed {
            debug!(subscriber = %sub.id(), module, computed = %def.name, "computed value changed");
            delta.insert(def.name.clone(), value.clone());
        }
        sub.set_computed_cell(module, &def.name, ComputedCell { inputs, value });
    }

    delta
}

/// Evaluate every computed declaration on `module` once against `state`
/// to seed the cache. Nothing counts as changed.
pub(crate) fn seed_computed(sub: &Subscriber, module: &str, state: &PartialState, info: &CallInfo) {
    for def in sub.computed_defs().iter().filter(|d| d.module == module) {
        let value = (def.compute)(&ComputeInput {
            new_state: state,
            old_state: state,
            info,
        });
        sub.set_computed_cell(
            module,
            &def.name,
            ComputedCell {
                inputs: def.inputs(state),
                value,
            },
        );
    }
}
