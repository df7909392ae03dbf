use tracing::{debug, warn};

use crate::error::RippleError;
use crate::store::Store;
use crate::value::{MODULE_VOID, PartialState};

/// Validate a module name and its initial state before registration.
///
/// A name must be non-empty and free of `/` and whitespace. With
/// `must_not_exist` an already-registered module is a duplicate.
pub fn check_module_name_and_state(store: &Store, module: &str, must_not_exist: bool) -> Result<(), RippleError> {
    if module.is_empty() || module.contains('/') || module.chars().any(char::is_whitespace) {
        return Err(RippleError::InvalidModuleName(module.to_string()));
    }
    if must_not_exist && store.has_module(module) {
        return Err(RippleError::DuplicateModule(module.to_string()));
    }
    Ok(())
}

/// Decide whether a registration error is fatal.
///
/// In hot-reload mode a duplicate is most likely the same declaration
/// being evaluated again, so it is downgraded to a warning. Everything
/// else is returned unchanged.
pub fn guess_duplicate(err: RippleError, name: &str, tag: &str, hot: bool) -> Result<(), RippleError> {
    if hot && err.is_duplicate() {
        warn!(name, tag, "duplicate {tag} registration ignored in hot mode: {err}");
        return Ok(());
    }
    Err(err)
}

/// Register a module and its initial state.
///
/// `$$void` never holds state, whatever is passed. Root state, the prev
/// snapshot, the key registration record and the recognized key list are
/// all written together.
pub fn init_module_state(
    store: &Store,
    module: &str,
    state: PartialState,
    must_not_exist: bool,
    hot: bool,
) -> Result<(), RippleError> {
    let state = if module == MODULE_VOID {
        PartialState::new()
    } else {
        state
    };

    if let Err(err) = check_module_name_and_state(store, module, must_not_exist) {
        guess_duplicate(err, module, "module", hot)?;
    }

    debug!(module, keys = state.len(), "module registered");
    store.install_module(module, state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MODULE_GLOBAL;
    use serde_json::{Value, json};

    fn obj(v: Value) -> PartialState {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn registers_module() {
        let store = Store::new();
        init_module_state(&store, "counter", obj(json!({"count": 0})), true, false).unwrap();
        assert_eq!(store.get_state("counter").unwrap()["count"], json!(0));
        assert_eq!(store.get_state_ver("counter").get("count"), Some(&1));
        assert_eq!(store.state_keys("counter"), vec!["count"]);
    }

    #[test]
    fn void_module_is_forced_empty() {
        let store = Store::new();
        init_module_state(&store, MODULE_VOID, obj(json!({"x": 1})), true, false).unwrap();
        assert!(store.get_state(MODULE_VOID).unwrap().is_empty());
        assert!(store.state_keys(MODULE_VOID).is_empty());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let store = Store::new();
        for name in ["", "a/b", "has space"] {
            let err = init_module_state(&store, name, PartialState::new(), true, false).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_MODULE_NAME");
        }
    }

    #[test]
    fn duplicate_is_fatal_outside_hot_mode() {
        let store = Store::new();
        init_module_state(&store, "counter", obj(json!({"count": 0})), true, false).unwrap();
        let err = init_module_state(&store, "counter", obj(json!({"count": 5})), true, false).unwrap_err();
        assert!(matches!(err, RippleError::DuplicateModule(ref m) if m == "counter"));
        assert_eq!(store.get_state("counter").unwrap()["count"], json!(0));
    }

    #[test]
    fn duplicate_is_warning_in_hot_mode() {
        let store = Store::new();
        init_module_state(&store, "counter", obj(json!({"count": 0})), true, true).unwrap();
        init_module_state(&store, "counter", obj(json!({"count": 5})), true, true).unwrap();
        assert_eq!(store.get_state("counter").unwrap()["count"], json!(5));
    }

    #[test]
    fn re_init_allowed_when_existence_not_required() {
        let store = Store::new();
        init_module_state(&store, MODULE_GLOBAL, obj(json!({"a": 1})), true, false).unwrap();
        init_module_state(&store, MODULE_GLOBAL, obj(json!({"b": 2})), false, false).unwrap();
        assert_eq!(store.state_keys(MODULE_GLOBAL), vec!["a", "b"]);
    }

    #[test]
    fn hot_mode_never_hides_invalid_names() {
        let err = guess_duplicate(RippleError::InvalidModuleName("a/b".into()), "a/b", "module", true)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MODULE_NAME");
    }
}
