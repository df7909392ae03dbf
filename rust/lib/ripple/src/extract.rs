use crate::value::PartialState;

/// Result of splitting a state object by a key set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extracted {
    pub partial_state: PartialState,
    pub is_state_empty: bool,
}

/// Split `state` by `keys`.
///
/// With `shared_only` the result holds the keys of `state` that are in
/// `keys` (the portion destined for the store). Without it the complement
/// is returned: the keys *not* in `keys`, e.g. purely local fields.
/// The input is never mutated.
pub fn extract_by_keys<S: AsRef<str>>(state: &PartialState, keys: &[S], shared_only: bool) -> Extracted {
    let mut partial_state = PartialState::new();
    for (k, v) in state {
        let known = keys.iter().any(|key| key.as_ref() == k);
        if known == shared_only {
            partial_state.insert(k.clone(), v.clone());
        }
    }
    let is_state_empty = partial_state.is_empty();
    Extracted {
        partial_state,
        is_state_empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn obj(v: Value) -> PartialState {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn shared_subset() {
        let s = obj(json!({"count": 1, "draft": "x"}));
        let r = extract_by_keys(&s, &["count"], true);
        assert_eq!(Value::Object(r.partial_state), json!({"count": 1}));
        assert!(!r.is_state_empty);
    }

    #[test]
    fn complement() {
        let s = obj(json!({"count": 1, "draft": "x"}));
        let r = extract_by_keys(&s, &["count"], false);
        assert_eq!(Value::Object(r.partial_state), json!({"draft": "x"}));
    }

    #[test]
    fn empty_when_nothing_matches() {
        let s = obj(json!({"draft": "x"}));
        let r = extract_by_keys(&s, &["count"], true);
        assert!(r.is_state_empty);
        assert!(r.partial_state.is_empty());
    }

    #[test]
    fn empty_key_set() {
        let s = obj(json!({"a": 1}));
        let keys: [&str; 0] = [];
        assert!(extract_by_keys(&s, &keys, true).is_state_empty);
        assert_eq!(extract_by_keys(&s, &keys, false).partial_state, s);
    }

    #[test]
    fn input_is_not_mutated() {
        let s = obj(json!({"a": 1, "b": 2}));
        let before = s.clone();
        let _ = extract_by_keys(&s, &["a"], true);
        let _ = extract_by_keys(&s, &["a"], false);
        assert_eq!(s, before);
    }

    #[test]
    fn extraction_is_idempotent() {
        let s = obj(json!({"a": 1, "b": [1, 2], "c": {"d": null}, "e": "x"}));
        let keys = vec!["a".to_string(), "c".to_string(), "zzz".to_string()];
        let once = extract_by_keys(&s, &keys, true).partial_state;
        let twice = extract_by_keys(&once, &keys, true).partial_state;
        assert_eq!(once, twice);
    }
}
