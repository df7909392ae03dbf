use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Custom equality predicate: returns true when the two values are equal.
pub type EqFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// How computed and watch declarations decide that a value changed.
#[derive(Clone)]
pub enum Compare {
    /// Changed when the values differ.
    Value,
    /// Every re-evaluation counts as a change.
    Always,
    /// Changed when the predicate reports the values unequal.
    Custom(EqFn),
}

impl Compare {
    /// The engine default for a `*_compare` config flag.
    pub fn from_flag(compare: bool) -> Self {
        if compare { Compare::Value } else { Compare::Always }
    }

    /// Whether `old -> new` is a change. A missing old value always is.
    pub fn changed(&self, old: Option<&Value>, new: &Value) -> bool {
        let Some(old) = old else {
            return true;
        };
        match self {
            Compare::Value => old != new,
            Compare::Always => true,
            Compare::Custom(eq) => !eq(old, new),
        }
    }
}

impl fmt::Debug for Compare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compare::Value => f.write_str("Value"),
            Compare::Always => f.write_str("Always"),
            Compare::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_compare() {
        let c = Compare::Value;
        assert!(!c.changed(Some(&json!(1)), &json!(1)));
        assert!(c.changed(Some(&json!(1)), &json!(2)));
        assert!(c.changed(None, &json!(1)));
    }

    #[test]
    fn always_compare() {
        assert!(Compare::Always.changed(Some(&json!(1)), &json!(1)));
    }

    #[test]
    fn custom_compare() {
        // Equal when both are numbers within 0.5 of each other.
        let c = Compare::Custom(Arc::new(|a, b| match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() < 0.5,
            _ => a == b,
        }));
        assert!(!c.changed(Some(&json!(1.0)), &json!(1.2)));
        assert!(c.changed(Some(&json!(1.0)), &json!(2.0)));
    }

    #[test]
    fn from_flag() {
        assert!(matches!(Compare::from_flag(true), Compare::Value));
        assert!(matches!(Compare::from_flag(false), Compare::Always));
    }
}
