use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RippleError;

/// Engine-wide runtime configuration.
///
/// Read once by `RippleBuilder::build`; never mutated during propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RippleConfig {
    /// Return `InvalidCommit` for malformed commits instead of warning.
    pub strict: bool,

    /// Hot-reload mode. Duplicate module and subscriber registrations are
    /// downgraded to warnings.
    pub hot: bool,

    /// Default comparator for computed declarations: compare by value when
    /// true, treat every re-evaluation as a change when false.
    pub computed_compare: bool,

    /// Default comparator for watch declarations.
    pub watch_compare: bool,

    /// Default `immediate` flag for watch declarations that leave it unset.
    pub watch_immediate: bool,

    /// Prefix of durable storage keys: `"<prefix>_<subscriber id>"`.
    pub storage_prefix: String,

    /// Bounded-wait variant of the middleware chain. `None` keeps the
    /// unbounded behavior: a halted chain stalls its commit forever.
    pub middleware_timeout_ms: Option<u64>,

    /// Names of registered middlewares, in execution order.
    pub middlewares: Vec<String>,
}

impl Default for RippleConfig {
    fn default() -> Self {
        Self {
            strict: false,
            hot: false,
            computed_compare: true,
            watch_compare: true,
            watch_immediate: false,
            storage_prefix: "CCSS".to_string(),
            middleware_timeout_ms: None,
            middlewares: Vec::new(),
        }
    }
}

impl RippleConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, RippleError> {
        serde_json::from_str(s).map_err(|e| RippleError::Config(e.to_string()))
    }

    /// Load configuration from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, RippleError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RippleError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let c = RippleConfig::default();
        assert!(!c.strict);
        assert!(c.computed_compare);
        assert!(c.watch_compare);
        assert!(!c.watch_immediate);
        assert_eq!(c.storage_prefix, "CCSS");
        assert!(c.middleware_timeout_ms.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = RippleConfig::from_json_str(r#"{"strict": true, "middlewares": ["log"]}"#).unwrap();
        assert!(c.strict);
        assert_eq!(c.middlewares, vec!["log".to_string()]);
        assert!(c.watch_compare);
    }

    #[test]
    fn timeout_is_read_in_milliseconds() {
        let c = RippleConfig::from_json_str(r#"{"middleware_timeout_ms": 250}"#).unwrap();
        assert_eq!(c.middleware_timeout_ms, Some(250));
    }

    #[test]
    fn bad_json_is_config_error() {
        let err = RippleConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"hot": true, "storage_prefix": "APP"}}"#).unwrap();

        let c = RippleConfig::from_path(file.path()).unwrap();
        assert!(c.hot);
        assert_eq!(c.storage_prefix, "APP");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = RippleConfig::from_path(Path::new("/nonexistent/ripple.json")).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG");
    }
}
