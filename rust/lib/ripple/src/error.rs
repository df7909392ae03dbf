use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these, never
// on the human-readable message string.

/// Stable error code constants.
pub mod error_code {
    pub const INVALID_COMMIT: &str = "INVALID_COMMIT";
    pub const INVALID_MODULE_NAME: &str = "INVALID_MODULE_NAME";
    pub const MODULE_DUPLICATE: &str = "MODULE_DUPLICATE";
    pub const MODULE_NOT_FOUND: &str = "MODULE_NOT_FOUND";
    pub const SUBSCRIBER_DUPLICATE: &str = "SUBSCRIBER_DUPLICATE";
    pub const SUBSCRIBER_NOT_FOUND: &str = "SUBSCRIBER_NOT_FOUND";
    pub const MIDDLEWARE_STALLED: &str = "MIDDLEWARE_STALLED";
    pub const MIDDLEWARE_TIMEOUT: &str = "MIDDLEWARE_TIMEOUT";
    pub const MIDDLEWARE: &str = "MIDDLEWARE";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const SERIALIZATION: &str = "SERIALIZATION";
    pub const CONFIG: &str = "CONFIG";
}

// ── RippleError ─────────────────────────────────────────────────────

/// Unified error type of the propagation engine.
///
/// Validation failures of a commit are normally recovered locally (warned
/// and dropped); they only surface as `InvalidCommit` in strict mode.
/// Registration problems and middleware failures always surface.
#[derive(Error, Debug)]
pub enum RippleError {
    /// Committed state is not a plain key-value object.
    #[error("committed state is not a plain json object: {0}")]
    InvalidCommit(String),

    #[error("invalid module name: {0:?}")]
    InvalidModuleName(String),

    /// Module registered twice.
    #[error("module {0:?} already exists")]
    DuplicateModule(String),

    #[error("module {0:?} not found")]
    ModuleNotFound(String),

    /// Two mounted subscribers share one id.
    #[error("subscriber {0} already mounted")]
    DuplicateSubscriber(String),

    #[error("subscriber {0} not found")]
    SubscriberNotFound(String),

    /// A middleware returned without advancing the chain.
    #[error("middleware chain halted before completion")]
    MiddlewareStalled,

    /// The middleware chain did not finish within the configured bound.
    #[error("middleware chain timed out after {0}ms")]
    MiddlewareTimeout(u64),

    /// Failure raised by a middleware itself.
    #[error("middleware failed: {0}")]
    Middleware(String),

    /// Durable storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),
}

impl RippleError {
    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            RippleError::InvalidCommit(_) => error_code::INVALID_COMMIT,
            RippleError::InvalidModuleName(_) => error_code::INVALID_MODULE_NAME,
            RippleError::DuplicateModule(_) => error_code::MODULE_DUPLICATE,
            RippleError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            RippleError::DuplicateSubscriber(_) => error_code::SUBSCRIBER_DUPLICATE,
            RippleError::SubscriberNotFound(_) => error_code::SUBSCRIBER_NOT_FOUND,
            RippleError::MiddlewareStalled => error_code::MIDDLEWARE_STALLED,
            RippleError::MiddlewareTimeout(_) => error_code::MIDDLEWARE_TIMEOUT,
            RippleError::Middleware(_) => error_code::MIDDLEWARE,
            RippleError::Storage(_) => error_code::STORAGE_ERROR,
            RippleError::Serialization(_) => error_code::SERIALIZATION,
            RippleError::Config(_) => error_code::CONFIG,
        }
    }

    /// Whether this is a duplicate-registration error, the kind the
    /// hot-reload guess may downgrade to a warning.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            RippleError::DuplicateModule(_) | RippleError::DuplicateSubscriber(_)
        )
    }
}

impl From<serde_json::Error> for RippleError {
    fn from(e: serde_json::Error) -> Self {
        RippleError::Serialization(e.to_string())
    }
}
