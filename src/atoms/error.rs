// ── Cojoin Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the crate, built with `thiserror`.
//
// Design rules:
//   • Variants follow the failure taxonomy: transport, policy, security,
//     invariant. Callers branch on the variant, never on the message.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (session secrets, CAPTCHA secrets,
//     relay keys) in its message.
//   • User-facing surfaces never render these messages verbatim; they show
//     the fixed strings in `atoms::constants`.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A remote endpoint answered, but not with something usable
    /// (non-2xx, timeout, unparseable body).
    #[error("Transport error: {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// A fetched resource violated loading policy (content type, origin,
    /// missing root node).
    #[error("Policy rejection: {0}")]
    Policy(String),

    /// Anti-automation or authentication failure. Fatal for the session.
    #[error("Security error: {0}")]
    Security(String),

    /// A lifecycle call arrived in a state where it has no meaning.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound HTTP request on the site server.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a transport error for a named endpoint.
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport { endpoint: endpoint.into(), message: message.into() }
    }

    /// Security rejections end the session; everything else may be retried.
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All fallible operations in the crate return this type.
pub type EngineResult<T> = Result<T, EngineError>;
