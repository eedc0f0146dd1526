// ── Aviary Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants follow the runtime's failure taxonomy: user mistakes are never
//     retried, backpressure is always retryable, provider/tool failures are
//     split into retryable vs permanent, corruption is quarantined per-row.
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (API keys, tokens) in its message.

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

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Invalid command, argument, or reference (unknown @bot / #room).
    /// Surfaced verbatim, never retried.
    #[error("{0}")]
    User(String),

    /// Tool or action not allowed for this bot or room.
    #[error("Permission denied: {bot} may not {action}")]
    PermissionDenied { bot: String, action: String },

    /// Queue / room / provider backpressure. The connector retries or paces.
    #[error("Busy: {resource} is at capacity")]
    Busy { resource: String },

    /// Transient provider failure (timeout, 429, 5xx, network reset).
    #[error("Provider error (retryable): {provider}: {message}")]
    ProviderRetryable { provider: String, message: String },

    /// Permanent provider failure (4xx, schema violation).
    #[error("Provider error: {provider}: {message}")]
    ProviderPermanent { provider: String, message: String },

    /// Transient tool failure.
    #[error("Tool error (retryable): {tool}: {message}")]
    ToolRetryable { tool: String, message: String },

    /// Permanent tool failure.
    #[error("Tool error: {tool}: {message}")]
    ToolPermanent { tool: String, message: String },

    /// Unreadable row, missing parent, broken chain. The affected row is
    /// quarantined and skipped; the agent loop never crashes on this.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Injection detector tripped or credential found in content.
    #[error("Security flag: {0}")]
    Security(String),

    /// Engine or bot configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation aborted by a room-level cancel.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// OS keychain / credential store failure.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn denied(bot: impl Into<String>, action: impl Into<String>) -> Self {
        Self::PermissionDenied { bot: bot.into(), action: action.into() }
    }

    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy { resource: resource.into() }
    }

    pub fn provider_retryable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderRetryable { provider: provider.into(), message: message.into() }
    }

    pub fn provider_permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderPermanent { provider: provider.into(), message: message.into() }
    }

    pub fn tool_retryable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolRetryable { tool: tool.into(), message: message.into() }
    }

    pub fn tool_permanent(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolPermanent { tool: tool.into(), message: message.into() }
    }

    /// Whether the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Busy { .. }
                | EngineError::ProviderRetryable { .. }
                | EngineError::ToolRetryable { .. }
        )
    }

    /// CLI process exit code for this error.
    /// 0 success, 2 invalid usage, 3 permission denied, 4 precondition failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::User(_) | EngineError::Config(_) => 2,
            EngineError::PermissionDenied { .. } | EngineError::Security(_) => 3,
            _ => 4,
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(EngineError::busy("room #general").is_retryable());
        assert!(EngineError::provider_retryable("openai", "503").is_retryable());
        assert!(!EngineError::provider_permanent("openai", "400").is_retryable());
        assert!(!EngineError::user("unknown bot @zzz").is_retryable());
        assert!(!EngineError::denied("coder", "delete_file").is_retryable());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(EngineError::user("bad args").exit_code(), 2);
        assert_eq!(EngineError::denied("coder", "exec").exit_code(), 3);
        assert_eq!(EngineError::busy("queue").exit_code(), 4);
    }
}
