//! Shared fallible-call error type for the KV state plane.

/// Transient failure kind a caller needs to match on to decide how to
/// degrade, rather than abort the request.
///
/// Logged by the caller at the point it's handled and paired with a
/// `{component}_errors_{kind}`-shaped metric increment via [`CoreError::kind`]
/// — see the error handling notes in SPEC_FULL.md §7.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("kv error: {0}")]
    Kv(#[from] redis::RedisError),
}

impl CoreError {
    /// The `{kind}` half of a `{component}_errors_{kind}` metric name.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Kv(e) if e.is_timeout() => "timeout",
            CoreError::Kv(_) => "request",
        }
    }
}
