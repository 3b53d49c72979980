/// Store or queue error with retry classification.
///
/// Providers return this to tell the engine whether the failed operation can
/// be attempted again.
///
/// **Retryable**: database busy/locked, connection timeouts, pool exhaustion.
///
/// **Permanent**: malformed rows, undecodable message bodies, a guarded write
/// whose row vanished.
///
/// ```rust,no_run
/// use courier::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("dequeue", "database is locked"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "dequeue", "update_run_status")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Transient error that might succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Error that won't succeed on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
