use thiserror::Error;

/// Main error type for the meta-evaluation engine
#[derive(Error, Debug)]
pub enum MetablendError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid engine configuration or a reference to an unknown agent.
    /// The only taxonomy member that propagates as a hard failure.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Input availability errors (recovered by degrading to cached state)
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Cold-start: agent has too few outcomes for a performance record.
    // Recovered by the weight calculator via the 1/N prior.
    #[error("Insufficient history for agent {agent_id}: {samples} samples < {required} required")]
    InsufficientHistory {
        agent_id: String,
        samples: usize,
        required: usize,
    },

    // Weight normalization failed (non-positive raw mass).
    // Recovered internally via equal-weight fallback.
    #[error("Normalization failed: {0}")]
    Normalization(String),

    // Two writers computed the same (entity, period); loser discards.
    #[error("Duplicate computation for {entity} ({key})")]
    DuplicateComputation { entity: String, key: String },

    // State machine errors
    #[error("Invalid tier transition: from {from} to {to}")]
    InvalidTierTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MetablendError
pub type Result<T> = std::result::Result<T, MetablendError>;

impl MetablendError {
    /// Whether the engine recovers from this error with a defined fallback.
    /// Everything but configuration and infrastructure failures degrades
    /// gracefully inside a cycle.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            MetablendError::Config(_)
                | MetablendError::Configuration(_)
                | MetablendError::Database(_)
                | MetablendError::InvalidTierTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_split() {
        let cold_start = MetablendError::InsufficientHistory {
            agent_id: "momentum".to_string(),
            samples: 3,
            required: 10,
        };
        assert!(cold_start.is_recoverable());
        assert!(MetablendError::DataUnavailable("no snapshot".into()).is_recoverable());
        assert!(MetablendError::Normalization("zero mass".into()).is_recoverable());

        let unknown_agent =
            MetablendError::Configuration("unknown agent: ghost".to_string());
        assert!(!unknown_agent.is_recoverable());
    }
}
