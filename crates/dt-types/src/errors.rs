use thiserror::Error;

use crate::run::SessionState;

/// Main error type for Detour
#[derive(Error, Debug)]
pub enum DetourError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Problems found while validating a driver configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("At least one design variable is required")]
    NoDesignVariables,

    #[error("Name declared more than once: {name}")]
    DuplicateName { name: String },

    #[error("Design variable {name} has no initial value")]
    EmptyVariable { name: String },

    #[error("Invalid bounds for {name}: lower {lower} > upper {upper}")]
    InvalidBounds { name: String, lower: f64, upper: f64 },

    #[error("Initial value {value} of {name}[{index}] lies outside its bounds")]
    InitialOutOfBounds {
        name: String,
        index: usize,
        value: f64,
    },

    #[error("Exactly one objective is supported, found {found}")]
    ObjectiveCount { found: usize },

    #[error("Invalid constraint {name}: {message}")]
    InvalidConstraint { name: String, message: String },

    #[error("Backend {backend} does not support {feature}")]
    Unsupported { backend: String, feature: String },

    #[error("Invalid option: {message}")]
    InvalidOption { message: String },
}

/// Errors raised by an optimizer adapter or the backend behind it
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Backend {backend} violated the evaluation protocol: {message}")]
    BackendProtocol {
        backend: String,
        message: String,
        /// Raw payload received from the backend, for debugging.
        raw: Option<String>,
    },

    #[error("Cannot {operation} while session is {state}")]
    InvalidTransition {
        state: SessionState,
        operation: &'static str,
    },

    #[error("Outcome cannot be handed to the backend: {message}")]
    InvalidOutcome { message: String },

    #[error("Failed to start backend {backend}: {source}")]
    Spawn {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend {backend} panicked: {message}")]
    BackendPanicked { backend: String, message: String },
}

impl AdapterError {
    pub fn protocol(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendProtocol {
            backend: backend.into(),
            message: message.into(),
            raw: None,
        }
    }
}

/// Evaluation history integrity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("History corruption: expected record index {expected}, found {found}")]
    Corruption { expected: u64, found: u64 },
}

/// Result type alias for Detour operations
pub type DetourResult<T> = Result<T, DetourError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_detour_error() {
        let err: DetourError = ConfigError::ObjectiveCount { found: 2 }.into();
        assert!(matches!(err, DetourError::Config(_)));
        assert_eq!(
            err.to_string(),
            "Configuration error: Exactly one objective is supported, found 2"
        );
    }

    #[test]
    fn invalid_transition_message() {
        let err = AdapterError::InvalidTransition {
            state: SessionState::Terminated,
            operation: "next_action",
        };
        assert_eq!(err.to_string(), "Cannot next_action while session is terminated");
    }

    #[test]
    fn corruption_message() {
        let err = HistoryError::Corruption {
            expected: 3,
            found: 5,
        };
        assert!(err.to_string().contains("expected record index 3, found 5"));
    }
}
