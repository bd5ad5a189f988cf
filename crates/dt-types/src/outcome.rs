use serde::{Deserialize, Serialize};
use std::fmt;

use crate::point::Response;

/// Classification of one evaluation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The model produced values for every declared output.
    Success(Response),
    /// The design point lies outside the model's valid domain. The optimizer is
    /// expected to back off and try a nearby point.
    RecoverableFailure { reason: String },
    /// Unexpected model defect. Never retried.
    FatalFailure { reason: String, cause: FatalCause },
}

/// Why an evaluation was classified as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FatalCause {
    /// The model reported an error that is not a domain-validity failure.
    Model,
    /// The model panicked during evaluation.
    Panic,
    /// The model returned values that do not match the declared outputs.
    InvalidResponse,
    /// Too many consecutive recoverable failures; this one was escalated.
    BudgetExhausted { consecutive: usize },
}

/// Outcome tag without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RecoverableFailure,
    FatalFailure,
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::RecoverableFailure { .. } => OutcomeKind::RecoverableFailure,
            Self::FatalFailure { .. } => OutcomeKind::FatalFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RecoverableFailure { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalFailure { .. })
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Success(response) => Some(response),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::RecoverableFailure { reason } | Self::FatalFailure { reason, .. } => {
                Some(reason.as_str())
            }
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RecoverableFailure => write!(f, "recoverable failure"),
            Self::FatalFailure => write!(f, "fatal failure"),
        }
    }
}
