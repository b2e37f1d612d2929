//! Error taxonomy shared by the managers.
//!
//! Remote collaborator failures never surface here; they are recorded on the
//! record they belong to. What reaches callers is validation, lookup, state
//! transition, or storage failure.

use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected synchronously, before anything is persisted.
    #[error("{0}")]
    Validation(String),

    /// Missing, or owned by somebody else.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The record exists but is not in a state that allows the transition.
    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Storage(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::validation("x").code(), "validation_error");
        assert_eq!(EngineError::not_found("site", 1).code(), "not_found");
        assert_eq!(EngineError::invalid_state("x").code(), "invalid_state");
        assert_eq!(
            EngineError::from(anyhow::anyhow!("db down")).code(),
            "internal_error"
        );
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let err = EngineError::not_found("scheduled post", "abc");
        assert_eq!(err.to_string(), "scheduled post abc not found");
    }
}
