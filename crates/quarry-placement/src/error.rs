//! Engine error types.

use std::fmt;

use quarry_state::{EntityRef, StateError};
use serde::Serialize;
use thiserror::Error;

use crate::session::SessionState;

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification callers map onto their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    CapacityExceeded,
    ResourceExhausted,
    Internal,
}

/// One entity whose generation did not match the caller's expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleEntity {
    pub entity: EntityRef,
    /// `None` means the caller expected the entity not to exist.
    pub expected: Option<u64>,
    /// `None` means the entity does not exist.
    pub actual: Option<u64>,
}

impl fmt::Display for StaleEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |generation: Option<u64>| match generation {
            Some(g) => g.to_string(),
            None => "absent".to_string(),
        };
        write!(
            f,
            "{} expected generation {} but found {}",
            self.entity,
            show(self.expected),
            show(self.actual)
        )
    }
}

fn describe(stale: &[StaleEntity]) -> String {
    stale
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn list(entities: &[EntityRef]) -> String {
    entities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("generation conflict: {}", describe(.stale))]
    Conflict { stale: Vec<StaleEntity> },

    #[error("session {session_id}: {} modified after base generation {base_generation}", list(.entities))]
    StaleSession {
        session_id: String,
        base_generation: u64,
        entities: Vec<EntityRef>,
    },

    #[error("session {session_id} is {state}")]
    SessionNotActive {
        session_id: String,
        state: SessionState,
    },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} is in use")]
    InUse(String),

    #[error(
        "capacity exceeded for {resource_class} on provider {provider_id}: \
         requested {requested} with {used} already used of {capacity} (short by {shortfall})"
    )]
    CapacityExceeded {
        provider_id: String,
        resource_class: String,
        requested: u64,
        used: u64,
        capacity: u64,
        shortfall: u64,
    },

    #[error("search bound exceeded: {0}")]
    ResourceExhausted(String),

    #[error("internal consistency error: {0}")]
    Internal(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict { .. }
            | EngineError::StaleSession { .. }
            | EngineError::SessionNotActive { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::InUse(_) => ErrorKind::Conflict,
            EngineError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EngineError::Internal(_) | EngineError::State(_) => ErrorKind::Internal,
        }
    }

    /// Entities reported as stale by a generation conflict.
    pub fn stale_entities(&self) -> Vec<EntityRef> {
        match self {
            EngineError::Conflict { stale } => stale.iter().map(|s| s.entity.clone()).collect(),
            EngineError::StaleSession { entities, .. } => entities.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => EngineError::NotFound(what),
            StateError::Inconsistent(what) => EngineError::Internal(what),
            other => EngineError::State(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_reports_expected_and_actual() {
        let err = EngineError::Conflict {
            stale: vec![StaleEntity {
                entity: EntityRef::provider("rp-1"),
                expected: Some(10),
                actual: Some(11),
            }],
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            err.to_string(),
            "generation conflict: provider rp-1 expected generation 10 but found 11"
        );
        assert_eq!(err.stale_entities(), vec![EntityRef::provider("rp-1")]);
    }

    #[test]
    fn capacity_error_names_class_and_shortfall() {
        let err = EngineError::CapacityExceeded {
            provider_id: "rp-1".into(),
            resource_class: "VCPU".into(),
            requested: 4,
            used: 5,
            capacity: 8,
            shortfall: 1,
        };
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        let message = err.to_string();
        assert!(message.contains("VCPU"));
        assert!(message.contains("short by 1"));
    }

    #[test]
    fn state_errors_are_classified() {
        let not_found: EngineError = StateError::NotFound("resource provider x".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);
        let loop_err: EngineError = StateError::Inconsistent("loop".into()).into();
        assert_eq!(loop_err.kind(), ErrorKind::Internal);
        let io: EngineError = StateError::Write("disk full".into()).into();
        assert_eq!(io.kind(), ErrorKind::Internal);
    }

    #[test]
    fn absent_generation_is_spelled_out() {
        let stale = StaleEntity {
            entity: EntityRef::consumer("vm-1"),
            expected: None,
            actual: Some(3),
        };
        assert_eq!(
            stale.to_string(),
            "consumer vm-1 expected generation absent but found 3"
        );
    }
}
