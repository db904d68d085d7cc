//! Errors raised by the resource graph and its redb store.
//!
//! Storage failures carry redb's message as a string so the enum stays
//! `Send + Sync` and free of redb's own error hierarchy. The placement
//! layer maps [`StateError::NotFound`] to a caller-facing not-found and
//! everything else to an internal error.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// `Database::create` or the in-memory backend failed.
    #[error("failed to open graph store: {0}")]
    Open(String),

    /// Beginning, committing or aborting a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A graph table could not be opened. Tables are created at bootstrap,
    /// so this means the file is damaged or from another program.
    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    /// A record could not be encoded as JSON.
    #[error("failed to encode record: {0}")]
    Serialize(String),

    /// A stored JSON record no longer matches its Rust type.
    #[error("failed to decode record: {0}")]
    Deserialize(String),

    /// A required entity is missing. The payload is `"<kind> <id>"`, e.g.
    /// `"resource provider cn1"` or `"consumer vm-7"`, and is shown to
    /// callers verbatim.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored graph breaks a structural rule: a parent loop, a dangling
    /// edge or a malformed composite key.
    #[error("graph inconsistency: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_entity() {
        let err = StateError::NotFound("resource provider cn1".into());
        assert_eq!(err.to_string(), "not found: resource provider cn1");
    }

    #[test]
    fn inconsistency_is_labelled() {
        let err = StateError::Inconsistent("provider cn1 is its own ancestor".into());
        assert!(err.to_string().starts_with("graph inconsistency:"));
    }
}
