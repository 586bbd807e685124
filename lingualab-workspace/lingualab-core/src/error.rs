// src/error.rs
//! Error taxonomy for the session subsystem.
//!
//! Only a handful of these are ever meant to reach a participant-facing flow:
//! `MissingHeader` is the one fatal condition of consolidation. Producer-side
//! failures (logger flush, mirror, heartbeats) are logged where they occur and
//! never converted into a `LabError` for the caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::SessionStatus;

#[derive(Debug, Error)]
pub enum LabError {
    /// The immutable session header is absent. Nothing can be consolidated without it.
    #[error("session header missing for {session_id} (expected at {path:?})")]
    MissingHeader { session_id: String, path: PathBuf },

    #[error("session header at {path:?} is unreadable: {reason}")]
    MalformedHeader { path: PathBuf, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Attempted to write a header over an existing one.
    #[error("session header already exists at {0:?}")]
    HeaderExists(PathBuf),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("could not allocate a unique session namespace after {0} attempts")]
    NamespaceExhausted(usize),

    #[error("unknown language code: {0:?}")]
    UnknownLanguage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type LabResult<T> = Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_names_the_session() {
        let err = LabError::MissingHeader {
            session_id: "20250101_120000_Alex_Chen".into(),
            path: PathBuf::from("/tmp/x/meta/session.json"),
        };
        let msg = err.to_string();
        assert!(msg.contains("20250101_120000_Alex_Chen"));
        assert!(msg.contains("session.json"));
    }

    #[test]
    fn illegal_transition_display() {
        let err = LabError::IllegalTransition {
            from: SessionStatus::Abandoned,
            to: SessionStatus::Active,
        };
        assert_eq!(err.to_string(), "illegal status transition abandoned -> active");
    }
}
