//! Error types for rig control operations.
//!
//! Every failure carries its specific reason. Nothing in this crate reports
//! failure as a bare `false`.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::sync::SyncReport;

// ═══════════════════════════════════════════════════════════════════════════════
// Reasons
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a token is not allowed to drive the rig right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("no experiment registered for this token")]
    UnknownToken,

    #[error("experiment '{name}' is not allowed to run")]
    CannotRun { name: String },

    #[error("no booking for {identity} covers the current time")]
    NoBooking { identity: String },

    #[error("booking window {start} .. {end} does not include {now}")]
    WindowExpired {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

/// Conflicts on the shared lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockConflict {
    #[error("an experiment is already running on the rig")]
    AlreadyRunning,

    #[error("the rig is under maintenance")]
    MaintenanceActive,

    #[error("token does not own the running experiment")]
    TokenMismatch,
}

/// Coarse taxonomy used by callers to pick a policy (retry, re-drive, abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connection,
    Authorization,
    LockConflict,
    Transport,
    PartialSync,
    Validation,
    Configuration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RigError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum RigError {
    // ─────────────────────────────────────────────────────────────────────
    // Reachability
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Access control
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not authorized: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Lock conflict: {0}")]
    LockConflict(#[from] LockConflict),

    // ─────────────────────────────────────────────────────────────────────
    // Device I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error("Transport error: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected device response: {details}")]
    Protocol { details: String },

    #[error("Stimulation sync incomplete: {0}")]
    PartialSync(SyncReport),

    // ─────────────────────────────────────────────────────────────────────
    // Input
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Configuration error: {path}: {details}")]
    Config { path: PathBuf, details: String },
}

impl RigError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RigError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RigError::Connection { .. } | RigError::Store { .. } => ErrorClass::Connection,
            RigError::Authorization(_) => ErrorClass::Authorization,
            RigError::LockConflict(_) => ErrorClass::LockConflict,
            RigError::Transport { .. } | RigError::Protocol { .. } => ErrorClass::Transport,
            RigError::PartialSync(_) => ErrorClass::PartialSync,
            RigError::Validation { .. } => ErrorClass::Validation,
            RigError::Config { .. } => ErrorClass::Configuration,
        }
    }
}

/// Builds a `map_err` adapter that tags a SQLite failure with context.
pub(crate) fn store_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> RigError {
    move |source| RigError::Store {
        context: context.to_string(),
        source,
    }
}

/// Convenience type alias for Results using RigError.
pub type Result<T> = std::result::Result<T, RigError>;
