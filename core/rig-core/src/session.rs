//! Single-writer session lock.
//!
//! The lock moves `Idle -> Requested -> Running -> Idle`. `Requested` is the
//! validation step inside [`SessionLock::start`] and is never persisted: the
//! record only changes through the store's guarded updates, so a failed start
//! leaves it exactly as it was.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::booking::{resolve_window, BookingAuthority};
use crate::error::{AuthorizationError, LockConflict, Result};
use crate::store::{ExperimentDirectory, LockRecord, LockStore};
use crate::window::{authorized, BookingWindow, Clock};

/// A token that resolved to a runnable, currently-booked experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub token: String,
    pub identity: String,
    pub name: String,
    pub electrodes: BTreeSet<u8>,
    pub window: BookingWindow,
}

#[derive(Clone)]
pub struct SessionLock {
    store: Arc<dyn LockStore>,
    directory: Arc<dyn ExperimentDirectory>,
    bookings: Arc<dyn BookingAuthority>,
    clock: Arc<dyn Clock>,
}

impl SessionLock {
    pub fn new(
        store: Arc<dyn LockStore>,
        directory: Arc<dyn ExperimentDirectory>,
        bookings: Arc<dyn BookingAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            bookings,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn directory(&self) -> &Arc<dyn ExperimentDirectory> {
        &self.directory
    }

    /// Resolves `token` to a session that is allowed to run right now.
    pub fn open(&self, token: &str) -> Result<Session> {
        let now = self.clock.now();
        self.resolve(token, now)
    }

    /// Takes the rig for `token`.
    pub fn start(&self, token: &str) -> Result<Session> {
        let record = self.store.load()?;
        if record.maintenance {
            tracing::warn!(token = %token, "Start refused: maintenance");
            return Err(LockConflict::MaintenanceActive.into());
        }
        if record.running {
            tracing::warn!(token = %token, "Start refused: rig already running");
            return Err(LockConflict::AlreadyRunning.into());
        }

        let now = self.clock.now();
        tracing::debug!(token = %token, state = "requested", "Validating session start");
        let session = self.resolve(token, now)?;
        // A new session reseeds the device, so nothing staged earlier carries over.
        self.directory.clear_staged_stim_params(token)?;

        if !self.store.try_acquire(token, now)? {
            // Someone else changed the record between our read and the update.
            let current = self.store.load()?;
            let conflict = if current.maintenance {
                LockConflict::MaintenanceActive
            } else {
                LockConflict::AlreadyRunning
            };
            tracing::warn!(token = %token, ?conflict, "Start lost the race for the lock");
            return Err(conflict.into());
        }

        tracing::info!(
            token = %token,
            identity = %session.identity,
            experiment = %session.name,
            window_end = %session.window.end,
            "Session started"
        );
        Ok(session)
    }

    /// Releases the rig. Only the owning token may do this.
    pub fn stop(&self, token: &str) -> Result<()> {
        if !self.store.release(token, self.clock.now())? {
            tracing::warn!(token = %token, "Stop refused: token does not own the rig");
            return Err(LockConflict::TokenMismatch.into());
        }
        tracing::info!(token = %token, "Session stopped");
        Ok(())
    }

    /// Re-enters a session started by another process for the same token.
    pub fn attach(&self, token: &str) -> Result<Session> {
        let session = self.open(token)?;
        self.verify_owner(&session)?;
        Ok(session)
    }

    /// Checks that `session` still owns the rig and is inside its window.
    pub fn verify_owner(&self, session: &Session) -> Result<()> {
        let record = self.store.load()?;
        if !record.running || record.owner_token.as_deref() != Some(session.token.as_str()) {
            return Err(LockConflict::TokenMismatch.into());
        }
        check_window(&session.window, self.clock.now())
    }

    pub fn status(&self) -> Result<LockRecord> {
        self.store.load()
    }

    pub fn set_maintenance(&self, maintenance: bool) -> Result<()> {
        self.store.set_maintenance(maintenance, self.clock.now())?;
        tracing::info!(maintenance, "Maintenance flag updated");
        Ok(())
    }

    fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<Session> {
        let experiment = self
            .directory
            .experiment(token)?
            .ok_or(AuthorizationError::UnknownToken)?;
        if !experiment.can_run {
            return Err(AuthorizationError::CannotRun {
                name: experiment.name,
            }
            .into());
        }

        let window = resolve_window(self.bookings.as_ref(), &experiment.identity, now)?;
        check_window(&window, now)?;

        Ok(Session {
            token: experiment.token,
            identity: experiment.identity,
            name: experiment.name,
            electrodes: experiment.electrodes,
            window,
        })
    }
}

pub(crate) fn check_window(window: &BookingWindow, now: DateTime<Utc>) -> Result<()> {
    if authorized(now, window) {
        Ok(())
    } else {
        Err(AuthorizationError::WindowExpired {
            start: window.start,
            end: window.end,
            now,
        }
        .into())
    }
}
