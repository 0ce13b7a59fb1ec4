//! # neurorig-core
//!
//! Shared logic for driving a single electrophysiology rig from several remote
//! operators: who may run it, for how long, and which stimulation parameters
//! the device has actually received.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Every socket and SQLite call is bounded
//!   by a timeout instead.
//! - **One writer**: The lock record changes only through guarded `UPDATE`s,
//!   so two operators racing for the rig cannot both win.
//! - **Ownership and window checked per call**: The lock owner and booking
//!   window are re-evaluated before every hardware command and trigger frame.
//! - **Typed failures**: Each refusal says why (`RigError`), never a bare `false`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use neurorig_core::{load_config, RigDb, RigSession, SessionLock};
//!
//! let config = load_config(None)?;
//! let db = Arc::new(RigDb::new(config.store.path.clone())?);
//! let lock = SessionLock::new(db.clone(), db, bookings, Arc::new(SystemClock));
//! let mut rig = RigSession::start(lock, rpc, trigger, "tok-1")?;
//! rig.apply_edit(5, StimField::PhaseAmplitude1, FieldValue::Float(2.0))?;
//! rig.send_stim(&[5])?;
//! rig.finish()?;
//! ```

pub mod booking;
pub mod config;
pub mod control;
pub mod error;
pub mod hardware;
pub mod session;
pub mod stim;
pub mod store;
pub mod sync;
pub mod trigger;
pub mod uv;
pub mod window;
pub mod wire;

pub use booking::{resolve_window, Booking, BookingAuthority, SqliteBookingAuthority, StaticBookings};
pub use config::{load_config, HardwareConfig, RigConfig};
pub use control::{RigSession, TriggerEndpoint};
pub use error::{AuthorizationError, ErrorClass, LockConflict, Result, RigError};
pub use hardware::{HardwareRpc, RpcClient};
pub use session::{Session, SessionLock};
pub use stim::{FieldValue, StagedStim, StimField, StimParam, StimPolarity, StimShape};
pub use store::{BestStimParam, ExperimentDirectory, ExperimentRecord, LockRecord, LockStore, RigDb};
pub use sync::{StimProgramSync, SyncReport};
pub use trigger::{TriggerChannel, TriggerFrame};
pub use uv::activate_uv;
pub use window::{authorized, BookingWindow, Clock, ManualClock, SystemClock};
