//! Session-gated hardware control.
//!
//! [`RigSession`] is what an operator holds while they own the rig. Every
//! method that reaches the hardware re-checks ownership and the booking window
//! first, so a lapsed booking or a forced stop takes effect on the next call.

use neurorig_protocol::{
    CoefThreshold, CoefThresholds, SaveInfo, StatusReply, VarThreshold, VarThresholds,
};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RigError};
use crate::hardware::HardwareRpc;
use crate::session::{Session, SessionLock};
use crate::stim::{check_electrode, FieldValue, StimField, StimParam};
use crate::store::BestStimParam;
use crate::sync::{StimProgramSync, SyncReport};
use crate::trigger::TriggerChannel;

pub const MAX_COUNT_DURATION_MS: u32 = 30_000;

/// Where and how to open the trigger socket for this session.
#[derive(Debug, Clone)]
pub struct TriggerEndpoint {
    pub addr: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

pub struct RigSession {
    lock: SessionLock,
    session: Session,
    rpc: Arc<dyn HardwareRpc>,
    stim: StimProgramSync,
    trigger: TriggerEndpoint,
}

impl RigSession {
    /// Takes the rig for `token`.
    pub fn start(
        lock: SessionLock,
        rpc: Arc<dyn HardwareRpc>,
        trigger: TriggerEndpoint,
        token: &str,
    ) -> Result<Self> {
        let session = lock.start(token)?;
        Self::with_session(lock, session, rpc, trigger)
    }

    /// Joins a session this token already owns, e.g. from a second process.
    pub fn attach(
        lock: SessionLock,
        rpc: Arc<dyn HardwareRpc>,
        trigger: TriggerEndpoint,
        token: &str,
    ) -> Result<Self> {
        let session = lock.attach(token)?;
        Self::with_session(lock, session, rpc, trigger)
    }

    /// Builds the session and picks up stimulation edits staged under its token.
    fn with_session(
        lock: SessionLock,
        session: Session,
        rpc: Arc<dyn HardwareRpc>,
        trigger: TriggerEndpoint,
    ) -> Result<Self> {
        let mut stim = StimProgramSync::new(rpc.clone());
        let staged = lock.directory().staged_stim_params(&session.token)?;
        if !staged.is_empty() {
            tracing::debug!(token = %session.token, electrodes = staged.len(), "Resuming staged stimulation");
        }
        for entry in &staged {
            stim.resume(StimParam::from_staged(entry)?);
        }
        Ok(Self {
            lock,
            session,
            rpc,
            stim,
            trigger,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stim(&self) -> &StimProgramSync {
        &self.stim
    }

    /// Local edit; reaches the device on the next [`RigSession::send_stim`].
    pub fn apply_edit(&mut self, electrode: u8, field: StimField, value: FieldValue) -> Result<()> {
        self.stim.apply_edit(electrode, field, value)?;
        self.persist_stim(&[electrode])
    }

    /// Pushes pending edits. The outcome is persisted either way, so a later
    /// process resends exactly what the device has not accepted.
    pub fn send_stim(&mut self, electrodes: &[u8]) -> Result<SyncReport> {
        self.lock.verify_owner(&self.session)?;
        let result = self.stim.send(electrodes);
        self.persist_stim(electrodes)?;
        result
    }

    /// Recording must be stopped before uploading.
    pub fn upload_stim(&mut self, electrodes: Option<&[u8]>) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        expect_status("upload_stim_param", self.stim.upload(electrodes)?)
    }

    /// Starts acquisition on the device.
    pub fn start_acquisition(&self) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        expect_status("start", self.rpc.start()?)
    }

    pub fn stop_acquisition(&self) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        expect_status("stop", self.rpc.stop()?)
    }

    pub fn start_recording(
        &self,
        channels: &[u8],
        tag: &str,
        include_triggers: bool,
    ) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        for channel in channels {
            check_electrode(*channel)?;
        }
        let info = SaveInfo {
            channels: channels.iter().map(|channel| u32::from(*channel)).collect(),
            tag: tag.to_string(),
            triggers: include_triggers,
        };
        let reply = expect_status("start_recording", self.rpc.start_recording(&info)?)?;
        tracing::info!(token = %self.session.token, tag = %tag, channels = channels.len(), "Recording started");
        Ok(reply)
    }

    pub fn stop_recording(&self) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        let reply = expect_status("stop_recording", self.rpc.stop_recording()?)?;
        tracing::info!(token = %self.session.token, "Recording stopped");
        Ok(reply)
    }

    /// Enables or disables the variance threshold per channel.
    pub fn update_variance_threshold(&self, updates: &[(u8, bool)]) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        let mut update_chan = Vec::with_capacity(updates.len());
        for (channel, update) in updates {
            check_electrode(*channel)?;
            update_chan.push(VarThreshold {
                channel: u32::from(*channel),
                update: *update,
            });
        }
        expect_status(
            "var_threshold",
            self.rpc
                .update_variance_threshold(&VarThresholds { update_chan })?,
        )
    }

    pub fn update_coefficient_threshold(&self, updates: &[(u8, f32)]) -> Result<StatusReply> {
        self.lock.verify_owner(&self.session)?;
        let mut chan_threshold = Vec::with_capacity(updates.len());
        for (channel, coef) in updates {
            check_electrode(*channel)?;
            if !coef.is_finite() || *coef < 0.0 {
                return Err(RigError::validation(
                    "coef_threshold",
                    format!("{} must be a finite value >= 0", coef),
                ));
            }
            chan_threshold.push(CoefThreshold {
                channel: u32::from(*channel),
                coef_threshold: *coef,
            });
        }
        expect_status(
            "coef_threshold",
            self.rpc
                .update_coefficient_threshold(&CoefThresholds { chan_threshold })?,
        )
    }

    /// Spike counts per channel over `duration_ms`.
    pub fn count_spikes(&self, duration_ms: u32) -> Result<Vec<u32>> {
        if !(1..=MAX_COUNT_DURATION_MS).contains(&duration_ms) {
            return Err(RigError::validation(
                "duration",
                format!("{} ms is outside 1..={}", duration_ms, MAX_COUNT_DURATION_MS),
            ));
        }
        self.lock.verify_owner(&self.session)?;
        self.rpc.count_spikes(duration_ms)
    }

    /// Opens the trigger socket. The channel re-checks ownership on every send.
    pub fn open_trigger_channel(&self) -> Result<TriggerChannel> {
        self.lock.verify_owner(&self.session)?;
        TriggerChannel::connect(
            &self.trigger.addr,
            self.lock.clone(),
            self.session.clone(),
            self.trigger.connect_timeout,
            self.trigger.write_timeout,
        )
    }

    /// Stored best parameter for `electrode`, if any experiment recorded one.
    pub fn best_stim_param(&self, electrode: u8) -> Result<Option<BestStimParam>> {
        self.lock.directory().best_stim_param(electrode)
    }

    /// Stages the stored best parameter for `electrode`. Returns false when none is stored.
    pub fn load_best_stim_param(&mut self, electrode: u8) -> Result<bool> {
        match self.best_stim_param(electrode)? {
            Some(best) => {
                self.stim.load(best.to_stim_param()?);
                self.persist_stim(&[electrode])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Releases the rig.
    pub fn finish(self) -> Result<()> {
        self.lock.stop(&self.session.token)
    }

    fn persist_stim(&self, electrodes: &[u8]) -> Result<()> {
        let directory = self.lock.directory();
        for electrode in electrodes {
            if let Some(param) = self.stim.param(*electrode) {
                directory.save_staged_stim_param(&self.session.token, &param.to_staged())?;
            }
        }
        Ok(())
    }
}

fn expect_status(call: &str, reply: StatusReply) -> Result<StatusReply> {
    if reply.status {
        return Ok(reply);
    }
    Err(RigError::Protocol {
        details: format!(
            "{} rejected: {}",
            call,
            reply.message.as_deref().unwrap_or("no message")
        ),
    })
}
