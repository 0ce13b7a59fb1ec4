//! Differential synchronization of stimulation parameters with the device.
//!
//! Edits are local until [`StimProgramSync::send`] pushes them. Each electrode
//! is pushed with its own `stim_param` call so the device reports a status per
//! electrode. A failed push puts the exported fields back into the pending set;
//! a successful one leaves them cleared.

use neurorig_protocol::{ChannelsArray, StatusReply, StimWireMessage};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RigError};
use crate::hardware::HardwareRpc;
use crate::stim::{check_electrode, ChangeSet, FieldValue, StimField, StimParam};
use crate::wire;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectrodeOutcome {
    pub electrode: u8,
    pub ok: bool,
    pub message: Option<String>,
}

/// Aggregated result of pushing a batch of electrodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub outcomes: Vec<ElectrodeOutcome>,
    /// Electrodes skipped after a transport failure.
    pub not_attempted: Vec<u8>,
}

impl SyncReport {
    pub fn overall_ok(&self) -> bool {
        self.not_attempted.is_empty() && self.outcomes.iter().all(|outcome| outcome.ok)
    }

    pub fn succeeded(&self) -> Vec<u8> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.ok)
            .map(|outcome| outcome.electrode)
            .collect()
    }

    /// Electrodes that need a re-drive: failed ones plus the ones never tried.
    pub fn failed(&self) -> Vec<u8> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.ok)
            .map(|outcome| outcome.electrode)
            .chain(self.not_attempted.iter().copied())
            .collect()
    }

    /// Device and transport messages, joined with `"; "`.
    pub fn message(&self) -> String {
        self.outcomes
            .iter()
            .filter_map(|outcome| {
                outcome
                    .message
                    .as_ref()
                    .map(|message| format!("electrode {}: {}", outcome.electrode, message))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} electrodes synced",
            self.succeeded().len(),
            self.outcomes.len() + self.not_attempted.len()
        )?;
        let message = self.message();
        if !message.is_empty() {
            write!(f, " ({})", message)?;
        }
        if !self.not_attempted.is_empty() {
            write!(f, "; not attempted: {:?}", self.not_attempted)?;
        }
        Ok(())
    }
}

pub struct StimProgramSync {
    params: BTreeMap<u8, StimParam>,
    rpc: Arc<dyn HardwareRpc>,
}

impl StimProgramSync {
    pub fn new(rpc: Arc<dyn HardwareRpc>) -> Self {
        Self {
            params: BTreeMap::new(),
            rpc,
        }
    }

    /// Current parameter for `electrode`, if it has been touched this session.
    pub fn param(&self, electrode: u8) -> Option<&StimParam> {
        self.params.get(&electrode)
    }

    /// Validates and records one field edit. No device traffic.
    pub fn apply_edit(&mut self, electrode: u8, field: StimField, value: FieldValue) -> Result<()> {
        let param = self.param_mut(electrode)?;
        param.set(field, value)?;
        tracing::debug!(electrode, field = %field, ?value, "Staged stimulation edit");
        Ok(())
    }

    /// Installs a complete parameter. Every field is pending export.
    pub fn load(&mut self, mut param: StimParam) {
        param.mark_dirty(ChangeSet::all());
        self.params.insert(param.index(), param);
    }

    /// Installs a parameter as-is, keeping its pending set. Used to pick up
    /// edits staged by an earlier process.
    pub fn resume(&mut self, param: StimParam) {
        self.params.insert(param.index(), param);
    }

    /// Drains the electrode's pending changes into a wire message.
    pub fn export(&mut self, electrode: u8) -> Result<StimWireMessage> {
        let param = self.param_mut(electrode)?;
        let changes = param.take_changes();
        Ok(wire::encode(param, &changes))
    }

    /// Pushes pending changes for each electrode, in order.
    ///
    /// A device-reported failure moves on to the next electrode. A transport
    /// failure stops the batch; the remaining electrodes are reported as not
    /// attempted and keep their pending changes.
    pub fn send(&mut self, electrodes: &[u8]) -> Result<SyncReport> {
        for electrode in electrodes {
            check_electrode(*electrode)?;
        }

        let mut report = SyncReport::default();
        for (position, electrode) in electrodes.iter().copied().enumerate() {
            let param = self.param_mut(electrode)?;
            let changes = param.take_changes();
            let message = wire::encode(param, &changes);
            if let Err(err) = message.validate() {
                tracing::warn!(electrode, error = %err.message, "Stimulation message failed validation");
                param.mark_dirty(changes);
                report.outcomes.push(ElectrodeOutcome {
                    electrode,
                    ok: false,
                    message: Some(err.message),
                });
                continue;
            }

            match self.rpc.push_stim_param(&message) {
                Ok(StatusReply { status: true, message }) => {
                    tracing::debug!(electrode, fields = changes.len(), "Pushed stimulation parameter");
                    report.outcomes.push(ElectrodeOutcome {
                        electrode,
                        ok: true,
                        message,
                    });
                }
                Ok(StatusReply { status: false, message }) => {
                    tracing::warn!(electrode, message = ?message, "Device rejected stimulation parameter");
                    self.requeue(electrode, changes);
                    report.outcomes.push(ElectrodeOutcome {
                        electrode,
                        ok: false,
                        message: Some(message.unwrap_or_else(|| "rejected by device".to_string())),
                    });
                }
                Err(err) => {
                    tracing::warn!(electrode, error = %err, "Stimulation push aborted");
                    self.requeue(electrode, changes);
                    report.outcomes.push(ElectrodeOutcome {
                        electrode,
                        ok: false,
                        message: Some(err.to_string()),
                    });
                    report.not_attempted = electrodes[position + 1..].to_vec();
                    break;
                }
            }
        }

        if report.overall_ok() {
            Ok(report)
        } else {
            tracing::warn!(failed = ?report.failed(), "Partial stimulation sync");
            Err(RigError::PartialSync(report))
        }
    }

    /// Asks the device to move staged parameters to the headstage. `None` means
    /// every electrode. Recording should be stopped before calling this.
    pub fn upload(&self, electrodes: Option<&[u8]>) -> Result<StatusReply> {
        let channels = match electrodes {
            Some(list) => {
                for electrode in list {
                    check_electrode(*electrode)?;
                }
                list.iter().map(|electrode| u32::from(*electrode)).collect()
            }
            None => Vec::new(),
        };
        let reply = self.rpc.upload_stim_params(&ChannelsArray { channels })?;
        if reply.status {
            tracing::info!(electrodes = ?electrodes, "Uploaded stimulation parameters");
        } else {
            tracing::warn!(message = ?reply.message, "Stimulation upload rejected");
        }
        Ok(reply)
    }

    fn param_mut(&mut self, electrode: u8) -> Result<&mut StimParam> {
        check_electrode(electrode)?;
        if !self.params.contains_key(&electrode) {
            self.params.insert(electrode, StimParam::new(electrode)?);
        }
        self.params
            .get_mut(&electrode)
            .ok_or_else(|| RigError::validation("electrode", "parameter missing after insert"))
    }

    fn requeue(&mut self, electrode: u8, changes: ChangeSet) {
        if let Some(param) = self.params.get_mut(&electrode) {
            param.mark_dirty(changes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurorig_protocol::{CoefThresholds, SaveInfo, VarThresholds};
    use std::sync::Mutex;

    /// Records pushed messages and answers from a per-channel script.
    #[derive(Default)]
    struct ScriptedRpc {
        rejects: Vec<u32>,
        broken: Vec<u32>,
        pushed: Mutex<Vec<StimWireMessage>>,
        uploads: Mutex<Vec<ChannelsArray>>,
    }

    impl HardwareRpc for ScriptedRpc {
        fn start(&self) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn stop(&self) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn start_recording(&self, _info: &SaveInfo) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn stop_recording(&self) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn update_variance_threshold(&self, _update: &VarThresholds) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn update_coefficient_threshold(&self, _update: &CoefThresholds) -> Result<StatusReply> {
            Ok(StatusReply::success())
        }
        fn count_spikes(&self, _duration_ms: u32) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
        fn push_stim_param(&self, message: &StimWireMessage) -> Result<StatusReply> {
            self.pushed
                .lock()
                .expect("pushed lock")
                .push(message.clone());
            if self.broken.contains(&message.channel) {
                return Err(RigError::Transport {
                    context: "push".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset"),
                });
            }
            if self.rejects.contains(&message.channel) {
                return Ok(StatusReply::failure("amplitude out of range"));
            }
            Ok(StatusReply::success())
        }
        fn upload_stim_params(&self, channels: &ChannelsArray) -> Result<StatusReply> {
            self.uploads
                .lock()
                .expect("uploads lock")
                .push(channels.clone());
            Ok(StatusReply::success())
        }
    }

    fn sync_with(rpc: ScriptedRpc) -> (StimProgramSync, Arc<ScriptedRpc>) {
        let rpc = Arc::new(rpc);
        (StimProgramSync::new(rpc.clone()), rpc)
    }

    #[test]
    fn second_export_without_edits_is_key_only() {
        let (mut sync, _) = sync_with(ScriptedRpc::default());
        let first = sync.export(9).expect("first export");
        assert!(!first.is_key_only());

        let second = sync.export(9).expect("second export");
        assert!(second.is_key_only());
        assert_eq!(second.channel, 9);
    }

    #[test]
    fn export_after_edit_carries_only_that_field() {
        let (mut sync, _) = sync_with(ScriptedRpc::default());
        sync.export(1).expect("initial export");

        sync.apply_edit(1, StimField::PhaseAmplitude1, FieldValue::Float(4.0))
            .expect("edit");
        let message = sync.export(1).expect("export");
        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            serde_json::json!({ "channel": 1, "firstphaseamplitudemicroamps": 4.0 })
        );
    }

    #[test]
    fn apply_edit_rejects_bad_electrode_and_value() {
        let (mut sync, rpc) = sync_with(ScriptedRpc::default());
        assert!(sync
            .apply_edit(128, StimField::Enable, FieldValue::Bool(true))
            .is_err());
        assert!(sync
            .apply_edit(3, StimField::NbPulse, FieldValue::Int(257))
            .is_err());
        assert!(rpc.pushed.lock().expect("pushed lock").is_empty());
    }

    #[test]
    fn partial_failure_keeps_failed_fields_pending() {
        let (mut sync, rpc) = sync_with(ScriptedRpc {
            rejects: vec![5],
            ..ScriptedRpc::default()
        });

        let err = sync.send(&[5, 6]).expect_err("electrode 5 fails");
        let report = match err {
            RigError::PartialSync(report) => report,
            other => panic!("unexpected error: {other}"),
        };
        assert!(!report.overall_ok());
        assert_eq!(report.failed(), vec![5]);
        assert_eq!(report.succeeded(), vec![6]);
        assert!(report.message().contains("amplitude out of range"));

        assert_eq!(
            sync.param(5).expect("param 5").changes().len(),
            StimField::ALL.len()
        );
        assert!(sync.param(6).expect("param 6").changes().is_empty());
        assert_eq!(rpc.pushed.lock().expect("pushed lock").len(), 2);
    }

    #[test]
    fn transport_failure_stops_the_batch() {
        let (mut sync, rpc) = sync_with(ScriptedRpc {
            broken: vec![2],
            ..ScriptedRpc::default()
        });

        let err = sync.send(&[1, 2, 3, 4]).expect_err("transport failure");
        let report = match err {
            RigError::PartialSync(report) => report,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(report.succeeded(), vec![1]);
        assert_eq!(report.not_attempted, vec![3, 4]);
        assert_eq!(report.failed(), vec![2, 3, 4]);
        assert_eq!(rpc.pushed.lock().expect("pushed lock").len(), 2);
        assert!(sync.param(3).map_or(true, |param| !param.changes().is_empty()));
    }

    #[test]
    fn redrive_resends_failed_fields() {
        let (mut sync, _) = sync_with(ScriptedRpc {
            rejects: vec![7],
            ..ScriptedRpc::default()
        });
        sync.export(7).expect("initial export");
        sync.apply_edit(7, StimField::TriggerKey, FieldValue::Int(2))
            .expect("edit");

        assert!(sync.send(&[7]).is_err());
        let message = sync.export(7).expect("export after failure");
        assert_eq!(message.source, Some(2));
    }

    #[test]
    fn full_success_returns_report() {
        let (mut sync, _) = sync_with(ScriptedRpc::default());
        let report = sync.send(&[0, 1]).expect("send");
        assert!(report.overall_ok());
        assert_eq!(report.message(), "");
    }

    #[test]
    fn upload_all_sends_empty_channel_list() {
        let (sync, rpc) = sync_with(ScriptedRpc::default());
        sync.upload(None).expect("upload all");
        sync.upload(Some(&[3, 4])).expect("upload some");

        let uploads = rpc.uploads.lock().expect("uploads lock");
        assert!(uploads[0].channels.is_empty());
        assert_eq!(uploads[1].channels, vec![3, 4]);
    }

    #[test]
    fn load_marks_every_field_pending() {
        let (mut sync, _) = sync_with(ScriptedRpc::default());
        let mut param = StimParam::new(11).expect("param");
        param.take_changes();

        sync.load(param);
        assert_eq!(
            sync.param(11).expect("loaded").changes().len(),
            StimField::ALL.len()
        );
    }

    #[test]
    fn invalid_message_is_reported_without_dropping_the_batch() {
        let (mut sync, rpc) = sync_with(ScriptedRpc::default());
        let mut corrupt = StimParam::new(3).expect("param");
        corrupt.index = 200;
        sync.params.insert(3, corrupt);

        let report = match sync.send(&[2, 3, 4]).expect_err("electrode 3 invalid") {
            RigError::PartialSync(report) => report,
            other => panic!("unexpected error: {other}"),
        };
        assert_eq!(report.succeeded(), vec![2, 4]);
        assert_eq!(report.failed(), vec![3]);
        assert!(report.not_attempted.is_empty());
        assert_eq!(rpc.pushed.lock().expect("pushed lock").len(), 2);
        assert_eq!(
            sync.param(3).expect("param 3").changes().len(),
            StimField::ALL.len()
        );
    }

    #[test]
    fn resume_keeps_the_pending_set() {
        let (mut sync, _) = sync_with(ScriptedRpc::default());
        let mut param = StimParam::new(2).expect("param");
        param.take_changes();
        param
            .set(StimField::TriggerDelay, FieldValue::Int(50))
            .expect("edit");

        sync.resume(param);
        let message = sync.export(2).expect("export");
        assert_eq!(message.posttriggerdelaymicroseconds, Some(50));
        assert_eq!(message.stimenabled, None);
    }
}
