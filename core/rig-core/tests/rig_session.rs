//! Integration tests for session-gated hardware control.

use chrono::{DateTime, TimeZone, Utc};
use neurorig_core::store::BestStimParam;
use neurorig_core::{
    AuthorizationError, ErrorClass, ExperimentRecord, FieldValue, HardwareRpc, LockConflict,
    ManualClock, RigDb, RigError, RigSession, SessionLock, StaticBookings, StimField,
    StimPolarity, StimShape, TriggerEndpoint, TriggerFrame,
};
use neurorig_protocol::{
    ChannelsArray, CoefThresholds, SaveInfo, StatusReply, StimWireMessage, VarThresholds,
    WirePolarity,
};
use std::io::Read;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// Fake device that records every call by name.
#[derive(Default)]
struct RecordingRpc {
    calls: Mutex<Vec<String>>,
    pushed: Mutex<Vec<StimWireMessage>>,
}

impl RecordingRpc {
    fn record(&self, call: &str) {
        self.calls.lock().expect("calls lock").push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl HardwareRpc for RecordingRpc {
    fn start(&self) -> neurorig_core::Result<StatusReply> {
        self.record("start");
        Ok(StatusReply::success())
    }
    fn stop(&self) -> neurorig_core::Result<StatusReply> {
        self.record("stop");
        Ok(StatusReply::success())
    }
    fn start_recording(&self, info: &SaveInfo) -> neurorig_core::Result<StatusReply> {
        self.record(&format!("start_recording:{}:{:?}", info.tag, info.channels));
        Ok(StatusReply::success())
    }
    fn stop_recording(&self) -> neurorig_core::Result<StatusReply> {
        self.record("stop_recording");
        Ok(StatusReply::failure("not recording"))
    }
    fn update_variance_threshold(&self, update: &VarThresholds) -> neurorig_core::Result<StatusReply> {
        self.record(&format!("var_threshold:{}", update.update_chan.len()));
        Ok(StatusReply::success())
    }
    fn update_coefficient_threshold(
        &self,
        update: &CoefThresholds,
    ) -> neurorig_core::Result<StatusReply> {
        self.record(&format!("coef_threshold:{}", update.chan_threshold.len()));
        Ok(StatusReply::success())
    }
    fn count_spikes(&self, duration_ms: u32) -> neurorig_core::Result<Vec<u32>> {
        self.record(&format!("count:{}", duration_ms));
        Ok(vec![0, 3, 1])
    }
    fn push_stim_param(&self, message: &StimWireMessage) -> neurorig_core::Result<StatusReply> {
        self.record("stim_param");
        self.pushed.lock().expect("pushed lock").push(message.clone());
        Ok(StatusReply::success())
    }
    fn upload_stim_params(&self, channels: &ChannelsArray) -> neurorig_core::Result<StatusReply> {
        self.record(&format!("upload:{:?}", channels.channels));
        Ok(StatusReply::success())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    db: Arc<RigDb>,
    clock: Arc<ManualClock>,
    rpc: Arc<RecordingRpc>,
    lock: SessionLock,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = Arc::new(RigDb::new(dir.path().join("rig.db")).expect("db init"));
    db.upsert_experiment(&ExperimentRecord {
        token: "tok-1".to_string(),
        identity: "ana@lab.org".to_string(),
        name: "retina-a".to_string(),
        electrodes: [5u8, 6].into_iter().collect(),
        can_run: true,
    })
    .expect("register");

    let bookings = StaticBookings::default()
        .with("ana@lab.org", at(10, 0), at(11, 0))
        .expect("booking");
    let clock = Arc::new(ManualClock::new(at(10, 30)));
    let lock = SessionLock::new(db.clone(), db.clone(), Arc::new(bookings), clock.clone());
    Fixture {
        _dir: dir,
        db,
        clock,
        rpc: Arc::new(RecordingRpc::default()),
        lock,
    }
}

fn endpoint(addr: &str) -> TriggerEndpoint {
    TriggerEndpoint {
        addr: addr.to_string(),
        connect_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(500),
    }
}

fn start(fixture: &Fixture, trigger: TriggerEndpoint) -> RigSession {
    RigSession::start(fixture.lock.clone(), fixture.rpc.clone(), trigger, "tok-1").expect("start")
}

/// A second operator process joining the running session.
fn attach(fixture: &Fixture) -> RigSession {
    RigSession::attach(
        fixture.lock.clone(),
        fixture.rpc.clone(),
        endpoint("127.0.0.1:1"),
        "tok-1",
    )
    .expect("attach")
}

fn pushed(fixture: &Fixture) -> Vec<StimWireMessage> {
    fixture.rpc.pushed.lock().expect("pushed lock").clone()
}

#[test]
fn gated_calls_reach_the_device_while_owned() {
    let fixture = fixture();
    let mut rig = start(&fixture, endpoint("127.0.0.1:1"));

    rig.apply_edit(5, StimField::PhaseAmplitude1, FieldValue::Float(2.0))
        .expect("edit");
    let report = rig.send_stim(&[5]).expect("send");
    assert!(report.overall_ok());
    rig.upload_stim(None).expect("upload");
    rig.start_recording(&[5, 6], "baseline", true)
        .expect("record");
    rig.update_variance_threshold(&[(5, true)]).expect("var");
    rig.update_coefficient_threshold(&[(6, 1.5)]).expect("coef");
    assert_eq!(rig.count_spikes(1_000).expect("count"), vec![0, 3, 1]);

    assert_eq!(
        fixture.rpc.calls(),
        vec![
            "stim_param",
            "upload:[]",
            "start_recording:baseline:[5, 6]",
            "var_threshold:1",
            "coef_threshold:1",
            "count:1000",
        ]
    );
    rig.finish().expect("finish");
    assert!(!fixture.lock.status().expect("status").running);
}

#[test]
fn lapsed_window_blocks_every_hardware_call() {
    let fixture = fixture();
    let mut rig = start(&fixture, endpoint("127.0.0.1:1"));
    fixture.clock.set(at(11, 5));

    let errors = [
        rig.send_stim(&[5]).expect_err("send"),
        rig.upload_stim(None).expect_err("upload"),
        rig.start_recording(&[5], "late", false).expect_err("record"),
        rig.count_spikes(100).expect_err("count"),
    ];
    for err in errors {
        assert!(matches!(
            err,
            RigError::Authorization(AuthorizationError::WindowExpired { .. })
        ));
    }
    assert!(fixture.rpc.calls().is_empty());
}

#[test]
fn forced_release_blocks_the_old_owner() {
    let fixture = fixture();
    let rig = start(&fixture, endpoint("127.0.0.1:1"));
    fixture.lock.stop("tok-1").expect("operator stop");

    let err = rig.start_acquisition().expect_err("no longer owner");
    assert!(matches!(err, RigError::LockConflict(LockConflict::TokenMismatch)));
    assert!(fixture.rpc.calls().is_empty());
}

#[test]
fn device_refusal_is_reported() {
    let fixture = fixture();
    let rig = start(&fixture, endpoint("127.0.0.1:1"));
    let err = rig.stop_recording().expect_err("device refused");
    assert!(err.to_string().contains("not recording"));
    assert_eq!(err.class(), ErrorClass::Transport);
}

#[test]
fn input_ranges_are_checked_before_the_device() {
    let fixture = fixture();
    let rig = start(&fixture, endpoint("127.0.0.1:1"));

    for duration in [0, 30_001] {
        let err = rig.count_spikes(duration).expect_err("out of range");
        assert_eq!(err.class(), ErrorClass::Validation);
    }
    let err = rig
        .update_coefficient_threshold(&[(1, -0.5)])
        .expect_err("negative coef");
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(rig.update_variance_threshold(&[(128, true)]).is_err());
    assert!(fixture.rpc.calls().is_empty());
}

#[test]
fn trigger_after_window_end_writes_nothing() {
    let fixture = fixture();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let device = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read frames");
        received
    });

    let rig = start(&fixture, endpoint(&addr.to_string()));
    let mut channel = rig.open_trigger_channel().expect("open trigger");
    let frame = TriggerFrame::parse("1000000000000001").expect("frame");
    channel.send(&frame).expect("send in window");

    fixture.clock.set(at(11, 5));
    let err = channel.send(&frame).expect_err("window lapsed");
    assert_eq!(err.class(), ErrorClass::Authorization);
    drop(channel);

    let received = device.join().expect("device thread");
    assert_eq!(received, frame.as_bytes().to_vec());
}

#[test]
fn best_stim_param_is_loaded_fully_dirty() {
    let fixture = fixture();
    fixture
        .db
        .upsert_best_stim_param(&BestStimParam {
            electrode: 6,
            stim_shape: StimShape::BiphasicWithInterphaseDelay,
            polarity: StimPolarity::PositiveFirst,
            phase_duration1: 120.0,
            phase_duration2: 120.0,
            phase_amplitude1: 2.5,
            phase_amplitude2: 2.5,
            interphase_delay: 40.0,
            updated_at: at(9, 0),
        })
        .expect("seed best param");

    let mut rig = start(&fixture, endpoint("127.0.0.1:1"));
    assert!(rig.load_best_stim_param(6).expect("load"));
    assert!(!rig.load_best_stim_param(7).expect("load missing"));

    rig.send_stim(&[6]).expect("send");
    let pushed = fixture.rpc.pushed.lock().expect("pushed lock");
    assert_eq!(pushed[0].channel, 6);
    assert_eq!(pushed[0].interphasedelaymicroseconds, Some(40.0));
    assert_eq!(pushed[0].secondphaseamplitudemicroamps, Some(2.5));
}

#[test]
fn second_process_pushes_only_its_own_edit() {
    let fixture = fixture();
    fixture.lock.start("tok-1").expect("start");

    let mut first = attach(&fixture);
    first
        .apply_edit(5, StimField::NbPulse, FieldValue::Int(3))
        .expect("edit nb_pulse");
    first.send_stim(&[5]).expect("first send");
    drop(first);

    let mut second = attach(&fixture);
    assert_eq!(
        second.stim().param(5).expect("resumed").get(StimField::NbPulse),
        FieldValue::Int(3)
    );
    second
        .apply_edit(
            5,
            StimField::Polarity,
            FieldValue::Polarity(StimPolarity::PositiveFirst),
        )
        .expect("edit polarity");
    second.send_stim(&[5]).expect("second send");

    let pushed = pushed(&fixture);
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0].numberofstimpulses, Some(3));
    let mut expected = StimWireMessage::for_channel(5);
    expected.polarity = Some(WirePolarity::PositiveFirst);
    assert_eq!(pushed[1], expected);
}

#[test]
fn unsent_edit_is_pushed_by_the_next_process() {
    let fixture = fixture();
    fixture.lock.start("tok-1").expect("start");

    let mut first = attach(&fixture);
    first.send_stim(&[6]).expect("seed electrode 6");
    first
        .apply_edit(6, StimField::PhaseAmplitude1, FieldValue::Float(4.0))
        .expect("edit");
    drop(first);

    let mut second = attach(&fixture);
    second.send_stim(&[6]).expect("send staged edit");

    let mut expected = StimWireMessage::for_channel(6);
    expected.firstphaseamplitudemicroamps = Some(4.0);
    assert_eq!(pushed(&fixture)[1], expected);
}

#[test]
fn new_session_starts_from_a_full_record() {
    let fixture = fixture();
    let mut rig = start(&fixture, endpoint("127.0.0.1:1"));
    rig.send_stim(&[5]).expect("seed");
    rig.finish().expect("finish");

    let mut rig = start(&fixture, endpoint("127.0.0.1:1"));
    assert!(rig.stim().param(5).is_none());
    rig.send_stim(&[5]).expect("send after restart");

    let pushed = pushed(&fixture);
    assert_eq!(pushed.len(), 2);
    assert_eq!(pushed[0], pushed[1]);
    assert!(!pushed[1].is_key_only());
}

#[test]
fn trigger_after_stop_writes_nothing() {
    let fixture = fixture();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let device = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read frames");
        received
    });

    let rig = start(&fixture, endpoint(&addr.to_string()));
    let mut channel = rig.open_trigger_channel().expect("open trigger");
    fixture.lock.stop("tok-1").expect("operator stop");

    let frame = TriggerFrame::parse("1000000000000001").expect("frame");
    let err = channel.send(&frame).expect_err("no longer owner");
    assert_eq!(err.class(), ErrorClass::LockConflict);
    drop(channel);

    assert!(device.join().expect("device thread").is_empty());
}
