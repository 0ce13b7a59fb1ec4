use neurorig_core::config::RigConfig;
use neurorig_core::{
    activate_uv, load_config, ExperimentRecord, FieldValue, HardwareRpc, LockStore, Result,
    RigDb, RigError, RigSession, RpcClient, SessionLock, SqliteBookingAuthority, StimField,
    SystemClock, TriggerEndpoint, TriggerFrame,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Context {
    config: RigConfig,
    db: Arc<RigDb>,
}

impl Context {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config = load_config(config_path)?;
        let db = Arc::new(RigDb::new(config.store.path.clone())?);
        Ok(Self { config, db })
    }

    fn lock(&self) -> SessionLock {
        SessionLock::new(
            self.db.clone(),
            self.db.clone(),
            Arc::new(SqliteBookingAuthority::new(self.config.bookings.path.clone())),
            Arc::new(SystemClock),
        )
    }

    fn rpc(&self) -> Arc<dyn HardwareRpc> {
        let hardware = &self.config.hardware;
        Arc::new(RpcClient::new(
            hardware.rpc_addr.clone(),
            hardware.connect_timeout(),
            hardware.rpc_timeout(),
        ))
    }

    fn trigger_endpoint(&self) -> TriggerEndpoint {
        let hardware = &self.config.hardware;
        TriggerEndpoint {
            addr: hardware.trigger_addr.clone(),
            connect_timeout: hardware.connect_timeout(),
            write_timeout: hardware.trigger_timeout(),
        }
    }

    fn attach(&self, token: &str) -> Result<RigSession> {
        RigSession::attach(self.lock(), self.rpc(), self.trigger_endpoint(), token)
    }
}

pub fn status(ctx: &Context) -> Result<()> {
    print_json(&ctx.db.load()?);
    Ok(())
}

pub fn maintenance(ctx: &Context, enabled: bool) -> Result<()> {
    ctx.lock().set_maintenance(enabled)?;
    print_json(&ctx.db.load()?);
    Ok(())
}

pub fn register(
    ctx: &Context,
    token: String,
    identity: String,
    name: String,
    electrodes: Vec<u8>,
    can_run: bool,
) -> Result<()> {
    let record = ExperimentRecord {
        token,
        identity,
        name,
        electrodes: electrodes.into_iter().collect(),
        can_run,
    };
    ctx.db.upsert_experiment(&record)?;
    tracing::info!(token = %record.token, experiment = %record.name, "Experiment registered");
    print_json(&record);
    Ok(())
}

pub fn start(ctx: &Context, token: &str) -> Result<()> {
    let session = ctx.lock().start(token)?;
    print_json(&session);
    Ok(())
}

pub fn stop(ctx: &Context, token: &str) -> Result<()> {
    ctx.lock().stop(token)
}

pub fn trigger(ctx: &Context, token: &str, pattern: &str) -> Result<()> {
    let frame = TriggerFrame::parse(pattern)?;
    let rig = ctx.attach(token)?;
    let mut channel = rig.open_trigger_channel()?;
    channel.send(&frame)?;
    channel.close();
    Ok(())
}

pub fn stim(
    ctx: &Context,
    token: &str,
    electrode: u8,
    edits: &[String],
    from_best: bool,
    upload: bool,
) -> Result<()> {
    let parsed = edits
        .iter()
        .map(|edit| parse_edit(edit))
        .collect::<Result<Vec<_>>>()?;

    let mut rig = ctx.attach(token)?;
    if from_best && !rig.load_best_stim_param(electrode)? {
        tracing::warn!(electrode, "No stored best parameter; starting from defaults");
    }
    for (field, value) in parsed {
        rig.apply_edit(electrode, field, value)?;
    }

    let report = rig.send_stim(&[electrode])?;
    println!("{}", report);
    if upload {
        print_json(&rig.upload_stim(Some(&[electrode]))?);
    }
    Ok(())
}

pub fn upload(ctx: &Context, token: &str, electrodes: Option<&[u8]>) -> Result<()> {
    let mut rig = ctx.attach(token)?;
    print_json(&rig.upload_stim(electrodes)?);
    Ok(())
}

pub fn record_start(
    ctx: &Context,
    token: &str,
    channels: &[u8],
    tag: &str,
    triggers: bool,
) -> Result<()> {
    let rig = ctx.attach(token)?;
    print_json(&rig.start_recording(channels, tag, triggers)?);
    Ok(())
}

pub fn record_stop(ctx: &Context, token: &str) -> Result<()> {
    let rig = ctx.attach(token)?;
    print_json(&rig.stop_recording()?);
    Ok(())
}

pub fn threshold_var(ctx: &Context, token: &str, channels: &[u8], enable: bool) -> Result<()> {
    let updates: Vec<(u8, bool)> = channels.iter().map(|channel| (*channel, enable)).collect();
    let rig = ctx.attach(token)?;
    print_json(&rig.update_variance_threshold(&updates)?);
    Ok(())
}

pub fn threshold_coef(ctx: &Context, token: &str, channels: &[u8], coef: f32) -> Result<()> {
    let updates: Vec<(u8, f32)> = channels.iter().map(|channel| (*channel, coef)).collect();
    let rig = ctx.attach(token)?;
    print_json(&rig.update_coefficient_threshold(&updates)?);
    Ok(())
}

pub fn count(ctx: &Context, token: &str, duration_ms: u32) -> Result<()> {
    let rig = ctx.attach(token)?;
    print_json(&rig.count_spikes(duration_ms)?);
    Ok(())
}

pub fn best_stim(ctx: &Context, electrode: u8) -> Result<()> {
    use neurorig_core::ExperimentDirectory;

    match ctx.db.best_stim_param(electrode)? {
        Some(best) => print_json(&best),
        None => println!("null"),
    }
    Ok(())
}

pub fn uv(ctx: &Context, duration: i32) -> Result<()> {
    let hardware = &ctx.config.hardware;
    activate_uv(&hardware.uv_addr, duration, hardware.uv_timeout())
}

/// Splits `field=value` and parses the value for that field.
fn parse_edit(raw: &str) -> Result<(StimField, FieldValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| RigError::validation("edit", format!("'{}' is not field=value", raw)))?;
    let field: StimField = name.trim().parse()?;
    let value = FieldValue::parse(field, value)?;
    Ok((field, value))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(err) => tracing::warn!(error = %err, "Failed to render output"),
    }
}
