//! UV lamp activation: one little-endian `i32` duration per connection.

use neurorig_protocol::encode_uv_duration;
use std::io::Write;
use std::time::Duration;

use crate::error::{Result, RigError};
use crate::hardware::{connect, transport};

/// Fires the UV lamp for `duration` (device units, at least 1).
pub fn activate_uv(addr: &str, duration: i32, timeout: Duration) -> Result<()> {
    let payload = uv_payload(duration)?;

    let mut stream = connect(addr, timeout)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|source| transport("Failed to set UV write timeout", source))?;
    stream
        .write_all(&payload)
        .map_err(|source| transport("Failed to write UV activation", source))?;
    stream.flush().ok();

    tracing::info!(addr = %addr, duration, "UV activation sent");
    Ok(())
}

fn uv_payload(duration: i32) -> Result<[u8; 4]> {
    if duration < 1 {
        return Err(RigError::validation(
            "uv duration",
            format!("{} must be at least 1", duration),
        ));
    }
    Ok(encode_uv_duration(duration))
}
