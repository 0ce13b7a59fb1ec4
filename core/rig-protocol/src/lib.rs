//! Wire protocol types for the rig's hardware services.
//!
//! This crate is shared by the control core and by anything that speaks to the
//! rig on its behalf (device adapters, simulators, test doubles) so the two
//! sides cannot drift. Requests and responses are newline-delimited JSON
//! envelopes; trigger and UV frames are raw bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024; // 1MB

/// Number of digital trigger lines on the rig; one byte per line on the wire.
pub const TRIGGER_FRAME_LEN: usize = 16;

/// Highest addressable electrode / recording channel.
pub const MAX_CHANNEL: u32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Start,
    Stop,
    StartRecording,
    StopRecording,
    VarThreshold,
    CoefThreshold,
    Count,
    StimParam,
    UploadStimParam,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }
}

/// Outcome reported by the device for every control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReply {
    pub fn success() -> Self {
        Self {
            status: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: Some(message.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recording / threshold payloads
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveInfo {
    pub channels: Vec<u32>,
    pub tag: String,
    pub triggers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarThreshold {
    pub channel: u32,
    pub update: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoefThreshold {
    pub channel: u32,
    pub coef_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarThresholds {
    pub update_chan: Vec<VarThreshold>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoefThresholds {
    pub chan_threshold: Vec<CoefThreshold>,
}

/// Channel selection for `upload_stim_param`. An empty list means every channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelsArray {
    pub channels: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationCount {
    /// Counting window in milliseconds.
    pub time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CountArray {
    pub counts: Vec<u32>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stimulation parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// Device shape codes. Code 2 is unused by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WireShape {
    Biphasic,
    BiphasicWithInterphaseDelay,
    Triphasic,
}

impl From<WireShape> for u8 {
    fn from(shape: WireShape) -> u8 {
        match shape {
            WireShape::Biphasic => 0,
            WireShape::BiphasicWithInterphaseDelay => 1,
            WireShape::Triphasic => 3,
        }
    }
}

impl TryFrom<u8> for WireShape {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(WireShape::Biphasic),
            1 => Ok(WireShape::BiphasicWithInterphaseDelay),
            3 => Ok(WireShape::Triphasic),
            other => Err(format!("unknown shape code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WirePolarity {
    NegativeFirst,
    PositiveFirst,
}

impl From<WirePolarity> for u8 {
    fn from(polarity: WirePolarity) -> u8 {
        match polarity {
            WirePolarity::NegativeFirst => 0,
            WirePolarity::PositiveFirst => 1,
        }
    }
}

impl TryFrom<u8> for WirePolarity {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(WirePolarity::NegativeFirst),
            1 => Ok(WirePolarity::PositiveFirst),
            other => Err(format!("unknown polarity code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PulseMode {
    SinglePulse,
    PulseTrain,
}

impl From<PulseMode> for u8 {
    fn from(mode: PulseMode) -> u8 {
        match mode {
            PulseMode::SinglePulse => 0,
            PulseMode::PulseTrain => 1,
        }
    }
}

impl TryFrom<u8> for PulseMode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PulseMode::SinglePulse),
            1 => Ok(PulseMode::PulseTrain),
            other => Err(format!("unknown pulse mode {}", other)),
        }
    }
}

/// Partial stimulation update for one channel.
///
/// `channel` is always present; every other field is only serialized when it
/// changed since the previous update for that channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimWireMessage {
    pub channel: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<WireShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<WirePolarity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimenabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstphasedurationmicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondphasedurationmicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstphaseamplitudemicroamps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondphaseamplitudemicroamps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posttriggerdelaymicroseconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<PulseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numberofstimpulses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulsetrainperiodmicroseconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refractoryperiodmicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enableampsettle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prestimampsettlemicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststimampsettlemicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enablechargerecovery: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststimchargerecovonmicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poststimchargerecovoffmicroseconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interphasedelaymicroseconds: Option<f64>,
}

impl StimWireMessage {
    pub fn for_channel(channel: u32) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    /// True when the message carries nothing beyond the channel key.
    pub fn is_key_only(&self) -> bool {
        *self == Self::for_channel(self.channel)
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.channel > MAX_CHANNEL {
            return Err(ErrorInfo::new(
                "invalid_channel",
                format!("channel must be 0..={}", MAX_CHANNEL),
            ));
        }
        if self.pulse == Some(PulseMode::PulseTrain) && self.numberofstimpulses.is_none() {
            return Err(ErrorInfo::new(
                "invalid_pulse",
                "pulse train requires numberofstimpulses",
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Raw socket frames
// ═══════════════════════════════════════════════════════════════════════════════

/// Encodes a UV activation as the single little-endian i32 the lamp expects.
pub fn encode_uv_duration(duration: i32) -> [u8; 4] {
    duration.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_only_message_serializes_channel_alone() {
        let message = StimWireMessage::for_channel(5);
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value, serde_json::json!({ "channel": 5 }));
        assert!(message.is_key_only());
    }

    #[test]
    fn wire_enums_serialize_as_device_codes() {
        let message = StimWireMessage {
            shape: Some(WireShape::Triphasic),
            polarity: Some(WirePolarity::PositiveFirst),
            pulse: Some(PulseMode::PulseTrain),
            numberofstimpulses: Some(3),
            ..StimWireMessage::for_channel(9)
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["shape"], 3);
        assert_eq!(value["polarity"], 1);
        assert_eq!(value["pulse"], 1);
        assert!(!message.is_key_only());
    }

    #[test]
    fn rejects_unknown_shape_code() {
        let parsed: Result<StimWireMessage, _> =
            serde_json::from_value(serde_json::json!({ "channel": 1, "shape": 2 }));
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_channel() {
        let err = StimWireMessage::for_channel(128)
            .validate()
            .expect_err("channel 128 is out of range");
        assert_eq!(err.code, "invalid_channel");
    }

    #[test]
    fn validate_requires_count_for_pulse_train() {
        let message = StimWireMessage {
            pulse: Some(PulseMode::PulseTrain),
            ..StimWireMessage::for_channel(1)
        };
        assert!(message.validate().is_err());
    }

    #[test]
    fn status_reply_omits_missing_message() {
        let value = serde_json::to_value(StatusReply::success()).expect("serialize");
        assert_eq!(value, serde_json::json!({ "status": true }));
    }

    #[test]
    fn uv_duration_is_little_endian() {
        assert_eq!(encode_uv_duration(258), [2, 1, 0, 0]);
    }
}
