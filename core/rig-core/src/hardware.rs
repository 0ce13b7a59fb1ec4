//! Client for the rig's hardware RPC service.
//!
//! One request per connection: connect, write a JSON line, read a JSON line.
//! Every step is bounded by a timeout so a stuck device fails the call instead
//! of the caller.

use chrono::Utc;
use neurorig_protocol::{
    ChannelsArray, CoefThresholds, CountArray, DurationCount, Method, Request, Response,
    SaveInfo, StatusReply, StimWireMessage, VarThresholds, MAX_RESPONSE_BYTES, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Result, RigError};

const READ_CHUNK_SIZE: usize = 4096;

/// Operations the core needs from the hardware service.
pub trait HardwareRpc: Send + Sync {
    fn start(&self) -> Result<StatusReply>;
    fn stop(&self) -> Result<StatusReply>;
    fn start_recording(&self, info: &SaveInfo) -> Result<StatusReply>;
    fn stop_recording(&self) -> Result<StatusReply>;
    fn update_variance_threshold(&self, update: &VarThresholds) -> Result<StatusReply>;
    fn update_coefficient_threshold(&self, update: &CoefThresholds) -> Result<StatusReply>;
    fn count_spikes(&self, duration_ms: u32) -> Result<Vec<u32>>;
    fn push_stim_param(&self, message: &StimWireMessage) -> Result<StatusReply>;
    /// Moves staged parameters to the headstage. Empty `channels` means all.
    fn upload_stim_params(&self, channels: &ChannelsArray) -> Result<StatusReply>;
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            io_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn call<T: DeserializeOwned>(&self, method: Method, params: Option<Value>) -> Result<T> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(make_request_id()),
            params,
        };
        tracing::debug!(method = ?request.method, id = ?request.id, addr = %self.addr, "Hardware request");

        let mut stream = connect(&self.addr, self.connect_timeout)?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .map_err(|source| transport("Failed to set read timeout", source))?;
        stream
            .set_write_timeout(Some(self.io_timeout))
            .map_err(|source| transport("Failed to set write timeout", source))?;

        let mut payload = serde_json::to_vec(&request).map_err(|err| RigError::Protocol {
            details: format!("Failed to serialize request: {}", err),
        })?;
        payload.push(b'\n');
        stream
            .write_all(&payload)
            .map_err(|source| transport("Failed to write request", source))?;
        stream.flush().ok();

        let response = read_response(&mut stream)?;
        if response.id.is_some() && response.id != request.id {
            return Err(RigError::Protocol {
                details: format!(
                    "Response id {:?} does not match request id {:?}",
                    response.id, request.id
                ),
            });
        }
        if !response.ok {
            let details = response
                .error
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| "Unknown device error".to_string());
            return Err(RigError::Protocol { details });
        }

        let data = response.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|err| RigError::Protocol {
            details: format!("Failed to parse {:?} reply: {}", method, err),
        })
    }

    fn call_with<P: serde::Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        params: &P,
    ) -> Result<T> {
        let params = serde_json::to_value(params).map_err(|err| RigError::Protocol {
            details: format!("Failed to serialize {:?} params: {}", method, err),
        })?;
        self.call(method, Some(params))
    }
}

impl HardwareRpc for RpcClient {
    fn start(&self) -> Result<StatusReply> {
        self.call(Method::Start, None)
    }

    fn stop(&self) -> Result<StatusReply> {
        self.call(Method::Stop, None)
    }

    fn start_recording(&self, info: &SaveInfo) -> Result<StatusReply> {
        self.call_with(Method::StartRecording, info)
    }

    fn stop_recording(&self) -> Result<StatusReply> {
        self.call(Method::StopRecording, None)
    }

    fn update_variance_threshold(&self, update: &VarThresholds) -> Result<StatusReply> {
        self.call_with(Method::VarThreshold, update)
    }

    fn update_coefficient_threshold(&self, update: &CoefThresholds) -> Result<StatusReply> {
        self.call_with(Method::CoefThreshold, update)
    }

    fn count_spikes(&self, duration_ms: u32) -> Result<Vec<u32>> {
        let counts: CountArray = self.call_with(Method::Count, &DurationCount { time: duration_ms })?;
        Ok(counts.counts)
    }

    fn push_stim_param(&self, message: &StimWireMessage) -> Result<StatusReply> {
        self.call_with(Method::StimParam, message)
    }

    fn upload_stim_params(&self, channels: &ChannelsArray) -> Result<StatusReply> {
        self.call_with(Method::UploadStimParam, channels)
    }
}

/// Connects to the first address `addr` resolves to, bounded by `timeout`.
pub(crate) fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let resolved: SocketAddr = addr
        .to_socket_addrs()
        .map_err(|source| RigError::Connection {
            target: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| RigError::Connection {
            target: addr.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address did not resolve",
            ),
        })?;

    TcpStream::connect_timeout(&resolved, timeout).map_err(|source| RigError::Connection {
        target: addr.to_string(),
        source,
    })
}

pub(crate) fn transport(context: &str, source: std::io::Error) -> RigError {
    RigError::Transport {
        context: context.to_string(),
        source,
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_RESPONSE_BYTES {
                    return Err(RigError::Protocol {
                        details: "Response exceeded maximum size".to_string(),
                    });
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(transport("Timed out waiting for device response", err));
            }
            Err(err) => return Err(transport("Failed to read response", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(RigError::Protocol {
            details: "Device response was empty".to_string(),
        });
    }

    serde_json::from_slice(response_bytes).map_err(|err| RigError::Protocol {
        details: format!("Failed to parse response JSON: {}", err),
    })
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!("req-{}-{:x}", Utc::now().timestamp_millis(), random.next_u64())
}
