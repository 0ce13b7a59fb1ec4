//! Trigger-line output for a running session.
//!
//! A channel holds one connection for the session's lifetime. Every send checks
//! that the session still owns the rig and is inside its booking window; once
//! either fails nothing reaches the socket. A failed write closes the channel.

use neurorig_protocol::TRIGGER_FRAME_LEN;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Result, RigError};
use crate::hardware::{connect, transport};
use crate::session::{Session, SessionLock};

/// Sixteen trigger lines, each 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerFrame([u8; TRIGGER_FRAME_LEN]);

impl TriggerFrame {
    pub fn from_slice(lines: &[u8]) -> Result<Self> {
        let bytes: [u8; TRIGGER_FRAME_LEN] = lines.try_into().map_err(|_| {
            RigError::validation(
                "trigger frame",
                format!("expected {} lines, got {}", TRIGGER_FRAME_LEN, lines.len()),
            )
        })?;
        if let Some(position) = bytes.iter().position(|line| *line > 1) {
            return Err(RigError::validation(
                "trigger frame",
                format!("line {} is {}, expected 0 or 1", position, bytes[position]),
            ));
        }
        Ok(Self(bytes))
    }

    /// Parses a pattern such as `0100000000000001` or `0,1,0,...`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let lines = pattern
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .map(|c| match c {
                '0' => Ok(0),
                '1' => Ok(1),
                other => Err(RigError::validation(
                    "trigger frame",
                    format!("unexpected character '{}'", other),
                )),
            })
            .collect::<Result<Vec<u8>>>()?;
        Self::from_slice(&lines)
    }

    pub fn as_bytes(&self) -> &[u8; TRIGGER_FRAME_LEN] {
        &self.0
    }
}

pub struct TriggerChannel<T: Write = TcpStream> {
    transport: Option<T>,
    lock: SessionLock,
    session: Session,
}

impl TriggerChannel<TcpStream> {
    /// Opens the trigger socket with bounded connect and write timeouts.
    pub fn connect(
        addr: &str,
        lock: SessionLock,
        session: Session,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let stream = connect(addr, connect_timeout)?;
        stream
            .set_write_timeout(Some(write_timeout))
            .map_err(|source| transport("Failed to set trigger write timeout", source))?;
        stream.set_nodelay(true).ok();
        tracing::info!(addr = %addr, "Trigger channel open");
        Ok(Self::from_transport(stream, lock, session))
    }
}

impl<T: Write> TriggerChannel<T> {
    pub fn from_transport(transport: T, lock: SessionLock, session: Session) -> Self {
        Self {
            transport: Some(transport),
            lock,
            session,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Writes one frame. Fails without writing when the session lost the rig
    /// or its window has lapsed.
    pub fn send(&mut self, frame: &TriggerFrame) -> Result<()> {
        self.lock.verify_owner(&self.session)?;

        let stream = self.transport.as_mut().ok_or_else(|| {
            transport(
                "Trigger channel is closed",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )
        })?;
        let written = stream
            .write_all(frame.as_bytes())
            .and_then(|()| stream.flush());
        if let Err(source) = written {
            tracing::warn!(token = %self.session.token, error = %source, "Trigger write failed; closing channel");
            self.transport = None;
            return Err(transport("Failed to write trigger frame", source));
        }
        tracing::debug!(frame = ?frame.as_bytes(), "Trigger frame sent");
        Ok(())
    }

    /// Flushes and drops the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.flush() {
                tracing::debug!(error = %err, "Trigger flush on close failed");
            }
            tracing::debug!("Trigger channel closed");
        }
    }

    /// Hands back the underlying transport, leaving the channel closed.
    pub fn into_inner(mut self) -> Option<T> {
        self.transport.take()
    }
}

impl<T: Write> Drop for TriggerChannel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
