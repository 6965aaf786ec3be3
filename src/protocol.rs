//! Remote protocol - messages exchanged with the cloud proxy and their wire framing.
//!
//! Every frame is a big-endian `u32` payload length followed by a MessagePack payload.
//! Both directions are closed enums; a payload naming an unknown variant fails to
//! decode without desynchronising the stream.

use crate::archive::HistoryEvent;
use crate::error::ProtocolError;
use crate::types::{Frame, Preferences, UserSlot};
use chrono::{DateTime, Local, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload either side may send.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromMicrocontroller {
    /// First message on every connection.
    Register { id: String },
    /// For every user of this appliance.
    BroadcastData(BroadcastData),
    /// For the listed users only.
    UserSpecificData(UserSpecificData, Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastData {
    DutyCycle { duty_cycle: f64 },
    IntruderAlert { image: Frame, timestamp: DateTime<Local> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserSpecificData {
    CameraFrame { image: Frame },
    Preferences { user_slot: UserSlot, preferences: Preferences },
    History { date: NaiveDate, events: Vec<HistoryEvent> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromProxy {
    /// Acknowledges `Register`.
    Registered,
    /// A remote user opened the app and wants the current state.
    LoginRequest { user_id: String },
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    AddNewTrustedUser { user_slot: UserSlot },
    CameraFeedInterest { user_id: String, wants_camera_feed: bool },
    RequestDutyCycle,
    RequestHistory { user_id: String, date: NaiveDate },
    SetPreferences { user_slot: UserSlot, preferences: Preferences },
}

impl FromProxy {
    /// Variant name for logs (payloads can be large).
    pub fn kind(&self) -> &'static str {
        match self {
            FromProxy::Registered => "Registered",
            FromProxy::LoginRequest { .. } => "LoginRequest",
            FromProxy::Command(Command::AddNewTrustedUser { .. }) => "Command::AddNewTrustedUser",
            FromProxy::Command(Command::CameraFeedInterest { .. }) => "Command::CameraFeedInterest",
            FromProxy::Command(Command::RequestDutyCycle) => "Command::RequestDutyCycle",
            FromProxy::Command(Command::RequestHistory { .. }) => "Command::RequestHistory",
            FromProxy::Command(Command::SetPreferences { .. }) => "Command::SetPreferences",
        }
    }
}

impl FromMicrocontroller {
    pub fn kind(&self) -> &'static str {
        match self {
            FromMicrocontroller::Register { .. } => "Register",
            FromMicrocontroller::BroadcastData(BroadcastData::DutyCycle { .. }) => "BroadcastData::DutyCycle",
            FromMicrocontroller::BroadcastData(BroadcastData::IntruderAlert { .. }) => "BroadcastData::IntruderAlert",
            FromMicrocontroller::UserSpecificData(UserSpecificData::CameraFrame { .. }, _) => {
                "UserSpecificData::CameraFrame"
            }
            FromMicrocontroller::UserSpecificData(UserSpecificData::Preferences { .. }, _) => {
                "UserSpecificData::Preferences"
            }
            FromMicrocontroller::UserSpecificData(UserSpecificData::History { .. }, _) => "UserSpecificData::History",
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(payload)?)
}

/// Reads length-prefixed frames.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    /// Next message, or `None` when the peer closed the connection between frames.
    ///
    /// A payload that fails to decode is reported as [`ProtocolError::Decode`]; the
    /// stream stays usable. Any other error leaves the stream in an unknown state.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge(len, self.max_frame));
        }

        let mut payload = vec![0; len];
        self.inner.read_exact(&mut payload).await?;
        decode(&payload).map(Some)
    }
}

/// Writes length-prefixed frames.
pub struct FrameWriter<W> {
    inner: W,
    max_frame: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let payload = encode(message)?;
        if payload.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge(payload.len(), self.max_frame));
        }
        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge(payload.len(), self.max_frame))?;

        self.inner.write_u32(len).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
