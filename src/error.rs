//! Error types shared by the dataflow runtime and the pipeline stages.

use std::time::Duration;
use thiserror::Error;

/// The consumer half of a channel is gone; the item that could not be delivered is handed back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("channel closed: consumer is gone")]
pub struct ChannelClosed<T>(pub T);

impl<T> ChannelClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Every branch of a fan-out send failed (or there were none to try).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fan-out delivered to none of {attempted} consumer(s)")]
pub struct FanOutError {
    pub attempted: usize,
}

/// Lookup-table interpolation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("lookup table has {0} entries, at least 2 are needed to interpolate")]
    TooFewEntries(usize),

    #[error("{value} is below {min}, the smallest entry in the table")]
    BelowRange { value: f64, min: f64 },

    #[error("{value} is above {max}, the largest entry in the table")]
    AboveRange { value: f64, max: f64 },

    #[error("cannot interpolate a NaN input")]
    NotANumber,
}

/// Rejected preference records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreferencesError {
    #[error("forced brightness {0} lm is outside 0..=600")]
    ForcedLumensOutOfRange(f64),

    #[error("desired brightness {0} lm is outside 0..=2000")]
    DesiredLumensOutOfRange(f64),

    #[error("timer at weekday {weekday} {hour:02}:{minute:02} is not a valid time of the week")]
    InvalidTime { weekday: u8, hour: u8, minute: u8 },
}

/// Malformed frames on the remote link.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to register with the remote proxy. Fatal to the attempt; the caller decides on retries.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("proxy did not acknowledge registration within {0:?}")]
    Timeout(Duration),

    #[error("proxy closed the connection during the handshake")]
    ConnectionClosed,

    #[error("expected a registration acknowledgement, got {0}")]
    UnexpectedMessage(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Invalid configuration (file or environment).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is {value:?} but it needs to be exactly True or False")]
    InvalidFlag { name: String, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be at least 1")]
    ZeroValue(&'static str),
}

/// A fault inside a pipeline stage. Returned from the stage future, it ends the whole process.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("[{stage}] off-scheduler call failed: {source}")]
    Join {
        stage: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("[{stage}] collaborator failed: {message}")]
    Collaborator { stage: &'static str, message: String },

    #[error("[{stage}] I/O error: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] remote link failed: {source}")]
    Protocol {
        stage: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("[{stage}] handshake failed: {source}")]
    Handshake {
        stage: &'static str,
        #[source]
        source: HandshakeError,
    },
}

pub type StageResult<T = ()> = std::result::Result<T, StageError>;
