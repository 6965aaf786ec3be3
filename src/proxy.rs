//! Proxy connector - the link between the pipeline and the cloud proxy.
//!
//! Outbound messages from every stage are merged into one stream of frames; inbound
//! commands are dispatched to the stage that handles them. Without a configured
//! endpoint the connector runs offline: it drains and logs what would have been sent.

use crate::archive::{HistoryForUser, HistoryRequest};
use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::error::{HandshakeError, ProtocolError, StageError, StageResult};
use crate::protocol::{BroadcastData, Command, FrameReader, FrameWriter, FromMicrocontroller, FromProxy, UserSpecificData};
use crate::stage_context;
use crate::types::{
    AddTrustedUser, CameraFeedInterest, CameraFrameForUsers, DutyCycle, DutyCycleRequest, IntruderAlert,
    PreferencesChanged, PreferencesUpdate,
};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection attempts before the connector gives up.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Opens a byte stream to the proxy.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<(BoxReader, BoxWriter)>;

    /// Where this connects to, for logs.
    fn endpoint(&self) -> String;
}

pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<(BoxReader, BoxWriter)> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((Box::new(read), Box::new(write)))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// How the connector reaches the proxy.
pub enum ProxyLink {
    Offline,
    Remote {
        connector: Box<dyn Connector>,
        microcontroller_id: String,
        handshake_timeout: Duration,
        max_frame: usize,
    },
}

pub struct ProxyInputs {
    pub from_archive_duty_cycle: Receiver<DutyCycle>,
    pub from_archive_camera_frame: Receiver<CameraFrameForUsers>,
    pub from_archive_history: Receiver<HistoryForUser>,
    pub from_identification_alert: Receiver<IntruderAlert>,
    pub from_preferences: Receiver<PreferencesChanged>,
}

pub struct ProxyOutputs {
    pub to_identification_add_user: Sender<AddTrustedUser>,
    pub to_archive_camera_interest: Sender<CameraFeedInterest>,
    pub to_archive_duty_cycle_request: Sender<DutyCycleRequest>,
    pub to_archive_history_request: Sender<HistoryRequest>,
    pub to_preferences: Sender<PreferencesUpdate>,
}

/// Register with the proxy: send `Register` and wait for `Registered`.
pub async fn handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    microcontroller_id: &str,
    timeout: Duration,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .send(&FromMicrocontroller::Register {
            id: microcontroller_id.to_string(),
        })
        .await?;

    match tokio::time::timeout(timeout, reader.recv::<FromProxy>()).await {
        Err(_) => Err(HandshakeError::Timeout(timeout)),
        Ok(Ok(Some(FromProxy::Registered))) => Ok(()),
        Ok(Ok(Some(other))) => Err(HandshakeError::UnexpectedMessage(other.kind().to_string())),
        Ok(Ok(None)) => Err(HandshakeError::ConnectionClosed),
        Ok(Err(e)) => Err(e.into()),
    }
}

pub async fn run(ctx: StageContext, inputs: ProxyInputs, outputs: ProxyOutputs, link: ProxyLink) -> StageResult {
    ctx.startup();

    match link {
        ProxyLink::Offline => {
            log::warn!(target: ctx.target(), "no proxy endpoint configured, running offline");
            drop(outputs);
            offline(stage_context!("proxy", "offline"), inputs).await?;
        }
        ProxyLink::Remote {
            connector,
            microcontroller_id,
            handshake_timeout,
            max_frame,
        } => {
            let (mut reader, mut writer) = connect(&ctx, connector.as_ref(), &microcontroller_id, handshake_timeout, max_frame).await?;
            log::info!(target: ctx.target(), "registered with {} as {}", connector.endpoint(), microcontroller_id);

            // Whichever side finishes first ends the link.
            tokio::select! {
                result = outbound(stage_context!("proxy", "outbound"), inputs, &mut writer) => result?,
                result = inbound(stage_context!("proxy", "inbound"), &mut reader, outputs) => result?,
            }

            if let Err(e) = writer.shutdown().await {
                log::debug!(target: ctx.target(), "closing the connection: {}", e);
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

/// Connect and register, retrying with exponential backoff.
async fn connect(
    ctx: &StageContext,
    connector: &dyn Connector,
    microcontroller_id: &str,
    handshake_timeout: Duration,
    max_frame: usize,
) -> StageResult<(FrameReader<BoxReader>, FrameWriter<BoxWriter>)> {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 1;

    loop {
        let failure = match connector.connect().await {
            Ok((read, write)) => {
                let mut reader = FrameReader::new(read, max_frame);
                let mut writer = FrameWriter::new(write, max_frame);
                match handshake(&mut reader, &mut writer, microcontroller_id, handshake_timeout).await {
                    Ok(()) => return Ok((reader, writer)),
                    Err(e) => e,
                }
            }
            Err(e) => HandshakeError::Protocol(e.into()),
        };

        if attempt >= CONNECT_ATTEMPTS {
            return Err(ctx.fault(StageError::Handshake {
                stage: ctx.target(),
                source: failure,
            }));
        }
        log::warn!(
            target: ctx.target(),
            "connecting to {} failed (attempt {}/{}): {}; retrying in {:?}",
            connector.endpoint(),
            attempt,
            CONNECT_ATTEMPTS,
            failure,
            backoff
        );
        tokio::time::sleep(backoff).await;
        backoff *= 2;
        attempt += 1;
    }
}

/// Everything the stages want to tell the proxy, one message at a time.
enum Outbound {
    DutyCycle(DutyCycle),
    CameraFrame(CameraFrameForUsers),
    History(HistoryForUser),
    IntruderAlert(IntruderAlert),
    Preferences(PreferencesChanged),
}

impl Outbound {
    fn into_message(self) -> FromMicrocontroller {
        match self {
            Outbound::DutyCycle(DutyCycle { duty_cycle }) => {
                FromMicrocontroller::BroadcastData(BroadcastData::DutyCycle { duty_cycle })
            }
            Outbound::IntruderAlert(IntruderAlert { image, timestamp }) => {
                FromMicrocontroller::BroadcastData(BroadcastData::IntruderAlert { image, timestamp })
            }
            Outbound::CameraFrame(CameraFrameForUsers { frame, user_ids }) => {
                FromMicrocontroller::UserSpecificData(UserSpecificData::CameraFrame { image: frame }, user_ids)
            }
            Outbound::History(HistoryForUser { user_id, date, events }) => {
                FromMicrocontroller::UserSpecificData(UserSpecificData::History { date, events }, vec![user_id])
            }
            // The proxy resolves the slot to its users.
            Outbound::Preferences(PreferencesChanged { user_slot, preferences }) => {
                FromMicrocontroller::UserSpecificData(UserSpecificData::Preferences { user_slot, preferences }, Vec::new())
            }
        }
    }
}

/// Merges every outbound input. `None` once all of them are closed.
struct FanIn {
    inputs: ProxyInputs,
    open: [bool; 5],
}

impl FanIn {
    fn new(inputs: ProxyInputs) -> Self {
        Self { inputs, open: [true; 5] }
    }

    async fn next(&mut self) -> Option<Outbound> {
        let inputs = &mut self.inputs;
        let open = &mut self.open;

        while open.iter().any(|open| *open) {
            tokio::select! {
                message = inputs.from_archive_duty_cycle.recv(), if open[0] => match message {
                    Some(message) => return Some(Outbound::DutyCycle(message)),
                    None => open[0] = false,
                },
                message = inputs.from_archive_camera_frame.recv(), if open[1] => match message {
                    Some(message) => return Some(Outbound::CameraFrame(message)),
                    None => open[1] = false,
                },
                message = inputs.from_archive_history.recv(), if open[2] => match message {
                    Some(message) => return Some(Outbound::History(message)),
                    None => open[2] = false,
                },
                message = inputs.from_identification_alert.recv(), if open[3] => match message {
                    Some(message) => return Some(Outbound::IntruderAlert(message)),
                    None => open[3] = false,
                },
                message = inputs.from_preferences.recv(), if open[4] => match message {
                    Some(message) => return Some(Outbound::Preferences(message)),
                    None => open[4] = false,
                },
            }
        }
        None
    }
}

async fn outbound<W: AsyncWrite + Unpin>(ctx: StageContext, inputs: ProxyInputs, writer: &mut FrameWriter<W>) -> StageResult {
    ctx.startup();

    let mut fan_in = FanIn::new(inputs);
    while let Some(message) = fan_in.next().await {
        let message = message.into_message();
        log::debug!(target: ctx.target(), "sending {}", message.kind());

        match writer.send(&message).await {
            Ok(()) => {}
            Err(ProtocolError::FrameTooLarge(len, max)) => {
                ctx.rejected(message.kind(), format!("{} bytes exceeds the {} byte limit", len, max));
            }
            Err(source) => {
                return Err(ctx.fault(StageError::Protocol {
                    stage: ctx.target(),
                    source,
                }));
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

async fn inbound<R: AsyncRead + Unpin>(ctx: StageContext, reader: &mut FrameReader<R>, outputs: ProxyOutputs) -> StageResult {
    ctx.startup();

    loop {
        let message = match reader.recv::<FromProxy>().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(ctx.fault(StageError::Protocol {
                    stage: ctx.target(),
                    source: ProtocolError::Io(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "proxy closed the connection",
                    )),
                }));
            }
            Err(ProtocolError::Decode(e)) => {
                ctx.rejected("malformed frame", e);
                continue;
            }
            Err(source) => {
                return Err(ctx.fault(StageError::Protocol {
                    stage: ctx.target(),
                    source,
                }));
            }
        };

        log::debug!(target: ctx.target(), "received {}", message.kind());
        dispatch(&ctx, message, &outputs).await;
    }
}

/// Hand an inbound message to the stage that handles it. A stage that is gone only
/// loses that message.
async fn dispatch(ctx: &StageContext, message: FromProxy, outputs: &ProxyOutputs) {
    let kind = message.kind();
    let delivered = match message {
        FromProxy::Registered => {
            log::warn!(target: ctx.target(), "already registered, ignoring acknowledgement");
            return;
        }
        FromProxy::LoginRequest { user_id } => {
            log::info!(target: ctx.target(), "{} logged in", user_id);
            outputs.to_archive_duty_cycle_request.send(DutyCycleRequest).await.is_ok()
        }
        FromProxy::Command(Command::AddNewTrustedUser { user_slot }) => {
            outputs.to_identification_add_user.send(AddTrustedUser { user_slot }).await.is_ok()
        }
        FromProxy::Command(Command::CameraFeedInterest {
            user_id,
            wants_camera_feed,
        }) => outputs
            .to_archive_camera_interest
            .send(CameraFeedInterest {
                user_id,
                wants_camera_feed,
            })
            .await
            .is_ok(),
        FromProxy::Command(Command::RequestDutyCycle) => {
            outputs.to_archive_duty_cycle_request.send(DutyCycleRequest).await.is_ok()
        }
        FromProxy::Command(Command::RequestHistory { user_id, date }) => outputs
            .to_archive_history_request
            .send(HistoryRequest { user_id, date })
            .await
            .is_ok(),
        FromProxy::Command(Command::SetPreferences { user_slot, preferences }) => outputs
            .to_preferences
            .send(PreferencesUpdate { user_slot, preferences })
            .await
            .is_ok(),
    };

    if !delivered {
        ctx.dropped(kind, "handling stage is gone");
    }
}

async fn offline(ctx: StageContext, inputs: ProxyInputs) -> StageResult {
    ctx.startup();

    let mut fan_in = FanIn::new(inputs);
    while let Some(message) = fan_in.next().await {
        let message = message.into_message();
        log::info!(target: ctx.target(), "(OFFLINE) would send {}", message.kind());
    }

    ctx.shutdown();
    Ok(())
}
