//! Environment - collect ambient light, motion, occupancy and camera frames from the room.
//!
//! Each sensor is polled by its own loop. Motion and occupancy are only reported when
//! their state changes. A loop ends when everyone it reports to has gone away.

use crate::channel::Sender;
use crate::config::ControllerConfig;
use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::fanout::{at_least_one, Branch};
use crate::stage_context;
use crate::types::{AmbientBrightness, Frame, MotionChanged, OccupancyChanged};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};

/// Rough lux to lumens conversion for the room the appliance is rated for.
pub fn lux_to_lumens(lux: f64) -> f64 {
    lux * 600.0 / 20000.0
}

/// Ambient light sensor
#[async_trait]
pub trait LightSensor: Send {
    async fn read_lux(&mut self) -> io::Result<f64>;
}

/// A binary sensor: motion or occupancy.
#[async_trait]
pub trait PresenceSensor: Send {
    async fn detected(&mut self) -> io::Result<bool>;
}

#[async_trait]
pub trait Camera: Send {
    async fn capture(&mut self) -> io::Result<Frame>;
}

/// Illuminance from an IIO light sensor (`in_illuminance_input`).
pub struct IioLightSensor {
    path: PathBuf,
}

impl IioLightSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LightSensor for IioLightSensor {
    async fn read_lux(&mut self) -> io::Result<f64> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}: {}", raw.trim(), e)))
    }
}

/// A GPIO input exported through sysfs (`value` reads `0` or `1`).
pub struct GpioInput {
    path: PathBuf,
}

impl GpioInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PresenceSensor for GpioInput {
    async fn detected(&mut self) -> io::Result<bool> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(raw.trim() == "1")
    }
}

/// An occupancy sensor that reports one line per reading over a serial device.
/// Any `1` in the line means occupied.
pub struct SerialOccupancySensor {
    path: PathBuf,
    lines: Option<Lines<BufReader<tokio::fs::File>>>,
}

impl SerialOccupancySensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: None,
        }
    }
}

#[async_trait]
impl PresenceSensor for SerialOccupancySensor {
    async fn detected(&mut self) -> io::Result<bool> {
        if self.lines.is_none() {
            let file = tokio::fs::File::open(&self.path).await?;
            self.lines = Some(BufReader::new(file).lines());
        }
        let Some(lines) = self.lines.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "serial device not open"));
        };
        match lines.next_line().await? {
            Some(line) => Ok(line.contains('1')),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial device closed")),
        }
    }
}

/// Raw RGB24 frames of a fixed size, read back to back from a pipe fed by a capture
/// process (for example `ffmpeg -f v4l2 ... -pix_fmt rgb24 -f rawvideo <pipe>`).
///
/// The capture process writes continuously, so every capture returns the next frame
/// in the pipe rather than the newest one.
pub struct RawVideoCamera {
    path: PathBuf,
    width: u32,
    height: u32,
    pipe: Option<tokio::fs::File>,
}

impl RawVideoCamera {
    pub fn new(path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            pipe: None,
        }
    }
}

#[async_trait]
impl Camera for RawVideoCamera {
    async fn capture(&mut self) -> io::Result<Frame> {
        if self.pipe.is_none() {
            self.pipe = Some(tokio::fs::File::open(&self.path).await?);
        }
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "camera pipe not open"));
        };
        let mut pixels = vec![0u8; self.width as usize * self.height as usize * 3];
        pipe.read_exact(&mut pixels).await?;
        Ok(Frame::new(self.width, self.height, pixels))
    }
}

/// Light levels around 2^N(10, 2) lux.
#[derive(Default)]
pub struct RandomLightSensor;

#[async_trait]
impl LightSensor for RandomLightSensor {
    async fn read_lux(&mut self) -> io::Result<f64> {
        Ok(2f64.powf(normal(10.0, 2.0)))
    }
}

/// Box-Muller sample from N(mean, std_dev).
fn normal(mean: f64, std_dev: f64) -> f64 {
    let u1 = 1.0 - fastrand::f64();
    let u2 = fastrand::f64();
    mean + std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[derive(Default)]
pub struct RandomPresenceSensor;

#[async_trait]
impl PresenceSensor for RandomPresenceSensor {
    async fn detected(&mut self) -> io::Result<bool> {
        Ok(fastrand::bool())
    }
}

/// Produces small frames of random noise.
pub struct NoiseCamera {
    width: u32,
    height: u32,
}

impl NoiseCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for NoiseCamera {
    fn default() -> Self {
        Self::new(160, 120)
    }
}

#[async_trait]
impl Camera for NoiseCamera {
    async fn capture(&mut self) -> io::Result<Frame> {
        let mut pixels = vec![0u8; (self.width * self.height * 3) as usize];
        fastrand::fill(&mut pixels);
        Ok(Frame::new(self.width, self.height, pixels))
    }
}

pub struct EnvironmentSensors {
    pub light: Box<dyn LightSensor>,
    pub motion: Box<dyn PresenceSensor>,
    pub occupancy: Box<dyn PresenceSensor>,
    pub camera: Box<dyn Camera>,
}

impl EnvironmentSensors {
    /// The sensors wired up as `config` describes.
    pub fn from_config(config: &ControllerConfig) -> Self {
        if config.randomize_environment {
            return Self::randomized();
        }
        Self {
            light: Box::new(IioLightSensor::new(&config.light_sensor_path)),
            motion: Box::new(GpioInput::new(&config.motion_gpio_path)),
            occupancy: Box::new(SerialOccupancySensor::new(&config.occupancy_serial_path)),
            camera: Box::new(RawVideoCamera::new(
                &config.camera_pipe_path,
                config.camera_width,
                config.camera_height,
            )),
        }
    }

    pub fn randomized() -> Self {
        Self {
            light: Box::new(RandomLightSensor),
            motion: Box::new(RandomPresenceSensor),
            occupancy: Box::new(RandomPresenceSensor),
            camera: Box::new(NoiseCamera::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub light: Duration,
    pub motion: Duration,
    pub occupancy: Duration,
    pub camera: Duration,
}

impl PollIntervals {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            light: config.light_sensor_interval(),
            motion: config.motion_poll_interval(),
            occupancy: config.occupancy_poll_interval(),
            camera: config.camera_frame_interval(),
        }
    }
}

pub struct EnvironmentOutputs {
    pub to_detection_motion: Sender<MotionChanged>,
    pub to_detection_occupancy: Sender<OccupancyChanged>,
    pub to_detection_frame: Sender<Frame>,
    pub to_control: Sender<AmbientBrightness>,
    pub to_archive_frame: Sender<Frame>,
}

pub async fn run(
    ctx: StageContext,
    sensors: EnvironmentSensors,
    outputs: EnvironmentOutputs,
    intervals: PollIntervals,
) -> StageResult {
    ctx.startup();

    let EnvironmentSensors {
        light,
        motion,
        occupancy,
        camera,
    } = sensors;

    tokio::try_join!(
        light_sensor(
            stage_context!("environment", "light_sensor"),
            light,
            outputs.to_control,
            intervals.light,
        ),
        presence_sensor(
            stage_context!("environment", "motion_sensor"),
            motion,
            outputs.to_detection_motion,
            intervals.motion,
            |new_state| MotionChanged { new_state },
        ),
        presence_sensor(
            stage_context!("environment", "occupancy_sensor"),
            occupancy,
            outputs.to_detection_occupancy,
            intervals.occupancy,
            |new_state| OccupancyChanged { new_state },
        ),
        camera_feed(
            stage_context!("environment", "camera"),
            camera,
            outputs.to_detection_frame,
            outputs.to_archive_frame,
            intervals.camera,
        ),
    )?;

    ctx.shutdown();
    Ok(())
}

fn sensor_fault(ctx: &StageContext, source: io::Error) -> StageError {
    ctx.fault(StageError::Io {
        stage: ctx.target(),
        source,
    })
}

pub async fn light_sensor(
    ctx: StageContext,
    mut sensor: Box<dyn LightSensor>,
    to_control: Sender<AmbientBrightness>,
    interval: Duration,
) -> StageResult {
    ctx.startup();

    loop {
        let lux = sensor.read_lux().await.map_err(|e| sensor_fault(&ctx, e))?;
        let lumens = lux_to_lumens(lux);
        log::debug!(target: ctx.target(), "lux: {:.1} ({:.1} lm)", lux, lumens);

        if let Err(closed) = to_control.send(AmbientBrightness { lumens }).await {
            ctx.dropped("ambient brightness", closed);
            break;
        }
        tokio::time::sleep(interval).await;
    }

    ctx.shutdown();
    Ok(())
}

/// Poll a binary sensor and report only changes of state (the first reading always counts).
pub async fn presence_sensor<M: Send>(
    ctx: StageContext,
    mut sensor: Box<dyn PresenceSensor>,
    to_detection: Sender<M>,
    interval: Duration,
    message: impl Fn(bool) -> M,
) -> StageResult {
    ctx.startup();

    let mut last_state = None;
    loop {
        let state = sensor.detected().await.map_err(|e| sensor_fault(&ctx, e))?;
        log::trace!(target: ctx.target(), "detected: {}", state);

        if last_state != Some(state) {
            log::debug!(target: ctx.target(), "state changed to {}", state);
            if let Err(closed) = to_detection.send(message(state)).await {
                ctx.dropped("state change", closed);
                break;
            }
            last_state = Some(state);
        }
        tokio::time::sleep(interval).await;
    }

    ctx.shutdown();
    Ok(())
}

pub async fn camera_feed(
    ctx: StageContext,
    mut camera: Box<dyn Camera>,
    to_detection: Sender<Frame>,
    to_archive: Sender<Frame>,
    interval: Duration,
) -> StageResult {
    ctx.startup();

    loop {
        let frame = camera.capture().await.map_err(|e| sensor_fault(&ctx, e))?;
        log::trace!(target: ctx.target(), "captured {}x{} frame", frame.width, frame.height);

        let delivery = at_least_one(vec![
            Branch::new("detection", &to_detection, frame.clone()),
            Branch::new("archive", &to_archive, frame),
        ])
        .await;

        if let Err(e) = delivery {
            ctx.dropped("camera frame", e);
            break;
        }
        tokio::time::sleep(interval).await;
    }

    ctx.shutdown();
    Ok(())
}
