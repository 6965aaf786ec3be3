//! Controller configuration
//!
//! Loaded from an optional TOML file, then overridden by environment variables, then by
//! command-line flags (applied by the binary).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RANDOMIZE_ENVIRONMENT_VAR: &str = "RANDOMIZE_ENVIRONMENT_MODULE";
pub const ENABLE_LIGHTING_HARDWARE_VAR: &str = "ENABLE_LIGHTING_HARDWARE";
pub const USE_DEMO_PREFERENCES_VAR: &str = "USE_DEMO_PREFERENCES";

/// Configuration for the whole controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Capacity of every inter-stage channel
    pub channel_capacity: usize,
    /// Recompute the brightness at least this often (seconds)
    pub synthesis_max_staleness_secs: u64,
    /// Quiet window before an intruder alert goes out (seconds)
    pub intruder_quiet_window_secs: u64,
    pub light_sensor_interval_ms: u64,
    pub motion_poll_interval_ms: u64,
    pub occupancy_poll_interval_ms: u64,
    pub camera_frame_interval_ms: u64,
    /// IIO illuminance reading (lux)
    pub light_sensor_path: PathBuf,
    /// sysfs GPIO `value` file of the motion sensor
    pub motion_gpio_path: PathBuf,
    /// Serial device of the occupancy sensor
    pub occupancy_serial_path: PathBuf,
    /// Raw RGB24 frames written by the capture process
    pub camera_pipe_path: PathBuf,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Use random sensor data instead of hardware drivers
    pub randomize_environment: bool,
    /// Drive the PWM output (otherwise duty cycles are only logged)
    pub enable_lighting_hardware: bool,
    /// Start with the built-in demo schedules
    pub use_demo_preferences: bool,
    pub pwm_chip_path: PathBuf,
    /// Root of the JSON-lines event history
    pub history_folder: PathBuf,
    /// Per-user folders (`<slot>/preferences.json`)
    pub trusted_users_folder: PathBuf,
    /// Identifies this appliance to the remote proxy
    pub microcontroller_id: String,
    /// `host:port` of the remote proxy; unset runs offline
    pub proxy_endpoint: Option<String>,
    pub handshake_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::channel::DEFAULT_CAPACITY,
            synthesis_max_staleness_secs: 15,
            intruder_quiet_window_secs: 60,
            light_sensor_interval_ms: 1000,
            motion_poll_interval_ms: 300,
            occupancy_poll_interval_ms: 5000,
            camera_frame_interval_ms: 100,
            light_sensor_path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_illuminance_input"),
            motion_gpio_path: PathBuf::from("/sys/class/gpio/gpio4/value"),
            occupancy_serial_path: PathBuf::from("/dev/ttyUSB0"),
            camera_pipe_path: PathBuf::from("/run/luxflow/camera.rgb"),
            camera_width: 640,
            camera_height: 480,
            randomize_environment: false,
            enable_lighting_hardware: true,
            use_demo_preferences: true,
            pwm_chip_path: PathBuf::from("/sys/class/pwm/pwmchip0"),
            history_folder: PathBuf::from("app-history"),
            trusted_users_folder: PathBuf::from("trusted-users"),
            microcontroller_id: "luxflow-0".to_string(),
            proxy_endpoint: None,
            handshake_timeout_secs: 10,
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the process environment's overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` (a variable name to its value, if set).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flags = [
            (RANDOMIZE_ENVIRONMENT_VAR, &mut self.randomize_environment),
            (ENABLE_LIGHTING_HARDWARE_VAR, &mut self.enable_lighting_hardware),
            (USE_DEMO_PREFERENCES_VAR, &mut self.use_demo_preferences),
        ];

        for (name, field) in flags {
            if let Some(value) = lookup(name) {
                *field = parse_flag(name, &value)?;
                log::debug!("{} overridden from the environment: {}", name, field);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("channel_capacity", self.channel_capacity as u64),
            ("synthesis_max_staleness_secs", self.synthesis_max_staleness_secs),
            ("intruder_quiet_window_secs", self.intruder_quiet_window_secs),
            ("light_sensor_interval_ms", self.light_sensor_interval_ms),
            ("motion_poll_interval_ms", self.motion_poll_interval_ms),
            ("occupancy_poll_interval_ms", self.occupancy_poll_interval_ms),
            ("camera_frame_interval_ms", self.camera_frame_interval_ms),
            ("camera_width", u64::from(self.camera_width)),
            ("camera_height", u64::from(self.camera_height)),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
        ];
        match nonzero.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::ZeroValue(*name)),
            None => Ok(()),
        }
    }

    pub fn synthesis_max_staleness(&self) -> Duration {
        Duration::from_secs(self.synthesis_max_staleness_secs)
    }

    pub fn intruder_quiet_window(&self) -> Duration {
        Duration::from_secs(self.intruder_quiet_window_secs)
    }

    pub fn light_sensor_interval(&self) -> Duration {
        Duration::from_millis(self.light_sensor_interval_ms)
    }

    pub fn motion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.motion_poll_interval_ms)
    }

    pub fn occupancy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.occupancy_poll_interval_ms)
    }

    pub fn camera_frame_interval(&self) -> Duration {
        Duration::from_millis(self.camera_frame_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Environment flags are exactly `True` or `False`.
fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "True" => Ok(true),
        "False" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
