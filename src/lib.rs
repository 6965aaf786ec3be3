//! # luxflow
//!
//! On-device control plane for a smart light.
//!
//! ## Architecture
//!
//! - **Runtime primitives**: one-producer bounded channels, reactive stores, derived
//!   stores with a staleness window, a debouncer and an at-least-one fan-out send
//! - **Stages**: environment, detection, recognition, identification, preferences,
//!   control, lighting, archive and the proxy connector, each an async function that
//!   runs until its inputs close or it faults
//! - **Controller**: wires every stage together and runs them until the first fault
//!
//! ## Example
//!
//! ```no_run
//! use luxflow::{Collaborators, Controller, ControllerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = ControllerConfig::default();
//!     config.randomize_environment = true;
//!     config.enable_lighting_hardware = false;
//!
//!     let collaborators = Collaborators::from_config(&config);
//!     Controller::new(config, collaborators)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod channel;
pub mod config;
pub mod context;
pub mod control;
pub mod debounce;
pub mod derived;
pub mod detection;
pub mod environment;
pub mod error;
pub mod fanout;
pub mod identification;
pub mod inference;
pub mod lighting;
pub mod lookup;
pub mod preferences;
pub mod protocol;
pub mod proxy;
pub mod recognition;
pub mod store;
pub mod synthesis;
pub mod types;

pub use channel::{channel, Receiver, Sender};
pub use config::ControllerConfig;
pub use context::StageContext;
pub use debounce::Debouncer;
pub use derived::DerivedStore;
pub use error::{ConfigError, StageError, StageResult};
pub use store::Store;
pub use types::*;

use archive::{ArchiveInputs, ArchiveOutputs, History};
use control::{ControlInputs, ControlOutputs};
use detection::{DetectionInputs, DetectionOutputs, DetectionSchedule};
use environment::{EnvironmentOutputs, EnvironmentSensors, PollIntervals};
use futures::future::BoxFuture;
use futures::FutureExt;
use identification::{IdentificationInputs, IdentificationOutputs};
use inference::{FaceIdentifier, HumanDetector, PoseClassifier};
use inference::{SimulatedDetector, SimulatedFaceIdentifier, SimulatedPoseClassifier};
use lighting::{Dimmer, DryRunDimmer, SysfsPwmDimmer};
use preferences::{PreferencesChannels, PreferencesSource};
use proxy::{ProxyInputs, ProxyLink, ProxyOutputs, TcpConnector};
use std::sync::Arc;
use tokio::signal;

/// Everything outside the process the stages talk to.
pub struct Collaborators {
    pub sensors: EnvironmentSensors,
    pub detector: Arc<dyn HumanDetector>,
    pub classifier: Arc<dyn PoseClassifier>,
    pub identifier: Arc<dyn FaceIdentifier>,
    pub dimmer: Box<dyn Dimmer>,
    pub proxy: ProxyLink,
}

impl Collaborators {
    /// Sensors, dimmer and proxy link as `config` describes them, with the simulated models.
    pub fn from_config(config: &ControllerConfig) -> Self {
        let dimmer: Box<dyn Dimmer> = if config.enable_lighting_hardware {
            Box::new(SysfsPwmDimmer::new(&config.pwm_chip_path))
        } else {
            Box::new(DryRunDimmer)
        };

        let proxy = match &config.proxy_endpoint {
            Some(endpoint) => ProxyLink::Remote {
                connector: Box::new(TcpConnector::new(endpoint.clone())),
                microcontroller_id: config.microcontroller_id.clone(),
                handshake_timeout: config.handshake_timeout(),
                max_frame: protocol::MAX_FRAME_BYTES,
            },
            None => ProxyLink::Offline,
        };

        Self {
            sensors: EnvironmentSensors::from_config(config),
            detector: Arc::new(SimulatedDetector),
            classifier: Arc::new(SimulatedPoseClassifier),
            identifier: Arc::new(SimulatedFaceIdentifier::with_enrolled(UserSlot::ALL)),
            dimmer,
            proxy,
        }
    }
}

/// One stage, ready to be polled.
struct Stage {
    name: &'static str,
    future: BoxFuture<'static, StageResult>,
}

/// The whole pipeline, wired and waiting to run.
pub struct Controller {
    stages: Vec<Stage>,
}

impl Controller {
    /// Wire every stage. Nothing runs until [`Controller::run`].
    pub fn new(config: ControllerConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        log::info!("luxflow controller {}", config.microcontroller_id);
        log::info!("Environment: {}", if config.randomize_environment { "randomized" } else { "hardware" });
        log::info!("Lighting: {}", if config.enable_lighting_hardware { "hardware" } else { "dry run" });
        log::info!("Preferences: {}", if config.use_demo_preferences { "demo" } else { "saved" });

        let capacity = config.channel_capacity;
        let Collaborators {
            sensors,
            detector,
            classifier,
            identifier,
            dimmer,
            proxy,
        } = collaborators;

        // environment
        let (env_motion_tx, env_motion_rx) = channel(capacity);
        let (env_occupancy_tx, env_occupancy_rx) = channel(capacity);
        let (env_detection_frame_tx, env_detection_frame_rx) = channel(capacity);
        let (env_control_tx, env_control_rx) = channel(capacity);
        let (env_archive_frame_tx, env_archive_frame_rx) = channel(capacity);
        // detection
        let (det_recognition_tx, det_recognition_rx) = channel(capacity);
        let (det_identification_tx, det_identification_rx) = channel(capacity);
        // recognition
        let (rec_control_tx, rec_control_rx) = channel(capacity);
        // identification
        let (id_control_tx, id_control_rx) = channel(capacity);
        let (id_proxy_alert_tx, id_proxy_alert_rx) = channel(capacity);
        let (id_archive_alert_tx, id_archive_alert_rx) = channel(capacity);
        // preferences
        let (pref_control_tx, pref_control_rx) = channel(capacity);
        let (pref_proxy_tx, pref_proxy_rx) = channel(capacity);
        // control
        let (ctl_lighting_tx, ctl_lighting_rx) = channel(capacity);
        let (ctl_archive_duty_tx, ctl_archive_duty_rx) = channel(capacity);
        let (ctl_archive_power_tx, ctl_archive_power_rx) = channel(capacity);
        // archive
        let (arc_proxy_duty_tx, arc_proxy_duty_rx) = channel(capacity);
        let (arc_proxy_frame_tx, arc_proxy_frame_rx) = channel(capacity);
        let (arc_proxy_history_tx, arc_proxy_history_rx) = channel(capacity);
        // proxy
        let (proxy_add_user_tx, proxy_add_user_rx) = channel(capacity);
        let (proxy_interest_tx, proxy_interest_rx) = channel(capacity);
        let (proxy_duty_request_tx, proxy_duty_request_rx) = channel(capacity);
        let (proxy_history_request_tx, proxy_history_request_rx) = channel(capacity);
        let (proxy_preferences_tx, proxy_preferences_rx) = channel(capacity);

        let mut stages = Vec::new();
        let mut add = |name: &'static str, future: BoxFuture<'static, StageResult>| {
            stages.push(Stage { name, future });
        };

        add(
            "environment",
            environment::run(
                stage_context!("environment", "stage"),
                sensors,
                EnvironmentOutputs {
                    to_detection_motion: env_motion_tx,
                    to_detection_occupancy: env_occupancy_tx,
                    to_detection_frame: env_detection_frame_tx,
                    to_control: env_control_tx,
                    to_archive_frame: env_archive_frame_tx,
                },
                PollIntervals::from_config(&config),
            )
            .boxed(),
        );

        add(
            "detection",
            detection::run(
                stage_context!("detection", "stage"),
                detector,
                DetectionInputs {
                    from_motion: env_motion_rx,
                    from_occupancy: env_occupancy_rx,
                    from_camera: env_detection_frame_rx,
                },
                DetectionOutputs {
                    to_recognition: det_recognition_tx,
                    to_identification: det_identification_tx,
                },
                DetectionSchedule::default(),
            )
            .boxed(),
        );

        add(
            "recognition",
            recognition::run(
                stage_context!("recognition", "stage"),
                classifier,
                det_recognition_rx,
                rec_control_tx,
            )
            .boxed(),
        );

        add(
            "identification",
            identification::run(
                stage_context!("identification", "stage"),
                identifier,
                IdentificationInputs {
                    from_detection: det_identification_rx,
                    from_proxy_add_user: proxy_add_user_rx,
                },
                IdentificationOutputs {
                    to_control: id_control_tx,
                    to_proxy_alert: id_proxy_alert_tx,
                    to_archive_alert: id_archive_alert_tx,
                },
                config.intruder_quiet_window(),
                capacity,
            )
            .boxed(),
        );

        let source = if config.use_demo_preferences {
            PreferencesSource::Demo
        } else {
            PreferencesSource::Saved
        };
        add(
            "preferences",
            preferences::run(
                stage_context!("preferences", "stage"),
                PreferencesChannels {
                    from_proxy: proxy_preferences_rx,
                    to_control: pref_control_tx,
                    to_proxy: pref_proxy_tx,
                },
                source,
                config.trusted_users_folder.clone(),
            )
            .boxed(),
        );

        add(
            "control",
            control::run(
                stage_context!("control", "stage"),
                ControlInputs {
                    from_environment: env_control_rx,
                    from_recognition: rec_control_rx,
                    from_identification: id_control_rx,
                    from_preferences: pref_control_rx,
                },
                ControlOutputs {
                    to_lighting: ctl_lighting_tx,
                    to_archive_duty_cycle: ctl_archive_duty_tx,
                    to_archive_power: ctl_archive_power_tx,
                },
                config.synthesis_max_staleness(),
                capacity,
            )
            .boxed(),
        );

        add(
            "lighting",
            lighting::run(stage_context!("lighting", "stage"), dimmer, ctl_lighting_rx).boxed(),
        );

        add(
            "archive",
            archive::run(
                stage_context!("archive", "stage"),
                ArchiveInputs {
                    from_control_duty_cycle: ctl_archive_duty_rx,
                    from_control_power: ctl_archive_power_rx,
                    from_environment_frame: env_archive_frame_rx,
                    from_identification_alert: id_archive_alert_rx,
                    from_proxy_camera_interest: proxy_interest_rx,
                    from_proxy_duty_cycle_request: proxy_duty_request_rx,
                    from_proxy_history_request: proxy_history_request_rx,
                },
                ArchiveOutputs {
                    to_proxy_duty_cycle: arc_proxy_duty_tx,
                    to_proxy_camera_frame: arc_proxy_frame_tx,
                    to_proxy_history: arc_proxy_history_tx,
                },
                History::new(config.history_folder.clone()),
            )
            .boxed(),
        );

        add(
            "proxy",
            proxy::run(
                stage_context!("proxy", "stage"),
                ProxyInputs {
                    from_archive_duty_cycle: arc_proxy_duty_rx,
                    from_archive_camera_frame: arc_proxy_frame_rx,
                    from_archive_history: arc_proxy_history_rx,
                    from_identification_alert: id_proxy_alert_rx,
                    from_preferences: pref_proxy_rx,
                },
                ProxyOutputs {
                    to_identification_add_user: proxy_add_user_tx,
                    to_archive_camera_interest: proxy_interest_tx,
                    to_archive_duty_cycle_request: proxy_duty_request_tx,
                    to_archive_history_request: proxy_history_request_tx,
                    to_preferences: proxy_preferences_tx,
                },
                proxy,
            )
            .boxed(),
        );

        Ok(Self { stages })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name).collect()
    }

    /// Run every stage until one faults. The first fault cancels the others and is returned.
    pub async fn run_until_fault(self) -> StageResult {
        log::info!("Starting {} stages...", self.stages.len());
        let futures = self.stages.into_iter().map(|stage| stage.future);
        futures::future::try_join_all(futures).await?;
        log::info!("Every stage finished");
        Ok(())
    }

    /// Like [`Controller::run_until_fault`], but Ctrl-C ends the run cleanly.
    pub async fn run(self) -> StageResult {
        tokio::select! {
            result = self.run_until_fault() => result,
            signal = signal::ctrl_c() => match signal {
                Ok(()) => {
                    log::info!("Shutdown signal received");
                    Ok(())
                }
                Err(source) => Err(StageError::Io {
                    stage: "controller",
                    source,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;

    struct BrokenDimmer;

    #[async_trait]
    impl Dimmer for BrokenDimmer {
        async fn set_duty_cycle(&mut self, _duty_cycle: f64) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "pwm chip not writable"))
        }
    }

    fn test_config(dir: &std::path::Path) -> ControllerConfig {
        ControllerConfig {
            randomize_environment: true,
            enable_lighting_hardware: false,
            history_folder: dir.join("history"),
            trusted_users_folder: dir.join("trusted-users"),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_every_stage_is_wired() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let collaborators = Collaborators::from_config(&config);
        let controller = Controller::new(config, collaborators).unwrap();

        assert_eq!(
            controller.stage_names(),
            vec![
                "environment",
                "detection",
                "recognition",
                "identification",
                "preferences",
                "control",
                "lighting",
                "archive",
                "proxy",
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.channel_capacity = 0;
        let collaborators = Collaborators::from_config(&config);

        assert!(matches!(
            Controller::new(config, collaborators),
            Err(ConfigError::ZeroValue("channel_capacity"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fault_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut collaborators = Collaborators::from_config(&config);
        collaborators.dimmer = Box::new(BrokenDimmer);

        let result = Controller::new(config, collaborators).unwrap().run_until_fault().await;
        assert!(matches!(result, Err(StageError::Io { stage: "lighting::stage", .. })));
    }
}
