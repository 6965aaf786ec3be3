//! Lighting - drive the dimmer at the duty cycle the decision stage asks for.

use crate::channel::Receiver;
use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::types::DutyCycle;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

/// PWM frequency the dimmer expects.
pub const PWM_FREQUENCY_HZ: u64 = 600;

#[async_trait]
pub trait Dimmer: Send {
    /// `duty_cycle` is in 0.0..=1.0.
    async fn set_duty_cycle(&mut self, duty_cycle: f64) -> io::Result<()>;
}

/// Channel 0 of a sysfs PWM chip (`/sys/class/pwm/pwmchipN`).
pub struct SysfsPwmDimmer {
    chip: PathBuf,
    period_ns: u64,
    enabled: bool,
}

impl SysfsPwmDimmer {
    pub fn new(chip: impl Into<PathBuf>) -> Self {
        Self {
            chip: chip.into(),
            period_ns: 1_000_000_000 / PWM_FREQUENCY_HZ,
            enabled: false,
        }
    }

    fn channel(&self) -> PathBuf {
        self.chip.join("pwm0")
    }

    /// Export the channel if needed, set the period and switch it on.
    async fn enable(&mut self) -> io::Result<()> {
        let channel = self.channel();
        if tokio::fs::metadata(&channel).await.is_err() {
            tokio::fs::write(self.chip.join("export"), "0").await?;
        }
        tokio::fs::write(channel.join("period"), self.period_ns.to_string()).await?;
        tokio::fs::write(channel.join("enable"), "1").await?;
        self.enabled = true;
        Ok(())
    }
}

/// Duty cycle as nanoseconds of a PWM period. Out-of-range values are clamped.
pub fn duty_cycle_ns(duty_cycle: f64, period_ns: u64) -> u64 {
    (duty_cycle.clamp(0.0, 1.0) * period_ns as f64).round() as u64
}

#[async_trait]
impl Dimmer for SysfsPwmDimmer {
    async fn set_duty_cycle(&mut self, duty_cycle: f64) -> io::Result<()> {
        if !self.enabled {
            self.enable().await?;
        }
        let ns = duty_cycle_ns(duty_cycle, self.period_ns);
        tokio::fs::write(self.channel().join("duty_cycle"), ns.to_string()).await
    }
}

/// Logs instead of touching hardware.
#[derive(Debug, Default)]
pub struct DryRunDimmer;

#[async_trait]
impl Dimmer for DryRunDimmer {
    async fn set_duty_cycle(&mut self, duty_cycle: f64) -> io::Result<()> {
        log::info!("(DRY RUN) setting light to {:.3}", duty_cycle);
        Ok(())
    }
}

/// Run until the decision stage stops.
pub async fn run(ctx: StageContext, mut dimmer: Box<dyn Dimmer>, mut from_control: Receiver<DutyCycle>) -> StageResult {
    ctx.startup();

    while let Some(DutyCycle { duty_cycle }) = from_control.recv().await {
        log::info!(target: ctx.target(), "setting light to {:.1}%", duty_cycle * 100.0);
        dimmer.set_duty_cycle(duty_cycle).await.map_err(|source| {
            ctx.fault(StageError::Io {
                stage: ctx.target(),
                source,
            })
        })?;
    }

    ctx.shutdown();
    Ok(())
}
