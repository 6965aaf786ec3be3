//! luxflow - smart light controller
//!
//! Main entry point: runs the pipeline, or evaluates the brightness decision offline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use luxflow::preferences::{self, demo_preferences};
use luxflow::synthesis::calculate_synthesized_brightness;
use luxflow::{lookup, stage_context};
use luxflow::{Activity, Collaborators, Controller, ControllerConfig, IdentifiedPerson, UserSlot, WeekTime};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "luxflow")]
#[command(about = "luxflow - smart light controller", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use random sensor readings instead of the hardware
    #[arg(long)]
    randomize_environment: bool,

    /// Log duty cycles instead of driving the PWM chip
    #[arg(long)]
    no_hardware: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until a stage fails or Ctrl-C
    Run,

    /// Duty cycle needed to emit the given lumens
    DutyCycle {
        lumens: f64,
    },

    /// Power drawn at the given duty cycle
    Watts {
        duty_cycle: f64,
    },

    /// Evaluate the brightness decision once, for the current time
    Synthesize {
        /// Trusted users folder to read preferences from (the demo schedule if omitted)
        #[arg(short, long, value_name = "DIR")]
        preferences: Option<PathBuf>,

        /// Ambient light (lumens)
        #[arg(short, long, default_value = "0")]
        ambient: f64,

        /// A person in the room: `<slot|unknown>:<activity>`, e.g. `2:working`
        #[arg(long = "person", value_parser = parse_person)]
        people: Vec<(IdentifiedPerson, Activity)>,
    },
}

fn parse_person(arg: &str) -> Result<(IdentifiedPerson, Activity), String> {
    let (who, activity) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected <slot|unknown>:<activity>, got {:?}", arg))?;
    let person = match who {
        "unknown" => None,
        slot => Some(slot.parse::<UserSlot>()?),
    };
    Ok((person, activity.parse()?))
}

fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        log::info!("Loading config from: {}", config_path.display());
        ControllerConfig::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        ControllerConfig::default()
    };

    config.apply_env()?;

    // Override with CLI options
    if cli.randomize_environment {
        config.randomize_environment = true;
    }
    if cli.no_hardware {
        config.enable_lighting_hardware = false;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => {
            let collaborators = Collaborators::from_config(&config);
            let controller = Controller::new(config, collaborators)?;
            controller.run().await?;
        }

        Commands::DutyCycle { lumens } => {
            let duty_cycle = lookup::lumens_to_duty_cycle(lumens)?;
            println!("{:.1} lm -> duty cycle {:.4}", lumens, duty_cycle);
        }

        Commands::Watts { duty_cycle } => {
            let watts = lookup::duty_cycle_to_watts(duty_cycle)?;
            println!("duty cycle {:.4} -> {:.2} W", duty_cycle, watts);
        }

        Commands::Synthesize {
            preferences: folder,
            ambient,
            people,
        } => {
            let preferences = match folder {
                Some(folder) => {
                    if !folder.is_dir() {
                        bail!("{} is not a directory", folder.display());
                    }
                    preferences::load(&stage_context!("cli", "synthesize"), &folder).await
                }
                None => demo_preferences(),
            };

            let now = WeekTime::now();
            let (identified, activities): (Vec<IdentifiedPerson>, Vec<Activity>) = people.into_iter().unzip();
            let lumens = calculate_synthesized_brightness(&activities, ambient, now, &identified, &preferences);
            let duty_cycle = lookup::lumens_to_duty_cycle(lumens)?;

            println!("\n=== Brightness decision ===");
            println!("Time of week: {}", now);
            println!("Ambient: {:.1} lm", ambient);
            println!("People: {}", identified.len());
            println!("Light output: {:.1} lm", lumens);
            println!("Duty cycle: {:.4}", duty_cycle);
        }
    }

    Ok(())
}
