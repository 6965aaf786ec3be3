//! Control - decide, all things considered, how bright the light should be.
//!
//! Three components run side by side:
//!
//! - **synthesis** keeps the latest ambient light, activities, identified people and
//!   preferences in stores and derives the target brightness from them, recomputing at
//!   least every `max_staleness` so schedule changes take effect without new input.
//! - **duty cycle** converts lumens to a PWM duty cycle and fans it out to the light, the
//!   power derivation and the archive.
//! - **power derivation** converts the duty cycle to watts for the archive.

use crate::channel::{channel, Receiver, Sender};
use crate::context::StageContext;
use crate::derived::DerivedStore;
use crate::error::StageResult;
use crate::fanout::{at_least_one, Branch};
use crate::lookup::{duty_cycle_to_watts, lumens_to_duty_cycle};
use crate::stage_context;
use crate::store::{self, Readable, Store};
use crate::synthesis::{synthesize, SynthesisInput};
use crate::types::{
    ActivitiesRecognized, Activity, AmbientBrightness, DutyCycle, IdentifiedPerson, PeopleIdentified, PowerDraw,
    PreferencesMap, PreferencesSnapshot, WeekTime,
};
use std::time::Duration;

/// Target light output from the synthesis component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesizedBrightness {
    pub lumens: f64,
}

pub struct ControlInputs {
    pub from_environment: Receiver<AmbientBrightness>,
    pub from_recognition: Receiver<ActivitiesRecognized>,
    pub from_identification: Receiver<PeopleIdentified>,
    pub from_preferences: Receiver<PreferencesSnapshot>,
}

pub struct ControlOutputs {
    pub to_lighting: Sender<DutyCycle>,
    pub to_archive_duty_cycle: Sender<DutyCycle>,
    pub to_archive_power: Sender<PowerDraw>,
}

/// Run the control stage until every input channel has closed.
pub async fn run(
    ctx: StageContext,
    inputs: ControlInputs,
    outputs: ControlOutputs,
    max_staleness: Duration,
    capacity: usize,
) -> StageResult {
    ctx.startup();

    let (to_duty_cycle, from_synthesis) = channel(capacity);
    let (to_power_derivation, from_duty_cycle) = channel(capacity);

    let ControlOutputs {
        to_lighting,
        to_archive_duty_cycle,
        to_archive_power,
    } = outputs;

    tokio::try_join!(
        synthesis(
            stage_context!("control", "synthesis"),
            inputs,
            to_duty_cycle,
            max_staleness,
            capacity,
        ),
        duty_cycle(
            stage_context!("control", "duty_cycle"),
            from_synthesis,
            to_lighting,
            to_power_derivation,
            to_archive_duty_cycle,
        ),
        power_derivation(
            stage_context!("control", "power_derivation"),
            from_duty_cycle,
            to_archive_power,
        ),
    )?;

    ctx.shutdown();
    Ok(())
}

/// Drain `receiver` into `store`, one `set` per message.
async fn feed<M, T>(mut receiver: Receiver<M>, store: &Store<T>, extract: impl Fn(M) -> T)
where
    T: Clone + Send + 'static,
{
    while let Some(message) = receiver.recv().await {
        store.set(extract(message));
    }
}

pub async fn synthesis(
    ctx: StageContext,
    inputs: ControlInputs,
    to_duty_cycle: Sender<SynthesizedBrightness>,
    max_staleness: Duration,
    capacity: usize,
) -> StageResult {
    ctx.startup();

    let ambient: Store<f64> = Store::new();
    let activities: Store<Vec<Activity>> = Store::new();
    let people: Store<Vec<IdentifiedPerson>> = Store::new();
    let preferences: Store<PreferencesMap> = Store::new();

    let ambient_input = ambient.map(|lumens| SynthesisInput::Ambient(*lumens));
    let activities_input = activities.map(|list| SynthesisInput::Activities(list.clone()));
    let people_input = people.map(|list| SynthesisInput::People(list.clone()));
    let preferences_input = preferences.map(|map| SynthesisInput::Preferences(map.clone()));

    let inputs_to_combine: [&dyn Readable<SynthesisInput>; 4] =
        [&ambient_input, &activities_input, &people_input, &preferences_input];
    let derived = DerivedStore::new(
        &inputs_to_combine,
        |latest: &[&SynthesisInput]| synthesize(latest, WeekTime::now()),
        max_staleness,
    );
    let output = derived.output().clone();
    let mut results = store::values(&output, capacity);

    let ControlInputs {
        from_environment,
        from_recognition,
        from_identification,
        from_preferences,
    } = inputs;

    let feeders = async {
        tokio::join!(
            feed(from_environment, &ambient, |m| m.lumens),
            feed(from_recognition, &activities, |m| m.activities),
            feed(from_identification, &people, |m| m.identified_people),
            feed(from_preferences, &preferences, |m| m.preferences),
        );
        log::debug!(target: ctx.target(), "every input closed, stopping the derivation");
        derived.stop();
        output.close();
    };

    let forward = async {
        while let Some(result) = results.next().await {
            let Some(lumens) = result else {
                log::warn!(target: ctx.target(), "derivation ran without every input present");
                continue;
            };
            log::debug!(target: ctx.target(), "synthesized brightness: {:.1} lm", lumens);
            if let Err(closed) = to_duty_cycle.send(SynthesizedBrightness { lumens }).await {
                ctx.dropped("synthesized brightness", closed);
            }
        }
    };

    tokio::join!(feeders, forward);

    ctx.shutdown();
    Ok(())
}

pub async fn duty_cycle(
    ctx: StageContext,
    mut from_synthesis: Receiver<SynthesizedBrightness>,
    to_lighting: Sender<DutyCycle>,
    to_power_derivation: Sender<DutyCycle>,
    to_archive: Sender<DutyCycle>,
) -> StageResult {
    ctx.startup();

    while let Some(SynthesizedBrightness { lumens }) = from_synthesis.recv().await {
        let duty_cycle = match lumens_to_duty_cycle(lumens) {
            Ok(duty_cycle) => duty_cycle,
            Err(e) => {
                ctx.rejected("synthesized brightness", e);
                continue;
            }
        };

        let message = DutyCycle { duty_cycle };
        let delivery = at_least_one(vec![
            Branch::new("lighting", &to_lighting, message),
            Branch::new("power_derivation", &to_power_derivation, message),
            Branch::new("archive", &to_archive, message),
        ])
        .await;

        if let Err(e) = delivery {
            ctx.dropped("duty cycle", e);
        }
    }

    ctx.shutdown();
    Ok(())
}

pub async fn power_derivation(
    ctx: StageContext,
    mut from_duty_cycle: Receiver<DutyCycle>,
    to_archive: Sender<PowerDraw>,
) -> StageResult {
    ctx.startup();

    while let Some(DutyCycle { duty_cycle }) = from_duty_cycle.recv().await {
        let watts = match duty_cycle_to_watts(duty_cycle) {
            Ok(watts) => watts,
            Err(e) => {
                ctx.rejected("duty cycle", e);
                continue;
            }
        };

        if let Err(closed) = to_archive.send(PowerDraw { watts }).await {
            ctx.dropped("power draw", closed);
        }
    }

    ctx.shutdown();
    Ok(())
}
