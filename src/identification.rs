//! Person identification - who is in the room, enrolment of new trusted users, and the
//! intruder alert.

use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::debounce::Debouncer;
use crate::error::StageResult;
use crate::fanout::{at_least_one, Branch};
use crate::inference::{run_blocking, Enrollment, FaceIdentifier};
use crate::stage_context;
use crate::store::{self, Store};
use crate::types::{
    AddTrustedUser, Frame, HumansDetected, IdentifiedPerson, IntruderAlert, PeopleIdentified, UserSlot,
};
use chrono::{DateTime, Local};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

/// How many detections an enrolment may look at before giving up.
pub const ENROLLMENT_ATTEMPTS: u32 = 30;

/// The people identified in one camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub people: Vec<IdentifiedPerson>,
    pub image: Frame,
    pub timestamp: DateTime<Local>,
}

/// What a sighting means for the intruder alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// A trusted user is present and can see for themselves who is with them.
    Trusted,
    /// Only unrecognized people.
    Intruder,
    Empty,
}

pub fn assess(people: &[IdentifiedPerson]) -> Assessment {
    if people.iter().any(Option::is_some) {
        Assessment::Trusted
    } else if people.is_empty() {
        Assessment::Empty
    } else {
        Assessment::Intruder
    }
}

pub struct IdentificationInputs {
    pub from_detection: Receiver<HumansDetected>,
    pub from_proxy_add_user: Receiver<AddTrustedUser>,
}

pub struct IdentificationOutputs {
    pub to_control: Sender<PeopleIdentified>,
    pub to_proxy_alert: Sender<IntruderAlert>,
    pub to_archive_alert: Sender<IntruderAlert>,
}

pub async fn run(
    ctx: StageContext,
    identifier: Arc<dyn FaceIdentifier>,
    inputs: IdentificationInputs,
    outputs: IdentificationOutputs,
    quiet_window: Duration,
    capacity: usize,
) -> StageResult {
    ctx.startup();

    let sightings = Store::new();
    // Subscribe before anything can be published.
    let sighting_values = store::values(&sightings, capacity);

    tokio::try_join!(
        face_recognition(
            stage_context!("identification", "face_recognition"),
            identifier,
            inputs,
            outputs.to_control,
            sightings,
        ),
        intruder_alert(
            stage_context!("identification", "intruder_alert"),
            sighting_values,
            outputs.to_proxy_alert,
            outputs.to_archive_alert,
            quiet_window,
        ),
    )?;

    ctx.shutdown();
    Ok(())
}

/// A pending request to learn a trusted user's face.
#[derive(Debug, Clone, Copy)]
struct PendingEnrollment {
    user_slot: UserSlot,
    attempts_left: u32,
}

async fn face_recognition(
    ctx: StageContext,
    identifier: Arc<dyn FaceIdentifier>,
    inputs: IdentificationInputs,
    to_control: Sender<PeopleIdentified>,
    sightings: Store<Sighting>,
) -> StageResult {
    ctx.startup();

    let IdentificationInputs {
        mut from_detection,
        mut from_proxy_add_user,
    } = inputs;
    let mut proxy_open = true;
    let mut enrollment: Option<PendingEnrollment> = None;

    loop {
        tokio::select! {
            request = from_proxy_add_user.recv(), if proxy_open => match request {
                Some(AddTrustedUser { user_slot }) => {
                    if let Some(previous) = enrollment {
                        log::warn!(
                            target: ctx.target(),
                            "abandoning enrolment of {} in favour of {}",
                            previous.user_slot,
                            user_slot
                        );
                    }
                    log::info!(target: ctx.target(), "going to add {} from the camera", user_slot);
                    enrollment = Some(PendingEnrollment {
                        user_slot,
                        attempts_left: ENROLLMENT_ATTEMPTS,
                    });
                }
                None => proxy_open = false,
            },

            message = from_detection.recv() => {
                let Some(detected) = message else { break };

                let people = {
                    let identifier = identifier.clone();
                    let crops = detected.images_of_humans.clone();
                    run_blocking(&ctx, move || {
                        crops
                            .iter()
                            .map(|crop| identifier.identify(crop))
                            .collect::<Result<Vec<IdentifiedPerson>, _>>()
                    })
                    .await?
                };
                log::debug!(target: ctx.target(), "identified {:?}", people);

                if let Some(pending) = enrollment.take() {
                    enrollment = enroll(&ctx, &identifier, pending, &detected.images_of_humans).await?;
                }

                sightings.set(Sighting {
                    people: people.clone(),
                    image: detected.source,
                    timestamp: detected.captured_at,
                });

                if let Err(e) = to_control.send(PeopleIdentified { identified_people: people }).await {
                    ctx.dropped("identified people", e);
                    break;
                }
            }
        }
    }

    sightings.close();
    ctx.shutdown();
    Ok(())
}

/// One enrolment attempt. Returns what is still pending afterwards.
async fn enroll(
    ctx: &StageContext,
    identifier: &Arc<dyn FaceIdentifier>,
    mut pending: PendingEnrollment,
    crops: &[Frame],
) -> StageResult<Option<PendingEnrollment>> {
    pending.attempts_left -= 1;
    let attempt = ENROLLMENT_ATTEMPTS - pending.attempts_left;

    match crops {
        [crop] => {
            let outcome = {
                let identifier = identifier.clone();
                let crop = crop.clone();
                let slot = pending.user_slot;
                run_blocking(ctx, move || identifier.enroll(slot, &crop)).await?
            };
            match outcome {
                Enrollment::Saved => {
                    log::info!(target: ctx.target(), "saved a face for {}", pending.user_slot);
                    return Ok(None);
                }
                Enrollment::FaceCount(faces) => {
                    log::warn!(target: ctx.target(), "attempt {}: {} faces were in frame though", attempt, faces);
                }
            }
        }
        _ => {
            log::warn!(target: ctx.target(), "attempt {}: {} humans were in frame though", attempt, crops.len());
        }
    }

    if pending.attempts_left == 0 {
        log::error!(
            target: ctx.target(),
            "failed to enrol {} after {} attempts",
            pending.user_slot,
            ENROLLMENT_ATTEMPTS
        );
        return Ok(None);
    }
    Ok(Some(pending))
}

async fn intruder_alert(
    ctx: StageContext,
    mut sightings: store::StoreValues<Sighting>,
    to_proxy: Sender<IntruderAlert>,
    to_archive: Sender<IntruderAlert>,
    quiet_window: Duration,
) -> StageResult {
    ctx.startup();

    let consumers = Arc::new((to_proxy, to_archive));
    let debouncer = Debouncer::new(quiet_window, move |alert: IntruderAlert| {
        let consumers = consumers.clone();
        async move {
            log::warn!(target: ctx.target(), "intruder alone in the room since {}", alert.timestamp);
            let (to_proxy, to_archive) = &*consumers;
            let delivery = at_least_one(vec![
                Branch::new("proxy", to_proxy, alert.clone()),
                Branch::new("archive", to_archive, alert),
            ])
            .await;
            if let Err(e) = delivery {
                ctx.dropped("intruder alert", e);
            }
        }
        .boxed()
    });

    while let Some(sighting) = sightings.next().await {
        match assess(&sighting.people) {
            Assessment::Trusted => debouncer.suppress(),
            Assessment::Intruder => debouncer.trigger(IntruderAlert {
                image: sighting.image,
                timestamp: sighting.timestamp,
            }),
            Assessment::Empty => {}
        }
    }

    ctx.shutdown();
    Ok(())
}
