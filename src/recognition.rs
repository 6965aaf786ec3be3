//! Activity recognition - classify what every detected person is doing.

use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::error::StageResult;
use crate::inference::{run_blocking, PoseClassifier};
use crate::types::{ActivitiesRecognized, Activity, HumansDetected};
use std::sync::Arc;

/// Run until detection stops or the decision stage goes away.
pub async fn run(
    ctx: StageContext,
    classifier: Arc<dyn PoseClassifier>,
    mut from_detection: Receiver<HumansDetected>,
    to_control: Sender<ActivitiesRecognized>,
) -> StageResult {
    ctx.startup();

    while let Some(HumansDetected { images_of_humans, .. }) = from_detection.recv().await {
        let activities = {
            let classifier = classifier.clone();
            run_blocking(&ctx, move || {
                images_of_humans
                    .iter()
                    .map(|crop| classifier.classify(crop))
                    .collect::<Result<Vec<Activity>, _>>()
            })
            .await?
        };
        log::info!(target: ctx.target(), "recognized activities: {:?}", activities);

        if let Err(e) = to_control.send(ActivitiesRecognized { activities }).await {
            ctx.dropped("recognized activities", e);
            break;
        }
    }

    ctx.shutdown();
    Ok(())
}
