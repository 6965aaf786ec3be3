//! Human detection - find the people in the room, but only when there is reason to look.
//!
//! A detection is requested when motion starts, when the room becomes occupied, every
//! 15 seconds while it stays occupied, and every 5 minutes regardless. The next camera
//! frame after a request is run through the detector; frames nobody asked for are skipped.

use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::error::StageResult;
use crate::fanout::{at_least_one, Branch};
use crate::inference::{run_blocking, Detection, HumanDetector};
use crate::types::{Frame, HumansDetected, MotionChanged, OccupancyChanged};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Detections below this confidence are not people.
pub const MIN_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy)]
pub struct DetectionSchedule {
    /// How often to look again while the room is occupied.
    pub while_occupied: Duration,
    /// How often to look no matter what.
    pub periodic: Duration,
}

impl Default for DetectionSchedule {
    fn default() -> Self {
        Self {
            while_occupied: Duration::from_secs(15),
            periodic: Duration::from_secs(5 * 60),
        }
    }
}

pub struct DetectionInputs {
    pub from_motion: Receiver<MotionChanged>,
    pub from_occupancy: Receiver<OccupancyChanged>,
    pub from_camera: Receiver<Frame>,
}

pub struct DetectionOutputs {
    pub to_recognition: Sender<HumansDetected>,
    pub to_identification: Sender<HumansDetected>,
}

/// Keep the crops of confident detections.
pub fn confident_crops(detections: Vec<Detection>) -> Vec<Frame> {
    detections
        .into_iter()
        .filter(|detection| detection.confidence >= MIN_CONFIDENCE)
        .map(|detection| detection.crop)
        .collect()
}

/// Run until the camera feed ends.
pub async fn run(
    ctx: StageContext,
    detector: Arc<dyn HumanDetector>,
    inputs: DetectionInputs,
    outputs: DetectionOutputs,
    schedule: DetectionSchedule,
) -> StageResult {
    ctx.startup();

    let DetectionInputs {
        mut from_motion,
        mut from_occupancy,
        mut from_camera,
    } = inputs;

    let start = Instant::now();
    let mut occupied_timer = interval_at(start + schedule.while_occupied, schedule.while_occupied);
    occupied_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut periodic_timer = interval_at(start + schedule.periodic, schedule.periodic);
    periodic_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut requested = false;
    let mut occupied = false;
    let mut motion_open = true;
    let mut occupancy_open = true;

    loop {
        tokio::select! {
            message = from_motion.recv(), if motion_open => match message {
                Some(MotionChanged { new_state: true }) => {
                    log::debug!(target: ctx.target(), "motion started, requesting detection");
                    requested = true;
                }
                Some(_) => {}
                None => motion_open = false,
            },

            message = from_occupancy.recv(), if occupancy_open => match message {
                Some(OccupancyChanged { new_state }) => {
                    if new_state && !occupied {
                        log::debug!(target: ctx.target(), "room occupied, requesting detection");
                        requested = true;
                        occupied_timer.reset();
                    }
                    occupied = new_state;
                }
                None => occupancy_open = false,
            },

            _ = occupied_timer.tick(), if occupied => requested = true,

            _ = periodic_timer.tick() => requested = true,

            frame = from_camera.recv() => {
                let Some(frame) = frame else { break };
                if !requested {
                    continue;
                }

                log::info!(target: ctx.target(), "performing human detection on the latest frame");
                let images_of_humans = {
                    let detector = detector.clone();
                    let frame = frame.clone();
                    run_blocking(&ctx, move || detector.detect(&frame).map(confident_crops)).await?
                };
                log::info!(target: ctx.target(), "found {} human(s)", images_of_humans.len());

                // Requests that arrived while the detector ran were served by this frame.
                requested = false;

                let message = HumansDetected {
                    images_of_humans,
                    source: frame,
                    captured_at: Local::now(),
                };
                let delivery = at_least_one(vec![
                    Branch::new("recognition", &outputs.to_recognition, message.clone()),
                    Branch::new("identification", &outputs.to_identification, message),
                ])
                .await;

                if let Err(e) = delivery {
                    ctx.dropped("detected humans", e);
                    break;
                }
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::error::StageError;
    use crate::inference::InferenceError;
    use crate::stage_context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always sees one confident and one doubtful person.
    #[derive(Default)]
    struct CountingDetector {
        calls: AtomicUsize,
    }

    impl HumanDetector for CountingDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                Detection {
                    crop: Frame::blank(2, 4),
                    confidence: 0.93,
                },
                Detection {
                    crop: Frame::blank(2, 4),
                    confidence: 0.42,
                },
            ])
        }
    }

    struct BrokenDetector;

    impl HumanDetector for BrokenDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
            Err("no model loaded".into())
        }
    }

    struct Harness {
        motion: Sender<MotionChanged>,
        occupancy: Sender<OccupancyChanged>,
        camera: Sender<Frame>,
        recognition: Receiver<HumansDetected>,
        identification: Receiver<HumansDetected>,
        task: tokio::task::JoinHandle<StageResult>,
    }

    fn start(detector: Arc<dyn HumanDetector>) -> Harness {
        let (motion, from_motion) = channel(32);
        let (occupancy, from_occupancy) = channel(32);
        let (camera, from_camera) = channel(32);
        let (to_recognition, recognition) = channel(32);
        let (to_identification, identification) = channel(32);

        let task = tokio::spawn(run(
            stage_context!("detection", "test"),
            detector,
            DetectionInputs {
                from_motion,
                from_occupancy,
                from_camera,
            },
            DetectionOutputs {
                to_recognition,
                to_identification,
            },
            DetectionSchedule::default(),
        ));

        Harness {
            motion,
            occupancy,
            camera,
            recognition,
            identification,
            task,
        }
    }

    #[test]
    fn test_confident_crops() {
        let crops = confident_crops(vec![
            Detection {
                crop: Frame::blank(1, 1),
                confidence: 0.8,
            },
            Detection {
                crop: Frame::blank(2, 2),
                confidence: 0.79,
            },
        ]);
        assert_eq!(crops, vec![Frame::blank(1, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_without_request_are_skipped() {
        let detector = Arc::new(CountingDetector::default());
        let mut h = start(detector.clone());

        for _ in 0..5 {
            h.camera.send(Frame::blank(8, 8)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert!(h.recognition.try_recv().is_none());

        // Motion stopping is not a reason to look either.
        h.motion.send(MotionChanged { new_state: false }).await.unwrap();
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_triggers_one_detection_for_both_consumers() {
        let detector = Arc::new(CountingDetector::default());
        let mut h = start(detector.clone());

        h.motion.send(MotionChanged { new_state: true }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();

        let recognized = h.recognition.recv().await.unwrap();
        let identified = h.identification.recv().await.unwrap();
        assert_eq!(recognized.images_of_humans.len(), 1);
        assert_eq!(recognized.source, Frame::blank(8, 8));
        assert_eq!(recognized, identified);

        // The request was consumed.
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_room_is_rechecked() {
        let detector = Arc::new(CountingDetector::default());
        let mut h = start(detector.clone());

        h.occupancy.send(OccupancyChanged { new_state: true }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        h.recognition.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        h.recognition.recv().await.unwrap();
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);

        // Once the room is empty only the slow periodic check remains.
        h.occupancy.send(OccupancyChanged { new_state: false }).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_detection() {
        let detector = Arc::new(CountingDetector::default());
        let mut h = start(detector.clone());

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();
        h.identification.recv().await.unwrap();
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_camera_feed_ends() {
        let h = start(Arc::new(CountingDetector::default()));
        drop(h.camera);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_failure_is_fatal() {
        let h = start(Arc::new(BrokenDetector));
        h.motion.send(MotionChanged { new_state: true }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.camera.send(Frame::blank(8, 8)).await.unwrap();

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(StageError::Collaborator { .. })));
    }
}
