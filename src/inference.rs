//! Inference collaborators - human detection, pose classification and face identification.
//!
//! The models themselves live outside this crate. Every call is CPU heavy and blocking,
//! so stages only ever invoke them through [`run_blocking`].

use crate::context::StageContext;
use crate::error::{StageError, StageResult};
use crate::types::{Activity, Frame, IdentifiedPerson, UserSlot};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Error reported by a model.
pub type InferenceError = Box<dyn std::error::Error + Send + Sync>;

/// A person found in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub crop: Frame,
    pub confidence: f64,
}

pub trait HumanDetector: Send + Sync + 'static {
    /// Every person in `frame`, cropped out.
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

pub trait PoseClassifier: Send + Sync + 'static {
    fn classify(&self, crop: &Frame) -> Result<Activity, InferenceError>;
}

/// Outcome of an enrolment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    Saved,
    /// The crop did not contain exactly one face; this many were found.
    FaceCount(usize),
}

pub trait FaceIdentifier: Send + Sync + 'static {
    /// Which trusted user the crop shows, if any.
    fn identify(&self, crop: &Frame) -> Result<IdentifiedPerson, InferenceError>;

    /// Learn the single face in `crop` as `slot`.
    fn enroll(&self, slot: UserSlot, crop: &Frame) -> Result<Enrollment, InferenceError>;
}

/// Run a blocking model call on the blocking pool and await it.
pub async fn run_blocking<T, F>(ctx: &StageContext, call: F) -> StageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InferenceError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ctx.collaborator_error(e)),
        Err(source) => Err(ctx.fault(StageError::Join {
            stage: ctx.target(),
            source,
        })),
    }
}

/// Finds zero to two people in each frame.
#[derive(Debug, Default)]
pub struct SimulatedDetector;

impl HumanDetector for SimulatedDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let width = (frame.width / 4).max(1);
        let height = (frame.height / 2).max(1);
        Ok((0..fastrand::usize(0..=2))
            .map(|_| Detection {
                crop: Frame::blank(width, height),
                confidence: 0.5 + fastrand::f64() / 2.0,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct SimulatedPoseClassifier;

impl PoseClassifier for SimulatedPoseClassifier {
    fn classify(&self, _crop: &Frame) -> Result<Activity, InferenceError> {
        const ACTIVITIES: [Activity; 3] = [Activity::Working, Activity::LyingDown, Activity::Neither];
        Ok(ACTIVITIES[fastrand::usize(..ACTIVITIES.len())])
    }
}

/// Recognizes a random enrolled user about half of the time.
#[derive(Debug, Default)]
pub struct SimulatedFaceIdentifier {
    enrolled: Mutex<BTreeSet<UserSlot>>,
}

impl SimulatedFaceIdentifier {
    pub fn with_enrolled(slots: impl IntoIterator<Item = UserSlot>) -> Self {
        Self {
            enrolled: Mutex::new(slots.into_iter().collect()),
        }
    }
}

impl FaceIdentifier for SimulatedFaceIdentifier {
    fn identify(&self, _crop: &Frame) -> Result<IdentifiedPerson, InferenceError> {
        let enrolled = self.enrolled.lock();
        if enrolled.is_empty() || fastrand::bool() {
            return Ok(None);
        }
        Ok(enrolled.iter().nth(fastrand::usize(..enrolled.len())).copied())
    }

    fn enroll(&self, slot: UserSlot, _crop: &Frame) -> Result<Enrollment, InferenceError> {
        self.enrolled.lock().insert(slot);
        Ok(Enrollment::Saved)
    }
}
