//! Archive - current state and history for the remote.
//!
//! Keeps the latest duty cycle to answer remote requests, forwards camera frames while
//! any remote user is watching, and appends significant events to a per-day history
//! file (`<history_folder>/YYYY/MM/DD/events.jsonl`, one JSON object per line).

use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::error::StageResult;
use crate::stage_context;
use crate::types::{CameraFeedInterest, CameraFrameForUsers, DutyCycle, DutyCycleRequest, Frame, IntruderAlert, PowerDraw};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Light output at reduced resolution. Only changes of bucket are worth keeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LightBucket {
    Off,
    UpTo25,
    UpTo50,
    UpTo75,
    Below100,
    Full,
}

/// `None` for duty cycles outside 0.0..=1.0.
pub fn bucket(duty_cycle: f64) -> Option<LightBucket> {
    match duty_cycle {
        d if d == 1.0 => Some(LightBucket::Full),
        d if (0.75..1.0).contains(&d) => Some(LightBucket::Below100),
        d if (0.5..0.75).contains(&d) => Some(LightBucket::UpTo75),
        d if (0.25..0.5).contains(&d) => Some(LightBucket::UpTo50),
        d if d > 0.0 && d < 0.25 => Some(LightBucket::UpTo25),
        d if d == 0.0 => Some(LightBucket::Off),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryEventKind {
    Brightness { bucket: LightBucket },
    Energy { watts: f64 },
    Intruder { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub at: DateTime<Local>,
    pub kind: HistoryEventKind,
}

/// Remote request for one day of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub user_id: String,
    pub date: NaiveDate,
}

/// A day of history for the user who asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryForUser {
    pub user_id: String,
    pub date: NaiveDate,
    pub events: Vec<HistoryEvent>,
}

/// The on-disk event log.
#[derive(Debug, Clone)]
pub struct History {
    folder: PathBuf,
}

impl History {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self { folder: folder.into() }
    }

    pub fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.folder
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join("events.jsonl")
    }

    pub async fn append(&self, event: &HistoryEvent) -> io::Result<()> {
        let path = self.day_file(event.at.date_naive());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// Every event of `date` in time order. A missing file is an empty day; malformed
    /// lines are skipped.
    pub async fn day(&self, ctx: &StageContext, date: NaiveDate) -> io::Result<Vec<HistoryEvent>> {
        let contents = match tokio::fs::read_to_string(self.day_file(date)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut events: Vec<HistoryEvent> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    ctx.rejected("history line", e);
                    None
                }
            })
            .collect();
        events.sort_by_key(|event| event.at);
        Ok(events)
    }

    async fn record(&self, ctx: &StageContext, event: HistoryEvent) {
        log::debug!(target: ctx.target(), "recording {:?}", event.kind);
        if let Err(e) = self.append(&event).await {
            ctx.rejected("history event", e);
        }
    }
}

pub struct ArchiveInputs {
    pub from_control_duty_cycle: Receiver<DutyCycle>,
    pub from_control_power: Receiver<PowerDraw>,
    pub from_environment_frame: Receiver<Frame>,
    pub from_identification_alert: Receiver<IntruderAlert>,
    pub from_proxy_camera_interest: Receiver<CameraFeedInterest>,
    pub from_proxy_duty_cycle_request: Receiver<DutyCycleRequest>,
    pub from_proxy_history_request: Receiver<HistoryRequest>,
}

pub struct ArchiveOutputs {
    pub to_proxy_duty_cycle: Sender<DutyCycle>,
    pub to_proxy_camera_frame: Sender<CameraFrameForUsers>,
    pub to_proxy_history: Sender<HistoryForUser>,
}

pub async fn run(ctx: StageContext, inputs: ArchiveInputs, outputs: ArchiveOutputs, history: History) -> StageResult {
    ctx.startup();

    tokio::try_join!(
        duty_cycle_state(
            stage_context!("archive", "duty_cycle"),
            inputs.from_control_duty_cycle,
            inputs.from_proxy_duty_cycle_request,
            outputs.to_proxy_duty_cycle,
            &history,
        ),
        energy(stage_context!("archive", "energy"), inputs.from_control_power, &history),
        camera_feed(
            stage_context!("archive", "camera_feed"),
            inputs.from_environment_frame,
            inputs.from_proxy_camera_interest,
            outputs.to_proxy_camera_frame,
        ),
        intruder_alerts(
            stage_context!("archive", "intruder_alerts"),
            inputs.from_identification_alert,
            &history,
        ),
        history_requests(
            stage_context!("archive", "history_requests"),
            inputs.from_proxy_history_request,
            outputs.to_proxy_history,
            &history,
        ),
    )?;

    ctx.shutdown();
    Ok(())
}

/// Track the current duty cycle, answer requests for it, and record bucket changes.
async fn duty_cycle_state(
    ctx: StageContext,
    mut from_control: Receiver<DutyCycle>,
    mut from_proxy_request: Receiver<DutyCycleRequest>,
    to_proxy: Sender<DutyCycle>,
    history: &History,
) -> StageResult {
    ctx.startup();

    let mut current: Option<f64> = None;
    let mut last_bucket: Option<LightBucket> = None;
    let mut requests_open = true;

    loop {
        tokio::select! {
            // Queued updates are applied before any request is answered.
            biased;

            update = from_control.recv() => {
                let Some(DutyCycle { duty_cycle }) = update else { break };
                current = Some(duty_cycle);

                let Some(this_bucket) = bucket(duty_cycle) else {
                    ctx.rejected("duty cycle", format!("{} is outside 0..=1", duty_cycle));
                    continue;
                };
                if last_bucket != Some(this_bucket) {
                    history
                        .record(&ctx, HistoryEvent {
                            at: Local::now(),
                            kind: HistoryEventKind::Brightness { bucket: this_bucket },
                        })
                        .await;
                    last_bucket = Some(this_bucket);
                }
            }

            request = from_proxy_request.recv(), if requests_open => match request {
                Some(DutyCycleRequest) => match current {
                    Some(duty_cycle) => {
                        if let Err(e) = to_proxy.send(DutyCycle { duty_cycle }).await {
                            ctx.dropped("current duty cycle", e);
                            requests_open = false;
                        }
                    }
                    None => log::debug!(target: ctx.target(), "no duty cycle yet, ignoring request"),
                },
                None => requests_open = false,
            },
        }
    }

    ctx.shutdown();
    Ok(())
}

/// Record the power draw whenever it changes.
async fn energy(ctx: StageContext, mut from_control: Receiver<PowerDraw>, history: &History) -> StageResult {
    ctx.startup();

    let mut last_watts: Option<f64> = None;
    while let Some(PowerDraw { watts }) = from_control.recv().await {
        if last_watts != Some(watts) {
            history
                .record(&ctx, HistoryEvent {
                    at: Local::now(),
                    kind: HistoryEventKind::Energy { watts },
                })
                .await;
            last_watts = Some(watts);
        }
    }

    ctx.shutdown();
    Ok(())
}

/// Forward frames to the users watching. Frames nobody is watching are dropped.
async fn camera_feed(
    ctx: StageContext,
    mut from_environment: Receiver<Frame>,
    mut from_proxy_interest: Receiver<CameraFeedInterest>,
    to_proxy: Sender<CameraFrameForUsers>,
) -> StageResult {
    ctx.startup();

    let mut watching: BTreeSet<String> = BTreeSet::new();
    let mut interest_open = true;
    let mut proxy_open = true;

    loop {
        tokio::select! {
            biased;

            interest = from_proxy_interest.recv(), if interest_open => match interest {
                Some(CameraFeedInterest { user_id, wants_camera_feed }) => {
                    if wants_camera_feed {
                        watching.insert(user_id);
                    } else if !watching.remove(&user_id) {
                        log::debug!(target: ctx.target(), "{} was not watching", user_id);
                    }
                    log::info!(target: ctx.target(), "{} user(s) watching the camera", watching.len());
                }
                None => {
                    interest_open = false;
                    watching.clear();
                }
            },

            frame = from_environment.recv() => {
                let Some(frame) = frame else { break };
                if watching.is_empty() || !proxy_open {
                    continue;
                }

                let message = CameraFrameForUsers {
                    frame,
                    user_ids: watching.iter().cloned().collect(),
                };
                if let Err(e) = to_proxy.send(message).await {
                    ctx.dropped("camera frame", e);
                    proxy_open = false;
                }
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

async fn intruder_alerts(ctx: StageContext, mut from_identification: Receiver<IntruderAlert>, history: &History) -> StageResult {
    ctx.startup();

    while let Some(IntruderAlert { image, timestamp }) = from_identification.recv().await {
        history
            .record(&ctx, HistoryEvent {
                at: timestamp,
                kind: HistoryEventKind::Intruder {
                    width: image.width,
                    height: image.height,
                },
            })
            .await;
    }

    ctx.shutdown();
    Ok(())
}

async fn history_requests(
    ctx: StageContext,
    mut from_proxy: Receiver<HistoryRequest>,
    to_proxy: Sender<HistoryForUser>,
    history: &History,
) -> StageResult {
    ctx.startup();

    while let Some(HistoryRequest { user_id, date }) = from_proxy.recv().await {
        let events = match history.day(&ctx, date).await {
            Ok(events) => events,
            Err(e) => {
                ctx.rejected(&format!("history of {}", date), e);
                continue;
            }
        };
        log::debug!(target: ctx.target(), "sending {} event(s) of {} to {}", events.len(), date, user_id);

        if let Err(e) = to_proxy.send(HistoryForUser { user_id, date, events }).await {
            ctx.dropped("history", e);
            break;
        }
    }

    ctx.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use chrono::TimeZone;
    use std::path::Path;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    struct Harness {
        duty_cycle: Sender<DutyCycle>,
        power: Sender<PowerDraw>,
        frames: Sender<Frame>,
        alerts: Sender<IntruderAlert>,
        interest: Sender<CameraFeedInterest>,
        duty_cycle_requests: Sender<DutyCycleRequest>,
        history_requests: Sender<HistoryRequest>,
        proxy_duty_cycle: Receiver<DutyCycle>,
        proxy_frames: Receiver<CameraFrameForUsers>,
        proxy_history: Receiver<HistoryForUser>,
        task: tokio::task::JoinHandle<StageResult>,
    }

    fn start(folder: &Path) -> Harness {
        let (duty_cycle, from_control_duty_cycle) = channel(32);
        let (power, from_control_power) = channel(32);
        let (frames, from_environment_frame) = channel(32);
        let (alerts, from_identification_alert) = channel(32);
        let (interest, from_proxy_camera_interest) = channel(32);
        let (duty_cycle_requests, from_proxy_duty_cycle_request) = channel(32);
        let (history_requests, from_proxy_history_request) = channel(32);
        let (to_proxy_duty_cycle, proxy_duty_cycle) = channel(32);
        let (to_proxy_camera_frame, proxy_frames) = channel(32);
        let (to_proxy_history, proxy_history) = channel(32);

        let task = tokio::spawn(run(
            stage_context!("archive", "test"),
            ArchiveInputs {
                from_control_duty_cycle,
                from_control_power,
                from_environment_frame,
                from_identification_alert,
                from_proxy_camera_interest,
                from_proxy_duty_cycle_request,
                from_proxy_history_request,
            },
            ArchiveOutputs {
                to_proxy_duty_cycle,
                to_proxy_camera_frame,
                to_proxy_history,
            },
            History::new(folder),
        ));

        Harness {
            duty_cycle,
            power,
            frames,
            alerts,
            interest,
            duty_cycle_requests,
            history_requests,
            proxy_duty_cycle,
            proxy_frames,
            proxy_history,
            task,
        }
    }

    #[test]
    fn test_buckets() {
        assert_eq!(bucket(0.0), Some(LightBucket::Off));
        assert_eq!(bucket(0.1), Some(LightBucket::UpTo25));
        assert_eq!(bucket(0.25), Some(LightBucket::UpTo50));
        assert_eq!(bucket(0.5), Some(LightBucket::UpTo75));
        assert_eq!(bucket(0.99), Some(LightBucket::Below100));
        assert_eq!(bucket(1.0), Some(LightBucket::Full));
        assert_eq!(bucket(1.01), None);
        assert_eq!(bucket(f64::NAN), None);
    }

    #[test]
    fn test_day_file_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            History::new("history").day_file(date),
            PathBuf::from("history/2024/03/07/events.jsonl")
        );
    }

    #[tokio::test]
    async fn test_history_append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path());
        let ctx = stage_context!("archive", "test");
        let at = |h| Local.with_ymd_and_hms(2024, 3, 7, h, 0, 0).unwrap();

        history
            .append(&HistoryEvent {
                at: at(14),
                kind: HistoryEventKind::Energy { watts: 4.25 },
            })
            .await
            .unwrap();
        history
            .append(&HistoryEvent {
                at: at(9),
                kind: HistoryEventKind::Brightness {
                    bucket: LightBucket::UpTo50,
                },
            })
            .await
            .unwrap();

        let file = history.day_file(at(9).date_naive());
        let mut contents = std::fs::read_to_string(&file).unwrap();
        contents.push_str("garbage\n");
        std::fs::write(&file, contents).unwrap();

        let events = history.day(&ctx, at(9).date_naive()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].at, at(9));
        assert_eq!(events[1].kind, HistoryEventKind::Energy { watts: 4.25 });

        let empty = history.day(&ctx, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_answers_duty_cycle_requests_once_known() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path());

        h.duty_cycle_requests.send(DutyCycleRequest).await.unwrap();
        h.duty_cycle.send(DutyCycle { duty_cycle: 0.4 }).await.unwrap();
        h.duty_cycle.send(DutyCycle { duty_cycle: 0.45 }).await.unwrap();
        h.duty_cycle_requests.send(DutyCycleRequest).await.unwrap();

        assert_eq!(h.proxy_duty_cycle.recv().await, Some(DutyCycle { duty_cycle: 0.45 }));
    }

    #[tokio::test]
    async fn test_records_bucket_changes_energy_and_intruders() {
        let dir = tempfile::tempdir().unwrap();
        let h = start(dir.path());

        for duty_cycle in [0.3, 0.35, 0.4, 0.8, 0.8] {
            h.duty_cycle.send(DutyCycle { duty_cycle }).await.unwrap();
        }
        for watts in [4.25, 4.25, 8.4] {
            h.power.send(PowerDraw { watts }).await.unwrap();
        }
        h.alerts
            .send(IntruderAlert {
                image: Frame::blank(4, 3),
                timestamp: Local::now(),
            })
            .await
            .unwrap();

        let Harness {
            duty_cycle,
            power,
            frames,
            alerts,
            history_requests,
            task,
            ..
        } = h;
        drop((duty_cycle, power, frames, alerts, history_requests));
        task.await.unwrap().unwrap();

        let ctx = stage_context!("archive", "test");
        let events = History::new(dir.path())
            .day(&ctx, Local::now().date_naive())
            .await
            .unwrap();
        let count = |f: fn(&HistoryEventKind) -> bool| events.iter().filter(|e| f(&e.kind)).count();

        assert_eq!(count(|k| matches!(k, HistoryEventKind::Brightness { .. })), 2);
        assert_eq!(count(|k| matches!(k, HistoryEventKind::Energy { .. })), 2);
        assert_eq!(count(|k| matches!(k, HistoryEventKind::Intruder { width: 4, height: 3 })), 1);
    }

    #[tokio::test]
    async fn test_camera_frames_only_while_watched() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path());

        h.frames.send(Frame::blank(1, 1)).await.unwrap();
        settle().await;
        h.interest
            .send(CameraFeedInterest {
                user_id: "ada".into(),
                wants_camera_feed: true,
            })
            .await
            .unwrap();
        h.frames.send(Frame::blank(2, 2)).await.unwrap();

        let forwarded = h.proxy_frames.recv().await.unwrap();
        assert_eq!(forwarded.frame, Frame::blank(2, 2));
        assert_eq!(forwarded.user_ids, vec!["ada".to_string()]);

        h.interest
            .send(CameraFeedInterest {
                user_id: "ada".into(),
                wants_camera_feed: false,
            })
            .await
            .unwrap();
        h.frames.send(Frame::blank(3, 3)).await.unwrap();
        settle().await;
        assert!(h.proxy_frames.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_history_request_returns_the_day() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::new(dir.path());
        let at = Local.with_ymd_and_hms(2024, 3, 7, 12, 30, 0).unwrap();
        history
            .append(&HistoryEvent {
                at,
                kind: HistoryEventKind::Energy { watts: 5.0 },
            })
            .await
            .unwrap();

        let mut h = start(dir.path());
        h.history_requests
            .send(HistoryRequest {
                user_id: "ada".into(),
                date: at.date_naive(),
            })
            .await
            .unwrap();

        let reply = h.proxy_history.recv().await.unwrap();
        assert_eq!(reply.user_id, "ada");
        assert_eq!(reply.events.len(), 1);
    }
}
