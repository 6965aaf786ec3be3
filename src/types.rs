//! Luxflow - core records and the messages exchanged between pipeline stages.

use crate::error::PreferencesError;
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Brightest output the light can produce (lumens).
pub const MAX_OUTPUT_LUMENS: f64 = 600.0;

/// Upper bound for a desired "end up at" brightness (sunlight through a window).
pub const MAX_DESIRED_LUMENS: f64 = 2000.0;

/// One of the four trusted-user slots the appliance supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserSlot {
    One,
    Two,
    Three,
    Four,
}

impl UserSlot {
    pub const ALL: [UserSlot; 4] = [UserSlot::One, UserSlot::Two, UserSlot::Three, UserSlot::Four];

    pub fn number(self) -> u8 {
        match self {
            UserSlot::One => 1,
            UserSlot::Two => 2,
            UserSlot::Three => 3,
            UserSlot::Four => 4,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(UserSlot::One),
            2 => Some(UserSlot::Two),
            3 => Some(UserSlot::Three),
            4 => Some(UserSlot::Four),
            _ => None,
        }
    }
}

impl fmt::Display for UserSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user {}", self.number())
    }
}

impl FromStr for UserSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(UserSlot::from_number)
            .ok_or_else(|| format!("invalid user slot {:?} (must be 1-4)", s))
    }
}

/// What a person in the room is doing, as classified from their pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    Working,
    LyingDown,
    Neither,
}

impl FromStr for Activity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "working" => Ok(Activity::Working),
            "lying" | "lying-down" | "lying_down" => Ok(Activity::LyingDown),
            "neither" | "other" => Ok(Activity::Neither),
            _ => Err(format!("invalid activity {:?} (must be working/lying/neither)", s)),
        }
    }
}

/// `None` means a person is present but was not recognized.
pub type IdentifiedPerson = Option<UserSlot>;

/// What a schedule entry asks of the light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LightEffect {
    /// The room should end up this bright, ambient light included. Adjusted for activity.
    DesiredBrightness { lumens: f64 },
    /// Emit exactly this much light, ignoring everything else.
    ForceBrightness { lumens: f64 },
}

/// A point in the week with minute resolution. Weekday 0 is Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekTime {
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
}

impl WeekTime {
    pub fn new(weekday: u8, hour: u8, minute: u8) -> Self {
        Self {
            weekday,
            hour,
            minute,
        }
    }

    pub fn of<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            weekday: at.weekday().num_days_from_monday() as u8,
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }

    pub fn now() -> Self {
        Self::of(&Local::now())
    }

    pub fn is_valid(&self) -> bool {
        self.weekday < 7 && self.hour < 24 && self.minute < 60
    }
}

impl fmt::Display for WeekTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        let day = DAYS.get(self.weekday as usize).copied().unwrap_or("???");
        write!(f, "{} {:02}:{:02}", day, self.hour, self.minute)
    }
}

/// One schedule entry: from this point in the week on, apply `effect`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub effect: LightEffect,
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
}

impl Timer {
    pub fn new(effect: LightEffect, weekday: u8, hour: u8, minute: u8) -> Self {
        Self {
            effect,
            weekday,
            hour,
            minute,
        }
    }

    pub fn starts_at(&self) -> WeekTime {
        WeekTime::new(self.weekday, self.hour, self.minute)
    }

    fn validate(&self) -> Result<(), PreferencesError> {
        if !self.starts_at().is_valid() {
            return Err(PreferencesError::InvalidTime {
                weekday: self.weekday,
                hour: self.hour,
                minute: self.minute,
            });
        }
        match self.effect {
            LightEffect::ForceBrightness { lumens } if !(0.0..=MAX_OUTPUT_LUMENS).contains(&lumens) => {
                Err(PreferencesError::ForcedLumensOutOfRange(lumens))
            }
            LightEffect::DesiredBrightness { lumens } if !(0.0..=MAX_DESIRED_LUMENS).contains(&lumens) => {
                Err(PreferencesError::DesiredLumensOutOfRange(lumens))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct PreferencesRecord {
    name: String,
    #[serde(default)]
    timers: Vec<Timer>,
}

/// A user's lighting schedule. Timers are always sorted by time of the week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PreferencesRecord")]
pub struct Preferences {
    name: String,
    timers: Vec<Timer>,
}

impl Preferences {
    /// Validate and sort `timers`.
    pub fn new(name: impl Into<String>, mut timers: Vec<Timer>) -> Result<Self, PreferencesError> {
        for timer in &timers {
            timer.validate()?;
        }
        timers.sort_by_key(Timer::starts_at);

        Ok(Self {
            name: name.into(),
            timers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timers(&self) -> &[Timer] {
        &self.timers
    }
}

impl TryFrom<PreferencesRecord> for Preferences {
    type Error = PreferencesError;

    fn try_from(record: PreferencesRecord) -> Result<Self, Self::Error> {
        Preferences::new(record.name, record.timers)
    }
}

/// Preferences of every trusted user.
pub type PreferencesMap = BTreeMap<UserSlot, Preferences>;

/// A raw RGB8 camera image (or a crop of one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// An all-black frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0; (width * height * 3) as usize])
    }
}

/// Motion sensor state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionChanged {
    pub new_state: bool,
}

/// Occupancy sensor state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyChanged {
    pub new_state: bool,
}

/// Ambient light reading for the decision stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientBrightness {
    pub lumens: f64,
}

/// Crops of every human found in one camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct HumansDetected {
    pub images_of_humans: Vec<Frame>,
    pub source: Frame,
    pub captured_at: DateTime<Local>,
}

/// Activity per person, index-aligned with the detected people.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitiesRecognized {
    pub activities: Vec<Activity>,
}

/// Identity per person, index-aligned with the detected people.
#[derive(Debug, Clone, PartialEq)]
pub struct PeopleIdentified {
    pub identified_people: Vec<IdentifiedPerson>,
}

/// The full preferences map, sent whenever any user's schedule changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencesSnapshot {
    pub preferences: PreferencesMap,
}

/// Duty cycle (0.0..=1.0) the light should be driven at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutyCycle {
    pub duty_cycle: f64,
}

/// Power the light is drawing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerDraw {
    pub watts: f64,
}

/// Someone unrecognized has been alone in the room for the whole quiet window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntruderAlert {
    pub image: Frame,
    pub timestamp: DateTime<Local>,
}

/// A camera frame for the remote users currently watching the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrameForUsers {
    pub frame: Frame,
    pub user_ids: Vec<String>,
}

/// A user's preferences changed here and should be mirrored remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencesChanged {
    pub user_slot: UserSlot,
    pub preferences: Preferences,
}

/// Remote request to replace one user's preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencesUpdate {
    pub user_slot: UserSlot,
    pub preferences: Preferences,
}

/// Remote request to enrol the person currently in view as a trusted user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddTrustedUser {
    pub user_slot: UserSlot,
}

/// Whether a remote user wants the live camera feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFeedInterest {
    pub user_id: String,
    pub wants_camera_feed: bool,
}

/// Remote request for the current duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleRequest;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_preferences_sorted_on_creation() {
        let prefs = Preferences::new(
            "Jacob",
            vec![
                Timer::new(LightEffect::ForceBrightness { lumens: 0.0 }, 2, 11, 40),
                Timer::new(LightEffect::DesiredBrightness { lumens: 600.0 }, 0, 0, 0),
                Timer::new(LightEffect::DesiredBrightness { lumens: 300.0 }, 2, 11, 20),
            ],
        )
        .unwrap();

        let starts: Vec<WeekTime> = prefs.timers().iter().map(Timer::starts_at).collect();
        assert_eq!(
            starts,
            vec![WeekTime::new(0, 0, 0), WeekTime::new(2, 11, 20), WeekTime::new(2, 11, 40)]
        );
    }

    #[test]
    fn test_preferences_reject_out_of_range_lumens() {
        let forced = Timer::new(LightEffect::ForceBrightness { lumens: 601.0 }, 0, 8, 0);
        assert_eq!(
            Preferences::new("x", vec![forced]),
            Err(PreferencesError::ForcedLumensOutOfRange(601.0))
        );

        let desired = Timer::new(LightEffect::DesiredBrightness { lumens: -1.0 }, 0, 8, 0);
        assert_eq!(
            Preferences::new("x", vec![desired]),
            Err(PreferencesError::DesiredLumensOutOfRange(-1.0))
        );

        // Desired brightness may exceed what the bulb can emit.
        let bright = Timer::new(LightEffect::DesiredBrightness { lumens: 2000.0 }, 0, 8, 0);
        assert!(Preferences::new("x", vec![bright]).is_ok());
    }

    #[test]
    fn test_preferences_reject_invalid_time() {
        let timer = Timer::new(LightEffect::ForceBrightness { lumens: 10.0 }, 7, 0, 0);
        assert!(matches!(
            Preferences::new("x", vec![timer]),
            Err(PreferencesError::InvalidTime { weekday: 7, .. })
        ));
    }

    #[test]
    fn test_preferences_deserialize_validates() {
        let ok: Preferences = serde_json::from_str(
            r#"{"name":"A","timers":[
                {"effect":{"ForceBrightness":{"lumens":100.0}},"weekday":3,"hour":9,"minute":0},
                {"effect":{"DesiredBrightness":{"lumens":500.0}},"weekday":1,"hour":7,"minute":30}
            ]}"#,
        )
        .unwrap();
        assert_eq!(ok.timers()[0].weekday, 1);

        let bad = serde_json::from_str::<Preferences>(
            r#"{"name":"A","timers":[{"effect":{"ForceBrightness":{"lumens":900.0}},"weekday":0,"hour":0,"minute":0}]}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_week_time_of_datetime() {
        // 2024-01-03 is a Wednesday
        let at = NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(13, 21, 59)
            .unwrap()
            .and_utc();
        assert_eq!(WeekTime::of(&at), WeekTime::new(2, 13, 21));
    }

    #[test]
    fn test_user_slot_parsing() {
        assert_eq!("3".parse::<UserSlot>(), Ok(UserSlot::Three));
        assert!("5".parse::<UserSlot>().is_err());
        assert_eq!(UserSlot::Two.to_string(), "user 2");
        assert_eq!("lying".parse::<Activity>(), Ok(Activity::LyingDown));
    }
}
