//! Lighting synthesis - decide how bright the light should be.
//!
//! Combines the ambient light level, what each person in the room is doing, who they
//! are, and every trusted user's schedule into a single target output in lumens.

use crate::types::{
    Activity, IdentifiedPerson, LightEffect, Preferences, PreferencesMap, Timer, UserSlot, WeekTime,
    MAX_OUTPUT_LUMENS,
};

/// Output for a room with people in it but nobody recognized.
pub const UNRECOGNIZED_ONLY_LUMENS: f64 = 300.0;

/// How much a desired brightness moves for someone working or lying down.
pub const ACTIVITY_ADJUSTMENT_LUMENS: f64 = 300.0;

/// The timer in effect at `now`: the last one starting at or before `now`.
///
/// The schedule wraps around the week, so before the first timer the last one of the
/// previous week still applies. `None` only for an empty schedule.
pub fn active_timer(preferences: &Preferences, now: WeekTime) -> Option<&Timer> {
    let timers = preferences.timers();
    match timers.partition_point(|timer| timer.starts_at() <= now) {
        0 => timers.last(),
        started => timers.get(started - 1),
    }
}

/// Lumens one recognized user wants the light to emit. `None` if their schedule is empty.
pub fn brightness_for_user(
    activity: Activity,
    ambient_lumens: f64,
    now: WeekTime,
    preferences: &Preferences,
) -> Option<f64> {
    let timer = active_timer(preferences, now)?;

    let lumens = match timer.effect {
        LightEffect::ForceBrightness { lumens } => lumens,
        LightEffect::DesiredBrightness { lumens } => {
            let adjusted = match activity {
                Activity::Working => lumens + ACTIVITY_ADJUSTMENT_LUMENS,
                Activity::LyingDown => lumens - ACTIVITY_ADJUSTMENT_LUMENS,
                Activity::Neither => lumens,
            };
            // The light only has to make up the difference to what is already there.
            (adjusted - ambient_lumens).clamp(0.0, MAX_OUTPUT_LUMENS)
        }
    };

    Some(lumens)
}

/// Target light output for the room.
///
/// `activities` and `people` are index-aligned (one entry per detected person).
pub fn calculate_synthesized_brightness(
    activities: &[Activity],
    ambient_lumens: f64,
    now: WeekTime,
    people: &[IdentifiedPerson],
    preferences: &PreferencesMap,
) -> f64 {
    if people.is_empty() {
        return 0.0;
    }

    let recognized: Vec<(usize, UserSlot)> = people
        .iter()
        .enumerate()
        .filter_map(|(index, person)| person.map(|slot| (index, slot)))
        .collect();

    if recognized.is_empty() {
        return UNRECOGNIZED_ONLY_LUMENS;
    }

    if activities.len() != people.len() {
        log::warn!(
            "{} activities for {} people, unmatched people count as neither working nor lying down",
            activities.len(),
            people.len()
        );
    }

    let contributions: Vec<f64> = recognized
        .into_iter()
        .filter_map(|(index, slot)| {
            let Some(user_preferences) = preferences.get(&slot) else {
                log::warn!("{} is in the room but has no preferences, ignoring them", slot);
                return None;
            };
            let activity = activities.get(index).copied().unwrap_or(Activity::Neither);
            let lumens = brightness_for_user(activity, ambient_lumens, now, user_preferences);
            if lumens.is_none() {
                log::warn!("{} has an empty schedule, ignoring them", slot);
            }
            lumens
        })
        .collect();

    if contributions.is_empty() {
        return UNRECOGNIZED_ONLY_LUMENS;
    }

    contributions.iter().sum::<f64>() / contributions.len() as f64
}

/// One of the four values the decision depends on, as held by the control stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisInput {
    Ambient(f64),
    Activities(Vec<Activity>),
    People(Vec<IdentifiedPerson>),
    Preferences(PreferencesMap),
}

/// Run the decision over the latest value of every input.
///
/// `None` if one of the four kinds of input is missing.
pub fn synthesize(inputs: &[&SynthesisInput], now: WeekTime) -> Option<f64> {
    let mut ambient = None;
    let mut activities = None;
    let mut people = None;
    let mut preferences = None;

    for input in inputs {
        match input {
            SynthesisInput::Ambient(lumens) => ambient = Some(*lumens),
            SynthesisInput::Activities(list) => activities = Some(list),
            SynthesisInput::People(list) => people = Some(list),
            SynthesisInput::Preferences(map) => preferences = Some(map),
        }
    }

    Some(calculate_synthesized_brightness(
        activities?,
        ambient?,
        now,
        people?,
        preferences?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(lumens: f64, weekday: u8, hour: u8, minute: u8) -> Timer {
        Timer::new(LightEffect::DesiredBrightness { lumens }, weekday, hour, minute)
    }

    fn forced(lumens: f64, weekday: u8, hour: u8, minute: u8) -> Timer {
        Timer::new(LightEffect::ForceBrightness { lumens }, weekday, hour, minute)
    }

    fn prefs(timers: Vec<Timer>) -> Preferences {
        Preferences::new("test", timers).unwrap()
    }

    fn single_user(slot: UserSlot, timers: Vec<Timer>) -> PreferencesMap {
        let mut map = PreferencesMap::new();
        map.insert(slot, prefs(timers));
        map
    }

    const MONDAY_NOON: WeekTime = WeekTime {
        weekday: 0,
        hour: 12,
        minute: 0,
    };

    #[test]
    fn test_empty_room_is_dark() {
        let map = single_user(UserSlot::One, vec![desired(500.0, 0, 0, 0)]);
        for ambient in [0.0, 300.0, 900.0] {
            assert_eq!(calculate_synthesized_brightness(&[], ambient, MONDAY_NOON, &[], &map), 0.0);
        }
    }

    #[test]
    fn test_only_unrecognized_people_get_half_brightness() {
        let map = PreferencesMap::new();
        let lumens = calculate_synthesized_brightness(
            &[Activity::Working, Activity::Neither],
            100.0,
            MONDAY_NOON,
            &[None, None],
            &map,
        );
        assert_eq!(lumens, 300.0);
    }

    #[test]
    fn test_forced_brightness_ignores_ambient_and_activity() {
        let map = single_user(UserSlot::Two, vec![forced(450.0, 0, 8, 0)]);
        for activity in [Activity::Working, Activity::LyingDown] {
            let lumens =
                calculate_synthesized_brightness(&[activity], 1500.0, MONDAY_NOON, &[Some(UserSlot::Two)], &map);
            assert_eq!(lumens, 450.0);
        }
    }

    #[test]
    fn test_desired_brightness_adjusts_for_activity() {
        let p = prefs(vec![desired(400.0, 0, 0, 0)]);
        assert_eq!(brightness_for_user(Activity::Neither, 100.0, MONDAY_NOON, &p), Some(300.0));
        assert_eq!(brightness_for_user(Activity::Working, 100.0, MONDAY_NOON, &p), Some(600.0));
        assert_eq!(brightness_for_user(Activity::LyingDown, 50.0, MONDAY_NOON, &p), Some(50.0));
    }

    #[test]
    fn test_desired_brightness_is_clamped() {
        let p = prefs(vec![desired(1200.0, 0, 0, 0)]);
        assert_eq!(brightness_for_user(Activity::Neither, 0.0, MONDAY_NOON, &p), Some(600.0));
        assert_eq!(brightness_for_user(Activity::Neither, 1500.0, MONDAY_NOON, &p), Some(0.0));

        // Lying down in a bright room never goes negative.
        let dim = prefs(vec![desired(100.0, 0, 0, 0)]);
        assert_eq!(brightness_for_user(Activity::LyingDown, 0.0, MONDAY_NOON, &dim), Some(0.0));
    }

    #[test]
    fn test_mean_of_recognized_users() {
        let mut map = PreferencesMap::new();
        map.insert(UserSlot::One, prefs(vec![forced(100.0, 0, 0, 0)]));
        map.insert(UserSlot::Three, prefs(vec![forced(500.0, 0, 0, 0)]));

        // The unrecognized person in the middle neither counts nor shifts the indices.
        let lumens = calculate_synthesized_brightness(
            &[Activity::Neither, Activity::Working, Activity::Neither],
            0.0,
            MONDAY_NOON,
            &[Some(UserSlot::One), None, Some(UserSlot::Three)],
            &map,
        );
        assert_eq!(lumens, 300.0);
    }

    #[test]
    fn test_users_without_preferences_are_skipped() {
        let map = single_user(UserSlot::One, vec![forced(200.0, 0, 0, 0)]);
        let lumens = calculate_synthesized_brightness(
            &[Activity::Neither, Activity::Neither],
            0.0,
            MONDAY_NOON,
            &[Some(UserSlot::One), Some(UserSlot::Four)],
            &map,
        );
        assert_eq!(lumens, 200.0);

        let nobody_known = calculate_synthesized_brightness(
            &[Activity::Neither],
            0.0,
            MONDAY_NOON,
            &[Some(UserSlot::Four)],
            &map,
        );
        assert_eq!(nobody_known, UNRECOGNIZED_ONLY_LUMENS);
    }

    #[test]
    fn test_missing_activity_counts_as_neither() {
        let map = single_user(UserSlot::One, vec![desired(400.0, 0, 0, 0)]);
        let lumens = calculate_synthesized_brightness(&[], 100.0, MONDAY_NOON, &[Some(UserSlot::One)], &map);
        assert_eq!(lumens, 300.0);
    }

    #[test]
    fn test_timer_applies_from_its_exact_minute() {
        let p = prefs(vec![forced(10.0, 2, 11, 20), forced(20.0, 2, 11, 40)]);

        let at = |hour, minute| active_timer(&p, WeekTime::new(2, hour, minute)).map(|t| t.effect);
        assert_eq!(at(11, 19), Some(LightEffect::ForceBrightness { lumens: 20.0 }));
        assert_eq!(at(11, 20), Some(LightEffect::ForceBrightness { lumens: 10.0 }));
        assert_eq!(at(11, 39), Some(LightEffect::ForceBrightness { lumens: 10.0 }));
        assert_eq!(at(11, 40), Some(LightEffect::ForceBrightness { lumens: 20.0 }));
        assert_eq!(at(23, 59), Some(LightEffect::ForceBrightness { lumens: 20.0 }));
    }

    #[test]
    fn test_schedule_wraps_around_the_week() {
        let p = prefs(vec![forced(1.0, 1, 8, 0), forced(2.0, 4, 18, 30)]);

        let lumens = |now| brightness_for_user(Activity::Neither, 0.0, now, &p);
        // Monday morning is still under Friday evening's timer.
        assert_eq!(lumens(WeekTime::new(0, 9, 0)), Some(2.0));
        assert_eq!(lumens(WeekTime::new(1, 7, 59)), Some(2.0));
        assert_eq!(lumens(WeekTime::new(1, 8, 0)), Some(1.0));
        assert_eq!(lumens(WeekTime::new(4, 18, 29)), Some(1.0));
        assert_eq!(lumens(WeekTime::new(6, 23, 59)), Some(2.0));
    }

    #[test]
    fn test_weekday_orders_before_hour() {
        // Tuesday 01:00 comes after Monday 23:00 even though its hour is smaller.
        let p = prefs(vec![forced(1.0, 0, 23, 0), forced(2.0, 1, 1, 0)]);
        assert_eq!(
            active_timer(&p, WeekTime::new(1, 0, 30)).map(|t| t.effect),
            Some(LightEffect::ForceBrightness { lumens: 1.0 })
        );
        assert_eq!(
            active_timer(&p, WeekTime::new(1, 1, 0)).map(|t| t.effect),
            Some(LightEffect::ForceBrightness { lumens: 2.0 })
        );
    }

    #[test]
    fn test_single_timer_applies_all_week() {
        let p = prefs(vec![forced(5.0, 3, 12, 0)]);
        for now in [WeekTime::new(0, 0, 0), WeekTime::new(3, 12, 0), WeekTime::new(6, 23, 59)] {
            assert_eq!(brightness_for_user(Activity::Neither, 0.0, now, &p), Some(5.0));
        }
        let empty = prefs(Vec::new());
        assert_eq!(active_timer(&empty, MONDAY_NOON), None);
    }

    #[test]
    fn test_synthesize_needs_every_input() {
        let map = single_user(UserSlot::One, vec![forced(250.0, 0, 0, 0)]);
        let ambient = SynthesisInput::Ambient(0.0);
        let activities = SynthesisInput::Activities(vec![Activity::Neither]);
        let people = SynthesisInput::People(vec![Some(UserSlot::One)]);
        let preferences = SynthesisInput::Preferences(map);

        assert_eq!(synthesize(&[&ambient, &activities, &people], MONDAY_NOON), None);
        assert_eq!(
            synthesize(&[&ambient, &activities, &people, &preferences], MONDAY_NOON),
            Some(250.0)
        );
    }
}
