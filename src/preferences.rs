//! Preferences - owns every trusted user's lighting schedule.
//!
//! The whole map goes to the decision stage on start and after every change. Changes
//! arrive from the remote, are persisted as `<trusted_users_folder>/<slot>/preferences.json`
//! and echoed back so every remote client sees them.

use crate::channel::{Receiver, Sender};
use crate::context::StageContext;
use crate::error::StageResult;
use crate::types::{
    LightEffect, Preferences, PreferencesChanged, PreferencesMap, PreferencesSnapshot, PreferencesUpdate, Timer,
    UserSlot,
};
use std::io;
use std::path::{Path, PathBuf};

/// Where the starting preferences come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferencesSource {
    /// Built-in schedule for demonstrations.
    Demo,
    /// Whatever was saved under the trusted users folder.
    Saved,
}

pub struct PreferencesChannels {
    pub from_proxy: Receiver<PreferencesUpdate>,
    pub to_control: Sender<PreferencesSnapshot>,
    pub to_proxy: Sender<PreferencesChanged>,
}

/// A schedule for user 2 that exercises every kind of timer on Wednesday around noon.
pub fn demo_preferences() -> PreferencesMap {
    use LightEffect::{DesiredBrightness as Desired, ForceBrightness as Force};

    let timers = vec![
        Timer::new(Desired { lumens: 600.0 }, 0, 0, 0),
        Timer::new(Desired { lumens: 300.0 }, 2, 11, 20),
        Timer::new(Force { lumens: 600.0 }, 2, 11, 30),
        Timer::new(Force { lumens: 0.0 }, 2, 11, 40),
        Timer::new(Desired { lumens: 300.0 }, 2, 11, 50),
        Timer::new(Force { lumens: 300.0 }, 2, 12, 0),
        Timer::new(Desired { lumens: 600.0 }, 2, 13, 20),
        Timer::new(Force { lumens: 0.0 }, 2, 13, 21),
        Timer::new(Desired { lumens: 900.0 }, 2, 13, 22),
        Timer::new(Desired { lumens: 300.0 }, 2, 13, 23),
    ];

    let mut map = PreferencesMap::new();
    match Preferences::new("J / Jacob", timers) {
        Ok(preferences) => {
            map.insert(UserSlot::Two, preferences);
        }
        Err(e) => log::error!("built-in demo preferences are invalid: {}", e),
    }
    map
}

pub fn preferences_path(folder: &Path, slot: UserSlot) -> PathBuf {
    folder.join(slot.number().to_string()).join("preferences.json")
}

/// Read every user's saved preferences. Missing files are skipped, malformed ones logged and skipped.
pub async fn load(ctx: &StageContext, folder: &Path) -> PreferencesMap {
    let mut map = PreferencesMap::new();

    for slot in UserSlot::ALL {
        let path = preferences_path(folder, slot);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!(target: ctx.target(), "no saved preferences for {}", slot);
                continue;
            }
            Err(e) => {
                ctx.rejected(&path.display().to_string(), e);
                continue;
            }
        };

        match serde_json::from_str::<Preferences>(&contents) {
            Ok(preferences) => {
                map.insert(slot, preferences);
            }
            Err(e) => ctx.rejected(&path.display().to_string(), e),
        }
    }

    map
}

pub async fn save(folder: &Path, slot: UserSlot, preferences: &Preferences) -> io::Result<()> {
    let path = preferences_path(folder, slot);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(preferences).map_err(io::Error::other)?;
    tokio::fs::write(&path, json).await
}

/// Run until the remote stops sending updates or the decision stage goes away.
pub async fn run(
    ctx: StageContext,
    channels: PreferencesChannels,
    source: PreferencesSource,
    trusted_users_folder: PathBuf,
) -> StageResult {
    ctx.startup();

    let PreferencesChannels {
        mut from_proxy,
        to_control,
        to_proxy,
    } = channels;

    let mut preferences = match source {
        PreferencesSource::Demo => demo_preferences(),
        PreferencesSource::Saved => load(&ctx, &trusted_users_folder).await,
    };
    log::info!(target: ctx.target(), "starting with preferences for {} user(s)", preferences.len());

    if let Err(e) = to_control
        .send(PreferencesSnapshot {
            preferences: preferences.clone(),
        })
        .await
    {
        ctx.dropped("preferences", e);
        ctx.shutdown();
        return Ok(());
    }

    while let Some(PreferencesUpdate {
        user_slot,
        preferences: updated,
    }) = from_proxy.recv().await
    {
        log::info!(target: ctx.target(), "new preferences for {} ({})", user_slot, updated.name());

        if let Err(e) = save(&trusted_users_folder, user_slot, &updated).await {
            ctx.rejected("saving preferences", e);
        }
        preferences.insert(user_slot, updated.clone());

        if let Err(e) = to_control
            .send(PreferencesSnapshot {
                preferences: preferences.clone(),
            })
            .await
        {
            ctx.dropped("preferences", e);
            break;
        }

        if let Err(e) = to_proxy
            .send(PreferencesChanged {
                user_slot,
                preferences: updated,
            })
            .await
        {
            ctx.dropped("preferences echo", e);
        }
    }

    ctx.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::stage_context;
    use crate::synthesis::active_timer;
    use crate::types::WeekTime;

    #[test]
    fn test_demo_schedule() {
        let demo = demo_preferences();
        let jacob = &demo[&UserSlot::Two];
        assert_eq!(jacob.timers().len(), 10);

        let at = |weekday, hour, minute| active_timer(jacob, WeekTime::new(weekday, hour, minute)).map(|t| t.effect);
        assert_eq!(at(2, 11, 35), Some(LightEffect::ForceBrightness { lumens: 600.0 }));
        assert_eq!(at(2, 13, 22), Some(LightEffect::DesiredBrightness { lumens: 900.0 }));
        assert_eq!(at(6, 23, 59), Some(LightEffect::DesiredBrightness { lumens: 300.0 }));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context!("preferences", "test");
        let preferences = Preferences::new(
            "Ada",
            vec![Timer::new(LightEffect::ForceBrightness { lumens: 120.0 }, 4, 18, 0)],
        )
        .unwrap();

        save(dir.path(), UserSlot::Four, &preferences).await.unwrap();
        std::fs::create_dir_all(dir.path().join("1")).unwrap();
        std::fs::write(dir.path().join("1/preferences.json"), "{ not json").unwrap();

        let loaded = load(&ctx, dir.path()).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&UserSlot::Four], preferences);
    }

    #[tokio::test]
    async fn test_update_is_saved_pushed_and_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let (updates, from_proxy) = channel(4);
        let (to_control, mut control) = channel(4);
        let (to_proxy, mut proxy) = channel(4);

        let task = tokio::spawn(run(
            stage_context!("preferences", "test"),
            PreferencesChannels {
                from_proxy,
                to_control,
                to_proxy,
            },
            PreferencesSource::Demo,
            dir.path().to_path_buf(),
        ));

        let initial = control.recv().await.unwrap();
        assert_eq!(initial.preferences.keys().copied().collect::<Vec<_>>(), vec![UserSlot::Two]);

        let updated = Preferences::new("Bo", Vec::new()).unwrap();
        updates
            .send(PreferencesUpdate {
                user_slot: UserSlot::One,
                preferences: updated.clone(),
            })
            .await
            .unwrap();

        let snapshot = control.recv().await.unwrap();
        assert_eq!(snapshot.preferences.len(), 2);
        assert_eq!(snapshot.preferences[&UserSlot::One], updated);

        let echoed = proxy.recv().await.unwrap();
        assert_eq!(echoed.user_slot, UserSlot::One);
        assert!(preferences_path(dir.path(), UserSlot::One).exists());

        drop(updates);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_starts_from_saved_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let (_updates, from_proxy) = channel(4);
        let (to_control, mut control) = channel(4);
        let (to_proxy, _proxy) = channel(4);

        let task = tokio::spawn(run(
            stage_context!("preferences", "test"),
            PreferencesChannels {
                from_proxy,
                to_control,
                to_proxy,
            },
            PreferencesSource::Saved,
            dir.path().to_path_buf(),
        ));

        assert!(control.recv().await.unwrap().preferences.is_empty());
        task.abort();
    }
}
