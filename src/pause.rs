//! Notification pause windows.
//!
//! A pause is a `pause_until` unix timestamp plus an optional mode tag. The
//! sentinel `0` means "until resumed"; `None` means notifications are on. The
//! tag only echoes what the caller asked for and is never consulted when
//! deciding whether a pause is in effect. Expiry is evaluated lazily against
//! the `now` passed in, so a timed pause needs no resume call to end.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    consts::PAUSE_FOREVER_SENTINEL,
    error::{Error, Result},
    events::{CoreEvent, EventBus},
    settings::{Settings, SettingsWriter},
    util::unix_now_secs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauseMode {
    #[serde(rename = "15m")]
    FifteenMin,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "custom")]
    Custom,
    #[serde(rename = "forever")]
    Forever,
}

impl PauseMode {
    /// Tag used when the caller does not supply one.
    pub fn for_minutes(minutes: u64) -> Self {
        match minutes {
            15 => PauseMode::FifteenMin,
            60 => PauseMode::OneHour,
            _ => PauseMode::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PauseState {
    pub pause_until: Option<u64>,
    pub pause_mode: Option<PauseMode>,
}

impl PauseState {
    pub fn pause(&mut self, now: u64, duration: Duration, mode: PauseMode) {
        // never collide with the forever sentinel
        let until = now.saturating_add(duration.as_secs()).max(1);
        self.pause_until = Some(until);
        self.pause_mode = Some(mode);
    }

    pub fn pause_forever(&mut self) {
        self.pause_until = Some(PAUSE_FOREVER_SENTINEL);
        self.pause_mode = Some(PauseMode::Forever);
    }

    pub fn resume(&mut self) {
        self.pause_until = None;
        self.pause_mode = None;
    }

    pub fn is_forever(&self) -> bool {
        self.pause_until == Some(PAUSE_FOREVER_SENTINEL)
    }

    pub fn is_paused(&self, now: u64) -> bool {
        match self.pause_until {
            Some(PAUSE_FOREVER_SENTINEL) => true,
            Some(until) => until > now,
            None => false,
        }
    }

    /// A timed pause whose deadline has passed but which is still recorded.
    pub fn is_expired(&self, now: u64) -> bool {
        self.pause_until.is_some() && !self.is_paused(now)
    }

    /// `Duration::MAX` while paused forever, zero when not paused.
    pub fn remaining(&self, now: u64) -> Duration {
        match self.pause_until {
            Some(PAUSE_FOREVER_SENTINEL) => Duration::MAX,
            Some(until) if until > now => Duration::from_secs(until - now),
            _ => Duration::ZERO,
        }
    }

    pub fn status_label(&self, now: u64) -> String {
        if self.is_forever() {
            return "Paused forever".to_string();
        }
        if self.is_paused(now) {
            let remaining = format_pause_remaining(self.remaining(now).as_secs());
            return format!("Paused, {remaining} left");
        }
        "On".to_string()
    }
}

impl From<&Settings> for PauseState {
    fn from(settings: &Settings) -> Self {
        Self {
            pause_until: settings.pause_until,
            pause_mode: settings.pause_mode,
        }
    }
}

impl fmt::Display for PauseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_label(unix_now_secs()))
    }
}

pub(crate) fn format_pause_remaining(total_seconds: u64) -> String {
    let seconds = total_seconds.max(1);
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    let hours = minutes / 60;
    let rem_minutes = minutes % 60;
    if rem_minutes == 0 {
        format!("{hours}h")
    } else {
        format!("{hours}h {rem_minutes}m")
    }
}

/// Owns pause mutations: persists them through the shared settings writer
/// and announces them on the event bus. A mutation and its event happen
/// under the writer's lock, so events leave the same order as the writes.
pub struct PauseController {
    settings: Arc<SettingsWriter>,
    events: EventBus,
}

impl PauseController {
    pub fn new(settings: Arc<SettingsWriter>, events: EventBus) -> Self {
        Self { settings, events }
    }

    pub fn state(&self) -> Result<PauseState> {
        Ok(PauseState::from(&self.settings.load()?))
    }

    pub fn pause_for_minutes(&self, minutes: u64, mode: Option<PauseMode>) -> Result<PauseState> {
        if minutes == 0 {
            return Err(Error::Config(
                "Pause duration must be greater than 0 minutes".to_string(),
            ));
        }
        let mode = mode.unwrap_or_else(|| PauseMode::for_minutes(minutes));
        let duration = Duration::from_secs(minutes.saturating_mul(60));
        self.update(|state| {
            state.pause(unix_now_secs(), duration, mode);
            true
        })
    }

    pub fn pause_forever(&self) -> Result<PauseState> {
        self.update(|state| {
            state.pause_forever();
            true
        })
    }

    pub fn resume(&self) -> Result<PauseState> {
        self.update(|state| {
            state.resume();
            true
        })
    }

    /// Clears a timed pause that has run out, announcing the resume once.
    /// Expiry is judged on the state read under the write lock.
    pub fn refresh(&self) -> Result<PauseState> {
        self.update(|state| {
            if !state.is_expired(unix_now_secs()) {
                return false;
            }
            debug!(?state, "pause expired, clearing");
            state.resume();
            true
        })
    }

    /// `mutate` returns whether it changed anything worth saving and announcing.
    fn update(&self, mutate: impl FnOnce(&mut PauseState) -> bool) -> Result<PauseState> {
        let txn = self.settings.begin()?;
        let mut settings = txn.load()?;
        let mut state = PauseState::from(&settings);
        if !mutate(&mut state) {
            return Ok(state);
        }
        settings.pause_until = state.pause_until;
        settings.pause_mode = state.pause_mode;
        txn.save(&settings)?;

        info!(pause = %state, "notification pause state changed");
        self.emit(state);
        Ok(state)
    }

    fn emit(&self, state: PauseState) {
        let event = match state.pause_until {
            Some(until) => CoreEvent::NotificationsPausedUntil {
                until,
                mode: state.pause_mode,
            },
            None => CoreEvent::NotificationsResumed,
        };
        self.events.emit(event);
    }
}
