use chrono::{DateTime, TimeZone, Timelike};
use serde::Serialize;

use crate::{
    consts::NOTIFICATION_BODY_MAX_CHARS, model::Message, pause::PauseState, settings::Settings,
    util::truncate_message,
};

/// Why a message did not become a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    BelowPriority { priority: i64, threshold: i64 },
    Paused,
    QuietHours { hour: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotificationPolicy {
    pub min_priority: i64,
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
}

impl From<&Settings> for NotificationPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            min_priority: settings.min_priority,
            quiet_hours_start: settings.quiet_hours_start,
            quiet_hours_end: settings.quiet_hours_end,
        }
    }
}

impl NotificationPolicy {
    /// Every gate must pass; none outranks another.
    pub fn evaluate<Tz: TimeZone>(
        &self,
        message: &Message,
        pause: &PauseState,
        now: &DateTime<Tz>,
    ) -> Result<(), Suppressed> {
        if message.priority < self.min_priority {
            return Err(Suppressed::BelowPriority {
                priority: message.priority,
                threshold: self.min_priority,
            });
        }

        let unix_now = u64::try_from(now.timestamp()).unwrap_or(0);
        if pause.is_paused(unix_now) {
            return Err(Suppressed::Paused);
        }

        let hour = now.hour();
        if is_quiet_hour(self.quiet_hours_start, self.quiet_hours_end, hour) {
            return Err(Suppressed::QuietHours { hour });
        }

        Ok(())
    }

    pub fn should_notify<Tz: TimeZone>(
        &self,
        message: &Message,
        pause: &PauseState,
        now: &DateTime<Tz>,
    ) -> bool {
        self.evaluate(message, pause, now).is_ok()
    }
}

/// Half-open `[start, end)` in local hours; `start > end` wraps past midnight
/// and `start == end` covers the whole day. Unset bounds disable quiet hours.
pub fn is_quiet_hour(start: Option<u8>, end: Option<u8>, hour: u32) -> bool {
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (u32::from(start % 24), u32::from(end % 24)),
        _ => return false,
    };

    if start == end {
        return true;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// What the OS notification should say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationContent {
    pub title: String,
    pub subtitle: String,
    pub body: String,
}

impl NotificationContent {
    pub fn for_message(message: &Message) -> Self {
        let title = if message.app_name.trim().is_empty() {
            format!("Priority {}", message.priority)
        } else {
            format!("{} · Priority {}", message.app_name, message.priority)
        };
        let subtitle = if message.title.trim().is_empty() {
            "Gotify message".to_string()
        } else {
            message.title.clone()
        };
        Self {
            title,
            subtitle,
            body: truncate_message(&message.body, NOTIFICATION_BODY_MAX_CHARS),
        }
    }
}
