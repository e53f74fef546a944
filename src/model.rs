use std::fmt;

use serde::{Deserialize, Serialize};

/// A message as cached locally and handed to the presentation layer.
///
/// `id` is the dedup key. `timestamp` is whatever the server sent; it is only
/// parsed when ordering.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    #[serde(default)]
    pub app_id: i64,
    #[serde(default)]
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub app_icon_url: Option<String>,
    #[serde(default)]
    pub timestamp: String,
}

impl Message {
    /// Seconds since the epoch, when the server timestamp is valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(self.timestamp.trim())
            .map(|value| value.timestamp())
            .ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Backoff => "Backoff",
        }
    }

    /// Connected or on the way there; `recover` leaves these alone.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UrlPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMeta {
    pub name: String,
    pub icon_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GotifyMessageWire {
    pub(crate) id: i64,
    pub(crate) appid: i64,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) priority: i64,
    #[serde(default)]
    pub(crate) date: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GotifyMessageListWire {
    #[serde(default)]
    pub(crate) messages: Vec<GotifyMessageWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GotifyApplicationWire {
    pub(crate) id: i64,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) image: String,
}

impl GotifyMessageWire {
    pub(crate) fn into_message(self, meta: Option<&ApplicationMeta>) -> Message {
        let (app_name, app_icon_url) = match meta {
            Some(meta) => {
                let icon = if meta.icon_url.trim().is_empty() {
                    None
                } else {
                    Some(meta.icon_url.clone())
                };
                (meta.name.clone(), icon)
            }
            None => (format!("app:{}", self.appid), None),
        };
        Message {
            id: self.id,
            app_id: self.appid,
            title: self.title,
            body: self.message,
            priority: self.priority.max(0),
            app_name,
            app_icon_url,
            timestamp: self.date,
        }
    }
}
