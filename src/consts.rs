pub const DEFAULT_CACHE_LIMIT: usize = 100;
pub const MAX_API_PAGE_LIMIT: usize = 200;
pub const MAX_CACHE_LIMIT: usize = 2000;
pub const MAX_MIN_PRIORITY: i64 = 10;

pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const STREAM_SYNC_INTERVAL_SECS: u64 = 5;
pub const STREAM_LIVENESS_CHECK_INTERVAL_SECS: u64 = 15;
pub const STREAM_LIVENESS_IDLE_SECS: u64 = 90;
pub const STREAM_LIVENESS_PING_GRACE_SECS: u64 = 30;
pub const STREAM_BACKOFF_BASE_SECS: u64 = 1;
pub const STREAM_BACKOFF_MAX_SECS: u64 = 30;
pub const STREAM_BACKOFF_JITTER_MS: u64 = 500;

pub const REST_REQUEST_TIMEOUT_SECS: u64 = 15;

pub const PREVIEW_REQUEST_TIMEOUT_SECS: u64 = 6;
pub const PREVIEW_MAX_REDIRECTS: usize = 5;
pub const PREVIEW_MAX_HTML_BYTES: usize = 120_000;
pub const APP_ICON_MAX_BYTES: usize = 256_000;

pub const NOTIFICATION_BODY_MAX_CHARS: usize = 220;
pub const LAST_ERROR_MAX_CHARS: usize = 300;

pub const PAUSE_FOREVER_SENTINEL: u64 = 0;

pub const AUTH_HEADER: &str = "X-Gotify-Key";
pub const PREVIEW_USER_AGENT: &str = "Gotify-Desktop-Preview/1.0 (+https://gotify.net)";
