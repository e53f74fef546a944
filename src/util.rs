use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use crate::error::{Error, Result};

static FILE_SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn unique_time_suffix() -> u64 {
    let base = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    base.wrapping_add(FILE_SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub fn truncate_message(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Masks the query string so a token passed as `?token=` never lands in a log line.
pub fn redact_ws_url(url: &str) -> String {
    let mut parsed = match reqwest::Url::parse(url) {
        Ok(url) => url,
        Err(_) => return "<invalid-url>".to_string(),
    };
    if parsed.query().is_some() {
        parsed.set_query(Some("token=***"));
    }
    parsed.to_string()
}

/// Reads a body chunk by chunk and gives up as soon as it outgrows
/// `max_bytes`, whether or not the server declared a length.
pub(crate) async fn read_limited_body(
    mut response: reqwest::Response,
    max_bytes: usize,
    what: &str,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|error| Error::Transport(format!("Failed to read {what} body: {error}")))?
    {
        if out.len().saturating_add(chunk.len()) > max_bytes {
            return Err(Error::Policy(format!(
                "{what} exceeded {max_bytes} byte limit"
            )));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(unix)]
pub(crate) fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    if path.exists() {
        if let Err(error) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            debug!(?path, %error, "restrict_file_permissions failed");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn restrict_file_permissions(path: &Path) {
    debug!(?path, "file permission hardening not supported on this platform");
}
