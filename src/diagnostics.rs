use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    events::{CoreEvent, EventBus},
    model::ConnectionState,
    util::unix_now_secs,
};

/// Counters and timestamps written by the stream manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeState {
    pub connection_state: ConnectionState,
    pub should_run: bool,
    pub last_connected_at: Option<u64>,
    pub last_stream_event_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub last_message_id: Option<i64>,
    pub last_error: Option<String>,
    pub backoff_seconds: u64,
    pub reconnect_attempts: u64,
}

impl RuntimeState {
    pub fn snapshot(&self, now: u64) -> RuntimeDiagnostics {
        RuntimeDiagnostics {
            connection_state: self.connection_state,
            should_run: self.should_run,
            last_connected_at: self.last_connected_at,
            last_stream_event_at: self.last_stream_event_at,
            last_message_at: self.last_message_at,
            last_message_id: self.last_message_id,
            stale_for_seconds: self
                .last_stream_event_at
                .map(|last| now.saturating_sub(last)),
            last_error: self.last_error.clone(),
            backoff_seconds: self.backoff_seconds,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeDiagnostics {
    pub connection_state: ConnectionState,
    pub should_run: bool,
    pub last_connected_at: Option<u64>,
    pub last_stream_event_at: Option<u64>,
    pub last_message_at: Option<u64>,
    pub last_message_id: Option<i64>,
    pub stale_for_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_seconds: u64,
    pub reconnect_attempts: u64,
}

impl RuntimeDiagnostics {
    /// Staleness re-derived for a reader holding an older snapshot; falls back
    /// to the pushed scalar when no stream event time is known.
    pub fn stale_for_seconds_at(&self, now: u64) -> Option<u64> {
        self.last_stream_event_at
            .map(|last| now.saturating_sub(last))
            .or(self.stale_for_seconds)
    }
}

/// Shared handle over [`RuntimeState`]. Readers only ever get projections.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    state: Arc<Mutex<RuntimeState>>,
    events: EventBus,
}

impl Diagnostics {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(RuntimeState::default())),
            events,
        }
    }

    pub fn snapshot(&self) -> Result<RuntimeDiagnostics> {
        self.snapshot_at(unix_now_secs())
    }

    pub fn snapshot_at(&self, now: u64) -> Result<RuntimeDiagnostics> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::lock_poisoned("Runtime"))?;
        Ok(state.snapshot(now))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| state.connection_state)
            .unwrap_or_default()
    }

    /// Applies `mutate` and returns what it produced. Skipped if the lock is poisoned.
    pub(crate) fn update<T>(&self, mutate: impl FnOnce(&mut RuntimeState) -> T) -> Option<T> {
        match self.state.lock() {
            Ok(mut state) => Some(mutate(&mut state)),
            Err(_) => {
                debug!("runtime lock poisoned, diagnostics update skipped");
                None
            }
        }
    }

    pub(crate) fn mark_stream_activity(&self, at: u64, source: &str) {
        self.update(|state| state.last_stream_event_at = Some(at));
        debug!(source, "stream activity");
        self.publish();
    }

    pub(crate) fn record_message(&self, id: i64, at: u64) {
        self.update(|state| {
            state.last_message_at = Some(at);
            state.last_message_id = Some(id);
            state.last_stream_event_at = Some(at);
        });
    }

    pub fn publish(&self) {
        match self.snapshot() {
            Ok(diagnostics) => self.events.emit(CoreEvent::RuntimeDiagnostics(diagnostics)),
            Err(error) => debug!(%error, "failed to snapshot runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_is_computed_from_last_event() {
        let state = RuntimeState {
            last_stream_event_at: Some(1_000),
            ..RuntimeState::default()
        };
        assert_eq!(state.snapshot(1_045).stale_for_seconds, Some(45));
        assert_eq!(state.snapshot(900).stale_for_seconds, Some(0));
        assert_eq!(RuntimeState::default().snapshot(1_000).stale_for_seconds, None);
    }

    #[test]
    fn reader_recomputes_or_falls_back() {
        let mut pushed = RuntimeState {
            last_stream_event_at: Some(100),
            ..RuntimeState::default()
        }
        .snapshot(110);
        assert_eq!(pushed.stale_for_seconds_at(160), Some(60));

        pushed.last_stream_event_at = None;
        assert_eq!(pushed.stale_for_seconds_at(160), Some(10));
    }

    #[test]
    fn snapshots_have_no_side_effects() {
        let diagnostics = Diagnostics::new(EventBus::new());
        diagnostics.record_message(42, 500);
        let first = diagnostics.snapshot_at(600).unwrap();
        let second = diagnostics.snapshot_at(600).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.last_message_id, Some(42));
        assert_eq!(first.stale_for_seconds, Some(100));
    }

    #[test]
    fn publish_emits_snapshot() {
        let events = EventBus::new();
        let diagnostics = Diagnostics::new(events.clone());
        let mut subscription = events.subscribe();
        diagnostics.mark_stream_activity(10, "test");
        match subscription.try_recv() {
            Some(CoreEvent::RuntimeDiagnostics(snapshot)) => {
                assert_eq!(snapshot.last_stream_event_at, Some(10));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
