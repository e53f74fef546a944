//! Stream Manager: one logical websocket session to `{base}/stream`, kept
//! alive with backoff, an idle ping and a periodic reconciliation sync.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest, http::HeaderValue, Error as WsError, Message as Frame,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    api::GotifyClient,
    backoff::{jitter, Backoff},
    consts::{AUTH_HEADER, LAST_ERROR_MAX_CHARS, STREAM_BACKOFF_JITTER_MS},
    diagnostics::Diagnostics,
    error::{Error, Result},
    events::{CoreEvent, EventBus},
    inbox::Inbox,
    model::ConnectionState,
    settings::{build_stream_ws_url, SettingsStore, StreamTuning},
    util::{redact_ws_url, truncate_message, unix_now_secs},
};

const CONNECTION_ERROR_MAX_CHARS: usize = 200;

#[derive(Debug, Default)]
struct Control {
    stop_tx: Option<watch::Sender<bool>>,
    epoch: u64,
}

struct Shared {
    settings: Arc<dyn SettingsStore>,
    inbox: Inbox,
    diagnostics: Diagnostics,
    events: EventBus,
    control: Mutex<Control>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.diagnostics
            .update(|state| state.connection_state = next);
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = %next, "connection state changed");
            self.events.emit(CoreEvent::ConnectionState(next));
        }
        self.diagnostics.publish();
    }
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct StreamManager {
    shared: Arc<Shared>,
}

impl StreamManager {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        inbox: Inbox,
        diagnostics: Diagnostics,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                settings,
                inbox,
                diagnostics,
                events,
                control: Mutex::new(Control::default()),
                state_tx,
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Last-value view of the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .control
            .lock()
            .map(|control| control.stop_tx.is_some())
            .unwrap_or(false)
    }

    /// Starts the session task if none is running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let settings = self.shared.settings.load()?;
        let token = settings.token().ok_or_else(|| {
            Error::Credential("No token found. Save token in settings first.".to_string())
        })?;
        let client = GotifyClient::new(&settings.base_url, token)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| Error::Config(format!("Stream needs an async runtime: {error}")))?;

        let (stop_rx, epoch) = {
            let mut control = self
                .shared
                .control
                .lock()
                .map_err(|_| Error::lock_poisoned("Stream control"))?;
            if control.stop_tx.is_some() {
                return Ok(());
            }
            let (tx, rx) = watch::channel(false);
            control.stop_tx = Some(tx);
            control.epoch = control.epoch.wrapping_add(1);
            (rx, control.epoch)
        };

        self.shared.diagnostics.update(|state| {
            state.should_run = true;
            state.last_error = None;
            state.backoff_seconds = 0;
        });
        info!(base_url = client.base_url(), epoch, "starting stream");
        self.shared.set_state(ConnectionState::Connecting);

        let shared = Arc::clone(&self.shared);
        let tuning = settings.stream.clone();
        runtime.spawn(async move {
            let prefetch_inbox = shared.inbox.clone();
            let prefetch_client = client.clone();
            tokio::spawn(async move {
                if let Err(error) = prefetch_inbox.refresh_applications(&prefetch_client).await {
                    debug!(%error, "failed to fetch applications");
                }
                if let Err(error) = prefetch_inbox.sync(&prefetch_client).await {
                    debug!(%error, "failed to fetch recent messages");
                }
            });
            run_stream_loop(shared, client, tuning, stop_rx, epoch).await;
        });
        Ok(())
    }

    /// Ends the session. The only path to a terminal Disconnected.
    pub fn stop(&self) -> Result<()> {
        {
            let mut control = self
                .shared
                .control
                .lock()
                .map_err(|_| Error::lock_poisoned("Stream control"))?;
            if let Some(stop_tx) = control.stop_tx.take() {
                let _ = stop_tx.send(true);
            }
        }
        self.shared.diagnostics.update(|state| {
            state.should_run = false;
            state.backoff_seconds = 0;
        });
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Cancels any in-flight attempt and connects again right away.
    pub fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Reconnects only when the stream should run but is not healthy.
    pub fn recover(&self) -> Result<()> {
        let should_run = self
            .shared
            .diagnostics
            .update(|state| state.should_run)
            .unwrap_or(false);
        if !should_run || self.connection_state().is_healthy() {
            return Ok(());
        }
        debug!(state = %self.connection_state(), "recovering stream");
        self.restart()
    }
}

async fn run_stream_loop(
    shared: Arc<Shared>,
    client: GotifyClient,
    tuning: StreamTuning,
    mut stop_rx: watch::Receiver<bool>,
    epoch: u64,
) {
    let mut backoff = Backoff::new(tuning.backoff_base_secs, tuning.backoff_max_secs);
    debug!(epoch, "stream task started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        match stream_once(&shared, &client, &tuning, &mut backoff, &mut stop_rx).await {
            Ok(()) => break,
            Err(error) => {
                if *stop_rx.borrow() {
                    break;
                }

                let delay = backoff.record_failure();
                if error.is_recoverable() {
                    warn!(%error, delay, failures = backoff.failures(), "stream session failed");
                } else {
                    error!(%error, delay, "stream session failed on local configuration");
                }
                let reason = error.to_string();
                shared.diagnostics.update(|state| {
                    state.last_error = Some(truncate_message(&reason, LAST_ERROR_MAX_CHARS));
                    state.backoff_seconds = delay;
                    state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
                });
                shared.set_state(ConnectionState::Backoff);
                shared.events.emit(CoreEvent::ConnectionError(truncate_message(
                    &reason,
                    CONNECTION_ERROR_MAX_CHARS,
                )));

                let wait = Duration::from_secs(delay) + jitter(STREAM_BACKOFF_JITTER_MS);
                tokio::select! {
                    _ = stop_requested(&mut stop_rx) => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    let current = shared
        .control
        .lock()
        .map(|mut control| {
            if control.epoch == epoch {
                control.stop_tx = None;
                true
            } else {
                false
            }
        })
        .unwrap_or(false);
    if current {
        shared.diagnostics.update(|state| {
            state.should_run = false;
            state.backoff_seconds = 0;
        });
        shared.set_state(ConnectionState::Disconnected);
    }
    debug!(epoch, "stream task finished");
}

/// Resolves once a stop was requested or the controller went away.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

fn handshake_error(error: WsError) -> Error {
    match error {
        WsError::Http(response) => handshake_status_error(response.status().as_u16()),
        other => Error::Transport(format!("Stream connection failed: {other}")),
    }
}

fn handshake_status_error(status: u16) -> Error {
    if status == 401 || status == 403 {
        Error::Credential(format!(
            "Server rejected the token (HTTP {status}). Check the client token in settings."
        ))
    } else {
        Error::Transport(format!("Stream handshake failed with HTTP {status}"))
    }
}

/// Runs one session. `Ok` only when a stop was requested.
async fn stream_once(
    shared: &Shared,
    client: &GotifyClient,
    tuning: &StreamTuning,
    backoff: &mut Backoff,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let ws_url = build_stream_ws_url(client.base_url())?;
    debug!(url = %redact_ws_url(&ws_url), "ws connect");
    let mut ws_request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|error| Error::Config(format!("Failed to build websocket request: {error}")))?;
    let token_header = HeaderValue::from_str(client.token())
        .map_err(|error| Error::Credential(format!("Invalid token for websocket header: {error}")))?;
    ws_request.headers_mut().insert(AUTH_HEADER, token_header);

    let connect_timeout = Duration::from_secs(tuning.connect_timeout_secs.max(1));
    let connect = tokio::time::timeout(connect_timeout, connect_async(ws_request));
    let (mut ws_stream, _) = tokio::select! {
        _ = stop_requested(stop_rx) => return Ok(()),
        result = connect => result
            .map_err(|_| Error::Timeout(connect_timeout))?
            .map_err(handshake_error)?,
    };

    let now = unix_now_secs();
    backoff.reset();
    shared.diagnostics.update(|state| {
        state.last_connected_at = Some(now);
        state.last_stream_event_at = Some(now);
        state.last_error = None;
        state.backoff_seconds = 0;
    });
    shared.set_state(ConnectionState::Connected);

    let mut sync_interval = interval(tuning.sync_interval_secs);
    sync_interval.tick().await;
    let mut liveness_interval = interval(tuning.liveness_check_interval_secs);
    liveness_interval.tick().await;
    let mut last_activity_at = now;
    let mut pending_ping_since: Option<u64> = None;

    loop {
        tokio::select! {
            _ = stop_requested(stop_rx) => {
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
            incoming = ws_stream.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(error)) => {
                        return Err(Error::Transport(format!("Stream read error: {error}")))
                    }
                    None => return Err(Error::Transport("Stream ended unexpectedly".to_string())),
                };
                let event_now = unix_now_secs();
                last_activity_at = event_now;
                pending_ping_since = None;
                match frame {
                    Frame::Text(text) => {
                        shared.diagnostics.mark_stream_activity(event_now, "ws-text");
                        match shared.inbox.directory().parse_stream_message(text.as_ref()) {
                            Ok(message) => {
                                if let Err(error) = shared.inbox.accept(message) {
                                    warn!(%error, "failed to cache stream message");
                                }
                            }
                            Err(error) => warn!(%error, "ignoring malformed stream frame"),
                        }
                    }
                    Frame::Ping(payload) => {
                        shared.diagnostics.mark_stream_activity(event_now, "ws-ping");
                        ws_stream
                            .send(Frame::Pong(payload))
                            .await
                            .map_err(|error| Error::Transport(format!("Failed to send pong: {error}")))?;
                    }
                    Frame::Pong(_) => {
                        shared.diagnostics.mark_stream_activity(event_now, "ws-pong");
                    }
                    Frame::Close(_) => {
                        return Err(Error::Transport("Stream closed by server".to_string()));
                    }
                    _ => shared.diagnostics.mark_stream_activity(event_now, "ws-other"),
                }
            }
            _ = sync_interval.tick() => {
                let inbox = shared.inbox.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(error) = inbox.sync(&client).await {
                        debug!(%error, "periodic sync failed");
                    }
                });
            }
            _ = liveness_interval.tick() => {
                let event_now = unix_now_secs();
                if event_now.saturating_sub(last_activity_at) < tuning.idle_timeout_secs {
                    shared.diagnostics.publish();
                    continue;
                }
                match pending_ping_since {
                    None => {
                        debug!(idle = event_now.saturating_sub(last_activity_at), "ws liveness ping sent");
                        ws_stream
                            .send(Frame::Ping(Vec::<u8>::new().into()))
                            .await
                            .map_err(|error| {
                                Error::Transport(format!("Failed to send liveness ping: {error}"))
                            })?;
                        pending_ping_since = Some(event_now);
                    }
                    Some(started) => {
                        if event_now.saturating_sub(started) >= tuning.ping_grace_secs {
                            return Err(Error::Transport(format!(
                                "Stream liveness timeout after {}s idle",
                                event_now.saturating_sub(last_activity_at)
                            )));
                        }
                    }
                }
                shared.diagnostics.publish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MessageCache,
        settings::{MemorySettingsStore, Settings},
    };

    fn manager(settings: Settings) -> (StreamManager, EventBus) {
        let events = EventBus::new();
        let diagnostics = Diagnostics::new(events.clone());
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new(settings));
        let inbox = Inbox::new(
            Arc::new(MessageCache::new(10)),
            Arc::clone(&store),
            diagnostics.clone(),
            events.clone(),
            None,
        );
        (
            StreamManager::new(store, inbox, diagnostics, events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn start_without_token_is_a_credential_error() {
        let (manager, _events) = manager(Settings::default());
        assert!(matches!(manager.start(), Err(Error::Credential(_))));
        assert!(matches!(manager.restart(), Err(Error::Credential(_))));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn recover_is_a_no_op_when_not_meant_to_run() {
        let (manager, events) = manager(Settings::default());
        let mut subscription = events.subscribe();
        manager.recover().unwrap();
        manager.recover().unwrap();
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn rejected_handshake_maps_to_credential() {
        assert!(matches!(handshake_status_error(401), Error::Credential(_)));
        assert!(matches!(handshake_status_error(403), Error::Credential(_)));
        assert!(matches!(handshake_status_error(502), Error::Transport(_)));
    }

    #[tokio::test]
    async fn stop_request_resolves_waiters() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { stop_requested(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
