//! Command surface for a presentation layer: one [`Companion`] owns the
//! stream, the cache, the pause controller and the preview fetcher.

use std::{path::Path, sync::Arc};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    api::GotifyClient,
    cache::MessageCache,
    diagnostics::{Diagnostics, RuntimeDiagnostics},
    error::{Error, Result},
    events::{EventBus, Subscription},
    inbox::Inbox,
    model::{ConnectionState, Message, UrlPreview},
    pause::{PauseController, PauseMode, PauseState},
    persist::MessageFile,
    preview::PreviewFetcher,
    settings::{
        JsonFileSettingsStore, Settings, SettingsStore, SettingsUpdate, SettingsView,
        SettingsWriter,
    },
    stream::StreamManager,
};

pub struct Companion {
    settings: Arc<SettingsWriter>,
    events: EventBus,
    diagnostics: Diagnostics,
    inbox: Inbox,
    stream: StreamManager,
    pause: PauseController,
    preview: PreviewFetcher,
}

impl Companion {
    /// Settings and the message cache live in `config_dir`.
    pub fn open(config_dir: &Path) -> Result<Self> {
        let store = JsonFileSettingsStore::in_dir(config_dir)?;
        info!(path = %store.path().display(), "using settings file");
        Self::with_store(Arc::new(store), Some(MessageFile::in_dir(config_dir)))
    }

    pub fn with_store(settings: Arc<dyn SettingsStore>, file: Option<MessageFile>) -> Result<Self> {
        Self::with_parts(settings, file, PreviewFetcher::default())
    }

    pub fn with_parts(
        settings: Arc<dyn SettingsStore>,
        file: Option<MessageFile>,
        preview: PreviewFetcher,
    ) -> Result<Self> {
        let settings = Arc::new(SettingsWriter::new(settings));
        let stored = settings.load()?;
        let limit = stored.effective_cache_limit();
        let seed = match &file {
            Some(file) => file.load()?,
            None => Vec::new(),
        };
        debug!(cached = seed.len(), limit, "restoring message cache");
        let cache = Arc::new(MessageCache::with_messages(limit, seed)?);

        let events = EventBus::new();
        let diagnostics = Diagnostics::new(events.clone());
        let inbox = Inbox::new(
            cache,
            settings.store(),
            diagnostics.clone(),
            events.clone(),
            file,
        );
        let stream = StreamManager::new(
            settings.store(),
            inbox.clone(),
            diagnostics.clone(),
            events.clone(),
        );
        let pause = PauseController::new(Arc::clone(&settings), events.clone());
        if let Err(error) = pause.refresh() {
            warn!(%error, "failed to refresh pause state");
        }

        Ok(Self {
            settings,
            events,
            diagnostics,
            inbox,
            stream,
            pause,
            preview,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn start_stream(&self) -> Result<()> {
        self.stream.start()
    }

    pub fn stop_stream(&self) -> Result<()> {
        self.stream.stop()
    }

    pub fn restart_stream(&self) -> Result<()> {
        self.stream.restart()
    }

    pub fn recover_stream(&self) -> Result<()> {
        self.stream.recover()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream.connection_state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.stream.watch_state()
    }

    pub fn get_cached_messages(&self) -> Result<Vec<Message>> {
        self.inbox.cache().messages()
    }

    /// The cache entry goes only after the server confirms; a rejected
    /// delete leaves it in place.
    pub async fn delete_message(&self, id: i64) -> Result<()> {
        let client = self.client()?;
        client.delete_message(id).await?;
        self.inbox.confirm_deleted(id)?;
        info!(id, "message deleted");

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            if let Err(error) = inbox.sync(&client).await {
                debug!(%error, "post-delete sync failed");
            }
        });
        Ok(())
    }

    /// Pulls recent messages and merges them. Returns the cache size after.
    pub async fn sync_messages(&self) -> Result<usize> {
        let client = self.client()?;
        if self.inbox.directory().is_empty() {
            if let Err(error) = self.inbox.refresh_applications(&client).await {
                debug!(%error, "failed to fetch applications");
            }
        }
        Ok(self.inbox.sync(&client).await?.snapshot.len())
    }

    pub fn pause_notifications(&self, minutes: u64, mode: Option<PauseMode>) -> Result<PauseState> {
        self.pause.pause_for_minutes(minutes, mode)
    }

    pub fn pause_notifications_forever(&self) -> Result<PauseState> {
        self.pause.pause_forever()
    }

    pub fn resume_notifications(&self) -> Result<PauseState> {
        self.pause.resume()
    }

    pub fn get_pause_state(&self) -> Result<PauseState> {
        self.pause.refresh()
    }

    pub fn get_runtime_diagnostics(&self) -> Result<RuntimeDiagnostics> {
        self.diagnostics.snapshot()
    }

    pub async fn fetch_url_preview(&self, url: &str) -> Result<UrlPreview> {
        self.preview.preview(url).await
    }

    pub fn load_settings(&self) -> Result<SettingsView> {
        Ok(SettingsView::from(&self.settings.load()?))
    }

    /// Goes through the same writer as the pause commands, so a pause that
    /// lands mid-save is not overwritten.
    pub fn save_settings(&self, update: SettingsUpdate) -> Result<SettingsView> {
        let (next, ()) = self.settings.update(|settings| {
            *settings = update.apply(settings)?;
            Ok(())
        })?;
        let evicted = self.inbox.apply_cache_limit(next.effective_cache_limit())?;
        info!(evicted = evicted.len(), "settings saved");
        Ok(SettingsView::from(&next))
    }

    /// Probes `/application` with the given values, falling back to the
    /// stored ones.
    pub async fn test_connection(&self, base_url: Option<&str>, token: Option<&str>) -> Result<String> {
        let stored = self.settings.load()?;
        let base_url = base_url.unwrap_or(&stored.base_url);
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .or_else(|| stored.token())
            .ok_or_else(|| Error::Credential("Token is required".to_string()))?;
        GotifyClient::new(base_url, token)?.test_connection().await
    }

    fn client(&self) -> Result<GotifyClient> {
        let settings: Settings = self.settings.load()?;
        let token = settings.token().ok_or_else(|| {
            Error::Credential("No token found. Save token in settings first.".to_string())
        })?;
        GotifyClient::new(&settings.base_url, token)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{events::CoreEvent, settings::MemorySettingsStore};

    fn message(id: i64) -> Message {
        Message {
            id,
            app_id: 1,
            title: "t".into(),
            body: "b".into(),
            priority: 1,
            app_name: "app".into(),
            app_icon_url: None,
            timestamp: "2026-02-02T08:00:00Z".into(),
        }
    }

    fn companion(base_url: &str) -> Companion {
        let settings = Settings {
            base_url: base_url.to_string(),
            token: Some("secret".into()),
            ..Settings::default()
        };
        Companion::with_store(Arc::new(MemorySettingsStore::new(settings)), None).unwrap()
    }

    #[tokio::test]
    async fn rejected_delete_keeps_cache_entry() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/message/5"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let companion = companion(&server.uri());
        companion.inbox.reconcile(vec![message(5)]).unwrap();

        let result = companion.delete_message(5).await;
        assert!(matches!(result, Err(Error::Http { status: 500, .. })));
        assert_eq!(companion.get_cached_messages().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmed_delete_removes_cache_entry() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/message/5"))
            .and(header("X-Gotify-Key", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let companion = companion(&server.uri());
        companion.inbox.reconcile(vec![message(5), message(4)]).unwrap();
        let mut subscription = companion.subscribe();

        companion.delete_message(5).await.unwrap();

        let ids: Vec<i64> = companion
            .get_cached_messages()
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![4]);
        assert!(matches!(
            subscription.try_recv(),
            Some(CoreEvent::MessagesUpdated(_))
        ));
    }

    #[test]
    fn save_settings_shrinks_cache_and_hides_token() {
        let companion = companion("http://gotify.local");
        companion
            .inbox
            .reconcile(vec![message(3), message(2), message(1)])
            .unwrap();

        let view = companion
            .save_settings(SettingsUpdate {
                base_url: "https://push.example.com/".into(),
                cache_limit: Some(2),
                ..SettingsUpdate::default()
            })
            .unwrap();

        assert!(view.has_token);
        assert_eq!(view.base_url, "https://push.example.com");
        assert_eq!(companion.get_cached_messages().unwrap().len(), 2);
    }

    #[test]
    fn pause_commands_round_trip() {
        let companion = companion("http://gotify.local");
        let paused = companion.pause_notifications(15, None).unwrap();
        assert_eq!(paused.pause_mode, Some(PauseMode::FifteenMin));
        assert!(companion.get_pause_state().unwrap().pause_until.is_some());

        companion.pause_notifications_forever().unwrap();
        assert!(companion.get_pause_state().unwrap().is_forever());

        companion.resume_notifications().unwrap();
        assert_eq!(companion.get_pause_state().unwrap(), PauseState::default());
    }

    #[tokio::test]
    async fn test_connection_needs_a_token() {
        let companion = Companion::with_store(
            Arc::new(MemorySettingsStore::new(Settings::default())),
            None,
        )
        .unwrap();
        assert!(matches!(
            companion.test_connection(Some("http://gotify.local"), None).await,
            Err(Error::Credential(_))
        ));
    }

    #[test]
    fn restores_persisted_cache() {
        let dir = tempfile::tempdir().unwrap();
        MessageFile::in_dir(dir.path())
            .persist(&[message(8), message(7)])
            .unwrap();
        let companion = Companion::open(dir.path()).unwrap();
        assert_eq!(companion.get_cached_messages().unwrap().len(), 2);
    }
}
