//! Where messages enter the cache, from the stream or from a reconciliation
//! sync, and where the resulting events and notifications are raised.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info, warn};

use crate::{
    api::{AppDirectory, GotifyClient},
    cache::{MergeOutcome, MessageCache},
    diagnostics::Diagnostics,
    error::Result,
    events::{CoreEvent, EventBus},
    model::Message,
    notifications::{NotificationContent, NotificationPolicy},
    pause::PauseState,
    persist::MessageFile,
    settings::SettingsStore,
    util::unix_now_secs,
};

#[derive(Clone)]
pub struct Inbox {
    cache: Arc<MessageCache>,
    directory: AppDirectory,
    settings: Arc<dyn SettingsStore>,
    diagnostics: Diagnostics,
    events: EventBus,
    file: Option<MessageFile>,
}

impl Inbox {
    pub fn new(
        cache: Arc<MessageCache>,
        settings: Arc<dyn SettingsStore>,
        diagnostics: Diagnostics,
        events: EventBus,
        file: Option<MessageFile>,
    ) -> Self {
        Self {
            cache,
            directory: AppDirectory::default(),
            settings,
            diagnostics,
            events,
            file,
        }
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn directory(&self) -> &AppDirectory {
        &self.directory
    }

    /// One live message. Notifies only when the id was not cached before.
    pub fn accept(&self, message: Message) -> Result<MergeOutcome> {
        self.accept_at(message, &Local::now())
    }

    pub(crate) fn accept_at<Tz: TimeZone>(
        &self,
        message: Message,
        now: &DateTime<Tz>,
    ) -> Result<MergeOutcome> {
        let outcome = self.cache.insert(message.clone())?;
        self.diagnostics.record_message(message.id, unix_now_secs());
        debug!(
            id = message.id,
            app_id = message.app_id,
            priority = message.priority,
            inserted = !outcome.inserted.is_empty(),
            "stream message cached"
        );
        self.events.emit(CoreEvent::MessageReceived(message.clone()));

        if outcome.changed() {
            self.persist(&outcome);
        }
        if outcome.inserted.contains(&message.id) {
            self.notify_if_due(&message, now);
        }
        self.diagnostics.publish();
        Ok(outcome)
    }

    /// Merges a newest-first batch. Never shrinks the cache on its own, and
    /// stays silent when nothing changed.
    pub fn reconcile(&self, newest_first: Vec<Message>) -> Result<MergeOutcome> {
        let mut batch = newest_first;
        batch.reverse();
        let outcome = self.cache.merge(batch)?;
        if outcome.changed() {
            debug!(
                inserted = outcome.inserted.len(),
                updated = outcome.updated.len(),
                evicted = outcome.evicted.len(),
                "reconciled message cache"
            );
            self.events.emit(CoreEvent::MessagesUpdated(outcome.messages()));
            self.persist(&outcome);
        }
        Ok(outcome)
    }

    pub async fn sync(&self, client: &GotifyClient) -> Result<MergeOutcome> {
        let limit = self.cache.limit()?;
        let fetched = client.fetch_recent_messages(limit, &self.directory).await?;
        self.reconcile(fetched)
    }

    pub async fn refresh_applications(&self, client: &GotifyClient) -> Result<usize> {
        let apps = client.fetch_applications().await?;
        let count = apps.len();
        self.directory.replace(apps);
        info!(count, "application directory refreshed");
        Ok(count)
    }

    /// Drops an entry the server has confirmed as deleted.
    pub fn confirm_deleted(&self, id: i64) -> Result<bool> {
        let removed = self.cache.remove_confirmed(id)?;
        if removed {
            self.announce_snapshot()?;
        }
        Ok(removed)
    }

    /// Re-applies a new cache bound, announcing any evictions.
    pub fn apply_cache_limit(&self, limit: usize) -> Result<Vec<i64>> {
        let evicted = self.cache.set_limit(limit)?;
        if !evicted.is_empty() {
            self.announce_snapshot()?;
        }
        Ok(evicted)
    }

    fn notify_if_due<Tz: TimeZone>(&self, message: &Message, now: &DateTime<Tz>) {
        let settings = match self.settings.load() {
            Ok(settings) => settings,
            Err(error) => {
                warn!(%error, "notification skipped, settings unavailable");
                return;
            }
        };
        let pause = PauseState::from(&settings);
        match NotificationPolicy::from(&settings).evaluate(message, &pause, now) {
            Ok(()) => {
                self.events.emit(CoreEvent::NotificationMessage {
                    message: message.clone(),
                    content: NotificationContent::for_message(message),
                });
            }
            Err(reason) => debug!(id = message.id, ?reason, "notification suppressed"),
        }
    }

    fn announce_snapshot(&self) -> Result<()> {
        let (revision, snapshot) = self.cache.revision_snapshot()?;
        self.events.emit(CoreEvent::MessagesUpdated(snapshot.clone()));
        if let Some(file) = &self.file {
            file.persist_in_background(revision, snapshot);
        }
        Ok(())
    }

    fn persist(&self, outcome: &MergeOutcome) {
        if let Some(file) = &self.file {
            file.persist_in_background(outcome.revision, outcome.messages());
        }
    }
}
