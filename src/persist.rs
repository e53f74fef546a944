//! On-disk copy of the message cache so the inbox is populated before the
//! first sync completes.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    model::Message,
    util::{restrict_file_permissions, unique_time_suffix},
};

/// Clones share the last written revision, so writes from any clone are
/// ordered against each other.
#[derive(Debug, Clone)]
pub struct MessageFile {
    path: PathBuf,
    written: Arc<Mutex<Option<u64>>>,
}

impl MessageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Arc::new(Mutex::new(None)),
        }
    }

    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join("messages.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file loads empty. A corrupt file is moved aside and loads empty.
    pub fn load(&self) -> Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        restrict_file_permissions(&self.path);

        let content = fs::read_to_string(&self.path)
            .map_err(|error| Error::Storage(format!("Failed to read message cache: {error}")))?;
        match serde_json::from_str::<Vec<Message>>(&content) {
            Ok(messages) => Ok(messages),
            Err(error) => {
                let backup_path = self
                    .path
                    .with_extension(format!("corrupt-{}.json", unique_time_suffix()));
                match fs::rename(&self.path, &backup_path) {
                    Ok(()) => warn!(path = %backup_path.display(), "moved corrupt cache file aside"),
                    Err(rename_error) => {
                        warn!(%rename_error, "failed to back up corrupt cache file")
                    }
                }
                warn!(%error, "cache parse failed, starting fresh");
                Ok(Vec::new())
            }
        }
    }

    /// Temp file plus rename, so a crash mid-write never leaves a torn file.
    pub fn persist(&self, messages: &[Message]) -> Result<()> {
        let content = serde_json::to_string(messages)
            .map_err(|error| Error::Storage(format!("Failed to serialize message cache: {error}")))?;
        let tmp_path = self
            .path
            .with_extension(format!("tmp-{}", unique_time_suffix()));
        fs::write(&tmp_path, content).map_err(|error| {
            Error::Storage(format!("Failed to write message cache temp file: {error}"))
        })?;
        restrict_file_permissions(&tmp_path);
        fs::rename(&tmp_path, &self.path).map_err(|error| {
            Error::Storage(format!("Failed to atomically replace message cache: {error}"))
        })
    }

    /// Writes the snapshot taken at cache `revision` unless a newer one has
    /// already landed. Returns whether the file was written.
    pub fn persist_revision(&self, revision: u64, messages: &[Message]) -> Result<bool> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| Error::lock_poisoned("Message file"))?;
        if written.is_some_and(|last| last >= revision) {
            debug!(revision, last = ?*written, "skipping stale cache snapshot");
            return Ok(false);
        }
        self.persist(messages)?;
        *written = Some(revision);
        Ok(true)
    }

    /// Writes off the caller's thread; failures are only logged.
    pub fn persist_in_background(&self, revision: u64, messages: Vec<Message>) {
        let file = self.clone();
        thread::spawn(move || match file.persist_revision(revision, &messages) {
            Ok(true) => debug!(revision, count = messages.len(), "message cache persisted"),
            Ok(false) => {}
            Err(error) => warn!(%error, "failed to persist message cache"),
        });
    }
}
