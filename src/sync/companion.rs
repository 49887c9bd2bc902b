//! Local companion sync channel
//!
//! A single JSON file shared with the companion extension. This process
//! writes snapshots tagged `primary`; the companion writes snapshots tagged
//! `companion`. A `notify` watcher on the file's directory picks up external
//! writes and announces them once per distinct checksum.
//!
//! ```text
//!   notify callback ──signal──▶ worker thread ──debounce──▶ process_change()
//!                                                                │
//!                                   CompanionEvent ◀─────────────┘
//! ```

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::CompanionConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::models::{Category, Prompt, Settings, SyncData, SyncSource};
use crate::sync::parse_sync_data;
use crate::util::{file_timestamp, write_atomic};

const BACKUP_DIR: &str = "backups";

/// Notification delivered by the watcher
#[derive(Debug, Clone)]
pub enum CompanionEvent {
    /// The companion wrote data this process has not seen yet
    DataChanged(Box<SyncData>),
    /// The shared file could not be read or parsed
    Error(String),
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Checksum of the last snapshot this process wrote
    last_own_checksum: Option<String>,
    /// Checksum of the last companion snapshot announced
    last_announced: Option<String>,
}

struct Shared {
    path: PathBuf,
    state: Mutex<ChannelState>,
    events: Option<EventBus>,
}

pub struct CompanionChannel {
    shared: Arc<Shared>,
    backups_enabled: bool,
    max_backups: usize,
    debounce: Duration,
    watcher: Option<RecommendedWatcher>,
}

impl CompanionChannel {
    pub fn new(path: impl AsRef<Path>, config: &CompanionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.as_ref().to_path_buf(),
                state: Mutex::new(ChannelState::default()),
                events: None,
            }),
            backups_enabled: config.backups_enabled,
            max_backups: config.max_backups,
            debounce: Duration::from_millis(config.debounce_ms),
            watcher: None,
        }
    }

    /// Also publish changes on `bus`. Call before `start_watching`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.shared = Arc::new(Shared {
            path: self.shared.path.clone(),
            state: Mutex::new(ChannelState::default()),
            events: Some(bus),
        });
        self
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn backup_dir(&self) -> PathBuf {
        self.shared
            .path
            .parent()
            .map(|p| p.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR))
    }

    /// Write a `primary` snapshot to the shared file, rotating backups first
    pub fn write_sync_data(
        &self,
        prompts: Vec<Prompt>,
        categories: Vec<Category>,
        settings: Settings,
    ) -> SyncResult<SyncData> {
        let data = SyncData::new(prompts, categories, settings, SyncSource::Primary);
        let content = serde_json::to_vec_pretty(&data)?;

        if self.backups_enabled && self.shared.path.exists() {
            self.rotate_backups()?;
        }

        // Record before writing so the watcher never announces this write
        self.shared.state.lock().last_own_checksum = Some(data.checksum().to_string());
        write_atomic(&self.shared.path, &content)?;

        tracing::debug!(
            path = %self.shared.path.display(),
            checksum = %data.checksum(),
            prompts = data.prompts.len(),
            "wrote companion sync file"
        );
        Ok(data)
    }

    /// Current content of the shared file, `None` when it does not exist
    pub fn read_sync_data(&self) -> SyncResult<Option<SyncData>> {
        self.shared.read()
    }

    /// Check the shared file for a companion write not yet announced.
    ///
    /// This is what the watcher runs on every change; it can also be called
    /// directly to poll.
    pub fn process_change(&self) -> SyncResult<Option<SyncData>> {
        self.shared.process_change()
    }

    /// Start watching the shared file. Events arrive on the returned receiver
    /// (and on the event bus, if one was attached).
    pub fn start_watching(&mut self) -> SyncResult<Receiver<CompanionEvent>> {
        let dir = self
            .shared
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let file_name = self.shared.path.file_name().map(|n| n.to_os_string());
        let (signal_tx, signal_rx) = channel::<()>();
        let (event_tx, event_rx) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        let _ = signal_tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "companion watcher error"),
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let shared = self.shared.clone();
        let debounce = self.debounce;
        thread::spawn(move || run_worker(shared, signal_rx, event_tx, debounce));

        self.watcher = Some(watcher);
        tracing::info!(path = %self.shared.path.display(), "watching companion sync file");
        Ok(event_rx)
    }

    /// Stop the watcher. The worker thread exits once its signal channel closes.
    pub fn stop_watching(&mut self) {
        if self.watcher.take().is_some() {
            tracing::info!(path = %self.shared.path.display(), "stopped watching companion sync file");
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Backup files, oldest first
    pub fn list_backups(&self) -> SyncResult<Vec<PathBuf>> {
        let dir = self.backup_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}-", self.file_stem());
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    fn file_stem(&self) -> String {
        self.shared
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "sync-data".to_string())
    }

    fn rotate_backups(&self) -> SyncResult<()> {
        let dir = self.backup_dir();
        std::fs::create_dir_all(&dir)?;
        // Writes within the same millisecond get increasing sequence numbers
        let stem = self.file_stem();
        let stamp = file_timestamp();
        let mut seq = 0u32;
        let mut target = dir.join(format!("{}-{}-{:03}.json", stem, stamp, seq));
        while target.exists() {
            seq += 1;
            target = dir.join(format!("{}-{}-{:03}.json", stem, stamp, seq));
        }
        std::fs::copy(&self.shared.path, &target)?;

        let backups = self.list_backups()?;
        if backups.len() > self.max_backups {
            for old in &backups[..backups.len() - self.max_backups] {
                if let Err(e) = std::fs::remove_file(old) {
                    tracing::warn!(path = %old.display(), error = %e, "failed to remove old backup");
                }
            }
        }
        Ok(())
    }
}

impl Drop for CompanionChannel {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl Shared {
    fn read(&self) -> SyncResult<Option<SyncData>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::Io(e)),
        };
        parse_sync_data(&bytes).map(Some)
    }

    fn process_change(&self) -> SyncResult<Option<SyncData>> {
        let Some(data) = self.read()? else {
            return Ok(None);
        };

        let mut state = self.state.lock();
        if data.source() != SyncSource::Companion
            || state.last_own_checksum.as_deref() == Some(data.checksum())
        {
            tracing::debug!(checksum = %data.checksum(), "ignoring own companion file write");
            return Ok(None);
        }
        if state.last_announced.as_deref() == Some(data.checksum()) {
            return Ok(None);
        }

        state.last_announced = Some(data.checksum().to_string());
        tracing::info!(
            checksum = %data.checksum(),
            prompts = data.prompts.len(),
            "companion data changed"
        );
        Ok(Some(data))
    }
}

fn run_worker(
    shared: Arc<Shared>,
    signals: Receiver<()>,
    events: Sender<CompanionEvent>,
    debounce: Duration,
) {
    while signals.recv().is_ok() {
        // Wait for the writes to settle
        loop {
            match signals.recv_timeout(debounce) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        let event = match shared.process_change() {
            Ok(Some(data)) => CompanionEvent::DataChanged(Box::new(data)),
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read companion sync file");
                CompanionEvent::Error(e.to_string())
            }
        };

        if let Some(ref bus) = shared.events {
            bus.emit(match &event {
                CompanionEvent::DataChanged(data) => SyncEvent::CompanionChanged { data: data.clone() },
                CompanionEvent::Error(error) => SyncEvent::CompanionError { error: error.clone() },
            });
        }
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!("companion watcher worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_backups: usize) -> CompanionConfig {
        CompanionConfig {
            path: PathBuf::new(),
            backups_enabled: true,
            max_backups,
            debounce_ms: 50,
        }
    }

    fn write_as_companion(path: &Path, prompts: Vec<Prompt>) -> SyncData {
        let data = SyncData::new(prompts, vec![Category::sentinel()], Settings::new(), SyncSource::Companion);
        write_atomic(path, &serde_json::to_vec(&data).unwrap()).unwrap();
        data
    }

    #[test]
    fn test_own_writes_are_not_announced() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CompanionChannel::new(dir.path().join("sync.json"), &config(3));

        let written = channel
            .write_sync_data(vec![Prompt::new("A", "a")], vec![Category::sentinel()], Settings::new())
            .unwrap();
        assert_eq!(written.source(), SyncSource::Primary);
        assert!(channel.process_change().unwrap().is_none());
        assert_eq!(channel.read_sync_data().unwrap().unwrap().checksum(), written.checksum());
    }

    #[test]
    fn test_companion_write_announced_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let channel = CompanionChannel::new(&path, &config(3));

        let data = write_as_companion(&path, vec![Prompt::new("B", "b").with_id("p2")]);
        let announced = channel.process_change().unwrap().unwrap();
        assert_eq!(announced.checksum(), data.checksum());
        assert!(channel.process_change().unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CompanionChannel::new(dir.path().join("absent.json"), &config(3));
        assert!(channel.read_sync_data().unwrap().is_none());
        assert!(channel.process_change().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, "{\"version\": 1").unwrap();
        let channel = CompanionChannel::new(&path, &config(3));
        assert!(matches!(channel.process_change(), Err(SyncError::InvalidData(_))));
    }

    #[test]
    fn test_backup_rotation_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CompanionChannel::new(dir.path().join("sync.json"), &config(2));

        for i in 0..5 {
            channel
                .write_sync_data(vec![Prompt::new(format!("P{}", i), "x")], vec![], Settings::new())
                .unwrap();
            thread::sleep(Duration::from_millis(3));
        }

        assert_eq!(channel.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn test_back_to_back_writes_keep_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let channel = CompanionChannel::new(dir.path().join("sync.json"), &config(10));

        for i in 0..4 {
            channel
                .write_sync_data(vec![Prompt::new(format!("P{}", i), "x")], vec![], Settings::new())
                .unwrap();
        }

        let backups = channel.list_backups().unwrap();
        assert_eq!(backups.len(), 3);
        let titles: Vec<String> = backups
            .iter()
            .map(|p| {
                let data: SyncData = serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap();
                data.prompts[0].title.clone()
            })
            .collect();
        assert_eq!(titles, vec!["P0", "P1", "P2"]);
    }
}
