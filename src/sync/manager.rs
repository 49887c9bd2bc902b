//! Cloud storage manager
//!
//! Owns the persisted [`CloudSyncSettings`], the active [`CloudClient`] and
//! the auto-sync timer. The client is rebuilt whenever the connection part of
//! the settings changes; the timer is torn down and recreated on every
//! settings change.
//!
//! `sync` compares the local snapshot, the remote snapshot and the checksum
//! both sides agreed on after the last sync:
//!
//! | local vs base | remote vs base | result                            |
//! |---------------|----------------|-----------------------------------|
//! | equal remote  |                | up to date                        |
//! | changed       | unchanged      | upload                            |
//! | unchanged     | changed        | download and apply                |
//! | changed       | changed        | conflict check, then newer wins   |

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::cloud::{join_remote, CloudClient, CloudStorage};
use crate::config::CloudConfig;
use crate::error::{CloudError, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::flat_store::FlatStore;
use crate::models::{Category, Prompt, Settings, SyncData, SyncSource};
use crate::repository::LocalReplica;
use crate::sync::conflict::{detect_conflict, newer, resolve, resolve_with_choice, ConflictChoice};
use crate::sync::parse_sync_data;
use crate::sync::settings::{CloudProvider, CloudSyncSettings};

/// What a call to [`CloudStorageManager::sync`] did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// Local data was written to the remote
    Uploaded { checksum: String },
    /// Remote data replaced local data
    Downloaded { checksum: String },
    UpToDate { checksum: String },
    /// A conflict was resolved by the configured strategy
    Resolved { checksum: String },
    /// Another sync was already running
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub provider: CloudProvider,
    pub configured: bool,
    pub connected: bool,
    pub auto_sync: bool,
    pub auto_sync_running: bool,
    pub sync_interval_minutes: u64,
    pub last_sync_time: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_flight: bool,
    pub remote_file: Option<String>,
}

struct Inner {
    flat: Arc<dyn FlatStore>,
    config: CloudConfig,
    events: EventBus,
    settings: RwLock<CloudSyncSettings>,
    client: RwLock<Option<Arc<CloudClient>>>,
    last_error: RwLock<Option<String>>,
    in_flight: AtomicBool,
    replica: RwLock<Option<Arc<dyn LocalReplica>>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_sync.get_mut().take() {
            handle.abort();
        }
    }
}

/// Clears the in-flight flag when a sync ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clones share state
#[derive(Clone)]
pub struct CloudStorageManager {
    inner: Arc<Inner>,
}

impl CloudStorageManager {
    /// Load settings from `flat` and build the client if sync is enabled
    pub fn new(flat: Arc<dyn FlatStore>, config: CloudConfig, events: EventBus) -> Self {
        let settings = CloudSyncSettings::load(flat.as_ref());
        let client = build_client(&settings, config.request_timeout());
        Self {
            inner: Arc::new(Inner {
                flat,
                config,
                events,
                settings: RwLock::new(settings),
                client: RwLock::new(client),
                last_error: RwLock::new(None),
                in_flight: AtomicBool::new(false),
                replica: RwLock::new(None),
                auto_sync: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> CloudSyncSettings {
        self.inner.settings.read().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Remote path of the snapshot file for the active provider
    pub fn remote_file(&self) -> Option<String> {
        let settings = self.inner.settings.read();
        settings
            .remote_path()
            .map(|dir| join_remote(dir, &self.inner.config.remote_file_name))
    }

    fn client(&self) -> SyncResult<Arc<CloudClient>> {
        if !self.inner.settings.read().enabled {
            return Err(SyncError::Disabled);
        }
        self.inner
            .client
            .read()
            .clone()
            .ok_or(SyncError::Cloud(CloudError::NotConfigured))
    }

    fn remote_file_or_err(&self) -> SyncResult<String> {
        self.remote_file().ok_or(SyncError::Cloud(CloudError::NotConfigured))
    }

    pub async fn test_connection(&self) -> SyncResult<()> {
        let client = self.client()?;
        let result = client.test_connection().await;
        self.persist_refreshed_tokens(&client);
        match result {
            Ok(()) => {
                tracing::info!(provider = %client.provider(), "cloud connection ok");
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Snapshot the given data, upload it and record the sync time
    pub async fn upload_data(
        &self,
        prompts: Vec<Prompt>,
        categories: Vec<Category>,
        settings: Settings,
    ) -> SyncResult<SyncData> {
        let data = SyncData::new(prompts, categories, settings, SyncSource::Primary);
        match self.push(&data).await {
            Ok(()) => Ok(data),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Fetch and validate the remote snapshot. `None` when nothing has been
    /// uploaded yet.
    pub async fn download_data(&self) -> SyncResult<Option<SyncData>> {
        match self.pull().await {
            Ok(Some(data)) => {
                self.inner.events.emit(SyncEvent::DownloadCompleted {
                    checksum: data.checksum().to_string(),
                });
                Ok(Some(data))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reconcile `local` with the remote snapshot
    pub async fn sync(&self, local: &dyn LocalReplica) -> SyncResult<SyncOutcome> {
        let Some(_guard) = InFlight::acquire(&self.inner.in_flight) else {
            tracing::debug!("sync already in flight, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        match self.reconcile(local).await {
            Ok(outcome) => {
                tracing::info!(?outcome, "sync finished");
                Ok(outcome)
            }
            Err(e @ SyncError::ConflictUnresolved { .. }) => Err(e),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn reconcile(&self, replica: &dyn LocalReplica) -> SyncResult<SyncOutcome> {
        let local = replica.export_snapshot()?;
        let Some(remote) = self.pull().await? else {
            self.push(&local).await?;
            return Ok(SyncOutcome::Uploaded {
                checksum: local.checksum().to_string(),
            });
        };

        if local.checksum() == remote.checksum() {
            self.record_sync(local.checksum());
            return Ok(SyncOutcome::UpToDate {
                checksum: local.checksum().to_string(),
            });
        }

        let (base, strategy) = {
            let settings = self.inner.settings.read();
            (settings.last_sync_checksum.clone(), settings.conflict_strategy)
        };

        if base.as_deref() == Some(remote.checksum()) {
            self.push(&local).await?;
            return Ok(SyncOutcome::Uploaded {
                checksum: local.checksum().to_string(),
            });
        }
        if base.as_deref() == Some(local.checksum()) {
            self.apply_remote(replica, &remote)?;
            return Ok(SyncOutcome::Downloaded {
                checksum: remote.checksum().to_string(),
            });
        }

        if detect_conflict(&local, &remote, self.inner.config.conflict_window()) {
            tracing::warn!(
                local = %local.checksum(),
                remote = %remote.checksum(),
                ?strategy,
                "sync conflict detected"
            );
            self.inner.events.emit(SyncEvent::ConflictDetected {
                local: Box::new(local.clone()),
                remote: Box::new(remote.clone()),
            });
            let resolved = resolve(&local, &remote, strategy)?;
            self.settle(replica, &local, &remote, &resolved).await?;
            self.inner.events.emit(SyncEvent::ConflictResolved {
                checksum: resolved.checksum().to_string(),
            });
            return Ok(SyncOutcome::Resolved {
                checksum: resolved.checksum().to_string(),
            });
        }

        if std::ptr::eq(newer(&local, &remote), &remote) {
            self.apply_remote(replica, &remote)?;
            Ok(SyncOutcome::Downloaded {
                checksum: remote.checksum().to_string(),
            })
        } else {
            self.push(&local).await?;
            Ok(SyncOutcome::Uploaded {
                checksum: local.checksum().to_string(),
            })
        }
    }

    /// Apply an explicit choice to a conflict surfaced in manual mode
    pub async fn resolve_conflict(
        &self,
        replica: &dyn LocalReplica,
        local: &SyncData,
        remote: &SyncData,
        choice: ConflictChoice,
    ) -> SyncResult<SyncData> {
        let resolved = resolve_with_choice(local, remote, choice);
        if let Err(e) = self.settle(replica, local, remote, &resolved).await {
            return Err(self.fail(e));
        }
        tracing::info!(?choice, checksum = %resolved.checksum(), "conflict resolved");
        self.inner.events.emit(SyncEvent::ConflictResolved {
            checksum: resolved.checksum().to_string(),
        });
        Ok(resolved)
    }

    /// Bring both sides to `resolved`, skipping the side that already has it
    async fn settle(
        &self,
        replica: &dyn LocalReplica,
        local: &SyncData,
        remote: &SyncData,
        resolved: &SyncData,
    ) -> SyncResult<()> {
        if resolved.checksum() != local.checksum() {
            replica.apply_snapshot(resolved)?;
        }
        if resolved.checksum() != remote.checksum() {
            self.push(resolved).await?;
        } else {
            self.record_sync(resolved.checksum());
        }
        Ok(())
    }

    fn apply_remote(&self, replica: &dyn LocalReplica, remote: &SyncData) -> SyncResult<()> {
        replica.apply_snapshot(remote)?;
        self.record_sync(remote.checksum());
        self.inner.events.emit(SyncEvent::DownloadCompleted {
            checksum: remote.checksum().to_string(),
        });
        Ok(())
    }

    async fn push(&self, data: &SyncData) -> SyncResult<()> {
        let client = self.client()?;
        let path = self.remote_file_or_err()?;
        let body = serde_json::to_vec_pretty(data)?;

        let result = client.upload_file(&path, &body).await;
        self.persist_refreshed_tokens(&client);
        result?;

        tracing::info!(path = %path, checksum = %data.checksum(), "uploaded sync data");
        self.record_sync(data.checksum());
        self.inner.events.emit(SyncEvent::UploadCompleted {
            checksum: data.checksum().to_string(),
        });
        Ok(())
    }

    async fn pull(&self) -> SyncResult<Option<SyncData>> {
        let client = self.client()?;
        let path = self.remote_file_or_err()?;

        let result = client.download_file(&path).await;
        self.persist_refreshed_tokens(&client);
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path, "no remote sync data yet");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let data = parse_sync_data(&bytes)?;
        tracing::debug!(path = %path, checksum = %data.checksum(), "downloaded sync data");
        Ok(Some(data))
    }

    fn record_sync(&self, checksum: &str) {
        let snapshot = {
            let mut settings = self.inner.settings.write();
            settings.last_sync_time = Some(Utc::now());
            settings.last_sync_checksum = Some(checksum.to_string());
            settings.clone()
        };
        *self.inner.last_error.write() = None;
        if let Err(e) = snapshot.save(self.inner.flat.as_ref()) {
            tracing::warn!(error = %e, "failed to persist last sync time");
        }
    }

    /// Record, log and announce a failure, handing the error back
    fn fail(&self, error: SyncError) -> SyncError {
        tracing::error!(error = %error, "cloud sync failed");
        *self.inner.last_error.write() = Some(error.to_string());
        self.inner.events.emit(SyncEvent::SyncFailed {
            error: error.to_string(),
        });
        error
    }

    fn persist_refreshed_tokens(&self, client: &CloudClient) {
        let Some(tokens) = client.take_refreshed_tokens() else {
            return;
        };
        let snapshot = {
            let mut settings = self.inner.settings.write();
            let Some(onedrive) = settings.onedrive.as_mut() else {
                return;
            };
            onedrive.access_token = tokens.access_token;
            onedrive.refresh_token = tokens.refresh_token;
            onedrive.expires_at = tokens.expires_at;
            settings.clone()
        };
        match snapshot.save(self.inner.flat.as_ref()) {
            Ok(()) => self.inner.events.emit(SyncEvent::TokensRefreshed),
            Err(e) => tracing::warn!(error = %e, "failed to persist refreshed tokens"),
        }
    }

    pub fn status(&self) -> SyncStatus {
        let settings = self.inner.settings.read().clone();
        SyncStatus {
            enabled: settings.enabled,
            provider: settings.provider,
            configured: settings.is_configured(),
            connected: self.inner.client.read().is_some(),
            auto_sync: settings.auto_sync,
            auto_sync_running: self.is_auto_sync_running(),
            sync_interval_minutes: settings.sync_interval_minutes,
            last_sync_time: settings.last_sync_time,
            last_error: self.inner.last_error.read().clone(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            remote_file: self.remote_file(),
        }
    }

    /// Persist new settings. The client is rebuilt when the connection
    /// changed and the auto-sync timer is recreated.
    pub fn update_settings(&self, settings: CloudSyncSettings) -> SyncResult<()> {
        settings.save(self.inner.flat.as_ref())?;

        let previous = std::mem::replace(&mut *self.inner.settings.write(), settings.clone());
        if !previous.same_connection(&settings) {
            let client = build_client(&settings, self.inner.config.request_timeout());
            *self.inner.client.write() = client;
            tracing::info!(provider = %settings.provider, "cloud client rebuilt");
        }
        self.inner.events.emit(SyncEvent::SettingsChanged);

        let was_running = self.stop_timer();
        let replica = self.inner.replica.read().clone();
        match replica {
            Some(replica) if settings.enabled && settings.auto_sync => self.start_auto_sync(replica),
            _ => {
                if was_running {
                    self.inner.events.emit(SyncEvent::AutoSyncStopped);
                }
                Ok(())
            }
        }
    }

    /// Run `sync(replica)` every `syncIntervalMinutes`. Must be called inside
    /// a Tokio runtime. A tick that finds a sync in flight does nothing.
    pub fn start_auto_sync(&self, replica: Arc<dyn LocalReplica>) -> SyncResult<()> {
        let (enabled, minutes) = {
            let settings = self.inner.settings.read();
            (settings.enabled, settings.sync_interval_minutes.max(1))
        };
        if !enabled {
            return Err(SyncError::Disabled);
        }
        let runtime = tokio::runtime::Handle::try_current()?;

        self.stop_timer();
        *self.inner.replica.write() = Some(replica.clone());

        let period = Duration::from_secs(minutes * 60);
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(auto_sync_loop(weak, replica, period));
        *self.inner.auto_sync.lock() = Some(handle);

        tracing::info!(interval_minutes = minutes, "auto-sync started");
        self.inner.events.emit(SyncEvent::AutoSyncStarted {
            interval_minutes: minutes,
        });
        Ok(())
    }

    pub fn stop_auto_sync(&self) {
        *self.inner.replica.write() = None;
        if self.stop_timer() {
            tracing::info!("auto-sync stopped");
            self.inner.events.emit(SyncEvent::AutoSyncStopped);
        }
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.inner
            .auto_sync
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort the timer task; `true` if one was running
    fn stop_timer(&self) -> bool {
        match self.inner.auto_sync.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn auto_sync_loop(inner: Weak<Inner>, replica: Arc<dyn LocalReplica>, period: Duration) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticks.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = CloudStorageManager { inner };
        if let Err(e) = manager.sync(replica.as_ref()).await {
            tracing::debug!(error = %e, "auto-sync tick failed");
        }
    }
}

fn build_client(settings: &CloudSyncSettings, timeout: Duration) -> Option<Arc<CloudClient>> {
    if !settings.enabled || !settings.is_configured() {
        return None;
    }
    match CloudClient::from_settings(settings, timeout) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!(provider = %settings.provider, error = %e, "could not build cloud client");
            None
        }
    }
}
