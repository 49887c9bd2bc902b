//! CLI command definitions and handlers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use prompt_sync::cloud::onedrive::{authorization_url, exchange_code, TOKEN_URL};
use prompt_sync::sync::companion::CompanionEvent;
use prompt_sync::sync::conflict::{ConflictChoice, ConflictStrategy};
use prompt_sync::sync::settings::{CloudProvider, OneDriveSettings, WebDavSettings};
use prompt_sync::{
    AppConfig, CloudStorageManager, CompanionChannel, Database, DatabaseClient, EventBus,
    FlatStore, JsonFileStore, LocalHost, LocalReplica, MigrationManager, PromptRepository,
    SyncError, SyncEvent,
};

#[derive(Parser)]
#[command(name = "prompt-sync")]
#[command(author, version, about = "Prompt library storage and sync")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/prompt-sync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show storage mode, migration state and cloud sync status
    Status,

    /// Migrate the flat store into the relational store
    Migrate,

    /// Undo the migration and go back to flat-store mode
    Rollback,

    /// List prompts
    List {
        /// Only prompts whose title, content or tags match
        query: Option<String>,

        /// Only favorites
        #[arg(short, long)]
        favorites: bool,
    },

    /// Write the current library as a sync snapshot
    Export {
        /// Output file
        file: PathBuf,
    },

    /// Upload the local library to the cloud provider
    Push,

    /// Replace the local library with the cloud copy
    Pull,

    /// Reconcile the local library with the cloud copy
    Sync,

    /// Settle a conflict reported by `sync` in manual mode
    Resolve {
        /// local, remote or merge
        choice: ConflictChoice,
    },

    /// Publish to the companion file and apply companion changes until Ctrl-C
    Watch {
        /// Also run cloud auto-sync
        #[arg(long)]
        auto_sync: bool,
    },

    /// Check the configured cloud provider
    TestConnection,

    /// Configure cloud sync
    Cloud {
        #[command(subcommand)]
        action: CloudAction,
    },
}

#[derive(Subcommand)]
pub enum CloudAction {
    /// Use a WebDAV server
    Webdav {
        url: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        #[arg(long, default_value = "/PromptSync")]
        remote_path: String,
    },

    /// Use OneDrive. Without --code, prints the URL to authorize at.
    Onedrive {
        #[arg(long)]
        client_id: String,
        /// Authorization code from the redirect
        #[arg(long)]
        code: Option<String>,
        #[arg(long, default_value = "http://localhost:8400/callback")]
        redirect_uri: String,
        #[arg(long, default_value = "/PromptSync")]
        remote_path: String,
    },

    /// Turn auto-sync on (with an interval) or off
    AutoSync {
        #[arg(long)]
        minutes: Option<u64>,
        #[arg(long)]
        off: bool,
    },

    /// How divergent snapshots are resolved
    Strategy { strategy: StrategyArg },

    /// Turn cloud sync off, keeping credentials
    Disable,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    Timestamp,
    Merge,
    Manual,
}

impl From<StrategyArg> for ConflictStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Timestamp => ConflictStrategy::Timestamp,
            StrategyArg::Merge => ConflictStrategy::Merge,
            StrategyArg::Manual => ConflictStrategy::Manual,
        }
    }
}

/// Services wired together from the config
pub struct App {
    config: AppConfig,
    db: Database,
    migration: MigrationManager,
    repo: Arc<PromptRepository>,
    manager: CloudStorageManager,
    events: EventBus,
}

impl App {
    pub fn open(config: AppConfig) -> Result<Self> {
        let flat_path = config.flat_store_path();
        let flat: Arc<dyn FlatStore> = Arc::new(
            JsonFileStore::open(&flat_path)
                .with_context(|| format!("failed to open flat store {}", flat_path.display()))?,
        );
        let db_path = config.database_path();
        let db = Database::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))?;

        let migration = MigrationManager::new(db.clone(), flat.clone(), config.backup_path());
        let client = DatabaseClient::new(Arc::new(LocalHost::new(db.clone(), migration.clone())));
        let repo = Arc::new(PromptRepository::new(client, flat.clone()));

        let events = EventBus::new();
        events.subscribe(log_event);
        let manager = CloudStorageManager::new(flat, config.cloud.clone(), events.clone());

        Ok(Self {
            config,
            db,
            migration,
            repo,
            manager,
            events,
        })
    }

    pub fn status(&self) -> Result<()> {
        let info = self.migration.migration_info()?;
        let counts = self.db.counts()?;

        println!("Storage mode:  {:?}", self.repo.mode());
        println!("Migration:     {}", info.status);
        if let Some(date) = info.date {
            println!("Migrated at:   {}", date);
        }
        println!(
            "Database:      {} prompts, {} categories, {} tags, {} settings",
            counts.prompts, counts.categories, counts.tags, counts.settings
        );
        println!();
        println!(
            "Cloud sync:\n{}",
            serde_json::to_string_pretty(&self.manager.status())?
        );
        Ok(())
    }

    pub fn migrate(&self) -> Result<()> {
        let report = self.migration.migrate().context("migration failed")?;
        if report.skipped {
            println!("Already migrated, nothing to do");
            return Ok(());
        }

        println!(
            "Migrated {} prompts, {} categories, {} settings",
            report.prompts, report.categories, report.settings
        );
        if let Some(path) = report.backup_path {
            println!("Backup written to {}", path.display());
        }
        for mismatch in report.mismatches {
            println!("warning: {}", mismatch);
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.migration.rollback().context("rollback failed")?;
        println!("Rolled back; the flat store is authoritative again");
        Ok(())
    }

    pub fn list(&self, query: Option<&str>, favorites: bool) -> Result<()> {
        let prompts = match query {
            Some(q) => self.repo.search_prompts(q)?,
            None => self.repo.get_all_prompts()?,
        };

        let mut shown = 0;
        for prompt in prompts.iter().filter(|p| !favorites || p.is_favorite) {
            let star = if prompt.is_favorite { "*" } else { " " };
            let tags = if prompt.tags.is_empty() {
                String::new()
            } else {
                format!(" #{}", prompt.tags.join(" #"))
            };
            println!("{} {}  {} [{}]{}", star, prompt.id, prompt.title, prompt.category, tags);
            shown += 1;
        }
        println!("{} prompt(s)", shown);
        Ok(())
    }

    pub fn export(&self, file: &Path) -> Result<()> {
        let snapshot = self.repo.export_snapshot()?;
        std::fs::write(file, serde_json::to_vec_pretty(&snapshot)?)
            .with_context(|| format!("failed to write {}", file.display()))?;
        println!("Exported {} prompts ({})", snapshot.prompts.len(), snapshot.checksum());
        Ok(())
    }

    pub async fn push(&self) -> Result<()> {
        let snapshot = self.repo.export_snapshot()?;
        let uploaded = self
            .manager
            .upload_data(snapshot.prompts, snapshot.categories, snapshot.settings)
            .await?;
        println!("Uploaded {} prompts ({})", uploaded.prompts.len(), uploaded.checksum());
        Ok(())
    }

    pub async fn pull(&self) -> Result<()> {
        match self.manager.download_data().await? {
            Some(data) => {
                self.repo.apply_snapshot(&data)?;
                println!("Applied {} prompts ({})", data.prompts.len(), data.checksum());
            }
            None => println!("No cloud copy yet"),
        }
        Ok(())
    }

    pub async fn sync(&self) -> Result<()> {
        match self.manager.sync(self.repo.as_ref()).await {
            Ok(outcome) => {
                println!("{}", serde_json::to_string(&outcome)?);
                Ok(())
            }
            Err(SyncError::ConflictUnresolved {
                local_checksum,
                remote_checksum,
            }) => {
                bail!(
                    "local ({}) and cloud ({}) changed at the same time; run `prompt-sync resolve local|remote|merge`",
                    local_checksum,
                    remote_checksum
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resolve(&self, choice: ConflictChoice) -> Result<()> {
        let local = self.repo.export_snapshot()?;
        let remote = self
            .manager
            .download_data()
            .await?
            .context("no cloud copy to resolve against")?;
        let resolved = self
            .manager
            .resolve_conflict(self.repo.as_ref(), &local, &remote, choice)
            .await?;
        println!("Resolved to {} ({} prompts)", resolved.checksum(), resolved.prompts.len());
        Ok(())
    }

    pub async fn watch(&self, auto_sync: bool) -> Result<()> {
        let mut channel = CompanionChannel::new(self.config.companion_path(), &self.config.companion)
            .with_events(self.events.clone());

        let snapshot = self.repo.export_snapshot()?;
        channel.write_sync_data(snapshot.prompts, snapshot.categories, snapshot.settings)?;
        let receiver = channel.start_watching()?;

        if auto_sync {
            let replica: Arc<dyn LocalReplica> = self.repo.clone();
            self.manager.start_auto_sync(replica)?;
        }

        let repo = self.repo.clone();
        let worker = tokio::task::spawn_blocking(move || {
            for event in receiver {
                match event {
                    CompanionEvent::DataChanged(data) => match repo.apply_snapshot(&data) {
                        Ok(()) => tracing::info!(checksum = %data.checksum(), "applied companion changes"),
                        Err(e) => tracing::warn!(error = %e, "failed to apply companion changes"),
                    },
                    CompanionEvent::Error(error) => {
                        tracing::warn!(error = %error, "companion sync file unreadable")
                    }
                }
            }
        });

        println!("Watching {} (Ctrl-C to stop)", channel.path().display());
        tokio::signal::ctrl_c().await?;

        channel.stop_watching();
        self.manager.stop_auto_sync();
        worker.await?;
        Ok(())
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.manager.test_connection().await?;
        println!("Connection to {} ok", self.manager.settings().provider);
        Ok(())
    }

    pub async fn configure_cloud(&self, action: CloudAction) -> Result<()> {
        let mut settings = self.manager.settings();
        match action {
            CloudAction::Webdav {
                url,
                username,
                password,
                remote_path,
            } => {
                settings.enabled = true;
                settings.provider = CloudProvider::Webdav;
                settings.webdav = Some(WebDavSettings {
                    url,
                    username,
                    password,
                    remote_path,
                });
            }
            CloudAction::Onedrive {
                client_id,
                code,
                redirect_uri,
                remote_path,
            } => {
                let Some(code) = code else {
                    println!("Open this URL, then rerun with --code:");
                    println!("{}", authorization_url(&client_id, &redirect_uri)?);
                    return Ok(());
                };
                let timeout = self.config.request_timeout();
                let tokens = exchange_code(&client_id, &code, &redirect_uri, TOKEN_URL, timeout).await?;
                settings.enabled = true;
                settings.provider = CloudProvider::Onedrive;
                settings.onedrive = Some(OneDriveSettings {
                    client_id,
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    expires_at: tokens.expires_at,
                    remote_path,
                });
            }
            CloudAction::AutoSync { minutes, off } => {
                settings.auto_sync = !off;
                if let Some(minutes) = minutes {
                    settings.sync_interval_minutes = minutes.max(1);
                }
            }
            CloudAction::Strategy { strategy } => settings.conflict_strategy = strategy.into(),
            CloudAction::Disable => settings.enabled = false,
        }

        self.manager.update_settings(settings)?;
        println!("Cloud sync settings saved");
        Ok(())
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncFailed { error } => tracing::error!(error = %error, "sync failed"),
        SyncEvent::ConflictDetected { local, remote } => tracing::warn!(
            local = %local.checksum(),
            remote = %remote.checksum(),
            "conflict detected"
        ),
        SyncEvent::CompanionChanged { data } => {
            tracing::info!(checksum = %data.checksum(), "companion data changed")
        }
        other => tracing::debug!(event = ?other, "sync event"),
    }
}
