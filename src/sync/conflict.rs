//! Conflict detection and resolution
//!
//! Two snapshots conflict when their checksums differ and they were modified
//! within the conflict window of each other. Divergence with a clear time gap
//! is not a conflict: the later snapshot simply wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::models::{Category, Prompt, SyncData, SyncSource};

pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the snapshot with the later `lastModified`
    #[default]
    Timestamp,
    /// Entity-level union, newest copy of each record wins
    Merge,
    /// Surface the conflict and wait for a [`ConflictChoice`]
    Manual,
}

/// Explicit resolution picked by the user in manual mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Local,
    Remote,
    Merge,
}

impl std::str::FromStr for ConflictChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ConflictChoice::Local),
            "remote" => Ok(ConflictChoice::Remote),
            "merge" => Ok(ConflictChoice::Merge),
            other => Err(format!("unknown conflict choice: {}", other)),
        }
    }
}

/// True iff the checksums differ and `|local - remote| < window`. Symmetric.
pub fn detect_conflict(local: &SyncData, remote: &SyncData, window: Duration) -> bool {
    if local.checksum() == remote.checksum() {
        return false;
    }
    let delta = (local.last_modified - remote.last_modified)
        .num_milliseconds()
        .unsigned_abs();
    u128::from(delta) < window.as_millis()
}

/// The overall-newer snapshot. Equal timestamps are broken by checksum so
/// every replica picks the same winner.
pub fn newer<'a>(a: &'a SyncData, b: &'a SyncData) -> &'a SyncData {
    match a.last_modified.cmp(&b.last_modified) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            if a.checksum() >= b.checksum() {
                a
            } else {
                b
            }
        }
    }
}

/// Merge two snapshots record by record.
///
/// Prompts are keyed by id and the copy with the later `updatedAt` wins.
/// Categories are keyed by id and the overall-newer snapshot's copy wins.
/// Settings are taken whole from the overall-newer snapshot.
pub fn merge(local: &SyncData, remote: &SyncData) -> SyncData {
    let primary = newer(local, remote);
    let secondary = if std::ptr::eq(primary, local) { remote } else { local };

    let mut prompts: BTreeMap<&str, &Prompt> = BTreeMap::new();
    for prompt in secondary.prompts.iter().chain(primary.prompts.iter()) {
        match prompts.get(prompt.id.as_str()) {
            Some(existing) if existing.updated_at > prompt.updated_at => {}
            _ => {
                prompts.insert(&prompt.id, prompt);
            }
        }
    }

    let mut categories: BTreeMap<&str, &Category> = BTreeMap::new();
    for category in secondary.categories.iter().chain(primary.categories.iter()) {
        categories.insert(&category.id, category);
    }

    SyncData::new(
        prompts.into_values().cloned().collect(),
        categories.into_values().cloned().collect(),
        primary.settings.clone(),
        SyncSource::Primary,
    )
}

/// Resolve according to `strategy`. Manual mode always fails with
/// [`SyncError::ConflictUnresolved`].
pub fn resolve(local: &SyncData, remote: &SyncData, strategy: ConflictStrategy) -> SyncResult<SyncData> {
    match strategy {
        ConflictStrategy::Timestamp => Ok(newer(local, remote).clone()),
        ConflictStrategy::Merge => Ok(merge(local, remote)),
        ConflictStrategy::Manual => Err(SyncError::ConflictUnresolved {
            local_checksum: local.checksum().to_string(),
            remote_checksum: remote.checksum().to_string(),
        }),
    }
}

pub fn resolve_with_choice(local: &SyncData, remote: &SyncData, choice: ConflictChoice) -> SyncData {
    match choice {
        ConflictChoice::Local => local.clone(),
        ConflictChoice::Remote => remote.clone(),
        ConflictChoice::Merge => merge(local, remote),
    }
}
