//! Range lifecycle: metadata, state machine and workflows
//!
//! A range's identity lives in `ranges_metadata.json`; the orchestrator is
//! the only writer of `status`. The lifecycle is strict:
//! `CREATING -> ACTIVE -> STOPPING -> STOPPED -> DESTROYING -> DESTROYED ->
//! REMOVED`, with `ERROR` reachable from every transient state. `DESTROYED`
//! is terminal until `rm` transitions to `REMOVED`, which deletes the
//! metadata entry.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::Context as _, Result};
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use strum::{Display, EnumString};

use crate::errors::CyrisError;

pub mod create;
pub mod destroy;
pub mod list;
pub mod ssh_info;
pub mod status;

/// Range lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RangeStatus {
    /// Create workflow in progress
    Creating,
    /// Guests up, tasks done
    Active,
    /// Graceful shutdown in progress
    Stopping,
    /// Guests down, resources kept
    Stopped,
    /// Teardown in progress
    Destroying,
    /// Resources gone, metadata kept
    Destroyed,
    /// Metadata deleted (never persisted)
    Removed,
    /// A transient state failed
    Error,
}

impl RangeStatus {
    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition(self, next: RangeStatus) -> bool {
        use RangeStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            // ERROR is reachable from every transient state
            (Creating | Active | Stopping | Stopped | Destroying, Error) => true,
            (Creating, Active) => true,
            (Creating | Active | Stopped | Error, Destroying) => true,
            (Active, Stopping) => true,
            (Stopping, Stopped) => true,
            (Destroying, Destroyed) => true,
            (Destroyed, Removed) => true,
            _ => false,
        }
    }

    /// States in which guests may be running.
    pub fn is_live(self) -> bool {
        matches!(self, RangeStatus::Creating | RangeStatus::Active | RangeStatus::Stopping)
    }
}

/// Persisted facts about one range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeMetadata {
    /// Stable identifier
    pub range_id: String,
    /// Display name
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Lifecycle state, mutated only by the orchestrator
    pub status: RangeStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub last_modified: DateTime<Utc>,
    /// Creating user
    #[serde(default)]
    pub owner: String,
    /// Free-form tags; includes `ip_assignments`
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
    /// The description file the range was created from
    #[serde(default)]
    pub config_path: Option<Utf8PathBuf>,
    /// Path of the range's creation log
    #[serde(default)]
    pub logs_path: Option<Utf8PathBuf>,
    /// Provider-specific settings
    #[serde(default)]
    pub provider_config: Option<serde_json::Value>,
}

impl RangeMetadata {
    /// Fresh metadata in the CREATING state.
    pub fn new(range_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            range_id: range_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            status: RangeStatus::Creating,
            created_at: now,
            last_modified: now,
            owner: std::env::var("USER").unwrap_or_default(),
            tags: BTreeMap::new(),
            config_path: None,
            logs_path: None,
            provider_config: None,
        }
    }

    /// The recorded ip_assignments tag as a flat map.
    pub fn ip_assignments(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(serde_json::Value::Object(entries)) = self.tags.get("ip_assignments") {
            for (key, value) in entries {
                if let Some(ip) = value.as_str() {
                    map.insert(key.clone(), ip.to_string());
                }
            }
        }
        map
    }
}

type MetadataDocument = BTreeMap<String, RangeMetadata>;

/// File-backed metadata store. Mutations run under an exclusive advisory
/// lock; readers tolerate stale snapshots.
#[derive(Debug)]
pub struct MetadataStore {
    path: Utf8PathBuf,
}

impl MetadataStore {
    /// Store over the given metadata document.
    pub fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    /// Read the whole document; a missing file is an empty document.
    pub fn load(&self) -> Result<MetadataDocument> {
        match std::fs::read_to_string(self.path.as_std_path()) {
            Ok(content) if !content.trim().is_empty() => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt metadata at {}", self.path)),
            Ok(_) => Ok(MetadataDocument::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetadataDocument::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path)),
        }
    }

    /// One range's metadata, if present.
    pub fn get(&self, range_id: &str) -> Result<Option<RangeMetadata>> {
        Ok(self.load()?.remove(range_id))
    }

    /// Insert or replace a metadata entry.
    pub fn upsert(&self, metadata: RangeMetadata) -> Result<()> {
        self.mutate(|document| {
            document.insert(metadata.range_id.clone(), metadata);
            Ok(())
        })
    }

    /// Guarded status transition; refuses moves the lifecycle forbids.
    pub fn update_status(&self, range_id: &str, next: RangeStatus) -> Result<()> {
        self.mutate(|document| {
            let entry = document.get_mut(range_id).ok_or_else(|| {
                color_eyre::Report::from(CyrisError::Config(format!(
                    "unknown range {:?}",
                    range_id
                )))
            })?;
            if !entry.status.can_transition(next) {
                return Err(CyrisError::Config(format!(
                    "range {} cannot move from {} to {}",
                    range_id, entry.status, next
                ))
                .into());
            }
            entry.status = next;
            entry.last_modified = Utc::now();
            Ok(())
        })
    }

    /// Set one tag on a range.
    pub fn set_tag(&self, range_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.mutate(|document| {
            let entry = document.get_mut(range_id).ok_or_else(|| {
                color_eyre::Report::from(CyrisError::Config(format!(
                    "unknown range {:?}",
                    range_id
                )))
            })?;
            entry.tags.insert(key.to_string(), value);
            entry.last_modified = Utc::now();
            Ok(())
        })
    }

    /// Delete a metadata entry (the REMOVED transition).
    pub fn remove(&self, range_id: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.mutate(|document| {
            document.remove(range_id);
            Ok(())
        })
    }

    fn mutate<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut MetadataDocument) -> Result<()>,
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent.as_std_path())
                .with_context(|| format!("Failed to create {}", parent))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.as_std_path())
            .with_context(|| format!("Failed to open {}", self.path))?;
        rustix::fs::flock(&file, FlockOperation::LockExclusive)
            .context("Failed to lock metadata store")?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let mut document: MetadataDocument = if content.trim().is_empty() {
            MetadataDocument::new()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Corrupt metadata at {}", self.path))?
        };

        mutate(&mut document)?;

        let serialized = serde_json::to_string_pretty(&document).context("Serialize metadata")?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
