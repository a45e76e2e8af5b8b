//! Durable pipeline store.
//!
//! The whole table lives in one JSON file. Saves go through a temporary file
//! and an atomic rename, and the previous primary is copied to `<path>.bak`
//! first, so at every instant at least one of the two files holds a complete
//! table.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use gavel_common::{ItemRecord, ItemState, Metadata, ReservedKey, StatePatch};

use crate::errors::{PipelineError, Result};

/// Layout version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// `{"processed_videos": {...}}`: flat list of finished downloads.
const LEGACY_PROCESSED_LIST: u32 = 0;
/// `{"videos": {...}}`: per-video state without history.
const LEGACY_VIDEO_STATES: u32 = 1;

/// The full id → record mapping plus its layout version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTable {
    pub version: u32,
    #[serde(default)]
    pub items: BTreeMap<String, ItemRecord>,
}

impl Default for PipelineTable {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            items: BTreeMap::new(),
        }
    }
}

impl PipelineTable {
    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (key, record) in &self.items {
            if key != &record.id {
                return Err(format!("record under key {key} has id {}", record.id));
            }
            record.check_history()?;
        }
        Ok(())
    }
}

/// Where a loaded table came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Empty,
    Primary,
    Backup,
}

#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: PipelineTable,
    pub source: LoadSource,
    /// Legacy layout version the table was migrated from, if any.
    pub migrated_from: Option<u32>,
}

enum Attempt {
    Missing,
    Parsed(PipelineTable, Option<u32>),
    Bad(String),
}

impl Attempt {
    fn describe(&self) -> String {
        match self {
            Attempt::Missing => "missing".to_string(),
            Attempt::Parsed(..) => "ok".to_string(),
            Attempt::Bad(reason) => reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurableStore {
    path: PathBuf,
    backup_path: PathBuf,
    read_only: bool,
}

impl DurableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = sibling(&path, ".bak");
        Self {
            path,
            backup_path,
            read_only: false,
        }
    }

    /// A store whose saves serialise the table but never touch disk.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Load the table, recovering from the backup when the primary is
    /// missing or unusable. Never writes.
    pub fn load(&self) -> Result<LoadedTable> {
        let primary = match read_attempt(&self.path) {
            Attempt::Parsed(table, migrated_from) => {
                return Ok(LoadedTable {
                    table,
                    source: LoadSource::Primary,
                    migrated_from,
                });
            }
            other => other,
        };

        let backup = read_attempt(&self.backup_path);
        match (primary, backup) {
            (Attempt::Missing, Attempt::Missing) => Ok(LoadedTable {
                table: PipelineTable::default(),
                source: LoadSource::Empty,
                migrated_from: None,
            }),
            (primary, Attempt::Parsed(table, migrated_from)) => {
                warn!(
                    path = %self.path.display(),
                    primary = %primary.describe(),
                    backup = %self.backup_path.display(),
                    "Primary pipeline store unusable, recovered from backup"
                );
                Ok(LoadedTable {
                    table,
                    source: LoadSource::Backup,
                    migrated_from,
                })
            }
            (primary, backup) => Err(PipelineError::StoreCorrupted {
                path: self.path.clone(),
                primary: primary.describe(),
                backup: backup.describe(),
            }),
        }
    }

    /// Persist `table` with write-temp, back up previous primary, rename.
    pub fn save(&self, table: &PipelineTable) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(table)
            .map_err(|e| self.persistence(std::io::Error::other(e)))?;
        bytes.push(b'\n');

        if self.read_only {
            debug!(path = %self.path.display(), "Read-only store, skipping save");
            return Ok(());
        }

        if let Some(parent) = parent_dir(&self.path) {
            fs::create_dir_all(parent).map_err(|e| self.persistence(e))?;
        }

        let tmp = sibling(&self.path, ".tmp");
        write_synced(&tmp, &bytes).map_err(|e| self.persistence(e))?;
        self.refresh_backup().map_err(|e| self.persistence(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.persistence(e))?;
        if let Some(parent) = parent_dir(&self.path) {
            sync_dir(parent);
        }
        Ok(())
    }

    /// Copy the current primary into the backup slot, but only if it is a
    /// usable table; a corrupt primary must never replace a good backup.
    fn refresh_backup(&self) -> std::io::Result<()> {
        let current = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if let Err(reason) = parse_table(&current, Utc::now()) {
            warn!(
                path = %self.path.display(),
                %reason,
                "Not backing up unusable primary store"
            );
            return Ok(());
        }
        let tmp = sibling(&self.backup_path, ".tmp");
        write_synced(&tmp, &current)?;
        fs::rename(&tmp, &self.backup_path)
    }

    fn persistence(&self, source: std::io::Error) -> PipelineError {
        PipelineError::PersistenceFailure {
            path: self.path.clone(),
            source,
        }
    }
}

fn read_attempt(path: &Path) -> Attempt {
    match fs::read(path) {
        Ok(bytes) => match parse_table(&bytes, Utc::now()) {
            Ok((table, migrated_from)) => Attempt::Parsed(table, migrated_from),
            Err(reason) => Attempt::Bad(reason),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Attempt::Missing,
        Err(e) => Attempt::Bad(e.to_string()),
    }
}

/// Decode a stored table, migrating legacy layouts. `now` stamps records
/// whose legacy entry carried no timestamp.
pub fn parse_table(
    bytes: &[u8],
    now: DateTime<Utc>,
) -> std::result::Result<(PipelineTable, Option<u32>), String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "top level is not a JSON object".to_string())?;

    let version = match object.get("version") {
        Some(v) => {
            let v = v.as_u64().ok_or_else(|| "version is not an integer".to_string())?;
            u32::try_from(v).map_err(|_| format!("version {v} out of range"))?
        }
        None if object.contains_key("videos") => LEGACY_VIDEO_STATES,
        None if object.contains_key("processed_videos") => LEGACY_PROCESSED_LIST,
        None => return Err("no version tag and no recognised legacy layout".to_string()),
    };

    let (table, migrated_from) = match version {
        CURRENT_VERSION => {
            let table: PipelineTable =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            (table, None)
        }
        LEGACY_VIDEO_STATES => (migrate_video_states(object, now)?, Some(version)),
        LEGACY_PROCESSED_LIST => (migrate_processed_list(object, now)?, Some(version)),
        v if v > CURRENT_VERSION => {
            return Err(format!(
                "unsupported store version {v} (this build writes {CURRENT_VERSION})"
            ));
        }
        v => return Err(format!("unknown store version {v}")),
    };

    table.validate()?;
    Ok((table, migrated_from))
}

fn legacy_entries<'a>(
    object: &'a Map<String, Value>,
    key: &str,
) -> std::result::Result<&'a Map<String, Value>, String> {
    object
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| format!("legacy field '{key}' is not an object"))
}

/// Split a legacy entry into reserved and descriptive keys.
fn legacy_record(
    id: &str,
    state: ItemState,
    entry: &Map<String, Value>,
    timestamp_key: &str,
    now: DateTime<Utc>,
    version: u32,
) -> ItemRecord {
    let stamp = entry
        .get(timestamp_key)
        .and_then(Value::as_str)
        .and_then(normalize_stamp)
        .unwrap_or_else(|| now.to_rfc3339());

    let mut patch = StatePatch::new()
        .with(ReservedKey::DiscoveredAt, stamp.clone())
        .with(ReservedKey::StateChangedAt, stamp)
        .with(ReservedKey::MigratedFrom, version);

    for (key, value) in entry {
        if value.is_null() {
            continue;
        }
        patch = match key.as_str() {
            "state" | "updated_at" | "processed_at" => patch,
            "local_path" => patch.with(ReservedKey::ArtifactPath, value.clone()),
            "transcript_path" => patch.with(ReservedKey::TranscriptPath, value.clone()),
            "error" => patch.with(ReservedKey::FailureReason, value.clone()),
            _ => patch.describe(key.clone(), value.clone()),
        };
    }

    let mut record = ItemRecord {
        id: id.to_string(),
        state,
        metadata: Metadata::new(),
        history: Vec::new(),
        retry_count: 0,
    };
    if state == ItemState::Failed {
        // Transcription was the only stage that recorded failures in this layout.
        record.retry_count = 1;
        patch = patch.with(ReservedKey::FailedFrom, ItemState::Transcribing.as_str());
    }
    patch.merge_into(&mut record.metadata);
    record
}

/// Legacy timestamps are naive local ISO strings; store them as RFC 3339.
fn normalize_stamp(raw: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).to_rfc3339());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc().to_rfc3339())
}

fn migrate_video_states(
    object: &Map<String, Value>,
    now: DateTime<Utc>,
) -> std::result::Result<PipelineTable, String> {
    let mut table = PipelineTable::default();
    for (id, entry) in legacy_entries(object, "videos")? {
        let entry = entry
            .as_object()
            .ok_or_else(|| format!("legacy entry {id} is not an object"))?;
        let state: ItemState = entry
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("legacy entry {id} has no state"))?
            .parse()
            .map_err(|e| format!("legacy entry {id}: {e}"))?;
        let record = legacy_record(id, state, entry, "updated_at", now, LEGACY_VIDEO_STATES);
        table.items.insert(id.clone(), record);
    }
    Ok(table)
}

fn migrate_processed_list(
    object: &Map<String, Value>,
    now: DateTime<Utc>,
) -> std::result::Result<PipelineTable, String> {
    let mut table = PipelineTable::default();
    for (id, entry) in legacy_entries(object, "processed_videos")? {
        let entry = entry
            .as_object()
            .ok_or_else(|| format!("legacy entry {id} is not an object"))?;
        let has_transcript = entry.get("transcript_path").is_some_and(|v| !v.is_null());
        let state = if has_transcript {
            ItemState::Transcribed
        } else {
            ItemState::Downloaded
        };
        let record = legacy_record(id, state, entry, "processed_at", now, LEGACY_PROCESSED_LIST);
        table.items.insert(id.clone(), record);
    }
    Ok(table)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Make a rename durable. Not every platform allows opening a directory.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir)
        && let Err(e) = handle.sync_all()
    {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}
