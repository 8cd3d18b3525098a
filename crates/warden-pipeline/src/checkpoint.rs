//! Durable, per-instance checkpoint persistence.
//!
//! Each workflow instance owns one current record at
//! `<location>/<instance_id>.json` plus an append-only transition log at
//! `<location>/<instance_id>.log.jsonl`. A new record is written to a
//! temporary file, synced, then renamed over the old one, so the previous
//! record stays readable until its replacement is durable.
//!
//! The location is resolved from an explicit [`LocationContext`]; nothing in
//! this module consults the process environment or working directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use warden_types::{CheckpointRecord, InstanceId, Node, Result, WardenError};

use crate::retry::{retry_transient, BackoffPolicy};

/// Directory, relative to a workspace root, holding that workspace's records.
pub const WORKSPACE_CHECKPOINT_DIR: &str = ".warden/checkpoints";

/// Inputs to checkpoint location resolution, gathered once by the caller.
#[derive(Debug, Clone, Default)]
pub struct LocationContext {
    /// Root of the enclosing repository or worktree, if one was found.
    pub workspace_root: Option<PathBuf>,
    /// Explicit location override. Blank values are ignored.
    pub override_dir: Option<String>,
    /// Used to expand a leading `~` in the override.
    pub home_dir: Option<PathBuf>,
}

impl LocationContext {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, dir: impl Into<String>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home_dir = home;
        self
    }
}

/// Resolve where checkpoints live.
///
/// Order: a non-blank override, then `<workspace_root>/.warden/checkpoints`,
/// otherwise an error. There is no shared fallback location.
pub fn resolve_location(ctx: &LocationContext) -> Result<PathBuf> {
    if let Some(raw) = ctx.override_dir.as_deref().map(str::trim) {
        if !raw.is_empty() {
            let expanded = expand_tilde(raw, ctx.home_dir.as_deref())?;
            if expanded.is_absolute() {
                return Ok(expanded);
            }
            return match &ctx.workspace_root {
                Some(root) => Ok(root.join(expanded)),
                None => Err(WardenError::LocationUnresolved(format!(
                    "checkpoint override '{raw}' is relative and no workspace root was found; \
                     pass an absolute --checkpoint-dir"
                ))),
            };
        }
    }
    match &ctx.workspace_root {
        Some(root) => Ok(root.join(WORKSPACE_CHECKPOINT_DIR)),
        None => Err(WardenError::LocationUnresolved(
            "no enclosing repository (no .git found in any parent directory) and no \
             checkpoint override; run inside a repository, pass --checkpoint-dir, or set \
             WARDEN_CHECKPOINT_DIR"
                .into(),
        )),
    }
}

/// Expand a leading `~` or `~/` against `home`.
pub fn expand_tilde(raw: &str, home: Option<&Path>) -> Result<PathBuf> {
    let rest = match raw.strip_prefix('~') {
        None => return Ok(PathBuf::from(raw)),
        Some(rest) => rest,
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        // `~user` forms are not supported.
        return Ok(PathBuf::from(raw));
    }
    let home = home.ok_or_else(|| {
        WardenError::LocationUnresolved(format!(
            "cannot expand '{raw}': no home directory is known"
        ))
    })?;
    Ok(home.join(rest.trim_start_matches('/')))
}

/// Walk up from `start` to the first directory containing a `.git` entry.
///
/// A `.git` directory marks a checkout; a `.git` file marks a linked
/// worktree. Each therefore resolves to its own root.
pub fn discover_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Acknowledgement of a save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveAck {
    pub path: PathBuf,
    /// `false` when an identical record was already current.
    pub written: bool,
    pub updated_at: DateTime<Utc>,
}

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub node: Node,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The latest record for `id`, if any.
    async fn load(&self, id: &InstanceId) -> Result<Option<CheckpointRecord>>;

    async fn save(&self, id: &InstanceId, node: Node, state: &serde_json::Value) -> Result<SaveAck>;

    /// Remove the current record. The transition log is kept.
    async fn clear(&self, id: &InstanceId) -> Result<()>;

    /// Where the current record for `id` lives.
    fn record_path(&self, id: &InstanceId) -> PathBuf;
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    backoff: BackoffPolicy,
    max_retries: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            backoff: BackoffPolicy::default(),
            max_retries: 3,
        }
    }

    /// Resolve the location from `ctx` and open a store there.
    pub fn resolve(ctx: &LocationContext) -> Result<Self> {
        Ok(Self::new(resolve_location(ctx)?))
    }

    pub fn with_retry(mut self, max_retries: usize, backoff: BackoffPolicy) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.log.jsonl"))
    }

    /// Read the transition log for `id`, oldest first.
    pub async fn history(&self, id: &InstanceId) -> Result<Vec<LogEntry>> {
        let path = self.log_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(&path, e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(WardenError::from))
            .collect()
    }

    async fn write_record(&self, record: &CheckpointRecord) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&record.instance_id);
        let tmp = self.dir.join(format!(
            ".{}.json.tmp-{}",
            record.instance_id,
            uuid::Uuid::new_v4()
        ));

        let json = serde_json::to_vec_pretty(record)?;
        let promote = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<_, WardenError>(())
        };
        if let Err(e) = promote.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        sync_dir(&self.dir).await;

        let entry = LogEntry {
            node: record.node,
            updated_at: record.updated_at,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&record.instance_id))
            .await?;
        log.write_all(&line).await?;
        log.sync_data().await?;
        Ok(path)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, id: &InstanceId) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error(&path, e)),
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| WardenError::CheckpointStore {
            path: path.display().to_string(),
            message: format!("unreadable checkpoint: {e}"),
        })?;
        Ok(Some(record))
    }

    async fn save(&self, id: &InstanceId, node: Node, state: &serde_json::Value) -> Result<SaveAck> {
        if let Some(current) = self.load(id).await? {
            if current.node == node && &current.state == state {
                tracing::debug!(instance = %id, node = %node, "Checkpoint unchanged");
                return Ok(SaveAck {
                    path: self.record_path(id),
                    written: false,
                    updated_at: current.updated_at,
                });
            }
        }

        let record = CheckpointRecord {
            instance_id: id.clone(),
            node,
            state: state.clone(),
            updated_at: Utc::now(),
        };
        let path = retry_transient(
            || self.write_record(&record),
            self.max_retries,
            &self.backoff,
            "checkpoint save",
        )
        .await
        .map_err(|e| match e {
            WardenError::Io(io) => store_error(&self.record_path(id), io),
            other => other,
        })?;

        tracing::debug!(instance = %id, node = %node, path = %path.display(), "Checkpoint saved");
        Ok(SaveAck {
            path,
            written: true,
            updated_at: record.updated_at,
        })
    }

    async fn clear(&self, id: &InstanceId) -> Result<()> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(instance = %id, path = %path.display(), "Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&path, e)),
        }
    }

    fn record_path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn store_error(path: &Path, e: std::io::Error) -> WardenError {
    WardenError::CheckpointStore {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Persist the rename itself. Best effort: not every platform allows
/// opening a directory for sync.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
