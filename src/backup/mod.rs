//! Backup engine - whole-directory snapshots of the world data.
//!
//! The one rule here: never read the world directory while the server
//! process is writing it. Snapshots of a running server therefore stop
//! the server first, copy, then start it again (the child process is not
//! cooperating software, so exclusion is procedural, not lock-based).
//! A snapshot is copied into a staging directory and published with a
//! single rename, so a `complete` record is always self-consistent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::console::{LineSource, LogLevel};
use crate::instance::{ensure_dir, ServerInstance};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::state_machine::LifecycleState;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Published; contents are guaranteed self-consistent
    Complete,
    /// Snapshot was interrupted before publishing
    Partial,
    /// Snapshot errored out
    Failed,
}

/// Metadata for one snapshot, persisted as `<id>.json` next to the
/// snapshot directory. Never mutated after creation except the status
/// finalization at the end of the snapshot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Timestamp-derived, e.g. `world_20260808_031500`
    pub id: String,
    /// Snapshot directory
    pub path: PathBuf,
    pub size_bytes: u64,
    pub file_count: u64,
    /// SHA-256 over the sorted relative-path/content manifest
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub status: BackupStatus,
}

pub struct BackupEngine {
    instance: Arc<ServerInstance>,
    supervisor: Arc<Supervisor>,
}

impl BackupEngine {
    pub fn new(instance: Arc<ServerInstance>, supervisor: Arc<Supervisor>) -> Self {
        Self { instance, supervisor }
    }

    /// Snapshot the world directory. A running server is stopped for the
    /// duration of the copy and started again afterwards; a stopped
    /// server is snapshotted in place. Blocks the caller for the whole
    /// stop/copy/restart sequence.
    pub async fn snapshot(&self) -> Result<BackupRecord, SupervisorError> {
        let was_running = match self.supervisor.current_state() {
            LifecycleState::Running => {
                self.announce("Backup: stopping server for snapshot");
                self.supervisor.stop(None).await?;
                true
            }
            LifecycleState::Stopped => false,
            // Starting/Stopping/Crashed: let the lifecycle settle first
            _ => return Err(SupervisorError::TransitionInProgress),
        };

        let result = self.snapshot_stopped().await;

        if was_running {
            self.announce("Backup: restarting server");
            if let Err(e) = self.supervisor.start().await {
                // The snapshot itself still stands; the operator needs to
                // know the server did not come back.
                tracing::error!("Failed to restart server after backup: {}", e);
                self.announce(&format!("Backup: server restart failed: {}", e));
            }
        }

        match &result {
            Ok(record) => self.announce(&format!(
                "Backup complete: {} ({} files, {} bytes)",
                record.id, record.file_count, record.size_bytes
            )),
            Err(e) => self.announce(&format!("Backup failed: {}", e)),
        }
        result
    }

    /// Replace the world directory with a snapshot's contents. Refused
    /// unless the server is fully stopped. The current world is moved
    /// aside (`world_old_<ts>`), never deleted.
    pub async fn restore(&self, id: &str) -> Result<(), SupervisorError> {
        let state = self.supervisor.current_state();
        if state != LifecycleState::Stopped {
            return Err(SupervisorError::ServerRunning(state));
        }

        let record = self.load_record(id)?;
        if record.status != BackupStatus::Complete {
            return Err(SupervisorError::io(
                &record.path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("backup '{}' is {:?}, refusing to restore", id, record.status),
                ),
            ));
        }

        let world = self.instance.world_path();
        let world_dir_name = self.instance.world_dir_name.clone();
        let root = self.instance.root_dir.clone();
        let snapshot_path = record.path.clone();
        let expected_size = record.size_bytes;
        let expected_digest = record.digest.clone();

        tokio::task::spawn_blocking(move || -> Result<(), SupervisorError> {
            if !snapshot_path.is_dir() {
                return Err(SupervisorError::io(
                    &snapshot_path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "snapshot directory missing"),
                ));
            }
            if world.exists() {
                let ts = Local::now().format("%Y%m%d_%H%M%S");
                let aside = root.join(format!("{}_old_{}", world_dir_name, ts));
                std::fs::rename(&world, &aside).map_err(|e| SupervisorError::io(&world, e))?;
                tracing::info!("Moved current world aside to {}", aside.display());
            }
            copy_dir_recursive(&snapshot_path, &world)?;

            // Post-copy integrity check against the record
            let (size, _count, digest) = dir_manifest(&world)?;
            if size != expected_size || digest != expected_digest {
                return Err(SupervisorError::io(
                    &world,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "restored world failed the integrity check",
                    ),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            SupervisorError::io(self.instance.world_path(), std::io::Error::other(e))
        })??;

        self.announce(&format!("World restored from backup {}", id));
        Ok(())
    }

    /// All known records, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>, SupervisorError> {
        let backups = self.instance.backups_path();
        if !backups.is_dir() {
            return Ok(Vec::new());
        }
        let entries =
            std::fs::read_dir(&backups).map_err(|e| SupervisorError::io(&backups, e))?;
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match read_record_file(&path) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), e),
                }
            }
        }
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    /// Delete a snapshot and its record. Explicit operator action only;
    /// there is no automatic retention pruning.
    pub fn delete(&self, id: &str) -> Result<(), SupervisorError> {
        let record = self.load_record(id)?;
        if record.path.is_dir() {
            std::fs::remove_dir_all(&record.path)
                .map_err(|e| SupervisorError::io(&record.path, e))?;
        }
        let meta = self.record_path(id);
        std::fs::remove_file(&meta).map_err(|e| SupervisorError::io(&meta, e))?;
        tracing::info!("Deleted backup {}", id);
        Ok(())
    }

    pub fn load_record(&self, id: &str) -> Result<BackupRecord, SupervisorError> {
        read_record_file(&self.record_path(id))
    }

    // ── Internals ────────────────────────────────────────────

    async fn snapshot_stopped(&self) -> Result<BackupRecord, SupervisorError> {
        let instance = self.instance.clone();
        tokio::task::spawn_blocking(move || snapshot_blocking(&instance))
            .await
            .map_err(|e| {
                SupervisorError::io(self.instance.backups_path(), std::io::Error::other(e))
            })?
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.instance.backups_path().join(format!("{}.json", id))
    }

    fn announce(&self, msg: &str) {
        tracing::info!("{}", msg);
        self.supervisor
            .console_bus()
            .append(LineSource::System, msg.to_string(), LogLevel::Info);
    }
}

/// The copy itself, run on the blocking pool. The record's metadata file
/// is written with status `partial` up front and finalized to `complete`
/// or `failed`, so an interrupted snapshot is recognizable later.
fn snapshot_blocking(instance: &ServerInstance) -> Result<BackupRecord, SupervisorError> {
    let world = instance.world_path();
    if !world.is_dir() {
        return Err(SupervisorError::io(
            &world,
            std::io::Error::new(std::io::ErrorKind::NotFound, "world directory not found"),
        ));
    }
    let backups = instance.backups_path();
    ensure_dir(&backups)?;

    let id = unique_backup_id(&backups);
    let final_path = backups.join(&id);
    let meta_path = backups.join(format!("{}.json", id));

    let mut record = BackupRecord {
        id: id.clone(),
        path: final_path.clone(),
        size_bytes: 0,
        file_count: 0,
        digest: String::new(),
        created_at: Utc::now(),
        status: BackupStatus::Partial,
    };
    write_record_file(&meta_path, &record)?;

    let outcome = (|| -> Result<(u64, u64, String), SupervisorError> {
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&backups)
            .map_err(|e| SupervisorError::io(&backups, e))?;
        copy_dir_recursive(&world, staging.path())?;
        let manifest = dir_manifest(staging.path())?;
        // Publish atomically: disable cleanup, then a single rename
        let staged = staging.into_path();
        std::fs::rename(&staged, &final_path).map_err(|e| {
            let _ = std::fs::remove_dir_all(&staged);
            SupervisorError::io(&final_path, e)
        })?;
        Ok(manifest)
    })();

    match outcome {
        Ok((size_bytes, file_count, digest)) => {
            record.size_bytes = size_bytes;
            record.file_count = file_count;
            record.digest = digest;
            record.status = BackupStatus::Complete;
            write_record_file(&meta_path, &record)?;
            tracing::info!("Published backup {} ({} bytes)", record.id, size_bytes);
            Ok(record)
        }
        Err(e) => {
            record.status = BackupStatus::Failed;
            if let Err(we) = write_record_file(&meta_path, &record) {
                tracing::warn!("Could not finalize failed record {}: {}", record.id, we);
            }
            Err(e)
        }
    }
}

/// `world_<ts>`, with a numeric suffix when two snapshots land in the
/// same second.
fn unique_backup_id(backups: &Path) -> String {
    let base = format!("world_{}", Local::now().format("%Y%m%d_%H%M%S"));
    let mut id = base.clone();
    let mut n = 1;
    while backups.join(format!("{}.json", id)).exists() {
        id = format!("{}_{}", base, n);
        n += 1;
    }
    id
}

fn read_record_file(path: &Path) -> Result<BackupRecord, SupervisorError> {
    let content = std::fs::read_to_string(path).map_err(|e| SupervisorError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| {
        SupervisorError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

fn write_record_file(path: &Path, record: &BackupRecord) -> Result<(), SupervisorError> {
    let content = serde_json::to_string_pretty(record).map_err(|e| {
        SupervisorError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    std::fs::write(path, content).map_err(|e| SupervisorError::io(path, e))
}

/// Plain recursive copy; symlinks are not followed (worlds do not
/// contain them, and following links out of the tree would be worse).
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), SupervisorError> {
    ensure_dir(dst)?;
    let entries = std::fs::read_dir(src).map_err(|e| SupervisorError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SupervisorError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ftype = entry.file_type().map_err(|e| SupervisorError::io(&from, e))?;
        if ftype.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if ftype.is_file() {
            std::fs::copy(&from, &to).map_err(|e| SupervisorError::io(&from, e))?;
        } else {
            tracing::warn!("Skipping non-regular file {}", from.display());
        }
    }
    Ok(())
}

/// Walk a tree in sorted order and produce (total size, file count,
/// SHA-256 digest over relative paths and contents). Two trees with the
/// same manifest have identical contents.
fn dir_manifest(root: &Path) -> Result<(u64, u64, String), SupervisorError> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    let mut total = 0u64;
    for rel in &files {
        let path = root.join(rel);
        let content = std::fs::read(&path).map_err(|e| SupervisorError::io(&path, e))?;
        total += content.len() as u64;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok((total, files.len() as u64, digest))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SupervisorError> {
    let entries = std::fs::read_dir(dir).map_err(|e| SupervisorError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SupervisorError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| {
                    SupervisorError::io(&path, std::io::Error::other(e))
                })?
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────
