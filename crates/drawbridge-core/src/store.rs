use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::op::Operation;
use crate::scene::{FilesMeta, SceneState};

/// Versioned snapshots kept per session; older ones are pruned oldest-first.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Description of one on-disk snapshot, current or versioned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Millisecond timestamp: the filename suffix for versioned snapshots,
    /// the file mtime for the current one.
    pub timestamp: i64,
    pub element_count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListing {
    pub current: Option<VersionInfo>,
    /// Newest first.
    pub versions: Vec<VersionInfo>,
}

/// Filesystem layout for one session under the data directory:
///
/// - `{id}.snapshot` — current compacted scene
/// - `{id}.snapshot-{millis}` — versioned snapshots preserved on overwrite
/// - `{id}.log` — newline-delimited operations applied after the snapshot
/// - `{id}.files` — file metadata map, persisted outside the operation log
///
/// All writes that replace a file go through a `.tmp` sibling and an atomic
/// rename, so a reader never observes a half-written snapshot.
#[derive(Debug, Clone)]
pub struct SessionStore {
    data_dir: PathBuf,
}

impl SessionStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{session_id}.snapshot"))
    }

    fn versioned_path(&self, session_id: &str, timestamp: i64) -> PathBuf {
        self.data_dir.join(format!("{session_id}.snapshot-{timestamp}"))
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{session_id}.log"))
    }

    fn files_meta_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(format!("{session_id}.files"))
    }

    /// Compacts a session: the existing current snapshot (if any) joins the
    /// version history, the scene becomes the new current snapshot, and the
    /// log is truncated.
    pub async fn write_snapshot(&self, session_id: &str, scene: &SceneState) -> Result<(), StoreError> {
        let current = self.snapshot_path(session_id);
        if path_exists(&current).await {
            let (_, versioned) = self.fresh_versioned_path(session_id).await;
            match fs::copy(&current, &versioned).await {
                Ok(_) => self.prune_versions(session_id).await,
                Err(err) => {
                    warn!(session = %session_id, %err, "failed to preserve versioned snapshot");
                }
            }
        }
        let encoded = serde_json::to_vec(scene)?;
        write_atomic(&current, encoded).await?;
        fs::write(self.log_path(session_id), b"").await?;
        Ok(())
    }

    /// Writes a scene straight into the version history without touching the
    /// current snapshot or the log.
    pub async fn write_versioned_snapshot(
        &self,
        session_id: &str,
        scene: &SceneState,
    ) -> Result<i64, StoreError> {
        let (timestamp, path) = self.fresh_versioned_path(session_id).await;
        let encoded = serde_json::to_vec(scene)?;
        write_atomic(&path, encoded).await?;
        self.prune_versions(session_id).await;
        Ok(timestamp)
    }

    /// Replaces the current snapshot with the given scene and truncates the
    /// log, without rotating the old snapshot into the version history.
    pub async fn install_snapshot(&self, session_id: &str, scene: &SceneState) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(scene)?;
        write_atomic(&self.snapshot_path(session_id), encoded).await?;
        fs::write(self.log_path(session_id), b"").await?;
        Ok(())
    }

    /// Appends operations to the session log, one JSON line per operation.
    pub async fn append_log(&self, session_id: &str, ops: &[Operation]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::new();
        for op in ops {
            serde_json::to_writer(&mut encoded, op)?;
            encoded.push(b'\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(session_id))
            .await?;
        file.write_all(&encoded).await?;
        Ok(())
    }

    /// Removes the newest log entry. Returns `false` when there is nothing to
    /// drop.
    pub async fn drop_last_log_entry(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.log_path(session_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let mut lines: Vec<&str> = contents.lines().filter(|line| !line.trim().is_empty()).collect();
        if lines.pop().is_none() {
            return Ok(false);
        }
        let mut remaining = lines.join("\n");
        if !remaining.is_empty() {
            remaining.push('\n');
        }
        write_atomic(&path, remaining.into_bytes()).await?;
        Ok(true)
    }

    /// Rebuilds a scene by decoding the current snapshot and replaying the
    /// log tail. Unreadable pieces are logged and skipped; a corrupt session
    /// loads with whatever remains. Returns the scene and the number of log
    /// entries replayed.
    pub async fn load_scene(&self, session_id: &str) -> (SceneState, u64) {
        let mut scene = SceneState::default();
        match fs::read(self.snapshot_path(session_id)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(decoded) => scene = decoded,
                Err(err) => warn!(session = %session_id, %err, "skipping unreadable snapshot"),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(session = %session_id, %err, "failed to read snapshot"),
        }

        let mut replayed = 0u64;
        match fs::read_to_string(self.log_path(session_id)).await {
            Ok(contents) => {
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Operation>(line) {
                        Ok(op) => {
                            scene.apply(&op);
                            replayed += 1;
                        }
                        Err(err) => warn!(session = %session_id, %err, "skipping unreadable log entry"),
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(session = %session_id, %err, "failed to read log"),
        }

        (scene, replayed)
    }

    /// Decodes one versioned snapshot; `None` when no file carries that
    /// timestamp.
    pub async fn read_versioned_snapshot(
        &self,
        session_id: &str,
        timestamp: i64,
    ) -> Result<Option<SceneState>, StoreError> {
        match fs::read(self.versioned_path(session_id, timestamp)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_versions(&self, session_id: &str) -> VersionListing {
        let mut listing = VersionListing::default();

        let current = self.snapshot_path(session_id);
        if let Ok(meta) = fs::metadata(&current).await {
            let timestamp = meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
                .map(|since| since.as_millis() as i64)
                .unwrap_or_default();
            listing.current = Some(VersionInfo {
                timestamp,
                element_count: self.snapshot_element_count(&current).await,
                size: meta.len(),
            });
        }

        for (timestamp, path) in self.versioned_entries(session_id).await {
            let size = fs::metadata(&path).await.map(|meta| meta.len()).unwrap_or(0);
            listing.versions.push(VersionInfo {
                timestamp,
                element_count: self.snapshot_element_count(&path).await,
                size,
            });
        }

        listing
    }

    /// Deletes versioned snapshots beyond [`HISTORY_LIMIT`], oldest first.
    pub async fn prune_versions(&self, session_id: &str) {
        for (_, path) in self.versioned_entries(session_id).await.into_iter().skip(HISTORY_LIMIT) {
            if let Err(err) = fs::remove_file(&path).await {
                warn!(session = %session_id, %err, "failed to prune versioned snapshot");
            }
        }
    }

    pub async fn write_files_meta(&self, session_id: &str, files: &FilesMeta) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(files)?;
        write_atomic(&self.files_meta_path(session_id), encoded).await
    }

    /// Tolerant read: a missing or corrupt files-meta file yields an empty map.
    pub async fn read_files_meta(&self, session_id: &str) -> FilesMeta {
        match fs::read(self.files_meta_path(session_id)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(files) => files,
                Err(err) => {
                    warn!(session = %session_id, %err, "skipping unreadable files-meta");
                    FilesMeta::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => FilesMeta::default(),
            Err(err) => {
                warn!(session = %session_id, %err, "failed to read files-meta");
                FilesMeta::default()
            }
        }
    }

    pub async fn delete_files_meta(&self, session_id: &str) {
        remove_quietly(session_id, &self.files_meta_path(session_id)).await;
    }

    /// Removes snapshot, log, and files-meta. Versioned snapshots stay.
    pub async fn delete_session_files(&self, session_id: &str) {
        remove_quietly(session_id, &self.snapshot_path(session_id)).await;
        remove_quietly(session_id, &self.log_path(session_id)).await;
        remove_quietly(session_id, &self.files_meta_path(session_id)).await;
    }

    /// Millisecond-stamped versioned path that does not collide with an
    /// existing file; two snapshots inside the same millisecond get
    /// consecutive stamps.
    async fn fresh_versioned_path(&self, session_id: &str) -> (i64, PathBuf) {
        let mut timestamp = Utc::now().timestamp_millis();
        loop {
            let path = self.versioned_path(session_id, timestamp);
            if !path_exists(&path).await {
                return (timestamp, path);
            }
            timestamp += 1;
        }
    }

    /// All versioned snapshots for a session, newest first.
    async fn versioned_entries(&self, session_id: &str) -> Vec<(i64, PathBuf)> {
        let prefix = format!("{session_id}.snapshot-");
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.data_dir).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(session = %session_id, %err, "failed to enumerate data directory");
                return entries;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Ok(timestamp) = rest.parse::<i64>() {
                    entries.push((timestamp, entry.path()));
                }
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries
    }

    async fn snapshot_element_count(&self, path: &Path) -> usize {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<SceneState>(&bytes)
                .map(|scene| scene.elements.len())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_quietly(session_id: &str, path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(session = %session_id, %err, "failed to remove session file"),
    }
}
