use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::op::Operation;
use crate::protocol::{ElementsSource, ServerMessage};
use crate::scene::{strip_synthetic_viewports, Element, FileMeta, FilesMeta, SceneState, Viewport};
use crate::session::{Session, SubscriberId, SubscriberTx};
use crate::store::{SessionStore, StoreError, VersionListing};

/// Sessions with elements older than this since their last compaction are
/// snapshotted by the periodic flusher.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);
/// Grace period between the last subscriber leaving and the session being
/// dropped from memory. Disk state survives eviction.
pub const EVICT_AFTER: Duration = Duration::from_secs(300);
/// Burst window for coalescing subscriber edits into one logged operation.
pub const UPDATE_DEBOUNCE: Duration = Duration::from_millis(500);

const SESSION_ID_MAX_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("nothing to undo")]
    EmptyLog,
    #[error("no versioned snapshot for timestamp {0}")]
    VersionNotFound(i64),
    #[error("invalid session id")]
    InvalidSessionId,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One row of the in-memory session listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverview {
    pub id: String,
    pub element_count: usize,
    pub client_count: usize,
}

struct EngineInner {
    store: SessionStore,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

/// The session engine: owns the session table and the data directory, applies
/// every mutation under the owning session's lock, and fans results out to
/// subscribers in the same order they were applied.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let store = SessionStore::open(data_dir).await?;
        let engine = Engine {
            inner: Arc::new(EngineInner {
                store,
                sessions: DashMap::new(),
            }),
        };
        engine.spawn_snapshot_flusher();
        Ok(engine)
    }

    /// Returns the session, lazily loading it from disk on first access.
    pub async fn session(&self, session_id: &str) -> Result<Arc<Mutex<Session>>, EngineError> {
        validate_session_id(session_id)?;
        if let Some(existing) = self.inner.sessions.get(session_id) {
            return Ok(existing.value().clone());
        }
        let (scene, replayed) = self.inner.store.load_scene(session_id).await;
        let files = self.inner.store.read_files_meta(session_id).await;
        let loaded = Arc::new(Mutex::new(Session::new(
            session_id.to_string(),
            scene,
            files,
            replayed,
        )));
        // A concurrent loader may have won the race; whichever landed first
        // is the session everyone shares.
        let entry = self
            .inner
            .sessions
            .entry(session_id.to_string())
            .or_insert(loaded);
        Ok(entry.value().clone())
    }

    /// Full replacement of the scene. Synthetic camera elements are stripped
    /// and the last one, if any, is applied as a trailing viewport change
    /// riding the same version increment.
    pub async fn set_elements(
        &self,
        session_id: &str,
        elements: Vec<Element>,
        app_state: Option<Value>,
    ) -> Result<(usize, usize), EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let (drawn, viewport) = strip_synthetic_viewports(elements);
        let set = Operation::Set {
            elements: drawn,
            app_state,
        };
        guard.scene.apply(&set);
        guard.version += 1;
        let mut ops = vec![set];

        let announce = ServerMessage::Elements {
            elements: guard.scene.elements.clone(),
            app_state: guard.scene.app_state.clone(),
            version: guard.version,
            source: None,
        };
        guard.broadcast(announce);

        if let Some(viewport) = viewport {
            let op = Operation::Viewport { viewport };
            guard.scene.apply(&op);
            ops.push(op);
            guard.broadcast(ServerMessage::Viewport { viewport });
        }

        self.append_ops(&mut guard, &ops).await;
        Ok((guard.scene.elements.len(), guard.subscriber_count()))
    }

    /// Concatenates elements at the top of the z-order. A payload that is
    /// entirely synthetic still moves the camera; a payload with nothing in
    /// it is a no-op and does not consume a version.
    pub async fn append_elements(
        &self,
        session_id: &str,
        elements: Vec<Element>,
    ) -> Result<usize, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let (drawn, viewport) = strip_synthetic_viewports(elements);
        if drawn.is_empty() && viewport.is_none() {
            return Ok(guard.scene.elements.len());
        }

        guard.version += 1;
        let mut ops = Vec::new();
        if !drawn.is_empty() {
            let op = Operation::Append {
                elements: drawn.clone(),
            };
            guard.scene.apply(&op);
            ops.push(op);
            guard.broadcast(ServerMessage::Append { elements: drawn });
        }
        if let Some(viewport) = viewport {
            let op = Operation::Viewport { viewport };
            guard.scene.apply(&op);
            ops.push(op);
            guard.broadcast(ServerMessage::Viewport { viewport });
        }

        self.append_ops(&mut guard, &ops).await;
        Ok(guard.scene.elements.len())
    }

    pub async fn set_viewport(
        &self,
        session_id: &str,
        viewport: Viewport,
    ) -> Result<Viewport, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let op = Operation::Viewport { viewport };
        guard.scene.apply(&op);
        guard.version += 1;
        guard.broadcast(ServerMessage::Viewport { viewport });
        self.append_ops(&mut guard, &[op]).await;
        Ok(viewport)
    }

    /// Resets the scene. A non-empty scene is compacted first so the
    /// overwritten drawing stays reachable through the version history.
    pub async fn clear(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        if !guard.scene.elements.is_empty() {
            self.snapshot_locked(&mut guard).await;
        }
        let op = Operation::Clear;
        guard.scene.apply(&op);
        guard.version += 1;
        guard.broadcast(ServerMessage::Clear);
        self.append_ops(&mut guard, &[op]).await;

        guard.files.clear();
        self.inner.store.delete_files_meta(&guard.id).await;
        Ok(())
    }

    /// Drops the newest logged operation and rebuilds the scene from the
    /// current snapshot plus the remaining log. Cannot cross a snapshot
    /// boundary: once the log is compacted away there is nothing to undo.
    pub async fn undo(&self, session_id: &str) -> Result<usize, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        self.flush_pending_locked(&mut guard).await;
        if !self.inner.store.drop_last_log_entry(&guard.id).await? {
            return Err(EngineError::EmptyLog);
        }

        let (scene, _) = self.inner.store.load_scene(&guard.id).await;
        guard.scene = scene;
        guard.version += 1;
        let announce = ServerMessage::Elements {
            elements: guard.scene.elements.clone(),
            app_state: guard.scene.app_state.clone(),
            version: guard.version,
            source: None,
        };
        guard.broadcast(announce);
        Ok(guard.scene.elements.len())
    }

    /// Installs a versioned snapshot as the live state. The pre-restore scene
    /// is preserved as a fresh versioned snapshot first, and the source file
    /// is copied, not consumed, so the restored-from version stays listed.
    pub async fn restore(&self, session_id: &str, timestamp: i64) -> Result<usize, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let Some(scene) = self
            .inner
            .store
            .read_versioned_snapshot(&guard.id, timestamp)
            .await?
        else {
            return Err(EngineError::VersionNotFound(timestamp));
        };

        self.inner
            .store
            .write_versioned_snapshot(&guard.id, &guard.scene)
            .await?;
        self.inner.store.install_snapshot(&guard.id, &scene).await?;

        guard.cancel_debounce();
        guard.pending_update = None;
        guard.unflushed.clear();
        guard.scene = scene;
        guard.version += 1;
        guard.last_snapshot_at = std::time::Instant::now();

        let announce = ServerMessage::Elements {
            elements: guard.scene.elements.clone(),
            app_state: guard.scene.app_state.clone(),
            version: guard.version,
            source: Some(ElementsSource::Restore),
        };
        guard.broadcast(announce);
        info!(session = %guard.id, timestamp, "restored versioned snapshot");
        Ok(guard.scene.elements.len())
    }

    /// Snapshot inventory for a session, straight off the disk; the session
    /// is not loaded into memory for this.
    pub async fn versions(&self, session_id: &str) -> Result<VersionListing, EngineError> {
        validate_session_id(session_id)?;
        Ok(self.inner.store.list_versions(session_id).await)
    }

    pub async fn scene(&self, session_id: &str) -> Result<SceneState, EngineError> {
        let session = self.session(session_id).await?;
        let guard = session.lock().await;
        Ok(guard.scene.clone())
    }

    pub async fn files(&self, session_id: &str) -> Result<FilesMeta, EngineError> {
        let session = self.session(session_id).await?;
        let guard = session.lock().await;
        Ok(guard.files.clone())
    }

    /// Registers metadata for a file the upload pipeline has already placed
    /// on the CDN, and announces it to subscribers.
    pub async fn add_file(
        &self,
        session_id: &str,
        file_id: String,
        cdn_url: String,
        mime_type: String,
    ) -> Result<usize, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let file = FileMeta {
            id: file_id.clone(),
            cdn_url,
            mime_type,
            created: Utc::now().timestamp_millis(),
        };
        guard.files.insert(file_id, file.clone());
        let files = guard.files.clone();
        if let Err(err) = self.inner.store.write_files_meta(&guard.id, &files).await {
            warn!(session = %guard.id, %err, "files-meta write failed");
        }
        guard.broadcast(ServerMessage::FileAdded { file });
        Ok(guard.files.len())
    }

    /// Attaches a subscriber and queues its initial state: the scene with the
    /// current version, the viewport if one is set, and file metadata if any
    /// exists. The initial frames ride the subscriber's own queue ahead of
    /// whatever is broadcast next.
    pub async fn subscribe(
        &self,
        session_id: &str,
        tx: SubscriberTx,
    ) -> Result<SubscriberId, EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        let subscriber_id = guard.attach(tx.clone());
        let initial = ServerMessage::Elements {
            elements: guard.scene.elements.clone(),
            app_state: guard.scene.app_state.clone(),
            version: guard.version,
            source: None,
        };
        let _ = tx.send(initial);
        if let Some(viewport) = guard.scene.viewport {
            let _ = tx.send(ServerMessage::Viewport { viewport });
        }
        if !guard.files.is_empty() {
            let _ = tx.send(ServerMessage::FilesMeta {
                files: guard.files.clone(),
            });
        }
        debug!(session = %guard.id, subscriber = %subscriber_id, "subscriber attached");
        Ok(subscriber_id)
    }

    /// Detaches a subscriber, flushing any debounced edit so nothing is lost,
    /// and arms idle eviction when the session just went quiet.
    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: SubscriberId) {
        let Some(session) = self
            .inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let mut guard = session.lock().await;
        guard.detach(&subscriber_id);
        self.flush_pending_locked(&mut guard).await;
        debug!(session = %guard.id, subscriber = %subscriber_id, "subscriber detached");
        if guard.subscriber_count() == 0 {
            drop(guard);
            self.schedule_eviction(session_id);
        }
    }

    /// A subscriber's full-replacement proposal. Stale proposals (base
    /// version behind the session) get a corrective frame back on their own
    /// connection and nothing else happens; accepted ones replace the scene,
    /// fan out to everyone except the originator, and are logged after the
    /// debounce window closes.
    pub async fn handle_update(
        &self,
        session_id: &str,
        from: SubscriberId,
        elements: Vec<Element>,
        base_version: Option<u64>,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;

        if let Some(base) = base_version {
            if base < guard.version {
                debug!(
                    session = %guard.id,
                    subscriber = %from,
                    base,
                    version = guard.version,
                    "rejecting stale update"
                );
                let correction = ServerMessage::Elements {
                    elements: guard.scene.elements.clone(),
                    app_state: guard.scene.app_state.clone(),
                    version: guard.version,
                    source: Some(ElementsSource::VersionCorrection),
                };
                guard.send_to(&from, correction);
                return Ok(());
            }
        }

        let op = Operation::Update { elements };
        guard.scene.apply(&op);
        guard.version += 1;
        guard.pending_update = Some(op);

        let announce = ServerMessage::Elements {
            elements: guard.scene.elements.clone(),
            app_state: None,
            version: guard.version,
            source: None,
        };
        guard.broadcast_except(Some(from), announce);

        self.arm_debounce(session.clone(), &mut guard);
        Ok(())
    }

    /// `(resident sessions, connected clients)`.
    pub async fn stats(&self) -> (usize, usize) {
        let sessions = self.collect_sessions();
        let mut clients = 0;
        for session in &sessions {
            clients += session.lock().await.subscriber_count();
        }
        (sessions.len(), clients)
    }

    pub async fn list_sessions(&self) -> Vec<SessionOverview> {
        let mut overview = Vec::new();
        for session in self.collect_sessions() {
            let guard = session.lock().await;
            overview.push(SessionOverview {
                id: guard.id.clone(),
                element_count: guard.scene.elements.len(),
                client_count: guard.subscriber_count(),
            });
        }
        overview
    }

    /// Best-effort compaction of every resident session with elements; used
    /// on shutdown. One session failing does not stop the rest.
    pub async fn flush_all(&self) {
        for session in self.collect_sessions() {
            let mut guard = session.lock().await;
            self.flush_pending_locked(&mut guard).await;
            if guard.scene.elements.is_empty() {
                continue;
            }
            self.snapshot_locked(&mut guard).await;
        }
    }

    /// One pass of the periodic snapshot policy.
    pub async fn flush_due_snapshots(&self) {
        for session in self.collect_sessions() {
            let mut guard = session.lock().await;
            if guard.scene.elements.is_empty() {
                continue;
            }
            if guard.last_snapshot_at.elapsed() < SNAPSHOT_INTERVAL {
                continue;
            }
            self.snapshot_locked(&mut guard).await;
        }
    }

    /// Never hold map guards across an await; lock sessions one at a time
    /// from a collected list of handles.
    fn collect_sessions(&self) -> Vec<Arc<Mutex<Session>>> {
        self.inner.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    fn spawn_snapshot_flusher(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.flush_due_snapshots().await;
            }
        });
    }

    fn schedule_eviction(&self, session_id: &str) {
        let engine = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(EVICT_AFTER).await;
            engine.evict_if_idle(&session_id).await;
        });
    }

    /// Drops the session from memory if it is still subscriber-less,
    /// compacting a non-empty scene first. Disk state is untouched either
    /// way, so the next access reloads it.
    async fn evict_if_idle(&self, session_id: &str) {
        let Some(session) = self
            .inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let mut guard = session.lock().await;
        if guard.subscriber_count() > 0 {
            return;
        }
        self.flush_pending_locked(&mut guard).await;
        if !guard.scene.elements.is_empty() {
            self.snapshot_locked(&mut guard).await;
        }
        self.inner.sessions.remove(session_id);
        debug!(session = %session_id, "evicted idle session");
    }

    /// Appends operations to the log with the retry buffer drained in front.
    /// On failure everything lands back in the buffer for the next mutation;
    /// the in-memory state and the broadcast already happened and stand.
    async fn append_ops(&self, guard: &mut Session, ops: &[Operation]) {
        let mut batch = std::mem::take(&mut guard.unflushed);
        batch.extend(ops.iter().cloned());
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.inner.store.append_log(&guard.id, &batch).await {
            warn!(session = %guard.id, %err, "log append failed; buffering for retry");
            guard.unflushed = batch;
        }
    }

    /// Forces a debounced subscriber edit (and any buffered retries) into the
    /// log right now.
    async fn flush_pending_locked(&self, guard: &mut Session) {
        guard.cancel_debounce();
        if let Some(op) = guard.pending_update.take() {
            self.append_ops(guard, &[op]).await;
        } else if !guard.unflushed.is_empty() {
            self.append_ops(guard, &[]).await;
        }
    }

    /// Compacts the live scene. On success the log is empty and pending work
    /// is absorbed by the snapshot; on failure everything is left as-is for
    /// the next attempt.
    async fn snapshot_locked(&self, guard: &mut Session) {
        match self.inner.store.write_snapshot(&guard.id, &guard.scene).await {
            Ok(()) => {
                guard.cancel_debounce();
                guard.pending_update = None;
                guard.unflushed.clear();
                guard.last_snapshot_at = std::time::Instant::now();
                debug!(session = %guard.id, elements = guard.scene.elements.len(), "snapshot written");
            }
            Err(err) => warn!(session = %guard.id, %err, "snapshot write failed"),
        }
    }

    /// Arms (or re-arms) the debounce timer for the pending update. The
    /// generation check makes a superseded timer a no-op even if it fires
    /// between cancellation and abort.
    fn arm_debounce(&self, session: Arc<Mutex<Session>>, guard: &mut Session) {
        guard.cancel_debounce();
        let generation = guard.debounce_generation;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(UPDATE_DEBOUNCE).await;
            let mut guard = session.lock().await;
            if guard.debounce_generation != generation {
                return;
            }
            guard.debounce_handle = None;
            if let Some(op) = guard.pending_update.take() {
                engine.append_ops(&mut guard, &[op]).await;
            }
        });
        guard.debounce_handle = Some(handle);
    }
}

fn validate_session_id(session_id: &str) -> Result<(), EngineError> {
    // Session ids become file names; anything that could escape the data
    // directory or collide with the suffix scheme is rejected up front.
    let acceptable = !session_id.is_empty()
        && session_id.len() <= SESSION_ID_MAX_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if acceptable {
        Ok(())
    } else {
        Err(EngineError::InvalidSessionId)
    }
}
