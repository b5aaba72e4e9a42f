use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::op::Operation;
use crate::protocol::ServerMessage;
use crate::scene::{FilesMeta, SceneState};

pub type SubscriberId = Uuid;

/// Egress handle for one subscriber. Sends never block; a dropped receiver
/// marks the subscriber dead and it is removed on the next delivery attempt.
pub type SubscriberTx = UnboundedSender<ServerMessage>;

/// Live state of one canvas session. Only ever touched behind the session's
/// lock, so the broadcast order seen by every subscriber matches the order
/// operations were applied.
pub struct Session {
    pub id: String,
    pub scene: SceneState,
    pub files: FilesMeta,
    /// Bumped once per accepted mutation; stale inbound updates are rejected
    /// against it.
    pub version: u64,
    pub last_snapshot_at: Instant,
    subscribers: HashMap<SubscriberId, SubscriberTx>,
    /// Debounced subscriber edit not yet in the log.
    pub pending_update: Option<Operation>,
    pub debounce_handle: Option<JoinHandle<()>>,
    pub debounce_generation: u64,
    /// Operations whose log append failed; retried in front of the next one.
    pub unflushed: Vec<Operation>,
}

impl Session {
    pub fn new(id: String, scene: SceneState, files: FilesMeta, version: u64) -> Self {
        Self {
            id,
            scene,
            files,
            version,
            last_snapshot_at: Instant::now(),
            subscribers: HashMap::new(),
            pending_update: None,
            debounce_handle: None,
            debounce_generation: 0,
            unflushed: Vec::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn attach(&mut self, tx: SubscriberTx) -> SubscriberId {
        let subscriber_id = Uuid::new_v4();
        self.subscribers.insert(subscriber_id, tx);
        subscriber_id
    }

    pub fn detach(&mut self, subscriber_id: &SubscriberId) -> bool {
        self.subscribers.remove(subscriber_id).is_some()
    }

    /// Delivers to a single subscriber, dropping it on a dead channel.
    pub fn send_to(&mut self, subscriber_id: &SubscriberId, message: ServerMessage) {
        if let Some(tx) = self.subscribers.get(subscriber_id) {
            if tx.send(message).is_err() {
                debug!(session = %self.id, subscriber = %subscriber_id, "dropping closed subscriber");
                self.subscribers.remove(subscriber_id);
            }
        }
    }

    pub fn broadcast(&mut self, message: ServerMessage) {
        self.broadcast_except(None, message);
    }

    /// Fan-out to every live subscriber except `skip` (the originator of a
    /// subscriber edit never hears its own update back).
    pub fn broadcast_except(&mut self, skip: Option<SubscriberId>, message: ServerMessage) {
        let mut dead = Vec::new();
        for (subscriber_id, tx) in &self.subscribers {
            if Some(*subscriber_id) == skip {
                continue;
            }
            if tx.send(message.clone()).is_err() {
                dead.push(*subscriber_id);
            }
        }
        for subscriber_id in dead {
            debug!(session = %self.id, subscriber = %subscriber_id, "dropping closed subscriber");
            self.subscribers.remove(&subscriber_id);
        }
    }

    /// Invalidates any armed debounce timer. The pending operation itself is
    /// left in place for the caller to flush or discard.
    pub fn cancel_debounce(&mut self) {
        self.debounce_generation += 1;
        if let Some(handle) = self.debounce_handle.take() {
            handle.abort();
        }
    }
}
