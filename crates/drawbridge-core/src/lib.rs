//! Session engine for a real-time collaborative drawing server.
//!
//! Producers push scene mutations over HTTP and collaborators edit the same
//! canvas over WebSocket; every participant joined to a session observes one
//! consistent stream of changes. Sessions are persisted as a current snapshot
//! plus an append-only operation log, with timestamped versioned snapshots
//! kept for time-travel recovery.

pub mod engine;
pub mod op;
pub mod protocol;
pub mod scene;
pub mod session;
pub mod store;

pub use engine::{
    Engine, EngineError, SessionOverview, EVICT_AFTER, SNAPSHOT_INTERVAL, UPDATE_DEBOUNCE,
};
pub use op::Operation;
pub use protocol::{ClientMessage, ElementsSource, ServerMessage};
pub use scene::{Element, FileMeta, FilesMeta, SceneState, Viewport};
pub use session::{Session, SubscriberId, SubscriberTx};
pub use store::{SessionStore, StoreError, VersionInfo, VersionListing, HISTORY_LIMIT};
