use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scene::{Element, FileMeta, FilesMeta, Viewport};

/// Why a full-replacement `elements` frame was sent, when it was anything
/// other than an ordinary mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementsSource {
    Restore,
    VersionCorrection,
}

/// Frames pushed to subscribers. One JSON object per text frame; within a
/// session they arrive in mutation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Elements {
        elements: Vec<Element>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_state: Option<Value>,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ElementsSource>,
    },
    Append {
        elements: Vec<Element>,
    },
    Viewport {
        viewport: Viewport,
    },
    Clear,
    FilesMeta {
        files: FilesMeta,
    },
    FileAdded {
        file: FileMeta,
    },
}

/// Frames accepted from subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Full-replacement proposal. Stale when `base_version` is present and
    /// behind the session; absent means the client opted out of conflict
    /// detection and the update is accepted unconditionally.
    Update {
        elements: Vec<Element>,
        #[serde(default)]
        base_version: Option<u64>,
    },
}
