use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scene::{Element, SceneState, Viewport};

/// One logged mutation. Encoded as a single self-describing JSON line in the
/// session log; replaying the current snapshot plus every logged operation in
/// order reproduces the live scene.
///
/// `Set` and `Update` transform the scene identically; the distinct tags are
/// kept so the log records which surface an edit arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Set {
        elements: Vec<Element>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_state: Option<Value>,
    },
    Append {
        elements: Vec<Element>,
    },
    Update {
        elements: Vec<Element>,
    },
    Viewport {
        viewport: Viewport,
    },
    Clear,
}

impl SceneState {
    /// The single reducer used by both live mutation and replay-on-load.
    pub fn apply(&mut self, op: &Operation) {
        match op {
            Operation::Set { elements, app_state } => {
                self.elements = elements.clone();
                if let Some(app_state) = app_state {
                    self.app_state = Some(app_state.clone());
                }
            }
            Operation::Append { elements } => {
                self.elements.extend(elements.iter().cloned());
            }
            Operation::Update { elements } => {
                self.elements = elements.clone();
            }
            Operation::Viewport { viewport } => {
                self.viewport = Some(*viewport);
            }
            Operation::Clear => {
                self.elements.clear();
                self.app_state = None;
                self.viewport = None;
            }
        }
    }
}
