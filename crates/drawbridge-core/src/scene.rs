use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One scene object. The server never validates element schemas; elements are
/// carried verbatim and only a handful of well-known keys are ever projected
/// out of them.
pub type Element = Value;

/// Mapping of file id to metadata for images embedded in a scene.
pub type FilesMeta = HashMap<String, FileMeta>;

/// Synthetic element kinds that are stripped from the stored scene and
/// reinterpreted as camera moves.
const SYNTHETIC_VIEWPORT_TYPES: [&str; 2] = ["cameraUpdate", "viewportUpdate"];

/// Camera rectangle describing what a client should frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_height")]
    pub height: f64,
}

fn default_width() -> f64 {
    800.0
}

fn default_height() -> f64 {
    600.0
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: default_width(),
            height: default_height(),
        }
    }
}

/// Metadata for a file uploaded alongside a scene. Opaque to the engine apart
/// from its id; persisted separately from the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: String,
    pub cdn_url: String,
    pub mime_type: String,
    pub created: i64,
}

/// The replayable portion of a session: exactly what a snapshot captures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

/// Typed projection of the `type` key out of an opaque element.
pub fn element_type(element: &Element) -> Option<&str> {
    element.get("type").and_then(Value::as_str)
}

fn projected_viewport(element: &Element) -> Viewport {
    let field = |key: &str, fallback: f64| element.get(key).and_then(Value::as_f64).unwrap_or(fallback);
    Viewport {
        x: field("x", 0.0),
        y: field("y", 0.0),
        width: field("width", default_width()),
        height: field("height", default_height()),
    }
}

/// Splits a payload into drawable elements and the trailing synthetic camera
/// move, if any. When a payload carries several synthetic entries the last one
/// wins; none of them ever reach the stored scene.
pub fn strip_synthetic_viewports(elements: Vec<Element>) -> (Vec<Element>, Option<Viewport>) {
    let mut drawn = Vec::with_capacity(elements.len());
    let mut viewport = None;
    for element in elements {
        match element_type(&element) {
            Some(kind) if SYNTHETIC_VIEWPORT_TYPES.contains(&kind) => {
                viewport = Some(projected_viewport(&element));
            }
            _ => drawn.push(element),
        }
    }
    (drawn, viewport)
}
