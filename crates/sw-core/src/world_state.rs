//! Environment snapshots
//!
//! A [`WorldState`] is an opaque picture of the external environment taken
//! around each step. Concrete field population belongs to the action provider;
//! this module only stores and compares snapshots.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A pointer or scroll position
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Snapshot of the observable environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Location identifier (URL, screen name, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Pointer/cursor coordinates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,

    /// Fingerprint of the visible content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<String>,

    /// Scroll offset
    #[serde(default)]
    pub scroll: Point,

    /// Viewport size
    #[serde(default)]
    pub viewport: Size,

    /// Index of the step this snapshot brackets
    #[serde(default)]
    pub step_index: usize,

    /// Action of the step this snapshot brackets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Provider-specific extras
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub metadata: IndexMap<String, Value>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            location: None,
            cursor: None,
            content_fingerprint: None,
            scroll: Point::default(),
            viewport: Size::default(),
            step_index: 0,
            action: None,
            metadata: IndexMap::new(),
        }
    }
}

impl WorldState {
    /// Create an empty snapshot stamped with the current time
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the location identifier
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the content fingerprint
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.content_fingerprint = Some(fingerprint.into());
        self
    }

    /// Set the cursor position
    pub fn with_cursor(mut self, x: f64, y: f64) -> Self {
        self.cursor = Some(Point::new(x, y));
        self
    }

    /// Set the scroll offset
    pub fn with_scroll(mut self, x: f64, y: f64) -> Self {
        self.scroll = Point::new(x, y);
        self
    }

    /// Set the viewport size
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = Size::new(width, height);
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Structural comparison against a later snapshot
    ///
    /// The timestamp is never reported as a change.
    pub fn diff(&self, other: &WorldState) -> StateDiff {
        let mut changes = Vec::new();

        let mut compare = |field: &str, before: Value, after: Value| {
            if before != after {
                changes.push(FieldChange {
                    field: field.to_string(),
                    before,
                    after,
                });
            }
        };

        compare("location", json(&self.location), json(&other.location));
        compare("cursor", json(&self.cursor), json(&other.cursor));
        compare(
            "content_fingerprint",
            json(&self.content_fingerprint),
            json(&other.content_fingerprint),
        );
        compare("scroll", json(&self.scroll), json(&other.scroll));
        compare("viewport", json(&self.viewport), json(&other.viewport));
        compare("step_index", json(&self.step_index), json(&other.step_index));
        compare("action", json(&self.action), json(&other.action));

        for (key, before) in &self.metadata {
            let after = other.metadata.get(key).cloned().unwrap_or(Value::Null);
            compare(&format!("metadata.{}", key), before.clone(), after);
        }
        for (key, after) in &other.metadata {
            if !self.metadata.contains_key(key) {
                compare(&format!("metadata.{}", key), Value::Null, after.clone());
            }
        }

        StateDiff { changes }
    }

    /// Whether two snapshots describe the same environment condition
    ///
    /// Step bookkeeping (`step_index`, `action`) and the timestamp are ignored.
    pub fn same_environment(&self, other: &WorldState) -> bool {
        self.diff(other)
            .changes
            .iter()
            .all(|c| c.field == "step_index" || c.field == "action")
    }
}

fn json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// A single changed field between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Change set between two snapshots
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDiff {
    pub changes: Vec<FieldChange>,
}

impl StateDiff {
    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Names of the changed fields
    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }

    /// Check whether a given field changed
    pub fn touches(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }
}
