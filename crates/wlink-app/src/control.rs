//! Control and scene execution types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a control changes its attribute when tapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ControlKind {
    /// Flip a boolean. An absent value turns it on.
    Boolean,
    /// Step through a fixed list, wrapping around. An absent or unlisted
    /// value selects the first entry.
    Options(Vec<Value>),
}

/// A tappable control bound to one attribute of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSpec {
    pub control_id: String,
    pub attr_key: String,
    pub kind: ControlKind,
}

/// Value the attribute should take after one tap, given its `current` value.
///
/// `None` when there is nothing to write (an empty option list).
pub fn next_value(kind: &ControlKind, current: Option<&Value>) -> Option<Value> {
    match kind {
        ControlKind::Boolean => {
            let on = current.and_then(Value::as_bool).unwrap_or(false);
            Some(Value::Bool(!on))
        }
        ControlKind::Options(values) => {
            if values.is_empty() {
                return None;
            }
            let next = current
                .and_then(|current| values.iter().position(|v| v == current))
                .map(|index| (index + 1) % values.len())
                .unwrap_or(0);
            Some(values[next].clone())
        }
    }
}

/// Result of [`WidgetService::execute_control`](crate::WidgetService::execute_control).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The write went out and the new value was applied locally.
    Sent { value: Value },
    /// The device is offline or its partition is not known yet.
    Offline,
    /// The session refused the write, or there was no value to write.
    NotDelivered,
    /// A newer execution for the same control took over.
    Superseded,
}

/// Result of [`WidgetService::execute_scene`](crate::WidgetService::execute_scene).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SceneOutcome {
    Succeeded,
    Failed { reason: String },
    Superseded,
}
