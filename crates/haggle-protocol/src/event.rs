//! Events pushed by the daemon to registered sessions.
//!
//! On the wire an event is a single JSON line:
//!
//! ```json
//! {"type":"event","session_id":3,"event":"neighbor_update","data":[{"name":"peer"}]}
//! ```
//!
//! The `type` marker distinguishes pushed events from JSON-RPC responses on
//! the same connection.

use crate::attribute::Attribute;
use crate::data_object::DataObject;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tag of an [`Event`]; handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Shutdown,
    NeighborUpdate,
    NewDataObject,
    InterestList,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Shutdown,
        EventKind::NeighborUpdate,
        EventKind::NewDataObject,
        EventKind::InterestList,
    ];

    /// Numeric event type used by legacy libhaggle applications.
    pub fn code(self) -> i32 {
        match self {
            EventKind::Shutdown => 0,
            EventKind::NeighborUpdate => 1,
            EventKind::NewDataObject => 2,
            EventKind::InterestList => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Shutdown => "shutdown",
            EventKind::NeighborUpdate => "neighbor_update",
            EventKind::NewDataObject => "new_data_object",
            EventKind::InterestList => "interest_list",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification delivered to the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// The daemon is going down; carries a reason code.
    Shutdown(i32),
    NeighborUpdate(Vec<Node>),
    NewDataObject(DataObject),
    #[serde(rename = "interest_list")]
    InterestListUpdate(Vec<Attribute>),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Shutdown(_) => EventKind::Shutdown,
            Event::NeighborUpdate(_) => EventKind::NeighborUpdate,
            Event::NewDataObject(_) => EventKind::NewDataObject,
            Event::InterestListUpdate(_) => EventKind::InterestList,
        }
    }

    /// Encode as a newline-terminated event message for `session_id`.
    pub fn to_json_line(&self, session_id: i32) -> Result<String, serde_json::Error> {
        let mut msg = serde_json::to_value(self)?;
        msg["type"] = Value::from("event");
        msg["session_id"] = Value::from(session_id);
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        Ok(line)
    }
}

/// True when a decoded message is a pushed event rather than a response.
pub fn is_event_message(msg: &Value) -> bool {
    msg.get("type").and_then(|t| t.as_str()) == Some("event")
}
