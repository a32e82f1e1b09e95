//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::state::{Context, ControllerStatus, Event, State, Transition};

/// Largest accepted message body
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

fn default_trigger() -> String {
    "ipc".to_string()
}

/// Requests from UI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Request the recent transition history
    GetHistory,

    /// Move directly to a state, merging `context` on success
    Transition {
        to: State,
        #[serde(default = "default_trigger")]
        trigger: String,
        #[serde(default)]
        context: Context,
    },

    /// Raise a named event
    Dispatch {
        event: Event,
        #[serde(default)]
        context: Context,
    },

    /// Only allow transitions to idle until resumed
    Pause,

    /// Lift the pause restriction
    Resume,

    /// Merge keys into the shared context
    SetContext { context: Context },

    /// Empty the shared context
    ClearContext,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state change notifications
    Subscribe,

    /// Stop receiving notifications
    Unsubscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Recent transitions, oldest first
    History { entries: Vec<Transition> },

    /// A requested transition succeeded
    Transitioned { transition: Transition },

    /// A requested transition was refused by the state controller
    Rejected { code: String, message: String },

    /// Command accepted
    Ok,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// State event occurred
    StateEvent { event: StateEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    /// State controller snapshot
    pub controller: ControllerStatus,
}

impl DaemonStatus {
    pub fn new(controller: ControllerStatus, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs,
            controller,
        }
    }
}
