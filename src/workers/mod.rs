//! Worker adapters for speech recognition, responses and speech synthesis
//!
//! Workers are asynchronous producers outside the state controller. They
//! report results and failures as `WorkerSignal`s over a channel and are
//! started and stopped by the controller as their soliciting state is
//! entered and left. In-process and message-passing workers implement the
//! same trait.

mod console;
mod jobs;
mod remote;
mod speech_cache;

use serde::{Deserialize, Serialize};

use crate::state::{Context, State};

pub use console::ConsoleRecognizer;
pub use jobs::{EchoResponder, SimulatedSynthesizer};
pub use remote::RemoteWorker;

/// The role a worker plays in an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Speech to text
    Recognizer,
    /// Produces the reply to an utterance
    Responder,
    /// Text to speech
    Synthesizer,
}

impl WorkerKind {
    /// State in which this worker is expected to produce
    pub fn solicited_by(self) -> State {
        match self {
            WorkerKind::Recognizer => State::Listening,
            WorkerKind::Responder => State::Processing,
            WorkerKind::Synthesizer => State::Speaking,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Recognizer => write!(f, "recognizer"),
            WorkerKind::Responder => write!(f, "responder"),
            WorkerKind::Synthesizer => write!(f, "synthesizer"),
        }
    }
}

/// Results reported by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    /// The worker finished with a result
    Produced { source: WorkerKind, text: String },
    /// The worker failed
    Failed { source: WorkerKind, error: String },
}

impl WorkerSignal {
    pub fn source(&self) -> WorkerKind {
        match self {
            WorkerSignal::Produced { source, .. } | WorkerSignal::Failed { source, .. } => *source,
        }
    }
}

/// Contract between the controller and a worker
pub trait WorkerAdapter: Send {
    fn kind(&self) -> WorkerKind;

    /// Begin producing, reading any input from the context
    fn start(&mut self, context: &Context) -> Result<(), WorkerError>;

    /// Stop producing; results still in flight are discarded
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Errors raised while driving a worker
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("{0} worker is already running")]
    AlreadyRunning(WorkerKind),

    #[error("missing `{key}` in context for {kind} worker")]
    MissingInput { kind: WorkerKind, key: &'static str },

    #[error("{0} worker has shut down")]
    Disconnected(WorkerKind),

    #[error("failed to spawn {kind} worker thread: {reason}")]
    ThreadSpawn { kind: WorkerKind, reason: String },
}
