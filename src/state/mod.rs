//! State machine module for the assistant's conversational flow
//!
//! Provides an explicit state controller with six states:
//! - Idle: Default state, waiting for the user
//! - Listening: Capturing speech, falls back to Idle after a window
//! - Processing: Waiting for a response, falls back to Error after a window
//! - Speaking: Playing back the response
//! - Error: Recovering with exponential backoff
//! - ConfirmingOrder: Waiting for the user to confirm an order

pub mod context;
mod error;
mod handle;
mod history;
mod machine;
mod retry;
mod table;
mod timers;

pub use context::Context;
pub use handle::{ControllerHandle, HandleError};
pub use history::Transition;
pub use machine::{ControllerStatus, State, StateController};
pub use retry::RetryPolicy;
pub use table::{Event, TransitionTable};
