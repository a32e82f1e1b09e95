//! Cloneable handle to a running state controller
//!
//! Collaborators never touch the controller directly. They queue commands
//! that the controller's run loop applies one at a time.

use tokio::sync::{mpsc, oneshot};

use crate::events::{Listener, Subscription};

use super::context::Context;
use super::error::TransitionError;
use super::history::Transition;
use super::machine::{ControllerStatus, State};
use super::table::Event;

/// Commands applied by the controller's run loop
pub enum ControlCommand {
    Transition {
        to: State,
        trigger: String,
        context: Context,
        reply: oneshot::Sender<Result<Transition, TransitionError>>,
    },
    Dispatch {
        event: Event,
        context: Context,
        reply: oneshot::Sender<Result<Transition, TransitionError>>,
    },
    Subscribe {
        listener: Listener,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        subscription: Subscription,
        reply: oneshot::Sender<bool>,
    },
    Pause,
    Resume,
    SetContext(Context),
    ClearContext,
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    History {
        reply: oneshot::Sender<Vec<Transition>>,
    },
}

/// Errors returned through a controller handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("state controller is not running")]
    Closed,

    #[error(transparent)]
    Rejected(#[from] TransitionError),
}

/// Handle passed to collaborators in place of a shared global
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    command_tx: mpsc::Sender<ControlCommand>,
}

impl ControllerHandle {
    /// Create a handle and the receiver the controller's run loop consumes
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ControlCommand>) {
        let (command_tx, command_rx) = mpsc::channel(buffer);
        (Self { command_tx }, command_rx)
    }

    pub async fn transition(
        &self,
        to: State,
        trigger: impl Into<String>,
        context: Context,
    ) -> Result<Transition, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Transition {
            to,
            trigger: trigger.into(),
            context,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| HandleError::Closed)??)
    }

    pub async fn dispatch(
        &self,
        event: Event,
        context: Context,
    ) -> Result<Transition, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Dispatch {
            event,
            context,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| HandleError::Closed)??)
    }

    /// Register a listener called from the run loop with every state event
    ///
    /// The listener runs on the controller task and must not block.
    pub async fn subscribe(&self, listener: Listener) -> Result<Subscription, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Subscribe { listener, reply })
            .await?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    /// Returns false if the subscription was already gone
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<bool, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Unsubscribe {
            subscription,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    pub async fn pause(&self) -> Result<(), HandleError> {
        self.send(ControlCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), HandleError> {
        self.send(ControlCommand::Resume).await
    }

    pub async fn set_context(&self, partial: Context) -> Result<(), HandleError> {
        self.send(ControlCommand::SetContext(partial)).await
    }

    pub async fn clear_context(&self) -> Result<(), HandleError> {
        self.send(ControlCommand::ClearContext).await
    }

    pub async fn status(&self) -> Result<ControllerStatus, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Status { reply }).await?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    /// Snapshot of the history log
    pub async fn history(&self) -> Result<Vec<Transition>, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::History { reply }).await?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    async fn send(&self, command: ControlCommand) -> Result<(), HandleError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| HandleError::Closed)
    }
}
