//! Core state controller implementation
//!
//! The controller is the only component allowed to change what Alicia is
//! doing. Every request, whether a direct target, a named event, a worker
//! signal or an expired timer, goes through the same validation against the
//! transition table before the state is swapped.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::events::{timestamp_ms, ListenerSet, StateEvent, Subscription};
use crate::workers::{WorkerAdapter, WorkerKind, WorkerSignal};

use super::context::{self, keys, Context};
use super::error::TransitionError;
use super::handle::ControlCommand;
use super::history::{History, Transition};
use super::retry::{RetryDecision, RetryPolicy};
use super::table::{Event, TransitionTable};
use super::timers::{TimerEntry, TimerKind, TimerRegistry};

/// What the assistant is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for the user
    Idle,
    /// Capturing speech
    Listening,
    /// Waiting for a response to the utterance
    Processing,
    /// Playing back the response
    Speaking,
    /// Something failed; recovery is pending
    Error,
    /// Waiting for the user to confirm an order
    ConfirmingOrder,
}

impl State {
    pub const ALL: [State; 6] = [
        State::Idle,
        State::Listening,
        State::Processing,
        State::Speaking,
        State::Error,
        State::ConfirmingOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Listening => "listening",
            State::Processing => "processing",
            State::Speaking => "speaking",
            State::Error => "error",
            State::ConfirmingOrder => "confirming_order",
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the controller for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub state: State,
    pub initialized: bool,
    pub paused: bool,
    pub retry_count: u32,
    pub pending_timers: usize,
    /// Events that resolve from the current state
    pub events: Vec<Event>,
    pub context: Context,
}

/// The state controller
pub struct StateController {
    config: ControllerConfig,
    table: TransitionTable,
    retry_policy: RetryPolicy,
    /// Current state
    state: State,
    /// Incremented on every successful transition
    visit: u64,
    initialized: bool,
    paused: bool,
    retries: u32,
    context: Context,
    history: History,
    timers: TimerRegistry,
    listeners: ListenerSet,
    workers: Vec<Box<dyn WorkerAdapter>>,
    /// Channel for broadcasting state events to async consumers
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateController {
    /// Create a controller in `idle`, driven by a validated table
    pub fn new(
        config: ControllerConfig,
        table: TransitionTable,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Self {
        Self {
            retry_policy: config.retry_policy(),
            history: History::new(config.history_limit),
            config,
            table,
            state: State::Idle,
            visit: 0,
            initialized: false,
            paused: false,
            retries: 0,
            context: Context::new(),
            timers: TimerRegistry::new(),
            listeners: ListenerSet::new(),
            workers: Vec::new(),
            event_tx,
        }
    }

    /// Mark the controller ready and announce the initial state
    ///
    /// Calling this more than once is a logged no-op.
    pub fn initialize(&mut self) {
        if self.initialized {
            warn!(state = %self.state, "controller already initialized, ignoring");
            return;
        }

        self.initialized = true;
        info!(state = %self.state, "state controller initialized");
        self.notify(StateEvent::Initialized {
            state: self.state,
            timestamp: timestamp_ms(),
        });
    }

    /// Get the current state
    pub fn current_state(&self) -> State {
        self.state
    }

    /// Copy of the recent transitions, oldest first
    pub fn history(&self) -> Vec<Transition> {
        self.history.snapshot()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: self.state,
            initialized: self.initialized,
            paused: self.paused,
            retry_count: self.retries,
            pending_timers: self.timers.len(),
            events: self.table.events_from(self.state),
            context: self.context.clone(),
        }
    }

    /// Register a listener invoked synchronously with every state event
    pub fn subscribe<F>(&mut self, listener: F) -> Subscription
    where
        F: FnMut(&StateEvent) + Send + 'static,
    {
        let subscription = self.listeners.add(Box::new(listener));
        debug!(?subscription, listeners = self.listeners.len(), "listener added");
        subscription
    }

    /// Returns false if the listener was not registered
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let removed = self.listeners.remove(subscription);
        if removed {
            debug!(?subscription, "listener removed");
        }
        removed
    }

    /// Attach a worker that is started and stopped with its soliciting state
    pub fn attach_worker(&mut self, worker: Box<dyn WorkerAdapter>) {
        info!(kind = %worker.kind(), "worker attached");
        self.workers.push(worker);
    }

    /// Only transitions to idle are accepted while paused
    pub fn pause(&mut self) {
        if self.paused {
            debug!("controller already paused");
            return;
        }
        self.paused = true;
        info!(state = %self.state, "controller paused");
    }

    pub fn resume(&mut self) {
        if !self.paused {
            debug!("controller not paused");
            return;
        }
        self.paused = false;
        info!(state = %self.state, "controller resumed");
    }

    /// Shallow-merge into the context
    pub fn set_context(&mut self, partial: Context) {
        context::merge(&mut self.context, partial);
    }

    pub fn clear_context(&mut self) {
        self.context.clear();
    }

    /// Move directly to `target`, merging `patch` into the context on success
    pub fn request_transition(
        &mut self,
        target: State,
        trigger: impl Into<String>,
        patch: Context,
    ) -> Result<Transition, TransitionError> {
        self.perform(target, trigger.into(), patch, None)
    }

    /// Raise a named event, merging `patch` into the context on success
    pub fn dispatch(
        &mut self,
        event: Event,
        patch: Context,
    ) -> Result<Transition, TransitionError> {
        let from = self.state;
        if !self.initialized {
            let err = TransitionError::NotInitialized { from };
            self.reject(&err, None, Some(event), event.as_str(), patch);
            return Err(err);
        }

        match self.table.resolve(from, event) {
            Some(target) => self.perform(target, event.as_str().to_string(), patch, Some(event)),
            None => {
                let err = TransitionError::UnknownEvent { from, event };
                self.reject(&err, None, Some(event), event.as_str(), patch);
                Err(err)
            }
        }
    }

    /// Route a worker result or failure into the state machine
    ///
    /// Signals from a worker whose soliciting state is no longer current are
    /// dropped.
    pub fn handle_signal(
        &mut self,
        signal: WorkerSignal,
    ) -> Option<Result<Transition, TransitionError>> {
        let source = signal.source();
        if self.state != source.solicited_by() {
            debug!(
                %source,
                state = %self.state,
                "dropping stale worker signal"
            );
            return None;
        }

        let (event, patch) = match signal {
            WorkerSignal::Produced {
                source: WorkerKind::Recognizer,
                text,
            } => (Event::UserInput, context::from_pairs([(keys::USER_UTTERANCE, text)])),
            WorkerSignal::Produced {
                source: WorkerKind::Responder,
                text,
            } => (Event::ResponseReady, context::from_pairs([(keys::AI_RESPONSE, text)])),
            WorkerSignal::Produced {
                source: WorkerKind::Synthesizer,
                ..
            } => (Event::SpeakingComplete, Context::new()),
            WorkerSignal::Failed { source, error } => {
                warn!(%source, %error, "worker reported failure");
                (
                    Event::Failure,
                    context::from_pairs([
                        (keys::SOURCE, source.to_string()),
                        (keys::ERROR, error),
                    ]),
                )
            }
        };

        Some(self.dispatch(event, patch))
    }

    /// Fire every timer whose deadline has passed, returning how many acted
    pub fn fire_due_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;

        while let Some(entry) = self.timers.take_due(now) {
            if !entry.is_current(self.state, self.visit) {
                debug!(
                    armed_in = %entry.armed_in,
                    state = %self.state,
                    "discarding stale timer"
                );
                continue;
            }

            fired += 1;
            info!(
                armed_in = %entry.armed_in,
                fallback = %entry.fallback,
                kind = ?entry.kind,
                "timer expired"
            );
            // Rejections are reported through the usual notification
            let _ = self.perform(
                entry.fallback,
                entry.kind.trigger().to_string(),
                entry.context,
                None,
            );
        }

        fired
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run the controller, processing worker signals, control commands and timers
    ///
    /// Returns once the command channel is closed.
    pub async fn run(
        &mut self,
        mut signal_rx: mpsc::Receiver<WorkerSignal>,
        mut command_rx: mpsc::Receiver<ControlCommand>,
    ) {
        info!(state = %self.state, "state controller running");
        let mut signals_open = true;

        loop {
            let deadline = self.timers.next_deadline();

            tokio::select! {
                signal = signal_rx.recv(), if signals_open => match signal {
                    Some(signal) => {
                        let _ = self.handle_signal(signal);
                    }
                    None => {
                        debug!("worker signal channel closed");
                        signals_open = false;
                    }
                },

                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = sleep_until(deadline) => {
                    self.fire_due_timers();
                }
            }
        }

        self.stop_workers();
        info!(state = %self.state, "state controller stopped");
    }

    /// Apply a command received through a `ControllerHandle`
    pub fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Transition {
                to,
                trigger,
                context,
                reply,
            } => {
                let _ = reply.send(self.request_transition(to, trigger, context));
            }
            ControlCommand::Dispatch {
                event,
                context,
                reply,
            } => {
                let _ = reply.send(self.dispatch(event, context));
            }
            ControlCommand::Subscribe { listener, reply } => {
                let _ = reply.send(self.subscribe(listener));
            }
            ControlCommand::Unsubscribe {
                subscription,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(subscription));
            }
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::SetContext(partial) => self.set_context(partial),
            ControlCommand::ClearContext => self.clear_context(),
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlCommand::History { reply } => {
                let _ = reply.send(self.history());
            }
        }
    }

    /// Stop every active worker
    pub fn stop_workers(&mut self) {
        for worker in self.workers.iter_mut().filter(|w| w.is_active()) {
            debug!(kind = %worker.kind(), "stopping worker");
            worker.stop();
        }
    }

    fn validate(&self, target: State) -> Result<(), TransitionError> {
        let from = self.state;

        if !self.initialized {
            return Err(TransitionError::NotInitialized { from });
        }
        if target == from {
            return Err(TransitionError::SameState { state: from });
        }
        if self.paused {
            if target == State::Idle {
                return Ok(());
            }
            return Err(TransitionError::Paused {
                from,
                attempted: target,
            });
        }
        if !self.table.allows(from, target) {
            return Err(TransitionError::NotAllowed { from, to: target });
        }
        Ok(())
    }

    /// Perform a validated transition
    fn perform(
        &mut self,
        target: State,
        trigger: String,
        patch: Context,
        event: Option<Event>,
    ) -> Result<Transition, TransitionError> {
        if let Err(err) = self.validate(target) {
            self.reject(&err, Some(target), event, &trigger, patch);
            return Err(err);
        }

        let from = self.state;
        let transition = Transition {
            from,
            to: target,
            trigger,
            timestamp: timestamp_ms(),
        };

        info!(
            from = %from,
            to = %target,
            trigger = %transition.trigger,
            "state transition"
        );

        // Swap
        self.state = target;
        self.visit += 1;
        context::strip_transient(&mut self.context);
        context::merge(&mut self.context, patch);
        self.history.record(transition.clone());

        self.notify(StateEvent::Transition(transition.clone()));

        self.on_exit(from);
        self.on_enter(target);

        Ok(transition)
    }

    fn reject(
        &mut self,
        err: &TransitionError,
        attempted: Option<State>,
        event: Option<Event>,
        trigger: &str,
        patch: Context,
    ) {
        warn!(
            from = %self.state,
            attempted = ?attempted,
            event = ?event,
            reason = err.code(),
            "transition rejected: {}",
            err
        );

        self.notify(StateEvent::TransitionError {
            from: self.state,
            attempted,
            event,
            trigger: trigger.to_string(),
            reason: err.code().to_string(),
            context: patch,
            timestamp: timestamp_ms(),
        });
    }

    fn notify(&mut self, event: StateEvent) {
        self.listeners.notify(&event);
        // No receivers is not an error
        let _ = self.event_tx.send(event);
    }

    fn on_exit(&mut self, state: State) {
        for worker in self
            .workers
            .iter_mut()
            .filter(|w| w.kind().solicited_by() == state && w.is_active())
        {
            debug!(kind = %worker.kind(), "stopping worker on exit from {}", state);
            worker.stop();
        }
    }

    fn on_enter(&mut self, state: State) {
        match state {
            State::Listening => self.arm_timeout(
                state,
                self.config.listening_timeout,
                State::Idle,
                keys::NO_SPEECH,
            ),
            State::Processing => self.arm_timeout(
                state,
                self.config.processing_timeout,
                State::Error,
                keys::TIMEOUT,
            ),
            State::Speaking => {
                if self.retries > 0 {
                    debug!(retries = self.retries, "exchange completed, resetting retries");
                    self.retries = 0;
                }
            }
            State::Error => self.schedule_retry(),
            State::Idle | State::ConfirmingOrder => {}
        }

        // The retry policy may already have moved on
        if self.state == state {
            self.start_workers(state);
        }
    }

    fn arm_timeout(
        &mut self,
        state: State,
        after: std::time::Duration,
        fallback: State,
        marker: &'static str,
    ) {
        let entry = TimerEntry {
            armed_in: state,
            visit: self.visit,
            deadline: Instant::now() + after,
            fallback,
            context: context::from_pairs([(marker, true)]),
            kind: TimerKind::Timeout,
        };
        debug!(%state, %fallback, after_ms = after.as_millis() as u64, "timeout armed");
        self.timers.arm(entry);
    }

    fn schedule_retry(&mut self) {
        match self.retry_policy.decide(self.retries) {
            RetryDecision::Retry { attempt, delay } => {
                self.retries = attempt;
                let recover_to = context::recovery_target(&self.context);
                info!(
                    attempt,
                    max = self.retry_policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %recover_to,
                    "retry scheduled"
                );
                self.timers.arm(TimerEntry {
                    armed_in: State::Error,
                    visit: self.visit,
                    deadline: Instant::now() + delay,
                    fallback: recover_to,
                    context: context::from_pairs([(keys::IS_RETRY, true)]),
                    kind: TimerKind::Retry { attempt },
                });
            }
            RetryDecision::GiveUp => {
                warn!(
                    max = self.retry_policy.max_retries,
                    "retries exhausted, returning to idle"
                );
                self.retries = 0;
                let _ = self.perform(
                    State::Idle,
                    "retries_exhausted".to_string(),
                    context::from_pairs([(keys::FINAL, true)]),
                    None,
                );
            }
        }
    }

    fn start_workers(&mut self, state: State) {
        let mut failures = Vec::new();
        for worker in self
            .workers
            .iter_mut()
            .filter(|w| w.kind().solicited_by() == state)
        {
            match worker.start(&self.context) {
                Ok(()) => debug!(kind = %worker.kind(), "worker started"),
                Err(e) => failures.push(WorkerSignal::Failed {
                    source: worker.kind(),
                    error: e.to_string(),
                }),
            }
        }

        for failure in failures {
            let _ = self.handle_signal(failure);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::advance;

    use super::*;
    use crate::state::error::TableError;
    use crate::workers::WorkerError;

    impl StateController {
        fn is_initialized(&self) -> bool {
            self.initialized
        }

        fn is_paused(&self) -> bool {
            self.paused
        }

        fn retry_count(&self) -> u32 {
            self.retries
        }

        fn context(&self) -> &Context {
            &self.context
        }

        fn armed_timer(&self, state: State) -> Option<&TimerEntry> {
            self.timers.get(state)
        }
    }

    fn canonical() -> TransitionTable {
        TransitionTable::canonical().unwrap()
    }

    fn create_controller() -> (StateController, broadcast::Receiver<StateEvent>) {
        create_with(ControllerConfig::default())
    }

    fn create_with(config: ControllerConfig) -> (StateController, broadcast::Receiver<StateEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let mut controller = StateController::new(config, canonical(), tx);
        controller.initialize();
        (controller, rx)
    }

    fn record_events(controller: &mut StateController) -> Arc<Mutex<Vec<StateEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        controller.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    fn enter_error(controller: &mut StateController) {
        controller.request_transition(State::Listening, "test", Context::new()).unwrap();
        controller.request_transition(State::Error, "test", Context::new()).unwrap();
    }

    #[test]
    fn test_initial_state() {
        let (tx, _) = broadcast::channel(4);
        let controller = StateController::new(ControllerConfig::default(), canonical(), tx);
        assert_eq!(controller.current_state(), State::Idle);
        assert!(!controller.is_initialized());
    }

    #[test]
    fn test_requires_initialization() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut controller = StateController::new(ControllerConfig::default(), canonical(), tx);

        let err = controller.request_transition(State::Listening, "tap", Context::new()).unwrap_err();
        assert_eq!(err, TransitionError::NotInitialized { from: State::Idle });
        assert!(controller.dispatch(Event::UserActivate, Context::new()).is_err());
        assert_eq!(controller.current_state(), State::Idle);
        assert!(matches!(rx.try_recv(), Ok(StateEvent::TransitionError { .. })));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut controller = StateController::new(ControllerConfig::default(), canonical(), tx);

        controller.initialize();
        controller.initialize();

        assert!(matches!(
            rx.try_recv(),
            Ok(StateEvent::Initialized {
                state: State::Idle,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_listening_then_illegal_speaking() {
        let (mut controller, _) = create_controller();
        let seen = record_events(&mut controller);

        let transition = controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
        assert_eq!(transition.from, State::Idle);
        assert_eq!(transition.to, State::Listening);
        assert_eq!(controller.current_state(), State::Listening);
        {
            let events = seen.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                &events[0],
                StateEvent::Transition(Transition {
                    from: State::Idle,
                    to: State::Listening,
                    ..
                })
            ));
        }

        let err = controller.request_transition(State::Speaking, "skip", Context::new()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotAllowed {
                from: State::Listening,
                to: State::Speaking
            }
        );
        assert_eq!(controller.current_state(), State::Listening);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StateEvent::TransitionError {
                from: State::Listening,
                attempted: Some(State::Speaking),
                ..
            }
        ));
    }

    #[test]
    fn test_success_iff_table_edge() {
        let table = canonical();
        for from in State::ALL {
            for to in State::ALL {
                let (mut controller, _) = create_controller();
                force_state(&mut controller, from);

                let result = controller.request_transition(to, "table_walk", Context::new());
                let expected = to != from && table.allows(from, to);
                assert_eq!(result.is_ok(), expected, "{from} -> {to}");
            }
        }
    }

    /// Walk the table to reach `target` from idle
    fn force_state(controller: &mut StateController, target: State) {
        let path: &[State] = match target {
            State::Idle => &[],
            State::Listening => &[State::Listening],
            State::Processing => &[State::Listening, State::Processing],
            State::Speaking => &[State::Listening, State::Processing, State::Speaking],
            State::Error => &[State::Listening, State::Error],
            State::ConfirmingOrder => {
                &[State::Listening, State::Processing, State::ConfirmingOrder]
            }
        };
        for state in path {
            controller.request_transition(*state, "setup", Context::new()).unwrap();
        }
    }

    #[test]
    fn test_self_transition_rejected() {
        let (mut controller, _) = create_controller();
        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();

        let err = controller.request_transition(State::Listening, "again", Context::new()).unwrap_err();
        assert_eq!(err, TransitionError::SameState { state: State::Listening });
    }

    #[test]
    fn test_pause_only_allows_idle() {
        let (mut controller, _) = create_controller();
        force_state(&mut controller, State::Processing);

        controller.pause();
        controller.pause();
        assert!(controller.is_paused());

        let err = controller.request_transition(State::Speaking, "reply", Context::new()).unwrap_err();
        assert!(matches!(err, TransitionError::Paused { .. }));
        assert_eq!(controller.current_state(), State::Processing);

        controller.request_transition(State::Idle, "pause", Context::new()).unwrap();
        assert_eq!(controller.current_state(), State::Idle);

        let err = controller.request_transition(State::Idle, "again", Context::new()).unwrap_err();
        assert_eq!(err, TransitionError::SameState { state: State::Idle });

        controller.resume();
        controller.resume();
        assert!(!controller.is_paused());
        assert_eq!(controller.current_state(), State::Idle);
        assert!(controller.request_transition(State::Listening, "tap", Context::new()).is_ok());
    }

    #[test]
    fn test_pause_allows_idle_outside_table() {
        // Speaking can only fail; the fallback edges are all present
        let edges = vec![
            (State::Idle, vec![State::Listening]),
            (State::Listening, vec![State::Processing, State::Idle]),
            (State::Processing, vec![State::Speaking, State::Error]),
            (State::Speaking, vec![State::Error]),
            (State::Error, vec![State::Idle]),
            (State::ConfirmingOrder, vec![State::Idle]),
        ];
        let table = TransitionTable::new(edges, Vec::new()).unwrap();
        let (tx, _) = broadcast::channel(16);
        let mut controller = StateController::new(ControllerConfig::default(), table, tx);
        controller.initialize();
        for state in [State::Listening, State::Processing, State::Speaking] {
            controller.request_transition(state, "setup", Context::new()).unwrap();
        }

        assert!(controller
            .request_transition(State::Idle, "cancel", Context::new())
            .is_err());

        controller.pause();
        assert!(controller
            .request_transition(State::Idle, "cancel", Context::new())
            .is_ok());
    }

    #[test]
    fn test_table_without_listening_fallback_rejected() {
        let edges = vec![
            (State::Idle, vec![State::Listening]),
            (State::Listening, vec![State::Processing]),
            (State::Processing, vec![State::Speaking, State::Error]),
            (State::Speaking, vec![State::Idle]),
            (State::Error, vec![State::Idle]),
            (State::ConfirmingOrder, vec![State::Idle]),
        ];
        assert_eq!(
            TransitionTable::new(edges, Vec::new()).unwrap_err(),
            TableError::MissingFallback {
                from: State::Listening,
                to: State::Idle
            }
        );
    }

    #[test]
    fn test_dispatch_events() {
        let (mut controller, _) = create_controller();

        let transition = controller.dispatch(Event::UserActivate, Context::new()).unwrap();
        assert_eq!(transition.to, State::Listening);
        assert_eq!(transition.trigger, "user_activate");

        let err = controller.dispatch(Event::SpeakingComplete, Context::new()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::UnknownEvent {
                from: State::Listening,
                event: Event::SpeakingComplete
            }
        );

        controller.dispatch(Event::UserInput, Context::new()).unwrap();
        controller.dispatch(Event::NeedsConfirmation, Context::new()).unwrap();
        assert_eq!(controller.current_state(), State::ConfirmingOrder);
        controller.dispatch(Event::UserConfirms, Context::new()).unwrap();
        assert_eq!(controller.current_state(), State::Processing);
    }

    #[test]
    fn test_history_bounded() {
        let config = ControllerConfig {
            history_limit: 4,
            ..ControllerConfig::default()
        };
        let (mut controller, _) = create_with(config);

        for _ in 0..5 {
            controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
            controller.request_transition(State::Idle, "cancel", Context::new()).unwrap();
        }

        let history = controller.history();
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|t| t.trigger == "tap" || t.trigger == "cancel"));
        assert_eq!(history.last().map(|t| t.to), Some(State::Idle));
    }

    #[test]
    fn test_context_merge_and_clear() {
        let (mut controller, _) = create_controller();
        controller.set_context(context::from_json(json!({"user_utterance": "hola"})));
        controller.set_context(context::from_json(json!({"ai_response": "hola!"})));

        assert_eq!(context::text(controller.context(), keys::USER_UTTERANCE), Some("hola"));
        assert_eq!(context::text(controller.context(), keys::AI_RESPONSE), Some("hola!"));

        controller.clear_context();
        assert!(controller.context().is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_block_transition() {
        let (mut controller, _) = create_controller();
        controller.subscribe(|_| panic!("bad listener"));
        let seen = record_events(&mut controller);

        assert!(controller.request_transition(State::Listening, "tap", Context::new()).is_ok());
        assert_eq!(controller.current_state(), State::Listening);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let (mut controller, _) = create_controller();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let subscription = controller.subscribe(move |_| *counter.lock().unwrap() += 1);

        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
        assert!(controller.unsubscribe(subscription));
        controller.request_transition(State::Idle, "cancel", Context::new()).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_timeout_falls_back_to_idle() {
        let (mut controller, _) = create_controller();
        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();

        advance(Duration::from_millis(9_999)).await;
        assert_eq!(controller.fire_due_timers(), 0);
        assert_eq!(controller.current_state(), State::Listening);

        advance(Duration::from_millis(1)).await;
        assert_eq!(controller.fire_due_timers(), 1);
        assert_eq!(controller.current_state(), State::Idle);
        assert!(context::flag(controller.context(), keys::NO_SPEECH));
        assert_eq!(controller.history().last().map(|t| t.trigger.as_str()), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_listening_timer_does_not_fire() {
        let config = ControllerConfig {
            processing_timeout: Duration::from_secs(60),
            ..ControllerConfig::default()
        };
        let (mut controller, _) = create_with(config);

        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
        controller.request_transition(State::Processing, "speech", Context::new()).unwrap();

        advance(Duration::from_millis(10_500)).await;
        assert_eq!(controller.fire_due_timers(), 0);
        assert_eq!(controller.current_state(), State::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_from_earlier_visit_does_not_fire() {
        let (mut controller, _) = create_controller();

        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
        advance(Duration::from_secs(6)).await;
        controller.request_transition(State::Idle, "cancel", Context::new()).unwrap();
        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();

        // First visit would have expired at 10s
        advance(Duration::from_secs(5)).await;
        controller.fire_due_timers();
        assert_eq!(controller.current_state(), State::Listening);

        advance(Duration::from_secs(5)).await;
        controller.fire_due_timers();
        assert_eq!(controller.current_state(), State::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_timeout_enters_error_and_retries() {
        let (mut controller, _) = create_controller();
        force_state(&mut controller, State::Processing);

        advance(Duration::from_millis(8_000)).await;
        controller.fire_due_timers();
        assert_eq!(controller.current_state(), State::Error);
        assert!(context::flag(controller.context(), keys::TIMEOUT));
        assert_eq!(controller.retry_count(), 1);

        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();
        assert_eq!(controller.current_state(), State::Idle);
        assert!(context::flag(controller.context(), keys::IS_RETRY));
        assert!(!context::flag(controller.context(), keys::TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_final_idle() {
        let (mut controller, _) = create_controller();
        let mut delays = Vec::new();

        for attempt in 1..=3 {
            enter_error(&mut controller);
            assert_eq!(controller.retry_count(), attempt);

            let remaining = controller.armed_timer(State::Error).unwrap().remaining();
            delays.push(remaining.as_millis());

            advance(remaining).await;
            assert_eq!(controller.fire_due_timers(), 1);
            assert_eq!(controller.current_state(), State::Idle);
            assert!(context::flag(controller.context(), keys::IS_RETRY));
        }
        assert_eq!(delays, [1_000, 2_000, 4_000]);

        enter_error(&mut controller);
        assert_eq!(controller.current_state(), State::Idle);
        assert!(context::flag(controller.context(), keys::FINAL));
        assert_eq!(controller.retry_count(), 0);
        assert!(controller.armed_timer(State::Error).is_none());
        assert_eq!(
            controller.history().last().map(|t| t.trigger.as_str()),
            Some("retries_exhausted")
        );

        // Usable for a fresh attempt
        enter_error(&mut controller);
        assert_eq!(controller.retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_capped() {
        let config = ControllerConfig {
            retry_max_delay: Duration::from_millis(1_500),
            ..ControllerConfig::default()
        };
        let (mut controller, _) = create_with(config);

        enter_error(&mut controller);
        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();

        enter_error(&mut controller);
        assert_eq!(
            controller.armed_timer(State::Error).unwrap().remaining(),
            Duration::from_millis(1_500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_to_context_target() {
        let (mut controller, _) = create_controller();
        controller.set_context(context::from_json(json!({"recover_to": "listening"})));

        enter_error(&mut controller);
        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();

        assert_eq!(controller.current_state(), State::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_recovery_target_is_rejected() {
        let (mut controller, mut rx) = create_controller();
        controller.set_context(context::from_json(json!({"recover_to": "speaking"})));

        enter_error(&mut controller);
        while rx.try_recv().is_ok() {}

        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();

        assert_eq!(controller.current_state(), State::Error);
        assert!(matches!(
            rx.try_recv(),
            Ok(StateEvent::TransitionError {
                from: State::Error,
                attempted: Some(State::Speaking),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_error_cancels_retry() {
        let (mut controller, _) = create_controller();
        enter_error(&mut controller);
        controller.dispatch(Event::ErrorAcknowledged, Context::new()).unwrap();
        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();

        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();
        assert_eq!(controller.current_state(), State::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_leaves_no_residue() {
        let (mut controller, _) = create_controller();
        let before = (controller.current_state(), controller.retry_count());

        for state in [State::Listening, State::Processing, State::Speaking, State::Idle] {
            controller.request_transition(state, "cycle", Context::new()).unwrap();
        }

        assert_eq!((controller.current_state(), controller.retry_count()), before);

        advance(Duration::from_secs(60)).await;
        assert_eq!(controller.fire_due_timers(), 0);
        assert_eq!(controller.current_state(), State::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_resets_retries() {
        let (mut controller, _) = create_controller();
        enter_error(&mut controller);
        advance(Duration::from_millis(1_000)).await;
        controller.fire_due_timers();
        assert_eq!(controller.retry_count(), 1);

        force_state(&mut controller, State::Speaking);
        assert_eq!(controller.retry_count(), 0);
    }

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct FakeWorker {
        kind: WorkerKind,
        active: bool,
        fail_start: bool,
        calls: Calls,
    }

    impl WorkerAdapter for FakeWorker {
        fn kind(&self) -> WorkerKind {
            self.kind
        }

        fn start(&mut self, context: &Context) -> Result<(), WorkerError> {
            if self.fail_start {
                return Err(WorkerError::Disconnected(self.kind));
            }
            self.active = true;
            let input = context::text(context, keys::USER_UTTERANCE).unwrap_or("-");
            self.calls.0.lock().unwrap().push(format!("start {} {}", self.kind, input));
            Ok(())
        }

        fn stop(&mut self) {
            self.active = false;
            self.calls.0.lock().unwrap().push(format!("stop {}", self.kind));
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn attach(controller: &mut StateController, kind: WorkerKind, fail_start: bool) -> Calls {
        let calls = Calls::default();
        controller.attach_worker(Box::new(FakeWorker {
            kind,
            active: false,
            fail_start,
            calls: calls.clone(),
        }));
        calls
    }

    #[test]
    fn test_workers_follow_their_state() {
        let (mut controller, _) = create_controller();
        let recognizer = attach(&mut controller, WorkerKind::Recognizer, false);
        let responder = attach(&mut controller, WorkerKind::Responder, false);

        controller.dispatch(Event::UserActivate, Context::new()).unwrap();
        assert_eq!(recognizer.take(), ["start recognizer -"]);

        controller
            .handle_signal(WorkerSignal::Produced {
                source: WorkerKind::Recognizer,
                text: "pide una pizza".to_string(),
            })
            .unwrap()
            .unwrap();

        assert_eq!(controller.current_state(), State::Processing);
        assert_eq!(recognizer.take(), ["stop recognizer"]);
        assert_eq!(responder.take(), ["start responder pide una pizza"]);
    }

    #[test]
    fn test_worker_signals_drive_exchange() {
        let (mut controller, _) = create_controller();
        controller.dispatch(Event::UserActivate, Context::new()).unwrap();

        let signals = [
            (WorkerKind::Recognizer, "hola", State::Processing),
            (WorkerKind::Responder, "hola, ¿en qué te ayudo?", State::Speaking),
            (WorkerKind::Synthesizer, "hola, ¿en qué te ayudo?", State::Idle),
        ];
        for (source, text, expected) in signals {
            let signal = WorkerSignal::Produced {
                source,
                text: text.to_string(),
            };
            assert!(controller.handle_signal(signal).unwrap().is_ok());
            assert_eq!(controller.current_state(), expected);
        }
        assert_eq!(
            context::text(controller.context(), keys::AI_RESPONSE),
            Some("hola, ¿en qué te ayudo?")
        );
    }

    #[test]
    fn test_stale_worker_signal_dropped() {
        let (mut controller, _) = create_controller();

        let signal = WorkerSignal::Failed {
            source: WorkerKind::Synthesizer,
            error: "audio device lost".to_string(),
        };
        assert!(controller.handle_signal(signal).is_none());
        assert_eq!(controller.current_state(), State::Idle);
    }

    #[test]
    fn test_worker_failure_enters_error() {
        let (mut controller, _) = create_controller();
        controller.dispatch(Event::UserActivate, Context::new()).unwrap();

        let signal = WorkerSignal::Failed {
            source: WorkerKind::Recognizer,
            error: "not-allowed".to_string(),
        };
        controller.handle_signal(signal).unwrap().unwrap();

        assert_eq!(controller.current_state(), State::Error);
        assert_eq!(context::text(controller.context(), keys::SOURCE), Some("recognizer"));
        assert_eq!(controller.retry_count(), 1);
    }

    #[test]
    fn test_worker_start_failure_enters_error() {
        let (mut controller, _) = create_controller();
        attach(&mut controller, WorkerKind::Recognizer, true);

        controller.dispatch(Event::UserActivate, Context::new()).unwrap();

        assert_eq!(controller.current_state(), State::Error);
        let triggers: Vec<_> = controller.history().into_iter().map(|t| t.trigger).collect();
        assert_eq!(triggers, ["user_activate", "failure"]);
    }

    #[test]
    fn test_status_snapshot() {
        let (mut controller, _) = create_controller();
        controller.request_transition(State::Listening, "tap", Context::new()).unwrap();
        controller.pause();

        let status = controller.status();
        assert_eq!(status.state, State::Listening);
        assert!(status.paused);
        assert!(status.initialized);
        assert_eq!(status.pending_timers, 1);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&State::ConfirmingOrder).unwrap();
        assert_eq!(json, "\"confirming_order\"");
        let state: State = serde_json::from_str("\"speaking\"").unwrap();
        assert_eq!(state, State::Speaking);
    }
}
