//! Message-passing worker proxy
//!
//! The job runs in its own task and is driven purely by messages, so the
//! controller sees the same adapter contract whether the work happens in
//! process or behind a channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{WorkerAdapter, WorkerError, WorkerKind, WorkerSignal};
use crate::state::context::{self, Context};

/// Work performed by a remote worker for one input
pub trait WorkerJob: Send + 'static {
    fn run(&mut self, input: String) -> impl Future<Output = Result<String, String>> + Send + '_;
}

/// Messages sent to the worker task
#[derive(Debug)]
enum WorkerRequest {
    Start { input: String, generation: u64 },
    Stop,
}

/// Adapter for a job running in a background task
pub struct RemoteWorker {
    kind: WorkerKind,
    /// Context key holding the job input
    input_key: &'static str,
    request_tx: mpsc::UnboundedSender<WorkerRequest>,
    /// Generation of the job in flight, 0 when idle
    current: Arc<AtomicU64>,
    last_generation: u64,
}

impl RemoteWorker {
    /// Spawn the worker task on the current runtime
    pub fn spawn<J: WorkerJob>(
        kind: WorkerKind,
        input_key: &'static str,
        job: J,
        signal_tx: mpsc::Sender<WorkerSignal>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let current = Arc::new(AtomicU64::new(0));

        tokio::spawn(serve(kind, job, request_rx, signal_tx, Arc::clone(&current)));

        Self {
            kind,
            input_key,
            request_tx,
            current,
            last_generation: 0,
        }
    }
}

impl WorkerAdapter for RemoteWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn start(&mut self, context: &Context) -> Result<(), WorkerError> {
        let input = context::text(context, self.input_key).ok_or(WorkerError::MissingInput {
            kind: self.kind,
            key: self.input_key,
        })?;

        let generation = self.last_generation + 1;
        if self
            .current
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WorkerError::AlreadyRunning(self.kind));
        }
        self.last_generation = generation;

        self.request_tx
            .send(WorkerRequest::Start {
                input: input.to_string(),
                generation,
            })
            .map_err(|_| {
                self.current.store(0, Ordering::SeqCst);
                WorkerError::Disconnected(self.kind)
            })
    }

    fn stop(&mut self) {
        if self.current.swap(0, Ordering::SeqCst) != 0 {
            let _ = self.request_tx.send(WorkerRequest::Stop);
        }
    }

    fn is_active(&self) -> bool {
        self.current.load(Ordering::SeqCst) != 0
    }
}

async fn serve<J: WorkerJob>(
    kind: WorkerKind,
    mut job: J,
    mut request_rx: mpsc::UnboundedReceiver<WorkerRequest>,
    signal_tx: mpsc::Sender<WorkerSignal>,
    current: Arc<AtomicU64>,
) {
    debug!(%kind, "worker task started");

    while let Some(request) = request_rx.recv().await {
        let WorkerRequest::Start { input, generation } = request else {
            continue;
        };

        let outcome = tokio::select! {
            result = job.run(input) => Some(result),
            _ = wait_for_stop(kind, &mut request_rx) => None,
        };

        let Some(result) = outcome else {
            debug!(%kind, "worker job cancelled");
            continue;
        };

        // Stopped (and possibly restarted) while finishing
        if current
            .compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%kind, generation, "dropping result of a stopped job");
            continue;
        }

        let signal = match result {
            Ok(text) => WorkerSignal::Produced { source: kind, text },
            Err(error) => WorkerSignal::Failed {
                source: kind,
                error,
            },
        };

        if signal_tx.send(signal).await.is_err() {
            warn!(%kind, "signal channel closed, worker exiting");
            break;
        }
    }

    debug!(%kind, "worker task stopped");
}

async fn wait_for_stop(kind: WorkerKind, request_rx: &mut mpsc::UnboundedReceiver<WorkerRequest>) {
    loop {
        match request_rx.recv().await {
            Some(WorkerRequest::Stop) | None => return,
            Some(WorkerRequest::Start { .. }) => {
                warn!(%kind, "start requested while busy, ignoring");
            }
        }
    }
}
