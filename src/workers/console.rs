//! Console speech recognizer
//!
//! Reads lines from standard input on a dedicated thread and reports each
//! non-empty line as a recognized utterance while the recognizer is active.
//! Blank lines count as "no speech"; the recognizer keeps listening a
//! bounded number of times before reporting a failure.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{WorkerAdapter, WorkerError, WorkerKind, WorkerSignal};
use crate::state::Context;

const DEFAULT_NO_SPEECH_RETRIES: u32 = 3;

/// Adapter-local bounded retry for "no speech" results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSpeechRetry {
    attempts: u32,
    max: u32,
}

impl NoSpeechRetry {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Record a blank result; returns true once the retries are used up
    pub fn on_silence(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts >= self.max {
            self.attempts = 0;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for NoSpeechRetry {
    fn default() -> Self {
        Self::new(DEFAULT_NO_SPEECH_RETRIES)
    }
}

/// Turn one input line into a signal, if it produces one
pub fn process_line(line: &str, retry: &mut NoSpeechRetry) -> Option<WorkerSignal> {
    let text = line.trim();
    if text.is_empty() {
        if retry.on_silence() {
            return Some(WorkerSignal::Failed {
                source: WorkerKind::Recognizer,
                error: "no-speech".to_string(),
            });
        }
        info!(attempt = retry.attempts(), "no speech detected, still listening");
        return None;
    }

    retry.reset();
    Some(WorkerSignal::Produced {
        source: WorkerKind::Recognizer,
        text: text.to_string(),
    })
}

/// Speech recognizer fed from a line-oriented reader
pub struct ConsoleRecognizer {
    signal_tx: mpsc::Sender<WorkerSignal>,
    active: Arc<AtomicBool>,
    reader_running: Arc<AtomicBool>,
    max_no_speech: u32,
}

impl ConsoleRecognizer {
    /// Create a new console recognizer
    pub fn new(signal_tx: mpsc::Sender<WorkerSignal>) -> Self {
        Self {
            signal_tx,
            active: Arc::new(AtomicBool::new(false)),
            reader_running: Arc::new(AtomicBool::new(false)),
            max_no_speech: DEFAULT_NO_SPEECH_RETRIES,
        }
    }

    /// Number of consecutive blank lines tolerated before failing
    pub fn with_no_speech_retries(mut self, max: u32) -> Self {
        self.max_no_speech = max.max(1);
        self
    }

    /// Start reading standard input
    pub fn spawn_stdin_reader(&self) -> Result<(), WorkerError> {
        self.spawn_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Start the reader thread
    ///
    /// The thread runs until the reader is exhausted or the signal channel
    /// closes. Lines read while the recognizer is inactive are ignored.
    pub fn spawn_reader<R>(&self, reader: R) -> Result<(), WorkerError>
    where
        R: BufRead + Send + 'static,
    {
        if self.reader_running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning(WorkerKind::Recognizer));
        }

        let signal_tx = self.signal_tx.clone();
        let active = Arc::clone(&self.active);
        let running = Arc::clone(&self.reader_running);
        let max_no_speech = self.max_no_speech;

        thread::Builder::new()
            .name("console-recognizer".to_string())
            .spawn(move || {
                info!("console recognizer thread started");

                read_lines(reader, signal_tx, active, NoSpeechRetry::new(max_no_speech));

                running.store(false, Ordering::SeqCst);
                info!("console recognizer thread stopped");
            })
            .map_err(|e| {
                self.reader_running.store(false, Ordering::SeqCst);
                WorkerError::ThreadSpawn {
                    kind: WorkerKind::Recognizer,
                    reason: e.to_string(),
                }
            })?;

        Ok(())
    }
}

impl WorkerAdapter for ConsoleRecognizer {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Recognizer
    }

    fn start(&mut self, _context: &Context) -> Result<(), WorkerError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning(WorkerKind::Recognizer));
        }
        if !self.reader_running.load(Ordering::SeqCst) {
            warn!("console recognizer has no input, nothing will be heard");
        }
        debug!("console recognizer listening");
        Ok(())
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

fn read_lines<R: BufRead>(
    reader: R,
    signal_tx: mpsc::Sender<WorkerSignal>,
    active: Arc<AtomicBool>,
    mut retry: NoSpeechRetry,
) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(?e, "failed to read console input");
                break;
            }
        };

        if !active.load(Ordering::SeqCst) {
            debug!("ignoring console input while not listening");
            continue;
        }

        let Some(signal) = process_line(&line, &mut retry) else {
            continue;
        };

        // One result per listening session
        active.store(false, Ordering::SeqCst);

        // We use blocking_send since we're not in an async context
        if signal_tx.blocking_send(signal).is_err() {
            warn!("failed to send recognizer signal - channel closed?");
            break;
        }
    }
}
