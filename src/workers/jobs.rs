//! Jobs run behind `RemoteWorker`s
//!
//! The chat-completion backend and real audio output live outside this
//! daemon; these jobs stand in for them with the same timing shape.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use super::remote::WorkerJob;
use super::speech_cache::SpeechCache;

/// Replies by acknowledging the utterance after a short delay
#[derive(Debug, Clone)]
pub struct EchoResponder {
    delay: Duration,
}

impl EchoResponder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoResponder {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

impl WorkerJob for EchoResponder {
    fn run(&mut self, input: String) -> impl Future<Output = Result<String, String>> + Send + '_ {
        async move {
            tokio::time::sleep(self.delay).await;
            Ok(format!("Has dicho: {}", input.trim()))
        }
    }
}

/// A rendered utterance ready for playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechClip {
    pub words: usize,
    pub duration: Duration,
}

/// Simulated text-to-speech with a FIFO cache of rendered utterances
#[derive(Debug)]
pub struct SimulatedSynthesizer {
    cache: SpeechCache<SpeechClip>,
    render_delay: Duration,
    per_word: Duration,
}

impl SimulatedSynthesizer {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: SpeechCache::new(cache_size),
            render_delay: Duration::from_millis(200),
            per_word: Duration::from_millis(250),
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, render_delay: Duration, per_word: Duration) -> Self {
        self.render_delay = render_delay;
        self.per_word = per_word;
        self
    }

    #[cfg(test)]
    pub fn cache(&self) -> &SpeechCache<SpeechClip> {
        &self.cache
    }

    async fn speak(&mut self, text: String) -> Result<String, String> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err("nothing to say".to_string());
        }

        let clip = match self.cache.get(&text) {
            Some(clip) => {
                debug!(words = clip.words, "speech cache hit");
                clip.clone()
            }
            None => {
                tokio::time::sleep(self.render_delay).await;
                let words = text.split_whitespace().count();
                let clip = SpeechClip {
                    words,
                    duration: self.per_word * words as u32,
                };
                if let Some((evicted, _)) = self.cache.insert(text.clone(), clip.clone()) {
                    debug!(%evicted, "speech cache evicted oldest entry");
                }
                debug!(
                    cached = self.cache.len(),
                    capacity = self.cache.capacity(),
                    "speech rendered"
                );
                clip
            }
        };

        info!(words = clip.words, duration_ms = clip.duration.as_millis() as u64, "speaking");
        tokio::time::sleep(clip.duration).await;
        Ok(text)
    }
}

impl WorkerJob for SimulatedSynthesizer {
    fn run(&mut self, input: String) -> impl Future<Output = Result<String, String>> + Send + '_ {
        self.speak(input)
    }
}
