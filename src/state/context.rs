//! Auxiliary key-value data carried by the controller
//!
//! The context is an open JSON object. Merges are shallow and
//! last-write-wins; a handful of marker keys only describe the transition
//! that set them and are dropped again on the next one.

use serde_json::{Map, Value};
use tracing::warn;

use super::machine::State;

/// Open key-value bag attached to the controller
pub type Context = Map<String, Value>;

/// Well-known context keys
pub mod keys {
    /// Last recognized user utterance
    pub const USER_UTTERANCE: &str = "user_utterance";
    /// Last response produced for the user
    pub const AI_RESPONSE: &str = "ai_response";
    /// State requested by retries after an error (defaults to idle)
    pub const RECOVER_TO: &str = "recover_to";
    /// Set on transitions performed by the retry policy
    pub const IS_RETRY: &str = "is_retry";
    /// Set when retries were exhausted and the controller gave up
    pub const FINAL: &str = "final";
    /// Set when the listening window expired without speech
    pub const NO_SPEECH: &str = "no_speech";
    /// Set when the processing window expired
    pub const TIMEOUT: &str = "timeout";
    /// Worker that reported a failure
    pub const SOURCE: &str = "source";
    /// Failure description reported by a worker
    pub const ERROR: &str = "error";
}

/// Keys describing a single transition rather than the session
const TRANSIENT_KEYS: [&str; 6] = [
    keys::IS_RETRY,
    keys::FINAL,
    keys::NO_SPEECH,
    keys::TIMEOUT,
    keys::SOURCE,
    keys::ERROR,
];

/// Build a context from a JSON value, ignoring anything but objects
#[cfg(test)]
pub fn from_json(value: Value) -> Context {
    match value {
        Value::Object(map) => map,
        _ => Context::new(),
    }
}

/// Build a context from key/value pairs
pub fn from_pairs<I, V>(pairs: I) -> Context
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.into()))
        .collect()
}

/// Shallow merge, overwriting existing keys
pub fn merge(into: &mut Context, patch: Context) {
    for (key, value) in patch {
        into.insert(key, value);
    }
}

/// Remove per-transition marker keys
pub fn strip_transient(context: &mut Context) {
    for key in TRANSIENT_KEYS {
        context.remove(key);
    }
}

/// Whether a boolean marker is set
#[cfg(test)]
pub fn flag(context: &Context, key: &str) -> bool {
    context.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Read a string value
pub fn text<'a>(context: &'a Context, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str)
}

/// State retries should recover to, defaulting to idle
pub fn recovery_target(context: &Context) -> State {
    let Some(value) = context.get(keys::RECOVER_TO) else {
        return State::Idle;
    };

    match serde_json::from_value::<State>(value.clone()) {
        Ok(state) => state,
        Err(_) => {
            warn!(%value, "unknown recovery target, falling back to idle");
            State::Idle
        }
    }
}
