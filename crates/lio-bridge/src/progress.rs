//! Progress sink contract for long-running calls.

use lio_core::relay::ProgressTick;

/// Receives progress ticks interleaved with a call's result.
///
/// The bridge forwards every tick under the caller-supplied key, so one
/// sink (a WebSocket fan-out, a progress store) can serve many concurrent
/// calls.
pub trait ProgressSink: Send + Sync {
    /// One tick for the call registered under `key`.
    fn progress(&self, key: &str, tick: ProgressTick);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, ProgressTick) + Send + Sync,
{
    fn progress(&self, key: &str, tick: ProgressTick) {
        self(key, tick);
    }
}
