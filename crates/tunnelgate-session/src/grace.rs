//! Cancellable grace timer.
//!
//! Re-armed on every `offline` transition, cancelled on `online`. A plain
//! `tokio::spawn`ed sleep compares a generation counter when it wakes, so
//! superseded timers are simply no-ops rather than needing to be aborted
//! from a `Drop` impl (which would risk blocking process shutdown).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct GraceTimer {
    generation: AtomicU64,
}

impl GraceTimer {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Invalidate any outstanding timer without starting a new one.
    pub(crate) fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Invalidate any outstanding timer and start a new one; `on_expire`
    /// runs if no further `cancel`/`rearm` call happens within `duration`.
    pub(crate) fn rearm<F>(self: &Arc<Self>, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if timer.generation.load(Ordering::SeqCst) == generation {
                on_expire();
            }
        });
    }
}
