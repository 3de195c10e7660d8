//! Live state of one in-flight request and its progress policy.

use std::time::Duration;

use tokio::time::Instant;

use crate::completion::{CompletionResult, Settler};
use crate::protocol::Payload;
use crate::timer::TimerHandle;

/// Limits applied to progress-driven deadline extensions.
#[derive(Debug, Clone, Copy)]
pub struct ProgressPolicy {
    pub extension: Duration,
    pub max_extensions: u32,
    pub stale_threshold: u32,
}

/// Outcome of feeding one progress update to [`ProgressState::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressVerdict {
    /// Grant another `extension` of soft deadline.
    Extend,
    /// Ceiling already reached; the worker is probably deadlocked.
    ExtensionLimit { extensions: u32 },
    /// Same percent repeated `updates` times in a row.
    Stalled { percent: f64, updates: u32 },
}

/// Extension and staleness counters for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub extension_count: u32,
    pub last_percent: Option<f64>,
    /// Consecutive updates repeating `last_percent`.
    pub stale_count: u32,
    pub total_extension: Duration,
}

impl ProgressState {
    /// Apply one progress update. Counters are only advanced on `Extend`.
    ///
    /// An update without a percent carries no staleness signal: it neither
    /// repeats nor resets the last observed value.
    pub fn observe(&mut self, percent: Option<f64>, policy: &ProgressPolicy) -> ProgressVerdict {
        if self.extension_count >= policy.max_extensions {
            return ProgressVerdict::ExtensionLimit {
                extensions: self.extension_count,
            };
        }

        if let Some(percent) = percent {
            if self.last_percent == Some(percent) {
                // The run includes the update that first reported this value.
                let run = self.stale_count + 2;
                if run >= policy.stale_threshold {
                    return ProgressVerdict::Stalled {
                        percent,
                        updates: run,
                    };
                }
                self.stale_count += 1;
            } else {
                self.stale_count = 0;
            }
            self.last_percent = Some(percent);
        }

        self.extension_count += 1;
        self.total_extension += policy.extension;
        ProgressVerdict::Extend
    }
}

/// One in-flight request. Exists in the store iff not yet settled.
///
/// Dropping it cancels both timers; settling consumes it.
pub struct PendingRequest {
    action: String,
    payload: Payload,
    requested_at: Instant,
    settler: Settler,
    soft_timer: TimerHandle,
    soft_generation: u64,
    absolute_timer: TimerHandle,
    progress: ProgressState,
}

impl PendingRequest {
    pub fn new(
        action: String,
        payload: Payload,
        settler: Settler,
        soft_timer: TimerHandle,
        absolute_timer: TimerHandle,
    ) -> Self {
        Self {
            action,
            payload,
            requested_at: Instant::now(),
            settler,
            soft_timer,
            soft_generation: 0,
            absolute_timer,
            progress: ProgressState::default(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn age(&self) -> Duration {
        self.requested_at.elapsed()
    }

    pub fn progress(&self) -> &ProgressState {
        &self.progress
    }

    pub fn soft_generation(&self) -> u64 {
        self.soft_generation
    }

    pub fn soft_deadline(&self) -> Duration {
        self.soft_timer.duration()
    }

    pub fn absolute_deadline(&self) -> Duration {
        self.absolute_timer.duration()
    }

    pub fn observe_progress(
        &mut self,
        percent: Option<f64>,
        policy: &ProgressPolicy,
    ) -> ProgressVerdict {
        self.progress.observe(percent, policy)
    }

    /// Generation the next soft timer must carry.
    pub fn next_generation(&self) -> u64 {
        self.soft_generation + 1
    }

    /// Swap in a new soft timer; the previous one is cancelled.
    pub fn replace_soft_timer(&mut self, timer: TimerHandle, generation: u64) {
        self.soft_timer = timer;
        self.soft_generation = generation;
    }

    /// Settle the completion. Both timers are cancelled as `self` drops.
    pub fn finish(self, result: CompletionResult) {
        self.settler.settle(result);
    }
}
