//! Cancellable one-shot timers backed by tokio tasks.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to an armed timer. Dropping the handle cancels the timer.
///
/// Cancellation is best effort: a callback that has already started runs to
/// completion, so callbacks must re-check whatever state they act on.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
    duration: Duration,
}

impl TimerHandle {
    /// Run `on_fire` once after `duration`. Must be called within a tokio runtime.
    pub fn arm<F>(duration: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire();
        });
        Self { handle, duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[cfg(test)]
    pub fn cancel(self) {
        drop(self);
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = TimerHandle::arm(Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = TimerHandle::arm(Duration::from_millis(100), move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(timer.duration(), Duration::from_millis(100));

        timer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let flag = Arc::clone(&fired);
            let _timer = TimerHandle::arm(Duration::from_millis(10), move || {
                flag.store(true, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
