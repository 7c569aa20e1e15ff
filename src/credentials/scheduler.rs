use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// One-shot deferred job slot: at most one timer is armed at a time, and
/// arming a new one replaces whatever was pending.
///
/// The fired task disarms the slot before running its job, so a job may call
/// [`RefreshScheduler::schedule`] to arm its own successor without
/// cancelling itself.
#[derive(Clone, Debug, Default)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    slot: Mutex<Option<ArmedJob>>,
    generation: AtomicU64,
}

#[derive(Debug)]
struct ArmedJob {
    generation: u64,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer that runs `job` after `delay`, cancelling any
    /// previously armed timer.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = Arc::clone(&self.inner);

        // The slot lock is held from before the spawn until the new job is
        // stored, so the spawned task cannot observe the slot mid-update
        // even with a zero delay.
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            sleep(delay).await;

            {
                let mut slot = inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    // Disarm before running so the job can re-arm.
                    Some(armed) if armed.generation == generation => *slot = None,
                    // Replaced while sleeping; the newer timer owns the slot.
                    _ => return,
                }
            }

            job.await;
        });

        *slot = Some(ArmedJob { generation, handle });
    }

    /// Whether a timer is currently armed.
    #[must_use]
    pub fn has_scheduled_job(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Disarm the pending timer, if any.
    pub fn cancel(&self) {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(armed) = slot.take() {
            armed.handle.abort();
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock()
            && let Some(armed) = slot.take()
        {
            armed.handle.abort();
        }
    }
}
