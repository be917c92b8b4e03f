use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

type Action = Box<dyn FnOnce() + Send>;

struct Pending {
    handle: JoinHandle<()>,
    action: Arc<Mutex<Option<Action>>>,
}

/// Single-slot trailing timer: arming replaces whatever was pending, so only
/// the last armed action can fire, `delay` after it was armed.
pub struct DebounceTimer {
    delay: Duration,
    pending: Mutex<Option<Pending>>,
}

impl DebounceTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `action`, cancelling the previously armed one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let action: Arc<Mutex<Option<Action>>> = Arc::new(Mutex::new(Some(Box::new(action))));
        let slot = Arc::clone(&action);
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = slot.lock().take();
            if let Some(fire) = fire {
                fire();
            }
        });

        if let Some(old) = self.pending.lock().replace(Pending { handle, action }) {
            old.handle.abort();
        }
    }

    /// Drop the pending action without running it. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        pending.handle.abort();
        let dropped = pending.action.lock().take();
        dropped.is_some()
    }

    /// Run the pending action now instead of waiting. Returns whether one ran.
    pub fn flush(&self) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        pending.handle.abort();
        let action = pending.action.lock().take();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|p| p.action.lock().is_some())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || {
            let c = Arc::clone(&c);
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = DebounceTimer::new(Duration::from_millis(1000));
        let (count, make) = counter();
        timer.arm(make());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_fires_once_from_last_arm() {
        let timer = DebounceTimer::new(Duration::from_millis(1000));
        let (count, make) = counter();
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            timer.arm(make());
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        // Last arm at t=1200, so nothing before t=2200.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep_until(start + Duration::from_millis(2199)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep_until(start + Duration::from_millis(2201)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timer = DebounceTimer::new(Duration::from_millis(100));
        let (count, make) = counter();
        timer.arm(make());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_immediately_once() {
        let timer = DebounceTimer::new(Duration::from_millis(100));
        let (count, make) = counter();
        timer.arm(make());
        assert!(timer.flush());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.flush());
    }
}
