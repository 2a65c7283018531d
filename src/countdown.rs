//! Cancellable repeating timer
//!
//! The countdown needs a tick that can be cancelled from every exit path
//! (leave, opponent departure, a second countdown starting) without two
//! timers ever running at once. Instead of passing raw interval handles
//! around, the coordinator owns one [`RepeatingTimer`] whose `start` always
//! cancels the previous run first.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::{Duration, interval, spawn};

/// A scheduled repeating task with explicit start/stop.
///
/// `start` replaces any running task; the old one observes its cancel flag
/// on the next tick and exits. The tick closure returns `false` to stop the
/// timer from inside.
#[derive(Default)]
pub struct RepeatingTimer {
    cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl RepeatingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a started task has neither been stopped nor finished.
    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|flag| !flag.load(Ordering::SeqCst))
    }

    /// Stops the running task, if any.
    pub fn stop(&self) {
        if let Some(flag) = self.cancel.lock().unwrap().take() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Starts a repeating task, cancelling any previous one first.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let flag = self.arm();
        spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if !tick().await {
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });
    }

    #[cfg(target_arch = "wasm32")]
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = bool> + 'static,
    {
        let flag = self.arm();
        spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if !tick().await {
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });
    }

    fn arm(&self) -> Arc<AtomicBool> {
        self.stop();
        let flag = Arc::new(AtomicBool::new(false));
        *self.cancel.lock().unwrap() = Some(flag.clone());
        flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn ticks_until_closure_stops_it() {
        let timer = RepeatingTimer::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        timer.start(Duration::from_millis(5), move || {
            let c = c.clone();
            async move { c.fetch_add(1, Ordering::SeqCst) < 2 }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn stop_cancels_pending_task() {
        let timer = RepeatingTimer::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        timer.start(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        assert!(timer.is_running());
        timer.stop();
        assert!(!timer.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn restart_replaces_previous_task() {
        let timer = RepeatingTimer::new();
        let first = Arc::new(AtomicU32::new(0));
        let f = first.clone();
        timer.start(Duration::from_millis(5), move || {
            let f = f.clone();
            async move {
                f.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        let second = Arc::new(AtomicU32::new(0));
        let s = second.clone();
        timer.start(Duration::from_millis(5), move || {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_ticks = first.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the first task stopped once replaced, the second keeps going
        assert_eq!(first.load(Ordering::SeqCst), first_ticks);
        assert!(second.load(Ordering::SeqCst) > 0);
        timer.stop();
    }
}
