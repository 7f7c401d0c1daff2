//! Periodic driver for the session's tick function.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Repeatedly runs an async callback, never overlapping executions: the
/// next run is armed only after the previous one settles, so the delay
/// between successive starts is the configured interval plus however long
/// the previous run took. The first run fires immediately on `start` to
/// surface startup errors quickly.
pub struct Ticker {
    interval: Duration,
    // bumped on every start and stop; a loop whose generation is stale
    // must never re-arm its timer
    generation: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Ticker {
            interval,
            generation: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Begin ticking. Callback failures are logged and swallowed at this
    /// boundary; the callback reports its own errors.
    ///
    /// # Panics
    ///
    /// Panics if the ticker is already running.
    pub fn start<F, Fut, E>(&self, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        let mut running = self.running.lock().unwrap();
        assert!(running.is_none(), "Ticker::start called while already running");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generations = Arc::clone(&self.generation);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                if loop_cancel.is_cancelled() {
                    break;
                }

                if let Err(err) = callback().await {
                    warn!("Tick failed: {err}");
                }

                if generations.load(Ordering::SeqCst) != generation {
                    break;
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = sleep(interval) => {},
                }
            }
        });

        *running = Some(Running { cancel, handle });
    }

    /// Prevent any further executions and wait for the in-flight one, if
    /// any, to settle. Stopping a stopped ticker is a no-op.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        let Some(Running { cancel, handle }) = running else {
            return;
        };

        self.generation.fetch_add(1, Ordering::SeqCst);
        cancel.cancel();
        if let Err(err) = handle.await {
            warn!("Tick task did not settle cleanly: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(count: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<Result<(), &'static str>> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn the_first_run_fires_without_an_initial_delay() {
        let ticker = Ticker::new(Duration::from_millis(100));
        let count = Arc::new(AtomicUsize::new(0));

        ticker.start(counting(&count));
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn runs_repeat_at_the_configured_interval() {
        let ticker = Ticker::new(Duration::from_millis(100));
        let count = Arc::new(AtomicUsize::new(0));

        ticker.start(counting(&count));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_the_in_flight_run() {
        let ticker = Ticker::new(Duration::from_millis(100));
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&finished);
        ticker.start(move || {
            let counter = Arc::clone(&counter);
            async move {
                sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            }
        });

        // the first run has started but not settled
        sleep(Duration::from_millis(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        ticker.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_stop() {
        let ticker = Ticker::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        ticker.start(counting(&count));
        sleep(Duration::from_millis(35)).await;
        ticker.stop().await;

        let settled = count.load(Ordering::SeqCst);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_ticker() {
        let ticker = Ticker::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        ticker.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>("tick exploded"))
        });

        sleep(Duration::from_millis(55)).await;
        assert!(count.load(Ordering::SeqCst) >= 5);

        ticker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn can_be_restarted_after_stop() {
        let ticker = Ticker::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        ticker.start(counting(&count));
        sleep(Duration::from_millis(1)).await;
        ticker.stop().await;

        assert!(!ticker.is_running());
        ticker.start(counting(&count));
        assert!(ticker.is_running());
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        ticker.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already running")]
    async fn double_start_is_a_contract_violation() {
        let ticker = Ticker::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));

        ticker.start(counting(&count));
        ticker.start(counting(&count));
    }
}
