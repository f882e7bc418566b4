//! Progress observer.
//!
//! A background task that samples store counts on a fixed interval and
//! reports a `running=P done=F/T (pct%)` line. It has no effect on
//! correctness and never holds up pool shutdown: stopping sets a flag and
//! wakes the current sleep.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::Counts;
use crate::storage::Store;

/// One progress sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub running: u64,
    pub done: u64,
    pub total: u64,
}

impl Progress {
    /// Share of tasks done, 0 for an empty store.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 * 100.0 / self.total as f64
        }
    }
}

impl From<Counts> for Progress {
    fn from(counts: Counts) -> Self {
        Self {
            running: counts.claimed,
            done: counts.done,
            total: counts.total,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running={} done={}/{} ({:.1}%)",
            self.running,
            self.done,
            self.total,
            self.percent()
        )
    }
}

/// Anything the observer can sample. Sampling may block.
pub trait ProgressSource: Send + Sync {
    fn progress(&self) -> Result<Progress>;
}

impl<T> ProgressSource for Store<T> {
    fn progress(&self) -> Result<Progress> {
        self.counts().map(Progress::from)
    }
}

type Reporter = Box<dyn FnMut(&Progress) + Send>;

pub struct Observer {
    source: Arc<dyn ProgressSource>,
    interval: Duration,
    reporter: Reporter,
}

impl Observer {
    /// Reports through `tracing::info!` unless a reporter is supplied.
    pub fn new(source: Arc<dyn ProgressSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            reporter: Box::new(|progress| info!(%progress, "progress")),
        }
    }

    pub fn with_reporter(mut self, reporter: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Start sampling on the current tokio runtime.
    pub fn spawn(self) -> ObserverHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(Arc::clone(&stop), Arc::clone(&wake)));
        ObserverHandle { stop, wake, task }
    }

    async fn run(mut self, stop: Arc<AtomicBool>, wake: Arc<Notify>) {
        while !stop.load(Ordering::Acquire) {
            let source = Arc::clone(&self.source);
            match tokio::task::spawn_blocking(move || source.progress()).await {
                Ok(Ok(progress)) => (self.reporter)(&progress),
                Ok(Err(e)) => warn!("progress sample failed: {e}"),
                Err(e) => warn!("progress sampler panicked: {e}"),
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Owner's side of a running observer.
pub struct ObserverHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    /// Ask the observer to stop and return immediately. The task finishes
    /// on its own at its next iteration boundary.
    pub fn stop(self) {
        self.signal();
    }

    /// Ask the observer to stop and wait until it has.
    pub async fn stop_and_join(self) {
        self.signal();
        if let Err(e) = self.task.await {
            warn!("observer task failed: {e}");
        }
    }

    fn signal(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    struct Ticking {
        samples: AtomicU64,
    }

    impl ProgressSource for Ticking {
        fn progress(&self) -> Result<Progress> {
            let n = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Progress {
                running: 1,
                done: n,
                total: 10,
            })
        }
    }

    #[test]
    fn percent_of_empty_store_is_zero() {
        let progress = Progress::default();
        assert_eq!(progress.percent(), 0.0);
        assert_eq!(progress.to_string(), "running=0 done=0/0 (0.0%)");
    }

    #[test]
    fn line_format() {
        let progress = Progress {
            running: 2,
            done: 1,
            total: 3,
        };
        assert_eq!(progress.to_string(), "running=2 done=1/3 (33.3%)");
    }

    #[test]
    fn counts_map_claimed_to_running() {
        let progress = Progress::from(Counts {
            total: 5,
            claimed: 2,
            done: 1,
        });
        assert_eq!(
            progress,
            Progress {
                running: 2,
                done: 1,
                total: 5
            }
        );
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_the_interval() {
        let source = Arc::new(Ticking {
            samples: AtomicU64::new(0),
        });
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);

        let handle = Observer::new(source.clone(), Duration::from_secs(3600))
            .with_reporter(move |p| sink.lock().unwrap().push(p.to_string()))
            .spawn();

        // Let the first sample land, then stop mid-sleep.
        while source.samples.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), handle.stop_and_join())
            .await
            .expect("observer ignored stop");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.first().map(String::as_str), Some("running=1 done=1/10 (10.0%)"));
    }

    #[tokio::test]
    async fn samples_repeat_on_the_interval() {
        let source = Arc::new(Ticking {
            samples: AtomicU64::new(0),
        });
        let handle = Observer::new(source.clone(), Duration::from_millis(10))
            .with_reporter(|_| {})
            .spawn();

        while source.samples.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop_and_join().await;
        let after_stop = source.samples.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.samples.load(Ordering::SeqCst), after_stop);
    }
}
