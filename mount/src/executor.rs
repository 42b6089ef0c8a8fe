//! Motion executor
//!
//! A single worker task consuming a FIFO of motion tasks. Everything that
//! commands the axes runs here, so two motion sequences can never
//! interleave their commands on the wire. Submitting never waits for the
//! worker; a failing or panicking task is logged and the worker moves on.

use crate::error::{MountError, MountResult};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type MotionFuture = Pin<Box<dyn Future<Output = MountResult<()>> + Send + 'static>>;

/// A named unit of motion work
pub struct MotionTask {
    name: String,
    future: MotionFuture,
}

impl MotionTask {
    pub fn new(
        name: impl Into<String>,
        future: impl Future<Output = MountResult<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MotionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionTask").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct WorkerFlags {
    shutting_down: AtomicBool,
    busy: AtomicBool,
    queued: AtomicUsize,
}

/// Single-worker FIFO for motion tasks
pub struct MotionExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<MotionTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flags: Arc<WorkerFlags>,
}

impl MotionExecutor {
    /// Spawn the worker on the current tokio runtime
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let flags = Arc::new(WorkerFlags::default());
        let worker = tokio::spawn(run_worker(rx, flags.clone()));
        debug!("Motion executor started");

        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            flags,
        }
    }

    /// Queue a task behind everything already submitted
    pub fn submit(&self, task: MotionTask) -> MountResult<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return Err(MountError::invalid_operation(format!(
                "motion executor is stopped, cannot run '{}'",
                task.name
            )));
        };

        debug!("Queued motion task '{}'", task.name);
        self.flags.queued.fetch_add(1, Ordering::SeqCst);
        tx.send(task).map_err(|rejected| {
            self.flags.queued.fetch_sub(1, Ordering::SeqCst);
            MountError::invalid_operation(format!(
                "motion worker is gone, cannot run '{}'",
                rejected.0.name
            ))
        })
    }

    /// Whether a task is executing right now
    pub fn is_busy(&self) -> bool {
        self.flags.busy.load(Ordering::SeqCst)
    }

    /// Tasks submitted but not yet started
    pub fn queued(&self) -> usize {
        self.flags.queued.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting work and join the worker
    ///
    /// The task in flight runs to completion; tasks still queued are
    /// discarded. Fails with [`MountError::Timeout`] if the worker has not
    /// exited within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> MountResult<()> {
        self.flags.shutting_down.store(true, Ordering::SeqCst);
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => {
                info!("Motion executor stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Motion worker ended abnormally: {}", e);
                Ok(())
            }
            Err(_) => Err(MountError::Timeout(format!(
                "motion worker did not stop within {:?}",
                timeout
            ))),
        }
    }
}

impl Drop for MotionExecutor {
    fn drop(&mut self) {
        self.flags.shutting_down.store(true, Ordering::SeqCst);
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<MotionTask>, flags: Arc<WorkerFlags>) {
    while let Some(task) = rx.recv().await {
        flags.queued.fetch_sub(1, Ordering::SeqCst);
        let MotionTask { name, future } = task;

        if flags.shutting_down.load(Ordering::SeqCst) {
            warn!("Discarding motion task '{}' queued before shutdown", name);
            continue;
        }

        flags.busy.store(true, Ordering::SeqCst);
        debug!("Motion task '{}' started", name);
        let started = Instant::now();

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => debug!(
                "Motion task '{}' completed in {:.2}s",
                name,
                started.elapsed().as_secs_f64()
            ),
            Ok(Err(e)) => error!("Motion task '{}' failed: {}", name, e),
            Err(_) => error!("Motion task '{}' panicked", name),
        }

        flags.busy.store(false, Ordering::SeqCst);
    }
    debug!("Motion executor worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn executor_test_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_tasks_run_in_order_without_overlap() {
        let executor = MotionExecutor::start();
        let spans: Arc<Mutex<Vec<(usize, Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        const N: usize = 8;
        for i in 0..N {
            let spans = spans.clone();
            let done = if i == N - 1 { done_tx.take() } else { None };
            executor
                .submit(MotionTask::new(format!("task {}", i), async move {
                    let start = Instant::now();
                    // Later tasks are shorter, so overlap would reorder completion
                    tokio::time::sleep(Duration::from_millis((N - i) as u64 * 3)).await;
                    spans.lock().unwrap().push((i, start, Instant::now()));
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    Ok(())
                }))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), N);
        for (expected, (i, _, _)) in spans.iter().enumerate() {
            assert_eq!(*i, expected);
        }
        for pair in spans.windows(2) {
            assert!(pair[0].2 <= pair[1].1, "task {} overlapped task {}", pair[0].0, pair[1].0);
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_worker() {
        let executor = MotionExecutor::start();
        let (done_tx, done_rx) = oneshot::channel();

        executor
            .submit(MotionTask::new("fails", async {
                Err(MountError::Timeout("axis".to_string()))
            }))
            .unwrap();
        executor
            .submit(MotionTask::new("panics", async {
                if executor_test_should_panic() {
                    panic!("motion task blew up");
                }
                Ok(())
            }))
            .unwrap();
        executor
            .submit(MotionTask::new("survivor", async move {
                let _ = done_tx.send(());
                Ok(())
            }))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_finishes_in_flight_and_discards_queued() {
        let executor = MotionExecutor::start();
        let finished = Arc::new(AtomicBool::new(false));
        let discarded_ran = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = oneshot::channel();

        let flag = finished.clone();
        executor
            .submit(MotionTask::new("long", async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let flag = discarded_ran.clone();
        executor
            .submit(MotionTask::new("queued", async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        started_rx.await.unwrap();
        assert!(executor.is_busy());
        executor.stop(Duration::from_secs(2)).await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert!(!discarded_ran.load(Ordering::SeqCst));
        assert!(executor.is_stopped());
        assert_eq!(executor.queued(), 0);

        let err = executor
            .submit(MotionTask::new("late", async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, MountError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_stop_times_out_on_stuck_task() {
        let executor = MotionExecutor::start();
        let (started_tx, started_rx) = oneshot::channel();
        executor
            .submit(MotionTask::new("stuck", async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }))
            .unwrap();
        started_rx.await.unwrap();

        let err = executor.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, MountError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_worker() {
        let executor = MotionExecutor::start();
        let started = Instant::now();
        for i in 0..3 {
            executor
                .submit(MotionTask::new(format!("sleep {}", i), async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }))
                .unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
