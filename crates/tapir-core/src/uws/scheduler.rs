//! Admission control for queued jobs

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::query::connection::ConnectionPool;
use crate::uws::job::{JobHandle, JobPhase};
use crate::uws::phase::PhaseManager;
use crate::uws::worker::{JobThread, JobWork, WorkerContext};
use crate::uws::UwsError;

struct SchedulerInner {
    queue: VecDeque<Arc<JobHandle>>,
    running: HashSet<String>,
}

/// Decides when a QUEUED job may start executing
///
/// Ready jobs wait in strict FIFO order. A job is admitted when the
/// running count is below the concurrency ceiling and the connection pool
/// reports at least one free connection. Admission re-runs on every
/// refresh event: a new arrival, a finished job, a freed connection, or
/// an external notify.
pub struct ExecutionManager {
    max_concurrent: i32,
    pool: Arc<dyn ConnectionPool>,
    phase_manager: Arc<PhaseManager>,
    work: Arc<dyn JobWork>,
    stop_wait: Duration,
    inner: Arc<Mutex<SchedulerInner>>,
    // Serializes admission so starts keep the enqueue order
    admission: Mutex<()>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
}

impl ExecutionManager {
    pub fn new(
        max_concurrent: i32,
        pool: Arc<dyn ConnectionPool>,
        phase_manager: Arc<PhaseManager>,
        work: Arc<dyn JobWork>,
        stop_wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            pool,
            phase_manager,
            work,
            stop_wait,
            inner: Arc::new(Mutex::new(SchedulerInner {
                queue: VecDeque::new(),
                running: HashSet::new(),
            })),
            admission: Mutex::new(()),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Notify handle for collaborators (the connection pool signals here
    /// when a connection is released)
    pub fn refresh_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Start the background admission loop
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(
                "Execution manager running: max_concurrent={}",
                manager.max_concurrent
            );
            loop {
                tokio::select! {
                    _ = manager.notify.notified() => {
                        manager.refresh().await;
                    }
                    _ = manager.shutdown.cancelled() => {
                        info!("Execution manager stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Append a ready job and try to admit
    pub async fn enqueue(&self, job: Arc<JobHandle>) {
        {
            let mut inner = self.inner.lock().await;
            inner.queue.push_back(job);
        }
        self.refresh().await;
    }

    /// External refresh event
    pub fn notify_refresh(&self) {
        self.notify.notify_one();
    }

    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Admission predicate for one more job
    async fn may_admit(&self) -> bool {
        let free = self.pool.free_count();
        let free = if free < 0 {
            warn!("Connection pool reported a negative free count ({})", free);
            0
        } else {
            free
        };
        if free < 1 {
            return false;
        }
        if self.max_concurrent <= 0 {
            return true;
        }
        let running = self.inner.lock().await.running.len();
        running < self.max_concurrent as usize
    }

    /// Dequeue while the predicate holds, starting each admitted job
    pub async fn refresh(&self) {
        let _admission = self.admission.lock().await;

        loop {
            if !self.may_admit().await {
                return;
            }

            let job = {
                let mut inner = self.inner.lock().await;
                match inner.queue.pop_front() {
                    Some(job) => {
                        inner.running.insert(job.id().to_string());
                        job
                    }
                    None => return,
                }
            };

            match self.phase_manager.transition(&job, JobPhase::Executing).await {
                Ok(_) => {}
                Err(e) => {
                    // Typically aborted or destroyed while queued
                    debug!("Job {} skipped by the scheduler: {}", job.id(), e);
                    self.inner.lock().await.running.remove(job.id());
                    continue;
                }
            }

            if let Err(e) = self.spawn_worker(job.clone()) {
                // Resource exhaustion: put the job back at the head and
                // retry on the next refresh event
                warn!("Could not start a worker for job {}: {}", job.id(), e);
                if let Err(revert) = self.phase_manager.revert_to_queued(&job).await {
                    warn!("Could not requeue job {}: {}", job.id(), revert);
                }
                let mut inner = self.inner.lock().await;
                inner.running.remove(job.id());
                inner.queue.push_front(job);
                return;
            }
        }
    }

    fn spawn_worker(&self, job: Arc<JobHandle>) -> Result<(), UwsError> {
        let ctx = WorkerContext {
            phase_manager: self.phase_manager.clone(),
            work: self.work.clone(),
            stop_wait: self.stop_wait,
            on_finished: {
                let inner = self.inner.clone();
                let notify = self.notify.clone();
                Arc::new(move |job_id: &str| {
                    let inner = inner.clone();
                    let notify = notify.clone();
                    let job_id = job_id.to_string();
                    tokio::spawn(async move {
                        inner.lock().await.running.remove(&job_id);
                        notify.notify_one();
                    });
                })
            },
            on_requeue: {
                let inner = self.inner.clone();
                let notify = self.notify.clone();
                Arc::new(move |job: Arc<JobHandle>| {
                    let inner = inner.clone();
                    let notify = notify.clone();
                    tokio::spawn(async move {
                        let mut guard = inner.lock().await;
                        guard.running.remove(job.id());
                        guard.queue.push_front(job);
                        drop(guard);
                        notify.notify_one();
                    });
                })
            },
        };
        JobThread::spawn(ctx, job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::connection::tests_support::StubPool;
    use crate::query::params::TapParams;
    use crate::uws::job::Job;
    use crate::uws::worker::JobFault;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWork {
        concurrent: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        sleep_ms: u64,
    }

    #[async_trait]
    impl JobWork for CountingWork {
        async fn run(
            &self,
            _job: Arc<JobHandle>,
            _cancel: CancellationToken,
        ) -> Result<(), JobFault> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn queued_job(manager: &PhaseManager, id: &str) -> Arc<JobHandle> {
        let job = JobHandle::new(Job::new(id, "async", None, TapParams::default(), 0, 3600));
        manager.transition(&job, JobPhase::Queued).await.unwrap();
        job
    }

    fn make_manager(
        max_concurrent: i32,
        pool_free: i64,
        sleep_ms: u64,
    ) -> (Arc<ExecutionManager>, Arc<PhaseManager>, Arc<AtomicUsize>) {
        let phase_manager = Arc::new(PhaseManager::default());
        let peak = Arc::new(AtomicUsize::new(0));
        let work = Arc::new(CountingWork {
            concurrent: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            sleep_ms,
        });
        let pool = Arc::new(StubPool::with_free(pool_free));
        let manager = ExecutionManager::new(
            max_concurrent,
            pool,
            phase_manager.clone(),
            work,
            Duration::from_millis(200),
        );
        manager.start();
        (manager, phase_manager, peak)
    }

    #[tokio::test]
    async fn test_fifo_admission_with_ceiling_one() {
        let (manager, phase_manager, peak) = make_manager(1, 10, 50);
        let first = queued_job(&phase_manager, "s1").await;
        let second = queued_job(&phase_manager, "s2").await;

        manager.enqueue(first.clone()).await;
        manager.enqueue(second.clone()).await;

        // Second job must not start until the first is terminal
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first.phase(), JobPhase::Executing);
        assert_eq!(second.phase(), JobPhase::Queued);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while second.phase() != JobPhase::Completed && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(first.phase(), JobPhase::Completed);
        assert_eq!(second.phase(), JobPhase::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_admission_without_free_connection() {
        let (manager, phase_manager, _) = make_manager(4, 0, 10);
        let job = queued_job(&phase_manager, "s3").await;
        manager.enqueue(job.clone()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.phase(), JobPhase::Queued);
        assert_eq!(manager.queued_count().await, 1);
    }

    #[tokio::test]
    async fn test_freed_connection_triggers_admission() {
        let phase_manager = Arc::new(PhaseManager::default());
        let peak = Arc::new(AtomicUsize::new(0));
        let work = Arc::new(CountingWork {
            concurrent: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            sleep_ms: 10,
        });
        let pool = Arc::new(StubPool::with_free(0));
        let manager = ExecutionManager::new(
            2,
            pool.clone(),
            phase_manager.clone(),
            work,
            Duration::from_millis(200),
        );
        manager.start();

        let job = queued_job(&phase_manager, "s4").await;
        manager.enqueue(job.clone()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(job.phase(), JobPhase::Queued);

        // A connection frees up and the pool pings the scheduler
        pool.set_free(1);
        manager.notify_refresh();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while job.phase() != JobPhase::Completed && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(job.phase(), JobPhase::Completed);
    }

    #[tokio::test]
    async fn test_negative_free_count_treated_as_zero() {
        let (manager, phase_manager, _) = make_manager(4, -3, 10);
        let job = queued_job(&phase_manager, "s5").await;
        manager.enqueue(job.clone()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.phase(), JobPhase::Queued);
    }

    #[tokio::test]
    async fn test_aborted_while_queued_is_skipped() {
        let phase_manager = Arc::new(PhaseManager::default());
        let work = Arc::new(CountingWork {
            concurrent: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            sleep_ms: 10,
        });
        let pool = Arc::new(StubPool::with_free(0));
        let manager = ExecutionManager::new(
            1,
            pool.clone(),
            phase_manager.clone(),
            work,
            Duration::from_millis(200),
        );

        // The empty pool keeps the job queued
        let stuck = queued_job(&phase_manager, "s6").await;
        manager.enqueue(stuck.clone()).await;
        assert_eq!(stuck.phase(), JobPhase::Queued);

        // Abort it, then free a connection: the scheduler must skip it
        phase_manager
            .transition(&stuck, JobPhase::Aborted)
            .await
            .unwrap();
        pool.set_free(1);
        manager.refresh().await;

        assert_eq!(stuck.phase(), JobPhase::Aborted);
        assert_eq!(manager.running_count().await, 0);
        assert_eq!(manager.queued_count().await, 0);
    }

    #[tokio::test]
    async fn test_unbounded_ceiling_gated_only_by_pool() {
        let (manager, phase_manager, peak) = make_manager(0, 3, 50);
        let jobs: Vec<_> = {
            let mut out = Vec::new();
            for i in 0..3 {
                out.push(queued_job(&phase_manager, &format!("s7-{}", i)).await);
            }
            out
        };
        for job in &jobs {
            manager.enqueue(job.clone()).await;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while jobs.iter().any(|j| j.phase() != JobPhase::Completed)
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for job in &jobs {
            assert_eq!(job.phase(), JobPhase::Completed);
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
