//! Per-job worker task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::uws::job::{ErrorSummary, JobHandle, JobPhase};
use crate::uws::phase::PhaseManager;

/// Unique worker identifier
pub type WorkerId = Uuid;

/// Terminal fault carried out of a job's work
#[derive(Debug, Clone)]
pub enum JobFault {
    /// The work failed; the summary is stamped onto the job
    Fatal(ErrorSummary),

    /// The work stopped because the cancel flag was raised
    Interrupted,

    /// No database connection was free; the job goes back in the queue
    /// and the scheduler retries on the next refresh
    NoConnection,
}

impl JobFault {
    pub fn fatal(message: impl Into<String>) -> Self {
        JobFault::Fatal(ErrorSummary::fatal(message))
    }
}

/// The work a job's worker carries out
///
/// Implementations write results and the execution report onto the job
/// themselves; the worker owns the final phase transition.
#[async_trait]
pub trait JobWork: Send + Sync {
    async fn run(&self, job: Arc<JobHandle>, cancel: CancellationToken) -> Result<(), JobFault>;
}

/// Everything a worker needs besides the job itself
#[derive(Clone)]
pub struct WorkerContext {
    pub phase_manager: Arc<PhaseManager>,
    pub work: Arc<dyn JobWork>,

    /// Grace period between raising the cancel flag and declaring the
    /// work leaked
    pub stop_wait: Duration,

    /// Invoked exactly once when the worker is done with the job,
    /// whatever the path
    pub on_finished: Arc<dyn Fn(&str) + Send + Sync>,

    /// Invoked instead of a terminal transition when the work could not
    /// get a connection; the receiver puts the job back at the queue head
    pub on_requeue: Arc<dyn Fn(Arc<JobHandle>) + Send + Sync>,
}

/// Why the worker is tearing the work down early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    ClientAbort,
    Timeout,
}

/// Cooperative carrier for one job's work
///
/// The work itself runs in its own task so a stuck DB call can be
/// abandoned (leaked) without losing its eventual cleanup; the worker
/// only ever waits on the join handle.
pub struct JobThread;

impl JobThread {
    /// Spawn the worker for a job already in EXECUTING
    pub fn spawn(ctx: WorkerContext, job: Arc<JobHandle>) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self::run(ctx, job).await;
        })
    }

    async fn run(ctx: WorkerContext, job: Arc<JobHandle>) {
        let worker_id = WorkerId::new_v4();
        let job_id = job.id().to_string();
        let cancel = job.cancel_token();
        let execution_duration = job.read().await.execution_duration;

        debug!(
            "Worker started: id={}, job={}, execution_duration={}s",
            worker_id, job_id, execution_duration
        );

        let mut work_task = tokio::spawn({
            let work = ctx.work.clone();
            let job = job.clone();
            let cancel = cancel.clone();
            async move { work.run(job, cancel).await }
        });

        let watchdog = async {
            if execution_duration > 0 {
                tokio::time::sleep(Duration::from_secs(execution_duration)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let stop_reason = tokio::select! {
            joined = &mut work_task => {
                Self::finish(&ctx, &job, Self::unwrap_join(&job_id, joined)).await;
                (ctx.on_finished)(&job_id);
                return;
            }
            _ = cancel.cancelled() => StopReason::ClientAbort,
            _ = watchdog => {
                info!("Job {} exceeded its {}s execution duration", job_id, execution_duration);
                StopReason::Timeout
            }
        };

        // Raise the flag (a no-op for client aborts) and grant the work a
        // bounded grace period to yield
        cancel.cancel();
        let graceful = tokio::time::timeout(ctx.stop_wait, &mut work_task).await;

        let summary = match stop_reason {
            StopReason::Timeout => ErrorSummary::fatal(format!(
                "Execution timeout: the job exceeded its {} second execution duration",
                execution_duration
            )),
            StopReason::ClientAbort => ErrorSummary::transient("Job aborted on client request"),
        };

        match graceful {
            Ok(_joined) => {
                // The work yielded within the stop wait; whatever it
                // returned, the job is aborted.
                Self::abort(&ctx, &job, summary).await;
            }
            Err(_) => {
                // The work did not yield: mark the job aborted anyway and
                // leave the task to finish its cleanup on its own time.
                warn!(
                    "Job {} worker leaked: work did not stop within {:?}",
                    job_id, ctx.stop_wait
                );
                Self::abort(&ctx, &job, summary).await;
                let leaked_id = job_id.clone();
                tokio::spawn(async move {
                    let _ = work_task.await;
                    debug!("Leaked worker for job {} eventually finished", leaked_id);
                });
            }
        }

        (ctx.on_finished)(&job_id);
    }

    fn unwrap_join(
        job_id: &str,
        joined: Result<Result<(), JobFault>, tokio::task::JoinError>,
    ) -> Result<(), JobFault> {
        match joined {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!("Job {} work task panicked: {}", job_id, join_error);
                Err(JobFault::fatal("Internal error while executing the query"))
            }
        }
    }

    async fn finish(ctx: &WorkerContext, job: &Arc<JobHandle>, outcome: Result<(), JobFault>) {
        let result = match outcome {
            Ok(()) => ctx.phase_manager.transition(job, JobPhase::Completed).await,
            Err(JobFault::Interrupted) => {
                ctx.phase_manager
                    .transition_with(job, JobPhase::Aborted, |state| {
                        if state.error_summary.is_none() {
                            state.error_summary =
                                Some(ErrorSummary::transient("Job aborted before completion"));
                        }
                    })
                    .await
            }
            Err(JobFault::NoConnection) => {
                debug!("Job {} found no free connection; requeueing", job.id());
                if let Err(e) = ctx.phase_manager.revert_to_queued(job).await {
                    debug!("Job {} requeue transition skipped: {}", job.id(), e);
                } else {
                    (ctx.on_requeue)(job.clone());
                }
                return;
            }
            Err(JobFault::Fatal(summary)) => {
                ctx.phase_manager
                    .transition_with(job, JobPhase::Error, |state| {
                        state.error_summary = Some(summary);
                    })
                    .await
            }
        };

        if let Err(e) = result {
            // A racing abort or destruction already made the job terminal
            debug!("Job {} final transition skipped: {}", job.id(), e);
        }
    }

    async fn abort(ctx: &WorkerContext, job: &JobHandle, summary: ErrorSummary) {
        let result = ctx
            .phase_manager
            .transition_with(job, JobPhase::Aborted, |state| {
                state.error_summary = Some(summary);
            })
            .await;
        if let Err(e) = result {
            debug!("Job {} abort transition skipped: {}", job.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::params::TapParams;
    use crate::uws::job::Job;
    use crate::uws::phase::WaitPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepWork {
        sleep_ms: u64,
        outcome: Result<(), JobFault>,
        honor_cancel: bool,
    }

    #[async_trait]
    impl JobWork for SleepWork {
        async fn run(
            &self,
            _job: Arc<JobHandle>,
            cancel: CancellationToken,
        ) -> Result<(), JobFault> {
            let nap = tokio::time::sleep(Duration::from_millis(self.sleep_ms));
            if self.honor_cancel {
                tokio::select! {
                    _ = nap => {}
                    _ = cancel.cancelled() => return Err(JobFault::Interrupted),
                }
            } else {
                nap.await;
            }
            self.outcome.clone()
        }
    }

    async fn executing_job(id: &str, execution_duration: u64) -> Arc<JobHandle> {
        let manager = PhaseManager::default();
        let job = JobHandle::new(Job::new(
            id,
            "async",
            None,
            TapParams::default(),
            execution_duration,
            3600,
        ));
        manager.transition(&job, JobPhase::Queued).await.unwrap();
        manager.transition(&job, JobPhase::Executing).await.unwrap();
        job
    }

    fn context(
        work: Arc<dyn JobWork>,
        finished: Arc<AtomicUsize>,
        requeued: Arc<AtomicUsize>,
    ) -> WorkerContext {
        WorkerContext {
            phase_manager: Arc::new(PhaseManager::new(WaitPolicy::default())),
            work,
            stop_wait: Duration::from_millis(200),
            on_finished: Arc::new(move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            }),
            on_requeue: Arc::new(move |_| {
                requeued.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[tokio::test]
    async fn test_successful_work_completes_job() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w1", 0).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 10,
                outcome: Ok(()),
                honor_cancel: true,
            }),
            finished.clone(),
            requeued.clone(),
        );

        JobThread::spawn(ctx, job.clone()).await.unwrap();

        assert_eq!(job.phase(), JobPhase::Completed);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(job.read().await.end_time.is_some());
    }

    #[tokio::test]
    async fn test_faulting_work_errors_job() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w2", 0).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 10,
                outcome: Err(JobFault::fatal("query failed")),
                honor_cancel: true,
            }),
            finished.clone(),
            requeued.clone(),
        );

        JobThread::spawn(ctx, job.clone()).await.unwrap();

        assert_eq!(job.phase(), JobPhase::Error);
        let state = job.read().await;
        assert_eq!(
            state.error_summary.as_ref().unwrap().message,
            "query failed"
        );
    }

    #[tokio::test]
    async fn test_no_connection_requeues_job() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w3", 0).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 5,
                outcome: Err(JobFault::NoConnection),
                honor_cancel: true,
            }),
            finished.clone(),
            requeued.clone(),
        );

        JobThread::spawn(ctx, job.clone()).await.unwrap();

        assert_eq!(job.phase(), JobPhase::Queued);
        assert!(job.read().await.start_time.is_none());
        assert_eq!(requeued.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_abort_interrupts_work() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w4", 0).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 10_000,
                outcome: Ok(()),
                honor_cancel: true,
            }),
            finished.clone(),
            requeued.clone(),
        );

        let worker = JobThread::spawn(ctx, job.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        job.cancel_token().cancel();
        worker.await.unwrap();

        assert_eq!(job.phase(), JobPhase::Aborted);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_aborts_with_timeout_summary() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w5", 1).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 30_000,
                outcome: Ok(()),
                honor_cancel: true,
            }),
            finished.clone(),
            requeued.clone(),
        );

        JobThread::spawn(ctx, job.clone()).await.unwrap();

        assert_eq!(job.phase(), JobPhase::Aborted);
        let state = job.read().await;
        assert!(state
            .error_summary
            .as_ref()
            .unwrap()
            .message
            .contains("timeout"));
    }

    #[tokio::test]
    async fn test_stuck_work_is_leaked_but_job_aborts() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requeued = Arc::new(AtomicUsize::new(0));
        let job = executing_job("w6", 0).await;
        let ctx = context(
            Arc::new(SleepWork {
                sleep_ms: 60_000,
                outcome: Ok(()),
                // Ignores the cancel flag entirely
                honor_cancel: false,
            }),
            finished.clone(),
            requeued.clone(),
        );

        let worker = JobThread::spawn(ctx, job.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        job.cancel_token().cancel();
        worker.await.unwrap();

        // The worker returned (job aborted) even though the work never
        // observed the flag
        assert_eq!(job.phase(), JobPhase::Aborted);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
