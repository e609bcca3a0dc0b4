//! Phase state machine and blocking-poll support

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::uws::job::{Job, JobHandle, JobPhase};
use crate::uws::UwsError;

/// Outcome of a blocking poll on a job's phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseWait {
    /// The phase moved away from the observed one
    Changed(JobPhase),

    /// The wait budget elapsed first; carries the unchanged phase
    TimedOut(JobPhase),

    /// The job was destroyed while waiting
    Destroyed,
}

/// Cap applied to client-requested waits
///
/// A `None` cap lets `WAIT=-1` block until the phase changes; the default
/// policy caps every wait at 60 seconds.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub cap: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            cap: Some(Duration::from_secs(60)),
        }
    }
}

impl WaitPolicy {
    pub fn capped(seconds: u64) -> Self {
        Self {
            cap: Some(Duration::from_secs(seconds)),
        }
    }

    /// Effective wait for a client request; `None` request means
    /// "until change" and resolves to the cap itself.
    fn effective(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested, self.cap) {
            (Some(req), Some(cap)) => Some(req.min(cap)),
            (Some(req), None) => Some(req),
            (None, cap) => cap,
        }
    }
}

/// Enforces legal phase transitions and wakes blocked waiters
///
/// All side effects of a transition (timestamps, extra state mutation,
/// waiter notification) happen while the job's write lock is held, so a
/// reader of `(phase, end_time, results, error_summary)` always sees a
/// snapshot belonging to one transition.
pub struct PhaseManager {
    wait_policy: WaitPolicy,
}

impl PhaseManager {
    pub fn new(wait_policy: WaitPolicy) -> Self {
        Self { wait_policy }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait_policy
    }

    /// Check the legal transition table
    pub fn is_legal(from: JobPhase, to: JobPhase) -> bool {
        matches!(
            (from, to),
            (JobPhase::Pending, JobPhase::Queued)
                | (JobPhase::Pending, JobPhase::Aborted)
                | (JobPhase::Queued, JobPhase::Executing)
                | (JobPhase::Queued, JobPhase::Aborted)
                | (JobPhase::Executing, JobPhase::Completed)
                | (JobPhase::Executing, JobPhase::Error)
                | (JobPhase::Executing, JobPhase::Aborted)
                | (JobPhase::Completed, JobPhase::Archived)
                | (JobPhase::Error, JobPhase::Archived)
        )
    }

    /// Atomically move the job to `target`
    ///
    /// Illegal targets fail without touching the job.
    pub async fn transition(&self, job: &JobHandle, target: JobPhase) -> Result<JobPhase, UwsError> {
        self.transition_with(job, target, |_| {}).await
    }

    /// Atomically move the job to `target`, applying `mutate` in the same
    /// critical section (results, error summaries, reports)
    pub async fn transition_with<F>(
        &self,
        job: &JobHandle,
        target: JobPhase,
        mutate: F,
    ) -> Result<JobPhase, UwsError>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = job.write().await;
        let current = state.phase;

        if !Self::is_legal(current, target) {
            return Err(UwsError::BadPhaseTransition {
                from: current,
                to: target,
            });
        }

        state.phase = target;
        if target == JobPhase::Executing {
            state.start_time = Some(Utc::now());
        }
        if target.is_terminal() {
            // Archival of an already-terminal job keeps its end time
            if state.end_time.is_none() {
                state.end_time = Some(Utc::now());
            }
            state.progression = None;
        }
        mutate(&mut state);
        job.publish_phase(target);

        Ok(target)
    }

    /// Put a job that could not start back in the queue
    ///
    /// Only meaningful right after QUEUED→EXECUTING, before any work ran;
    /// clears the start time the entry stamped.
    pub(crate) async fn revert_to_queued(&self, job: &JobHandle) -> Result<(), UwsError> {
        let mut state = job.write().await;
        if state.phase != JobPhase::Executing {
            return Err(UwsError::BadPhaseTransition {
                from: state.phase,
                to: JobPhase::Queued,
            });
        }
        state.phase = JobPhase::Queued;
        state.start_time = None;
        job.publish_phase(JobPhase::Queued);
        Ok(())
    }

    /// Block until the phase differs from `from_phase`, the wait elapses,
    /// or the job is destroyed
    ///
    /// `requested` is the client's WAIT value; `None` means "until change"
    /// and is still subject to the policy cap.
    pub async fn await_phase_change(
        &self,
        job: &JobHandle,
        from_phase: JobPhase,
        requested: Option<Duration>,
    ) -> PhaseWait {
        let budget = self.wait_policy.effective(requested);
        let deadline = budget.map(|d| Instant::now() + d);
        let destroyed = job.destroyed_token();
        let mut rx = job.phase_receiver();

        let wait = async {
            match rx.wait_for(|phase| *phase != from_phase).await {
                Ok(phase) => PhaseWait::Changed(*phase),
                // Sender dropped: the handle is gone
                Err(_) => PhaseWait::Destroyed,
            }
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    outcome = wait => outcome,
                    _ = destroyed.cancelled() => PhaseWait::Destroyed,
                    _ = tokio::time::sleep_until(deadline) => PhaseWait::TimedOut(job.phase()),
                }
            }
            None => {
                tokio::select! {
                    outcome = wait => outcome,
                    _ = destroyed.cancelled() => PhaseWait::Destroyed,
                }
            }
        }
    }
}

impl Default for PhaseManager {
    fn default() -> Self {
        Self::new(WaitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::params::TapParams;
    use crate::uws::job::ErrorSummary;
    use std::sync::Arc;

    fn make_job(id: &str) -> Arc<JobHandle> {
        JobHandle::new(Job::new(id, "async", None, TapParams::default(), 0, 3600))
    }

    #[tokio::test]
    async fn test_legal_lifecycle() {
        let manager = PhaseManager::default();
        let job = make_job("j1");

        manager.transition(&job, JobPhase::Queued).await.unwrap();
        manager.transition(&job, JobPhase::Executing).await.unwrap();
        {
            let state = job.read().await;
            assert!(state.start_time.is_some());
            assert!(state.end_time.is_none());
        }
        manager.transition(&job, JobPhase::Completed).await.unwrap();
        let state = job.read().await;
        assert!(state.end_time.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state_unchanged() {
        let manager = PhaseManager::default();
        let job = make_job("j2");

        let err = manager
            .transition(&job, JobPhase::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, UwsError::BadPhaseTransition { .. }));
        assert_eq!(job.phase(), JobPhase::Pending);
        assert!(job.read().await.end_time.is_none());
    }

    #[tokio::test]
    async fn test_same_phase_is_not_a_transition() {
        let manager = PhaseManager::default();
        let job = make_job("j3");
        assert!(manager.transition(&job, JobPhase::Pending).await.is_err());
    }

    #[tokio::test]
    async fn test_error_summary_set_in_same_critical_section() {
        let manager = PhaseManager::default();
        let job = make_job("j4");
        manager.transition(&job, JobPhase::Queued).await.unwrap();
        manager.transition(&job, JobPhase::Executing).await.unwrap();

        manager
            .transition_with(&job, JobPhase::Error, |state| {
                state.error_summary = Some(ErrorSummary::fatal("syntax error at position 3"));
            })
            .await
            .unwrap();

        let state = job.read().await;
        assert_eq!(state.phase, JobPhase::Error);
        assert!(state.end_time.is_some());
        assert!(state.error_summary.is_some());
    }

    #[tokio::test]
    async fn test_await_returns_on_change() {
        let manager = Arc::new(PhaseManager::default());
        let job = make_job("j5");

        let waiter = {
            let manager = manager.clone();
            let job = job.clone();
            tokio::spawn(async move {
                manager
                    .await_phase_change(&job, JobPhase::Pending, Some(Duration::from_secs(30)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.transition(&job, JobPhase::Queued).await.unwrap();

        assert_eq!(waiter.await.unwrap(), PhaseWait::Changed(JobPhase::Queued));
    }

    #[tokio::test]
    async fn test_await_times_out() {
        let manager = PhaseManager::default();
        let job = make_job("j6");

        let started = std::time::Instant::now();
        let outcome = manager
            .await_phase_change(&job, JobPhase::Pending, Some(Duration::from_millis(50)))
            .await;
        assert_eq!(outcome, PhaseWait::TimedOut(JobPhase::Pending));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_await_capped_by_policy() {
        let manager = PhaseManager::new(WaitPolicy::capped(0));
        let job = make_job("j7");

        // A huge requested wait collapses to the zero-second cap
        let outcome = manager
            .await_phase_change(&job, JobPhase::Pending, Some(Duration::from_secs(3600)))
            .await;
        assert_eq!(outcome, PhaseWait::TimedOut(JobPhase::Pending));
    }

    #[tokio::test]
    async fn test_await_released_by_destruction() {
        let manager = Arc::new(PhaseManager::new(WaitPolicy { cap: None }));
        let job = make_job("j8");

        let waiter = {
            let manager = manager.clone();
            let job = job.clone();
            tokio::spawn(async move { manager.await_phase_change(&job, JobPhase::Pending, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        job.mark_destroyed();

        assert_eq!(waiter.await.unwrap(), PhaseWait::Destroyed);
    }

    #[tokio::test]
    async fn test_already_changed_returns_immediately() {
        let manager = PhaseManager::default();
        let job = make_job("j9");
        manager.transition(&job, JobPhase::Queued).await.unwrap();

        let outcome = manager
            .await_phase_change(&job, JobPhase::Pending, Some(Duration::from_secs(30)))
            .await;
        assert_eq!(outcome, PhaseWait::Changed(JobPhase::Queued));
    }
}
