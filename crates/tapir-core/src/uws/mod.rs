//! Universal Worker Service job engine
//!
//! This module is the long-running-job substrate under the TAP service:
//! - Job state with restricted phase transitions
//! - Blocking poll ("long poll") on phase changes
//! - Per-user job lists with insertion-ordered iteration
//! - FIFO admission gated by a concurrency ceiling and the DB pool
//! - Cancellation-aware worker tasks with watchdog timeouts
//! - Scheduled destruction of expired jobs
//! - Per-owner persistence with restore at startup
//!
//! ## Architecture
//!
//! HTTP request tasks never execute queries in the async path; they
//! create jobs, flip phases and observe. Each admitted job gets one
//! worker task holding an implicit exclusive lock for the EXECUTING
//! span. All job mutation flows through the [`phase::PhaseManager`], so
//! phase, timestamps, results and error summaries always change inside
//! one critical section.

pub mod backup;
pub mod destruction;
pub mod job;
pub mod phase;
pub mod scheduler;
pub mod store;
pub mod worker;

// Re-export main types
pub use backup::{FileBackup, JobBackup, RestoreReport};
pub use destruction::{DestructionScheduler, JobDestroyer};
pub use job::{
    ErrorSummary, ErrorType, ExecutionProgression, Job, JobHandle, JobIdGenerator, JobPhase,
    JobResult,
};
pub use phase::{PhaseManager, PhaseWait, WaitPolicy};
pub use scheduler::ExecutionManager;
pub use store::{JobList, JobStore};
pub use worker::{JobFault, JobThread, JobWork, WorkerContext, WorkerId};

use job::JobPhase as Phase;

/// Error types for the job engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum UwsError {
    #[error("Illegal phase transition: {from} -> {to}")]
    BadPhaseTransition { from: Phase, to: Phase },

    #[error("A job with id {0} already exists")]
    DuplicateId(String),

    #[error("No job with id {0}")]
    JobNotFound(String),

    #[error("Job {0} belongs to another user")]
    NotOwner(String),

    #[error("Invalid parameter: {0}")]
    BadParameter(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl UwsError {
    /// HTTP status this error maps to at the protocol surface
    pub fn status_code(&self) -> u16 {
        match self {
            UwsError::BadPhaseTransition { .. } => 400,
            UwsError::BadParameter(_) => 400,
            UwsError::JobNotFound(_) => 404,
            UwsError::NotOwner(_) => 403,
            UwsError::DuplicateId(_) => 500,
            UwsError::Persist(_) => 500,
            UwsError::Worker(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let err = UwsError::BadPhaseTransition {
            from: JobPhase::Completed,
            to: JobPhase::Executing,
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(UwsError::JobNotFound("x".into()).status_code(), 404);
        assert_eq!(UwsError::NotOwner("x".into()).status_code(), 403);
        assert_eq!(UwsError::DuplicateId("x".into()).status_code(), 500);
    }

    #[test]
    fn test_error_messages() {
        let err = UwsError::BadPhaseTransition {
            from: JobPhase::Pending,
            to: JobPhase::Completed,
        };
        assert!(err.to_string().contains("PENDING"));
        assert!(err.to_string().contains("COMPLETED"));
    }
}
