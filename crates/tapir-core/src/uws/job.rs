//! Job state, identity and shared handles

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::query::params::TapParams;
use crate::query::report::ExecutionReport;

/// Job execution phase, following the UWS state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    /// Created, not yet asked to run
    Pending,

    /// Asked to run, waiting for an execution slot
    Queued,

    /// A worker is carrying out the job
    Executing,

    /// Finished successfully
    Completed,

    /// Cancelled by the client, a timeout or destruction
    Aborted,

    /// Finished with a fault
    Error,

    /// Phase could not be determined
    Unknown,

    /// Held by the service before queueing
    Held,

    /// Suspended by the service
    Suspended,

    /// Retained after completion, results possibly reclaimed
    Archived,
}

impl Default for JobPhase {
    fn default() -> Self {
        JobPhase::Pending
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl JobPhase {
    /// UWS wire name of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Pending => "PENDING",
            JobPhase::Queued => "QUEUED",
            JobPhase::Executing => "EXECUTING",
            JobPhase::Completed => "COMPLETED",
            JobPhase::Aborted => "ABORTED",
            JobPhase::Error => "ERROR",
            JobPhase::Unknown => "UNKNOWN",
            JobPhase::Held => "HELD",
            JobPhase::Suspended => "SUSPENDED",
            JobPhase::Archived => "ARCHIVED",
        }
    }

    /// Parse a UWS wire name (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(JobPhase::Pending),
            "QUEUED" => Some(JobPhase::Queued),
            "EXECUTING" => Some(JobPhase::Executing),
            "COMPLETED" => Some(JobPhase::Completed),
            "ABORTED" => Some(JobPhase::Aborted),
            "ERROR" => Some(JobPhase::Error),
            "UNKNOWN" => Some(JobPhase::Unknown),
            "HELD" => Some(JobPhase::Held),
            "SUSPENDED" => Some(JobPhase::Suspended),
            "ARCHIVED" => Some(JobPhase::Archived),
            _ => None,
        }
    }

    /// Check if the phase is terminal (won't change)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Aborted | JobPhase::Error | JobPhase::Archived
        )
    }

    /// Check if a worker is or may become active in this phase
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobPhase::Pending | JobPhase::Queued | JobPhase::Executing
        )
    }
}

/// Severity of a terminal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// A retry of the same submission might succeed
    Transient,

    /// The submission itself is at fault
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Transient => write!(f, "transient"),
            ErrorType::Fatal => write!(f, "fatal"),
        }
    }
}

/// Compact description of a terminal error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Human-readable message
    pub message: String,

    /// Severity
    pub error_type: ErrorType,

    /// Reference to a full error document, when one exists
    pub details_ref: Option<String>,
}

impl ErrorSummary {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: ErrorType::Fatal,
            details_ref: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: ErrorType::Transient,
            details_ref: None,
        }
    }
}

/// A named, typed, size-annotated output of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Result identifier, unique within the job
    pub id: String,

    /// Href served to clients, relative to the job URL
    pub href: String,

    /// MIME type of the result body
    pub mime_type: String,

    /// Size in bytes, when known
    pub size: Option<u64>,

    /// Backing file for persisted results
    pub file: Option<PathBuf>,
}

/// Sub-stage tag within EXECUTING, used for timing and fault attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionProgression {
    Uploading,
    Parsing,
    Translating,
    ExecutingSql,
    WritingResult,
    Finished,
}

impl fmt::Display for ExecutionProgression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionProgression::Uploading => write!(f, "UPLOADING"),
            ExecutionProgression::Parsing => write!(f, "PARSING"),
            ExecutionProgression::Translating => write!(f, "TRANSLATING"),
            ExecutionProgression::ExecutingSql => write!(f, "EXECUTING_SQL"),
            ExecutionProgression::WritingResult => write!(f, "WRITING_RESULT"),
            ExecutionProgression::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Serializable job state
///
/// This is the unit persisted by the backup collaborator and the unit
/// returned by [`JobHandle::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id
    pub id: String,

    /// Name of the list owning this job
    pub job_list: String,

    /// Opaque user identity; None means anonymous
    pub owner: Option<String>,

    /// Submitted parameters
    pub params: TapParams,

    /// Current phase
    pub phase: JobPhase,

    /// Estimated completion time
    pub quote: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub creation_time: DateTime<Utc>,

    /// Set on first entry to EXECUTING
    pub start_time: Option<DateTime<Utc>>,

    /// Set on entry to a terminal phase
    pub end_time: Option<DateTime<Utc>>,

    /// When the job and its artifacts are evicted
    pub destruction_time: DateTime<Utc>,

    /// Max wall-clock seconds the job may run; 0 means unlimited
    pub execution_duration: u64,

    /// Ordered outputs
    pub results: Vec<JobResult>,

    /// Set when phase is ERROR (and on timeout aborts)
    pub error_summary: Option<ErrorSummary>,

    /// Sub-stage within EXECUTING
    pub progression: Option<ExecutionProgression>,

    /// Snapshot of the last execution, stamped at terminal phase
    pub report: Option<ExecutionReport>,
}

impl Job {
    /// Create a new PENDING job
    pub fn new(
        id: impl Into<String>,
        job_list: impl Into<String>,
        owner: Option<String>,
        params: TapParams,
        execution_duration: u64,
        destruction_interval: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_list: job_list.into(),
            owner,
            params,
            phase: JobPhase::Pending,
            quote: None,
            creation_time: now,
            start_time: None,
            end_time: None,
            destruction_time: now + Duration::seconds(destruction_interval.max(1) as i64),
            execution_duration,
            results: Vec::new(),
            error_summary: None,
            progression: None,
            report: None,
        }
    }

    /// Set the destruction time; rejects times not after creation
    pub fn set_destruction_time(
        &mut self,
        when: DateTime<Utc>,
    ) -> Result<(), crate::uws::UwsError> {
        if when <= self.creation_time {
            return Err(crate::uws::UwsError::BadParameter(format!(
                "Destruction time {} is not after the creation time",
                when.to_rfc3339()
            )));
        }
        self.destruction_time = when;
        Ok(())
    }

    /// Wall-clock duration of the execution, when finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Shared, lock-guarded job handle
///
/// All mutation flows through the phase manager or the owning worker;
/// readers take consistent snapshots. The phase is mirrored into a watch
/// channel so blocking-poll waiters never touch the lock.
pub struct JobHandle {
    id: String,
    job_list: String,
    state: RwLock<Job>,
    phase_tx: watch::Sender<JobPhase>,
    cancel: CancellationToken,
    destroyed: CancellationToken,
}

impl JobHandle {
    /// Wrap a job for shared use
    pub fn new(job: Job) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(job.phase);
        Arc::new(Self {
            id: job.id.clone(),
            job_list: job.job_list.clone(),
            state: RwLock::new(job),
            phase_tx,
            cancel: CancellationToken::new(),
            destroyed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the list owning this job (back-reference by name, not pointer)
    pub fn job_list(&self) -> &str {
        &self.job_list
    }

    /// Current phase, without touching the state lock
    pub fn phase(&self) -> JobPhase {
        *self.phase_tx.borrow()
    }

    /// Subscribe to phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<JobPhase> {
        self.phase_tx.subscribe()
    }

    /// Cooperative cancellation flag observed by the worker
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Raised once, when the job is removed from its list
    pub fn destroyed_token(&self) -> CancellationToken {
        self.destroyed.clone()
    }

    /// Mark the handle destroyed, releasing every blocked waiter
    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.cancel();
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Job> {
        self.state.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, Job> {
        self.state.write().await
    }

    /// Publish a phase to waiters; callers must hold the write guard
    pub(crate) fn publish_phase(&self, phase: JobPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Consistent copy of the whole job state
    pub async fn snapshot(&self) -> Job {
        self.state.read().await.clone()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("job_list", &self.job_list)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Monotonic job id generator: UTC second stamp plus an atomic counter
/// suffix to disambiguate ids minted within the same second.
pub struct JobIdGenerator {
    counter: AtomicU32,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Mint the next id
    pub fn next_id(&self) -> String {
        let stamp = Utc::now().format("%y%m%d%H%M%S");
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{:04x}", stamp, n & 0xffff)
    }
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
