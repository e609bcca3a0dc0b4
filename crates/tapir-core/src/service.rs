//! Service-level registry and operations
//!
//! One [`TapService`] owns the job lists, the execution manager, the
//! destruction scheduler and the query pipeline. Collaborators are
//! assembled once at startup into a [`ServiceComponents`] value; nothing
//! here dispatches through factory hierarchies, and jobs refer back to
//! their list by name only.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::identity::{AnonymousIdentifier, UserIdentifier};
use crate::metadata::{MetadataProvider, StaticMetadata};
use crate::query::connection::ConnectionPool;
use crate::query::format::FormatterRegistry;
use crate::query::params::RequestParams;
use crate::query::parser::{AdqlParser, QueryParser};
use crate::query::pipeline::{PipelineContext, QueryPipeline};
use crate::query::sink::{ChannelSink, FileSink};
use crate::query::translator::{PostgresTranslator, QueryTranslator};
use crate::query::upload::UploadManager;
use crate::query::QueryError;
use crate::uws::backup::{FileBackup, JobBackup};
use crate::uws::destruction::{DestructionScheduler, JobDestroyer};
use crate::uws::job::{
    ErrorSummary, ExecutionProgression, Job, JobHandle, JobIdGenerator, JobPhase, JobResult,
};
use crate::uws::phase::{PhaseManager, PhaseWait, WaitPolicy};
use crate::uws::scheduler::ExecutionManager;
use crate::uws::store::JobStore;
use crate::uws::worker::{JobFault, JobWork};
use crate::uws::UwsError;

/// Name of the standard asynchronous job list
pub const ASYNC_LIST: &str = "async";

/// Collaborators assembled once at service start
pub struct ServiceComponents {
    pub parser: Arc<dyn QueryParser>,
    pub translator: Arc<dyn QueryTranslator>,
    pub pool: Arc<dyn ConnectionPool>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub identifier: Arc<dyn UserIdentifier>,

    /// Overrides the file backup built from the config when set
    pub backup: Option<Arc<dyn JobBackup>>,
}

impl ServiceComponents {
    /// Reference collaborators around the given pool
    pub fn standard(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            parser: Arc::new(AdqlParser::new()),
            translator: Arc::new(PostgresTranslator::new()),
            pool,
            metadata: Arc::new(StaticMetadata::empty()),
            identifier: Arc::new(AnonymousIdentifier),
            backup: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_identifier(mut self, identifier: Arc<dyn UserIdentifier>) -> Self {
        self.identifier = identifier;
        self
    }
}

/// Streaming response of a synchronous query
#[derive(Debug)]
pub struct SyncStream {
    pub content_type: String,
    pub first_chunk: Option<Vec<u8>>,
    pub rest: mpsc::Receiver<Vec<u8>>,
}

/// The TAP service core
pub struct TapService {
    config: ServiceConfig,
    store: JobStore,
    phase_manager: Arc<PhaseManager>,
    scheduler: Arc<ExecutionManager>,
    destruction: Arc<DestructionScheduler>,
    pipeline: Arc<QueryPipeline>,
    pool: Arc<dyn ConnectionPool>,
    uploads: UploadManager,
    metadata: Arc<dyn MetadataProvider>,
    identifier: Arc<dyn UserIdentifier>,
    backup: Option<Arc<dyn JobBackup>>,
    backup_enabled: AtomicBool,
    id_gen: JobIdGenerator,
    available: AtomicBool,
    availability_note: std::sync::RwLock<String>,
}

impl TapService {
    pub fn new(config: ServiceConfig, components: ServiceComponents) -> Arc<Self> {
        let formatters = Arc::new(FormatterRegistry::standard(config.default_format.clone()));
        let pipeline = Arc::new(QueryPipeline::new(
            components.parser,
            components.translator,
            components.pool.clone(),
            UploadManager::new(config.upload_schema.clone()),
            formatters,
            config.max_rec,
            config.default_max_rec,
        ));

        let wait_policy = if config.wait_cap == 0 {
            WaitPolicy { cap: None }
        } else {
            WaitPolicy::capped(config.wait_cap)
        };
        let phase_manager = Arc::new(PhaseManager::new(wait_policy));

        let work: Arc<dyn JobWork> = Arc::new(PipelineWork {
            pipeline: pipeline.clone(),
            storage_dir: config.storage_dir.clone(),
        });
        let scheduler = ExecutionManager::new(
            config.max_async_jobs,
            components.pool.clone(),
            phase_manager.clone(),
            work,
            Duration::from_secs(config.stop_wait.max(1)),
        );

        let backup: Option<Arc<dyn JobBackup>> = match components.backup {
            Some(backup) => Some(backup),
            None if config.backup_enabled => {
                Some(Arc::new(FileBackup::new(config.storage_dir.clone())))
            }
            None => None,
        };
        let backup_enabled = AtomicBool::new(backup.is_some());

        let store = JobStore::new();
        store.get_or_create(ASYNC_LIST);

        Arc::new(Self {
            uploads: UploadManager::new(config.upload_schema.clone()),
            config,
            store,
            phase_manager,
            scheduler,
            destruction: DestructionScheduler::new(),
            pipeline,
            pool: components.pool,
            metadata: components.metadata,
            identifier: components.identifier,
            backup,
            backup_enabled,
            id_gen: JobIdGenerator::new(),
            available: AtomicBool::new(true),
            availability_note: std::sync::RwLock::new("Service is up".to_string()),
        })
    }

    /// Start background tasks and restore persisted jobs
    pub async fn start(self: &Arc<Self>) {
        self.scheduler.start();
        self.destruction.start(Arc::new(DestroyerAdapter {
            service: Arc::downgrade(self),
        }));
        self.restore().await;
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        self.destruction.stop();
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    pub fn formatters(&self) -> &FormatterRegistry {
        self.pipeline.formatters()
    }

    pub fn phase_manager(&self) -> &PhaseManager {
        &self.phase_manager
    }

    /// Scheduler refresh signal, for pools that notify on release
    pub fn refresh_notify(&self) -> Arc<tokio::sync::Notify> {
        self.scheduler.refresh_notify()
    }

    pub fn identify(&self, headers: &http::HeaderMap) -> Option<String> {
        self.identifier.identify(headers)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn availability_note(&self) -> String {
        self.availability_note.read().unwrap().clone()
    }

    pub fn set_available(&self, available: bool, note: impl Into<String>) {
        self.available.store(available, Ordering::SeqCst);
        *self.availability_note.write().unwrap() = note.into();
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::unavailable(self.availability_note()))
        }
    }

    pub fn job_list_names(&self) -> Vec<String> {
        self.store.names()
    }

    // ------------------------------------------------------------------
    // Job lifecycle operations
    // ------------------------------------------------------------------

    /// Create a job from decoded request parameters
    ///
    /// Honors PHASE=RUN given at creation; 303s to the job are the
    /// caller's concern.
    pub async fn create_job(
        self: &Arc<Self>,
        list_name: &str,
        owner: Option<String>,
        request: &RequestParams,
    ) -> Result<Arc<JobHandle>, Error> {
        self.ensure_available()?;

        let params = request.to_tap_params(self.config.uploads_enabled)?;
        validate_lang(&params)?;

        let execution_duration = match request.get("EXECUTIONDURATION") {
            Some(raw) => parse_duration_param(raw)?,
            None => self.config.default_execution_duration,
        };
        let execution_duration = self.cap_execution_duration(execution_duration);

        let list = self.store.get_or_create(list_name);

        // Ids carry a second-resolution stamp; regenerate on the rare
        // same-second collision
        let mut handle = None;
        for _ in 0..3 {
            let id = self.id_gen.next_id();
            let mut job = Job::new(
                id,
                list_name,
                owner.clone(),
                params.clone(),
                execution_duration,
                self.config.default_destruction_interval,
            );
            if execution_duration > 0 {
                job.quote = Some(job.creation_time + chrono::Duration::seconds(execution_duration as i64));
            }
            let candidate = JobHandle::new(job);
            match list.add(candidate.clone()).await {
                Ok(()) => {
                    handle = Some(candidate);
                    break;
                }
                Err(UwsError::DuplicateId(id)) => {
                    warn!("Job id collision on {}, regenerating", id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let handle = handle.ok_or_else(|| Error::Other("Could not allocate a job id".into()))?;

        if let Some(raw) = request.get("DESTRUCTION") {
            let when = parse_destruction_param(raw)?;
            self.apply_destruction_time(&handle, when).await?;
        }

        let destruction_time = handle.read().await.destruction_time;
        self.destruction
            .schedule(list_name, handle.id(), destruction_time)
            .await;

        info!(
            "Job created: list={}, id={}, owner={}",
            list_name,
            handle.id(),
            owner.as_deref().unwrap_or("anonymous")
        );
        self.save_owner_snapshot(owner.as_deref()).await;

        if let Some(phase) = request.get("PHASE") {
            if phase.eq_ignore_ascii_case("RUN") {
                self.run_job(&handle).await?;
            }
        }

        Ok(handle)
    }

    pub async fn get_job(
        &self,
        list_name: &str,
        id: &str,
        caller: Option<&str>,
    ) -> Result<Arc<JobHandle>, Error> {
        let list = self
            .store
            .get(list_name)
            .ok_or_else(|| Error::not_found(format!("No job list named {}", list_name)))?;
        Ok(list.get_visible(id, caller).await?)
    }

    /// Snapshots of the jobs visible to the caller, in insertion order
    pub async fn list_jobs(&self, list_name: &str, caller: Option<&str>) -> Vec<Job> {
        let list = self.store.get_or_create(list_name);
        let mut jobs = Vec::new();
        for handle in list.iterate(caller).await {
            jobs.push(handle.snapshot().await);
        }
        jobs
    }

    /// PHASE=RUN: queue the job; a no-op when it is already on its way
    pub async fn run_job(self: &Arc<Self>, job: &Arc<JobHandle>) -> Result<(), Error> {
        match job.phase() {
            JobPhase::Pending => {
                self.phase_manager.transition(job, JobPhase::Queued).await?;
                self.scheduler.enqueue(job.clone()).await;
                let owner = job.read().await.owner.clone();
                self.save_owner_snapshot(owner.as_deref()).await;
                Ok(())
            }
            // Already queued or running: idempotent
            JobPhase::Queued | JobPhase::Executing => Ok(()),
            from => Err(UwsError::BadPhaseTransition {
                from,
                to: JobPhase::Queued,
            }
            .into()),
        }
    }

    /// PHASE=ABORT: cancel the job; a no-op once it is terminal
    pub async fn abort_job(&self, job: &Arc<JobHandle>) -> Result<(), Error> {
        match job.phase() {
            JobPhase::Pending | JobPhase::Queued => {
                job.cancel_token().cancel();
                self.phase_manager
                    .transition_with(job, JobPhase::Aborted, |state| {
                        state.error_summary =
                            Some(ErrorSummary::transient("Job aborted on client request"));
                    })
                    .await?;
            }
            JobPhase::Executing => {
                // The worker observes the flag at its next checkpoint or
                // through the DB cancel hook
                job.cancel_token().cancel();
            }
            _ => {}
        }
        let owner = job.read().await.owner.clone();
        self.save_owner_snapshot(owner.as_deref()).await;
        Ok(())
    }

    /// Destroy a job on behalf of its owner
    ///
    /// Returns false when the job was already gone (double destroy is a
    /// no-op).
    pub async fn destroy_job(
        &self,
        list_name: &str,
        id: &str,
        caller: Option<&str>,
    ) -> Result<bool, Error> {
        let list = match self.store.get(list_name) {
            Some(list) => list,
            None => return Ok(false),
        };
        if list.get(id).await.is_none() {
            return Ok(false);
        }

        // Visibility is checked before anything is torn down
        list.get_visible(id, caller).await?;
        self.destroy_handle(list_name, id).await;
        Ok(true)
    }

    /// Tear a job down: abort, clean artifacts, unlink
    async fn destroy_handle(&self, list_name: &str, id: &str) {
        let list = match self.store.get(list_name) {
            Some(list) => list,
            None => return,
        };
        let handle = match list.remove(id).await {
            Some(handle) => handle,
            None => return,
        };

        // Destruction implies abort for jobs still on their way
        handle.cancel_token().cancel();
        let phase = handle.phase();
        if matches!(phase, JobPhase::Pending | JobPhase::Queued | JobPhase::Executing) {
            let result = self
                .phase_manager
                .transition_with(&handle, JobPhase::Aborted, |state| {
                    state.error_summary = Some(ErrorSummary::transient("Job destroyed"));
                })
                .await;
            if let Err(e) = result {
                debug!("Job {} abort-on-destroy skipped: {}", id, e);
            }
        }

        let snapshot = handle.snapshot().await;

        // Per-job artifacts
        let dir = self.config.storage_dir.join("jobs").join(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove artifacts of job {}: {}", id, e);
            }
        }

        // Leftover uploaded temporaries; the pipeline drops its own on
        // every exit path, this covers jobs that never ran
        if !snapshot.params.uploads.is_empty() {
            let tables: Vec<String> = snapshot
                .params
                .uploads
                .iter()
                .map(|u| u.name.clone())
                .collect();
            match self.pool.acquire(id).await {
                Ok(mut conn) => {
                    if let Err(e) = self.uploads.drop_tables(conn.as_mut(), id, &tables).await {
                        warn!("Upload cleanup for destroyed job {} failed: {}", id, e);
                    }
                    self.pool.release(conn).await;
                }
                Err(_) => {
                    warn!(
                        "No connection to clean uploads of destroyed job {}; tables may linger",
                        id
                    );
                }
            }
        }

        // Release blocked waiters last
        handle.mark_destroyed();
        info!("Job destroyed: list={}, id={}", list_name, id);

        self.save_owner_snapshot(snapshot.owner.as_deref()).await;
    }

    /// Move a finished job into archival retention
    ///
    /// The job keeps its summary and report; its result files are
    /// reclaimed.
    pub async fn archive_job(&self, job: &Arc<JobHandle>) -> Result<(), Error> {
        self.phase_manager
            .transition_with(job, JobPhase::Archived, |state| {
                state.results.clear();
            })
            .await?;

        let dir = self.config.storage_dir.join("jobs").join(job.id());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not reclaim results of archived job {}: {}", job.id(), e);
            }
        }

        let owner = job.read().await.owner.clone();
        self.save_owner_snapshot(owner.as_deref()).await;
        Ok(())
    }

    pub async fn set_execution_duration(
        &self,
        job: &Arc<JobHandle>,
        seconds: u64,
    ) -> Result<u64, Error> {
        self.ensure_pending(job).await?;
        let capped = self.cap_execution_duration(seconds);
        {
            let mut state = job.write().await;
            state.execution_duration = capped;
        }
        let owner = job.read().await.owner.clone();
        self.save_owner_snapshot(owner.as_deref()).await;
        Ok(capped)
    }

    pub async fn set_destruction_time(
        &self,
        job: &Arc<JobHandle>,
        when: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.apply_destruction_time(job, when).await?;
        let state = job.read().await;
        self.destruction
            .schedule(job.job_list(), job.id(), state.destruction_time)
            .await;
        let owner = state.owner.clone();
        drop(state);
        self.save_owner_snapshot(owner.as_deref()).await;
        Ok(())
    }

    async fn apply_destruction_time(
        &self,
        job: &Arc<JobHandle>,
        when: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = job.write().await;
        let mut when = when;
        if self.config.max_destruction_interval > 0 {
            let cap = state.creation_time
                + chrono::Duration::seconds(self.config.max_destruction_interval as i64);
            if when > cap {
                when = cap;
            }
        }
        state.set_destruction_time(when)?;
        Ok(())
    }

    /// Write one job parameter; only PENDING jobs may change
    pub async fn update_parameter(
        &self,
        job: &Arc<JobHandle>,
        name: &str,
        value: &str,
    ) -> Result<(), Error> {
        self.ensure_pending(job).await?;
        {
            let mut state = job.write().await;
            state.params.set(name, value)?;
        }
        let owner = job.read().await.owner.clone();
        self.save_owner_snapshot(owner.as_deref()).await;
        Ok(())
    }

    async fn ensure_pending(&self, job: &Arc<JobHandle>) -> Result<(), Error> {
        let phase = job.phase();
        if phase != JobPhase::Pending {
            return Err(Error::validation(format!(
                "Job {} is {}; it can only be modified while PENDING",
                job.id(),
                phase
            )));
        }
        Ok(())
    }

    /// Blocking poll on the phase (UWS WAIT)
    ///
    /// `wait_seconds` of -1 means "until change"; either way the policy
    /// cap bounds the actual wait.
    pub async fn await_phase(
        &self,
        job: &Arc<JobHandle>,
        from: JobPhase,
        wait_seconds: i64,
    ) -> PhaseWait {
        let requested = if wait_seconds < 0 {
            None
        } else {
            Some(Duration::from_secs(wait_seconds as u64))
        };
        self.phase_manager
            .await_phase_change(job, from, requested)
            .await
    }

    // ------------------------------------------------------------------
    // Synchronous execution
    // ------------------------------------------------------------------

    /// Run a query within the request, streaming the body back
    pub async fn execute_sync(
        self: &Arc<Self>,
        request: &RequestParams,
    ) -> Result<SyncStream, Error> {
        self.ensure_available()?;

        let params = request.to_tap_params(self.config.uploads_enabled)?;
        validate_lang(&params)?;
        if let Some(req) = &params.request {
            if !req.eq_ignore_ascii_case("doQuery") {
                return Err(Error::validation(format!(
                    "Unsupported REQUEST value: {}",
                    req
                )));
            }
        }
        let formatter = self
            .formatters()
            .resolve(params.format.as_deref())
            .map_err(|e| Error::validation(e.to_string()))?;
        let content_type = formatter.content_type().to_string();

        let job_id = format!("sync-{}", self.id_gen.next_id());
        let cancel = CancellationToken::new();
        let (sink, mut rx) = ChannelSink::new(16);
        let ctx = PipelineContext {
            job_id,
            params,
            cancel: cancel.clone(),
            job: None,
        };
        let pipeline = self.pipeline.clone();
        let mut task = tokio::spawn(async move { pipeline.execute(&ctx, Box::new(sink)).await });

        // Park until the first chunk, completion, or the sync time cap
        let budget = Duration::from_secs(self.config.sync_timeout.max(1));
        tokio::select! {
            first = rx.recv() => {
                match first {
                    Some(chunk) => Ok(SyncStream {
                        content_type,
                        first_chunk: Some(chunk),
                        rest: rx,
                    }),
                    // Channel closed without output: the pipeline is done
                    None => {
                        let (_, outcome) = task
                            .await
                            .map_err(|e| Error::Other(format!("Sync worker failed: {}", e)))?;
                        match outcome {
                            Ok(()) => Ok(SyncStream {
                                content_type,
                                first_chunk: None,
                                rest: rx,
                            }),
                            Err(e) => Err(map_query_error(e)),
                        }
                    }
                }
            }
            _ = tokio::time::sleep(budget) => {
                cancel.cancel();
                // Give the pipeline its stop wait to wind down
                let grace = Duration::from_secs(self.config.stop_wait.max(1));
                let _ = tokio::time::timeout(grace, &mut task).await;
                Err(Error::Other(format!(
                    "Synchronous query exceeded the {} second budget",
                    self.config.sync_timeout
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn restore(self: &Arc<Self>) {
        let backup = match &self.backup {
            Some(backup) if self.backup_enabled.load(Ordering::SeqCst) => backup.clone(),
            _ => return,
        };

        let (jobs, report) = match backup.restore_all().await {
            Ok(restored) => restored,
            Err(e) => {
                error!("Job restore failed, disabling backups: {}", e);
                self.backup_enabled.store(false, Ordering::SeqCst);
                return;
            }
        };

        if !report.is_consistent() {
            error!(
                "Job restore report disagrees with itself ({:?}), disabling backups",
                report
            );
            self.backup_enabled.store(false, Ordering::SeqCst);
            return;
        }
        if !report.is_complete() {
            error!(
                "Job restore incomplete: {}/{} jobs, {}/{} owners; disabling backups",
                report.jobs_restored, report.jobs_total, report.owners_restored, report.owners_total
            );
            self.backup_enabled.store(false, Ordering::SeqCst);
        }

        let mut restored = 0usize;
        for mut job in jobs {
            // Workers do not survive a restart
            match job.phase {
                JobPhase::Executing => {
                    job.phase = JobPhase::Error;
                    job.end_time = Some(Utc::now());
                    job.progression = None;
                    job.error_summary = Some(ErrorSummary::fatal(
                        "The service was restarted while the job was executing",
                    ));
                }
                JobPhase::Queued => {
                    job.phase = JobPhase::Pending;
                    job.start_time = None;
                }
                _ => {}
            }

            let list_name = job.job_list.clone();
            let id = job.id.clone();
            let destruction_time = job.destruction_time;
            let list = self.store.get_or_create(&list_name);
            match list.add(JobHandle::new(job)).await {
                Ok(()) => {
                    self.destruction
                        .schedule(list_name, id, destruction_time)
                        .await;
                    restored += 1;
                }
                Err(e) => warn!("Restored job {} not added: {}", id, e),
            }
        }

        info!(
            "Restore finished: {} job(s) back ({}/{} persisted, {}/{} owners)",
            restored,
            report.jobs_restored,
            report.jobs_total,
            report.owners_restored,
            report.owners_total
        );
    }

    /// Persist every owner's jobs in one sweep (shutdown, maintenance)
    pub async fn save_all(&self) {
        let backup = match &self.backup {
            Some(backup) if self.backup_enabled.load(Ordering::SeqCst) => backup.clone(),
            _ => return,
        };

        let mut grouped: Vec<(Option<String>, Vec<Job>)> = Vec::new();
        for name in self.store.names() {
            if let Some(list) = self.store.get(&name) {
                for handle in list.all().await {
                    let snapshot = handle.snapshot().await;
                    match grouped.iter_mut().find(|(o, _)| *o == snapshot.owner) {
                        Some((_, jobs)) => jobs.push(snapshot),
                        None => grouped.push((snapshot.owner.clone(), vec![snapshot])),
                    }
                }
            }
        }

        if let Err(e) = backup.save_all(&grouped).await {
            error!("Full backup failed, disabling backups: {}", e);
            self.backup_enabled.store(false, Ordering::SeqCst);
        }
    }

    /// Persist the owner's jobs after a mutating action
    async fn save_owner_snapshot(&self, owner: Option<&str>) {
        let backup = match &self.backup {
            Some(backup) if self.backup_enabled.load(Ordering::SeqCst) => backup.clone(),
            _ => return,
        };

        let mut jobs = Vec::new();
        for name in self.store.names() {
            if let Some(list) = self.store.get(&name) {
                for handle in list.all().await {
                    let snapshot = handle.snapshot().await;
                    if snapshot.owner.as_deref() == owner {
                        jobs.push(snapshot);
                    }
                }
            }
        }

        if let Err(e) = backup.save_owner(owner, &jobs).await {
            error!("Backup of {} failed, disabling backups: {}", owner.unwrap_or("anonymous"), e);
            self.backup_enabled.store(false, Ordering::SeqCst);
        }
    }

    fn cap_execution_duration(&self, requested: u64) -> u64 {
        let max = self.config.max_execution_duration;
        if max > 0 && (requested == 0 || requested > max) {
            max
        } else {
            requested
        }
    }
}

/// Runs the pipeline for one async job and stamps the outcome
struct PipelineWork {
    pipeline: Arc<QueryPipeline>,
    storage_dir: PathBuf,
}

#[async_trait]
impl JobWork for PipelineWork {
    async fn run(
        &self,
        job: Arc<JobHandle>,
        cancel: CancellationToken,
    ) -> Result<(), JobFault> {
        let (job_id, params) = {
            let state = job.read().await;
            (state.id.clone(), state.params.clone())
        };

        let formatter = self
            .pipeline
            .formatters()
            .resolve(params.format.as_deref())
            .map_err(|e| JobFault::fatal(e.to_string()))?;

        let path = self
            .storage_dir
            .join("jobs")
            .join(&job_id)
            .join(format!("result.{}", formatter.file_extension()));
        let sink = FileSink::create(&path)
            .await
            .map_err(|e| JobFault::fatal(e.to_string()))?;

        let ctx = PipelineContext {
            job_id: job_id.clone(),
            params,
            cancel,
            job: Some(job.clone()),
        };
        let (report, outcome) = self.pipeline.execute(&ctx, Box::new(sink)).await;

        if matches!(outcome, Err(QueryError::NoConnection)) {
            // The job goes back in the queue; leave no trace of this try
            let _ = tokio::fs::remove_file(&path).await;
            return Err(JobFault::NoConnection);
        }

        {
            let mut state = job.write().await;
            state.report = Some(report.clone());
            if outcome.is_ok() {
                let size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
                state.results = vec![JobResult {
                    id: "result".to_string(),
                    href: "results/result".to_string(),
                    mime_type: formatter.content_type().to_string(),
                    size,
                    file: Some(path.clone()),
                }];
            }
        }

        match outcome {
            Ok(()) => Ok(()),
            Err(QueryError::Interrupted) => Err(JobFault::Interrupted),
            Err(e) if e.is_client_abort() => {
                info!("Job {} output dropped by the client: {}", job_id, e);
                Err(JobFault::Interrupted)
            }
            Err(e) => Err(JobFault::Fatal(fault_summary(&e, report.failed_stage))),
        }
    }
}

/// Build the job's error summary from a pipeline fault
fn fault_summary(error: &QueryError, stage: Option<ExecutionProgression>) -> ErrorSummary {
    let message = match stage {
        Some(stage) => format!("{}: {}", stage, error),
        None => error.to_string(),
    };
    let mut summary = ErrorSummary::fatal(message);
    summary.details_ref = Some("error".to_string());
    summary
}

fn map_query_error(error: QueryError) -> Error {
    match error {
        QueryError::Parse { .. }
        | QueryError::Translate(_)
        | QueryError::Upload(_)
        | QueryError::UnknownFormat(_) => Error::validation(error.to_string()),
        QueryError::NoConnection => Error::unavailable("All database connections are busy"),
        other => Error::Query(other),
    }
}

/// ADQL (optionally version-suffixed) is the only accepted language
fn validate_lang(params: &crate::query::params::TapParams) -> Result<(), Error> {
    match &params.lang {
        None => Ok(()),
        Some(lang)
            if lang.eq_ignore_ascii_case("ADQL")
                || lang.to_ascii_uppercase().starts_with("ADQL-") =>
        {
            Ok(())
        }
        Some(lang) => Err(Error::validation(format!(
            "Unsupported LANG value: {}",
            lang
        ))),
    }
}

fn parse_duration_param(raw: &str) -> Result<u64, Error> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| Error::validation(format!("EXECUTIONDURATION is not a valid duration: {}", raw)))
}

fn parse_destruction_param(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::validation(format!("DESTRUCTION is not an ISO-8601 time: {}", raw)))
}

/// Lets the destruction scheduler call back into the service without a
/// reference cycle
struct DestroyerAdapter {
    service: std::sync::Weak<TapService>,
}

#[async_trait]
impl JobDestroyer for DestroyerAdapter {
    async fn destroy_if_due(
        &self,
        job_list: &str,
        job_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let service = self.service.upgrade()?;
        let list = service.store.get(job_list)?;
        let handle = list.get(job_id).await?;

        let current = handle.read().await.destruction_time;
        // The destruction time moved after this entry was queued
        if current > scheduled_for + chrono::Duration::seconds(1) {
            return Some(current);
        }

        service.destroy_handle(job_list, job_id).await;
        None
    }
}
