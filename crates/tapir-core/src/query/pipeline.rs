//! Staged query execution

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::query::connection::{ConnectionPool, TapConnection};
use crate::query::cursor::ColumnDesc;
use crate::query::format::{FormatterRegistry, ResultFormatter, WriteContext};
use crate::query::params::TapParams;
use crate::query::parser::QueryParser;
use crate::query::report::{ExecutionReport, StageTimer};
use crate::query::sink::{ChunkedWriter, ResultSink};
use crate::query::translator::QueryTranslator;
use crate::query::upload::UploadManager;
use crate::query::QueryError;
use crate::uws::job::{ExecutionProgression, JobHandle};

/// Per-execution input to the pipeline
pub struct PipelineContext {
    pub job_id: String,
    pub params: TapParams,
    pub cancel: CancellationToken,

    /// When set, the job's progression tag follows the stages
    pub job: Option<Arc<JobHandle>>,
}

#[derive(Default)]
struct RunState {
    sql: Option<String>,
    columns: Vec<ColumnDesc>,
    rows_written: u64,
    overflow: bool,
    upload_tables: Vec<String>,
}

/// Orchestrates upload -> parse -> translate -> execute -> write
///
/// Whatever the exit path, finalization drops the job's uploaded
/// temporaries, returns the connection to the pool, and emits exactly
/// one "query finished" record; the report attributes any fault to the
/// stage that raised it.
pub struct QueryPipeline {
    parser: Arc<dyn QueryParser>,
    translator: Arc<dyn QueryTranslator>,
    pool: Arc<dyn ConnectionPool>,
    uploads: UploadManager,
    formatters: Arc<FormatterRegistry>,
    max_rec: i64,
    default_max_rec: i64,
}

impl QueryPipeline {
    pub fn new(
        parser: Arc<dyn QueryParser>,
        translator: Arc<dyn QueryTranslator>,
        pool: Arc<dyn ConnectionPool>,
        uploads: UploadManager,
        formatters: Arc<FormatterRegistry>,
        max_rec: i64,
        default_max_rec: i64,
    ) -> Self {
        Self {
            parser,
            translator,
            pool,
            uploads,
            formatters,
            max_rec,
            default_max_rec,
        }
    }

    pub fn formatters(&self) -> &FormatterRegistry {
        &self.formatters
    }

    /// Run the full pipeline, writing the serialized result into `sink`
    ///
    /// Returns the execution report together with the outcome; the
    /// report is complete in both cases.
    pub async fn execute(
        &self,
        ctx: &PipelineContext,
        sink: Box<dyn ResultSink>,
    ) -> (ExecutionReport, Result<(), QueryError>) {
        let mut timer = StageTimer::new();
        let mut state = RunState::default();

        // Resolving the formatter needs no connection; fail before
        // touching the pool
        let formatter = match self.formatters.resolve(ctx.params.format.as_deref()) {
            Ok(formatter) => formatter,
            Err(e) => {
                let report = Self::build_report(timer, state, Some(&e));
                self.log_finished(ctx, &report);
                return (report, Err(e));
            }
        };

        let mut conn = match self.pool.acquire(&ctx.job_id).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Job {} could not reserve a connection", ctx.job_id);
                let report = Self::build_report(timer, state, Some(&e));
                self.log_finished(ctx, &report);
                return (report, Err(e));
            }
        };

        let outcome = self
            .run_stages(ctx, conn.as_mut(), formatter, sink, &mut timer, &mut state)
            .await;

        // Finalization, on every exit path
        if !state.upload_tables.is_empty() {
            if let Err(e) = self
                .uploads
                .drop_tables(conn.as_mut(), &ctx.job_id, &state.upload_tables)
                .await
            {
                warn!("Job {} upload cleanup failed: {}", ctx.job_id, e);
            }
        }
        self.pool.release(conn).await;

        let report = Self::build_report(timer, state, outcome.as_ref().err());
        self.log_finished(ctx, &report);
        (report, outcome)
    }

    async fn run_stages(
        &self,
        ctx: &PipelineContext,
        conn: &mut dyn TapConnection,
        formatter: Arc<dyn ResultFormatter>,
        sink: Box<dyn ResultSink>,
        timer: &mut StageTimer,
        state: &mut RunState,
    ) -> Result<(), QueryError> {
        // UPLOADING
        self.enter(ctx, timer, ExecutionProgression::Uploading).await;
        state.upload_tables = ctx.params.uploads.iter().map(|u| u.name.clone()).collect();
        let upload_mapping = self
            .uploads
            .materialize(conn, &ctx.job_id, &ctx.params.uploads)
            .await?;
        Self::checkpoint(&ctx.cancel)?;

        // PARSING
        self.enter(ctx, timer, ExecutionProgression::Parsing).await;
        let query_text = ctx.params.query.clone().ok_or_else(|| QueryError::Parse {
            position: 0,
            message: "Missing QUERY parameter".to_string(),
        })?;
        let parsed = self.parser.parse(&query_text)?;
        Self::checkpoint(&ctx.cancel)?;

        // TRANSLATING
        self.enter(ctx, timer, ExecutionProgression::Translating).await;
        let max_rec = ctx
            .params
            .effective_max_rec(self.max_rec, self.default_max_rec);
        // One extra row serves as the overflow sentinel; MAXREC=0 means
        // no rows and no overflow detection
        let row_limit = match max_rec {
            Some(0) => Some(0),
            Some(n) => Some(n + 1),
            None => None,
        };
        let sql = self
            .translator
            .translate(&parsed, row_limit, &upload_mapping)?;
        state.sql = Some(sql.clone());
        Self::checkpoint(&ctx.cancel)?;

        // EXECUTING_SQL
        self.enter(ctx, timer, ExecutionProgression::ExecutingSql).await;
        let cancel_hook = conn.cancel_handle();
        let watcher = {
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                cancel_hook.cancel().await;
            })
        };
        let executed = conn.execute_query(&sql).await;
        watcher.abort();
        let mut cursor = match executed {
            Ok(cursor) => cursor,
            // A backend kill looks like an execution fault; report the
            // cancellation instead when the flag is up
            Err(_) if ctx.cancel.is_cancelled() => return Err(QueryError::Interrupted),
            Err(e) => return Err(e),
        };
        state.columns = cursor.columns().to_vec();
        if let (Some(total), Some(cap)) = (cursor.size_hint(), max_rec) {
            state.overflow = cap > 0 && total > cap as u64;
        }
        Self::checkpoint(&ctx.cancel)?;

        // WRITING_RESULT
        self.enter(ctx, timer, ExecutionProgression::WritingResult).await;
        let mut out = ChunkedWriter::new(sink);
        let write_ctx = WriteContext {
            overflow: state.overflow,
        };
        state.rows_written = formatter
            .write(cursor.as_mut(), &mut out, &write_ctx, &ctx.cancel)
            .await?;
        out.finish().await?;

        self.enter(ctx, timer, ExecutionProgression::Finished).await;
        Ok(())
    }

    /// Cancel-flag check between stages
    fn checkpoint(cancel: &CancellationToken) -> Result<(), QueryError> {
        if cancel.is_cancelled() {
            Err(QueryError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn enter(&self, ctx: &PipelineContext, timer: &mut StageTimer, stage: ExecutionProgression) {
        timer.enter(stage);
        if let Some(job) = &ctx.job {
            job.write().await.progression = Some(stage);
        }
    }

    fn build_report(timer: StageTimer, state: RunState, error: Option<&QueryError>) -> ExecutionReport {
        let failed_stage = error.and(timer.current_stage());
        let (stage_durations_ms, total_ms) = timer.finish();
        ExecutionReport {
            success: error.is_none(),
            sql: state.sql,
            columns: state.columns,
            stage_durations_ms,
            total_ms,
            rows_written: state.rows_written,
            overflow: state.overflow,
            failed_stage,
        }
    }

    fn log_finished(&self, ctx: &PipelineContext, report: &ExecutionReport) {
        info!(
            "Query finished: job={}, success={}, rows={}, overflow={}, total_ms={}{}",
            ctx.job_id,
            report.success,
            report.rows_written,
            report.overflow,
            report.total_ms,
            match report.failed_stage {
                Some(stage) => format!(", failed_stage={}", stage),
                None => String::new(),
            }
        );
    }
}
