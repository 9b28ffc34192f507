use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    access_key::{AccessKey, MalformedKey},
    jobs::{enqueue_job, enqueue_jobs, JobQueueError, JOB_ASSEMBLE_EXPORT, JOB_EXPORT_CHUNK},
    models::{BulkExportJob, ExportFormat, ExportStatus, Job, NewBulkExportJob},
    schema::{bulk_export_jobs, issuers},
    services::Renderer,
    state::AppState,
    storage::ExportStorage,
    store::{ComprobanteStore, ExportJobStore, StoreError},
};

use super::{JobExecution, JobHandler};

pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no access keys requested")]
    NoKeys,
    #[error("invalid access key {key:?}: {source}")]
    MalformedKey {
        key: String,
        #[source]
        source: MalformedKey,
    },
    #[error("owner {0} not found")]
    OwnerNotFound(Uuid),
    #[error("export job {0} not found")]
    NotFound(Uuid),
    #[error("export job {id} has an unreadable value: {message}")]
    Corrupt { id: Uuid, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub bulk_export_job_id: Uuid,
    pub chunk_index: usize,
    pub access_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblePayload {
    pub bulk_export_job_id: Uuid,
}

pub fn plan_chunks(keys: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    keys.chunks(chunk_size.max(1)).map(<[String]>::to_vec).collect()
}

/// Drops repeated keys, keeping first-seen order. Each key is one archive
/// entry and one `processed_files` increment.
pub fn distinct_keys(keys: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

/// Creates the export job and enqueues one chunk job per slice of keys, all in
/// one transaction.
pub fn request_bulk_export(
    conn: &mut PgConnection,
    owner_id: Uuid,
    format: ExportFormat,
    access_keys: &[String],
    chunk_size: usize,
) -> Result<BulkExportJob, ExportError> {
    if access_keys.is_empty() {
        return Err(ExportError::NoKeys);
    }
    let keys = access_keys
        .iter()
        .map(|raw| {
            AccessKey::parse(raw)
                .map(|key| key.as_str().to_string())
                .map_err(|source| ExportError::MalformedKey {
                    key: raw.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let keys = distinct_keys(keys);
    let chunks = plan_chunks(&keys, chunk_size);

    conn.transaction::<_, ExportError, _>(|conn| {
        let owner_exists: bool = diesel::select(diesel::dsl::exists(issuers::table.find(owner_id)))
            .get_result(conn)?;
        if !owner_exists {
            return Err(ExportError::OwnerNotFound(owner_id));
        }

        let new_job = NewBulkExportJob {
            id: Uuid::new_v4(),
            owner_id,
            format: format.as_str().to_string(),
            total_files: keys.len() as i32,
            total_chunks: chunks.len() as i32,
            status: ExportStatus::Pending.as_str().to_string(),
        };
        let job: BulkExportJob = diesel::insert_into(bulk_export_jobs::table)
            .values(&new_job)
            .get_result(conn)?;

        let payloads = chunks
            .into_iter()
            .enumerate()
            .map(|(chunk_index, access_keys)| {
                json!(ChunkPayload {
                    bulk_export_job_id: job.id,
                    chunk_index,
                    access_keys,
                })
            })
            .collect();
        enqueue_jobs(conn, JOB_EXPORT_CHUNK, payloads)?;

        info!(
            job_id = %job.id,
            owner_id = %owner_id,
            total_files = job.total_files,
            total_chunks = job.total_chunks,
            "bulk export requested"
        );
        Ok(job)
    })
}

/// Returns `false` when the job had already finished.
pub fn cancel_bulk_export(conn: &mut PgConnection, job_id: Uuid) -> Result<bool, ExportError> {
    let finished = [ExportStatus::Completed.as_str(), ExportStatus::Failed.as_str()];
    let affected = diesel::update(
        bulk_export_jobs::table
            .find(job_id)
            .filter(bulk_export_jobs::status.ne_all(finished)),
    )
    .set((
        bulk_export_jobs::cancelled.eq(true),
        bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    if affected == 0 {
        let exists: bool =
            diesel::select(diesel::dsl::exists(bulk_export_jobs::table.find(job_id)))
                .get_result(conn)?;
        if !exists {
            return Err(ExportError::NotFound(job_id));
        }
        return Ok(false);
    }
    info!(job_id = %job_id, "bulk export cancelled");
    Ok(true)
}

pub fn expired_exports(
    conn: &mut PgConnection,
    now: NaiveDateTime,
) -> Result<Vec<BulkExportJob>, ExportError> {
    Ok(bulk_export_jobs::table
        .filter(bulk_export_jobs::archive_path.is_not_null())
        .filter(bulk_export_jobs::expires_at.le(now))
        .load(conn)?)
}

pub fn clear_archive_path(conn: &mut PgConnection, job_id: Uuid) -> Result<(), ExportError> {
    diesel::update(bulk_export_jobs::table.find(job_id))
        .set((
            bulk_export_jobs::archive_path.eq::<Option<String>>(None),
            bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Other chunks are still outstanding.
    InProgress,
    /// This was the last chunk; the archive can be assembled.
    ReadyForAssembly,
    /// This was the last chunk of a failed or cancelled export; scratch removed.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub outcome: ChunkOutcome,
    pub processed: usize,
    pub skipped: usize,
    /// Set when the chunk hit a failure that fails the whole export.
    pub hard_failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyOutcome {
    Completed { archive_path: PathBuf, entries: usize },
    Abandoned,
    Failed(String),
}

/// Fan-out rendering of export chunks and fan-in archive assembly. All
/// coordination goes through the shared export job record.
pub struct BulkExportOrchestrator {
    exports: Arc<dyn ExportJobStore>,
    comprobantes: Arc<dyn ComprobanteStore>,
    renderer: Arc<dyn Renderer>,
    storage: ExportStorage,
    archive_ttl: Duration,
}

impl BulkExportOrchestrator {
    pub fn new(
        exports: Arc<dyn ExportJobStore>,
        comprobantes: Arc<dyn ComprobanteStore>,
        renderer: Arc<dyn Renderer>,
        storage: ExportStorage,
        archive_ttl: Duration,
    ) -> Self {
        Self {
            exports,
            comprobantes,
            renderer,
            storage,
            archive_ttl,
        }
    }

    pub fn storage(&self) -> &ExportStorage {
        &self.storage
    }

    pub async fn process_chunk(
        &self,
        job_id: Uuid,
        access_keys: &[String],
    ) -> Result<ChunkReport, ExportError> {
        let job = self
            .exports
            .load(job_id)
            .await?
            .ok_or(ExportError::NotFound(job_id))?;

        let mut report = ChunkReport {
            outcome: ChunkOutcome::InProgress,
            processed: 0,
            skipped: 0,
            hard_failure: None,
        };

        if job.cancelled || job.status == ExportStatus::Failed.as_str() {
            info!(job_id = %job_id, status = %job.status, cancelled = job.cancelled, "export halted; chunk skipped");
        } else {
            let run = match self.prepare(&job).await {
                Ok(Ok(format)) => self
                    .render_items(&job, format, access_keys, &mut report)
                    .await
                    .map_err(|err| err.to_string()),
                Ok(Err(message)) => Err(message),
                Err(err) => Err(err.to_string()),
            };
            if let Err(message) = run {
                error!(job_id = %job_id, error = %message, "export chunk failed");
                self.record_failure(job_id, &message).await;
                report.hard_failure = Some(message);
            }
        }

        // counted even after a failure so the last chunk still cleans up
        report.outcome = self.finish_chunk(job_id).await?;
        Ok(report)
    }

    /// Marks the export FAILED and drops its scratch files. Used when the
    /// assembly step can no longer be reached.
    pub async fn abandon(&self, job_id: Uuid, message: &str) {
        error!(job_id = %job_id, error = %message, "export abandoned");
        self.record_failure(job_id, message).await;
        self.discard_scratch(job_id).await;
    }

    async fn record_failure(&self, job_id: Uuid, message: &str) {
        if let Err(err) = self.exports.mark_failed(job_id, message).await {
            error!(job_id = %job_id, error = %err, "failed to mark export as failed");
        }
    }

    async fn prepare(&self, job: &BulkExportJob) -> Result<Result<ExportFormat, String>, ExportError> {
        if self.comprobantes.load_issuer(job.owner_id).await?.is_none() {
            return Ok(Err(format!("owner {} not found", job.owner_id)));
        }
        let format = match job.export_format() {
            Ok(format) => format,
            Err(err) => return Ok(Err(err.to_string())),
        };
        self.exports.mark_processing(job.id).await?;
        Ok(Ok(format))
    }

    async fn render_items(
        &self,
        job: &BulkExportJob,
        format: ExportFormat,
        access_keys: &[String],
        report: &mut ChunkReport,
    ) -> Result<(), ExportError> {
        for access_key in access_keys {
            if self.exports.is_cancelled(job.id).await? {
                info!(job_id = %job.id, "export cancelled; stopping chunk");
                break;
            }

            match self.render_one(job, format, access_key).await {
                Ok(file_name) => {
                    let processed = self.exports.increment_processed(job.id).await?;
                    report.processed += 1;
                    info!(job_id = %job.id, %access_key, %file_name, processed, "export item written");
                }
                Err(err) => {
                    report.skipped += 1;
                    warn!(job_id = %job.id, %access_key, error = %err, "export item skipped");
                }
            }
        }
        Ok(())
    }

    async fn render_one(
        &self,
        job: &BulkExportJob,
        format: ExportFormat,
        access_key: &str,
    ) -> anyhow::Result<String> {
        let comprobante = self
            .comprobantes
            .find_by_access_key(access_key)
            .await?
            .filter(|comprobante| comprobante.issuer_id == job.owner_id)
            .ok_or_else(|| anyhow!("comprobante not found for owner"))?;

        let rendered = self.renderer.render(&comprobante, format).await?;
        let path = self
            .storage
            .write_entry(job.id, &rendered.file_name, &rendered.bytes)
            .await?;
        Ok(path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(rendered.file_name))
    }

    async fn finish_chunk(&self, job_id: Uuid) -> Result<ChunkOutcome, ExportError> {
        let job = self.exports.complete_chunk(job_id).await?;
        if job.completed_chunks < job.total_chunks {
            return Ok(ChunkOutcome::InProgress);
        }
        if job.cancelled || job.status == ExportStatus::Failed.as_str() {
            if let Err(err) = self.storage.remove_scratch(job_id).await {
                warn!(job_id = %job_id, error = %err, "failed to remove export scratch");
            }
            return Ok(ChunkOutcome::Abandoned);
        }
        info!(job_id = %job_id, processed_files = job.processed_files, "all export chunks finished");
        Ok(ChunkOutcome::ReadyForAssembly)
    }

    pub async fn assemble_archive(&self, job_id: Uuid) -> Result<AssemblyOutcome, ExportError> {
        let job = self
            .exports
            .load(job_id)
            .await?
            .ok_or(ExportError::NotFound(job_id))?;
        let status = job.export_status().map_err(|err| ExportError::Corrupt {
            id: job_id,
            message: err.to_string(),
        })?;

        if job.cancelled || status == ExportStatus::Failed {
            self.discard_scratch(job_id).await;
            return Ok(AssemblyOutcome::Abandoned);
        }

        if let Err(err) = self.exports.mark_compressing(job_id).await {
            self.discard_scratch(job_id).await;
            return self.fail_assembly(job_id, err.to_string(), None).await;
        }
        let compressed = self.storage.compress(job_id).await;
        self.discard_scratch(job_id).await;

        match compressed {
            Ok((archive_path, entries)) => {
                let ttl = ChronoDuration::from_std(self.archive_ttl)
                    .unwrap_or_else(|_| ChronoDuration::hours(24));
                let expires_at = Utc::now().naive_utc() + ttl;
                if let Err(err) = self
                    .exports
                    .mark_completed(job_id, &archive_path.to_string_lossy(), expires_at)
                    .await
                {
                    return self
                        .fail_assembly(job_id, err.to_string(), Some(&archive_path))
                        .await;
                }
                info!(
                    job_id = %job_id,
                    archive = %archive_path.display(),
                    entries,
                    %expires_at,
                    "export archive ready"
                );
                Ok(AssemblyOutcome::Completed {
                    archive_path,
                    entries,
                })
            }
            Err(err) => self.fail_assembly(job_id, format!("{err:#}"), None).await,
        }
    }

    async fn fail_assembly(
        &self,
        job_id: Uuid,
        message: String,
        archive: Option<&Path>,
    ) -> Result<AssemblyOutcome, ExportError> {
        error!(job_id = %job_id, error = %message, "export archive failed");
        if let Some(archive) = archive {
            if let Err(err) = self.storage.remove_archive(archive).await {
                warn!(job_id = %job_id, error = %err, "failed to remove orphaned archive");
            }
        }
        self.exports.mark_failed(job_id, &message).await?;
        Ok(AssemblyOutcome::Failed(message))
    }

    async fn discard_scratch(&self, job_id: Uuid) {
        if let Err(err) = self.storage.remove_scratch(job_id).await {
            warn!(job_id = %job_id, error = %err, "failed to remove export scratch");
        }
    }
}

pub struct ExportChunkJob;

impl ExportChunkJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExportChunkJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ExportChunkJob {
    fn job_type(&self) -> &'static str {
        JOB_EXPORT_CHUNK
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: ChunkPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid export chunk payload: {err}"),
                }
            }
        };
        let export_id = payload.bulk_export_job_id;

        let report = match state
            .exports
            .process_chunk(export_id, &payload.access_keys)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                let message = err.to_string();
                state.exports.abandon(export_id, &message).await;
                return JobExecution::Failed { error: message };
            }
        };
        info!(
            job_id = %job.id,
            export_id = %export_id,
            chunk_index = payload.chunk_index,
            processed = report.processed,
            skipped = report.skipped,
            outcome = ?report.outcome,
            "export chunk finished"
        );

        if report.outcome == ChunkOutcome::ReadyForAssembly {
            let pool = state.pool.clone();
            let scheduled = task::spawn_blocking(move || {
                let mut conn = pool
                    .get()
                    .map_err(|err| format!("database pool error: {err}"))?;
                enqueue_job(
                    &mut conn,
                    JOB_ASSEMBLE_EXPORT,
                    json!(AssemblePayload {
                        bulk_export_job_id: export_id,
                    }),
                    None,
                )
                .map_err(|err| err.to_string())
            })
            .await
            .map_err(|err| err.to_string())
            .and_then(|result| result);

            if let Err(err) = scheduled {
                let message = format!("failed to schedule archive assembly: {err}");
                state.exports.abandon(export_id, &message).await;
                return JobExecution::Failed { error: message };
            }
        }

        match report.hard_failure {
            Some(error) => JobExecution::Failed { error },
            None => JobExecution::Success,
        }
    }
}

pub struct AssembleExportJob;

impl AssembleExportJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AssembleExportJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for AssembleExportJob {
    fn job_type(&self) -> &'static str {
        JOB_ASSEMBLE_EXPORT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: AssemblePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid export assembly payload: {err}"),
                }
            }
        };

        match state.exports.assemble_archive(payload.bulk_export_job_id).await {
            Ok(AssemblyOutcome::Completed { .. }) | Ok(AssemblyOutcome::Abandoned) => {
                JobExecution::Success
            }
            Ok(AssemblyOutcome::Failed(error)) => JobExecution::Failed { error },
            Err(err) => JobExecution::Failed {
                error: err.to_string(),
            },
        }
    }
}
