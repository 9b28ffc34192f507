use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_AUTHORIZE_COMPROBANTE: &str = "authorize-comprobante";
pub const JOB_EXPORT_CHUNK: &str = "export-chunk";
pub const JOB_ASSEMBLE_EXPORT: &str = "assemble-export";

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// Attempt budget and backoff schedule for retryable job failures. The last
/// backoff interval repeats once the schedule runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn new_job(job_type: &str, payload: Value, run_after: NaiveDateTime) -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after,
    }
}

pub fn enqueue_job(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> JobQueueResult<Job> {
    let new_job = new_job(
        job_type,
        payload,
        run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    );

    diesel::insert_into(jobs::table)
        .values(&new_job)
        .execute(conn)?;

    let job = jobs::table.find(new_job.id).first(conn)?;
    Ok(job)
}

/// Inserts one job per payload in a single statement.
pub fn enqueue_jobs(
    conn: &mut PgConnection,
    job_type: &str,
    payloads: Vec<Value>,
) -> JobQueueResult<usize> {
    if payloads.is_empty() {
        return Ok(0);
    }
    let now = Utc::now().naive_utc();
    let rows: Vec<NewJob> = payloads
        .into_iter()
        .map(|payload| new_job(job_type, payload, now))
        .collect();

    let inserted = diesel::insert_into(jobs::table)
        .values(&rows)
        .execute(conn)?;
    Ok(inserted)
}

pub fn reserve_job(conn: &mut PgConnection, job_types: &[&str]) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let job_opt = jobs::table
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::run_after.le(now))
            .filter(jobs::job_type.eq_any(job_types))
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Job>(conn)
            .optional()?;

        if let Some(job) = job_opt {
            diesel::update(jobs::table.find(job.id))
                .set((
                    jobs::status.eq(STATUS_PROCESSING),
                    jobs::attempts.eq(job.attempts + 1),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;

            let refreshed = jobs::table.find(job.id).first(conn)?;
            Ok::<Option<Job>, diesel::result::Error>(Some(refreshed))
        } else {
            Ok::<Option<Job>, diesel::result::Error>(None)
        }
    })
    .map_err(JobQueueError::from)
}

pub fn mark_job_succeeded(conn: &mut PgConnection, job_id: Uuid) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_SUCCEEDED),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_job_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> JobQueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));

    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(next_run.naive_utc()),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
) -> JobQueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Returns jobs left in `processing` by a crashed worker to the queue.
pub fn requeue_stale_jobs(conn: &mut PgConnection, stale_after: Duration) -> JobQueueResult<usize> {
    let now = Utc::now();
    let cutoff = now
        - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::minutes(30));

    let requeued = diesel::update(
        jobs::table
            .filter(jobs::status.eq(STATUS_PROCESSING))
            .filter(jobs::updated_at.lt(cutoff.naive_utc())),
    )
    .set((
        jobs::status.eq(STATUS_QUEUED),
        jobs::run_after.eq(now.naive_utc()),
        jobs::updated_at.eq(now.naive_utc()),
    ))
    .execute(conn)?;
    Ok(requeued)
}
