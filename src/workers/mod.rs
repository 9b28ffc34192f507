use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    jobs::{mark_job_failed, mark_job_succeeded, reserve_job, retry_job_after},
    models::Job,
    state::AppState,
};

pub mod authorize;
pub mod export;

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution;
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let map = handlers
            .into_iter()
            .map(|handler| (handler.job_type(), handler))
            .collect();
        Self {
            state,
            handlers: map,
            poll_interval,
        }
    }

    pub async fn run(&self, worker_index: usize) {
        info!(worker_index, "worker started");
        loop {
            match self.tick(worker_index).await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(worker_index, error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Runs at most one job. `Ok(false)` means the queue had nothing ready.
    async fn tick(&self, worker_index: usize) -> anyhow::Result<bool> {
        let job_types: Vec<&str> = self.handlers.keys().copied().collect();
        if job_types.is_empty() {
            return Ok(false);
        }

        let Some(job) = reserve_job(&mut *self.state.db()?, &job_types)? else {
            return Ok(false);
        };
        info!(
            worker_index,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = attempt_number(&job),
            "job reserved"
        );

        let execution = match self.handlers.get(job.job_type.as_str()) {
            Some(handler) => handler.handle(self.state.clone(), job.clone()).await,
            None => JobExecution::Failed {
                error: format!("no handler registered for {}", job.job_type),
            },
        };
        self.record(&job, execution)?;
        Ok(true)
    }

    fn record(&self, job: &Job, execution: JobExecution) -> anyhow::Result<()> {
        let mut conn = self.state.db()?;
        match execution {
            JobExecution::Success => {
                mark_job_succeeded(&mut conn, job.id)?;
                info!(job_id = %job.id, job_type = %job.job_type, "job completed");
            }
            JobExecution::Retry { delay, error } => {
                retry_job_after(&mut conn, job.id, delay, &error)?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    delay_secs = delay.as_secs(),
                    %error,
                    "job will retry"
                );
            }
            JobExecution::Failed { error } => {
                mark_job_failed(&mut conn, job.id, &error)?;
                error!(job_id = %job.id, job_type = %job.job_type, %error, "job failed");
            }
        }
        Ok(())
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(authorize::AuthorizeComprobanteJob::new()),
        Arc::new(export::ExportChunkJob::new()),
        Arc::new(export::AssembleExportJob::new()),
    ]
}

/// 1-based attempt number of a reserved job.
pub fn attempt_number(job: &Job) -> u32 {
    u32::try_from(job.attempts).unwrap_or(0).max(1)
}
