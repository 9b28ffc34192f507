use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    access_key::AccessKey,
    callback::{CallbackDispatcher, CallbackReport},
    error::{PipelineError, PipelineResult},
    jobs::{RetryPolicy, JOB_AUTHORIZE_COMPROBANTE},
    models::{Comprobante, ComprobanteState, Issuer, Job},
    sequence::SequenceAllocator,
    services::{
        DocumentBuilder, OwnerNotification, OwnerNotifier, PreparedFields, Signer,
        SignerCredentials,
    },
    sri::{AuthorityService, AuthorizationRecord},
    state::AppState,
    store::{ComprobanteStore, SignedIdentity},
};

use super::{attempt_number, JobExecution, JobHandler};

/// Payload of an `authorize-comprobante` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub comprobante_id: Uuid,
    pub emission_point_id: Uuid,
    pub access_key: String,
}

pub struct PipelineServices {
    pub comprobantes: Arc<dyn ComprobanteStore>,
    pub sequences: Arc<dyn SequenceAllocator>,
    pub builder: Arc<dyn DocumentBuilder>,
    pub signer: Arc<dyn Signer>,
    pub authority: Arc<dyn AuthorityService>,
    pub callbacks: Arc<CallbackDispatcher>,
    pub notifier: Option<Arc<dyn OwnerNotifier>>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    /// Parent of the per-run temporary directories.
    pub scratch_root: PathBuf,
    pub signature_dir: PathBuf,
}

struct AuthorizedRun {
    issuer: Issuer,
    access_key: AccessKey,
    record: AuthorizationRecord,
    signed: Vec<u8>,
}

/// Drives one comprobante from PENDING to a terminal state:
/// reserve → build → sign → SIGNED → submit → AUTHORIZED | NEEDS_CORRECTION | FAILED.
pub struct AuthorizationPipeline {
    services: PipelineServices,
    settings: PipelineSettings,
}

impl AuthorizationPipeline {
    pub fn new(services: PipelineServices, settings: PipelineSettings) -> Self {
        Self { services, settings }
    }

    /// `attempt` is 1-based and counts every run of the same job.
    pub async fn run(&self, request: &AuthorizeRequest, attempt: u32) -> JobExecution {
        let comprobante = match self.services.comprobantes.load(request.comprobante_id).await {
            Ok(Some(comprobante)) => comprobante,
            Ok(None) => {
                return JobExecution::Failed {
                    error: format!("comprobante {} not found", request.comprobante_id),
                }
            }
            Err(err) => return self.retry_or_fail(attempt, err.to_string()),
        };

        let state = match comprobante.lifecycle() {
            Ok(state) => state,
            Err(err) => return JobExecution::Failed { error: err.to_string() },
        };
        if state.is_terminal() {
            info!(comprobante_id = %comprobante.id, %state, "comprobante already settled; skipping");
            return JobExecution::Success;
        }
        if state != ComprobanteState::Signed {
            if let Err(err) = self.services.comprobantes.mark_processing(comprobante.id).await {
                return self.retry_or_fail(attempt, err.to_string());
            }
        }
        info!(
            comprobante_id = %comprobante.id,
            access_key = %request.access_key,
            attempt,
            resumed = state == ComprobanteState::Signed,
            "authorization run started"
        );

        match self.process(&comprobante, request).await {
            Ok(run) => self.complete(&comprobante, request, attempt, run).await,
            Err(err) => self.handle_failure(&comprobante, request, attempt, err).await,
        }
    }

    async fn process(
        &self,
        comprobante: &Comprobante,
        request: &AuthorizeRequest,
    ) -> PipelineResult<AuthorizedRun> {
        let access_key = AccessKey::parse(&request.access_key)?;
        let issuer = self
            .services
            .comprobantes
            .load_issuer(comprobante.issuer_id)
            .await?
            .ok_or_else(|| {
                PipelineError::Unexpected(format!("issuer {} not found", comprobante.issuer_id))
            })?;

        // the row lock is released before this returns
        let reserved = self
            .services
            .sequences
            .reserve(request.emission_point_id, &access_key)
            .await?;
        info!(
            comprobante_id = %comprobante.id,
            emission_point_id = %reserved.emission_point_id,
            sequence = reserved.sequence,
            "sequence reserved"
        );
        let fields = PreparedFields::prepare(comprobante, &issuer, &reserved, &access_key);

        fs::create_dir_all(&self.settings.scratch_root).await?;
        let workdir = tempfile::Builder::new()
            .prefix("comprobante-")
            .tempdir_in(&self.settings.scratch_root)?;

        let unsigned = self.services.builder.build(&fields, &access_key).await?;
        let unsigned_path = workdir.path().join(format!("{access_key}.xml"));
        fs::write(&unsigned_path, &unsigned).await?;

        let credentials =
            SignerCredentials::for_issuer(&issuer, &self.settings.signature_dir)?;
        let signed = self
            .services
            .signer
            .sign(&unsigned_path, &credentials, workdir.path())
            .await?;
        if let Err(err) = workdir.close() {
            warn!(comprobante_id = %comprobante.id, error = %err, "failed to remove signing workdir");
        }

        let identity = SignedIdentity {
            access_key: access_key.to_string(),
            establishment: reserved.establishment.clone(),
            emission_point: reserved.emission_point.clone(),
            sequence: i64::from(access_key.sequence()),
        };
        self.services
            .comprobantes
            .mark_signed(comprobante.id, &identity)
            .await?;
        info!(comprobante_id = %comprobante.id, access_key = %access_key, "comprobante signed");

        let record = self
            .services
            .authority
            .submit_and_authorize(&signed, &access_key)
            .await?;

        Ok(AuthorizedRun {
            issuer,
            access_key,
            record,
            signed,
        })
    }

    async fn complete(
        &self,
        comprobante: &Comprobante,
        request: &AuthorizeRequest,
        attempt: u32,
        run: AuthorizedRun,
    ) -> JobExecution {
        if let Err(err) = self
            .services
            .comprobantes
            .mark_authorized(comprobante.id, &run.record)
            .await
        {
            // a rerun finds the key already registered and picks up the same authorization
            error!(comprobante_id = %comprobante.id, error = %err, "failed to persist authorization");
            return self.retry_or_fail(attempt, err.to_string());
        }
        info!(
            comprobante_id = %comprobante.id,
            access_key = %run.access_key,
            authorization_number = ?run.record.authorization_number,
            "comprobante authorized"
        );

        if let Err(err) = self
            .services
            .sequences
            .commit_success(request.emission_point_id, run.access_key.sequence())
            .await
        {
            error!(
                comprobante_id = %comprobante.id,
                emission_point_id = %request.emission_point_id,
                error = %err,
                "failed to commit sequence after authorization"
            );
        }

        let report = CallbackReport::authorized(run.access_key.as_str(), &run.record);
        self.services
            .callbacks
            .notify(comprobante.id, &comprobante.payload, &report)
            .await;

        self.notify_owner(comprobante, &run).await;
        JobExecution::Success
    }

    async fn notify_owner(&self, comprobante: &Comprobante, run: &AuthorizedRun) {
        let Some(notifier) = &self.services.notifier else {
            return;
        };
        let Some(notification) = OwnerNotification::for_authorized(
            &run.issuer,
            comprobante,
            &run.access_key,
            run.signed.clone(),
        ) else {
            return;
        };

        match notifier.notify(&notification).await {
            Ok(()) => info!(
                comprobante_id = %comprobante.id,
                recipient = %notification.recipient,
                "owner notified"
            ),
            Err(err) => warn!(
                comprobante_id = %comprobante.id,
                error = %err,
                "owner notification failed"
            ),
        }
    }

    async fn handle_failure(
        &self,
        comprobante: &Comprobante,
        request: &AuthorizeRequest,
        attempt: u32,
        err: PipelineError,
    ) -> JobExecution {
        let access_key = Some(request.access_key.as_str());
        match err {
            PipelineError::ServiceUnavailable(message)
                if self.settings.retry.allows_retry_after(attempt) =>
            {
                let delay = self.settings.retry.backoff_for(attempt);
                warn!(
                    comprobante_id = %comprobante.id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %message,
                    "authority unavailable; run will be retried"
                );
                JobExecution::Retry {
                    delay,
                    error: message,
                }
            }
            PipelineError::ServiceUnavailable(message) => {
                let message =
                    format!("authority unavailable after {attempt} attempts: {message}");
                self.settle(comprobante, ComprobanteState::Failed, access_key, &message)
                    .await;
                JobExecution::Failed { error: message }
            }
            PipelineError::Rejected(rejection) => {
                let message = rejection.to_string();
                self.settle(
                    comprobante,
                    ComprobanteState::NeedsCorrection,
                    access_key,
                    &message,
                )
                .await;
                JobExecution::Success
            }
            other => {
                let message = other.to_string();
                self.settle(comprobante, ComprobanteState::Failed, access_key, &message)
                    .await;
                JobExecution::Failed { error: message }
            }
        }
    }

    /// Persists a negative terminal state and reports it to the caller.
    async fn settle(
        &self,
        comprobante: &Comprobante,
        state: ComprobanteState,
        access_key: Option<&str>,
        message: &str,
    ) {
        let stored = match state {
            ComprobanteState::NeedsCorrection => {
                self.services
                    .comprobantes
                    .mark_needs_correction(comprobante.id, message)
                    .await
            }
            _ => {
                self.services
                    .comprobantes
                    .mark_failed(comprobante.id, message)
                    .await
            }
        };
        match stored {
            Ok(()) => warn!(comprobante_id = %comprobante.id, %state, error = %message, "authorization run settled"),
            Err(err) => error!(
                comprobante_id = %comprobante.id,
                %state,
                error = %err,
                "failed to persist terminal state"
            ),
        }

        let report = CallbackReport::failed(state, access_key, message);
        self.services
            .callbacks
            .notify(comprobante.id, &comprobante.payload, &report)
            .await;
    }

    fn retry_or_fail(&self, attempt: u32, error: String) -> JobExecution {
        if self.settings.retry.allows_retry_after(attempt) {
            JobExecution::Retry {
                delay: self.settings.retry.backoff_for(attempt),
                error,
            }
        } else {
            JobExecution::Failed { error }
        }
    }
}

pub struct AuthorizeComprobanteJob;

impl AuthorizeComprobanteJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AuthorizeComprobanteJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for AuthorizeComprobanteJob {
    fn job_type(&self) -> &'static str {
        JOB_AUTHORIZE_COMPROBANTE
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let request: AuthorizeRequest = match serde_json::from_value(job.payload.clone()) {
            Ok(request) => request,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid authorization payload: {err}"),
                }
            }
        };
        state.pipeline.run(&request, attempt_number(&job)).await
    }
}
