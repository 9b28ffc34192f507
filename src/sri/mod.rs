//! Client for the tax authority's two-phase web services: reception of the
//! signed document, then polling for the authorization decision.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::access_key::{AccessKey, Environment};

pub mod pool;
pub mod soap;

pub use pool::{ClientSettings, SoapClientPool};
use soap::{AuthorityMessage, AuthorizationEntry};

const STATE_RECEIVED: &str = "RECIBIDA";
const STATE_AUTHORIZED: &str = "AUTORIZADO";
const NEGATIVE_STATES: [&str; 2] = ["NO AUTORIZADO", "RECHAZADO"];
/// Reception code for an access key the authority already holds.
pub const ALREADY_REGISTERED_CODE: &str = "43";

pub const RECEPTION_TEST_URL: &str =
    "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
pub const RECEPTION_PRODUCTION_URL: &str =
    "https://cel.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
pub const AUTHORIZATION_TEST_URL: &str =
    "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";
pub const AUTHORIZATION_PRODUCTION_URL: &str =
    "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityRejection {
    pub code: String,
    pub message: String,
    pub additional_info: Option<String>,
}

impl AuthorityRejection {
    fn from_messages(messages: &[AuthorityMessage], fallback: &str) -> Self {
        let first = messages.first();
        Self {
            code: first
                .and_then(|m| m.identifier.clone())
                .unwrap_or_else(|| "0".to_string()),
            message: first
                .and_then(|m| m.message.clone())
                .unwrap_or_else(|| fallback.to_string()),
            additional_info: first.and_then(|m| m.additional_info.clone()),
        }
    }
}

impl fmt::Display for AuthorityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(info) = &self.additional_info {
            write!(f, ": {info}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Transport faults, timeouts, SOAP faults and exhausted polling.
    #[error("authority service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("rejected by authority {0}")]
    Rejected(AuthorityRejection),
    #[error("document cannot be submitted: {0}")]
    InvalidDocument(String),
    #[error("document not authorized: {0}")]
    NotAuthorized(String),
    #[error("failed to build authority client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    pub authorization_number: Option<String>,
    /// Timestamp as reported by the authority.
    pub authorized_at: Option<String>,
    pub environment: Option<String>,
    pub document: Option<String>,
}

impl AuthorizationRecord {
    pub fn authorized_at_utc(&self) -> Option<NaiveDateTime> {
        let raw = self.authorized_at.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.naive_utc())
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(raw, "%d/%m/%Y %H:%M:%S").ok())
    }
}

impl From<&AuthorizationEntry> for AuthorizationRecord {
    fn from(entry: &AuthorizationEntry) -> Self {
        Self {
            authorization_number: entry.authorization_number.clone(),
            authorized_at: entry.authorized_at.clone(),
            environment: entry.environment.clone(),
            document: entry.document.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceptionOutcome {
    Accepted,
    AlreadyRegistered,
    Rejected(AuthorityRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Authorized(AuthorizationRecord),
    Rejected(AuthorityRejection),
    Pending,
}

#[async_trait]
pub trait AuthorityService: Send + Sync + 'static {
    /// Reception followed by authorization polling.
    async fn submit_and_authorize(
        &self,
        document: &[u8],
        access_key: &AccessKey,
    ) -> Result<AuthorizationRecord, AuthorityError>;

    async fn fetch_authorized_document(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<String, AuthorityError>;
}

#[derive(Debug, Clone)]
pub struct SriEndpoints {
    pub reception_test: String,
    pub reception_production: String,
    pub authorization_test: String,
    pub authorization_production: String,
}

impl SriEndpoints {
    pub fn official() -> Self {
        Self {
            reception_test: RECEPTION_TEST_URL.to_string(),
            reception_production: RECEPTION_PRODUCTION_URL.to_string(),
            authorization_test: AUTHORIZATION_TEST_URL.to_string(),
            authorization_production: AUTHORIZATION_PRODUCTION_URL.to_string(),
        }
    }

    pub fn reception(&self, environment: Environment) -> &str {
        match environment {
            Environment::Test => &self.reception_test,
            Environment::Production => &self.reception_production,
        }
    }

    pub fn authorization(&self, environment: Environment) -> &str {
        match environment {
            Environment::Test => &self.authorization_test,
            Environment::Production => &self.authorization_production,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

pub struct SriClient {
    pool: Arc<SoapClientPool>,
    endpoints: SriEndpoints,
    poll: PollSettings,
}

impl SriClient {
    pub fn new(pool: Arc<SoapClientPool>, endpoints: SriEndpoints, poll: PollSettings) -> Self {
        Self {
            pool,
            endpoints,
            poll,
        }
    }

    pub fn pool(&self) -> &Arc<SoapClientPool> {
        &self.pool
    }

    /// The target environment is read from the document itself so the
    /// submission always matches what was signed.
    pub async fn submit_for_reception(
        &self,
        document: &[u8],
    ) -> Result<ReceptionOutcome, AuthorityError> {
        let environment =
            soap::read_environment(document).map_err(AuthorityError::InvalidDocument)?;
        let endpoint = self.endpoints.reception(environment);
        info!(%environment, "submitting document for reception");

        let envelope = soap::reception_envelope(document)
            .map_err(|err| AuthorityError::InvalidDocument(err.to_string()))?;
        let body = self.call(endpoint, envelope).await?;

        let response = soap::parse_reception(&body)
            .map_err(|err| unavailable(format!("unreadable reception response: {err}")))?
            .ok_or_else(|| unavailable("reception response missing RespuestaRecepcionComprobante"))?;

        if response.state.as_deref() == Some(STATE_RECEIVED) {
            return Ok(ReceptionOutcome::Accepted);
        }

        let rejection = AuthorityRejection::from_messages(&response.messages, "Error en recepción");
        if rejection.code == ALREADY_REGISTERED_CODE {
            return Ok(ReceptionOutcome::AlreadyRegistered);
        }
        Ok(ReceptionOutcome::Rejected(rejection))
    }

    /// A single authorization query, no retries.
    pub async fn query_authorization(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<AuthorizationStatus, AuthorityError> {
        let endpoint = self.endpoints.authorization(environment);
        let envelope = soap::authorization_envelope(access_key.as_str())
            .map_err(|err| AuthorityError::InvalidDocument(err.to_string()))?;
        let body = self.call(endpoint, envelope).await?;

        let entries = soap::parse_authorization(&body)
            .map_err(|err| unavailable(format!("unreadable authorization response: {err}")))?
            .ok_or_else(|| {
                unavailable("authorization response missing RespuestaAutorizacionComprobante")
            })?;

        let Some(entry) = entries.first() else {
            return Ok(AuthorizationStatus::Pending);
        };

        match entry.state.as_deref() {
            Some(STATE_AUTHORIZED) => Ok(AuthorizationStatus::Authorized(entry.into())),
            Some(state) if NEGATIVE_STATES.contains(&state) => Ok(AuthorizationStatus::Rejected(
                AuthorityRejection::from_messages(&entry.messages, "Comprobante no autorizado"),
            )),
            _ => Ok(AuthorizationStatus::Pending),
        }
    }

    /// Polls while the authority reports the document as in process.
    pub async fn poll_for_authorization(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<AuthorizationRecord, AuthorityError> {
        let attempts = self.poll.attempts.max(1);
        for attempt in 1..=attempts {
            match self.query_authorization(access_key, environment).await? {
                AuthorizationStatus::Authorized(record) => {
                    info!(access_key = %access_key, attempt, "document authorized");
                    return Ok(record);
                }
                AuthorizationStatus::Rejected(rejection) => {
                    return Err(AuthorityError::Rejected(rejection));
                }
                AuthorizationStatus::Pending => {
                    if attempt < attempts {
                        sleep(self.poll.delay).await;
                    }
                }
            }
        }

        Err(unavailable(format!(
            "no definitive authorization answer after {attempts} attempts"
        )))
    }

    async fn call(&self, endpoint: &str, envelope: Vec<u8>) -> Result<String, AuthorityError> {
        let client = self.pool.client_for(endpoint).await?;
        let response = client
            .post(endpoint)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", "")
            .body(envelope)
            .send()
            .await
            .map_err(|err| {
                warn!(%endpoint, error = %err, "authority request failed");
                unavailable(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| unavailable(format!("failed to read authority response: {err}")))?;

        if let Some(fault) = soap::fault_string(&body) {
            warn!(%endpoint, %status, %fault, "authority returned SOAP fault");
            return Err(unavailable(format!("SOAP fault: {fault}")));
        }
        if !status.is_success() {
            return Err(unavailable(format!(
                "authority responded with status {status}"
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl AuthorityService for SriClient {
    async fn submit_and_authorize(
        &self,
        document: &[u8],
        access_key: &AccessKey,
    ) -> Result<AuthorizationRecord, AuthorityError> {
        match self.submit_for_reception(document).await? {
            ReceptionOutcome::Accepted => {}
            ReceptionOutcome::AlreadyRegistered => {
                info!(access_key = %access_key, "access key already registered; polling authorization");
            }
            ReceptionOutcome::Rejected(rejection) => return Err(AuthorityError::Rejected(rejection)),
        }

        let environment =
            soap::read_environment(document).map_err(AuthorityError::InvalidDocument)?;
        self.poll_for_authorization(access_key, environment).await
    }

    async fn fetch_authorized_document(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<String, AuthorityError> {
        match self.query_authorization(access_key, environment).await? {
            AuthorizationStatus::Authorized(record) => record.document.ok_or_else(|| {
                AuthorityError::NotAuthorized("authorization carries no document".into())
            }),
            AuthorizationStatus::Rejected(rejection) => Err(AuthorityError::Rejected(rejection)),
            AuthorizationStatus::Pending => Err(AuthorityError::NotAuthorized(format!(
                "no authorization found for {access_key}"
            ))),
        }
    }
}

fn unavailable(message: impl Into<String>) -> AuthorityError {
    AuthorityError::ServiceUnavailable(message.into())
}
