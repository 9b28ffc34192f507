//! Issuing request: picks the sequence, derives the access key, stores the
//! comprobante as PENDING and queues its authorization run.

use chrono::NaiveDate;
use diesel::dsl::max;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::{
    access_key::{AccessKey, AccessKeyParts, Environment, MalformedKey},
    jobs::{enqueue_job, JobQueueError, JOB_AUTHORIZE_COMPROBANTE},
    models::{Comprobante, ComprobanteState, Establishment, Issuer, NewComprobante},
    schema::{comprobantes, establishments, issuers},
    sequence::lock_emission_point,
    workers::authorize::AuthorizeRequest,
};

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("invalid callback target: {0}")]
    InvalidCallback(String),
    #[error("issuer {0} not found")]
    IssuerNotFound(Uuid),
    #[error("emission point {0} not found")]
    EmissionPointNotFound(Uuid),
    #[error("emission point {0} does not belong to the issuer")]
    ForeignEmissionPoint(Uuid),
    #[error("emission point {0} is inactive")]
    InactiveEmissionPoint(Uuid),
    #[error("issuer has an invalid environment code {0:?}")]
    InvalidEnvironment(String),
    #[error("sequence {0} is out of range")]
    SequenceOutOfRange(i64),
    #[error(transparent)]
    MalformedKey(#[from] MalformedKey),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub issuer_id: Uuid,
    pub emission_point_id: Uuid,
    pub document_type: String,
    pub emission_date: NaiveDate,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct IssuedComprobante {
    pub comprobante: Comprobante,
    pub job_id: Uuid,
}

/// `saleId` and `callbackUrl` travel together; the URL must be absolute http(s).
pub fn validate_callback_target(payload: &Value) -> Result<(), IssuanceError> {
    let present = |field: &str| match payload.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    };

    match (present("saleId"), present("callbackUrl")) {
        (false, false) => Ok(()),
        (true, false) => Err(IssuanceError::InvalidCallback(
            "saleId requires callbackUrl".into(),
        )),
        (false, true) => Err(IssuanceError::InvalidCallback(
            "callbackUrl requires saleId".into(),
        )),
        (true, true) => {
            let raw = payload
                .get("callbackUrl")
                .and_then(Value::as_str)
                .ok_or_else(|| IssuanceError::InvalidCallback("callbackUrl must be a string".into()))?;
            let url = Url::parse(raw.trim())
                .map_err(|err| IssuanceError::InvalidCallback(format!("{raw}: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(IssuanceError::InvalidCallback(format!(
                    "unsupported scheme {}",
                    url.scheme()
                )));
            }
            Ok(())
        }
    }
}

/// Next sequence for a point: past both the committed counter and every
/// sequence still held by a run in flight or an authorized document. The
/// counter can lag behind an authorization whose commit failed.
fn choose_sequence(next_sequence: i64, highest_held: Option<i64>) -> i64 {
    highest_held
        .map(|highest| next_sequence.max(highest + 1))
        .unwrap_or(next_sequence)
}

pub fn issue_comprobante(
    conn: &mut PgConnection,
    request: &IssueRequest,
) -> Result<IssuedComprobante, IssuanceError> {
    validate_callback_target(&request.payload)?;

    conn.transaction::<_, IssuanceError, _>(|conn| {
        let issuer: Issuer = issuers::table
            .find(request.issuer_id)
            .first(conn)
            .optional()?
            .ok_or(IssuanceError::IssuerNotFound(request.issuer_id))?;
        let point = lock_emission_point(conn, request.emission_point_id)
            .optional()?
            .ok_or(IssuanceError::EmissionPointNotFound(request.emission_point_id))?;
        let establishment: Establishment =
            establishments::table.find(point.establishment_id).first(conn)?;
        if establishment.issuer_id != issuer.id {
            return Err(IssuanceError::ForeignEmissionPoint(point.id));
        }
        if !point.active {
            return Err(IssuanceError::InactiveEmissionPoint(point.id));
        }

        let holding: Vec<&str> = ComprobanteState::HOLDS_SEQUENCE
            .iter()
            .map(|state| state.as_str())
            .collect();
        let highest_held: Option<i64> = comprobantes::table
            .filter(comprobantes::emission_point_id.eq(point.id))
            .filter(comprobantes::state.eq_any(holding))
            .select(max(comprobantes::sequence))
            .get_result(conn)?;
        let sequence = choose_sequence(point.next_sequence, highest_held);
        let sequence_u32 =
            u32::try_from(sequence).map_err(|_| IssuanceError::SequenceOutOfRange(sequence))?;

        let environment = Environment::from_code(&issuer.environment)
            .ok_or_else(|| IssuanceError::InvalidEnvironment(issuer.environment.clone()))?;
        let access_key = AccessKey::generate(&AccessKeyParts {
            emission_date: request.emission_date,
            document_type: &request.document_type,
            ruc: &issuer.ruc,
            environment,
            establishment: &establishment.code,
            emission_point: &point.code,
            sequence: sequence_u32,
            numeric_code: None,
        })?;

        let new_comprobante = NewComprobante {
            id: Uuid::new_v4(),
            issuer_id: issuer.id,
            emission_point_id: point.id,
            document_type: request.document_type.clone(),
            environment: issuer.environment.clone(),
            access_key: Some(access_key.to_string()),
            establishment: Some(establishment.code.clone()),
            emission_point: Some(point.code.clone()),
            sequence: Some(sequence),
            emission_date: request.emission_date,
            state: ComprobanteState::Pending.as_str().to_string(),
            payload: request.payload.clone(),
        };
        let comprobante: Comprobante = diesel::insert_into(comprobantes::table)
            .values(&new_comprobante)
            .get_result(conn)?;

        let job = enqueue_job(
            conn,
            JOB_AUTHORIZE_COMPROBANTE,
            json!(AuthorizeRequest {
                comprobante_id: comprobante.id,
                emission_point_id: point.id,
                access_key: access_key.to_string(),
            }),
            None,
        )?;

        info!(
            comprobante_id = %comprobante.id,
            access_key = %access_key,
            sequence,
            job_id = %job.id,
            "comprobante issued"
        );
        Ok(IssuedComprobante {
            comprobante,
            job_id: job.id,
        })
    })
}
