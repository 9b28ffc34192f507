use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::{header::USER_AGENT, Client};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    models::{Comprobante, ComprobanteState},
    sri::AuthorizationRecord,
};

pub const DEFAULT_USER_AGENT: &str = concat!("comprobantes/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Webhook target carried in the issuing request payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackTarget {
    pub sale_id: Value,
    pub url: String,
}

impl CallbackTarget {
    /// Both `saleId` and `callbackUrl` must be present and non-empty.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let sale_id = payload.get("saleId").filter(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })?;
        let url = payload
            .get("callbackUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())?;
        Some(Self {
            sale_id: sale_id.clone(),
            url: url.to_string(),
        })
    }
}

/// Outcome fields reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReport {
    pub success: bool,
    pub estado_sri: String,
    pub clave_acceso: Option<String>,
    pub numero_autorizacion: Option<String>,
    pub fecha_autorizacion: Option<String>,
    pub error_message: Option<String>,
}

impl CallbackReport {
    pub fn authorized(access_key: &str, record: &AuthorizationRecord) -> Self {
        Self {
            success: true,
            estado_sri: ComprobanteState::Authorized.authority_label().to_string(),
            clave_acceso: Some(access_key.to_string()),
            numero_autorizacion: record.authorization_number.clone(),
            fecha_autorizacion: record.authorized_at.clone(),
            error_message: None,
        }
    }

    pub fn failed(state: ComprobanteState, access_key: Option<&str>, message: &str) -> Self {
        Self {
            success: false,
            estado_sri: state.authority_label().to_string(),
            clave_acceso: access_key.map(str::to_string),
            numero_autorizacion: None,
            fecha_autorizacion: None,
            error_message: Some(message.to_string()),
        }
    }

    /// Rebuilds the report from persisted state.
    pub fn from_comprobante(comprobante: &Comprobante) -> Self {
        let state = comprobante.lifecycle().ok();
        let success = matches!(
            state,
            Some(ComprobanteState::Authorized | ComprobanteState::Signed)
        );
        Self {
            success,
            estado_sri: state
                .map(|s| s.authority_label().to_string())
                .unwrap_or_else(|| comprobante.state.to_uppercase()),
            clave_acceso: comprobante.access_key.clone(),
            numero_autorizacion: comprobante.authorization_number.clone(),
            fecha_autorizacion: comprobante
                .authorized_at
                .map(|at| at.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true)),
            error_message: if success {
                None
            } else {
                comprobante.error_message.clone()
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallbackPayload {
    #[serde(rename = "saleId")]
    pub sale_id: Value,
    #[serde(rename = "comprobanteId")]
    pub comprobante_id: Uuid,
    pub success: bool,
    pub timestamp: String,
    pub estado_sri: String,
    pub clave_acceso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numero_autorizacion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fecha_autorizacion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CallbackPayload {
    pub fn new(comprobante_id: Uuid, target: &CallbackTarget, report: &CallbackReport) -> Self {
        Self {
            sale_id: target.sale_id.clone(),
            comprobante_id,
            success: report.success,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            estado_sri: report.estado_sri.clone(),
            clave_acceso: report.clave_acceso.clone(),
            numero_autorizacion: report.numero_autorizacion.clone(),
            fecha_autorizacion: report.fecha_autorizacion.clone(),
            error_message: report.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The request carried no callback target.
    Skipped,
    Delivered(u16),
    UnexpectedStatus(u16),
    Unreachable,
}

/// Fire-and-forget webhook delivery. No retries; every failure is logged and
/// swallowed.
pub struct CallbackDispatcher {
    client: Client,
    user_agent: String,
}

impl CallbackDispatcher {
    pub fn new(user_agent: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build callback client")?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }

    pub async fn notify(
        &self,
        comprobante_id: Uuid,
        request_payload: &Value,
        report: &CallbackReport,
    ) -> CallbackOutcome {
        let Some(target) = CallbackTarget::from_payload(request_payload) else {
            info!(comprobante_id = %comprobante_id, "no callback target configured; skipping");
            return CallbackOutcome::Skipped;
        };
        let payload = CallbackPayload::new(comprobante_id, &target, report);

        info!(
            comprobante_id = %comprobante_id,
            url = %target.url,
            estado_sri = %payload.estado_sri,
            "sending callback"
        );

        let result = self
            .client
            .post(&target.url)
            .header("X-Billing-Notification", "true")
            .header("X-Comprobante-Id", comprobante_id.to_string())
            .header(USER_AGENT, &self.user_agent)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                info!(comprobante_id = %comprobante_id, url = %target.url, status, "callback delivered");
                CallbackOutcome::Delivered(status)
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    comprobante_id = %comprobante_id,
                    url = %target.url,
                    status,
                    response = %body,
                    "callback answered with unexpected status"
                );
                CallbackOutcome::UnexpectedStatus(status)
            }
            Err(err) => {
                error!(
                    comprobante_id = %comprobante_id,
                    url = %target.url,
                    error = %err,
                    "callback delivery failed"
                );
                CallbackOutcome::Unreachable
            }
        }
    }

    pub async fn resend(&self, comprobante: &Comprobante) -> CallbackOutcome {
        let report = CallbackReport::from_comprobante(comprobante);
        self.notify(comprobante.id, &comprobante.payload, &report)
            .await
    }
}
