//! Seams to the collaborators the pipelines drive but do not implement:
//! document construction, signing, rendering and owner notification.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDate;
use reqwest::{header::CONTENT_DISPOSITION, Client};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::warn;
use uuid::Uuid;

use crate::{
    access_key::{AccessKey, Environment},
    models::{Comprobante, ExportFormat, Issuer},
    sequence::ReservedSequence,
    sri::AuthorityService,
};

const SIGNED_FILE_NAME: &str = "signed.xml";

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("construction service request failed: {0}")]
    Request(String),
    #[error("construction service rejected the fields ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("construction service returned an empty document")]
    Empty,
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("electronic signature is not configured for the issuer")]
    MissingCredentials,
    #[error("signature certificate not found: {0}")]
    MissingCertificate(PathBuf),
    #[error("signing tool not available: {0}")]
    ToolMissing(String),
    #[error("signing tool failed (exit {status}): {stderr}")]
    ToolFailed { status: String, stderr: String },
    #[error("signing io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Field set handed to the construction service.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedFields {
    pub comprobante_id: Uuid,
    #[serde(rename = "codDoc")]
    pub document_type: String,
    #[serde(rename = "ambiente")]
    pub environment: String,
    pub ruc: String,
    #[serde(rename = "razonSocial")]
    pub business_name: String,
    #[serde(rename = "fechaEmision")]
    pub emission_date: NaiveDate,
    #[serde(rename = "estab")]
    pub establishment: String,
    #[serde(rename = "ptoEmi")]
    pub emission_point: String,
    #[serde(rename = "secuencial")]
    pub sequence: String,
    pub data: Value,
}

impl PreparedFields {
    /// The sequence always comes from the access key, never from the counter
    /// read under the lock, so key and document body cannot disagree.
    pub fn prepare(
        comprobante: &Comprobante,
        issuer: &Issuer,
        reserved: &ReservedSequence,
        access_key: &AccessKey,
    ) -> Self {
        Self {
            comprobante_id: comprobante.id,
            document_type: comprobante.document_type.clone(),
            environment: comprobante.environment.clone(),
            ruc: issuer.ruc.clone(),
            business_name: issuer.business_name.clone(),
            emission_date: comprobante.emission_date,
            establishment: reserved.establishment.clone(),
            emission_point: reserved.emission_point.clone(),
            sequence: access_key.sequence_digits().to_string(),
            data: comprobante.payload.clone(),
        }
    }
}

#[async_trait]
pub trait DocumentBuilder: Send + Sync + 'static {
    async fn build(
        &self,
        fields: &PreparedFields,
        access_key: &AccessKey,
    ) -> Result<Vec<u8>, ConstructionError>;
}

pub struct HttpDocumentBuilder {
    client: Client,
    url: String,
}

impl HttpDocumentBuilder {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl DocumentBuilder for HttpDocumentBuilder {
    async fn build(
        &self,
        fields: &PreparedFields,
        access_key: &AccessKey,
    ) -> Result<Vec<u8>, ConstructionError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "fields": fields,
                "access_key": access_key.as_str(),
            }))
            .send()
            .await
            .map_err(|err| ConstructionError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConstructionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ConstructionError::Request(err.to_string()))?;
        if bytes.is_empty() {
            return Err(ConstructionError::Empty);
        }
        Ok(bytes.to_vec())
    }
}

/// Resolved signer credentials. The password never appears in `Debug` output.
#[derive(Clone)]
pub struct SignerCredentials {
    pub certificate: PathBuf,
    password: String,
}

impl SignerCredentials {
    pub fn for_issuer(issuer: &Issuer, storage_dir: &Path) -> Result<Self, SigningError> {
        let (Some(path), Some(password)) = (
            issuer.signature_path.as_deref().filter(|p| !p.trim().is_empty()),
            issuer
                .signature_password
                .as_deref()
                .filter(|p| !p.is_empty()),
        ) else {
            return Err(SigningError::MissingCredentials);
        };

        let certificate = storage_dir.join(path);
        if !certificate.is_file() {
            return Err(SigningError::MissingCertificate(certificate));
        }

        Ok(Self {
            certificate,
            password: password.to_string(),
        })
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for SignerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerCredentials")
            .field("certificate", &self.certificate)
            .field("password", &"*****")
            .finish()
    }
}

#[async_trait]
pub trait Signer: Send + Sync + 'static {
    /// Signs the document at `document`, writing any intermediate output
    /// inside `workdir`.
    async fn sign(
        &self,
        document: &Path,
        credentials: &SignerCredentials,
        workdir: &Path,
    ) -> Result<Vec<u8>, SigningError>;
}

/// Runs the external signing jar: `java -jar <jar> <cert> <password> <input> <outdir> <outfile>`.
pub struct JarSigner {
    java_bin: String,
    jar_path: PathBuf,
}

impl JarSigner {
    pub fn new(java_bin: impl Into<String>, jar_path: impl Into<PathBuf>) -> Self {
        Self {
            java_bin: java_bin.into(),
            jar_path: jar_path.into(),
        }
    }
}

#[async_trait]
impl Signer for JarSigner {
    async fn sign(
        &self,
        document: &Path,
        credentials: &SignerCredentials,
        workdir: &Path,
    ) -> Result<Vec<u8>, SigningError> {
        let output = Command::new(&self.java_bin)
            .arg("-jar")
            .arg(&self.jar_path)
            .arg(&credentials.certificate)
            .arg(credentials.password())
            .arg(document)
            .arg(workdir)
            .arg(SIGNED_FILE_NAME)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    SigningError::ToolMissing(self.java_bin.clone())
                } else {
                    SigningError::Io(err)
                }
            })?;

        let signed_path = workdir.join(SIGNED_FILE_NAME);
        if !output.status.success() || !signed_path.is_file() {
            return Err(SigningError::ToolFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(fs::read(&signed_path).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn render(&self, comprobante: &Comprobante, format: ExportFormat) -> Result<RenderedFile>;
}

/// PDFs come from the rendering service; XML is the authorized copy held by
/// the authority.
pub struct ServiceRenderer {
    client: Client,
    pdf_url: String,
    authority: Arc<dyn AuthorityService>,
}

impl ServiceRenderer {
    pub fn new(client: Client, pdf_url: impl Into<String>, authority: Arc<dyn AuthorityService>) -> Self {
        Self {
            client,
            pdf_url: pdf_url.into(),
            authority,
        }
    }

    async fn render_pdf(&self, comprobante: &Comprobante, access_key: &AccessKey) -> Result<RenderedFile> {
        let response = self
            .client
            .post(&self.pdf_url)
            .json(&json!({
                "comprobante_id": comprobante.id,
                "access_key": access_key.as_str(),
                "document_number": comprobante.document_number(),
                "authorization_number": comprobante.authorization_number,
                "authorized_at": comprobante.authorized_at,
                "payload": comprobante.payload,
            }))
            .send()
            .await
            .context("pdf rendering request failed")?
            .error_for_status()
            .context("pdf rendering service returned an error")?;

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_file_name)
            .unwrap_or_else(|| format!("{access_key}.pdf"));
        let bytes = response
            .bytes()
            .await
            .context("failed to read rendered pdf")?;

        Ok(RenderedFile {
            file_name,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl Renderer for ServiceRenderer {
    async fn render(&self, comprobante: &Comprobante, format: ExportFormat) -> Result<RenderedFile> {
        let raw_key = comprobante
            .access_key
            .as_deref()
            .ok_or_else(|| anyhow!("comprobante {} has no access key", comprobante.id))?;
        let access_key = AccessKey::parse(raw_key)?;

        match format {
            ExportFormat::Pdf => self.render_pdf(comprobante, &access_key).await,
            ExportFormat::Xml => {
                let environment = Environment::from_code(&comprobante.environment)
                    .ok_or_else(|| anyhow!("invalid environment {:?}", comprobante.environment))?;
                let xml = self
                    .authority
                    .fetch_authorized_document(&access_key, environment)
                    .await?;
                Ok(RenderedFile {
                    file_name: format!("{access_key}.xml"),
                    bytes: xml.into_bytes(),
                })
            }
        }
    }
}

fn disposition_file_name(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Clone)]
pub struct OwnerNotification {
    pub issuer_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub access_key: String,
    pub total: f64,
    pub signed_document: Vec<u8>,
}

impl OwnerNotification {
    /// `None` when the issuer opted out or the request carries no usable
    /// recipient address.
    pub fn for_authorized(
        issuer: &Issuer,
        comprobante: &Comprobante,
        access_key: &AccessKey,
        signed_document: Vec<u8>,
    ) -> Option<Self> {
        if !issuer.email_documents {
            return None;
        }
        let Some(recipient) = recipient_email(&comprobante.payload) else {
            warn!(comprobante_id = %comprobante.id, "no valid recipient email for comprobante");
            return None;
        };
        let number = comprobante.document_number().unwrap_or_default();

        Some(Self {
            issuer_id: issuer.id,
            recipient,
            subject: format!("Ha recibido su documento electrónico: FAC {number}"),
            access_key: access_key.to_string(),
            total: document_total(&comprobante.payload),
            signed_document,
        })
    }
}

#[async_trait]
pub trait OwnerNotifier: Send + Sync + 'static {
    async fn notify(&self, notification: &OwnerNotification) -> Result<()>;
}

pub struct HttpOwnerNotifier {
    client: Client,
    url: String,
}

impl HttpOwnerNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl OwnerNotifier for HttpOwnerNotifier {
    async fn notify(&self, notification: &OwnerNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({
                "issuer_id": notification.issuer_id,
                "to": notification.recipient,
                "subject": notification.subject,
                "access_key": notification.access_key,
                "total": notification.total,
                "attachments": [{
                    "filename": format!("{}.xml", notification.access_key),
                    "content_base64": STANDARD.encode(&notification.signed_document),
                }],
            }))
            .send()
            .await
            .context("owner notification request failed")?
            .error_for_status()
            .context("owner notification rejected")?;
        Ok(())
    }
}

pub fn recipient_email(payload: &Value) -> Option<String> {
    [
        "/infoAdicional/email",
        "/destinatario/email",
        "/cliente/email",
    ]
    .iter()
    .filter_map(|pointer| payload.pointer(pointer).and_then(Value::as_str))
    .map(str::trim)
    .find(|candidate| looks_like_email(candidate))
    .map(str::to_string)
}

fn looks_like_email(candidate: &str) -> bool {
    let Some((local, domain)) = candidate.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !candidate.contains(char::is_whitespace)
}

pub fn document_total(payload: &Value) -> f64 {
    ["importeTotal", "valorModificacion", "totalSinImpuestos"]
        .iter()
        .filter_map(|field| payload.get(field))
        .find_map(|value| {
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}
