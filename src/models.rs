use std::{fmt, str::FromStr};

use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = issuers)]
pub struct Issuer {
    pub id: Uuid,
    pub ruc: String,
    pub business_name: String,
    pub environment: String,
    pub signature_path: Option<String>,
    pub signature_password: Option<String>,
    pub email_documents: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = issuers)]
pub struct NewIssuer {
    pub id: Uuid,
    pub ruc: String,
    pub business_name: String,
    pub environment: String,
    pub signature_path: Option<String>,
    pub signature_password: Option<String>,
    pub email_documents: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = establishments)]
#[diesel(belongs_to(Issuer))]
pub struct Establishment {
    pub id: Uuid,
    pub issuer_id: Uuid,
    pub code: String,
    pub address: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = establishments)]
pub struct NewEstablishment {
    pub id: Uuid,
    pub issuer_id: Uuid,
    pub code: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = emission_points)]
#[diesel(belongs_to(Establishment))]
pub struct EmissionPoint {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub code: String,
    pub active: bool,
    /// Sequence recorded by the latest reservation, kept for traceability.
    pub reserved_sequence: i64,
    pub last_sequence: i64,
    pub next_sequence: i64,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = emission_points)]
pub struct NewEmissionPoint {
    pub id: Uuid,
    pub establishment_id: Uuid,
    pub code: String,
    pub active: bool,
    pub last_sequence: i64,
    pub next_sequence: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = comprobantes)]
#[diesel(belongs_to(Issuer))]
#[diesel(belongs_to(EmissionPoint))]
pub struct Comprobante {
    pub id: Uuid,
    pub issuer_id: Uuid,
    pub emission_point_id: Uuid,
    pub document_type: String,
    pub environment: String,
    pub access_key: Option<String>,
    pub establishment: Option<String>,
    pub emission_point: Option<String>,
    pub sequence: Option<i64>,
    pub emission_date: NaiveDate,
    pub state: String,
    pub processed_at: Option<NaiveDateTime>,
    pub authorized_at: Option<NaiveDateTime>,
    pub authorization_number: Option<String>,
    pub error_message: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Comprobante {
    pub fn lifecycle(&self) -> Result<ComprobanteState, UnknownVariant> {
        self.state.parse()
    }

    /// `001-002-000000123` style number printed on the document.
    pub fn document_number(&self) -> Option<String> {
        match (&self.establishment, &self.emission_point, self.sequence) {
            (Some(estab), Some(point), Some(sequence)) => {
                Some(format!("{estab}-{point}-{sequence:09}"))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = comprobantes)]
pub struct NewComprobante {
    pub id: Uuid,
    pub issuer_id: Uuid,
    pub emission_point_id: Uuid,
    pub document_type: String,
    pub environment: String,
    pub access_key: Option<String>,
    pub establishment: Option<String>,
    pub emission_point: Option<String>,
    pub sequence: Option<i64>,
    pub emission_date: NaiveDate,
    pub state: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = bulk_export_jobs)]
#[diesel(belongs_to(Issuer, foreign_key = owner_id))]
pub struct BulkExportJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub format: String,
    pub total_files: i32,
    pub processed_files: i32,
    pub total_chunks: i32,
    pub completed_chunks: i32,
    pub status: String,
    pub cancelled: bool,
    pub archive_path: Option<String>,
    pub error_message: Option<String>,
    pub expires_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl BulkExportJob {
    pub fn export_status(&self) -> Result<ExportStatus, UnknownVariant> {
        self.status.parse()
    }

    pub fn export_format(&self) -> Result<ExportFormat, UnknownVariant> {
        self.format.parse()
    }

    pub fn is_downloadable(&self, now: NaiveDateTime) -> bool {
        self.status == ExportStatus::Completed.as_str()
            && self.archive_path.is_some()
            && self.expires_at.map(|expiry| expiry > now).unwrap_or(false)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = bulk_export_jobs)]
pub struct NewBulkExportJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub format: String,
    pub total_files: i32,
    pub total_chunks: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(ComprobanteState, "comprobante state", {
    Pending => "pendiente",
    Processing => "procesando",
    Signed => "firmado",
    Authorized => "autorizado",
    NeedsCorrection => "necesita_correccion",
    Failed => "fallido",
});

impl ComprobanteState {
    /// States whose sequence number must not be handed out again: runs still
    /// in flight and documents the authority has already registered.
    pub const HOLDS_SEQUENCE: [ComprobanteState; 4] = [
        ComprobanteState::Pending,
        ComprobanteState::Processing,
        ComprobanteState::Signed,
        ComprobanteState::Authorized,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ComprobanteState::Authorized
                | ComprobanteState::NeedsCorrection
                | ComprobanteState::Failed
        )
    }

    /// Access key, establishment, point and sequence can no longer change.
    pub fn locks_identity(self) -> bool {
        matches!(self, ComprobanteState::Signed | ComprobanteState::Authorized)
    }

    /// Value reported to webhook callers in `estado_sri`.
    pub fn authority_label(self) -> &'static str {
        match self {
            ComprobanteState::Pending => "PENDIENTE",
            ComprobanteState::Processing => "PROCESANDO",
            ComprobanteState::Signed => "FIRMADO",
            ComprobanteState::Authorized => "AUTORIZADO",
            ComprobanteState::NeedsCorrection => "NECESITA_CORRECCION",
            ComprobanteState::Failed => "FALLIDO",
        }
    }
}

text_enum!(ExportStatus, "export status", {
    Pending => "pending",
    Processing => "processing",
    Compressing => "compressing",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(ExportFormat, "export format", {
    Pdf => "pdf",
    Xml => "xml",
});
