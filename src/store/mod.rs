//! Persistence seams for comprobantes and bulk export jobs. The pipelines
//! only see these traits; `pg` holds the diesel-backed implementations.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    models::{BulkExportJob, Comprobante, Issuer},
    sri::AuthorizationRecord,
};

pub mod pg;

pub use pg::{PgComprobanteStore, PgExportJobStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("comprobante {0} is already signed with a different identity")]
    IdentityLocked(Uuid),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Identity written when a document is signed. Once stored it never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIdentity {
    pub access_key: String,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: i64,
}

impl SignedIdentity {
    pub fn matches(&self, comprobante: &Comprobante) -> bool {
        comprobante.access_key.as_deref() == Some(self.access_key.as_str())
            && comprobante.establishment.as_deref() == Some(self.establishment.as_str())
            && comprobante.emission_point.as_deref() == Some(self.emission_point.as_str())
            && comprobante.sequence == Some(self.sequence)
    }
}

#[async_trait]
pub trait ComprobanteStore: Send + Sync + 'static {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Comprobante>>;

    async fn find_by_access_key(&self, access_key: &str) -> StoreResult<Option<Comprobante>>;

    async fn load_issuer(&self, id: Uuid) -> StoreResult<Option<Issuer>>;

    async fn mark_processing(&self, id: Uuid) -> StoreResult<()>;

    /// Fails with [`StoreError::IdentityLocked`] when the row already carries
    /// a signed identity that differs from `identity`.
    async fn mark_signed(&self, id: Uuid, identity: &SignedIdentity) -> StoreResult<()>;

    async fn mark_authorized(&self, id: Uuid, record: &AuthorizationRecord) -> StoreResult<()>;

    async fn mark_needs_correction(&self, id: Uuid, message: &str) -> StoreResult<()>;

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ExportJobStore: Send + Sync + 'static {
    async fn load(&self, id: Uuid) -> StoreResult<Option<BulkExportJob>>;

    /// Moves a pending job to processing; later calls are no-ops.
    async fn mark_processing(&self, id: Uuid) -> StoreResult<()>;

    /// Atomic `processed_files + 1`; returns the new count.
    async fn increment_processed(&self, id: Uuid) -> StoreResult<i32>;

    async fn is_cancelled(&self, id: Uuid) -> StoreResult<bool>;

    /// Atomic `completed_chunks + 1`; returns the job as it stands afterwards.
    async fn complete_chunk(&self, id: Uuid) -> StoreResult<BulkExportJob>;

    async fn mark_compressing(&self, id: Uuid) -> StoreResult<()>;

    async fn mark_completed(
        &self,
        id: Uuid,
        archive_path: &str,
        expires_at: NaiveDateTime,
    ) -> StoreResult<()>;

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()>;
}
