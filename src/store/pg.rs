use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tokio::task;
use tracing::info;
use uuid::Uuid;

use crate::{
    db::PgPool,
    models::{BulkExportJob, Comprobante, ComprobanteState, ExportStatus, Issuer},
    schema::{bulk_export_jobs, comprobantes, issuers},
    sri::AuthorizationRecord,
};

use super::{ComprobanteStore, ExportJobStore, SignedIdentity, StoreError, StoreResult};

async fn with_conn<F, T>(pool: &PgPool, f: F) -> StoreResult<T>
where
    F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|err| StoreError::Pool(err.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|err| StoreError::Task(err.to_string()))?
}

fn expect_row(affected: usize, id: Uuid) -> StoreResult<()> {
    if affected == 0 {
        Err(StoreError::NotFound(id))
    } else {
        Ok(())
    }
}

pub struct PgComprobanteStore {
    pool: PgPool,
}

impl PgComprobanteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(
        &self,
        id: Uuid,
        state: ComprobanteState,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        with_conn(&self.pool, move |conn| {
            let affected = diesel::update(comprobantes::table.find(id))
                .set((
                    comprobantes::state.eq(state.as_str()),
                    comprobantes::error_message.eq(error_message),
                    comprobantes::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await?;
        info!(comprobante_id = %id, state = %state, "comprobante state updated");
        Ok(())
    }
}

#[async_trait]
impl ComprobanteStore for PgComprobanteStore {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Comprobante>> {
        with_conn(&self.pool, move |conn| {
            Ok(comprobantes::table.find(id).first(conn).optional()?)
        })
        .await
    }

    async fn find_by_access_key(&self, access_key: &str) -> StoreResult<Option<Comprobante>> {
        let access_key = access_key.to_string();
        with_conn(&self.pool, move |conn| {
            Ok(comprobantes::table
                .filter(comprobantes::access_key.eq(access_key))
                .first(conn)
                .optional()?)
        })
        .await
    }

    async fn load_issuer(&self, id: Uuid) -> StoreResult<Option<Issuer>> {
        with_conn(&self.pool, move |conn| {
            Ok(issuers::table.find(id).first(conn).optional()?)
        })
        .await
    }

    async fn mark_processing(&self, id: Uuid) -> StoreResult<()> {
        with_conn(&self.pool, move |conn| {
            let now = Utc::now().naive_utc();
            let affected = diesel::update(comprobantes::table.find(id))
                .set((
                    comprobantes::state.eq(ComprobanteState::Processing.as_str()),
                    comprobantes::processed_at.eq(Some(now)),
                    comprobantes::updated_at.eq(now),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await
    }

    async fn mark_signed(&self, id: Uuid, identity: &SignedIdentity) -> StoreResult<()> {
        let identity = identity.clone();
        with_conn(&self.pool, move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let current: Comprobante = comprobantes::table
                    .find(id)
                    .for_update()
                    .first(conn)
                    .optional()?
                    .ok_or(StoreError::NotFound(id))?;

                let locked = current
                    .lifecycle()
                    .map(ComprobanteState::locks_identity)
                    .unwrap_or(false);
                if locked && !identity.matches(&current) {
                    return Err(StoreError::IdentityLocked(id));
                }

                diesel::update(comprobantes::table.find(id))
                    .set((
                        comprobantes::state.eq(ComprobanteState::Signed.as_str()),
                        comprobantes::access_key.eq(Some(identity.access_key.clone())),
                        comprobantes::establishment.eq(Some(identity.establishment.clone())),
                        comprobantes::emission_point.eq(Some(identity.emission_point.clone())),
                        comprobantes::sequence.eq(Some(identity.sequence)),
                        comprobantes::error_message.eq::<Option<String>>(None),
                        comprobantes::updated_at.eq(Utc::now().naive_utc()),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    async fn mark_authorized(&self, id: Uuid, record: &AuthorizationRecord) -> StoreResult<()> {
        let authorization_number = record.authorization_number.clone();
        let authorized_at = record
            .authorized_at_utc()
            .unwrap_or_else(|| Utc::now().naive_utc());
        with_conn(&self.pool, move |conn| {
            let affected = diesel::update(comprobantes::table.find(id))
                .set((
                    comprobantes::state.eq(ComprobanteState::Authorized.as_str()),
                    comprobantes::authorization_number.eq(authorization_number),
                    comprobantes::authorized_at.eq(Some(authorized_at)),
                    comprobantes::error_message.eq::<Option<String>>(None),
                    comprobantes::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await
    }

    async fn mark_needs_correction(&self, id: Uuid, message: &str) -> StoreResult<()> {
        self.set_state(id, ComprobanteState::NeedsCorrection, Some(message.to_string()))
            .await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()> {
        self.set_state(id, ComprobanteState::Failed, Some(message.to_string()))
            .await
    }
}

pub struct PgExportJobStore {
    pool: PgPool,
}

impl PgExportJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExportJobStore for PgExportJobStore {
    async fn load(&self, id: Uuid) -> StoreResult<Option<BulkExportJob>> {
        with_conn(&self.pool, move |conn| {
            Ok(bulk_export_jobs::table.find(id).first(conn).optional()?)
        })
        .await
    }

    async fn mark_processing(&self, id: Uuid) -> StoreResult<()> {
        with_conn(&self.pool, move |conn| {
            diesel::update(
                bulk_export_jobs::table
                    .find(id)
                    .filter(bulk_export_jobs::status.eq(ExportStatus::Pending.as_str())),
            )
            .set((
                bulk_export_jobs::status.eq(ExportStatus::Processing.as_str()),
                bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn increment_processed(&self, id: Uuid) -> StoreResult<i32> {
        with_conn(&self.pool, move |conn| {
            diesel::update(bulk_export_jobs::table.find(id))
                .set((
                    bulk_export_jobs::processed_files.eq(bulk_export_jobs::processed_files + 1),
                    bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .returning(bulk_export_jobs::processed_files)
                .get_result(conn)
                .optional()?
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn is_cancelled(&self, id: Uuid) -> StoreResult<bool> {
        with_conn(&self.pool, move |conn| {
            bulk_export_jobs::table
                .find(id)
                .select(bulk_export_jobs::cancelled)
                .first(conn)
                .optional()?
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn complete_chunk(&self, id: Uuid) -> StoreResult<BulkExportJob> {
        with_conn(&self.pool, move |conn| {
            diesel::update(bulk_export_jobs::table.find(id))
                .set((
                    bulk_export_jobs::completed_chunks.eq(bulk_export_jobs::completed_chunks + 1),
                    bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .get_result(conn)
                .optional()?
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn mark_compressing(&self, id: Uuid) -> StoreResult<()> {
        with_conn(&self.pool, move |conn| {
            let affected = diesel::update(bulk_export_jobs::table.find(id))
                .set((
                    bulk_export_jobs::status.eq(ExportStatus::Compressing.as_str()),
                    bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        archive_path: &str,
        expires_at: NaiveDateTime,
    ) -> StoreResult<()> {
        let archive_path = archive_path.to_string();
        with_conn(&self.pool, move |conn| {
            let affected = diesel::update(bulk_export_jobs::table.find(id))
                .set((
                    bulk_export_jobs::status.eq(ExportStatus::Completed.as_str()),
                    bulk_export_jobs::archive_path.eq(Some(archive_path)),
                    bulk_export_jobs::expires_at.eq(Some(expires_at)),
                    bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let message = message.to_string();
        with_conn(&self.pool, move |conn| {
            let affected = diesel::update(bulk_export_jobs::table.find(id))
                .set((
                    bulk_export_jobs::status.eq(ExportStatus::Failed.as_str()),
                    bulk_export_jobs::error_message.eq(Some(message)),
                    bulk_export_jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            expect_row(affected, id)
        })
        .await
    }
}
