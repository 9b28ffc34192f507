use async_trait::async_trait;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use tokio::task;
use tracing::info;
use uuid::Uuid;

use crate::{
    access_key::AccessKey,
    db::PgPool,
    models::EmissionPoint,
    schema::{emission_points, establishments},
};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("emission point {0} not found")]
    NotFound(Uuid),
    #[error("access key series {key} does not match emission point {point}")]
    SeriesMismatch { key: String, point: String },
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("allocation task failed: {0}")]
    Task(String),
}

/// Snapshot taken while the emission point row was locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedSequence {
    pub emission_point_id: Uuid,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: u32,
}

/// Per-emission-point sequence bookkeeping. Reservations record the sequence
/// carried by an access key without advancing the counter; only a confirmed
/// authorization advances it.
#[async_trait]
pub trait SequenceAllocator: Send + Sync + 'static {
    async fn reserve(
        &self,
        emission_point_id: Uuid,
        access_key: &AccessKey,
    ) -> Result<ReservedSequence, AllocationError>;

    /// Returns the new `next_sequence`.
    async fn commit_success(
        &self,
        emission_point_id: Uuid,
        sequence: u32,
    ) -> Result<i64, AllocationError>;
}

/// Takes the exclusive row lock on an emission point for the rest of the
/// enclosing transaction.
pub fn lock_emission_point(conn: &mut PgConnection, id: Uuid) -> QueryResult<EmissionPoint> {
    emission_points::table.find(id).for_update().first(conn)
}

pub fn reserve_sequence(
    conn: &mut PgConnection,
    emission_point_id: Uuid,
    access_key: &AccessKey,
) -> Result<ReservedSequence, AllocationError> {
    conn.transaction::<_, AllocationError, _>(|conn| {
        let point = lock_emission_point(conn, emission_point_id)
            .optional()?
            .ok_or(AllocationError::NotFound(emission_point_id))?;
        let establishment: String = establishments::table
            .find(point.establishment_id)
            .select(establishments::code)
            .first(conn)?;

        if access_key.establishment() != establishment || access_key.emission_point() != point.code
        {
            return Err(AllocationError::SeriesMismatch {
                key: format!("{}-{}", access_key.establishment(), access_key.emission_point()),
                point: format!("{establishment}-{}", point.code),
            });
        }

        let sequence = access_key.sequence();
        diesel::update(emission_points::table.find(point.id))
            .set((
                emission_points::reserved_sequence.eq(i64::from(sequence)),
                emission_points::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        Ok(ReservedSequence {
            emission_point_id: point.id,
            establishment,
            emission_point: point.code,
            sequence,
        })
    })
}

pub fn commit_sequence(
    conn: &mut PgConnection,
    emission_point_id: Uuid,
    sequence: u32,
) -> Result<i64, AllocationError> {
    conn.transaction::<_, AllocationError, _>(|conn| {
        let point = lock_emission_point(conn, emission_point_id)
            .optional()?
            .ok_or(AllocationError::NotFound(emission_point_id))?;
        let committed = i64::from(sequence);
        // a later sequence may already have been committed by a concurrent run
        let last_sequence = point.last_sequence.max(committed);
        let next_sequence = point.next_sequence.max(committed + 1);

        let updated: EmissionPoint = diesel::update(emission_points::table.find(point.id))
            .set((
                emission_points::last_sequence.eq(last_sequence),
                emission_points::next_sequence.eq(next_sequence),
                emission_points::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result(conn)?;

        info!(
            emission_point_id = %point.id,
            previous_next = point.next_sequence,
            next_sequence = updated.next_sequence,
            "sequence committed"
        );
        Ok(updated.next_sequence)
    })
}

pub struct PgSequenceAllocator {
    pool: PgPool,
}

impl PgSequenceAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceAllocator for PgSequenceAllocator {
    async fn reserve(
        &self,
        emission_point_id: Uuid,
        access_key: &AccessKey,
    ) -> Result<ReservedSequence, AllocationError> {
        let pool = self.pool.clone();
        let access_key = access_key.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| AllocationError::Pool(err.to_string()))?;
            reserve_sequence(&mut conn, emission_point_id, &access_key)
        })
        .await
        .map_err(|err| AllocationError::Task(err.to_string()))?
    }

    async fn commit_success(
        &self,
        emission_point_id: Uuid,
        sequence: u32,
    ) -> Result<i64, AllocationError> {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| AllocationError::Pool(err.to_string()))?;
            commit_sequence(&mut conn, emission_point_id, sequence)
        })
        .await
        .map_err(|err| AllocationError::Task(err.to_string()))?
    }
}
