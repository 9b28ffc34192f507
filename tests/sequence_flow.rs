mod common;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use comprobantes::access_key::{AccessKey, ACCESS_KEY_LENGTH};
use comprobantes::issuance::{issue_comprobante, IssuanceError, IssueRequest};
use comprobantes::jobs::{JOB_AUTHORIZE_COMPROBANTE, JOB_EXPORT_CHUNK};
use comprobantes::models::{
    ComprobanteState, EmissionPoint, ExportFormat, NewEmissionPoint, NewEstablishment, NewIssuer,
};
use comprobantes::schema::{
    comprobantes as comprobante_rows, emission_points, establishments, issuers, jobs,
};
use comprobantes::sequence::{commit_sequence, lock_emission_point, reserve_sequence};
use comprobantes::store::{ComprobanteStore, PgComprobanteStore, SignedIdentity, StoreError};
use comprobantes::workers::export::{cancel_bulk_export, request_bulk_export, ExportError};
use common::{acquire_db_lock, emission_date, TestDb};
use diesel::prelude::*;
use diesel::PgConnection;
use serde_json::json;
use uuid::Uuid;

struct Seeded {
    issuer_id: Uuid,
    point_id: Uuid,
}

fn seed_point(conn: &mut PgConnection, ruc: &str, next_sequence: i64) -> Result<Seeded> {
    let issuer_id = Uuid::new_v4();
    diesel::insert_into(issuers::table)
        .values(&NewIssuer {
            id: issuer_id,
            ruc: ruc.to_string(),
            business_name: "Comercial Andina S.A.".to_string(),
            environment: "1".to_string(),
            signature_path: None,
            signature_password: None,
            email_documents: false,
        })
        .execute(conn)?;

    let establishment_id = Uuid::new_v4();
    diesel::insert_into(establishments::table)
        .values(&NewEstablishment {
            id: establishment_id,
            issuer_id,
            code: "001".to_string(),
            address: None,
        })
        .execute(conn)?;

    let point_id = Uuid::new_v4();
    diesel::insert_into(emission_points::table)
        .values(&NewEmissionPoint {
            id: point_id,
            establishment_id,
            code: "002".to_string(),
            active: true,
            last_sequence: next_sequence - 1,
            next_sequence,
        })
        .execute(conn)?;

    Ok(Seeded {
        issuer_id,
        point_id,
    })
}

fn issue(conn: &mut PgConnection, seeded: &Seeded) -> Result<AccessKey, IssuanceError> {
    let issued = issue_comprobante(
        conn,
        &IssueRequest {
            issuer_id: seeded.issuer_id,
            emission_point_id: seeded.point_id,
            document_type: "01".to_string(),
            emission_date: emission_date(),
            payload: json!({ "importeTotal": "10.00" }),
        },
    )?;
    Ok(AccessKey::parse(
        issued.comprobante.access_key.as_deref().unwrap_or_default(),
    )?)
}

#[tokio::test]
async fn commit_advances_next_sequence_by_exactly_one() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let seeded = seed_point(conn, "1790011223001", 7)?;
        assert_eq!(commit_sequence(conn, seeded.point_id, 7)?, 8);

        // an older run finishing late never moves the counter back
        assert_eq!(commit_sequence(conn, seeded.point_id, 5)?, 8);

        let point: EmissionPoint = emission_points::table.find(seeded.point_id).first(conn)?;
        assert_eq!(point.last_sequence, 7);
        assert_eq!(point.next_sequence, 8);
        Ok(())
    })
    .await?;

    db.cleanup().await
}

#[tokio::test]
async fn reservation_checks_the_key_series() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let seeded = seed_point(conn, "1790011223001", 7)?;
        let reserved = reserve_sequence(conn, seeded.point_id, &common::access_key(7))?;
        assert_eq!(reserved.sequence, 7);
        assert_eq!(reserved.establishment, "001");
        assert_eq!(reserved.emission_point, "002");

        let point: EmissionPoint = emission_points::table.find(seeded.point_id).first(conn)?;
        assert_eq!(point.reserved_sequence, 7);
        assert_eq!(point.next_sequence, 7);

        diesel::update(emission_points::table.find(seeded.point_id))
            .set(emission_points::code.eq("009"))
            .execute(conn)?;
        assert!(reserve_sequence(conn, seeded.point_id, &common::access_key(7)).is_err());
        Ok(())
    })
    .await?;

    db.cleanup().await
}

#[tokio::test]
async fn point_lock_serialises_concurrent_holders() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;
    let seeded = db
        .with_conn(|conn| seed_point(conn, "1790011223001", 1))
        .await?;

    let hold = Duration::from_millis(150);
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let pool = db.pool.clone();
            let point_id = seeded.point_id;
            thread::spawn(move || -> Result<(Instant, Instant)> {
                let mut conn = pool.get().map_err(|err| anyhow!("{err}"))?;
                conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    lock_emission_point(conn, point_id)?;
                    let acquired = Instant::now();
                    thread::sleep(hold);
                    Ok((acquired, Instant::now()))
                })
                .map_err(Into::into)
            })
        })
        .collect();

    let mut windows = handles
        .into_iter()
        .map(|handle| handle.join().map_err(|_| anyhow!("lock holder panicked"))?)
        .collect::<Result<Vec<_>>>()?;
    windows.sort();
    for pair in windows.windows(2) {
        assert!(
            pair[1].0 >= pair[0].1,
            "lock hold windows overlap: {pair:?}"
        );
    }

    db.cleanup().await
}

#[tokio::test]
async fn issuance_stores_pending_comprobante_and_queues_authorization() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let seeded = seed_point(conn, "1790011223001", 41)?;
        let first = issue(conn, &seeded)?;
        let second = issue(conn, &seeded)?;

        assert_eq!(first.as_str().len(), ACCESS_KEY_LENGTH);
        assert!(first.has_valid_check_digit());
        assert_eq!(first.sequence(), 41);
        assert_eq!(first.establishment(), "001");
        assert_eq!(first.emission_point(), "002");
        // the first run is still in flight, so the second skips past it
        assert_eq!(second.sequence(), 42);

        let states: Vec<String> = comprobante_rows::table
            .select(comprobante_rows::state)
            .load(conn)?;
        assert_eq!(states.len(), 2);
        assert!(states
            .iter()
            .all(|state| state == ComprobanteState::Pending.as_str()));

        let queued: i64 = jobs::table
            .filter(jobs::job_type.eq(JOB_AUTHORIZE_COMPROBANTE))
            .count()
            .get_result(conn)?;
        assert_eq!(queued, 2);

        let point: EmissionPoint = emission_points::table.find(seeded.point_id).first(conn)?;
        assert_eq!(point.next_sequence, 41);
        Ok(())
    })
    .await?;

    db.cleanup().await
}

#[tokio::test]
async fn authorized_sequence_is_not_reissued_when_commit_lags() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let seeded = seed_point(conn, "1790011223001", 7)?;
        let first = issue(conn, &seeded)?;
        assert_eq!(first.sequence(), 7);

        // authorized, but commit_success never ran
        diesel::update(
            comprobante_rows::table.filter(comprobante_rows::access_key.eq(first.as_str())),
        )
        .set(comprobante_rows::state.eq(ComprobanteState::Authorized.as_str()))
        .execute(conn)?;
        let point: EmissionPoint = emission_points::table.find(seeded.point_id).first(conn)?;
        assert_eq!(point.next_sequence, 7);

        let second = issue(conn, &seeded)?;
        assert_eq!(second.sequence(), 8);
        Ok(())
    })
    .await?;

    db.cleanup().await
}

#[tokio::test]
async fn issuance_rejects_foreign_and_inactive_points() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let mine = seed_point(conn, "1790011223001", 1)?;
        let theirs = seed_point(conn, "0990011223001", 1)?;

        let foreign = Seeded {
            issuer_id: mine.issuer_id,
            point_id: theirs.point_id,
        };
        assert!(matches!(
            issue(conn, &foreign),
            Err(IssuanceError::ForeignEmissionPoint(_))
        ));

        diesel::update(emission_points::table.find(mine.point_id))
            .set(emission_points::active.eq(false))
            .execute(conn)?;
        assert!(matches!(
            issue(conn, &mine),
            Err(IssuanceError::InactiveEmissionPoint(_))
        ));

        let queued: i64 = jobs::table.count().get_result(conn)?;
        assert_eq!(queued, 0);
        Ok(())
    })
    .await?;

    db.cleanup().await
}

#[tokio::test]
async fn signed_identity_cannot_change() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    let (seeded, key) = db
        .with_conn(|conn| {
            let seeded = seed_point(conn, "1790011223001", 3)?;
            let key = issue(conn, &seeded)?;
            Ok((seeded, key))
        })
        .await?;

    let store = PgComprobanteStore::new(db.pool.clone());
    let comprobante = store
        .find_by_access_key(key.as_str())
        .await?
        .ok_or_else(|| anyhow!("issued comprobante not found"))?;
    assert_eq!(comprobante.emission_point_id, seeded.point_id);

    let identity = SignedIdentity {
        access_key: key.to_string(),
        establishment: "001".to_string(),
        emission_point: "002".to_string(),
        sequence: i64::from(key.sequence()),
    };
    store.mark_processing(comprobante.id).await?;
    store.mark_signed(comprobante.id, &identity).await?;
    // re-signing with the same identity is a retry
    store.mark_signed(comprobante.id, &identity).await?;

    let moved = SignedIdentity {
        sequence: identity.sequence + 1,
        ..identity.clone()
    };
    assert!(matches!(
        store.mark_signed(comprobante.id, &moved).await,
        Err(StoreError::IdentityLocked(_))
    ));

    let stored = store
        .load(comprobante.id)
        .await?
        .ok_or_else(|| anyhow!("comprobante vanished"))?;
    assert_eq!(stored.lifecycle()?, ComprobanteState::Signed);
    assert_eq!(stored.sequence, Some(identity.sequence));

    db.cleanup().await
}

#[tokio::test]
async fn bulk_export_request_fans_out_chunk_jobs() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let db = TestDb::connect().await?;

    db.with_conn(|conn| {
        let seeded = seed_point(conn, "1790011223001", 1)?;
        let keys: Vec<String> = (1..=450)
            .map(|sequence| common::access_key(sequence).to_string())
            .collect();

        let job = request_bulk_export(conn, seeded.issuer_id, ExportFormat::Pdf, &keys, 200)?;
        assert_eq!(job.total_files, 450);
        assert_eq!(job.total_chunks, 3);
        assert_eq!(job.processed_files, 0);

        let chunk_jobs: i64 = jobs::table
            .filter(jobs::job_type.eq(JOB_EXPORT_CHUNK))
            .count()
            .get_result(conn)?;
        assert_eq!(chunk_jobs, 3);

        assert!(matches!(
            request_bulk_export(conn, Uuid::new_v4(), ExportFormat::Xml, &keys, 200),
            Err(ExportError::OwnerNotFound(_))
        ));
        assert!(matches!(
            request_bulk_export(conn, seeded.issuer_id, ExportFormat::Xml, &[], 200),
            Err(ExportError::NoKeys)
        ));
        assert!(matches!(
            request_bulk_export(
                conn,
                seeded.issuer_id,
                ExportFormat::Xml,
                &["123".to_string()],
                200
            ),
            Err(ExportError::MalformedKey { .. })
        ));

        let repeated = vec![keys[0].clone(), keys[1].clone(), keys[0].clone()];
        let deduplicated =
            request_bulk_export(conn, seeded.issuer_id, ExportFormat::Xml, &repeated, 200)?;
        assert_eq!(deduplicated.total_files, 2);
        assert_eq!(deduplicated.total_chunks, 1);

        assert!(cancel_bulk_export(conn, job.id)?);
        assert!(matches!(
            cancel_bulk_export(conn, Uuid::new_v4()),
            Err(ExportError::NotFound(_))
        ));
        Ok(())
    })
    .await?;

    db.cleanup().await
}
