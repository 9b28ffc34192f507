#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use comprobantes::access_key::{AccessKey, AccessKeyParts, Environment};
use comprobantes::callback::CallbackDispatcher;
use comprobantes::db::{self, PgPool};
use comprobantes::jobs::RetryPolicy;
use comprobantes::models::{
    BulkExportJob, Comprobante, ComprobanteState, ExportFormat, ExportStatus, Issuer,
};
use comprobantes::sequence::{AllocationError, ReservedSequence, SequenceAllocator};
use comprobantes::services::{
    ConstructionError, DocumentBuilder, OwnerNotification, OwnerNotifier, PreparedFields,
    RenderedFile, Renderer, Signer, SignerCredentials, SigningError,
};
use comprobantes::sri::{AuthorityError, AuthorityService, AuthorizationRecord};
use comprobantes::storage::ExportStorage;
use comprobantes::store::{
    ComprobanteStore, ExportJobStore, SignedIdentity, StoreError, StoreResult,
};
use comprobantes::workers::authorize::{
    AuthorizationPipeline, AuthorizeRequest, PipelineServices, PipelineSettings,
};
use comprobantes::workers::export::BulkExportOrchestrator;
use diesel::connection::SimpleConnection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const RUC: &str = "1790011223001";
pub const ESTABLISHMENT: &str = "001";
pub const EMISSION_POINT: &str = "002";
pub const CERTIFICATE_FILE: &str = "issuer.p12";

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn emission_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 14).unwrap()
}

pub fn access_key(sequence: u32) -> AccessKey {
    AccessKey::generate(&AccessKeyParts {
        emission_date: emission_date(),
        document_type: "01",
        ruc: RUC,
        environment: Environment::Test,
        establishment: ESTABLISHMENT,
        emission_point: EMISSION_POINT,
        sequence,
        numeric_code: Some(12_345_678),
    })
    .unwrap()
}

pub fn issuer() -> Issuer {
    Issuer {
        id: Uuid::new_v4(),
        ruc: RUC.to_string(),
        business_name: "Comercial Andina S.A.".to_string(),
        environment: "1".to_string(),
        signature_path: Some(CERTIFICATE_FILE.to_string()),
        signature_password: Some("firma-secreta".to_string()),
        email_documents: true,
        created_at: now(),
        updated_at: now(),
    }
}

pub fn comprobante(issuer: &Issuer, key: &AccessKey, payload: Value) -> Comprobante {
    Comprobante {
        id: Uuid::new_v4(),
        issuer_id: issuer.id,
        emission_point_id: Uuid::new_v4(),
        document_type: "01".to_string(),
        environment: "1".to_string(),
        access_key: Some(key.to_string()),
        establishment: Some(ESTABLISHMENT.to_string()),
        emission_point: Some(EMISSION_POINT.to_string()),
        sequence: Some(i64::from(key.sequence())),
        emission_date: emission_date(),
        state: ComprobanteState::Pending.as_str().to_string(),
        processed_at: None,
        authorized_at: None,
        authorization_number: None,
        error_message: None,
        payload,
        created_at: now(),
        updated_at: now(),
    }
}

pub fn authorized_record(key: &AccessKey) -> AuthorizationRecord {
    AuthorizationRecord {
        authorization_number: Some(key.to_string()),
        authorized_at: Some("2024-05-14T10:15:30-05:00".to_string()),
        environment: Some("PRUEBAS".to_string()),
        document: Some("<factura/>".to_string()),
    }
}

pub fn entries_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[derive(Default)]
pub struct MemoryComprobantes {
    comprobantes: std::sync::Mutex<HashMap<Uuid, Comprobante>>,
    issuers: std::sync::Mutex<HashMap<Uuid, Issuer>>,
    transitions: std::sync::Mutex<Vec<(Uuid, ComprobanteState)>>,
}

impl MemoryComprobantes {
    pub fn insert_issuer(&self, issuer: Issuer) {
        self.issuers.lock().unwrap().insert(issuer.id, issuer);
    }

    pub fn insert(&self, comprobante: Comprobante) {
        self.comprobantes
            .lock()
            .unwrap()
            .insert(comprobante.id, comprobante);
    }

    pub fn get(&self, id: Uuid) -> Comprobante {
        self.comprobantes.lock().unwrap()[&id].clone()
    }

    pub fn state_of(&self, id: Uuid) -> ComprobanteState {
        self.get(id).lifecycle().unwrap()
    }

    pub fn transitions(&self, id: Uuid) -> Vec<ComprobanteState> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(row, _)| *row == id)
            .map(|(_, state)| *state)
            .collect()
    }

    fn update<F>(&self, id: Uuid, state: ComprobanteState, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Comprobante),
    {
        let mut guard = self.comprobantes.lock().unwrap();
        let row = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.state = state.as_str().to_string();
        row.updated_at = now();
        f(row);
        self.transitions.lock().unwrap().push((id, state));
        Ok(())
    }
}

#[async_trait]
impl ComprobanteStore for MemoryComprobantes {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Comprobante>> {
        Ok(self.comprobantes.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_access_key(&self, access_key: &str) -> StoreResult<Option<Comprobante>> {
        Ok(self
            .comprobantes
            .lock()
            .unwrap()
            .values()
            .find(|c| c.access_key.as_deref() == Some(access_key))
            .cloned())
    }

    async fn load_issuer(&self, id: Uuid) -> StoreResult<Option<Issuer>> {
        Ok(self.issuers.lock().unwrap().get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> StoreResult<()> {
        self.update(id, ComprobanteState::Processing, |row| {
            row.processed_at = Some(now())
        })
    }

    async fn mark_signed(&self, id: Uuid, identity: &SignedIdentity) -> StoreResult<()> {
        {
            let guard = self.comprobantes.lock().unwrap();
            let row = guard.get(&id).ok_or(StoreError::NotFound(id))?;
            let locked = row.lifecycle().map(|s| s.locks_identity()).unwrap_or(false);
            if locked && !identity.matches(row) {
                return Err(StoreError::IdentityLocked(id));
            }
        }
        let identity = identity.clone();
        self.update(id, ComprobanteState::Signed, move |row| {
            row.access_key = Some(identity.access_key);
            row.establishment = Some(identity.establishment);
            row.emission_point = Some(identity.emission_point);
            row.sequence = Some(identity.sequence);
            row.error_message = None;
        })
    }

    async fn mark_authorized(&self, id: Uuid, record: &AuthorizationRecord) -> StoreResult<()> {
        let number = record.authorization_number.clone();
        let at = record.authorized_at_utc().unwrap_or_else(now);
        self.update(id, ComprobanteState::Authorized, move |row| {
            row.authorization_number = number;
            row.authorized_at = Some(at);
            row.error_message = None;
        })
    }

    async fn mark_needs_correction(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let message = message.to_string();
        self.update(id, ComprobanteState::NeedsCorrection, move |row| {
            row.error_message = Some(message)
        })
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let message = message.to_string();
        self.update(id, ComprobanteState::Failed, move |row| {
            row.error_message = Some(message)
        })
    }
}

#[derive(Default)]
pub struct RecordingAllocator {
    reservations: std::sync::Mutex<Vec<(Uuid, u32)>>,
    commits: std::sync::Mutex<Vec<(Uuid, u32)>>,
    commits_fail: AtomicBool,
}

impl RecordingAllocator {
    /// Every later `commit_success` fails without recording anything.
    pub fn fail_commits(&self) {
        self.commits_fail.store(true, Ordering::SeqCst);
    }

    pub fn reservations(&self) -> Vec<(Uuid, u32)> {
        self.reservations.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<(Uuid, u32)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl SequenceAllocator for RecordingAllocator {
    async fn reserve(
        &self,
        emission_point_id: Uuid,
        access_key: &AccessKey,
    ) -> Result<ReservedSequence, AllocationError> {
        self.reservations
            .lock()
            .unwrap()
            .push((emission_point_id, access_key.sequence()));
        Ok(ReservedSequence {
            emission_point_id,
            establishment: access_key.establishment().to_string(),
            emission_point: access_key.emission_point().to_string(),
            sequence: access_key.sequence(),
        })
    }

    async fn commit_success(
        &self,
        emission_point_id: Uuid,
        sequence: u32,
    ) -> Result<i64, AllocationError> {
        if self.commits_fail.load(Ordering::SeqCst) {
            return Err(AllocationError::Pool("connection refused".to_string()));
        }
        self.commits
            .lock()
            .unwrap()
            .push((emission_point_id, sequence));
        Ok(i64::from(sequence) + 1)
    }
}

/// Produces a minimal document carrying the fields it was given.
#[derive(Default)]
pub struct EchoBuilder {
    pub built: std::sync::Mutex<Vec<PreparedFields>>,
    rejection: std::sync::Mutex<Option<(u16, String)>>,
}

impl EchoBuilder {
    /// Answers every later build with this status and body.
    pub fn reject_with(&self, status: u16, body: &str) {
        *self.rejection.lock().unwrap() = Some((status, body.to_string()));
    }
}

#[async_trait]
impl DocumentBuilder for EchoBuilder {
    async fn build(
        &self,
        fields: &PreparedFields,
        access_key: &AccessKey,
    ) -> Result<Vec<u8>, ConstructionError> {
        if let Some((status, body)) = self.rejection.lock().unwrap().clone() {
            return Err(ConstructionError::Rejected { status, body });
        }
        self.built.lock().unwrap().push(fields.clone());
        Ok(format!(
            "<factura><infoTributaria><ambiente>{}</ambiente><claveAcceso>{}</claveAcceso><secuencial>{}</secuencial></infoTributaria></factura>",
            fields.environment, access_key, fields.sequence
        )
        .into_bytes())
    }
}

/// Copies the document into the workdir and marks it as signed.
#[derive(Default)]
pub struct FakeSigner {
    calls: AtomicUsize,
    failure: std::sync::Mutex<Option<String>>,
}

impl FakeSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Later calls exit non-zero with `stderr` and leave no signed file.
    pub fn fail_with(&self, stderr: &str) {
        *self.failure.lock().unwrap() = Some(stderr.to_string());
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(
        &self,
        document: &Path,
        _credentials: &SignerCredentials,
        workdir: &Path,
    ) -> Result<Vec<u8>, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stderr) = self.failure.lock().unwrap().clone() {
            return Err(SigningError::ToolFailed {
                status: "exit status: 1".to_string(),
                stderr,
            });
        }
        let mut bytes = tokio::fs::read(document).await?;
        bytes.extend_from_slice(b"<!-- signed -->");
        tokio::fs::write(workdir.join("signed.xml"), &bytes).await?;
        Ok(bytes)
    }
}

/// Answers `submit_and_authorize` from a script, one entry per call.
#[derive(Default)]
pub struct ScriptedAuthority {
    script: std::sync::Mutex<VecDeque<Result<AuthorizationRecord, AuthorityError>>>,
    submissions: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl ScriptedAuthority {
    pub fn new(script: Vec<Result<AuthorizationRecord, AuthorityError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into()),
            submissions: Default::default(),
        }
    }

    pub fn submissions(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl AuthorityService for ScriptedAuthority {
    async fn submit_and_authorize(
        &self,
        document: &[u8],
        _access_key: &AccessKey,
    ) -> Result<AuthorizationRecord, AuthorityError> {
        self.submissions.lock().unwrap().push(document.to_vec());
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(AuthorityError::ServiceUnavailable(
                "script exhausted".to_string(),
            ))
        })
    }

    async fn fetch_authorized_document(
        &self,
        access_key: &AccessKey,
        _environment: Environment,
    ) -> Result<String, AuthorityError> {
        Ok(format!("<autorizacion><numeroAutorizacion>{access_key}</numeroAutorizacion></autorizacion>"))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<OwnerNotification>>,
}

#[async_trait]
impl OwnerNotifier for RecordingNotifier {
    async fn notify(&self, notification: &OwnerNotification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct PipelineHarness {
    pub store: Arc<MemoryComprobantes>,
    pub sequences: Arc<RecordingAllocator>,
    pub builder: Arc<EchoBuilder>,
    pub signer: Arc<FakeSigner>,
    pub authority: Arc<ScriptedAuthority>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: AuthorizationPipeline,
    pub scratch: TempDir,
    pub signatures: TempDir,
}

impl PipelineHarness {
    pub fn new(script: Vec<Result<AuthorizationRecord, AuthorityError>>) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let signatures = tempfile::tempdir()?;
        std::fs::write(signatures.path().join(CERTIFICATE_FILE), b"pkcs12")?;

        let store = Arc::new(MemoryComprobantes::default());
        let sequences = Arc::new(RecordingAllocator::default());
        let builder = Arc::new(EchoBuilder::default());
        let signer = Arc::new(FakeSigner::default());
        let authority = Arc::new(ScriptedAuthority::new(script));
        let notifier = Arc::new(RecordingNotifier::default());

        let pipeline = AuthorizationPipeline::new(
            PipelineServices {
                comprobantes: store.clone(),
                sequences: sequences.clone(),
                builder: builder.clone(),
                signer: signer.clone(),
                authority: authority.clone(),
                callbacks: Arc::new(CallbackDispatcher::new("comprobantes-tests")?),
                notifier: Some(notifier.clone()),
            },
            PipelineSettings {
                retry: RetryPolicy::default(),
                scratch_root: scratch.path().to_path_buf(),
                signature_dir: signatures.path().to_path_buf(),
            },
        );

        Ok(Self {
            store,
            sequences,
            builder,
            signer,
            authority,
            notifier,
            pipeline,
            scratch,
            signatures,
        })
    }

    /// Stores an issuer and a PENDING comprobante, returning the job payload
    /// that would drive it.
    pub fn seed(&self, issuer: Issuer, key: &AccessKey, payload: Value) -> AuthorizeRequest {
        let comprobante = comprobante(&issuer, key, payload);
        let request = AuthorizeRequest {
            comprobante_id: comprobante.id,
            emission_point_id: comprobante.emission_point_id,
            access_key: key.to_string(),
        };
        self.store.insert_issuer(issuer);
        self.store.insert(comprobante);
        request
    }

    pub fn scratch_entries(&self) -> usize {
        entries_in(self.scratch.path())
    }
}

#[derive(Default)]
pub struct MemoryExports {
    jobs: std::sync::Mutex<HashMap<Uuid, BulkExportJob>>,
    failing: std::sync::Mutex<HashSet<&'static str>>,
}

impl MemoryExports {
    pub fn create(
        &self,
        owner_id: Uuid,
        format: ExportFormat,
        total_files: usize,
        total_chunks: usize,
    ) -> Uuid {
        let job = BulkExportJob {
            id: Uuid::new_v4(),
            owner_id,
            format: format.as_str().to_string(),
            total_files: total_files as i32,
            processed_files: 0,
            total_chunks: total_chunks as i32,
            completed_chunks: 0,
            status: ExportStatus::Pending.as_str().to_string(),
            cancelled: false,
            archive_path: None,
            error_message: None,
            expires_at: None,
            created_at: now(),
            updated_at: now(),
        };
        let id = job.id;
        self.jobs.lock().unwrap().insert(id, job);
        id
    }

    pub fn get(&self, id: Uuid) -> BulkExportJob {
        self.jobs.lock().unwrap()[&id].clone()
    }

    pub fn cancel(&self, id: Uuid) {
        self.modify(id, |job| job.cancelled = true).unwrap();
    }

    /// The next call to `operation` fails as if the database dropped the
    /// connection; later calls succeed again.
    pub fn fail_once(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    fn injected(&self, operation: &'static str) -> StoreResult<()> {
        if self.failing.lock().unwrap().remove(operation) {
            return Err(StoreError::Pool(format!("{operation}: connection reset")));
        }
        Ok(())
    }

    fn modify<F, T>(&self, id: Uuid, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut BulkExportJob) -> T,
    {
        let mut guard = self.jobs.lock().unwrap();
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.updated_at = now();
        Ok(f(job))
    }
}

#[async_trait]
impl ExportJobStore for MemoryExports {
    async fn load(&self, id: Uuid) -> StoreResult<Option<BulkExportJob>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> StoreResult<()> {
        self.modify(id, |job| {
            if job.status == ExportStatus::Pending.as_str() {
                job.status = ExportStatus::Processing.as_str().to_string();
            }
        })
    }

    async fn increment_processed(&self, id: Uuid) -> StoreResult<i32> {
        self.injected("increment_processed")?;
        self.modify(id, |job| {
            job.processed_files += 1;
            job.processed_files
        })
    }

    async fn is_cancelled(&self, id: Uuid) -> StoreResult<bool> {
        self.injected("is_cancelled")?;
        self.modify(id, |job| job.cancelled)
    }

    async fn complete_chunk(&self, id: Uuid) -> StoreResult<BulkExportJob> {
        self.modify(id, |job| {
            job.completed_chunks += 1;
            job.clone()
        })
    }

    async fn mark_compressing(&self, id: Uuid) -> StoreResult<()> {
        self.injected("mark_compressing")?;
        self.modify(id, |job| {
            job.status = ExportStatus::Compressing.as_str().to_string()
        })
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        archive_path: &str,
        expires_at: NaiveDateTime,
    ) -> StoreResult<()> {
        self.injected("mark_completed")?;
        let archive_path = archive_path.to_string();
        self.modify(id, move |job| {
            job.status = ExportStatus::Completed.as_str().to_string();
            job.archive_path = Some(archive_path);
            job.expires_at = Some(expires_at);
        })
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let message = message.to_string();
        self.modify(id, move |job| {
            job.status = ExportStatus::Failed.as_str().to_string();
            job.error_message = Some(message);
        })
    }
}

/// Renders `<access key>.<format>`; keys listed in `broken` fail.
#[derive(Default)]
pub struct FakeRenderer {
    pub broken: HashSet<String>,
    /// Cancels the given export after this many renders.
    pub cancel_after: Option<(Arc<MemoryExports>, Uuid, usize)>,
    rendered: AtomicUsize,
}

impl FakeRenderer {
    pub fn with_broken<I>(keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        Self {
            broken: keys.into_iter().map(|key| key.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn cancelling(exports: Arc<MemoryExports>, job_id: Uuid, after: usize) -> Self {
        Self {
            cancel_after: Some((exports, job_id, after)),
            ..Self::default()
        }
    }

    pub fn rendered(&self) -> usize {
        self.rendered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, comprobante: &Comprobante, format: ExportFormat) -> Result<RenderedFile> {
        let key = comprobante
            .access_key
            .clone()
            .ok_or_else(|| anyhow!("missing access key"))?;
        if self.broken.contains(&key) {
            bail!("renderer rejected {key}");
        }
        let count = self.rendered.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((exports, job_id, after)) = &self.cancel_after {
            if count == *after {
                exports.cancel(*job_id);
            }
        }
        Ok(RenderedFile {
            file_name: format!("{key}.{format}"),
            bytes: format!("{format} body for {key}").into_bytes(),
        })
    }
}

pub struct ExportHarness {
    pub exports: Arc<MemoryExports>,
    pub comprobantes: Arc<MemoryComprobantes>,
    pub renderer: Arc<FakeRenderer>,
    pub orchestrator: BulkExportOrchestrator,
    pub root: TempDir,
}

impl ExportHarness {
    pub fn new(renderer: FakeRenderer) -> Result<Self> {
        Self::with_stores(
            Arc::new(MemoryExports::default()),
            Arc::new(MemoryComprobantes::default()),
            renderer,
        )
    }

    pub fn with_stores(
        exports: Arc<MemoryExports>,
        comprobantes: Arc<MemoryComprobantes>,
        renderer: FakeRenderer,
    ) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let renderer = Arc::new(renderer);
        let orchestrator = BulkExportOrchestrator::new(
            exports.clone(),
            comprobantes.clone(),
            renderer.clone(),
            ExportStorage::new(root.path().join("scratch"), root.path().join("archives")),
            Duration::from_secs(24 * 3600),
        );
        Ok(Self {
            exports,
            comprobantes,
            renderer,
            orchestrator,
            root,
        })
    }

    /// Stores `count` authorized comprobantes for `issuer` and returns their keys.
    pub fn seed_authorized(&self, issuer: &Issuer, count: u32) -> Vec<String> {
        self.comprobantes.insert_issuer(issuer.clone());
        (1..=count)
            .map(|sequence| {
                let key = access_key(sequence);
                let mut row = comprobante(issuer, &key, json!({}));
                row.state = ComprobanteState::Authorized.as_str().to_string();
                self.comprobantes.insert(row);
                key.to_string()
            })
            .collect()
    }
}

/// Postgres-backed harness; needs `TEST_DATABASE_URL`.
pub struct TestDb {
    pub pool: PgPool,
}

impl TestDb {
    pub async fn connect() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;
        let pool = db::init_pool_with_size(&database_url, 8)?;
        prepare_database(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut *conn)
        })
        .await
        .context("connection task panicked")?
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE jobs, bulk_export_jobs, comprobantes, emission_points, establishments, issuers RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
