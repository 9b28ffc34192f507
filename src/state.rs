use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::{
    callback::CallbackDispatcher,
    config::AppConfig,
    db::{self, PgPool, PgPooledConnection},
    jobs::RetryPolicy,
    sequence::PgSequenceAllocator,
    services::{HttpDocumentBuilder, HttpOwnerNotifier, JarSigner, OwnerNotifier, ServiceRenderer},
    sri::{AuthorityService, SoapClientPool, SriClient},
    storage::ExportStorage,
    store::{PgComprobanteStore, PgExportJobStore},
    workers::{
        authorize::{AuthorizationPipeline, PipelineServices, PipelineSettings},
        export::BulkExportOrchestrator,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub sri_pool: Arc<SoapClientPool>,
    pub callbacks: Arc<CallbackDispatcher>,
    pub pipeline: Arc<AuthorizationPipeline>,
    pub exports: Arc<BulkExportOrchestrator>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        sri_pool: Arc<SoapClientPool>,
        callbacks: Arc<CallbackDispatcher>,
        pipeline: Arc<AuthorizationPipeline>,
        exports: Arc<BulkExportOrchestrator>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            sri_pool,
            callbacks,
            pipeline,
            exports,
        }
    }

    /// Wires the Postgres stores and the HTTP / command-line collaborators
    /// named in `config`.
    pub fn from_config(pool: PgPool, config: AppConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.sri_connect_timeout)
            .timeout(config.sri_request_timeout)
            .build()
            .context("failed to build service client")?;

        let sri_pool = Arc::new(SoapClientPool::new(config.sri_client_settings()));
        let authority: Arc<dyn AuthorityService> = Arc::new(SriClient::new(
            sri_pool.clone(),
            config.sri_endpoints.clone(),
            config.sri_poll_settings(),
        ));
        let callbacks = Arc::new(CallbackDispatcher::new(config.callback_user_agent.clone())?);
        let comprobantes = Arc::new(PgComprobanteStore::new(pool.clone()));
        let notifier = config.owner_notifier_url.as_ref().map(|url| {
            Arc::new(HttpOwnerNotifier::new(http.clone(), url.clone())) as Arc<dyn OwnerNotifier>
        });

        let pipeline = AuthorizationPipeline::new(
            PipelineServices {
                comprobantes: comprobantes.clone(),
                sequences: Arc::new(PgSequenceAllocator::new(pool.clone())),
                builder: Arc::new(HttpDocumentBuilder::new(
                    http.clone(),
                    config.document_builder_url.clone(),
                )),
                signer: Arc::new(JarSigner::new(
                    config.signer_java_bin.clone(),
                    config.signer_jar_path.clone(),
                )),
                authority: authority.clone(),
                callbacks: callbacks.clone(),
                notifier,
            },
            PipelineSettings {
                retry: RetryPolicy::default(),
                scratch_root: config.scratch_dir.clone(),
                signature_dir: config.signature_storage_dir.clone(),
            },
        );

        let exports = BulkExportOrchestrator::new(
            Arc::new(PgExportJobStore::new(pool.clone())),
            comprobantes,
            Arc::new(ServiceRenderer::new(http, config.renderer_url.clone(), authority)),
            ExportStorage::new(
                config.export_scratch_dir.clone(),
                config.export_archive_dir.clone(),
            ),
            config.export_archive_ttl,
        );

        Ok(Self::new(
            pool,
            config,
            sri_pool,
            callbacks,
            Arc::new(pipeline),
            Arc::new(exports),
        ))
    }

    pub fn db(&self) -> Result<PgPooledConnection> {
        db::connection(&self.pool)
    }
}
