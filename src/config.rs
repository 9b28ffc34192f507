use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use url::Url;

use crate::{
    callback::DEFAULT_USER_AGENT,
    db::DEFAULT_MAX_POOL_SIZE,
    sri::{ClientSettings, PollSettings, SriEndpoints},
};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub sri_endpoints: SriEndpoints,
    pub sri_connect_timeout: Duration,
    pub sri_request_timeout: Duration,
    pub sri_poll_attempts: u32,
    pub sri_poll_delay: Duration,
    pub signer_java_bin: String,
    pub signer_jar_path: PathBuf,
    pub signature_storage_dir: PathBuf,
    pub document_builder_url: String,
    pub renderer_url: String,
    pub owner_notifier_url: Option<String>,
    pub scratch_dir: PathBuf,
    pub export_scratch_dir: PathBuf,
    pub export_archive_dir: PathBuf,
    pub export_chunk_size: usize,
    pub export_archive_ttl: Duration,
    pub callback_user_agent: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let worker_concurrency: usize = parse_var("WORKER_CONCURRENCY", 1)?;
        let worker_poll_interval =
            Duration::from_millis(parse_var("WORKER_POLL_INTERVAL_MS", 2000)?);

        let official = SriEndpoints::official();
        let sri_endpoints = SriEndpoints {
            reception_test: url_var("SRI_RECEPTION_TEST_URL", official.reception_test)?,
            reception_production: url_var(
                "SRI_RECEPTION_PRODUCTION_URL",
                official.reception_production,
            )?,
            authorization_test: url_var("SRI_AUTHORIZATION_TEST_URL", official.authorization_test)?,
            authorization_production: url_var(
                "SRI_AUTHORIZATION_PRODUCTION_URL",
                official.authorization_production,
            )?,
        };
        let sri_connect_timeout = Duration::from_secs(parse_var("SRI_CONNECT_TIMEOUT_SECS", 3)?);
        let sri_request_timeout = Duration::from_secs(parse_var("SRI_REQUEST_TIMEOUT_SECS", 30)?);
        let sri_poll_attempts = parse_var("SRI_POLL_ATTEMPTS", 3)?;
        let sri_poll_delay = Duration::from_millis(parse_var("SRI_POLL_DELAY_MS", 500)?);

        let signer_java_bin = env::var("SIGNER_JAVA_BIN").unwrap_or_else(|_| "java".to_string());
        let signer_jar_path = env::var("SIGNER_JAR_PATH")
            .map(PathBuf::from)
            .context("SIGNER_JAR_PATH must be set")?;
        let signature_storage_dir = env::var("SIGNATURE_STORAGE_DIR")
            .map(PathBuf::from)
            .context("SIGNATURE_STORAGE_DIR must be set")?;
        let document_builder_url =
            env::var("DOCUMENT_BUILDER_URL").context("DOCUMENT_BUILDER_URL must be set")?;
        let renderer_url = env::var("RENDERER_URL").context("RENDERER_URL must be set")?;
        let owner_notifier_url = env::var("OWNER_NOTIFIER_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let scratch_dir = env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("comprobantes"));
        let export_scratch_dir = env::var("EXPORT_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| scratch_dir.join("bulk-downloads"));
        let export_archive_dir = env::var("EXPORT_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("storage/bulk-downloads"));
        let export_chunk_size: usize =
            parse_var("EXPORT_CHUNK_SIZE", crate::workers::export::DEFAULT_CHUNK_SIZE)?;
        let export_archive_ttl =
            Duration::from_secs(parse_var::<u64>("EXPORT_ARCHIVE_TTL_HOURS", 24)? * 3600);
        let callback_user_agent =
            env::var("CALLBACK_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        Ok(Self {
            database_url,
            database_max_pool_size,
            worker_concurrency: worker_concurrency.max(1),
            worker_poll_interval,
            sri_endpoints,
            sri_connect_timeout,
            sri_request_timeout,
            sri_poll_attempts,
            sri_poll_delay,
            signer_java_bin,
            signer_jar_path,
            signature_storage_dir,
            document_builder_url,
            renderer_url,
            owner_notifier_url,
            scratch_dir,
            export_scratch_dir,
            export_archive_dir,
            export_chunk_size: export_chunk_size.max(1),
            export_archive_ttl,
            callback_user_agent,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn sri_client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: self.sri_connect_timeout,
            request_timeout: self.sri_request_timeout,
            ..ClientSettings::default()
        }
    }

    pub fn sri_poll_settings(&self) -> PollSettings {
        PollSettings {
            attempts: self.sri_poll_attempts,
            delay: self.sri_poll_delay,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn url_var(name: &str, default: String) -> Result<String> {
    match env::var(name) {
        Ok(raw) => {
            Url::parse(raw.trim()).with_context(|| format!("{name} must be a valid URL"))?;
            Ok(raw.trim().to_string())
        }
        Err(_) => Ok(default),
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
