use std::{env, path::Path};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use comprobantes::{
    callback::{CallbackDispatcher, CallbackOutcome},
    config::AppConfig,
    db::{self, PgPool},
    models::{Comprobante, ExportFormat},
    schema::comprobantes as comprobantes_table,
    storage::ExportStorage,
    workers::export::{
        cancel_bulk_export, clear_archive_path, expired_exports, request_bulk_export,
    },
};
use diesel::prelude::*;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const USAGE: &str = "Usage: maintenance <command>
  migrate
  purge-expired-exports
  resend-callback <comprobante-id>
  request-export <owner-id> <pdf|xml> <keys-file>
  cancel-export <export-id>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("migrate") => migrate().await?,
        Some("purge-expired-exports") => purge_expired_exports().await?,
        Some("resend-callback") => {
            resend_callback(uuid_arg(args.next(), "comprobante id")?).await?
        }
        Some("request-export") => {
            let owner = uuid_arg(args.next(), "owner id")?;
            let format = args
                .next()
                .ok_or_else(|| anyhow!("missing export format\n{USAGE}"))?
                .parse::<ExportFormat>()?;
            let keys_file = args
                .next()
                .ok_or_else(|| anyhow!("missing keys file\n{USAGE}"))?;
            request_export(owner, format, Path::new(&keys_file)).await?
        }
        Some("cancel-export") => cancel_export(uuid_arg(args.next(), "export id")?).await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn uuid_arg(raw: Option<String>, what: &str) -> Result<Uuid> {
    let raw = raw.ok_or_else(|| anyhow!("missing {what}\n{USAGE}"))?;
    Uuid::parse_str(&raw).with_context(|| format!("{what} must be a UUID"))
}

fn connect(config: &AppConfig) -> Result<PgPool> {
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded configuration"
    );
    db::init_pool_with_size(&config.database_url, config.database_max_pool_size)
}

async fn migrate() -> Result<()> {
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = db::init_pool(&database_url)?;
    let applied = tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut conn = db::connection(&pool)?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        Ok(applied.len())
    })
    .await
    .context("migration task panicked")??;

    println!("Applied {applied} migrations.");
    Ok(())
}

async fn purge_expired_exports() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let storage = ExportStorage::new(
        config.export_scratch_dir.clone(),
        config.export_archive_dir.clone(),
    );

    let mut conn = db::connection(&pool)?;
    let expired = expired_exports(&mut conn, Utc::now().naive_utc())?;
    if expired.is_empty() {
        println!("No expired exports found.");
        return Ok(());
    }

    println!("Purging {} expired exports…", expired.len());
    for job in &expired {
        if let Some(path) = &job.archive_path {
            if let Err(err) = storage.remove_archive(Path::new(path)).await {
                eprintln!("Failed to remove archive {path}: {err:#}");
                continue;
            }
        }
        clear_archive_path(&mut conn, job.id)?;
    }

    println!("Expired exports purged.");
    Ok(())
}

async fn resend_callback(id: Uuid) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;

    let mut conn = db::connection(&pool)?;
    let comprobante: Comprobante = comprobantes_table::table
        .find(id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| anyhow!("comprobante {id} not found"))?;
    drop(conn);

    let dispatcher = CallbackDispatcher::new(config.callback_user_agent.clone())?;
    match dispatcher.resend(&comprobante).await {
        CallbackOutcome::Delivered(status) => println!("Callback delivered ({status})."),
        CallbackOutcome::Skipped => println!("Comprobante has no callback target."),
        CallbackOutcome::UnexpectedStatus(status) => {
            println!("Callback answered with status {status}.")
        }
        CallbackOutcome::Unreachable => println!("Callback target unreachable."),
    }
    Ok(())
}

/// Keys are read one per line; blank lines are ignored.
async fn request_export(owner_id: Uuid, format: ExportFormat, keys_file: &Path) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let contents = tokio::fs::read_to_string(keys_file)
        .await
        .with_context(|| format!("failed to read {}", keys_file.display()))?;
    let keys: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let mut conn = db::connection(&pool)?;
    let job = request_bulk_export(&mut conn, owner_id, format, &keys, config.export_chunk_size)?;
    println!(
        "Export {} queued: {} files in {} chunks.",
        job.id, job.total_files, job.total_chunks
    );
    Ok(())
}

async fn cancel_export(id: Uuid) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = connect(&config)?;
    let mut conn = db::connection(&pool)?;
    if cancel_bulk_export(&mut conn, id)? {
        println!("Export {id} cancelled.");
    } else {
        println!("Export {id} had already finished.");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
