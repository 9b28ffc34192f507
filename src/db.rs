//! Postgres pool shared by the worker, the stores and the maintenance commands.

use std::time::Duration;

use anyhow::Context;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 2;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    init_pool_with_size(database_url, DEFAULT_MAX_POOL_SIZE)
}

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(CONNECTION_TIMEOUT)
        .test_on_check_out(true)
        .build(manager)
        .context("failed to build database pool")
}

pub fn connection(pool: &PgPool) -> anyhow::Result<PgPooledConnection> {
    pool.get().context("failed to get database connection")
}
