//! Durable [`JobStore`] backends.
//!
//! [`connect`] picks the backend named in [`PersistenceConfig`]. Backends
//! whose feature is disabled fail at startup instead of silently falling
//! back to memory.

use std::sync::Arc;

use crate::config::{PersistenceConfig, StoreBackend};
use crate::store::{JobStore, MemoryJobStore};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;

/// Opens the configured job store.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreBackend::Sqlite => open_sqlite(config),
        StoreBackend::Postgres => open_postgres(config).await,
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &PersistenceConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    if config.connection_string.is_empty() {
        anyhow::bail!("sqlite backend needs a database path in `connection_string`");
    }
    Ok(Arc::new(SqliteJobStore::open(&config.connection_string)?))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &PersistenceConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    anyhow::bail!("sqlite backend requested but the `sqlite` feature is disabled")
}

#[cfg(feature = "postgres")]
async fn open_postgres(config: &PersistenceConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    Ok(Arc::new(PostgresJobStore::connect(config).await?))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_config: &PersistenceConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    anyhow::bail!("postgres backend requested but the `postgres` feature is disabled")
}
