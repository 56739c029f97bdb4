//! Database layer for the Chengis CI/CD engine.
//!
//! Provides repositories over PostgreSQL, cursor pagination, the audit
//! hash chain and the retention sweeper. All externally observable state
//! lives here; in-memory structures elsewhere are caches rebuilt from
//! these tables.

pub mod cursor;
pub mod error;
pub mod repo;
pub mod retention;

pub use cursor::{Cursor, Page, page_from_rows};
pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Primary/replica routing. Writes always go to the primary; reads go to
/// the replica when one is configured. Callers pick the side explicitly.
#[derive(Clone)]
pub struct RoutedDatasource {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl RoutedDatasource {
    pub fn new(primary: PgPool, replica: Option<PgPool>) -> Self {
        Self { primary, replica }
    }

    pub fn primary_only(primary: PgPool) -> Self {
        Self {
            primary,
            replica: None,
        }
    }

    pub fn write(&self) -> &PgPool {
        &self.primary
    }

    pub fn read(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }
}
