use std::ops::Deref;

use anyhow::{bail, Context};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Pool, Postgres};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::DatabaseConfig;

pub mod methods;
pub mod types;

// Migration files are compiled into the binary.
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Deref for Database {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config.database.expose();

        if config.migrate && !Postgres::database_exists(url).await? {
            warn!(database = %config.database, "database missing, creating it");
            Postgres::create_database(url).await?;
        }

        // Job and round status transitions rely on serializable writes, so
        // every pooled connection gets that default up front.
        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'SERIALIZABLE'")
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await
            .context("connecting to the pattern store")?;

        info!(database = %config.database, "connected to pattern store");

        if config.migrate {
            MIGRATOR
                .run(&pool)
                .await
                .context("applying schema migrations")?;
        }

        validate_schema(&pool).await?;

        Ok(Self { pool })
    }
}

/// Refuse to serve against a schema this binary does not understand.
async fn validate_schema(pool: &Pool<Postgres>) -> anyhow::Result<()> {
    let bundled = MIGRATOR
        .migrations
        .last()
        .map(|migration| migration.version)
        .context("no migrations are bundled with this binary")?;

    let mut conn = pool.acquire().await?;

    if conn.dirty_version().await?.is_some() {
        bail!("a schema migration was interrupted halfway, refusing to start");
    }

    let applied = conn
        .list_applied_migrations()
        .await?
        .last()
        .map(|migration| migration.version)
        .unwrap_or(0);

    if applied < bundled {
        bail!(
            "schema version {applied} is behind this binary's {bundled}; \
             enable database.migrate or migrate by hand"
        );
    }
    if applied > bundled {
        bail!(
            "schema version {applied} is newer than this binary's {bundled}; \
             deploy a newer release"
        );
    }

    info!(version = applied, "schema is current");
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    InternalError(#[from] sqlx::Error),
}
