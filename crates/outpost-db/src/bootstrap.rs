//! Database bootstrap.
//!
//! The migration set is embedded in the binary at compile time, so one
//! [`connect`] call takes a deployment from nothing to a fully migrated
//! schema: optionally create the target database (first boot), open the
//! pool, apply pending migrations.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

/// Everything under `migrations/`, compiled into the binary.
pub static MIGRATOR: Migrator = sqlx::migrate!();

/// How to reach the dispatch database.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Full PostgreSQL connection URL.
    pub url: String,
    pub max_connections: u32,
    /// On first boot, create the target database when it does not exist.
    pub create_if_missing: bool,
}

impl DbOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            create_if_missing: false,
        }
    }
}

/// Open a migrated pool against the configured database.
pub async fn connect(options: &DbOptions) -> Result<PgPool> {
    let target: PgConnectOptions = options
        .url
        .parse()
        .with_context(|| format!("invalid database URL {}", options.url))?;

    if options.create_if_missing {
        create_database_if_missing(&target).await?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(target)
        .await
        .context("failed to open database pool")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply migrations")?;

    Ok(pool)
}

/// Create the database named by `target`, if absent, by way of the
/// `postgres` maintenance database on the same server.
async fn create_database_if_missing(target: &PgConnectOptions) -> Result<()> {
    let Some(name) = target.get_database().map(str::to_owned) else {
        // No database in the URL: the server-side default applies and
        // already exists.
        return Ok(());
    };

    // CREATE DATABASE takes an identifier, not a bind parameter, so the
    // name is restricted rather than quoted.
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("refusing to create database named {name:?}");
    }

    let admin_options = target.clone().database("postgres");
    let mut admin = PgConnection::connect_with(&admin_options)
        .await
        .context("failed to reach the maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&name)
            .fetch_one(&mut admin)
            .await
            .context("failed to check for the target database")?;

    if !exists {
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("failed to create database {name}"))?;
        info!(db = %name, "database created");
    }

    let _ = admin.close().await;
    Ok(())
}
