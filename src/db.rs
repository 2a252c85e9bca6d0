use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PoolError, PooledConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::borrow::Cow;

pub type Connection = PooledConnection<ConnectionManager<PgConnection>>;
pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;
pub type ConnectionResult = Result<Connection, PoolError>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Builds a connection pool sized to the tokio worker count.
pub fn create_connection_pool() -> ConnectionPool {
    let num_threads = tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_workers())
        .unwrap_or(1);
    let manager = ConnectionManager::new(create_url(None));
    Pool::builder()
        .max_size(num_threads as u32)
        .max_lifetime(None)
        .idle_timeout(None)
        .test_on_check_out(true)
        .build(manager)
        .expect("Could not build connection pool")
}

/// Runs embedded migrations on the database. Used to update the database for
/// end-users who don't build the server themselves. Doesn't perform any error
/// handling, as this is meant to be run once on application start.
pub fn run_migrations(conn: &mut PgConnection) {
    let pending_migrations = conn.pending_migrations(MIGRATIONS).unwrap();
    if pending_migrations.is_empty() {
        return;
    }

    tracing::info!("Running {} pending migrations...", pending_migrations.len());
    conn.run_pending_migrations(MIGRATIONS).unwrap();
}

/// Returns a url for the database using `POSTGRES_USER`, `POSTGRES_PASSWORD`, and `POSTGRES_DB`
/// environment variables. If `database_override` is not `None`, then its value will be used in
/// place of `POSTGRES_DB`.
pub fn create_url(database_override: Option<&str>) -> String {
    if std::env::var("DOCKER_DEPLOYMENT").is_err() {
        let _ = dotenvy::dotenv();
    }

    let user = std::env::var("POSTGRES_USER").unwrap();
    let password = std::env::var("POSTGRES_PASSWORD").unwrap();
    let database = database_override
        .map(Cow::Borrowed)
        .unwrap_or(Cow::Owned(std::env::var("POSTGRES_DB").unwrap()));
    let hostname = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| match std::env::var("DOCKER_DEPLOYMENT") {
        Ok(_) => String::from("host.docker.internal"),
        Err(_) => String::from("localhost"),
    });

    format!("postgres://{user}:{password}@{hostname}/{database}")
}
