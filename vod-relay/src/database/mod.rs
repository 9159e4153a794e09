//! SQLite persistence layer.
//!
//! Two pools over the same database file: a sized read pool, and a
//! single-connection write pool so only one connection ever competes for the
//! SQLite write lock. Multi-statement writes (credential rotation) run inside
//! `BEGIN IMMEDIATE` transactions on the write pool.

pub mod repositories;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = Pool<Sqlite>;

/// Serialized write pool (always `max_connections = 1`).
pub type WritePool = Pool<Sqlite>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_READ_CONNECTIONS: u32 = 10;

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true))
}

async fn tune_connection(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    // Cap WAL growth and keep temp structures off disk.
    sqlx::query("PRAGMA journal_size_limit = 67108864")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Open the read pool, sized to the machine but capped; SQLite readers gain
/// nothing past a handful of connections.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    let max_connections = (cores * 2).min(MAX_READ_CONNECTIONS);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| Box::pin(async move { tune_connection(conn).await }))
        .connect_with(connect_options(database_url)?)
        .await?;

    tracing::info!(max_connections, "read pool initialized");
    Ok(pool)
}

/// Open the single-connection write pool.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| Box::pin(async move { tune_connection(conn).await }))
        .connect_with(connect_options(database_url)?)
        .await?;

    tracing::info!("write pool initialized (serialized writes)");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations").run(pool).await
}

/// Start an immediate-mode transaction on the write pool.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so two rotation requests
/// can never interleave their read-cursor/advance-cursor steps.
pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        finished: false,
    })
}

/// A manually managed `BEGIN IMMEDIATE` transaction.
///
/// Dropping it without commit or rollback closes the connection, which rolls
/// the transaction back rather than leaking an open write lock into the pool.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}
