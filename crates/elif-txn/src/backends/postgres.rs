//! PostgreSQL Backend Implementation
//!
//! Connection factory over a sqlx `PgPool`. PostgreSQL has no auto-commit
//! switch, so turning auto-commit off makes the connection open a transaction
//! with `BEGIN` right before the next statement, and turning it back on
//! commits whatever is open. Read-only mode and isolation requested while in
//! auto-commit mode are applied as session characteristics and reset on close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionFactory, PreparedStatement};
use crate::definition::IsolationLevel;
use crate::error::{DriverError, DriverResult};
use crate::value::{DatabaseValue, ResultSet};

/// Pool settings for [`PgConnectionFactory::from_url`]
#[derive(Debug, Clone)]
pub struct PgFactoryConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
}

impl Default for PgFactoryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),
        }
    }
}

/// PostgreSQL connection factory
pub struct PgConnectionFactory {
    name: String,
    pool: Arc<Pool<Postgres>>,
}

impl PgConnectionFactory {
    pub fn new(name: impl Into<String>, pool: Pool<Postgres>) -> Self {
        Self {
            name: name.into(),
            pool: Arc::new(pool),
        }
    }

    /// Create the pool and wrap it in a factory
    pub async fn from_url(
        name: impl Into<String>,
        database_url: &str,
        config: PgFactoryConfig,
    ) -> DriverResult<Self> {
        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds));

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        let pool = options.connect(database_url).await?;
        Ok(Self::new(name, pool))
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> DriverResult<Box<dyn Connection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresConnection::new(conn)))
    }
}

/// Pooled PostgreSQL connection with emulated auto-commit
pub struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
    auto_commit: bool,
    in_transaction: bool,
    read_only: bool,
    isolation: IsolationLevel,
    session_overridden: bool,
}

impl PostgresConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn: Some(conn),
            auto_commit: true,
            in_transaction: false,
            read_only: false,
            isolation: IsolationLevel::Default,
            session_overridden: false,
        }
    }

    fn raw(&mut self) -> DriverResult<&mut PoolConnection<Postgres>> {
        self.conn.as_mut().ok_or(DriverError::Closed)
    }

    async fn run(&mut self, sql: &str) -> DriverResult<()> {
        let conn = self.raw()?;
        sqlx::query(sql).execute(&mut **conn).await?;
        Ok(())
    }

    /// Open the transaction on first use after auto-commit was turned off
    async fn begin_if_needed(&mut self) -> DriverResult<()> {
        if self.auto_commit || self.in_transaction {
            return Ok(());
        }
        self.run("BEGIN").await?;
        if let Some(level) = self.isolation.as_sql() {
            self.run(&format!("SET TRANSACTION ISOLATION LEVEL {}", level)).await?;
        }
        if self.read_only {
            self.run("SET TRANSACTION READ ONLY").await?;
        }
        self.in_transaction = true;
        debug!("Opened PostgreSQL transaction");
        Ok(())
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        if auto_commit && self.in_transaction {
            self.run("COMMIT").await?;
            self.in_transaction = false;
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_read_only(&mut self, read_only: bool) -> DriverResult<()> {
        if self.in_transaction {
            return Err(DriverError::Driver(
                "cannot change read-only mode inside a transaction".to_string(),
            ));
        }
        self.read_only = read_only;
        if self.auto_commit {
            let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
            self.run(&format!("SET SESSION CHARACTERISTICS AS TRANSACTION {}", mode))
                .await?;
            self.session_overridden = true;
        }
        Ok(())
    }

    async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        if self.in_transaction {
            return Err(DriverError::Driver(
                "cannot change isolation level inside a transaction".to_string(),
            ));
        }
        self.isolation = level;
        if self.auto_commit {
            match level.as_sql() {
                Some(sql) => {
                    self.run(&format!(
                        "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                        sql
                    ))
                    .await?;
                    self.session_overridden = true;
                }
                None if self.session_overridden => {
                    self.run("RESET default_transaction_isolation").await?;
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn prepare<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn PreparedStatement + 'c>> {
        self.begin_if_needed().await?;
        let conn = self.raw()?;
        Ok(Box::new(PostgresStatement {
            conn,
            sql: sql.to_string(),
        }))
    }

    async fn commit(&mut self) -> DriverResult<()> {
        if self.in_transaction {
            self.run("COMMIT").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        if self.in_transaction {
            self.run("ROLLBACK").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn create_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.begin_if_needed().await?;
        self.run(&format!("SAVEPOINT {}", name)).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.run(&format!("ROLLBACK TO SAVEPOINT {}", name)).await
    }

    async fn release_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.run(&format!("RELEASE SAVEPOINT {}", name)).await
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.in_transaction {
            warn!("Closing PostgreSQL connection with an open transaction, rolling back");
            self.rollback().await?;
        }
        if self.session_overridden {
            self.run("RESET default_transaction_read_only").await?;
            self.run("RESET default_transaction_isolation").await?;
            self.session_overridden = false;
        }
        let conn = self.conn.take().ok_or(DriverError::Closed)?;
        // Dropping the pooled connection returns it to the pool
        drop(conn);
        Ok(())
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if !self.in_transaction && !self.session_overridden {
            return;
        }
        // Open transaction or session state must never reach the pool
        if let Some(conn) = self.conn.take() {
            warn!("PostgreSQL connection dropped with transaction state, discarding it");
            drop(conn.detach());
        }
    }
}

struct PostgresStatement<'c> {
    conn: &'c mut PoolConnection<Postgres>,
    sql: String,
}

#[async_trait]
impl<'c> PreparedStatement for PostgresStatement<'c> {
    async fn execute(&mut self, params: &[DatabaseValue]) -> DriverResult<u64> {
        let mut query = sqlx::query(&self.sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let result = query.execute(&mut **self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, params: &[DatabaseValue]) -> DriverResult<ResultSet> {
        let mut query = sqlx::query(&self.sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let rows = query.fetch_all(&mut **self.conn).await?;
        rows_to_result_set(&rows)
    }

    async fn close(self: Box<Self>) -> DriverResult<()> {
        Ok(())
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float32(f) => query.bind(*f),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Date(d) => query.bind(*d),
        DatabaseValue::Time(t) => query.bind(*t),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

fn rows_to_result_set(rows: &[PgRow]) -> DriverResult<ResultSet> {
    let columns = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => Vec::new(),
    };

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            record.push(postgres_value_to_database_value(row, index)?);
        }
        values.push(record);
    }
    Ok(ResultSet::new(columns, values))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> DriverResult<DatabaseValue> {
    use chrono::TimeZone;
    use sqlx::{TypeInfo, ValueRef};

    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int32(row.try_get::<i16, _>(index)? as i32),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "FLOAT4" => DatabaseValue::Float32(row.try_get(index)?),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => DatabaseValue::String(row.try_get(index)?),
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index)?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(chrono::Utc.from_utc_datetime(&naive))
        }
        "DATE" => DatabaseValue::Date(row.try_get(index)?),
        "TIME" => DatabaseValue::Time(row.try_get(index)?),
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get::<JsonValue, _>(index)?),
        other => {
            let value: String = row.try_get(index).map_err(|e| {
                DriverError::Driver(format!(
                    "Failed to get value as string for unknown type '{}': {}",
                    other, e
                ))
            })?;
            DatabaseValue::String(value)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Sql;

    #[test]
    fn test_default_factory_config() {
        let config = PgFactoryConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_seconds, 30);
    }

    async fn single_connection_factory() -> PgConnectionFactory {
        let url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .expect("TEST_DATABASE_URL or DATABASE_URL must be set");
        let config = PgFactoryConfig {
            max_connections: 1,
            min_connections: 0,
            ..Default::default()
        };
        PgConnectionFactory::from_url("primary", &url, config).await.unwrap()
    }

    async fn setting(conn: &mut Box<dyn Connection>, name: &str) -> Option<DatabaseValue> {
        let rows = conn
            .query(&Sql::new("SELECT current_setting($1) AS value").bind(name))
            .await
            .unwrap();
        rows.get(0, "value").cloned()
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL server
    async fn test_dropped_open_transaction_is_not_returned_to_pool() {
        let factory = single_connection_factory().await;
        {
            let mut conn = factory.connect().await.unwrap();
            conn.set_auto_commit(false).await.unwrap();
            conn.execute(&Sql::new("SET LOCAL application_name = 'elif_txn_stale'"))
                .await
                .unwrap();
        }

        let mut conn = factory.connect().await.unwrap();
        assert_ne!(
            setting(&mut conn, "application_name").await,
            Some(DatabaseValue::from("elif_txn_stale"))
        );
        conn.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL server
    async fn test_read_only_applies_in_auto_commit_and_resets_on_close() {
        let factory = single_connection_factory().await;

        let mut conn = factory.connect().await.unwrap();
        conn.set_read_only(true).await.unwrap();
        assert_eq!(
            setting(&mut conn, "transaction_read_only").await,
            Some(DatabaseValue::from("on"))
        );
        conn.close().await.unwrap();

        let mut conn = factory.connect().await.unwrap();
        assert_eq!(
            setting(&mut conn, "default_transaction_read_only").await,
            Some(DatabaseValue::from("off"))
        );
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_pool_factory_is_named() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/elif_txn_test")
            .unwrap();
        let factory = PgConnectionFactory::new("primary", pool);
        assert_eq!(factory.name(), "primary");
    }
}
