//! Driver Abstractions
//!
//! The minimal connection surface the coordinator consumes. A
//! [`ConnectionFactory`] identifies one resource domain (for example one
//! database); factory identity, not equality, is what the coordinator keys
//! resources by.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::definition::IsolationLevel;
use crate::error::DriverResult;
use crate::value::{DatabaseValue, ResultSet, Sql};

/// Abstract database connection trait
#[async_trait]
pub trait Connection: Send {
    /// Switch auto-commit mode
    async fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()>;

    /// Current auto-commit mode
    fn auto_commit(&self) -> bool;

    async fn set_read_only(&mut self, read_only: bool) -> DriverResult<()>;

    async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DriverResult<()>;

    /// Prepare a statement bound to this connection
    async fn prepare<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn PreparedStatement + 'c>>;

    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;

    async fn create_savepoint(&mut self, name: &str) -> DriverResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> DriverResult<()>;

    /// Close the connection
    async fn close(&mut self) -> DriverResult<()>;

    /// Execute a statement through a dedicated prepared statement and
    /// return the affected rows count
    async fn execute(&mut self, sql: &Sql) -> DriverResult<u64> {
        let mut statement = self.prepare(&sql.text).await?;
        let result = statement.execute(&sql.params).await;
        let closed = statement.close().await;
        let affected = result?;
        closed?;
        Ok(affected)
    }

    /// Run a query through a dedicated prepared statement
    async fn query(&mut self, sql: &Sql) -> DriverResult<ResultSet> {
        let mut statement = self.prepare(&sql.text).await?;
        let result = statement.query(&sql.params).await;
        let closed = statement.close().await;
        let rows = result?;
        closed?;
        Ok(rows)
    }
}

/// A statement prepared on a live connection
#[async_trait]
pub trait PreparedStatement: Send {
    /// Execute the statement and return affected rows count
    async fn execute(&mut self, params: &[DatabaseValue]) -> DriverResult<u64>;

    /// Execute the statement and return the result rows
    async fn query(&mut self, params: &[DatabaseValue]) -> DriverResult<ResultSet>;

    /// Release the statement
    async fn close(self: Box<Self>) -> DriverResult<()>;
}

/// Produces raw connections for one resource domain
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Open (or acquire from a pool) a raw connection
    async fn connect(&self) -> DriverResult<Box<dyn Connection>>;
}

/// Identity of a factory instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryKey(usize);

impl FactoryKey {
    pub fn of(factory: &Arc<dyn ConnectionFactory>) -> Self {
        FactoryKey(Arc::as_ptr(factory) as *const () as usize)
    }
}

impl fmt::Display for FactoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factory@{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryDatabase;

    #[test]
    fn test_factory_key_is_identity_not_equality() {
        let a: Arc<dyn ConnectionFactory> = Arc::new(MemoryDatabase::new("db"));
        let b: Arc<dyn ConnectionFactory> = Arc::new(MemoryDatabase::new("db"));
        let a2 = a.clone();

        assert_eq!(FactoryKey::of(&a), FactoryKey::of(&a2));
        assert_ne!(FactoryKey::of(&a), FactoryKey::of(&b));
    }

    #[tokio::test]
    async fn test_execute_releases_statement_on_failure() {
        let db = MemoryDatabase::new("db");
        db.fail_statement("INSERT INTO broken VALUES ($1)");
        let mut conn = db.connect().await.unwrap();

        let result = conn.execute(&Sql::new("INSERT INTO broken VALUES ($1)").bind(1)).await;
        assert!(result.is_err());
        assert_eq!(db.open_statements(), 0);
    }
}
