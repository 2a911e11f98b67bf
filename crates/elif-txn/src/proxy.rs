//! Close-swallowing connection guard
//!
//! Application code receives a [`ConnectionProxy`] instead of the raw
//! connection. Every call is forwarded except `close`, which is ignored while
//! the owning resource is alive. Only the resource can get the raw connection
//! back through [`ConnectionProxy::into_inner`].

use async_trait::async_trait;

use crate::connection::{Connection, PreparedStatement};
use crate::definition::IsolationLevel;
use crate::error::DriverResult;

pub struct ConnectionProxy {
    inner: Box<dyn Connection>,
    swallowed_closes: u32,
}

impl ConnectionProxy {
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self {
            inner,
            swallowed_closes: 0,
        }
    }

    /// Number of `close` calls ignored so far
    pub fn swallowed_closes(&self) -> u32 {
        self.swallowed_closes
    }

    pub(crate) fn into_inner(self) -> Box<dyn Connection> {
        self.inner
    }
}

#[async_trait]
impl Connection for ConnectionProxy {
    async fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        self.inner.set_auto_commit(auto_commit).await
    }

    fn auto_commit(&self) -> bool {
        self.inner.auto_commit()
    }

    async fn set_read_only(&mut self, read_only: bool) -> DriverResult<()> {
        self.inner.set_read_only(read_only).await
    }

    async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        self.inner.set_transaction_isolation(level).await
    }

    async fn prepare<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn PreparedStatement + 'c>> {
        self.inner.prepare(sql).await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.inner.rollback().await
    }

    async fn create_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.inner.create_savepoint(name).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.inner.rollback_to_savepoint(name).await
    }

    async fn release_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.inner.release_savepoint(name).await
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.swallowed_closes += 1;
        tracing::debug!("Ignoring close() on a transaction-owned connection");
        Ok(())
    }
}
