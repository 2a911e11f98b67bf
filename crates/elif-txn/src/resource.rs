//! Transaction Resources
//!
//! A [`TransactionResource`] is the per-factory half of a root transaction.
//! It lazily opens exactly one connection, owns the deferred statement queue
//! for that factory, numbers its savepoints, and closes the underlying
//! connection exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::DeferredQueueMode;
use crate::connection::{Connection, ConnectionFactory};
use crate::definition::TransactionDefinition;
use crate::error::{CleanupFailure, CleanupStep, DriverResult, TransactionError, TxResult};
use crate::proxy::ConnectionProxy;
use crate::savepoint::{ResourceId, ResourceSavepoint};
use crate::value::{Sql, StatementKey};

/// Insertion-ordered queue of deferred writes
///
/// In [`DeferredQueueMode::Deduplicate`] mode a statement whose identity is
/// already queued replaces the queued entry and keeps its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeferredQueue {
    mode: DeferredQueueMode,
    entries: Vec<(StatementKey, Sql)>,
    positions: HashMap<StatementKey, usize>,
}

impl DeferredQueue {
    pub fn new(mode: DeferredQueueMode) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Queue a statement; returns `false` when it replaced a queued entry
    pub fn push(&mut self, sql: Sql) -> bool {
        let key = sql.key();
        if self.mode == DeferredQueueMode::Deduplicate {
            if let Some(&pos) = self.positions.get(&key) {
                self.entries[pos].1 = sql;
                return false;
            }
            self.positions.insert(key.clone(), self.entries.len());
        }
        self.entries.push((key, sql));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &StatementKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn statements(&self) -> impl Iterator<Item = &Sql> {
        self.entries.iter().map(|(_, sql)| sql)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    fn take(&mut self) -> Vec<(StatementKey, Sql)> {
        self.positions.clear();
        std::mem::take(&mut self.entries)
    }
}

/// One connection, its deferred writes and savepoint counter, bound to a
/// single (root transaction, factory) pair
pub struct TransactionResource {
    id: ResourceId,
    factory: Arc<dyn ConnectionFactory>,
    definition: TransactionDefinition,
    active: bool,
    connection: Option<ConnectionProxy>,
    deferred: DeferredQueue,
    savepoint_counter: u32,
    ended: bool,
}

impl TransactionResource {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        definition: TransactionDefinition,
        active: bool,
        mode: DeferredQueueMode,
    ) -> Self {
        Self {
            id: ResourceId::next(),
            factory,
            definition,
            active,
            connection: None,
            deferred: DeferredQueue::new(mode),
            savepoint_counter: 0,
            ended: false,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn factory_name(&self) -> &str {
        self.factory.name()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn savepoint_count(&self) -> u32 {
        self.savepoint_counter
    }

    /// Get the wrapped connection, opening and configuring it on first use
    pub async fn get_connection(&mut self) -> TxResult<&mut ConnectionProxy> {
        self.ensure_connection().await?;
        self.connection.as_mut().ok_or_else(|| {
            TransactionError::IllegalState(format!(
                "Connection for '{}' disappeared after opening",
                self.factory.name()
            ))
        })
    }

    async fn ensure_connection(&mut self) -> TxResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if self.ended {
            return Err(TransactionError::IllegalState(format!(
                "Resource for '{}' has already ended",
                self.factory.name()
            )));
        }

        debug!("Opening connection for '{}'", self.factory.name());
        let mut raw = self
            .factory
            .connect()
            .await
            .map_err(|source| self.acquire_error(source))?;

        if let Err(source) = configure(raw.as_mut(), self.definition, self.active).await {
            if let Err(e) = raw.close().await {
                warn!("Failed to close misconfigured connection for '{}': {}", self.factory.name(), e);
            }
            return Err(self.acquire_error(source));
        }

        self.connection = Some(ConnectionProxy::new(raw));
        Ok(())
    }

    fn acquire_error(&self, source: crate::error::DriverError) -> TransactionError {
        error!("Failed to acquire connection from '{}': {}", self.factory.name(), source);
        TransactionError::Acquire {
            factory: self.factory.name().to_string(),
            source,
        }
    }

    /// Queue a deferred write
    pub fn add_statement(&mut self, sql: Sql) {
        if !self.deferred.push(sql) {
            debug!("Replaced queued statement on '{}'", self.factory.name());
        }
    }

    /// Execute every queued statement in insertion order
    ///
    /// The first failure aborts the remaining statements; the queue is empty
    /// afterwards either way.
    pub async fn process(&mut self) -> TxResult<u64> {
        if self.deferred.is_empty() {
            return Ok(0);
        }
        self.ensure_connection().await?;

        let statements = self.deferred.take();
        let factory = self.factory.name().to_string();
        debug!("Flushing {} deferred statement(s) on '{}'", statements.len(), factory);

        let conn = match self.connection.as_mut() {
            Some(conn) => conn,
            None => {
                return Err(TransactionError::IllegalState(format!(
                    "No connection for '{}' while processing",
                    factory
                )))
            }
        };

        let mut affected = 0;
        for (key, sql) in statements {
            match conn.execute(&sql).await {
                Ok(rows) => affected += rows,
                Err(source) => {
                    error!("Deferred statement '{}' failed on '{}': {}", key, factory, source);
                    return Err(TransactionError::Execution {
                        factory,
                        statement: key,
                        source,
                    });
                }
            }
        }
        Ok(affected)
    }

    /// Take a named savepoint on the live connection
    pub async fn create_savepoint(&mut self) -> TxResult<ResourceSavepoint> {
        let queue = self.deferred.clone();
        let conn = self.connection.as_mut().ok_or_else(|| {
            TransactionError::Savepoint(format!(
                "No connection open for '{}'; a savepoint needs prior work",
                self.factory.name()
            ))
        })?;

        self.savepoint_counter += 1;
        let name = format!("SAVEPOINT_{}", self.savepoint_counter);
        conn.create_savepoint(&name).await?;
        debug!("Created savepoint {} on '{}'", name, self.factory.name());

        Ok(ResourceSavepoint {
            resource_id: self.id,
            name: Some(name),
            queue,
        })
    }

    /// Savepoint marker for a resource whose connection is not open yet
    pub(crate) fn mark(&self) -> ResourceSavepoint {
        ResourceSavepoint {
            resource_id: self.id,
            name: None,
            queue: self.deferred.clone(),
        }
    }

    fn check_owner(&self, savepoint: &ResourceSavepoint) -> TxResult<()> {
        if savepoint.resource_id != self.id {
            return Err(TransactionError::InvalidSavepoint(format!(
                "Savepoint belongs to another resource than '{}'",
                self.factory.name()
            )));
        }
        Ok(())
    }

    /// Roll back to a savepoint, restoring the deferred queue as it was
    pub async fn rollback_to(&mut self, savepoint: &ResourceSavepoint) -> TxResult<()> {
        self.check_owner(savepoint)?;
        self.deferred = savepoint.queue.clone();

        match (&savepoint.name, self.connection.as_mut()) {
            (Some(name), Some(conn)) => {
                conn.rollback_to_savepoint(name).await?;
                debug!("Rolled back to {} on '{}'", name, self.factory.name());
            }
            (None, Some(conn)) if self.active => {
                // Opened after the marker was taken: all of its work is newer.
                conn.rollback().await?;
                debug!("Rolled back late-opened connection on '{}'", self.factory.name());
            }
            (Some(name), None) => {
                return Err(TransactionError::Savepoint(format!(
                    "Savepoint {} refers to a closed connection on '{}'",
                    name,
                    self.factory.name()
                )));
            }
            _ => {}
        }
        Ok(())
    }

    /// Release a savepoint on the driver
    pub async fn release(&mut self, savepoint: &ResourceSavepoint) -> TxResult<()> {
        self.check_owner(savepoint)?;
        if let (Some(name), Some(conn)) = (&savepoint.name, self.connection.as_mut()) {
            conn.release_savepoint(name).await?;
            debug!("Released {} on '{}'", name, self.factory.name());
        }
        Ok(())
    }

    /// Commit (when a connection was opened in an active transaction) and
    /// close the underlying connection
    ///
    /// Failures are logged and returned, never raised. Calling `end` again is
    /// a no-op.
    pub async fn end(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        if self.ended {
            return failures;
        }

        if !self.deferred.is_empty() {
            warn!(
                "Discarding {} unprocessed statement(s) on '{}'",
                self.deferred.len(),
                self.factory.name()
            );
        }

        if self.active {
            if let Some(conn) = self.connection.as_mut() {
                if let Err(e) = conn.commit().await {
                    warn!("Commit failed on '{}': {}", self.factory.name(), e);
                    // Restoring auto-commit below must not commit the leftovers
                    if let Err(rollback_err) = conn.rollback().await {
                        warn!(
                            "Rollback after failed commit on '{}' failed: {}",
                            self.factory.name(),
                            rollback_err
                        );
                    }
                    failures.push(self.failure(CleanupStep::Commit, e));
                }
            }
        }

        failures.extend(self.close().await);
        failures
    }

    /// Roll back the connection, if one was opened, and drop queued writes
    pub async fn rollback(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        if !self.deferred.is_empty() {
            debug!(
                "Dropping {} queued statement(s) on '{}'",
                self.deferred.len(),
                self.factory.name()
            );
            self.deferred.clear();
        }

        if self.active {
            if let Some(conn) = self.connection.as_mut() {
                if let Err(e) = conn.rollback().await {
                    warn!("Rollback failed on '{}', ignoring: {}", self.factory.name(), e);
                    failures.push(self.failure(CleanupStep::Rollback, e));
                }
            }
        }
        failures
    }

    /// Restore auto-commit and physically close the underlying connection
    pub async fn close(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        self.ended = true;
        self.deferred.clear();

        let Some(proxy) = self.connection.take() else {
            return failures;
        };
        let mut raw = proxy.into_inner();

        if self.active {
            if let Err(e) = raw.set_auto_commit(true).await {
                warn!("Failed to restore auto-commit on '{}': {}", self.factory.name(), e);
                failures.push(self.failure(CleanupStep::RestoreAutoCommit, e));
            }
        }
        if let Err(e) = raw.close().await {
            warn!("Failed to close connection for '{}': {}", self.factory.name(), e);
            failures.push(self.failure(CleanupStep::Close, e));
        }
        debug!("Closed connection for '{}'", self.factory.name());
        failures
    }

    fn failure(&self, step: CleanupStep, error: crate::error::DriverError) -> CleanupFailure {
        CleanupFailure {
            factory: self.factory.name().to_string(),
            step,
            error,
        }
    }
}

/// Apply auto-commit, read-only and (non-default) isolation to a fresh connection
async fn configure(
    conn: &mut dyn Connection,
    definition: TransactionDefinition,
    active: bool,
) -> DriverResult<()> {
    conn.set_auto_commit(!active).await?;
    if definition.is_read_only() {
        conn.set_read_only(true).await?;
    }
    let isolation = definition.isolation_level();
    if !isolation.is_default() {
        conn.set_transaction_isolation(isolation).await?;
        debug!("Isolation level set to {}", isolation);
    }
    Ok(())
}

impl Drop for TransactionResource {
    fn drop(&mut self) {
        if self.connection.is_some() {
            warn!(
                "Transaction resource for '{}' dropped with an open connection; it will be released without commit",
                self.factory.name()
            );
        }
    }
}
