//! Transaction scopes and root transactions
//!
//! A [`Transaction`] is the handle a caller gets back from
//! [`TransactionManager::begin`](crate::manager::TransactionManager::begin).
//! Several handles may share one physical root transaction: the root owns
//! the resources (one per connection factory, in first-access order), the
//! lifecycle listeners and the query cache. Joined and nested scopes only
//! route to it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryCacheStats};
use crate::config::CoordinatorConfig;
use crate::connection::{Connection, ConnectionFactory, FactoryKey};
use crate::definition::TransactionDefinition;
use crate::error::{CleanupFailure, TransactionError, TxResult};
use crate::listener::ListenerRegistry;
use crate::resource::TransactionResource;
use crate::savepoint::{CompositeSavepoint, TransactionId};
use crate::value::{ResultSet, Sql};

/// Handle for one propagation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub(crate) id: TransactionId,
    pub(crate) root_id: TransactionId,
    pub(crate) parent: Option<TransactionId>,
    pub(crate) definition: TransactionDefinition,
    pub(crate) new_transaction: bool,
    pub(crate) active: bool,
    pub(crate) nested: bool,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Id of the root transaction this scope runs in
    pub fn root_id(&self) -> TransactionId {
        self.root_id
    }

    /// Scope that was current when this one began
    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    /// True when this scope started its own root (and resource set)
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// True when work in this scope runs inside a database transaction
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True when this scope is protected by a savepoint on its root
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

/// The physical transaction behind one or more scopes
pub(crate) struct RootTransaction {
    pub(crate) id: TransactionId,
    definition: TransactionDefinition,
    active: bool,
    config: Arc<CoordinatorConfig>,
    resources: Vec<(FactoryKey, TransactionResource)>,
    pub(crate) listeners: ListenerRegistry,
    cache: QueryCache,
    pub(crate) rollback_only: bool,
}

impl RootTransaction {
    pub fn new(definition: TransactionDefinition, active: bool, config: Arc<CoordinatorConfig>) -> Self {
        let cache = QueryCache::new(config.query_cache_enabled);
        Self {
            id: TransactionId::next(),
            definition,
            active,
            config,
            resources: Vec::new(),
            listeners: ListenerRegistry::default(),
            cache,
            rollback_only: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn resource(&self, factory: FactoryKey) -> Option<&TransactionResource> {
        self.resources
            .iter()
            .find(|(key, _)| *key == factory)
            .map(|(_, res)| res)
    }

    fn position(&self, factory: FactoryKey) -> Option<usize> {
        self.resources.iter().position(|(key, _)| *key == factory)
    }

    /// Resource for a factory, materialized on first access
    pub fn resource_mut(&mut self, factory: &Arc<dyn ConnectionFactory>) -> &mut TransactionResource {
        let key = FactoryKey::of(factory);
        let index = match self.position(key) {
            Some(index) => index,
            None => {
                debug!("Binding '{}' to transaction {}", factory.name(), self.id);
                self.resources.push((
                    key,
                    TransactionResource::new(
                        factory.clone(),
                        self.definition,
                        self.active,
                        self.config.deferred_mode,
                    ),
                ));
                self.resources.len() - 1
            }
        };
        &mut self.resources[index].1
    }

    /// Read through the query cache
    pub async fn query(&mut self, factory: &Arc<dyn ConnectionFactory>, sql: &Sql) -> TxResult<Arc<ResultSet>> {
        let key = FactoryKey::of(factory);
        if let Some(rows) = self.cache.get(key, sql) {
            debug!("Query cache hit in {}: {}", self.id, sql.text);
            return Ok(rows);
        }

        let conn = self.resource_mut(factory).get_connection().await?;
        let rows = conn.query(sql).await.map_err(|source| TransactionError::Execution {
            factory: factory.name().to_string(),
            statement: sql.key(),
            source,
        })?;

        let rows = Arc::new(rows);
        if self.cache.is_enabled() {
            debug!("Query cache miss in {}: {}", self.id, sql.text);
            self.cache.put(key, sql, rows.clone());
        }
        Ok(rows)
    }

    /// Per-transaction cache toggle, gated by the global flag
    pub fn set_query_cache_enabled(&mut self, enabled: bool) {
        self.cache
            .set_enabled(enabled && self.config.query_cache_enabled);
    }

    pub fn cache_stats(&self) -> QueryCacheStats {
        self.cache.stats()
    }

    /// Flush every resource in first-access order, stopping at the first failure
    pub async fn process(&mut self) -> TxResult<u64> {
        let mut affected = 0;
        for (_, resource) in self.resources.iter_mut() {
            affected += resource.process().await?;
        }
        Ok(affected)
    }

    /// Savepoint across every resource bound so far
    pub async fn create_savepoint(&mut self) -> TxResult<CompositeSavepoint> {
        let mut savepoint = CompositeSavepoint {
            transaction_id: self.id,
            entries: Vec::with_capacity(self.resources.len()),
        };

        for index in 0..self.resources.len() {
            let key = self.resources[index].0;
            let resource = &mut self.resources[index].1;
            let entry = if resource.has_connection() {
                resource.create_savepoint().await
            } else {
                Ok(resource.mark())
            };
            match entry {
                Ok(entry) => savepoint.entries.push((key, entry)),
                Err(e) => {
                    // Do not leave half a composite savepoint on the drivers
                    if let Err(release_err) = self.release_savepoint(&savepoint).await {
                        warn!("Failed to release partial savepoint: {}", release_err);
                    }
                    return Err(e);
                }
            }
        }

        debug!(
            "Created savepoint on {} covering {} resource(s)",
            self.id,
            savepoint.len()
        );
        Ok(savepoint)
    }

    fn check_savepoint(&self, savepoint: &CompositeSavepoint) -> TxResult<()> {
        if savepoint.transaction_id != self.id {
            return Err(TransactionError::InvalidSavepoint(format!(
                "Savepoint was taken on {} but the current transaction is {}",
                savepoint.transaction_id, self.id
            )));
        }
        Ok(())
    }

    fn covered_resource(&mut self, factory: FactoryKey) -> TxResult<&mut TransactionResource> {
        let index = self.position(factory).ok_or_else(|| {
            TransactionError::InvalidSavepoint(format!(
                "Savepoint refers to {} which is not bound to this transaction",
                factory
            ))
        })?;
        Ok(&mut self.resources[index].1)
    }

    /// Roll every covered resource back to its savepoint
    ///
    /// Resources bound after the savepoint was taken are left untouched.
    pub async fn rollback_to_savepoint(&mut self, savepoint: &CompositeSavepoint) -> TxResult<()> {
        self.check_savepoint(savepoint)?;
        for (factory, entry) in &savepoint.entries {
            self.covered_resource(*factory)?.rollback_to(entry).await?;
        }
        self.cache.clear();
        debug!("Rolled back {} to savepoint", self.id);
        Ok(())
    }

    pub async fn release_savepoint(&mut self, savepoint: &CompositeSavepoint) -> TxResult<()> {
        self.check_savepoint(savepoint)?;
        for (factory, entry) in &savepoint.entries {
            self.covered_resource(*factory)?.release(entry).await?;
        }
        Ok(())
    }

    /// Commit and close every resource, continuing through failures
    pub async fn end_all(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for (_, resource) in self.resources.iter_mut() {
            failures.extend(resource.end().await);
        }
        self.cache.clear();
        failures
    }

    /// Roll back and close every resource, continuing through failures
    pub async fn rollback_all(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for (_, resource) in self.resources.iter_mut() {
            failures.extend(resource.rollback().await);
            failures.extend(resource.close().await);
        }
        self.cache.clear();
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryDatabase;

    fn root() -> RootTransaction {
        RootTransaction::new(
            TransactionDefinition::required(),
            true,
            Arc::new(CoordinatorConfig::default()),
        )
    }

    fn factory(name: &str) -> (Arc<MemoryDatabase>, Arc<dyn ConnectionFactory>) {
        let db = Arc::new(MemoryDatabase::new(name));
        let factory: Arc<dyn ConnectionFactory> = db.clone();
        (db, factory)
    }

    #[tokio::test]
    async fn test_resources_keep_first_access_order() {
        let (_, a) = factory("a");
        let (_, b) = factory("b");
        let mut root = root();

        root.resource_mut(&b);
        root.resource_mut(&a);
        root.resource_mut(&b);

        assert_eq!(root.resource_count(), 2);
        let names: Vec<_> = root.resources.iter().map(|(_, r)| r.factory_name().to_string()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_process_stops_at_first_failing_resource() {
        let (db_a, a) = factory("a");
        let (db_b, b) = factory("b");
        db_a.fail_statement("INSERT INTO a VALUES (2)");
        let mut root = root();

        root.resource_mut(&a).add_statement(Sql::new("INSERT INTO a VALUES (1)"));
        root.resource_mut(&a).add_statement(Sql::new("INSERT INTO a VALUES (2)"));
        root.resource_mut(&b).add_statement(Sql::new("INSERT INTO b VALUES (1)"));

        let err = root.process().await.unwrap_err();
        assert_eq!(err.factory(), Some("a"));
        assert_eq!(db_a.executed_count(), 1);
        assert_eq!(db_b.connect_count(), 0);

        root.rollback_all().await;
        assert!(db_a.committed().is_empty());
    }

    #[tokio::test]
    async fn test_savepoint_does_not_cover_later_resources() {
        let (db_a, a) = factory("a");
        let (db_b, b) = factory("b");
        let mut root = root();

        root.resource_mut(&a).get_connection().await.unwrap();
        let savepoint = root.create_savepoint().await.unwrap();
        assert_eq!(savepoint.len(), 1);
        assert!(!savepoint.covers(FactoryKey::of(&b)));

        root.resource_mut(&a).add_statement(Sql::new("INSERT INTO a VALUES (1)"));
        root.resource_mut(&b).add_statement(Sql::new("INSERT INTO b VALUES (1)"));
        root.process().await.unwrap();
        root.rollback_to_savepoint(&savepoint).await.unwrap();

        assert!(root.end_all().await.is_empty());
        assert!(db_a.committed().is_empty());
        assert_eq!(db_b.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_marker_rolls_back_late_connection() {
        let (db, a) = factory("a");
        let mut root = root();

        root.resource_mut(&a);
        let savepoint = root.create_savepoint().await.unwrap();
        assert_eq!(savepoint.get(FactoryKey::of(&a)).and_then(|s| s.name()), None);

        root.resource_mut(&a).add_statement(Sql::new("INSERT INTO a VALUES (1)"));
        root.process().await.unwrap();
        root.rollback_to_savepoint(&savepoint).await.unwrap();

        root.end_all().await;
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_savepoint_is_rejected() {
        let (_, a) = factory("a");
        let mut first = root();
        let mut second = root();
        first.resource_mut(&a).get_connection().await.unwrap();

        let savepoint = first.create_savepoint().await.unwrap();
        assert!(matches!(
            second.rollback_to_savepoint(&savepoint).await,
            Err(TransactionError::InvalidSavepoint(_))
        ));
        first.end_all().await;
    }

    #[tokio::test]
    async fn test_end_all_continues_through_failures() {
        let (db_a, a) = factory("a");
        let (db_b, b) = factory("b");
        db_a.fail_commits(true);
        let mut root = root();

        root.resource_mut(&a).add_statement(Sql::new("INSERT INTO a VALUES (1)"));
        root.resource_mut(&b).add_statement(Sql::new("INSERT INTO b VALUES (1)"));
        root.process().await.unwrap();

        let failures = root.end_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].factory, "a");
        assert!(db_a.committed().is_empty());
        assert_eq!(db_b.committed().len(), 1);
        assert_eq!(db_a.close_count(), 1);
    }

    #[tokio::test]
    async fn test_query_cache_shares_results() {
        let (db, a) = factory("a");
        let mut root = root();
        let sql = Sql::new("SELECT * FROM users WHERE id = $1").bind(1);

        let first = root.query(&a, &sql).await.unwrap();
        let second = root.query(&a, &sql).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.query_count(), 1);

        root.set_query_cache_enabled(false);
        let third = root.query(&a, &sql).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(db.query_count(), 2);
        root.end_all().await;
    }
}
