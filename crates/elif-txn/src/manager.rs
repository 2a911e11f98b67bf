//! Transaction Manager
//!
//! Owns the stack of open scopes and the stack of root transactions for one
//! execution context. The topmost root is the current one; roots below it are
//! suspended by `REQUIRES_NEW`, `NOT_SUPPORTED` or a new root started while
//! no transaction was active, and resume when the scope above them completes.
//!
//! Scopes complete strictly last-in first-out. Errors raised while flushing
//! deferred writes leave the scope open: the caller decides to roll it back,
//! as [`TransactionManager::execute`] does.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::cache::QueryCacheStats;
use crate::config::{CleanupPolicy, CoordinatorConfig};
use crate::connection::{ConnectionFactory, FactoryKey};
use crate::definition::{Propagation, TransactionDefinition};
use crate::error::{CleanupFailure, CleanupStep, TransactionError, TxResult};
use crate::listener::{CallbackListener, Completion, TransactionListener};
use crate::proxy::ConnectionProxy;
use crate::savepoint::{CompositeSavepoint, TransactionId};
use crate::transaction::{RootTransaction, Transaction};
use crate::value::{ResultSet, Sql};

enum ScopeKind {
    /// Started its own root transaction
    Root,
    /// Participates in the current root
    Joined,
    /// Participates in the current root behind a savepoint
    Nested(CompositeSavepoint),
}

struct Scope {
    handle: Transaction,
    kind: ScopeKind,
}

/// Coordinates propagation scopes over connection factories
pub struct TransactionManager {
    config: Arc<CoordinatorConfig>,
    scopes: Vec<Scope>,
    roots: Vec<RootTransaction>,
}

impl TransactionManager {
    pub fn new(config: Arc<CoordinatorConfig>) -> Self {
        Self {
            config,
            scopes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Handle of the innermost open scope
    pub fn current(&self) -> Option<&Transaction> {
        self.scopes.last().map(|scope| &scope.handle)
    }

    /// Number of open scopes
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Whether work currently runs inside a database transaction
    pub fn is_transaction_active(&self) -> bool {
        self.roots.last().map_or(false, |root| root.is_active())
    }

    /// Whether the current root was marked rollback-only by a joined scope
    pub fn is_rollback_only(&self) -> bool {
        self.roots.last().map_or(false, |root| root.rollback_only)
    }

    /// Open a scope for `definition`, joining, nesting in, or suspending the
    /// current root as its propagation requires
    pub async fn begin(&mut self, definition: TransactionDefinition) -> TxResult<Transaction> {
        let propagation = definition.propagation();
        let current = self.roots.last().map(|root| root.is_active());

        let handle = match (propagation, current) {
            (Propagation::Required, Some(true)) => self.join(definition)?,
            (Propagation::Required, _) => self.start_root(definition, true),

            (Propagation::Supports, Some(_)) => self.join(definition)?,
            (Propagation::Supports, None) => self.start_root(definition, false),

            (Propagation::Mandatory, Some(true)) => self.join(definition)?,
            (Propagation::Mandatory, _) => {
                return Err(TransactionError::IllegalState(
                    "No existing transaction found for propagation MANDATORY".to_string(),
                ))
            }

            (Propagation::RequiresNew, _) => self.start_root(definition, true),

            (Propagation::NotSupported, Some(false)) => self.join(definition)?,
            (Propagation::NotSupported, _) => self.start_root(definition, false),

            (Propagation::Never, Some(true)) => {
                return Err(TransactionError::IllegalState(
                    "Existing transaction found for propagation NEVER".to_string(),
                ))
            }
            (Propagation::Never, Some(false)) => self.join(definition)?,
            (Propagation::Never, None) => self.start_root(definition, false),

            (Propagation::Nested, Some(true)) => self.nest(definition).await?,
            (Propagation::Nested, _) => self.start_root(definition, true),
        };

        debug!(
            "Began {} scope {} on {} (depth {})",
            propagation,
            handle.id,
            handle.root_id,
            self.scopes.len()
        );
        Ok(handle)
    }

    fn parent_id(&self) -> Option<TransactionId> {
        self.scopes.last().map(|scope| scope.handle.id)
    }

    fn start_root(&mut self, definition: TransactionDefinition, active: bool) -> Transaction {
        if let Some(previous) = self.roots.last() {
            debug!("Suspending transaction {}", previous.id);
        }
        let root = RootTransaction::new(definition, active, self.config.clone());
        let handle = Transaction {
            id: root.id,
            root_id: root.id,
            parent: self.parent_id(),
            definition,
            new_transaction: true,
            active,
            nested: false,
        };
        self.roots.push(root);
        self.scopes.push(Scope {
            handle,
            kind: ScopeKind::Root,
        });
        handle
    }

    fn join(&mut self, definition: TransactionDefinition) -> TxResult<Transaction> {
        let (root_id, active) = self
            .roots
            .last()
            .map(|root| (root.id, root.is_active()))
            .ok_or_else(|| TransactionError::IllegalState("No transaction to join".to_string()))?;
        let handle = Transaction {
            id: TransactionId::next(),
            root_id,
            parent: self.parent_id(),
            definition,
            new_transaction: false,
            active,
            nested: false,
        };
        self.scopes.push(Scope {
            handle,
            kind: ScopeKind::Joined,
        });
        Ok(handle)
    }

    async fn nest(&mut self, definition: TransactionDefinition) -> TxResult<Transaction> {
        let parent = self.parent_id();
        let root = self.current_root_mut()?;
        let savepoint = root.create_savepoint().await?;
        let handle = Transaction {
            id: TransactionId::next(),
            root_id: root.id,
            parent,
            definition,
            new_transaction: false,
            active: true,
            nested: true,
        };
        self.scopes.push(Scope {
            handle,
            kind: ScopeKind::Nested(savepoint),
        });
        Ok(handle)
    }

    fn current_root_mut(&mut self) -> TxResult<&mut RootTransaction> {
        self.roots
            .last_mut()
            .ok_or_else(|| TransactionError::IllegalState("No transaction in progress".to_string()))
    }

    fn check_current(&self, tx: &Transaction) -> TxResult<()> {
        match self.scopes.last() {
            Some(scope) if scope.handle.id == tx.id => Ok(()),
            Some(scope) => Err(TransactionError::IllegalState(format!(
                "Scope {} is not the current scope ({} is); scopes must complete in reverse order",
                tx.id, scope.handle.id
            ))),
            None => Err(TransactionError::IllegalState(format!(
                "Scope {} is not open",
                tx.id
            ))),
        }
    }

    /// Complete a scope successfully
    ///
    /// Only a root scope commits anything. A failure while flushing deferred
    /// writes leaves the scope current so it can be rolled back.
    pub async fn commit(&mut self, tx: &Transaction) -> TxResult<()> {
        self.check_current(tx)?;

        if matches!(self.scopes.last().map(|s| &s.kind), Some(ScopeKind::Root)) {
            return self.commit_root(tx).await;
        }

        let scope = self.pop_scope()?;
        match scope.kind {
            ScopeKind::Nested(savepoint) => {
                debug!("Releasing savepoint of nested scope {}", tx.id);
                self.current_root_mut()?.release_savepoint(&savepoint).await
            }
            _ => {
                debug!("Joined scope {} completed", tx.id);
                Ok(())
            }
        }
    }

    async fn commit_root(&mut self, tx: &Transaction) -> TxResult<()> {
        let root = self.current_root_mut()?;
        if root.rollback_only {
            warn!("Transaction {} is rollback-only, rolling back instead of committing", tx.id);
            self.rollback(tx).await?;
            return Err(TransactionError::UnexpectedRollback);
        }

        let listeners = root.listeners.clone();
        debug!("Committing {} with {} listener(s)", tx.id, listeners.len());
        listeners.trigger_before_process().await;
        let processed = root.process().await;
        listeners.trigger_after_process().await;
        if let Err(e) = processed {
            // Part of the queue is gone; only a rollback is safe from here
            root.rollback_only = true;
            return Err(e);
        }

        let failures = root.end_all().await;
        let committed = !failures.iter().any(|f| f.step == CleanupStep::Commit);
        listeners
            .trigger_complete(if committed {
                Completion::Committed
            } else {
                Completion::RolledBack
            })
            .await;

        self.pop_scope()?;
        self.pop_root(tx);
        info!("Transaction {} committed", tx.id);
        self.apply_cleanup_policy(failures)
    }

    /// Complete a scope unsuccessfully
    ///
    /// A joined scope marks its root rollback-only; a nested scope rolls back
    /// to its savepoint; a root scope rolls back every resource.
    pub async fn rollback(&mut self, tx: &Transaction) -> TxResult<()> {
        self.check_current(tx)?;
        let scope = self.pop_scope()?;

        match scope.kind {
            ScopeKind::Joined => {
                let root = self.current_root_mut()?;
                if root.is_active() {
                    debug!("Marking transaction {} rollback-only", root.id);
                    root.rollback_only = true;
                }
                Ok(())
            }
            ScopeKind::Nested(savepoint) => {
                debug!("Rolling back nested scope {} to its savepoint", tx.id);
                let root = self.current_root_mut()?;
                root.rollback_to_savepoint(&savepoint).await?;
                root.release_savepoint(&savepoint).await
            }
            ScopeKind::Root => {
                let root = self.current_root_mut()?;
                let listeners = root.listeners.clone();
                listeners.trigger_before_rollback().await;
                let failures = root.rollback_all().await;
                listeners.trigger_after_rollback().await;
                listeners.trigger_complete(Completion::RolledBack).await;

                self.pop_root(tx);
                info!("Transaction {} rolled back", tx.id);
                self.apply_cleanup_policy(failures)
            }
        }
    }

    fn pop_scope(&mut self) -> TxResult<Scope> {
        self.scopes
            .pop()
            .ok_or_else(|| TransactionError::IllegalState("No transaction in progress".to_string()))
    }

    fn pop_root(&mut self, tx: &Transaction) {
        self.roots.pop();
        if let Some(resumed) = self.roots.last() {
            debug!("Resuming transaction {} after {}", resumed.id, tx.id);
        }
    }

    fn apply_cleanup_policy(&self, failures: Vec<CleanupFailure>) -> TxResult<()> {
        if failures.is_empty() {
            return Ok(());
        }
        match self.config.cleanup_policy {
            CleanupPolicy::Strict => Err(TransactionError::Cleanup(failures)),
            CleanupPolicy::Lenient => {
                for failure in &failures {
                    warn!("Ignoring cleanup failure: {}", failure);
                }
                Ok(())
            }
        }
    }

    /// Run `work` inside a scope for `definition`
    ///
    /// The scope commits when `work` returns `Ok`. When `work` fails, or the
    /// commit fails before the root completed, every scope it left open and
    /// the scope itself are rolled back and the original error is returned.
    pub async fn execute<T, F>(&mut self, definition: TransactionDefinition, work: F) -> TxResult<T>
    where
        F: for<'a> FnOnce(&'a mut TransactionManager) -> BoxFuture<'a, TxResult<T>>,
    {
        let tx = self.begin(definition).await?;

        let result = match work(&mut *self).await {
            Ok(value) => self.commit(&tx).await.map(|_| value),
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.abort(&tx).await;
                Err(e)
            }
        }
    }

    /// Roll back `tx` and everything opened above it, logging failures
    async fn abort(&mut self, tx: &Transaction) {
        if !self.scopes.iter().any(|scope| scope.handle.id == tx.id) {
            return;
        }
        while let Some(top) = self.scopes.last().map(|scope| scope.handle) {
            if let Err(e) = self.rollback(&top).await {
                warn!("Rollback of scope {} failed: {}", top.id, e);
            }
            if top.id == tx.id {
                break;
            }
        }
    }

    /// Connection bound to the current root for `factory`, opened on first use
    pub async fn connection(&mut self, factory: &Arc<dyn ConnectionFactory>) -> TxResult<&mut ConnectionProxy> {
        self.current_root_mut()?
            .resource_mut(factory)
            .get_connection()
            .await
    }

    /// Queue a write for the next flush of the current root
    pub fn defer(&mut self, factory: &Arc<dyn ConnectionFactory>, sql: impl Into<Sql>) -> TxResult<()> {
        self.current_root_mut()?
            .resource_mut(factory)
            .add_statement(sql.into());
        Ok(())
    }

    /// Run a read through the current root's query cache
    pub async fn query(
        &mut self,
        factory: &Arc<dyn ConnectionFactory>,
        sql: impl Into<Sql>,
    ) -> TxResult<Arc<ResultSet>> {
        let sql = sql.into();
        self.current_root_mut()?.query(factory, &sql).await
    }

    /// Flush the current root's deferred writes without completing any scope
    pub async fn process(&mut self) -> TxResult<u64> {
        self.current_root_mut()?.process().await
    }

    /// Take a savepoint over every resource bound to the current root
    pub async fn create_savepoint(&mut self) -> TxResult<CompositeSavepoint> {
        let root = self.current_root_mut()?;
        if !root.is_active() {
            return Err(TransactionError::Savepoint(
                "Savepoints need an active transaction".to_string(),
            ));
        }
        root.create_savepoint().await
    }

    pub async fn rollback_to_savepoint(&mut self, savepoint: &CompositeSavepoint) -> TxResult<()> {
        self.current_root_mut()?.rollback_to_savepoint(savepoint).await
    }

    pub async fn release_savepoint(&mut self, savepoint: &CompositeSavepoint) -> TxResult<()> {
        self.current_root_mut()?.release_savepoint(savepoint).await
    }

    /// Attach a listener to the current root
    pub fn register_listener(&mut self, listener: Arc<dyn TransactionListener>) -> TxResult<()> {
        self.current_root_mut()?.listeners.register(listener);
        Ok(())
    }

    pub fn on_before_process(&mut self, f: impl Fn() + Send + Sync + 'static) -> TxResult<()> {
        self.register_listener(Arc::new(CallbackListener::new().on_before_process(f)))
    }

    pub fn on_after_process(&mut self, f: impl Fn() + Send + Sync + 'static) -> TxResult<()> {
        self.register_listener(Arc::new(CallbackListener::new().on_after_process(f)))
    }

    pub fn on_before_rollback(&mut self, f: impl Fn() + Send + Sync + 'static) -> TxResult<()> {
        self.register_listener(Arc::new(CallbackListener::new().on_before_rollback(f)))
    }

    pub fn on_after_rollback(&mut self, f: impl Fn() + Send + Sync + 'static) -> TxResult<()> {
        self.register_listener(Arc::new(CallbackListener::new().on_after_rollback(f)))
    }

    pub fn on_complete(&mut self, f: impl Fn(Completion) + Send + Sync + 'static) -> TxResult<()> {
        self.register_listener(Arc::new(CallbackListener::new().on_complete(f)))
    }

    /// Per-transaction cache toggle; has no effect when caching is disabled
    /// in the configuration
    pub fn set_query_cache_enabled(&mut self, enabled: bool) -> TxResult<()> {
        self.current_root_mut()?.set_query_cache_enabled(enabled);
        Ok(())
    }

    pub fn query_cache_stats(&self) -> Option<QueryCacheStats> {
        self.roots.last().map(|root| root.cache_stats())
    }

    /// Whether the current root already holds a resource for `factory`
    pub fn has_resource(&self, factory: &Arc<dyn ConnectionFactory>) -> bool {
        self.roots
            .last()
            .map_or(false, |root| root.resource(FactoryKey::of(factory)).is_some())
    }

    /// Whether the current root opened a connection for `factory`
    pub fn has_connection(&self, factory: &Arc<dyn ConnectionFactory>) -> bool {
        self.roots.last().map_or(false, |root| {
            root.resource(FactoryKey::of(factory))
                .map_or(false, |res| res.has_connection())
        })
    }

    /// Number of resources bound to the current root
    pub fn resource_count(&self) -> usize {
        self.roots.last().map_or(0, |root| root.resource_count())
    }

    /// Number of statements queued for `factory` on the current root
    pub fn deferred_count(&self, factory: &Arc<dyn ConnectionFactory>) -> usize {
        self.roots.last().map_or(0, |root| {
            root.resource(FactoryKey::of(factory))
                .map_or(0, |res| res.deferred().len())
        })
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(Arc::new(CoordinatorConfig::default()))
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        if !self.scopes.is_empty() {
            warn!(
                "Transaction manager dropped with {} open scope(s); their connections are released without commit",
                self.scopes.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryDatabase;

    fn setup() -> (TransactionManager, Arc<MemoryDatabase>, Arc<dyn ConnectionFactory>) {
        let db = Arc::new(MemoryDatabase::new("main"));
        let factory: Arc<dyn ConnectionFactory> = db.clone();
        (TransactionManager::default(), db, factory)
    }

    #[tokio::test]
    async fn test_required_starts_active_root() {
        let (mut manager, _, _) = setup();

        let tx = manager.begin(TransactionDefinition::required()).await.unwrap();
        assert!(tx.is_new_transaction());
        assert!(tx.is_active());
        assert_eq!(tx.parent(), None);
        assert_eq!(manager.depth(), 1);

        manager.commit(&tx).await.unwrap();
        assert_eq!(manager.depth(), 0);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_mandatory_without_transaction_fails() {
        let (mut manager, _, _) = setup();
        let result = manager
            .begin(TransactionDefinition::with_propagation(Propagation::Mandatory))
            .await;
        assert!(matches!(result, Err(TransactionError::IllegalState(_))));
        assert_eq!(manager.depth(), 0);
    }

    #[tokio::test]
    async fn test_never_inside_transaction_fails() {
        let (mut manager, _, _) = setup();
        let outer = manager.begin(TransactionDefinition::required()).await.unwrap();

        let result = manager
            .begin(TransactionDefinition::with_propagation(Propagation::Never))
            .await;
        assert!(matches!(result, Err(TransactionError::IllegalState(_))));
        manager.commit(&outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_supports_without_transaction_runs_inactive() {
        let (mut manager, db, factory) = setup();
        let tx = manager
            .begin(TransactionDefinition::with_propagation(Propagation::Supports))
            .await
            .unwrap();
        assert!(!tx.is_active());
        assert!(!manager.is_transaction_active());

        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();
        manager.commit(&tx).await.unwrap();
        assert_eq!(db.committed().len(), 1);
        assert_eq!(db.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_not_supported_suspends_active_root() {
        let (mut manager, db, factory) = setup();
        let outer = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();

        let inner = manager
            .begin(TransactionDefinition::with_propagation(Propagation::NotSupported))
            .await
            .unwrap();
        assert!(inner.is_new_transaction());
        assert!(!inner.is_active());
        assert_eq!(manager.resource_count(), 0);
        manager.commit(&inner).await.unwrap();

        assert_eq!(manager.deferred_count(&factory), 1);
        manager.commit(&outer).await.unwrap();
        assert_eq!(db.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_scopes_complete_in_reverse_order() {
        let (mut manager, _, _) = setup();
        let outer = manager.begin(TransactionDefinition::required()).await.unwrap();
        let inner = manager.begin(TransactionDefinition::required()).await.unwrap();

        assert!(matches!(
            manager.commit(&outer).await,
            Err(TransactionError::IllegalState(_))
        ));
        manager.commit(&inner).await.unwrap();
        manager.commit(&outer).await.unwrap();
    }

    #[tokio::test]
    async fn test_joined_rollback_marks_root_rollback_only() {
        let (mut manager, db, factory) = setup();
        let outer = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();

        let inner = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.rollback(&inner).await.unwrap();
        assert!(manager.is_rollback_only());

        assert!(matches!(
            manager.commit(&outer).await,
            Err(TransactionError::UnexpectedRollback)
        ));
        assert_eq!(manager.depth(), 0);
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_flush_failure_leaves_scope_open() {
        let (mut manager, db, factory) = setup();
        db.fail_statement("INSERT INTO t VALUES (1)");
        let tx = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();

        assert!(manager.commit(&tx).await.is_err());
        assert_eq!(manager.current().map(|t| t.id()), Some(tx.id()));

        manager.rollback(&tx).await.unwrap();
        assert_eq!(manager.depth(), 0);
        assert_eq!(db.close_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_after_flush_failure_rolls_back() {
        let (mut manager, db, factory) = setup();
        db.fail_statement("INSERT INTO t VALUES (2)");
        let tx = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (2)").unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (3)").unwrap();

        assert!(matches!(
            manager.commit(&tx).await,
            Err(TransactionError::Execution { .. })
        ));
        assert!(manager.is_rollback_only());

        assert!(matches!(
            manager.commit(&tx).await,
            Err(TransactionError::UnexpectedRollback)
        ));
        assert_eq!(manager.depth(), 0);
        assert!(db.committed().is_empty());
        assert_eq!(db.commit_count(), 0);
        assert_eq!(db.close_count(), 1);
    }

    #[tokio::test]
    async fn test_strict_policy_reports_cleanup_failures() {
        let (mut manager, db, factory) = setup();
        db.fail_commits(true);
        let tx = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();

        let err = manager.commit(&tx).await.unwrap_err();
        assert!(matches!(err, TransactionError::Cleanup(ref f) if f.len() == 1));
        assert_eq!(manager.depth(), 0);
    }

    #[tokio::test]
    async fn test_lenient_policy_swallows_cleanup_failures() {
        let db = Arc::new(MemoryDatabase::new("main"));
        let factory: Arc<dyn ConnectionFactory> = db.clone();
        let config = CoordinatorConfig::new().with_cleanup_policy(CleanupPolicy::Lenient);
        let mut manager = TransactionManager::new(Arc::new(config));
        db.fail_commits(true);

        let tx = manager.begin(TransactionDefinition::required()).await.unwrap();
        manager.defer(&factory, "INSERT INTO t VALUES (1)").unwrap();
        manager.commit(&tx).await.unwrap();
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_resource_access_needs_a_scope() {
        let (mut manager, _, factory) = setup();
        assert!(matches!(
            manager.defer(&factory, "INSERT INTO t VALUES (1)"),
            Err(TransactionError::IllegalState(_))
        ));
        assert!(manager.connection(&factory).await.is_err());
    }
}
