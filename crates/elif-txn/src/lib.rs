//! # elif-txn: Transaction Coordination for elif.rs
//!
//! Shares one logical transaction across independent call sites and across
//! one or more connection factories, with propagation rules, savepoint-based
//! partial rollback, deferred statement execution and a transaction-scoped
//! query cache.
//!
//! A [`TransactionManager`] holds the open scopes of one execution context.
//! Call sites begin a scope with a [`TransactionDefinition`], touch
//! connection factories through the manager, and complete the scope with
//! `commit` or `rollback`; only the scope that started a root transaction
//! actually commits or rolls back the underlying connections.

pub mod backends;
pub mod cache;
pub mod config;
pub mod connection;
pub mod definition;
pub mod error;
pub mod listener;
pub mod manager;
pub mod proxy;
pub mod resource;
pub mod savepoint;
pub mod transaction;
pub mod value;

// Re-export core traits and types
pub use cache::QueryCacheStats;
pub use config::{CleanupPolicy, CoordinatorConfig, DeferredQueueMode};
pub use connection::{Connection, ConnectionFactory, FactoryKey, PreparedStatement};
pub use definition::{IsolationLevel, Propagation, TransactionDefinition, TransactionDefinitionBuilder};
pub use error::{
    CleanupFailure, CleanupStep, ConfigError, DriverError, DriverResult, TransactionError, TxResult,
};
pub use listener::{CallbackListener, Completion, TransactionListener};
pub use manager::TransactionManager;
pub use proxy::ConnectionProxy;
pub use resource::{DeferredQueue, TransactionResource};
pub use savepoint::{CompositeSavepoint, ResourceId, ResourceSavepoint, TransactionId};
pub use transaction::Transaction;
pub use value::{DatabaseValue, ResultSet, Sql, StatementKey};
