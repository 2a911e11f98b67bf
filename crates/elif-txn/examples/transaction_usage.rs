//! Transaction Usage Examples
//!
//! Walks through propagation, deferred writes, nested savepoints and the
//! scoped query cache against two in-memory databases.
//!
//! Run with `RUST_LOG=elif_txn=debug` to see every lifecycle step.

use std::sync::Arc;

use elif_txn::backends::memory::MemoryDatabase;
use elif_txn::{
    ConnectionFactory, CoordinatorConfig, Sql, TransactionDefinition, TransactionError,
    TransactionManager, TxResult,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let orders_db = Arc::new(MemoryDatabase::new("orders"));
    let audit_db = Arc::new(MemoryDatabase::new("audit"));
    let orders: Arc<dyn ConnectionFactory> = orders_db.clone();
    let audit: Arc<dyn ConnectionFactory> = audit_db.clone();

    let config = Arc::new(CoordinatorConfig::from_env()?);
    let mut manager = TransactionManager::new(config);

    // Example 1: one transaction spanning two databases
    place_order(&mut manager, &orders, &audit, 1, 250).await?;
    println!("orders committed: {}", orders_db.committed().len());
    println!("audit committed:  {}", audit_db.committed().len());

    // Example 2: a nested scope that fails only undoes its own work
    let outer = manager.begin(TransactionDefinition::required()).await?;
    manager.defer(&orders, Sql::new("INSERT INTO orders (id, total) VALUES ($1, $2)").bind(2).bind(90))?;
    manager.process().await?;

    let nested = manager.begin(TransactionDefinition::nested()).await?;
    manager.defer(&orders, Sql::new("UPDATE stock SET qty = qty - $1").bind(90))?;
    manager.process().await?;
    manager.rollback(&nested).await?;

    manager.commit(&outer).await?;
    println!("orders committed after nested rollback: {}", orders_db.committed().len());

    // Example 3: the scoped helper rolls back on error
    let factory = orders.clone();
    let result = manager
        .execute(TransactionDefinition::required(), move |tm| {
            Box::pin(async move {
                tm.defer(&factory, "INSERT INTO orders (id, total) VALUES (3, 0)")?;
                Err::<(), _>(TransactionError::IllegalState("empty order".to_string()))
            })
        })
        .await;
    println!("rejected order: {}", result.is_err());

    // Example 4: identical reads within one transaction share a result
    let tx = manager.begin(TransactionDefinition::read_only()).await?;
    let first = manager.query(&orders, Sql::new("SELECT * FROM orders WHERE id = $1").bind(1)).await?;
    let second = manager.query(&orders, Sql::new("SELECT * FROM orders WHERE id = $1").bind(1)).await?;
    println!("cached read reused: {}", Arc::ptr_eq(&first, &second));
    manager.commit(&tx).await?;

    Ok(())
}

async fn place_order(
    manager: &mut TransactionManager,
    orders: &Arc<dyn ConnectionFactory>,
    audit: &Arc<dyn ConnectionFactory>,
    id: i32,
    total: i32,
) -> TxResult<()> {
    let tx = manager.begin(TransactionDefinition::required()).await?;
    manager.on_complete(move |completion| println!("order {} {}", id, completion))?;

    manager.defer(orders, Sql::new("INSERT INTO orders (id, total) VALUES ($1, $2)").bind(id).bind(total))?;
    manager.defer(audit, Sql::new("INSERT INTO audit_log (order_id) VALUES ($1)").bind(id))?;

    if let Err(e) = manager.commit(&tx).await {
        if manager.current().map(|t| t.id()) == Some(tx.id()) {
            manager.rollback(&tx).await?;
        }
        return Err(e);
    }
    Ok(())
}
