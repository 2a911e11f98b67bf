//! Connection Backends
//!
//! Concrete [`ConnectionFactory`](crate::connection::ConnectionFactory)
//! implementations: an in-memory driver for tests and demos, and PostgreSQL
//! through sqlx.

pub mod memory;
pub mod postgres;

pub use memory::{JournalEntry, MemoryConnection, MemoryDatabase};
pub use postgres::{PgConnectionFactory, PgFactoryConfig, PostgresConnection};
