//! Transaction-scoped query cache
//!
//! Lives on a root transaction and dies with it. Results are shared as
//! `Arc<ResultSet>`, so two identical reads in one transaction hand back the
//! same allocation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::FactoryKey;
use crate::value::{ResultSet, Sql};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub(crate) struct QueryCache {
    enabled: bool,
    entries: HashMap<(FactoryKey, String), Arc<ResultSet>>,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turning the cache off also drops everything cached so far
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.entries.clear();
        }
        self.enabled = enabled;
    }

    pub fn get(&mut self, factory: FactoryKey, sql: &Sql) -> Option<Arc<ResultSet>> {
        if !self.enabled {
            return None;
        }
        match self.entries.get(&(factory, sql.cache_key())) {
            Some(rows) => {
                self.hits += 1;
                Some(rows.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, factory: FactoryKey, sql: &Sql, rows: Arc<ResultSet>) {
        if self.enabled {
            self.entries.insert((factory, sql.cache_key()), rows);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}
