//! In-memory backend
//!
//! A driver that keeps writes in memory instead of talking to a server. It
//! models auto-commit, pending versus committed writes and savepoints, and
//! records every driver call in a journal. Failures can be injected per
//! statement text, per connect and per commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionFactory, PreparedStatement};
use crate::definition::IsolationLevel;
use crate::error::{DriverError, DriverResult};
use crate::value::{DatabaseValue, ResultSet, Sql};

/// A recorded driver call
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Connect,
    SetAutoCommit(bool),
    SetReadOnly(bool),
    SetIsolation(IsolationLevel),
    Prepare(String),
    Execute(String),
    Query(String),
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    Close,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<Sql>,
    journal: Vec<JournalEntry>,
    failing_statements: HashSet<String>,
    failing_connects: usize,
    failing_commits: bool,
    query_results: HashMap<String, ResultSet>,
    open_statements: usize,
}

impl MemoryState {
    fn count(&self, pred: impl Fn(&JournalEntry) -> bool) -> usize {
        self.journal.iter().filter(|e| pred(e)).count()
    }
}

/// In-memory database acting as a connection factory
pub struct MemoryDatabase {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Make every execution of this statement text fail
    pub fn fail_statement(&self, text: impl Into<String>) {
        self.state.lock().failing_statements.insert(text.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_statements.clear();
        state.failing_connects = 0;
        state.failing_commits = false;
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().failing_commits = fail;
    }

    /// Rows returned for queries with this exact text
    pub fn stub_query(&self, text: impl Into<String>, rows: ResultSet) {
        self.state.lock().query_results.insert(text.into(), rows);
    }

    /// Durable writes, in commit order
    pub fn committed(&self) -> Vec<Sql> {
        self.state.lock().committed.clone()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Connect))
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Close))
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Commit))
    }

    pub fn rollback_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Rollback))
    }

    /// Successful statement executions
    pub fn executed_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Execute(_)))
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().count(|e| matches!(e, JournalEntry::Query(_)))
    }

    /// Prepared statements not yet closed
    pub fn open_statements(&self) -> usize {
        self.state.lock().open_statements
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> DriverResult<Box<dyn Connection>> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DriverError::Io(format!("connection to '{}' refused", self.name)));
        }
        state.journal.push(JournalEntry::Connect);
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            auto_commit: true,
            pending: Vec::new(),
            savepoints: Vec::new(),
            closed: false,
        }))
    }
}

/// Connection to a [`MemoryDatabase`]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    auto_commit: bool,
    pending: Vec<Sql>,
    savepoints: Vec<(String, usize)>,
    closed: bool,
}

impl MemoryConnection {
    fn record(&self, entry: JournalEntry) {
        self.state.lock().journal.push(entry);
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    fn apply(&mut self, sql: Sql) -> DriverResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.failing_statements.contains(&sql.text) {
            return Err(DriverError::Driver(format!("statement rejected: {}", sql.text)));
        }
        state.journal.push(JournalEntry::Execute(sql.text.clone()));
        if self.auto_commit {
            state.committed.push(sql);
        } else {
            self.pending.push(sql);
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.state.lock().committed.extend(pending);
        self.savepoints.clear();
    }

    fn savepoint_index(&self, name: &str) -> DriverResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| DriverError::Driver(format!("savepoint {} does not exist", name)))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()> {
        self.check_open()?;
        self.record(JournalEntry::SetAutoCommit(auto_commit));
        // Switching auto-commit back on commits the open transaction.
        if auto_commit && !self.auto_commit {
            self.flush_pending();
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_read_only(&mut self, read_only: bool) -> DriverResult<()> {
        self.check_open()?;
        self.record(JournalEntry::SetReadOnly(read_only));
        Ok(())
    }

    async fn set_transaction_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        self.check_open()?;
        self.record(JournalEntry::SetIsolation(level));
        Ok(())
    }

    async fn prepare<'c>(&'c mut self, sql: &str) -> DriverResult<Box<dyn PreparedStatement + 'c>> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            state.journal.push(JournalEntry::Prepare(sql.to_string()));
            state.open_statements += 1;
        }
        Ok(Box::new(MemoryStatement {
            conn: self,
            text: sql.to_string(),
        }))
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.check_open()?;
        if self.auto_commit {
            return Err(DriverError::Driver("cannot commit in auto-commit mode".to_string()));
        }
        if self.state.lock().failing_commits {
            return Err(DriverError::Driver("commit rejected".to_string()));
        }
        self.record(JournalEntry::Commit);
        self.flush_pending();
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.check_open()?;
        if self.auto_commit {
            return Err(DriverError::Driver("cannot roll back in auto-commit mode".to_string()));
        }
        self.record(JournalEntry::Rollback);
        self.pending.clear();
        self.savepoints.clear();
        Ok(())
    }

    async fn create_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.check_open()?;
        if self.auto_commit {
            return Err(DriverError::Driver("savepoints need an open transaction".to_string()));
        }
        self.record(JournalEntry::Savepoint(name.to_string()));
        self.savepoints.push((name.to_string(), self.pending.len()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.check_open()?;
        let index = self.savepoint_index(name)?;
        self.record(JournalEntry::RollbackToSavepoint(name.to_string()));
        let mark = self.savepoints[index].1;
        self.pending.truncate(mark);
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> DriverResult<()> {
        self.check_open()?;
        let index = self.savepoint_index(name)?;
        self.record(JournalEntry::ReleaseSavepoint(name.to_string()));
        self.savepoints.truncate(index);
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.check_open()?;
        self.record(JournalEntry::Close);
        self.pending.clear();
        self.savepoints.clear();
        self.closed = true;
        Ok(())
    }
}

struct MemoryStatement<'c> {
    conn: &'c mut MemoryConnection,
    text: String,
}

#[async_trait]
impl<'c> PreparedStatement for MemoryStatement<'c> {
    async fn execute(&mut self, params: &[DatabaseValue]) -> DriverResult<u64> {
        self.conn
            .apply(Sql::with_params(self.text.clone(), params.to_vec()))?;
        Ok(1)
    }

    async fn query(&mut self, _params: &[DatabaseValue]) -> DriverResult<ResultSet> {
        self.conn.check_open()?;
        let mut state = self.conn.state.lock();
        if state.failing_statements.contains(&self.text) {
            return Err(DriverError::Driver(format!("query rejected: {}", self.text)));
        }
        state.journal.push(JournalEntry::Query(self.text.clone()));
        Ok(state.query_results.get(&self.text).cloned().unwrap_or_default())
    }

    async fn close(self: Box<Self>) -> DriverResult<()> {
        let mut state = self.conn.state.lock();
        state.open_statements = state.open_statements.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_commit_writes_are_durable() {
        let db = MemoryDatabase::new("db");
        let mut conn = db.connect().await.unwrap();

        conn.execute(&Sql::new("INSERT INTO t VALUES ($1)").bind(1)).await.unwrap();
        assert_eq!(db.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_savepoints_truncate_pending_work() {
        let db = MemoryDatabase::new("db");
        let mut conn = db.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();

        conn.execute(&Sql::new("INSERT INTO a VALUES (1)")).await.unwrap();
        conn.create_savepoint("SAVEPOINT_1").await.unwrap();
        conn.execute(&Sql::new("INSERT INTO b VALUES (2)")).await.unwrap();
        conn.rollback_to_savepoint("SAVEPOINT_1").await.unwrap();
        conn.commit().await.unwrap();

        let committed = db.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].text, "INSERT INTO a VALUES (1)");
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_an_error() {
        let db = MemoryDatabase::new("db");
        let mut conn = db.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();

        assert!(conn.rollback_to_savepoint("SAVEPOINT_9").await.is_err());
        assert!(conn.release_savepoint("SAVEPOINT_9").await.is_err());
    }

    #[tokio::test]
    async fn test_close_discards_pending_work() {
        let db = MemoryDatabase::new("db");
        let mut conn = db.connect().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        conn.execute(&Sql::new("INSERT INTO a VALUES (1)")).await.unwrap();

        conn.close().await.unwrap();
        assert!(db.committed().is_empty());
        assert!(matches!(conn.close().await, Err(DriverError::Closed)));
    }

    #[tokio::test]
    async fn test_stubbed_query_results() {
        let db = MemoryDatabase::new("db");
        db.stub_query(
            "SELECT name FROM users",
            ResultSet::new(vec!["name".to_string()], vec![vec!["alice".into()]]),
        );
        let mut conn = db.connect().await.unwrap();

        let rows = conn.query(&Sql::new("SELECT name FROM users")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.query_count(), 1);
        assert_eq!(db.open_statements(), 0);
    }
}
