//! Transaction Definitions
//!
//! A [`TransactionDefinition`] is the immutable descriptor a call site hands
//! to the manager: how to relate to an already-running transaction, which
//! isolation level to request and whether the work is read-only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TransactionError, TxResult};

/// How a new unit of work relates to the transaction already in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the active transaction, or start a new one
    #[default]
    Required,
    /// Join whatever is current, or run without a transaction
    Supports,
    /// Join the active transaction; fail if there is none
    Mandatory,
    /// Always start a new transaction, suspending the current one
    RequiresNew,
    /// Run without a transaction, suspending an active one
    NotSupported,
    /// Run without a transaction; fail if one is active
    Never,
    /// Take a savepoint in the active transaction, or start a new one
    Nested,
}

impl Propagation {
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::Supports,
        Propagation::Mandatory,
        Propagation::RequiresNew,
        Propagation::NotSupported,
        Propagation::Never,
        Propagation::Nested,
    ];

    /// Resolve a numeric propagation id (0 = REQUIRED .. 6 = NESTED)
    pub fn from_id(id: i32) -> TxResult<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| {
                TransactionError::Configuration(format!("Unknown propagation id: {}", id))
            })
    }

    pub fn id(&self) -> i32 {
        match self {
            Propagation::Required => 0,
            Propagation::Supports => 1,
            Propagation::Mandatory => 2,
            Propagation::RequiresNew => 3,
            Propagation::NotSupported => 4,
            Propagation::Never => 5,
            Propagation::Nested => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
            Propagation::Nested => "NESTED",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| TransactionError::Configuration(format!("Unknown propagation: {}", s)))
    }
}

/// Transaction isolation levels
///
/// `Default` leaves the connection's own isolation level untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Do not override the resource default
    #[default]
    Default,
    /// Read Uncommitted - lowest isolation level
    ReadUncommitted,
    /// Read Committed - default PostgreSQL isolation level
    ReadCommitted,
    /// Repeatable Read - stronger consistency guarantees
    RepeatableRead,
    /// Serializable - highest isolation level
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }

    /// Resolve a classic driver isolation constant (0, 1, 2, 4, 8)
    pub fn from_id(id: i32) -> TxResult<Self> {
        match id {
            0 => Ok(IsolationLevel::Default),
            1 => Ok(IsolationLevel::ReadUncommitted),
            2 => Ok(IsolationLevel::ReadCommitted),
            4 => Ok(IsolationLevel::RepeatableRead),
            8 => Ok(IsolationLevel::Serializable),
            _ => Err(TransactionError::Configuration(format!(
                "Unknown isolation level id: {}",
                id
            ))),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            IsolationLevel::Default => 0,
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::Serializable => 8,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, IsolationLevel::Default)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql().unwrap_or("DEFAULT"))
    }
}

impl FromStr for IsolationLevel {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['_', '-'], " ").as_str() {
            "DEFAULT" => Ok(IsolationLevel::Default),
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(TransactionError::Configuration(format!(
                "Unknown isolation level: {}",
                s
            ))),
        }
    }
}

/// Immutable propagation/isolation/read-only descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransactionDefinition {
    propagation: Propagation,
    isolation_level: IsolationLevel,
    read_only: bool,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation, isolation_level: IsolationLevel, read_only: bool) -> Self {
        Self {
            propagation,
            isolation_level,
            read_only,
        }
    }

    pub fn builder() -> TransactionDefinitionBuilder {
        TransactionDefinitionBuilder::default()
    }

    pub fn required() -> Self {
        Self::with_propagation(Propagation::Required)
    }

    pub fn requires_new() -> Self {
        Self::with_propagation(Propagation::RequiresNew)
    }

    pub fn nested() -> Self {
        Self::with_propagation(Propagation::Nested)
    }

    pub fn read_only() -> Self {
        Self::new(Propagation::Required, IsolationLevel::Default, true)
    }

    pub fn with_propagation(propagation: Propagation) -> Self {
        Self::new(propagation, IsolationLevel::Default, false)
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Builder for [`TransactionDefinition`]
#[derive(Debug, Clone, Default)]
pub struct TransactionDefinitionBuilder {
    definition: TransactionDefinition,
}

impl TransactionDefinitionBuilder {
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.definition.propagation = propagation;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.definition.isolation_level = level;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.definition.read_only = read_only;
        self
    }

    /// Set propagation from a numeric id, failing on unknown ids
    pub fn propagation_id(self, id: i32) -> TxResult<Self> {
        Ok(self.propagation(Propagation::from_id(id)?))
    }

    /// Set isolation from a numeric driver constant, failing on unknown ids
    pub fn isolation_id(self, id: i32) -> TxResult<Self> {
        Ok(self.isolation_level(IsolationLevel::from_id(id)?))
    }

    pub fn build(self) -> TransactionDefinition {
        self.definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::Default.as_sql(), None);
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), Some("READ UNCOMMITTED"));
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), Some("READ COMMITTED"));
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), Some("REPEATABLE READ"));
        assert_eq!(IsolationLevel::Serializable.as_sql(), Some("SERIALIZABLE"));
    }

    #[test]
    fn test_isolation_level_ids() {
        for level in [
            IsolationLevel::Default,
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(IsolationLevel::from_id(level.id()).unwrap(), level);
        }
        assert!(matches!(
            IsolationLevel::from_id(3),
            Err(TransactionError::Configuration(_))
        ));
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_propagation_parse_and_ids() {
        assert_eq!("requires_new".parse::<Propagation>().unwrap(), Propagation::RequiresNew);
        assert_eq!("NOT-SUPPORTED".parse::<Propagation>().unwrap(), Propagation::NotSupported);
        for p in Propagation::ALL {
            assert_eq!(Propagation::from_id(p.id()).unwrap(), p);
            assert_eq!(p.to_string().parse::<Propagation>().unwrap(), p);
        }
        assert!(matches!(Propagation::from_id(7), Err(TransactionError::Configuration(_))));
        assert!(matches!(Propagation::from_id(-1), Err(TransactionError::Configuration(_))));
        assert!("SOMETIMES".parse::<Propagation>().is_err());
    }

    #[test]
    fn test_definition_defaults() {
        let def = TransactionDefinition::default();
        assert_eq!(def.propagation(), Propagation::Required);
        assert!(def.isolation_level().is_default());
        assert!(!def.is_read_only());
    }

    #[test]
    fn test_definition_builder() {
        let def = TransactionDefinition::builder()
            .propagation(Propagation::Nested)
            .isolation_level(IsolationLevel::Serializable)
            .read_only(true)
            .build();

        assert_eq!(def.propagation(), Propagation::Nested);
        assert_eq!(def.isolation_level(), IsolationLevel::Serializable);
        assert!(def.is_read_only());

        let by_id = TransactionDefinition::builder()
            .propagation_id(3)
            .and_then(|b| b.isolation_id(2))
            .unwrap()
            .build();
        assert_eq!(by_id.propagation(), Propagation::RequiresNew);
        assert_eq!(by_id.isolation_level(), IsolationLevel::ReadCommitted);

        assert!(TransactionDefinition::builder().propagation_id(42).is_err());
    }
}
