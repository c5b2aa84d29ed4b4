//! Transaction isolation levels.
//!
//! The set of levels a caller may request when a scope begins its own
//! transaction. Providers map each level onto what their engine offers and
//! reject the ones they cannot honour.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Let the store pick its default level.
    #[default]
    Unspecified,

    /// Dirty reads are allowed.
    ReadUncommitted,

    /// Each read sees the latest committed data.
    ReadCommitted,

    /// Rows read once stay stable for the rest of the transaction.
    RepeatableRead,

    /// Transactions behave as if run one after another.
    Serializable,

    /// All reads see a consistent snapshot from transaction start.
    Snapshot,

    /// Pending changes from more highly isolated transactions cannot be
    /// overwritten. Hardly any engine implements this.
    Chaos,
}

impl IsolationLevel {
    /// Every level, in increasing order of declaration.
    pub const ALL: [IsolationLevel; 7] = [
        IsolationLevel::Unspecified,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
        IsolationLevel::Snapshot,
        IsolationLevel::Chaos,
    ];

    /// Check if this level permits reading uncommitted data of others.
    pub fn allows_dirty_reads(&self) -> bool {
        matches!(self, IsolationLevel::ReadUncommitted | IsolationLevel::Chaos)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Unspecified => write!(f, "UNSPECIFIED"),
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
            IsolationLevel::Snapshot => write!(f, "SNAPSHOT"),
            IsolationLevel::Chaos => write!(f, "CHAOS"),
        }
    }
}

/// Parse isolation level from string (SQL syntax or identifier spelling).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "" | "UNSPECIFIED" | "DEFAULT" => Ok(IsolationLevel::Unspecified),
            "READUNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READCOMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLEREAD" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            "SNAPSHOT" => Ok(IsolationLevel::Snapshot),
            "CHAOS" => Ok(IsolationLevel::Chaos),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolation() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::Unspecified);
    }

    #[test]
    fn test_allows_dirty_reads() {
        assert!(IsolationLevel::ReadUncommitted.allows_dirty_reads());
        assert!(!IsolationLevel::Serializable.allows_dirty_reads());
    }

    #[test]
    fn test_parse_isolation() {
        assert_eq!(
            "READ COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "ReadUncommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            "snapshot".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Snapshot
        );
        assert!("eventual".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for level in IsolationLevel::ALL {
            assert_eq!(level.to_string().parse::<IsolationLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(json, "\"repeatable_read\"");
        let level: IsolationLevel = serde_json::from_str("\"serializable\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }
}
