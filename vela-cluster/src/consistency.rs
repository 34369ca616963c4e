//! Read consistency levels and quorum resolution
//!
//! A consistency level is chosen per query. For every shard it resolves,
//! together with the shard's replication factor `R`, into the number of
//! replica responses the read must collect and how disagreement between
//! those responses is settled:
//!
//! ```text
//! all       -> R
//! majority  -> floor(R / 2) + 1
//! quorum    -> ceil(R / 2)
//! none      -> 1
//! N         -> min(N, R), N >= 1
//! ```

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Caller-selected read consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    /// Every reachable replica must answer
    All,
    /// More than half of the replicas
    Majority,
    /// Half of the replicas, rounded up
    Quorum,
    /// First responder wins
    None,
    /// Explicit number of replicas
    Factor(usize),
}

impl Default for ConsistencyLevel {
    fn default() -> Self {
        ConsistencyLevel::Factor(1)
    }
}

impl ConsistencyLevel {
    /// Get level name for metrics and status reporting
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyLevel::All => f.write_str("all"),
            ConsistencyLevel::Majority => f.write_str("majority"),
            ConsistencyLevel::Quorum => f.write_str("quorum"),
            ConsistencyLevel::None => f.write_str("none"),
            ConsistencyLevel::Factor(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for ConsistencyLevel {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "all" => Ok(ConsistencyLevel::All),
            "majority" => Ok(ConsistencyLevel::Majority),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "none" => Ok(ConsistencyLevel::None),
            other => match other.parse::<i64>() {
                Ok(n) if n >= 1 => Ok(ConsistencyLevel::Factor(n as usize)),
                Ok(n) => Err(ClusterError::InvalidConsistency(format!(
                    "factor must be a positive integer, got {}",
                    n
                ))),
                Err(_) => Err(ClusterError::InvalidConsistency(format!(
                    "expected one of all, majority, quorum, none or a positive integer, got '{}'",
                    s
                ))),
            },
        }
    }
}

impl Serialize for ConsistencyLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ConsistencyLevel::Factor(n) => serializer.serialize_u64(*n as u64),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ConsistencyLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Factor(i64),
            Named(String),
        }

        let level = match Raw::deserialize(deserializer)? {
            Raw::Factor(n) if n >= 1 => Ok(ConsistencyLevel::Factor(n as usize)),
            Raw::Factor(n) => Err(ClusterError::InvalidConsistency(format!(
                "factor must be a positive integer, got {}",
                n
            ))),
            Raw::Named(s) => s.parse(),
        };
        level.map_err(serde::de::Error::custom)
    }
}

/// How responses of several replicas of one shard are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Single response used as-is
    PassThrough,
    /// Union by point id, newest version wins
    LatestVersion,
}

/// Resolved per-shard read requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadQuorum {
    /// Replica responses to collect before the shard is complete
    pub required_acks: usize,
    /// Keep waiting for every targeted replica instead of stopping at quorum
    pub await_all: bool,
    pub policy: ConflictPolicy,
}

/// Resolve a consistency level against a replication factor.
///
/// `replication_factor` is clamped to at least one; a shard without any
/// replica is rejected earlier during planning.
pub fn resolve(level: ConsistencyLevel, replication_factor: usize) -> Result<ReadQuorum> {
    let r = replication_factor.max(1);
    let required_acks = match level {
        ConsistencyLevel::All => r,
        ConsistencyLevel::Majority => r / 2 + 1,
        ConsistencyLevel::Quorum => r.div_ceil(2),
        ConsistencyLevel::None => 1,
        ConsistencyLevel::Factor(0) => {
            return Err(ClusterError::InvalidConsistency(
                "factor must be a positive integer, got 0".to_string(),
            ))
        }
        ConsistencyLevel::Factor(n) => n.min(r),
    };

    let policy = if required_acks == 1 {
        ConflictPolicy::PassThrough
    } else {
        ConflictPolicy::LatestVersion
    };

    Ok(ReadQuorum {
        required_acks,
        await_all: matches!(level, ConsistencyLevel::All) || required_acks == r,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acks(level: ConsistencyLevel, r: usize) -> usize {
        resolve(level, r).unwrap().required_acks
    }

    #[test]
    fn test_majority_and_quorum_formula() {
        assert_eq!(acks(ConsistencyLevel::Majority, 2), 2);
        assert_eq!(acks(ConsistencyLevel::Quorum, 2), 1);
        assert_eq!(acks(ConsistencyLevel::Majority, 3), 2);
        assert_eq!(acks(ConsistencyLevel::Quorum, 3), 2);
        assert_eq!(acks(ConsistencyLevel::Majority, 4), 3);
        assert_eq!(acks(ConsistencyLevel::Quorum, 4), 2);
    }

    #[test]
    fn test_quorum_never_exceeds_majority() {
        for r in 1..=16 {
            let majority = acks(ConsistencyLevel::Majority, r);
            let quorum = acks(ConsistencyLevel::Quorum, r);
            if r % 2 == 0 {
                assert!(quorum < majority, "r={}", r);
            } else {
                assert_eq!(quorum, majority, "r={}", r);
            }
            assert!((1..=r).contains(&quorum));
            assert!((1..=r).contains(&majority));
        }
    }

    #[test]
    fn test_all_and_none() {
        for r in 1..=5 {
            assert_eq!(acks(ConsistencyLevel::All, r), r);
            assert_eq!(acks(ConsistencyLevel::None, r), 1);
        }
        assert!(resolve(ConsistencyLevel::All, 3).unwrap().await_all);
        assert!(!resolve(ConsistencyLevel::None, 3).unwrap().await_all);
    }

    #[test]
    fn test_factor_is_clamped() {
        assert_eq!(acks(ConsistencyLevel::Factor(1), 3), 1);
        assert_eq!(acks(ConsistencyLevel::Factor(2), 3), 2);
        assert_eq!(acks(ConsistencyLevel::Factor(10), 3), 3);
        assert!(matches!(
            resolve(ConsistencyLevel::Factor(0), 3),
            Err(ClusterError::InvalidConsistency(_))
        ));
    }

    #[test]
    fn test_policy_follows_required_acks() {
        assert_eq!(
            resolve(ConsistencyLevel::None, 2).unwrap().policy,
            ConflictPolicy::PassThrough
        );
        assert_eq!(
            resolve(ConsistencyLevel::Quorum, 2).unwrap().policy,
            ConflictPolicy::PassThrough
        );
        assert_eq!(
            resolve(ConsistencyLevel::Majority, 2).unwrap().policy,
            ConflictPolicy::LatestVersion
        );
        assert_eq!(
            resolve(ConsistencyLevel::All, 1).unwrap().policy,
            ConflictPolicy::PassThrough
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("all".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::All);
        assert_eq!(
            " Majority ".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::Majority
        );
        assert_eq!("quorum".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert_eq!("none".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::None);
        assert_eq!("3".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Factor(3));

        for bad in ["0", "-2", "most", "", "1.5"] {
            assert!(
                matches!(
                    bad.parse::<ConsistencyLevel>(),
                    Err(ClusterError::InvalidConsistency(_))
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_serde_json() {
        let level: ConsistencyLevel = serde_json::from_str("\"quorum\"").unwrap();
        assert_eq!(level, ConsistencyLevel::Quorum);
        let level: ConsistencyLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, ConsistencyLevel::Factor(2));
        assert!(serde_json::from_str::<ConsistencyLevel>("0").is_err());

        assert_eq!(serde_json::to_string(&ConsistencyLevel::All).unwrap(), "\"all\"");
        assert_eq!(serde_json::to_string(&ConsistencyLevel::Factor(4)).unwrap(), "4");
    }
}
