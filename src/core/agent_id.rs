use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a clearing member (bank agent) in the network.
///
/// Identifiers order lexicographically; that ordering is the tie-break
/// used when intents of the same category are applied in a round.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::core::agent_id::AgentId;
///
/// let a = AgentId::new("BANK-000");
/// let b = AgentId::bank(1);
/// assert!(a < b);
/// assert_eq!(b.as_str(), "BANK-001");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Conventional identifier for the `index`-th generated bank.
    pub fn bank(index: usize) -> Self {
        Self(format!("BANK-{:03}", index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
