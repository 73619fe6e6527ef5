//! Error kinds of the clearing core.
//!
//! Only [`ConfigError`] is fatal, and only before the first round. Every
//! other kind is absorbed inside a round and recorded.

use crate::core::agent_id::AgentId;
use crate::core::intent::ActionKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("weights for {group} must be non-negative and not all zero")]
    InvalidWeights { group: &'static str },

    #[error("margin rate bounds inverted: min {min} > max {max}")]
    RateBoundsInverted { min: Decimal, max: Decimal },

    #[error("initial margin rate {rate} outside [{min}, {max}]")]
    InitialRateOutOfBounds {
        rate: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("at least 2 banks are required, got {0}")]
    TooFewBanks(usize),

    #[error("failed to read configuration: {0}")]
    Io(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Reason an ingress submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    Malformed,
    MissingField,
    UnknownActionType,
    StepMismatch,
    UnknownAgent,
    AgentDefaulted,
    InvalidPayload,
    DuplicateIntent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("intent rejected ({code:?}): {detail}")]
pub struct ValidationError {
    pub code: RejectionCode,
    pub detail: String,
}

impl ValidationError {
    pub fn new(code: RejectionCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// A candidate action the agent's balance sheet cannot fund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{agent} cannot fund {action}: requires {required}, available {available}")]
pub struct CapitalError {
    pub agent: AgentId,
    pub action: ActionKind,
    pub required: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum StateError {
    #[error("stale snapshot: expected step {expected}, found {found}")]
    Stale { expected: u64, found: u64 },

    #[error("agent {0} missing from snapshot")]
    MissingAgent(AgentId),

    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{agent} exceeded decision budget at step {step}: {elapsed:?} > {budget:?}")]
pub struct TimeoutDegradation {
    pub agent: AgentId,
    pub step: u64,
    pub elapsed: Duration,
    pub budget: Duration,
}

/// An agent whose decision for the round was replaced by a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum Degradation {
    #[error("{agent}: {error}")]
    State { agent: AgentId, error: StateError },

    #[error(transparent)]
    Timeout(TimeoutDegradation),
}

impl Degradation {
    pub fn agent(&self) -> &AgentId {
        match self {
            Degradation::State { agent, .. } => agent,
            Degradation::Timeout(t) => &t.agent,
        }
    }
}

/// Default loss the fund could not cover. Kept as persistent CCP state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("unfunded default loss of {amount} from {defaulter} at step {step}")]
pub struct MutualizationDeficit {
    pub step: u64,
    pub defaulter: AgentId,
    pub amount: Decimal,
}
