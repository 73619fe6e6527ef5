//! # ccp-risk-engine
//!
//! Agent-based simulation of a clearing network: bank agents with
//! Bayesian beliefs and expected-utility action selection, a central
//! counterparty with bounded margin control and a mutualized default
//! fund, advanced by a synchronous, deterministic round protocol.
//!
//! ## Architecture
//!
//! - **core**: identifiers, balance sheets, intents, snapshots, configuration, errors
//! - **belief**: belief channels, observation mapping, utility model
//! - **agents**: bank agent, CCP agent, margin state, default fund
//! - **graph**: live exposure topology and contagion statistics
//! - **simulation**: round protocol, settlement, market, topology generation, runner
//! - **interfaces**: ingress validation, snapshot broadcast, durable intent log
//!
//! ## Example
//!
//! ```
//! use ccp_risk_engine::prelude::*;
//!
//! let config = SimulationConfig {
//!     bank_count: 4,
//!     steps: 3,
//!     ..Default::default()
//! };
//! let mut sim = Simulation::new(config).unwrap();
//! let summary = sim.run().unwrap();
//! assert_eq!(summary.steps, 3);
//! ```

pub mod agents;
pub mod belief;
pub mod core;
pub mod graph;
pub mod interfaces;
pub mod simulation;

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::agents::bank::BankAgent;
    pub use crate::agents::ccp::CcpAgent;
    pub use crate::agents::default_fund::DefaultFund;
    pub use crate::agents::margin::MemberStatus;
    pub use crate::belief::state::BeliefState;
    pub use crate::core::agent_id::AgentId;
    pub use crate::core::balance_sheet::BalanceSheet;
    pub use crate::core::config::SimulationConfig;
    pub use crate::core::intent::{Action, ActionKind, Intent};
    pub use crate::core::snapshot::Snapshot;
    pub use crate::interfaces::intent_log::{IntentLog, JsonLinesLog, MemoryLog};
    pub use crate::simulation::metrics::RunSummary;
    pub use crate::simulation::round::{ClearingRound, RoundReport};
    pub use crate::simulation::runner::Simulation;
}
