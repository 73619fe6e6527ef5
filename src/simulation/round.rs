//! The clearing round as an explicit phase machine.
//!
//! ```text
//! collecting_snapshot -> agents_computing -> intents_collected -> applying -> advanced
//! ```
//!
//! Each transition is a method that checks the current phase. Agents only
//! ever see the snapshot the round was opened with; intents collected in
//! this round become visible through the next snapshot only.

use crate::agents::ccp::CcpDecision;
use crate::agents::margin::StatusTransition;
use crate::core::agent_id::AgentId;
use crate::core::error::{Degradation, RejectionCode, ValidationError};
use crate::core::intent::{sort_for_application, Intent};
use crate::core::snapshot::Snapshot;
use crate::graph::exposure_graph::{EdgeEvent, TopologyStats};
use crate::simulation::metrics::StepMetrics;
use crate::simulation::settlement::{AppliedIntent, CarryReport, DefaultEvent};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    CollectingSnapshot,
    AgentsComputing,
    IntentsCollected,
    Applying,
    Advanced,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::CollectingSnapshot => "collecting_snapshot",
            RoundPhase::AgentsComputing => "agents_computing",
            RoundPhase::IntentsCollected => "intents_collected",
            RoundPhase::Applying => "applying",
            RoundPhase::Advanced => "advanced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("round {step}: expected phase {expected}, found {found}")]
    WrongPhase {
        step: u64,
        expected: RoundPhase,
        found: RoundPhase,
    },

    #[error("round {round} does not follow snapshot {snapshot}")]
    OutOfSequence { round: u64, snapshot: u64 },
}

/// One agent's result from the decision phase.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentDecision {
    Decided(Intent),
    Degraded(Degradation),
}

/// State of one round in flight.
#[derive(Debug)]
pub struct ClearingRound {
    step: u64,
    phase: RoundPhase,
    snapshot: Arc<Snapshot>,
    overrides: BTreeMap<AgentId, Intent>,
    seen_ids: BTreeSet<Uuid>,
    intents: Vec<Intent>,
    degradations: Vec<Degradation>,
    rejected: usize,
}

impl ClearingRound {
    /// Open the round that follows `snapshot`.
    pub fn open(snapshot: Arc<Snapshot>) -> Self {
        Self {
            step: snapshot.step + 1,
            phase: RoundPhase::CollectingSnapshot,
            snapshot,
            overrides: BTreeMap::new(),
            seen_ids: BTreeSet::new(),
            intents: Vec::new(),
            degradations: Vec::new(),
            rejected: 0,
        }
    }

    fn expect(&self, expected: RoundPhase) -> Result<(), ProtocolError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(ProtocolError::WrongPhase {
                step: self.step,
                expected,
                found: self.phase,
            })
        }
    }

    // --- Accessors ---

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn overrides(&self) -> &BTreeMap<AgentId, Intent> {
        &self.overrides
    }

    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    pub fn degradations(&self) -> &[Degradation] {
        &self.degradations
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub(crate) fn count_rejection(&mut self) {
        self.rejected += 1;
    }

    // --- Phase transitions ---

    /// Queue a validated external intent. It replaces the agent's own
    /// decision for this round.
    pub fn submit_override(&mut self, intent: Intent) -> Result<Uuid, ValidationError> {
        if !matches!(
            self.phase,
            RoundPhase::CollectingSnapshot | RoundPhase::AgentsComputing
        ) {
            return Err(ValidationError::new(
                RejectionCode::StepMismatch,
                format!("round {} is no longer collecting intents", self.step),
            ));
        }
        if intent.step() != self.step {
            return Err(ValidationError::new(
                RejectionCode::StepMismatch,
                format!("intent for step {} but round {} is open", intent.step(), self.step),
            ));
        }
        if self.seen_ids.contains(&intent.id()) {
            return Err(ValidationError::new(
                RejectionCode::DuplicateIntent,
                format!("intent {} already submitted", intent.id()),
            ));
        }
        if self.overrides.contains_key(intent.agent_id()) {
            return Err(ValidationError::new(
                RejectionCode::DuplicateIntent,
                format!("{} already has an intent for step {}", intent.agent_id(), self.step),
            ));
        }
        let id = intent.id();
        self.seen_ids.insert(id);
        self.overrides.insert(intent.agent_id().clone(), intent);
        Ok(id)
    }

    /// Freeze the snapshot and hand it to the agents.
    pub fn begin_computing(&mut self) -> Result<Arc<Snapshot>, ProtocolError> {
        self.expect(RoundPhase::CollectingSnapshot)?;
        self.phase = RoundPhase::AgentsComputing;
        Ok(Arc::clone(&self.snapshot))
    }

    /// Barrier: one intent per live member. Overrides win; a missing or
    /// degraded decision becomes a no-op.
    pub fn collect(
        &mut self,
        decisions: BTreeMap<AgentId, AgentDecision>,
    ) -> Result<&[Intent], ProtocolError> {
        self.expect(RoundPhase::AgentsComputing)?;
        let mut decisions = decisions;
        let members: Vec<AgentId> = self
            .snapshot
            .live_banks()
            .map(|(id, _)| id.clone())
            .collect();

        let mut intents = Vec::with_capacity(members.len());
        for id in members {
            let decision = decisions.remove(&id);
            if let Some(intent) = self.overrides.remove(&id) {
                intents.push(intent);
                continue;
            }
            match decision {
                Some(AgentDecision::Decided(intent)) if intent.step() == self.step => {
                    intents.push(intent)
                }
                Some(AgentDecision::Decided(intent)) => {
                    log::warn!(
                        "{} decided for step {} during round {}; substituting no-op",
                        id,
                        intent.step(),
                        self.step
                    );
                    intents.push(Intent::no_op(id, self.step));
                }
                Some(AgentDecision::Degraded(degradation)) => {
                    log::warn!("degraded round {}: {}", self.step, degradation);
                    self.degradations.push(degradation);
                    intents.push(Intent::no_op(id, self.step));
                }
                None => intents.push(Intent::no_op(id, self.step)),
            }
        }
        sort_for_application(&mut intents);
        self.intents = intents;
        self.phase = RoundPhase::IntentsCollected;
        Ok(&self.intents)
    }

    pub fn begin_applying(&mut self) -> Result<Vec<Intent>, ProtocolError> {
        self.expect(RoundPhase::IntentsCollected)?;
        self.phase = RoundPhase::Applying;
        Ok(self.intents.clone())
    }

    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        self.expect(RoundPhase::Applying)?;
        self.phase = RoundPhase::Advanced;
        Ok(())
    }
}

/// Everything that happened in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub step: u64,
    pub applied: Vec<AppliedIntent>,
    pub degradations: Vec<Degradation>,
    pub ccp_decision: CcpDecision,
    pub calls_issued: Vec<(AgentId, Decimal)>,
    pub transitions: Vec<StatusTransition>,
    pub defaults: Vec<DefaultEvent>,
    pub carry: CarryReport,
    pub edge_events: Vec<EdgeEvent>,
    pub topology: TopologyStats,
    pub rejected: usize,
    pub metrics: StepMetrics,
}
