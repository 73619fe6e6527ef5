//! The round orchestrator.
//!
//! [`Simulation`] owns all shared state and is its only writer. One round:
//!
//! 1. open a [`ClearingRound`] on the current snapshot; external intents
//!    may be submitted through ingress;
//! 2. the CCP and every live bank decide in parallel against that
//!    snapshot, each bank within the decision budget;
//! 3. barrier: one intent per live member, sorted into application order;
//! 4. sequential application, CCP rate change, margin review, carry and
//!    market advance;
//! 5. a new snapshot, edge events and metrics; the snapshot is broadcast.

use crate::agents::bank::{BankAgent, Deliberation};
use crate::agents::ccp::{CcpAgent, CcpDecision};
use crate::agents::default_fund::DefaultFund;
use crate::agents::margin::MarginState;
use crate::belief::state::{BeliefState, BeliefSummary};
use crate::core::agent_id::AgentId;
use crate::core::balance_sheet::BalanceSheet;
use crate::core::config::SimulationConfig;
use crate::core::error::{
    ConfigError, Degradation, RejectionCode, StateError, TimeoutDegradation, ValidationError,
};
use crate::core::intent::{ActionKind, Intent};
use crate::core::snapshot::{BankView, FundSummary, MarginSummary, Snapshot};
use crate::graph::exposure_graph::{claims_of, ExposureGraph};
use crate::interfaces::ingress::{self, IngressResponse};
use crate::interfaces::intent_log::{IntentLog, LogEntry};
use crate::interfaces::publish::SnapshotBroadcaster;
use crate::simulation::market::{Market, MarketState};
use crate::simulation::metrics::{average_beliefs, RunSummary, StepMetrics, FREEZE_THRESHOLD};
use crate::simulation::parallel;
use crate::simulation::round::{AgentDecision, ClearingRound, ProtocolError, RoundReport};
use crate::simulation::settlement::{AppliedIntent, DefaultEvent, Network};
use crate::simulation::topology::generate_network;
use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Offset between the topology seed and the market seed, so the two
/// random streams never coincide.
const MARKET_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A bank's decision-phase result with its wall-clock time. `None` means
/// the budget ran out first.
struct Timed {
    agent: AgentId,
    result: Option<Result<Deliberation, StateError>>,
    elapsed: Duration,
}

pub struct Simulation {
    config: Arc<SimulationConfig>,
    network: Network,
    graph: ExposureGraph,
    snapshot: Arc<Snapshot>,
    intent_log: Option<Box<dyn IntentLog>>,
    broadcaster: SnapshotBroadcaster,
    latency: BTreeMap<AgentId, Duration>,
    history: Vec<StepMetrics>,
    defaults: Vec<DefaultEvent>,
    rejected: usize,
}

impl Simulation {
    /// Generate a network from the configured topology and seed.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let banks = generate_network(&config, &mut rng);
        Self::with_banks(config, banks)
    }

    /// Start from explicit balance sheets. `bank_count` is taken from
    /// `banks`.
    pub fn with_banks(
        mut config: SimulationConfig,
        banks: Vec<(AgentId, BalanceSheet)>,
    ) -> Result<Self, ConfigError> {
        config.bank_count = banks.len();
        config.validate()?;

        let mut fund = DefaultFund::new();
        let mut agents = BTreeMap::new();
        for (id, sheet) in banks {
            let contribution =
                (sheet.cash() * config.default_fund.contribution_rate).round_dp(8);
            fund.contribute(&id, contribution);
            let agent = BankAgent::new(id.clone(), sheet, BeliefState::from_priors(&config.priors));
            if agents.insert(id.clone(), agent).is_some() {
                return Err(ConfigError::InvalidParameter {
                    field: "banks",
                    reason: format!("duplicate member id {}", id),
                });
            }
        }

        let margin = MarginState::new(config.margin.initial_rate, agents.keys().cloned());
        let market = Market::new(
            config.market.clone(),
            config.seed.wrapping_add(MARKET_SEED_OFFSET),
        );
        let mut network = Network::new(agents, CcpAgent::new(margin, fund), market);

        let review = network.review_margins(&config, 0);
        let mut graph = ExposureGraph::from_balances(
            network.banks().iter().map(|(id, b)| (id, b.balance())),
        );
        graph.record_stats(0);

        let new_defaults = review.defaults.iter().map(|e| e.agent.clone()).collect();
        let snapshot = Arc::new(build_snapshot(&network, &config, 0, new_defaults));
        log::info!(
            "simulation ready: {} members, margin rate {}, fund {}",
            network.banks().len(),
            network.ccp().margin().rate(),
            network.ccp().fund().balance()
        );

        Ok(Self {
            config: Arc::new(config),
            network,
            graph,
            snapshot,
            intent_log: None,
            broadcaster: SnapshotBroadcaster::new(),
            latency: BTreeMap::new(),
            history: Vec::new(),
            defaults: review.defaults,
            rejected: 0,
        })
    }

    /// Replay a durable log against a fresh simulation built from `config`.
    pub fn replay(config: SimulationConfig, entries: &[LogEntry]) -> Result<Self, SimulationError> {
        let mut sim = Self::new(config)?;
        sim.replay_entries(entries)?;
        Ok(sim)
    }

    pub fn with_intent_log(mut self, log: impl IntentLog + 'static) -> Self {
        self.intent_log = Some(Box::new(log));
        self
    }

    /// Register a snapshot observer with a buffer of `capacity`.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<Arc<Snapshot>> {
        self.broadcaster.subscribe(capacity)
    }

    /// Delay `agent`'s decision computation by `delay` every round.
    pub fn inject_latency(&mut self, agent: AgentId, delay: Duration) {
        self.latency.insert(agent, delay);
    }

    // --- Accessors ---

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Step of the latest completed round (0 before the first).
    pub fn step(&self) -> u64 {
        self.snapshot.step
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn bank(&self, id: &AgentId) -> Option<&BankAgent> {
        self.network.bank(id)
    }

    pub fn graph(&self) -> &ExposureGraph {
        &self.graph
    }

    pub fn history(&self) -> &[StepMetrics] {
        &self.history
    }

    pub fn defaults(&self) -> &[DefaultEvent] {
        &self.defaults
    }

    pub fn live_count(&self) -> usize {
        self.snapshot.live_count()
    }

    // --- Round protocol ---

    pub fn open_round(&self) -> ClearingRound {
        ClearingRound::open(Arc::clone(&self.snapshot))
    }

    /// Validate a raw submission and queue it on `round`.
    pub fn submit(&self, round: &mut ClearingRound, raw: &str) -> IngressResponse {
        let result = if round.snapshot().step != self.snapshot.step {
            Err(ValidationError::new(
                RejectionCode::StepMismatch,
                format!(
                    "round {} is not the current round {}",
                    round.step(),
                    self.snapshot.step + 1
                ),
            ))
        } else {
            ingress::validate(raw, round.snapshot(), round.step())
                .and_then(|intent| round.submit_override(intent))
        };
        if let Err(e) = &result {
            log::warn!("rejected intent for round {}: {}", round.step(), e);
            round.count_rejection();
        }
        IngressResponse::from(result)
    }

    /// Run the decision, collection and application phases of `round`.
    pub fn execute(&mut self, mut round: ClearingRound) -> Result<RoundReport, ProtocolError> {
        if round.snapshot().step != self.snapshot.step {
            return Err(ProtocolError::OutOfSequence {
                round: round.step(),
                snapshot: self.snapshot.step,
            });
        }
        let snapshot = round.begin_computing()?;
        let step = round.step();

        let (ccp_decision, timed) = self.decide_all(&snapshot, step);
        let decisions = self.settle_decisions(timed, step);
        round.collect(decisions)?;

        let intents = round.begin_applying()?;
        let report = self.apply_round(
            step,
            &intents,
            ccp_decision,
            round.degradations().to_vec(),
            round.rejected(),
        );
        round.finish()?;
        Ok(report)
    }

    pub fn run_round(&mut self) -> Result<RoundReport, ProtocolError> {
        let round = self.open_round();
        self.execute(round)
    }

    /// Run one round with `intents` replacing the members' own decisions.
    pub fn run_round_with(&mut self, intents: Vec<Intent>) -> Result<RoundReport, ProtocolError> {
        let mut round = self.open_round();
        for intent in intents {
            if let Err(e) = round.submit_override(intent) {
                log::warn!("replayed intent not accepted for round {}: {}", round.step(), e);
                round.count_rejection();
            }
        }
        self.execute(round)
    }

    /// Re-apply logged intents round by round, starting after the current
    /// step.
    pub fn replay_entries(
        &mut self,
        entries: &[LogEntry],
    ) -> Result<Vec<RoundReport>, ProtocolError> {
        let mut by_step: BTreeMap<u64, Vec<(u32, Intent)>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.step > self.step()) {
            by_step
                .entry(entry.step)
                .or_default()
                .push((entry.sequence, entry.intent.clone()));
        }
        let Some(last) = by_step.keys().next_back().copied() else {
            return Ok(Vec::new());
        };

        let mut reports = Vec::new();
        while self.step() < last {
            let mut intents = by_step.remove(&(self.step() + 1)).unwrap_or_default();
            intents.sort_by_key(|(seq, _)| *seq);
            reports.push(self.run_round_with(intents.into_iter().map(|(_, i)| i).collect())?);
        }
        log::info!("replayed {} rounds from {} log entries", reports.len(), entries.len());
        Ok(reports)
    }

    /// Run the configured number of rounds, stopping early once every
    /// member has defaulted.
    pub fn run(&mut self) -> Result<RunSummary, ProtocolError> {
        while self.step() < self.config.steps {
            if self.live_count() == 0 {
                log::info!("all members defaulted at step {}; stopping", self.step());
                break;
            }
            self.run_round()?;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_history(
            self.network.banks().len(),
            self.defaults.iter().map(|e| e.agent.to_string()).collect(),
            self.network.ccp().fund().total_losses_absorbed(),
            self.rejected,
            self.history.clone(),
        )
    }

    // --- Phases ---

    /// Parallel decision phase: the CCP and every live bank read the same
    /// snapshot and nothing else that is shared. Each bank deliberates on
    /// a private copy on its own worker and is abandoned at the decision
    /// budget, so one slow member cannot hold the barrier.
    fn decide_all(&self, snapshot: &Arc<Snapshot>, step: u64) -> (CcpDecision, Vec<Timed>) {
        let config = Arc::clone(&self.config);
        let ccp = self.network.ccp();
        let work: Vec<(BankAgent, Option<Duration>)> = self
            .network
            .banks()
            .values()
            .filter(|b| !b.is_defaulted())
            .map(|b| (b.clone(), self.latency.get(b.id()).copied()))
            .collect();
        let agents: Vec<AgentId> = work.iter().map(|(b, _)| b.id().clone()).collect();
        let budget = config.decision_budget();
        let sequential = config.force_sequential;
        let worker_snapshot = Arc::clone(snapshot);
        let worker_config = Arc::clone(&config);

        let (ccp_decision, results) = parallel::join(
            || ccp.decide(snapshot, &config),
            move || {
                parallel::map_with_deadline(
                    work,
                    move |(bank, delay)| {
                        if let Some(delay) = delay {
                            thread::sleep(delay);
                        }
                        bank.deliberate(&worker_snapshot, step, &worker_config)
                    },
                    budget,
                    sequential,
                )
            },
            sequential,
        );
        let timed = agents
            .into_iter()
            .zip(results)
            .map(|(agent, (result, elapsed))| Timed {
                agent,
                result,
                elapsed,
            })
            .collect();
        (ccp_decision, timed)
    }

    /// Commit beliefs of agents that finished in time; everything else
    /// degrades.
    fn settle_decisions(
        &mut self,
        timed: Vec<Timed>,
        step: u64,
    ) -> BTreeMap<AgentId, AgentDecision> {
        let budget = self.config.decision_budget();
        let mut decisions = BTreeMap::new();
        for Timed {
            agent,
            result,
            elapsed,
        } in timed
        {
            let decision = match result {
                None => AgentDecision::Degraded(Degradation::Timeout(TimeoutDegradation {
                    agent: agent.clone(),
                    step,
                    elapsed,
                    budget,
                })),
                Some(Ok(deliberation)) => {
                    if let Some(bank) = self.network.banks.get_mut(&agent) {
                        bank.commit_belief(deliberation.belief);
                    }
                    AgentDecision::Decided(deliberation.intent)
                }
                Some(Err(error)) => AgentDecision::Degraded(Degradation::State {
                    agent: agent.clone(),
                    error,
                }),
            };
            decisions.insert(agent, decision);
        }
        decisions
    }

    /// Sequential application and advance. Single writer.
    fn apply_round(
        &mut self,
        step: u64,
        intents: &[Intent],
        ccp_decision: CcpDecision,
        degradations: Vec<Degradation>,
        rejected: usize,
    ) -> RoundReport {
        let config = Arc::clone(&self.config);
        let mut applied = Vec::with_capacity(intents.len());
        let mut defaults = Vec::new();
        let mut action_counts: BTreeMap<ActionKind, usize> = BTreeMap::new();

        for (sequence, intent) in intents.iter().enumerate() {
            let (outcome, default) = self.network.apply_intent(intent, &config, step);
            log::debug!(
                "step {} #{}: {} {} -> {:?}",
                step,
                sequence,
                intent.agent_id(),
                intent.action().kind(),
                outcome
            );
            if let Some(log) = self.intent_log.as_mut() {
                let entry = LogEntry::new(sequence as u32, intent.clone(), outcome.clone());
                if let Err(e) = log.append(&entry) {
                    log::warn!("intent log append failed at step {}: {}", step, e);
                }
            }
            *action_counts.entry(intent.action().kind()).or_default() += 1;
            applied.push(AppliedIntent {
                intent_id: intent.id(),
                agent: intent.agent_id().clone(),
                kind: intent.action().kind(),
                outcome,
            });
            defaults.extend(default);
        }

        self.network
            .ccp
            .apply_decision(&ccp_decision, config.margin.stress_window);
        let review = self.network.review_margins(&config, step);
        defaults.extend(review.defaults.iter().cloned());
        let carry = self.network.apply_carry(&config, step);
        let market = self.network.market.advance(step);

        let new_defaults: Vec<AgentId> = defaults.iter().map(|e| e.agent.clone()).collect();
        self.snapshot = Arc::new(build_snapshot(&self.network, &config, step, new_defaults));

        let edge_events = self.graph.sync(&claims_of(
            self.network.banks().iter().map(|(id, b)| (id, b.balance())),
        ));
        let topology = self.graph.record_stats(step);

        if let Some(log) = self.intent_log.as_mut() {
            if let Err(e) = log.flush() {
                log::warn!("intent log flush failed at step {}: {}", step, e);
            }
        }
        self.broadcaster.publish(Arc::clone(&self.snapshot));

        self.defaults.extend(defaults.iter().cloned());
        self.rejected += rejected;

        let metrics = self.step_metrics(
            step,
            defaults.len(),
            action_counts,
            review.calls_issued.len(),
            market,
            degradations.len(),
        );
        log::info!(
            "step {}: rate {} stress {:.2} vol {:.4} | {} active, {} stressed, {} new defaults | fund {} deficit {}",
            step,
            metrics.margin_rate,
            metrics.stress_index,
            metrics.volatility,
            metrics.active_banks,
            metrics.stressed_banks,
            metrics.new_defaults,
            metrics.fund_balance.round_dp(2),
            metrics.unfunded_deficit.round_dp(2)
        );
        self.history.push(metrics.clone());

        RoundReport {
            step,
            applied,
            degradations,
            ccp_decision,
            calls_issued: review.calls_issued,
            transitions: review.transitions,
            defaults,
            carry,
            edge_events,
            topology,
            rejected,
            metrics,
        }
    }

    fn step_metrics(
        &self,
        step: u64,
        new_defaults: usize,
        action_counts: BTreeMap<ActionKind, usize>,
        margin_calls: usize,
        market: MarketState,
        degraded_agents: usize,
    ) -> StepMetrics {
        let snapshot = &self.snapshot;
        let live: Vec<&BankAgent> = self
            .network
            .banks()
            .values()
            .filter(|b| !b.is_defaulted())
            .collect();
        let beliefs: Vec<BeliefSummary> = live.iter().map(|b| b.belief().summary()).collect();
        let fund = self.network.ccp().fund();
        StepMetrics {
            step,
            new_defaults,
            total_defaults: self.defaults.len(),
            active_banks: live.len(),
            stressed_banks: snapshot.live_banks().filter(|(_, v)| v.stressed).count(),
            liquidity_freeze: snapshot.stressed_fraction() >= FREEZE_THRESHOLD,
            total_cash: live.iter().map(|b| b.balance().cash()).sum(),
            total_exposure: self.graph.total_exposure(),
            total_posted_margin: live.iter().map(|b| b.balance().posted_margin()).sum(),
            average_belief: average_beliefs(&beliefs),
            action_counts,
            margin_calls,
            margin_rate: snapshot.margin.rate,
            stress_index: snapshot.margin.stress_index,
            volatility: market.volatility,
            fund_balance: fund.balance(),
            unfunded_deficit: fund.total_deficit(),
            degraded_agents,
        }
    }
}

/// Assemble the read-only view of the network after round `step`.
fn build_snapshot(
    network: &Network,
    config: &SimulationConfig,
    step: u64,
    new_defaults: Vec<AgentId>,
) -> Snapshot {
    let margin = network.ccp().margin();
    let fund = network.ccp().fund();
    let banks = network
        .banks()
        .iter()
        .map(|(id, bank)| {
            let account = margin.account(id).cloned().unwrap_or_default();
            let balance = bank.balance().clone();
            let stressed =
                !balance.is_defaulted() && balance.cash() < config.bank.stress_cash_floor;
            let view = BankView {
                balance,
                stressed,
                status: account.status,
                required_margin: account.required,
                outstanding_call: account.outstanding_call,
                unmet_rounds: account.unmet_rounds,
                relief_granted: account.relief_granted,
                report: margin.report(id).copied(),
            };
            (id.clone(), view)
        })
        .collect();

    Snapshot {
        step,
        banks,
        margin: MarginSummary {
            rate: margin.rate(),
            stress_index: margin.stress_index(),
            calls_outstanding: margin.calls_outstanding(),
        },
        fund: FundSummary {
            balance: fund.balance(),
            contributions: fund.contributions().clone(),
            forfeited: fund.forfeited(),
            losses_absorbed: fund.total_losses_absorbed(),
            unfunded_deficit: fund.total_deficit(),
        },
        market: network.market().state(),
        new_defaults,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::intent_log::MemoryLog;
    use rust_decimal::Decimal;

    fn config() -> SimulationConfig {
        SimulationConfig {
            bank_count: 5,
            steps: 4,
            seed: 7,
            decision_budget_ms: 10_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_snapshot() {
        let sim = Simulation::new(config()).unwrap();
        assert_eq!(sim.step(), 0);
        assert_eq!(sim.snapshot().banks.len(), 5);
        assert_eq!(sim.snapshot().margin.rate, sim.config().margin.initial_rate);
        assert!(sim.snapshot().fund.balance > Decimal::ZERO);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut bad = config();
        bad.ccp_weights.loss = -1.0;
        assert!(Simulation::new(bad).is_err());
    }

    #[test]
    fn test_run_advances_and_logs_every_intent() {
        let log = MemoryLog::new();
        let mut sim = Simulation::new(config()).unwrap().with_intent_log(log.clone());
        let rx = sim.subscribe(8);
        let summary = sim.run().unwrap();
        assert_eq!(sim.step(), 4);
        assert_eq!(summary.history.len(), 4);
        assert_eq!(rx.try_iter().count(), 4);
        let live_rounds: usize = sim
            .history()
            .iter()
            .map(|m| m.action_counts.values().sum::<usize>())
            .sum();
        assert_eq!(log.len(), live_rounds);
    }

    #[test]
    fn test_snapshot_step_and_stale_round() {
        let mut sim = Simulation::new(config()).unwrap();
        let stale = sim.open_round();
        sim.run_round().unwrap();
        assert!(matches!(
            sim.execute(stale),
            Err(ProtocolError::OutOfSequence { round: 1, snapshot: 1 })
        ));
    }
}
