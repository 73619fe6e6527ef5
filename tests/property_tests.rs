use ccp_risk_engine::agents::default_fund::DefaultFund;
use ccp_risk_engine::belief::observation::{CounterpartySignal, Observation};
use ccp_risk_engine::belief::state::BeliefState;
use ccp_risk_engine::core::agent_id::AgentId;
use ccp_risk_engine::core::config::SimulationConfig;
use ccp_risk_engine::core::intent::{Action, ExposureMethod, Intent};
use ccp_risk_engine::simulation::runner::Simulation;
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

fn config(bank_count: usize, seed: u64) -> SimulationConfig {
    SimulationConfig {
        bank_count,
        steps: 6,
        seed,
        decision_budget_ms: 10_000,
        ..Default::default()
    }
}

/// Generate one observation with every channel either silent or carrying
/// an in-range signal.
fn arb_observation() -> impl Strategy<Value = Observation> {
    (
        prop::collection::vec((0usize..4, 0.0f64..=1.0, 0.0f64..=1.0), 0..4),
        0usize..3,
        prop::option::of(0.0f64..=1.0),
        prop::option::of((0.0f64..5_000.0, 0.01f64..500.0)),
        prop::option::of(0.0f64..3.0),
    )
        .prop_map(|(cps, new_defaults, liquidity, margin, vol)| Observation {
            counterparties: cps
                .into_iter()
                .map(|(i, signal, weight)| CounterpartySignal {
                    counterparty: AgentId::new(format!("CP{}", i)),
                    signal,
                    weight,
                })
                .collect(),
            new_defaults,
            liquidity_stress: liquidity,
            margin_call: margin,
            volatility: vol,
        })
}

/// Raw material for one intent: action kind, counterparty index, amount
/// and a fraction in percent.
fn arb_action_parts() -> impl Strategy<Value = (u8, usize, u32, u32)> {
    (0u8..11, 0usize..16, 1u32..2_000, 1u32..=100)
}

fn build_action(kind: u8, counterparty: AgentId, amount: u32, pct: u32) -> Action {
    let amount = Decimal::from(amount);
    let fraction = Decimal::new(pct as i64, 2);
    match kind {
        0 => Action::ReduceExposure {
            counterparty,
            amount,
            method: ExposureMethod::Unwind,
        },
        1 => Action::ReduceExposure {
            counterparty,
            amount,
            method: ExposureMethod::Hedge,
        },
        2 => Action::Deleverage { amount },
        3 => Action::RequestLiquidity {
            lender: counterparty,
            amount,
        },
        4 => Action::WithdrawCreditLine { fraction },
        5 => Action::PostMargin { amount },
        6 => Action::ExtendCredit {
            borrower: counterparty,
            amount,
            rate: Decimal::new(5, 2),
        },
        7 => Action::RequestMarginRelief {
            extension_rounds: pct % 3 + 1,
        },
        8 => Action::ExecuteBilateralTrade {
            counterparty,
            notional: amount,
            spread: Decimal::new(1, 2),
        },
        9 => Action::ReportStressSignal {
            liquidity_stress: pct as f64 / 100.0,
            market_volatility: 0.3,
        },
        _ => Action::NoOp,
    }
}

/// One intent per member for the round after `sim`'s current step.
fn intents_for(sim: &Simulation, parts: &[(u8, usize, u32, u32)]) -> Vec<Intent> {
    let ids: Vec<AgentId> = sim.snapshot().banks.keys().cloned().collect();
    let step = sim.step() + 1;
    ids.iter()
        .zip(parts.iter().cycle())
        .map(|(agent, (kind, cp, amount, pct))| {
            let counterparty = ids[cp % ids.len()].clone();
            Intent::new(
                agent.clone(),
                step,
                build_action(*kind, counterparty, *amount, *pct),
            )
        })
        .collect()
}

proptest! {
    // ===================================================================
    // INVARIANT 1: Belief parameters stay in their domain.
    //
    // Whatever sequence of observations an agent folds in, Beta shape
    // parameters stay positive and Gaussian variances non-negative.
    // ===================================================================
    #[test]
    fn belief_parameters_stay_in_domain(
        observations in prop::collection::vec(arb_observation(), 1..40)
    ) {
        let config = SimulationConfig::default();
        let mut belief = BeliefState::from_priors(&config.priors);
        for (step, obs) in observations.iter().enumerate() {
            belief.update(obs, step as u64, &config.observation, &config.priors);
            prop_assert!(belief.is_valid(), "belief left its domain at step {}", step);
        }
        let summary = belief.summary();
        prop_assert!((0.0..=1.0).contains(&summary.counterparty_risk));
        prop_assert!((0.0..=1.0).contains(&summary.liquidity_stress));
    }

    // ===================================================================
    // INVARIANT 2: Mutualization conserves loss across a default sequence.
    //
    // For every default, the defaulter's own contribution, the forfeited
    // pool and survivor charges cover the shortfall up to what the fund
    // holds; anything beyond is recorded as a deficit, never dropped.
    // Nobody is charged more than they contributed, and a member that has
    // defaulted is never charged again.
    // ===================================================================
    #[test]
    fn mutualization_conserves_loss(
        contributions in prop::collection::vec(0u32..1_000, 2..8),
        defaults in prop::collection::vec((0usize..8, 0u32..3_000), 1..6),
    ) {
        let ids: Vec<AgentId> = (0..contributions.len())
            .map(|i| AgentId::new(format!("M{}", i)))
            .collect();
        let mut fund = DefaultFund::new();
        for (id, c) in ids.iter().zip(&contributions) {
            fund.contribute(id, Decimal::from(*c));
        }
        let mut defaulted: Vec<AgentId> = Vec::new();
        let mut total_deficit = Decimal::ZERO;

        for (step, (index, shortfall)) in defaults.into_iter().enumerate() {
            let defaulter = ids[index % ids.len()].clone();
            if defaulted.contains(&defaulter) {
                continue;
            }
            let before = fund.clone();
            let shortfall = Decimal::from(shortfall);

            let outcome = fund.mutualize(step as u64, &defaulter, shortfall);
            let covered = outcome.covered();

            prop_assert!(covered >= shortfall.min(outcome.fund_balance_before));
            prop_assert!(covered <= shortfall);
            let deficit = outcome.deficit.as_ref().map_or(Decimal::ZERO, |d| d.amount);
            prop_assert_eq!(covered + deficit, shortfall);
            prop_assert_eq!(fund.balance(), before.balance() - covered);
            total_deficit += deficit;
            prop_assert_eq!(fund.total_deficit(), total_deficit);

            prop_assert!(!outcome.survivor_charges.contains_key(&defaulter));
            for id in &defaulted {
                prop_assert!(
                    !outcome.survivor_charges.contains_key(id),
                    "{} charged after defaulting", id
                );
            }
            for (id, charge) in &outcome.survivor_charges {
                prop_assert!(*charge <= before.contribution(id));
                prop_assert!(*charge >= Decimal::ZERO);
            }
            defaulted.push(defaulter);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // ===================================================================
    // INVARIANT 3: Cash never goes negative for a live member.
    //
    // Applying any intent, fundable or not, leaves every member that has
    // not defaulted with non-negative cash.
    // ===================================================================
    #[test]
    fn cash_never_negative_while_live(
        seed in 0u64..1_000,
        parts in prop::collection::vec((0usize..6, arb_action_parts()), 1..60),
    ) {
        let sim = Simulation::new(config(6, seed)).unwrap();
        let ids: Vec<AgentId> = sim.snapshot().banks.keys().cloned().collect();
        let mut network = sim.network().clone();

        for (agent, (kind, cp, amount, pct)) in parts {
            let agent = ids[agent % ids.len()].clone();
            let counterparty = ids[cp % ids.len()].clone();
            let intent = Intent::new(agent, 1, build_action(kind, counterparty, amount, pct));
            network.apply_intent(&intent, sim.config(), 1);

            for (id, bank) in network.banks() {
                prop_assert!(
                    bank.is_defaulted() || bank.balance().cash() >= Decimal::ZERO,
                    "{} has negative cash after {:?}",
                    id,
                    intent.action()
                );
            }
        }
    }

    // ===================================================================
    // INVARIANT 4: Application order does not depend on submission order.
    //
    // The same snapshot and the same set of intents produce identical
    // state no matter the order in which they were submitted.
    // ===================================================================
    #[test]
    fn application_is_order_independent(
        seed in 0u64..1_000,
        parts in prop::collection::vec(arb_action_parts(), 6),
    ) {
        let mut forward = Simulation::new(config(6, seed)).unwrap();
        let mut backward = Simulation::new(config(6, seed)).unwrap();
        prop_assert_eq!(&**forward.snapshot(), &**backward.snapshot());

        let intents = intents_for(&forward, &parts);
        let mut reversed = intents.clone();
        reversed.reverse();

        let a = forward.run_round_with(intents).unwrap();
        let b = backward.run_round_with(reversed).unwrap();
        prop_assert_eq!(a.applied, b.applied);
        prop_assert_eq!(&**forward.snapshot(), &**backward.snapshot());

        // Free-running rounds after the forced one stay in lockstep.
        forward.run_round().unwrap();
        backward.run_round().unwrap();
        prop_assert_eq!(&**forward.snapshot(), &**backward.snapshot());
    }

    // ===================================================================
    // INVARIANT 5: Decisions read only the previous round's snapshot.
    //
    // After round N every member that was live going in has folded
    // exactly snapshot N-1 into its belief, and the snapshot handed to
    // the round is unchanged by application.
    // ===================================================================
    #[test]
    fn decisions_read_only_previous_snapshot(seed in 0u64..1_000) {
        let mut sim = Simulation::new(config(5, seed)).unwrap();
        for _ in 0..4 {
            let held = Arc::clone(sim.snapshot());
            let copy = (*held).clone();
            let live: Vec<AgentId> = held.live_banks().map(|(id, _)| id.clone()).collect();

            let report = sim.run_round().unwrap();
            prop_assert_eq!(report.step, held.step + 1);
            prop_assert_eq!(&*held, &copy);
            for id in &live {
                let bank = sim.bank(id).unwrap();
                prop_assert_eq!(bank.belief().observed_step(), Some(held.step));
                prop_assert!(bank.belief().is_valid());
            }
            if sim.live_count() == 0 {
                break;
            }
        }
    }
}
