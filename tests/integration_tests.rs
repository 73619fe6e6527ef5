use ccp_risk_engine::agents::margin::MemberStatus;
use ccp_risk_engine::core::agent_id::AgentId;
use ccp_risk_engine::core::balance_sheet::BalanceSheet;
use ccp_risk_engine::core::config::SimulationConfig;
use ccp_risk_engine::core::error::{Degradation, RejectionCode};
use ccp_risk_engine::core::intent::{Action, ActionKind, Intent};
use ccp_risk_engine::interfaces::intent_log::{read_log, JsonLinesLog, MemoryLog};
use ccp_risk_engine::simulation::round::{ProtocolError, RoundPhase, RoundReport};
use ccp_risk_engine::simulation::runner::Simulation;
use ccp_risk_engine::simulation::settlement::{ApplyOutcome, DefaultTrigger, LoanStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::{Duration, Instant};

fn id(s: &str) -> AgentId {
    AgentId::new(s)
}

/// Quiet environment: no market noise, no carry, fixed margin rate.
fn quiet_config() -> SimulationConfig {
    let mut config = SimulationConfig {
        steps: 10,
        seed: 11,
        decision_budget_ms: 10_000,
        ..Default::default()
    };
    config.default_fund.contribution_rate = dec!(0.1);
    config.market.noise = 0.0;
    config.bank.operating_cost = Decimal::ZERO;
    config.bank.asset_yield = Decimal::ZERO;
    config.bank.margin_carry_cost = Decimal::ZERO;
    config.margin.grace_period = 2;
    config.margin.max_breach_duration = 2;
    config.margin.gain = Decimal::ZERO;
    config.margin.candidate_offsets = vec![Decimal::ZERO];
    config
}

/// A owes 100 to each of B and C, has almost no cash and has posted
/// nothing; B and C are well margined.
fn three_banks() -> Vec<(AgentId, BalanceSheet)> {
    vec![
        (
            id("A"),
            BalanceSheet::new(dec!(10), dec!(50), dec!(50), Decimal::ZERO)
                .with_exposure(id("B"), dec!(-100))
                .with_exposure(id("C"), dec!(-100)),
        ),
        (
            id("B"),
            BalanceSheet::new(dec!(600), dec!(100), Decimal::ZERO, Decimal::ZERO)
                .with_exposure(id("A"), dec!(100))
                .with_posted_margin(dec!(90)),
        ),
        (
            id("C"),
            BalanceSheet::new(dec!(200), dec!(100), Decimal::ZERO, Decimal::ZERO)
                .with_exposure(id("A"), dec!(100))
                .with_posted_margin(dec!(90)),
        ),
    ]
}

/// Run one round with every live member forced to no-op through ingress.
fn no_op_round(sim: &mut Simulation) -> RoundReport {
    let mut round = sim.open_round();
    let step = round.step();
    let live: Vec<AgentId> = sim
        .snapshot()
        .live_banks()
        .map(|(id, _)| id.clone())
        .collect();
    for agent in live {
        let raw = format!(
            r#"{{"agent_id":"{}","step":{},"action_type":"no_op"}}"#,
            agent, step
        );
        assert!(sim.submit(&mut round, &raw).accepted);
    }
    sim.execute(round).unwrap()
}

/// Margin call, grace, breach, default and pro-rata mutualization across
/// the two survivors.
#[test]
fn unmet_margin_call_escalates_to_mutualized_default() {
    let mut sim = Simulation::with_banks(quiet_config(), three_banks()).unwrap();

    // Contributions are 10% of initial cash: A 1, B 60, C 20.
    assert_eq!(sim.snapshot().fund.balance, dec!(81));

    // Required margin for A is 200 x 0.4; the call goes out at setup.
    let a = &sim.snapshot().banks[&id("A")];
    assert_eq!(a.outstanding_call, dec!(80));
    assert_eq!(a.status, MemberStatus::Current);
    assert!(a.stressed);

    for step in 1..=2 {
        let report = no_op_round(&mut sim);
        assert!(report.transitions.is_empty());
        let a = &sim.snapshot().banks[&id("A")];
        assert_eq!(a.status, MemberStatus::Current);
        assert_eq!(a.unmet_rounds, step);
    }
    let belief_before_breach = sim
        .bank(&id("B"))
        .unwrap()
        .belief()
        .counterparty_default_probability(&id("A"));

    let report = no_op_round(&mut sim);
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].agent, id("A"));
    assert_eq!(report.transitions[0].from, MemberStatus::Current);
    assert_eq!(report.transitions[0].to, MemberStatus::InBreach);

    let report = no_op_round(&mut sim);
    assert!(report.defaults.is_empty());
    assert_eq!(sim.snapshot().banks[&id("A")].status, MemberStatus::InBreach);

    // B observed A in breach this round.
    let belief_after_breach = sim
        .bank(&id("B"))
        .unwrap()
        .belief()
        .counterparty_default_probability(&id("A"));
    assert!(belief_after_breach > belief_before_breach);

    let report = no_op_round(&mut sim);
    assert_eq!(report.step, 5);
    assert_eq!(report.defaults.len(), 1);
    let event = &report.defaults[0];
    assert_eq!(event.agent, id("A"));
    assert_eq!(event.trigger, DefaultTrigger::MarginBreach);
    assert_eq!(event.prior_status, MemberStatus::InBreach);

    // Close-out: margin base 200 x volatility 0.2 x 1.25.
    assert_eq!(event.closeout_loss, dec!(50));
    assert_eq!(event.seized_cash, dec!(10));
    assert_eq!(event.shortfall, dec!(40));

    // Own contribution first, then 39 split 3:1 by contribution.
    let m = &event.mutualization;
    assert_eq!(m.own_consumed, dec!(1));
    assert_eq!(m.survivor_charges[&id("B")], dec!(29.25));
    assert_eq!(m.survivor_charges[&id("C")], dec!(9.75));
    assert!(m.deficit.is_none());

    // 45% of each unhedged 100 claim is lost.
    assert_eq!(event.contagion_losses[&id("B")], dec!(45));
    assert_eq!(event.contagion_losses[&id("C")], dec!(45));

    let snap = sim.snapshot();
    assert!(!snap.banks[&id("A")].is_live());
    assert_eq!(snap.new_defaults, vec![id("A")]);
    assert_eq!(snap.fund.balance, dec!(41));
    assert_eq!(snap.fund.unfunded_deficit, Decimal::ZERO);
    assert_eq!(snap.banks[&id("B")].balance.capital_buffer(), dec!(25.75));
    assert_eq!(snap.banks[&id("C")].balance.capital_buffer(), dec!(45.25));
    assert_eq!(sim.graph().edge_count(), 0);
    assert!(report
        .edge_events
        .iter()
        .all(|e| matches!(e, ccp_risk_engine::graph::exposure_graph::EdgeEvent::Removed { .. })));
}

#[test]
fn fund_shortfall_is_recorded_as_persistent_deficit() {
    let mut config = quiet_config();
    config.default_fund.contribution_rate = dec!(0.01);
    let mut sim = Simulation::with_banks(config, three_banks()).unwrap();
    for _ in 0..5 {
        no_op_round(&mut sim);
    }
    // Fund of 8.1 against a shortfall of 40.
    let event = &sim.defaults()[0];
    let deficit = event.mutualization.deficit.as_ref().unwrap();
    assert_eq!(deficit.amount, dec!(31.9));
    assert_eq!(sim.snapshot().fund.unfunded_deficit, dec!(31.9));
    assert_eq!(sim.snapshot().fund.balance, Decimal::ZERO);

    no_op_round(&mut sim);
    assert_eq!(sim.snapshot().fund.unfunded_deficit, dec!(31.9));
    assert_eq!(sim.summary().unfunded_deficit, dec!(31.9));
}

#[test]
fn timed_out_agent_falls_back_to_no_op() {
    let mut config = quiet_config();
    config.decision_budget_ms = 20;
    let banks = vec![
        (id("X"), BalanceSheet::new(dec!(100), dec!(50), dec!(30), dec!(10))),
        (id("Y"), BalanceSheet::new(dec!(100), dec!(50), dec!(30), dec!(10))),
        (id("Z"), BalanceSheet::new(dec!(100), dec!(50), dec!(30), dec!(10))),
    ];
    let mut sim = Simulation::with_banks(config, banks).unwrap();
    sim.inject_latency(id("X"), Duration::from_millis(50));
    let before = sim.snapshot().banks[&id("X")].balance.clone();

    let mut round = sim.open_round();
    for agent in ["Y", "Z"] {
        let raw = format!(r#"{{"agent_id":"{}","step":1,"action_type":"no_op"}}"#, agent);
        assert!(sim.submit(&mut round, &raw).accepted);
    }
    let report = sim.execute(round).unwrap();

    assert_eq!(report.degradations.len(), 1);
    match &report.degradations[0] {
        Degradation::Timeout(t) => {
            assert_eq!(t.agent, id("X"));
            assert!(t.elapsed >= t.budget);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    let x = report.applied.iter().find(|a| a.agent == id("X")).unwrap();
    assert_eq!(x.kind, ActionKind::NoOp);
    assert_eq!(report.metrics.degraded_agents, 1);

    // Balance unchanged, still in the next snapshot, belief not committed.
    assert_eq!(sim.snapshot().banks[&id("X")].balance, before);
    assert!(sim.snapshot().banks[&id("X")].is_live());
    assert_eq!(sim.bank(&id("X")).unwrap().belief().observed_step(), None);
}

#[test]
fn slow_agent_does_not_hold_the_round() {
    let mut config = quiet_config();
    config.decision_budget_ms = 200;
    let mut sim = Simulation::with_banks(config, three_banks()).unwrap();
    sim.inject_latency(id("A"), Duration::from_millis(1_500));

    let started = Instant::now();
    let report = sim.run_round().unwrap();
    let took = started.elapsed();

    assert!(took < Duration::from_millis(1_000), "round took {:?}", took);
    assert_eq!(report.degradations.len(), 1);
    assert!(matches!(
        &report.degradations[0],
        Degradation::Timeout(t) if t.agent == id("A")
    ));
    let a = report.applied.iter().find(|a| a.agent == id("A")).unwrap();
    assert_eq!(a.kind, ActionKind::NoOp);

    // The abandoned computation cannot leak into the next round either.
    sim.inject_latency(id("A"), Duration::ZERO);
    let next = sim.run_round().unwrap();
    assert!(next.degradations.is_empty());
    assert_eq!(sim.bank(&id("A")).unwrap().belief().observed_step(), Some(1));
}

#[test]
fn extended_credit_is_repaid_at_maturity() {
    let mut config = quiet_config();
    config.bank.loan_term_rounds = 2;
    let banks = vec![
        (
            id("X"),
            BalanceSheet::new(dec!(100), dec!(50), Decimal::ZERO, Decimal::ZERO)
                .with_posted_margin(dec!(30)),
        ),
        (
            id("Y"),
            BalanceSheet::new(dec!(100), dec!(50), Decimal::ZERO, Decimal::ZERO)
                .with_posted_margin(dec!(30)),
        ),
    ];
    let mut sim = Simulation::with_banks(config, banks).unwrap();

    let lend = Action::ExtendCredit {
        borrower: id("Y"),
        amount: dec!(50),
        rate: dec!(0.04),
    };
    sim.run_round_with(vec![
        Intent::new(id("X"), 1, lend),
        Intent::new(id("Y"), 1, Action::NoOp),
    ])
    .unwrap();
    assert_eq!(sim.network().loans().len(), 1);
    assert_eq!(sim.snapshot().banks[&id("X")].balance.exposure(&id("Y")), dec!(50));

    assert!(no_op_round(&mut sim).carry.loans.is_empty());
    let report = no_op_round(&mut sim);
    assert_eq!(report.carry.loans.len(), 1);
    let settled = &report.carry.loans[0];
    assert_eq!(settled.status, LoanStatus::Repaid);
    assert_eq!(settled.paid, dec!(52));
    assert!(sim.network().loans().is_empty());

    let x = &sim.snapshot().banks[&id("X")].balance;
    let y = &sim.snapshot().banks[&id("Y")].balance;
    assert_eq!(x.cash(), dec!(102));
    assert_eq!(x.capital_buffer(), dec!(52));
    assert_eq!(y.cash(), dec!(98));
    assert!(x.exposures().is_empty() && y.exposures().is_empty());
}

#[test]
fn ingress_rejections_leave_state_untouched() {
    let mut sim = Simulation::with_banks(quiet_config(), three_banks()).unwrap();
    let mut round = sim.open_round();

    let cases = [
        ("not json", RejectionCode::Malformed),
        (r#"{"step":1,"action_type":"no_op"}"#, RejectionCode::MissingField),
        (
            r#"{"agent_id":"B","step":1,"action_type":"print_money"}"#,
            RejectionCode::UnknownActionType,
        ),
        (
            r#"{"agent_id":"B","step":2,"action_type":"no_op"}"#,
            RejectionCode::StepMismatch,
        ),
        (
            r#"{"agent_id":"Q","step":1,"action_type":"no_op"}"#,
            RejectionCode::UnknownAgent,
        ),
        (
            r#"{"agent_id":"B","step":1,"action_type":"extend_credit","payload":{"borrower":"A"}}"#,
            RejectionCode::InvalidPayload,
        ),
    ];
    for (raw, code) in cases {
        let response = sim.submit(&mut round, raw);
        assert!(!response.accepted, "{} should be rejected", raw);
        assert_eq!(response.code, Some(code), "{}", raw);
    }

    let first = sim.submit(
        &mut round,
        r#"{"agent_id":"B","step":1,"action_type":"post_margin","payload":{"amount":"5"}}"#,
    );
    assert!(first.accepted);
    let second = sim.submit(&mut round, r#"{"agent_id":"B","step":1,"action_type":"no_op"}"#);
    assert_eq!(second.code, Some(RejectionCode::DuplicateIntent));

    let report = sim.execute(round).unwrap();
    assert_eq!(report.rejected, 7);
    let b = report.applied.iter().find(|a| a.agent == id("B")).unwrap();
    assert_eq!(Some(b.intent_id), first.intent_id);
    assert_eq!(b.kind, ActionKind::PostMargin);
    assert_eq!(b.outcome, ApplyOutcome::Applied);
    assert_eq!(sim.snapshot().banks[&id("B")].balance.posted_margin(), dec!(95));
}

#[test]
fn round_phases_are_enforced() {
    let mut sim = Simulation::with_banks(quiet_config(), three_banks()).unwrap();
    let mut round = sim.open_round();
    assert_eq!(round.phase(), RoundPhase::CollectingSnapshot);
    round.begin_computing().unwrap();
    assert!(matches!(
        sim.execute(round),
        Err(ProtocolError::WrongPhase {
            expected: RoundPhase::CollectingSnapshot,
            found: RoundPhase::AgentsComputing,
            ..
        })
    ));
    // A failed round leaves the simulation where it was.
    assert_eq!(sim.step(), 0);
    sim.run_round().unwrap();
    assert_eq!(sim.step(), 1);
}

#[test]
fn every_live_member_gets_exactly_one_intent() {
    let config = SimulationConfig {
        bank_count: 8,
        steps: 5,
        seed: 3,
        decision_budget_ms: 10_000,
        ..Default::default()
    };
    let mut sim = Simulation::new(config).unwrap();
    for _ in 0..5 {
        let live_before = sim.live_count();
        let report = sim.run_round().unwrap();
        assert_eq!(report.applied.len(), live_before);
        let mut agents: Vec<&AgentId> = report.applied.iter().map(|a| &a.agent).collect();
        agents.sort();
        agents.dedup();
        assert_eq!(agents.len(), live_before);
    }
}

#[test]
fn replay_reproduces_final_state() {
    let config = SimulationConfig {
        bank_count: 6,
        steps: 8,
        seed: 21,
        decision_budget_ms: 10_000,
        ..Default::default()
    };
    let log = MemoryLog::new();
    let mut sim = Simulation::new(config.clone())
        .unwrap()
        .with_intent_log(log.clone());
    sim.run().unwrap();

    let replayed = Simulation::replay(config, &log.entries()).unwrap();
    assert_eq!(replayed.step(), sim.step());
    assert_eq!(**replayed.snapshot(), **sim.snapshot());
    assert_eq!(replayed.defaults().len(), sim.defaults().len());
}

#[test]
fn json_lines_log_round_trips_through_replay() {
    let config = SimulationConfig {
        bank_count: 4,
        steps: 3,
        seed: 5,
        decision_budget_ms: 10_000,
        ..Default::default()
    };
    let path = std::env::temp_dir().join(format!("ccp-replay-{}.jsonl", uuid::Uuid::new_v4()));
    {
        let log = JsonLinesLog::create(&path).unwrap();
        let mut sim = Simulation::new(config.clone()).unwrap().with_intent_log(log);
        sim.run().unwrap();
    }
    let entries = read_log(&path).unwrap();
    assert!(!entries.is_empty());
    assert!(entries.windows(2).all(|w| (w[0].step, w[0].sequence) < (w[1].step, w[1].sequence)));

    let replayed = Simulation::replay(config.clone(), &entries).unwrap();
    let mut fresh = Simulation::new(config).unwrap();
    fresh.replay_entries(&entries).unwrap();
    assert_eq!(**replayed.snapshot(), **fresh.snapshot());
    std::fs::remove_file(&path).ok();
}

#[test]
fn self_declared_default_is_applied_first() {
    let mut sim = Simulation::with_banks(quiet_config(), three_banks()).unwrap();
    let mut round = sim.open_round();
    for raw in [
        r#"{"agent_id":"A","step":1,"action_type":"declare_default","payload":{"reason":"insolvent"}}"#,
        r#"{"agent_id":"B","step":1,"action_type":"reduce_exposure","payload":{"counterparty":"A","amount":"10","method":"unwind"}}"#,
        r#"{"agent_id":"C","step":1,"action_type":"no_op"}"#,
    ] {
        assert!(sim.submit(&mut round, raw).accepted);
    }
    let report = sim.execute(round).unwrap();
    assert_eq!(report.applied[0].agent, id("A"));
    assert_eq!(report.applied[0].kind, ActionKind::DeclareDefault);
    assert_eq!(report.defaults[0].trigger, DefaultTrigger::SelfDeclared);
    assert_eq!(report.defaults[0].prior_status, MemberStatus::Current);
    // B's unwind against the defaulted A is skipped.
    let b = report.applied.iter().find(|a| a.agent == id("B")).unwrap();
    assert!(matches!(b.outcome, ApplyOutcome::Skipped(_)));
    assert_eq!(
        Action::NoOp.kind(),
        report.applied.last().map(|a| a.kind).unwrap()
    );
}

#[test]
fn snapshots_are_broadcast_to_subscribers() {
    let mut sim = Simulation::with_banks(quiet_config(), three_banks()).unwrap();
    let fast = sim.subscribe(16);
    let slow = sim.subscribe(1);
    for _ in 0..3 {
        no_op_round(&mut sim);
    }
    let steps: Vec<u64> = fast.try_iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![1, 2, 3]);
    // The slow observer keeps the first snapshot; later ones were dropped.
    assert_eq!(slow.try_iter().count(), 1);
}
