use crate::agents::margin::MemberStatus;
use crate::belief::observation::Observation;
use crate::belief::state::BeliefState;
use crate::belief::utility::{Projection, UtilityModel};
use crate::core::agent_id::AgentId;
use crate::core::amount::to_f64;
use crate::core::balance_sheet::BalanceSheet;
use crate::core::config::SimulationConfig;
use crate::core::error::{CapitalError, StateError};
use crate::core::intent::{Action, ActionKind, ExposureMethod, Intent};
use crate::core::snapshot::{BankView, Snapshot};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Score of one candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvaluation {
    pub action: Action,
    pub expected_utility: f64,
    pub default_probability: f64,
    pub capital_cost: Decimal,
}

/// Output of one agent's decision computation. Nothing here has touched
/// shared state; the orchestrator commits the belief and queues the
/// intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Deliberation {
    pub belief: BeliefState,
    pub intent: Intent,
    pub evaluations: Vec<ActionEvaluation>,
    pub capital_rejections: Vec<CapitalError>,
}

/// A clearing member: private belief, private balance sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAgent {
    id: AgentId,
    balance: BalanceSheet,
    belief: BeliefState,
}

/// Everything the agent consults while scoring one candidate.
struct DecisionContext<'a> {
    id: &'a AgentId,
    sheet: &'a BalanceSheet,
    view: &'a BankView,
    snapshot: &'a Snapshot,
    belief: &'a BeliefState,
    config: &'a SimulationConfig,
}

impl BankAgent {
    pub fn new(id: AgentId, balance: BalanceSheet, belief: BeliefState) -> Self {
        Self {
            id,
            balance,
            belief,
        }
    }

    // --- Accessors ---

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn balance(&self) -> &BalanceSheet {
        &self.balance
    }

    pub fn belief(&self) -> &BeliefState {
        &self.belief
    }

    pub fn is_defaulted(&self) -> bool {
        self.balance.is_defaulted()
    }

    pub(crate) fn balance_mut(&mut self) -> &mut BalanceSheet {
        &mut self.balance
    }

    pub(crate) fn commit_belief(&mut self, belief: BeliefState) {
        self.belief = belief;
    }

    /// Check the snapshot is the one this round should decide against.
    fn check_snapshot(&self, snapshot: &Snapshot, step: u64) -> Result<(), StateError> {
        if snapshot.step + 1 != step {
            return Err(StateError::Stale {
                expected: step.saturating_sub(1),
                found: snapshot.step,
            });
        }
        if let Some(seen) = self.belief.observed_step() {
            if snapshot.step <= seen {
                return Err(StateError::Stale {
                    expected: seen + 1,
                    found: snapshot.step,
                });
            }
        }
        snapshot.check_consistency()?;
        snapshot.view(&self.id).map(|_| ())
    }

    /// Belief after folding in `snapshot`, without committing it.
    pub fn observe(
        &self,
        snapshot: &Snapshot,
        step: u64,
        config: &SimulationConfig,
    ) -> Result<BeliefState, StateError> {
        self.check_snapshot(snapshot, step)?;
        let observation = Observation::from_snapshot(snapshot, &self.id, &config.observation)?;
        let mut belief = self.belief.clone();
        belief.update(&observation, snapshot.step, &config.observation, &config.priors);
        Ok(belief)
    }

    /// Update beliefs and select this round's action. Pure with respect
    /// to `self` and the snapshot.
    pub fn deliberate(
        &self,
        snapshot: &Snapshot,
        step: u64,
        config: &SimulationConfig,
    ) -> Result<Deliberation, StateError> {
        let belief = self.observe(snapshot, step, config)?;
        let view = snapshot.view(&self.id)?;

        if self.is_defaulted() || !view.is_live() {
            return Ok(Deliberation {
                belief,
                intent: Intent::no_op(self.id.clone(), step),
                evaluations: Vec::new(),
                capital_rejections: Vec::new(),
            });
        }

        let ctx = DecisionContext {
            id: &self.id,
            sheet: &self.balance,
            view,
            snapshot,
            belief: &belief,
            config,
        };
        let model = UtilityModel::from_config(config);
        let (action, evaluations, capital_rejections) = select_action(&ctx, &model);
        log::debug!(
            "{} step {}: chose {} ({} candidates, {} unfundable)",
            self.id,
            step,
            action.kind(),
            evaluations.len(),
            capital_rejections.len()
        );
        let intent = Intent::new(self.id.clone(), step, action);
        Ok(Deliberation {
            belief,
            intent,
            evaluations,
            capital_rejections,
        })
    }
}

fn live_others<'a>(
    ctx: &'a DecisionContext<'a>,
) -> impl Iterator<Item = (&'a AgentId, &'a BankView)> {
    ctx.snapshot
        .live_banks()
        .filter(move |(id, _)| *id != ctx.id)
}

/// First maximum by `key`, scanning in id order.
fn pick_by<'a, F>(ctx: &'a DecisionContext<'a>, key: F) -> Option<(&'a AgentId, &'a BankView)>
where
    F: Fn(&AgentId, &BankView) -> f64,
{
    let mut best: Option<(&AgentId, &BankView, f64)> = None;
    for (id, view) in live_others(ctx) {
        let k = key(id, view);
        match best {
            Some((_, _, b)) if k <= b => {}
            _ => best = Some((id, view, k)),
        }
    }
    best.map(|(id, view, _)| (id, view))
}

/// One sized candidate per applicable action type.
fn candidate_actions(ctx: &DecisionContext<'_>) -> Vec<Action> {
    let policy = &ctx.config.bank;
    let sheet = ctx.sheet;
    let call = ctx.view.outstanding_call;
    let mut candidates = Vec::with_capacity(ActionKind::ALL.len());

    // Largest unhedged claim on a live counterparty.
    let mut largest: Option<(&AgentId, Decimal)> = None;
    for (cp, amount) in sheet.exposures() {
        if *amount <= Decimal::ZERO || !ctx.snapshot.banks.get(cp).is_some_and(BankView::is_live) {
            continue;
        }
        let effective = sheet.effective_exposure(cp);
        if effective > largest.map_or(Decimal::ZERO, |(_, e)| e) {
            largest = Some((cp, effective));
        }
    }
    if let Some((cp, effective)) = largest {
        let amount = (effective * policy.reduce_fraction).round_dp(8);
        if amount > Decimal::ZERO {
            let cp_cash = ctx
                .snapshot
                .banks
                .get(cp)
                .map_or(Decimal::ZERO, |v| v.balance.cash());
            let method = if cp_cash >= amount {
                ExposureMethod::Unwind
            } else {
                ExposureMethod::Hedge
            };
            candidates.push(Action::ReduceExposure {
                counterparty: cp.clone(),
                amount,
                method,
            });
        }
    }

    let sell = (sheet.liquid_assets() * policy.deleverage_fraction).round_dp(8);
    if sell > Decimal::ZERO {
        candidates.push(Action::Deleverage { amount: sell });
    }

    if let Some((lender, view)) = pick_by(ctx, |_, v| to_f64(v.balance.cash())) {
        let amount = if call > Decimal::ZERO {
            call
        } else {
            (policy.stress_cash_floor * policy.liquidity_request_fraction).round_dp(8)
        };
        if amount > Decimal::ZERO && view.balance.cash() > Decimal::ZERO {
            candidates.push(Action::RequestLiquidity {
                lender: lender.clone(),
                amount,
            });
        }
    }

    if sheet.claims_at_risk() > Decimal::ZERO && policy.withdraw_fraction > Decimal::ZERO {
        candidates.push(Action::WithdrawCreditLine {
            fraction: policy.withdraw_fraction,
        });
    }

    if call > Decimal::ZERO {
        candidates.push(Action::PostMargin { amount: call });
    }

    if let Some((borrower, _)) = pick_by(ctx, |_, v| -to_f64(v.balance.cash())) {
        let amount = (sheet.cash() * policy.lend_fraction).round_dp(8);
        if amount > Decimal::ZERO {
            candidates.push(Action::ExtendCredit {
                borrower: borrower.clone(),
                amount,
                rate: policy.lending_rate,
            });
        }
    }

    let relief_left = ctx
        .config
        .margin
        .max_relief_rounds
        .saturating_sub(ctx.view.relief_granted);
    if call > Decimal::ZERO && relief_left > 0 && policy.max_relief_request > 0 {
        candidates.push(Action::RequestMarginRelief {
            extension_rounds: policy.max_relief_request.min(relief_left),
        });
    }

    let summary = ctx.belief.summary();
    if summary.liquidity_stress >= policy.report_threshold {
        candidates.push(Action::ReportStressSignal {
            liquidity_stress: summary.liquidity_stress,
            market_volatility: summary.market_volatility,
        });
    }

    if let Some((cp, _)) = pick_by(ctx, |id, _| -ctx.belief.counterparty_default_probability(id)) {
        let notional = (sheet.cash() * policy.trade_fraction).round_dp(8);
        if notional > Decimal::ZERO {
            candidates.push(Action::ExecuteBilateralTrade {
                counterparty: cp.clone(),
                notional,
                spread: policy.trade_spread,
            });
        }
    }

    candidates.push(Action::DeclareDefault {
        reason: "continuation dominated by default".to_string(),
    });
    candidates.push(Action::NoOp);
    candidates
}

/// Cash the action needs at application time.
fn capital_cost(action: &Action, ctx: &DecisionContext<'_>) -> Decimal {
    let policy = &ctx.config.bank;
    match action {
        Action::ReduceExposure {
            amount,
            method: ExposureMethod::Hedge,
            ..
        } => (*amount * policy.hedge_cost_rate).round_dp(8),
        Action::PostMargin { amount } => *amount,
        Action::ExtendCredit { amount, .. } => *amount,
        Action::ExecuteBilateralTrade { notional, .. } => {
            (*notional * ctx.snapshot.margin.rate).round_dp(8)
        }
        _ => Decimal::ZERO,
    }
}

fn breach_pressure(ctx: &DecisionContext<'_>, uncovered: f64, extra_grace: u32) -> f64 {
    let call = to_f64(ctx.view.outstanding_call);
    if call <= 0.0 || uncovered <= 0.0 {
        return 0.0;
    }
    if ctx.view.status == MemberStatus::InBreach {
        return 1.0;
    }
    let grace = ctx.config.margin.grace_period + ctx.view.relief_granted + extra_grace;
    let next_unmet = ctx.view.unmet_rounds + 1;
    if next_unmet > grace {
        1.0
    } else {
        (uncovered / call) * next_unmet as f64 / (grace + 1) as f64
    }
}

fn counterparty_loss(ctx: &DecisionContext<'_>) -> f64 {
    let lgd = to_f64(ctx.config.bank.loss_given_default);
    ctx.sheet
        .exposures()
        .iter()
        .filter(|(_, amount)| **amount > Decimal::ZERO)
        .map(|(cp, amount)| {
            let unhedged = to_f64((*amount - ctx.sheet.hedged(cp)).max(Decimal::ZERO));
            ctx.belief.counterparty_default_probability(cp) * lgd * unhedged
        })
        .sum()
}

/// Draw `amount` from cash then headroom, in the f64 projection.
fn spend(p: &mut Projection, amount: f64) {
    let from_cash = amount.min(p.cash);
    p.cash -= from_cash;
    p.credit_headroom = (p.credit_headroom - (amount - from_cash)).max(0.0);
}

/// Project `action` onto the agent's balance sheet.
fn project(action: &Action, ctx: &DecisionContext<'_>) -> Projection {
    let sheet = ctx.sheet;
    let policy = &ctx.config.bank;
    let lgd = to_f64(policy.loss_given_default);
    let base = to_f64(sheet.margin_base());
    let call = to_f64(ctx.view.outstanding_call);
    let ratio_after = |delta: f64| {
        if base > 0.0 {
            ((base + delta) / base).max(0.0)
        } else if delta > 0.0 {
            1.0 + delta
        } else {
            1.0
        }
    };

    let mut p = Projection {
        cash: to_f64(sheet.cash()),
        credit_headroom: to_f64(sheet.credit_headroom()),
        liquid_assets: to_f64(sheet.liquid_assets()),
        capital: to_f64(sheet.capital_buffer()),
        claims_at_risk: to_f64(sheet.claims_at_risk()),
        counterparty_loss: counterparty_loss(ctx),
        margin_base_ratio: 1.0,
        margin_posted: 0.0,
        outstanding_call: call,
        breach_pressure: breach_pressure(ctx, call, 0),
        pnl: 0.0,
        drain: 0.0,
        certain_default: false,
    };

    match action {
        Action::ReduceExposure {
            counterparty,
            amount,
            method,
        } => {
            let amt = to_f64(*amount);
            let pd_cp = ctx.belief.counterparty_default_probability(counterparty);
            p.claims_at_risk = (p.claims_at_risk - amt).max(0.0);
            p.counterparty_loss = (p.counterparty_loss - pd_cp * lgd * amt).max(0.0);
            p.margin_base_ratio = ratio_after(-amt);
            match method {
                ExposureMethod::Unwind => {
                    p.cash += amt;
                    p.pnl = -amt * to_f64(policy.unwind_cost_rate);
                    p.drain = amt;
                }
                ExposureMethod::Hedge => {
                    let cost = amt * to_f64(policy.hedge_cost_rate);
                    spend(&mut p, cost);
                    p.pnl = -cost;
                }
            }
        }
        Action::Deleverage { amount } => {
            let amt = to_f64(*amount).min(p.liquid_assets);
            let model = UtilityModel::from_config(ctx.config);
            let haircut = model.haircut(ctx.snapshot.market.volatility);
            p.liquid_assets -= amt;
            p.cash += amt * (1.0 - haircut);
            p.capital -= amt * haircut;
            p.pnl = -amt * haircut;
            p.drain = amt;
        }
        Action::RequestLiquidity { lender, amount } => {
            let lender_cash = ctx
                .snapshot
                .banks
                .get(lender)
                .map_or(0.0, |v| to_f64(v.balance.cash()));
            let received = to_f64(*amount).min(lender_cash * to_f64(policy.lender_max_share));
            p.cash += received;
            p.pnl = -received * to_f64(policy.funding_rate);
            p.drain = received;
        }
        Action::WithdrawCreditLine { fraction } => {
            let f = to_f64(*fraction);
            let mut recalled = 0.0;
            let mut lost_interest = 0.0;
            let mut loss_removed = 0.0;
            for (cp, amount) in sheet.exposures() {
                if *amount <= Decimal::ZERO {
                    continue;
                }
                let target = to_f64(*amount) * f;
                let cp_cash = ctx
                    .snapshot
                    .banks
                    .get(cp)
                    .filter(|v| v.is_live())
                    .map_or(0.0, |v| to_f64(v.balance.cash()));
                let repaid = target.min(cp_cash);
                recalled += repaid;
                lost_interest += target * to_f64(policy.lending_rate);
                loss_removed += ctx.belief.counterparty_default_probability(cp) * lgd * repaid;
            }
            p.cash += recalled;
            p.claims_at_risk = (p.claims_at_risk - recalled).max(0.0);
            p.counterparty_loss = (p.counterparty_loss - loss_removed).max(0.0);
            p.margin_base_ratio = ratio_after(-recalled);
            p.pnl = -lost_interest;
            p.drain = recalled;
        }
        Action::PostMargin { amount } => {
            let funded = to_f64(*amount).min(p.cash + p.credit_headroom);
            spend(&mut p, funded);
            p.margin_posted = funded;
            p.breach_pressure = breach_pressure(ctx, (call - funded).max(0.0), 0);
            p.pnl = -funded * to_f64(policy.margin_carry_cost);
        }
        Action::ExtendCredit {
            borrower,
            amount,
            rate,
        } => {
            let amt = to_f64(*amount);
            let pd_b = ctx.belief.counterparty_default_probability(borrower);
            spend(&mut p, amt);
            p.claims_at_risk += amt;
            p.counterparty_loss += pd_b * lgd * amt;
            p.margin_base_ratio = ratio_after(amt);
            p.pnl = amt * to_f64(*rate) * (1.0 - pd_b) - amt * pd_b * lgd;
            p.drain = -amt;
        }
        Action::RequestMarginRelief { extension_rounds } => {
            p.breach_pressure = breach_pressure(ctx, call, *extension_rounds);
        }
        Action::ReportStressSignal { .. } | Action::NoOp => {}
        Action::ExecuteBilateralTrade {
            counterparty,
            notional,
            spread,
        } => {
            let n = to_f64(*notional);
            let pd_cp = ctx.belief.counterparty_default_probability(counterparty);
            let cp_cash = ctx
                .snapshot
                .banks
                .get(counterparty)
                .map_or(0.0, |v| to_f64(v.balance.cash()));
            let fee = (n * to_f64(*spread)).min(cp_cash);
            p.cash += fee;
            p.claims_at_risk += n;
            p.counterparty_loss += pd_cp * lgd * n;
            p.margin_base_ratio = ratio_after(n);
            p.pnl = fee - pd_cp * lgd * n;
            p.drain = fee;
        }
        Action::DeclareDefault { .. } => {
            p.certain_default = true;
            p.pnl = (-p.capital).max(0.0);
            p.drain = to_f64(sheet.liabilities());
        }
    }
    p
}

fn evaluate(action: Action, ctx: &DecisionContext<'_>, model: &UtilityModel) -> ActionEvaluation {
    let projection = project(&action, ctx);
    let outcome = model.expected_utility(&projection, ctx.belief);
    ActionEvaluation {
        capital_cost: capital_cost(&action, ctx),
        action,
        expected_utility: outcome.expected_utility,
        default_probability: outcome.default_probability,
    }
}

/// Tie-break key among equal utilities: capital cost, category, ordinal.
fn tie_key(e: &ActionEvaluation) -> (Decimal, u8, usize) {
    let kind = e.action.kind();
    (e.capital_cost, kind.category().rank(), kind.ordinal())
}

fn best_of<'a>(
    evaluations: impl Iterator<Item = &'a ActionEvaluation>,
    eps: f64,
) -> Option<&'a ActionEvaluation> {
    let mut best: Option<&ActionEvaluation> = None;
    for e in evaluations {
        best = match best {
            None => Some(e),
            Some(b) if e.expected_utility > b.expected_utility + eps => Some(e),
            Some(b)
                if (e.expected_utility - b.expected_utility).abs() <= eps
                    && tie_key(e) < tie_key(b) =>
            {
                Some(e)
            }
            keep => keep,
        };
    }
    best
}

/// Filter unfundable candidates, score the rest, and pick one.
///
/// Default is a last resort: it is chosen only when every other eligible
/// action has negative expected utility and default scores strictly
/// higher than all of them.
fn select_action(
    ctx: &DecisionContext<'_>,
    model: &UtilityModel,
) -> (Action, Vec<ActionEvaluation>, Vec<CapitalError>) {
    let eps = ctx.config.bank.tie_epsilon;
    let available = ctx.sheet.available_funding();
    let mut rejections = Vec::new();
    let mut evaluations = Vec::new();

    for action in candidate_actions(ctx) {
        let cost = capital_cost(&action, ctx);
        if cost > available {
            let err = CapitalError {
                agent: ctx.id.clone(),
                action: action.kind(),
                required: cost,
                available,
            };
            log::debug!("{}", err);
            rejections.push(err);
            continue;
        }
        evaluations.push(evaluate(action, ctx, model));
    }

    let best_continuing = best_of(
        evaluations.iter().filter(|e| !e.action.is_terminal()),
        eps,
    );
    let default_eval = evaluations.iter().find(|e| e.action.is_terminal());

    let chosen = match (best_continuing, default_eval) {
        (Some(best), Some(default))
            if best.expected_utility < 0.0
                && evaluations
                    .iter()
                    .filter(|e| !e.action.is_terminal())
                    .all(|e| e.expected_utility < 0.0)
                && default.expected_utility > best.expected_utility + eps =>
        {
            default.action.clone()
        }
        (Some(best), _) => best.action.clone(),
        (None, _) => Action::NoOp,
    };
    (chosen, evaluations, rejections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::margin::MemberStatus;
    use crate::core::config::BeliefPriors;
    use crate::core::snapshot::{FundSummary, MarginSummary};
    use crate::simulation::market::MarketState;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn view(sheet: BalanceSheet) -> BankView {
        BankView {
            balance: sheet,
            stressed: false,
            status: MemberStatus::Current,
            required_margin: Decimal::ZERO,
            outstanding_call: Decimal::ZERO,
            unmet_rounds: 0,
            relief_granted: 0,
            report: None,
        }
    }

    fn snapshot(banks: Vec<(&str, BankView)>) -> Snapshot {
        Snapshot {
            step: 0,
            banks: banks
                .into_iter()
                .map(|(id, v)| (AgentId::new(id), v))
                .collect(),
            margin: MarginSummary {
                rate: dec!(0.4),
                stress_index: 0.0,
                calls_outstanding: 0,
            },
            fund: FundSummary {
                balance: Decimal::ZERO,
                contributions: BTreeMap::new(),
                forfeited: Decimal::ZERO,
                losses_absorbed: Decimal::ZERO,
                unfunded_deficit: Decimal::ZERO,
            },
            market: MarketState::calm(0.2),
            new_defaults: Vec::new(),
        }
    }

    fn bank(id: &str, sheet: BalanceSheet) -> BankAgent {
        BankAgent::new(
            AgentId::new(id),
            sheet,
            BeliefState::from_priors(&BeliefPriors::default()),
        )
    }

    fn healthy_sheet(cp: &str) -> BalanceSheet {
        BalanceSheet::new(dec!(100), dec!(50), dec!(40), dec!(20))
            .with_exposure(AgentId::new(cp), dec!(30))
            .with_posted_margin(dec!(12))
    }

    #[test]
    fn test_deliberate_returns_intent_for_next_step() {
        let a = bank("A", healthy_sheet("B"));
        let snap = snapshot(vec![
            ("A", view(healthy_sheet("B"))),
            ("B", view(healthy_sheet("A"))),
        ]);
        let config = SimulationConfig::default();
        let d = a.deliberate(&snap, 1, &config).unwrap();
        assert_eq!(d.intent.step(), 1);
        assert_eq!(d.intent.agent_id(), &AgentId::new("A"));
        assert!(!d.intent.action().is_terminal());
        assert!(d.belief.is_valid());
        assert_eq!(d.belief.observed_step(), Some(0));
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let a = bank("A", healthy_sheet("B"));
        let snap = snapshot(vec![
            ("A", view(healthy_sheet("B"))),
            ("B", view(healthy_sheet("A"))),
        ]);
        let err = a
            .deliberate(&snap, 3, &SimulationConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            StateError::Stale {
                expected: 2,
                found: 0
            }
        );
    }

    #[test]
    fn test_missing_agent_rejected() {
        let a = bank("A", healthy_sheet("B"));
        let snap = snapshot(vec![("B", view(healthy_sheet("A")))]);
        let err = a
            .deliberate(&snap, 1, &SimulationConfig::default())
            .unwrap_err();
        assert_eq!(err, StateError::MissingAgent(AgentId::new("A")));
    }

    #[test]
    fn test_unfundable_margin_post_is_rejected() {
        let poor = BalanceSheet::new(dec!(5), dec!(10), dec!(0), dec!(0))
            .with_exposure(AgentId::new("B"), dec!(-200));
        let a = bank("A", poor.clone());
        let mut a_view = view(poor);
        a_view.outstanding_call = dec!(80);
        let snap = snapshot(vec![("A", a_view), ("B", view(healthy_sheet("A")))]);
        let d = a.deliberate(&snap, 1, &SimulationConfig::default()).unwrap();
        assert!(d
            .capital_rejections
            .iter()
            .any(|e| e.action == ActionKind::PostMargin && e.required == dec!(80)));
        assert!(d
            .evaluations
            .iter()
            .all(|e| e.action.kind() != ActionKind::PostMargin));
    }

    #[test]
    fn test_outstanding_call_is_posted_when_affordable() {
        let sheet = healthy_sheet("B");
        let a = bank("A", sheet.clone());
        let mut a_view = view(sheet);
        a_view.outstanding_call = dec!(5);
        a_view.unmet_rounds = 2;
        let snap = snapshot(vec![("A", a_view), ("B", view(healthy_sheet("A")))]);
        let d = a.deliberate(&snap, 1, &SimulationConfig::default()).unwrap();
        assert_eq!(d.intent.action(), &Action::PostMargin { amount: dec!(5) });
    }

    #[test]
    fn test_defaulted_bank_does_nothing() {
        let mut sheet = healthy_sheet("B");
        sheet.seize_on_default();
        let a = bank("A", sheet.clone());
        let snap = snapshot(vec![("A", view(sheet)), ("B", view(healthy_sheet("A")))]);
        let d = a.deliberate(&snap, 1, &SimulationConfig::default()).unwrap();
        assert_eq!(d.intent.action(), &Action::NoOp);
    }

    #[test]
    fn test_insolvent_bank_declares_default() {
        let sheet = BalanceSheet::new(dec!(0), dec!(-400), dec!(0), dec!(0))
            .with_exposure(AgentId::new("B"), dec!(500));
        let a = bank("A", sheet.clone());
        let mut a_view = view(sheet);
        a_view.status = MemberStatus::InBreach;
        a_view.outstanding_call = dec!(200);
        let snap = snapshot(vec![("A", a_view), ("B", view(healthy_sheet("A")))]);
        let d = a.deliberate(&snap, 1, &SimulationConfig::default()).unwrap();
        assert!(d.intent.action().is_terminal());
    }

    #[test]
    fn test_tie_break_prefers_lower_capital_cost_then_category() {
        let cheap = ActionEvaluation {
            action: Action::NoOp,
            expected_utility: -0.1,
            default_probability: 0.1,
            capital_cost: Decimal::ZERO,
        };
        let costly = ActionEvaluation {
            action: Action::PostMargin { amount: dec!(1) },
            expected_utility: -0.1,
            default_probability: 0.1,
            capital_cost: dec!(1),
        };
        let report = ActionEvaluation {
            action: Action::ReportStressSignal {
                liquidity_stress: 0.5,
                market_volatility: 0.2,
            },
            ..cheap.clone()
        };
        let evals = [costly, cheap, report];
        let best = best_of(evals.iter(), 1e-9).unwrap();
        assert_eq!(best.action.kind(), ActionKind::ReportStressSignal);
    }
}
