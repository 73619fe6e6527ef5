//! Sequential application of intents to shared state.
//!
//! Everything here runs on the round orchestrator's thread only, in the
//! deterministic order produced by [`sort_for_application`]. Balance
//! sheets, margin state and the default fund have exactly one writer.
//!
//! [`sort_for_application`]: crate::core::intent::sort_for_application

use crate::agents::bank::BankAgent;
use crate::agents::ccp::CcpAgent;
use crate::agents::default_fund::MutualizationOutcome;
use crate::agents::margin::{MemberStatus, StatusTransition, StressReport};
use crate::core::agent_id::AgentId;
use crate::core::amount::{from_f64, non_negative};
use crate::core::balance_sheet::BalanceSheet;
use crate::core::config::SimulationConfig;
use crate::core::intent::{Action, ActionKind, ExposureMethod, Intent};
use crate::simulation::market::Market;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AgentDefaulted,
    UnknownAgent,
    CounterpartyUnavailable { counterparty: AgentId },
    Unfunded { required: Decimal, available: Decimal },
    NothingToDo,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AgentDefaulted => write!(f, "agent already defaulted"),
            SkipReason::UnknownAgent => write!(f, "unknown agent"),
            SkipReason::CounterpartyUnavailable { counterparty } => {
                write!(f, "counterparty {} unavailable", counterparty)
            }
            SkipReason::Unfunded {
                required,
                available,
            } => write!(f, "requires {}, available {}", required, available),
            SkipReason::NothingToDo => write!(f, "nothing to do"),
        }
    }
}

/// What applying one intent did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied,
    /// Only part of the requested amount could be executed.
    Partial { requested: Decimal, filled: Decimal },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedIntent {
    pub intent_id: Uuid,
    pub agent: AgentId,
    pub kind: ActionKind,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultTrigger {
    SelfDeclared,
    MarginBreach,
    Insolvency,
}

/// Full record of one member default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultEvent {
    pub step: u64,
    pub agent: AgentId,
    pub trigger: DefaultTrigger,
    pub prior_status: MemberStatus,
    pub closeout_loss: Decimal,
    pub seized_margin: Decimal,
    pub seized_cash: Decimal,
    pub shortfall: Decimal,
    pub mutualization: MutualizationOutcome,
    /// Capital each survivor lost on its claims against the defaulter.
    pub contagion_losses: BTreeMap<AgentId, Decimal>,
}

/// Result of the CCP's review of every member under the new rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginReview {
    pub calls_issued: Vec<(AgentId, Decimal)>,
    pub transitions: Vec<StatusTransition>,
    pub defaults: Vec<DefaultEvent>,
}

/// An interbank loan booked by `ExtendCredit` or `RequestLiquidity`.
///
/// The lender's claim and the borrower's liability live in the two
/// balance sheets' signed exposures; the loan only schedules repayment.
/// Whatever part of the principal was already unwound or recalled through
/// other actions is not collected again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterbankLoan {
    pub id: u64,
    pub lender: AgentId,
    pub borrower: AgentId,
    pub principal: Decimal,
    /// Interest for the whole term, as a fraction of principal.
    pub rate: Decimal,
    pub originated: u64,
    pub maturity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Repaid,
    /// Due but unpaid; the loan stays on the book.
    Overdue,
    /// Past the grace period: settled with what the borrower could pay.
    ForcedSettlement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanSettlement {
    pub step: u64,
    pub loan: InterbankLoan,
    pub status: LoanStatus,
    pub paid: Decimal,
    /// Principal the lender wrote off.
    pub written_off: Decimal,
}

/// What the end-of-round carry did besides costs and yield.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CarryReport {
    pub loans: Vec<LoanSettlement>,
    pub fund_top_ups: Vec<(AgentId, Decimal)>,
}

/// All shared mutable state of the clearing network.
#[derive(Debug, Clone)]
pub struct Network {
    pub(crate) banks: BTreeMap<AgentId, BankAgent>,
    pub(crate) ccp: CcpAgent,
    pub(crate) market: Market,
    loans: Vec<InterbankLoan>,
    next_loan: u64,
}

fn is_live(banks: &BTreeMap<AgentId, BankAgent>, id: &AgentId) -> bool {
    banks.get(id).is_some_and(|b| !b.is_defaulted())
}

impl Network {
    pub fn new(banks: BTreeMap<AgentId, BankAgent>, ccp: CcpAgent, market: Market) -> Self {
        Self {
            banks,
            ccp,
            market,
            loans: Vec::new(),
            next_loan: 0,
        }
    }

    // --- Accessors ---

    pub fn banks(&self) -> &BTreeMap<AgentId, BankAgent> {
        &self.banks
    }

    pub fn bank(&self, id: &AgentId) -> Option<&BankAgent> {
        self.banks.get(id)
    }

    pub fn ccp(&self) -> &CcpAgent {
        &self.ccp
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    /// Outstanding interbank loans in origination order.
    pub fn loans(&self) -> &[InterbankLoan] {
        &self.loans
    }

    fn sheet_mut(&mut self, id: &AgentId) -> Option<&mut BalanceSheet> {
        self.banks.get_mut(id).map(BankAgent::balance_mut)
    }

    fn cash_of(&self, id: &AgentId) -> Decimal {
        self.banks
            .get(id)
            .map_or(Decimal::ZERO, |b| b.balance().cash())
    }

    /// Apply one intent. Never fails: anything that cannot be executed is
    /// reported as skipped and leaves state untouched.
    pub fn apply_intent(
        &mut self,
        intent: &Intent,
        config: &SimulationConfig,
        step: u64,
    ) -> (ApplyOutcome, Option<DefaultEvent>) {
        let agent = intent.agent_id();
        let Some(bank) = self.banks.get(agent) else {
            return (ApplyOutcome::Skipped(SkipReason::UnknownAgent), None);
        };
        if bank.is_defaulted() {
            return (ApplyOutcome::Skipped(SkipReason::AgentDefaulted), None);
        }
        if let Some(cp) = intent.action().counterparty() {
            if cp == agent || !is_live(&self.banks, cp) {
                let reason = SkipReason::CounterpartyUnavailable {
                    counterparty: cp.clone(),
                };
                return (ApplyOutcome::Skipped(reason), None);
            }
        }

        let policy = &config.bank;
        let outcome = match intent.action() {
            Action::ReduceExposure {
                counterparty,
                amount,
                method,
            } => match method {
                ExposureMethod::Unwind => self.unwind(agent, counterparty, *amount, config),
                ExposureMethod::Hedge => self.hedge(agent, counterparty, *amount, config),
            },
            Action::Deleverage { amount } => {
                let sold = non_negative(*amount).min(bank.balance().liquid_assets());
                if sold.is_zero() {
                    ApplyOutcome::Skipped(SkipReason::NothingToDo)
                } else {
                    let haircut = self.market.haircut(sold);
                    self.market.record_sale(sold);
                    if let Some(sheet) = self.sheet_mut(agent) {
                        sheet.sell_liquid_assets(sold, haircut);
                    }
                    partial(*amount, sold)
                }
            }
            Action::RequestLiquidity { lender, amount } => {
                let offered = (self.cash_of(lender) * policy.lender_max_share).round_dp(8);
                let granted = non_negative(*amount).min(offered);
                if granted.is_zero() {
                    ApplyOutcome::Skipped(SkipReason::NothingToDo)
                } else {
                    if let Some(l) = self.sheet_mut(lender) {
                        l.fund(granted);
                        l.adjust_exposure(agent, granted);
                    }
                    if let Some(b) = self.sheet_mut(agent) {
                        b.receive(granted);
                        b.adjust_exposure(lender, -granted);
                    }
                    self.book_loan(lender, agent, granted, policy.funding_rate, config, step);
                    partial(*amount, granted)
                }
            }
            Action::WithdrawCreditLine { fraction } => self.recall_credit(agent, *fraction),
            Action::PostMargin { amount } => {
                let posted = self
                    .sheet_mut(agent)
                    .map_or(Decimal::ZERO, |s| s.post_margin(*amount));
                if posted.is_zero() {
                    ApplyOutcome::Skipped(SkipReason::Unfunded {
                        required: *amount,
                        available: Decimal::ZERO,
                    })
                } else {
                    partial(*amount, posted)
                }
            }
            Action::ExtendCredit {
                borrower,
                amount,
                rate,
            } => {
                let lent = non_negative(*amount).min(bank.balance().available_funding());
                if lent.is_zero() {
                    ApplyOutcome::Skipped(SkipReason::Unfunded {
                        required: *amount,
                        available: Decimal::ZERO,
                    })
                } else {
                    if let Some(l) = self.sheet_mut(agent) {
                        l.fund(lent);
                        l.adjust_exposure(borrower, lent);
                    }
                    if let Some(b) = self.sheet_mut(borrower) {
                        b.receive(lent);
                        b.adjust_exposure(agent, -lent);
                    }
                    self.book_loan(agent, borrower, lent, non_negative(*rate), config, step);
                    partial(*amount, lent)
                }
            }
            Action::RequestMarginRelief { extension_rounds } => {
                let granted = self
                    .ccp
                    .margin_mut()
                    .account_mut(agent)
                    .grant_relief(*extension_rounds, &config.margin);
                if granted == 0 {
                    ApplyOutcome::Skipped(SkipReason::NothingToDo)
                } else {
                    partial(Decimal::from(*extension_rounds), Decimal::from(granted))
                }
            }
            Action::ReportStressSignal {
                liquidity_stress,
                market_volatility,
            } => {
                let report = StressReport {
                    step,
                    liquidity_stress: liquidity_stress.clamp(0.0, 1.0),
                    market_volatility: market_volatility.max(0.0),
                };
                self.ccp.margin_mut().record_report(agent, report);
                ApplyOutcome::Applied
            }
            Action::ExecuteBilateralTrade {
                counterparty,
                notional,
                spread,
            } => {
                let notional = non_negative(*notional);
                if notional.is_zero() {
                    ApplyOutcome::Skipped(SkipReason::NothingToDo)
                } else {
                    let fee = (notional * non_negative(*spread)).round_dp(8);
                    let mut paid = Decimal::ZERO;
                    if let Some(c) = self.sheet_mut(counterparty) {
                        c.adjust_exposure(agent, -notional);
                        paid = fee.min(c.cash());
                        c.fund(paid);
                        c.absorb_loss(paid);
                    }
                    if let Some(b) = self.sheet_mut(agent) {
                        b.adjust_exposure(counterparty, notional);
                        b.receive(paid);
                        b.add_capital(paid);
                    }
                    ApplyOutcome::Applied
                }
            }
            Action::DeclareDefault { reason } => {
                log::warn!("{} declares default at step {}: {}", agent, step, reason);
                let event =
                    self.resolve_default(agent, DefaultTrigger::SelfDeclared, config, step);
                return (ApplyOutcome::Applied, event);
            }
            Action::NoOp => ApplyOutcome::Applied,
        };
        (outcome, None)
    }

    fn book_loan(
        &mut self,
        lender: &AgentId,
        borrower: &AgentId,
        principal: Decimal,
        rate: Decimal,
        config: &SimulationConfig,
        step: u64,
    ) {
        let loan = InterbankLoan {
            id: self.next_loan,
            lender: lender.clone(),
            borrower: borrower.clone(),
            principal,
            rate,
            originated: step,
            maturity: step + config.bank.loan_term_rounds,
        };
        log::debug!(
            "loan #{}: {} -> {} principal {} due at step {}",
            loan.id,
            lender,
            borrower,
            principal,
            loan.maturity
        );
        self.next_loan += 1;
        self.loans.push(loan);
    }

    /// Counterparty repays (claim) or agent repays (liability).
    fn unwind(
        &mut self,
        agent: &AgentId,
        cp: &AgentId,
        amount: Decimal,
        config: &SimulationConfig,
    ) -> ApplyOutcome {
        let exposure = self
            .banks
            .get(agent)
            .map_or(Decimal::ZERO, |b| b.balance().exposure(cp));
        let target = non_negative(amount).min(exposure.abs());
        if target.is_zero() {
            return ApplyOutcome::Skipped(SkipReason::NothingToDo);
        }
        let (payer, payee) = if exposure > Decimal::ZERO {
            (cp, agent)
        } else {
            (agent, cp)
        };
        let payer_cash = self.cash_of(payer);
        let paid = target.min(payer_cash);
        if paid.is_zero() {
            return ApplyOutcome::Skipped(SkipReason::Unfunded {
                required: target,
                available: payer_cash,
            });
        }
        let sign = if exposure > Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };
        let cost = (paid * config.bank.unwind_cost_rate).round_dp(8);
        if let Some(p) = self.sheet_mut(payer) {
            p.fund(paid);
        }
        if let Some(r) = self.sheet_mut(payee) {
            r.receive(paid);
        }
        if let Some(a) = self.sheet_mut(agent) {
            a.adjust_exposure(cp, -sign * paid);
            a.fund(cost);
            a.absorb_loss(cost);
        }
        if let Some(c) = self.sheet_mut(cp) {
            c.adjust_exposure(agent, sign * paid);
        }
        partial(amount, paid)
    }

    fn hedge(
        &mut self,
        agent: &AgentId,
        cp: &AgentId,
        amount: Decimal,
        config: &SimulationConfig,
    ) -> ApplyOutcome {
        let Some(sheet) = self.banks.get(agent).map(BankAgent::balance) else {
            return ApplyOutcome::Skipped(SkipReason::UnknownAgent);
        };
        let room = sheet.effective_exposure(cp);
        let notional = non_negative(amount).min(room);
        if notional.is_zero() {
            return ApplyOutcome::Skipped(SkipReason::NothingToDo);
        }
        let cost = (notional * config.bank.hedge_cost_rate).round_dp(8);
        if !sheet.can_fund(cost) {
            return ApplyOutcome::Skipped(SkipReason::Unfunded {
                required: cost,
                available: sheet.available_funding(),
            });
        }
        if let Some(s) = self.sheet_mut(agent) {
            s.fund(cost);
            s.absorb_loss(cost);
            s.hedge(cp, notional);
        }
        partial(amount, notional)
    }

    fn recall_credit(&mut self, agent: &AgentId, fraction: Decimal) -> ApplyOutcome {
        let fraction = non_negative(fraction).min(Decimal::ONE);
        let claims: Vec<(AgentId, Decimal)> = self
            .banks
            .get(agent)
            .map(|b| {
                b.balance()
                    .exposures()
                    .iter()
                    .filter(|(_, amount)| **amount > Decimal::ZERO)
                    .map(|(cp, amount)| (cp.clone(), *amount))
                    .collect()
            })
            .unwrap_or_default();

        let mut requested = Decimal::ZERO;
        let mut recalled = Decimal::ZERO;
        for (cp, claim) in claims {
            if !is_live(&self.banks, &cp) {
                continue;
            }
            let target = (claim * fraction).round_dp(8);
            let repaid = target.min(self.cash_of(&cp));
            requested += target;
            if repaid.is_zero() {
                continue;
            }
            if let Some(c) = self.sheet_mut(&cp) {
                c.fund(repaid);
                c.adjust_exposure(agent, repaid);
            }
            if let Some(a) = self.sheet_mut(agent) {
                a.receive(repaid);
                a.adjust_exposure(&cp, -repaid);
            }
            recalled += repaid;
        }
        if recalled.is_zero() {
            ApplyOutcome::Skipped(SkipReason::NothingToDo)
        } else {
            partial(requested, recalled)
        }
    }

    /// Close out a defaulting member: seize its margin and cash against the
    /// close-out loss, mutualize the shortfall, pass bilateral losses to
    /// its creditors and drop every edge touching it.
    ///
    /// Returns `None` if the member was already defaulted.
    pub fn resolve_default(
        &mut self,
        agent: &AgentId,
        trigger: DefaultTrigger,
        config: &SimulationConfig,
        step: u64,
    ) -> Option<DefaultEvent> {
        let volatility = from_f64(self.market.state().volatility);
        let sheet = self.sheet_mut(agent)?;
        if sheet.is_defaulted() {
            return None;
        }
        let closeout_loss =
            (sheet.margin_base() * volatility * config.margin.closeout_multiplier).round_dp(8);
        let (seized_margin, seized_cash) = sheet.seize_on_default();
        let shortfall = non_negative(closeout_loss - seized_margin - seized_cash);

        let prior_status = self
            .ccp
            .margin_mut()
            .mark_defaulted(agent)
            .unwrap_or(MemberStatus::Defaulted);
        let mutualization = self.ccp.fund_mut().mutualize(step, agent, shortfall);
        for (survivor, charge) in &mutualization.survivor_charges {
            if let Some(s) = self.sheet_mut(survivor).filter(|s| !s.is_defaulted()) {
                s.absorb_loss(*charge);
            }
        }

        let lgd = config.bank.loss_given_default;
        let mut contagion_losses = BTreeMap::new();
        let others: Vec<AgentId> = self
            .banks
            .keys()
            .filter(|id| *id != agent)
            .cloned()
            .collect();
        for id in others {
            let Some(s) = self.sheet_mut(&id) else {
                continue;
            };
            let claim = s.exposure(agent);
            let unhedged = non_negative(claim - s.hedged(agent));
            s.remove_counterparty(agent);
            if claim > Decimal::ZERO && !s.is_defaulted() {
                let loss = (unhedged * lgd).round_dp(8);
                if loss > Decimal::ZERO {
                    s.absorb_loss(loss);
                    contagion_losses.insert(id, loss);
                }
            }
        }
        if let Some(s) = self.sheet_mut(agent) {
            let counterparties: Vec<AgentId> = s.exposures().keys().cloned().collect();
            for cp in counterparties {
                s.remove_counterparty(&cp);
            }
        }
        self.loans.retain(|loan| &loan.lender != agent && &loan.borrower != agent);

        log::warn!(
            "{} defaulted at step {} ({:?}): close-out loss {}, shortfall {}, fund covered {}",
            agent,
            step,
            trigger,
            closeout_loss,
            shortfall,
            mutualization.covered()
        );
        Some(DefaultEvent {
            step,
            agent: agent.clone(),
            trigger,
            prior_status,
            closeout_loss,
            seized_margin,
            seized_cash,
            shortfall,
            mutualization,
            contagion_losses,
        })
    }

    /// Review every member under the current rate, in id order: issue
    /// calls, move statuses, and default members whose breach ran out or
    /// who are insolvent.
    pub fn review_margins(&mut self, config: &SimulationConfig, step: u64) -> MarginReview {
        let rate = self.ccp.margin().rate();
        let policy = &config.margin;
        let mut review = MarginReview::default();
        let mut to_default: Vec<(AgentId, DefaultTrigger)> = Vec::new();

        let ids: Vec<AgentId> = self.banks.keys().cloned().collect();
        for id in ids {
            let Some(bank) = self.banks.get(&id) else {
                continue;
            };
            if bank.is_defaulted() {
                continue;
            }
            let sheet = bank.balance();
            let required = (sheet.margin_base() * rate).round_dp(8);
            let posted = sheet.posted_margin();
            let insolvent = sheet.capital_buffer() < Decimal::ZERO
                && sheet.available_funding().is_zero()
                && sheet.liquid_assets().is_zero();

            let account = self.ccp.margin_mut().account_mut(&id);
            let outcome = account.review(required, posted, policy);
            if let Some(call) = outcome.call_issued {
                self.ccp.margin_mut().count_call();
                log::debug!("margin call of {} to {} at step {}", call, id, step);
                review.calls_issued.push((id.clone(), call));
            }
            if let Some((from, to)) = outcome.transition {
                log::info!("{}: {} -> {} at step {}", id, from, to, step);
                review.transitions.push(StatusTransition {
                    agent: id.clone(),
                    step,
                    from,
                    to,
                });
                if to == MemberStatus::Defaulted {
                    to_default.push((id.clone(), DefaultTrigger::MarginBreach));
                    continue;
                }
            }
            if insolvent {
                to_default.push((id.clone(), DefaultTrigger::Insolvency));
            }
        }

        for (id, trigger) in to_default {
            // The account is already marked defaulted by the time the
            // close-out runs, so carry the status it left from.
            let mut prior = Some(MemberStatus::InBreach);
            if trigger == DefaultTrigger::Insolvency {
                prior = self.ccp.margin_mut().mark_defaulted(&id);
                if let Some(from) = prior {
                    review.transitions.push(StatusTransition {
                        agent: id.clone(),
                        step,
                        from,
                        to: MemberStatus::Defaulted,
                    });
                }
            }
            if let Some(mut event) = self.resolve_default(&id, trigger, config, step) {
                if let Some(from) = prior {
                    event.prior_status = from;
                }
                review.defaults.push(event);
            }
        }
        review
    }

    /// End-of-round carry for live banks: loans falling due are collected,
    /// members top up the default fund under the replenishment policy,
    /// then operating cost and margin carry come out of cash (any unfunded
    /// part is a capital loss) and liquid assets yield into cash.
    pub fn apply_carry(&mut self, config: &SimulationConfig, step: u64) -> CarryReport {
        let loans = self.settle_loans(config, step);
        let fund_top_ups = self.replenish_fund(config);

        let policy = &config.bank;
        for bank in self.banks.values_mut() {
            if bank.is_defaulted() {
                continue;
            }
            let sheet = bank.balance_mut();
            let cost = policy.operating_cost
                + (sheet.posted_margin() * policy.margin_carry_cost).round_dp(8);
            let unfunded = sheet.fund(cost);
            sheet.absorb_loss(cost);
            let income = (sheet.liquid_assets() * policy.asset_yield).round_dp(8);
            sheet.receive(income);
            sheet.add_capital(income);
            if unfunded > Decimal::ZERO {
                log::debug!("{} could not fund carry of {}", bank.id(), unfunded);
            }
        }
        CarryReport {
            loans,
            fund_top_ups,
        }
    }

    /// Collect every loan at or past maturity. A borrower that cannot pay
    /// in full stays overdue until the grace period ends; then it pays a
    /// share of its cash and the lender writes off the unpaid principal.
    fn settle_loans(&mut self, config: &SimulationConfig, step: u64) -> Vec<LoanSettlement> {
        let policy = &config.bank;
        let mut settlements = Vec::new();
        for loan in std::mem::take(&mut self.loans) {
            if step < loan.maturity {
                self.loans.push(loan);
                continue;
            }
            if !is_live(&self.banks, &loan.lender) || !is_live(&self.banks, &loan.borrower) {
                continue;
            }
            let claim = self
                .banks
                .get(&loan.lender)
                .map_or(Decimal::ZERO, |b| non_negative(b.balance().exposure(&loan.borrower)));
            let principal = loan.principal.min(claim);
            if principal.is_zero() {
                continue;
            }
            let due = (principal * (Decimal::ONE + loan.rate)).round_dp(8);
            let cash = self.cash_of(&loan.borrower);

            let (status, paid) = if cash >= due {
                (LoanStatus::Repaid, due)
            } else if step > loan.maturity + policy.loan_grace_rounds {
                let paid = (cash * policy.forced_settlement_share).round_dp(8).min(due);
                (LoanStatus::ForcedSettlement, paid)
            } else {
                log::debug!("loan #{} overdue: {} owes {}", loan.id, loan.borrower, due);
                settlements.push(LoanSettlement {
                    step,
                    loan: loan.clone(),
                    status: LoanStatus::Overdue,
                    paid: Decimal::ZERO,
                    written_off: Decimal::ZERO,
                });
                self.loans.push(loan);
                continue;
            };

            let principal_paid = paid.min(principal);
            let interest_paid = paid - principal_paid;
            let written_off = principal - principal_paid;
            if let Some(b) = self.sheet_mut(&loan.borrower) {
                b.fund(paid);
                b.adjust_exposure(&loan.lender, principal);
                b.absorb_loss(interest_paid);
                b.add_capital(written_off);
            }
            if let Some(l) = self.sheet_mut(&loan.lender) {
                l.receive(paid);
                l.adjust_exposure(&loan.borrower, -principal);
                l.add_capital(interest_paid);
                l.absorb_loss(written_off);
            }
            if written_off > Decimal::ZERO {
                log::warn!(
                    "loan #{} force-settled at step {}: {} wrote off {} owed by {}",
                    loan.id,
                    step,
                    loan.lender,
                    written_off,
                    loan.borrower
                );
            }
            settlements.push(LoanSettlement {
                step,
                loan,
                status,
                paid,
                written_off,
            });
        }
        settlements
    }

    /// Live members restore their fund contribution from cash, a fraction
    /// of the gap per round.
    fn replenish_fund(&mut self, config: &SimulationConfig) -> Vec<(AgentId, Decimal)> {
        let rate = config.default_fund.replenish_rate;
        let mut top_ups = Vec::new();
        if rate.is_zero() {
            return top_ups;
        }
        let ids: Vec<AgentId> = self.banks.keys().cloned().collect();
        for id in ids {
            if !is_live(&self.banks, &id) {
                continue;
            }
            let gap = self.ccp.fund().replenish_gap(&id);
            let amount = (gap * rate).round_dp(8).min(self.cash_of(&id));
            if amount <= Decimal::ZERO {
                continue;
            }
            if let Some(s) = self.sheet_mut(&id) {
                s.fund(amount);
            }
            self.ccp.fund_mut().replenish(&id, amount);
            top_ups.push((id, amount));
        }
        top_ups
    }
}

fn partial(requested: Decimal, filled: Decimal) -> ApplyOutcome {
    if filled >= requested {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Partial { requested, filled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default_fund::DefaultFund;
    use crate::agents::margin::MarginState;
    use crate::belief::state::BeliefState;
    use crate::core::config::{BeliefPriors, MarketConfig};
    use rust_decimal_macros::dec;

    fn id(s: &str) -> AgentId {
        AgentId::new(s)
    }

    fn network() -> Network {
        let a = BalanceSheet::new(dec!(100), dec!(50), dec!(40), dec!(10))
            .with_exposure(id("B"), dec!(60))
            .with_posted_margin(dec!(24));
        let b = BalanceSheet::new(dec!(80), dec!(40), dec!(20), dec!(10))
            .with_exposure(id("A"), dec!(-60))
            .with_exposure(id("C"), dec!(30))
            .with_posted_margin(dec!(36));
        let c = BalanceSheet::new(dec!(50), dec!(30), dec!(10), dec!(10))
            .with_exposure(id("B"), dec!(-30))
            .with_posted_margin(dec!(12));
        let priors = BeliefPriors::default();
        let banks: BTreeMap<AgentId, BankAgent> = [("A", a), ("B", b), ("C", c)]
            .into_iter()
            .map(|(name, sheet)| {
                (
                    id(name),
                    BankAgent::new(id(name), sheet, BeliefState::from_priors(&priors)),
                )
            })
            .collect();
        let mut fund = DefaultFund::new();
        fund.contribute(&id("A"), dec!(5));
        fund.contribute(&id("B"), dec!(4));
        fund.contribute(&id("C"), dec!(2));
        let ccp = CcpAgent::new(MarginState::new(dec!(0.4), banks.keys().cloned()), fund);
        Network::new(banks, ccp, Market::new(MarketConfig::default(), 1))
    }

    fn intent(agent: &str, action: Action) -> Intent {
        Intent::new(id(agent), 1, action)
    }

    fn total_cash(n: &Network) -> Decimal {
        n.banks().values().map(|b| b.balance().cash()).sum()
    }

    #[test]
    fn test_unwind_moves_cash_and_mirrors_exposure() {
        let mut n = network();
        let config = SimulationConfig::default();
        let (outcome, _) = n.apply_intent(
            &intent(
                "A",
                Action::ReduceExposure {
                    counterparty: id("B"),
                    amount: dec!(20),
                    method: ExposureMethod::Unwind,
                },
            ),
            &config,
            1,
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
        let a = n.bank(&id("A")).unwrap().balance();
        let b = n.bank(&id("B")).unwrap().balance();
        assert_eq!(a.exposure(&id("B")), dec!(40));
        assert_eq!(b.exposure(&id("A")), dec!(-40));
        assert_eq!(b.cash(), dec!(60));
        // 20 received, 0.2 unwind cost.
        assert_eq!(a.cash(), dec!(119.8));
    }

    #[test]
    fn test_hedge_reduces_margin_base() {
        let mut n = network();
        let config = SimulationConfig::default();
        n.apply_intent(
            &intent(
                "A",
                Action::ReduceExposure {
                    counterparty: id("B"),
                    amount: dec!(30),
                    method: ExposureMethod::Hedge,
                },
            ),
            &config,
            1,
        );
        let a = n.bank(&id("A")).unwrap().balance();
        assert_eq!(a.margin_base(), dec!(30));
        assert_eq!(a.cash(), dec!(99.4));
    }

    #[test]
    fn test_post_margin_partial_when_underfunded() {
        let mut n = network();
        let config = SimulationConfig::default();
        let (outcome, _) = n.apply_intent(
            &intent("C", Action::PostMargin { amount: dec!(100) }),
            &config,
            1,
        );
        assert_eq!(
            outcome,
            ApplyOutcome::Partial {
                requested: dec!(100),
                filled: dec!(60)
            }
        );
        let c = n.bank(&id("C")).unwrap().balance();
        assert_eq!(c.cash(), Decimal::ZERO);
        assert_eq!(c.posted_margin(), dec!(72));
    }

    #[test]
    fn test_action_against_defaulted_counterparty_is_skipped() {
        let mut n = network();
        let config = SimulationConfig::default();
        n.resolve_default(&id("C"), DefaultTrigger::SelfDeclared, &config, 1);
        let before = total_cash(&n);
        let (outcome, _) = n.apply_intent(
            &intent(
                "B",
                Action::ExtendCredit {
                    borrower: id("C"),
                    amount: dec!(5),
                    rate: dec!(0.05),
                },
            ),
            &config,
            1,
        );
        assert!(matches!(
            outcome,
            ApplyOutcome::Skipped(SkipReason::CounterpartyUnavailable { .. })
        ));
        assert_eq!(total_cash(&n), before);
    }

    #[test]
    fn test_default_waterfall() {
        let mut n = network();
        let config = SimulationConfig::default();
        // B: margin base 90, vol 0.2, multiplier 1.25 -> close-out 22.5,
        // fully covered by 36 posted.
        let event = n
            .resolve_default(&id("B"), DefaultTrigger::MarginBreach, &config, 3)
            .unwrap();
        assert_eq!(event.closeout_loss, dec!(22.5));
        assert_eq!(event.shortfall, Decimal::ZERO);
        assert!(event.mutualization.deficit.is_none());
        // C owed B, so no contagion for C; A had a 60 claim on B.
        assert_eq!(event.contagion_losses.len(), 1);
        assert_eq!(event.contagion_losses[&id("A")], dec!(27));
        let a = n.bank(&id("A")).unwrap().balance();
        assert_eq!(a.capital_buffer(), dec!(23));
        assert!(a.exposures().is_empty());
        assert!(n.bank(&id("B")).unwrap().balance().exposures().is_empty());
        assert_eq!(n.ccp().margin().status(&id("B")), MemberStatus::Defaulted);
        assert!(n
            .resolve_default(&id("B"), DefaultTrigger::MarginBreach, &config, 4)
            .is_none());
    }

    #[test]
    fn test_second_default_spares_earlier_defaulter() {
        let mut n = network();
        let config = SimulationConfig::default();
        // C: close-out 7.5 against 12 posted, so its 2 is forfeited unused.
        let first = n
            .resolve_default(&id("C"), DefaultTrigger::SelfDeclared, &config, 1)
            .unwrap();
        assert_eq!(first.shortfall, Decimal::ZERO);
        assert_eq!(n.ccp().fund().forfeited(), dec!(2));

        let drained = BalanceSheet::new(dec!(0), dec!(40), dec!(20), dec!(0))
            .with_exposure(id("A"), dec!(-60));
        *n.sheet_mut(&id("B")).unwrap() = drained;
        let second = n
            .resolve_default(&id("B"), DefaultTrigger::Insolvency, &config, 2)
            .unwrap();
        // Close-out 15, nothing to seize: 4 own, 2 forfeited, 5 from A.
        assert_eq!(second.shortfall, dec!(15));
        let m = &second.mutualization;
        assert_eq!(m.own_consumed, dec!(4));
        assert_eq!(m.forfeited_consumed, dec!(2));
        assert!(!m.survivor_charges.contains_key(&id("C")));
        assert_eq!(m.survivor_charges[&id("A")], dec!(5));
        assert_eq!(m.deficit.as_ref().map(|d| d.amount), Some(dec!(4)));
        let c = n.bank(&id("C")).unwrap().balance();
        assert_eq!(c.capital_buffer(), dec!(30));
    }

    #[test]
    fn test_declare_default_intent_resolves_default() {
        let mut n = network();
        let config = SimulationConfig::default();
        let (outcome, event) = n.apply_intent(
            &intent(
                "C",
                Action::DeclareDefault {
                    reason: "test".into(),
                },
            ),
            &config,
            2,
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(event.unwrap().trigger, DefaultTrigger::SelfDeclared);
        assert!(n.bank(&id("C")).unwrap().is_defaulted());
        let (outcome, _) = n.apply_intent(&intent("C", Action::NoOp), &config, 2);
        assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::AgentDefaulted));
    }

    #[test]
    fn test_review_issues_call_on_rate_increase() {
        let mut n = network();
        let config = SimulationConfig::default();
        n.ccp.margin_mut().set_rate(dec!(0.5), 20.0, 20.0, 3);
        let review = n.review_margins(&config, 1);
        // A: 60 x 0.5 - 24 = 6; B: 90 x 0.5 - 36 = 9; C: 30 x 0.5 - 12 = 3.
        assert_eq!(
            review.calls_issued,
            vec![(id("A"), dec!(6)), (id("B"), dec!(9)), (id("C"), dec!(3))]
        );
        assert!(review.defaults.is_empty());
    }

    fn lend(n: &mut Network, lender: &str, borrower: &str, amount: Decimal) {
        let config = SimulationConfig::default();
        let action = Action::ExtendCredit {
            borrower: id(borrower),
            amount,
            rate: dec!(0.05),
        };
        let (outcome, _) = n.apply_intent(&intent(lender, action), &config, 1);
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_loan_repaid_with_interest_at_maturity() {
        let mut n = network();
        let config = SimulationConfig::default();
        lend(&mut n, "A", "C", dec!(10));
        assert_eq!(n.loans().len(), 1);
        assert_eq!(n.loans()[0].maturity, 6);
        assert_eq!(n.bank(&id("A")).unwrap().balance().cash(), dec!(90));

        assert!(n.settle_loans(&config, 5).is_empty());
        let settled = n.settle_loans(&config, 6);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].status, LoanStatus::Repaid);
        assert_eq!(settled[0].paid, dec!(10.5));
        assert!(n.loans().is_empty());

        let a = n.bank(&id("A")).unwrap().balance();
        let c = n.bank(&id("C")).unwrap().balance();
        assert_eq!(a.cash(), dec!(100.5));
        assert_eq!(a.capital_buffer(), dec!(50.5));
        assert_eq!(a.exposure(&id("C")), Decimal::ZERO);
        assert_eq!(c.cash(), dec!(49.5));
        assert_eq!(c.capital_buffer(), dec!(29.5));
        assert_eq!(c.exposure(&id("A")), Decimal::ZERO);
    }

    #[test]
    fn test_overdue_loan_is_force_settled_after_grace() {
        let mut n = network();
        let config = SimulationConfig::default();
        lend(&mut n, "A", "C", dec!(40));
        n.sheet_mut(&id("C")).unwrap().fund(dec!(85));

        let overdue = n.settle_loans(&config, 6);
        assert_eq!(overdue[0].status, LoanStatus::Overdue);
        assert_eq!(n.loans().len(), 1);
        assert_eq!(n.settle_loans(&config, 8)[0].status, LoanStatus::Overdue);

        // 80% of the 5 left in cash; the other 36 of principal is lost.
        let forced = n.settle_loans(&config, 9);
        assert_eq!(forced[0].status, LoanStatus::ForcedSettlement);
        assert_eq!(forced[0].paid, dec!(4));
        assert_eq!(forced[0].written_off, dec!(36));
        assert!(n.loans().is_empty());
        let a = n.bank(&id("A")).unwrap().balance();
        assert_eq!(a.cash(), dec!(64));
        assert_eq!(a.capital_buffer(), dec!(14));
        assert!(a.exposures().get(&id("C")).is_none());
        assert_eq!(n.bank(&id("C")).unwrap().balance().cash(), dec!(1));
    }

    #[test]
    fn test_unwound_loan_is_not_collected_again() {
        let mut n = network();
        let config = SimulationConfig::default();
        lend(&mut n, "A", "C", dec!(20));
        n.apply_intent(
            &intent(
                "A",
                Action::ReduceExposure {
                    counterparty: id("C"),
                    amount: dec!(20),
                    method: ExposureMethod::Unwind,
                },
            ),
            &config,
            2,
        );
        let cash_before = n.bank(&id("C")).unwrap().balance().cash();
        assert!(n.settle_loans(&config, 6).is_empty());
        assert!(n.loans().is_empty());
        assert_eq!(n.bank(&id("C")).unwrap().balance().cash(), cash_before);
    }

    #[test]
    fn test_default_drops_loans_of_defaulter() {
        let mut n = network();
        let config = SimulationConfig::default();
        lend(&mut n, "A", "C", dec!(10));
        lend(&mut n, "B", "A", dec!(5));
        n.resolve_default(&id("C"), DefaultTrigger::SelfDeclared, &config, 2);
        assert_eq!(n.loans().len(), 1);
        assert_eq!(n.loans()[0].lender, id("B"));
    }

    #[test]
    fn test_carry_replenishes_fund_after_loss() {
        let mut n = network();
        let mut config = SimulationConfig::default();
        config.default_fund.replenish_rate = dec!(0.5);
        // C's 2 plus all of A's 5 and B's 4.
        n.ccp.fund_mut().mutualize(1, &id("C"), dec!(11));
        assert_eq!(n.ccp().fund().balance(), Decimal::ZERO);

        let carry = n.apply_carry(&config, 1);
        assert_eq!(
            carry.fund_top_ups,
            vec![(id("A"), dec!(2.5)), (id("B"), dec!(2))]
        );
        assert_eq!(n.ccp().fund().contribution(&id("A")), dec!(2.5));
        assert_eq!(n.ccp().fund().balance(), dec!(4.5));
    }

    #[test]
    fn test_cash_never_negative_after_carry() {
        let mut n = network();
        let config = SimulationConfig::default();
        for _ in 0..500 {
            n.apply_carry(&config, 1);
        }
        assert!(n
            .banks()
            .values()
            .all(|b| b.balance().cash() >= Decimal::ZERO));
    }
}
