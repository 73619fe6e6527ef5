use crate::core::agent_id::AgentId;
use crate::core::config::MarginPolicy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Member status as tracked by the CCP.
///
/// ```text
/// current -> in_breach -> cured -> current
///                      \-> defaulted (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Current,
    InBreach,
    Cured,
    Defaulted,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Current => "current",
            MemberStatus::InBreach => "in_breach",
            MemberStatus::Cured => "cured",
            MemberStatus::Defaulted => "defaulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub agent: AgentId,
    pub step: u64,
    pub from: MemberStatus,
    pub to: MemberStatus,
}

/// A member's published view of its own stress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub step: u64,
    pub liquidity_stress: f64,
    pub market_volatility: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarginAccount {
    pub required: Decimal,
    pub posted: Decimal,
    pub outstanding_call: Decimal,
    pub status: MemberStatus,
    /// Consecutive reviews with the call still unmet.
    pub unmet_rounds: u32,
    pub breach_rounds: u32,
    /// Grace rounds granted through relief requests.
    pub relief_granted: u32,
}

/// Result of one margin review of one member.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Review {
    pub transition: Option<(MemberStatus, MemberStatus)>,
    /// Set when a new call was issued this review.
    pub call_issued: Option<Decimal>,
}

impl MarginAccount {
    pub fn is_defaulted(&self) -> bool {
        self.status == MemberStatus::Defaulted
    }

    /// Rounds an unmet call is tolerated before breach.
    pub fn effective_grace(&self, policy: &MarginPolicy) -> u32 {
        policy.grace_period + self.relief_granted
    }

    fn move_to(&mut self, to: MemberStatus, review: &mut Review) {
        let from = self.status;
        if from != to {
            self.status = to;
            review.transition = Some((from, to));
        }
    }

    /// Review the account against the requirement under the new rate.
    pub fn review(&mut self, required: Decimal, posted: Decimal, policy: &MarginPolicy) -> Review {
        let mut review = Review::default();
        if self.is_defaulted() {
            return review;
        }
        self.required = required;
        self.posted = posted;
        let shortfall = (required - posted).max(Decimal::ZERO);
        let prior_call = self.outstanding_call;

        if prior_call > Decimal::ZERO && shortfall > Decimal::ZERO {
            self.unmet_rounds += 1;
            match self.status {
                MemberStatus::Current | MemberStatus::Cured => {
                    if self.unmet_rounds > self.effective_grace(policy) {
                        self.breach_rounds = 0;
                        self.move_to(MemberStatus::InBreach, &mut review);
                    }
                }
                MemberStatus::InBreach => {
                    self.breach_rounds += 1;
                    if self.breach_rounds >= policy.max_breach_duration {
                        self.move_to(MemberStatus::Defaulted, &mut review);
                    }
                }
                MemberStatus::Defaulted => {}
            }
        } else if prior_call > Decimal::ZERO {
            self.unmet_rounds = 0;
            match self.status {
                MemberStatus::InBreach => {
                    self.breach_rounds = 0;
                    self.move_to(MemberStatus::Cured, &mut review);
                }
                MemberStatus::Cured => self.move_to(MemberStatus::Current, &mut review),
                _ => {}
            }
        } else if self.status == MemberStatus::Cured {
            self.move_to(MemberStatus::Current, &mut review);
        }

        if shortfall > Decimal::ZERO && prior_call.is_zero() {
            self.unmet_rounds = 0;
            review.call_issued = Some(shortfall);
        }
        self.outstanding_call = if self.is_defaulted() {
            Decimal::ZERO
        } else {
            shortfall
        };
        review
    }

    /// Grant up to `rounds` of extra grace within the policy limit.
    pub fn grant_relief(&mut self, rounds: u32, policy: &MarginPolicy) -> u32 {
        let remaining = policy.max_relief_rounds.saturating_sub(self.relief_granted);
        let granted = rounds.min(remaining);
        self.relief_granted += granted;
        granted
    }
}

/// CCP margin state: rate, per-member accounts and stress history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginState {
    rate: Decimal,
    accounts: BTreeMap<AgentId, MarginAccount>,
    stress_history: VecDeque<f64>,
    stress_index: f64,
    reports: BTreeMap<AgentId, StressReport>,
    calls_issued: u64,
}

impl MarginState {
    pub fn new(rate: Decimal, members: impl IntoIterator<Item = AgentId>) -> Self {
        Self {
            rate,
            accounts: members
                .into_iter()
                .map(|id| (id, MarginAccount::default()))
                .collect(),
            stress_history: VecDeque::new(),
            stress_index: 0.0,
            reports: BTreeMap::new(),
            calls_issued: 0,
        }
    }

    // --- Accessors ---

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn stress_index(&self) -> f64 {
        self.stress_index
    }

    pub fn stress_history(&self) -> &VecDeque<f64> {
        &self.stress_history
    }

    pub fn accounts(&self) -> &BTreeMap<AgentId, MarginAccount> {
        &self.accounts
    }

    pub fn account(&self, agent: &AgentId) -> Option<&MarginAccount> {
        self.accounts.get(agent)
    }

    pub fn status(&self, agent: &AgentId) -> MemberStatus {
        self.accounts
            .get(agent)
            .map(|a| a.status)
            .unwrap_or_default()
    }

    pub fn report(&self, agent: &AgentId) -> Option<&StressReport> {
        self.reports.get(agent)
    }

    pub fn calls_issued(&self) -> u64 {
        self.calls_issued
    }

    pub fn calls_outstanding(&self) -> usize {
        self.accounts
            .values()
            .filter(|a| a.outstanding_call > Decimal::ZERO)
            .count()
    }

    // --- Mutations (CCP round step only) ---

    pub(crate) fn account_mut(&mut self, agent: &AgentId) -> &mut MarginAccount {
        self.accounts.entry(agent.clone()).or_default()
    }

    /// Set the rate and roll the stress history window.
    pub(crate) fn set_rate(
        &mut self,
        rate: Decimal,
        raw_stress: f64,
        smoothed: f64,
        window: usize,
    ) {
        self.rate = rate;
        self.stress_history.push_back(raw_stress);
        while self.stress_history.len() > window {
            self.stress_history.pop_front();
        }
        self.stress_index = smoothed;
    }

    pub(crate) fn record_report(&mut self, agent: &AgentId, report: StressReport) {
        self.reports.insert(agent.clone(), report);
    }

    pub(crate) fn count_call(&mut self) {
        self.calls_issued += 1;
    }

    /// Force the member to defaulted (self-declared default).
    pub(crate) fn mark_defaulted(&mut self, agent: &AgentId) -> Option<MemberStatus> {
        let account = self.account_mut(agent);
        if account.is_defaulted() {
            return None;
        }
        let from = account.status;
        account.status = MemberStatus::Defaulted;
        account.outstanding_call = Decimal::ZERO;
        Some(from)
    }
}
