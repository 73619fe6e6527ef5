use crate::agents::margin::{MemberStatus, StressReport};
use crate::core::agent_id::AgentId;
use crate::core::balance_sheet::BalanceSheet;
use crate::core::error::StateError;
use crate::simulation::market::MarketState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What every agent may see about one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankView {
    pub balance: BalanceSheet,
    pub stressed: bool,
    pub status: MemberStatus,
    pub required_margin: Decimal,
    pub outstanding_call: Decimal,
    /// Consecutive reviews with the call unmet.
    pub unmet_rounds: u32,
    /// Extra grace rounds granted through relief requests.
    pub relief_granted: u32,
    /// Latest stress report the member published, if any.
    pub report: Option<StressReport>,
}

impl BankView {
    pub fn is_live(&self) -> bool {
        !self.balance.is_defaulted()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginSummary {
    pub rate: Decimal,
    /// Smoothed stress index the rate was last set from.
    pub stress_index: f64,
    pub calls_outstanding: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundSummary {
    pub balance: Decimal,
    pub contributions: BTreeMap<AgentId, Decimal>,
    /// Leftover contributions of defaulted members.
    #[serde(default)]
    pub forfeited: Decimal,
    pub losses_absorbed: Decimal,
    /// Cumulative loss the fund could not cover.
    pub unfunded_deficit: Decimal,
}

/// Immutable, round-scoped view of the whole network.
///
/// Produced once at the end of a round and distributed (behind an `Arc`)
/// to every agent for the next one. `step` is the round that produced it;
/// decisions made against it are for round `step + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub step: u64,
    pub banks: BTreeMap<AgentId, BankView>,
    pub margin: MarginSummary,
    pub fund: FundSummary,
    pub market: MarketState,
    /// Members that defaulted in the round that produced this snapshot.
    pub new_defaults: Vec<AgentId>,
}

impl Snapshot {
    pub fn view(&self, agent: &AgentId) -> Result<&BankView, StateError> {
        self.banks
            .get(agent)
            .ok_or_else(|| StateError::MissingAgent(agent.clone()))
    }

    pub fn live_banks(&self) -> impl Iterator<Item = (&AgentId, &BankView)> {
        self.banks.iter().filter(|(_, v)| v.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.live_banks().count()
    }

    pub fn defaulted_count(&self) -> usize {
        self.banks.len() - self.live_count()
    }

    fn live_fraction(&self, pred: impl Fn(&BankView) -> bool) -> f64 {
        let live = self.live_count();
        if live == 0 {
            return 0.0;
        }
        self.live_banks().filter(|(_, v)| pred(v)).count() as f64 / live as f64
    }

    pub fn stressed_fraction(&self) -> f64 {
        self.live_fraction(|v| v.stressed)
    }

    pub fn breach_fraction(&self) -> f64 {
        self.live_fraction(|v| v.status == MemberStatus::InBreach)
    }

    /// Mean liquidity stress across the latest reports of live members.
    pub fn mean_reported_stress(&self) -> Option<f64> {
        let reports: Vec<f64> = self
            .live_banks()
            .filter_map(|(_, v)| v.report.as_ref())
            .map(|r| r.liquidity_stress)
            .collect();
        if reports.is_empty() {
            None
        } else {
            Some(reports.iter().sum::<f64>() / reports.len() as f64)
        }
    }

    /// Structural checks an agent runs before deciding against this view.
    pub fn check_consistency(&self) -> Result<(), StateError> {
        if !self.market.volatility.is_finite() || self.market.volatility < 0.0 {
            return Err(StateError::Malformed(format!(
                "market volatility {}",
                self.market.volatility
            )));
        }
        if self.margin.rate < Decimal::ZERO {
            return Err(StateError::Malformed(format!(
                "negative margin rate {}",
                self.margin.rate
            )));
        }
        for (id, view) in self.live_banks() {
            if view.balance.cash() < Decimal::ZERO {
                return Err(StateError::Malformed(format!("{} has negative cash", id)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Snapshot (step {}) ===", self.step)?;
        writeln!(f, "Margin rate:   {}", self.margin.rate)?;
        writeln!(f, "Stress index:  {:.2}", self.margin.stress_index)?;
        writeln!(f, "Volatility:    {:.4}", self.market.volatility)?;
        writeln!(f, "Fund balance:  {}", self.fund.balance)?;
        writeln!(f, "Deficit:       {}", self.fund.unfunded_deficit)?;
        writeln!(f, "\nMembers:")?;
        for (id, view) in &self.banks {
            writeln!(
                f,
                "  {:<10} {:<10} cash {:>12} posted {:>10} call {:>10}{}",
                id.to_string(),
                view.status.to_string(),
                view.balance.cash().round_dp(2),
                view.balance.posted_margin().round_dp(2),
                view.outstanding_call.round_dp(2),
                if view.stressed { "  stressed" } else { "" }
            )?;
        }
        Ok(())
    }
}
