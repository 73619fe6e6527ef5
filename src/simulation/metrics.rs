use crate::belief::state::BeliefSummary;
use crate::core::intent::ActionKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stressed share of live members at which the market counts as frozen.
pub const FREEZE_THRESHOLD: f64 = 0.5;

/// Aggregate state of the network after one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    pub new_defaults: usize,
    pub total_defaults: usize,
    pub active_banks: usize,
    pub stressed_banks: usize,
    pub liquidity_freeze: bool,
    pub total_cash: Decimal,
    pub total_exposure: Decimal,
    pub total_posted_margin: Decimal,
    /// Mean belief of live members.
    pub average_belief: BeliefSummary,
    pub action_counts: BTreeMap<ActionKind, usize>,
    pub margin_calls: usize,
    pub margin_rate: Decimal,
    pub stress_index: f64,
    pub volatility: f64,
    pub fund_balance: Decimal,
    pub unfunded_deficit: Decimal,
    pub degraded_agents: usize,
}

impl StepMetrics {
    pub fn stressed_fraction(&self) -> f64 {
        if self.active_banks == 0 {
            0.0
        } else {
            self.stressed_banks as f64 / self.active_banks as f64
        }
    }
}

/// Mean of a set of belief summaries; the default summary when empty.
pub fn average_beliefs<'a>(beliefs: impl IntoIterator<Item = &'a BeliefSummary>) -> BeliefSummary {
    let mut sum = BeliefSummary::default();
    let mut n = 0usize;
    for b in beliefs {
        sum.counterparty_risk += b.counterparty_risk;
        sum.liquidity_stress += b.liquidity_stress;
        sum.margin_call_size += b.margin_call_size;
        sum.market_volatility += b.market_volatility;
        n += 1;
    }
    if n == 0 {
        return sum;
    }
    let n = n as f64;
    BeliefSummary {
        counterparty_risk: sum.counterparty_risk / n,
        liquidity_stress: sum.liquidity_stress / n,
        margin_call_size: sum.margin_call_size / n,
        market_volatility: sum.market_volatility / n,
    }
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps: u64,
    pub bank_count: usize,
    pub total_defaults: usize,
    pub defaulted: Vec<String>,
    pub peak_margin_rate: Decimal,
    pub final_margin_rate: Decimal,
    pub peak_stress_index: f64,
    pub freeze_rounds: usize,
    pub margin_calls: usize,
    pub fund_losses_absorbed: Decimal,
    pub final_fund_balance: Decimal,
    pub unfunded_deficit: Decimal,
    pub degraded_decisions: usize,
    pub rejected_intents: usize,
    pub history: Vec<StepMetrics>,
}

impl RunSummary {
    pub fn from_history(
        bank_count: usize,
        defaulted: Vec<String>,
        fund_losses_absorbed: Decimal,
        rejected_intents: usize,
        history: Vec<StepMetrics>,
    ) -> Self {
        let last = history.last().cloned().unwrap_or_default();
        Self {
            steps: last.step,
            bank_count,
            total_defaults: defaulted.len(),
            defaulted,
            peak_margin_rate: history
                .iter()
                .map(|m| m.margin_rate)
                .max()
                .unwrap_or(Decimal::ZERO),
            final_margin_rate: last.margin_rate,
            peak_stress_index: history
                .iter()
                .map(|m| m.stress_index)
                .fold(0.0, f64::max),
            freeze_rounds: history.iter().filter(|m| m.liquidity_freeze).count(),
            margin_calls: history.iter().map(|m| m.margin_calls).sum(),
            fund_losses_absorbed,
            final_fund_balance: last.fund_balance,
            unfunded_deficit: last.unfunded_deficit,
            degraded_decisions: history.iter().map(|m| m.degraded_agents).sum(),
            rejected_intents,
            history,
        }
    }

    pub fn survival_rate(&self) -> f64 {
        if self.bank_count == 0 {
            return 1.0;
        }
        1.0 - self.total_defaults as f64 / self.bank_count as f64
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Simulation Summary ===")?;
        writeln!(f, "Steps:             {}", self.steps)?;
        writeln!(f, "Banks:             {}", self.bank_count)?;
        writeln!(
            f,
            "Defaults:          {} ({:.1}% survived)",
            self.total_defaults,
            self.survival_rate() * 100.0
        )?;
        writeln!(f, "Margin calls:      {}", self.margin_calls)?;
        writeln!(f, "Peak margin rate:  {}", self.peak_margin_rate)?;
        writeln!(f, "Final margin rate: {}", self.final_margin_rate)?;
        writeln!(f, "Peak stress index: {:.2}", self.peak_stress_index)?;
        writeln!(f, "Freeze rounds:     {}", self.freeze_rounds)?;
        writeln!(f, "Fund losses:       {}", self.fund_losses_absorbed.round_dp(2))?;
        writeln!(f, "Fund balance:      {}", self.final_fund_balance.round_dp(2))?;
        writeln!(f, "Unfunded deficit:  {}", self.unfunded_deficit.round_dp(2))?;
        writeln!(f, "Degraded:          {}", self.degraded_decisions)?;
        writeln!(f, "Rejected intents:  {}", self.rejected_intents)?;

        if !self.defaulted.is_empty() {
            writeln!(f, "\nDefaulted Members:")?;
            for id in &self.defaulted {
                writeln!(f, "  {}", id)?;
            }
        }
        Ok(())
    }
}
