use crate::agents::default_fund::DefaultFund;
use crate::agents::margin::{MarginState, MemberStatus};
use crate::belief::utility::logistic;
use crate::core::agent_id::AgentId;
use crate::core::amount::{from_f64, to_f64};
use crate::core::config::{MarginPolicy, SimulationConfig};
use crate::core::snapshot::Snapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One margin-rate candidate and its scalarized score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCandidate {
    pub offset: Decimal,
    pub rate: Decimal,
    pub utility: f64,
    pub mean_default_probability: f64,
    pub expected_loss: f64,
    pub liquidity_retained: f64,
}

/// The CCP's decision for one round, computed against the prior snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcpDecision {
    pub step: u64,
    pub raw_stress: f64,
    pub smoothed_stress: f64,
    /// Proportional-control rate the candidates are centred on.
    pub anchor: Decimal,
    pub candidates: Vec<RateCandidate>,
    pub chosen_rate: Decimal,
}

/// Central counterparty: margin-rate control, margin calls and the
/// default fund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcpAgent {
    margin: MarginState,
    fund: DefaultFund,
}

/// Aggregate stress on a 0-100 scale: weighted liquidity stress (worst of
/// reported stress and the stressed fraction), market volatility and the
/// fraction of members in breach.
pub fn stress_index(snapshot: &Snapshot, policy: &MarginPolicy) -> f64 {
    let w = &policy.stress_weights;
    let liquidity = snapshot
        .mean_reported_stress()
        .unwrap_or(0.0)
        .max(snapshot.stressed_fraction())
        .clamp(0.0, 1.0);
    let volatility = snapshot.market.volatility.max(0.0);
    let breach = snapshot.breach_fraction();
    100.0 * (w.liquidity * liquidity + w.volatility * volatility + w.breach * breach)
}

pub fn clamp_rate(rate: Decimal, policy: &MarginPolicy) -> Decimal {
    rate.max(policy.min_rate).min(policy.max_rate)
}

impl CcpAgent {
    pub fn new(margin: MarginState, fund: DefaultFund) -> Self {
        Self { margin, fund }
    }

    pub fn margin(&self) -> &MarginState {
        &self.margin
    }

    pub fn fund(&self) -> &DefaultFund {
        &self.fund
    }

    pub(crate) fn margin_mut(&mut self) -> &mut MarginState {
        &mut self.margin
    }

    pub(crate) fn fund_mut(&mut self) -> &mut DefaultFund {
        &mut self.fund
    }

    /// Stress index averaged with the recent history window.
    pub fn smoothed_stress(&self, raw: f64, window: usize) -> f64 {
        let keep = window.saturating_sub(1);
        let history = self.margin.stress_history();
        let recent: Vec<f64> = history
            .iter()
            .skip(history.len().saturating_sub(keep))
            .copied()
            .collect();
        (recent.iter().sum::<f64>() + raw) / (recent.len() + 1) as f64
    }

    /// Score a candidate rate against the snapshot.
    pub fn score_rate(
        &self,
        snapshot: &Snapshot,
        offset: Decimal,
        rate: Decimal,
        config: &SimulationConfig,
    ) -> RateCandidate {
        let dm = &config.bank.default_model;
        let weights = &config.ccp_weights;
        let vol = snapshot.market.volatility.max(0.0);
        let closeout = to_f64(config.margin.closeout_multiplier);
        let r = to_f64(rate);

        let mut pd_sum = 0.0;
        let mut expected_loss = 0.0;
        let mut liquidity_before = 0.0;
        let mut liquidity_after = 0.0;
        let mut base_total = 0.0;
        let mut members = 0usize;

        for (_, view) in snapshot.live_banks() {
            let sheet = &view.balance;
            let base = to_f64(sheet.margin_base());
            let posted = to_f64(sheet.posted_margin());
            let funding = to_f64(sheet.available_funding());
            let call = (base * r - posted).max(0.0);
            let funded = call.min(funding);
            let shortfall = (call - funded) / (call + 1.0);
            let capital = to_f64(sheet.capital_buffer());
            let claims = to_f64(sheet.claims_at_risk());
            let leverage = if capital > 0.0 {
                (claims / capital).min(10.0)
            } else {
                10.0
            };
            let in_breach = if view.status == MemberStatus::InBreach {
                1.0
            } else {
                0.0
            };
            let stressed = if view.stressed { 1.0 } else { 0.0 };
            let pd = logistic(
                dm.intercept
                    + dm.shortfall * shortfall
                    + dm.leverage * leverage
                    + dm.breach * in_breach
                    + dm.liquidity_stress * stressed,
            );
            let loss_if_default = (base * vol * closeout - (posted + funded)).max(0.0);

            pd_sum += pd;
            expected_loss += pd * loss_if_default;
            let liquidity = to_f64(sheet.liquidity());
            liquidity_before += liquidity;
            liquidity_after += (liquidity - funded).max(0.0);
            base_total += base;
            members += 1;
        }

        let mean_pd = if members > 0 {
            pd_sum / members as f64
        } else {
            0.0
        };
        let retained = if liquidity_before > 0.0 {
            liquidity_after / liquidity_before
        } else {
            1.0
        };
        let deficit = to_f64(snapshot.fund.unfunded_deficit);
        let norm = base_total.max(1.0);
        let utility = -weights.default_probability * mean_pd
            - weights.loss * (expected_loss + deficit) / norm
            + weights.liquidity * retained;
        RateCandidate {
            offset,
            rate,
            utility,
            mean_default_probability: mean_pd,
            expected_loss,
            liquidity_retained: retained,
        }
    }

    /// Choose next round's margin rate. Pure: reads the snapshot and the
    /// CCP's own history only.
    pub fn decide(&self, snapshot: &Snapshot, config: &SimulationConfig) -> CcpDecision {
        let policy = &config.margin;
        let raw = stress_index(snapshot, policy);
        let smoothed = self.smoothed_stress(raw, policy.stress_window);
        let delta = policy.gain * from_f64(smoothed - policy.stress_threshold);
        let anchor = clamp_rate(self.margin.rate() + delta, policy);

        let candidates: Vec<RateCandidate> = policy
            .candidate_offsets
            .iter()
            .map(|offset| {
                let rate = clamp_rate(anchor + *offset, policy);
                self.score_rate(snapshot, *offset, rate, config)
            })
            .collect();

        let chosen_rate = select_candidate(&candidates).map_or(anchor, |c| c.rate);

        CcpDecision {
            step: snapshot.step + 1,
            raw_stress: raw,
            smoothed_stress: smoothed,
            anchor,
            candidates,
            chosen_rate,
        }
    }

    /// Install the decided rate (start of the CCP's application step).
    pub(crate) fn apply_decision(&mut self, decision: &CcpDecision, window: usize) {
        self.margin.set_rate(
            decision.chosen_rate,
            decision.raw_stress,
            decision.smoothed_stress,
            window,
        );
    }

    pub fn members(&self) -> impl Iterator<Item = &AgentId> {
        self.margin.accounts().keys()
    }
}

/// Highest utility; ties go to the smaller |offset|, then the lower rate.
fn select_candidate(candidates: &[RateCandidate]) -> Option<&RateCandidate> {
    const EPS: f64 = 1e-12;
    let mut best: Option<&RateCandidate> = None;
    for c in candidates {
        best = match best {
            None => Some(c),
            Some(b) if c.utility > b.utility + EPS => Some(c),
            Some(b)
                if (c.utility - b.utility).abs() <= EPS
                    && (c.offset.abs(), c.rate) < (b.offset.abs(), b.rate) =>
            {
                Some(c)
            }
            keep => keep,
        };
    }
    best
}
