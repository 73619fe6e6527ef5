//! Translation of a snapshot into per-channel observations for one agent.
//!
//! The signal values and pseudo-count weights come from
//! [`ObservationPolicy`]; nothing here is a hidden constant.

use crate::agents::margin::MemberStatus;
use crate::core::agent_id::AgentId;
use crate::core::amount::to_f64;
use crate::core::config::ObservationPolicy;
use crate::core::error::StateError;
use crate::core::snapshot::{BankView, Snapshot};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartySignal {
    pub counterparty: AgentId,
    /// Distress signal in `[0, 1]`.
    pub signal: f64,
    /// Share of the observer's gross exposure to this counterparty.
    pub weight: f64,
}

/// Everything one agent learns from one snapshot. `None` means the
/// channel had nothing to observe this round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub counterparties: Vec<CounterpartySignal>,
    pub new_defaults: usize,
    pub liquidity_stress: Option<f64>,
    /// `(value, observation variance)`.
    pub margin_call: Option<(f64, f64)>,
    pub volatility: Option<f64>,
}

/// Distress signal of a member as seen by others.
pub fn distress_signal(view: &BankView, policy: &ObservationPolicy) -> f64 {
    if !view.is_live() || view.status == MemberStatus::Defaulted {
        return policy.defaulted_signal;
    }
    let mut signal = policy.healthy_signal;
    if view.status == MemberStatus::InBreach {
        signal = signal.max(policy.in_breach_signal);
    }
    if view.stressed {
        signal = signal.max(policy.stressed_signal);
    }
    if view.outstanding_call > Decimal::ZERO {
        signal = signal.max(policy.margin_call_signal);
    }
    signal
}

impl Observation {
    pub fn from_snapshot(
        snapshot: &Snapshot,
        observer: &AgentId,
        policy: &ObservationPolicy,
    ) -> Result<Self, StateError> {
        let own = snapshot.view(observer)?;
        let gross = to_f64(own.balance.gross_exposure());

        let counterparties = own
            .balance
            .exposures()
            .iter()
            .filter_map(|(cp, amount)| {
                let view = snapshot.banks.get(cp)?;
                let weight = if gross > 0.0 {
                    to_f64(amount.abs()) / gross
                } else {
                    0.0
                };
                Some(CounterpartySignal {
                    counterparty: cp.clone(),
                    signal: distress_signal(view, policy),
                    weight,
                })
            })
            .collect();

        let liquidity_stress = if snapshot.live_count() == 0 {
            None
        } else {
            let mut stress = snapshot.stressed_fraction();
            if let Some(reported) = snapshot.mean_reported_stress() {
                stress = stress.max(reported);
            }
            if own.stressed {
                stress = stress.max(policy.own_stress_signal);
            }
            Some(stress.clamp(0.0, 1.0))
        };

        let margin_call = if own.outstanding_call > Decimal::ZERO {
            Some((to_f64(own.outstanding_call), policy.margin_noise_observed))
        } else if own.balance.margin_base() > Decimal::ZERO {
            let estimate = (own.balance.margin_base() * snapshot.margin.rate
                - own.balance.posted_margin())
            .max(Decimal::ZERO);
            Some((to_f64(estimate), policy.margin_noise_estimated))
        } else {
            None
        };

        let volatility = Some(snapshot.market.volatility).filter(|v| v.is_finite());

        Ok(Self {
            counterparties,
            new_defaults: snapshot.new_defaults.len(),
            liquidity_stress,
            margin_call,
            volatility,
        })
    }

    /// Exposure-weighted counterparty signal plus the contagion nudge
    /// from defaults elsewhere in the network.
    pub fn aggregate_counterparty_signal(&self, policy: &ObservationPolicy) -> Option<f64> {
        let nudge = (policy.contagion_per_default * self.new_defaults as f64)
            .min(policy.contagion_cap);
        let total_weight: f64 = self.counterparties.iter().map(|c| c.weight).sum();
        if total_weight > 0.0 {
            let mean = self
                .counterparties
                .iter()
                .map(|c| c.signal * c.weight)
                .sum::<f64>()
                / total_weight;
            Some((mean + nudge).min(1.0))
        } else if self.new_defaults > 0 {
            Some(nudge)
        } else {
            None
        }
    }
}
