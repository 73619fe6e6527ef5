use crate::belief::channel::{BetaChannel, GaussianChannel};
use crate::belief::observation::Observation;
use crate::core::agent_id::AgentId;
use crate::core::config::{BeliefPriors, ObservationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Network-wide and per-counterparty default risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartyRisk {
    pub aggregate: BetaChannel,
    pub per_counterparty: BTreeMap<AgentId, BetaChannel>,
}

/// An agent's probabilistic view of the four risk channels.
///
/// Probability channels are Beta; continuous channels are Gaussian
/// mean/variance pairs. Every update keeps the parameters in domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefState {
    pub counterparty_risk: CounterpartyRisk,
    pub liquidity_stress: BetaChannel,
    pub margin_call_size: GaussianChannel,
    pub market_volatility: GaussianChannel,
    observed_step: Option<u64>,
}

/// Point estimates of a belief, for metrics and reports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BeliefSummary {
    pub counterparty_risk: f64,
    pub liquidity_stress: f64,
    pub margin_call_size: f64,
    pub market_volatility: f64,
}

impl BeliefState {
    pub fn from_priors(priors: &BeliefPriors) -> Self {
        Self {
            counterparty_risk: CounterpartyRisk {
                aggregate: BetaChannel::new(priors.counterparty_alpha, priors.counterparty_beta),
                per_counterparty: BTreeMap::new(),
            },
            liquidity_stress: BetaChannel::new(priors.liquidity_alpha, priors.liquidity_beta),
            margin_call_size: GaussianChannel::new(priors.margin_mean, priors.margin_variance),
            market_volatility: GaussianChannel::new(
                priors.volatility_mean,
                priors.volatility_variance,
            ),
            observed_step: None,
        }
    }

    /// Step of the last snapshot folded into this belief.
    pub fn observed_step(&self) -> Option<u64> {
        self.observed_step
    }

    /// One Bayesian update per channel. Channels without an observation
    /// keep their parameters.
    pub fn update(
        &mut self,
        observation: &Observation,
        step: u64,
        policy: &ObservationPolicy,
        priors: &BeliefPriors,
    ) {
        let cp_prior = BetaChannel::new(priors.counterparty_alpha, priors.counterparty_beta);
        for signal in &observation.counterparties {
            let channel = self
                .counterparty_risk
                .per_counterparty
                .entry(signal.counterparty.clone())
                .or_insert(cp_prior);
            channel.decay_toward(&cp_prior, policy.forgetting);
            channel.observe_signal(signal.signal, policy.counterparty_weight);
        }
        if let Some(signal) = observation.aggregate_counterparty_signal(policy) {
            let aggregate = &mut self.counterparty_risk.aggregate;
            aggregate.decay_toward(&cp_prior, policy.forgetting);
            aggregate.observe_signal(signal, policy.counterparty_weight);
        }

        if let Some(stress) = observation.liquidity_stress {
            let prior = BetaChannel::new(priors.liquidity_alpha, priors.liquidity_beta);
            self.liquidity_stress.decay_toward(&prior, policy.forgetting);
            self.liquidity_stress
                .observe_signal(stress, policy.liquidity_weight);
        }

        if let Some((value, noise)) = observation.margin_call {
            self.margin_call_size.predict(policy.margin_process_noise);
            self.margin_call_size.observe(value, noise);
        }

        if let Some(vol) = observation.volatility {
            self.market_volatility
                .predict(policy.volatility_process_noise);
            self.market_volatility.observe(vol, policy.volatility_noise);
        }

        self.observed_step = Some(step);
    }

    /// Default-probability estimate for `counterparty`, falling back to
    /// the aggregate channel for unknown names.
    pub fn counterparty_default_probability(&self, counterparty: &AgentId) -> f64 {
        self.counterparty_risk
            .per_counterparty
            .get(counterparty)
            .unwrap_or(&self.counterparty_risk.aggregate)
            .mean()
    }

    pub fn summary(&self) -> BeliefSummary {
        BeliefSummary {
            counterparty_risk: self.counterparty_risk.aggregate.mean(),
            liquidity_stress: self.liquidity_stress.mean(),
            margin_call_size: self.margin_call_size.mean(),
            market_volatility: self.market_volatility.mean(),
        }
    }

    /// Every parameter within its domain.
    pub fn is_valid(&self) -> bool {
        self.counterparty_risk.aggregate.is_valid()
            && self
                .counterparty_risk
                .per_counterparty
                .values()
                .all(BetaChannel::is_valid)
            && self.liquidity_stress.is_valid()
            && self.margin_call_size.is_valid()
            && self.market_volatility.is_valid()
    }
}
