//! Expected-utility scoring of candidate actions.
//!
//! A candidate is first projected onto the balance sheet
//! ([`Projection`]); the model then integrates the resulting utility over
//! the agent's margin-call and volatility beliefs.

use crate::belief::state::BeliefState;
use crate::core::amount::to_f64;
use crate::core::config::{DefaultModel, MarketConfig, SimulationConfig, UtilityWeights};
use serde::{Deserialize, Serialize};

/// Leverage and loss ratios are capped so one term cannot saturate the
/// logistic on its own.
const RATIO_CAP: f64 = 10.0;

/// Balance-sheet state the agent expects after taking an action.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Projection {
    pub cash: f64,
    pub credit_headroom: f64,
    pub liquid_assets: f64,
    pub capital: f64,
    /// Unhedged claims on counterparties.
    pub claims_at_risk: f64,
    /// Belief-weighted expected loss on those claims.
    pub counterparty_loss: f64,
    /// Projected margin base relative to the current one.
    pub margin_base_ratio: f64,
    /// Margin posted by the action itself.
    pub margin_posted: f64,
    pub outstanding_call: f64,
    /// Likelihood-like weight in `[0, 1]` of ending the round in breach.
    pub breach_pressure: f64,
    /// Expected profit or loss of the action, in money.
    pub pnl: f64,
    /// Liquidity the action pulls out of the network (negative: adds).
    pub drain: f64,
    pub certain_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilityOutcome {
    pub expected_utility: f64,
    pub default_probability: f64,
}

/// Pure scoring function: (belief, projected balance sheet) -> utility.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilityModel {
    weights: UtilityWeights,
    scale: f64,
    default_model: DefaultModel,
    base_haircut: f64,
    haircut_vol_sensitivity: f64,
    max_haircut: f64,
}

pub fn logistic(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn capped_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        if numerator > 0.0 {
            RATIO_CAP
        } else {
            0.0
        }
    } else {
        (numerator / denominator).clamp(0.0, RATIO_CAP)
    }
}

impl UtilityModel {
    pub fn new(
        weights: UtilityWeights,
        scale: f64,
        default_model: DefaultModel,
        market: &MarketConfig,
    ) -> Self {
        Self {
            weights,
            scale,
            default_model,
            base_haircut: to_f64(market.base_haircut),
            haircut_vol_sensitivity: to_f64(market.haircut_vol_sensitivity),
            max_haircut: to_f64(market.max_haircut),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            config.bank.utility,
            config.bank.utility_scale,
            config.bank.default_model,
            &config.market,
        )
    }

    /// Haircut the agent expects on liquid assets at volatility `vol`.
    pub fn haircut(&self, vol: f64) -> f64 {
        (self.base_haircut + self.haircut_vol_sensitivity * vol).clamp(0.0, self.max_haircut)
    }

    /// Default probability under one draw of (margin call, volatility).
    pub fn default_probability(
        &self,
        p: &Projection,
        belief: &BeliefState,
        call_size: f64,
        vol: f64,
    ) -> f64 {
        if p.certain_default {
            return 1.0;
        }
        let m = &self.default_model;
        let need = ((call_size * p.margin_base_ratio).max(p.outstanding_call) - p.margin_posted)
            .max(0.0);
        let available =
            p.cash + p.credit_headroom + p.liquid_assets * (1.0 - self.haircut(vol));
        let shortfall = (need - available).max(0.0) / (need + 1.0);
        let leverage = capped_ratio(p.claims_at_risk, p.capital);
        let cp_loss = capped_ratio(p.counterparty_loss, p.capital.max(1.0));
        let liquid_share = if p.cash + p.liquid_assets > 0.0 {
            p.liquid_assets / (p.cash + p.liquid_assets)
        } else {
            0.0
        };
        let z = m.intercept
            + m.shortfall * shortfall
            + m.leverage * leverage
            + m.liquidity_stress * belief.liquidity_stress.mean()
            + m.counterparty_loss * cp_loss
            + m.breach * p.breach_pressure.clamp(0.0, 1.0)
            + m.volatility * vol * liquid_share;
        logistic(z)
    }

    /// Utility under one draw: survival, profit and the externality
    /// penalty weighted by perceived network stress.
    pub fn utility(&self, p: &Projection, belief: &BeliefState, call_size: f64, vol: f64) -> f64 {
        let pd = self.default_probability(p, belief, call_size, vol);
        let stress = belief.liquidity_stress.mean();
        -self.weights.survival * pd + self.weights.profit * p.pnl / self.scale
            - self.weights.externality * stress * p.drain / self.scale
    }

    /// Expectation over the margin-call and volatility channels using a
    /// 3x3 Gauss-Hermite grid.
    pub fn expected_utility(&self, p: &Projection, belief: &BeliefState) -> UtilityOutcome {
        let calls = belief.margin_call_size.sigma_points(0.0);
        let vols = belief.market_volatility.sigma_points(0.0);
        let mut eu = 0.0;
        let mut epd = 0.0;
        for (call, wc) in calls {
            for (vol, wv) in vols {
                let w = wc * wv;
                eu += w * self.utility(p, belief, call, vol);
                epd += w * self.default_probability(p, belief, call, vol);
            }
        }
        UtilityOutcome {
            expected_utility: eu,
            default_probability: epd,
        }
    }
}
