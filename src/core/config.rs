//! Immutable simulation configuration.
//!
//! Loaded once (JSON or [`Default`]), validated with
//! [`SimulationConfig::validate`], then shared read-only behind an `Arc`
//! for the lifetime of the simulation.

use crate::core::error::ConfigError;
use crate::simulation::topology::NetworkTopology;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub bank_count: usize,
    pub steps: u64,
    pub seed: u64,
    pub topology: NetworkTopology,
    pub initial: InitialConditions,
    pub margin: MarginPolicy,
    pub ccp_weights: CcpWeights,
    pub default_fund: DefaultFundPolicy,
    pub bank: BankPolicy,
    pub observation: ObservationPolicy,
    pub priors: BeliefPriors,
    pub market: MarketConfig,
    /// Wall-clock budget for one agent's decision, in milliseconds. An
    /// agent still deliberating at its deadline is abandoned and degrades
    /// to a no-op.
    pub decision_budget_ms: u64,
    /// Dispatch bank decisions one at a time, each with its own deadline,
    /// and compute the CCP decision inline.
    pub force_sequential: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            bank_count: 10,
            steps: 50,
            seed: 42,
            topology: NetworkTopology::ErdosRenyi { p: 0.3 },
            initial: InitialConditions::default(),
            margin: MarginPolicy::default(),
            ccp_weights: CcpWeights::default(),
            default_fund: DefaultFundPolicy::default(),
            bank: BankPolicy::default(),
            observation: ObservationPolicy::default(),
            priors: BeliefPriors::default(),
            market: MarketConfig::default(),
            decision_budget_ms: 250,
            force_sequential: false,
        }
    }
}

/// Uniform range used when drawing initial balance-sheet values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: f64,
    pub max: f64,
}

impl AmountRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && 0.0 <= self.min && self.min <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditions {
    pub cash: AmountRange,
    pub capital_buffer: AmountRange,
    pub liquid_assets: AmountRange,
    /// Notional placed on each generated edge.
    pub exposure: AmountRange,
    pub credit_line: Decimal,
    /// Fraction of the initial margin requirement posted at start.
    pub margin_coverage: Decimal,
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            cash: AmountRange::new(50.0, 150.0),
            capital_buffer: AmountRange::new(30.0, 80.0),
            liquid_assets: AmountRange::new(20.0, 60.0),
            exposure: AmountRange::new(10.0, 40.0),
            credit_line: dec!(20),
            margin_coverage: dec!(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressWeights {
    pub liquidity: f64,
    pub volatility: f64,
    pub breach: f64,
}

impl Default for StressWeights {
    fn default() -> Self {
        Self {
            liquidity: 0.4,
            volatility: 0.4,
            breach: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginPolicy {
    pub initial_rate: Decimal,
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    /// Proportional gain `k` applied to `stress - stress_threshold`.
    pub gain: Decimal,
    pub stress_threshold: f64,
    pub stress_weights: StressWeights,
    /// Rounds of stress history averaged into the control signal.
    pub stress_window: usize,
    /// Rate deltas evaluated around the proportional-control anchor.
    pub candidate_offsets: Vec<Decimal>,
    /// Rounds a margin call may stay unmet before the member is in breach.
    pub grace_period: u32,
    /// Rounds in breach before the CCP declares the member defaulted.
    pub max_breach_duration: u32,
    /// Total grace extension a member may obtain through relief requests.
    pub max_relief_rounds: u32,
    /// Close-out loss = margin base x market volatility x multiplier.
    pub closeout_multiplier: Decimal,
}

impl Default for MarginPolicy {
    fn default() -> Self {
        Self {
            initial_rate: dec!(0.4),
            min_rate: dec!(0.1),
            max_rate: dec!(0.9),
            gain: dec!(0.005),
            stress_threshold: 15.0,
            stress_weights: StressWeights::default(),
            stress_window: 3,
            candidate_offsets: vec![dec!(-0.02), dec!(-0.01), dec!(0), dec!(0.01), dec!(0.02)],
            grace_period: 2,
            max_breach_duration: 2,
            max_relief_rounds: 2,
            closeout_multiplier: dec!(1.25),
        }
    }
}

/// Weighted-sum scalarization of the CCP's objectives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CcpWeights {
    pub default_probability: f64,
    pub loss: f64,
    pub liquidity: f64,
}

impl Default for CcpWeights {
    fn default() -> Self {
        Self {
            default_probability: 1.0,
            loss: 1.0,
            liquidity: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultFundPolicy {
    /// Contribution as a fraction of each member's initial cash.
    pub contribution_rate: Decimal,
    /// Fraction of the gap between a live member's committed and current
    /// contribution it tops up from cash at the end of each round. Zero
    /// disables replenishment.
    pub replenish_rate: Decimal,
}

impl Default for DefaultFundPolicy {
    fn default() -> Self {
        Self {
            contribution_rate: dec!(0.05),
            replenish_rate: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilityWeights {
    pub survival: f64,
    pub profit: f64,
    pub externality: f64,
}

impl Default for UtilityWeights {
    fn default() -> Self {
        Self {
            survival: 1.0,
            profit: 0.5,
            externality: 0.2,
        }
    }
}

/// Logistic default-probability model coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultModel {
    pub intercept: f64,
    pub shortfall: f64,
    pub leverage: f64,
    pub liquidity_stress: f64,
    pub counterparty_loss: f64,
    pub breach: f64,
    pub volatility: f64,
}

impl Default for DefaultModel {
    fn default() -> Self {
        Self {
            intercept: -4.0,
            shortfall: 6.0,
            leverage: 0.3,
            liquidity_stress: 1.5,
            counterparty_loss: 1.0,
            breach: 3.0,
            volatility: 2.0,
        }
    }
}

/// Bank behaviour: utility model, action sizing and carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankPolicy {
    pub utility: UtilityWeights,
    /// Money amount that maps to one unit of utility.
    pub utility_scale: f64,
    pub default_model: DefaultModel,
    /// Fraction of a claim lost when the counterparty defaults.
    pub loss_given_default: Decimal,
    pub reduce_fraction: Decimal,
    pub deleverage_fraction: Decimal,
    /// Liquidity request as a fraction of the stress cash floor, when no
    /// margin call is outstanding.
    pub liquidity_request_fraction: Decimal,
    /// Most a lender provides per request, as a fraction of its cash.
    pub lender_max_share: Decimal,
    pub withdraw_fraction: Decimal,
    pub lend_fraction: Decimal,
    pub trade_fraction: Decimal,
    pub funding_rate: Decimal,
    pub hedge_cost_rate: Decimal,
    pub unwind_cost_rate: Decimal,
    pub lending_rate: Decimal,
    /// Rounds from origination until an interbank loan falls due.
    pub loan_term_rounds: u64,
    /// Rounds an unpaid loan may stay overdue before forced settlement.
    pub loan_grace_rounds: u64,
    /// Share of the borrower's cash taken in a forced settlement; the
    /// unpaid principal is written off by the lender.
    pub forced_settlement_share: Decimal,
    pub trade_spread: Decimal,
    pub margin_carry_cost: Decimal,
    pub operating_cost: Decimal,
    /// Per-round yield on liquid assets.
    pub asset_yield: Decimal,
    /// Cash below this level marks a bank as stressed.
    pub stress_cash_floor: Decimal,
    /// Liquidity-stress belief above which reporting is considered.
    pub report_threshold: f64,
    pub max_relief_request: u32,
    /// Utilities closer than this are treated as equal.
    pub tie_epsilon: f64,
}

impl Default for BankPolicy {
    fn default() -> Self {
        Self {
            utility: UtilityWeights::default(),
            utility_scale: 100.0,
            default_model: DefaultModel::default(),
            loss_given_default: dec!(0.45),
            reduce_fraction: dec!(0.5),
            deleverage_fraction: dec!(0.3),
            liquidity_request_fraction: dec!(1),
            lender_max_share: dec!(0.10),
            withdraw_fraction: dec!(0.5),
            lend_fraction: dec!(0.10),
            trade_fraction: dec!(0.2),
            funding_rate: dec!(0.03),
            hedge_cost_rate: dec!(0.02),
            unwind_cost_rate: dec!(0.01),
            lending_rate: dec!(0.05),
            loan_term_rounds: 5,
            loan_grace_rounds: 2,
            forced_settlement_share: dec!(0.8),
            trade_spread: dec!(0.01),
            margin_carry_cost: dec!(0.005),
            operating_cost: dec!(0.5),
            asset_yield: dec!(0.002),
            stress_cash_floor: dec!(15),
            report_threshold: 0.25,
            max_relief_request: 1,
            tie_epsilon: 1e-9,
        }
    }
}

/// Mapping from raw snapshot signals to belief updates.
///
/// Each probability channel receives `weight` pseudo-observations per
/// round, split into `signal x weight` successes and
/// `(1 - signal) x weight` failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationPolicy {
    pub defaulted_signal: f64,
    pub in_breach_signal: f64,
    pub stressed_signal: f64,
    pub margin_call_signal: f64,
    pub healthy_signal: f64,
    pub counterparty_weight: f64,
    /// Aggregate counterparty signal added per default this round.
    pub contagion_per_default: f64,
    pub contagion_cap: f64,
    pub liquidity_weight: f64,
    /// Liquidity-stress signal floor when the observer itself is stressed.
    pub own_stress_signal: f64,
    /// Observation variance of an outstanding margin call.
    pub margin_noise_observed: f64,
    /// Observation variance of an estimated (exposure x rate) call.
    pub margin_noise_estimated: f64,
    pub volatility_noise: f64,
    pub margin_process_noise: f64,
    pub volatility_process_noise: f64,
    /// Per-round pull of Beta parameters back toward the prior.
    pub forgetting: f64,
}

impl Default for ObservationPolicy {
    fn default() -> Self {
        Self {
            defaulted_signal: 1.0,
            in_breach_signal: 0.7,
            stressed_signal: 0.5,
            margin_call_signal: 0.2,
            healthy_signal: 0.0,
            counterparty_weight: 1.0,
            contagion_per_default: 0.15,
            contagion_cap: 0.3,
            liquidity_weight: 2.0,
            own_stress_signal: 0.8,
            margin_noise_observed: 25.0,
            margin_noise_estimated: 100.0,
            volatility_noise: 0.0025,
            margin_process_noise: 4.0,
            volatility_process_noise: 0.0001,
            forgetting: 0.98,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeliefPriors {
    pub counterparty_alpha: f64,
    pub counterparty_beta: f64,
    pub liquidity_alpha: f64,
    pub liquidity_beta: f64,
    pub margin_mean: f64,
    pub margin_variance: f64,
    pub volatility_mean: f64,
    pub volatility_variance: f64,
}

impl Default for BeliefPriors {
    fn default() -> Self {
        Self {
            counterparty_alpha: 1.0,
            counterparty_beta: 9.0,
            liquidity_alpha: 1.0,
            liquidity_beta: 9.0,
            margin_mean: 0.0,
            margin_variance: 100.0,
            volatility_mean: 0.2,
            volatility_variance: 0.01,
        }
    }
}

/// A one-off exogenous shock applied at `step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shock {
    pub step: u64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub base_volatility: f64,
    pub mean_reversion: f64,
    pub noise: f64,
    pub min_volatility: f64,
    pub max_volatility: f64,
    /// Liquid-asset sales the market absorbs per round without impact.
    pub depth: Decimal,
    /// Volatility added per unit of (round sales / depth).
    pub sell_pressure_impact: f64,
    pub base_haircut: Decimal,
    pub haircut_vol_sensitivity: Decimal,
    pub haircut_impact: Decimal,
    pub max_haircut: Decimal,
    pub volatility_shock: Option<Shock>,
    /// Adds a decaying haircut add-on.
    pub liquidity_shock: Option<Shock>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_volatility: 0.2,
            mean_reversion: 0.1,
            noise: 0.02,
            min_volatility: 0.05,
            max_volatility: 0.8,
            depth: dec!(1000),
            sell_pressure_impact: 0.5,
            base_haircut: dec!(0.02),
            haircut_vol_sensitivity: dec!(0.5),
            haircut_impact: dec!(0.3),
            max_haircut: dec!(0.9),
            volatility_shock: None,
            liquidity_shock: None,
        }
    }
}

fn check(cond: bool, field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            field,
            reason: reason.into(),
        })
    }
}

fn check_weights(group: &'static str, weights: &[f64]) -> Result<(), ConfigError> {
    let valid = weights.iter().all(|w| w.is_finite() && *w >= 0.0)
        && weights.iter().any(|w| *w > 0.0);
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeights { group })
    }
}

fn unit_interval(x: f64) -> bool {
    x.is_finite() && (0.0..=1.0).contains(&x)
}

fn unit_decimal(x: Decimal) -> bool {
    x >= Decimal::ZERO && x <= Decimal::ONE
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    pub fn decision_budget(&self) -> Duration {
        Duration::from_millis(self.decision_budget_ms)
    }

    /// Check every range and weight. Called once before round 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bank_count < 2 {
            return Err(ConfigError::TooFewBanks(self.bank_count));
        }
        check(self.steps > 0, "steps", "must be positive")?;
        check(self.decision_budget_ms > 0, "decision_budget_ms", "must be positive")?;
        self.topology.validate(self.bank_count)?;

        let init = &self.initial;
        for (field, range) in [
            ("initial.cash", init.cash),
            ("initial.capital_buffer", init.capital_buffer),
            ("initial.liquid_assets", init.liquid_assets),
            ("initial.exposure", init.exposure),
        ] {
            check(range.is_valid(), field, "range must satisfy 0 <= min <= max")?;
        }
        check(init.credit_line >= Decimal::ZERO, "initial.credit_line", "must be >= 0")?;
        check(
            unit_decimal(init.margin_coverage),
            "initial.margin_coverage",
            "must be in [0, 1]",
        )?;

        let m = &self.margin;
        if m.min_rate > m.max_rate {
            return Err(ConfigError::RateBoundsInverted {
                min: m.min_rate,
                max: m.max_rate,
            });
        }
        check(m.min_rate >= Decimal::ZERO, "margin.min_rate", "must be >= 0")?;
        if m.initial_rate < m.min_rate || m.initial_rate > m.max_rate {
            return Err(ConfigError::InitialRateOutOfBounds {
                rate: m.initial_rate,
                min: m.min_rate,
                max: m.max_rate,
            });
        }
        check(m.gain >= Decimal::ZERO, "margin.gain", "must be >= 0")?;
        check(
            m.stress_threshold.is_finite() && m.stress_threshold >= 0.0,
            "margin.stress_threshold",
            "must be finite and >= 0",
        )?;
        check_weights(
            "margin.stress_weights",
            &[
                m.stress_weights.liquidity,
                m.stress_weights.volatility,
                m.stress_weights.breach,
            ],
        )?;
        check(m.stress_window > 0, "margin.stress_window", "must be positive")?;
        check(
            !m.candidate_offsets.is_empty(),
            "margin.candidate_offsets",
            "must not be empty",
        )?;
        check(
            m.max_breach_duration > 0,
            "margin.max_breach_duration",
            "must be positive",
        )?;
        check(
            m.closeout_multiplier > Decimal::ZERO,
            "margin.closeout_multiplier",
            "must be positive",
        )?;

        let w = &self.ccp_weights;
        check_weights("ccp_weights", &[w.default_probability, w.loss, w.liquidity])?;
        check(
            self.default_fund.contribution_rate >= Decimal::ZERO,
            "default_fund.contribution_rate",
            "must be >= 0",
        )?;
        check(
            self.bank.loan_term_rounds > 0,
            "bank.loan_term_rounds",
            "must be positive",
        )?;

        let b = &self.bank;
        let u = &b.utility;
        check_weights("bank.utility", &[u.survival, u.profit, u.externality])?;
        check(
            b.utility_scale.is_finite() && b.utility_scale > 0.0,
            "bank.utility_scale",
            "must be positive",
        )?;
        check(
            unit_decimal(b.loss_given_default),
            "bank.loss_given_default",
            "must be in [0, 1]",
        )?;
        for (field, fraction) in [
            ("bank.reduce_fraction", b.reduce_fraction),
            ("bank.deleverage_fraction", b.deleverage_fraction),
            ("bank.lender_max_share", b.lender_max_share),
            ("bank.withdraw_fraction", b.withdraw_fraction),
            ("bank.lend_fraction", b.lend_fraction),
            ("bank.trade_fraction", b.trade_fraction),
            ("bank.forced_settlement_share", b.forced_settlement_share),
            ("default_fund.replenish_rate", self.default_fund.replenish_rate),
        ] {
            check(unit_decimal(fraction), field, "must be in [0, 1]")?;
        }
        for (field, rate) in [
            ("bank.liquidity_request_fraction", b.liquidity_request_fraction),
            ("bank.funding_rate", b.funding_rate),
            ("bank.hedge_cost_rate", b.hedge_cost_rate),
            ("bank.unwind_cost_rate", b.unwind_cost_rate),
            ("bank.lending_rate", b.lending_rate),
            ("bank.trade_spread", b.trade_spread),
            ("bank.margin_carry_cost", b.margin_carry_cost),
            ("bank.operating_cost", b.operating_cost),
            ("bank.asset_yield", b.asset_yield),
            ("bank.stress_cash_floor", b.stress_cash_floor),
        ] {
            check(rate >= Decimal::ZERO, field, "must be >= 0")?;
        }
        check(
            b.tie_epsilon.is_finite() && b.tie_epsilon >= 0.0,
            "bank.tie_epsilon",
            "must be finite and >= 0",
        )?;

        let o = &self.observation;
        for (field, signal) in [
            ("observation.defaulted_signal", o.defaulted_signal),
            ("observation.in_breach_signal", o.in_breach_signal),
            ("observation.stressed_signal", o.stressed_signal),
            ("observation.margin_call_signal", o.margin_call_signal),
            ("observation.healthy_signal", o.healthy_signal),
            ("observation.own_stress_signal", o.own_stress_signal),
            ("observation.contagion_cap", o.contagion_cap),
        ] {
            check(unit_interval(signal), field, "must be in [0, 1]")?;
        }
        for (field, positive) in [
            ("observation.counterparty_weight", o.counterparty_weight),
            ("observation.liquidity_weight", o.liquidity_weight),
            ("observation.margin_noise_observed", o.margin_noise_observed),
            ("observation.margin_noise_estimated", o.margin_noise_estimated),
            ("observation.volatility_noise", o.volatility_noise),
        ] {
            check(positive.is_finite() && positive > 0.0, field, "must be positive")?;
        }
        for (field, non_neg) in [
            ("observation.contagion_per_default", o.contagion_per_default),
            ("observation.margin_process_noise", o.margin_process_noise),
            ("observation.volatility_process_noise", o.volatility_process_noise),
        ] {
            check(non_neg.is_finite() && non_neg >= 0.0, field, "must be >= 0")?;
        }
        check(
            o.forgetting > 0.0 && o.forgetting <= 1.0,
            "observation.forgetting",
            "must be in (0, 1]",
        )?;

        let p = &self.priors;
        for (field, shape) in [
            ("priors.counterparty_alpha", p.counterparty_alpha),
            ("priors.counterparty_beta", p.counterparty_beta),
            ("priors.liquidity_alpha", p.liquidity_alpha),
            ("priors.liquidity_beta", p.liquidity_beta),
        ] {
            check(shape.is_finite() && shape > 0.0, field, "shape must be > 0")?;
        }
        check(
            p.margin_variance.is_finite() && p.margin_variance >= 0.0,
            "priors.margin_variance",
            "must be >= 0",
        )?;
        check(
            p.volatility_variance.is_finite() && p.volatility_variance >= 0.0,
            "priors.volatility_variance",
            "must be >= 0",
        )?;
        check(
            p.margin_mean.is_finite() && p.volatility_mean.is_finite(),
            "priors",
            "means must be finite",
        )?;

        let mk = &self.market;
        check(
            mk.min_volatility > 0.0 && mk.min_volatility <= mk.max_volatility,
            "market.min_volatility",
            "must satisfy 0 < min <= max",
        )?;
        check(
            (mk.min_volatility..=mk.max_volatility).contains(&mk.base_volatility),
            "market.base_volatility",
            "must lie within volatility bounds",
        )?;
        check(
            unit_interval(mk.mean_reversion),
            "market.mean_reversion",
            "must be in [0, 1]",
        )?;
        check(mk.noise.is_finite() && mk.noise >= 0.0, "market.noise", "must be >= 0")?;
        check(mk.depth > Decimal::ZERO, "market.depth", "must be positive")?;
        check(
            unit_decimal(mk.max_haircut) && mk.base_haircut >= Decimal::ZERO,
            "market.max_haircut",
            "haircuts must be in [0, 1]",
        )?;
        Ok(())
    }
}
