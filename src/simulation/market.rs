//! Exogenous market: volatility process and fire-sale haircuts.
//!
//! Volatility mean-reverts toward its base level with Gaussian noise;
//! liquid-asset sales in a round push both volatility and the haircut up.

use crate::core::amount::{from_f64, to_f64};
use crate::core::config::MarketConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market conditions published with every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub volatility: f64,
    /// Liquid-asset sales last round relative to market depth.
    pub sell_pressure: f64,
    /// Temporary haircut add-on left by liquidity shocks.
    pub haircut_addon: f64,
}

impl MarketState {
    /// No pressure, no add-on.
    pub fn calm(volatility: f64) -> Self {
        Self {
            volatility,
            sell_pressure: 0.0,
            haircut_addon: 0.0,
        }
    }
}

/// Seeded market process. Owned by the simulation and advanced once per
/// round after all intents are applied.
#[derive(Debug, Clone)]
pub struct Market {
    config: MarketConfig,
    state: MarketState,
    round_sales: Decimal,
    rng: StdRng,
}

impl Market {
    pub fn new(config: MarketConfig, seed: u64) -> Self {
        let state = MarketState::calm(config.base_volatility);
        Self {
            config,
            state,
            round_sales: Decimal::ZERO,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn state(&self) -> MarketState {
        self.state
    }

    pub fn round_sales(&self) -> Decimal {
        self.round_sales
    }

    /// Haircut on selling `amount` more liquid assets this round.
    pub fn haircut(&self, amount: Decimal) -> Decimal {
        let c = &self.config;
        let pressure = (self.round_sales + amount.max(Decimal::ZERO)) / c.depth;
        let haircut = c.base_haircut
            + c.haircut_vol_sensitivity * from_f64(self.state.volatility)
            + c.haircut_impact * pressure
            + from_f64(self.state.haircut_addon);
        haircut.max(Decimal::ZERO).min(c.max_haircut)
    }

    pub fn record_sale(&mut self, amount: Decimal) {
        self.round_sales += amount.max(Decimal::ZERO);
    }

    /// Close round `step`: move volatility, apply scheduled shocks and
    /// reset the sales counter.
    pub fn advance(&mut self, step: u64) -> MarketState {
        let c = &self.config;
        let pressure = to_f64(self.round_sales / c.depth);
        let z: f64 = StandardNormal.sample(&mut self.rng);

        let mut vol = self.state.volatility
            + c.mean_reversion * (c.base_volatility - self.state.volatility)
            + c.noise * z
            + c.sell_pressure_impact * pressure;
        if let Some(shock) = c.volatility_shock.filter(|s| s.step == step) {
            log::info!("volatility shock of {:.3} at step {}", shock.size, step);
            vol += shock.size;
        }
        vol = vol.clamp(c.min_volatility, c.max_volatility);

        let mut addon = self.state.haircut_addon * 0.5;
        if let Some(shock) = c.liquidity_shock.filter(|s| s.step == step) {
            log::info!("liquidity shock of {:.3} at step {}", shock.size, step);
            addon += shock.size;
        }

        self.state = MarketState {
            volatility: vol,
            sell_pressure: pressure,
            haircut_addon: addon.max(0.0),
        };
        self.round_sales = Decimal::ZERO;
        self.state
    }
}
