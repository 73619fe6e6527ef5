use crate::core::agent_id::AgentId;
use crate::core::amount::non_negative;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A clearing member's balance sheet.
///
/// Exposures are signed per counterparty: a positive amount is a claim on
/// the counterparty (credit risk we carry), a negative amount is an amount
/// we owe. Cash never goes below zero while the member is live; every
/// outflow goes through [`BalanceSheet::fund`], which draws cash first and
/// then the member's external credit line.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::core::agent_id::AgentId;
/// use ccp_risk_engine::core::balance_sheet::BalanceSheet;
/// use rust_decimal_macros::dec;
///
/// let mut sheet = BalanceSheet::new(dec!(100), dec!(40), dec!(50), dec!(20))
///     .with_exposure(AgentId::new("B"), dec!(60));
///
/// let unfunded = sheet.fund(dec!(110));
/// assert_eq!(unfunded, dec!(0));
/// assert_eq!(sheet.cash(), dec!(0));
/// assert_eq!(sheet.credit_drawn(), dec!(10));
/// assert_eq!(sheet.margin_base(), dec!(60));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheet {
    cash: Decimal,
    posted_margin: Decimal,
    exposures: BTreeMap<AgentId, Decimal>,
    /// Notional of each exposure covered by a hedge.
    hedged: BTreeMap<AgentId, Decimal>,
    liquid_assets: Decimal,
    capital_buffer: Decimal,
    credit_headroom: Decimal,
    credit_drawn: Decimal,
    defaulted: bool,
}

impl BalanceSheet {
    pub fn new(
        cash: Decimal,
        capital_buffer: Decimal,
        liquid_assets: Decimal,
        credit_line: Decimal,
    ) -> Self {
        Self {
            cash: non_negative(cash),
            posted_margin: Decimal::ZERO,
            exposures: BTreeMap::new(),
            hedged: BTreeMap::new(),
            liquid_assets: non_negative(liquid_assets),
            capital_buffer,
            credit_headroom: non_negative(credit_line),
            credit_drawn: Decimal::ZERO,
            defaulted: false,
        }
    }

    /// Set the signed exposure to `counterparty`.
    pub fn with_exposure(mut self, counterparty: AgentId, amount: Decimal) -> Self {
        self.set_exposure(counterparty, amount);
        self
    }

    /// Start with margin already posted (outside the funding rule).
    pub fn with_posted_margin(mut self, amount: Decimal) -> Self {
        self.posted_margin = non_negative(amount);
        self
    }

    // --- Accessors ---

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn posted_margin(&self) -> Decimal {
        self.posted_margin
    }

    pub fn liquid_assets(&self) -> Decimal {
        self.liquid_assets
    }

    pub fn capital_buffer(&self) -> Decimal {
        self.capital_buffer
    }

    pub fn credit_headroom(&self) -> Decimal {
        self.credit_headroom
    }

    pub fn credit_drawn(&self) -> Decimal {
        self.credit_drawn
    }

    pub fn is_defaulted(&self) -> bool {
        self.defaulted
    }

    pub fn exposures(&self) -> &BTreeMap<AgentId, Decimal> {
        &self.exposures
    }

    pub fn exposure(&self, counterparty: &AgentId) -> Decimal {
        self.exposures
            .get(counterparty)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn hedged(&self, counterparty: &AgentId) -> Decimal {
        self.hedged
            .get(counterparty)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    // --- Derived quantities ---

    /// Cash plus undrawn credit: the most this member can pay right now.
    pub fn available_funding(&self) -> Decimal {
        self.cash + self.credit_headroom
    }

    pub fn can_fund(&self, amount: Decimal) -> bool {
        amount <= self.available_funding()
    }

    /// Exposure to `counterparty` left after hedges, in absolute terms.
    pub fn effective_exposure(&self, counterparty: &AgentId) -> Decimal {
        non_negative(self.exposure(counterparty).abs() - self.hedged(counterparty))
    }

    /// Sum of unhedged absolute exposures; the CCP margins against this.
    pub fn margin_base(&self) -> Decimal {
        self.exposures
            .keys()
            .map(|cp| self.effective_exposure(cp))
            .sum()
    }

    /// Unhedged claims on counterparties (positive exposures only).
    pub fn claims_at_risk(&self) -> Decimal {
        self.exposures
            .iter()
            .filter(|(_, amount)| **amount > Decimal::ZERO)
            .map(|(cp, amount)| non_negative(*amount - self.hedged(cp)))
            .sum()
    }

    /// Amounts owed to counterparties (negative exposures, as positive).
    pub fn liabilities(&self) -> Decimal {
        self.exposures
            .values()
            .filter(|amount| **amount < Decimal::ZERO)
            .map(|amount| amount.abs())
            .sum()
    }

    pub fn gross_exposure(&self) -> Decimal {
        self.exposures.values().map(|amount| amount.abs()).sum()
    }

    /// Cash plus liquid assets.
    pub fn liquidity(&self) -> Decimal {
        self.cash + self.liquid_assets
    }

    // --- Mutations (applied by the round orchestrator only) ---

    /// Pay `amount`, drawing cash first and then credit headroom.
    /// Returns the part that could not be funded (zero on success).
    pub fn fund(&mut self, amount: Decimal) -> Decimal {
        let amount = non_negative(amount);
        let from_cash = amount.min(self.cash);
        self.cash -= from_cash;
        let from_credit = (amount - from_cash).min(self.credit_headroom);
        self.credit_headroom -= from_credit;
        self.credit_drawn += from_credit;
        amount - from_cash - from_credit
    }

    pub fn receive(&mut self, amount: Decimal) {
        self.cash += non_negative(amount);
    }

    /// Move funds into posted margin. Returns the amount actually posted.
    pub fn post_margin(&mut self, amount: Decimal) -> Decimal {
        let requested = non_negative(amount);
        let unfunded = self.fund(requested);
        let posted = requested - unfunded;
        self.posted_margin += posted;
        posted
    }

    pub fn set_exposure(&mut self, counterparty: AgentId, amount: Decimal) {
        if amount.is_zero() {
            self.exposures.remove(&counterparty);
            self.hedged.remove(&counterparty);
        } else {
            let hedge_cap = amount.abs();
            if let Some(h) = self.hedged.get_mut(&counterparty) {
                *h = (*h).min(hedge_cap);
            }
            self.exposures.insert(counterparty, amount);
        }
    }

    pub fn adjust_exposure(&mut self, counterparty: &AgentId, delta: Decimal) {
        let next = self.exposure(counterparty) + delta;
        self.set_exposure(counterparty.clone(), next);
    }

    /// Cover up to `amount` of the exposure to `counterparty` with a hedge.
    /// Returns the notional newly hedged.
    pub fn hedge(&mut self, counterparty: &AgentId, amount: Decimal) -> Decimal {
        let room = self.effective_exposure(counterparty);
        let added = non_negative(amount).min(room);
        if added > Decimal::ZERO {
            *self.hedged.entry(counterparty.clone()).or_insert(Decimal::ZERO) += added;
        }
        added
    }

    /// Drop every position against `counterparty`. Returns the signed
    /// exposure that was removed.
    pub fn remove_counterparty(&mut self, counterparty: &AgentId) -> Decimal {
        self.hedged.remove(counterparty);
        self.exposures.remove(counterparty).unwrap_or(Decimal::ZERO)
    }

    pub fn absorb_loss(&mut self, amount: Decimal) {
        self.capital_buffer -= non_negative(amount);
    }

    pub fn add_capital(&mut self, amount: Decimal) {
        self.capital_buffer += amount;
    }

    /// Sell `amount` of liquid assets at `haircut`. Proceeds land in cash,
    /// the haircut is a realized capital loss. Returns the proceeds.
    pub fn sell_liquid_assets(&mut self, amount: Decimal, haircut: Decimal) -> Decimal {
        let sold = non_negative(amount).min(self.liquid_assets);
        let haircut = haircut.max(Decimal::ZERO).min(Decimal::ONE);
        let proceeds = sold * (Decimal::ONE - haircut);
        self.liquid_assets -= sold;
        self.cash += proceeds;
        self.capital_buffer -= sold - proceeds;
        proceeds
    }

    /// Flag as defaulted and hand over posted margin and cash.
    /// Returns `(posted_margin, cash)` seized.
    pub fn seize_on_default(&mut self) -> (Decimal, Decimal) {
        self.defaulted = true;
        let seized = (self.posted_margin, self.cash);
        self.posted_margin = Decimal::ZERO;
        self.cash = Decimal::ZERO;
        seized
    }
}
