use crate::core::agent_id::AgentId;
use crate::core::error::MutualizationDeficit;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Decimal places used for pro-rata charges before the remainder pass.
const CHARGE_DP: u32 = 10;

/// How one default loss was covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutualizationOutcome {
    pub defaulter: AgentId,
    pub shortfall: Decimal,
    pub fund_balance_before: Decimal,
    /// Taken from the defaulter's own contribution.
    pub own_consumed: Decimal,
    /// Taken from contributions forfeited by earlier defaulters.
    #[serde(default)]
    pub forfeited_consumed: Decimal,
    /// Taken from each survivor's contribution.
    pub survivor_charges: BTreeMap<AgentId, Decimal>,
    pub deficit: Option<MutualizationDeficit>,
}

impl MutualizationOutcome {
    pub fn total_survivor_charges(&self) -> Decimal {
        self.survivor_charges.values().copied().sum()
    }

    /// Loss covered by the fund.
    pub fn covered(&self) -> Decimal {
        self.own_consumed + self.forfeited_consumed + self.total_survivor_charges()
    }
}

/// Pooled default fund with per-member contributions.
///
/// The balance is the sum of live members' contributions plus the pool
/// forfeited by defaulted members, so the two can never drift apart. A
/// defaulter's leftover contribution moves to that pool when it defaults
/// and is spent on later losses before any survivor is charged; defaulted
/// members are never charged again. Losses beyond the fund are kept as
/// [`MutualizationDeficit`]s.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::agents::default_fund::DefaultFund;
/// use ccp_risk_engine::core::agent_id::AgentId;
/// use rust_decimal_macros::dec;
///
/// let mut fund = DefaultFund::new();
/// fund.contribute(&AgentId::new("A"), dec!(10));
/// fund.contribute(&AgentId::new("B"), dec!(30));
/// fund.contribute(&AgentId::new("C"), dec!(10));
///
/// let outcome = fund.mutualize(1, &AgentId::new("A"), dec!(30));
/// assert_eq!(outcome.own_consumed, dec!(10));
/// assert_eq!(outcome.survivor_charges[&AgentId::new("B")], dec!(15));
/// assert_eq!(outcome.survivor_charges[&AgentId::new("C")], dec!(5));
/// assert_eq!(fund.balance(), dec!(20));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultFund {
    contributions: BTreeMap<AgentId, Decimal>,
    /// Everything each member has been asked to contribute; the target
    /// for replenishment after losses.
    #[serde(default)]
    committed: BTreeMap<AgentId, Decimal>,
    #[serde(default)]
    forfeited: Decimal,
    #[serde(default)]
    forfeited_spent: Decimal,
    #[serde(default)]
    retired: BTreeSet<AgentId>,
    losses_absorbed: BTreeMap<AgentId, Decimal>,
    deficits: Vec<MutualizationDeficit>,
}

impl DefaultFund {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to `member`'s contribution. Defaulted members cannot contribute.
    pub fn contribute(&mut self, member: &AgentId, amount: Decimal) {
        if self.retired.contains(member) {
            log::debug!("ignoring contribution from defaulted member {}", member);
            return;
        }
        let amount = amount.max(Decimal::ZERO);
        *self
            .committed
            .entry(member.clone())
            .or_insert(Decimal::ZERO) += amount;
        self.replenish(member, amount);
    }

    /// Restore part of `member`'s contribution after a loss, without
    /// raising what it has committed.
    pub fn replenish(&mut self, member: &AgentId, amount: Decimal) {
        if self.retired.contains(member) {
            return;
        }
        *self
            .contributions
            .entry(member.clone())
            .or_insert(Decimal::ZERO) += amount.max(Decimal::ZERO);
    }

    /// How far `member`'s contribution sits below its commitment.
    pub fn replenish_gap(&self, member: &AgentId) -> Decimal {
        if self.retired.contains(member) {
            return Decimal::ZERO;
        }
        let committed = self.committed.get(member).copied().unwrap_or(Decimal::ZERO);
        (committed - self.contribution(member)).max(Decimal::ZERO)
    }

    // --- Accessors ---

    pub fn balance(&self) -> Decimal {
        self.contributions.values().copied().sum::<Decimal>() + self.forfeited
    }

    /// Leftover contributions of defaulted members not yet spent.
    pub fn forfeited(&self) -> Decimal {
        self.forfeited
    }

    pub fn is_retired(&self, member: &AgentId) -> bool {
        self.retired.contains(member)
    }

    pub fn contribution(&self, member: &AgentId) -> Decimal {
        self.contributions
            .get(member)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn contributions(&self) -> &BTreeMap<AgentId, Decimal> {
        &self.contributions
    }

    pub fn losses_absorbed(&self, member: &AgentId) -> Decimal {
        self.losses_absorbed
            .get(member)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn total_losses_absorbed(&self) -> Decimal {
        self.losses_absorbed.values().copied().sum::<Decimal>() + self.forfeited_spent
    }

    pub fn deficits(&self) -> &[MutualizationDeficit] {
        &self.deficits
    }

    /// Cumulative unfunded loss across all defaults.
    pub fn total_deficit(&self) -> Decimal {
        self.deficits.iter().map(|d| d.amount).sum()
    }

    fn charge(&mut self, member: &AgentId, amount: Decimal) {
        if amount.is_zero() {
            return;
        }
        if let Some(c) = self.contributions.get_mut(member) {
            *c -= amount;
        }
        *self
            .losses_absorbed
            .entry(member.clone())
            .or_insert(Decimal::ZERO) += amount;
    }

    fn retire(&mut self, member: &AgentId) {
        if let Some(left) = self.contributions.remove(member) {
            self.forfeited += left;
        }
        self.retired.insert(member.clone());
    }

    /// Cover `shortfall` left by `defaulter`: its own contribution first,
    /// then the forfeited pool, then survivors pro-rata to their
    /// contributions (each capped at its contribution). Whatever remains is
    /// recorded as a deficit. The defaulter is retired afterwards and any
    /// contribution it has left is forfeited.
    pub fn mutualize(
        &mut self,
        step: u64,
        defaulter: &AgentId,
        shortfall: Decimal,
    ) -> MutualizationOutcome {
        let shortfall = shortfall.max(Decimal::ZERO);
        let fund_balance_before = self.balance();

        let own_consumed = self.contribution(defaulter).min(shortfall);
        self.charge(defaulter, own_consumed);
        let mut residual = shortfall - own_consumed;
        let forfeited_consumed = self.forfeited.min(residual);
        self.forfeited -= forfeited_consumed;
        self.forfeited_spent += forfeited_consumed;
        residual -= forfeited_consumed;
        self.retire(defaulter);

        let survivors: Vec<(AgentId, Decimal)> = self
            .contributions
            .iter()
            .filter(|(id, c)| !self.retired.contains(*id) && **c > Decimal::ZERO)
            .map(|(id, c)| (id.clone(), *c))
            .collect();
        let pool: Decimal = survivors.iter().map(|(_, c)| *c).sum();

        let mut charges: BTreeMap<AgentId, Decimal> = BTreeMap::new();
        if residual > Decimal::ZERO && pool > Decimal::ZERO {
            if residual >= pool {
                for (id, c) in &survivors {
                    charges.insert(id.clone(), *c);
                }
            } else {
                for (id, c) in &survivors {
                    let share = (residual * *c / pool)
                        .round_dp_with_strategy(CHARGE_DP, RoundingStrategy::ToZero)
                        .min(*c);
                    charges.insert(id.clone(), share);
                }
                // Rounding remainder, assigned in member order within caps.
                let mut leftover = residual - charges.values().copied().sum::<Decimal>();
                for (id, c) in &survivors {
                    if leftover <= Decimal::ZERO {
                        break;
                    }
                    if let Some(charge) = charges.get_mut(id) {
                        let extra = (*c - *charge).min(leftover);
                        *charge += extra;
                        leftover -= extra;
                    }
                }
            }
        }
        for (id, amount) in &charges {
            self.charge(id, *amount);
        }
        residual -= charges.values().copied().sum::<Decimal>();

        let deficit = if residual > Decimal::ZERO {
            let deficit = MutualizationDeficit {
                step,
                defaulter: defaulter.clone(),
                amount: residual,
            };
            log::warn!("{}", deficit);
            self.deficits.push(deficit.clone());
            Some(deficit)
        } else {
            None
        };

        MutualizationOutcome {
            defaulter: defaulter.clone(),
            shortfall,
            fund_balance_before,
            own_consumed,
            forfeited_consumed,
            survivor_charges: charges,
            deficit,
        }
    }
}
