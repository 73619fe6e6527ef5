//! Initial network generation: who lends to whom, and each member's
//! starting balance sheet.

use crate::core::agent_id::AgentId;
use crate::core::amount::from_f64;
use crate::core::balance_sheet::BalanceSheet;
use crate::core::config::{AmountRange, SimulationConfig};
use crate::core::error::ConfigError;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Shape of the bilateral exposure network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkTopology {
    /// Each pair is linked with probability `p`.
    ErdosRenyi { p: f64 },
    /// Preferential attachment, `m` links per new node.
    ScaleFree { m: usize },
    /// Ring lattice of degree `k`, each link rewired with probability `beta`.
    SmallWorld { k: usize, beta: f64 },
    Complete,
}

impl NetworkTopology {
    pub fn validate(&self, n: usize) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidParameter {
            field: "topology",
            reason,
        };
        match *self {
            NetworkTopology::ErdosRenyi { p } => {
                if !(p.is_finite() && (0.0..=1.0).contains(&p)) {
                    return Err(invalid(format!("edge probability {} not in [0, 1]", p)));
                }
            }
            NetworkTopology::ScaleFree { m } => {
                if m == 0 || m >= n {
                    return Err(invalid(format!("m = {} must be in [1, {})", m, n)));
                }
            }
            NetworkTopology::SmallWorld { k, beta } => {
                if k < 2 || k >= n {
                    return Err(invalid(format!("k = {} must be in [2, {})", k, n)));
                }
                if !(beta.is_finite() && (0.0..=1.0).contains(&beta)) {
                    return Err(invalid(format!("rewiring probability {} not in [0, 1]", beta)));
                }
            }
            NetworkTopology::Complete => {}
        }
        Ok(())
    }

    /// Undirected links as `(i, j)` with `i < j`, sorted.
    pub fn generate_links(&self, n: usize, rng: &mut impl Rng) -> Vec<(usize, usize)> {
        let mut links = BTreeSet::new();
        match *self {
            NetworkTopology::ErdosRenyi { p } => {
                for i in 0..n {
                    for j in (i + 1)..n {
                        if rng.gen::<f64>() < p {
                            links.insert((i, j));
                        }
                    }
                }
            }
            NetworkTopology::ScaleFree { m } => {
                let mut degree = vec![0usize; n];
                // Seed clique of m + 1 nodes.
                for i in 0..=m.min(n.saturating_sub(1)) {
                    for j in (i + 1)..=m.min(n.saturating_sub(1)) {
                        links.insert((i, j));
                        degree[i] += 1;
                        degree[j] += 1;
                    }
                }
                for new in (m + 1)..n {
                    let mut targets = BTreeSet::new();
                    while targets.len() < m {
                        let total: usize = degree[..new].iter().map(|d| d + 1).sum();
                        let mut pick = rng.gen_range(0..total);
                        for (node, d) in degree[..new].iter().enumerate() {
                            if pick < d + 1 {
                                targets.insert(node);
                                break;
                            }
                            pick -= d + 1;
                        }
                    }
                    for t in targets {
                        links.insert((t, new));
                        degree[t] += 1;
                        degree[new] += 1;
                    }
                }
            }
            NetworkTopology::SmallWorld { k, beta } => {
                let half = (k / 2).max(1);
                for i in 0..n {
                    for j in 1..=half {
                        let neighbor = (i + j) % n;
                        links.insert(ordered(i, neighbor));
                    }
                }
                let lattice: Vec<(usize, usize)> = links.iter().copied().collect();
                for (a, b) in lattice {
                    if rng.gen::<f64>() >= beta {
                        continue;
                    }
                    for _ in 0..n {
                        let target = rng.gen_range(0..n);
                        let candidate = ordered(a, target);
                        if target != a && !links.contains(&candidate) {
                            links.remove(&(a, b));
                            links.insert(candidate);
                            break;
                        }
                    }
                }
            }
            NetworkTopology::Complete => {
                for i in 0..n {
                    for j in (i + 1)..n {
                        links.insert((i, j));
                    }
                }
            }
        }
        links.into_iter().collect()
    }
}

fn ordered(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn draw(range: AmountRange, rng: &mut impl Rng) -> Decimal {
    let value = if range.max > range.min {
        rng.gen_range(range.min..range.max)
    } else {
        range.min
    };
    from_f64(value).round_dp(2)
}

/// Generate the members and their starting balance sheets.
///
/// Every link becomes a loan in a random direction: the lender holds a
/// positive exposure, the borrower the matching negative one. Initial
/// margin (`base x initial rate x coverage`) is posted out of cash.
pub fn generate_network(
    config: &SimulationConfig,
    rng: &mut impl Rng,
) -> Vec<(AgentId, BalanceSheet)> {
    let n = config.bank_count;
    let init = &config.initial;
    let ids: Vec<AgentId> = (0..n).map(AgentId::bank).collect();
    let mut sheets: Vec<BalanceSheet> = (0..n)
        .map(|_| {
            let cash = draw(init.cash, rng);
            let capital = draw(init.capital_buffer, rng);
            let liquid = draw(init.liquid_assets, rng);
            BalanceSheet::new(cash, capital, liquid, init.credit_line)
        })
        .collect();

    for (i, j) in config.topology.generate_links(n, rng) {
        let amount = draw(init.exposure, rng);
        if amount.is_zero() {
            continue;
        }
        let (lender, borrower) = if rng.gen_bool(0.5) { (i, j) } else { (j, i) };
        sheets[lender].adjust_exposure(&ids[borrower], amount);
        sheets[borrower].adjust_exposure(&ids[lender], -amount);
    }

    let coverage = init.margin_coverage * config.margin.initial_rate;
    for sheet in &mut sheets {
        let initial = (sheet.margin_base() * coverage).round_dp(8);
        sheet.post_margin(initial.min(sheet.cash()));
    }

    log::debug!(
        "generated {} members with {:?} topology",
        n,
        config.topology
    );
    ids.into_iter().zip(sheets).collect()
}
