use crate::core::agent_id::AgentId;
use crate::core::balance_sheet::BalanceSheet;
use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A change to one bilateral exposure edge, emitted at the end of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EdgeEvent {
    Added {
        from: AgentId,
        to: AgentId,
        amount: Decimal,
    },
    Updated {
        from: AgentId,
        to: AgentId,
        previous: Decimal,
        amount: Decimal,
    },
    Removed {
        from: AgentId,
        to: AgentId,
        previous: Decimal,
    },
}

/// Network shape after one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyStats {
    pub step: u64,
    pub nodes: usize,
    pub edges: usize,
    pub total_exposure: Decimal,
    pub max_out_degree: usize,
    /// Strongly connected groups of more than one member: a default in
    /// one can reach every other through claims.
    pub contagion_clusters: usize,
    pub largest_cluster: usize,
}

/// Directed graph of claims between members.
///
/// An edge `from -> to` with weight `w` means `from` holds a claim of `w`
/// on `to`. The graph is maintained from edge events, never mutated
/// directly by agents.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::core::agent_id::AgentId;
/// use ccp_risk_engine::graph::exposure_graph::{EdgeEvent, ExposureGraph};
/// use rust_decimal_macros::dec;
///
/// let mut graph = ExposureGraph::new();
/// graph.apply(&EdgeEvent::Added {
///     from: AgentId::new("A"),
///     to: AgentId::new("B"),
///     amount: dec!(40),
/// });
///
/// assert_eq!(graph.edge_count(), 1);
/// assert_eq!(graph.claim(&AgentId::new("A"), &AgentId::new("B")), dec!(40));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExposureGraph {
    graph: StableDiGraph<AgentId, Decimal>,
    nodes: BTreeMap<AgentId, NodeIndex>,
    history: Vec<TopologyStats>,
}

/// Claims implied by a set of balance sheets, keyed `(from, to)`.
pub fn claims_of<'a>(
    sheets: impl IntoIterator<Item = (&'a AgentId, &'a BalanceSheet)>,
) -> BTreeMap<(AgentId, AgentId), Decimal> {
    let mut claims = BTreeMap::new();
    for (id, sheet) in sheets {
        for (cp, amount) in sheet.exposures() {
            if *amount > Decimal::ZERO {
                claims.insert((id.clone(), cp.clone()), *amount);
            }
        }
    }
    claims
}

/// Events that turn `before` into `after`, in key order.
pub fn diff(
    before: &BTreeMap<(AgentId, AgentId), Decimal>,
    after: &BTreeMap<(AgentId, AgentId), Decimal>,
) -> Vec<EdgeEvent> {
    let mut events = Vec::new();
    for ((from, to), previous) in before {
        match after.get(&(from.clone(), to.clone())) {
            None => events.push(EdgeEvent::Removed {
                from: from.clone(),
                to: to.clone(),
                previous: *previous,
            }),
            Some(amount) if amount != previous => events.push(EdgeEvent::Updated {
                from: from.clone(),
                to: to.clone(),
                previous: *previous,
                amount: *amount,
            }),
            Some(_) => {}
        }
    }
    for ((from, to), amount) in after {
        if !before.contains_key(&(from.clone(), to.clone())) {
            events.push(EdgeEvent::Added {
                from: from.clone(),
                to: to.clone(),
                amount: *amount,
            });
        }
    }
    events
}

impl ExposureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the members' balance sheets.
    pub fn from_balances<'a>(
        sheets: impl IntoIterator<Item = (&'a AgentId, &'a BalanceSheet)>,
    ) -> Self {
        let mut graph = Self::new();
        let sheets: Vec<_> = sheets.into_iter().collect();
        for (id, _) in &sheets {
            graph.node(id);
        }
        for event in diff(&BTreeMap::new(), &claims_of(sheets)) {
            graph.apply(&event);
        }
        graph
    }

    fn node(&mut self, id: &AgentId) -> NodeIndex {
        if let Some(idx) = self.nodes.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), idx);
        idx
    }

    pub fn apply(&mut self, event: &EdgeEvent) {
        match event {
            EdgeEvent::Added { from, to, amount }
            | EdgeEvent::Updated {
                from, to, amount, ..
            } => {
                let (a, b) = (self.node(from), self.node(to));
                match self.graph.find_edge(a, b) {
                    Some(e) => self.graph[e] = *amount,
                    None => {
                        self.graph.add_edge(a, b, *amount);
                    }
                }
            }
            EdgeEvent::Removed { from, to, .. } => {
                if let (Some(a), Some(b)) = (self.nodes.get(from), self.nodes.get(to)) {
                    if let Some(e) = self.graph.find_edge(*a, *b) {
                        self.graph.remove_edge(e);
                    }
                }
            }
        }
    }

    /// Bring the graph in line with `claims` and return what changed.
    pub fn sync(&mut self, claims: &BTreeMap<(AgentId, AgentId), Decimal>) -> Vec<EdgeEvent> {
        let events = diff(&self.claims(), claims);
        for event in &events {
            self.apply(event);
        }
        events
    }

    // --- Queries ---

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn claim(&self, from: &AgentId, to: &AgentId) -> Decimal {
        match (self.nodes.get(from), self.nodes.get(to)) {
            (Some(a), Some(b)) => self
                .graph
                .find_edge(*a, *b)
                .map(|e| self.graph[e])
                .unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    pub fn claims(&self) -> BTreeMap<(AgentId, AgentId), Decimal> {
        self.graph
            .edge_references()
            .map(|e| {
                (
                    (self.graph[e.source()].clone(), self.graph[e.target()].clone()),
                    *e.weight(),
                )
            })
            .collect()
    }

    /// Members holding claims on `id`, with amounts.
    pub fn creditors_of(&self, id: &AgentId) -> Vec<(AgentId, Decimal)> {
        let Some(idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<(AgentId, Decimal)> = self
            .graph
            .edges_directed(*idx, Direction::Incoming)
            .map(|e| (self.graph[e.source()].clone(), *e.weight()))
            .collect();
        out.sort();
        out
    }

    pub fn total_exposure(&self) -> Decimal {
        self.graph.edge_references().map(|e| *e.weight()).sum()
    }

    pub fn history(&self) -> &[TopologyStats] {
        &self.history
    }

    /// Compute and record the shape of the network at `step`.
    pub fn record_stats(&mut self, step: u64) -> TopologyStats {
        let components = tarjan_scc(&self.graph);
        let clusters: Vec<usize> = components
            .iter()
            .map(Vec::len)
            .filter(|len| *len > 1)
            .collect();
        let max_out_degree = self
            .graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Outgoing).count())
            .max()
            .unwrap_or(0);
        let stats = TopologyStats {
            step,
            nodes: self.node_count(),
            edges: self.edge_count(),
            total_exposure: self.total_exposure(),
            max_out_degree,
            contagion_clusters: clusters.len(),
            largest_cluster: clusters.iter().copied().max().unwrap_or(0),
        };
        self.history.push(stats.clone());
        stats
    }
}
