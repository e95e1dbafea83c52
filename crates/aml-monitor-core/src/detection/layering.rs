//! Fund-flow multigraph and bounded pass-through chain search.
//!
//! Nodes are accounts, edges are current non-self transactions in
//! (timestamp, id) order. A hop `a -> b` is valid when `b` leaves the account
//! `a` credited, no earlier than `a` and within the latency bound, forwarding
//! between `min_retention` and `max_retention` of `a`'s amount.
//!
//! For each edge the search extends backwards and forwards with memoized
//! bounded-depth DFS keyed by (edge, remaining depth), joins both halves into
//! the longest simple chain through that edge, and keeps maximal qualifying
//! chains only. Every candidate examined is charged against the scan budget.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};

use super::policy::{marker_bonus, RiskMarker, RiskPolicy, StaticRiskPolicy};
use super::{Annotation, Detector, DetectorReport, PatternKind, PatternMatch};
use crate::config::LayeringConfig;
use crate::error::AmlError;
use crate::ledger::{StoreSnapshot, Transaction};
use crate::types::{format_amount, Score};
use crate::AmlResult;

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FlowEdge {
    pub tx: Arc<Transaction>,
    pub from: usize,
    pub to: usize,
}

/// Directed multigraph of fund flows built from one snapshot.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<String>,
    edges: Vec<FlowEdge>,
    /// Per node, edge indices in (timestamp, id) order
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl FlowGraph {
    /// Self-transfers are left out; they belong to the structuring domain.
    pub fn build(snapshot: &StoreSnapshot) -> Self {
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        let mut intern = |account: &str, nodes: &mut Vec<String>| -> usize {
            *index.entry(account.to_string()).or_insert_with(|| {
                nodes.push(account.to_string());
                nodes.len() - 1
            })
        };

        for tx in snapshot.current_transactions() {
            if tx.is_self_transfer() {
                continue;
            }
            let from = intern(&tx.sender.account_id, &mut nodes);
            let to = intern(&tx.receiver.account_id, &mut nodes);
            edges.push(FlowEdge {
                tx: Arc::clone(tx),
                from,
                to,
            });
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        for (i, edge) in edges.iter().enumerate() {
            outgoing[edge.from].push(i);
            incoming[edge.to].push(i);
        }

        FlowGraph {
            nodes,
            edges,
            outgoing,
            incoming,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge(&self, i: usize) -> &FlowEdge {
        &self.edges[i]
    }

    pub fn node(&self, i: usize) -> &str {
        &self.nodes[i]
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

struct ChainSearch<'g> {
    graph: &'g FlowGraph,
    markers: &'g [BTreeSet<RiskMarker>],
    latency: Duration,
    min_retention: Decimal,
    max_retention: Decimal,
    successors: HashMap<usize, Vec<usize>>,
    predecessors: HashMap<usize, Vec<usize>>,
    forward: HashMap<(usize, usize), Vec<usize>>,
    backward: HashMap<(usize, usize), Vec<usize>>,
    expansions: u64,
    budget: u64,
    deadline: Option<Instant>,
    exhausted: bool,
}

impl<'g> ChainSearch<'g> {
    fn new(
        graph: &'g FlowGraph,
        markers: &'g [BTreeSet<RiskMarker>],
        config: &LayeringConfig,
    ) -> Self {
        ChainSearch {
            graph,
            markers,
            latency: Duration::hours(config.max_hop_latency_hours),
            min_retention: config.min_retention,
            max_retention: config.max_retention,
            successors: HashMap::new(),
            predecessors: HashMap::new(),
            forward: HashMap::new(),
            backward: HashMap::new(),
            expansions: 0,
            budget: config.scan_budget,
            deadline: config
                .scan_deadline_ms
                .and_then(|ms| Instant::now().checked_add(StdDuration::from_millis(ms))),
            exhausted: false,
        }
    }

    /// Account for one unit of work. Returns false once the budget or the
    /// deadline is spent.
    fn charge(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        self.expansions += 1;
        let late = self.expansions % 256 == 0 && self.deadline.is_some_and(|d| Instant::now() >= d);
        if self.expansions > self.budget || late {
            self.exhausted = true;
        }
        !self.exhausted
    }

    fn is_hop(&self, a: usize, b: usize) -> bool {
        let (ea, eb) = (self.graph.edge(a), self.graph.edge(b));
        if a == b || ea.to != eb.from {
            return false;
        }
        let gap = eb.tx.timestamp - ea.tx.timestamp;
        if gap < Duration::zero() || gap > self.latency {
            return false;
        }
        let retention = eb.tx.amount / ea.tx.amount;
        retention >= self.min_retention && retention <= self.max_retention
    }

    fn successors(&mut self, e: usize) -> Vec<usize> {
        if let Some(cached) = self.successors.get(&e) {
            return cached.clone();
        }
        let graph = self.graph;
        let edge = graph.edge(e);
        let (start, end) = (edge.tx.timestamp, edge.tx.timestamp + self.latency);
        let candidates = &graph.outgoing[edge.to];
        let first = candidates.partition_point(|&c| graph.edge(c).tx.timestamp < start);

        let mut found = Vec::new();
        for &c in &candidates[first..] {
            if graph.edge(c).tx.timestamp > end {
                break;
            }
            if !self.charge() {
                return found;
            }
            if self.is_hop(e, c) {
                found.push(c);
            }
        }
        self.successors.insert(e, found.clone());
        found
    }

    fn predecessors(&mut self, e: usize) -> Vec<usize> {
        if let Some(cached) = self.predecessors.get(&e) {
            return cached.clone();
        }
        let graph = self.graph;
        let edge = graph.edge(e);
        let (start, end) = (edge.tx.timestamp - self.latency, edge.tx.timestamp);
        let candidates = &graph.incoming[edge.from];
        let first = candidates.partition_point(|&c| graph.edge(c).tx.timestamp < start);

        let mut found = Vec::new();
        for &c in &candidates[first..] {
            if graph.edge(c).tx.timestamp > end {
                break;
            }
            if !self.charge() {
                return found;
            }
            if self.is_hop(c, e) {
                found.push(c);
            }
        }
        self.predecessors.insert(e, found.clone());
        found
    }

    fn marker_count(&self, chain: &[usize]) -> usize {
        chain_markers(self.markers, chain).len()
    }

    fn better(&self, candidate: &[usize], best: &[usize]) -> bool {
        (candidate.len(), self.marker_count(candidate)) > (best.len(), self.marker_count(best))
    }

    /// Best simple chain starting with `e`, at most `depth` edges.
    fn forward(&mut self, e: usize, depth: usize) -> Vec<usize> {
        if depth <= 1 {
            return vec![e];
        }
        if let Some(cached) = self.forward.get(&(e, depth)) {
            return cached.clone();
        }
        let mut best = vec![e];
        if !self.charge() {
            return best;
        }
        for f in self.successors(e) {
            if self.exhausted {
                break;
            }
            let tail = self.forward(f, depth - 1);
            let candidate = join(self.graph, &[e], &tail);
            if self.better(&candidate, &best) {
                best = candidate;
            }
        }
        if !self.exhausted {
            self.forward.insert((e, depth), best.clone());
        }
        best
    }

    /// Best simple chain ending with `e`, at most `depth` edges.
    fn backward(&mut self, e: usize, depth: usize) -> Vec<usize> {
        if depth <= 1 {
            return vec![e];
        }
        if let Some(cached) = self.backward.get(&(e, depth)) {
            return cached.clone();
        }
        let mut best = vec![e];
        if !self.charge() {
            return best;
        }
        for g in self.predecessors(e) {
            if self.exhausted {
                break;
            }
            let head = self.backward(g, depth - 1);
            let candidate = join_backward(self.graph, &head, e);
            if self.better(&candidate, &best) {
                best = candidate;
            }
        }
        if !self.exhausted {
            self.backward.insert((e, depth), best.clone());
        }
        best
    }

    /// Longest chain through `e` within `max_depth` edges.
    fn chain_through(&mut self, e: usize, max_depth: usize) -> Vec<usize> {
        let head = self.backward(e, max_depth);
        let remaining = max_depth + 1 - head.len();
        let tail = self.forward(e, remaining);
        join(self.graph, &head, &tail[1..])
    }
}

/// Append `tail` to `head`, stopping before the first edge that would revisit
/// an account.
fn join(graph: &FlowGraph, head: &[usize], tail: &[usize]) -> Vec<usize> {
    let mut seen: HashSet<usize> = HashSet::new();
    if let Some(&first) = head.first() {
        seen.insert(graph.edge(first).from);
    }
    for &h in head {
        seen.insert(graph.edge(h).to);
    }
    let mut chain = head.to_vec();
    for &t in tail {
        if !seen.insert(graph.edge(t).to) {
            break;
        }
        chain.push(t);
    }
    chain
}

/// Prepend as much of `head` to `e` as keeps the chain simple.
fn join_backward(graph: &FlowGraph, head: &[usize], e: usize) -> Vec<usize> {
    let edge = graph.edge(e);
    let mut seen: HashSet<usize> = HashSet::from([edge.from, edge.to]);
    let mut kept = Vec::new();
    // `head` ends with the edge feeding `e`; walk it back from there
    for &h in head.iter().rev() {
        if !seen.insert(graph.edge(h).from) {
            break;
        }
        kept.push(h);
    }
    kept.reverse();
    kept.push(e);
    kept
}

fn chain_markers(markers: &[BTreeSet<RiskMarker>], chain: &[usize]) -> BTreeSet<RiskMarker> {
    chain
        .iter()
        .flat_map(|&i| markers[i].iter().copied())
        .collect()
}

/// Drop chains that are a contiguous part of a longer kept chain.
fn maximal_chains(chains: BTreeSet<Vec<usize>>) -> Vec<Vec<usize>> {
    let all: Vec<Vec<usize>> = chains.into_iter().collect();
    all.iter()
        .filter(|c| {
            !all.iter().any(|other| {
                other.len() > c.len() && other.windows(c.len()).any(|w| w == c.as_slice())
            })
        })
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct LayeringDetector {
    config: LayeringConfig,
    policy: Arc<dyn RiskPolicy>,
}

impl LayeringDetector {
    pub fn new(config: LayeringConfig) -> Self {
        Self::with_policy(config, Arc::new(StaticRiskPolicy))
    }

    pub fn with_policy(config: LayeringConfig, policy: Arc<dyn RiskPolicy>) -> Self {
        LayeringDetector { config, policy }
    }

    fn build_match(
        &self,
        graph: &FlowGraph,
        chain: &[usize],
        markers: BTreeSet<RiskMarker>,
    ) -> PatternMatch {
        let edges: Vec<&FlowEdge> = chain.iter().map(|&i| graph.edge(i)).collect();
        let first = &edges[0].tx;
        let last = &edges[edges.len() - 1].tx;
        let retention = last.amount / first.amount;

        let hops = Decimal::from(chain.len());
        let length_bonus = (dec!(0.1) * (hops - dec!(2))).min(dec!(0.4));
        let confidence: Score =
            dec!(0.3) + length_bonus + dec!(0.2) * retention + marker_bonus(&markers);

        let mut route = vec![first.sender.name.clone()];
        route.extend(edges.iter().map(|e| e.tx.receiver.name.clone()));
        let amounts: Vec<String> = edges
            .iter()
            .map(|e| format_amount(e.tx.amount, &e.tx.currency))
            .collect();
        let elapsed = last.timestamp - first.timestamp;
        let marker_text: Vec<&str> = markers.iter().map(|m| m.describe()).collect();
        let evidence = format!(
            "{}-hop chain {}: {} ({}% retained end to end) within {}h; markers: {}",
            chain.len(),
            route.join(" -> "),
            amounts.join(" -> "),
            (retention * dec!(100)).round(),
            (elapsed.num_minutes() + 59) / 60,
            marker_text.join(", "),
        );

        let entities: BTreeSet<String> = edges
            .iter()
            .flat_map(|e| [graph.node(e.from).to_string(), graph.node(e.to).to_string()])
            .collect();

        PatternMatch::new(
            PatternKind::Layering,
            edges.iter().map(|e| e.tx.id.clone()),
            entities,
            confidence,
            evidence,
        )
    }
}

impl Detector for LayeringDetector {
    fn name(&self) -> &'static str {
        "layering"
    }

    fn kind(&self) -> PatternKind {
        PatternKind::Layering
    }

    fn detect(&self, snapshot: &StoreSnapshot) -> AmlResult<DetectorReport> {
        let graph = FlowGraph::build(snapshot);
        let markers: Vec<BTreeSet<RiskMarker>> = graph
            .edges()
            .iter()
            .map(|e| self.policy.markers(&e.tx))
            .collect();

        let mut search = ChainSearch::new(&graph, &markers, &self.config);
        let mut chains = BTreeSet::new();
        for e in 0..graph.edge_count() {
            if search.exhausted {
                break;
            }
            let chain = search.chain_through(e, self.config.max_depth);
            if chain.len() >= self.config.min_hops && !chain_markers(&markers, &chain).is_empty() {
                chains.insert(chain);
            }
        }

        let mut report = DetectorReport::default();
        for chain in maximal_chains(chains) {
            let chain_markers = chain_markers(&markers, &chain);
            let mut m = self.build_match(&graph, &chain, chain_markers);
            if search.exhausted {
                m = m.with_annotation(Annotation::IncompleteScan);
            }
            debug!(match_id = %m.id, hops = chain.len(), "layering match");
            report.matches.push(m);
        }

        if search.exhausted {
            let err = AmlError::ScanBudgetExceeded {
                expansions: search.expansions,
                budget: self.config.scan_budget,
            };
            warn!(
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                partial_matches = report.matches.len(),
                "{err}"
            );
            report.warnings.push(err.to_string());
            report.incomplete = true;
        }
        Ok(report)
    }
}
