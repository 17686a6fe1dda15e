//! Graph topology analysis for the concept token layer.
//!
//! A directed multigraph over canonical tokens (edges labeled by relation)
//! kept in sync with the ConceptGraph projection. Metric results are cached
//! per `graph_version` (the last processed event id); alias events force a
//! full rebuild because they can reshape canonicalization.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{json, Value};

use pmm_core::{Event, EventKind};
use pmm_projections::ConceptGraph;

const EIGENVECTOR_MAX_ITER: usize = 500;
const EIGENVECTOR_TOL: f64 = 1e-6;
const PAGERANK_ALPHA: f64 = 0.85;
const PAGERANK_MAX_ITER: usize = 100;
const PAGERANK_TOL: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct NodeData {
    pub token: String,
    pub concept_kind: String,
    pub root_event_id: Option<u64>,
    pub tail_event_id: Option<u64>,
    pub binding_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeData {
    pub relations: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathMetrics {
    pub avg_path_length: f64,
    pub diameter: usize,
    pub disconnected: bool,
    pub component_size: usize,
}

/// Deterministic index view: tokens sorted, adjacency by position.
struct View {
    tokens: Vec<String>,
    out: Vec<Vec<usize>>,
    und: Vec<BTreeSet<usize>>,
}

pub struct GraphTopologyAnalyzer {
    graph: DiGraph<NodeData, EdgeData>,
    index: HashMap<String, NodeIndex>,
    graph_version: u64,
    centrality_cache: HashMap<String, (u64, BTreeMap<String, f64>)>,
    connectivity_cache: Option<(u64, Connectivity)>,
    path_cache: Option<(u64, PathMetrics)>,
    communities_cache: Option<(u64, Vec<Vec<String>>)>,
}

#[derive(Debug, Clone)]
pub struct Connectivity {
    pub weakly_connected_components: Vec<Vec<String>>,
    pub strongly_connected_components: Vec<Vec<String>>,
}

impl GraphTopologyAnalyzer {
    pub fn new(concept_graph: &ConceptGraph) -> Self {
        let mut analyzer = Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            graph_version: 0,
            centrality_cache: HashMap::new(),
            connectivity_cache: None,
            path_cache: None,
            communities_cache: None,
        };
        analyzer.rebuild(concept_graph);
        analyzer
    }

    pub fn graph_version(&self) -> u64 {
        self.graph_version
    }

    /// Rebuild the topology graph from ConceptGraph state.
    pub fn rebuild(&mut self, concept_graph: &ConceptGraph) {
        tracing::debug!(
            tokens = concept_graph.all_tokens().len(),
            version = concept_graph.last_event_id(),
            "rebuilding topology graph"
        );
        self.graph.clear();
        self.index.clear();
        for token in concept_graph.all_tokens() {
            self.add_or_update_node(concept_graph, &token);
        }
        for (from, to, relation) in concept_graph.edges().cloned().collect::<Vec<_>>() {
            self.add_edge(concept_graph, &from, &to, &relation);
        }
        self.graph_version = concept_graph.last_event_id();
        self.invalidate_caches();
    }

    /// Incrementally fold one ledger event into the topology.
    pub fn sync(&mut self, event: &Event, concept_graph: &ConceptGraph) {
        if event.id <= self.graph_version {
            return;
        }
        match event.kind {
            EventKind::ConceptAlias => {
                // Alias changes can reshape canonicalization; rebuild safely.
                self.rebuild(concept_graph);
                self.graph_version = self.graph_version.max(event.id);
                return;
            }
            EventKind::ConceptDefine | EventKind::IdentityAdoption => {
                if let Some(token) = event
                    .content_json()
                    .as_ref()
                    .and_then(|d| d.get("token"))
                    .and_then(Value::as_str)
                {
                    self.add_or_update_node(concept_graph, token);
                }
            }
            EventKind::ConceptBindEvent
            | EventKind::ConceptBindAsync
            | EventKind::ConceptBindThread => {
                if let Some(data) = event.content_json() {
                    if let Some(tokens) = data.get("tokens").and_then(Value::as_array) {
                        for token in tokens.iter().filter_map(Value::as_str) {
                            self.add_or_update_node(concept_graph, token);
                        }
                    }
                }
            }
            EventKind::ConceptRelate => {
                if let Some(data) = event.content_json() {
                    if let (Some(from), Some(to), Some(relation)) = (
                        data.get("from").and_then(Value::as_str),
                        data.get("to").and_then(Value::as_str),
                        data.get("relation").and_then(Value::as_str),
                    ) {
                        self.add_or_update_node(concept_graph, from);
                        self.add_or_update_node(concept_graph, to);
                        self.add_edge(concept_graph, from, to, relation);
                    }
                }
            }
            _ => return,
        }
        self.graph_version = event.id;
        self.invalidate_caches();
    }

    fn invalidate_caches(&mut self) {
        self.centrality_cache.clear();
        self.connectivity_cache = None;
        self.path_cache = None;
        self.communities_cache = None;
    }

    fn add_or_update_node(&mut self, concept_graph: &ConceptGraph, token: &str) {
        let canonical = concept_graph.canonical_token(token);
        if canonical.is_empty() {
            return;
        }
        let data = NodeData {
            token: canonical.clone(),
            concept_kind: concept_graph.concept_kind(&canonical).unwrap_or("").to_string(),
            root_event_id: concept_graph.root_event(&canonical),
            tail_event_id: concept_graph.tail_event(&canonical),
            binding_count: concept_graph.binding_count(&canonical),
        };
        match self.index.get(&canonical) {
            Some(&idx) => {
                self.graph[idx] = data;
            }
            None => {
                let idx = self.graph.add_node(data);
                self.index.insert(canonical, idx);
            }
        }
    }

    fn add_edge(&mut self, concept_graph: &ConceptGraph, from: &str, to: &str, relation: &str) {
        let from_c = concept_graph.canonical_token(from);
        let to_c = concept_graph.canonical_token(to);
        let (Some(&from_idx), Some(&to_idx)) = (self.index.get(&from_c), self.index.get(&to_c))
        else {
            return;
        };
        match self.graph.find_edge(from_idx, to_idx) {
            Some(edge) => {
                self.graph[edge].relations.insert(relation.to_string());
            }
            None => {
                let mut data = EdgeData::default();
                data.relations.insert(relation.to_string());
                self.graph.add_edge(from_idx, to_idx, data);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    pub fn density(&self) -> f64 {
        let n = self.graph.node_count();
        if n <= 1 {
            return 0.0;
        }
        self.graph.edge_count() as f64 / (n * (n - 1)) as f64
    }

    /// Average clustering coefficient of the undirected view; isolated and
    /// degree-1 nodes contribute zero.
    pub fn clustering_coefficient(&self) -> f64 {
        let view = self.view();
        let n = view.tokens.len();
        if n <= 1 {
            return 0.0;
        }
        let mut total = 0.0;
        for v in 0..n {
            let neighbors = &view.und[v];
            let k = neighbors.len();
            if k < 2 {
                continue;
            }
            let mut links = 0usize;
            for &a in neighbors {
                for &b in neighbors {
                    if a < b && view.und[a].contains(&b) {
                        links += 1;
                    }
                }
            }
            total += 2.0 * links as f64 / (k * (k - 1)) as f64;
        }
        total / n as f64
    }

    /// Centrality family, cached per graph version.
    /// Supported metrics: degree, in_degree, out_degree, betweenness,
    /// closeness, eigenvector, pagerank.
    pub fn centrality(&mut self, metric: &str) -> BTreeMap<String, f64> {
        if let Some((version, cached)) = self.centrality_cache.get(metric) {
            if *version == self.graph_version {
                return cached.clone();
            }
        }
        let view = self.view();
        let result = match metric {
            "degree" => degree_centrality(&view, Direction::Outgoing, true),
            "in_degree" => degree_centrality(&view, Direction::Incoming, false),
            "out_degree" => degree_centrality(&view, Direction::Outgoing, false),
            "betweenness" => betweenness_centrality(&view),
            "closeness" => closeness_centrality(&view),
            "eigenvector" => eigenvector_centrality(&view),
            "pagerank" => pagerank(&view),
            _ => BTreeMap::new(),
        };
        self.centrality_cache
            .insert(metric.to_string(), (self.graph_version, result.clone()));
        result
    }

    /// Top-k nodes by a centrality metric, ties broken by token order.
    pub fn get_top_k(&mut self, metric: &str, k: usize) -> Vec<(String, f64)> {
        let values = self.centrality(metric);
        let mut items: Vec<(String, f64)> = values.into_iter().collect();
        items.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        items.truncate(k);
        items
    }

    /// Bridge nodes: top-k by betweenness.
    pub fn bridge_nodes(&mut self, top_k: usize) -> Vec<(String, f64)> {
        self.get_top_k("betweenness", top_k)
    }

    pub fn connectivity(&mut self) -> Connectivity {
        if let Some((version, cached)) = &self.connectivity_cache {
            if *version == self.graph_version {
                return cached.clone();
            }
        }
        let view = self.view();
        let weak = weak_components(&view);

        let mut strong: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .map(|component| {
                let mut tokens: Vec<String> = component
                    .into_iter()
                    .map(|idx| self.graph[idx].token.clone())
                    .collect();
                tokens.sort();
                tokens
            })
            .collect();
        strong.sort();

        let result = Connectivity {
            weakly_connected_components: weak,
            strongly_connected_components: strong,
        };
        self.connectivity_cache = Some((self.graph_version, result.clone()));
        result
    }

    /// Shortest-path metrics over the largest weak component, undirected.
    pub fn path_metrics(&mut self) -> PathMetrics {
        if let Some((version, cached)) = &self.path_cache {
            if *version == self.graph_version {
                return *cached;
            }
        }
        let view = self.view();
        let metrics = if view.tokens.len() <= 1 {
            PathMetrics { avg_path_length: 0.0, diameter: 0, disconnected: false, component_size: 0 }
        } else {
            let components = weak_component_indices(&view);
            let disconnected = components.len() > 1;
            let largest = components.into_iter().max_by_key(|c| (c.len(), std::cmp::Reverse(c.clone()))).unwrap_or_default();
            if largest.is_empty() {
                PathMetrics {
                    avg_path_length: 0.0,
                    diameter: 0,
                    disconnected,
                    component_size: 0,
                }
            } else {
                let (avg, diameter) = component_path_stats(&view, &largest);
                PathMetrics {
                    avg_path_length: avg,
                    diameter,
                    disconnected,
                    component_size: largest.len(),
                }
            }
        };
        self.path_cache = Some((self.graph_version, metrics));
        metrics
    }

    pub fn shortest_path(&self, source: &str, target: &str) -> Vec<String> {
        let view = self.view();
        let Some(src) = view.tokens.iter().position(|t| t == source) else {
            return Vec::new();
        };
        let Some(dst) = view.tokens.iter().position(|t| t == target) else {
            return Vec::new();
        };
        let mut prev: Vec<Option<usize>> = vec![None; view.tokens.len()];
        let mut visited = vec![false; view.tokens.len()];
        let mut queue = VecDeque::new();
        visited[src] = true;
        queue.push_back(src);
        while let Some(v) = queue.pop_front() {
            if v == dst {
                break;
            }
            for &w in &view.out[v] {
                if !visited[w] {
                    visited[w] = true;
                    prev[w] = Some(v);
                    queue.push_back(w);
                }
            }
        }
        if !visited[dst] {
            return Vec::new();
        }
        let mut path = vec![dst];
        while let Some(p) = prev[*path.last().unwrap_or(&dst)] {
            path.push(p);
        }
        path.reverse();
        path.into_iter().map(|i| view.tokens[i].clone()).collect()
    }

    /// Deterministic communities: greedy modularity merging on the
    /// undirected view, stable tie-breaking by smallest member token.
    pub fn communities(&mut self) -> Vec<Vec<String>> {
        if let Some((version, cached)) = &self.communities_cache {
            if *version == self.graph_version {
                return cached.clone();
            }
        }
        let view = self.view();
        let result = greedy_modularity_communities(&view);
        self.communities_cache = Some((self.graph_version, result.clone()));
        result
    }

    /// Articulation points of the undirected view.
    pub fn structural_vulnerabilities(&self) -> Vec<String> {
        let view = self.view();
        if view.tokens.len() <= 1 {
            return Vec::new();
        }
        articulation_points(&view)
            .into_iter()
            .map(|i| view.tokens[i].clone())
            .collect()
    }

    pub fn summary(&mut self) -> Value {
        let connectivity = self.connectivity();
        let path = self.path_metrics();
        let bridges = self.bridge_nodes(5);
        json!({
            "node_count": self.node_count(),
            "edge_count": self.edge_count(),
            "density": round6(self.density()),
            "clustering_coefficient": round6(self.clustering_coefficient()),
            "weak_component_count": connectivity.weakly_connected_components.len(),
            "strong_component_count": connectivity.strongly_connected_components.len(),
            "disconnected": path.disconnected,
            "avg_path_length": round6(path.avg_path_length),
            "diameter": path.diameter,
            "largest_component_size": path.component_size,
            "bridge_nodes": bridges,
            "structural_vulnerabilities": self.structural_vulnerabilities(),
        })
    }

    // ── subgraph metrics for identity topology ───────────────────────────────

    /// Weak components of the subgraph induced by `tokens` (present only).
    pub fn subgraph_components(&self, tokens: &[String]) -> Vec<Vec<String>> {
        let view = self.subview(tokens);
        weak_components(&view)
    }

    pub fn subgraph_betweenness(&self, tokens: &[String]) -> BTreeMap<String, f64> {
        let view = self.subview(tokens);
        betweenness_centrality(&view)
    }

    pub fn subgraph_articulation_points(&self, tokens: &[String]) -> Vec<String> {
        let view = self.subview(tokens);
        if view.tokens.len() <= 2 {
            return Vec::new();
        }
        articulation_points(&view)
            .into_iter()
            .map(|i| view.tokens[i].clone())
            .collect()
    }

    fn view(&self) -> View {
        let all: Vec<String> = {
            let mut tokens: Vec<String> = self.index.keys().cloned().collect();
            tokens.sort();
            tokens
        };
        self.build_view(&all)
    }

    fn subview(&self, tokens: &[String]) -> View {
        let mut present: Vec<String> = tokens
            .iter()
            .filter(|t| self.index.contains_key(*t))
            .cloned()
            .collect();
        present.sort();
        present.dedup();
        self.build_view(&present)
    }

    fn build_view(&self, tokens: &[String]) -> View {
        let position: HashMap<&str, usize> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        let mut out = vec![Vec::new(); tokens.len()];
        let mut und = vec![BTreeSet::new(); tokens.len()];
        for edge in self.graph.edge_indices() {
            let Some((a, b)) = self.graph.edge_endpoints(edge) else { continue };
            let from = self.graph[a].token.as_str();
            let to = self.graph[b].token.as_str();
            let (Some(&i), Some(&j)) = (position.get(from), position.get(to)) else {
                continue;
            };
            if i == j {
                continue;
            }
            out[i].push(j);
            und[i].insert(j);
            und[j].insert(i);
        }
        for list in &mut out {
            list.sort_unstable();
            list.dedup();
        }
        View { tokens: tokens.to_vec(), out, und }
    }
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

// ── deterministic metric kernels over the index view ─────────────────────────

fn degree_centrality(view: &View, _direction: Direction, total: bool) -> BTreeMap<String, f64> {
    let n = view.tokens.len();
    let denom = (n.saturating_sub(1)).max(1) as f64;
    let mut in_deg = vec![0usize; n];
    let mut out_deg = vec![0usize; n];
    for (v, targets) in view.out.iter().enumerate() {
        out_deg[v] += targets.len();
        for &w in targets {
            in_deg[w] += 1;
        }
    }
    view.tokens
        .iter()
        .enumerate()
        .map(|(v, token)| {
            let count = if total {
                in_deg[v] + out_deg[v]
            } else if matches!(_direction, Direction::Incoming) {
                in_deg[v]
            } else {
                out_deg[v]
            };
            (token.clone(), count as f64 / denom)
        })
        .collect()
}

/// Brandes betweenness on the directed view, normalized by (n−1)(n−2).
fn betweenness_centrality(view: &View) -> BTreeMap<String, f64> {
    let n = view.tokens.len();
    let mut centrality = vec![0.0_f64; n];
    for s in 0..n {
        let mut stack = Vec::new();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0_f64; n];
        let mut dist = vec![-1_i64; n];
        sigma[s] = 1.0;
        dist[s] = 0;
        let mut queue = VecDeque::new();
        queue.push_back(s);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &view.out[v] {
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }
        let mut delta = vec![0.0_f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                if sigma[w] > 0.0 {
                    delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
                }
            }
            if w != s {
                centrality[w] += delta[w];
            }
        }
    }
    let scale = if n > 2 { 1.0 / ((n - 1) as f64 * (n - 2) as f64) } else { 1.0 };
    view.tokens
        .iter()
        .enumerate()
        .map(|(v, token)| (token.clone(), centrality[v] * scale))
        .collect()
}

/// Closeness with the Wasserman-Faust reachability correction.
fn closeness_centrality(view: &View) -> BTreeMap<String, f64> {
    let n = view.tokens.len();
    view.tokens
        .iter()
        .enumerate()
        .map(|(v, token)| {
            let dist = bfs_distances(&view.out, v);
            let reachable: Vec<i64> = dist.iter().copied().filter(|d| *d > 0).collect();
            let value = if reachable.is_empty() || n <= 1 {
                0.0
            } else {
                let r = reachable.len() as f64;
                let sum: i64 = reachable.iter().sum();
                (r / sum as f64) * (r / (n - 1) as f64)
            };
            (token.clone(), value)
        })
        .collect()
}

fn bfs_distances(adj: &[Vec<usize>], start: usize) -> Vec<i64> {
    let mut dist = vec![-1_i64; adj.len()];
    dist[start] = 0;
    let mut queue = VecDeque::new();
    queue.push_back(start);
    while let Some(v) = queue.pop_front() {
        for &w in &adj[v] {
            if dist[w] < 0 {
                dist[w] = dist[v] + 1;
                queue.push_back(w);
            }
        }
    }
    dist
}

/// Power iteration on in-neighbor contributions; empty on non-convergence.
fn eigenvector_centrality(view: &View) -> BTreeMap<String, f64> {
    let n = view.tokens.len();
    if n == 0 {
        return BTreeMap::new();
    }
    let mut x = vec![1.0 / n as f64; n];
    for _ in 0..EIGENVECTOR_MAX_ITER {
        let mut next = x.clone();
        for (v, targets) in view.out.iter().enumerate() {
            for &w in targets {
                next[w] += x[v];
            }
        }
        let norm = next.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm == 0.0 {
            return BTreeMap::new();
        }
        for value in &mut next {
            *value /= norm;
        }
        let delta: f64 = next.iter().zip(&x).map(|(a, b)| (a - b).abs()).sum();
        x = next;
        if delta < n as f64 * EIGENVECTOR_TOL {
            return view
                .tokens
                .iter()
                .enumerate()
                .map(|(v, token)| (token.clone(), x[v]))
                .collect();
        }
    }
    BTreeMap::new()
}

fn pagerank(view: &View) -> BTreeMap<String, f64> {
    let n = view.tokens.len();
    if n == 0 {
        return BTreeMap::new();
    }
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];
    for _ in 0..PAGERANK_MAX_ITER {
        let mut next = vec![(1.0 - PAGERANK_ALPHA) * uniform; n];
        let mut dangling_mass = 0.0;
        for (v, targets) in view.out.iter().enumerate() {
            if targets.is_empty() {
                dangling_mass += rank[v];
            } else {
                let share = PAGERANK_ALPHA * rank[v] / targets.len() as f64;
                for &w in targets {
                    next[w] += share;
                }
            }
        }
        let dangling_share = PAGERANK_ALPHA * dangling_mass * uniform;
        for value in &mut next {
            *value += dangling_share;
        }
        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < PAGERANK_TOL {
            break;
        }
    }
    view.tokens
        .iter()
        .enumerate()
        .map(|(v, token)| (token.clone(), rank[v]))
        .collect()
}

fn weak_component_indices(view: &View) -> Vec<Vec<usize>> {
    let n = view.tokens.len();
    let mut component = vec![usize::MAX; n];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for start in 0..n {
        if component[start] != usize::MAX {
            continue;
        }
        let id = components.len();
        let mut members = Vec::new();
        let mut queue = VecDeque::new();
        component[start] = id;
        queue.push_back(start);
        while let Some(v) = queue.pop_front() {
            members.push(v);
            for &w in &view.und[v] {
                if component[w] == usize::MAX {
                    component[w] = id;
                    queue.push_back(w);
                }
            }
        }
        members.sort_unstable();
        components.push(members);
    }
    components
}

fn weak_components(view: &View) -> Vec<Vec<String>> {
    let mut components: Vec<Vec<String>> = weak_component_indices(view)
        .into_iter()
        .map(|members| members.into_iter().map(|i| view.tokens[i].clone()).collect())
        .collect();
    components.sort();
    components
}

/// Average shortest path and diameter within one undirected component.
fn component_path_stats(view: &View, members: &[usize]) -> (f64, usize) {
    if members.len() < 2 {
        return (0.0, 0);
    }
    let member_set: BTreeSet<usize> = members.iter().copied().collect();
    let mut total = 0i64;
    let mut pairs = 0i64;
    let mut diameter = 0i64;
    for &start in members {
        let mut dist: HashMap<usize, i64> = HashMap::new();
        dist.insert(start, 0);
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(v) = queue.pop_front() {
            let d = dist[&v];
            for &w in &view.und[v] {
                if member_set.contains(&w) && !dist.contains_key(&w) {
                    dist.insert(w, d + 1);
                    queue.push_back(w);
                }
            }
        }
        for (&node, &d) in &dist {
            if node != start {
                total += d;
                pairs += 1;
                diameter = diameter.max(d);
            }
        }
    }
    if pairs == 0 {
        (0.0, 0)
    } else {
        (total as f64 / pairs as f64, diameter as usize)
    }
}

/// Greedy modularity merging with stable tie-breaking.
fn greedy_modularity_communities(view: &View) -> Vec<Vec<String>> {
    let n = view.tokens.len();
    if n == 0 {
        return Vec::new();
    }
    let m: usize = view.und.iter().map(BTreeSet::len).sum::<usize>() / 2;
    if m == 0 {
        return view.tokens.iter().map(|t| vec![t.clone()]).collect();
    }
    let m = m as f64;

    let mut communities: Vec<BTreeSet<usize>> = (0..n).map(|v| [v].into_iter().collect()).collect();
    let degree: Vec<f64> = view.und.iter().map(|s| s.len() as f64).collect();

    loop {
        let mut best: Option<(f64, usize, usize)> = None;
        for a in 0..communities.len() {
            for b in (a + 1)..communities.len() {
                let between = communities[a]
                    .iter()
                    .map(|&v| view.und[v].intersection(&communities[b]).count())
                    .sum::<usize>() as f64;
                if between == 0.0 {
                    continue;
                }
                let deg_a: f64 = communities[a].iter().map(|&v| degree[v]).sum();
                let deg_b: f64 = communities[b].iter().map(|&v| degree[v]).sum();
                let gain = between / m - 2.0 * (deg_a / (2.0 * m)) * (deg_b / (2.0 * m));
                let candidate = (gain, a, b);
                best = match best {
                    None => Some(candidate),
                    Some(current) if candidate.0 > current.0 + 1e-12 => Some(candidate),
                    Some(current) => Some(current),
                };
            }
        }
        match best {
            Some((gain, a, b)) if gain > 1e-12 => {
                let merged: BTreeSet<usize> =
                    communities[a].union(&communities[b]).copied().collect();
                communities.remove(b);
                communities.remove(a);
                communities.push(merged);
                communities.sort_by_key(|c| c.iter().next().copied().unwrap_or(usize::MAX));
            }
            _ => break,
        }
    }

    let mut result: Vec<Vec<String>> = communities
        .into_iter()
        .map(|community| {
            community
                .into_iter()
                .map(|v| view.tokens[v].clone())
                .collect::<Vec<_>>()
        })
        .collect();
    result.sort();
    result
}

/// Articulation points of the undirected view (iterative lowlink DFS).
fn articulation_points(view: &View) -> Vec<usize> {
    let n = view.tokens.len();
    let mut visited = vec![false; n];
    let mut disc = vec![0usize; n];
    let mut low = vec![0usize; n];
    let mut parent: Vec<Option<usize>> = vec![None; n];
    let mut is_articulation = vec![false; n];
    let mut timer = 0usize;

    for root in 0..n {
        if visited[root] {
            continue;
        }
        // Iterative DFS frame: (node, neighbor cursor).
        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        visited[root] = true;
        disc[root] = timer;
        low[root] = timer;
        timer += 1;
        let mut root_children = 0usize;
        stack.push((root, view.und[root].iter().copied().collect(), 0));

        while let Some((v, neighbors, cursor)) = stack.pop() {
            if cursor < neighbors.len() {
                let w = neighbors[cursor];
                stack.push((v, neighbors, cursor + 1));
                if !visited[w] {
                    visited[w] = true;
                    parent[w] = Some(v);
                    disc[w] = timer;
                    low[w] = timer;
                    timer += 1;
                    if v == root {
                        root_children += 1;
                    }
                    stack.push((w, view.und[w].iter().copied().collect(), 0));
                } else if parent[v] != Some(w) {
                    low[v] = low[v].min(disc[w]);
                }
            } else if let Some(p) = parent[v] {
                low[p] = low[p].min(low[v]);
                if parent[p].is_some() && low[v] >= disc[p] {
                    is_articulation[p] = true;
                }
            }
        }
        if root_children > 1 {
            is_articulation[root] = true;
        }
    }

    (0..n).filter(|&v| is_articulation[v]).collect()
}
