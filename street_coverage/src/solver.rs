//! Rural Postman solver: shortest closed tour traversing every required
//! (undriven, driveable) edge, using the rest of the street network for
//! deadheading.
//!
//! The graph comes from the freshly fetched way set: junctions are points
//! shared by at least two ways plus way endpoints, edges carry projected
//! lengths. Odd-degree nodes of the required subgraph are paired via
//! shortest paths, the matching paths are added as deadhead edges, and an
//! Eulerian circuit over the augmented multigraph is the tour.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::geom::UtmProjector;
use crate::{CoverageError, OptimalRoute, RawWay, Segment};

/// Odd sets up to this size get an exact minimum matching by subset DP;
/// larger sets fall back to greedy nearest-first.
const EXACT_MATCHING_LIMIT: usize = 12;

/// Coordinates are quantized to ~1 cm when detecting shared junctions.
const NODE_QUANTUM: f64 = 1e7;

#[derive(Clone, Debug)]
struct GraphNode {
    lonlat: [f64; 2],
    xy: (f64, f64),
}

#[derive(Clone, Debug)]
struct GraphEdge {
    a: usize,
    b: usize,
    length_m: f64,
    /// Synthetic bridge between components; never required, never covered.
    connector: bool,
}

pub struct StreetGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    node_tree: RTree<GeomWithData<[f64; 2], usize>>,
    proj: UtmProjector,
}

impl StreetGraph {
    /// Build the routable graph from drivable ways and bridge any
    /// disconnected components with synthetic connector edges.
    pub fn build(ways: &[RawWay], proj: UtmProjector) -> Result<Self, CoverageError> {
        let mut node_of_point: HashMap<(i64, i64), usize> = HashMap::new();
        let mut point_count: HashMap<(i64, i64), u32> = HashMap::new();

        for way in ways {
            for p in &way.points {
                *point_count.entry(quantize(*p)).or_insert(0) += 1;
            }
        }

        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges: Vec<GraphEdge> = Vec::new();

        let mut intern = |p: [f64; 2],
                          nodes: &mut Vec<GraphNode>,
                          node_of_point: &mut HashMap<(i64, i64), usize>|
         -> usize {
            let key = quantize(p);
            *node_of_point.entry(key).or_insert_with(|| {
                let idx = nodes.len();
                nodes.push(GraphNode {
                    lonlat: p,
                    xy: proj.project(p[0], p[1]),
                });
                idx
            })
        };

        for way in ways {
            if way.points.len() < 2 {
                continue;
            }
            let mut sub: Vec<[f64; 2]> = vec![way.points[0]];
            let mut from = intern(way.points[0], &mut nodes, &mut node_of_point);
            for (i, p) in way.points.iter().enumerate().skip(1) {
                sub.push(*p);
                let is_junction = point_count[&quantize(*p)] >= 2;
                if i == way.points.len() - 1 || is_junction {
                    let to = intern(*p, &mut nodes, &mut node_of_point);
                    // Loops back to the same junction aren't routable edges.
                    if to != from {
                        let length_m = polyline_length(&sub, &proj);
                        if length_m > 0.0 {
                            edges.push(GraphEdge {
                                a: from,
                                b: to,
                                length_m,
                                connector: false,
                            });
                        }
                    }
                    from = to;
                    sub = vec![*p];
                }
            }
        }

        if nodes.is_empty() || edges.is_empty() {
            return Err(CoverageError::Validation(
                "street network has no routable edges".to_string(),
            ));
        }

        let node_tree = RTree::bulk_load(
            nodes
                .iter()
                .enumerate()
                .map(|(i, n)| GeomWithData::new([n.xy.0, n.xy.1], i))
                .collect(),
        );

        let mut graph = Self {
            nodes,
            edges,
            node_tree,
            proj,
        };
        graph.bridge_components()?;
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nearest graph node to a WGS84 coordinate, with an optional cap on
    /// the snap distance in meters.
    pub fn nearest_node(&self, lonlat: [f64; 2], max_distance_m: Option<f64>) -> Option<usize> {
        let (x, y) = self.proj.project(lonlat[0], lonlat[1]);
        let hit = self.node_tree.nearest_neighbor(&[x, y])?;
        if let Some(cap) = max_distance_m {
            let [hx, hy] = *hit.geom();
            let d = ((hx - x).powi(2) + (hy - y).powi(2)).sqrt();
            if d > cap {
                return None;
            }
        }
        Some(hit.data)
    }

    /// Direct edge between two nodes, shortest one if parallel edges exist.
    fn direct_edge(&self, u: usize, v: usize) -> Option<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.connector && ((e.a == u && e.b == v) || (e.a == v && e.b == u)))
            .min_by(|(_, x), (_, y)| x.length_m.total_cmp(&y.length_m))
            .map(|(i, _)| i)
    }

    /// Connect every non-primary component to the largest one through its
    /// closest node pair.
    fn bridge_components(&mut self) -> Result<(), CoverageError> {
        let components = self.components();
        if components.len() <= 1 {
            return Ok(());
        }
        warn!(
            "street graph has {} components, bridging into the largest",
            components.len()
        );
        let primary = components
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.len())
            .map(|(i, _)| i)
            .ok_or(CoverageError::Disconnected)?;

        let primary_tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
            components[primary]
                .iter()
                .map(|&n| GeomWithData::new([self.nodes[n].xy.0, self.nodes[n].xy.1], n))
                .collect(),
        );

        for (ci, component) in components.iter().enumerate() {
            if ci == primary {
                continue;
            }
            let mut best: Option<(usize, usize, f64)> = None;
            for &n in component {
                let p = [self.nodes[n].xy.0, self.nodes[n].xy.1];
                if let Some(hit) = primary_tree.nearest_neighbor(&p) {
                    let [hx, hy] = *hit.geom();
                    let d = ((hx - p[0]).powi(2) + (hy - p[1]).powi(2)).sqrt();
                    if best.map(|(_, _, bd)| d < bd).unwrap_or(true) {
                        best = Some((n, hit.data, d));
                    }
                }
            }
            let (from, to, d) = best.ok_or(CoverageError::Disconnected)?;
            self.edges.push(GraphEdge {
                a: from,
                b: to,
                length_m: d.max(1.0),
                connector: true,
            });
        }
        Ok(())
    }

    fn components(&self) -> Vec<Vec<usize>> {
        let mut parent: Vec<usize> = (0..self.nodes.len()).collect();
        fn find(parent: &mut Vec<usize>, x: usize) -> usize {
            let mut root = x;
            while parent[root] != root {
                root = parent[root];
            }
            let mut cur = x;
            while parent[cur] != root {
                let next = parent[cur];
                parent[cur] = root;
                cur = next;
            }
            root
        }
        for e in &self.edges {
            let ra = find(&mut parent, e.a);
            let rb = find(&mut parent, e.b);
            if ra != rb {
                parent[ra] = rb;
            }
        }
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for n in 0..self.nodes.len() {
            let root = find(&mut parent, n);
            groups.entry(root).or_default().push(n);
        }
        groups.into_values().collect()
    }

    fn petgraph(&self) -> UnGraph<(), f64> {
        let mut g = UnGraph::<(), f64>::with_capacity(self.nodes.len(), self.edges.len());
        for _ in 0..self.nodes.len() {
            g.add_node(());
        }
        for e in &self.edges {
            g.add_edge(NodeIndex::new(e.a), NodeIndex::new(e.b), e.length_m);
        }
        g
    }

    /// Shortest path between two nodes over the full graph (deadheads and
    /// connectors allowed). Returns (length, node path).
    fn shortest_path(
        &self,
        g: &UnGraph<(), f64>,
        from: usize,
        to: usize,
    ) -> Option<(f64, Vec<usize>)> {
        let goal_xy = self.nodes[to].xy;
        let (cost, path) = petgraph::algo::astar(
            g,
            NodeIndex::new(from),
            |n| n == NodeIndex::new(to),
            |e| *e.weight(),
            |n| {
                let xy = self.nodes[n.index()].xy;
                ((xy.0 - goal_xy.0).powi(2) + (xy.1 - goal_xy.1).powi(2)).sqrt()
            },
        )?;
        Some((cost, path.into_iter().map(|n| n.index()).collect()))
    }
}

fn quantize(p: [f64; 2]) -> (i64, i64) {
    ((p[0] * NODE_QUANTUM).round() as i64, (p[1] * NODE_QUANTUM).round() as i64)
}

fn polyline_length(points: &[[f64; 2]], proj: &UtmProjector) -> f64 {
    let projected: Vec<(f64, f64)> = points.iter().map(|p| proj.project(p[0], p[1])).collect();
    projected
        .windows(2)
        .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
        .sum()
}

#[derive(Clone, Debug)]
pub struct RppSolution {
    pub node_circuit: Vec<usize>,
    pub required_distance_m: f64,
    pub deadhead_distance_m: f64,
    pub required_edge_count: usize,
}

/// Solve the Rural Postman Problem over `graph` for the given required node
/// pairs. Pairs with no direct edge in the graph are dropped (their segment
/// endpoints snapped to non-adjacent junctions).
pub fn solve_rural_postman(
    graph: &StreetGraph,
    required_pairs: &BTreeSet<(usize, usize)>,
    start: Option<usize>,
) -> Result<RppSolution, CoverageError> {
    // Edge ids for every required pair that maps to a real edge.
    let mut required_edges: Vec<usize> = Vec::new();
    for &(u, v) in required_pairs {
        if let Some(edge) = graph.direct_edge(u, v) {
            required_edges.push(edge);
        }
    }
    if required_edges.is_empty() {
        return Err(CoverageError::MatchingFailed);
    }

    let required_distance_m: f64 = required_edges
        .iter()
        .map(|&e| graph.edges[e].length_m)
        .sum();

    // Degrees in the required subgraph.
    let mut degree: HashMap<usize, usize> = HashMap::new();
    for &e in &required_edges {
        *degree.entry(graph.edges[e].a).or_insert(0) += 1;
        *degree.entry(graph.edges[e].b).or_insert(0) += 1;
    }
    let odd_nodes: Vec<usize> = degree
        .iter()
        .filter(|(_, &d)| d % 2 == 1)
        .map(|(&n, _)| n)
        .collect();
    info!(
        "rural postman: {} required edges, {} odd-degree nodes",
        required_edges.len(),
        odd_nodes.len()
    );

    // Multigraph under construction: (u, v, length).
    let mut multigraph: Vec<(usize, usize, f64)> = required_edges
        .iter()
        .map(|&e| (graph.edges[e].a, graph.edges[e].b, graph.edges[e].length_m))
        .collect();

    let mut deadhead_distance_m = 0.0;
    if !odd_nodes.is_empty() {
        let pg = graph.petgraph();
        let k = odd_nodes.len();
        let mut dist = vec![vec![f64::INFINITY; k]; k];
        let mut paths: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for i in 0..k {
            for j in (i + 1)..k {
                if let Some((d, path)) = graph.shortest_path(&pg, odd_nodes[i], odd_nodes[j]) {
                    dist[i][j] = d;
                    dist[j][i] = d;
                    paths.insert((i, j), path);
                }
            }
        }

        let pairs = if k <= EXACT_MATCHING_LIMIT {
            exact_matching(&dist)
        } else {
            warn!("odd set of {k} nodes, falling back to greedy matching");
            greedy_matching(&dist)
        };
        let Some(pairs) = pairs else {
            return Err(CoverageError::MatchingFailed);
        };

        for (i, j) in pairs {
            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            let path = &paths[&(lo, hi)];
            deadhead_distance_m += dist[lo][hi];
            for w in path.windows(2) {
                let edge = graph
                    .direct_edge(w[0], w[1])
                    .map(|e| graph.edges[e].length_m)
                    .unwrap_or_else(|| {
                        // Path crossed a connector edge.
                        let a = graph.nodes[w[0]].xy;
                        let b = graph.nodes[w[1]].xy;
                        ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
                    });
                multigraph.push((w[0], w[1], edge));
            }
        }
    }

    let node_circuit = eulerian_circuit(&multigraph, start)?;

    Ok(RppSolution {
        node_circuit,
        required_distance_m,
        deadhead_distance_m,
        required_edge_count: required_edges.len(),
    })
}

/// Exact minimum-weight perfect matching by DP over node subsets.
fn exact_matching(dist: &[Vec<f64>]) -> Option<Vec<(usize, usize)>> {
    let k = dist.len();
    if k % 2 != 0 {
        return None;
    }
    if k == 0 {
        return Some(Vec::new());
    }
    let full = 1usize << k;
    let mut best = vec![f64::INFINITY; full];
    let mut choice: Vec<Option<(usize, usize)>> = vec![None; full];
    best[0] = 0.0;
    for mask in 0..full {
        if !best[mask].is_finite() {
            continue;
        }
        // Lowest unmatched node pairs with every other unmatched node.
        let Some(i) = (0..k).find(|i| mask & (1 << i) == 0) else {
            continue;
        };
        for j in (i + 1)..k {
            if mask & (1 << j) != 0 || !dist[i][j].is_finite() {
                continue;
            }
            let next = mask | (1 << i) | (1 << j);
            let cost = best[mask] + dist[i][j];
            if cost < best[next] {
                best[next] = cost;
                choice[next] = Some((i, j));
            }
        }
    }
    if !best[full - 1].is_finite() {
        return None;
    }
    let mut pairs = Vec::with_capacity(k / 2);
    let mut mask = full - 1;
    while mask != 0 {
        let (i, j) = choice[mask]?;
        pairs.push((i, j));
        mask &= !((1 << i) | (1 << j));
    }
    Some(pairs)
}

/// Greedy nearest-first pairing, used when the odd set is too large for the
/// exact search.
fn greedy_matching(dist: &[Vec<f64>]) -> Option<Vec<(usize, usize)>> {
    let k = dist.len();
    let mut remaining: BTreeSet<usize> = (0..k).collect();
    let mut pairs = Vec::with_capacity(k / 2);
    while remaining.len() >= 2 {
        let u = *remaining.iter().next().unwrap();
        remaining.remove(&u);
        let v = remaining
            .iter()
            .copied()
            .filter(|&v| dist[u][v].is_finite())
            .min_by(|&a, &b| dist[u][a].total_cmp(&dist[u][b]))?;
        remaining.remove(&v);
        pairs.push((u, v));
    }
    Some(pairs)
}

/// Hierholzer's algorithm over an explicit multigraph edge list.
fn eulerian_circuit(
    multigraph: &[(usize, usize, f64)],
    start: Option<usize>,
) -> Result<Vec<usize>, CoverageError> {
    if multigraph.is_empty() {
        return Err(CoverageError::MatchingFailed);
    }

    // Keep the circuit within one connected piece of the multigraph; the
    // required subgraph itself can be split even when the street graph is
    // whole, in which case the largest piece wins.
    let mut adjacency: HashMap<usize, Vec<(usize, usize)>> = HashMap::new();
    for (i, &(u, v, _)) in multigraph.iter().enumerate() {
        adjacency.entry(u).or_default().push((i, v));
        adjacency.entry(v).or_default().push((i, u));
    }

    let component = largest_component(&adjacency);
    if component.len() < adjacency.len() {
        warn!(
            "required subgraph is split; touring the largest piece ({} of {} junctions)",
            component.len(),
            adjacency.len()
        );
    }

    let start_node = match start {
        Some(s) if component.contains(&s) => s,
        _ => *component.iter().next().ok_or(CoverageError::MatchingFailed)?,
    };

    let mut used = vec![false; multigraph.len()];
    let mut stack = vec![start_node];
    let mut cursor: HashMap<usize, usize> = HashMap::new();
    let mut circuit = Vec::new();

    while let Some(&node) = stack.last() {
        let edges = adjacency.get(&node);
        let pos = cursor.entry(node).or_insert(0);
        let mut advanced = false;
        if let Some(edges) = edges {
            while *pos < edges.len() {
                let (edge_id, to) = edges[*pos];
                *pos += 1;
                if !used[edge_id] && component.contains(&to) {
                    used[edge_id] = true;
                    stack.push(to);
                    advanced = true;
                    break;
                }
            }
        }
        if !advanced {
            circuit.push(node);
            stack.pop();
        }
    }

    circuit.reverse();
    if circuit.len() < 2 {
        return Err(CoverageError::MatchingFailed);
    }
    Ok(circuit)
}

fn largest_component(adjacency: &HashMap<usize, Vec<(usize, usize)>>) -> BTreeSet<usize> {
    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut best: BTreeSet<usize> = BTreeSet::new();
    for &root in adjacency.keys() {
        if seen.contains(&root) {
            continue;
        }
        let mut component = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if !component.insert(n) {
                continue;
            }
            for &(_, to) in &adjacency[&n] {
                if !component.contains(&to) {
                    stack.push(to);
                }
            }
        }
        seen.extend(component.iter().copied());
        if component.len() > best.len() {
            best = component;
        }
    }
    best
}

/// Full route generation: map undriven segments onto the fresh street
/// graph, solve, and convert the circuit back to WGS84 coordinates.
pub fn generate_route(
    ways: &[RawWay],
    undriven: &[&Segment],
    start: Option<[f64; 2]>,
    segment_target_length_m: f64,
) -> Result<OptimalRoute, CoverageError> {
    if undriven.is_empty() {
        return Err(CoverageError::Validation(
            "no undriven segments to route".to_string(),
        ));
    }
    let anchor = ways
        .iter()
        .flat_map(|w| w.points.first())
        .next()
        .ok_or_else(|| CoverageError::Validation("empty street network".to_string()))?;
    let proj = UtmProjector::for_centroid(anchor[0], anchor[1]);
    let graph = StreetGraph::build(ways, proj)?;

    // Snap each undriven segment's endpoints onto graph junctions.
    let snap_radius_m = segment_target_length_m * 2.0;
    let mut required: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut skipped = 0usize;
    for seg in undriven {
        let coords: Vec<[f64; 2]> = seg.geometry.coords().map(|c| [c.x, c.y]).collect();
        let (Some(first), Some(last)) = (coords.first(), coords.last()) else {
            skipped += 1;
            continue;
        };
        let (Some(a), Some(b)) = (
            graph.nearest_node(*first, Some(snap_radius_m)),
            graph.nearest_node(*last, Some(snap_radius_m)),
        ) else {
            skipped += 1;
            continue;
        };
        if a == b {
            skipped += 1;
            continue;
        }
        required.insert((a.min(b), a.max(b)));
    }
    if required.is_empty() {
        return Err(CoverageError::Validation(
            "could not map any undriven segments onto the street network".to_string(),
        ));
    }
    if skipped > 0 {
        debug!("{skipped} undriven segments could not be mapped to the graph");
    }

    let start_node = start.and_then(|p| graph.nearest_node(p, None));
    let solution = solve_rural_postman(&graph, &required, start_node)?;

    let coordinates: Vec<[f64; 2]> = solution
        .node_circuit
        .iter()
        .map(|&n| graph.nodes[n].lonlat)
        .collect();
    let total = solution.required_distance_m + solution.deadhead_distance_m;
    let start_coord = coordinates[0];

    Ok(OptimalRoute {
        coordinates,
        total_distance_m: total,
        required_distance_m: solution.required_distance_m,
        deadhead_distance_m: solution.deadhead_distance_m,
        deadhead_pct: if total > 0.0 {
            solution.deadhead_distance_m / total * 100.0
        } else {
            0.0
        },
        segment_count: solution.required_edge_count,
        generated_at: Utc::now(),
        start: start_coord,
    })
}
