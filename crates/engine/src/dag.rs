//! DAG validation and execution planning. Run this before executing a
//! process.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the process.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. Edges leaving a branch node must name a declared branch, and every
//!    declared branch must have at least one target.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! On success the graph is turned into an [`ExecutionPlan`]: an arena of
//! node indices with adjacency lists, a topological order, and for every
//! branch node the region of nodes each of its branches owns.

use std::collections::{HashMap, HashSet, VecDeque};

use nodes::NodeConfig;

use crate::models::Process;
use crate::EngineError;

/// Identifies one branch of one branch node: `(branch node index, branch
/// position)`.
pub type RegionId = (usize, usize);

/// An edge with both endpoints resolved to node indices.
#[derive(Debug, Clone)]
pub struct PlannedEdge {
    pub source: usize,
    pub target: usize,
    pub port: Option<String>,
}

/// Nodes owned by one branch of a branch node.
///
/// A node belongs to the region when it is reachable from the branch's entry
/// edges, not reachable from any sibling branch, and every predecessor is
/// either the branch node or another member. Nodes that join several
/// branches therefore stay outside and run after the branch node settles.
#[derive(Debug, Clone)]
pub struct BranchRegion {
    pub branch_id: String,
    /// Members in topological order, nested regions included.
    pub members: Vec<usize>,
}

/// A validated process graph, ready for the orchestrator.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    ids: Vec<String>,
    edges: Vec<PlannedEdge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    order: Vec<usize>,
    regions: HashMap<usize, Vec<BranchRegion>>,
    owner: Vec<Option<RegionId>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|n| n == id)
    }

    /// Node ids in topological execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&n| self.ids[n].as_str()).collect()
    }

    pub fn edge(&self, edge: usize) -> &PlannedEdge {
        &self.edges[edge]
    }

    /// Indices of edges entering `node`.
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    /// Indices of edges leaving `node`.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    /// Regions of a branch node, in declared branch order.
    pub fn regions(&self, branch_node: usize) -> &[BranchRegion] {
        self.regions
            .get(&branch_node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The innermost branch region that owns `node`, if any.
    pub fn owner(&self, node: usize) -> Option<RegionId> {
        self.owner[node]
    }

    /// Nodes driven directly by a scope, in topological order. `None` is the
    /// top level; nested regions are excluded.
    pub fn scope(&self, region: Option<RegionId>) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|&n| self.owner[n] == region)
            .collect()
    }
}

/// Validate the process graph and build its execution plan.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::UnknownBranchPort`] / [`EngineError::DanglingBranch`] for
///   malformed branch wiring.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(process: &Process) -> Result<ExecutionPlan, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in process.nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    let mut edges = Vec::with_capacity(process.edges.len());
    for (i, edge) in process.edges.iter().enumerate() {
        let source = *index.get(edge.source.as_str()).ok_or_else(|| {
            EngineError::UnknownNodeReference {
                edge: i,
                node_id: edge.source.clone(),
                side: "source",
            }
        })?;
        let target = *index.get(edge.target.as_str()).ok_or_else(|| {
            EngineError::UnknownNodeReference {
                edge: i,
                node_id: edge.target.clone(),
                side: "target",
            }
        })?;
        edges.push(PlannedEdge {
            source,
            target,
            port: edge.source_port.clone(),
        });
    }

    let n = process.nodes.len();
    let mut incoming = vec![Vec::new(); n];
    let mut outgoing = vec![Vec::new(); n];
    for (i, edge) in edges.iter().enumerate() {
        outgoing[edge.source].push(i);
        incoming[edge.target].push(i);
    }

    // -----------------------------------------------------------------------
    // 3. Branch wiring
    // -----------------------------------------------------------------------
    for (b, node) in process.nodes.iter().enumerate() {
        let NodeConfig::Branch(cfg) = &node.config else {
            continue;
        };
        for &e in &outgoing[b] {
            if let Some(port) = &edges[e].port {
                if !cfg.branches.iter().any(|s| &s.id == port) {
                    return Err(EngineError::UnknownBranchPort {
                        edge: e,
                        node_id: node.id.clone(),
                        port: port.clone(),
                    });
                }
            }
        }
        for spec in &cfg.branches {
            let wired = outgoing[b]
                .iter()
                .any(|&e| edges[e].port.as_deref() == Some(spec.id.as_str()));
            if !wired {
                return Err(EngineError::DanglingBranch {
                    node_id: node.id.clone(),
                    branch: spec.id.clone(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // Seeded and drained in declaration order so the plan is deterministic.
    let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &e in &outgoing[node] {
            let target = edges[e].target;
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                queue.push_back(target);
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if order.len() != n {
        let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or_default();
        return Err(EngineError::CycleDetected(process.nodes[stuck].id.clone()));
    }

    // -----------------------------------------------------------------------
    // 5. Branch regions
    // -----------------------------------------------------------------------
    let mut position = vec![0; n];
    for (pos, &node) in order.iter().enumerate() {
        position[node] = pos;
    }

    let mut regions: HashMap<usize, Vec<BranchRegion>> = HashMap::new();
    for (b, node) in process.nodes.iter().enumerate() {
        let NodeConfig::Branch(cfg) = &node.config else {
            continue;
        };
        let reach: Vec<HashSet<usize>> = cfg
            .branches
            .iter()
            .map(|spec| {
                let entries = outgoing[b]
                    .iter()
                    .filter(|&&e| edges[e].port.as_deref() == Some(spec.id.as_str()))
                    .map(|&e| edges[e].target);
                reachable(entries, &edges, &outgoing)
            })
            .collect();

        let planned = cfg
            .branches
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut members: HashSet<usize> = reach[i]
                    .iter()
                    .copied()
                    .filter(|m| !reach.iter().enumerate().any(|(j, r)| j != i && r.contains(m)))
                    .collect();
                // Drop nodes fed from outside the region until nothing changes.
                loop {
                    let outsiders: Vec<usize> = members
                        .iter()
                        .copied()
                        .filter(|&m| {
                            incoming[m].iter().any(|&e| {
                                let source = edges[e].source;
                                source != b && !members.contains(&source)
                            })
                        })
                        .collect();
                    if outsiders.is_empty() {
                        break;
                    }
                    for m in outsiders {
                        members.remove(&m);
                    }
                }
                let mut members: Vec<usize> = members.into_iter().collect();
                members.sort_by_key(|&m| position[m]);
                BranchRegion {
                    branch_id: spec.id.clone(),
                    members,
                }
            })
            .collect();
        regions.insert(b, planned);
    }

    // Innermost region wins: nested regions are strict subsets of the region
    // holding their branch node.
    let mut owner: Vec<Option<RegionId>> = vec![None; n];
    let mut owner_size = vec![usize::MAX; n];
    for (&b, branch_regions) in &regions {
        for (i, region) in branch_regions.iter().enumerate() {
            for &m in &region.members {
                if region.members.len() < owner_size[m] {
                    owner[m] = Some((b, i));
                    owner_size[m] = region.members.len();
                }
            }
        }
    }

    Ok(ExecutionPlan {
        ids: process.nodes.iter().map(|n| n.id.clone()).collect(),
        edges,
        incoming,
        outgoing,
        order,
        regions,
        owner,
    })
}

fn reachable(
    entries: impl Iterator<Item = usize>,
    edges: &[PlannedEdge],
    outgoing: &[Vec<usize>],
) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = entries.collect();
    while let Some(node) = stack.pop() {
        if seen.insert(node) {
            stack.extend(outgoing[node].iter().map(|&e| edges[e].target));
        }
    }
    seen
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, NodeDefinition};
    use serde_json::json;

    fn make_node(id: &str) -> NodeDefinition {
        NodeDefinition::new(
            id,
            NodeConfig::from_parts("state_marker", json!({ "state": id })).unwrap(),
        )
    }

    fn make_branch(id: &str, strategy: &str, branches: &[&str]) -> NodeDefinition {
        let branches: Vec<_> = branches.iter().map(|b| json!({ "id": b })).collect();
        NodeDefinition::new(
            id,
            NodeConfig::from_parts("branch", json!({ "strategy": strategy, "branches": branches }))
                .unwrap(),
        )
    }

    fn make_process(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Process {
        Process::new("test", nodes, edges)
    }

    fn ids(plan: &ExecutionPlan, members: &[usize]) -> Vec<String> {
        members.iter().map(|&m| plan.id(m).to_string()).collect()
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let process = make_process(
            vec![make_node("a"), make_node("b"), make_node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        );

        let plan = validate_dag(&process).expect("should be valid");
        assert_eq!(plan.order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let process = make_process(
            vec![make_node("a"), make_node("b"), make_node("c"), make_node("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );

        let plan = validate_dag(&process).expect("should be valid");
        assert_eq!(plan.order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let process = make_process(vec![make_node("a"), make_node("a")], vec![]);
        assert!(matches!(
            validate_dag(&process),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let process = make_process(vec![make_node("a")], vec![Edge::new("a", "ghost")]);
        assert!(matches!(
            validate_dag(&process),
            Err(EngineError::UnknownNodeReference { node_id, side: "target", .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // A → B → C → A
        let process = make_process(
            vec![make_node("a"), make_node("b"), make_node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "a")],
        );
        assert!(matches!(validate_dag(&process), Err(EngineError::CycleDetected(_))));
    }

    #[test]
    fn branch_without_target_is_dangling() {
        let process = make_process(
            vec![make_branch("b", "paralela", &["x", "y"]), make_node("x1")],
            vec![Edge::new("b", "x1").via("x")],
        );
        assert!(matches!(
            validate_dag(&process),
            Err(EngineError::DanglingBranch { branch, .. }) if branch == "y"
        ));
    }

    #[test]
    fn branch_edge_through_undeclared_port_is_rejected() {
        let process = make_process(
            vec![make_branch("b", "race", &["x"]), make_node("x1"), make_node("z1")],
            vec![Edge::new("b", "x1").via("x"), Edge::new("b", "z1").via("z")],
        );
        assert!(matches!(
            validate_dag(&process),
            Err(EngineError::UnknownBranchPort { port, .. }) if port == "z"
        ));
    }

    #[test]
    fn regions_stop_at_the_join() {
        //      ┌─x→ x1 → x2 ─┐
        // b ───┤              ├→ join
        //      └─y→ y1 ───────┘
        let process = make_process(
            vec![
                make_branch("b", "paralela", &["x", "y"]),
                make_node("x1"),
                make_node("x2"),
                make_node("y1"),
                make_node("join"),
            ],
            vec![
                Edge::new("b", "x1").via("x"),
                Edge::new("x1", "x2"),
                Edge::new("b", "y1").via("y"),
                Edge::new("x2", "join"),
                Edge::new("y1", "join"),
            ],
        );
        let plan = validate_dag(&process).unwrap();
        let regions = plan.regions(0);
        assert_eq!(ids(&plan, &regions[0].members), vec!["x1", "x2"]);
        assert_eq!(ids(&plan, &regions[1].members), vec!["y1"]);
        assert_eq!(ids(&plan, &plan.scope(None)), vec!["b", "join"]);
    }

    #[test]
    fn nested_branch_nodes_belong_to_the_innermost_region() {
        let process = make_process(
            vec![
                make_branch("outer", "secuencial", &["a"]),
                make_branch("inner", "race", &["p", "q"]),
                make_node("p1"),
                make_node("q1"),
            ],
            vec![
                Edge::new("outer", "inner").via("a"),
                Edge::new("inner", "p1").via("p"),
                Edge::new("inner", "q1").via("q"),
            ],
        );
        let plan = validate_dag(&process).unwrap();
        assert_eq!(plan.owner(1), Some((0, 0)));
        assert_eq!(plan.owner(2), Some((1, 0)));
        assert_eq!(ids(&plan, &plan.scope(Some((0, 0)))), vec!["inner"]);
        assert_eq!(plan.regions(0)[0].members.len(), 3);
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let process = make_process(vec![make_node("solo")], vec![]);
        let plan = validate_dag(&process).expect("single node should be valid");
        assert_eq!(plan.order(), vec!["solo"]);
    }
}
