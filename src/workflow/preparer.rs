/// Node dependency preparer
///
/// Turns a canvas graph into per-node execution plans (adjacency, substituted
/// queries, connect filters) and resolves the start set. Also provides the
/// ordering helper used for detail responses.

use crate::canvas::types::{CanvasGraph, ConnectFilter, WorkflowVariable};
use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::types::{NodeExecutionPlan, PreparedNodes, WorkflowNodeExecution};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Prepares node executions for a new workflow run
pub trait NodePreparer: Send + Sync {
    fn prepare(
        &self,
        graph: &CanvasGraph,
        variables: &[WorkflowVariable],
        explicit_start_nodes: Option<&[String]>,
        is_fork: bool,
    ) -> WorkflowResult<PreparedNodes>;
}

/// Default preparer backed by a petgraph DAG of the canvas
#[derive(Debug, Default, Clone)]
pub struct CanvasNodePreparer;

/// petgraph view of a canvas graph
struct CanvasDag {
    graph: DiGraph<String, ()>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl CanvasDag {
    fn build(canvas: &CanvasGraph) -> WorkflowResult<Self> {
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &canvas.nodes {
            if node_id_to_index.contains_key(&node.id) {
                return Err(WorkflowError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for edge in &canvas.edges {
            let source = node_id_to_index.get(&edge.source).ok_or_else(|| {
                WorkflowError::InvalidGraph(format!("edge source '{}' not found", edge.source))
            })?;
            let target = node_id_to_index.get(&edge.target).ok_or_else(|| {
                WorkflowError::InvalidGraph(format!("edge target '{}' not found", edge.target))
            })?;
            graph.update_edge(*source, *target, ());
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(WorkflowError::InvalidGraph(format!(
                "graph contains a cycle through '{}'",
                graph[cycle.node_id()]
            )));
        }

        Ok(Self { graph, node_id_to_index })
    }

    /// Start nodes plus everything downstream of them
    fn reachable_from(&self, start_nodes: &[String]) -> HashSet<String> {
        let mut reachable = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = start_nodes
            .iter()
            .filter_map(|id| self.node_id_to_index.get(id).copied())
            .collect();

        while let Some(current) = queue.pop_front() {
            if !reachable.insert(self.graph[current].clone()) {
                continue;
            }
            for child in self.graph.neighbors_directed(current, Direction::Outgoing) {
                queue.push_back(child);
            }
        }

        reachable
    }

    fn neighbors_sorted(&self, node_id: &str, direction: Direction) -> Vec<String> {
        let Some(index) = self.node_id_to_index.get(node_id) else {
            return Vec::new();
        };
        let ids: BTreeSet<String> = self
            .graph
            .neighbors_directed(*index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.into_iter().collect()
    }
}

/// Replace each `{{name}}` with the rendered value of variable `name`
///
/// Unknown placeholders and unterminated braces are kept as written.
pub fn substitute_variables(template: &str, variables: &[WorkflowVariable]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            output.push_str(&rest[open..]);
            return output;
        };

        let name = after_open[..close].trim();
        match variables.iter().find(|v| v.name == name) {
            Some(variable) => output.push_str(&variable.rendered()),
            None => output.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }

    output.push_str(rest);
    output
}

impl NodePreparer for CanvasNodePreparer {
    fn prepare(
        &self,
        graph: &CanvasGraph,
        variables: &[WorkflowVariable],
        explicit_start_nodes: Option<&[String]>,
        is_fork: bool,
    ) -> WorkflowResult<PreparedNodes> {
        let dag = CanvasDag::build(graph)?;
        tracing::debug!(
            "📊 Preparing {} nodes and {} edges (fork: {})",
            graph.nodes.len(),
            dag.graph.edge_count(),
            is_fork
        );

        let by_id: HashMap<&str, _> = graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let explicit: Vec<String> = explicit_start_nodes
            .unwrap_or_default()
            .iter()
            .filter(|id| dag.node_id_to_index.contains_key(id.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if explicit.is_empty() && explicit_start_nodes.is_some() {
            tracing::debug!("🔎 No explicit start node is on the canvas, starting from roots");
        }

        // An empty or fully unresolved explicit set runs from the roots
        let start_nodes: Vec<String> = if explicit.is_empty() {
            graph
                .nodes
                .iter()
                .filter(|node| dag.neighbors_sorted(&node.id, Direction::Incoming).is_empty())
                .map(|node| node.id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            explicit
        };
        let in_scope = dag.reachable_from(&start_nodes);

        let node_executions: Vec<NodeExecutionPlan> = graph
            .nodes
            .iter()
            .map(|node| {
                let parent_node_ids = dag.neighbors_sorted(&node.id, Direction::Incoming);
                let child_node_ids = dag.neighbors_sorted(&node.id, Direction::Outgoing);
                let metadata = &node.data.metadata;

                let original_query = metadata
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let processed_query = substitute_variables(&original_query, variables);
                let result_history = metadata
                    .get("resultHistory")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let connect_to = if is_fork {
                    parent_node_ids
                        .iter()
                        .filter_map(|id| by_id.get(id.as_str()))
                        .map(|parent| ConnectFilter {
                            node_type: parent.node_type.clone(),
                            entity_id: parent.data.entity_id.clone(),
                            handle_type: "source".to_string(),
                        })
                        .collect()
                } else {
                    Vec::new()
                };

                NodeExecutionPlan {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    entity_id: node.data.entity_id.clone(),
                    title: node.data.title.clone(),
                    processed_query,
                    original_query,
                    connect_to,
                    parent_node_ids,
                    child_node_ids,
                    result_history,
                    node: node.clone(),
                    in_scope: in_scope.contains(&node.id),
                }
            })
            .collect();

        Ok(PreparedNodes {
            node_executions,
            start_nodes,
        })
    }
}

/// Order node executions for display: parents before children, ties by node id
///
/// Display only. Any inconsistency (cycle, duplicate ids) keeps the stored order.
pub fn order_for_detail(nodes: Vec<WorkflowNodeExecution>) -> Vec<WorkflowNodeExecution> {
    let Some(order) = detail_order(&nodes) else {
        return nodes;
    };

    let mut slots: Vec<Option<WorkflowNodeExecution>> = nodes.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect()
}

/// Positions of `nodes` in Kahn order with a lexicographic ready set
fn detail_order(nodes: &[WorkflowNodeExecution]) -> Option<Vec<usize>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    for (position, node) in nodes.iter().enumerate() {
        if index_of.insert(node.node_id.as_str(), graph.add_node(position)).is_some() {
            return None;
        }
    }
    for node in nodes {
        let child = index_of[node.node_id.as_str()];
        for parent in &node.parent_node_ids {
            if let Some(parent) = index_of.get(parent.as_str()) {
                graph.update_edge(*parent, child, ());
            }
        }
    }
    if is_cyclic_directed(&graph) {
        return None;
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<(&str, NodeIndex)> = graph
        .node_indices()
        .filter(|i| in_degree[i] == 0)
        .map(|i| (nodes[graph[i]].node_id.as_str(), i))
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(nodes.len());
    let mut seen: HashSet<NodeIndex> = HashSet::new();
    while let Some((_, index)) = ready.pop_first() {
        if !seen.insert(index) {
            continue;
        }
        order.push(graph[index]);
        for child in graph.neighbors_directed(index, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&child) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert((nodes[graph[child]].node_id.as_str(), child));
                }
            }
        }
    }

    (order.len() == nodes.len()).then_some(order)
}
