use std::collections::{BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};

use crate::error::GraphCycleError;
use crate::future::{Node, UntypedFuture};

/// The reachable future closure of a root, as a DAG.
///
/// Task vertices are collapsed by `(task_name, task_id)`, so two handles to
/// the same identity become one vertex and the scheduler dispatches it at
/// most once per run. Aggregate and index vertices are deduplicated by
/// object identity. Edges run from an upstream to each of its dependents.
pub(crate) struct TaskDag {
    pub(crate) graph: Graph<UntypedFuture, ()>,
    pub(crate) root: NodeIndex,
    /// Deterministic leaves-first topological order.
    pub(crate) order: Vec<NodeIndex>,
}

#[derive(Hash, PartialEq, Eq)]
enum VertexKey {
    Task(String, String),
    Object(usize),
}

fn vertex_key(future: &UntypedFuture) -> VertexKey {
    match future.node.as_task() {
        Some(task) => VertexKey::Task(task.name.clone(), task.id.clone()),
        None => VertexKey::Object(std::sync::Arc::as_ptr(&future.node) as *const () as usize),
    }
}

fn vertex_label(future: &UntypedFuture) -> String {
    match &*future.node {
        Node::Task(task) => format!("{}({})", task.name, task.id),
        Node::Const(_) => "<const>".to_string(),
        Node::List(_) => "<list>".to_string(),
        Node::Dict(_) => "<dict>".to_string(),
        Node::Item { key, .. } => format!("<item {key}>"),
    }
}

/// Walks the future closure of `root` breadth-first and returns the DAG
/// with its topological order. A cycle is a construction error reported
/// before any dispatch.
pub(crate) fn build(root: &UntypedFuture) -> Result<TaskDag, GraphCycleError> {
    let mut graph: Graph<UntypedFuture, ()> = Graph::new();
    let mut seen: HashMap<VertexKey, NodeIndex> = HashMap::new();
    let mut queue: VecDeque<NodeIndex> = VecDeque::new();

    let root_index = graph.add_node(root.clone());
    seen.insert(vertex_key(root), root_index);
    queue.push_back(root_index);

    while let Some(index) = queue.pop_front() {
        let upstreams: Vec<UntypedFuture> = graph[index]
            .node
            .upstreams()
            .into_iter()
            .cloned()
            .collect();

        for upstream in upstreams {
            let up_index = match seen.get(&vertex_key(&upstream)) {
                Some(&existing) => existing,
                None => {
                    let added = graph.add_node(upstream.clone());
                    seen.insert(vertex_key(&upstream), added);
                    queue.push_back(added);
                    added
                }
            };
            graph.update_edge(up_index, index, ());
        }
    }

    if let Some(cycle) = find_cycle(&graph, |index| vertex_label(&graph[index])) {
        return Err(GraphCycleError { cycle });
    }

    let order = topo_order(&graph);
    debug_assert_eq!(order.len(), graph.node_count());

    Ok(TaskDag {
        root: root_index,
        order,
        graph,
    })
}

/// DFS cycle detector with temp/perm marks. Returns the offending cycle as
/// labels, or `None` for an acyclic graph.
fn find_cycle<N, F>(graph: &Graph<N, ()>, label: F) -> Option<Vec<String>>
where
    F: Fn(NodeIndex) -> String,
{
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Temp,
        Perm,
    }

    fn visit<N, F>(
        graph: &Graph<N, ()>,
        label: &F,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
        node: NodeIndex,
    ) -> Option<Vec<String>>
    where
        F: Fn(NodeIndex) -> String,
    {
        marks[node.index()] = Mark::Temp;
        stack.push(node);

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            match marks[next.index()] {
                Mark::Perm => {}
                Mark::Temp => {
                    // Re-entered a node on the current path: slice the
                    // cycle out of the stack.
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|&n| label(n)).collect();
                    cycle.push(label(next));
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(graph, label, marks, stack, next) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Perm;
        None
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();

    for node in graph.node_indices() {
        if marks[node.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, &label, &mut marks, &mut stack, node) {
                return Some(cycle);
            }
        }
    }

    None
}

/// Kahn's algorithm with a sorted frontier, so equal-depth vertices come
/// out in `(task_name, task_id)` order and scheduling is reproducible.
fn topo_order(graph: &Graph<UntypedFuture, ()>) -> Vec<NodeIndex> {
    let mut pending: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|index| {
            (
                index,
                graph.neighbors_directed(index, Direction::Incoming).count(),
            )
        })
        .collect();

    let sort_key = |index: NodeIndex| -> (String, String, usize) {
        match graph[index].node.as_task() {
            Some(task) => (task.name.clone(), task.id.clone(), index.index()),
            None => (String::new(), String::new(), index.index()),
        }
    };

    let mut frontier: BTreeSet<(String, String, usize, NodeIndex)> = graph
        .node_indices()
        .filter(|index| pending[index] == 0)
        .map(|index| {
            let (name, id, ord) = sort_key(index);
            (name, id, ord, index)
        })
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(entry) = frontier.pop_first() {
        let index = entry.3;
        order.push(index);

        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            let count = pending.get_mut(&next).unwrap();
            *count -= 1;
            if *count == 0 {
                let (name, id, ord) = sort_key(next);
                frontier.insert((name, id, ord, next));
            }
        }
    }

    order
}
