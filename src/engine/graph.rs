use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::engine::Task;
use crate::error::GraphError;

/// Why one task is ordered before another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Target declared the source in `depends_on`.
    DependsOn,
    /// Source declared the target in `reverse_depends_on`.
    ReverseDependsOn,
    /// Target declared the source in `run_after`.
    RunAfter,
    /// Target declared the source in `always_run_after`.
    AlwaysRunAfter,
}

impl Edge {
    /// Mandatory edges pull their source into the run and require it to
    /// succeed.
    pub fn is_mandatory(self) -> bool {
        matches!(self, Edge::DependsOn | Edge::ReverseDependsOn)
    }

    fn label(self) -> &'static str {
        match self {
            Edge::DependsOn => "dependsOn",
            Edge::ReverseDependsOn => "reverseDependsOn",
            Edge::RunAfter => "runAfter",
            Edge::AlwaysRunAfter => "alwaysRunAfter",
        }
    }
}

/// Execution order of the tasks selected for one run.
///
/// Node `i` of [`graph`](Self::graph) is `tasks()[i]`, and edges point from a
/// task to the tasks that must wait for it.
#[derive(Debug, Clone)]
pub struct Schedule {
    tasks: Vec<Arc<Task>>,
    graph: DiGraph<usize, Edge>,
}

impl Schedule {
    /// Tasks in execution order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn graph(&self) -> &DiGraph<usize, Edge> {
        &self.graph
    }
}

impl Display for Schedule {
    /// Renders the scheduled graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (position, task) in self.tasks.iter().enumerate() {
            let name = task.name.replace('"', "\\\"");
            writeln!(f, "    {position}[\"{name}\"]")?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                edge.weight().label(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Selects the tasks needed to run `requested` and orders them.
///
/// Tasks without an ordering constraint between them keep their declaration
/// order in `tasks`. Unknown names in `depends_on` or `reverse_depends_on`,
/// unknown requested names, duplicate task names and cycles are all
/// reported before anything runs. Unknown names in the soft relations are
/// ignored.
pub fn schedule<S: AsRef<str>>(
    requested: &[S],
    tasks: &[Arc<Task>],
) -> Result<Schedule, GraphError> {
    let mut index = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if index.insert(task.name.as_str(), i).is_some() {
            return Err(GraphError::Duplicate(task.name.clone()));
        }
    }

    let lookup = |task: &Task, relation: &'static str, name: &str| {
        index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask {
                task: task.name.clone(),
                relation,
                reference: name.to_string(),
            })
    };

    // Whole declared graph, node i is tasks[i].
    let mut full = DiGraph::<usize, Edge>::with_capacity(tasks.len(), tasks.len());
    for i in 0..tasks.len() {
        full.add_node(i);
    }

    for (i, task) in tasks.iter().enumerate() {
        for name in &task.depends_on {
            let dep = lookup(task, "depends on", name)?;
            full.update_edge(NodeIndex::new(dep), NodeIndex::new(i), Edge::DependsOn);
        }
        for name in &task.reverse_depends_on {
            let target = lookup(task, "is a reverse dependency of", name)?;
            full.update_edge(
                NodeIndex::new(i),
                NodeIndex::new(target),
                Edge::ReverseDependsOn,
            );
        }
        for name in &task.always_run_after {
            let Some(&before) = index.get(name.as_str()) else {
                tracing::debug!(
                    task = %task.name,
                    %name,
                    "ignoring alwaysRunAfter on unknown task"
                );
                continue;
            };
            let (source, target) = (NodeIndex::new(before), NodeIndex::new(i));
            if full.find_edge(source, target).is_none() {
                full.add_edge(source, target, Edge::AlwaysRunAfter);
            }
        }
    }

    // Expand the request through the mandatory edges.
    let mut scheduled = HashSet::new();
    let mut stack = Vec::new();
    for name in requested {
        let name = name.as_ref();
        let &i = index
            .get(name)
            .ok_or_else(|| GraphError::UnknownRequest(name.to_string()))?;
        stack.push(NodeIndex::new(i));
    }

    while let Some(node) = stack.pop() {
        if !scheduled.insert(node.index()) {
            continue;
        }
        for edge in full.edges_directed(node, Direction::Incoming) {
            if edge.weight().is_mandatory() {
                stack.push(edge.source());
            }
        }
    }

    // Subgraph of the scheduled tasks, nodes added in declaration order.
    let mut members: Vec<usize> = scheduled.into_iter().collect();
    members.sort_unstable();

    let mut sub = DiGraph::<usize, Edge>::with_capacity(members.len(), members.len());
    let position: HashMap<usize, NodeIndex> = members
        .iter()
        .map(|&i| (i, sub.add_node(i)))
        .collect();

    for edge in full.edge_references() {
        let (Some(&source), Some(&target)) = (
            position.get(&edge.source().index()),
            position.get(&edge.target().index()),
        ) else {
            continue;
        };
        sub.update_edge(source, target, *edge.weight());
    }

    for &i in &members {
        for name in &tasks[i].run_after {
            if let Some(&before) = index.get(name.as_str())
                && let Some(&source) = position.get(&before)
            {
                let target = position[&i];
                if sub.find_edge(source, target).is_none() {
                    sub.add_edge(source, target, Edge::RunAfter);
                }
            }
        }
    }

    let order = sort(&sub).ok_or_else(|| cycle(&sub, tasks))?;

    // Renumber so that node i of the returned graph is the i-th task to run.
    let mut renumber = vec![NodeIndex::end(); sub.node_count()];
    let mut graph = DiGraph::with_capacity(order.len(), sub.edge_count());
    for (position, &node) in order.iter().enumerate() {
        renumber[node.index()] = graph.add_node(position);
    }
    for edge in sub.edge_references() {
        graph.add_edge(
            renumber[edge.source().index()],
            renumber[edge.target().index()],
            *edge.weight(),
        );
    }

    Ok(Schedule {
        tasks: order.iter().map(|&node| tasks[sub[node]].clone()).collect(),
        graph,
    })
}

/// Kahn's algorithm, always picking the ready node declared first. Returns
/// `None` if the graph has a cycle.
fn sort(graph: &DiGraph<usize, Edge>) -> Option<Vec<NodeIndex>> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.edges_directed(node, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|node| indegree[node.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.insert(next);
            }
        }
    }

    (order.len() == graph.node_count()).then_some(order)
}

fn cycle(graph: &DiGraph<usize, Edge>, tasks: &[Arc<Task>]) -> GraphError {
    let members = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .unwrap_or_default();

    let mut members: Vec<usize> = members.into_iter().map(|node| graph[node]).collect();
    members.sort_unstable();

    GraphError::Cycle(members.into_iter().map(|i| tasks[i].name.clone()).collect())
}
