//! Task graph: immutable tasks plus dependency edges, validated acyclic

use crate::error::{PipewrightError, Result};
use crate::models::{Task, TaskId, TaskKind, WaitSource};
use crate::params;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency edge: `upstream` must succeed before `downstream` runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub upstream: TaskId,
    pub downstream: TaskId,
}

impl Edge {
    pub fn new(upstream: impl Into<TaskId>, downstream: impl Into<TaskId>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

/// Immutable, validated task graph shared by every run built from it
#[derive(Debug)]
pub struct TaskGraph {
    id: String,
    graph: DiGraph<TaskId, ()>,
    task_indices: HashMap<TaskId, NodeIndex>,
    tasks: Vec<Task>,
    positions: HashMap<TaskId, usize>,
    predecessors: HashMap<TaskId, Vec<TaskId>>,
    successors: HashMap<TaskId, Vec<TaskId>>,
    topo_order: Vec<TaskId>,
}

impl TaskGraph {
    /// Build and validate a graph.
    ///
    /// Fails with a graph definition error on duplicate ids, edges naming
    /// unknown tasks, bad submit-task references, or cycles. A parameter
    /// with an unknown `{{ }}` placeholder is a validation error.
    pub fn build(id: impl Into<String>, tasks: Vec<Task>, edges: &[Edge]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::with_capacity(tasks.len());
        let mut positions = HashMap::with_capacity(tasks.len());

        for (position, task) in tasks.iter().enumerate() {
            if task_indices.contains_key(&task.id) {
                return Err(PipewrightError::DuplicateTaskId(task.id.clone()));
            }
            validate_placeholders(task)?;
            let index = graph.add_node(task.id.clone());
            task_indices.insert(task.id.clone(), index);
            positions.insert(task.id.clone(), position);
        }

        let mut seen = HashSet::with_capacity(edges.len());
        for edge in edges {
            let missing = [&edge.upstream, &edge.downstream]
                .into_iter()
                .find(|id| !task_indices.contains_key(*id));
            if let Some(missing) = missing {
                return Err(PipewrightError::DanglingEdge {
                    upstream: edge.upstream.clone(),
                    downstream: edge.downstream.clone(),
                    missing: missing.clone(),
                });
            }
            if seen.insert(edge) {
                graph.add_edge(
                    task_indices[&edge.upstream],
                    task_indices[&edge.downstream],
                    (),
                );
            }
        }

        let mut engine = Self {
            id: id.into(),
            graph,
            task_indices,
            tasks,
            positions,
            predecessors: HashMap::new(),
            successors: HashMap::new(),
            topo_order: Vec::new(),
        };

        engine.validate_acyclic()?;
        engine.index_adjacency();
        engine.topo_order = engine.kahn_order();
        engine.validate_wait_sources()?;

        Ok(engine)
    }

    fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(PipewrightError::CycleDetected(self.find_cycle()));
        }
        Ok(())
    }

    /// Find a cycle in the graph for error reporting
    fn find_cycle(&self) -> String {
        let mut visited = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut visited, &mut path) {
                    return cycle;
                }
            }
        }

        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<String> {
        if let Some(&on_path) = visited.get(&node) {
            if on_path {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<&str> =
                    path[start..].iter().map(|n| self.graph[*n].as_str()).collect();
                cycle.push(self.graph[node].as_str());
                return Some(cycle.join(" -> "));
            }
            return None;
        }

        visited.insert(node, true);
        path.push(node);

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        visited.insert(node, false);
        None
    }

    fn index_adjacency(&mut self) {
        for task in &self.tasks {
            let index = self.task_indices[&task.id];

            let mut preds: Vec<TaskId> = self
                .graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .map(|idx| self.graph[idx].clone())
                .collect();
            preds.sort_by_key(|id| self.positions[id]);

            let mut succs: Vec<TaskId> = self
                .graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .map(|idx| self.graph[idx].clone())
                .collect();
            succs.sort_by_key(|id| self.positions[id]);

            self.predecessors.insert(task.id.clone(), preds);
            self.successors.insert(task.id.clone(), succs);
        }
    }

    /// Kahn's algorithm with insertion order as the tie-break
    fn kahn_order(&self) -> Vec<TaskId> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), self.predecessors[&t.id].len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .tasks
            .iter()
            .filter(|t| in_degree[t.id.as_str()] == 0)
            .map(|t| t.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for succ in &self.successors[id] {
                if let Some(degree) = in_degree.get_mut(succ.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(succ.as_str());
                    }
                }
            }
        }
        order
    }

    fn validate_wait_sources(&self) -> Result<()> {
        for task in &self.tasks {
            let TaskKind::ExternalJobWait {
                source: WaitSource::Upstream(submit),
                ..
            } = &task.kind
            else {
                continue;
            };

            let invalid = |reason: &str| PipewrightError::InvalidTaskReference {
                task: task.id.clone(),
                reference: submit.clone(),
                reason: reason.to_string(),
            };

            let submit_task = self.task(submit).ok_or_else(|| invalid("no such task"))?;
            if !matches!(submit_task.kind, TaskKind::ExternalJobSubmit { .. }) {
                return Err(invalid("not an external_job_submit task"));
            }
            if !self.predecessors(&task.id).contains(submit) {
                return Err(invalid("must be a direct upstream dependency"));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tasks in insertion order
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.positions.get(task_id).map(|&pos| &self.tasks[pos])
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.positions.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Direct upstream tasks, in insertion order
    pub fn predecessors(&self, task_id: &str) -> &[TaskId] {
        self.predecessors
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct downstream tasks, in insertion order
    pub fn successors(&self, task_id: &str) -> &[TaskId] {
        self.successors
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| self.predecessors(&t.id).is_empty())
    }

    /// Stable topological order (insertion order among independent tasks)
    pub fn topological_order(&self) -> &[TaskId] {
        &self.topo_order
    }

    /// Tasks grouped by depth: level 0 has no dependencies, level N depends
    /// on at least one task of level N-1.
    pub fn parallel_levels(&self) -> Vec<Vec<TaskId>> {
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        let mut levels: Vec<Vec<TaskId>> = Vec::new();

        for id in &self.topo_order {
            let level = self
                .predecessors(id)
                .iter()
                .map(|p| depth[p.as_str()] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.as_str(), level);
        }

        for task in &self.tasks {
            let level = depth[task.id.as_str()];
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(task.id.clone());
        }

        levels
    }
}

fn validate_placeholders(task: &Task) -> Result<()> {
    for (key, value) in &task.params {
        params::validate_template(value).map_err(|e| {
            PipewrightError::Validation(format!(
                "Task '{}' parameter '{}': {}",
                task.id, key, e
            ))
        })?;
    }
    Ok(())
}
