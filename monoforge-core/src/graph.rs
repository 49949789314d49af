//! Dependency-ordered task scheduling.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type TaskBody<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// A named unit of work with declared dependencies.
///
/// The body is only invoked once its level starts, and at most once.
pub struct TaskNode<T> {
    id: String,
    deps: Vec<String>,
    body: TaskBody<T>,
}

impl<T> TaskNode<T> {
    pub fn new<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            deps: Vec::new(),
            body: Box::new(move || body().boxed()),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn deps(&self) -> &[String] {
        &self.deps
    }
}

impl<T> fmt::Debug for TaskNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// How a run reacts to a failing unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Stop at the first failure. In-flight siblings are dropped, which kills
    /// any process they started through a
    /// [`ProcessRunner`](crate::process::ProcessRunner), and later levels
    /// never start.
    #[default]
    AbortFast,
    /// Let every unit of the level settle, then stop before the next level
    /// and report the first failure.
    SettleAll,
}

/// Computes execution levels from `(id, deps)` pairs, as indices into the
/// input. Each level keeps the input order of its members.
fn plan_levels<'a, I>(units: I) -> Result<Vec<Vec<usize>>>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let units: Vec<(&str, &[String])> = units.into_iter().collect();
    let total = units.len();

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(total);
    for (idx, (id, _)) in units.iter().enumerate() {
        if index.insert(*id, idx).is_some() {
            return Err(Error::DuplicateTask(id.to_string()));
        }
    }

    let mut in_degree = vec![0usize; total];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
    for (idx, (id, deps)) in units.iter().enumerate() {
        for dep in deps.iter() {
            let dep_idx = *index
                .get(dep.as_str())
                .ok_or_else(|| Error::UnknownDependency {
                    task: id.to_string(),
                    dependency: dep.clone(),
                    available: units
                        .iter()
                        .map(|(id, _)| *id)
                        .collect::<Vec<_>>()
                        .join(", "),
                })?;
            in_degree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut levels = Vec::new();
    let mut placed = 0;
    let mut current: Vec<usize> = (0..total).filter(|&idx| in_degree[idx] == 0).collect();

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &idx in &current {
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(current);
        current = next;
    }

    if placed < total {
        return Err(cycle_error(&units, &in_degree));
    }

    Ok(levels)
}

/// Names the units that sit on a cycle among those left unplaced.
fn cycle_error(units: &[(&str, &[String])], in_degree: &[usize]) -> Error {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes = HashMap::new();
    for (idx, _) in in_degree.iter().enumerate().filter(|(_, d)| **d > 0) {
        nodes.insert(units[idx].0, graph.add_node(idx));
    }
    let mut self_loops = HashSet::new();
    for (idx, d) in in_degree.iter().enumerate() {
        if *d == 0 {
            continue;
        }
        let (id, deps) = units[idx];
        for dep in deps.iter() {
            if dep == id {
                self_loops.insert(idx);
            }
            if let (Some(&from), Some(&to)) = (nodes.get(id), nodes.get(dep.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut members: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || self_loops.contains(&graph[scc[0]]))
        .flatten()
        .map(|node| graph[node])
        .collect();
    members.sort_unstable();

    Error::Cycle {
        members: members.into_iter().map(|idx| units[idx].0.to_string()).collect(),
    }
}

/// Orders `units` into execution levels.
///
/// # Errors
///
/// Returns [`Error::Cycle`] when the dependencies cannot be ordered, and
/// rejects duplicate ids or dependencies on ids that are not in `units`.
pub fn order<T>(units: &[TaskNode<T>]) -> Result<Vec<Vec<String>>> {
    let levels = plan_levels(units.iter().map(|u| (u.id(), u.deps())))?;
    Ok(levels
        .into_iter()
        .map(|level| level.into_iter().map(|idx| units[idx].id.clone()).collect())
        .collect())
}

/// Runs task graphs level by level.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    max_parallel: Option<usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of units of one level that run at the same time.
    /// `None` or `Some(0)` means unbounded.
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel.filter(|n| *n > 0);
        self
    }

    /// Runs every unit after its dependencies, returning outputs keyed by id
    /// in level order.
    ///
    /// The graph is validated before any body runs. Level `k + 1` starts only
    /// after level `k` has fully settled.
    ///
    /// # Errors
    ///
    /// Ordering errors are returned untouched. A failing unit yields
    /// [`Error::Task`] under [`ExecutionPolicy::AbortFast`] and
    /// [`Error::Aggregate`] under [`ExecutionPolicy::SettleAll`]. Use
    /// [`Scheduler::run_report`] to keep the outputs of units that succeeded.
    pub async fn run<T>(
        &self,
        units: Vec<TaskNode<T>>,
        policy: ExecutionPolicy,
    ) -> Result<IndexMap<String, T>>
    where
        T: Send + 'static,
    {
        self.run_report(units, policy).await?.into_result()
    }

    /// Like [`Scheduler::run`], but a failing unit does not discard the
    /// outputs of units that completed before the run stopped.
    ///
    /// # Errors
    ///
    /// Only ordering errors are returned here; unit failures are kept in
    /// the report.
    pub async fn run_report<T>(
        &self,
        units: Vec<TaskNode<T>>,
        policy: ExecutionPolicy,
    ) -> Result<RunReport<T>>
    where
        T: Send + 'static,
    {
        let levels = plan_levels(units.iter().map(|u| (u.id(), u.deps())))?;
        let mut slots: Vec<Option<TaskNode<T>>> = units.into_iter().map(Some).collect();
        let mut completed = IndexMap::with_capacity(slots.len());
        let limiter = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));

        for (depth, level) in levels.into_iter().enumerate() {
            let nodes: Vec<TaskNode<T>> = level
                .into_iter()
                .filter_map(|idx| slots[idx].take())
                .collect();
            debug!(
                level = depth,
                tasks = ?nodes.iter().map(|n| n.id()).collect::<Vec<_>>(),
                "starting level"
            );

            let settled = match policy {
                ExecutionPolicy::AbortFast => {
                    run_abort_fast(nodes, limiter.as_ref(), &mut completed).await
                }
                ExecutionPolicy::SettleAll => {
                    run_settle_all(nodes, limiter.as_ref(), &mut completed).await
                }
            };
            if let Err(failure) = settled {
                return Ok(RunReport {
                    completed,
                    failure: Some(failure),
                });
            }
        }

        info!(tasks = completed.len(), "all tasks completed");
        Ok(RunReport {
            completed,
            failure: None,
        })
    }
}

/// Outcome of a scheduling run that got past validation.
#[derive(Debug)]
pub struct RunReport<T> {
    completed: IndexMap<String, T>,
    failure: Option<Error>,
}

impl<T> RunReport<T> {
    /// Outputs of every unit that succeeded, in the order they were recorded.
    pub fn completed(&self) -> &IndexMap<String, T> {
        &self.completed
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_parts(self) -> (IndexMap<String, T>, Option<Error>) {
        (self.completed, self.failure)
    }

    /// # Errors
    ///
    /// Returns the unit failure, dropping the completed outputs.
    pub fn into_result(self) -> Result<IndexMap<String, T>> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.completed),
        }
    }
}

/// Runs `units` with an unbounded [`Scheduler`].
pub async fn run<T>(units: Vec<TaskNode<T>>, policy: ExecutionPolicy) -> Result<IndexMap<String, T>>
where
    T: Send + 'static,
{
    Scheduler::new().run(units, policy).await
}

async fn launch<T>(node: TaskNode<T>, limiter: Option<Arc<Semaphore>>) -> (String, Result<T>) {
    let _permit = match limiter {
        Some(limiter) => limiter.acquire_owned().await.ok(),
        None => None,
    };
    let TaskNode { id, body, .. } = node;
    let result = body().await;
    (id, result)
}

async fn run_abort_fast<T>(
    nodes: Vec<TaskNode<T>>,
    limiter: Option<&Arc<Semaphore>>,
    outputs: &mut IndexMap<String, T>,
) -> Result<()> {
    let mut finished: Vec<Option<(String, T)>> = (0..nodes.len()).map(|_| None).collect();
    let mut pending: FuturesUnordered<_> = nodes
        .into_iter()
        .enumerate()
        .map(|(pos, node)| launch(node, limiter.cloned()).map(move |done| (pos, done)))
        .collect();

    while let Some((pos, (id, result))) = pending.next().await {
        match result {
            Ok(value) => finished[pos] = Some((id, value)),
            Err(source) => {
                warn!(task = %id, remaining = pending.len(), "task failed, aborting run");
                outputs.extend(finished.into_iter().flatten());
                return Err(Error::Task {
                    task: id,
                    source: Box::new(source),
                });
            }
        }
    }

    outputs.extend(finished.into_iter().flatten());
    Ok(())
}

async fn run_settle_all<T>(
    nodes: Vec<TaskNode<T>>,
    limiter: Option<&Arc<Semaphore>>,
    outputs: &mut IndexMap<String, T>,
) -> Result<()> {
    let settled = join_all(nodes.into_iter().map(|node| launch(node, limiter.cloned()))).await;

    let mut failures = Vec::new();
    for (id, result) in settled {
        match result {
            Ok(value) => {
                outputs.insert(id, value);
            }
            Err(source) => failures.push((id, source)),
        }
    }

    let failed: Vec<String> = failures.iter().map(|(id, _)| id.clone()).collect();
    match failures.into_iter().next() {
        None => Ok(()),
        Some((task, source)) => {
            warn!(failed = ?failed, "level finished with failures, skipping remaining levels");
            Err(Error::Aggregate {
                failed,
                first: Box::new(Error::Task {
                    task,
                    source: Box::new(source),
                }),
            })
        }
    }
}
