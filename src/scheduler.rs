use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Level, span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::Cache;
use crate::dispatch;
use crate::error::{KarakuriError, RunError, UsageError};
use crate::executor::{Executor, ThreadPoolExecutor};
use crate::future::{
    Body, Future, LogHandle, TaskContext, TaskNode, UntypedFuture, resolve_with,
};
use crate::graph::{self, TaskDag};

/// Cooperative cancellation flag. Wire a signal handler to
/// [`cancel`](CancelToken::cancel) and the scheduler stops dispatching,
/// drains in-flight tasks (persisting their outputs), and returns
/// [`RunError::Interrupted`].
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a task's value came to be during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The entry already existed; the body never ran.
    CacheHit,
    /// The body ran in-process on an executor worker.
    Computed,
    /// A prefix command ran the body in a child process.
    Dispatched,
}

/// Per-task timings and origin, relative to the start of the run.
#[derive(Debug, Clone)]
pub struct TaskStat {
    pub origin: Origin,
    /// The slots the task occupied: its type name plus its channels.
    pub slots: Vec<String>,
    pub queued_at: Option<Duration>,
    pub started_at: Option<Duration>,
    pub finished_at: Option<Duration>,
}

/// Summary of a finished `run_graph` call.
#[derive(Debug, Default)]
pub struct RunStats {
    /// Stats keyed by `(task_name, task_id)`.
    pub tasks: BTreeMap<(String, String), TaskStat>,
    pub elapsed: Duration,
}

impl RunStats {
    fn count(&self, origin: Origin) -> usize {
        self.tasks.values().filter(|s| s.origin == origin).count()
    }

    /// Number of bodies that actually ran, in-process or dispatched.
    pub fn executed(&self) -> usize {
        self.count(Origin::Computed) + self.count(Origin::Dispatched)
    }

    pub fn cache_hits(&self) -> usize {
        self.count(Origin::CacheHit)
    }

    pub fn dispatched(&self) -> usize {
        self.count(Origin::Dispatched)
    }
}

/// Configuration of a single `run_graph` call.
///
/// Built fluently:
///
/// ```rust,no_run
/// use karakuri::RunOptions;
///
/// let options = RunOptions::new()
///     .workers(8)
///     .rate_limit("gpu", 1)
///     .prefix("cluster", "srun --partition batch");
/// ```
pub struct RunOptions {
    pub(crate) workers: usize,
    pub(crate) rate_limits: BTreeMap<String, usize>,
    pub(crate) prefixes: BTreeMap<String, String>,
    pub(crate) self_invocation: Vec<String>,
    pub(crate) cancel: CancelToken,
    pub(crate) executor: Option<Arc<dyn Executor>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            rate_limits: BTreeMap::new(),
            prefixes: BTreeMap::new(),
            self_invocation: Vec::new(),
            cancel: CancelToken::new(),
            executor: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the built-in worker pool. Ignored when a custom executor is
    /// supplied.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Caps how many tasks occupying `slot` (a task name or channel) may be
    /// in flight at once.
    pub fn rate_limit(mut self, slot: impl Into<String>, limit: usize) -> Self {
        self.rate_limits.insert(slot.into(), limit);
        self
    }

    /// Wraps every task in `slot` with a prefix command. A task's own
    /// prefix takes precedence.
    pub fn prefix(mut self, slot: impl Into<String>, command: impl Into<String>) -> Self {
        self.prefixes.insert(slot.into(), command.into());
        self
    }

    /// The command line that re-enters this program for prefix dispatch,
    /// e.g. `["/usr/local/bin/mytool", "run-task"]`. Appended after the
    /// prefix words, before the `--task-name …` arguments.
    pub fn self_invocation(mut self, argv: impl IntoIterator<Item = String>) -> Self {
        self.self_invocation = argv.into_iter().collect();
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replaces the built-in thread pool with a custom executor.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }
}

/// Runs the task graph rooted at `root` and returns its resolved value
/// with run statistics.
///
/// Cached tasks are skipped, everything else runs leaves-first under the
/// configured concurrency limits. On failure the scheduler drains in-flight
/// tasks (their outputs are persisted) and surfaces the first error.
pub fn run_graph<T: DeserializeOwned>(
    root: &Future<T>,
    options: RunOptions,
) -> Result<(T, RunStats), KarakuriError> {
    let dag = graph::build(&root.untyped())?;
    let mut scheduler = Scheduler::new(dag, options)?;
    let (value, stats) = scheduler.run().map_err(KarakuriError::Run)?;

    let typed = serde_json::from_value(value).map_err(|err| {
        KarakuriError::Usage(UsageError::Other(format!(
            "root value does not decode into the requested type: {err}"
        )))
    })?;

    Ok((typed, stats))
}

impl<T: DeserializeOwned> Future<T> {
    /// Runs the graph below this future and returns its resolved value.
    pub fn run(&self, options: RunOptions) -> Result<T, KarakuriError> {
        run_graph(self, options).map(|(value, _)| value)
    }

    /// Like [`run`](Future::run), but also returns the run statistics.
    pub fn run_with_stats(&self, options: RunOptions) -> Result<(T, RunStats), KarakuriError> {
        run_graph(self, options)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Pending,
    Ready,
    Running,
    Done,
}

enum Outcome {
    /// In-process body finished (successfully or not).
    Computed(anyhow::Result<Value>),
    /// Prefix-dispatched child exited, or failed to spawn.
    Child(std::io::Result<std::process::ExitStatus>),
}

struct Completion {
    index: NodeIndex,
    outcome: Outcome,
}

#[derive(Default)]
struct StatCell {
    origin: Option<Origin>,
    queued: Option<Instant>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Everything the dispatch path needs from a task vertex, detached from
/// the graph so the scheduler can mutate its own state while using it.
struct TaskRef {
    name: String,
    id: String,
    channels: Vec<String>,
    prefix: Option<String>,
    compress: Option<i32>,
    args_json: Value,
    inputs: Vec<(String, UntypedFuture)>,
    body: Arc<dyn Body>,
    cache: Cache,
}

impl TaskRef {
    fn of(task: &TaskNode) -> Self {
        Self {
            name: task.name.clone(),
            id: task.id.clone(),
            channels: task.channels.clone(),
            prefix: task.prefix.clone(),
            compress: task.compress,
            args_json: task.args_json.clone(),
            inputs: task
                .inputs
                .iter()
                .map(|(name, future)| (name.clone(), future.clone()))
                .collect(),
            body: Arc::clone(&task.body),
            cache: task.cache.clone(),
        }
    }

    fn slots(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.channels.iter().map(String::as_str))
    }
}

struct Scheduler {
    dag: TaskDag,
    options: RunOptions,
    executor: Arc<dyn Executor>,
    states: Vec<State>,
    pending: Vec<usize>,
    /// Eligible tasks in `(task_name, task_id)` order.
    ready: BTreeSet<(String, String, usize)>,
    /// Task values loaded or computed this run, one load per task per run.
    values: HashMap<(String, String), Value>,
    in_flight_slots: HashMap<String, usize>,
    in_flight: usize,
    stats: HashMap<usize, StatCell>,
    started: Instant,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    failure: Option<RunError>,
}

fn task_value(
    values: &mut HashMap<(String, String), Value>,
    task: &TaskNode,
) -> anyhow::Result<Value> {
    let key = (task.name.clone(), task.id.clone());
    if let Some(value) = values.get(&key) {
        return Ok(value.clone());
    }
    let value = task.cache.load_value(&task.name, &task.id)?;
    values.insert(key, value.clone());
    Ok(value)
}

impl Scheduler {
    fn new(dag: TaskDag, options: RunOptions) -> Result<Self, KarakuriError> {
        // A rate limit must name a slot some task occupies and leave room
        // for at least one dispatch.
        let mut slots: BTreeSet<&str> = BTreeSet::new();
        for index in dag.graph.node_indices() {
            if let Some(task) = dag.graph[index].node.as_task() {
                slots.extend(task.slots());
            }
        }
        for (slot, &limit) in &options.rate_limits {
            if !slots.contains(slot.as_str()) {
                return Err(UsageError::UnknownSlot(slot.clone()).into());
            }
            if limit == 0 {
                return Err(UsageError::ZeroLimit(slot.clone()).into());
            }
        }

        let executor: Arc<dyn Executor> = match &options.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(ThreadPoolExecutor::new(options.workers)?),
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let vertices = dag.graph.node_count();

        let mut scheduler = Self {
            dag,
            options,
            executor,
            states: vec![State::Pending; vertices],
            pending: vec![0; vertices],
            ready: BTreeSet::new(),
            values: HashMap::new(),
            in_flight_slots: HashMap::new(),
            in_flight: 0,
            stats: HashMap::new(),
            started: Instant::now(),
            tx,
            rx,
            failure: None,
        };
        scheduler.sweep();
        Ok(scheduler)
    }

    /// Initial sweep: count dependencies, mark cached tasks done, and seed
    /// the ready set with unblocked leaves.
    fn sweep(&mut self) {
        for index in self.dag.graph.node_indices() {
            self.pending[index.index()] = self
                .dag
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .count();
        }

        let mut hits = Vec::new();
        for index in self.dag.graph.node_indices() {
            if let Some(task) = self.dag.graph[index].node.as_task()
                && task.cache.has(&task.name, &task.id)
            {
                hits.push(index);
            }
        }
        for index in hits {
            self.stats.entry(index.index()).or_default().origin = Some(Origin::CacheHit);
            self.mark_done(index);
        }

        let unblocked: Vec<NodeIndex> = self
            .dag
            .graph
            .node_indices()
            .filter(|index| {
                self.states[index.index()] == State::Pending && self.pending[index.index()] == 0
            })
            .collect();
        for index in unblocked {
            self.promote(index);
        }
    }

    /// Moves an unblocked vertex forward: tasks become ready for dispatch,
    /// aggregates and constants complete synchronously in-memory.
    fn promote(&mut self, index: NodeIndex) {
        match self.dag.graph[index].node.as_task() {
            Some(task) => {
                self.states[index.index()] = State::Ready;
                self.ready
                    .insert((task.name.clone(), task.id.clone(), index.index()));
                self.stats.entry(index.index()).or_default().queued = Some(Instant::now());
            }
            None => self.mark_done(index),
        }
    }

    /// Marks a vertex done and cascades: dependents whose upstreams are now
    /// all done get promoted; non-task vertices complete transitively.
    fn mark_done(&mut self, start: NodeIndex) {
        let mut work = vec![start];

        while let Some(index) = work.pop() {
            if self.states[index.index()] == State::Done {
                continue;
            }
            self.states[index.index()] = State::Done;

            let dependents: Vec<NodeIndex> = self
                .dag
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();

            for dependent in dependents {
                let pending = &mut self.pending[dependent.index()];
                *pending = pending.saturating_sub(1);

                if *pending == 0 && self.states[dependent.index()] == State::Pending {
                    match self.dag.graph[dependent].node.as_task() {
                        Some(task) => {
                            self.states[dependent.index()] = State::Ready;
                            self.ready.insert((
                                task.name.clone(),
                                task.id.clone(),
                                dependent.index(),
                            ));
                            self.stats.entry(dependent.index()).or_default().queued =
                                Some(Instant::now());
                        }
                        None => work.push(dependent),
                    }
                }
            }
        }
    }

    fn root_done(&self) -> bool {
        self.states[self.dag.root.index()] == State::Done
    }

    fn slots_allow(&self, task: &TaskRef) -> bool {
        task.slots().all(|slot| {
            match self.options.rate_limits.get(slot) {
                Some(&limit) => self.in_flight_slots.get(slot).copied().unwrap_or(0) < limit,
                None => true,
            }
        })
    }

    fn fail(&mut self, name: &str, id: &str, cause: anyhow::Error) {
        if self.failure.is_none() {
            self.failure = Some(RunError::TaskFailed {
                task_name: name.to_string(),
                task_id: id.to_string(),
                cause,
            });
        } else {
            warn!("additional failure in {name}({id}) while draining: suppressed");
        }
    }

    /// Dispatches as many ready tasks as the concurrency limits allow, in
    /// `(task_name, task_id)` order. Blocked tasks stay ready.
    fn dispatch_ready(&mut self) {
        if self.failure.is_some() || self.root_done() {
            return;
        }

        let mut blocked = Vec::new();

        while let Some(entry) = self.ready.pop_first() {
            if self.failure.is_some() {
                blocked.push(entry);
                break;
            }

            let index = NodeIndex::new(entry.2);
            let task = TaskRef::of(
                self.dag.graph[index]
                    .node
                    .as_task()
                    .expect("ready vertex must be a task"),
            );

            if !self.slots_allow(&task) {
                blocked.push(entry);
                continue;
            }

            self.dispatch(index, task);
        }

        for entry in blocked {
            self.ready.insert(entry);
        }
    }

    fn dispatch(&mut self, index: NodeIndex, task: TaskRef) {
        // Per-task prefix wins; otherwise a prefix configured for the task
        // name, then for the first matching channel in declared order.
        let prefix = task
            .prefix
            .clone()
            .or_else(|| self.options.prefixes.get(&task.name).cloned())
            .or_else(|| {
                task.channels
                    .iter()
                    .find_map(|channel| self.options.prefixes.get(channel).cloned())
            });

        // Everything fallible happens before the task is committed as
        // running, so a preparation error never leaks slot counts.
        let prepared = self.prepare(index, &task, prefix);
        let job = match prepared {
            Ok(job) => job,
            Err(cause) => {
                self.fail(&task.name, &task.id, cause);
                return;
            }
        };

        self.states[index.index()] = State::Running;
        self.in_flight += 1;
        for slot in task.slots() {
            *self.in_flight_slots.entry(slot.to_string()).or_default() += 1;
        }
        self.stats.entry(index.index()).or_default().started = Some(Instant::now());

        self.executor.submit(job);
    }

    fn prepared_origin(prefix: &Option<String>) -> Origin {
        if prefix.is_some() {
            Origin::Dispatched
        } else {
            Origin::Computed
        }
    }

    fn prepare(
        &mut self,
        index: NodeIndex,
        task: &TaskRef,
        prefix: Option<String>,
    ) -> anyhow::Result<crate::executor::Job> {
        let scratch = task.cache.reset_scratch(&task.name, &task.id)?;
        let (stdout_path, stderr_path) = task.cache.paths_for(&task.name, &task.id)?;

        self.stats.entry(index.index()).or_default().origin =
            Some(Self::prepared_origin(&prefix));

        let sender = self.tx.clone();
        let name = task.name.clone();
        let id = task.id.clone();

        match prefix {
            None => {
                // Upstream values resolve on the scheduler thread, once per
                // task per run; the worker only runs the body.
                let mut resolved = BTreeMap::new();
                {
                    let values = &mut self.values;
                    let mut lookup = |node: &TaskNode| task_value(values, node);
                    for (input, future) in &task.inputs {
                        let value = resolve_with(future, &mut lookup)
                            .map_err(|err| err.context(format!("resolving input '{input}'")))?;
                        resolved.insert(input.clone(), value);
                    }
                }

                let stdout = LogHandle::file(std::fs::File::create(&stdout_path)?);
                let stderr = LogHandle::file(std::fs::File::create(&stderr_path)?);
                let body = Arc::clone(&task.body);

                Ok(Box::new(move || {
                    let span = span!(Level::INFO, "task", name = %name, id = %id);
                    let _enter = span.enter();

                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        let ctx = TaskContext {
                            inputs: &resolved,
                            scratch: &scratch,
                            stdout,
                            stderr,
                        };
                        body.run_erased(&ctx)
                    }));

                    let outcome = match result {
                        Ok(output) => Outcome::Computed(output),
                        Err(panic) => {
                            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("task panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("task panicked: {s}")
                            } else {
                                String::from("task panicked")
                            };
                            Outcome::Computed(Err(anyhow::anyhow!(message)))
                        }
                    };

                    let _ = sender.send(Completion { index, outcome });
                }))
            }
            Some(prefix) => {
                let command = dispatch::child_command(
                    &task.name,
                    &prefix,
                    &self.options.self_invocation,
                    &task.name,
                    &task.id,
                    task.cache.root(),
                    &task.args_json,
                )?;

                Ok(Box::new(move || {
                    let span = span!(Level::INFO, "task", name = %name, id = %id, dispatched = true);
                    let _enter = span.enter();

                    let status = dispatch::run_child(&command, &stdout_path, &stderr_path);
                    let _ = sender.send(Completion {
                        index,
                        outcome: Outcome::Child(status),
                    });
                }))
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let index = completion.index;
        let task = TaskRef::of(
            self.dag.graph[index]
                .node
                .as_task()
                .expect("completions only come from tasks"),
        );

        self.in_flight -= 1;
        for slot in task.slots() {
            if let Some(count) = self.in_flight_slots.get_mut(slot) {
                *count = count.saturating_sub(1);
            }
        }
        self.stats.entry(index.index()).or_default().finished = Some(Instant::now());

        match completion.outcome {
            Outcome::Computed(Ok(value)) => {
                let stored = task.cache.store_value(
                    &task.name,
                    &task.id,
                    &value,
                    task.compress,
                    task.args_json.clone(),
                );
                match stored {
                    Ok(()) => {
                        self.values
                            .insert((task.name.clone(), task.id.clone()), value);
                        self.mark_done(index);
                    }
                    Err(err) => self.fail(&task.name, &task.id, err.into()),
                }
            }
            Outcome::Computed(Err(cause)) => self.fail(&task.name, &task.id, cause),
            Outcome::Child(Ok(status)) if status.success() => {
                if task.cache.has(&task.name, &task.id) {
                    self.mark_done(index);
                } else {
                    self.fail(
                        &task.name,
                        &task.id,
                        anyhow::anyhow!("child exited 0 without populating the cache entry"),
                    );
                }
            }
            Outcome::Child(Ok(status)) => {
                let stderr = task
                    .cache
                    .paths_for(&task.name, &task.id)
                    .map(|(_, path)| path.to_string())
                    .unwrap_or_default();
                self.fail(
                    &task.name,
                    &task.id,
                    anyhow::anyhow!("subprocess exited with {status}; see stderr at {stderr}"),
                );
            }
            Outcome::Child(Err(err)) => {
                if self.failure.is_none() {
                    self.failure = Some(RunError::Dispatch {
                        task_name: task.name.clone(),
                        task_id: task.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn run(&mut self) -> Result<(Value, RunStats), RunError> {
        let todo = self
            .states
            .iter()
            .zip(self.dag.graph.node_indices())
            .filter(|(state, index)| {
                **state != State::Done && self.dag.graph[*index].node.as_task().is_some()
            })
            .count() as u64;

        let root_span = span!(Level::INFO, "running_tasks");
        if let Ok(style) = crate::utils::get_style_run() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_length(todo);
        let root_span = root_span.entered();

        loop {
            if self.options.cancel.is_cancelled() && self.failure.is_none() {
                self.failure = Some(RunError::Interrupted);
            }

            self.dispatch_ready();

            if (self.root_done() || self.failure.is_some()) && self.in_flight == 0 {
                break;
            }

            if self.in_flight == 0 && self.failure.is_none() && !self.root_done() {
                // Validated limits always admit at least one ready task, so
                // an idle scheduler here is a broken invariant.
                self.failure = Some(RunError::Usage(UsageError::Other(
                    "scheduler stalled with no runnable task".to_string(),
                )));
                continue;
            }

            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(completion) => {
                    self.handle_completion(completion);
                    root_span.pb_inc(1);
                    while let Ok(more) = self.rx.try_recv() {
                        self.handle_completion(more);
                        root_span.pb_inc(1);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => unreachable!("scheduler holds a sender"),
            }
        }

        drop(root_span);
        self.executor.shutdown(true);

        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        tracing::info!("graph complete {}", crate::utils::as_overhead(self.started));

        let root = self.dag.graph[self.dag.root].clone();
        let value = {
            let values = &mut self.values;
            let mut lookup = |node: &TaskNode| task_value(values, node);
            resolve_with(&root, &mut lookup)
        }
        .map_err(|cause| {
            let (name, id) = match root.node.as_task() {
                Some(task) => (task.name.clone(), task.id.clone()),
                None => ("<aggregate>".to_string(), String::new()),
            };
            RunError::TaskFailed {
                task_name: name,
                task_id: id,
                cause,
            }
        })?;

        Ok((value, self.take_stats()))
    }

    fn take_stats(&mut self) -> RunStats {
        let mut tasks = BTreeMap::new();

        for (&index, cell) in &self.stats {
            let Some(origin) = cell.origin else { continue };
            let Some(task) = self.dag.graph[NodeIndex::new(index)].node.as_task() else {
                continue;
            };

            let since = |at: Option<Instant>| {
                at.map(|instant| instant.saturating_duration_since(self.started))
            };

            tasks.insert(
                (task.name.clone(), task.id.clone()),
                TaskStat {
                    origin,
                    slots: task.slots().map(str::to_string).collect(),
                    queued_at: since(cell.queued),
                    started_at: since(cell.started),
                    finished_at: since(cell.finished),
                },
            );
        }

        RunStats {
            tasks,
            elapsed: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::args::Plan;
    use crate::error::{ArgumentError, TaskResult};
    use crate::future::{Recipe, Task};

    fn open_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        (dir, cache)
    }

    #[derive(Clone)]
    struct Choose {
        n: u32,
        k: u32,
        calls: Arc<AtomicUsize>,
        salted: bool,
    }

    impl Choose {
        fn new(n: u32, k: u32) -> Self {
            Self {
                n,
                k,
                calls: Arc::new(AtomicUsize::new(0)),
                salted: false,
            }
        }

        fn child(&self, n: u32, k: u32) -> Self {
            Self {
                n,
                k,
                calls: Arc::clone(&self.calls),
                salted: self.salted,
            }
        }
    }

    impl Recipe for Choose {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "choose".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("n", &self.n)?;
            plan.literal("k", &self.k)?;
            // The salt perturbs one node's identity, standing in for an
            // edited body.
            if self.salted && self.n == 3 && self.k == 3 {
                plan.literal("salt", &1)?;
            }
            if 0 < self.k && self.k < self.n {
                plan.input("prev1", Task::build(plan.cache(), self.child(self.n - 1, self.k - 1))?)?;
                plan.input("prev2", Task::build(plan.cache(), self.child(self.n - 1, self.k))?)?;
            } else {
                plan.input("prev1", crate::future::Future::constant(0)?)?;
                plan.input("prev2", crate::future::Future::constant(1)?)?;
            }
            Ok(())
        }

        fn run(&self, ctx: &TaskContext<'_>) -> TaskResult<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let a: i64 = ctx.input("prev1")?;
            let b: i64 = ctx.input("prev2")?;
            Ok(a + b)
        }
    }

    #[test]
    fn test_binomial_end_to_end() {
        let (_dir, cache) = open_cache();
        let recipe = Choose::new(6, 3);
        let calls = Arc::clone(&recipe.calls);

        let root = Task::build(&cache, recipe).unwrap();
        let (answer, stats) = root.run_with_stats(RunOptions::new().workers(4)).unwrap();

        assert_eq!(answer, 20);
        // The recursion reaches 15 distinct (n, k) pairs from (6, 3).
        assert_eq!(stats.executed(), 15);
        assert_eq!(calls.load(Ordering::SeqCst), 15);
        assert_eq!(cache.entries("choose").unwrap().len(), 15);
    }

    #[test]
    fn test_rerun_invokes_no_bodies() {
        let (_dir, cache) = open_cache();
        let first = Choose::new(6, 3);
        let calls = Arc::clone(&first.calls);

        Task::build(&cache, first)
            .unwrap()
            .run(RunOptions::new())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 15);

        let again = Choose::new(6, 3);
        let calls_again = Arc::clone(&again.calls);
        let root = Task::build(&cache, again).unwrap();
        let (answer, stats) = root.run_with_stats(RunOptions::new()).unwrap();

        assert_eq!(answer, 20);
        assert_eq!(stats.executed(), 0);
        assert_eq!(calls_again.load(Ordering::SeqCst), 0);
        assert_eq!(stats.cache_hits(), 15);
    }

    #[test]
    fn test_identity_change_recomputes_descendants_only() {
        let (_dir, cache) = open_cache();
        Task::build(&cache, Choose::new(6, 3))
            .unwrap()
            .run(RunOptions::new())
            .unwrap();

        // Perturbing (3,3) changes its id and every id downstream of it:
        // (3,3), (4,3), (5,3), (6,3).
        let mut salted = Choose::new(6, 3);
        salted.salted = true;
        let calls = Arc::clone(&salted.calls);

        let root = Task::build(&cache, salted).unwrap();
        let (answer, stats) = root.run_with_stats(RunOptions::new()).unwrap();

        assert_eq!(answer, 20);
        assert_eq!(stats.executed(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_clear_is_selective() {
        let (_dir, cache) = open_cache();
        let root = Task::build(&cache, Choose::new(4, 2)).unwrap();
        root.run(RunOptions::new()).unwrap();

        let total = cache.entries("choose").unwrap().len();
        root.clear().unwrap();
        assert_eq!(cache.entries("choose").unwrap().len(), total - 1);

        root.clear_all().unwrap();
        assert_eq!(cache.entries("choose").unwrap().len(), 0);
    }

    #[derive(Clone)]
    struct Gpu {
        idx: u32,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Recipe for Gpu {
        type Output = u32;

        fn task_name() -> Cow<'static, str> {
            "gpu".into()
        }

        fn channels(&self) -> Vec<Cow<'static, str>> {
            vec!["gpu-slot".into()]
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("idx", &self.idx)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<u32> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(25));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.idx)
        }
    }

    #[test]
    fn test_channel_limit_serialises_siblings() {
        let (_dir, cache) = open_cache();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|idx| {
                Task::build(
                    &cache,
                    Gpu {
                        idx,
                        active: Arc::clone(&active),
                        peak: Arc::clone(&peak),
                    },
                )
                .unwrap()
            })
            .collect();

        let root = Future::list(tasks);
        let (values, _) = root
            .run_with_stats(RunOptions::new().workers(4).rate_limit("gpu-slot", 1))
            .unwrap();

        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_executor_bounds_concurrency() {
        let (_dir, cache) = open_cache();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|idx| {
                Task::build(
                    &cache,
                    Gpu {
                        idx,
                        active: Arc::clone(&active),
                        peak: Arc::clone(&peak),
                    },
                )
                .unwrap()
            })
            .collect();

        Future::list(tasks)
            .run(RunOptions::new().workers(2))
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_unknown_rate_limit_slot_rejected() {
        let (_dir, cache) = open_cache();
        let root = Task::build(&cache, Choose::new(2, 1)).unwrap();
        let err = root
            .run(RunOptions::new().rate_limit("nonexistent", 1))
            .unwrap_err();
        assert!(matches!(
            err,
            KarakuriError::Usage(UsageError::UnknownSlot(_))
        ));
    }

    struct Failing;

    impl Recipe for Failing {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "failing".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
            anyhow::bail!("boom")
        }
    }

    struct Slow;

    impl Recipe for Slow {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "slow".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
            std::thread::sleep(Duration::from_millis(120));
            Ok(1)
        }
    }

    #[test]
    fn test_failure_drains_in_flight_work() {
        let (_dir, cache) = open_cache();
        let failing = Task::build(&cache, Failing).unwrap();
        let slow = Task::build(&cache, Slow).unwrap();
        let slow_id = slow.task_id().unwrap().to_string();

        let root = Future::list(vec![failing, slow]);
        let err = root.run(RunOptions::new().workers(4)).unwrap_err();

        match err {
            KarakuriError::Run(RunError::TaskFailed {
                task_name, cause, ..
            }) => {
                assert_eq!(task_name, "failing");
                assert!(cause.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // The slow sibling finished during the drain and its entry stayed.
        assert!(cache.has("slow", &slow_id));
    }

    struct Panicking;

    impl Recipe for Panicking {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "panicking".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
            panic!("sky is falling")
        }
    }

    #[test]
    fn test_panic_is_a_task_failure() {
        let (_dir, cache) = open_cache();
        let root = Task::build(&cache, Panicking).unwrap();
        let err = root.run(RunOptions::new()).unwrap_err();

        match err {
            KarakuriError::Run(RunError::TaskFailed { cause, .. }) => {
                assert!(cause.to_string().contains("sky is falling"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_dir, cache) = open_cache();
        let token = CancelToken::new();
        token.cancel();

        let recipe = Choose::new(4, 2);
        let calls = Arc::clone(&recipe.calls);
        let root = Task::build(&cache, recipe).unwrap();

        let err = root
            .run(RunOptions::new().cancel_token(token))
            .unwrap_err();
        assert!(matches!(err, KarakuriError::Run(RunError::Interrupted)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[derive(Clone)]
    struct Multi;

    impl Recipe for Multi {
        type Output = BTreeMap<String, i64>;

        fn task_name() -> Cow<'static, str> {
            "multi".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<Self::Output> {
            Ok(BTreeMap::from([
                ("foo".to_string(), 42),
                ("bar".to_string(), 7),
            ]))
        }
    }

    struct Dep {
        dep: Future<i64>,
    }

    impl Recipe for Dep {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "dep".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.input("dep", self.dep.clone())
        }

        fn run(&self, ctx: &TaskContext<'_>) -> TaskResult<i64> {
            ctx.input("dep")
        }
    }

    #[test]
    fn test_index_future_end_to_end() {
        let (_dir, cache) = open_cache();
        let multi = Task::build(&cache, Multi).unwrap();

        let foo = Task::build(&cache, Dep { dep: multi.index("foo") }).unwrap();
        let bar = Task::build(&cache, Dep { dep: multi.index("bar") }).unwrap();
        assert_ne!(foo.task_id(), bar.task_id());

        assert_eq!(foo.run(RunOptions::new()).unwrap(), 42);
        assert_eq!(bar.run(RunOptions::new()).unwrap(), 7);

        // Loading the finished results straight from the cache.
        assert_eq!(foo.result().unwrap(), 42);
        assert_eq!(bar.result().unwrap(), 7);
    }

    struct Scratcher;

    impl Recipe for Scratcher {
        type Output = bool;

        fn task_name() -> Cow<'static, str> {
            "scratcher".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, ctx: &TaskContext<'_>) -> TaskResult<bool> {
            let empty = ctx.scratch().read_dir_utf8()?.next().is_none();
            std::fs::write(ctx.scratch().join("work"), b"data")?;

            use std::io::Write as _;
            writeln!(ctx.stdout(), "scratch was empty: {empty}")?;
            Ok(empty)
        }
    }

    #[test]
    fn test_scratch_empty_and_logs_captured() {
        let (_dir, cache) = open_cache();
        let root = Task::build(&cache, Scratcher).unwrap();
        let id = root.task_id().unwrap().to_string();

        assert!(root.run(RunOptions::new()).unwrap());

        let (stdout, _) = cache.paths_for("scratcher", &id).unwrap();
        let log = std::fs::read_to_string(stdout).unwrap();
        assert!(log.contains("scratch was empty: true"));

        // Recompute after clearing: the scratch dir is emptied again.
        root.clear().unwrap();
        let root = Task::build(&cache, Scratcher).unwrap();
        assert!(root.run(RunOptions::new()).unwrap());
    }

    #[cfg(unix)]
    struct Prefixed {
        script: String,
    }

    #[cfg(unix)]
    impl Recipe for Prefixed {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "prefixed".into()
        }

        fn prefix_command(&self) -> Option<Cow<'static, str>> {
            Some(format!("/bin/sh {}", self.script).into())
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("marker", &1)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
            anyhow::bail!("the body must run in the child, not in-process")
        }
    }

    /// A stand-in for the self-invoking CLI: reads `--task-name`,
    /// `--task-id` and `--cache` from its argv, populates the entry, and
    /// prints a line the parent should capture in `stdout.log`.
    #[cfg(unix)]
    const FAKE_WORKER: &str = r#"#!/bin/sh
name="$2"; id="$4"; cache="$6"
dir="$cache/entries/$name/$id"
mkdir -p "$dir/scratch"
printf '7' > "$dir/value.bin"
printf '{"codec_tag":"json","compress_level":null,"created_at":"2024-01-01T00:00:00Z","args_json":null}' > "$dir/meta.json"
echo "hello from the child"
"#;

    #[cfg(unix)]
    #[test]
    fn test_prefix_dispatch_populates_entry() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, cache) = open_cache();
        let script = dir.path().join("fake-worker.sh");
        std::fs::write(&script, FAKE_WORKER).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = Task::build(
            &cache,
            Prefixed {
                script: script.to_str().unwrap().to_string(),
            },
        )
        .unwrap();
        let id = root.task_id().unwrap().to_string();

        let (value, stats) = root.run_with_stats(RunOptions::new()).unwrap();
        assert_eq!(value, 7);
        assert_eq!(stats.dispatched(), 1);

        let (stdout, _) = cache.paths_for("prefixed", &id).unwrap();
        let log = std::fs::read_to_string(stdout).unwrap();
        assert!(log.contains("hello from the child"));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_failure_reports_status() {
        let (_dir, cache) = open_cache();

        struct BadChild;

        impl Recipe for BadChild {
            type Output = i64;

            fn task_name() -> Cow<'static, str> {
                "bad-child".into()
            }

            fn prefix_command(&self) -> Option<Cow<'static, str>> {
                Some("/bin/sh -c false --".into())
            }

            fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
                plan.literal("marker", &1)
            }

            fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
                anyhow::bail!("unreachable in-process")
            }
        }

        let root = Task::build(&cache, BadChild).unwrap();
        let err = root.run(RunOptions::new()).unwrap_err();

        match err {
            KarakuriError::Run(RunError::TaskFailed { cause, .. }) => {
                assert!(cause.to_string().contains("subprocess exited"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_const_root_resolves_without_dispatch() {
        let root: Future<i64> = Future::constant(5).unwrap();
        let (value, stats) = root.run_with_stats(RunOptions::new()).unwrap();
        assert_eq!(value, 5);
        assert_eq!(stats.executed(), 0);
    }
}
