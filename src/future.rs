use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Write as _};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::args::{ArgValue, FutureRef, Key, Plan};
use crate::cache::Cache;
use crate::error::{ArgumentError, KarakuriError, TaskResult, UsageError};

/// A handle for a value of type `T` produced now or later.
///
/// Futures compose into a directed acyclic graph: a [`Task`] depends on the
/// futures declared in its plan, aggregates group futures into lists and
/// dicts, and [`index`](Future::index) projects an element out of a future
/// container. Handles are cheap to clone and immutable after construction.
pub struct Future<T = Value> {
    pub(crate) node: Arc<Node>,
    _marker: PhantomData<fn() -> T>,
}

/// The untyped view the engine works with internally.
pub(crate) type UntypedFuture = Future<Value>;

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.node {
            Node::Task(task) => write!(f, "Future::Task({}/{})", task.name, task.id),
            Node::Const(_) => write!(f, "Future::Const"),
            Node::List(items) => write!(f, "Future::List(len={})", items.len()),
            Node::Dict(map) => write!(f, "Future::Dict(len={})", map.len()),
            Node::Item { key, .. } => write!(f, "Future::Item({key})"),
        }
    }
}

/// The tagged variant behind every future handle.
pub(crate) enum Node {
    Task(TaskNode),
    Const(ArgValue),
    List(Vec<UntypedFuture>),
    Dict(BTreeMap<String, UntypedFuture>),
    Item { base: UntypedFuture, key: Key },
}

impl Node {
    /// Direct upstream futures of this node.
    pub(crate) fn upstreams(&self) -> Vec<&UntypedFuture> {
        match self {
            Node::Task(task) => task.inputs.values().collect(),
            Node::Const(_) => Vec::new(),
            Node::List(items) => items.iter().collect(),
            Node::Dict(map) => map.values().collect(),
            Node::Item { base, .. } => vec![base],
        }
    }

    /// The fragment this node contributes to a downstream argument record.
    pub(crate) fn identity_fragment(&self) -> FutureRef {
        match self {
            Node::Task(task) => FutureRef::Task {
                name: task.name.clone(),
                id: task.id.clone(),
            },
            Node::Const(value) => FutureRef::Const(Box::new(value.clone())),
            Node::List(items) => FutureRef::List(
                items
                    .iter()
                    .map(|item| item.node.identity_fragment())
                    .collect(),
            ),
            Node::Dict(map) => FutureRef::Dict(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.node.identity_fragment()))
                    .collect(),
            ),
            Node::Item { base, key } => FutureRef::Item {
                base: Box::new(base.node.identity_fragment()),
                key: key.clone(),
            },
        }
    }

    pub(crate) fn as_task(&self) -> Option<&TaskNode> {
        match self {
            Node::Task(task) => Some(task),
            _ => None,
        }
    }
}

/// A user task vertex: identity, argument record, upstream slots, and the
/// type-erased body.
pub(crate) struct TaskNode {
    pub(crate) name: String,
    pub(crate) id: String,
    pub(crate) channels: Vec<String>,
    pub(crate) prefix: Option<String>,
    pub(crate) compress: Option<i32>,
    pub(crate) args_json: Value,
    pub(crate) inputs: BTreeMap<String, UntypedFuture>,
    pub(crate) body: Arc<dyn Body>,
    pub(crate) cache: Cache,
}

impl TaskNode {
    /// The slots this task occupies for rate limiting: its own type name
    /// plus every declared channel.
    pub(crate) fn slots(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.channels.iter().map(String::as_str))
    }
}

/// A user-defined unit of computation.
///
/// Implementations declare their argument record in [`plan`](Recipe::plan)
/// (literal configuration plus named upstream futures) and compute their
/// output in [`run`](Recipe::run). Two instances of the same recipe type
/// whose records canonicalise identically share a `task_id` and therefore a
/// cache slot.
///
/// # Example
///
/// ```rust,no_run
/// use karakuri::{Cache, Plan, Recipe, Task, TaskContext, TaskResult};
///
/// struct Double { n: i64 }
///
/// impl Recipe for Double {
///     type Output = i64;
///
///     fn task_name() -> std::borrow::Cow<'static, str> {
///         "double".into()
///     }
///
///     fn plan(&self, plan: &mut Plan<'_>) -> Result<(), karakuri::ArgumentError> {
///         plan.literal("n", &self.n)
///     }
///
///     fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
///         Ok(self.n * 2)
///     }
/// }
///
/// let cache = Cache::open(".cache/karakuri")?;
/// let fut = Task::build(&cache, Double { n: 21 })?;
/// # Ok::<(), karakuri::KarakuriError>(())
/// ```
pub trait Recipe: Send + Sync + 'static {
    /// The body's result type; round-trips through the value codec.
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Unique name of this task type, used as the cache partition key.
    /// Defaults to the fully-qualified type name.
    fn task_name() -> Cow<'static, str>
    where
        Self: Sized,
    {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Channels this task belongs to, for shared rate limits and prefixes.
    fn channels(&self) -> Vec<Cow<'static, str>> {
        Vec::new()
    }

    /// Prefix command wrapping the body in a subprocess (e.g. a job
    /// scheduler or container runtime). Takes precedence over any channel
    /// prefix configured on the run.
    fn prefix_command(&self) -> Option<Cow<'static, str>> {
        None
    }

    /// Compression level recorded in the entry metadata for codecs that
    /// honour it.
    fn compress_level(&self) -> Option<i32> {
        None
    }

    /// Declares the argument record: literals and upstream dependencies.
    fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError>;

    /// The task body. Runs once all upstream values have resolved; reads
    /// them back from the context by input name.
    fn run(&self, ctx: &TaskContext<'_>) -> TaskResult<Self::Output>;
}

/// Object-safe form of [`Recipe`] held by the graph.
pub(crate) trait Body: Send + Sync {
    fn run_erased(&self, ctx: &TaskContext<'_>) -> TaskResult<Value>;
}

// The bridge between the typed trait and the type-erased one.
impl<R: Recipe> Body for R {
    fn run_erased(&self, ctx: &TaskContext<'_>) -> TaskResult<Value> {
        let output = self.run(ctx)?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Namespace for task construction.
pub struct Task;

impl Task {
    /// Builds a task future from a recipe, bound to the given cache store.
    ///
    /// The recipe's plan is evaluated immediately: upstream tasks named in
    /// the plan are built recursively, and the `task_id` is derived from the
    /// canonical argument record before anything executes.
    pub fn build<R: Recipe>(cache: &Cache, recipe: R) -> Result<Future<R::Output>, ArgumentError> {
        let mut plan = Plan::new(cache);
        recipe.plan(&mut plan)?;

        let node = TaskNode {
            name: R::task_name().into_owned(),
            id: plan.task_id(),
            channels: recipe.channels().into_iter().map(Cow::into_owned).collect(),
            prefix: recipe.prefix_command().map(Cow::into_owned),
            compress: recipe.compress_level(),
            args_json: plan.args_json(),
            inputs: plan.inputs,
            body: Arc::new(recipe),
            cache: cache.clone(),
        };

        Ok(Future::from_node(Node::Task(node)))
    }
}

impl<T> Future<T> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            _marker: PhantomData,
        }
    }

    /// Forgets the output type. Useful for mixing futures of different
    /// types in one aggregate.
    pub fn untyped(&self) -> UntypedFuture {
        Future {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }

    /// The `task_name` of this future, if it is a task.
    pub fn task_name(&self) -> Option<&str> {
        self.node.as_task().map(|task| task.name.as_str())
    }

    /// The `task_id` of this future, if it is a task.
    pub fn task_id(&self) -> Option<&str> {
        self.node.as_task().map(|task| task.id.as_str())
    }

    /// The argument record as JSON, if this future is a task.
    pub fn task_args(&self) -> Option<&Value> {
        self.node.as_task().map(|task| &task.args_json)
    }

    /// Lazy index into this future's resolved container: an object field or
    /// an array position. The projection has its own identity derived from
    /// the base identity plus the key, so downstream tasks depending on
    /// different elements get different ids.
    pub fn index<U>(&self, key: impl Into<Key>) -> Future<U> {
        Future::from_node(Node::Item {
            base: self.untyped(),
            key: key.into(),
        })
    }

    /// Removes this task's cache entry. Siblings and neighbours remain.
    pub fn clear(&self) -> Result<(), KarakuriError> {
        let task = self
            .node
            .as_task()
            .ok_or_else(|| UsageError::Other("clear() requires a task future".into()))?;
        task.cache.drop_entry(&task.name, &task.id)?;
        Ok(())
    }

    /// Removes every cache entry of this task's type.
    pub fn clear_all(&self) -> Result<(), KarakuriError> {
        let task = self
            .node
            .as_task()
            .ok_or_else(|| UsageError::Other("clear_all() requires a task future".into()))?;
        task.cache.drop_all(&task.name)?;
        Ok(())
    }
}

impl<T: Serialize> Future<T> {
    /// Wraps an eagerly-known value. Constants are never cached; their
    /// value participates in downstream identities directly.
    pub fn constant(value: T) -> Result<Self, ArgumentError> {
        let json = serde_json::to_value(&value).map_err(|err| ArgumentError::Unrepresentable {
            name: "<const>".to_string(),
            reason: err.to_string(),
        })?;
        let value = ArgValue::from_json(&json)?;
        Ok(Future::from_node(Node::Const(value)))
    }
}

impl<T> Future<Vec<T>> {
    /// Groups an ordered sequence of futures. Resolves to the list of
    /// resolved children; neither cached nor executed itself.
    pub fn list(items: impl IntoIterator<Item = Future<T>>) -> Self {
        Future::from_node(Node::List(
            items.into_iter().map(|item| item.untyped()).collect(),
        ))
    }
}

impl<T> Future<BTreeMap<String, T>> {
    /// Groups a string-keyed mapping of futures. Resolves to the mapping of
    /// resolved children; neither cached nor executed itself.
    pub fn dict(items: impl IntoIterator<Item = (String, Future<T>)>) -> Self {
        Future::from_node(Node::Dict(
            items
                .into_iter()
                .map(|(key, value)| (key, value.untyped()))
                .collect(),
        ))
    }
}

impl<T: DeserializeOwned> Future<T> {
    /// Loads this future's resolved value from the cache without running
    /// anything. Every task reachable from here must already be cached.
    pub fn result(&self) -> TaskResult<T> {
        let value = resolve_with(&self.untyped(), &mut |task: &TaskNode| {
            Ok(task.cache.load_value(&task.name, &task.id)?)
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Resolves a future bottom-up. Task values come from `lookup`; constants,
/// aggregates, and projections resolve structurally.
pub(crate) fn resolve_with(
    future: &UntypedFuture,
    lookup: &mut dyn FnMut(&TaskNode) -> anyhow::Result<Value>,
) -> anyhow::Result<Value> {
    match &*future.node {
        Node::Task(task) => lookup(task),
        Node::Const(value) => Ok(value.to_json()),
        Node::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_with(item, lookup))
                .collect::<anyhow::Result<_>>()?,
        )),
        Node::Dict(map) => Ok(Value::Object(
            map.iter()
                .map(|(key, value)| Ok((key.clone(), resolve_with(value, lookup)?)))
                .collect::<anyhow::Result<_>>()?,
        )),
        Node::Item { base, key } => {
            let container = resolve_with(base, lookup)?;
            index_value(&container, key)
        }
    }
}

fn index_value(container: &Value, key: &Key) -> anyhow::Result<Value> {
    let found = match key {
        Key::Index(i) => container.get(*i),
        Key::Field(name) => container.get(name.as_str()),
    };
    found
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("resolved value has no element at {key}"))
}

/// The context handed to a task body.
///
/// Provides the resolved upstream values by input name, the entry's scratch
/// directory, and writers that land in the entry's `stdout.log` and
/// `stderr.log`.
pub struct TaskContext<'a> {
    pub(crate) inputs: &'a BTreeMap<String, Value>,
    pub(crate) scratch: &'a Utf8Path,
    pub(crate) stdout: LogHandle,
    pub(crate) stderr: LogHandle,
}

impl TaskContext<'_> {
    /// The resolved value of the named input, decoded into `T`.
    pub fn input<T: DeserializeOwned>(&self, name: &str) -> TaskResult<T> {
        let value = self
            .inputs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("task declares no input named '{name}'"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// The raw resolved value of the named input.
    pub fn input_value(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// A directory private to this task's cache entry. It lives as long as
    /// the entry and is empty whenever the body is about to (re)compute.
    pub fn scratch(&self) -> &Utf8Path {
        self.scratch
    }

    /// Writer into the entry's `stdout.log`.
    pub fn stdout(&self) -> LogWriter<'_> {
        self.stdout.writer()
    }

    /// Writer into the entry's `stderr.log`.
    pub fn stderr(&self) -> LogWriter<'_> {
        self.stderr.writer()
    }
}

/// Shared sink behind a task's log writers. In-process bodies write to the
/// entry's log files; in a prefix-dispatched child the real process streams
/// are already redirected there by the parent.
#[derive(Clone)]
pub(crate) struct LogHandle {
    inner: Arc<Mutex<LogSink>>,
}

pub(crate) enum LogSink {
    File(std::fs::File),
    Stdout,
    Stderr,
}

impl LogHandle {
    pub(crate) fn file(file: std::fs::File) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogSink::File(file))),
        }
    }

    pub(crate) fn stdout() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogSink::Stdout)),
        }
    }

    pub(crate) fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogSink::Stderr)),
        }
    }

    fn writer(&self) -> LogWriter<'_> {
        LogWriter(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Exclusive writer over a task log sink.
pub struct LogWriter<'a>(MutexGuard<'a, LogSink>);

impl io::Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.0 {
            LogSink::File(file) => file.write(buf),
            LogSink::Stdout => io::stdout().write(buf),
            LogSink::Stderr => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.0 {
            LogSink::File(file) => file.flush(),
            LogSink::Stdout => io::stdout().flush(),
            LogSink::Stderr => io::stderr().flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;

    struct Leaf {
        n: i64,
    }

    impl Recipe for Leaf {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "leaf".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("n", &self.n)
        }

        fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<i64> {
            Ok(self.n)
        }
    }

    struct Pair {
        dep: Future<i64>,
        label: String,
    }

    impl Recipe for Pair {
        type Output = i64;

        fn task_name() -> Cow<'static, str> {
            "pair".into()
        }

        fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
            plan.literal("label", &self.label)?;
            plan.input("dep", self.dep.clone())
        }

        fn run(&self, ctx: &TaskContext<'_>) -> TaskResult<i64> {
            ctx.input("dep")
        }
    }

    fn open_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_same_args_same_id() {
        let (_dir, cache) = open_cache();
        let a = Task::build(&cache, Leaf { n: 3 }).unwrap();
        let b = Task::build(&cache, Leaf { n: 3 }).unwrap();
        assert_eq!(a.task_id(), b.task_id());

        let c = Task::build(&cache, Leaf { n: 4 }).unwrap();
        assert_ne!(a.task_id(), c.task_id());
    }

    #[test]
    fn test_upstream_identity_propagates() {
        let (_dir, cache) = open_cache();
        let dep3 = Task::build(&cache, Leaf { n: 3 }).unwrap();
        let dep4 = Task::build(&cache, Leaf { n: 4 }).unwrap();

        let a = Task::build(
            &cache,
            Pair {
                dep: dep3,
                label: "x".into(),
            },
        )
        .unwrap();
        let b = Task::build(
            &cache,
            Pair {
                dep: dep4,
                label: "x".into(),
            },
        )
        .unwrap();

        assert_ne!(a.task_id(), b.task_id());
    }

    #[test]
    fn test_index_distinguishes_keys() {
        let (_dir, cache) = open_cache();
        let base = Task::build(&cache, Leaf { n: 1 }).unwrap();

        let foo: Future<i64> = base.index("foo");
        let bar: Future<i64> = base.index("bar");

        let a = Task::build(
            &cache,
            Pair {
                dep: foo,
                label: "x".into(),
            },
        )
        .unwrap();
        let b = Task::build(
            &cache,
            Pair {
                dep: bar,
                label: "x".into(),
            },
        )
        .unwrap();

        assert_ne!(a.task_id(), b.task_id());
    }

    #[test]
    fn test_const_future_in_identity() {
        let (_dir, cache) = open_cache();
        let a = Task::build(
            &cache,
            Pair {
                dep: Future::constant(0).unwrap(),
                label: "x".into(),
            },
        )
        .unwrap();
        let b = Task::build(
            &cache,
            Pair {
                dep: Future::constant(1).unwrap(),
                label: "x".into(),
            },
        )
        .unwrap();
        assert_ne!(a.task_id(), b.task_id());
    }

    #[test]
    fn test_reserved_names_rejected() {
        struct Bad;

        impl Recipe for Bad {
            type Output = ();

            fn task_name() -> Cow<'static, str> {
                "bad".into()
            }

            fn plan(&self, plan: &mut Plan<'_>) -> Result<(), ArgumentError> {
                plan.literal("task_queue", &1)
            }

            fn run(&self, _ctx: &TaskContext<'_>) -> TaskResult<()> {
                Ok(())
            }
        }

        let (_dir, cache) = open_cache();
        let err = Task::build(&cache, Bad).unwrap_err();
        assert!(matches!(err, ArgumentError::ReservedName(_)));
    }

    #[test]
    fn test_aggregate_upstreams() {
        let (_dir, cache) = open_cache();
        let a = Task::build(&cache, Leaf { n: 1 }).unwrap();
        let b = Task::build(&cache, Leaf { n: 2 }).unwrap();

        let list = Future::list(vec![a, b]);
        assert_eq!(list.node.upstreams().len(), 2);

        let dict = Future::dict(vec![("x".to_string(), Task::build(&cache, Leaf { n: 1 }).unwrap())]);
        assert_eq!(dict.node.upstreams().len(), 1);
    }

    #[test]
    fn test_resolve_structural() {
        let list: Future<Vec<i64>> = Future::list(vec![
            Future::constant(1).unwrap(),
            Future::constant(2).unwrap(),
        ]);
        let item: Future<i64> = list.index(1);

        let value = resolve_with(&item.untyped(), &mut |_task| {
            anyhow::bail!("no tasks in this graph")
        })
        .unwrap();
        assert_eq!(value, serde_json::json!(2));
    }
}
