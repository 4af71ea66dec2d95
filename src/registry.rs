use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::args::literal_args;
use crate::cache::Cache;
use crate::error::{KarakuriError, RunError, UsageError};
use crate::future::{Future, LogHandle, Recipe, Task, TaskContext, TaskNode, resolve_with};

type BuildFn = Box<dyn Fn(&Value, &Cache) -> Result<Future, KarakuriError> + Send + Sync>;

/// Maps `task_name` to a reconstructor, so a task can be rebuilt from its
/// argument JSON in another process.
///
/// This is the engine-side surface for a CLI front-end: `run` and `clear`
/// commands instantiate root tasks through [`build`](Registry::build), and
/// prefix-dispatched children re-enter through
/// [`run_task`](Registry::run_task).
///
/// Reconstruction feeds the literal part of the recorded args back into the
/// recipe with serde, then re-evaluates its plan; literal names must match
/// the recipe's field names for this round trip to hold.
#[derive(Default)]
pub struct Registry {
    builders: BTreeMap<String, BuildFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reconstructible task type.
    pub fn register<R: Recipe + DeserializeOwned>(&mut self) -> &mut Self {
        let name = R::task_name().into_owned();
        self.builders.insert(
            name,
            Box::new(|args, cache| {
                let literals = literal_args(args);
                let recipe: R = serde_json::from_value(literals).map_err(|err| {
                    UsageError::Other(format!(
                        "cannot reconstruct '{}' from its literal args: {err}",
                        R::task_name()
                    ))
                })?;
                let future = Task::build(cache, recipe)?;
                Ok(future.untyped())
            }),
        );
        self
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.builders.contains_key(task_name)
    }

    /// Rebuilds the task future for `task_name` from its argument JSON.
    pub fn build(
        &self,
        task_name: &str,
        args_json: &Value,
        cache: &Cache,
    ) -> Result<Future, KarakuriError> {
        let builder = self
            .builders
            .get(task_name)
            .ok_or_else(|| UsageError::UnknownTask(task_name.to_string()))?;
        builder(args_json, cache)
    }

    /// The child half of prefix dispatch: rebuild the task, check that the
    /// identity matches what the parent scheduled, resolve its inputs from
    /// the cache, run the body, and persist the result.
    ///
    /// The caller (the CLI entry point) maps the returned result to the
    /// process exit status; the parent treats a populated entry plus exit 0
    /// as success.
    pub fn run_task(&self, args: &ChildArgs) -> Result<(), KarakuriError> {
        let cache = Cache::open(&args.cache)?;
        let future = self.build(&args.task_name, &args.args_json, &cache)?;

        let task = future
            .node
            .as_task()
            .ok_or_else(|| UsageError::Other("registry built a non-task future".to_string()))?;

        if task.id != args.task_id {
            return Err(UsageError::IdentityMismatch {
                task_name: task.name.clone(),
                expected: args.task_id.clone(),
                rebuilt: task.id.clone(),
            }
            .into());
        }

        // Upstream tasks were scheduled before this child; their entries
        // are in the cache.
        let mut inputs = BTreeMap::new();
        for (name, upstream) in &task.inputs {
            let value = resolve_with(upstream, &mut |node: &TaskNode| {
                Ok(node.cache.load_value(&node.name, &node.id)?)
            })
            .map_err(|cause| RunError::TaskFailed {
                task_name: task.name.clone(),
                task_id: task.id.clone(),
                cause: cause.context(format!("resolving input '{name}'")),
            })?;
            inputs.insert(name.clone(), value);
        }

        let scratch = cache.reset_scratch(&task.name, &task.id)?;

        // The parent already redirected this process's stdout and stderr
        // into the entry's log files.
        let ctx = TaskContext {
            inputs: &inputs,
            scratch: &scratch,
            stdout: LogHandle::stdout(),
            stderr: LogHandle::stderr(),
        };

        let value = task
            .body
            .run_erased(&ctx)
            .map_err(|cause| RunError::TaskFailed {
                task_name: task.name.clone(),
                task_id: task.id.clone(),
                cause,
            })?;

        cache.store_value(&task.name, &task.id, &value, task.compress, task.args_json.clone())?;
        Ok(())
    }
}

/// Parsed command line of a prefix-dispatched child:
/// `--task-name N --task-id I --cache PATH --args JSON`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildArgs {
    pub task_name: String,
    pub task_id: String,
    pub cache: String,
    pub args_json: Value,
}

impl ChildArgs {
    pub fn parse(argv: impl IntoIterator<Item = String>) -> Result<Self, UsageError> {
        let mut task_name = None;
        let mut task_id = None;
        let mut cache = None;
        let mut args_json = None;

        let mut argv = argv.into_iter();
        while let Some(flag) = argv.next() {
            let slot = match flag.as_str() {
                "--task-name" => &mut task_name,
                "--task-id" => &mut task_id,
                "--cache" => &mut cache,
                "--args" => &mut args_json,
                other => {
                    return Err(UsageError::Other(format!(
                        "unexpected argument '{other}' in task invocation"
                    )));
                }
            };
            *slot = Some(argv.next().ok_or_else(|| {
                UsageError::Other(format!("flag '{flag}' is missing its value"))
            })?);
        }

        let missing =
            |flag: &str| UsageError::Other(format!("task invocation is missing '{flag}'"));

        let args_json = match args_json {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|err| UsageError::Other(format!("unparsable --args payload: {err}")))?,
            None => return Err(missing("--args")),
        };

        Ok(Self {
            task_name: task_name.ok_or_else(|| missing("--task-name"))?,
            task_id: task_id.ok_or_else(|| missing("--task-id"))?,
            cache: cache.ok_or_else(|| missing("--cache"))?,
            args_json,
        })
    }
}
