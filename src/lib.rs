#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod args;
mod cache;
mod codec;
mod dispatch;
mod error;
mod executor;
mod future;
mod graph;
mod registry;
mod scheduler;
mod utils;

pub use crate::args::{Key, Plan};
pub use crate::cache::{Cache, EntryMeta};
pub use crate::codec::{JsonCodec, ValueCodec};
pub use crate::error::{
    ArgumentError, CacheError, GraphCycleError, KarakuriError, RunError, TaskResult, UsageError,
};
pub use crate::executor::{Executor, Job, ThreadPoolExecutor};
pub use crate::future::{Future, LogWriter, Recipe, Task, TaskContext};
pub use crate::registry::{ChildArgs, Registry};
pub use crate::scheduler::{
    CancelToken, Origin, RunOptions, RunStats, TaskStat, run_graph,
};
pub use crate::utils::init_logging;
