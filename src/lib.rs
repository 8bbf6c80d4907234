pub mod macros;
pub mod record;

mod batch;
mod continuation;
mod error;
mod graph;
mod list;
mod map;
mod ops;
mod registry;
mod resource;
mod runtime;
mod scheduler;
mod selector;
mod set;
mod track;
mod watch;

pub use batch::{batch, in_batch, sync, sync_every};
pub use error::{DynError, Error};
pub use graph::{NodeCommon, NodeId};
pub use list::TrackedList;
pub use map::TrackedMap;
pub use ops::{DebugEvent, MutationKind, ReadKind, TrackKey};
pub use registry::{register_reaction_resolver, untracked, Reaction, ReactionId};
pub use resource::{
	Completion, CompletionFuture, ReadError, Resource, ResourceResult, Suspended, UpdateStrategy,
};
pub use runtime::run_until_idle;
pub use scheduler::{
	create_async_scheduler, set_default_scheduler, Scheduler, SchedulerTask, SyncScheduler,
};
pub use selector::{selector, warm, Selector, SelectorOptions, Warmable};
pub use set::TrackedSet;
pub use track::{track, IntoTracked, Trackable};
pub use watch::{manual_watch, watch, watch_async, watch_deep, ManualWatch, Watch, WatchOptions};
