use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::batch;
use crate::graph::Impacted;
use crate::registry::{self, Reaction, ReactionId};
use crate::runtime;

/// Policy deciding when a triggered reaction actually executes.
pub trait Scheduler {
	fn schedule(&self, reaction: Reaction);
}

/// Runs every triggered reaction immediately. The process-wide default.
pub struct SyncScheduler;

impl Scheduler for SyncScheduler {
	fn schedule(&self, reaction: Reaction) {
		reaction.run();
	}
}

thread_local! {
	static DEFAULT: RefCell<Rc<dyn Scheduler>> = RefCell::new(Rc::new(SyncScheduler));
}

pub fn set_default_scheduler(scheduler: Rc<dyn Scheduler>) {
	DEFAULT.with(|default| *default.borrow_mut() = scheduler);
}

fn default_scheduler() -> Rc<dyn Scheduler> {
	DEFAULT.with(|default| default.borrow().clone())
}

pub(crate) fn dispatch(reaction: &Reaction) {
	let scheduler = reaction.scheduler().unwrap_or_else(default_scheduler);
	scheduler.schedule(reaction.clone());
}

/// Entry point for "this reaction's data changed". Applies the
/// re-entrancy guard, supersedes in-flight continuations and routes the
/// reaction through the active scopes.
pub(crate) fn trigger(reaction: &Reaction) {
	if reaction.is_stopped() {
		return;
	}
	// Phases are superseded even when the reaction is physically running:
	// the mutation invalidates a dependency its in-flight run already read.
	reaction.cancel_phases();
	if registry::is_on_stack(reaction) {
		// A physically running reaction is never re-triggered mid-run;
		// its current run will rediscover the dependency.
		return;
	}
	tracing::trace!(reaction = reaction.name(), "triggered");
	batch::enqueue(reaction);
}

pub(crate) fn trigger_all(impacted: &Impacted) {
	for reaction in impacted.iter() {
		trigger(reaction);
	}
}

pub type SchedulerTask = Box<dyn FnOnce()>;

/// A scheduler that coalesces every reaction scheduled before its
/// deferred task runs into one batched flush. `wrapper` intercepts the
/// flush thunk; by default it is handed to the local executor.
pub fn create_async_scheduler(wrapper: Option<Rc<dyn Fn(SchedulerTask)>>) -> Rc<dyn Scheduler> {
	Rc::new_cyclic(|this: &Weak<AsyncScheduler>| AsyncScheduler {
		this: this.clone(),
		pending: RefCell::new(IndexMap::default()),
		armed: Cell::new(false),
		wrapper,
	})
}

struct AsyncScheduler {
	this: Weak<AsyncScheduler>,
	pending: RefCell<IndexMap<ReactionId, Reaction, fxhash::FxBuildHasher>>,
	armed: Cell<bool>,
	wrapper: Option<Rc<dyn Fn(SchedulerTask)>>,
}

impl Scheduler for AsyncScheduler {
	fn schedule(&self, reaction: Reaction) {
		self.pending.borrow_mut().insert(reaction.id(), reaction);
		if self.armed.replace(true) {
			return;
		}
		let this = self.this.clone();
		let task: SchedulerTask = Box::new(move || {
			let Some(this) = this.upgrade() else {
				return;
			};
			this.armed.set(false);
			let pending = std::mem::take(&mut *this.pending.borrow_mut());
			batch::batch(|| {
				for (_, reaction) in pending {
					reaction.run();
				}
			});
		});
		match &self.wrapper {
			Some(wrapper) => wrapper(task),
			None => runtime::defer(task),
		}
	}
}
