use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::continuation::{self, PhaseToken};
use crate::error::Error;
use crate::graph::{self, EdgeId, WatcherSet};
use crate::ops::DebugEvent;
use crate::resource;
use crate::scheduler::Scheduler;
use crate::watch::WatchOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactionId(u64);

pub(crate) enum ReactionKind {
	Sync(Rc<dyn Fn()>),
	Async(Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>),
	Manual { on_invalidated: Rc<dyn Fn()> },
}

/// Cheap-clone handle over one registered computation. Identity is the
/// handle itself, not the closure it wraps.
#[derive(Clone)]
pub struct Reaction {
	body: Rc<ReactionBody>,
}

pub(crate) struct ReactionBody {
	id: ReactionId,
	inner: RefCell<ReactionInner>,
}

struct ReactionInner {
	options: WatchOptions,
	kind: ReactionKind,
	erased: bool,
	edges: FxHashMap<EdgeId, Weak<RefCell<WatcherSet>>>,
	phases: SmallVec<[Rc<PhaseToken>; 2]>,
	stop_subscribers: Vec<Box<dyn FnOnce()>>,
	suspended_runs: u8,
}

thread_local! {
	static REACTIONS: RefCell<FxHashMap<ReactionId, Reaction>> = RefCell::new(FxHashMap::default());
	static STACK: RefCell<Vec<Reaction>> = RefCell::new(Vec::new());
	static RESOLVERS: RefCell<Vec<Rc<dyn Fn() -> Option<Reaction>>>> = RefCell::new(Vec::new());
	static UNTRACKED_DEPTH: std::cell::Cell<usize> = std::cell::Cell::new(0);
	static ITERATION_DEPTH: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

impl Reaction {
	pub(crate) fn new(kind: ReactionKind, options: WatchOptions) -> Self {
		Reaction {
			body: Rc::new(ReactionBody {
				id: ReactionId(graph::next_id()),
				inner: RefCell::new(ReactionInner {
					options,
					kind,
					erased: false,
					edges: FxHashMap::default(),
					phases: SmallVec::new(),
					stop_subscribers: Vec::new(),
					suspended_runs: 0,
				}),
			}),
		}
	}

	pub fn id(&self) -> ReactionId {
		self.body.id
	}

	pub fn name(&self) -> &'static str {
		self.body.inner.borrow().options.name.unwrap_or("<unnamed>")
	}

	pub fn is_stopped(&self) -> bool {
		self.body.inner.borrow().erased
	}

	/// The opaque payload the reaction was registered with.
	pub fn context(&self) -> Option<Rc<dyn std::any::Any>> {
		self.body.inner.borrow().options.context.clone()
	}

	pub(crate) fn debug(&self) -> Option<Rc<dyn Fn(&DebugEvent)>> {
		self.body.inner.borrow().options.debug.clone()
	}

	pub(crate) fn scheduler(&self) -> Option<Rc<dyn Scheduler>> {
		self.body.inner.borrow().options.scheduler.clone()
	}

	/// Subscribes `callback` to this reaction's stop. Selectors use this
	/// for their watcher reference counts.
	pub(crate) fn on_stop(&self, callback: impl FnOnce() + 'static) {
		self.body
			.inner
			.borrow_mut()
			.stop_subscribers
			.push(Box::new(callback));
	}

	pub(crate) fn record_edge(&self, edge: EdgeId, set: Weak<RefCell<WatcherSet>>) {
		self.body.inner.borrow_mut().edges.insert(edge, set);
	}

	/// Releases every dependency edge this reaction currently holds.
	/// O(edges), not O(all tracked objects).
	pub(crate) fn clear_edges(&self) {
		let edges = std::mem::take(&mut self.body.inner.borrow_mut().edges);
		for set in edges.values() {
			graph::remove_edge(set, self.id());
		}
	}

	pub(crate) fn push_phase(&self, phase: Rc<PhaseToken>) {
		self.body.inner.borrow_mut().phases.push(phase);
	}

	pub(crate) fn finish_phase(&self, phase: &Rc<PhaseToken>) {
		self.body
			.inner
			.borrow_mut()
			.phases
			.retain(|p| !Rc::ptr_eq(p, phase));
	}

	/// Cancels every in-flight async phase. Invoked whenever the
	/// reaction is about to re-run; superseded continuations observe the
	/// flipped token and never apply their effects.
	pub(crate) fn cancel_phases(&self) {
		let phases = std::mem::take(&mut self.body.inner.borrow_mut().phases);
		for phase in phases {
			phase.cancel();
		}
	}

	pub(crate) fn note_suspended(&self) -> u8 {
		let mut inner = self.body.inner.borrow_mut();
		inner.suspended_runs += 1;
		inner.suspended_runs
	}

	pub(crate) fn reset_suspended(&self) {
		self.body.inner.borrow_mut().suspended_runs = 0;
	}

	/// One physical run. Dispatched by schedulers and by the flush loop.
	pub(crate) fn run(&self) {
		if self.is_stopped() {
			tracing::trace!(reaction = self.name(), "skipping run of stopped reaction");
			return;
		}
		let kind = {
			let inner = self.body.inner.borrow();
			match &inner.kind {
				ReactionKind::Sync(f) => ReactionKind::Sync(f.clone()),
				ReactionKind::Async(f) => ReactionKind::Async(f.clone()),
				ReactionKind::Manual { on_invalidated } => ReactionKind::Manual {
					on_invalidated: on_invalidated.clone(),
				},
			}
		};
		match kind {
			ReactionKind::Sync(f) => self.run_sync(&*f),
			ReactionKind::Async(factory) => continuation::spawn_run(self, factory),
			// A manual watch is never re-run by the engine; a dependency
			// change only notifies the owner.
			ReactionKind::Manual { on_invalidated } => on_invalidated(),
		}
	}

	fn run_sync(&self, body: &dyn Fn()) {
		let result = {
			let _guard = self.begin_run();
			catch_unwind(AssertUnwindSafe(body))
		};
		match result {
			Ok(()) => self.reset_suspended(),
			Err(payload) => {
				if payload.downcast_ref::<resource::SuspendMarker>().is_some() {
					resource::reaction_suspended(self, resource::take_pending_suspension());
				} else {
					resume_unwind(payload);
				}
			}
		}
	}

	/// Run `body` with attribution and fresh edges, returning its value.
	/// Used by manual watches; suspension is not supported here.
	pub(crate) fn run_value<R>(&self, body: impl FnOnce() -> R) -> R {
		let _guard = self.begin_run();
		body()
	}

	fn begin_run(&self) -> AttributionGuard {
		if is_on_stack(self) {
			panic!(
				"reaction '{}' invoked recursively while it is already running",
				self.name()
			);
		}
		self.cancel_phases();
		self.clear_edges();
		AttributionGuard::push(self.clone())
	}

	pub fn stop(&self) {
		stop(self);
	}
}

impl std::fmt::Debug for Reaction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reaction")
			.field("id", &self.body.id)
			.field("name", &self.name())
			.finish()
	}
}

/// Registers a freshly created reaction. Registering the same identity
/// twice is a usage error.
pub(crate) fn register(reaction: &Reaction) {
	REACTIONS.with(|reactions| {
		let previous = reactions
			.borrow_mut()
			.insert(reaction.id(), reaction.clone());
		if previous.is_some() {
			panic!("reaction '{}' is already registered", reaction.name());
		}
	});
}

pub(crate) fn is_registered(id: ReactionId) -> bool {
	REACTIONS.with(|reactions| reactions.borrow().contains_key(&id))
}

pub(crate) fn stop(reaction: &Reaction) {
	if reaction.is_stopped() {
		tracing::warn!(
			reaction = reaction.name(),
			"stop() called on an already stopped reaction"
		);
		return;
	}
	reaction.cancel_phases();
	reaction.clear_edges();
	let subscribers = {
		let mut inner = reaction.body.inner.borrow_mut();
		inner.erased = true;
		std::mem::take(&mut inner.stop_subscribers)
	};
	for subscriber in subscribers {
		subscriber();
	}
	REACTIONS.with(|reactions| {
		reactions.borrow_mut().remove(&reaction.id());
	});
}

/// Restarts a stopped reaction under its original identity.
pub(crate) fn reset(reaction: &Reaction) {
	if !reaction.is_stopped() {
		tracing::warn!(
			reaction = reaction.name(),
			"reset() called on a reaction that is still running"
		);
		return;
	}
	reaction.body.inner.borrow_mut().erased = false;
	register(reaction);
}

/// The reaction the current read should be attributed to: top of the
/// execution stack, else the first answer from a fallback resolver. A
/// don't-track scope suppresses both.
pub(crate) fn current() -> Option<Reaction> {
	if UNTRACKED_DEPTH.with(|depth| depth.get()) > 0 {
		return None;
	}
	let top = STACK.with(|stack| stack.borrow().last().cloned());
	if top.is_some() {
		return top;
	}
	let resolvers = RESOLVERS.with(|resolvers| resolvers.borrow().clone());
	for resolver in resolvers {
		if let Some(reaction) = resolver() {
			if !is_registered(reaction.id()) {
				panic!("reaction resolver returned an unregistered reaction");
			}
			return Some(reaction);
		}
	}
	None
}

pub(crate) fn is_on_stack(reaction: &Reaction) -> bool {
	STACK.with(|stack| stack.borrow().iter().any(|r| r.id() == reaction.id()))
}

pub(crate) fn stack_is_empty() -> bool {
	STACK.with(|stack| stack.borrow().is_empty())
}

/// Installs a fallback resolver consulted when a read happens outside
/// any running reaction. External adapters use this to attribute reads
/// made during their own render pass.
pub fn register_reaction_resolver(resolver: impl Fn() -> Option<Reaction> + 'static) {
	RESOLVERS.with(|resolvers| resolvers.borrow_mut().push(Rc::new(resolver)));
}

/// Runs `body` with dependency tracking suppressed.
pub fn untracked<R>(body: impl FnOnce() -> R) -> R {
	struct Guard;
	impl Drop for Guard {
		fn drop(&mut self) {
			UNTRACKED_DEPTH.with(|depth| depth.set(depth.get() - 1));
		}
	}
	UNTRACKED_DEPTH.with(|depth| depth.set(depth.get() + 1));
	let _guard = Guard;
	body()
}

pub(crate) fn in_iteration() -> bool {
	ITERATION_DEPTH.with(|depth| depth.get()) > 0
}

/// Suppresses per-key tracking while a bulk traversal runs. The bulk
/// operation registers a single structural read before raising this.
pub(crate) struct IterationGuard;

impl IterationGuard {
	pub(crate) fn new() -> Self {
		ITERATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
		IterationGuard
	}
}

impl Drop for IterationGuard {
	fn drop(&mut self) {
		ITERATION_DEPTH.with(|depth| depth.set(depth.get() - 1));
	}
}

/// Stack attribution for the duration of one run or one continuation
/// poll. Pops on drop, unwinding included.
pub(crate) struct AttributionGuard;

impl AttributionGuard {
	pub(crate) fn push(reaction: Reaction) -> Self {
		STACK.with(|stack| stack.borrow_mut().push(reaction));
		AttributionGuard
	}
}

impl Drop for AttributionGuard {
	fn drop(&mut self) {
		STACK.with(|stack| {
			stack.borrow_mut().pop();
		});
	}
}
