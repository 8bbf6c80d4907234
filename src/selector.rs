use std::cell::{Ref, RefCell};
use std::future::Future;
use std::rc::Rc;

use fxhash::FxHashSet;

use crate::error::Error;
use crate::graph::WatcherSet;
use crate::registry::{self, Reaction, ReactionId, ReactionKind};
use crate::resource::{
	self, CompletionFuture, ReadError, Resource, ResourceResult, UpdateStrategy,
};
use crate::scheduler;
use crate::watch::WatchOptions;

pub struct SelectorOptions {
	pub watch: WatchOptions,
	pub update_strategy: UpdateStrategy,
	pub on_silent_update: Option<Rc<dyn Fn()>>,
}

impl Default for SelectorOptions {
	fn default() -> Self {
		SelectorOptions {
			watch: WatchOptions::default(),
			update_strategy: UpdateStrategy::Reset,
			on_silent_update: None,
		}
	}
}

/// A derived, dependency-tracked resource: the getter's reads are
/// watched and each change re-evaluates the slot per the configured
/// update strategy.
pub struct Selector<T: 'static> {
	body: Rc<SelectorBody<T>>,
}

impl<T> Clone for Selector<T> {
	fn clone(&self) -> Self {
		Selector {
			body: self.body.clone(),
		}
	}
}

struct SelectorBody<T: 'static> {
	resource: Resource<T>,
	watchers: Rc<RefCell<WatcherSet>>,
	state: RefCell<SelectorState>,
	watch_options: RefCell<WatchOptions>,
	lazy: bool,
	strategy: UpdateStrategy,
	name: Option<&'static str>,
}

struct SelectorState {
	reaction: Option<Reaction>,
	watcher_count: usize,
	counted: FxHashSet<ReactionId>,
	ever_read: bool,
}

pub fn selector<T: 'static>(
	getter: impl Fn() -> ResourceResult<T> + 'static,
	options: SelectorOptions,
) -> Selector<T> {
	let resource = Resource::new(getter);
	if let Some(callback) = options.on_silent_update {
		resource.set_on_silent_update(callback);
	}
	let body = Rc::new(SelectorBody {
		resource: resource.clone(),
		watchers: WatcherSet::new(),
		state: RefCell::new(SelectorState {
			reaction: None,
			watcher_count: 0,
			counted: FxHashSet::default(),
			ever_read: false,
		}),
		lazy: options.watch.lazy,
		strategy: options.update_strategy,
		name: options.watch.name,
		watch_options: RefCell::new(options.watch),
	});
	let weak = Rc::downgrade(&body);
	resource.set_on_settle(Rc::new(move || {
		if let Some(body) = weak.upgrade() {
			SelectorBody::on_settle(&body);
		}
	}));
	let selector = Selector { body };
	if !selector.body.lazy {
		SelectorBody::ensure_watching(&selector.body);
	}
	selector
}

impl<T: 'static> Selector<T> {
	fn name(&self) -> &'static str {
		self.body.name.unwrap_or("<selector>")
	}

	/// The selector's value. Inside a reaction an unresolved value
	/// suspends the reaction; a captured failure panics with the
	/// original error.
	pub fn value(&self) -> Ref<'_, T> {
		match self.try_value() {
			Ok(value) => value,
			Err(ReadError::NotReady(suspended)) => {
				if registry::current().is_some() {
					resource::suspend(suspended.completion)
				}
				panic!(
					"selector '{}' is not ready; use try_value() or promise() outside a reaction",
					self.name()
				)
			}
			Err(ReadError::Failed(error)) => {
				panic!("selector '{}' failed: {}", self.name(), error)
			}
		}
	}

	pub fn try_value(&self) -> Result<Ref<'_, T>, ReadError> {
		SelectorBody::track_read(&self.body);
		self.body.resource.read()
	}

	pub fn is_ready(&self) -> bool {
		self.body.resource.is_ready()
	}

	/// The value as a future. Tracks a dependency when awaited from an
	/// async reaction.
	pub fn promise(&self) -> impl Future<Output = Result<T, Error>> + 'static
	where
		T: Clone,
	{
		enum Step<T> {
			Done(Result<T, Error>),
			Wait(CompletionFuture),
		}
		let body = self.body.clone();
		async move {
			loop {
				let step = {
					SelectorBody::track_read(&body);
					match body.resource.read() {
						Ok(value) => Step::Done(Ok(value.clone())),
						Err(ReadError::NotReady(suspended)) => Step::Wait(suspended.wait()),
						Err(ReadError::Failed(error)) => Step::Done(Err(Error::Failed(error))),
					}
				};
				match step {
					Step::Done(result) => return result,
					Step::Wait(wait) => wait.await,
				}
			}
		}
	}
}

impl<T: 'static> SelectorBody<T> {
	/// Arms the internal dependency-watching reaction. Lazy selectors
	/// call this on first read.
	fn ensure_watching(body: &Rc<Self>) {
		if body.state.borrow().reaction.is_some() {
			return;
		}
		let weak = Rc::downgrade(body);
		let mut options = body.watch_options.borrow().clone();
		options.lazy = false;
		options.allow_nested = true;
		let reaction = Reaction::new(
			ReactionKind::Sync(Rc::new(move || {
				if let Some(body) = weak.upgrade() {
					body.resource.refresh(body.strategy);
				}
			})),
			options,
		);
		registry::register(&reaction);
		body.state.borrow_mut().reaction = Some(reaction.clone());
		reaction.run();
	}

	fn stop_watching(&self) {
		if let Some(reaction) = self.state.borrow_mut().reaction.take() {
			reaction.stop();
		}
	}

	/// Registers the reading reaction as a watcher and keeps the
	/// reference count that drives lazy start/stop.
	fn track_read(body: &Rc<Self>) {
		Self::ensure_watching(body);
		body.state.borrow_mut().ever_read = true;
		let Some(reader) = registry::current() else {
			return;
		};
		WatcherSet::add(&body.watchers, &reader);
		let mut state = body.state.borrow_mut();
		if state.counted.insert(reader.id()) {
			state.watcher_count += 1;
			let weak = Rc::downgrade(body);
			let reader_id = reader.id();
			reader.on_stop(move || {
				if let Some(body) = weak.upgrade() {
					SelectorBody::reader_stopped(&body, reader_id);
				}
			});
		}
	}

	fn reader_stopped(body: &Rc<Self>, id: ReactionId) {
		let stop = {
			let mut state = body.state.borrow_mut();
			if state.counted.remove(&id) {
				state.watcher_count -= 1;
			}
			state.watcher_count == 0 && body.lazy
		};
		if stop {
			body.stop_watching();
		}
	}

	/// The resource settled (initial resolve, reset recompute, or a
	/// rejection): re-run every reader. Runs inside the settle batch,
	/// so a reader that also subscribed a retry runs exactly once.
	fn on_settle(body: &Rc<Self>) {
		if body.resource.has_failed() && !body.lazy && !body.state.borrow().ever_read {
			tracing::warn!(
				selector = body.name.unwrap_or("<selector>"),
				"selector rejected before it was ever read"
			);
		}
		let watchers = body.watchers.borrow().snapshot();
		for reaction in &watchers {
			scheduler::trigger(reaction);
		}
	}
}

impl<T: 'static> Drop for SelectorBody<T> {
	fn drop(&mut self) {
		if let Some(reaction) = self.state.borrow_mut().reaction.take() {
			reaction.stop();
		}
	}
}

/// Type-erased view of a selector used by [`warm`].
pub trait Warmable {
	/// Starts the computation without tracking and returns the pending
	/// outcome, if any.
	fn prefetch(&self) -> Option<CompletionFuture>;
}

impl<T: 'static> Warmable for Selector<T> {
	fn prefetch(&self) -> Option<CompletionFuture> {
		registry::untracked(|| {
			SelectorBody::ensure_watching(&self.body);
			match self.body.resource.read() {
				Err(ReadError::NotReady(suspended)) => Some(suspended.wait()),
				_ => None,
			}
		})
	}
}

/// Evaluates several selectors concurrently, collecting every pending
/// outcome so the caller waits for all of them at once instead of
/// retrying serially.
pub fn warm<'a>(selectors: impl IntoIterator<Item = &'a dyn Warmable>) -> impl Future<Output = ()> {
	let waits: Vec<_> = selectors
		.into_iter()
		.filter_map(|selector| selector.prefetch())
		.collect();
	async move {
		futures::future::join_all(waits).await;
	}
}
