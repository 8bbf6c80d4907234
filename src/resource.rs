use std::cell::{Cell, Ref, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::LocalBoxFuture;

use crate::batch;
use crate::error::DynError;
use crate::registry::Reaction;
use crate::runtime;
use crate::scheduler;

/// What a resource getter may produce: a value, a synchronous failure,
/// or a pending computation.
pub enum ResourceResult<T> {
	Ready(T),
	Failed(DynError),
	Pending(LocalBoxFuture<'static, Result<T, DynError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
	/// Patch the cached value in place; readers keep seeing the previous
	/// value until the new one lands and are not re-triggered.
	Silent,
	/// Discard the cached value and recompute from scratch.
	Reset,
}

/// Settle latch shared between a pending computation and everyone
/// observing it: suspended reactions, `promise()` futures, `warm`.
pub struct Completion {
	done: Cell<bool>,
	wakers: RefCell<Vec<Waker>>,
	callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Completion {
	pub(crate) fn new() -> Rc<Self> {
		Rc::new(Completion {
			done: Cell::new(false),
			wakers: RefCell::new(Vec::new()),
			callbacks: RefCell::new(Vec::new()),
		})
	}

	pub(crate) fn finish(&self) {
		if self.done.replace(true) {
			return;
		}
		let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
		let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
		for callback in callbacks {
			callback();
		}
		for waker in wakers {
			waker.wake();
		}
	}

	pub(crate) fn subscribe(&self, callback: impl FnOnce() + 'static) {
		if self.done.get() {
			callback();
		} else {
			self.callbacks.borrow_mut().push(Box::new(callback));
		}
	}

	pub(crate) fn is_done(&self) -> bool {
		self.done.get()
	}
}

pub struct CompletionFuture(Rc<Completion>);

impl Future for CompletionFuture {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		if self.0.done.get() {
			Poll::Ready(())
		} else {
			self.0.wakers.borrow_mut().push(cx.waker().clone());
			Poll::Pending
		}
	}
}

/// The "not ready yet" signal, with the in-flight outcome attached for
/// outside observation.
pub struct Suspended {
	pub(crate) completion: Rc<Completion>,
}

impl Suspended {
	pub fn wait(&self) -> CompletionFuture {
		CompletionFuture(self.completion.clone())
	}

	pub fn is_settled(&self) -> bool {
		self.completion.is_done()
	}
}

impl std::fmt::Debug for Suspended {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Suspended").finish()
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("value is not ready yet")]
	NotReady(Suspended),
	#[error("computation failed: {0}")]
	Failed(DynError),
}

/// Payload of the control-flow panic a suspended read raises. The
/// attached outcome travels through a thread-local slot because panic
/// payloads must be `Send`.
pub(crate) struct SuspendMarker;

thread_local! {
	static PENDING_SUSPENSION: RefCell<Option<Rc<Completion>>> = RefCell::new(None);
}

static QUIET_HOOK: std::sync::Once = std::sync::Once::new();

pub(crate) fn suspend(completion: Rc<Completion>) -> ! {
	QUIET_HOOK.call_once(|| {
		let previous = std::panic::take_hook();
		std::panic::set_hook(Box::new(move |info| {
			if info.payload().downcast_ref::<SuspendMarker>().is_none() {
				previous(info);
			}
		}));
	});
	PENDING_SUSPENSION.with(|slot| *slot.borrow_mut() = Some(completion));
	std::panic::panic_any(SuspendMarker)
}

pub(crate) fn take_pending_suspension() -> Rc<Completion> {
	PENDING_SUSPENSION
		.with(|slot| slot.borrow_mut().take())
		.unwrap_or_else(|| panic!("suspension marker raised without a pending outcome"))
}

const MAX_CONSECUTIVE_SUSPENSIONS: u8 = 5;

/// A reaction run ended in a suspension: schedule a retry once the
/// outcome settles. Consecutive suspensions are capped; a pending
/// outcome that regenerates itself on every attempt is a programming
/// error.
pub(crate) fn reaction_suspended(reaction: &Reaction, completion: Rc<Completion>) {
	let attempts = reaction.note_suspended();
	if attempts > MAX_CONSECUTIVE_SUSPENSIONS {
		panic!(
			"reaction '{}' suspended {} times in a row; every retry produced a new pending value",
			reaction.name(),
			attempts
		);
	}
	tracing::trace!(
		reaction = reaction.name(),
		attempts,
		"reaction suspended, retry scheduled"
	);
	let reaction = reaction.clone();
	completion.subscribe(move || scheduler::trigger(&reaction));
}

enum State<T> {
	Unstarted,
	Pending(Rc<Completion>),
	Updating {
		previous: T,
		completion: Rc<Completion>,
	},
	Resolved(T),
	Rejected(DynError),
}

/// Single-slot cache around a possibly-asynchronous computation.
pub struct Resource<T: 'static> {
	body: Rc<ResourceBody<T>>,
}

struct ResourceBody<T> {
	getter: Box<dyn Fn() -> ResourceResult<T>>,
	state: RefCell<State<T>>,
	generation: Cell<u64>,
	on_silent_update: RefCell<Option<Rc<dyn Fn()>>>,
	on_settle: RefCell<Option<Rc<dyn Fn()>>>,
}

impl<T> Clone for Resource<T> {
	fn clone(&self) -> Self {
		Resource {
			body: self.body.clone(),
		}
	}
}

impl<T: 'static> Resource<T> {
	pub fn new(getter: impl Fn() -> ResourceResult<T> + 'static) -> Self {
		Resource {
			body: Rc::new(ResourceBody {
				getter: Box::new(getter),
				state: RefCell::new(State::Unstarted),
				generation: Cell::new(0),
				on_silent_update: RefCell::new(None),
				on_settle: RefCell::new(None),
			}),
		}
	}

	pub(crate) fn set_on_settle(&self, callback: Rc<dyn Fn()>) {
		*self.body.on_settle.borrow_mut() = Some(callback);
	}

	pub(crate) fn set_on_silent_update(&self, callback: Rc<dyn Fn()>) {
		*self.body.on_silent_update.borrow_mut() = Some(callback);
	}

	pub fn is_started(&self) -> bool {
		!matches!(&*self.body.state.borrow(), State::Unstarted)
	}

	pub fn is_ready(&self) -> bool {
		matches!(
			&*self.body.state.borrow(),
			State::Resolved(_) | State::Updating { .. }
		)
	}

	pub(crate) fn has_failed(&self) -> bool {
		matches!(&*self.body.state.borrow(), State::Rejected(_))
	}

	/// Synchronous read: the cached value, the captured failure, or the
	/// "not ready" signal. Starts the getter on first use.
	pub fn read(&self) -> Result<Ref<'_, T>, ReadError> {
		self.start_if_needed();
		let state = self.body.state.borrow();
		match &*state {
			State::Resolved(_) | State::Updating { .. } => Ok(Ref::map(state, |state| match state {
				State::Resolved(value) => value,
				State::Updating { previous, .. } => previous,
				_ => unreachable!(),
			})),
			State::Pending(completion) => Err(ReadError::NotReady(Suspended {
				completion: completion.clone(),
			})),
			State::Rejected(error) => Err(ReadError::Failed(error.clone())),
			State::Unstarted => unreachable!("resource was just started"),
		}
	}

	/// Re-evaluation entry used when a dependency of the getter changed.
	pub fn refresh(&self, strategy: UpdateStrategy) {
		if !self.is_started() {
			self.start_if_needed();
			return;
		}
		match strategy {
			UpdateStrategy::Reset => {
				self.reset();
				self.start_if_needed();
			}
			UpdateStrategy::Silent => self.update_silent(),
		}
	}

	pub fn update(&self, strategy: UpdateStrategy) {
		match strategy {
			UpdateStrategy::Reset => self.reset(),
			UpdateStrategy::Silent => self.update_silent(),
		}
	}

	/// Discards the slot. Any in-flight computation is superseded and
	/// suspended readers are released so they retry from scratch.
	pub fn reset(&self) {
		self.bump_generation();
		let completion = {
			let mut state = self.body.state.borrow_mut();
			let completion = Self::live_completion(&state);
			*state = State::Unstarted;
			completion
		};
		if let Some(completion) = completion {
			batch::batch(|| completion.finish());
		}
	}

	fn start_if_needed(&self) {
		if self.is_started() {
			return;
		}
		let generation = self.bump_generation();
		match (self.body.getter)() {
			// Synchronous outcomes settle immediately so watchers of the
			// previous value are re-triggered.
			ResourceResult::Ready(value) => {
				ResourceBody::settle(&self.body, Ok(value), false);
			}
			ResourceResult::Failed(error) => {
				ResourceBody::settle(&self.body, Err(error), false);
			}
			ResourceResult::Pending(future) => {
				let completion = Completion::new();
				*self.body.state.borrow_mut() = State::Pending(completion);
				self.drive(future, generation, false);
			}
		}
	}

	fn update_silent(&self) {
		let generation = self.bump_generation();
		match (self.body.getter)() {
			ResourceResult::Ready(value) => {
				let completion = {
					let mut state = self.body.state.borrow_mut();
					let completion = Self::live_completion(&state);
					*state = State::Resolved(value);
					completion
				};
				batch::batch(|| {
					if let Some(callback) = self.body.on_silent_update.borrow().clone() {
						callback();
					}
					if let Some(completion) = completion {
						completion.finish();
					}
				});
			}
			ResourceResult::Failed(error) => {
				ResourceBody::settle(&self.body, Err(error), false);
			}
			ResourceResult::Pending(future) => {
				{
					let mut state = self.body.state.borrow_mut();
					// Keep serving the previous value while updating and
					// keep any previous latch alive for its observers.
					let taken = std::mem::replace(&mut *state, State::Unstarted);
					*state = match taken {
						State::Resolved(previous) => State::Updating {
							previous,
							completion: Completion::new(),
						},
						State::Updating {
							previous,
							completion,
						} => State::Updating {
							previous,
							completion,
						},
						State::Pending(completion) => State::Pending(completion),
						State::Unstarted | State::Rejected(_) => {
							State::Pending(Completion::new())
						}
					};
				}
				self.drive(future, generation, true);
			}
		}
	}

	fn drive(
		&self,
		future: LocalBoxFuture<'static, Result<T, DynError>>,
		generation: u64,
		silent: bool,
	) {
		let weak = Rc::downgrade(&self.body);
		runtime::spawn(async move {
			let result = future.await;
			let Some(body) = weak.upgrade() else {
				return;
			};
			if body.generation.get() != generation {
				// Superseded by a later update; never apply.
				return;
			}
			ResourceBody::settle(&body, result, silent);
		});
	}

	fn bump_generation(&self) -> u64 {
		let next = self.body.generation.get() + 1;
		self.body.generation.set(next);
		next
	}

	fn live_completion(state: &State<T>) -> Option<Rc<Completion>> {
		match state {
			State::Pending(completion) | State::Updating { completion, .. } => {
				Some(completion.clone())
			}
			_ => None,
		}
	}
}

impl<T: 'static> ResourceBody<T> {
	fn settle(body: &Rc<Self>, result: Result<T, DynError>, silent: bool) {
		let succeeded = result.is_ok();
		// One batch so a retry subscription and a watcher trigger for
		// the same reaction collapse into a single run.
		batch::batch(|| {
			let completion = {
				let mut state = body.state.borrow_mut();
				let completion = Resource::live_completion(&state);
				*state = match result {
					Ok(value) => State::Resolved(value),
					Err(error) => State::Rejected(error),
				};
				completion
			};
			if silent && succeeded {
				if let Some(callback) = body.on_silent_update.borrow().clone() {
					callback();
				}
			} else if let Some(callback) = body.on_settle.borrow().clone() {
				callback();
			}
			if let Some(completion) = completion {
				completion.finish();
			}
		});
	}
}
