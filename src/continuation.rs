use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::error::Error;
use crate::registry::{self, Reaction};
use crate::runtime;

/// Cancellable token owned by one in-flight async run of a reaction.
/// Flipped when the reaction is superseded; the continuation wrapper
/// checks it before resuming, so stale effects are never applied.
pub(crate) struct PhaseToken {
	cancelled: Cell<bool>,
}

impl PhaseToken {
	fn new() -> Rc<Self> {
		Rc::new(PhaseToken {
			cancelled: Cell::new(false),
		})
	}

	pub(crate) fn cancel(&self) {
		self.cancelled.set(true);
	}

	fn is_cancelled(&self) -> bool {
		self.cancelled.get()
	}
}

/// One run of an async reaction: build the future, attach a fresh
/// phase, hand it to the local executor.
pub(crate) fn spawn_run(
	reaction: &Reaction,
	factory: Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>,
) {
	reaction.cancel_phases();
	reaction.clear_edges();
	let phase = PhaseToken::new();
	reaction.push_phase(phase.clone());
	let inner = factory();
	runtime::spawn(Continuation {
		reaction: reaction.clone(),
		phase,
		inner,
	});
}

/// The explicit continuation-registration hook: every poll is one
/// continuation. Before resuming we check that the reaction is still
/// alive and the phase was not cancelled; while the inner future runs,
/// reads attribute to the owning reaction.
struct Continuation {
	reaction: Reaction,
	phase: Rc<PhaseToken>,
	inner: LocalBoxFuture<'static, Result<(), Error>>,
}

impl Future for Continuation {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		let this = self.get_mut();
		if this.reaction.is_stopped() || this.phase.is_cancelled() {
			tracing::trace!(
				reaction = this.reaction.name(),
				"suppressing superseded continuation"
			);
			return Poll::Ready(());
		}
		let polled = {
			let _guard = registry::AttributionGuard::push(this.reaction.clone());
			this.inner.as_mut().poll(cx)
		};
		match polled {
			Poll::Pending => Poll::Pending,
			Poll::Ready(result) => {
				this.reaction.finish_phase(&this.phase);
				match result {
					Ok(()) => this.reaction.reset_suspended(),
					Err(Error::Cancelled) => {
						tracing::trace!(reaction = this.reaction.name(), "run cancelled")
					}
					Err(error) => {
						// No caller is listening on an async reaction.
						tracing::error!(
							reaction = this.reaction.name(),
							%error,
							"async reaction failed"
						)
					}
				}
				Poll::Ready(())
			}
		}
	}
}
