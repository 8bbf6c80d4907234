use std::any::Any;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::error::Error;
use crate::ops::DebugEvent;
use crate::registry::{self, Reaction, ReactionKind};
use crate::scheduler::Scheduler;
use crate::track::Trackable;

#[derive(Clone, Default)]
pub struct WatchOptions {
	/// Scheduler this reaction is dispatched through; the thread default
	/// when absent.
	pub scheduler: Option<Rc<dyn Scheduler>>,
	/// Per-reaction hook receiving every read and trigger event.
	pub debug: Option<Rc<dyn Fn(&DebugEvent)>>,
	/// Opaque caller payload carried by the reaction handle.
	pub context: Option<Rc<dyn Any>>,
	pub name: Option<&'static str>,
	/// Register without running; the first run happens on `restart` or
	/// an explicit trigger.
	pub lazy: bool,
	/// Permit registration from inside a running reaction.
	pub allow_nested: bool,
}

impl WatchOptions {
	pub fn named(name: &'static str) -> Self {
		WatchOptions {
			name: Some(name),
			..WatchOptions::default()
		}
	}
}

/// Handle over one registered watch.
pub struct Watch {
	reaction: Reaction,
}

impl Watch {
	pub fn stop(&self) {
		self.reaction.stop();
	}

	/// Re-registers a stopped watch under its original identity and runs
	/// it once to rediscover dependencies.
	pub fn restart(&self) {
		registry::reset(&self.reaction);
		self.reaction.run();
	}

	pub fn reaction(&self) -> &Reaction {
		&self.reaction
	}
}

fn ensure_not_nested(options: &WatchOptions) {
	if !options.allow_nested && !registry::stack_is_empty() {
		panic!("watch registered inside a running reaction; set allow_nested to opt in");
	}
}

/// Registers `body` as a reaction and runs it once to discover its
/// dependencies. Each run rebuilds the dependency set from scratch, so
/// conditional reads converge to the branch actually taken.
pub fn watch(body: impl Fn() + 'static, options: WatchOptions) -> Watch {
	ensure_not_nested(&options);
	let lazy = options.lazy;
	let reaction = Reaction::new(ReactionKind::Sync(Rc::new(body)), options);
	registry::register(&reaction);
	if !lazy {
		reaction.run();
	}
	Watch { reaction }
}

/// Async variant of [`watch`]: `factory` builds one future per run.
/// Reads made across await points still attribute to this reaction,
/// and a re-trigger cancels the superseded run before it resumes.
pub fn watch_async(
	factory: impl Fn() -> LocalBoxFuture<'static, Result<(), Error>> + 'static,
	options: WatchOptions,
) -> Watch {
	ensure_not_nested(&options);
	let lazy = options.lazy;
	let reaction = Reaction::new(ReactionKind::Async(Rc::new(factory)), options);
	registry::register(&reaction);
	if !lazy {
		reaction.run();
	}
	Watch { reaction }
}

/// Watches `target` and every tracked descendant: any mutation anywhere
/// in the subtree re-runs `body`. Panics when `target` is not tracked.
pub fn watch_deep(target: &impl Trackable, body: impl Fn() + 'static, options: WatchOptions) -> Watch {
	let Some(node) = target.tracking_node() else {
		panic!("watch_deep target is not a tracked value");
	};
	ensure_not_nested(&options);
	let lazy = options.lazy;
	// Edges are rebuilt every run, so the any-change membership has to
	// be re-recorded inside the body.
	let reaction = Reaction::new(
		ReactionKind::Sync(Rc::new(move || {
			if let Some(current) = registry::current() {
				node.watch_any_change(&current);
			}
			body();
		})),
		options,
	);
	registry::register(&reaction);
	if !lazy {
		reaction.run();
	}
	Watch { reaction }
}

/// A computation evaluated only when the owner calls it. Dependency
/// changes never re-run the body; they invoke `on_invalidated` so the
/// owner can decide when to call again.
pub struct ManualWatch<R: 'static> {
	reaction: Reaction,
	body: Rc<dyn Fn() -> R>,
}

pub fn manual_watch<R: 'static>(
	body: impl Fn() -> R + 'static,
	on_invalidated: impl Fn() + 'static,
	options: WatchOptions,
) -> ManualWatch<R> {
	ensure_not_nested(&options);
	let reaction = Reaction::new(
		ReactionKind::Manual {
			on_invalidated: Rc::new(on_invalidated),
		},
		options,
	);
	registry::register(&reaction);
	ManualWatch {
		reaction,
		body: Rc::new(body),
	}
}

impl<R: 'static> ManualWatch<R> {
	/// Evaluates the body with tracking attributed to this reaction.
	pub fn call(&self) -> R {
		let body = self.body.clone();
		self.reaction.run_value(move || body())
	}

	pub fn stop(&self) {
		self.reaction.stop();
	}

	pub fn reaction(&self) -> &Reaction {
		&self.reaction
	}
}
