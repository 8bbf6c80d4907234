use std::cell::{Cell, RefCell};
use std::future::Future;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

struct Runtime {
	pool: RefCell<LocalPool>,
	spawner: LocalSpawner,
	running: Cell<bool>,
}

thread_local! {
	static RUNTIME: Runtime = {
		let pool = LocalPool::new();
		let spawner = pool.spawner();
		Runtime {
			pool: RefCell::new(pool),
			spawner,
			running: Cell::new(false),
		}
	};
}

pub(crate) fn spawn(future: impl Future<Output = ()> + 'static) {
	RUNTIME.with(|runtime| {
		runtime
			.spawner
			.spawn_local(future)
			.unwrap_or_else(|err| panic!("local executor is gone: {}", err))
	});
}

pub(crate) fn defer(task: impl FnOnce() + 'static) {
	spawn(async move { task() });
}

/// Drives deferred schedulers, resource drivers and async continuations
/// until no further progress is possible. Hosts with their own event
/// loop call this from it; tests call it directly.
pub fn run_until_idle() {
	RUNTIME.with(|runtime| {
		if runtime.running.replace(true) {
			// Already draining further up the stack.
			return;
		}
		struct Guard<'a>(&'a Cell<bool>);
		impl Drop for Guard<'_> {
			fn drop(&mut self) {
				self.0.set(false);
			}
		}
		let _guard = Guard(&runtime.running);
		runtime.pool.borrow_mut().run_until_stalled();
	});
}
