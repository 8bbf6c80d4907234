use std::cell::{Cell, RefCell};

use indexmap::IndexMap;

use crate::registry::{Reaction, ReactionId};
use crate::scheduler;

struct Scopes {
	batch: Cell<usize>,
	sync: Cell<usize>,
	every: Cell<usize>,
	queue: RefCell<IndexMap<ReactionId, Entry, fxhash::FxBuildHasher>>,
}

struct Entry {
	reaction: Reaction,
	sync: bool,
}

thread_local! {
	static SCOPES: Scopes = Scopes {
		batch: Cell::new(0),
		sync: Cell::new(0),
		every: Cell::new(0),
		queue: RefCell::new(IndexMap::default()),
	};
}

#[derive(Clone, Copy)]
enum ScopeKind {
	Batch,
	Sync,
	Every,
}

/// Defers and deduplicates reaction triggers until scope exit, then
/// sends each impacted reaction to its configured scheduler. Reentrant.
pub fn batch<R>(body: impl FnOnce() -> R) -> R {
	scoped(ScopeKind::Batch, body)
}

/// Like [`batch`], but at flush every deferred reaction runs inline,
/// skipping its custom scheduler.
pub fn sync<R>(body: impl FnOnce() -> R) -> R {
	scoped(ScopeKind::Sync, body)
}

/// Disables deferral entirely: every mutation inside the scope flushes
/// its impacted reactions immediately.
pub fn sync_every<R>(body: impl FnOnce() -> R) -> R {
	scoped(ScopeKind::Every, body)
}

pub fn in_batch() -> bool {
	SCOPES.with(|scopes| scopes.batch.get() > 0 || scopes.sync.get() > 0)
}

fn scoped<R>(kind: ScopeKind, body: impl FnOnce() -> R) -> R {
	struct Guard(ScopeKind);

	impl Drop for Guard {
		fn drop(&mut self) {
			let flush_now = SCOPES.with(|scopes| {
				let counter = match self.0 {
					ScopeKind::Batch => &scopes.batch,
					ScopeKind::Sync => &scopes.sync,
					ScopeKind::Every => &scopes.every,
				};
				counter.set(counter.get() - 1);
				scopes.batch.get() == 0 && scopes.sync.get() == 0
			});
			if flush_now && !std::thread::panicking() {
				flush();
			}
		}
	}

	SCOPES.with(|scopes| {
		let counter = match kind {
			ScopeKind::Batch => &scopes.batch,
			ScopeKind::Sync => &scopes.sync,
			ScopeKind::Every => &scopes.every,
		};
		counter.set(counter.get() + 1);
	});
	let _guard = Guard(kind);
	body()
}

/// Queues or forwards one triggered reaction according to the active
/// scopes. Duplicate inserts collapse; insertion order is preserved so
/// the flush order stays deterministic.
pub(crate) fn enqueue(reaction: &Reaction) {
	SCOPES.with(|scopes| {
		if scopes.every.get() > 0 {
			scheduler::dispatch(reaction);
			return;
		}
		if scopes.batch.get() > 0 || scopes.sync.get() > 0 {
			let sync = scopes.sync.get() > 0;
			let mut queue = scopes.queue.borrow_mut();
			queue
				.entry(reaction.id())
				.and_modify(|entry| entry.sync |= sync)
				.or_insert_with(|| Entry {
					reaction: reaction.clone(),
					sync,
				});
		} else {
			scheduler::dispatch(reaction);
		}
	});
}

fn flush() {
	loop {
		let drained: Vec<Entry> = SCOPES.with(|scopes| {
			scopes
				.queue
				.borrow_mut()
				.drain(..)
				.map(|(_, entry)| entry)
				.collect()
		});
		if drained.is_empty() {
			break;
		}
		for entry in drained {
			if entry.reaction.is_stopped() {
				continue;
			}
			if entry.sync {
				entry.reaction.run();
			} else {
				scheduler::dispatch(&entry.reaction);
			}
		}
	}
}
