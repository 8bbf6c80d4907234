use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use fxhash::FxHashMap;
use fxhash::FxHashSet;
use smallvec::SmallVec;

use crate::ops::{DebugEvent, MutationKind, MutationOperation, ReadKind, ReadOperation, TrackKey, TrackedKey};
use crate::registry::{self, Reaction, ReactionId};
use crate::scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EdgeId(u64);

thread_local! {
	static NEXT_ID: Cell<u64> = Cell::new(1);
}

pub(crate) fn next_id() -> u64 {
	NEXT_ID.with(|id| {
		let value = id.get();
		id.set(value + 1);
		value
	})
}

/// Insertion-ordered set of reactions subscribed to one (object, key)
/// pair. The edge id is what reactions key their own edge map by.
pub(crate) struct WatcherSet {
	id: EdgeId,
	order: SmallVec<[Reaction; 4]>,
	index: FxHashSet<ReactionId>,
}

impl WatcherSet {
	pub(crate) fn new() -> Rc<RefCell<Self>> {
		Rc::new(RefCell::new(WatcherSet {
			id: EdgeId(next_id()),
			order: SmallVec::new(),
			index: FxHashSet::default(),
		}))
	}

	/// Registers `reaction` in the set and records the edge in the
	/// reaction's own edge map. Idempotent within one run.
	pub(crate) fn add(set: &Rc<RefCell<Self>>, reaction: &Reaction) {
		let edge = {
			let mut this = set.borrow_mut();
			if !this.index.insert(reaction.id()) {
				return;
			}
			this.order.push(reaction.clone());
			this.id
		};
		reaction.record_edge(edge, Rc::downgrade(set));
	}

	pub(crate) fn remove(&mut self, id: ReactionId) {
		if self.index.remove(&id) {
			self.order.retain(|r| r.id() != id);
		}
	}

	fn collect_into(&self, out: &mut Impacted) {
		for reaction in &self.order {
			out.push(reaction);
		}
	}

	pub(crate) fn snapshot(&self) -> SmallVec<[Reaction; 4]> {
		self.order.clone()
	}
}

pub(crate) fn remove_edge(edge: &Weak<RefCell<WatcherSet>>, id: ReactionId) {
	if let Some(set) = edge.upgrade() {
		set.borrow_mut().remove(id);
	}
}

/// Deduplicated, insertion-ordered list of reactions hit by one mutation.
#[derive(Default)]
pub(crate) struct Impacted {
	order: SmallVec<[Reaction; 8]>,
	seen: FxHashSet<ReactionId>,
}

impl Impacted {
	fn push(&mut self, reaction: &Reaction) {
		if reaction.is_stopped() {
			return;
		}
		if self.seen.insert(reaction.id()) {
			self.order.push(reaction.clone());
		}
	}

	pub(crate) fn iter(&self) -> impl Iterator<Item = &Reaction> {
		self.order.iter()
	}
}

/// Type-erased part of a tracked object: identity, parent link and the
/// any-change watcher set. The parent chain is what makes deep watches
/// fire on descendant mutations.
pub struct NodeCommon {
	id: NodeId,
	parent: RefCell<Option<Weak<NodeCommon>>>,
	any_change: Rc<RefCell<WatcherSet>>,
}

impl NodeCommon {
	pub(crate) fn new() -> Rc<Self> {
		Rc::new(NodeCommon {
			id: NodeId(next_id()),
			parent: RefCell::new(None),
			any_change: WatcherSet::new(),
		})
	}

	pub fn id(&self) -> NodeId {
		self.id
	}

	pub(crate) fn set_parent(&self, parent: Option<&Rc<NodeCommon>>) {
		*self.parent.borrow_mut() = parent.map(Rc::downgrade);
	}

	pub(crate) fn watch_any_change(self: &Rc<Self>, reaction: &Reaction) {
		WatcherSet::add(&self.any_change, reaction);
	}
}

/// Per-object dependency table: key (or the structural sentinel) to the
/// set of reactions that read it.
pub(crate) struct TrackingNode<K> {
	pub(crate) common: Rc<NodeCommon>,
	keys: RefCell<FxHashMap<TrackedKey<K>, Rc<RefCell<WatcherSet>>>>,
}

impl<K: TrackKey> TrackingNode<K> {
	pub(crate) fn new() -> Self {
		TrackingNode {
			common: NodeCommon::new(),
			keys: RefCell::new(FxHashMap::default()),
		}
	}

	/// Routes one read through the execution stack. No-op when nothing
	/// is attributable or a don't-track / iteration scope is active.
	pub(crate) fn track(&self, op: ReadOperation<'_, K>) {
		if registry::in_iteration() {
			return;
		}
		let Some(reaction) = registry::current() else {
			return;
		};

		let key = match op.kind {
			ReadKind::Iterate => TrackedKey::Structure,
			ReadKind::Get | ReadKind::Has => match op.key {
				Some(key) => TrackedKey::Key(key.clone()),
				None => TrackedKey::Structure,
			},
		};

		let set = self
			.keys
			.borrow_mut()
			.entry(key)
			.or_insert_with(WatcherSet::new)
			.clone();
		WatcherSet::add(&set, &reaction);

		if let Some(debug) = reaction.debug() {
			debug(&DebugEvent::Read {
				target: self.common.id,
				kind: op.kind,
				key: op.key.map(|k| format!("{:?}", k)),
			});
		}
	}

	pub(crate) fn track_get(&self, key: &K) {
		self.track(ReadOperation {
			kind: ReadKind::Get,
			key: Some(key),
		});
	}

	pub(crate) fn track_has(&self, key: &K) {
		self.track(ReadOperation {
			kind: ReadKind::Has,
			key: Some(key),
		});
	}

	pub(crate) fn track_iterate(&self) {
		self.track(ReadOperation {
			kind: ReadKind::Iterate,
			key: None,
		});
	}

	/// Converts one mutation into the set of impacted reactions and
	/// hands them to the scheduler.
	pub(crate) fn notify(&self, op: MutationOperation<'_, K>) {
		let impacted = self.impacted(&op);

		let mut event = None;
		for reaction in impacted.iter() {
			if let Some(debug) = reaction.debug() {
				let event = event.get_or_insert_with(|| DebugEvent::Trigger {
					target: self.common.id,
					kind: op.kind,
					key: op.key.map(|k| format!("{:?}", k)),
				});
				debug(event);
			}
		}

		scheduler::trigger_all(&impacted);
	}

	fn impacted(&self, op: &MutationOperation<'_, K>) -> Impacted {
		let mut out = Impacted::default();

		// Any-change watchers on this object and every ancestor.
		let mut node = Some(self.common.clone());
		while let Some(common) = node {
			common.any_change.borrow().collect_into(&mut out);
			node = common
				.parent
				.borrow()
				.as_ref()
				.and_then(|parent| parent.upgrade());
		}

		let keys = self.keys.borrow();
		if let Some(key) = op.key {
			if let Some(set) = keys.get(&TrackedKey::Key(key.clone())) {
				set.borrow().collect_into(&mut out);
			}
		}
		match op.kind {
			MutationKind::Set => {}
			MutationKind::Add | MutationKind::Delete => {
				if let Some(set) = keys.get(&TrackedKey::Structure) {
					set.borrow().collect_into(&mut out);
				}
			}
			MutationKind::Clear => {
				// Every entry conceptually disappears, so every key
				// watcher is impacted along with the structural one.
				for set in keys.values() {
					set.borrow().collect_into(&mut out);
				}
			}
		}

		out
	}

	pub(crate) fn notify_add(&self, key: &K) {
		self.notify(MutationOperation {
			kind: MutationKind::Add,
			key: Some(key),
		});
	}

	pub(crate) fn notify_set(&self, key: &K) {
		self.notify(MutationOperation {
			kind: MutationKind::Set,
			key: Some(key),
		});
	}

	pub(crate) fn notify_delete(&self, key: &K) {
		self.notify(MutationOperation {
			kind: MutationKind::Delete,
			key: Some(key),
		});
	}

	pub(crate) fn notify_clear(&self) {
		self.notify(MutationOperation {
			kind: MutationKind::Clear,
			key: None,
		});
	}
}
