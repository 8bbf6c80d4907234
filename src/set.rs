use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use fxhash::FxHashSet;

use crate::graph::{NodeCommon, TrackingNode};
use crate::ops::TrackKey;
use crate::registry::IterationGuard;
use crate::track::{IntoTracked, Trackable};

/// Tracked membership collection. The member itself is the key, so
/// `contains` subscribes to exactly that member while iteration
/// subscribes to the structure.
pub struct TrackedSet<T: TrackKey> {
	body: Rc<SetBody<T>>,
}

struct SetBody<T: TrackKey> {
	raw: RefCell<FxHashSet<T>>,
	node: TrackingNode<T>,
}

impl<T: TrackKey> Clone for TrackedSet<T> {
	fn clone(&self) -> Self {
		TrackedSet {
			body: self.body.clone(),
		}
	}
}

impl<T: TrackKey> TrackedSet<T> {
	pub fn new() -> Self {
		Self::track(FxHashSet::default())
	}

	pub fn track(raw: FxHashSet<T>) -> Self {
		TrackedSet {
			body: Rc::new(SetBody {
				raw: RefCell::new(raw),
				node: TrackingNode::new(),
			}),
		}
	}

	pub fn contains(&self, value: &T) -> bool {
		self.body.node.track_has(value);
		self.body.raw.borrow().contains(value)
	}

	pub fn len(&self) -> usize {
		self.body.node.track_iterate();
		self.body.raw.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// One structural dependency for the whole pass.
	pub fn for_each(&self, mut f: impl FnMut(&T)) {
		self.body.node.track_iterate();
		let _guard = IterationGuard::new();
		for value in self.body.raw.borrow().iter() {
			f(value);
		}
	}

	pub fn to_vec(&self) -> Vec<T> {
		self.body.node.track_iterate();
		self.body.raw.borrow().iter().cloned().collect()
	}

	/// Returns whether the set changed. Inserting a present member is a
	/// no-op and notifies nobody.
	pub fn insert(&self, value: T) -> bool {
		let added = self.body.raw.borrow_mut().insert(value.clone());
		if added {
			self.body.node.notify_add(&value);
		}
		added
	}

	pub fn remove(&self, value: &T) -> bool {
		let removed = self.body.raw.borrow_mut().remove(value);
		if removed {
			self.body.node.notify_delete(value);
		}
		removed
	}

	pub fn clear(&self) {
		{
			let mut raw = self.body.raw.borrow_mut();
			if raw.is_empty() {
				return;
			}
			raw.clear();
		}
		self.body.node.notify_clear();
	}

	/// Untracked view of the underlying set.
	pub fn raw(&self) -> Ref<'_, FxHashSet<T>> {
		self.body.raw.borrow()
	}

	/// Unwraps the storage. Panics while other handles to it exist.
	pub fn into_raw(self) -> FxHashSet<T> {
		match Rc::try_unwrap(self.body) {
			Ok(body) => body.raw.into_inner(),
			Err(_) => panic!("into_raw called on a shared tracked set"),
		}
	}
}

// Identity comparison: two handles are equal when they share state.
impl<T: TrackKey> PartialEq for TrackedSet<T> {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.body, &other.body)
	}
}

impl<T: TrackKey> Default for TrackedSet<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: TrackKey> Trackable for TrackedSet<T> {
	fn tracking_node(&self) -> Option<Rc<NodeCommon>> {
		Some(self.body.node.common.clone())
	}
}

impl<T: TrackKey> IntoTracked for FxHashSet<T> {
	type Tracked = TrackedSet<T>;

	fn into_tracked(self) -> TrackedSet<T> {
		TrackedSet::track(self)
	}
}

impl<T: TrackKey> IntoTracked for HashSet<T> {
	type Tracked = TrackedSet<T>;

	fn into_tracked(self) -> TrackedSet<T> {
		TrackedSet::track(self.into_iter().collect())
	}
}

impl<T: TrackKey> IntoTracked for TrackedSet<T> {
	type Tracked = TrackedSet<T>;

	fn into_tracked(self) -> TrackedSet<T> {
		self
	}
}
