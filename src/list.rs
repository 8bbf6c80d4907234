use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::batch;
use crate::graph::{NodeCommon, TrackingNode};
use crate::registry::IterationGuard;
use crate::track::{self, IntoTracked, Trackable};

/// Tracked sequence keyed by index. Shifting mutations notify every
/// displaced index inside one batch, so watchers of any of them run
/// once against the final shape.
pub struct TrackedList<T: 'static> {
	body: Rc<ListBody<T>>,
}

struct ListBody<T> {
	raw: RefCell<Vec<T>>,
	node: TrackingNode<usize>,
}

impl<T> Clone for TrackedList<T> {
	fn clone(&self) -> Self {
		TrackedList {
			body: self.body.clone(),
		}
	}
}

impl<T: Trackable> TrackedList<T> {
	pub fn new() -> Self {
		Self::track(Vec::new())
	}

	pub fn track(raw: Vec<T>) -> Self {
		let body = Rc::new(ListBody {
			raw: RefCell::new(raw),
			node: TrackingNode::new(),
		});
		for value in body.raw.borrow().iter() {
			track::link_parent(value, &body.node.common);
		}
		TrackedList { body }
	}

	pub fn get(&self, index: usize) -> Option<Ref<'_, T>> {
		self.body.node.track_get(&index);
		let raw = self.body.raw.borrow();
		if index < raw.len() {
			Some(Ref::map(raw, |raw| &raw[index]))
		} else {
			None
		}
	}

	pub fn get_cloned(&self, index: usize) -> Option<T>
	where
		T: Clone,
	{
		self.body.node.track_get(&index);
		self.body.raw.borrow().get(index).cloned()
	}

	pub fn len(&self) -> usize {
		self.body.node.track_iterate();
		self.body.raw.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// One structural dependency for the whole pass; element reads made
	/// by `f` are not tracked individually.
	pub fn for_each(&self, mut f: impl FnMut(usize, &T)) {
		self.body.node.track_iterate();
		let _guard = IterationGuard::new();
		for (index, value) in self.body.raw.borrow().iter().enumerate() {
			f(index, value);
		}
	}

	pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
		self.body.node.track_iterate();
		let _guard = IterationGuard::new();
		self.body.raw.borrow().iter().position(|value| pred(value))
	}

	pub fn to_vec(&self) -> Vec<T>
	where
		T: Clone,
	{
		self.body.node.track_iterate();
		self.body.raw.borrow().clone()
	}

	/// Replaces the element at `index`. Writing a value that compares
	/// equal is a no-op. Panics when `index` is out of bounds.
	pub fn set(&self, index: usize, value: T)
	where
		T: PartialEq,
	{
		let changed = {
			let mut raw = self.body.raw.borrow_mut();
			let len = raw.len();
			let Some(existing) = raw.get_mut(index) else {
				panic!("set index {} out of bounds (len {})", index, len);
			};
			if *existing == value {
				false
			} else {
				track::unlink_parent(existing);
				track::link_parent(&value, &self.body.node.common);
				*existing = value;
				true
			}
		};
		if changed {
			self.body.node.notify_set(&index);
		}
	}

	pub fn push(&self, value: T) {
		let index = {
			let mut raw = self.body.raw.borrow_mut();
			track::link_parent(&value, &self.body.node.common);
			raw.push(value);
			raw.len() - 1
		};
		self.body.node.notify_add(&index);
	}

	pub fn pop(&self) -> Option<T> {
		let popped = self.body.raw.borrow_mut().pop();
		if let Some(value) = &popped {
			track::unlink_parent(value);
			let index = self.body.raw.borrow().len();
			self.body.node.notify_delete(&index);
		}
		popped
	}

	/// Inserts at `index`, shifting the tail. Every displaced index is
	/// notified in one batch.
	pub fn insert(&self, index: usize, value: T) {
		let len = {
			let mut raw = self.body.raw.borrow_mut();
			track::link_parent(&value, &self.body.node.common);
			raw.insert(index, value);
			raw.len()
		};
		batch::batch(|| {
			self.body.node.notify_add(&index);
			for shifted in index + 1..len {
				self.body.node.notify_set(&shifted);
			}
		});
	}

	/// Removes at `index`, shifting the tail. Panics when `index` is out
	/// of bounds.
	pub fn remove(&self, index: usize) -> T {
		let (value, len) = {
			let mut raw = self.body.raw.borrow_mut();
			let value = raw.remove(index);
			(value, raw.len())
		};
		track::unlink_parent(&value);
		batch::batch(|| {
			self.body.node.notify_delete(&index);
			for shifted in index..len {
				self.body.node.notify_set(&shifted);
			}
		});
		value
	}

	pub fn clear(&self) {
		let drained = {
			let mut raw = self.body.raw.borrow_mut();
			if raw.is_empty() {
				return;
			}
			std::mem::take(&mut *raw)
		};
		for value in &drained {
			track::unlink_parent(value);
		}
		self.body.node.notify_clear();
	}

	/// Untracked view of the underlying vector.
	pub fn raw(&self) -> Ref<'_, Vec<T>> {
		self.body.raw.borrow()
	}

	/// Unwraps the storage. Panics while other handles to it exist.
	pub fn into_raw(self) -> Vec<T> {
		match Rc::try_unwrap(self.body) {
			Ok(body) => body.raw.into_inner(),
			Err(_) => panic!("into_raw called on a shared tracked list"),
		}
	}
}

// Identity comparison: two handles are equal when they share state.
impl<T> PartialEq for TrackedList<T> {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.body, &other.body)
	}
}

impl<T: Trackable> Default for TrackedList<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: 'static> Trackable for TrackedList<T> {
	fn tracking_node(&self) -> Option<Rc<NodeCommon>> {
		Some(self.body.node.common.clone())
	}
}

impl<T: Trackable> IntoTracked for Vec<T> {
	type Tracked = TrackedList<T>;

	fn into_tracked(self) -> TrackedList<T> {
		TrackedList::track(self)
	}
}

impl<T: 'static> IntoTracked for TrackedList<T> {
	type Tracked = TrackedList<T>;

	fn into_tracked(self) -> TrackedList<T> {
		self
	}
}
