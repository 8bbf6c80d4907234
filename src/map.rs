use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::graph::{NodeCommon, TrackingNode};
use crate::ops::TrackKey;
use crate::registry::IterationGuard;
use crate::track::{self, IntoTracked, Trackable};

/// Tracked keyed collection. Reads subscribe the running reaction to
/// the touched key (or to the structure for iteration); mutations
/// notify the impacted watchers. Values are parent-linked so deep
/// watches see nested changes.
pub struct TrackedMap<K: TrackKey, V: 'static> {
	body: Rc<MapBody<K, V>>,
}

struct MapBody<K: TrackKey, V> {
	raw: RefCell<FxHashMap<K, V>>,
	node: TrackingNode<K>,
}

impl<K: TrackKey, V> Clone for TrackedMap<K, V> {
	fn clone(&self) -> Self {
		TrackedMap {
			body: self.body.clone(),
		}
	}
}

impl<K: TrackKey, V: Trackable> TrackedMap<K, V> {
	pub fn new() -> Self {
		Self::track(FxHashMap::default())
	}

	pub fn track(raw: FxHashMap<K, V>) -> Self {
		let body = Rc::new(MapBody {
			raw: RefCell::new(raw),
			node: TrackingNode::new(),
		});
		for value in body.raw.borrow().values() {
			track::link_parent(value, &body.node.common);
		}
		TrackedMap { body }
	}

	pub fn get(&self, key: &K) -> Option<Ref<'_, V>> {
		self.body.node.track_get(key);
		let raw = self.body.raw.borrow();
		if raw.contains_key(key) {
			Some(Ref::map(raw, |raw| &raw[key]))
		} else {
			None
		}
	}

	pub fn get_cloned(&self, key: &K) -> Option<V>
	where
		V: Clone,
	{
		self.body.node.track_get(key);
		self.body.raw.borrow().get(key).cloned()
	}

	pub fn contains_key(&self, key: &K) -> bool {
		self.body.node.track_has(key);
		self.body.raw.borrow().contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.body.node.track_iterate();
		self.body.raw.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn keys(&self) -> Vec<K> {
		self.body.node.track_iterate();
		self.body.raw.borrow().keys().cloned().collect()
	}

	/// One structural dependency for the whole pass; per-key reads made
	/// by `f` are not tracked individually.
	pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
		self.body.node.track_iterate();
		let _guard = IterationGuard::new();
		for (key, value) in self.body.raw.borrow().iter() {
			f(key, value);
		}
	}

	/// Inserts or replaces. Replacing a value that compares equal is a
	/// no-op and notifies nobody.
	pub fn insert(&self, key: K, value: V)
	where
		V: PartialEq,
	{
		enum Change {
			Added,
			Replaced,
			None,
		}
		let change = {
			let mut raw = self.body.raw.borrow_mut();
			match raw.get_mut(&key) {
				Some(existing) => {
					if *existing == value {
						Change::None
					} else {
						track::unlink_parent(existing);
						track::link_parent(&value, &self.body.node.common);
						*existing = value;
						Change::Replaced
					}
				}
				None => {
					track::link_parent(&value, &self.body.node.common);
					raw.insert(key.clone(), value);
					Change::Added
				}
			}
		};
		match change {
			Change::Added => self.body.node.notify_add(&key),
			Change::Replaced => self.body.node.notify_set(&key),
			Change::None => {}
		}
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		let removed = self.body.raw.borrow_mut().remove(key);
		if let Some(value) = &removed {
			track::unlink_parent(value);
			self.body.node.notify_delete(key);
		}
		removed
	}

	pub fn clear(&self) {
		let drained = {
			let mut raw = self.body.raw.borrow_mut();
			if raw.is_empty() {
				return;
			}
			std::mem::take(&mut *raw)
		};
		for value in drained.values() {
			track::unlink_parent(value);
		}
		self.body.node.notify_clear();
	}

	/// Untracked view of the underlying map.
	pub fn raw(&self) -> Ref<'_, FxHashMap<K, V>> {
		self.body.raw.borrow()
	}

	/// Unwraps the storage. Panics while other handles to it exist.
	pub fn into_raw(self) -> FxHashMap<K, V> {
		match Rc::try_unwrap(self.body) {
			Ok(body) => body.raw.into_inner(),
			Err(_) => panic!("into_raw called on a shared tracked map"),
		}
	}
}

// Identity comparison: two handles are equal when they share state.
impl<K: TrackKey, V> PartialEq for TrackedMap<K, V> {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.body, &other.body)
	}
}

impl<K: TrackKey, V: Trackable> Default for TrackedMap<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: TrackKey, V: 'static> Trackable for TrackedMap<K, V> {
	fn tracking_node(&self) -> Option<Rc<NodeCommon>> {
		Some(self.body.node.common.clone())
	}
}

impl<K: TrackKey, V: Trackable> IntoTracked for FxHashMap<K, V> {
	type Tracked = TrackedMap<K, V>;

	fn into_tracked(self) -> TrackedMap<K, V> {
		TrackedMap::track(self)
	}
}

impl<K: TrackKey, V: Trackable> IntoTracked for HashMap<K, V> {
	type Tracked = TrackedMap<K, V>;

	fn into_tracked(self) -> TrackedMap<K, V> {
		TrackedMap::track(self.into_iter().collect())
	}
}

impl<K: TrackKey, V: 'static> IntoTracked for TrackedMap<K, V> {
	type Tracked = TrackedMap<K, V>;

	fn into_tracked(self) -> TrackedMap<K, V> {
		self
	}
}
