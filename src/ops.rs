use std::fmt::Debug;
use std::hash::Hash;

/// Key constraint shared by every tracked container.
pub trait TrackKey: Eq + Hash + Clone + Debug + 'static {}

impl<T> TrackKey for T where T: Eq + Hash + Clone + Debug + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
	Get,
	Has,
	Iterate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
	Add,
	Set,
	Delete,
	Clear,
}

/// Per-object key space. `Structure` is the reserved sentinel shared by
/// iteration reads and structural mutations; it is distinct from every
/// real key, so iterating a collection subscribes to structural changes
/// rather than to any single entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackedKey<K> {
	Key(K),
	Structure,
}

pub struct ReadOperation<'a, K> {
	pub kind: ReadKind,
	pub key: Option<&'a K>,
}

pub struct MutationOperation<'a, K> {
	pub kind: MutationKind,
	pub key: Option<&'a K>,
}

/// Payload handed to a reaction's `debug` callback.
#[derive(Debug, Clone)]
pub enum DebugEvent {
	Read {
		target: crate::graph::NodeId,
		kind: ReadKind,
		key: Option<String>,
	},
	Trigger {
		target: crate::graph::NodeId,
		kind: MutationKind,
		key: Option<String>,
	},
}
