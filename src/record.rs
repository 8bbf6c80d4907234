use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::graph::{NodeCommon, TrackingNode};
use crate::track::{self, Trackable};

/// Backing store shared by every struct declared with
/// [`tracked_record!`]: the raw struct plus one tracking node keyed by
/// field name.
pub struct RecordBody<R: 'static> {
	raw: RefCell<R>,
	node: TrackingNode<&'static str>,
}

impl<R: 'static> RecordBody<R> {
	pub fn new(raw: R) -> Rc<Self> {
		Rc::new(RecordBody {
			raw: RefCell::new(raw),
			node: TrackingNode::new(),
		})
	}

	pub fn tracking_common(&self) -> Rc<NodeCommon> {
		self.node.common.clone()
	}

	pub fn link_field(&self, field: &impl Trackable) {
		track::link_parent(field, &self.node.common);
	}

	pub fn read<T>(&self, key: &'static str, project: impl FnOnce(&R) -> &T) -> Ref<'_, T> {
		self.node.track_get(&key);
		Ref::map(self.raw.borrow(), project)
	}

	/// Writing a value that compares equal is a no-op and notifies
	/// nobody.
	pub fn write<T: PartialEq + Trackable>(
		&self,
		key: &'static str,
		slot: impl FnOnce(&mut R) -> &mut T,
		value: T,
	) {
		let changed = {
			let mut raw = self.raw.borrow_mut();
			let existing = slot(&mut *raw);
			if *existing == value {
				false
			} else {
				track::unlink_parent(existing);
				track::link_parent(&value, &self.node.common);
				*existing = value;
				true
			}
		};
		if changed {
			self.node.notify_set(&key);
		}
	}

	/// Untracked view of the raw struct.
	pub fn raw(&self) -> Ref<'_, R> {
		self.raw.borrow()
	}
}

/// Declares a tracked record: a raw struct plus a cheaply clonable
/// wrapper whose getters subscribe the running reaction to the field
/// and whose setters notify its watchers.
///
/// ```ignore
/// tracked_record! {
/// 	pub struct Person: RawPerson {
/// 		name, set_name: String,
/// 		age, set_age: u32,
/// 	}
/// }
/// ```
#[macro_export]
macro_rules! tracked_record {
	(
		$(#[$meta:meta])*
		$vis:vis struct $name:ident : $raw:ident {
			$( $field:ident, $setter:ident : $ty:ty ),+ $(,)?
		}
	) => {
		$(#[$meta])*
		$vis struct $raw {
			$( pub $field: $ty, )+
		}

		#[derive(Clone)]
		$vis struct $name {
			body: ::std::rc::Rc<$crate::record::RecordBody<$raw>>,
		}

		impl $name {
			$vis fn track(raw: $raw) -> Self {
				let this = Self {
					body: $crate::record::RecordBody::new(raw),
				};
				{
					let raw = this.body.raw();
					$( this.body.link_field(&raw.$field); )+
				}
				this
			}

			$vis fn raw(&self) -> ::std::cell::Ref<'_, $raw> {
				self.body.raw()
			}

			$(
				$vis fn $field(&self) -> ::std::cell::Ref<'_, $ty> {
					self.body.read(stringify!($field), |raw| &raw.$field)
				}

				$vis fn $setter(&self, value: $ty) {
					self.body.write(stringify!($field), |raw| &mut raw.$field, value)
				}
			)+
		}

		impl $crate::Trackable for $name {
			fn tracking_node(&self) -> ::std::option::Option<::std::rc::Rc<$crate::NodeCommon>> {
				::std::option::Option::Some(self.body.tracking_common())
			}
		}
	};
}
