use std::rc::Rc;

use crate::graph::NodeCommon;

/// Anything that can live inside a tracked container. Leaf values keep
/// the default `None`; wrapper types expose their node so containers
/// can parent-link them for deep watches.
pub trait Trackable: 'static {
	fn tracking_node(&self) -> Option<Rc<NodeCommon>> {
		None
	}

	fn is_tracked(&self) -> bool {
		self.tracking_node().is_some()
	}
}

/// Declares plain leaf types that carry no tracking of their own.
#[macro_export]
macro_rules! trackable_leaf {
	($($ty:ty),* $(,)?) => {
		$(impl $crate::Trackable for $ty {})*
	};
}

trackable_leaf!(
	bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, String,
	&'static str, ()
);

impl<T: Trackable> Trackable for Option<T> {
	fn tracking_node(&self) -> Option<Rc<NodeCommon>> {
		self.as_ref().and_then(|value| value.tracking_node())
	}
}

impl<T: 'static> Trackable for Vec<T> {}

/// Raw composite values that have a tracked wrapper form.
pub trait IntoTracked {
	type Tracked;

	fn into_tracked(self) -> Self::Tracked;
}

/// Places a raw composite under tracking. Wrapping an already tracked
/// value returns it unchanged, so wrapping is idempotent and identity
/// stable. Primitives and other leaf values are rejected at compile
/// time: they have no `IntoTracked` form.
pub fn track<R: IntoTracked>(raw: R) -> R::Tracked {
	raw.into_tracked()
}

pub(crate) fn link_parent(value: &impl Trackable, parent: &Rc<NodeCommon>) {
	if let Some(node) = value.tracking_node() {
		node.set_parent(Some(parent));
	}
}

pub(crate) fn unlink_parent(value: &impl Trackable) {
	if let Some(node) = value.tracking_node() {
		node.set_parent(None);
	}
}
