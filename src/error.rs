use std::rc::Rc;

/// Shared, cheaply clonable user error as produced by resource getters.
pub type DynError = Rc<dyn std::error::Error + 'static>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// An async continuation was superseded before it resumed. Never an
	/// actual failure; callers are expected to ignore it.
	#[error("async continuation cancelled")]
	Cancelled,
	/// A resource getter or its pending computation failed.
	#[error("computation failed: {0}")]
	Failed(DynError),
}
