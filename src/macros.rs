pub use enclose::*;

/// Shorthand for [`watch`](crate::watch()) with default options. The
/// optional capture list clones the named values into the closure.
#[macro_export]
macro_rules! watch {
	(( $($capture:tt)* ) => $($body:tt)*) => {
		$crate::watch(
			$crate::macros::enclose!(($($capture)*) move || { $($body)* }),
			::std::default::Default::default(),
		)
	};
	($($body:tt)*) => {
		$crate::watch(move || { $($body)* }, ::std::default::Default::default())
	};
}

/// Shorthand for [`batch`](crate::batch()) with an optional capture
/// list.
#[macro_export]
macro_rules! batch {
	(( $($capture:tt)* ) => $($body:tt)*) => {
		$crate::batch($crate::macros::enclose!(($($capture)*) move || { $($body)* }))
	};
	($($body:tt)*) => {
		$crate::batch(move || { $($body)* })
	};
}
