use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;
use mockall::predicate::eq;

use retrack::DebugEvent;
use retrack::{
	batch, create_async_scheduler, manual_watch, run_until_idle, selector, set_default_scheduler,
	sync, sync_every, track, tracked_record, untracked, warm, watch, watch_async, watch_deep,
	ReadError, ResourceResult, SelectorOptions, Trackable, TrackedList, TrackedMap, TrackedSet,
	UpdateStrategy, Warmable, WatchOptions,
};


use mock::Spy;

fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Clone)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
	type Writer = LogBuffer;

	fn make_writer(&'a self) -> LogBuffer {
		self.clone()
	}
}

fn poll_once<F: Future>(future: &mut Pin<Box<F>>) -> Poll<F::Output> {
	let waker = futures::task::noop_waker();
	let mut cx = Context::from_waker(&waker);
	future.as_mut().poll(&mut cx)
}

#[test]
fn watch_reruns_on_write() {
	init_tracing();
	let map = TrackedMap::new();
	map.insert("a", 1u64);
	map.insert("b", 2u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				let total = map.get_cloned(&"a").unwrap() + map.get_cloned(&"b").unwrap();
				mock.get().trigger(total);
			}
		},
		WatchOptions::default(),
	);

	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(12u64)).times(1).return_const(());
	map.insert("a", 10u64);
	mock.get().checkpoint();
}

#[test]
fn equal_write_is_a_noop() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions::default(),
	);

	mock.get().checkpoint();

	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 1u64);
	map.insert("a", 1u64);
	mock.get().checkpoint();
}

#[test]
fn dependencies_are_rediscovered_each_run() {
	let map = TrackedMap::new();
	map.insert("flag", 1u64);
	map.insert("a", 10u64);
	map.insert("b", 20u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(10u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				let value = if map.get_cloned(&"flag").unwrap() == 1 {
					map.get_cloned(&"a").unwrap()
				} else {
					map.get_cloned(&"b").unwrap()
				};
				mock.get().trigger(value);
			}
		},
		WatchOptions::default(),
	);

	mock.get().checkpoint();

	// Not a dependency while the flag selects "a".
	mock.get().expect_trigger().times(0).return_const(());
	map.insert("b", 21u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(21u64)).times(1).return_const(());
	map.insert("flag", 0u64);
	mock.get().checkpoint();

	// "a" dropped out of the dependency set on the last run.
	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 11u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(22u64)).times(1).return_const(());
	map.insert("b", 22u64);
	mock.get().checkpoint();
}

#[test]
fn untracked_reads_do_not_subscribe() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				let value = untracked(|| map.get_cloned(&"a").unwrap());
				mock.get().trigger(value);
			}
		},
		WatchOptions::default(),
	);

	mock.get().checkpoint();

	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();
}

#[test]
fn wrapping_is_identity_stable() {
	let list = TrackedList::track(vec![1u64, 2]);
	let id = list.tracking_node().unwrap().id();
	let rewrapped = track(list.clone());
	assert_eq!(rewrapped.tracking_node().unwrap().id(), id);
	assert!(list.is_tracked());
}

#[test]
fn stop_twice_is_harmless() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions::default(),
	);

	w.stop();
	w.stop();

	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();
}

#[test]
fn restart_rediscovers_dependencies() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	w.stop();
	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	w.restart();
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());
	map.insert("a", 3u64);
	mock.get().checkpoint();
}

#[test]
#[should_panic(expected = "registered inside a running reaction")]
fn nested_watch_registration_panics() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let _w = watch(
		{
			let map = map.clone();
			move || {
				let _ = map.get_cloned(&"a");
				let _inner = watch(|| {}, WatchOptions::default());
			}
		},
		WatchOptions::default(),
	);
}

#[test]
fn batch_collapses_triggers() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);
	map.insert("b", 2u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				let total = map.get_cloned(&"a").unwrap() + map.get_cloned(&"b").unwrap();
				mock.get().trigger(total);
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	// One run against the final values, not one per write.
	mock.get().expect_trigger().with(eq(30u64)).times(1).return_const(());
	batch(|| {
		map.insert("a", 10u64);
		map.insert("a", 10u64);
		map.insert("b", 20u64);
	});
	mock.get().checkpoint();
}

#[test]
fn sync_every_flushes_each_write() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());
	sync_every(|| {
		map.insert("a", 2u64);
		map.insert("a", 3u64);
	});
	mock.get().checkpoint();
}

#[test]
fn async_scheduler_coalesces_and_sync_bypasses_it() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let scheduler = create_async_scheduler(None);
	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions {
			scheduler: Some(scheduler),
			..WatchOptions::default()
		},
	);
	mock.get().checkpoint();

	// Two writes, one deferred run, nothing until the executor turns.
	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	map.insert("a", 3u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());
	run_until_idle();
	mock.get().checkpoint();

	// A sync scope runs the reaction inline, skipping its scheduler.
	mock.get().expect_trigger().with(eq(4u64)).times(1).return_const(());
	sync(|| {
		map.insert("a", 4u64);
	});
	mock.get().checkpoint();
}

#[test]
fn default_scheduler_is_swappable() {
	set_default_scheduler(create_async_scheduler(None));

	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	run_until_idle();
	mock.get().checkpoint();
}

#[test]
fn manual_watch_invalidates_without_running() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();

	let m = manual_watch(
		{
			let map = map.clone();
			move || map.get_cloned(&"a").unwrap()
		},
		{
			let mock = mock.clone();
			move || mock.get().trigger(99)
		},
		WatchOptions::default(),
	);

	assert_eq!(m.call(), 1);

	mock.get().expect_trigger().with(eq(99u64)).times(1).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();

	// The body never re-ran on its own; the owner calls when it wants.
	assert_eq!(m.call(), 2);
	m.stop();
}

#[test]
fn iteration_subscribes_to_structure_only() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.len() as u64);
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	// Replacing a value is not a structural change.
	mock.get().expect_trigger().times(0).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	map.insert("b", 3u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());
	map.remove(&"a");
	mock.get().checkpoint();
}

#[test]
fn clear_impacts_every_key_watcher() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);
	map.insert("b", 2u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(2).return_const(());

	let _wa = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"a").unwrap_or(0));
			}
		},
		WatchOptions::default(),
	);
	let _wb = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(map.get_cloned(&"b").unwrap_or(0));
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(0u64)).times(2).return_const(());
	map.clear();
	mock.get().checkpoint();
}

#[test]
fn set_tracks_membership_per_member() {
	let set = TrackedSet::new();
	set.insert(1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());

	let _w = watch(
		{
			let set = set.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(set.contains(&2) as u64 + 1);
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	// A different member leaves the `contains(&2)` watcher alone.
	mock.get().expect_trigger().times(0).return_const(());
	set.insert(3u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	set.insert(2u64);
	mock.get().checkpoint();
}

#[test]
fn list_shift_notifies_displaced_indexes() {
	let list = TrackedList::track(vec![10u64, 20]);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(20u64)).times(1).return_const(());

	let _w = watch(
		{
			let list = list.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(list.get_cloned(1).unwrap_or(0));
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	// Insert at the head shifts index 1; the watcher runs once against
	// the final shape.
	mock.get().expect_trigger().with(eq(10u64)).times(1).return_const(());
	list.insert(0, 5u64);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(20u64)).times(1).return_const(());
	list.remove(0);
	mock.get().checkpoint();
}

#[test]
fn deep_watch_sees_descendant_mutations() {
	let inner = TrackedList::track(vec![1u64]);
	let map = TrackedMap::new();
	map.insert("list", inner.clone());

	let mock = mock::SharedMock::new();
	let runs = Rc::new(Cell::new(0u64));
	mock.get().expect_trigger().times(1).return_const(());

	let _w = watch_deep(
		&map,
		{
			let mock = mock.clone();
			let runs = runs.clone();
			move || {
				runs.set(runs.get() + 1);
				mock.get().trigger(runs.get());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	inner.push(2);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(3u64)).times(1).return_const(());
	map.insert("other", TrackedList::new());
	mock.get().checkpoint();
}

tracked_record! {
	struct Person: RawPerson {
		name, set_name: String,
		age, set_age: u64,
	}
}

#[test]
fn record_tracks_per_field() {
	let person = Person::track(RawPerson {
		name: "ann".to_string(),
		age: 30,
	});

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(30u64)).times(1).return_const(());

	let _w = watch(
		{
			let person = person.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(*person.age());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	// Another field, then an equal write: neither reruns the watcher.
	mock.get().expect_trigger().times(0).return_const(());
	person.set_name("bea".to_string());
	person.set_age(30);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(31u64)).times(1).return_const(());
	person.set_age(31);
	mock.get().checkpoint();

	assert_eq!(&*person.name(), "bea");
}

#[test]
fn sync_selector_recomputes_and_reruns_readers() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let sel = selector(
		{
			let map = map.clone();
			move || ResourceResult::Ready(map.get_cloned(&"a").unwrap() * 10)
		},
		SelectorOptions::default(),
	);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(10u64)).times(1).return_const(());

	let _w = watch(
		{
			let sel = sel.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(*sel.value());
			}
		},
		WatchOptions::default(),
	);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(20u64)).times(1).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();
}

#[test]
fn async_selector_suspends_and_reruns_reader_once() {
	let (tx, rx) = oneshot::channel::<u64>();
	let rx = RefCell::new(Some(rx));

	let sel = selector(
		move || {
			let rx = rx.borrow_mut().take().expect("getter started once");
			ResourceResult::Pending(async move { Ok(rx.await.unwrap()) }.boxed_local())
		},
		SelectorOptions::default(),
	);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(0).return_const(());

	let _w = watch(
		{
			let sel = sel.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(*sel.value());
			}
		},
		WatchOptions::default(),
	);

	run_until_idle();
	assert!(!sel.is_ready());
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(42u64)).times(1).return_const(());
	tx.send(42).unwrap();
	run_until_idle();
	mock.get().checkpoint();
	assert!(sel.is_ready());
}

#[test]
fn failed_selector_surfaces_through_try_value() {
	let sel = selector(
		|| {
			ResourceResult::<u64>::Failed(Rc::new(std::io::Error::new(
				std::io::ErrorKind::Other,
				"backend down",
			)))
		},
		SelectorOptions {
			watch: WatchOptions {
				lazy: true,
				..WatchOptions::default()
			},
			..SelectorOptions::default()
		},
	);

	match sel.try_value() {
		Err(ReadError::Failed(error)) => assert_eq!(error.to_string(), "backend down"),
		_ => panic!("expected a captured failure"),
	};
}

#[test]
fn lazy_selector_stops_with_its_last_reader() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);
	let starts = Rc::new(Cell::new(0u64));

	let sel = selector(
		{
			let map = map.clone();
			let starts = starts.clone();
			move || {
				starts.set(starts.get() + 1);
				ResourceResult::Ready(map.get_cloned(&"a").unwrap())
			}
		},
		SelectorOptions {
			watch: WatchOptions {
				lazy: true,
				..WatchOptions::default()
			},
			..SelectorOptions::default()
		},
	);

	assert_eq!(starts.get(), 0);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(1).return_const(());

	let w = watch(
		{
			let sel = sel.clone();
			let mock = mock.clone();
			move || {
				mock.get().trigger(*sel.value());
			}
		},
		WatchOptions::default(),
	);
	assert_eq!(starts.get(), 1);
	mock.get().checkpoint();

	w.stop();

	// No readers left: dependency changes no longer recompute.
	map.insert("a", 2u64);
	assert_eq!(starts.get(), 1);
}

#[test]
fn selector_promise_resolves() {
	let (tx, rx) = oneshot::channel::<u64>();
	let rx = RefCell::new(Some(rx));

	let sel = selector(
		move || {
			let rx = rx.borrow_mut().take().expect("getter started once");
			ResourceResult::Pending(async move { Ok(rx.await.unwrap()) }.boxed_local())
		},
		SelectorOptions::default(),
	);
	run_until_idle();

	let mut promise = Box::pin(sel.promise());
	assert!(poll_once(&mut promise).is_pending());

	tx.send(7).unwrap();
	run_until_idle();
	match poll_once(&mut promise) {
		Poll::Ready(Ok(value)) => assert_eq!(value, 7),
		other => panic!("promise did not resolve: {:?}", other.map(|r| r.is_ok())),
	}
}

#[test]
fn warm_waits_for_every_selector_at_once() {
	let (tx1, rx1) = oneshot::channel::<u64>();
	let (tx2, rx2) = oneshot::channel::<u64>();
	let rx1 = RefCell::new(Some(rx1));
	let rx2 = RefCell::new(Some(rx2));

	let lazy = || SelectorOptions {
		watch: WatchOptions {
			lazy: true,
			..WatchOptions::default()
		},
		..SelectorOptions::default()
	};
	let sel1 = selector(
		move || {
			let rx = rx1.borrow_mut().take().expect("started once");
			ResourceResult::Pending(async move { Ok(rx.await.unwrap()) }.boxed_local())
		},
		lazy(),
	);
	let sel2 = selector(
		move || {
			let rx = rx2.borrow_mut().take().expect("started once");
			ResourceResult::Pending(async move { Ok(rx.await.unwrap()) }.boxed_local())
		},
		lazy(),
	);

	let mut warming = Box::pin(warm([&sel1 as &dyn Warmable, &sel2 as &dyn Warmable]));
	assert!(poll_once(&mut warming).is_pending());

	tx1.send(1).unwrap();
	tx2.send(2).unwrap();
	run_until_idle();
	assert!(poll_once(&mut warming).is_ready());
	assert!(sel1.is_ready() && sel2.is_ready());
}

#[test]
fn silent_update_keeps_previous_value_until_settle() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);
	let (tx, rx) = oneshot::channel::<u64>();
	let rx = RefCell::new(Some(rx));
	let first = Cell::new(true);

	let sel = selector(
		{
			let map = map.clone();
			move || {
				let _ = map.get_cloned(&"a");
				if first.replace(false) {
					ResourceResult::Ready(1u64)
				} else {
					let rx = rx.borrow_mut().take().expect("one silent update");
					ResourceResult::Pending(async move { Ok(rx.await.unwrap()) }.boxed_local())
				}
			}
		},
		SelectorOptions {
			update_strategy: UpdateStrategy::Silent,
			..SelectorOptions::default()
		},
	);

	assert_eq!(*sel.try_value().unwrap(), 1);

	// The recompute is in flight, but readers keep the old value.
	map.insert("a", 2u64);
	run_until_idle();
	assert_eq!(*sel.try_value().unwrap(), 1);

	tx.send(5).unwrap();
	run_until_idle();
	assert_eq!(*sel.try_value().unwrap(), 5);
}

#[test]
fn superseded_async_run_never_resumes() {
	init_tracing();
	let map = TrackedMap::new();
	map.insert("value", 1u64);

	let (tx1, rx1) = oneshot::channel::<()>();
	let (tx2, rx2) = oneshot::channel::<()>();
	let gates = Rc::new(RefCell::new(vec![rx2, rx1]));

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(0).return_const(());

	let _w = watch_async(
		{
			let map = map.clone();
			let mock = mock.clone();
			let gates = gates.clone();
			move || {
				let map = map.clone();
				let mock = mock.clone();
				let gates = gates.clone();
				async move {
					let seen = map.get_cloned(&"value").unwrap();
					let gate = gates.borrow_mut().pop().expect("two runs");
					let _ = gate.await;
					mock.get().trigger(seen);
					Ok(())
				}
				.boxed_local()
			}
		},
		WatchOptions::default(),
	);

	run_until_idle();

	// Supersede the first run while it is parked at the await.
	map.insert("value", 2u64);
	run_until_idle();

	// Releasing the stale gate must not resume the superseded run.
	tx1.send(()).unwrap();
	run_until_idle();
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	tx2.send(()).unwrap();
	run_until_idle();
	mock.get().checkpoint();
}

#[test]
fn write_during_own_async_run_supersedes_it() {
	let map = TrackedMap::new();
	map.insert("k", 1u64);

	let (tx, rx) = oneshot::channel::<()>();
	let gate = Rc::new(RefCell::new(Some(rx)));

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().times(0).return_const(());

	let _w = watch_async(
		{
			let map = map.clone();
			let mock = mock.clone();
			let gate = gate.clone();
			move || {
				let map = map.clone();
				let mock = mock.clone();
				let gate = gate.clone();
				async move {
					let seen = map.get_cloned(&"k").unwrap();
					if let Some(gate) = gate.borrow_mut().take() {
						// Invalidates what this very run already read.
						map.insert("k", seen + 1);
						let _ = gate.await;
						mock.get().trigger(seen);
					}
					Ok(())
				}
				.boxed_local()
			}
		},
		WatchOptions::default(),
	);

	run_until_idle();

	// The run saw k=1, then wrote k=2 mid-poll: its phase is superseded,
	// so releasing the gate must not let the stale continuation resume.
	tx.send(()).unwrap();
	run_until_idle();
	mock.get().checkpoint();
}

#[test]
fn mutual_writers_converge_from_one_seed() {
	let map = TrackedMap::new();
	map.insert("a", 0u64);
	map.insert("b", 0u64);

	let a_runs = Rc::new(Cell::new(0u64));
	let b_runs = Rc::new(Cell::new(0u64));

	let _wa = watch(
		{
			let map = map.clone();
			let a_runs = a_runs.clone();
			move || {
				a_runs.set(a_runs.get() + 1);
				let a = map.get_cloned(&"a").unwrap();
				map.insert("b", a);
			}
		},
		WatchOptions::default(),
	);
	let _wb = watch(
		{
			let map = map.clone();
			let b_runs = b_runs.clone();
			move || {
				b_runs.set(b_runs.get() + 1);
				let b = map.get_cloned(&"b").unwrap();
				map.insert("a", b);
			}
		},
		WatchOptions::default(),
	);

	assert_eq!((a_runs.get(), b_runs.get()), (1, 1));

	map.insert("a", 7u64);

	// One seeded write, one run each, stable fixed point.
	assert_eq!((a_runs.get(), b_runs.get()), (2, 2));
	assert_eq!(untracked(|| map.get_cloned(&"a").unwrap()), 7);
	assert_eq!(untracked(|| map.get_cloned(&"b").unwrap()), 7);
}

#[test]
fn self_write_does_not_recurse() {
	let map = TrackedMap::new();
	map.insert("n", 0u64);

	let runs = Rc::new(Cell::new(0u64));

	let _w = watch(
		{
			let map = map.clone();
			let runs = runs.clone();
			move || {
				runs.set(runs.get() + 1);
				let n = map.get_cloned(&"n").unwrap();
				if n < 3 {
					map.insert("n", n + 1);
				}
			}
		},
		WatchOptions::default(),
	);

	// The write landed, but a running reaction never re-triggers itself.
	assert_eq!(runs.get(), 1);
	assert_eq!(untracked(|| map.get_cloned(&"n").unwrap()), 1);

	map.insert("n", 2u64);
	assert_eq!(runs.get(), 2);
	assert_eq!(untracked(|| map.get_cloned(&"n").unwrap()), 3);
}

#[test]
fn debug_callback_reports_reads_and_triggers() {
	let map = TrackedMap::new();
	map.insert("a", 1u64);

	let mock = mock::SharedMock::new();
	mock.get().expect_trigger().with(eq(1u64)).times(1).return_const(());
	mock.get()
		.expect_observe()
		.with(eq(String::from("read Get \"a\"")))
		.times(1)
		.return_const(());

	let debug: Rc<dyn Fn(&DebugEvent)> = Rc::new({
		let mock = mock.clone();
		move |event| mock.get().observe(mock::describe(event))
	});

	let _w = watch(
		{
			let map = map.clone();
			let mock = mock.clone();
			move || {
				// Read before locking the spy: the debug callback locks it
				// too.
				let value = map.get_cloned(&"a").unwrap();
				mock.get().trigger(value);
			}
		},
		WatchOptions {
			debug: Some(debug),
			..WatchOptions::default()
		},
	);
	mock.get().checkpoint();

	mock.get()
		.expect_observe()
		.with(eq(String::from("trigger Set \"a\"")))
		.times(1)
		.return_const(());
	mock.get()
		.expect_observe()
		.with(eq(String::from("read Get \"a\"")))
		.times(1)
		.return_const(());
	mock.get().expect_trigger().with(eq(2u64)).times(1).return_const(());
	map.insert("a", 2u64);
	mock.get().checkpoint();
}

#[test]
fn unread_rejected_selector_warns() {
	let buffer = LogBuffer(Arc::new(Mutex::new(Vec::new())));
	let subscriber = tracing_subscriber::fmt()
		.with_writer(buffer.clone())
		.finish();

	let sel = tracing::subscriber::with_default(subscriber, || {
		selector(
			|| {
				ResourceResult::<u64>::Failed(Rc::new(std::io::Error::new(
					std::io::ErrorKind::Other,
					"backend down",
				)))
			},
			SelectorOptions::default(),
		)
	});

	let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
	assert!(output.contains("rejected before it was ever read"));

	// The failure still surfaces to a late reader.
	assert!(matches!(sel.try_value(), Err(ReadError::Failed(_))));
}

#[test]
#[should_panic(expected = "times in a row")]
fn endless_suspension_is_capped() {
	let map = TrackedMap::new();
	map.insert("k", 1u64);

	let sel = selector(
		{
			let map = map.clone();
			move || {
				let _ = map.get_cloned(&"k");
				ResourceResult::<u64>::Pending(futures::future::pending().boxed_local())
			}
		},
		SelectorOptions::default(),
	);

	let _w = watch(
		{
			let sel = sel.clone();
			move || {
				let _ = *sel.value();
			}
		},
		WatchOptions::default(),
	);

	for i in 0..6u64 {
		map.insert("k", 10 + i);
	}
}
