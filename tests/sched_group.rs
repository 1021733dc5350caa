//! Scheduler group behaviour observed from outside: idle sleeping and the
//! fairness of the round.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mionet::{Progress, SchedGroup, Tasklet, VarParams};

struct Idle {
	name: &'static str,
	polls: Arc<AtomicUsize>,
}

impl Tasklet for Idle {
	fn name(&self) -> &str {
		self.name
	}

	fn poll(&mut self) -> Progress {
		self.polls.fetch_add(1, Ordering::Relaxed);
		Progress::AllDone
	}

	fn advice_sleep_us(&self) -> u64 {
		500
	}
}

#[test]
fn idle_group_spends_the_second_asleep() {
	let group = SchedGroup::new("idle-test", None, true, true, false, &VarParams::default());
	let polls_a = Arc::new(AtomicUsize::new(0));
	let polls_b = Arc::new(AtomicUsize::new(0));
	let _ha = group.register(Box::new(Idle {
		name: "a",
		polls: Arc::clone(&polls_a),
	}));
	let _hb = group.register(Box::new(Idle {
		name: "b",
		polls: Arc::clone(&polls_b),
	}));
	group.start().unwrap();

	std::thread::sleep(Duration::from_secs(1));
	let (slept, sleeps) = group.sleep_stats();
	let rounds = group.rounds();
	group.stop();

	// both tasklets report idle, so nearly all wallclock goes into sleeping
	assert!(sleeps > 0);
	assert!(
		slept >= Duration::from_millis(600),
		"only slept {slept:?} over 1s"
	);
	// every round polls each tasklet exactly once
	let a = polls_a.load(Ordering::Relaxed);
	let b = polls_b.load(Ordering::Relaxed);
	assert!(a.abs_diff(b) <= 1, "unfair round: {a} vs {b}");
	assert!(a as u64 >= rounds.saturating_sub(1));
}

struct Busy(Arc<AtomicUsize>);

impl Tasklet for Busy {
	fn name(&self) -> &str {
		"busy"
	}

	fn poll(&mut self) -> Progress {
		self.0.fetch_add(1, Ordering::Relaxed);
		Progress::HasPending
	}
}

#[test]
fn pending_tasklet_keeps_group_awake() {
	let group = SchedGroup::new("busy-test", None, true, true, false, &VarParams::default());
	let polls = Arc::new(AtomicUsize::new(0));
	let _h = group.register(Box::new(Busy(Arc::clone(&polls))));
	group.start().unwrap();

	std::thread::sleep(Duration::from_millis(100));
	let (slept, _) = group.sleep_stats();
	group.stop();

	assert_eq!(slept, Duration::ZERO);
	assert!(polls.load(Ordering::Relaxed) > 1000);
}
