//! Cooperative tasklet scheduler.
//!
//! A [`SchedGroup`] owns one CPU (a pinned core, or a plain thread on
//! request) and round-robins its tasklets: within one round every registered
//! tasklet is polled exactly once, in registration order. When a full round
//! reports idle the group sleeps for an adaptive interval instead of
//! surrendering the core to the OS for good; the interval is the maximum of
//! the tasklets' sleep advice clamped between the configured default and
//! force bounds. Tasklet handlers must never block or sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::VarParams;
use crate::error::{Error, Result};

/// What a tasklet reports back from one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
	/// Nothing left to do; the group may sleep if everyone agrees.
	AllDone,
	/// More work is immediately available; keep the round ticking.
	HasPending,
}

/// A non-blocking unit of work owned by exactly one scheduler group.
pub trait Tasklet: Send {
	fn name(&self) -> &str;

	/// Called on the scheduler thread before the first round.
	fn pre_start(&mut self) {}

	fn start(&mut self) {}

	/// Called once when the tasklet leaves the group.
	fn stop(&mut self) {}

	/// One scheduling quantum. MUST NOT block, MUST NOT sleep.
	fn poll(&mut self) -> Progress;

	/// Recommended sleep when this tasklet reported [`Progress::AllDone`],
	/// in microseconds. Zero means no opinion.
	fn advice_sleep_us(&self) -> u64 {
		0
	}
}

#[derive(Default)]
struct TaskletStat {
	time_cnt: u64,
	sum_time_us: u64,
	min_time_us: u64,
	max_time_us: u64,
}

struct TaskletCtl {
	name: String,
	request_exit: AtomicBool,
	ack_exit: AtomicBool,
}

struct TaskletSlot {
	tasklet: Box<dyn Tasklet>,
	ctl: Arc<TaskletCtl>,
	started: bool,
	stat: TaskletStat,
}

/// Returned from registration; detaches the tasklet on drop or on
/// [`TaskletHandle::unregister`].
pub struct TaskletHandle {
	ctl: Arc<TaskletCtl>,
	group: Weak<GroupInner>,
}

impl TaskletHandle {
	pub fn name(&self) -> &str {
		&self.ctl.name
	}

	/// Asks the scheduler to retire the tasklet and waits for the ack.
	pub fn unregister(self) {
		drop(self);
	}
}

impl Drop for TaskletHandle {
	fn drop(&mut self) {
		self.ctl.request_exit.store(true, Ordering::Release);
		let Some(group) = self.group.upgrade() else {
			return;
		};
		group.wakeup();
		if group.started.load(Ordering::Acquire) && !group.request_stop.load(Ordering::Acquire) {
			while !self.ctl.ack_exit.load(Ordering::Acquire) {
				if group.stopped.load(Ordering::Acquire) {
					break;
				}
				std::thread::yield_now();
			}
		}
	}
}

struct GroupInner {
	name: String,
	lcore: Option<usize>,
	run_in_thread: bool,
	allow_sleep: bool,
	time_measure: bool,
	default_sleep_us: u64,
	force_sleep_us: u64,
	zero_sleep_thresh_us: u64,

	tasklets: Mutex<Vec<TaskletSlot>>,
	started: AtomicBool,
	request_stop: AtomicBool,
	stopped: AtomicBool,

	sleep_lock: Mutex<bool>,
	sleep_cond: Condvar,

	stat_sleep_ns: AtomicU64,
	stat_sleep_cnt: AtomicU64,
	stat_rounds: AtomicU64,
}

impl GroupInner {
	fn wakeup(&self) {
		let mut woken = self.sleep_lock.lock().unwrap();
		*woken = true;
		self.sleep_cond.notify_all();
	}
}

/// One scheduling domain: a single OS thread sequentially invoking its
/// tasklets. Tasklets in the same group never run concurrently.
pub struct SchedGroup {
	inner: Arc<GroupInner>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl SchedGroup {
	pub fn new(
		name: &str,
		lcore: Option<usize>,
		run_in_thread: bool,
		allow_sleep: bool,
		time_measure: bool,
		var: &VarParams,
	) -> Arc<Self> {
		Arc::new(Self {
			inner: Arc::new(GroupInner {
				name: name.to_string(),
				lcore,
				run_in_thread,
				allow_sleep,
				time_measure,
				default_sleep_us: var.sch_default_sleep_us,
				force_sleep_us: var.sch_force_sleep_us,
				zero_sleep_thresh_us: var.sch_zero_sleep_threshold_us,
				tasklets: Mutex::new(Vec::new()),
				started: AtomicBool::new(false),
				request_stop: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
				sleep_lock: Mutex::new(false),
				sleep_cond: Condvar::new(),
				stat_sleep_ns: AtomicU64::new(0),
				stat_sleep_cnt: AtomicU64::new(0),
				stat_rounds: AtomicU64::new(0),
			}),
			worker: Mutex::new(None),
		})
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Appends a tasklet to the round. Allowed before or after start; a
	/// tasklet registered on a running group joins the next round.
	pub fn register(&self, tasklet: Box<dyn Tasklet>) -> TaskletHandle {
		let ctl = Arc::new(TaskletCtl {
			name: tasklet.name().to_string(),
			request_exit: AtomicBool::new(false),
			ack_exit: AtomicBool::new(false),
		});
		debug!("sch {}: register tasklet {}", self.inner.name, ctl.name);
		self.inner.tasklets.lock().unwrap().push(TaskletSlot {
			tasklet,
			ctl: Arc::clone(&ctl),
			started: false,
			stat: TaskletStat::default(),
		});
		self.inner.wakeup();
		TaskletHandle {
			ctl,
			group: Arc::downgrade(&self.inner),
		}
	}

	pub fn start(&self) -> Result<()> {
		if self.inner.started.swap(true, Ordering::AcqRel) {
			return Err(Error::InvalidArg("group already started"));
		}
		let inner = Arc::clone(&self.inner);
		let handle = std::thread::Builder::new()
			.name(format!("sch-{}", inner.name))
			.spawn(move || worker(&inner))
			.map_err(|_| Error::NoResource("scheduler thread"))?;
		*self.worker.lock().unwrap() = Some(handle);
		info!(
			"sch {}: started ({})",
			self.inner.name,
			match (self.inner.run_in_thread, self.inner.lcore) {
				(true, _) => "thread mode".to_string(),
				(false, Some(core)) => format!("lcore {core}"),
				(false, None) => "unpinned".to_string(),
			}
		);
		Ok(())
	}

	pub fn is_started(&self) -> bool {
		self.inner.started.load(Ordering::Acquire)
	}

	/// Cooperative stop: the request is observed at the next round boundary,
	/// one final round drains, every tasklet's `stop` runs, the thread joins.
	pub fn stop(&self) {
		if !self.inner.started.load(Ordering::Acquire) {
			return;
		}
		self.inner.request_stop.store(true, Ordering::Release);
		self.inner.wakeup();
		if let Some(handle) = self.worker.lock().unwrap().take() {
			let _ = handle.join();
		}
		info!("sch {}: stopped", self.inner.name);
	}

	/// Total time this group spent sleeping, and how often.
	pub fn sleep_stats(&self) -> (Duration, u64) {
		(
			Duration::from_nanos(self.inner.stat_sleep_ns.load(Ordering::Relaxed)),
			self.inner.stat_sleep_cnt.load(Ordering::Relaxed),
		)
	}

	pub fn rounds(&self) -> u64 {
		self.inner.stat_rounds.load(Ordering::Relaxed)
	}

	/// Logs per-tasklet wallclock statistics, when measuring is on.
	pub fn stat_dump(&self) {
		if !self.inner.time_measure {
			return;
		}
		for slot in self.inner.tasklets.lock().unwrap().iter() {
			if slot.stat.time_cnt == 0 {
				continue;
			}
			info!(
				"sch {}: tasklet {} avg {}us min {}us max {}us over {} polls",
				self.inner.name,
				slot.ctl.name,
				slot.stat.sum_time_us / slot.stat.time_cnt,
				slot.stat.min_time_us,
				slot.stat.max_time_us,
				slot.stat.time_cnt
			);
		}
	}
}

impl Drop for SchedGroup {
	fn drop(&mut self) {
		self.stop();
	}
}

fn worker(inner: &GroupInner) {
	if !inner.run_in_thread
		&& let Some(lcore) = inner.lcore
	{
		let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: lcore });
		if !pinned {
			warn!("sch {}: failed to pin lcore {lcore}", inner.name);
		}
	}

	loop {
		if inner.request_stop.load(Ordering::Acquire) {
			break;
		}

		let mut any_pending = false;
		let mut advice_us = 0u64;
		{
			let mut slots = inner.tasklets.lock().unwrap();
			for slot in slots.iter_mut() {
				if slot.ctl.request_exit.load(Ordering::Acquire) {
					continue;
				}
				if !slot.started {
					slot.tasklet.pre_start();
					slot.tasklet.start();
					slot.started = true;
				}
				if inner.time_measure {
					let t0 = Instant::now();
					let progress = slot.tasklet.poll();
					let us = t0.elapsed().as_micros() as u64;
					let stat = &mut slot.stat;
					if stat.time_cnt == 0 || us < stat.min_time_us {
						stat.min_time_us = us;
					}
					stat.max_time_us = stat.max_time_us.max(us);
					stat.sum_time_us += us;
					stat.time_cnt += 1;
					match progress {
						Progress::HasPending => any_pending = true,
						Progress::AllDone => {
							advice_us = advice_us.max(slot.tasklet.advice_sleep_us());
						}
					}
				} else {
					match slot.tasklet.poll() {
						Progress::HasPending => any_pending = true,
						Progress::AllDone => {
							advice_us = advice_us.max(slot.tasklet.advice_sleep_us());
						}
					}
				}
			}

			// retire exiting tasklets at the round boundary
			slots.retain_mut(|slot| {
				if !slot.ctl.request_exit.load(Ordering::Acquire) {
					return true;
				}
				if slot.started {
					slot.tasklet.stop();
				}
				slot.ctl.ack_exit.store(true, Ordering::Release);
				debug!("sch {}: tasklet {} retired", inner.name, slot.ctl.name);
				false
			});
		}
		inner.stat_rounds.fetch_add(1, Ordering::Relaxed);

		// sleep only on a fully idle round
		if !any_pending && inner.allow_sleep {
			let sleep_us = if advice_us == 0 {
				inner.default_sleep_us
			} else {
				advice_us.clamp(inner.default_sleep_us, inner.force_sleep_us)
			};
			if sleep_us <= inner.zero_sleep_thresh_us {
				std::thread::yield_now();
			} else {
				let t0 = Instant::now();
				let mut woken = inner.sleep_lock.lock().unwrap();
				if *woken {
					// a wakeup arrived between the round and the sleep
					*woken = false;
				} else {
					let (mut woken, _) = inner
						.sleep_cond
						.wait_timeout(woken, Duration::from_micros(sleep_us))
						.unwrap();
					*woken = false;
					inner
						.stat_sleep_ns
						.fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
					inner.stat_sleep_cnt.fetch_add(1, Ordering::Relaxed);
				}
			}
		}
	}

	// drain one final round, then stop everything that ever started
	let mut slots = inner.tasklets.lock().unwrap();
	for slot in slots.iter_mut() {
		if slot.started && !slot.ctl.request_exit.load(Ordering::Acquire) {
			slot.tasklet.poll();
		}
	}
	for slot in slots.iter_mut() {
		if slot.started {
			slot.tasklet.stop();
		}
		slot.ctl.ack_exit.store(true, Ordering::Release);
	}
	slots.clear();
	inner.stopped.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	struct Counter {
		name: String,
		polls: Arc<AtomicUsize>,
		pending: bool,
		log: Option<Arc<Mutex<Vec<&'static str>>>>,
		tag: &'static str,
	}

	impl Tasklet for Counter {
		fn name(&self) -> &str {
			&self.name
		}

		fn poll(&mut self) -> Progress {
			self.polls.fetch_add(1, Ordering::Relaxed);
			if let Some(log) = &self.log {
				log.lock().unwrap().push(self.tag);
			}
			if self.pending {
				Progress::HasPending
			} else {
				Progress::AllDone
			}
		}
	}

	fn counter(name: &'static str, pending: bool) -> (Box<Counter>, Arc<AtomicUsize>) {
		let polls = Arc::new(AtomicUsize::new(0));
		(
			Box::new(Counter {
				name: name.to_string(),
				polls: Arc::clone(&polls),
				pending,
				log: None,
				tag: name,
			}),
			polls,
		)
	}

	fn group(allow_sleep: bool) -> Arc<SchedGroup> {
		SchedGroup::new("test", None, true, allow_sleep, false, &VarParams::default())
	}

	#[test]
	fn every_tasklet_polled_once_per_round() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let group = group(false);
		let mut handles = Vec::new();
		for tag in ["a", "b", "c"] {
			let (mut t, _) = counter(tag, true);
			t.log = Some(Arc::clone(&log));
			handles.push(group.register(t));
		}
		group.start().unwrap();
		while group.rounds() < 10 {
			std::thread::yield_now();
		}
		group.stop();

		let log = log.lock().unwrap();
		// registration order repeats exactly: a b c a b c ...
		for (i, tag) in log.iter().enumerate() {
			assert_eq!(*tag, ["a", "b", "c"][i % 3]);
		}
	}

	#[test]
	fn sleeps_only_when_idle() {
		let group = group(true);
		let (busy, _) = counter("busy", true);
		let _h = group.register(busy);
		group.start().unwrap();
		while group.rounds() < 50 {
			std::thread::yield_now();
		}
		let (slept, _) = group.sleep_stats();
		group.stop();
		assert_eq!(slept, Duration::ZERO);
	}

	#[test]
	fn idle_group_sleeps() {
		let group = group(true);
		let (idle, polls) = counter("idle", false);
		let _h = group.register(idle);
		group.start().unwrap();
		std::thread::sleep(Duration::from_millis(100));
		let (slept, cnt) = group.sleep_stats();
		group.stop();
		assert!(cnt > 0);
		// nearly all wallclock went into sleeping, not spinning
		assert!(slept >= Duration::from_millis(50), "slept {slept:?}");
		assert!(polls.load(Ordering::Relaxed) > 0);
	}

	#[test]
	fn unregister_acks_and_stops_polling() {
		let group = group(false);
		let (t, polls) = counter("gone", true);
		let h = group.register(t);
		group.start().unwrap();
		while polls.load(Ordering::Relaxed) == 0 {
			std::thread::yield_now();
		}
		h.unregister();
		let after = polls.load(Ordering::Relaxed);
		std::thread::sleep(Duration::from_millis(20));
		assert_eq!(polls.load(Ordering::Relaxed), after);
		group.stop();
	}

	#[test]
	fn register_while_running() {
		let group = group(false);
		group.start().unwrap();
		let (t, polls) = counter("late", true);
		let _h = group.register(t);
		while polls.load(Ordering::Relaxed) == 0 {
			std::thread::yield_now();
		}
		group.stop();
	}
}
