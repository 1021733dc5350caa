//! Per-port pools of hardware TX/RX queues.
//!
//! Allocation takes a short lock; once a queue is owned there is no lock on
//! the burst path. Dropping a queue returns it to the pool, tearing down any
//! flow rule it had installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use hermit_sync::SpinMutex;

use crate::driver::{DevCaps, FlowId, NicDriver};
use crate::error::{Error, Result};
use crate::mempool::Mbuf;
use crate::queue::{FlowSpec, TxFlowSpec};

struct PoolShared {
	driver: Arc<dyn NicDriver>,
	free: SpinMutex<Vec<u16>>,
}

impl PoolShared {
	fn new(driver: Arc<dyn NicDriver>, count: u16) -> Arc<Self> {
		Arc::new(Self {
			driver,
			free: SpinMutex::new((0..count).rev().collect()),
		})
	}

	fn pop(&self) -> Option<u16> {
		self.free.lock().pop()
	}

	fn push(&self, queue_id: u16) {
		self.free.lock().push(queue_id);
	}
}

/* TX side */

/// Software token bucket applied when the NIC cannot rate-limit in hardware.
struct Shaper {
	bytes_per_sec: u64,
	depth: u64,
	tokens: u64,
	last: Instant,
}

impl Shaper {
	fn new(bytes_per_sec: u64) -> Self {
		// 20 ms worth of burst, enough to never starve a single frame
		let depth = (bytes_per_sec / 50).max(16 * 1024);
		Self {
			bytes_per_sec,
			depth,
			tokens: depth,
			last: Instant::now(),
		}
	}

	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed_ns = now.duration_since(self.last).as_nanos() as u64;
		self.last = now;
		let add = elapsed_ns.saturating_mul(self.bytes_per_sec) / 1_000_000_000;
		self.tokens = (self.tokens + add).min(self.depth);
	}

	/// How many of `pkts` fit into the current budget, debiting them.
	fn admit(&mut self, pkts: &[Mbuf]) -> usize {
		self.refill();
		let mut n = 0;
		for m in pkts {
			let bytes = m.len() as u64;
			if self.tokens < bytes {
				break;
			}
			self.tokens -= bytes;
			n += 1;
		}
		n
	}

	fn credit(&mut self, bytes: u64) {
		self.tokens = (self.tokens + bytes).min(self.depth);
	}
}

/// An exclusively owned hardware TX queue.
pub struct TxQueue {
	pool: Weak<PoolShared>,
	driver: Arc<dyn NicDriver>,
	queue_id: u16,
	shaper: Option<SpinMutex<Shaper>>,
	fatal: AtomicBool,
	active: AtomicBool,
}

impl TxQueue {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Relaxed)
	}

	/// Non-blocking transmit; drains the sent prefix of `pkts`.
	pub fn burst(&self, pkts: &mut Vec<Mbuf>) -> u16 {
		if pkts.is_empty() || self.fatal.load(Ordering::Relaxed) {
			return 0;
		}
		match &self.shaper {
			None => self.driver.tx_burst(self.queue_id, pkts),
			Some(shaper) => {
				let admitted = shaper.lock().admit(pkts);
				if admitted == 0 {
					return 0;
				}
				let mut rest = pkts.split_off(admitted);
				let sent = self.driver.tx_burst(self.queue_id, pkts);
				// hand unsent-but-debited bytes back to the bucket
				let refund: u64 = pkts.iter().map(|m| m.len() as u64).sum();
				if refund > 0 {
					shaper.lock().credit(refund);
				}
				pkts.append(&mut rest);
				sent
			}
		}
	}

	/// Pushes pad frames until every in-flight descriptor has passed the
	/// hardware watermark. Required before the queue may be returned.
	pub fn flush(&self, pad: &Mbuf) {
		let descs = self.driver.dev_info().tx_desc_count;
		let mut pads: Vec<Mbuf> = Vec::with_capacity(usize::from(descs));
		for _ in 0..descs {
			pads.push(pad.clone());
		}
		while !pads.is_empty() {
			if self.driver.tx_burst(self.queue_id, &mut pads) == 0 {
				std::thread::yield_now();
			}
		}
		self.driver.tx_done_cleanup(self.queue_id);
	}

	pub fn done_cleanup(&self) {
		self.driver.tx_done_cleanup(self.queue_id);
	}

	/// Marks the queue dead after a hardware fatal; bursts become no-ops and
	/// the owning session is expected to reopen.
	pub fn set_fatal(&self) {
		self.fatal.store(true, Ordering::Relaxed);
	}

	pub fn is_fatal(&self) -> bool {
		self.fatal.load(Ordering::Relaxed)
	}
}

impl Drop for TxQueue {
	fn drop(&mut self) {
		self.active.store(false, Ordering::Relaxed);
		if let Some(pool) = self.pool.upgrade() {
			pool.push(self.queue_id);
		}
	}
}

pub struct TxQueuePool {
	shared: Arc<PoolShared>,
	hw_rate_limit: bool,
}

impl TxQueuePool {
	pub(crate) fn new(driver: Arc<dyn NicDriver>) -> Self {
		let info = driver.dev_info();
		Self {
			shared: PoolShared::new(Arc::clone(&driver), info.max_tx_queues),
			hw_rate_limit: info.caps.contains(DevCaps::RATE_LIMIT),
		}
	}

	pub fn free_count(&self) -> usize {
		self.shared.free.lock().len()
	}

	pub(crate) fn get(&self, flow: &TxFlowSpec) -> Result<TxQueue> {
		let queue_id = self
			.shared
			.pop()
			.ok_or(Error::NoResource("tx queue pool empty"))?;
		let shaper = if flow.bytes_per_sec > 0 && !self.hw_rate_limit {
			Some(SpinMutex::new(Shaper::new(flow.bytes_per_sec)))
		} else {
			None
		};
		debug!(
			"txq {queue_id}: allocated, rate {} B/s",
			flow.bytes_per_sec
		);
		Ok(TxQueue {
			pool: Arc::downgrade(&self.shared),
			driver: Arc::clone(&self.shared.driver),
			queue_id,
			shaper,
			fatal: AtomicBool::new(false),
			active: AtomicBool::new(true),
		})
	}
}

/* RX side */

/// An exclusively owned hardware RX queue; active iff a flow rule steers
/// packets here.
pub struct RxQueue {
	pool: Weak<PoolShared>,
	driver: Arc<dyn NicDriver>,
	queue_id: u16,
	flow_id: Option<FlowId>,
	active: AtomicBool,
}

impl RxQueue {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Relaxed)
	}

	/// Non-blocking receive of up to `max` packets appended to `pkts`.
	pub fn burst(&self, pkts: &mut Vec<Mbuf>, max: u16) -> u16 {
		self.driver.rx_burst(self.queue_id, pkts, max)
	}
}

impl Drop for RxQueue {
	fn drop(&mut self) {
		self.active.store(false, Ordering::Relaxed);
		if let Some(flow_id) = self.flow_id.take()
			&& let Err(e) = self.driver.rx_flow_remove(flow_id)
		{
			warn!("rxq {}: flow remove failed: {e}", self.queue_id);
		}
		if let Some(pool) = self.pool.upgrade() {
			pool.push(self.queue_id);
		}
	}
}

pub struct RxQueuePool {
	shared: Arc<PoolShared>,
}

impl RxQueuePool {
	pub(crate) fn new(driver: Arc<dyn NicDriver>) -> Self {
		let info = driver.dev_info();
		Self {
			shared: PoolShared::new(driver, info.max_rx_queues),
		}
	}

	pub fn free_count(&self) -> usize {
		self.shared.free.lock().len()
	}

	/// Allocates a queue and installs the steering rule for `flow`.
	pub(crate) fn get(&self, flow: &FlowSpec) -> Result<RxQueue> {
		let queue_id = self
			.shared
			.pop()
			.ok_or(Error::NoResource("rx queue pool empty"))?;
		match self.shared.driver.rx_flow_install(queue_id, flow) {
			Ok(flow_id) => {
				debug!("rxq {queue_id}: allocated, flow {flow_id:?}");
				Ok(RxQueue {
					pool: Arc::downgrade(&self.shared),
					driver: Arc::clone(&self.shared.driver),
					queue_id,
					flow_id: Some(flow_id),
					active: AtomicBool::new(true),
				})
			}
			Err(e) => {
				self.shared.push(queue_id);
				Err(e)
			}
		}
	}

	/// Allocates a queue without any steering rule. Used by demultiplexers
	/// that install per-entry rules themselves.
	pub(crate) fn reserve(&self) -> Result<RxQueue> {
		let queue_id = self
			.shared
			.pop()
			.ok_or(Error::NoResource("rx queue pool empty"))?;
		Ok(RxQueue {
			pool: Arc::downgrade(&self.shared),
			driver: Arc::clone(&self.shared.driver),
			queue_id,
			flow_id: None,
			active: AtomicBool::new(true),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::LoopbackNic;
	use smoltcp::wire::EthernetAddress;

	fn nic() -> Arc<LoopbackNic> {
		Arc::new(LoopbackNic::new(
			EthernetAddress([2, 0, 0, 0, 0, 1]),
			2,
			2,
			DevCaps::FLOW_RULES,
		))
	}

	#[test]
	fn exhaustion_and_return() {
		let pool = TxQueuePool::new(nic());
		let flow = TxFlowSpec::default();
		let a = pool.get(&flow).unwrap();
		let _b = pool.get(&flow).unwrap();
		assert!(matches!(pool.get(&flow), Err(Error::NoResource(_))));
		let id = a.queue_id();
		drop(a);
		let c = pool.get(&flow).unwrap();
		assert_eq!(c.queue_id(), id);
	}

	#[test]
	fn rx_rule_removed_on_drop() {
		let nic = nic();
		let pool = RxQueuePool::new(nic.clone() as Arc<dyn NicDriver>);
		let flow = FlowSpec {
			dst_port: 5000,
			no_ip_flow: true,
			..FlowSpec::default()
		};
		let q = pool.get(&flow).unwrap();
		assert!(q.is_active());
		drop(q);
		// rule gone: a udp frame to 5000 falls back to RSS spread, but with
		// rules empty the loopback spreads instead of dropping, so check via
		// re-install of the same rule succeeding
		let q2 = pool.get(&flow).unwrap();
		assert!(q2.is_active());
	}

	#[test]
	fn shaper_admits_by_bytes() {
		let mut shaper = Shaper::new(1_000_000);
		let pool = crate::mempool::Mempool::new("t", 8, 2048);
		let pkts: Vec<Mbuf> = (0..8)
			.map(|_| pool.alloc_from(&[0u8; 1500]).unwrap())
			.collect();
		// fresh bucket holds 20 ms = 20 kB, so 13 frames of 1500 B fit
		let n = shaper.admit(&pkts);
		assert!(n > 0 && n <= 8);
		shaper.tokens = 0;
		shaper.last = Instant::now();
		assert_eq!(shaper.admit(&pkts[..1]), 0);
	}
}
