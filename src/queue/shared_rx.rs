//! RSQ: one hardware RX queue demultiplexed to many sessions.
//!
//! Each registered entry owns an SPSC ring and a NIC flow rule steering its
//! (dst_ip, dst_port) onto the shared queue. The dispatch loop polls the
//! hardware queue and fans packets out by exact match; an optional system
//! entry is matched last and receives residual traffic. An entry becomes
//! visible to dispatch only after its rule is installed; removal reverses
//! that order.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hermit_sync::SpinMutex;
use smoltcp::wire::IpProtocol;

use crate::driver::{FlowId, NicDriver};
use crate::error::{Error, Result};
use crate::mempool::Mbuf;
use crate::queue::pool::RxQueue;
use crate::queue::{FlowSpec, MAX_BURST};
use crate::ring::MbufRing;
use crate::wire;

/// Upper bound of sessions on one shared queue.
pub(crate) const RSQ_ENTRY_MAX: usize = 64;

pub struct SharedRxQueue {
	driver: Arc<dyn NicDriver>,
	queue: SpinMutex<RxQueue>,
	queue_id: u16,
	entries: SpinMutex<Vec<Arc<RsqEntry>>>,
	next_idx: AtomicU32,
	drop_cnt: AtomicU64,
}

impl SharedRxQueue {
	pub(crate) fn new(driver: Arc<dyn NicDriver>, queue: RxQueue) -> Arc<Self> {
		let queue_id = queue.queue_id();
		info!("rsq: sharing rx queue {queue_id}");
		Arc::new(Self {
			driver,
			queue: SpinMutex::new(queue),
			queue_id,
			entries: SpinMutex::new(Vec::new()),
			next_idx: AtomicU32::new(0),
			drop_cnt: AtomicU64::new(0),
		})
	}

	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn entry_count(&self) -> usize {
		self.entries.lock().len()
	}

	/// Packets that matched no entry and found no system entry.
	pub fn drop_count(&self) -> u64 {
		self.drop_cnt.load(Ordering::Relaxed)
	}

	pub(crate) fn get(
		this: &Arc<Self>,
		flow: FlowSpec,
		ring_count: usize,
	) -> Result<Arc<RsqEntry>> {
		{
			let entries = this.entries.lock();
			if entries.len() >= RSQ_ENTRY_MAX {
				return Err(Error::NoResource("rsq entry table full"));
			}
			for e in entries.iter() {
				if e.flow.sys_queue && flow.sys_queue {
					return Err(Error::InvalidFlow("second sys entry"));
				}
				if !e.flow.sys_queue
					&& !flow.sys_queue && e.flow.dip == flow.dip
					&& e.flow.dst_port == flow.dst_port
				{
					return Err(Error::InvalidFlow("duplicate (dip, dst_port)"));
				}
			}
		}

		// rule first: the entry may become visible to dispatch only after
		// the NIC acknowledged the steering rule
		let flow_id = this.driver.rx_flow_install(this.queue_id, &flow)?;
		let entry = Arc::new(RsqEntry {
			parent: Arc::downgrade(this),
			idx: this.next_idx.fetch_add(1, Ordering::Relaxed),
			queue_id: this.queue_id,
			flow,
			flow_id: SpinMutex::new(Some(flow_id)),
			ring: MbufRing::new(ring_count),
			enqueue_cnt: AtomicU64::new(0),
			enqueue_fail_cnt: AtomicU64::new(0),
			unlinked: AtomicBool::new(false),
		});
		this.entries.lock().push(Arc::clone(&entry));
		let ip = entry.flow.dip;
		debug!(
			"rsq {}: entry {} for {ip}:{} registered",
			this.queue_id, entry.idx, entry.flow.dst_port
		);
		Ok(entry)
	}

	/// Polls the hardware queue once and fans packets out to entry rings.
	/// The queue lock is held across the fan-out so that concurrent
	/// dispatchers cannot reorder packets within one flow.
	fn dispatch(&self) {
		let queue = self.queue.lock();
		let mut scratch: Vec<Mbuf> = Vec::with_capacity(usize::from(MAX_BURST));
		if queue.burst(&mut scratch, MAX_BURST) == 0 {
			return;
		}

		let entries = self.entries.lock();
		'pkt: for m in scratch.drain(..) {
			let key = wire::parse_ipv4(m.data()).map(|ip| {
				if ip.proto == IpProtocol::Udp {
					let port = ip
						.l4
						.get(2..4)
						.map_or(0, |b| u16::from_be_bytes([b[0], b[1]]));
					(ip.dst_ip, port, true)
				} else {
					(ip.dst_ip, 0, false)
				}
			});

			if let Some((dst_ip, dst_port, is_udp)) = key
				&& is_udp
			{
				for e in entries.iter() {
					if !e.flow.sys_queue && e.matches(dst_ip, dst_port) {
						e.enqueue(m);
						continue 'pkt;
					}
				}
			}
			// residual traffic: the sys entry, if any, matched last
			if let Some(sys) = entries.iter().find(|e| e.flow.sys_queue) {
				sys.enqueue(m);
			} else {
				self.drop_cnt.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	fn unlink(&self, idx: u32) {
		self.entries.lock().retain(|e| e.idx != idx);
	}
}

pub struct RsqEntry {
	parent: Weak<SharedRxQueue>,
	idx: u32,
	queue_id: u16,
	flow: FlowSpec,
	flow_id: SpinMutex<Option<FlowId>>,
	ring: MbufRing,
	enqueue_cnt: AtomicU64,
	enqueue_fail_cnt: AtomicU64,
	unlinked: AtomicBool,
}

impl RsqEntry {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn flow(&self) -> &FlowSpec {
		&self.flow
	}

	pub fn enqueue_count(&self) -> u64 {
		self.enqueue_cnt.load(Ordering::Relaxed)
	}

	pub fn enqueue_fail_count(&self) -> u64 {
		self.enqueue_fail_cnt.load(Ordering::Relaxed)
	}

	fn matches(&self, dst_ip: Ipv4Addr, dst_port: u16) -> bool {
		(self.flow.no_ip_flow || self.flow.dip == dst_ip)
			&& (self.flow.no_port_flow || self.flow.dst_port == dst_port)
	}

	fn enqueue(&self, m: Mbuf) {
		match self.ring.enqueue(m) {
			Ok(()) => {
				self.enqueue_cnt.fetch_add(1, Ordering::Relaxed);
			}
			// ring full: drop and count, never back-pressure the NIC
			Err(m) => {
				drop(m);
				self.enqueue_fail_cnt.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	/// Runs one shared dispatch round, then drains this entry's ring.
	pub fn burst(&self, pkts: &mut Vec<Mbuf>, max: u16) -> u16 {
		if let Some(parent) = self.parent.upgrade() {
			parent.dispatch();
		}
		self.ring.burst(pkts, max)
	}

	/// Un-install rule, drain ring, unlink. Idempotent.
	pub(crate) fn unlink(&self) {
		if self.unlinked.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(parent) = self.parent.upgrade() {
			if let Some(flow_id) = self.flow_id.lock().take()
				&& let Err(e) = parent.driver.rx_flow_remove(flow_id)
			{
				warn!("rsq {}: flow remove failed: {e}", self.queue_id);
			}
			parent.unlink(self.idx);
		}
		self.ring.drain();
	}
}

impl Drop for RsqEntry {
	fn drop(&mut self) {
		self.unlink();
	}
}
