//! SRSS: software per-flow dispatch over hardware RSS queues.
//!
//! The NIC spreads traffic across its RX queues by hashing; one tasklet
//! sweeps every queue, and within a burst groups consecutive packets that
//! belong to the same entry so sessions see bulk deliveries. Grouping keeps
//! arrival order within a flow, which the reassembly layers above rely on.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::driver::NicDriver;
use crate::error::{Error, Result};
use crate::mempool::Mbuf;
use crate::queue::FlowSpec;
use crate::ring::MbufRing;
use crate::sched::{Progress, Tasklet};
use crate::wire;

const SRSS_BURST_SIZE: u16 = 128;

pub struct SharedRss {
	driver: Arc<dyn NicDriver>,
	rx_queues: u16,
	entries: SpinMutex<Vec<Arc<SrssEntry>>>,
}

impl SharedRss {
	pub(crate) fn new(driver: Arc<dyn NicDriver>) -> Arc<Self> {
		let rx_queues = driver.dev_info().max_rx_queues;
		info!("srss: dispatching {rx_queues} rss queues in software");
		Arc::new(Self {
			driver,
			rx_queues,
			entries: SpinMutex::new(Vec::new()),
		})
	}

	pub fn entry_count(&self) -> usize {
		self.entries.lock().len()
	}

	pub(crate) fn get(
		this: &Arc<Self>,
		flow: FlowSpec,
		ring_count: usize,
	) -> Result<Arc<SrssEntry>> {
		let mut entries = this.entries.lock();
		for e in entries.iter() {
			if e.flow.sys_queue && flow.sys_queue {
				return Err(Error::InvalidFlow("second sys entry"));
			}
			// each ring has exactly one consumer, so a flow cannot be
			// handed out twice
			if !e.flow.sys_queue
				&& !flow.sys_queue && e.flow.dip == flow.dip
				&& e.flow.dst_port == flow.dst_port
			{
				return Err(Error::InvalidFlow("duplicate (dip, dst_port)"));
			}
		}
		let entry = Arc::new(SrssEntry {
			parent: Arc::downgrade(this),
			flow,
			ring: MbufRing::new(ring_count),
			enqueue_cnt: AtomicU64::new(0),
			enqueue_fail_cnt: AtomicU64::new(0),
			unlinked: AtomicBool::new(false),
		});
		entries.push(Arc::clone(&entry));
		Ok(entry)
	}

	fn unlink(&self, entry: &SrssEntry) {
		self.entries
			.lock()
			.retain(|e| !std::ptr::eq(Arc::as_ptr(e), entry));
	}

	/// Builds the dispatch tasklet for the scheduler group.
	pub(crate) fn tasklet(this: &Arc<Self>) -> Box<SrssTasklet> {
		Box::new(SrssTasklet {
			srss: Arc::clone(this),
			scratch: Vec::with_capacity(usize::from(SRSS_BURST_SIZE)),
		})
	}
}

pub struct SrssEntry {
	parent: Weak<SharedRss>,
	flow: FlowSpec,
	ring: MbufRing,
	enqueue_cnt: AtomicU64,
	enqueue_fail_cnt: AtomicU64,
	unlinked: AtomicBool,
}

impl SrssEntry {
	pub fn queue_id(&self) -> u16 {
		0
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
		!self.flow.sys_queue
			&& (self.flow.no_ip_flow || self.flow.dip == dst_ip)
			&& (self.flow.no_port_flow || self.flow.dst_port == dst_port)
	}

	fn deliver(&self, batch: impl ExactSizeIterator<Item = Mbuf>) {
		let n = batch.len() as u64;
		match self.ring.enqueue_bulk(batch) {
			Ok(()) => {
				self.enqueue_cnt.fetch_add(n, Ordering::Relaxed);
			}
			Err(batch) => {
				drop(batch);
				self.enqueue_fail_cnt.fetch_add(n, Ordering::Relaxed);
			}
		}
	}

	pub fn burst(&self, pkts: &mut Vec<Mbuf>, max: u16) -> u16 {
		self.ring.burst(pkts, max)
	}

	pub(crate) fn unlink(&self) {
		if self.unlinked.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(parent) = self.parent.upgrade() {
			parent.unlink(self);
		}
		self.ring.drain();
	}
}

impl Drop for SrssEntry {
	fn drop(&mut self) {
		self.unlink();
	}
}

pub(crate) struct SrssTasklet {
	srss: Arc<SharedRss>,
	scratch: Vec<Mbuf>,
}

impl Tasklet for SrssTasklet {
	fn name(&self) -> &str {
		"shared_rss"
	}

	fn poll(&mut self) -> Progress {
		let srss = &self.srss;
		let mut any = false;

		for queue_id in 0..srss.rx_queues {
			if srss
				.driver
				.rx_burst(queue_id, &mut self.scratch, SRSS_BURST_SIZE)
				== 0
			{
				continue;
			}
			any = true;

			let entries = srss.entries.lock();
			let sys = entries.iter().find(|e| e.flow.sys_queue);
			let mut last: Option<&Arc<SrssEntry>> = None;
			let mut batch: SmallVec<[Mbuf; 32]> = SmallVec::new();

			for m in self.scratch.drain(..) {
				let target = match wire::parse_udp(m.data()) {
					Some(udp) => entries.iter().find(|e| e.matches(udp.dst_ip, udp.dst_port)),
					// residual non-UDP traffic feeds the system entry
					None => sys,
				};
				let Some(target) = target else {
					continue;
				};
				// flush at flow boundaries so each session gets its run of
				// consecutive packets as one bulk
				if let Some(prev) = last
					&& !Arc::ptr_eq(prev, target)
				{
					prev.deliver(batch.drain(..));
				}
				last = Some(target);
				batch.push(m);
			}
			if let Some(prev) = last
				&& !batch.is_empty()
			{
				prev.deliver(batch.drain(..));
			}
		}

		if any { Progress::HasPending } else { Progress::AllDone }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::{DevCaps, LoopbackNic};
	use crate::wire::{UdpFrameSpec, build_udp_frame};
	use smoltcp::wire::EthernetAddress;

	fn frame(dst_ip: Ipv4Addr, dst_port: u16, seq: u8) -> Vec<u8> {
		let mut buf = [0u8; 128];
		let spec = UdpFrameSpec {
			src_mac: EthernetAddress([2, 0, 0, 0, 0, 1]),
			dst_mac: EthernetAddress([2, 0, 0, 0, 0, 2]),
			src_ip: Ipv4Addr::new(10, 0, 0, 1),
			dst_ip,
			src_port: 9000,
			dst_port,
			ttl: 64,
			ipv4_cksum: true,
			udp_cksum: false,
		};
		let len = build_udp_frame(&mut buf, &spec, &[seq]);
		buf[..len].to_vec()
	}

	#[test]
	fn mixed_burst_groups_flush_at_flow_boundaries() {
		let nic = Arc::new(LoopbackNic::new(
			EthernetAddress([2, 0, 0, 0, 0, 2]),
			4,
			1,
			DevCaps::RSS,
		));
		let srss = SharedRss::new(nic.clone() as Arc<dyn NicDriver>);
		let a = SharedRss::get(
			&srss,
			FlowSpec {
				dip: Ipv4Addr::new(239, 0, 0, 1),
				dst_port: 5000,
				..FlowSpec::default()
			},
			64,
		)
		.unwrap();
		let b = SharedRss::get(
			&srss,
			FlowSpec {
				dip: Ipv4Addr::new(239, 0, 0, 2),
				dst_port: 5000,
				..FlowSpec::default()
			},
			64,
		)
		.unwrap();

		// interleaved runs: aa bb a
		for seq in [0u8, 1] {
			nic.inject(&frame(Ipv4Addr::new(239, 0, 0, 1), 5000, seq));
		}
		for seq in [0u8, 1] {
			nic.inject(&frame(Ipv4Addr::new(239, 0, 0, 2), 5000, seq));
		}
		nic.inject(&frame(Ipv4Addr::new(239, 0, 0, 1), 5000, 2));

		let mut tasklet = SharedRss::tasklet(&srss);
		assert_eq!(tasklet.poll(), Progress::HasPending);
		assert_eq!(tasklet.poll(), Progress::AllDone);

		let mut got = Vec::new();
		a.burst(&mut got, 16);
		let seqs: Vec<u8> = got
			.iter()
			.map(|m| *wire::parse_udp(m.data()).unwrap().payload.first().unwrap())
			.collect();
		assert_eq!(seqs, vec![0, 1, 2]);
		assert_eq!(a.enqueue_count(), 3);

		got.clear();
		b.burst(&mut got, 16);
		assert_eq!(got.len(), 2);
		assert_eq!(b.enqueue_count(), 2);
		assert_eq!(b.enqueue_fail_count(), 0);
	}

	#[test]
	fn duplicate_flow_refused() {
		let nic = Arc::new(LoopbackNic::new(
			EthernetAddress([2, 0, 0, 0, 0, 2]),
			2,
			1,
			DevCaps::RSS,
		));
		let srss = SharedRss::new(nic as Arc<dyn NicDriver>);
		let flow = FlowSpec {
			dip: Ipv4Addr::new(239, 0, 0, 1),
			dst_port: 5000,
			..FlowSpec::default()
		};
		let _a = SharedRss::get(&srss, flow.clone(), 16).unwrap();
		assert!(matches!(
			SharedRss::get(&srss, flow, 16),
			Err(Error::InvalidFlow(_))
		));
	}

	#[test]
	fn unlink_removes_entry() {
		let nic = Arc::new(LoopbackNic::new(
			EthernetAddress([2, 0, 0, 0, 0, 2]),
			2,
			1,
			DevCaps::RSS,
		));
		let srss = SharedRss::new(nic as Arc<dyn NicDriver>);
		let a = SharedRss::get(
			&srss,
			FlowSpec {
				dip: Ipv4Addr::new(239, 0, 0, 1),
				dst_port: 5000,
				..FlowSpec::default()
			},
			16,
		)
		.unwrap();
		assert_eq!(srss.entry_count(), 1);
		a.unlink();
		assert_eq!(srss.entry_count(), 0);
	}
}
