//! A software NIC that loops transmitted frames back to its receive queues,
//! honouring installed flow rules. It backs the test suite and any
//! deployment that wants the datapath without hardware underneath.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hermit_sync::SpinMutex;
use smoltcp::wire::EthernetAddress;

use crate::driver::{DevCaps, DevInfo, FlowId, LinkStatus, NicDriver};
use crate::error::{Error, Result};
use crate::mempool::{Mbuf, Mempool};
use crate::queue::FlowSpec;
use crate::wire;

struct LoopRule {
	id: FlowId,
	queue_id: u16,
	spec: FlowSpec,
}

pub struct LoopbackNic {
	info: DevInfo,
	mac: EthernetAddress,
	/// Backs frames injected from the outside of the datapath.
	pool: Mempool,
	rx_queues: Vec<SpinMutex<VecDeque<Mbuf>>>,
	rules: SpinMutex<Vec<LoopRule>>,
	tx_log: SpinMutex<VecDeque<Vec<u8>>>,
	next_flow: AtomicU64,
	loop_tx: AtomicBool,
}

impl LoopbackNic {
	pub fn new(mac: EthernetAddress, rx_queues: u16, tx_queues: u16, caps: DevCaps) -> Self {
		Self {
			info: DevInfo {
				max_tx_queues: tx_queues,
				max_rx_queues: rx_queues,
				tx_desc_count: 32,
				caps,
			},
			mac,
			pool: Mempool::new("loop-nic", 1024, 2048),
			rx_queues: (0..rx_queues)
				.map(|_| SpinMutex::new(VecDeque::new()))
				.collect(),
			rules: SpinMutex::new(Vec::new()),
			tx_log: SpinMutex::new(VecDeque::new()),
			next_flow: AtomicU64::new(1),
			loop_tx: AtomicBool::new(true),
		}
	}

	/// Whether transmitted frames are looped back to the receive side.
	/// Logging to the TX tap is unaffected.
	pub fn set_loop_tx(&self, on: bool) {
		self.loop_tx.store(on, Ordering::Relaxed);
	}

	/// Feeds a raw frame into the receive path, as if it arrived on the wire.
	pub fn inject(&self, frame: &[u8]) -> bool {
		match self.pool.alloc_from(frame) {
			Some(m) => self.route(m),
			None => false,
		}
	}

	/// Drains the transmit tap: every frame sent since the last call.
	pub fn take_tx(&self) -> Vec<Vec<u8>> {
		self.tx_log.lock().drain(..).collect()
	}

	/// Steers one frame to a receive queue the way flow-rule hardware would:
	/// first exact match wins, the sys rule catches the rest, and with no
	/// rules at all the frame is spread RSS-style.
	fn route(&self, m: Mbuf) -> bool {
		let (dst_ip, dst_port, is_udp) = match wire::parse_udp(m.data()) {
			Some(u) => (Some(u.dst_ip), u.dst_port, true),
			None => (None, 0, false),
		};

		let queue_id = {
			let rules = self.rules.lock();
			let mut sys = None;
			let mut hit = None;
			for rule in rules.iter() {
				if rule.spec.sys_queue {
					sys = Some(rule.queue_id);
					continue;
				}
				if !is_udp {
					continue;
				}
				if !rule.spec.no_ip_flow && Some(rule.spec.dip) != dst_ip {
					continue;
				}
				if !rule.spec.no_port_flow && rule.spec.dst_port != dst_port {
					continue;
				}
				hit = Some(rule.queue_id);
				break;
			}
			match (hit, sys, rules.is_empty()) {
				(Some(q), _, _) => q,
				(None, Some(q), _) => q,
				(None, None, true) => self.rss_spread(dst_ip, dst_port, is_udp),
				(None, None, false) => return false,
			}
		};

		self.rx_queues[queue_id as usize].lock().push_back(m);
		true
	}

	fn rss_spread(&self, dst_ip: Option<std::net::Ipv4Addr>, dst_port: u16, is_udp: bool) -> u16 {
		if !is_udp {
			return 0;
		}
		let ip = dst_ip.map_or(0, |a| u32::from(a));
		let hash = ip ^ u32::from(dst_port).rotate_left(16);
		(hash % u32::from(self.info.max_rx_queues)) as u16
	}
}

impl NicDriver for LoopbackNic {
	fn dev_info(&self) -> DevInfo {
		self.info
	}

	fn mac_addr(&self) -> EthernetAddress {
		self.mac
	}

	fn link(&self) -> LinkStatus {
		LinkStatus {
			up: true,
			speed_mbps: 10_000,
		}
	}

	fn rx_burst(&self, queue_id: u16, pkts: &mut Vec<Mbuf>, max: u16) -> u16 {
		let mut queue = self.rx_queues[queue_id as usize].lock();
		let mut got = 0;
		while got < max {
			match queue.pop_front() {
				Some(m) => {
					pkts.push(m);
					got += 1;
				}
				None => break,
			}
		}
		got
	}

	fn tx_burst(&self, queue_id: u16, pkts: &mut Vec<Mbuf>) -> u16 {
		debug_assert!(queue_id < self.info.max_tx_queues);
		let n = pkts.len();
		for m in pkts.drain(..) {
			self.tx_log.lock().push_back(m.data().to_vec());
			if self.loop_tx.load(Ordering::Relaxed) {
				self.route(m);
			}
		}
		n as u16
	}

	fn rx_flow_install(&self, queue_id: u16, flow: &FlowSpec) -> Result<FlowId> {
		if !self.info.caps.contains(DevCaps::FLOW_RULES) {
			return Err(Error::HardwareReject);
		}
		if queue_id >= self.info.max_rx_queues {
			return Err(Error::HardwareReject);
		}
		let id = FlowId(self.next_flow.fetch_add(1, Ordering::Relaxed));
		self.rules.lock().push(LoopRule {
			id,
			queue_id,
			spec: flow.clone(),
		});
		Ok(id)
	}

	fn rx_flow_remove(&self, flow: FlowId) -> Result<()> {
		let mut rules = self.rules.lock();
		let before = rules.len();
		rules.retain(|r| r.id != flow);
		if rules.len() == before {
			return Err(Error::InvalidArg("unknown flow id"));
		}
		Ok(())
	}
}
