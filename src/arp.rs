//! ARP (RFC 826): request/reply handling and a bounded resolution cache.
//!
//! The cache is a fixed slot array of POD entries. A slot's MAC is packed
//! into one atomic word and published by a release store on `ready`;
//! readers pair it with an acquire load, so a reader never sees a MAC that
//! was not fully written. There is no unsolicited learning: only replies
//! addressed to this port fill slots that a resolver claimed beforehand.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hermit_sync::SpinMutex;
use smoltcp::wire::{
	ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
};

use crate::error::{Error, Result};
use crate::mempool::Mbuf;
use crate::port::PortIf;
use crate::wire::ETH_HDR_LEN;

const ARP_ENTRY_MAX: usize = 60;
const ARP_PKT_LEN: usize = ETH_HDR_LEN + 28;
const RETRY_INTERVAL: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(2);

struct ArpSlot {
	/// Big-endian IPv4 address; zero marks a free slot.
	ip: AtomicU32,
	/// MAC packed into the low 48 bits, published via `ready`.
	mac: AtomicU64,
	ready: AtomicBool,
}

impl ArpSlot {
	const fn empty() -> Self {
		Self {
			ip: AtomicU32::new(0),
			mac: AtomicU64::new(0),
			ready: AtomicBool::new(false),
		}
	}
}

fn pack_mac(mac: EthernetAddress) -> u64 {
	let b = mac.as_bytes();
	u64::from(b[0]) << 40
		| u64::from(b[1]) << 32
		| u64::from(b[2]) << 24
		| u64::from(b[3]) << 16
		| u64::from(b[4]) << 8
		| u64::from(b[5])
}

fn unpack_mac(v: u64) -> EthernetAddress {
	EthernetAddress([
		(v >> 40) as u8,
		(v >> 32) as u8,
		(v >> 24) as u8,
		(v >> 16) as u8,
		(v >> 8) as u8,
		v as u8,
	])
}

pub struct Arp {
	port: Arc<PortIf>,
	aborted: Arc<AtomicBool>,
	slots: Box<[ArpSlot]>,
	/// Serializes slot claims and table resets; never taken on lookups.
	claim: SpinMutex<()>,
}

impl Arp {
	pub(crate) fn new(port: Arc<PortIf>, aborted: Arc<AtomicBool>) -> Arc<Self> {
		Arc::new(Self {
			port,
			aborted,
			slots: (0..ARP_ENTRY_MAX).map(|_| ArpSlot::empty()).collect(),
			claim: SpinMutex::new(()),
		})
	}

	/// Handles one inbound ARP payload (Ethernet header already consumed).
	/// Malformed or foreign packets are silently dropped.
	pub(crate) fn on_packet(&self, payload: &[u8]) {
		let Ok(packet) = ArpPacket::new_checked(payload) else {
			return;
		};
		let Ok(repr) = ArpRepr::parse(&packet) else {
			return;
		};
		match repr {
			ArpRepr::EthernetIpv4 {
				operation,
				source_hardware_addr,
				source_protocol_addr,
				target_protocol_addr,
				..
			} => {
				if target_protocol_addr != self.port.sip() {
					return;
				}
				match operation {
					ArpOperation::Request => {
						self.send_reply(source_hardware_addr, source_protocol_addr);
					}
					ArpOperation::Reply => {
						self.learn(source_protocol_addr, source_hardware_addr);
					}
					ArpOperation::Unknown(op) => {
						debug!("arp: opcode {op} unimplemented");
					}
				}
			}
			_ => {}
		}
	}

	/// Snapshot lookup without sending anything.
	pub fn cached(&self, ip: Ipv4Addr) -> Option<EthernetAddress> {
		let ip_be = u32::from(ip);
		for slot in &self.slots {
			if slot.ip.load(Ordering::Relaxed) == ip_be && slot.ready.load(Ordering::Acquire) {
				return Some(unpack_mac(slot.mac.load(Ordering::Relaxed)));
			}
		}
		None
	}

	/// Blocking resolution: broadcasts a request every 500 ms until the
	/// reply lands, the timeout expires or shutdown is requested. A zero
	/// timeout waits indefinitely.
	pub fn resolve(&self, ip: Ipv4Addr, timeout: Duration) -> Result<EthernetAddress> {
		if let Some(mac) = self.cached(ip) {
			return Ok(mac);
		}
		let ip_be = u32::from(ip);
		let slot = self.claim_slot(ip_be);

		let request = self.build_request(ip)?;
		let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
		let mut next_send = Instant::now();
		let mut retry = 0u32;

		loop {
			if self.slots[slot].ready.load(Ordering::Acquire) {
				if self.slots[slot].ip.load(Ordering::Relaxed) != ip_be {
					// the table was reset and the slot re-claimed underneath
					return Err(Error::Timeout);
				}
				return Ok(unpack_mac(self.slots[slot].mac.load(Ordering::Relaxed)));
			}
			if self.slots[slot].ip.load(Ordering::Relaxed) != ip_be {
				return Err(Error::Timeout);
			}
			if self.aborted.load(Ordering::Relaxed) {
				return Err(Error::Aborted);
			}
			if let Some(deadline) = deadline
				&& Instant::now() >= deadline
			{
				warn!("arp: resolve {ip} timed out after {timeout:?}");
				return Err(Error::Timeout);
			}

			if Instant::now() >= next_send {
				// clone bumps the buffer refcount so the same request can be
				// re-sent next tick; a failed send drops the clone again
				let mut pkts = vec![request.clone()];
				if self.port.tx_sys_burst(&mut pkts) < 1 {
					warn!("arp: request tx failed");
				}
				next_send = Instant::now() + RETRY_INTERVAL;
				retry += 1;
				if retry % 10 == 0 {
					info!("arp: still waiting for {ip} after {retry} requests");
				}
			}
			std::thread::sleep(READY_POLL);
		}
	}

	/// Finds or claims a slot for `ip`. A full table is reset wholesale;
	/// ARP churn is rare enough that wholesale invalidation beats LRU
	/// bookkeeping.
	fn claim_slot(&self, ip_be: u32) -> usize {
		let _guard = self.claim.lock();
		let mut free = None;
		for (i, slot) in self.slots.iter().enumerate() {
			let slot_ip = slot.ip.load(Ordering::Relaxed);
			if slot_ip == ip_be {
				return i;
			}
			if slot_ip == 0 && free.is_none() {
				free = Some(i);
			}
		}
		let i = match free {
			Some(i) => i,
			None => {
				warn!("arp: table full, resetting");
				for slot in &self.slots {
					slot.ready.store(false, Ordering::Release);
					slot.ip.store(0, Ordering::Relaxed);
					slot.mac.store(0, Ordering::Relaxed);
				}
				0
			}
		};
		self.slots[i].ready.store(false, Ordering::Relaxed);
		self.slots[i].mac.store(0, Ordering::Relaxed);
		self.slots[i].ip.store(ip_be, Ordering::Relaxed);
		i
	}

	fn learn(&self, ip: Ipv4Addr, mac: EthernetAddress) {
		let ip_be = u32::from(ip);
		for slot in &self.slots {
			if slot.ip.load(Ordering::Relaxed) == ip_be {
				slot.mac.store(pack_mac(mac), Ordering::Relaxed);
				slot.ready.store(true, Ordering::Release);
				debug!("arp: learned {ip} -> {mac}");
				return;
			}
		}
		// nobody asked for this ip
	}

	fn send_reply(&self, to_mac: EthernetAddress, to_ip: Ipv4Addr) {
		let Ok(mut m) = self.port.alloc_tx() else {
			error!("arp: reply alloc failed");
			return;
		};
		let mac = self.port.mac();
		let sip = self.port.sip();
		{
			let buf = m.data_mut();
			let mut eth = EthernetFrame::new_unchecked(&mut buf[..ARP_PKT_LEN]);
			eth.set_src_addr(mac);
			eth.set_dst_addr(to_mac);
			eth.set_ethertype(EthernetProtocol::Arp);
			let repr = ArpRepr::EthernetIpv4 {
				operation: ArpOperation::Reply,
				source_hardware_addr: mac,
				source_protocol_addr: sip,
				target_hardware_addr: to_mac,
				target_protocol_addr: to_ip,
			};
			repr.emit(&mut ArpPacket::new_unchecked(&mut buf[ETH_HDR_LEN..ARP_PKT_LEN]));
		}
		m.set_len(ARP_PKT_LEN);

		let mut pkts = vec![m];
		if self.port.tx_sys_burst(&mut pkts) < 1 {
			error!("arp: reply tx failed");
		} else {
			debug!("arp: replied to {to_ip}");
		}
	}

	fn build_request(&self, ip: Ipv4Addr) -> Result<Mbuf> {
		let mut m = self.port.alloc_tx()?;
		let mac = self.port.mac();
		let sip = self.port.sip();
		{
			let buf = m.data_mut();
			let mut eth = EthernetFrame::new_unchecked(&mut buf[..ARP_PKT_LEN]);
			eth.set_src_addr(mac);
			eth.set_dst_addr(EthernetAddress::BROADCAST);
			eth.set_ethertype(EthernetProtocol::Arp);
			let repr = ArpRepr::EthernetIpv4 {
				operation: ArpOperation::Request,
				source_hardware_addr: mac,
				source_protocol_addr: sip,
				target_hardware_addr: EthernetAddress([0; 6]),
				target_protocol_addr: ip,
			};
			repr.emit(&mut ArpPacket::new_unchecked(&mut buf[ETH_HDR_LEN..ARP_PKT_LEN]));
		}
		m.set_len(ARP_PKT_LEN);
		Ok(m)
	}
}
