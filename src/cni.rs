//! Control-plane network ingress.
//!
//! One reserved RX queue per port catches everything the session flows do
//! not: ARP, DHCP, PTP and stray streams. Classification strips one VLAN
//! tag, then fans out by ethertype and UDP source port. Sessions that want
//! to stay off the hardware queues can hang a sub-queue (CSQ) off this
//! dispatcher; CNI then fans their flows out by exact (dst_ip, dst_port)
//! match before anything lands in the debug stream table.
//!
//! CNI runs either as its own OS thread with a 1 ms pause between polls, or
//! as a tasklet in the main scheduler group, chosen at init.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use hermit_sync::SpinMutex;
use smoltcp::wire::EthernetProtocol;

use crate::arp::Arp;
use crate::dhcp::Dhcp;
use crate::driver::FlowId;
use crate::error::{Error, Result};
use crate::mempool::Mbuf;
use crate::port::PortIf;
use crate::queue::shared_rx::SharedRxQueue;
use crate::queue::srss::SharedRss;
use crate::queue::{FlowSpec, RxqHandle, RxqSources, SESSION_RING_COUNT, rxq_get};
use crate::ring::MbufRing;
use crate::sched::{Progress, SchedGroup, Tasklet, TaskletHandle};
use crate::wire;

const CNI_RX_BURST_SIZE: u16 = 32;
/// The debug stream table stops growing here; it exists for humans, not for
/// the datapath.
const CNI_STREAM_TABLE_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpLayer {
	L2,
	L4,
}

/// External PTP handler; payload layout is its business.
pub trait PtpSink: Send + Sync {
	fn on_packet(&self, port: usize, layer: PtpLayer, vlan: bool, payload: &[u8]);
}

pub(crate) type PtpSinkSlot = Arc<SpinMutex<Option<Arc<dyn PtpSink>>>>;

type StreamKey = (Ipv4Addr, Ipv4Addr, u16, u16);

/// Per-port ingress state.
pub struct CniPort {
	port: Arc<PortIf>,
	rxq: RxqHandle,
	queue_id: u16,
	arp: Arc<Arp>,
	dhcp: Option<Arc<Dhcp>>,
	ptp_enabled: bool,
	ptp_sink: PtpSinkSlot,
	csqs: SpinMutex<Vec<Arc<CsqEntry>>>,
	streams: SpinMutex<HashMap<StreamKey, u64>>,
	rx_cnt: AtomicU64,
	rx_bytes: AtomicU64,
}

impl CniPort {
	pub(crate) fn new(
		port: &Arc<PortIf>,
		srss: Option<&Arc<SharedRss>>,
		rsq: Option<&Arc<SharedRxQueue>>,
		arp: Arc<Arp>,
		dhcp: Option<Arc<Dhcp>>,
		ptp_enabled: bool,
		ptp_sink: PtpSinkSlot,
	) -> Result<Arc<Self>> {
		let rxq = rxq_get(
			&RxqSources {
				port,
				srss,
				rsq,
				cni: None,
			},
			FlowSpec::sys(),
			SESSION_RING_COUNT,
		)?;
		let queue_id = rxq.queue_id();
		info!(
			"cni {}: ingress on queue {queue_id} ({})",
			port.idx(),
			rxq.mode_name()
		);
		Ok(Arc::new(Self {
			port: Arc::clone(port),
			rxq,
			queue_id,
			arp,
			dhcp,
			ptp_enabled,
			ptp_sink,
			csqs: SpinMutex::new(Vec::new()),
			streams: SpinMutex::new(HashMap::new()),
			rx_cnt: AtomicU64::new(0),
			rx_bytes: AtomicU64::new(0),
		}))
	}

	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn rx_count(&self) -> u64 {
		self.rx_cnt.load(Ordering::Relaxed)
	}

	/// Registers a session sub-queue. A steering rule moves the flow onto
	/// the ingress queue where the NIC supports it; without one the flow
	/// still arrives as residual traffic.
	pub(crate) fn csq_get(
		this: &Arc<Self>,
		flow: FlowSpec,
		ring_count: usize,
	) -> Result<Arc<CsqEntry>> {
		{
			let csqs = this.csqs.lock();
			for e in csqs.iter() {
				if e.flow.dip == flow.dip && e.flow.dst_port == flow.dst_port {
					return Err(Error::InvalidFlow("duplicate (dip, dst_port)"));
				}
			}
		}
		let flow_id = match this.port.driver().rx_flow_install(this.queue_id, &flow) {
			Ok(id) => Some(id),
			Err(Error::HardwareReject) => None,
			Err(e) => return Err(e),
		};
		let entry = Arc::new(CsqEntry {
			parent: Arc::downgrade(this),
			queue_id: this.queue_id,
			flow,
			flow_id: SpinMutex::new(flow_id),
			ring: MbufRing::new(ring_count),
			enqueue_cnt: AtomicU64::new(0),
			enqueue_fail_cnt: AtomicU64::new(0),
			unlinked: AtomicBool::new(false),
		});
		this.csqs.lock().push(Arc::clone(&entry));
		Ok(entry)
	}

	/// One ingress round: burst the queue and classify everything.
	pub(crate) fn poll(&self) -> Progress {
		if let Some(dhcp) = &self.dhcp {
			dhcp.poll_timers();
		}

		let mut pkts: Vec<Mbuf> = Vec::with_capacity(usize::from(CNI_RX_BURST_SIZE));
		let rx = self.rxq.burst(&mut pkts, CNI_RX_BURST_SIZE);
		if rx == 0 {
			return Progress::AllDone;
		}
		self.rx_cnt.fetch_add(u64::from(rx), Ordering::Relaxed);
		for m in pkts.drain(..) {
			self.rx_bytes.fetch_add(m.len() as u64, Ordering::Relaxed);
			self.classify(m);
		}
		Progress::HasPending
	}

	fn classify(&self, m: Mbuf) {
		let frame = m.data();
		let Some((vlan, ethertype, l3)) = wire::strip_vlan(frame) else {
			return;
		};
		match ethertype {
			EthernetProtocol::Unknown(wire::ETHERTYPE_PTP) => {
				if self.ptp_enabled
					&& let Some(sink) = self.ptp_sink.lock().clone()
				{
					sink.on_packet(self.port.idx(), PtpLayer::L2, vlan, l3);
				}
			}
			EthernetProtocol::Arp => self.arp.on_packet(l3),
			EthernetProtocol::Ipv4 => {
				let Some(udp) = wire::parse_udp(frame) else {
					return;
				};
				if self.ptp_enabled
					&& (udp.src_port == wire::PTP_EVENT_PORT
						|| udp.src_port == wire::PTP_GENERAL_PORT)
				{
					if let Some(sink) = self.ptp_sink.lock().clone() {
						sink.on_packet(self.port.idx(), PtpLayer::L4, vlan, udp.payload);
					}
					return;
				}
				if udp.src_port == wire::DHCP_SERVER_PORT {
					if let Some(dhcp) = &self.dhcp {
						dhcp.on_packet(udp.payload);
					}
					return;
				}
				let key = (udp.src_ip, udp.dst_ip, udp.src_port, udp.dst_port);
				let (dst_ip, dst_port) = (udp.dst_ip, udp.dst_port);
				// session fan-out before the debug table
				{
					let csqs = self.csqs.lock();
					if let Some(entry) = csqs.iter().find(|e| e.matches(dst_ip, dst_port)) {
						entry.enqueue(m);
						return;
					}
				}
				self.note_stream(key);
			}
			_ => {}
		}
	}

	/// Remembers unknown UDP streams for diagnostics.
	fn note_stream(&self, key: StreamKey) {
		let mut streams = self.streams.lock();
		if let Some(cnt) = streams.get_mut(&key) {
			*cnt += 1;
			return;
		}
		if streams.len() < CNI_STREAM_TABLE_MAX {
			info!(
				"cni {}: new udp stream {}:{} -> {}:{}",
				self.port.idx(),
				key.0,
				key.2,
				key.1,
				key.3
			);
			streams.insert(key, 1);
		}
	}

	pub fn stream_count(&self, sip: Ipv4Addr, dip: Ipv4Addr, src_port: u16, dst_port: u16) -> u64 {
		self.streams
			.lock()
			.get(&(sip, dip, src_port, dst_port))
			.copied()
			.unwrap_or(0)
	}

	fn csq_unlink(&self, entry: &CsqEntry) {
		self.csqs
			.lock()
			.retain(|e| !std::ptr::eq(Arc::as_ptr(e), entry));
	}

	fn stat_dump(&self) {
		let cnt = self.rx_cnt.swap(0, Ordering::Relaxed);
		let bytes = self.rx_bytes.swap(0, Ordering::Relaxed);
		if cnt > 0 {
			info!(
				"cni {}: rx {cnt} pkts {bytes} bytes since last dump",
				self.port.idx()
			);
		}
	}
}

/// A lightweight per-session queue hanging off the ingress dispatcher.
pub struct CsqEntry {
	parent: Weak<CniPort>,
	queue_id: u16,
	flow: FlowSpec,
	flow_id: SpinMutex<Option<FlowId>>,
	ring: MbufRing,
	enqueue_cnt: AtomicU64,
	enqueue_fail_cnt: AtomicU64,
	unlinked: AtomicBool,
}

impl CsqEntry {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
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
			Err(m) => {
				drop(m);
				self.enqueue_fail_cnt.fetch_add(1, Ordering::Relaxed);
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
			if let Some(flow_id) = self.flow_id.lock().take()
				&& let Err(e) = parent.port.driver().rx_flow_remove(flow_id)
			{
				warn!("cni {}: flow remove failed: {e}", parent.port.idx());
			}
			parent.csq_unlink(self);
		}
		self.ring.drain();
	}
}

impl Drop for CsqEntry {
	fn drop(&mut self) {
		self.unlink();
	}
}

/// The ingress service: per-port state plus the thread or tasklet that
/// drives it.
pub struct Cni {
	ports: Vec<Option<Arc<CniPort>>>,
	lcore_tasklet: bool,
	stop_thread: Arc<AtomicBool>,
	thread: Mutex<Option<JoinHandle<()>>>,
	tasklet: Mutex<Option<TaskletHandle>>,
}

impl Cni {
	pub(crate) fn new(ports: Vec<Option<Arc<CniPort>>>, lcore_tasklet: bool) -> Self {
		Self {
			ports,
			lcore_tasklet,
			stop_thread: Arc::new(AtomicBool::new(false)),
			thread: Mutex::new(None),
			tasklet: Mutex::new(None),
		}
	}

	pub fn port_ctx(&self, idx: usize) -> Option<&Arc<CniPort>> {
		self.ports.get(idx).and_then(|p| p.as_ref())
	}

	fn active_ports(&self) -> Vec<Arc<CniPort>> {
		self.ports.iter().flatten().cloned().collect()
	}

	pub(crate) fn start(&self, group: &SchedGroup) -> Result<()> {
		let ports = self.active_ports();
		if ports.is_empty() {
			return Ok(());
		}
		if self.lcore_tasklet {
			let handle = group.register(Box::new(CniTasklet { ports }));
			*self.tasklet.lock().unwrap() = Some(handle);
		} else {
			let stop = Arc::clone(&self.stop_thread);
			let handle = std::thread::Builder::new()
				.name("mionet-cni".to_string())
				.spawn(move || {
					info!("cni: thread started");
					while !stop.load(Ordering::Acquire) {
						for port in &ports {
							port.poll();
						}
						std::thread::sleep(Duration::from_millis(1));
					}
					info!("cni: thread stopped");
				})
				.map_err(|_| Error::NoResource("cni thread"))?;
			*self.thread.lock().unwrap() = Some(handle);
		}
		Ok(())
	}

	pub(crate) fn stop(&self) {
		self.stop_thread.store(true, Ordering::Release);
		if let Some(handle) = self.thread.lock().unwrap().take() {
			let _ = handle.join();
		}
		// dropping the handle retires the tasklet
		self.tasklet.lock().unwrap().take();
	}

	pub fn stat_dump(&self) {
		for port in self.ports.iter().flatten() {
			port.stat_dump();
		}
	}

	/// How many packets of one stray UDP stream the debug table has seen.
	pub fn stream_count(
		&self,
		port: usize,
		sip: Ipv4Addr,
		dip: Ipv4Addr,
		src_port: u16,
		dst_port: u16,
	) -> u64 {
		self.port_ctx(port)
			.map_or(0, |p| p.stream_count(sip, dip, src_port, dst_port))
	}
}

struct CniTasklet {
	ports: Vec<Arc<CniPort>>,
}

impl Tasklet for CniTasklet {
	fn name(&self) -> &str {
		"cni"
	}

	fn poll(&mut self) -> Progress {
		let mut progress = Progress::AllDone;
		for port in &self.ports {
			if port.poll() == Progress::HasPending {
				progress = Progress::HasPending;
			}
		}
		progress
	}
}
