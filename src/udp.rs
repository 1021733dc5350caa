//! POSIX-shaped one-to-one UDP sockets on top of the queue handles.
//!
//! A socket is `AF_INET` + `SOCK_DGRAM` semantics only. `bind` installs a
//! destination-port RX flow; the TX side comes up lazily on the first
//! `sendto`, staging the Ethernet/IPv4/UDP header template once and
//! resolving the destination MAC through ARP (or an explicit override).
//! Receive either polls inline, or, with `UDP_LCORE`, is serviced by a
//! scheduler tasklet that wakes blocked readers through a watermark/timeout
//! condvar.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use hermit_sync::SpinMutex;
use smoltcp::wire::{EthernetAddress, EthernetFrame, Ipv4Packet, UdpPacket};

use crate::config::InitFlags;
use crate::error::{Error, Result};
use crate::mcast::{McastGuard, McastMgr};
use crate::mempool::Mbuf;
use crate::queue::{FlowSpec, MAX_BURST, RxqHandle, TxFlowSpec, TxqHandle};
use crate::ring::MbufRing;
use crate::sched::{Progress, Tasklet, TaskletHandle};
use crate::stack::Stack;
use crate::wire::{
	self, ETH_HDR_LEN, IPV4_HDR_LEN, UDP_HDR_LEN, UDP_HDRS_LEN, UdpFrameSpec,
};

/// Largest datagram the facade accepts.
pub const UDP_MAX_BYTES: usize = 1460;

/// Default TX rate limit: 50 Gbit/s expressed in bytes.
const UDP_DEFAULT_RL_BPS: u64 = 50 * 1024 * 1024 * 1024 / 8;

/// Groups one socket may join at most.
const UDP_MCAST_GROUP_MAX: usize = 8;

const EPHEMERAL_BASE: u16 = 0xc000;

bitflags! {
	/// Per-call receive flags.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MsgFlags: u32 {
		/// Return immediately instead of blocking.
		const DONTWAIT = 1 << 0;
	}
}

struct SockCfg {
	sndbuf: u32,
	rcvbuf: u32,
	/// Zero blocks indefinitely.
	rcvtimeo: Duration,
	arp_timeout: Duration,
	tx_timeout: Duration,
	txq_bps: u64,
	rx_ring_count: usize,
	wake_thresh_count: usize,
	wake_timeout: Duration,
	rx_poll_sleep: Duration,
	tx_mac: Option<EthernetAddress>,
}

impl Default for SockCfg {
	fn default() -> Self {
		Self {
			sndbuf: 256 * 1024,
			rcvbuf: 256 * 1024,
			rcvtimeo: Duration::ZERO,
			arp_timeout: Duration::from_secs(2),
			tx_timeout: Duration::from_millis(100),
			txq_bps: UDP_DEFAULT_RL_BPS,
			rx_ring_count: 1024,
			wake_thresh_count: 32,
			wake_timeout: Duration::from_millis(1),
			rx_poll_sleep: Duration::ZERO,
			tx_mac: None,
		}
	}
}

struct TxState {
	txq: TxqHandle,
	template: [u8; UDP_HDRS_LEN],
}

struct RxState {
	handle: RxqHandle,
	ring: MbufRing,
	dst_port: u16,
	lcore: bool,
	wake_lock: Mutex<bool>,
	wake_cond: Condvar,
	wake_thresh: usize,
	wake_timeout: Duration,
	last_wake: SpinMutex<Instant>,
	enq_fail: AtomicU64,
	not_udp: AtomicU64,
}

impl RxState {
	/// Moves packets from the queue handle into the socket ring, validating
	/// that they are UDP on the way.
	fn pump(&self) -> u16 {
		let mut scratch: Vec<Mbuf> = Vec::with_capacity(usize::from(MAX_BURST));
		let rx = self.handle.burst(&mut scratch, MAX_BURST);
		if rx == 0 {
			return 0;
		}
		let mut moved = 0;
		for m in scratch.drain(..) {
			let valid = wire::parse_udp(m.data()).is_some_and(|u| u.dst_port == self.dst_port);
			if !valid {
				self.not_udp.fetch_add(1, Ordering::Relaxed);
				continue;
			}
			match self.ring.enqueue(m) {
				Ok(()) => moved += 1,
				Err(m) => {
					drop(m);
					self.enq_fail.fetch_add(1, Ordering::Relaxed);
				}
			}
		}
		moved
	}

	fn wake(&self) {
		let mut woken = self.wake_lock.lock().unwrap();
		*woken = true;
		self.wake_cond.notify_all();
	}

	fn timedwait(&self, timeout: Duration) {
		let woken = self.wake_lock.lock().unwrap();
		if *woken {
			drop(woken);
			*self.wake_lock.lock().unwrap() = false;
			return;
		}
		let (mut woken, _) = self.wake_cond.wait_timeout(woken, timeout).unwrap();
		*woken = false;
	}
}

struct UdpRxTasklet {
	name: String,
	rx: Arc<RxState>,
}

impl Tasklet for UdpRxTasklet {
	fn name(&self) -> &str {
		&self.name
	}

	fn poll(&mut self) -> Progress {
		let moved = self.rx.pump();
		let count = self.rx.ring.len();
		if count > 0 {
			let due = {
				let last = *self.rx.last_wake.lock();
				count >= self.rx.wake_thresh || last.elapsed() >= self.rx.wake_timeout
			};
			if due {
				self.rx.wake();
				*self.rx.last_wake.lock() = Instant::now();
			}
		}
		if moved > 0 {
			Progress::HasPending
		} else {
			Progress::AllDone
		}
	}

	fn stop(&mut self) {
		self.rx.wake();
	}
}

#[derive(Default)]
struct SockStats {
	tx_pkts: AtomicU64,
	tx_bytes: AtomicU64,
	rx_pkts: AtomicU64,
	rx_bytes: AtomicU64,
	arp_fail: AtomicU64,
}

/// One-to-one UDP socket.
pub struct UdpSocket {
	stack: Arc<Stack>,
	port_idx: usize,
	idx: usize,
	alive: AtomicBool,
	cfg: Mutex<SockCfg>,
	bound: SpinMutex<Option<SocketAddrV4>>,
	tx: Mutex<Option<TxState>>,
	rx: Mutex<Option<Arc<RxState>>>,
	rx_tasklet: Mutex<Option<TaskletHandle>>,
	mcast: SpinMutex<Vec<McastGuard>>,
	stats: SockStats,
}

impl UdpSocket {
	/// The `socket(AF_INET, SOCK_DGRAM, 0)` analogue on one port.
	pub fn new(stack: &Arc<Stack>, port_idx: usize) -> Result<Self> {
		stack.port(port_idx)?;
		let idx = stack.next_socket_idx();
		debug!("udp {idx}: socket created on port {port_idx}");
		Ok(Self {
			stack: Arc::clone(stack),
			port_idx,
			idx,
			alive: AtomicBool::new(true),
			cfg: Mutex::new(SockCfg::default()),
			bound: SpinMutex::new(None),
			tx: Mutex::new(None),
			rx: Mutex::new(None),
			rx_tasklet: Mutex::new(None),
			mcast: SpinMutex::new(Vec::new()),
			stats: SockStats::default(),
		})
	}

	pub fn port_idx(&self) -> usize {
		self.port_idx
	}

	/// The port's local IP address.
	pub fn sip(&self) -> Ipv4Addr {
		self.stack
			.port(self.port_idx)
			.map(|p| p.sip())
			.unwrap_or(Ipv4Addr::UNSPECIFIED)
	}

	pub fn local_addr(&self) -> Option<SocketAddrV4> {
		*self.bound.lock()
	}

	/// Binds the local UDP port and installs the receive flow. The address
	/// must be `INADDR_ANY` or the port's own IP.
	pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
		let port = self.stack.port(self.port_idx)?;
		if *addr.ip() != Ipv4Addr::UNSPECIFIED && *addr.ip() != port.sip() {
			return Err(Error::InvalidArg("bind address is not the port's ip"));
		}
		if addr.port() == 0 {
			return Err(Error::InvalidArg("bind port zero"));
		}
		let mut rx_slot = self.rx.lock().unwrap();
		if rx_slot.is_some() {
			return Err(Error::InvalidArg("already bound"));
		}

		let cfg = self.cfg.lock().unwrap();
		let flow = FlowSpec {
			no_ip_flow: true,
			dst_port: addr.port(),
			use_cni_queue: self.stack.has_flag(InitFlags::RX_USE_CNI),
			..FlowSpec::default()
		};
		let handle = self
			.stack
			.rxq_get_internal(self.port_idx, flow, cfg.rx_ring_count)?;
		info!(
			"udp {}: bound {addr} on queue {} ({})",
			self.idx,
			handle.queue_id(),
			handle.mode_name()
		);

		let lcore = self.stack.has_flag(InitFlags::UDP_LCORE);
		let rx = Arc::new(RxState {
			handle,
			ring: MbufRing::new(cfg.rx_ring_count),
			dst_port: addr.port(),
			lcore,
			wake_lock: Mutex::new(false),
			wake_cond: Condvar::new(),
			wake_thresh: cfg.wake_thresh_count,
			wake_timeout: cfg.wake_timeout,
			last_wake: SpinMutex::new(Instant::now()),
			enq_fail: AtomicU64::new(0),
			not_udp: AtomicU64::new(0),
		});
		if lcore {
			let tasklet = UdpRxTasklet {
				name: format!("udp-rx-{}", self.idx),
				rx: Arc::clone(&rx),
			};
			*self.rx_tasklet.lock().unwrap() =
				Some(self.stack.main_group().register(Box::new(tasklet)));
		}
		*rx_slot = Some(rx);
		*self.bound.lock() = Some(addr);
		Ok(())
	}

	/// Sends one datagram. The first call brings up the TX queue and the
	/// header template; the destination MAC comes from the multicast
	/// mapping, an explicit override, or ARP on the destination (or the
	/// gateway when off-subnet).
	pub fn sendto(&self, buf: &[u8], addr: SocketAddrV4) -> Result<usize> {
		if buf.len() > UDP_MAX_BYTES {
			return Err(Error::InvalidArg("datagram too large"));
		}
		if !self.alive.load(Ordering::Relaxed) || self.stack.is_aborted() {
			return Err(Error::Aborted);
		}
		let port = self.stack.port(self.port_idx)?;

		let mut tx_slot = self.tx.lock().unwrap();
		if tx_slot.is_none() {
			*tx_slot = Some(self.init_tx(&addr)?);
		}
		let tx = tx_slot.as_mut().unwrap();

		let (arp_timeout, tx_timeout) = {
			let cfg = self.cfg.lock().unwrap();
			(cfg.arp_timeout, cfg.tx_timeout)
		};
		let dst_mac = match self.resolve_dst_mac(&addr, arp_timeout) {
			Ok(mac) => mac,
			Err(Error::Timeout) if arp_timeout.is_zero() => {
				// kernel sendto succeeds before the neighbour resolves;
				// match that and drop the datagram silently
				self.stats.arp_fail.fetch_add(1, Ordering::Relaxed);
				return Ok(buf.len());
			}
			Err(e) => {
				self.stats.arp_fail.fetch_add(1, Ordering::Relaxed);
				return Err(e);
			}
		};

		let mut m = port.alloc_tx()?;
		let frame_len = UDP_HDRS_LEN + buf.len();
		{
			let data = m.data_mut();
			data[..UDP_HDRS_LEN].copy_from_slice(&tx.template);
			data[UDP_HDRS_LEN..frame_len].copy_from_slice(buf);
			patch_frame(
				&mut data[..frame_len],
				dst_mac,
				*addr.ip(),
				addr.port(),
				buf.len(),
				!port.offloads_ipv4_cksum(),
			);
		}
		m.set_len(frame_len);

		let mut pkts = vec![m];
		let sent = tx.txq.burst_busy(&mut pkts, tx_timeout);
		if sent < 1 {
			return Err(Error::Timeout);
		}
		self.stats.tx_pkts.fetch_add(1, Ordering::Relaxed);
		self.stats
			.tx_bytes
			.fetch_add(buf.len() as u64, Ordering::Relaxed);
		Ok(buf.len())
	}

	/// Receives one datagram into `buf`, returning the byte count and the
	/// sender. Blocking behaviour follows `rcvtimeo` unless `DONTWAIT`.
	pub fn recvfrom(&self, buf: &mut [u8], flags: MsgFlags) -> Result<(usize, SocketAddrV4)> {
		let rx = self
			.rx
			.lock()
			.unwrap()
			.clone()
			.ok_or(Error::InvalidArg("socket not bound"))?;

		let rcvtimeo = {
			let cfg = self.cfg.lock().unwrap();
			(cfg.rcvtimeo, cfg.rx_poll_sleep)
		};
		let (rcvtimeo, poll_sleep) = rcvtimeo;
		let deadline = (!rcvtimeo.is_zero()).then(|| Instant::now() + rcvtimeo);

		loop {
			if !rx.lcore {
				rx.pump();
			}
			if let Some(m) = rx.ring.dequeue() {
				let udp = wire::parse_udp(m.data()).ok_or(Error::Protocol)?;
				let n = udp.payload.len().min(buf.len());
				buf[..n].copy_from_slice(&udp.payload[..n]);
				self.stats.rx_pkts.fetch_add(1, Ordering::Relaxed);
				self.stats.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
				return Ok((n, SocketAddrV4::new(udp.src_ip, udp.src_port)));
			}

			if flags.contains(MsgFlags::DONTWAIT) {
				return Err(Error::Timeout);
			}
			if !self.alive.load(Ordering::Relaxed) || self.stack.is_aborted() {
				return Err(Error::Aborted);
			}
			if let Some(deadline) = deadline
				&& Instant::now() >= deadline
			{
				return Err(Error::Timeout);
			}

			if rx.lcore {
				rx.timedwait(rx.wake_timeout);
			} else if poll_sleep.is_zero() {
				std::thread::yield_now();
			} else {
				std::thread::sleep(poll_sleep);
			}
		}
	}

	/// Waits until any of `fds` has data to read; returns how many do.
	/// A zero timeout polls once.
	pub fn poll(fds: &mut [PollFd<'_>], timeout: Duration) -> Result<usize> {
		if fds.is_empty() {
			return Err(Error::InvalidArg("empty poll set"));
		}
		let deadline = Instant::now() + timeout;
		loop {
			let mut ready = 0;
			for fd in fds.iter_mut() {
				let rx = fd
					.socket
					.rx
					.lock()
					.unwrap()
					.clone()
					.ok_or(Error::InvalidArg("socket not bound"))?;
				if !rx.lcore {
					rx.pump();
				}
				fd.readable = !rx.ring.is_empty();
				if fd.readable {
					ready += 1;
				}
			}
			if ready > 0 {
				return Ok(ready);
			}
			if fds[0].socket.stack.is_aborted() {
				return Err(Error::Aborted);
			}
			if Instant::now() >= deadline {
				return Ok(0);
			}
			std::thread::sleep(Duration::from_micros(200).min(
				deadline.saturating_duration_since(Instant::now()),
			));
		}
	}

	/* socket options */

	pub fn set_sndbuf(&self, bytes: u32) {
		self.cfg.lock().unwrap().sndbuf = bytes;
	}

	pub fn sndbuf(&self) -> u32 {
		self.cfg.lock().unwrap().sndbuf
	}

	pub fn set_rcvbuf(&self, bytes: u32) {
		self.cfg.lock().unwrap().rcvbuf = bytes;
	}

	pub fn rcvbuf(&self) -> u32 {
		self.cfg.lock().unwrap().rcvbuf
	}

	/// `SO_RCVTIMEO`; zero blocks indefinitely.
	pub fn set_rcvtimeo(&self, timeout: Duration) {
		self.cfg.lock().unwrap().rcvtimeo = timeout;
	}

	pub fn rcvtimeo(&self) -> Duration {
		self.cfg.lock().unwrap().rcvtimeo
	}

	/// Overrides ARP with a fixed destination MAC.
	pub fn set_tx_mac(&self, mac: EthernetAddress) {
		self.cfg.lock().unwrap().tx_mac = Some(mac);
	}

	/// Shapes the TX queue; only before the first `sendto`.
	pub fn set_tx_rate(&self, bytes_per_sec: u64) -> Result<()> {
		if self.tx.lock().unwrap().is_some() {
			return Err(Error::InvalidArg("tx queue already up"));
		}
		self.cfg.lock().unwrap().txq_bps = bytes_per_sec;
		Ok(())
	}

	pub fn set_tx_timeout(&self, timeout: Duration) {
		self.cfg.lock().unwrap().tx_timeout = timeout;
	}

	pub fn set_rx_timeout(&self, timeout: Duration) {
		self.set_rcvtimeo(timeout);
	}

	pub fn set_arp_timeout(&self, timeout: Duration) {
		self.cfg.lock().unwrap().arp_timeout = timeout;
	}

	/// Ring depth for the receive side; only before `bind`.
	pub fn set_rx_ring_count(&self, count: usize) -> Result<()> {
		if self.rx.lock().unwrap().is_some() {
			return Err(Error::InvalidArg("socket already bound"));
		}
		self.cfg.lock().unwrap().rx_ring_count = count;
		Ok(())
	}

	pub fn set_wake_thresh_count(&self, count: usize) -> Result<()> {
		if self.rx.lock().unwrap().is_some() {
			return Err(Error::InvalidArg("socket already bound"));
		}
		self.cfg.lock().unwrap().wake_thresh_count = count;
		Ok(())
	}

	pub fn set_wake_timeout(&self, timeout: Duration) -> Result<()> {
		if self.rx.lock().unwrap().is_some() {
			return Err(Error::InvalidArg("socket already bound"));
		}
		self.cfg.lock().unwrap().wake_timeout = timeout;
		Ok(())
	}

	pub fn set_rx_poll_sleep(&self, sleep: Duration) {
		self.cfg.lock().unwrap().rx_poll_sleep = sleep;
	}

	/// Whether `dip` is reachable from this socket's port: multicast, same
	/// subnet, or via a configured gateway.
	pub fn tx_valid_ip(&self, dip: Ipv4Addr) -> Result<()> {
		let port = self.stack.port(self.port_idx)?;
		if dip.is_multicast() || port.is_local(dip) {
			return Ok(());
		}
		if port.ip_config().gateway != Ipv4Addr::UNSPECIFIED {
			return Ok(());
		}
		Err(Error::InvalidArg("destination unreachable"))
	}

	/// `IP_ADD_MEMBERSHIP`: bounded per-socket group table.
	pub fn add_membership(&self, group: Ipv4Addr) -> Result<()> {
		let port = self.stack.port(self.port_idx)?;
		let mut mcast = self.mcast.lock();
		if mcast.len() >= UDP_MCAST_GROUP_MAX {
			return Err(Error::NoResource("socket group table full"));
		}
		if mcast.iter().any(|g| g.group() == group) {
			return Err(Error::InvalidArg("already a member"));
		}
		mcast.push(McastMgr::join(&port.mcast, group)?);
		Ok(())
	}

	/// `IP_DROP_MEMBERSHIP`.
	pub fn drop_membership(&self, group: Ipv4Addr) -> Result<()> {
		let mut mcast = self.mcast.lock();
		let before = mcast.len();
		mcast.retain(|g| g.group() != group);
		if mcast.len() == before {
			return Err(Error::InvalidArg("not a member"));
		}
		Ok(())
	}

	/// Logs and resets the socket counters.
	pub fn stat_dump(&self) {
		let tx = self.stats.tx_pkts.swap(0, Ordering::Relaxed);
		let rx = self.stats.rx_pkts.swap(0, Ordering::Relaxed);
		let arp_fail = self.stats.arp_fail.swap(0, Ordering::Relaxed);
		if tx + rx + arp_fail > 0 {
			info!("udp {}: tx {tx} rx {rx} arp_fail {arp_fail}", self.idx);
		}
		if let Some(rx_state) = self.rx.lock().unwrap().as_ref() {
			let fails = rx_state.enq_fail.swap(0, Ordering::Relaxed);
			if fails > 0 {
				warn!("udp {}: {fails} rx enqueue fails", self.idx);
			}
		}
	}

	/// Closes the socket, flushing and releasing its queues.
	pub fn close(self) {}

	fn init_tx(&self, addr: &SocketAddrV4) -> Result<TxState> {
		let port = self.stack.port(self.port_idx)?;
		let cfg = self.cfg.lock().unwrap();
		let src_port = match *self.bound.lock() {
			Some(bound) => bound.port(),
			None if self.stack.has_flag(InitFlags::RANDOM_SRC_PORT) => {
				let nanos = std::time::SystemTime::now()
					.duration_since(std::time::UNIX_EPOCH)
					.unwrap_or_default()
					.subsec_nanos();
				EPHEMERAL_BASE | (nanos as u16 & 0x3fff)
			}
			None => EPHEMERAL_BASE + self.idx as u16,
		};
		let flow = TxFlowSpec {
			bytes_per_sec: cfg.txq_bps,
			dip: *addr.ip(),
			dst_port: addr.port(),
			..TxFlowSpec::default()
		};
		let txq = self.stack.txq_get(self.port_idx, flow)?;

		// stage the constant header parts; destination fields are patched
		// per datagram
		let mut template = [0u8; UDP_HDRS_LEN];
		let spec = UdpFrameSpec {
			src_mac: port.mac(),
			dst_mac: EthernetAddress::BROADCAST,
			src_ip: port.sip(),
			dst_ip: *addr.ip(),
			src_port,
			dst_port: addr.port(),
			ttl: 64,
			ipv4_cksum: false,
			udp_cksum: false,
		};
		wire::build_udp_frame(&mut template, &spec, &[]);

		info!(
			"udp {}: tx up on queue {} src port {src_port}",
			self.idx,
			txq.queue_id()
		);
		Ok(TxState { txq, template })
	}

	fn resolve_dst_mac(
		&self,
		addr: &SocketAddrV4,
		arp_timeout: Duration,
	) -> Result<EthernetAddress> {
		let dip = *addr.ip();
		if dip.is_multicast() {
			return Ok(wire::multicast_mac(dip));
		}
		if dip == Ipv4Addr::BROADCAST {
			return Ok(EthernetAddress::BROADCAST);
		}
		if let Some(mac) = self.cfg.lock().unwrap().tx_mac {
			return Ok(mac);
		}
		let port = self.stack.port(self.port_idx)?;
		let next_hop = if port.is_local(dip) {
			dip
		} else {
			let gw = port.ip_config().gateway;
			if gw == Ipv4Addr::UNSPECIFIED {
				return Err(Error::InvalidArg("no route to destination"));
			}
			gw
		};
		self.stack.arp(self.port_idx)?.resolve(next_hop, arp_timeout)
	}
}

impl Drop for UdpSocket {
	fn drop(&mut self) {
		self.alive.store(false, Ordering::Relaxed);
		if let Some(rx) = self.rx.lock().unwrap().as_ref() {
			rx.wake();
		}
		// retire the rx tasklet before the ring goes away
		self.rx_tasklet.lock().unwrap().take();
		if let Some(tx) = self.tx.lock().unwrap().take()
			&& let Ok(port) = self.stack.port(self.port_idx)
		{
			tx.txq.flush(&port.pad());
		}
		debug!("udp {}: closed", self.idx);
	}
}

/// One entry of a [`UdpSocket::poll`] set.
pub struct PollFd<'a> {
	pub socket: &'a UdpSocket,
	/// Set when the socket has data to read.
	pub readable: bool,
}

impl<'a> PollFd<'a> {
	pub fn new(socket: &'a UdpSocket) -> Self {
		Self {
			socket,
			readable: false,
		}
	}
}

fn patch_frame(
	frame: &mut [u8],
	dst_mac: EthernetAddress,
	dst_ip: Ipv4Addr,
	dst_port: u16,
	payload_len: usize,
	ipv4_cksum: bool,
) {
	let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
	eth.set_dst_addr(dst_mac);

	let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETH_HDR_LEN..]);
	ip.set_dst_addr(dst_ip);
	ip.set_total_len((IPV4_HDR_LEN + UDP_HDR_LEN + payload_len) as u16);
	ip.set_checksum(0);
	if ipv4_cksum {
		ip.fill_checksum();
	}

	let mut udp = UdpPacket::new_unchecked(&mut frame[ETH_HDR_LEN + IPV4_HDR_LEN..]);
	udp.set_dst_port(dst_port);
	udp.set_len((UDP_HDR_LEN + payload_len) as u16);
	udp.set_checksum(0);
}
