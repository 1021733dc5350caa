//! DHCPv4 client (RFC 2131).
//!
//! INIT -> DISCOVERING -> REQUESTING -> BOUND, with RENEWING at T1 (half the
//! lease), REBINDING at T2 (7/8 of the lease) and a fall back to INIT when
//! the lease runs out. Timer deadlines are stored as instants and collected
//! by [`Dhcp::poll_timers`] from the control-plane ingress loop, so no timer
//! callback ever re-enters the state mutex. The mutex is released around
//! every transmit.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hermit_sync::SpinMutex;
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};

use crate::port::{IpConfig, PortIf};
use crate::wire::{
	self, DHCP_CLIENT_PORT, DHCP_OP_BOOTREPLY, DHCP_SERVER_PORT, DhcpMessage, DhcpMsgType,
	UdpFrameSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
	Init,
	Discovering,
	Requesting,
	Bound,
	Renewing,
	Rebinding,
}

struct DhcpData {
	state: DhcpState,
	xid: u32,
	ip: Ipv4Addr,
	netmask: Ipv4Addr,
	gateway: Ipv4Addr,
	server_ip: Ipv4Addr,
	dns: Vec<Ipv4Addr>,
	lease: Option<Duration>,
	t1_at: Option<Instant>,
	t2_at: Option<Instant>,
	t_at: Option<Instant>,
}

impl DhcpData {
	fn usable(&self) -> bool {
		matches!(
			self.state,
			DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding
		)
	}
}

pub struct Dhcp {
	port: Arc<PortIf>,
	data: Mutex<DhcpData>,
	rng: SpinMutex<ChaCha8Rng>,
}

impl Dhcp {
	pub(crate) fn new(port: Arc<PortIf>) -> Arc<Self> {
		let mut seed = [0u8; 32];
		let nanos = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap_or_default()
			.subsec_nanos();
		seed[..4].copy_from_slice(&nanos.to_le_bytes());
		seed[4] = port.idx() as u8;
		Arc::new(Self {
			port,
			data: Mutex::new(DhcpData {
				state: DhcpState::Init,
				xid: 0,
				ip: Ipv4Addr::UNSPECIFIED,
				netmask: Ipv4Addr::UNSPECIFIED,
				gateway: Ipv4Addr::UNSPECIFIED,
				server_ip: Ipv4Addr::UNSPECIFIED,
				dns: Vec::new(),
				lease: None,
				t1_at: None,
				t2_at: None,
				t_at: None,
			}),
			rng: SpinMutex::new(ChaCha8Rng::from_seed(seed)),
		})
	}

	pub fn state(&self) -> DhcpState {
		self.data.lock().unwrap().state
	}

	pub fn is_bound(&self) -> bool {
		self.data.lock().unwrap().state == DhcpState::Bound
	}

	pub fn xid(&self) -> u32 {
		self.data.lock().unwrap().xid
	}

	pub fn ip(&self) -> Ipv4Addr {
		let data = self.data.lock().unwrap();
		if !data.usable() {
			debug!("dhcp {}: ip may not be usable yet", self.port.idx());
		}
		data.ip
	}

	pub fn netmask(&self) -> Ipv4Addr {
		let data = self.data.lock().unwrap();
		if !data.usable() {
			debug!("dhcp {}: netmask may not be usable yet", self.port.idx());
		}
		data.netmask
	}

	pub fn gateway(&self) -> Ipv4Addr {
		let data = self.data.lock().unwrap();
		if !data.usable() {
			debug!("dhcp {}: gateway may not be usable yet", self.port.idx());
		}
		data.gateway
	}

	pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
		self.data.lock().unwrap().dns.clone()
	}

	/// `(T1, T2, T)` offsets armed by the last ACK.
	pub fn timers(&self) -> Option<(Duration, Duration, Duration)> {
		let lease = self.data.lock().unwrap().lease?;
		Some((lease / 2, lease * 7 / 8, lease))
	}

	/// Kicks off discovery: a fresh transaction id and a DISCOVER broadcast.
	pub(crate) fn start(&self) {
		let frame = {
			let mut data = self.data.lock().unwrap();
			data.state = DhcpState::Init;
			data.xid = self.new_xid();
			self.make_discover(&mut data)
		};
		self.tx_frame(frame);
		info!("dhcp {}: discover sent", self.port.idx());
	}

	/// Handles one DHCP payload (the UDP payload of a server-port packet).
	pub(crate) fn on_packet(&self, payload: &[u8]) {
		let Some(msg) = DhcpMessage::parse(payload) else {
			debug!("dhcp {}: malformed message dropped", self.port.idx());
			return;
		};
		if msg.op != DHCP_OP_BOOTREPLY {
			debug!("dhcp {}: not a bootreply, op {}", self.port.idx(), msg.op);
			return;
		}

		let mut data = self.data.lock().unwrap();
		if msg.xid != data.xid {
			debug!(
				"dhcp {}: xid mismatch {:#x} != {:#x}",
				self.port.idx(),
				msg.xid,
				data.xid
			);
			return;
		}

		match msg.msg_type {
			DhcpMsgType::Offer => {
				if data.state != DhcpState::Discovering {
					return;
				}
				data.ip = msg.yiaddr;
				if let Some(server) = msg.server_id {
					data.server_ip = server;
				}
				data.state = DhcpState::Requesting;
				info!("dhcp {}: offer {} from {}", self.port.idx(), data.ip, data.server_ip);
				let frame = self.make_request(&data);
				drop(data);
				self.tx_frame(frame);
			}
			DhcpMsgType::Ack => {
				if !matches!(
					data.state,
					DhcpState::Requesting
						| DhcpState::Renewing | DhcpState::Rebinding
						| DhcpState::Bound
				) {
					return;
				}
				self.apply_ack(&mut data, &msg);
				drop(data);
			}
			DhcpMsgType::Nak => {
				info!("dhcp {}: nak, restarting discovery", self.port.idx());
				data.state = DhcpState::Init;
				data.xid = self.new_xid();
				let frame = self.make_discover(&mut data);
				drop(data);
				self.tx_frame(frame);
			}
			other => {
				debug!("dhcp {}: unexpected message {other:?}", self.port.idx());
			}
		}
	}

	/// Collects expired timers. Driven from the control-plane ingress loop.
	pub(crate) fn poll_timers(&self) {
		let now = Instant::now();
		let frame = {
			let mut data = self.data.lock().unwrap();
			match data.state {
				DhcpState::Bound if data.t1_at.is_some_and(|at| now >= at) => {
					// renew: unicast REQUEST to the leasing server
					data.state = DhcpState::Renewing;
					data.t1_at = None;
					info!("dhcp {}: t1, renewing", self.port.idx());
					self.make_request(&data)
				}
				DhcpState::Renewing if data.t2_at.is_some_and(|at| now >= at) => {
					data.state = DhcpState::Rebinding;
					data.t2_at = None;
					info!("dhcp {}: t2, rebinding", self.port.idx());
					self.make_request(&data)
				}
				DhcpState::Rebinding | DhcpState::Renewing
					if data.t_at.is_some_and(|at| now >= at) =>
				{
					// lease gone: start over
					warn!("dhcp {}: lease expired", self.port.idx());
					data.state = DhcpState::Init;
					data.t_at = None;
					data.xid = self.new_xid();
					self.make_discover(&mut data)
				}
				_ => return,
			}
		};
		self.tx_frame(frame);
	}

	/// Sends RELEASE for the bound address and resets. Called at shutdown.
	pub(crate) fn release(&self) {
		let frame = {
			let mut data = self.data.lock().unwrap();
			if !data.usable() {
				return;
			}
			data.xid = self.new_xid();
			let mut msg =
				DhcpMessage::request(DhcpMsgType::Release, data.xid, self.port.mac());
			msg.ciaddr = data.ip;
			msg.requested_ip = Some(data.ip);
			msg.server_id = Some(data.server_ip);
			let frame = self.frame_for(&data, &msg);
			data.state = DhcpState::Init;
			data.t1_at = None;
			data.t2_at = None;
			data.t_at = None;
			frame
		};
		self.tx_frame(frame);
		info!("dhcp {}: released", self.port.idx());
	}

	fn apply_ack(&self, data: &mut DhcpData, msg: &DhcpMessage) {
		data.ip = msg.yiaddr;
		if let Some(mask) = msg.subnet_mask {
			data.netmask = mask;
		}
		if let Some(gw) = msg.router {
			data.gateway = gw;
		}
		if let Some(server) = msg.server_id {
			data.server_ip = server;
		}
		if !msg.dns.is_empty() {
			data.dns = msg.dns.clone();
		}
		let lease = Duration::from_secs(u64::from(msg.lease_secs.unwrap_or(3600)));
		data.lease = Some(lease);
		let now = Instant::now();
		data.t1_at = Some(now + lease / 2);
		data.t2_at = Some(now + lease * 7 / 8);
		data.t_at = Some(now + lease);
		data.state = DhcpState::Bound;

		self.port.set_ip_config(IpConfig {
			sip: data.ip,
			netmask: data.netmask,
			gateway: data.gateway,
		});
		info!(
			"dhcp {}: bound {} mask {} gw {} lease {}s",
			self.port.idx(),
			data.ip,
			data.netmask,
			data.gateway,
			lease.as_secs()
		);
	}

	fn new_xid(&self) -> u32 {
		self.rng.lock().next_u32()
	}

	fn make_discover(&self, data: &mut DhcpData) -> Vec<u8> {
		data.state = DhcpState::Discovering;
		let mut msg = DhcpMessage::request(DhcpMsgType::Discover, data.xid, self.port.mac());
		msg.want_params = true;
		self.frame_for(data, &msg)
	}

	fn make_request(&self, data: &DhcpData) -> Vec<u8> {
		let mut msg = DhcpMessage::request(DhcpMsgType::Request, data.xid, self.port.mac());
		if matches!(data.state, DhcpState::Renewing | DhcpState::Rebinding) {
			msg.ciaddr = data.ip;
		}
		if data.state != DhcpState::Renewing {
			msg.requested_ip = Some(data.ip);
		}
		if !matches!(data.state, DhcpState::Renewing | DhcpState::Rebinding) {
			msg.server_id = Some(data.server_ip);
		}
		msg.want_params = true;
		self.frame_for(data, &msg)
	}

	/// Frames a message: Ethernet broadcast, IPv4 TTL 128, broadcast
	/// destination except for the unicast renew.
	fn frame_for(&self, data: &DhcpData, msg: &DhcpMessage) -> Vec<u8> {
		let dst_ip = if matches!(
			(data.state, msg.msg_type),
			(DhcpState::Renewing, DhcpMsgType::Request) | (_, DhcpMsgType::Release)
		) {
			data.server_ip
		} else {
			Ipv4Addr::BROADCAST
		};
		let payload = msg.encode();
		let mut buf = vec![0u8; wire::UDP_HDRS_LEN + payload.len()];
		let spec = UdpFrameSpec {
			src_mac: self.port.mac(),
			dst_mac: smoltcp::wire::EthernetAddress::BROADCAST,
			src_ip: Ipv4Addr::UNSPECIFIED,
			dst_ip,
			src_port: DHCP_CLIENT_PORT,
			dst_port: DHCP_SERVER_PORT,
			ttl: 128,
			ipv4_cksum: !self.port.offloads_ipv4_cksum(),
			udp_cksum: false,
		};
		let len = wire::build_udp_frame(&mut buf, &spec, &payload);
		buf.truncate(len);
		buf
	}

	fn tx_frame(&self, frame: Vec<u8>) {
		let Ok(mut m) = self.port.alloc_tx() else {
			error!("dhcp {}: tx alloc failed", self.port.idx());
			return;
		};
		m.data_mut()[..frame.len()].copy_from_slice(&frame);
		m.set_len(frame.len());
		let mut pkts = vec![m];
		if self.port.tx_sys_burst(&mut pkts) < 1 {
			error!("dhcp {}: tx failed", self.port.idx());
		}
	}
}

/// Blocks until every given client is bound, polling `tries` times with
/// `interval` between polls. The whole init fails otherwise.
pub(crate) fn wait_bound(clients: &[Arc<Dhcp>], tries: u32, interval: Duration) -> bool {
	for _ in 0..tries {
		if clients.iter().all(|c| c.is_bound()) {
			return true;
		}
		std::thread::sleep(interval);
	}
	clients.iter().all(|c| c.is_bound())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{InitFlags, PortParams};
	use crate::driver::{DevCaps, LoopbackNic, NicDriver};
	use crate::mempool::Mempool;
	use smoltcp::wire::EthernetAddress;

	const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
	const LEASED_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 50);

	fn setup() -> (Arc<LoopbackNic>, Arc<Dhcp>) {
		let mac = EthernetAddress([2, 0, 0, 0, 0, 2]);
		let nic = Arc::new(LoopbackNic::new(mac, 2, 2, DevCaps::FLOW_RULES));
		nic.set_loop_tx(false);
		let port = PortIf::open(
			0,
			&PortParams::new("p0"),
			InitFlags::empty(),
			nic.clone() as Arc<dyn NicDriver>,
			Mempool::new("tx", 64, 2048),
			Mempool::new("rx", 64, 2048),
		)
		.unwrap();
		let dhcp = Dhcp::new(port);
		(nic, dhcp)
	}

	fn last_message(nic: &LoopbackNic) -> DhcpMessage {
		let tx = nic.take_tx();
		let frame = tx.last().expect("no frame sent");
		let udp = crate::wire::parse_udp(frame).expect("not udp");
		assert_eq!(udp.dst_port, DHCP_SERVER_PORT);
		assert_eq!(udp.src_port, DHCP_CLIENT_PORT);
		DhcpMessage::parse(udp.payload).expect("bad dhcp payload")
	}

	fn reply(msg_type: DhcpMsgType, xid: u32) -> DhcpMessage {
		let mut msg = DhcpMessage::request(msg_type, xid, EthernetAddress([0; 6]));
		msg.op = DHCP_OP_BOOTREPLY;
		msg.yiaddr = LEASED_IP;
		msg.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
		msg.router = Some(SERVER_IP);
		msg.lease_secs = Some(3600);
		msg.server_id = Some(SERVER_IP);
		msg
	}

	#[test]
	fn happy_path_to_bound() {
		let (nic, dhcp) = setup();
		dhcp.start();
		assert_eq!(dhcp.state(), DhcpState::Discovering);

		let discover = last_message(&nic);
		assert_eq!(discover.msg_type, DhcpMsgType::Discover);
		let xid = discover.xid;

		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Requesting);
		let request = last_message(&nic);
		assert_eq!(request.msg_type, DhcpMsgType::Request);
		assert_eq!(request.xid, xid);
		assert_eq!(request.requested_ip, Some(LEASED_IP));
		assert_eq!(request.server_id, Some(SERVER_IP));

		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Bound);
		assert_eq!(dhcp.ip(), LEASED_IP);
		assert_eq!(dhcp.netmask(), Ipv4Addr::new(255, 255, 255, 0));
		assert_eq!(dhcp.gateway(), SERVER_IP);

		let (t1, t2, t) = dhcp.timers().unwrap();
		assert_eq!(t1, Duration::from_secs(1800));
		assert_eq!(t2, Duration::from_secs(3150));
		assert_eq!(t, Duration::from_secs(3600));
	}

	#[test]
	fn nak_restarts_with_fresh_xid() {
		let (nic, dhcp) = setup();
		dhcp.start();
		let xid = last_message(&nic).xid;

		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid).encode());
		dhcp.on_packet(&reply(DhcpMsgType::Nak, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Discovering);

		let discover = last_message(&nic);
		assert_eq!(discover.msg_type, DhcpMsgType::Discover);
		assert_ne!(discover.xid, xid);
	}

	#[test]
	fn duplicate_ack_is_idempotent() {
		let (nic, dhcp) = setup();
		dhcp.start();
		let xid = last_message(&nic).xid;
		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid).encode());
		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());
		let ip = dhcp.ip();
		let mask = dhcp.netmask();
		let gw = dhcp.gateway();

		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Bound);
		assert_eq!(dhcp.ip(), ip);
		assert_eq!(dhcp.netmask(), mask);
		assert_eq!(dhcp.gateway(), gw);
	}

	#[test]
	fn wrong_xid_and_wrong_op_ignored() {
		let (nic, dhcp) = setup();
		dhcp.start();
		let xid = last_message(&nic).xid;

		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid ^ 1).encode());
		assert_eq!(dhcp.state(), DhcpState::Discovering);

		let mut bad_op = reply(DhcpMsgType::Offer, xid);
		bad_op.op = crate::wire::DHCP_OP_BOOTREQUEST;
		dhcp.on_packet(&bad_op.encode());
		assert_eq!(dhcp.state(), DhcpState::Discovering);
	}

	#[test]
	fn renew_rebind_expire_cycle() {
		let (nic, dhcp) = setup();
		dhcp.start();
		let xid = last_message(&nic).xid;
		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid).encode());
		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Bound);

		// t1 fires: unicast renew
		{
			let mut data = dhcp.data.lock().unwrap();
			data.t1_at = Some(Instant::now() - Duration::from_secs(1));
		}
		dhcp.poll_timers();
		assert_eq!(dhcp.state(), DhcpState::Renewing);
		let renew = last_message(&nic);
		assert_eq!(renew.msg_type, DhcpMsgType::Request);
		assert_eq!(renew.ciaddr, LEASED_IP);
		assert_eq!(renew.requested_ip, None);
		assert_eq!(renew.server_id, None);

		// an ack brings it straight back to bound
		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());
		assert_eq!(dhcp.state(), DhcpState::Bound);

		// now let t1, then t2 pass without any server
		{
			let mut data = dhcp.data.lock().unwrap();
			data.t1_at = Some(Instant::now() - Duration::from_secs(1));
		}
		dhcp.poll_timers();
		{
			let mut data = dhcp.data.lock().unwrap();
			data.t2_at = Some(Instant::now() - Duration::from_secs(1));
		}
		dhcp.poll_timers();
		assert_eq!(dhcp.state(), DhcpState::Rebinding);
		let rebind = last_message(&nic);
		assert_eq!(rebind.ciaddr, LEASED_IP);
		assert_eq!(rebind.requested_ip, Some(LEASED_IP));

		// lease expiry collapses to init and re-discovers
		{
			let mut data = dhcp.data.lock().unwrap();
			data.t_at = Some(Instant::now() - Duration::from_secs(1));
		}
		dhcp.poll_timers();
		assert_eq!(dhcp.state(), DhcpState::Discovering);
		let rediscover = last_message(&nic);
		assert_eq!(rediscover.msg_type, DhcpMsgType::Discover);
		assert_ne!(rediscover.xid, xid);
	}

	#[test]
	fn release_resets_state() {
		let (nic, dhcp) = setup();
		dhcp.start();
		let xid = last_message(&nic).xid;
		dhcp.on_packet(&reply(DhcpMsgType::Offer, xid).encode());
		dhcp.on_packet(&reply(DhcpMsgType::Ack, xid).encode());

		dhcp.release();
		assert_eq!(dhcp.state(), DhcpState::Init);
		let release = last_message(&nic);
		assert_eq!(release.msg_type, DhcpMsgType::Release);
		assert_eq!(release.ciaddr, LEASED_IP);
		assert_eq!(release.server_id, Some(SERVER_IP));
	}
}
