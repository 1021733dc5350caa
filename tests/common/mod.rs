//! Shared scaffolding for the scenario tests: a loopback-backed stack and
//! raw frame builders for the peer side of the wire.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::wire::{
	ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
};

use mionet::wire::{self, UdpFrameSpec};
use mionet::{DevCaps, InitFlags, InitParams, LoopbackNic, NetProto, PortParams, Stack};

pub const PORT_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
pub const PEER_MAC: EthernetAddress = EthernetAddress([0xaa, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const PORT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

pub struct TestNet {
	pub nic: Arc<LoopbackNic>,
	pub stack: Arc<Stack>,
}

pub fn bring_up(flags: InitFlags, caps: DevCaps, loop_tx: bool) -> TestNet {
	let _ = env_logger::builder().is_test(true).try_init();
	let nic = Arc::new(LoopbackNic::new(PORT_MAC, 4, 4, caps));
	nic.set_loop_tx(loop_tx);
	let mut port = PortParams::new("lo0");
	port.sip = PORT_IP;
	port.gateway = PEER_IP;
	let mut params = InitParams::new(vec![port]);
	params.flags = flags;
	let stack = Stack::init(params, vec![nic.clone()]).expect("stack init");
	TestNet { nic, stack }
}

pub fn udp_frame(
	src_ip: Ipv4Addr,
	dst_ip: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	payload: &[u8],
) -> Vec<u8> {
	let mut buf = vec![0u8; wire::UDP_HDRS_LEN + payload.len()];
	let spec = UdpFrameSpec {
		src_mac: PEER_MAC,
		dst_mac: PORT_MAC,
		src_ip,
		dst_ip,
		src_port,
		dst_port,
		ttl: 64,
		ipv4_cksum: true,
		udp_cksum: false,
	};
	let len = wire::build_udp_frame(&mut buf, &spec, payload);
	buf.truncate(len);
	buf
}

pub fn arp_frame(
	op: ArpOperation,
	sha: EthernetAddress,
	sip: Ipv4Addr,
	tha: EthernetAddress,
	tip: Ipv4Addr,
) -> Vec<u8> {
	let mut buf = vec![0u8; wire::ETH_HDR_LEN + 28];
	let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
	eth.set_src_addr(sha);
	eth.set_dst_addr(if op == ArpOperation::Request {
		EthernetAddress::BROADCAST
	} else {
		tha
	});
	eth.set_ethertype(EthernetProtocol::Arp);
	let repr = ArpRepr::EthernetIpv4 {
		operation: op,
		source_hardware_addr: sha,
		source_protocol_addr: sip,
		target_hardware_addr: tha,
		target_protocol_addr: tip,
	};
	repr.emit(&mut ArpPacket::new_unchecked(&mut buf[wire::ETH_HDR_LEN..]));
	buf
}

/// Drains the TX tap until `pick` returns something or the timeout passes.
pub fn wait_tx<T>(
	nic: &LoopbackNic,
	timeout: std::time::Duration,
	mut pick: impl FnMut(&[u8]) -> Option<T>,
) -> Option<T> {
	let deadline = std::time::Instant::now() + timeout;
	while std::time::Instant::now() < deadline {
		for frame in nic.take_tx() {
			if let Some(v) = pick(&frame) {
				return Some(v);
			}
		}
		std::thread::sleep(std::time::Duration::from_millis(1));
	}
	None
}

pub fn dhcp_port_params() -> PortParams {
	let mut port = PortParams::new("lo0");
	port.net_proto = NetProto::Dhcp;
	port
}
