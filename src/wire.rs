//! Frame-level helpers on top of `smoltcp::wire`.
//!
//! The datapath strips one level of VLAN tagging before classification and
//! only ever builds Ethernet II / IPv4 / UDP frames. The DHCP message codec
//! lives here as well; the client needs exact control over the option list it
//! emits, so the message body is encoded directly instead of going through a
//! socket layer.

use std::net::Ipv4Addr;

use smoltcp::wire::{
	EthernetAddress, EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet,
	UdpPacket,
};

pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_PTP: u16 = 0x88f7;

pub const ETH_HDR_LEN: usize = 14;
pub const VLAN_HDR_LEN: usize = 4;
pub const IPV4_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;
/// Ethernet + IPv4 + UDP, the fixed header block of a datapath frame.
pub const UDP_HDRS_LEN: usize = ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Strips at most one VLAN tag, returning the tag presence, the effective
/// ethertype and the layer-3 payload.
pub fn strip_vlan(frame: &[u8]) -> Option<(bool, EthernetProtocol, &[u8])> {
	let eth = EthernetFrame::new_checked(frame).ok()?;
	let ethertype = eth.ethertype();
	let payload = &frame[ETH_HDR_LEN..];
	if ethertype == EthernetProtocol::Unknown(ETHERTYPE_VLAN) {
		if payload.len() < VLAN_HDR_LEN {
			return None;
		}
		let inner = EthernetProtocol::from(u16::from_be_bytes([payload[2], payload[3]]));
		Some((true, inner, &payload[VLAN_HDR_LEN..]))
	} else {
		Some((false, ethertype, payload))
	}
}

pub struct ParsedIpv4<'a> {
	pub vlan: bool,
	pub proto: IpProtocol,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub l4: &'a [u8],
}

pub fn parse_ipv4(frame: &[u8]) -> Option<ParsedIpv4<'_>> {
	let (vlan, ethertype, l3) = strip_vlan(frame)?;
	if ethertype != EthernetProtocol::Ipv4 {
		return None;
	}
	let ip = Ipv4Packet::new_checked(l3).ok()?;
	Some(ParsedIpv4 {
		vlan,
		proto: ip.next_header(),
		src_ip: ip.src_addr(),
		dst_ip: ip.dst_addr(),
		l4: ip.payload(),
	})
}

pub struct ParsedUdp<'a> {
	pub vlan: bool,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub payload: &'a [u8],
}

pub fn parse_udp(frame: &[u8]) -> Option<ParsedUdp<'_>> {
	let ip = parse_ipv4(frame)?;
	if ip.proto != IpProtocol::Udp {
		return None;
	}
	let udp = UdpPacket::new_checked(ip.l4).ok()?;
	Some(ParsedUdp {
		vlan: ip.vlan,
		src_ip: ip.src_ip,
		dst_ip: ip.dst_ip,
		src_port: udp.src_port(),
		dst_port: udp.dst_port(),
		payload: udp.payload(),
	})
}

/// RFC 1112 mapping of an IPv4 multicast group onto an Ethernet address.
pub fn multicast_mac(group: Ipv4Addr) -> EthernetAddress {
	let o = group.octets();
	EthernetAddress([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
}

pub struct UdpFrameSpec {
	pub src_mac: EthernetAddress,
	pub dst_mac: EthernetAddress,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub ttl: u8,
	/// Compute the IPv4 header checksum in software. Off when the NIC
	/// offloads it.
	pub ipv4_cksum: bool,
	/// Compute the UDP checksum. The default is a zero checksum.
	pub udp_cksum: bool,
}

/// Writes a complete Ethernet/IPv4/UDP frame into `buf` and returns its
/// length. `buf` must hold at least [`UDP_HDRS_LEN`] + payload bytes.
pub fn build_udp_frame(buf: &mut [u8], spec: &UdpFrameSpec, payload: &[u8]) -> usize {
	let total = UDP_HDRS_LEN + payload.len();

	let mut eth = EthernetFrame::new_unchecked(&mut buf[..total]);
	eth.set_src_addr(spec.src_mac);
	eth.set_dst_addr(spec.dst_mac);
	eth.set_ethertype(EthernetProtocol::Ipv4);

	let mut ip = Ipv4Packet::new_unchecked(&mut buf[ETH_HDR_LEN..total]);
	ip.set_version(4);
	ip.set_header_len(IPV4_HDR_LEN as u8);
	ip.set_dscp(0);
	ip.set_ecn(0);
	ip.set_total_len((IPV4_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16);
	ip.set_ident(0);
	ip.set_more_frags(false);
	ip.set_dont_frag(true);
	ip.set_frag_offset(0);
	ip.set_hop_limit(spec.ttl);
	ip.set_next_header(IpProtocol::Udp);
	ip.set_src_addr(spec.src_ip);
	ip.set_dst_addr(spec.dst_ip);
	ip.set_checksum(0);
	if spec.ipv4_cksum {
		ip.fill_checksum();
	}

	let mut udp = UdpPacket::new_unchecked(&mut buf[ETH_HDR_LEN + IPV4_HDR_LEN..total]);
	udp.set_src_port(spec.src_port);
	udp.set_dst_port(spec.dst_port);
	udp.set_len((UDP_HDR_LEN + payload.len()) as u16);
	udp.set_checksum(0);
	udp.payload_mut()[..payload.len()].copy_from_slice(payload);
	if spec.udp_cksum {
		udp.fill_checksum(
			&IpAddress::from(spec.src_ip),
			&IpAddress::from(spec.dst_ip),
		);
	}

	total
}

/* DHCP message codec (RFC 2131) */

const DHCP_MAGIC_COOKIE: u32 = 0x63825363;
pub const DHCP_OP_BOOTREQUEST: u8 = 1;
pub const DHCP_OP_BOOTREPLY: u8 = 2;
const DHCP_HTYPE_ETHERNET: u8 = 1;
const DHCP_HLEN_ETHERNET: u8 = 6;
/// Fixed header including the magic cookie, before the options.
const DHCP_FIXED_LEN: usize = 240;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVER: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_REQUEST: u8 = 55;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMsgType {
	Discover = 1,
	Offer = 2,
	Request = 3,
	Decline = 4,
	Ack = 5,
	Nak = 6,
	Release = 7,
}

impl DhcpMsgType {
	fn from_u8(v: u8) -> Option<Self> {
		match v {
			1 => Some(Self::Discover),
			2 => Some(Self::Offer),
			3 => Some(Self::Request),
			4 => Some(Self::Decline),
			5 => Some(Self::Ack),
			6 => Some(Self::Nak),
			7 => Some(Self::Release),
			_ => None,
		}
	}
}

/// One decoded (or to-be-encoded) DHCP message with the option subset the
/// client speaks: 1, 3, 6, 50, 51, 53, 54 and 55.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
	pub op: u8,
	pub xid: u32,
	pub ciaddr: Ipv4Addr,
	pub yiaddr: Ipv4Addr,
	pub chaddr: EthernetAddress,
	pub msg_type: DhcpMsgType,
	pub subnet_mask: Option<Ipv4Addr>,
	pub router: Option<Ipv4Addr>,
	pub dns: Vec<Ipv4Addr>,
	pub lease_secs: Option<u32>,
	pub server_id: Option<Ipv4Addr>,
	pub requested_ip: Option<Ipv4Addr>,
	/// Emit option 55 asking for subnet mask, router and DNS.
	pub want_params: bool,
}

impl DhcpMessage {
	pub fn request(msg_type: DhcpMsgType, xid: u32, chaddr: EthernetAddress) -> Self {
		Self {
			op: DHCP_OP_BOOTREQUEST,
			xid,
			ciaddr: Ipv4Addr::UNSPECIFIED,
			yiaddr: Ipv4Addr::UNSPECIFIED,
			chaddr,
			msg_type,
			subnet_mask: None,
			router: None,
			dns: Vec::new(),
			lease_secs: None,
			server_id: None,
			requested_ip: None,
			want_params: false,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut b = vec![0u8; DHCP_FIXED_LEN];
		b[0] = self.op;
		b[1] = DHCP_HTYPE_ETHERNET;
		b[2] = DHCP_HLEN_ETHERNET;
		b[4..8].copy_from_slice(&self.xid.to_be_bytes());
		b[12..16].copy_from_slice(&self.ciaddr.octets());
		b[16..20].copy_from_slice(&self.yiaddr.octets());
		b[28..34].copy_from_slice(self.chaddr.as_bytes());
		b[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE.to_be_bytes());

		b.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, self.msg_type as u8]);
		if let Some(ip) = self.requested_ip {
			b.extend_from_slice(&[OPT_REQUESTED_IP, 4]);
			b.extend_from_slice(&ip.octets());
		}
		if let Some(ip) = self.server_id {
			b.extend_from_slice(&[OPT_SERVER_ID, 4]);
			b.extend_from_slice(&ip.octets());
		}
		if let Some(mask) = self.subnet_mask {
			b.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
			b.extend_from_slice(&mask.octets());
		}
		if let Some(gw) = self.router {
			b.extend_from_slice(&[OPT_ROUTER, 4]);
			b.extend_from_slice(&gw.octets());
		}
		if !self.dns.is_empty() {
			b.extend_from_slice(&[OPT_DNS_SERVER, (self.dns.len() * 4) as u8]);
			for ip in &self.dns {
				b.extend_from_slice(&ip.octets());
			}
		}
		if let Some(secs) = self.lease_secs {
			b.extend_from_slice(&[OPT_LEASE_TIME, 4]);
			b.extend_from_slice(&secs.to_be_bytes());
		}
		if self.want_params {
			b.extend_from_slice(&[
				OPT_PARAM_REQUEST,
				3,
				OPT_SUBNET_MASK,
				OPT_ROUTER,
				OPT_DNS_SERVER,
			]);
		}
		b.push(OPT_END);
		b
	}

	/// Decodes a message, validating the magic cookie. Returns `None` on any
	/// malformed input; the caller drops and counts.
	pub fn parse(data: &[u8]) -> Option<Self> {
		if data.len() < DHCP_FIXED_LEN {
			return None;
		}
		let cookie = u32::from_be_bytes(data[236..240].try_into().unwrap());
		if cookie != DHCP_MAGIC_COOKIE {
			return None;
		}
		let ip_at = |at: usize| Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3]);
		let mut msg = Self {
			op: data[0],
			xid: u32::from_be_bytes(data[4..8].try_into().unwrap()),
			ciaddr: ip_at(12),
			yiaddr: ip_at(16),
			chaddr: EthernetAddress::from_bytes(&data[28..34]),
			msg_type: DhcpMsgType::Discover,
			subnet_mask: None,
			router: None,
			dns: Vec::new(),
			lease_secs: None,
			server_id: None,
			requested_ip: None,
			want_params: false,
		};

		let mut msg_type = None;
		let mut opts = &data[DHCP_FIXED_LEN..];
		loop {
			match *opts.first()? {
				OPT_END => break,
				OPT_PAD => {
					opts = &opts[1..];
					continue;
				}
				code => {
					let len = *opts.get(1)? as usize;
					let val = opts.get(2..2 + len)?;
					let val_ip = || {
						Some(Ipv4Addr::new(
							*val.first()?,
							*val.get(1)?,
							*val.get(2)?,
							*val.get(3)?,
						))
					};
					match code {
						OPT_MESSAGE_TYPE => msg_type = DhcpMsgType::from_u8(*val.first()?),
						OPT_SUBNET_MASK => msg.subnet_mask = val_ip(),
						OPT_ROUTER => msg.router = val_ip(),
						OPT_DNS_SERVER => {
							for chunk in val.chunks_exact(4) {
								msg.dns.push(Ipv4Addr::new(
									chunk[0], chunk[1], chunk[2], chunk[3],
								));
							}
						}
						OPT_LEASE_TIME => {
							msg.lease_secs =
								Some(u32::from_be_bytes(val.get(..4)?.try_into().unwrap()));
						}
						OPT_SERVER_ID => msg.server_id = val_ip(),
						OPT_REQUESTED_IP => msg.requested_ip = val_ip(),
						OPT_PARAM_REQUEST => msg.want_params = true,
						_ => {}
					}
					opts = &opts[2 + len..];
				}
			}
		}

		msg.msg_type = msg_type?;
		Some(msg)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MAC_A: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x0a]);
	const MAC_B: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x0b]);

	fn frame_spec() -> UdpFrameSpec {
		UdpFrameSpec {
			src_mac: MAC_A,
			dst_mac: MAC_B,
			src_ip: Ipv4Addr::new(10, 0, 0, 2),
			dst_ip: Ipv4Addr::new(10, 0, 0, 9),
			src_port: 4000,
			dst_port: 5000,
			ttl: 64,
			ipv4_cksum: true,
			udp_cksum: false,
		}
	}

	#[test]
	fn udp_frame_builds_and_parses() {
		let mut buf = [0u8; 128];
		let len = build_udp_frame(&mut buf, &frame_spec(), b"hello");
		assert_eq!(len, UDP_HDRS_LEN + 5);

		let parsed = parse_udp(&buf[..len]).unwrap();
		assert!(!parsed.vlan);
		assert_eq!(parsed.src_ip, Ipv4Addr::new(10, 0, 0, 2));
		assert_eq!(parsed.dst_ip, Ipv4Addr::new(10, 0, 0, 9));
		assert_eq!(parsed.src_port, 4000);
		assert_eq!(parsed.dst_port, 5000);
		assert_eq!(parsed.payload, b"hello");

		let ip = Ipv4Packet::new_checked(&buf[ETH_HDR_LEN..len]).unwrap();
		assert!(ip.dont_frag());
		assert_eq!(ip.hop_limit(), 64);
		assert!(ip.verify_checksum());
	}

	#[test]
	fn vlan_tag_is_stripped() {
		let mut buf = [0u8; 128];
		let len = build_udp_frame(&mut buf, &frame_spec(), b"x");

		// splice a 802.1Q tag between source MAC and ethertype
		let mut tagged = Vec::new();
		tagged.extend_from_slice(&buf[..12]);
		tagged.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
		tagged.extend_from_slice(&[0x20, 0x01]); // prio/vid
		tagged.extend_from_slice(&buf[12..len]);

		let parsed = parse_udp(&tagged).unwrap();
		assert!(parsed.vlan);
		assert_eq!(parsed.dst_port, 5000);
		assert_eq!(parsed.payload, b"x");
	}

	#[test]
	fn non_ip_frames_rejected() {
		let mut buf = [0u8; 60];
		let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
		eth.set_src_addr(MAC_A);
		eth.set_dst_addr(MAC_B);
		eth.set_ethertype(EthernetProtocol::Arp);
		assert!(parse_udp(&buf).is_none());
		assert!(parse_ipv4(&buf).is_none());
	}

	#[test]
	fn multicast_mac_mapping() {
		let mac = multicast_mac(Ipv4Addr::new(239, 128, 1, 2));
		// upper bit of the second group octet is dropped
		assert_eq!(mac, EthernetAddress([0x01, 0x00, 0x5e, 0x00, 1, 2]));
	}

	#[test]
	fn dhcp_ack_round_trip() {
		let mut ack = DhcpMessage::request(DhcpMsgType::Ack, 0x1234_5678, MAC_A);
		ack.op = DHCP_OP_BOOTREPLY;
		ack.yiaddr = Ipv4Addr::new(10, 0, 0, 50);
		ack.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
		ack.router = Some(Ipv4Addr::new(10, 0, 0, 1));
		ack.lease_secs = Some(3600);
		ack.server_id = Some(Ipv4Addr::new(10, 0, 0, 1));
		ack.dns = vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

		let decoded = DhcpMessage::parse(&ack.encode()).unwrap();
		assert_eq!(decoded.op, DHCP_OP_BOOTREPLY);
		assert_eq!(decoded.msg_type, DhcpMsgType::Ack);
		assert_eq!(decoded.xid, 0x1234_5678);
		assert_eq!(decoded.yiaddr, Ipv4Addr::new(10, 0, 0, 50));
		assert_eq!(decoded.subnet_mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
		assert_eq!(decoded.router, Some(Ipv4Addr::new(10, 0, 0, 1)));
		assert_eq!(decoded.lease_secs, Some(3600));
		assert_eq!(decoded.server_id, Some(Ipv4Addr::new(10, 0, 0, 1)));
		assert_eq!(decoded.dns.len(), 2);
		assert_eq!(decoded.chaddr, MAC_A);
	}

	#[test]
	fn dhcp_bad_cookie_rejected() {
		let msg = DhcpMessage::request(DhcpMsgType::Discover, 1, MAC_A);
		let mut bytes = msg.encode();
		bytes[236] = 0;
		assert!(DhcpMessage::parse(&bytes).is_none());
	}

	#[test]
	fn dhcp_truncated_options_rejected() {
		let msg = DhcpMessage::request(DhcpMsgType::Discover, 1, MAC_A);
		let mut bytes = msg.encode();
		bytes.truncate(bytes.len() - 2); // cut into the message-type option
		assert!(DhcpMessage::parse(&bytes).is_none());
	}
}
