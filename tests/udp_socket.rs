//! UDP facade scenarios: loopback delivery, multicast membership, lcore
//! wakeups and poll.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use common::{PORT_IP, bring_up};
use mionet::{DevCaps, Error, InitFlags, MsgFlags, PollFd, UdpSocket};

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 3);

#[test]
fn multicast_loopback_100_datagrams_in_order() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, true);

	let rx = UdpSocket::new(&net.stack, 0).unwrap();
	rx.set_rcvtimeo(Duration::from_secs(2));
	rx.bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 5000)).unwrap();
	rx.add_membership(GROUP).unwrap();

	let tx = UdpSocket::new(&net.stack, 0).unwrap();
	tx.bind(SocketAddrV4::new(PORT_IP, 6000)).unwrap();

	let dst = SocketAddrV4::new(GROUP, 5000);
	let mut payload = [0u8; 1000];
	for seq in 0..100u16 {
		payload[..2].copy_from_slice(&seq.to_be_bytes());
		assert_eq!(tx.sendto(&payload, dst).unwrap(), 1000);
	}

	let mut buf = [0u8; 1500];
	for seq in 0..100u16 {
		let (n, from) = rx.recvfrom(&mut buf, MsgFlags::empty()).unwrap();
		assert_eq!(n, 1000);
		assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), seq);
		assert_eq!(from, SocketAddrV4::new(PORT_IP, 6000));
	}

	// nothing further queued
	assert_eq!(
		rx.recvfrom(&mut buf, MsgFlags::DONTWAIT).unwrap_err(),
		Error::Timeout
	);
}

#[test]
fn lcore_mode_wakes_blocked_reader() {
	let net = bring_up(
		InitFlags::UDP_LCORE | InitFlags::TASKLET_SLEEP,
		DevCaps::FLOW_RULES,
		true,
	);

	let rx = UdpSocket::new(&net.stack, 0).unwrap();
	rx.set_rcvtimeo(Duration::from_secs(5));
	rx.bind(SocketAddrV4::new(PORT_IP, 5002)).unwrap();

	let tx = UdpSocket::new(&net.stack, 0).unwrap();
	tx.bind(SocketAddrV4::new(PORT_IP, 6002)).unwrap();

	let reader = std::thread::spawn(move || {
		let mut buf = [0u8; 64];
		let mut got = Vec::new();
		for _ in 0..10 {
			let (n, _) = rx.recvfrom(&mut buf, MsgFlags::empty()).unwrap();
			got.push(buf[..n].to_vec());
		}
		got
	});

	std::thread::sleep(Duration::from_millis(20));
	let dst = SocketAddrV4::new(PORT_IP, 5002);
	for seq in 0..10u8 {
		tx.sendto(&[seq], dst).unwrap();
	}

	let got = reader.join().unwrap();
	assert_eq!(got.len(), 10);
	for (seq, datagram) in got.iter().enumerate() {
		assert_eq!(datagram, &[seq as u8]);
	}
}

#[test]
fn poll_reports_readiness() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, true);

	let a = UdpSocket::new(&net.stack, 0).unwrap();
	a.bind(SocketAddrV4::new(PORT_IP, 5004)).unwrap();
	let b = UdpSocket::new(&net.stack, 0).unwrap();
	b.bind(SocketAddrV4::new(PORT_IP, 5005)).unwrap();

	let tx = UdpSocket::new(&net.stack, 0).unwrap();

	// nothing readable yet
	let mut fds = [PollFd::new(&a), PollFd::new(&b)];
	assert_eq!(
		UdpSocket::poll(&mut fds, Duration::from_millis(10)).unwrap(),
		0
	);

	tx.sendto(b"x", SocketAddrV4::new(PORT_IP, 5005)).unwrap();
	let ready = UdpSocket::poll(&mut fds, Duration::from_secs(2)).unwrap();
	assert_eq!(ready, 1);
	assert!(!fds[0].readable);
	assert!(fds[1].readable);
}

#[test]
fn sendto_validates_and_binds_lazily() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, true);
	let s = UdpSocket::new(&net.stack, 0).unwrap();

	// oversized datagram
	let big = vec![0u8; mionet::UDP_MAX_BYTES + 1];
	assert!(matches!(
		s.sendto(&big, SocketAddrV4::new(GROUP, 5000)),
		Err(Error::InvalidArg(_))
	));

	// reachability: multicast and on-subnet are fine, off-subnet needs the
	// gateway (which the test port has)
	s.tx_valid_ip(GROUP).unwrap();
	s.tx_valid_ip(Ipv4Addr::new(10, 0, 0, 77)).unwrap();
	s.tx_valid_ip(Ipv4Addr::new(192, 168, 9, 9)).unwrap();

	// first sendto brings the tx queue up; rate changes are locked out after
	s.set_tx_rate(1_000_000).unwrap();
	s.sendto(b"hello", SocketAddrV4::new(GROUP, 5000)).unwrap();
	assert!(s.set_tx_rate(2_000_000).is_err());
}

#[test]
fn membership_table_rules() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, true);
	let s = UdpSocket::new(&net.stack, 0).unwrap();

	s.add_membership(GROUP).unwrap();
	assert!(matches!(
		s.add_membership(GROUP),
		Err(Error::InvalidArg(_))
	));
	assert!(s.add_membership(Ipv4Addr::new(10, 0, 0, 1)).is_err());
	s.drop_membership(GROUP).unwrap();
	assert!(matches!(
		s.drop_membership(GROUP),
		Err(Error::InvalidArg(_))
	));

	// the port-level manager reflects the socket's memberships
	let port = net.stack.port(0).unwrap();
	s.add_membership(GROUP).unwrap();
	assert!(port.mcast_member(GROUP));
	drop(s);
	assert!(!port.mcast_member(GROUP));
}

#[test]
fn bind_rejects_foreign_ip_and_double_bind() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, true);
	let s = UdpSocket::new(&net.stack, 0).unwrap();

	assert!(
		s.bind(SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 5000))
			.is_err()
	);
	s.bind(SocketAddrV4::new(PORT_IP, 5006)).unwrap();
	assert!(s.bind(SocketAddrV4::new(PORT_IP, 5007)).is_err());
}
