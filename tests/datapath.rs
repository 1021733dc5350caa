//! Scenario tests for the queue multiplexer, the shared-queue demux paths
//! and ARP over the control-plane ingress, all against the loopback NIC.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetProtocol};

use common::{PEER_IP, PEER_MAC, PORT_IP, PORT_MAC, arp_frame, bring_up, udp_frame, wait_tx};
use mionet::wire;
use mionet::{DevCaps, Error, FlowSpec, InitFlags, TxFlowSpec};

fn seq_frame(dst_ip: Ipv4Addr, dst_port: u16, seq: u16) -> Vec<u8> {
	udp_frame(PEER_IP, dst_ip, 7000, dst_port, &seq.to_be_bytes())
}

fn recv_seqs(handle: &mionet::RxqHandle, max: u16) -> Vec<u16> {
	let mut pkts = Vec::new();
	handle.burst(&mut pkts, max);
	pkts.iter()
		.map(|m| {
			let udp = wire::parse_udp(m.data()).expect("udp frame");
			u16::from_be_bytes([udp.payload[0], udp.payload[1]])
		})
		.collect()
}

#[test]
fn arp_request_gets_replied_and_resolve_uses_reply() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, false);

	// a peer asks who has our ip
	net.nic.inject(&arp_frame(
		ArpOperation::Request,
		PEER_MAC,
		PEER_IP,
		smoltcp::wire::EthernetAddress([0; 6]),
		PORT_IP,
	));

	let reply = wait_tx(&net.nic, Duration::from_secs(2), |frame| {
		let (_, ethertype, payload) = wire::strip_vlan(frame)?;
		if ethertype != EthernetProtocol::Arp {
			return None;
		}
		let repr = ArpRepr::parse(&ArpPacket::new_checked(payload).ok()?).ok()?;
		let ArpRepr::EthernetIpv4 {
			operation,
			source_hardware_addr,
			source_protocol_addr,
			target_hardware_addr,
			target_protocol_addr,
		} = repr
		else {
			return None;
		};
		(operation == ArpOperation::Reply).then_some((
			source_hardware_addr,
			source_protocol_addr,
			target_hardware_addr,
			target_protocol_addr,
		))
	})
	.expect("no arp reply seen");
	assert_eq!(reply.0, PORT_MAC);
	assert_eq!(reply.1, PORT_IP);
	assert_eq!(reply.2, PEER_MAC);
	assert_eq!(reply.3, PEER_IP);

	// now resolve the peer: answer the broadcast request once it shows up
	let responder = {
		let nic = Arc::clone(&net.nic);
		std::thread::spawn(move || {
			let seen = wait_tx(&nic, Duration::from_secs(2), |frame| {
				let (_, ethertype, payload) = wire::strip_vlan(frame)?;
				if ethertype != EthernetProtocol::Arp {
					return None;
				}
				let repr = ArpRepr::parse(&ArpPacket::new_checked(payload).ok()?).ok()?;
				let ArpRepr::EthernetIpv4 {
					operation,
					target_protocol_addr,
					..
				} = repr
				else {
					return None;
				};
				(operation == ArpOperation::Request && target_protocol_addr == PEER_IP)
					.then_some(())
			});
			assert!(seen.is_some(), "no arp request broadcast");
			nic.inject(&arp_frame(
				ArpOperation::Reply,
				PEER_MAC,
				PEER_IP,
				PORT_MAC,
				PORT_IP,
			));
		})
	};

	let mac = net
		.stack
		.arp(0)
		.unwrap()
		.resolve(PEER_IP, Duration::from_secs(2))
		.expect("resolve failed");
	assert_eq!(mac, PEER_MAC);
	responder.join().unwrap();

	// cached from now on
	assert_eq!(net.stack.arp(0).unwrap().cached(PEER_IP), Some(PEER_MAC));
}

#[test]
fn rsq_demuxes_two_sessions_in_order() {
	let net = bring_up(
		InitFlags::SHARED_RX_QUEUE,
		DevCaps::FLOW_RULES,
		false,
	);

	let ip1 = Ipv4Addr::new(239, 0, 0, 1);
	let ip2 = Ipv4Addr::new(239, 0, 0, 2);
	let s1 = net.stack.rxq_get(0, FlowSpec::udp(ip1, 5000)).unwrap();
	let s2 = net.stack.rxq_get(0, FlowSpec::udp(ip2, 5000)).unwrap();
	assert_eq!(s1.mode_name(), "shared");
	assert_eq!(s1.queue_id(), s2.queue_id());

	for seq in 0..10u16 {
		net.nic.inject(&seq_frame(ip1, 5000, seq));
		net.nic.inject(&seq_frame(ip2, 5000, 100 + seq));
	}

	assert_eq!(recv_seqs(&s1, 32), (0..10).collect::<Vec<_>>());
	assert_eq!(recv_seqs(&s2, 32), (100..110).collect::<Vec<_>>());
	assert_eq!(s1.stats(), Some((10, 0)));
	assert_eq!(s2.stats(), Some((10, 0)));
}

#[test]
fn rsq_entry_table_bounded() {
	let net = bring_up(InitFlags::SHARED_RX_QUEUE, DevCaps::FLOW_RULES, false);

	let mut handles = Vec::new();
	let mut hit_bound = false;
	for i in 0..200u16 {
		let flow = FlowSpec::udp(Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8), 4000 + i);
		match net.stack.rxq_get(0, flow) {
			Ok(h) => handles.push(h),
			Err(Error::NoResource(_)) => {
				hit_bound = true;
				break;
			}
			Err(e) => panic!("unexpected error {e}"),
		}
	}
	assert!(hit_bound, "entry table never filled");

	// releasing one makes room again
	handles.pop();
	let flow = FlowSpec::udp(Ipv4Addr::new(10, 2, 0, 1), 9999);
	assert!(net.stack.rxq_get(0, flow).is_ok());
}

#[test]
fn srss_demuxes_over_rss_queues() {
	let net = bring_up(InitFlags::empty(), DevCaps::RSS, false);

	let ip1 = Ipv4Addr::new(239, 0, 0, 1);
	let ip2 = Ipv4Addr::new(239, 0, 0, 2);
	let s1 = net.stack.rxq_get(0, FlowSpec::udp(ip1, 5000)).unwrap();
	let s2 = net.stack.rxq_get(0, FlowSpec::udp(ip2, 5000)).unwrap();
	assert_eq!(s1.mode_name(), "rss");

	for seq in 0..10u16 {
		net.nic.inject(&seq_frame(ip1, 5000, seq));
		net.nic.inject(&seq_frame(ip2, 5000, 100 + seq));
	}

	// the srss tasklet runs in the main group; give it a moment
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	let mut got1 = Vec::new();
	let mut got2 = Vec::new();
	while std::time::Instant::now() < deadline && (got1.len() < 10 || got2.len() < 10) {
		got1.extend(recv_seqs(&s1, 32));
		got2.extend(recv_seqs(&s2, 32));
		std::thread::sleep(Duration::from_millis(1));
	}
	assert_eq!(got1, (0..10).collect::<Vec<_>>());
	assert_eq!(got2, (100..110).collect::<Vec<_>>());
}

#[test]
fn csq_carries_low_rate_session() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, false);

	let ip = Ipv4Addr::new(239, 0, 0, 9);
	let flow = FlowSpec {
		use_cni_queue: true,
		..FlowSpec::udp(ip, 5000)
	};
	let handle = net.stack.rxq_get(0, flow).unwrap();
	assert_eq!(handle.mode_name(), "cni");

	for seq in 0..5u16 {
		net.nic.inject(&seq_frame(ip, 5000, seq));
	}

	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	let mut got = Vec::new();
	while std::time::Instant::now() < deadline && got.len() < 5 {
		got.extend(recv_seqs(&handle, 32));
		std::thread::sleep(Duration::from_millis(1));
	}
	assert_eq!(got, (0..5).collect::<Vec<_>>());
}

#[test]
fn dedicated_queues_are_exclusive_and_returnable() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, false);

	// 4 tx queues, one reserved for the system queue
	let a = net.stack.txq_get(0, TxFlowSpec::default()).unwrap();
	let _b = net.stack.txq_get(0, TxFlowSpec::default()).unwrap();
	let _c = net.stack.txq_get(0, TxFlowSpec::default()).unwrap();
	assert!(matches!(
		net.stack.txq_get(0, TxFlowSpec::default()),
		Err(Error::NoResource(_))
	));

	// flush, then return; the pool must hand the queue out again
	let pad = net.stack.port(0).unwrap().pad();
	a.flush(&pad);
	a.put();
	assert!(net.stack.txq_get(0, TxFlowSpec::default()).is_ok());
}

#[test]
fn sys_queue_flows_are_rejected_for_sessions() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, false);
	let flow = FlowSpec {
		sys_queue: true,
		..FlowSpec::default()
	};
	assert!(matches!(
		net.stack.rxq_get(0, flow),
		Err(Error::InvalidFlow(_))
	));
	let flow = TxFlowSpec {
		sys_queue: true,
		..TxFlowSpec::default()
	};
	assert!(matches!(
		net.stack.txq_get(0, flow),
		Err(Error::InvalidFlow(_))
	));
}

#[test]
fn unknown_streams_land_in_debug_table() {
	let net = bring_up(InitFlags::empty(), DevCaps::FLOW_RULES, false);

	for _ in 0..3 {
		net.nic
			.inject(&udp_frame(PEER_IP, PORT_IP, 1234, 4321, b"stray"));
	}

	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	loop {
		let seen = net
			.stack
			.cni()
			.stream_count(0, PEER_IP, PORT_IP, 1234, 4321);
		if seen == 3 {
			break;
		}
		assert!(
			std::time::Instant::now() < deadline,
			"stream table never saw the stray flow (got {seen})"
		);
		std::thread::sleep(Duration::from_millis(1));
	}
}
