//! The interface the datapath core expects from a kernel-bypass NIC driver.
//!
//! The driver is an opaque collaborator: it owns descriptor rings and flow
//! steering, the core owns everything above. One [`NicDriver`] instance
//! represents one physical port.

mod loopback;

pub use loopback::LoopbackNic;

use smoltcp::wire::EthernetAddress;

use crate::error::Result;
use crate::mempool::Mbuf;
use crate::queue::FlowSpec;

bitflags! {
	/// Hardware capabilities reported by [`NicDriver::dev_info`].
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DevCaps: u32 {
		/// The NIC can steer packets to RX queues by flow rules.
		const FLOW_RULES = 1 << 0;
		/// The NIC fills IPv4 header checksums on TX.
		const IPV4_CKSUM_OFFLOAD = 1 << 1;
		/// The NIC spreads receive traffic over queues by hashing.
		const RSS = 1 << 2;
		/// TX queues support hardware rate limiting.
		const RATE_LIMIT = 1 << 3;
	}
}

#[derive(Debug, Clone, Copy)]
pub struct DevInfo {
	pub max_tx_queues: u16,
	pub max_rx_queues: u16,
	/// Descriptor ring depth of a TX queue; a flush must push this many pad
	/// frames to move every in-flight descriptor past the hardware watermark.
	pub tx_desc_count: u16,
	pub caps: DevCaps,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkStatus {
	pub up: bool,
	pub speed_mbps: u32,
}

/// Identifier of an installed flow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub u64);

pub trait NicDriver: Send + Sync {
	fn dev_info(&self) -> DevInfo;

	fn mac_addr(&self) -> EthernetAddress;

	fn link(&self) -> LinkStatus;

	/// Appends up to `max` received packets to `pkts`. Never blocks.
	fn rx_burst(&self, queue_id: u16, pkts: &mut Vec<Mbuf>, max: u16) -> u16;

	/// Transmits a prefix of `pkts`, draining what was sent. Never blocks.
	fn tx_burst(&self, queue_id: u16, pkts: &mut Vec<Mbuf>) -> u16;

	/// Reclaims completed TX descriptors.
	fn tx_done_cleanup(&self, _queue_id: u16) {}

	/// Steers packets matching `flow` to `queue_id`.
	fn rx_flow_install(&self, queue_id: u16, flow: &FlowSpec) -> Result<FlowId>;

	fn rx_flow_remove(&self, flow: FlowId) -> Result<()>;
}
