//! One [`PortIf`] per physical link: driver handle, addressing, mempools,
//! queue pools, the pre-built pad frame and the system TX queue used by the
//! control-plane services.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hermit_sync::SpinMutex;
use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

use crate::config::{InitFlags, NetProto, PmdType, PortParams};
use crate::driver::{DevCaps, DevInfo, LinkStatus, NicDriver};
use crate::error::{Error, Result};
use crate::mcast::McastMgr;
use crate::mempool::{Mbuf, Mempool};
use crate::queue::pool::{RxQueuePool, TxQueuePool};
use crate::queue::{TxFlowSpec, pool::TxQueue};

/// Minimal Ethernet frame length without FCS.
const PAD_FRAME_LEN: usize = 60;

#[derive(Debug, Clone, Copy)]
pub struct IpConfig {
	pub sip: Ipv4Addr,
	pub netmask: Ipv4Addr,
	pub gateway: Ipv4Addr,
}

pub struct PortIf {
	idx: usize,
	name: String,
	driver: Arc<dyn NicDriver>,
	pmd: PmdType,
	net_proto: NetProto,
	flags: InitFlags,
	info: DevInfo,
	mac: EthernetAddress,
	ip: SpinMutex<IpConfig>,
	tx_pool: Mempool,
	rx_pool: Mempool,
	pad: Mbuf,
	pub(crate) txq_pool: TxQueuePool,
	pub(crate) rxq_pool: RxQueuePool,
	sys_txq: SpinMutex<Option<TxQueue>>,
	pub(crate) mcast: Arc<McastMgr>,
}

impl PortIf {
	pub(crate) fn open(
		idx: usize,
		params: &PortParams,
		flags: InitFlags,
		driver: Arc<dyn NicDriver>,
		tx_pool: Mempool,
		rx_pool: Mempool,
	) -> Result<Arc<Self>> {
		let info = driver.dev_info();
		if info.max_tx_queues == 0 || info.max_rx_queues == 0 {
			return Err(Error::InvalidArg("port without queues"));
		}
		let mac = driver.mac_addr();

		let pad = build_pad_frame(&tx_pool, mac)?;
		let txq_pool = TxQueuePool::new(Arc::clone(&driver));
		let rxq_pool = RxQueuePool::new(Arc::clone(&driver));

		// the system TX queue carries ARP/DHCP and stays reserved for the
		// port's lifetime
		let sys_txq = if params.pmd == PmdType::KernelSocket {
			None
		} else {
			Some(txq_pool.get(&TxFlowSpec {
				sys_queue: true,
				..TxFlowSpec::default()
			})?)
		};

		info!(
			"port {idx} ({}): mac {mac}, {} tx / {} rx queues",
			params.name, info.max_tx_queues, info.max_rx_queues
		);

		Ok(Arc::new(Self {
			idx,
			name: params.name.clone(),
			driver,
			pmd: params.pmd,
			net_proto: params.net_proto,
			flags,
			info,
			mac,
			ip: SpinMutex::new(IpConfig {
				sip: params.sip,
				netmask: params.netmask,
				gateway: params.gateway,
			}),
			tx_pool,
			rx_pool,
			pad,
			txq_pool,
			rxq_pool,
			sys_txq: SpinMutex::new(sys_txq),
			mcast: McastMgr::new(&params.name),
		}))
	}

	pub fn idx(&self) -> usize {
		self.idx
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn mac(&self) -> EthernetAddress {
		self.mac
	}

	pub fn pmd(&self) -> PmdType {
		self.pmd
	}

	pub fn net_proto(&self) -> NetProto {
		self.net_proto
	}

	pub fn dev_info(&self) -> DevInfo {
		self.info
	}

	pub fn link(&self) -> LinkStatus {
		self.driver.link()
	}

	pub fn has_flag(&self, flag: InitFlags) -> bool {
		self.flags.contains(flag)
	}

	pub fn offloads_ipv4_cksum(&self) -> bool {
		self.info.caps.contains(DevCaps::IPV4_CKSUM_OFFLOAD)
	}

	pub fn has_rss(&self) -> bool {
		self.info.caps.contains(DevCaps::RSS) && !self.has_flag(InitFlags::SHARED_RX_QUEUE)
	}

	pub fn ip_config(&self) -> IpConfig {
		*self.ip.lock()
	}

	pub fn sip(&self) -> Ipv4Addr {
		self.ip.lock().sip
	}

	/// Called by the DHCP client once a lease binds.
	pub(crate) fn set_ip_config(&self, cfg: IpConfig) {
		*self.ip.lock() = cfg;
	}

	/// Whether the port has joined `group`.
	pub fn mcast_member(&self, group: Ipv4Addr) -> bool {
		self.mcast.is_member(group)
	}

	/// Whether `ip` sits on this port's subnet (otherwise traffic goes via
	/// the gateway).
	pub fn is_local(&self, ip: Ipv4Addr) -> bool {
		let cfg = self.ip.lock();
		let mask = u32::from(cfg.netmask);
		(u32::from(ip) & mask) == (u32::from(cfg.sip) & mask)
	}

	pub(crate) fn driver(&self) -> &Arc<dyn NicDriver> {
		&self.driver
	}

	pub(crate) fn tx_pool(&self) -> &Mempool {
		&self.tx_pool
	}

	pub(crate) fn rx_pool(&self) -> &Mempool {
		&self.rx_pool
	}

	/// A clone of the pre-built pad frame for TX flushes.
	pub fn pad(&self) -> Mbuf {
		self.pad.clone()
	}

	pub(crate) fn alloc_tx(&self) -> Result<Mbuf> {
		self.tx_pool
			.alloc()
			.ok_or(Error::NoResource("tx mempool empty"))
	}

	/// Transmit on the shared system queue. ARP and DHCP go through here.
	pub(crate) fn tx_sys_burst(&self, pkts: &mut Vec<Mbuf>) -> u16 {
		let guard = self.sys_txq.lock();
		match guard.as_ref() {
			Some(q) => q.burst(pkts),
			None => 0,
		}
	}
}

/// The pad frame is addressed to the port itself so the switch drops it;
/// it exists only to push TX descriptors past the hardware watermark.
fn build_pad_frame(pool: &Mempool, mac: EthernetAddress) -> Result<Mbuf> {
	let mut m = pool
		.alloc()
		.ok_or(Error::NoResource("tx mempool empty"))?;
	let buf = m.data_mut();
	buf[..PAD_FRAME_LEN].fill(0);
	let mut eth = EthernetFrame::new_unchecked(&mut buf[..PAD_FRAME_LEN]);
	eth.set_src_addr(mac);
	eth.set_dst_addr(mac);
	eth.set_ethertype(EthernetProtocol::Ipv4);
	m.set_len(PAD_FRAME_LEN);
	Ok(m)
}
