//! The top-level context: ports, shared-queue managers, control-plane
//! services and the main scheduler group, with one init/shutdown ordering.
//!
//! Everything the C lineage of such stacks keeps in a global singleton
//! lives here behind one `Arc`; callbacks receive the piece of state they
//! need instead of reaching for a global.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::arp::Arp;
use crate::cni::{Cni, CniPort, PtpSink, PtpSinkSlot};
use crate::config::{InitFlags, InitParams, NetProto, PmdType};
use crate::dhcp::{self, Dhcp};
use crate::driver::{DevCaps, NicDriver};
use crate::error::{Error, Result};
use crate::mempool::Mempool;
use crate::port::PortIf;
use crate::queue::shared_rx::SharedRxQueue;
use crate::queue::shared_tx::SharedTxQueue;
use crate::queue::srss::SharedRss;
use crate::queue::{
	FlowSpec, RxqHandle, RxqSources, SESSION_RING_COUNT, TxFlowSpec, TxqHandle, rxq_get, txq_get,
};
use crate::sched::{SchedGroup, TaskletHandle};

const MEMPOOL_ELEMENTS: usize = 2048;
const MEMPOOL_ELEM_SIZE: usize = 2048;

/// DHCP init window: 50 polls of 100 ms each.
const DHCP_INIT_TRIES: u32 = 50;
const DHCP_INIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct Stack {
	params: InitParams,
	aborted: Arc<AtomicBool>,
	ports: Vec<Arc<PortIf>>,
	srss: Vec<Option<Arc<SharedRss>>>,
	rsq: Vec<Option<Arc<SharedRxQueue>>>,
	tsq: Vec<Option<Arc<SharedTxQueue>>>,
	arp: Vec<Arc<Arp>>,
	dhcp: Vec<Option<Arc<Dhcp>>>,
	cni: Cni,
	main_group: Arc<SchedGroup>,
	ptp_sink: PtpSinkSlot,
	service_tasklets: Mutex<Vec<TaskletHandle>>,
	socket_idx: AtomicUsize,
	stopped: AtomicBool,
}

impl Stack {
	/// Brings the whole datapath up: ports, scheduler, shared queues,
	/// control-plane ingress, then blocks until every DHCP port is bound.
	pub fn init(params: InitParams, drivers: Vec<Arc<dyn NicDriver>>) -> Result<Arc<Self>> {
		if params.ports.is_empty() {
			return Err(Error::InvalidArg("no ports"));
		}
		if params.ports.len() != drivers.len() {
			return Err(Error::InvalidArg("one driver per port required"));
		}
		let flags = params.flags;
		let aborted = Arc::new(AtomicBool::new(false));

		// mono-pool flags collapse the per-port pools into one
		let mono_tx = flags
			.contains(InitFlags::TX_MONO_POOL)
			.then(|| Mempool::new("mionet-tx", MEMPOOL_ELEMENTS, MEMPOOL_ELEM_SIZE));
		let mono_rx = flags
			.contains(InitFlags::RX_MONO_POOL)
			.then(|| Mempool::new("mionet-rx", MEMPOOL_ELEMENTS, MEMPOOL_ELEM_SIZE));

		let mut ports = Vec::with_capacity(params.ports.len());
		for (idx, (port_params, driver)) in params.ports.iter().zip(&drivers).enumerate() {
			let tx_pool = mono_tx.clone().unwrap_or_else(|| {
				Mempool::new(
					&format!("mionet-tx-p{idx}"),
					MEMPOOL_ELEMENTS,
					MEMPOOL_ELEM_SIZE,
				)
			});
			let rx_pool = mono_rx.clone().unwrap_or_else(|| {
				Mempool::new(
					&format!("mionet-rx-p{idx}"),
					MEMPOOL_ELEMENTS,
					MEMPOOL_ELEM_SIZE,
				)
			});
			ports.push(PortIf::open(
				idx,
				port_params,
				flags,
				Arc::clone(driver),
				tx_pool,
				rx_pool,
			)?);
		}

		let main_group = SchedGroup::new(
			"main",
			params.main_lcore,
			flags.contains(InitFlags::TASKLET_THREAD),
			flags.contains(InitFlags::TASKLET_SLEEP),
			flags.contains(InitFlags::TASKLET_TIME_MEASURE),
			&params.var,
		);
		main_group.start()?;
		let mut service_tasklets = Vec::new();

		// per-port queue sharing, exclusive per port: software RSS when the
		// NIC spreads by hash, the shared queue when policy asks for it
		let mut srss = Vec::with_capacity(ports.len());
		let mut rsq = Vec::with_capacity(ports.len());
		let mut tsq = Vec::with_capacity(ports.len());
		for port in &ports {
			if port.pmd() == PmdType::KernelSocket {
				srss.push(None);
				rsq.push(None);
				tsq.push(None);
				continue;
			}
			if port.dev_info().caps.contains(DevCaps::RSS)
				&& !flags.contains(InitFlags::SHARED_RX_QUEUE)
			{
				let mgr = SharedRss::new(Arc::clone(port.driver()));
				service_tasklets.push(main_group.register(SharedRss::tasklet(&mgr)));
				srss.push(Some(mgr));
				rsq.push(None);
			} else if flags.contains(InitFlags::SHARED_RX_QUEUE) {
				let queue = port.rxq_pool.reserve()?;
				rsq.push(Some(SharedRxQueue::new(Arc::clone(port.driver()), queue)));
				srss.push(None);
			} else {
				srss.push(None);
				rsq.push(None);
			}
			if flags.contains(InitFlags::SHARED_TX_QUEUE) {
				let queue = port.txq_pool.get(&TxFlowSpec::default())?;
				tsq.push(Some(SharedTxQueue::new(queue, port.tx_pool().clone())));
			} else {
				tsq.push(None);
			}
		}

		let arp: Vec<Arc<Arp>> = ports
			.iter()
			.map(|p| Arp::new(Arc::clone(p), Arc::clone(&aborted)))
			.collect();
		let dhcp: Vec<Option<Arc<Dhcp>>> = ports
			.iter()
			.map(|p| {
				(p.net_proto() == NetProto::Dhcp && p.pmd() != PmdType::KernelSocket)
					.then(|| Dhcp::new(Arc::clone(p)))
			})
			.collect();

		let ptp_sink: PtpSinkSlot = Arc::new(hermit_sync::SpinMutex::new(None));
		let mut cni_ports = Vec::with_capacity(ports.len());
		if flags.contains(InitFlags::DISABLE_SYSTEM_RX_QUEUES) {
			warn!("cni disabled, no system rx queues");
			cni_ports.resize_with(ports.len(), || None);
		} else {
			for (idx, port) in ports.iter().enumerate() {
				if port.pmd() == PmdType::KernelSocket {
					cni_ports.push(None);
					continue;
				}
				cni_ports.push(Some(CniPort::new(
					port,
					srss[idx].as_ref(),
					rsq[idx].as_ref(),
					Arc::clone(&arp[idx]),
					dhcp[idx].clone(),
					flags.contains(InitFlags::PTP_ENABLE),
					Arc::clone(&ptp_sink),
				)?));
			}
		}
		let cni = Cni::new(cni_ports, !flags.contains(InitFlags::CNI_THREAD));
		cni.start(&main_group)?;

		let stack = Arc::new(Self {
			params,
			aborted,
			ports,
			srss,
			rsq,
			tsq,
			arp,
			dhcp,
			cni,
			main_group,
			ptp_sink,
			service_tasklets: Mutex::new(service_tasklets),
			socket_idx: AtomicUsize::new(0),
			stopped: AtomicBool::new(false),
		});

		// DHCP ports must reach BOUND within the init window or the whole
		// init fails
		let clients: Vec<Arc<Dhcp>> = stack.dhcp.iter().flatten().cloned().collect();
		if !clients.is_empty() {
			for client in &clients {
				client.start();
			}
			if !dhcp::wait_bound(&clients, DHCP_INIT_TRIES, DHCP_INIT_INTERVAL) {
				error!("dhcp init window expired");
				stack.shutdown();
				return Err(Error::Timeout);
			}
		}

		info!("stack: up with {} port(s)", stack.ports.len());
		Ok(stack)
	}

	pub fn num_ports(&self) -> usize {
		self.ports.len()
	}

	pub fn port(&self, idx: usize) -> Result<&Arc<PortIf>> {
		self.ports.get(idx).ok_or(Error::InvalidArg("bad port index"))
	}

	pub fn arp(&self, idx: usize) -> Result<&Arc<Arp>> {
		self.arp.get(idx).ok_or(Error::InvalidArg("bad port index"))
	}

	pub fn dhcp(&self, idx: usize) -> Option<&Arc<Dhcp>> {
		self.dhcp.get(idx).and_then(|d| d.as_ref())
	}

	pub fn cni(&self) -> &Cni {
		&self.cni
	}

	pub(crate) fn cni_port(&self, idx: usize) -> Option<&Arc<CniPort>> {
		self.cni.port_ctx(idx)
	}

	pub fn main_group(&self) -> &Arc<SchedGroup> {
		&self.main_group
	}

	pub fn has_flag(&self, flag: InitFlags) -> bool {
		self.params.flags.contains(flag)
	}

	pub fn set_ptp_sink(&self, sink: Arc<dyn PtpSink>) {
		*self.ptp_sink.lock() = Some(sink);
	}

	/// Requests a prompt return of every blocking API with `Aborted`.
	pub fn abort(&self) {
		self.aborted.store(true, Ordering::Release);
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted.load(Ordering::Acquire)
	}

	pub(crate) fn next_socket_idx(&self) -> usize {
		self.socket_idx.fetch_add(1, Ordering::Relaxed)
	}

	/// Opens a receive handle on `port` for `flow`. The mode (dedicated
	/// queue, shared queue, software RSS or CNI sub-queue) is picked here,
	/// once.
	pub fn rxq_get(&self, port: usize, flow: FlowSpec) -> Result<RxqHandle> {
		if flow.sys_queue {
			return Err(Error::InvalidFlow("sys_queue is reserved for the core"));
		}
		self.rxq_get_internal(port, flow, SESSION_RING_COUNT)
	}

	pub(crate) fn rxq_get_internal(
		&self,
		port: usize,
		flow: FlowSpec,
		ring_count: usize,
	) -> Result<RxqHandle> {
		let p = self.port(port)?;
		rxq_get(
			&RxqSources {
				port: p,
				srss: self.srss[port].as_ref(),
				rsq: self.rsq[port].as_ref(),
				cni: self.cni_port(port),
			},
			flow,
			ring_count,
		)
	}

	/// Opens a transmit handle on `port` for `flow`.
	pub fn txq_get(&self, port: usize, flow: TxFlowSpec) -> Result<TxqHandle> {
		if flow.sys_queue {
			return Err(Error::InvalidFlow("sys_queue is reserved for the core"));
		}
		let p = self.port(port)?;
		txq_get(p, self.tsq[port].as_ref(), flow)
	}

	pub fn stat_dump(&self) {
		self.cni.stat_dump();
		self.main_group.stat_dump();
	}

	/// Orderly teardown: DHCP leases released, ingress stopped, scheduler
	/// drained. Idempotent; also runs on drop.
	pub fn shutdown(&self) {
		if self.stopped.swap(true, Ordering::AcqRel) {
			return;
		}
		self.abort();
		for client in self.dhcp.iter().flatten() {
			client.release();
		}
		self.cni.stop();
		self.service_tasklets.lock().unwrap().clear();
		self.main_group.stop();
		info!("stack: down");
	}
}

impl Drop for Stack {
	fn drop(&mut self) {
		self.shutdown();
	}
}
