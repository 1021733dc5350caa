//! The queue multiplexer: every session talks to one [`RxqHandle`] and one
//! [`TxqHandle`] regardless of how the port maps sessions onto hardware
//! queues. The mode is chosen once at handle creation; the burst fast path
//! is a single tag dispatch.

pub mod pool;
pub mod shared_rx;
pub mod shared_tx;
pub mod srss;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::cni::{CniPort, CsqEntry};
use crate::config::PmdType;
use crate::error::{Error, Result};
use crate::mcast::{McastGuard, McastMgr};
use crate::mempool::Mbuf;
use crate::port::PortIf;
use crate::queue::pool::{RxQueue, TxQueue};
use crate::queue::shared_rx::{RsqEntry, SharedRxQueue};
use crate::queue::shared_tx::{SharedTxQueue, TsqEntry};
use crate::queue::srss::{SharedRss, SrssEntry};

/// Burst ceiling for one poll of a hardware queue.
pub(crate) const MAX_BURST: u16 = 128;

/// Ring depth handed to session entries unless the caller tunes it.
pub(crate) const SESSION_RING_COUNT: usize = 512;

/// What an RX session wants steered its way.
#[derive(Debug, Clone)]
pub struct FlowSpec {
	/// Catch residual traffic instead of one flow. Internal callers only.
	pub sys_queue: bool,
	/// Match on destination port alone.
	pub no_ip_flow: bool,
	/// Match on destination IP alone.
	pub no_port_flow: bool,
	/// Hang off the control-plane ingress instead of taking a hardware
	/// queue; for low-rate flows.
	pub use_cni_queue: bool,
	pub dip: Ipv4Addr,
	/// Expected source; ignored when `dip` is multicast.
	pub sip: Ipv4Addr,
	pub dst_port: u16,
	/// Header-split hint: payload offset the session would like separated.
	pub hdr_split: Option<u16>,
}

impl Default for FlowSpec {
	fn default() -> Self {
		Self {
			sys_queue: false,
			no_ip_flow: false,
			no_port_flow: false,
			use_cni_queue: false,
			dip: Ipv4Addr::UNSPECIFIED,
			sip: Ipv4Addr::UNSPECIFIED,
			dst_port: 0,
			hdr_split: None,
		}
	}
}

impl FlowSpec {
	pub fn udp(dip: Ipv4Addr, dst_port: u16) -> Self {
		Self {
			dip,
			dst_port,
			..Self::default()
		}
	}

	pub(crate) fn sys() -> Self {
		Self {
			sys_queue: true,
			..Self::default()
		}
	}
}

/// What a TX session needs from its queue.
#[derive(Debug, Clone)]
pub struct TxFlowSpec {
	/// Internal: the port's system queue.
	pub sys_queue: bool,
	/// Rate-limit the queue to this many bytes per second; zero is unshaped.
	pub bytes_per_sec: u64,
	pub dip: Ipv4Addr,
	pub dst_port: u16,
}

impl Default for TxFlowSpec {
	fn default() -> Self {
		Self {
			sys_queue: false,
			bytes_per_sec: 0,
			dip: Ipv4Addr::UNSPECIFIED,
			dst_port: 0,
		}
	}
}

enum RxqMode {
	/// Kernel-socket PMD: traffic is handled outside the datapath.
	Stub,
	Direct(RxQueue),
	Rsq(Arc<RsqEntry>),
	Srss(Arc<SrssEntry>),
	Csq(Arc<CsqEntry>),
}

/// A session's receive handle. Dropping it releases the queue, tears down
/// the flow rule and drains any buffered packets.
pub struct RxqHandle {
	mode: RxqMode,
	queue_id: u16,
	_mcast: Option<McastGuard>,
}

impl RxqHandle {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn mode_name(&self) -> &'static str {
		match &self.mode {
			RxqMode::Stub => "stub",
			RxqMode::Direct(_) => "dedicated",
			RxqMode::Rsq(_) => "shared",
			RxqMode::Srss(_) => "rss",
			RxqMode::Csq(_) => "cni",
		}
	}

	/// Never blocks; returns 0..=max packets appended to `pkts`. Anything
	/// beyond `max` stays queued for the next call.
	pub fn burst(&self, pkts: &mut Vec<Mbuf>, max: u16) -> u16 {
		match &self.mode {
			RxqMode::Stub => 0,
			RxqMode::Direct(q) => q.burst(pkts, max),
			RxqMode::Rsq(e) => e.burst(pkts, max),
			RxqMode::Srss(e) => e.burst(pkts, max),
			RxqMode::Csq(e) => e.burst(pkts, max),
		}
	}

	/// Statistics of the session entry, where the mode has them:
	/// `(enqueue_cnt, enqueue_fail_cnt)`.
	pub fn stats(&self) -> Option<(u64, u64)> {
		match &self.mode {
			RxqMode::Rsq(e) => Some((e.enqueue_count(), e.enqueue_fail_count())),
			RxqMode::Srss(e) => Some((e.enqueue_count(), e.enqueue_fail_count())),
			RxqMode::Csq(e) => Some((e.enqueue_count(), e.enqueue_fail_count())),
			RxqMode::Stub | RxqMode::Direct(_) => None,
		}
	}

	/// Releases the handle. Equivalent to dropping it.
	pub fn put(self) {}
}

impl Drop for RxqHandle {
	fn drop(&mut self) {
		match &self.mode {
			RxqMode::Rsq(e) => e.unlink(),
			RxqMode::Srss(e) => e.unlink(),
			RxqMode::Csq(e) => e.unlink(),
			RxqMode::Stub | RxqMode::Direct(_) => {}
		}
	}
}

pub(crate) struct RxqSources<'a> {
	pub port: &'a Arc<PortIf>,
	pub srss: Option<&'a Arc<SharedRss>>,
	pub rsq: Option<&'a Arc<SharedRxQueue>>,
	pub cni: Option<&'a Arc<CniPort>>,
}

/// Mode selection, made once per handle:
/// kernel-socket stub, then SRSS, then RSQ, then CSQ on request, then a
/// dedicated hardware queue.
pub(crate) fn rxq_get(
	src: &RxqSources<'_>,
	flow: FlowSpec,
	ring_count: usize,
) -> Result<RxqHandle> {
	let mcast = if !flow.sys_queue && flow.dip.is_multicast() {
		Some(McastMgr::join(&src.port.mcast, flow.dip)?)
	} else {
		None
	};

	let mode = if src.port.pmd() == PmdType::KernelSocket {
		RxqMode::Stub
	} else if let Some(srss) = src.srss {
		RxqMode::Srss(SharedRss::get(srss, flow, ring_count)?)
	} else if let Some(rsq) = src.rsq {
		RxqMode::Rsq(SharedRxQueue::get(rsq, flow, ring_count)?)
	} else if flow.use_cni_queue {
		let cni = src
			.cni
			.ok_or(Error::InvalidFlow("no cni ingress on this port"))?;
		RxqMode::Csq(CniPort::csq_get(cni, flow, ring_count)?)
	} else {
		match src.port.rxq_pool.get(&flow) {
			Ok(q) => RxqMode::Direct(q),
			// NIC refused the rule: fall back to software dispatch if the
			// port has a control-plane ingress to carry it
			Err(Error::HardwareReject) if src.cni.is_some() && !flow.sys_queue => {
				warn!(
					"port {}: flow rule rejected, falling back to cni queue",
					src.port.idx()
				);
				RxqMode::Csq(CniPort::csq_get(src.cni.unwrap(), flow, ring_count)?)
			}
			Err(e) => return Err(e),
		}
	};

	let queue_id = match &mode {
		RxqMode::Stub => 0,
		RxqMode::Direct(q) => q.queue_id(),
		RxqMode::Rsq(e) => e.queue_id(),
		RxqMode::Srss(e) => e.queue_id(),
		RxqMode::Csq(e) => e.queue_id(),
	};

	Ok(RxqHandle {
		mode,
		queue_id,
		_mcast: mcast,
	})
}

enum TxqMode {
	Stub,
	Direct(TxQueue),
	Tsq(Arc<TsqEntry>),
}

/// A session's transmit handle.
pub struct TxqHandle {
	mode: TxqMode,
	queue_id: u16,
}

impl TxqHandle {
	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	/// Non-blocking; drains the transmitted prefix of `pkts`.
	pub fn burst(&self, pkts: &mut Vec<Mbuf>) -> u16 {
		match &self.mode {
			TxqMode::Stub => {
				let n = pkts.len() as u16;
				pkts.clear();
				n
			}
			TxqMode::Direct(q) => q.burst(pkts),
			TxqMode::Tsq(e) => e.burst(pkts),
		}
	}

	/// Busy-loops until everything is sent or `timeout` elapses; returns the
	/// count actually sent.
	pub fn burst_busy(&self, pkts: &mut Vec<Mbuf>, timeout: Duration) -> u16 {
		let start = Instant::now();
		let backoff = Backoff::new();
		let mut sent = 0;
		while !pkts.is_empty() {
			if !timeout.is_zero() && start.elapsed() >= timeout {
				warn!(
					"txq {}: busy burst timed out after {timeout:?}",
					self.queue_id
				);
				break;
			}
			let n = self.burst(pkts);
			if n == 0 {
				backoff.snooze();
			} else {
				sent += n;
				backoff.reset();
			}
		}
		sent
	}

	/// Pushes pad frames so no descriptor of this session is left behind the
	/// hardware watermark. Required before the queue may be freed.
	pub fn flush(&self, pad: &Mbuf) {
		match &self.mode {
			TxqMode::Stub => {}
			TxqMode::Direct(q) => q.flush(pad),
			TxqMode::Tsq(e) => e.flush(pad),
		}
	}

	pub fn done_cleanup(&self) {
		match &self.mode {
			TxqMode::Stub => {}
			TxqMode::Direct(q) => q.done_cleanup(),
			TxqMode::Tsq(e) => e.done_cleanup(),
		}
	}

	/// Marks the underlying queue dead after a hardware fatal.
	pub fn fatal_error(&self) {
		match &self.mode {
			TxqMode::Stub => {}
			TxqMode::Direct(q) => q.set_fatal(),
			TxqMode::Tsq(e) => e.fatal_error(),
		}
	}

	/// Releases the handle. The caller must have flushed first.
	pub fn put(self) {}
}

pub(crate) fn txq_get(
	port: &Arc<PortIf>,
	tsq: Option<&Arc<SharedTxQueue>>,
	flow: TxFlowSpec,
) -> Result<TxqHandle> {
	let mode = if port.pmd() == PmdType::KernelSocket {
		TxqMode::Stub
	} else if let Some(tsq) = tsq {
		TxqMode::Tsq(SharedTxQueue::get(tsq, &flow)?)
	} else {
		TxqMode::Direct(port.txq_pool.get(&flow)?)
	};
	let queue_id = match &mode {
		TxqMode::Stub => 0,
		TxqMode::Direct(q) => q.queue_id(),
		TxqMode::Tsq(e) => e.queue_id(),
	};
	Ok(TxqHandle { mode, queue_id })
}
