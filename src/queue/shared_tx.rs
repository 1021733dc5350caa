//! TSQ: one hardware TX queue shared by many sessions.
//!
//! The queue lock is held only around the hardware burst; sessions allocate
//! from the shared TX mempool and otherwise never contend.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hermit_sync::SpinMutex;

use crate::error::{Error, Result};
use crate::mempool::{Mbuf, Mempool};
use crate::queue::TxFlowSpec;
use crate::queue::pool::TxQueue;

pub struct SharedTxQueue {
	queue: SpinMutex<TxQueue>,
	queue_id: u16,
	pool: Mempool,
	entry_cnt: AtomicUsize,
	fatal: AtomicBool,
}

impl SharedTxQueue {
	pub(crate) fn new(queue: TxQueue, pool: Mempool) -> Arc<Self> {
		let queue_id = queue.queue_id();
		info!("tsq: sharing tx queue {queue_id}");
		Arc::new(Self {
			queue: SpinMutex::new(queue),
			queue_id,
			pool,
			entry_cnt: AtomicUsize::new(0),
			fatal: AtomicBool::new(false),
		})
	}

	pub fn queue_id(&self) -> u16 {
		self.queue_id
	}

	pub fn entry_count(&self) -> usize {
		self.entry_cnt.load(Ordering::Relaxed)
	}

	pub(crate) fn get(this: &Arc<Self>, flow: &TxFlowSpec) -> Result<Arc<TsqEntry>> {
		if this.fatal.load(Ordering::Relaxed) {
			return Err(Error::Fatal);
		}
		this.entry_cnt.fetch_add(1, Ordering::Relaxed);
		Ok(Arc::new(TsqEntry {
			parent: Arc::downgrade(this),
			flow: flow.clone(),
			tx_cnt: AtomicU64::new(0),
		}))
	}

	fn burst(&self, pkts: &mut Vec<Mbuf>) -> u16 {
		self.queue.lock().burst(pkts)
	}
}

/// One session's handle on the shared queue.
pub struct TsqEntry {
	parent: Weak<SharedTxQueue>,
	flow: TxFlowSpec,
	tx_cnt: AtomicU64,
}

impl TsqEntry {
	pub fn queue_id(&self) -> u16 {
		self.parent.upgrade().map_or(0, |p| p.queue_id)
	}

	pub fn flow(&self) -> &TxFlowSpec {
		&self.flow
	}

	pub fn tx_count(&self) -> u64 {
		self.tx_cnt.load(Ordering::Relaxed)
	}

	/// Allocates a TX buffer from the shared mempool.
	pub fn alloc(&self) -> Result<Mbuf> {
		let parent = self.parent.upgrade().ok_or(Error::Fatal)?;
		parent
			.pool
			.alloc()
			.ok_or(Error::NoResource("shared tx mempool empty"))
	}

	pub fn burst(&self, pkts: &mut Vec<Mbuf>) -> u16 {
		let Some(parent) = self.parent.upgrade() else {
			return 0;
		};
		let sent = parent.burst(pkts);
		self.tx_cnt.fetch_add(u64::from(sent), Ordering::Relaxed);
		sent
	}

	pub fn flush(&self, pad: &Mbuf) {
		if let Some(parent) = self.parent.upgrade() {
			parent.queue.lock().flush(pad);
		}
	}

	pub fn done_cleanup(&self) {
		if let Some(parent) = self.parent.upgrade() {
			parent.queue.lock().done_cleanup();
		}
	}

	/// A hardware fatal on the shared queue poisons every entry.
	pub fn fatal_error(&self) {
		if let Some(parent) = self.parent.upgrade() {
			parent.fatal.store(true, Ordering::Relaxed);
			parent.queue.lock().set_fatal();
		}
	}
}

impl Drop for TsqEntry {
	fn drop(&mut self) {
		if let Some(parent) = self.parent.upgrade() {
			parent.entry_cnt.fetch_sub(1, Ordering::Relaxed);
		}
	}
}
