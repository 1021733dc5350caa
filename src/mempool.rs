//! Pre-allocated pools of fixed-size packet buffers.
//!
//! [`Mbuf`] follows the driver refcount discipline: cloning a handle bumps
//! the slot refcount, dropping the last handle returns the slot to the free
//! list. Mutable access is only legal while the handle is unique; after that
//! the buffer is published to a consumer through an SPSC ring, whose
//! release/acquire pair orders the payload writes.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering, fence};

use hermit_sync::SpinMutex;

struct Slot {
	buf: UnsafeCell<Box<[u8]>>,
	len: AtomicUsize,
	refcnt: AtomicU32,
}

// Slot data is only written through a unique `Mbuf` and only read after the
// writer published the buffer (ring enqueue or refcount handoff).
unsafe impl Sync for Slot {}

pub(crate) struct PoolInner {
	name: String,
	elem_size: usize,
	slots: Box<[Slot]>,
	free: SpinMutex<Vec<usize>>,
}

/// A pool of `n` buffers of `elem_size` bytes each. Cheap to clone.
#[derive(Clone)]
pub struct Mempool(Arc<PoolInner>);

impl Mempool {
	pub fn new(name: &str, n: usize, elem_size: usize) -> Self {
		let slots = (0..n)
			.map(|_| Slot {
				buf: UnsafeCell::new(vec![0u8; elem_size].into_boxed_slice()),
				len: AtomicUsize::new(0),
				refcnt: AtomicU32::new(0),
			})
			.collect();
		let free = (0..n).rev().collect();
		debug!("mempool {name}: {n} elements of {elem_size} bytes");
		Self(Arc::new(PoolInner {
			name: name.to_string(),
			elem_size,
			slots,
			free: SpinMutex::new(free),
		}))
	}

	pub fn name(&self) -> &str {
		&self.0.name
	}

	pub fn elem_size(&self) -> usize {
		self.0.elem_size
	}

	/// Number of buffers currently on the free list.
	pub fn available(&self) -> usize {
		self.0.free.lock().len()
	}

	pub fn alloc(&self) -> Option<Mbuf> {
		let slot = self.0.free.lock().pop()?;
		let s = &self.0.slots[slot];
		debug_assert_eq!(s.refcnt.load(Ordering::Relaxed), 0);
		s.refcnt.store(1, Ordering::Relaxed);
		s.len.store(0, Ordering::Relaxed);
		Some(Mbuf {
			pool: Arc::clone(&self.0),
			slot,
		})
	}

	/// Allocates a buffer and fills it with `data`.
	pub fn alloc_from(&self, data: &[u8]) -> Option<Mbuf> {
		if data.len() > self.0.elem_size {
			return None;
		}
		let mut m = self.alloc()?;
		m.data_mut()[..data.len()].copy_from_slice(data);
		m.set_len(data.len());
		Some(m)
	}
}

/// A refcounted handle to one pool buffer.
pub struct Mbuf {
	pool: Arc<PoolInner>,
	slot: usize,
}

impl Mbuf {
	fn slot(&self) -> &Slot {
		&self.pool.slots[self.slot]
	}

	pub fn len(&self) -> usize {
		self.slot().len.load(Ordering::Relaxed)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn refcnt(&self) -> u32 {
		self.slot().refcnt.load(Ordering::Relaxed)
	}

	/// The filled part of the buffer.
	pub fn data(&self) -> &[u8] {
		let len = self.len();
		unsafe { &(&*self.slot().buf.get())[..len] }
	}

	/// The whole buffer, writable. Only legal while this handle is unique.
	pub fn data_mut(&mut self) -> &mut [u8] {
		debug_assert_eq!(self.refcnt(), 1, "write to a shared mbuf");
		unsafe { &mut *self.slot().buf.get() }
	}

	pub fn set_len(&mut self, len: usize) {
		debug_assert!(len <= self.pool.elem_size);
		self.slot().len.store(len, Ordering::Relaxed);
	}
}

impl Clone for Mbuf {
	fn clone(&self) -> Self {
		self.slot().refcnt.fetch_add(1, Ordering::Relaxed);
		Self {
			pool: Arc::clone(&self.pool),
			slot: self.slot,
		}
	}
}

impl Drop for Mbuf {
	fn drop(&mut self) {
		if self.slot().refcnt.fetch_sub(1, Ordering::Release) == 1 {
			fence(Ordering::Acquire);
			self.pool.free.lock().push(self.slot);
		}
	}
}

impl core::fmt::Debug for Mbuf {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Mbuf")
			.field("slot", &self.slot)
			.field("len", &self.len())
			.field("refcnt", &self.refcnt())
			.finish()
	}
}

unsafe impl Send for Mbuf {}
unsafe impl Sync for Mbuf {}
