//! Bounded single-producer single-consumer packet ring.
//!
//! This is the hand-off point between a demux loop and a session consumer.
//! The producer publishes a fully constructed buffer with a release store on
//! the tail; the consumer observes it with an acquire load, so a dequeued
//! buffer is always completely written.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::mempool::Mbuf;

pub struct MbufRing {
	mask: usize,
	slots: Box<[UnsafeCell<MaybeUninit<Mbuf>>]>,
	/// Producer position, owned by the single producer.
	tail: CachePadded<AtomicUsize>,
	/// Consumer position, owned by the single consumer.
	head: CachePadded<AtomicUsize>,
}

unsafe impl Send for MbufRing {}
unsafe impl Sync for MbufRing {}

impl MbufRing {
	/// `count` is rounded up to the next power of two.
	pub fn new(count: usize) -> Self {
		let cap = count.next_power_of_two().max(2);
		let slots = (0..cap)
			.map(|_| UnsafeCell::new(MaybeUninit::uninit()))
			.collect();
		Self {
			mask: cap - 1,
			slots,
			tail: CachePadded::new(AtomicUsize::new(0)),
			head: CachePadded::new(AtomicUsize::new(0)),
		}
	}

	pub fn capacity(&self) -> usize {
		self.mask + 1
	}

	pub fn len(&self) -> usize {
		let tail = self.tail.load(Ordering::Acquire);
		let head = self.head.load(Ordering::Acquire);
		tail.wrapping_sub(head)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Producer side. Returns the buffer on a full ring.
	pub fn enqueue(&self, m: Mbuf) -> core::result::Result<(), Mbuf> {
		let tail = self.tail.load(Ordering::Relaxed);
		let head = self.head.load(Ordering::Acquire);
		if tail.wrapping_sub(head) == self.capacity() {
			return Err(m);
		}
		unsafe { (*self.slots[tail & self.mask].get()).write(m) };
		self.tail.store(tail.wrapping_add(1), Ordering::Release);
		Ok(())
	}

	/// Producer side, all-or-nothing: either every buffer is enqueued or the
	/// whole batch is handed back.
	pub fn enqueue_bulk(
		&self,
		batch: impl ExactSizeIterator<Item = Mbuf>,
	) -> core::result::Result<(), Vec<Mbuf>> {
		let n = batch.len();
		let tail = self.tail.load(Ordering::Relaxed);
		let head = self.head.load(Ordering::Acquire);
		if self.capacity() - tail.wrapping_sub(head) < n {
			return Err(batch.collect());
		}
		for (i, m) in batch.enumerate() {
			unsafe { (*self.slots[tail.wrapping_add(i) & self.mask].get()).write(m) };
		}
		self.tail.store(tail.wrapping_add(n), Ordering::Release);
		Ok(())
	}

	/// Consumer side.
	pub fn dequeue(&self) -> Option<Mbuf> {
		let head = self.head.load(Ordering::Relaxed);
		let tail = self.tail.load(Ordering::Acquire);
		if head == tail {
			return None;
		}
		let m = unsafe { (*self.slots[head & self.mask].get()).assume_init_read() };
		self.head.store(head.wrapping_add(1), Ordering::Release);
		Some(m)
	}

	/// Consumer side: dequeues up to `max` buffers into `out`.
	pub fn burst(&self, out: &mut Vec<Mbuf>, max: u16) -> u16 {
		let mut got = 0;
		while got < max {
			match self.dequeue() {
				Some(m) => {
					out.push(m);
					got += 1;
				}
				None => break,
			}
		}
		got
	}

	/// Drops everything currently queued. Consumer side.
	pub fn drain(&self) -> usize {
		let mut n = 0;
		while self.dequeue().is_some() {
			n += 1;
		}
		n
	}
}

impl Drop for MbufRing {
	fn drop(&mut self) {
		self.drain();
	}
}
