//! Lock-free single-producer single-consumer byte queue.
//!
//! Backs both directions of the serial transport: the USB interrupt
//! handler is the producer of the RX ring and the consumer of the TX
//! ring, foreground code is the other side of each. One slot of the
//! storage is kept unused so that `head == tail` always means empty
//! and never full.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, Ordering};

/// Fixed-capacity SPSC byte ring.
///
/// `N` must be a power of two and at most 32768. Usable capacity is
/// `N - 1`. The producer side only ever writes `head`, the consumer
/// side only ever writes `tail`, so a single producer and a single
/// consumer may use one ring concurrently without further locking.
/// The *_unchecked methods skip the occupancy check and must only be
/// called after `write_available`/`read_available` confirmed room.
pub struct RingBuffer<const N: usize> {
    head: AtomicU16,
    tail: AtomicU16,
    buf: UnsafeCell<[u8; N]>,
}

// Safe under the SPSC discipline documented above: the byte cells are
// only written between a reservation and the matching index publish.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    const MASK: u16 = (N - 1) as u16;

    /// Creates an empty ring.
    pub const fn new() -> Self {
        assert!(N.is_power_of_two());
        assert!(N >= 2 && N <= 32768);
        Self {
            head: AtomicU16::new(0),
            tail: AtomicU16::new(0),
            buf: UnsafeCell::new([0; N]),
        }
    }

    /// Usable capacity, one less than the storage size.
    pub const fn capacity(&self) -> u16 {
        (N - 1) as u16
    }

    /// Number of bytes ready to read.
    pub fn read_available(&self) -> u16 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & Self::MASK
    }

    /// Number of bytes that can be written without overflowing.
    pub fn write_available(&self) -> u16 {
        self.capacity() - self.read_available()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.read_available() == 0
    }

    /// True when no more bytes fit.
    pub fn is_full(&self) -> bool {
        self.write_available() == 0
    }

    /// Drops all content. Only safe while no other side is active,
    /// e.g. from the USB reset handler.
    pub fn reset(&self) {
        self.tail
            .store(self.head.load(Ordering::Acquire), Ordering::Release);
    }

    fn slot(&self, index: u16) -> *mut u8 {
        let buf = self.buf.get() as *mut u8;
        // index is pre-masked by the callers
        unsafe { buf.add(index as usize) }
    }

    /// Appends one byte without checking for room.
    pub fn write_unchecked(&self, byte: u8) {
        let head = self.head.load(Ordering::Acquire);
        unsafe { *self.slot(head & Self::MASK) = byte };
        self.head
            .store(head.wrapping_add(1) & Self::MASK, Ordering::Release);
    }

    /// Appends one byte. Returns false when the ring is full.
    pub fn write(&self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.write_unchecked(byte);
        true
    }

    /// Appends as much of `data` as fits, returning the count taken.
    pub fn write_all(&self, data: &[u8]) -> usize {
        let room = self.write_available() as usize;
        let n = data.len().min(room);
        self.write_n_unchecked(&data[..n]);
        n
    }

    /// Appends all of `data` without checking for room.
    pub fn write_n_unchecked(&self, data: &[u8]) {
        let mut head = self.head.load(Ordering::Acquire);
        for &byte in data {
            unsafe { *self.slot(head & Self::MASK) = byte };
            head = head.wrapping_add(1) & Self::MASK;
        }
        self.head.store(head, Ordering::Release);
    }

    /// Removes and returns the oldest byte without checking occupancy.
    pub fn read_unchecked(&self) -> u8 {
        let tail = self.tail.load(Ordering::Acquire);
        let byte = unsafe { *self.slot(tail & Self::MASK) };
        self.tail
            .store(tail.wrapping_add(1) & Self::MASK, Ordering::Release);
        byte
    }

    /// Removes and returns the oldest byte, or None when empty.
    pub fn read(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.read_unchecked())
        }
    }

    /// Fills `out` from the ring, returning the number of bytes moved.
    pub fn read_n(&self, out: &mut [u8]) -> usize {
        let avail = self.read_available() as usize;
        let n = out.len().min(avail);
        let mut tail = self.tail.load(Ordering::Acquire);
        for slot in out[..n].iter_mut() {
            *slot = unsafe { *self.slot(tail & Self::MASK) };
            tail = tail.wrapping_add(1) & Self::MASK;
        }
        self.tail.store(tail, Ordering::Release);
        n
    }

    /// Copies up to `out.len()` bytes without consuming them.
    pub fn peek_n(&self, out: &mut [u8]) -> usize {
        let avail = self.read_available() as usize;
        let n = out.len().min(avail);
        let mut tail = self.tail.load(Ordering::Acquire);
        for slot in out[..n].iter_mut() {
            *slot = unsafe { *self.slot(tail & Self::MASK) };
            tail = tail.wrapping_add(1) & Self::MASK;
        }
        n
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
