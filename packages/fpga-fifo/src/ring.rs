// FIFO ring buffer shared between the producer loop and the consumer loop
//
// One large byte arena receives packets straight from the DMA transfer. The
// producer reserves a slot, fills it, and commits it; the consumer copies
// committed packets out in order. Completed packets are published as
// descriptors through a bounded lock-free queue layered over the arena, so
// packet boundaries survive wraparound and the consumer never has to guess
// where the next packet starts.
//
// Concurrency: exactly one producer and one consumer. The producer-side and
// consumer-side bookkeeping each sit behind their own lock, which is only ever
// taken by its own side (plus `reset`). The cursors and counters that cross
// sides are atomics with release/acquire ordering. The write cursor and
// `last_package_size` are producer-owned, the read cursor consumer-owned.

use crate::error::{StreamError, StreamResult};
use crate::types::PacketDescriptor;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A reserved region of the arena, valid until committed or re-reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSlot {
    pub offset: usize,
    pub size: usize,
    /// The write cursor wrapped to 0 (and the tail was zero-padded) for this slot
    pub wrapped: bool,
}

struct WriterState {
    /// Committed packets the consumer has not released yet, oldest first
    in_flight: VecDeque<PacketDescriptor>,
    /// Number of released packets already dropped from `in_flight`
    retired: u64,
    reservation: Option<WriteSlot>,
    next_sequence: u64,
}

#[derive(Default)]
struct ReaderState {
    /// Descriptor popped for a destination that turned out too small
    stash: Option<PacketDescriptor>,
}

pub struct RingBuffer {
    arena: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    max_pending: usize,
    descriptors: ArrayQueue<PacketDescriptor>,

    write_cursor: AtomicUsize,
    read_cursor: AtomicUsize,
    last_package_size: AtomicUsize,
    pending_count: AtomicUsize,

    released: AtomicU64,
    committed: AtomicU64,
    wraparounds: AtomicU64,
    peak_pending: AtomicUsize,

    writer: Mutex<WriterState>,
    reader: Mutex<ReaderState>,
}

// SAFETY: the arena is only touched through raw pointers. The producer writes
// only into the reserved slot, which `reserve_write_slot` guarantees does not
// overlap any committed-but-unreleased packet; the consumer reads only
// committed packets, and releases them (Release) after its copy completes,
// before the producer (Acquire) may reserve that region again. The writer and
// reader locks keep each side single-threaded.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a zeroed arena of `capacity` bytes holding at most `max_pending` unread packets
    pub fn new(capacity: usize, max_pending: usize) -> StreamResult<Self> {
        if capacity == 0 || max_pending == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "ring capacity ({}) and max pending ({}) must be non-zero",
                capacity, max_pending
            )));
        }

        let mut arena: Vec<UnsafeCell<u8>> = Vec::new();
        arena
            .try_reserve_exact(capacity)
            .map_err(|_| StreamError::AllocationFailed { bytes: capacity })?;
        arena.resize_with(capacity, || UnsafeCell::new(0));

        log::info!(
            "Allocated ring buffer: {} MiB, max {} pending packets",
            capacity / (1024 * 1024),
            max_pending
        );

        Ok(Self {
            arena: arena.into_boxed_slice(),
            capacity,
            max_pending,
            descriptors: ArrayQueue::new(max_pending),
            write_cursor: AtomicUsize::new(0),
            read_cursor: AtomicUsize::new(0),
            last_package_size: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            released: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            wraparounds: AtomicU64::new(0),
            peak_pending: AtomicUsize::new(0),
            writer: Mutex::new(WriterState {
                in_flight: VecDeque::new(),
                retired: 0,
                reservation: None,
                next_sequence: 0,
            }),
            reader: Mutex::new(ReaderState::default()),
        })
    }

    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.arena.as_ptr())
    }

    /// Reserve the slot the next packet of `size` bytes will be received into
    ///
    /// If the packet would not fit before the end of the arena, the tail is
    /// zero-filled and the write cursor restarts at offset 0. A slot that would
    /// overwrite unread packets, or a reservation while `max_pending` packets
    /// are unread, fails with `BacklogOverflow` and leaves the buffer untouched.
    pub fn reserve_write_slot(&self, size: usize) -> StreamResult<WriteSlot> {
        if size == 0 || size > self.capacity {
            return Err(StreamError::InvalidConfig(format!(
                "packet size {} does not fit a ring of {} bytes",
                size, self.capacity
            )));
        }

        let mut writer = self.writer.lock();
        self.retire_released(&mut writer);

        let pending = self.pending_count.load(Ordering::Acquire);
        if pending >= self.max_pending {
            return Err(StreamError::BacklogOverflow {
                pending,
                max: self.max_pending,
            });
        }

        let cursor = self.write_cursor.load(Ordering::Relaxed);
        let wrapped = cursor + size > self.capacity;
        let offset = if wrapped { 0 } else { cursor };

        if !Self::slot_is_free(&writer.in_flight, cursor, offset, size, wrapped) {
            log::warn!(
                "Write slot {}+{} would overwrite unread data, refusing",
                offset,
                size
            );
            return Err(StreamError::BacklogOverflow {
                pending,
                max: self.max_pending,
            });
        }

        if wrapped {
            let remaining = self.capacity - cursor;
            log::debug!(
                "Remaining space ({} bytes) smaller than a packet ({} bytes), wrapping to start",
                remaining,
                size
            );
            // SAFETY: [cursor, capacity) holds no unread packet (checked above)
            // and only the producer writes to the arena.
            unsafe {
                std::ptr::write_bytes(self.base_ptr().add(cursor), 0, remaining);
            }
            self.write_cursor.store(0, Ordering::Release);
            self.wraparounds.fetch_add(1, Ordering::Relaxed);
        }

        let slot = WriteSlot {
            offset,
            size,
            wrapped,
        };
        writer.reservation = Some(slot);
        Ok(slot)
    }

    /// Unread data occupies the ring from the oldest in-flight packet up to the write cursor
    fn slot_is_free(
        in_flight: &VecDeque<PacketDescriptor>,
        cursor: usize,
        offset: usize,
        size: usize,
        wrapped: bool,
    ) -> bool {
        let Some(oldest) = in_flight.front() else {
            return true;
        };
        let head = oldest.offset;

        if head < cursor {
            // unread: [head, cursor)
            !wrapped || offset + size <= head
        } else {
            // unread: [head, capacity) and [0, cursor)
            !wrapped && offset + size <= head
        }
    }

    fn retire_released(&self, writer: &mut WriterState) {
        let released = self.released.load(Ordering::Acquire);
        while writer.retired < released {
            if writer.in_flight.pop_front().is_none() {
                break;
            }
            writer.retired += 1;
        }
    }

    /// Give `fill` mutable access to the reserved slot's bytes
    pub fn fill_slot<R>(&self, slot: WriteSlot, fill: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        let writer = self.writer.lock();
        if writer.reservation != Some(slot) {
            return Err(StreamError::SlotMismatch {
                offset: slot.offset,
                size: slot.size,
            });
        }

        // SAFETY: the reservation lies inside the arena and overlaps no unread
        // packet; holding the writer lock keeps other producers out.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.base_ptr().add(slot.offset), slot.size) };
        Ok(fill(bytes))
    }

    /// Publish the packet in the reserved slot to the consumer
    pub fn commit_write(&self, offset: usize, size: usize) -> StreamResult<PacketDescriptor> {
        let mut writer = self.writer.lock();

        let pending = self.pending_count.load(Ordering::Acquire);
        if pending >= self.max_pending {
            return Err(StreamError::BacklogOverflow {
                pending,
                max: self.max_pending,
            });
        }

        match writer.reservation {
            Some(slot) if slot.offset == offset && slot.size == size => {}
            _ => return Err(StreamError::SlotMismatch { offset, size }),
        }
        writer.reservation = None;

        let descriptor = PacketDescriptor {
            offset,
            size,
            sequence: writer.next_sequence,
        };

        // the write cursor and pending_count move before the descriptor becomes
        // visible, so a consumer holding it always sees the packet's bytes as
        // written and can never decrement ahead of the increment
        let end = offset + size;
        let previous_cursor = self.write_cursor.load(Ordering::Relaxed);
        let previous_size = self.last_package_size.load(Ordering::Relaxed);
        self.last_package_size.store(size, Ordering::Release);
        self.write_cursor.store(end % self.capacity, Ordering::Release);
        let now_pending = self.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.descriptors.push(descriptor).is_err() {
            self.pending_count.fetch_sub(1, Ordering::AcqRel);
            self.write_cursor.store(previous_cursor, Ordering::Release);
            self.last_package_size.store(previous_size, Ordering::Release);
            return Err(StreamError::BacklogOverflow {
                pending,
                max: self.max_pending,
            });
        }

        writer.next_sequence += 1;
        writer.in_flight.push_back(descriptor);

        if end == self.capacity {
            self.wraparounds.fetch_add(1, Ordering::Relaxed);
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.peak_pending.fetch_max(now_pending, Ordering::Relaxed);

        Ok(descriptor)
    }

    /// Reserve, fill from `data` and commit in one call
    pub fn write_packet(&self, data: &[u8]) -> StreamResult<PacketDescriptor> {
        let slot = self.reserve_write_slot(data.len())?;
        self.fill_slot(slot, |bytes| bytes.copy_from_slice(data))?;
        self.commit_write(slot.offset, slot.size)
    }

    /// Copy the next unread packet into `dst`, polling for up to `timeout`
    pub fn try_read(&self, dst: &mut [u8], timeout: Duration) -> StreamResult<PacketDescriptor> {
        self.try_read_cancellable(dst, timeout, None)
    }

    /// Like `try_read`, but also gives up early once `cancel` fires
    ///
    /// Returns `Timeout` when nothing arrived in time; never returns partial data.
    pub fn try_read_cancellable(
        &self,
        dst: &mut [u8],
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> StreamResult<PacketDescriptor> {
        let deadline = Instant::now() + timeout;
        let mut reader = self.reader.lock();

        let descriptor = loop {
            if let Some(descriptor) = reader.stash.take() {
                break descriptor;
            }
            if let Some(descriptor) = self.descriptors.pop() {
                break descriptor;
            }

            if Instant::now() >= deadline || cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(StreamError::Timeout(timeout.as_millis() as u64));
            }
            std::thread::yield_now();
        };

        if dst.len() < descriptor.size {
            reader.stash = Some(descriptor);
            return Err(StreamError::BufferTooSmall {
                needed: descriptor.size,
                available: dst.len(),
            });
        }

        let available = self.written_from(descriptor.offset);
        if available < descriptor.size {
            self.release(&descriptor);
            return Err(StreamError::DataIncomplete {
                offset: descriptor.offset,
                size: descriptor.size,
                available,
            });
        }

        let previous = self.read_cursor.load(Ordering::Relaxed);
        if descriptor.offset < previous {
            log::debug!("Read position reset to start of buffer");
        }

        // SAFETY: the descriptor was committed (and its bytes published by the
        // queue's release/acquire) and stays reserved until `release` below.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_ptr().add(descriptor.offset),
                dst.as_mut_ptr(),
                descriptor.size,
            );
        }

        self.release(&descriptor);
        Ok(descriptor)
    }

    /// Bytes committed from `offset` up to the write cursor, or up to the end
    /// of the arena when the cursor has already wrapped behind it
    fn written_from(&self, offset: usize) -> usize {
        let cursor = self.write_cursor.load(Ordering::Acquire);
        if cursor > offset {
            cursor - offset
        } else {
            self.capacity - offset
        }
    }

    fn release(&self, descriptor: &PacketDescriptor) {
        self.read_cursor.store(
            (descriptor.offset + descriptor.size) % self.capacity,
            Ordering::Release,
        );
        self.pending_count.fetch_sub(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Release);
    }

    /// Reset cursors and counters to zero; the arena contents are left as is
    ///
    /// Waits for any in-progress write or read to finish.
    pub fn reset(&self) {
        let mut writer = self.writer.lock();
        let mut reader = self.reader.lock();

        while self.descriptors.pop().is_some() {}
        writer.in_flight.clear();
        writer.retired = 0;
        writer.reservation = None;
        writer.next_sequence = 0;
        reader.stash = None;

        self.write_cursor.store(0, Ordering::Release);
        self.read_cursor.store(0, Ordering::Release);
        self.last_package_size.store(0, Ordering::Release);
        self.pending_count.store(0, Ordering::Release);
        self.released.store(0, Ordering::Release);
        self.committed.store(0, Ordering::Relaxed);
        self.wraparounds.store(0, Ordering::Relaxed);
        self.peak_pending.store(0, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn write_position(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire)
    }

    pub fn read_position(&self) -> usize {
        self.read_cursor.load(Ordering::Acquire)
    }

    pub fn last_package_size(&self) -> usize {
        self.last_package_size.load(Ordering::Acquire)
    }

    /// Raised by each commit and lowered once every committed packet was read
    pub fn has_new_data(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    /// Completed packets not yet drained by the consumer
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    pub fn peak_pending(&self) -> usize {
        self.peak_pending.load(Ordering::Relaxed)
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn wraparounds(&self) -> u64 {
        self.wraparounds.load(Ordering::Relaxed)
    }

    /// Copy arena bytes for inspection; not synchronized with the producer
    #[cfg(test)]
    fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("max_pending", &self.max_pending)
            .field("write_position", &self.write_position())
            .field("read_position", &self.read_position())
            .field("pending_count", &self.pending_count())
            .finish()
    }
}
