//! Lock-free multi-producer / multi-consumer FIFO ring over a shared region
//!
//! The ring lives directly inside a [`SharedRegion`], immediately past the
//! region header:
//!
//! ```text
//! | region header (16) | ring header (24) | node table (32 x N) | buffers (B x N) |
//! ```
//!
//! Four cursors partition the nodes into five states (empty, reserved for
//! write, written, reserved for read, read). Writers race on `write_start`
//! with CAS to reserve a slot and readers race on `read_start` symmetrically.
//! Publication is two-phase: a finished writer sets its node's `done_write`
//! flag, then whoever owns the `write_end` frontier drains every contiguous
//! completed node. Reservation order therefore defines the order consumers
//! observe, even when slot filling completes out of order. The read side
//! mirrors this with `done_read` and `read_end`.
//!
//! Slow paths wait on two named auto-reset events derived from the ring name:
//! `<name>_data_exists` (pulsed when a publish makes an empty ring readable)
//! and `<name>_slot_available` (pulsed when a consume makes a full ring
//! writable). Waits are sliced so shutdown is observed promptly and a missed
//! pulse only costs one slice.

use crate::event::ShmEvent;
use crate::region::{SharedRegion, REGION_HEADER_SIZE};
use crate::{IpcError, Result};
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Size of the ring cursor header
pub const RING_HEADER_SIZE: usize = 24;

/// Size of one node table entry
pub const NODE_ENTRY_SIZE: usize = 32;

/// Fewest nodes a ring may have; a single node degenerates the emptiness test
pub const MIN_NODE_COUNT: u32 = 2;

/// Wait slice between shutdown checks while blocked on an event
const WAIT_SLICE: Duration = Duration::from_millis(500);

#[repr(C)]
struct RingHeader {
    read_end: AtomicU32,
    read_start: AtomicU32,
    write_end: AtomicU32,
    write_start: AtomicU32,
    node_count: AtomicU32,
    node_buffer_size: u32,
}

#[repr(C)]
struct Node {
    next: u32,
    prev: u32,
    done_read: AtomicU32,
    done_write: AtomicU32,
    offset: u64,
    index: u32,
    amount_written: AtomicU32,
}

const _: () = assert!(size_of::<RingHeader>() == RING_HEADER_SIZE);
const _: () = assert!(size_of::<Node>() == NODE_ENTRY_SIZE);

/// A named lock-free FIFO of fixed-size byte packets
pub struct Ring {
    region: SharedRegion,
    data_exists: ShmEvent,
    slot_available: ShmEvent,
    header: *const RingHeader,
    nodes: *const Node,
    node_count: u32,
    node_buffer_size: u32,
}

// SAFETY: every mutable shared field is atomic; node buffers are handed out
// exclusively via cursor reservation.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create a new ring with `node_count` slots of `node_buffer_size` bytes
    pub fn create(name: &str, node_count: u32, node_buffer_size: u32) -> Result<Self> {
        if node_count < MIN_NODE_COUNT {
            return Err(IpcError::OutOfRange {
                what: "node_count",
                value: node_count as u64,
                min: MIN_NODE_COUNT as u64,
                max: u32::MAX as u64,
            });
        }
        if node_buffer_size == 0 {
            return Err(IpcError::OutOfRange {
                what: "node_buffer_size",
                value: 0,
                min: 1,
                max: u32::MAX as u64,
            });
        }

        let n = node_count as usize;
        let payload = RING_HEADER_SIZE
            .checked_add(n.checked_mul(NODE_ENTRY_SIZE).ok_or(Self::size_error(node_count))?)
            .and_then(|v| v.checked_add(n.checked_mul(node_buffer_size as usize)?))
            .ok_or(Self::size_error(node_count))?;

        let region = SharedRegion::create(name, payload)?;
        let data_exists = ShmEvent::create(&format!("{}_data_exists", name))?;
        let slot_available = ShmEvent::create(&format!("{}_slot_available", name))?;

        let header = region.raw_base() as *mut RingHeader;
        let nodes = unsafe { region.raw_base().add(RING_HEADER_SIZE) } as *mut Node;
        let buffers_start = REGION_HEADER_SIZE + RING_HEADER_SIZE + n * NODE_ENTRY_SIZE;

        unsafe {
            for i in 0..n {
                ptr::write(
                    nodes.add(i),
                    Node {
                        next: ((i + 1) % n) as u32,
                        prev: ((i + n - 1) % n) as u32,
                        done_read: AtomicU32::new(0),
                        done_write: AtomicU32::new(0),
                        offset: (buffers_start + i * node_buffer_size as usize) as u64,
                        index: i as u32,
                        amount_written: AtomicU32::new(0),
                    },
                );
            }
            ptr::write(
                header,
                RingHeader {
                    read_end: AtomicU32::new(0),
                    read_start: AtomicU32::new(0),
                    write_end: AtomicU32::new(0),
                    write_start: AtomicU32::new(0),
                    node_count: AtomicU32::new(0),
                    node_buffer_size,
                },
            );
            // Geometry is published last; openers treat a zero node count as
            // an initialization still in flight.
            (*header).node_count.store(node_count, Ordering::Release);
        }

        debug!(name, node_count, node_buffer_size, "created ring");
        Ok(Self {
            region,
            data_exists,
            slot_available,
            header,
            nodes,
            node_count,
            node_buffer_size,
        })
    }

    /// Open an existing ring, reading its geometry from the shared header
    pub fn open(name: &str) -> Result<Self> {
        let region = SharedRegion::open(name)?;
        if region.payload_len() < RING_HEADER_SIZE {
            return Err(IpcError::Platform(format!(
                "Region {} too small for a ring header",
                name
            )));
        }

        let header = region.raw_base() as *const RingHeader;
        let node_count = unsafe { (*header).node_count.load(Ordering::Acquire) };
        if node_count < MIN_NODE_COUNT {
            return Err(IpcError::Platform(format!(
                "Ring {} is not initialized yet",
                name
            )));
        }
        let node_buffer_size = unsafe { (*header).node_buffer_size };

        let n = node_count as usize;
        let expected =
            RING_HEADER_SIZE + n * NODE_ENTRY_SIZE + n * node_buffer_size as usize;
        if region.payload_len() != expected {
            return Err(IpcError::Platform(format!(
                "Ring {} geometry disagrees with its region size",
                name
            )));
        }

        let nodes = unsafe { region.raw_base().add(RING_HEADER_SIZE) } as *const Node;
        let data_exists = ShmEvent::open(&format!("{}_data_exists", name))?;
        let slot_available = ShmEvent::open(&format!("{}_slot_available", name))?;

        debug!(name, node_count, node_buffer_size, "opened ring");
        Ok(Self {
            region,
            data_exists,
            slot_available,
            header,
            nodes,
            node_count,
            node_buffer_size,
        })
    }

    fn size_error(node_count: u32) -> IpcError {
        IpcError::OutOfRange {
            what: "ring size",
            value: node_count as u64,
            min: MIN_NODE_COUNT as u64,
            max: i64::MAX as u64,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: header points into the mapping owned by self.region.
        unsafe { &*self.header }
    }

    #[inline]
    fn node(&self, index: u32) -> &Node {
        debug_assert!(index < self.node_count);
        // SAFETY: cursors only ever hold indices < node_count; the node table
        // is inside the mapping owned by self.region.
        unsafe { &*self.nodes.add(index as usize) }
    }

    /// Raw payload buffer of a node; exclusive access comes from reservation
    #[inline]
    fn buffer_ptr(&self, node: &Node) -> *mut u8 {
        // SAFETY: offsets were computed at creation to lie inside the region.
        unsafe { self.region.base_ptr().add(node.offset as usize) }
    }

    /// Number of nodes (`N`)
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Per-node byte capacity (`B`)
    pub fn node_buffer_size(&self) -> u32 {
        self.node_buffer_size
    }

    /// Ring (and backing region) name
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether the owner has torn the ring down
    pub fn is_shutdown(&self) -> bool {
        self.region.is_shutdown()
    }

    /// Publish the terminal shutdown signal and wake both wait queues
    pub fn mark_shutdown(&self) {
        self.region.mark_shutdown();
        self.data_exists.pulse();
        self.slot_available.pulse();
    }

    /// Wake one blocked reader; disposal uses this to hurry workers along
    pub(crate) fn pulse_data(&self) {
        self.data_exists.pulse();
    }

    /// Free all names owned by this ring without unmapping
    pub(crate) fn unlink_now(&self) {
        self.region.unlink_now();
        self.data_exists.unlink_now();
        self.slot_available.unlink_now();
    }

    // ---- reservation and publication ------------------------------------

    /// Reserve the next writable node, waiting up to `timeout` when full
    fn reserve_write(&self, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.region.is_shutdown() {
                return None;
            }
            let w = self.header().write_start.load(Ordering::Acquire);
            let node = self.node(w);
            if node.next == self.header().read_end.load(Ordering::Acquire) {
                // Full. Sleep a slice on slot_available, then re-check.
                if !self.wait_slice(&self.slot_available, deadline) {
                    return None;
                }
                continue;
            }
            if self
                .header()
                .write_start
                .compare_exchange(w, node.next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(w);
            }
            // Lost the reservation race; retry.
        }
    }

    /// Reserve the next readable node, waiting up to `timeout` when empty
    fn reserve_read(&self, timeout: Option<Duration>) -> Option<u32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.region.is_shutdown() {
                return None;
            }
            let r = self.header().read_start.load(Ordering::Acquire);
            if r == self.header().write_end.load(Ordering::Acquire) {
                if !self.wait_slice(&self.data_exists, deadline) {
                    return None;
                }
                continue;
            }
            let node = self.node(r);
            if self
                .header()
                .read_start
                .compare_exchange(r, node.next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(r);
            }
        }
    }

    /// One bounded event wait; `false` means the deadline has passed
    fn wait_slice(&self, event: &ShmEvent, deadline: Option<Instant>) -> bool {
        let slice = match deadline {
            None => WAIT_SLICE,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                (d - now).min(WAIT_SLICE)
            }
        };
        event.wait(Some(slice));
        // Timeouts and wakeups converge here: the caller re-checks cursors,
        // and an expired deadline is caught on the next call.
        deadline.is_none_or(|d| Instant::now() < d)
    }

    /// Mark a filled node complete and advance `write_end` over every
    /// contiguously completed node
    fn publish(&self, index: u32) {
        self.node(index).done_write.store(1, Ordering::Release);
        loop {
            let e = self.header().write_end.load(Ordering::Acquire);
            let node = self.node(e);
            if node
                .done_write
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Not our turn, or another publisher already drained past us.
                return;
            }
            let was_empty = e == self.header().read_start.load(Ordering::Acquire);
            let _ = self.header().write_end.compare_exchange(
                e,
                node.next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if was_empty {
                self.data_exists.pulse();
            }
        }
    }

    /// Mark a drained node consumed and advance `read_end` symmetrically
    fn release_read(&self, index: u32) {
        self.node(index).done_read.store(1, Ordering::Release);
        loop {
            let e = self.header().read_end.load(Ordering::Acquire);
            let node = self.node(e);
            if node
                .done_read
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            let was_full = node.prev == self.header().write_start.load(Ordering::Acquire);
            let _ = self.header().read_end.compare_exchange(
                e,
                node.next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if was_full {
                self.slot_available.pulse();
            }
        }
    }

    // ---- write side ------------------------------------------------------

    /// Fill one slot in place through `fill`, which receives the whole node
    /// buffer and returns the byte count it populated
    ///
    /// Returns the published byte count, or 0 on timeout or shutdown.
    pub fn write_with<F>(&self, fill: F, timeout: Option<Duration>) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let Some(index) = self.reserve_write(timeout) else {
            return 0;
        };
        let node = self.node(index);
        // SAFETY: reservation grants exclusive access to this node's buffer
        // until publish; the buffer is node_buffer_size bytes by layout.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(self.buffer_ptr(node), self.node_buffer_size as usize)
        };
        let written = fill(buf).min(self.node_buffer_size as usize);
        node.amount_written.store(written as u32, Ordering::Release);
        self.publish(index);
        written
    }

    /// Write up to one node's worth of `data`; returns bytes written
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> usize {
        self.write_with(
            |buf| {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            },
            timeout,
        )
    }

    /// Write from a raw pointer; returns bytes written
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `len` bytes.
    pub unsafe fn write_raw(&self, data: *const u8, len: usize, timeout: Option<Duration>) -> usize {
        self.write_with(
            |buf| {
                let n = len.min(buf.len());
                ptr::copy_nonoverlapping(data, buf.as_mut_ptr(), n);
                n
            },
            timeout,
        )
    }

    /// Write a slice of plain values; returns elements written
    pub fn write_values<T: Copy>(&self, values: &[T], timeout: Option<Duration>) -> usize {
        let elem = size_of::<T>();
        if elem == 0 || (self.node_buffer_size as usize) < elem {
            return 0;
        }
        let fit = (self.node_buffer_size as usize / elem).min(values.len());
        let written = self.write_with(
            |buf| {
                let bytes = fit * elem;
                // SAFETY: T is Copy and bytes <= buf.len() by construction.
                unsafe {
                    ptr::copy_nonoverlapping(values.as_ptr() as *const u8, buf.as_mut_ptr(), bytes);
                }
                bytes
            },
            timeout,
        );
        written / elem
    }

    /// Write a single plain value; returns 1 on success, 0 otherwise
    pub fn write_value<T: Copy>(&self, value: &T, timeout: Option<Duration>) -> usize {
        self.write_values(std::slice::from_ref(value), timeout)
    }

    // ---- read side -------------------------------------------------------

    /// Drain one slot in place through `drain`, which receives exactly the
    /// bytes the producer published
    ///
    /// Returns the published byte count, or 0 on timeout or shutdown.
    pub fn read_with<F>(&self, drain: F, timeout: Option<Duration>) -> usize
    where
        F: FnOnce(&[u8]),
    {
        let Some(index) = self.reserve_read(timeout) else {
            return 0;
        };
        let node = self.node(index);
        let amount = node.amount_written.load(Ordering::Acquire) as usize;
        let amount = amount.min(self.node_buffer_size as usize);
        // SAFETY: reservation grants exclusive access until release_read.
        let buf = unsafe { std::slice::from_raw_parts(self.buffer_ptr(node), amount) };
        drain(buf);
        node.amount_written.store(0, Ordering::Relaxed);
        self.release_read(index);
        amount
    }

    /// Read one packet into `out`; returns bytes copied
    ///
    /// A packet larger than `out` is truncated to fit; the slot is released
    /// either way.
    pub fn read(&self, out: &mut [u8], timeout: Option<Duration>) -> usize {
        let mut copied = 0;
        self.read_with(
            |buf| {
                copied = buf.len().min(out.len());
                out[..copied].copy_from_slice(&buf[..copied]);
            },
            timeout,
        );
        copied
    }

    /// Read one packet into a raw buffer; returns bytes copied
    ///
    /// # Safety
    ///
    /// `out` must be valid for writes of `cap` bytes.
    pub unsafe fn read_raw(&self, out: *mut u8, cap: usize, timeout: Option<Duration>) -> usize {
        let mut copied = 0;
        self.read_with(
            |buf| {
                copied = buf.len().min(cap);
                ptr::copy_nonoverlapping(buf.as_ptr(), out, copied);
            },
            timeout,
        );
        copied
    }

    /// Read plain values into `out`; returns elements copied
    pub fn read_values<T: Copy>(&self, out: &mut [T], timeout: Option<Duration>) -> usize {
        let elem = size_of::<T>();
        if elem == 0 {
            return 0;
        }
        let mut copied = 0;
        self.read_with(
            |buf| {
                copied = (buf.len() / elem).min(out.len());
                // SAFETY: T is Copy; copied * elem <= buf.len() and fits out.
                unsafe {
                    ptr::copy_nonoverlapping(
                        buf.as_ptr(),
                        out.as_mut_ptr() as *mut u8,
                        copied * elem,
                    );
                }
            },
            timeout,
        );
        copied
    }

    /// Read a single plain value, if the packet carries at least one
    pub fn read_value<T: Copy>(&self, timeout: Option<Duration>) -> Option<T> {
        let elem = size_of::<T>();
        if elem == 0 {
            return None;
        }
        let mut slot: MaybeUninit<T> = MaybeUninit::uninit();
        let mut ok = false;
        self.read_with(
            |buf| {
                if buf.len() >= elem {
                    // SAFETY: source holds at least size_of::<T>() bytes and
                    // the unaligned copy lands in a local MaybeUninit.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            buf.as_ptr(),
                            slot.as_mut_ptr() as *mut u8,
                            elem,
                        );
                    }
                    ok = true;
                }
            },
            timeout,
        );
        // SAFETY: slot was fully written whenever ok is true.
        ok.then(|| unsafe { slot.assume_init() })
    }
}
