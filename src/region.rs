//! Named shared memory region with a self-describing header
//!
//! Layout of the first 16 bytes (little-endian, naturally aligned):
//!
//! | field                | bytes | meaning                                   |
//! |----------------------|-------|-------------------------------------------|
//! | `shared_memory_size` | 8     | total region size including this header   |
//! | `shutdown`           | 4     | 1 once the owner has torn down            |
//! | reserved             | 4     | zero                                      |
//!
//! The owner creates a name exclusively and unlinks it on drop; peers open
//! the same name and discover the total size from the header. `shutdown`
//! moves 0 -> 1 exactly once and is the single cross-process teardown truth.

use crate::platform;
use crate::{IpcError, Result};
use memmap2::MmapMut;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Size of the region header preceding user payload
pub const REGION_HEADER_SIZE: usize = 16;

#[repr(C)]
struct RegionHeader {
    shared_memory_size: AtomicU64,
    shutdown: AtomicU32,
    _reserved: u32,
}

/// A named, fixed-size block of memory shared between processes
pub struct SharedRegion {
    /// Owns the mapping; never read directly but must outlive every pointer
    /// derived from `base`.
    #[allow(dead_code)]
    map: MmapMut,
    base: *mut u8,
    len: usize,
    name: String,
    owner: bool,
}

// SAFETY: the mapping is process-shared by construction; all mutable state in
// the header is atomic, and payload synchronization is the caller's contract.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new region with `payload_size` bytes past the header
    ///
    /// Fails with `NameInUse` if the name already exists. The returned handle
    /// is the owner: it may mark shutdown and it unlinks the name on drop.
    pub fn create(name: &str, payload_size: usize) -> Result<Self> {
        let total = payload_size
            .checked_add(REGION_HEADER_SIZE)
            .filter(|t| i64::try_from(*t).is_ok())
            .ok_or(IpcError::OutOfRange {
                what: "region size",
                value: payload_size as u64,
                min: 0,
                max: i64::MAX as u64,
            })?;

        let mut map = platform::create_region(name, total)?;
        let base = map.as_mut_ptr();

        // Fresh shm objects are zero-filled; publishing the size last makes
        // the header self-describing for any concurrent opener.
        let header = unsafe { &*(base as *const RegionHeader) };
        header.shutdown.store(0, Ordering::Relaxed);
        header
            .shared_memory_size
            .store(total as u64, Ordering::Release);

        debug!(name, total, "created shared region");
        Ok(Self {
            map,
            base,
            len: total,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing region, reading its total size from the header
    pub fn open(name: &str) -> Result<Self> {
        let mut map = platform::open_region(name)?;
        if map.len() < REGION_HEADER_SIZE {
            return Err(IpcError::Platform(format!(
                "Region {} smaller than its header",
                name
            )));
        }
        let base = map.as_mut_ptr();

        let header = unsafe { &*(base as *const RegionHeader) };
        let announced = header.shared_memory_size.load(Ordering::Acquire) as usize;
        if announced != map.len() {
            return Err(IpcError::Platform(format!(
                "Region {} header announces {} bytes but {} are mapped",
                name,
                announced,
                map.len()
            )));
        }

        debug!(name, len = map.len(), "opened shared region");
        Ok(Self {
            len: map.len(),
            map,
            base,
            name: name.to_string(),
            owner: false,
        })
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        // SAFETY: base points at a mapping of at least REGION_HEADER_SIZE
        // bytes, validated at construction; the header is repr(C) atomics.
        unsafe { &*(self.base as *const RegionHeader) }
    }

    /// Pointer to the first byte of the whole region (header included)
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the first byte past the header
    #[inline]
    pub fn raw_base(&self) -> *mut u8 {
        // SAFETY: len >= REGION_HEADER_SIZE was validated at construction.
        unsafe { self.base.add(REGION_HEADER_SIZE) }
    }

    /// Total mapped size including the header
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes available past the header
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.len - REGION_HEADER_SIZE
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the region
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Publish the terminal shutdown signal; only legal on the owner
    pub fn mark_shutdown(&self) {
        debug_assert!(self.owner, "mark_shutdown on a peer handle");
        self.header().shutdown.store(1, Ordering::Release);
        debug!(name = %self.name, "marked region shut down");
    }

    /// Whether the owner has torn the region down
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.header().shutdown.load(Ordering::Acquire) != 0
    }

    /// Unlink the region name now, keeping the mapping itself valid
    ///
    /// Idempotent; used by disposal so names are freed even when a handle
    /// leaks. Drop performs the same unlink for owner handles.
    pub fn unlink_now(&self) {
        if self.owner {
            let _ = platform::unlink_region(&self.name);
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.unlink_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_support::unique_name;

    #[test]
    fn test_create_and_open() {
        let name = unique_name("region_basic");
        let owner = SharedRegion::create(&name, 1024).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.len(), 1024 + REGION_HEADER_SIZE);
        assert_eq!(owner.payload_len(), 1024);

        let peer = SharedRegion::open(&name).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.len(), owner.len());
    }

    #[test]
    fn test_create_existing_fails() {
        let name = unique_name("region_dup");
        let _owner = SharedRegion::create(&name, 64).unwrap();
        assert!(matches!(
            SharedRegion::create(&name, 64),
            Err(IpcError::NameInUse(_))
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        let name = unique_name("region_missing");
        assert!(matches!(
            SharedRegion::open(&name),
            Err(IpcError::NameNotFound(_))
        ));
    }

    #[test]
    fn test_payload_visible_across_handles() {
        let name = unique_name("region_payload");
        let owner = SharedRegion::create(&name, 256).unwrap();
        let peer = SharedRegion::open(&name).unwrap();

        unsafe {
            for i in 0..256 {
                *owner.raw_base().add(i) = (i % 251) as u8;
            }
            for i in 0..256 {
                assert_eq!(*peer.raw_base().add(i), (i % 251) as u8);
            }
        }
    }

    #[test]
    fn test_shutdown_flag() {
        let name = unique_name("region_shutdown");
        let owner = SharedRegion::create(&name, 64).unwrap();
        let peer = SharedRegion::open(&name).unwrap();

        assert!(!peer.is_shutdown());
        owner.mark_shutdown();
        assert!(peer.is_shutdown());
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let name = unique_name("region_unlink");
        {
            let _owner = SharedRegion::create(&name, 64).unwrap();
        }
        assert!(matches!(
            SharedRegion::open(&name),
            Err(IpcError::NameNotFound(_))
        ));
    }
}
