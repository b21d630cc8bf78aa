//! Platform layer: named POSIX shared memory objects and the role-election lock
//!
//! All named resources live in the POSIX shared memory namespace
//! (`shm_open`/`shm_unlink`). Creation is exclusive (`O_CREAT | O_EXCL`) so
//! ownership of a name is decided by the kernel, never by a racy probe.

use crate::{IpcError, Result};
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;

/// Maximum length of a user-supplied resource name.
///
/// POSIX caps shm names at NAME_MAX; we reserve headroom for the suffixes the
/// ring and channel layers append (`_data_exists`, `_owner_mutex`, ...).
const MAX_NAME_LEN: usize = 200;

/// Validate a user-supplied resource name
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IpcError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(IpcError::InvalidName(format!(
            "name longer than {} bytes: {}",
            MAX_NAME_LEN, name
        )));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(IpcError::InvalidName(format!(
            "name contains '/' or NUL: {}",
            name
        )));
    }
    Ok(())
}

/// Normalize a name into the POSIX shm namespace (leading slash)
fn shm_path(name: &str) -> Result<String> {
    validate_name(name)?;
    Ok(format!("/{}", name))
}

/// Create a new named region of exactly `size` bytes and map it
///
/// Fails with `NameInUse` if the name already exists.
pub(crate) fn create_region(name: &str, size: usize) -> Result<MmapMut> {
    let path = shm_path(name)?;
    let fd = shm_open(
        path.as_str(),
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|e| IpcError::from_errno(e, name))?;

    let file = File::from(fd);
    file.set_len(size as u64)?;

    // SAFETY: the fd refers to a freshly created shm object whose length was
    // just set to `size`; the mapping cannot outlive truncation by another
    // process because the name was created exclusively.
    let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(map)
}

/// Open and map an existing named region, discovering its size from the object
pub(crate) fn open_region(name: &str) -> Result<MmapMut> {
    let path = shm_path(name)?;
    let fd = shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| IpcError::from_errno(e, name))?;

    let file = File::from(fd);
    let size = file.metadata()?.len() as usize;
    if size == 0 {
        return Err(IpcError::Platform(format!(
            "Region {} exists but has zero size",
            name
        )));
    }

    // SAFETY: the fd is a valid open shm object of `size` bytes per fstat.
    let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(map)
}

/// Unlink a named region; missing names are ignored
pub(crate) fn unlink_region(name: &str) -> Result<()> {
    let path = shm_path(name)?;
    match shm_unlink(path.as_str()) {
        Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(IpcError::from_errno(e, name)),
    }
}

/// Cross-process role-election lock backed by an exclusively created shm name
///
/// The process that wins the `O_CREAT | O_EXCL` race holds the lock until it
/// is released (or the holder unlinks it on drop). Losing the race is not an
/// error; it simply elects the caller into the peer role.
pub(crate) struct NamedLock {
    name: String,
    held: bool,
}

impl NamedLock {
    /// Try to acquire the lock; `Ok(None)` means another process holds it
    pub(crate) fn try_acquire(name: &str) -> Result<Option<Self>> {
        let path = shm_path(name)?;
        match shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => {
                drop(File::from(fd));
                Ok(Some(Self {
                    name: name.to_string(),
                    held: true,
                }))
            }
            Err(nix::errno::Errno::EEXIST) => Ok(None),
            Err(e) => Err(IpcError::from_errno(e, name)),
        }
    }

    /// Release the lock by unlinking its name
    pub(crate) fn release(&mut self) {
        if self.held {
            let _ = unlink_region(&self.name);
            self.held = false;
        }
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Generate a process-unique resource name for tests
    pub(crate) fn unique_name(prefix: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::unique_name;
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("portal").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\0b").is_err());
        assert!(validate_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique_name("plat_region");
        let map = create_region(&name, 4096).unwrap();
        assert_eq!(map.len(), 4096);

        // Second create on the same name must lose
        assert!(matches!(
            create_region(&name, 4096),
            Err(IpcError::NameInUse(_))
        ));

        let opened = open_region(&name).unwrap();
        assert_eq!(opened.len(), 4096);

        unlink_region(&name).unwrap();
        assert!(matches!(
            open_region(&name),
            Err(IpcError::NameNotFound(_))
        ));
        // Unlink of a missing name is not an error
        unlink_region(&name).unwrap();
    }

    #[test]
    fn test_named_lock_election() {
        let name = unique_name("plat_lock");
        let mut first = NamedLock::try_acquire(&name).unwrap().expect("first wins");
        assert!(NamedLock::try_acquire(&name).unwrap().is_none());

        first.release();
        let second = NamedLock::try_acquire(&name).unwrap();
        assert!(second.is_some());
    }
}
