//! Named cross-process auto-reset events
//!
//! Each event is a one-word named shared region plus futex-style wait/wake.
//! `pulse` signals the event and wakes at most one waiter; a successful wait
//! consumes the signal (CAS 1 -> 0), so exactly one waiter proceeds per pulse
//! and the event returns to the unsignalled state by itself. Spurious wakeups
//! are allowed; callers re-check their predicate in a loop.
//!
//! Linux uses the futex syscall without `FUTEX_PRIVATE_FLAG` so waits work
//! across processes. Other Unix platforms fall back to a short polling loop
//! over the same shared word.

use crate::region::SharedRegion;
use crate::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNSIGNALLED: u32 = 0;
const SIGNALLED: u32 = 1;

/// A named auto-reset event shared between processes
pub struct ShmEvent {
    region: SharedRegion,
}

impl ShmEvent {
    /// Create the backing region for a new event (owner side)
    pub fn create(name: &str) -> Result<Self> {
        let region = SharedRegion::create(name, std::mem::size_of::<AtomicU32>())?;
        Ok(Self { region })
    }

    /// Open an existing event by name (peer side)
    pub fn open(name: &str) -> Result<Self> {
        let region = SharedRegion::open(name)?;
        Ok(Self { region })
    }

    #[inline]
    fn state(&self) -> &AtomicU32 {
        // SAFETY: the region payload is at least one u32 wide and its base is
        // 4-byte aligned (header is 16 bytes past a page-aligned mapping).
        unsafe { &*(self.region.raw_base() as *const AtomicU32) }
    }

    /// Signal the event, waking at most one waiter
    pub fn pulse(&self) {
        self.state().store(SIGNALLED, Ordering::Release);
        futex::wake_one(self.state());
    }

    /// Wait until signalled or until `timeout` elapses (`None` = forever)
    ///
    /// Returns `true` if the signal was consumed, `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self
                .state()
                .compare_exchange(SIGNALLED, UNSIGNALLED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }

            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    Some(d - now)
                }
            };

            if !futex::wait_while_unsignalled(self.state(), remaining) {
                // Slept the full interval without a wake; one more CAS attempt
                // above decides between a late signal and a timeout.
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return self
                        .state()
                        .compare_exchange(
                            SIGNALLED,
                            UNSIGNALLED,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok();
                }
            }
        }
    }

    /// Free the event name immediately (owner side)
    pub fn unlink_now(&self) {
        self.region.unlink_now();
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use super::UNSIGNALLED;
    use std::ptr;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    // Non-private futex ops: the word lives in memory shared across processes.
    const FUTEX_WAIT: libc::c_int = 0;
    const FUTEX_WAKE: libc::c_int = 1;

    pub(super) fn wake_one(word: &AtomicU32) {
        // SAFETY: word points into a live shared mapping; FUTEX_WAKE only
        // reads the address for waiter lookup.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                FUTEX_WAKE,
                1_i32,
            );
        }
    }

    /// Sleep while the word is unsignalled; returns `true` on wake or state
    /// change, `false` when the kernel reports the timeout elapsed.
    pub(super) fn wait_while_unsignalled(word: &AtomicU32, timeout: Option<Duration>) -> bool {
        let mut ts_storage = timeout.map(|dur| libc::timespec {
            tv_sec: dur.as_secs() as libc::time_t,
            tv_nsec: dur.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts_storage
            .as_mut()
            .map_or(ptr::null_mut(), |ts| ts as *mut libc::timespec);

        // SAFETY: word points into a live shared mapping; ts_ptr is either
        // null or a valid timespec owned by this frame.
        let res = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                FUTEX_WAIT,
                UNSIGNALLED,
                ts_ptr,
            )
        };

        if res == 0 {
            return true;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) => false,
            // EAGAIN: the word was already signalled; EINTR: retry at caller.
            _ => true,
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub(super) fn wake_one(_word: &AtomicU32) {
        // Pollers observe the store directly.
    }

    pub(super) fn wait_while_unsignalled(word: &AtomicU32, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if word.load(Ordering::Acquire) != super::UNSIGNALLED {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_support::unique_name;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pulse_before_wait_is_sticky() {
        let name = unique_name("event_sticky");
        let evt = ShmEvent::create(&name).unwrap();
        evt.pulse();
        assert!(evt.wait(Some(Duration::from_millis(10))));
        // Signal was consumed: the next wait times out.
        assert!(!evt.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wait_timeout() {
        let name = unique_name("event_timeout");
        let evt = ShmEvent::create(&name).unwrap();
        let start = Instant::now();
        assert!(!evt.wait(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let name = unique_name("event_wake");
        let evt = Arc::new(ShmEvent::create(&name).unwrap());
        let waiter = {
            let evt = evt.clone();
            thread::spawn(move || evt.wait(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));
        evt.pulse();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_one_pulse_wakes_one_waiter() {
        let name = unique_name("event_single");
        let evt = Arc::new(ShmEvent::create(&name).unwrap());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let evt = evt.clone();
                thread::spawn(move || evt.wait(Some(Duration::from_millis(300))))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        evt.pulse();
        let woken = waiters
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|&signalled| signalled)
            .count();
        assert_eq!(woken, 1);
    }

    #[test]
    fn test_cross_handle_signalling() {
        let name = unique_name("event_cross");
        let owner = ShmEvent::create(&name).unwrap();
        let peer = ShmEvent::open(&name).unwrap();
        owner.pulse();
        assert!(peer.wait(Some(Duration::from_millis(10))));
    }
}
