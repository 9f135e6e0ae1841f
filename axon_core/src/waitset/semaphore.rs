//! Process-shared counting semaphore living inside shared memory.
//!
//! Linux uses an unnamed `sem_t` initialized with `pshared = 1` directly in
//! the segment; `sem_timedwait` gives the absolute-deadline wait. Other unix
//! platforms lack shareable unnamed semaphores (macOS returns ENOSYS), so
//! the same surface is built from a process-shared pthread mutex + condvar
//! and a counter, which every POSIX platform supports in shared memory.
//!
//! The structure is placed by the management-segment layout and initialized
//! exactly once by the broker; it is never moved or copied.

use std::cell::UnsafeCell;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Convert an `Instant` deadline into an absolute CLOCK_REALTIME timespec.
///
/// POSIX timed waits take realtime; the public API takes `Instant` so
/// callers are immune to wall-clock jumps on their side of the conversion.
fn deadline_to_timespec(deadline: Instant) -> libc::timespec {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let abs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        + remaining;
    libc::timespec {
        tv_sec: abs.as_secs() as libc::time_t,
        tv_nsec: abs.subsec_nanos() as libc::c_long,
    }
}

// ============================================================================
// Linux - unnamed sem_t in shared memory
// ============================================================================

#[cfg(target_os = "linux")]
#[repr(C)]
pub struct ShmSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

#[cfg(target_os = "linux")]
impl ShmSemaphore {
    /// Initialize in place. Broker-only, before the segment is visible.
    ///
    /// # Safety
    /// Must be called exactly once on zeroed shared memory, before any
    /// `post`/`wait`.
    pub(crate) unsafe fn init(&self) {
        // pshared = 1: shared between processes through the mapping.
        if libc::sem_init(self.inner.get(), 1, 0) != 0 {
            panic!(
                "sem_init failed: {} (broker bring-up)",
                std::io::Error::last_os_error()
            );
        }
    }

    /// Increment; wakes one waiter if any.
    pub fn post(&self) {
        // SAFETY: init ran at bring-up; sem_t is shm-resident.
        unsafe { libc::sem_post(self.inner.get()) };
    }

    /// Wait until the count is positive or the deadline passes.
    /// Returns `false` on timeout. `None` deadline blocks indefinitely.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        loop {
            let rc = match deadline {
                // SAFETY: init ran at bring-up.
                None => unsafe { libc::sem_wait(self.inner.get()) },
                Some(d) => {
                    let ts = deadline_to_timespec(d);
                    // SAFETY: init ran at bring-up; ts is a valid timespec.
                    unsafe { libc::sem_timedwait(self.inner.get(), &ts) }
                }
            };
            if rc == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return false,
                _ => return false,
            }
        }
    }
}

// ============================================================================
// Other unix - process-shared pthread mutex + condvar + counter
// ============================================================================

#[cfg(not(target_os = "linux"))]
#[repr(C)]
pub struct ShmSemaphore {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    count: UnsafeCell<u32>,
}

#[cfg(not(target_os = "linux"))]
impl ShmSemaphore {
    /// Initialize in place. Broker-only, before the segment is visible.
    ///
    /// # Safety
    /// Must be called exactly once on zeroed shared memory, before any
    /// `post`/`wait`.
    pub(crate) unsafe fn init(&self) {
        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        libc::pthread_mutexattr_init(&mut mattr);
        libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutex_init(self.mutex.get(), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);

        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        libc::pthread_condattr_init(&mut cattr);
        libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_cond_init(self.cond.get(), &cattr);
        libc::pthread_condattr_destroy(&mut cattr);

        *self.count.get() = 0;
    }

    /// Increment; wakes one waiter if any.
    pub fn post(&self) {
        // SAFETY: init ran at bring-up; primitives are shm-resident.
        unsafe {
            libc::pthread_mutex_lock(self.mutex.get());
            *self.count.get() += 1;
            libc::pthread_cond_signal(self.cond.get());
            libc::pthread_mutex_unlock(self.mutex.get());
        }
    }

    /// Wait until the count is positive or the deadline passes.
    /// Returns `false` on timeout. `None` deadline blocks indefinitely.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        // SAFETY: init ran at bring-up; primitives are shm-resident.
        unsafe {
            libc::pthread_mutex_lock(self.mutex.get());
            while *self.count.get() == 0 {
                match deadline {
                    None => {
                        libc::pthread_cond_wait(self.cond.get(), self.mutex.get());
                    }
                    Some(d) => {
                        let ts = deadline_to_timespec(d);
                        let rc = libc::pthread_cond_timedwait(
                            self.cond.get(),
                            self.mutex.get(),
                            &ts,
                        );
                        if rc == libc::ETIMEDOUT {
                            libc::pthread_mutex_unlock(self.mutex.get());
                            return false;
                        }
                    }
                }
            }
            *self.count.get() -= 1;
            libc::pthread_mutex_unlock(self.mutex.get());
        }
        true
    }
}

// SAFETY: the semaphore is a process-shared OS primitive; all mutation goes
// through the OS calls above.
unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Heap stand-in for the shm placement.
    fn make() -> Arc<Box<ShmSemaphore>> {
        // SAFETY: zeroed is the documented pre-init state; init follows.
        let sem: Box<ShmSemaphore> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { sem.init() };
        Arc::new(sem)
    }

    #[test]
    fn timed_wait_times_out() {
        let sem = make();
        let start = Instant::now();
        let got = sem.wait_until(Some(Instant::now() + Duration::from_millis(50)));
        assert!(!got);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn post_wakes_waiter() {
        let sem = make();
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait_until(Some(Instant::now() + Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap(), "waiter must be woken by post");
    }

    #[test]
    fn posts_accumulate() {
        let sem = make();
        sem.post();
        sem.post();
        assert!(sem.wait_until(Some(Instant::now() + Duration::from_millis(10))));
        assert!(sem.wait_until(Some(Instant::now() + Duration::from_millis(10))));
        assert!(!sem.wait_until(Some(Instant::now() + Duration::from_millis(10))));
    }
}
