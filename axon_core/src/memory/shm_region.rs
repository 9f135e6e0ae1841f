//! Named shared memory regions.
//!
//! A region is the raw byte range a segment lives in. The broker *creates*
//! regions at bring-up (create fails if the name already exists — stale files
//! from a crashed run must be cleaned up first, see [`ShmRegion::unlink`]);
//! client processes *open* them (open fails if the name does not exist).
//! Regions are never resized after creation.
//!
//! Linux backs regions with tmpfs files in `/dev/shm/axon` (RAM-backed, no
//! disk I/O, debuggable with `ls`). Other unix platforms use POSIX
//! `shm_open` + `mmap`.

use crate::error::{AxonError, AxonResult};
use crate::memory::platform::SHM_PREFIX;

#[cfg(target_os = "linux")]
use crate::memory::platform::segments_dir;
#[cfg(target_os = "linux")]
use memmap2::{MmapMut, MmapOptions};
#[cfg(target_os = "linux")]
use std::fs::{File, OpenOptions};
#[cfg(target_os = "linux")]
use std::path::PathBuf;

/// A mapped shared memory region.
///
/// The creator (broker) is the owner and unlinks the backing object on drop.
/// Openers only unmap. All pointers handed out are valid for the lifetime of
/// the `ShmRegion` value.
#[derive(Debug)]
pub struct ShmRegion {
    #[cfg(target_os = "linux")]
    mmap: MmapMut,
    #[cfg(target_os = "linux")]
    _file: File,
    #[cfg(target_os = "linux")]
    path: PathBuf,

    #[cfg(not(target_os = "linux"))]
    ptr: *mut u8,
    #[cfg(not(target_os = "linux"))]
    fd: i32,

    name: String,
    size: usize,
    owner: bool,
}

// ============================================================================
// Linux implementation - file-based mmap on /dev/shm (tmpfs)
// ============================================================================

#[cfg(target_os = "linux")]
impl ShmRegion {
    fn backing_path(name: &str) -> PathBuf {
        segments_dir().join(format!("{SHM_PREFIX}{name}"))
    }

    /// Create a new region of `size` bytes, zero-initialized.
    ///
    /// Fails if a region of the same name already exists.
    pub fn create(name: &str, size: usize) -> AxonResult<Self> {
        let dir = segments_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| AxonError::segment(name, format!("create {}: {e}", dir.display())))?;

        let path = Self::backing_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| AxonError::segment(name, format!("create {}: {e}", path.display())))?;
        file.set_len(size as u64)
            .map_err(|e| AxonError::segment(name, format!("set_len({size}): {e}")))?;

        // SAFETY: file is open read/write with length `size` set above.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| AxonError::segment(name, format!("mmap: {e}")))?
        };
        mmap.fill(0);

        Ok(Self {
            mmap,
            _file: file,
            path,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing region. The size is taken from the backing file.
    pub fn open(name: &str) -> AxonResult<Self> {
        let path = Self::backing_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| AxonError::segment(name, format!("open {}: {e}", path.display())))?;
        let size = file
            .metadata()
            .map_err(|e| AxonError::segment(name, format!("metadata: {e}")))?
            .len() as usize;
        if size == 0 {
            return Err(AxonError::segment(name, "backing file is empty"));
        }

        // SAFETY: file is open read/write; len matches the file size.
        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| AxonError::segment(name, format!("mmap: {e}")))?
        };

        Ok(Self {
            mmap,
            _file: file,
            path,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    /// Remove the backing object of a region without opening it.
    ///
    /// Used by the broker to clean stale files left by a crashed run.
    /// Missing files are not an error.
    pub fn unlink(name: &str) {
        let _ = std::fs::remove_file(Self::backing_path(name));
    }

    /// Base address of the mapping in this process.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }
}

#[cfg(target_os = "linux")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ============================================================================
// Other unix - POSIX shm_open + mmap
// ============================================================================

#[cfg(not(target_os = "linux"))]
impl ShmRegion {
    fn shm_name(name: &str) -> std::ffi::CString {
        // POSIX shm names must start with a single slash and contain no others.
        let flat = name.replace('/', ".");
        std::ffi::CString::new(format!("/{SHM_PREFIX}{flat}"))
            .expect("shm name contains interior NUL")
    }

    /// Create a new region of `size` bytes, zero-initialized.
    pub fn create(name: &str, size: usize) -> AxonResult<Self> {
        let c_name = Self::shm_name(name);
        // SAFETY: c_name is a valid NUL-terminated string; flags are POSIX constants.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(AxonError::segment(
                name,
                format!("shm_open: {}", std::io::Error::last_os_error()),
            ));
        }
        // SAFETY: fd is a valid descriptor from shm_open above.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: fd is valid; c_name is valid.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(AxonError::segment(name, format!("ftruncate({size}): {err}")));
        }
        let ptr = Self::map(fd, size).map_err(|e| {
            // SAFETY: fd is valid; c_name is valid.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            AxonError::segment(name, e)
        })?;
        // SAFETY: ptr spans `size` bytes of freshly mapped memory.
        unsafe { std::ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            fd,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing region. The size is taken from the shm object.
    pub fn open(name: &str) -> AxonResult<Self> {
        let c_name = Self::shm_name(name);
        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(AxonError::segment(
                name,
                format!("shm_open: {}", std::io::Error::last_os_error()),
            ));
        }
        // SAFETY: fd is a valid descriptor; stat is zero-initialized before the call.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(AxonError::segment(name, format!("fstat: {err}")));
            }
            stat.st_size as usize
        };
        if size == 0 {
            // SAFETY: fd is valid.
            unsafe { libc::close(fd) };
            return Err(AxonError::segment(name, "shm object is empty"));
        }
        let ptr = Self::map(fd, size).map_err(|e| {
            // SAFETY: fd is valid.
            unsafe { libc::close(fd) };
            AxonError::segment(name, e)
        })?;

        Ok(Self {
            ptr,
            fd,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    /// Remove the backing object of a region without opening it.
    pub fn unlink(name: &str) {
        let c_name = Self::shm_name(name);
        // SAFETY: c_name is a valid NUL-terminated string.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }

    fn map(fd: i32, size: usize) -> Result<*mut u8, String> {
        // SAFETY: fd is a valid descriptor sized to at least `size` bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(format!("mmap: {}", std::io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Base address of the mapping in this process.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe a live mapping; fd is a valid descriptor.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        if self.owner {
            let c_name = Self::shm_name(&self.name);
            // SAFETY: c_name is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

// Common accessors - `name`, `size` and `owner` exist on all platform variants.
impl ShmRegion {
    /// Region name as configured (without the platform prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total mapped size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the region (and unlinks it on drop).
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

// SAFETY: the region is plain OS shared memory with no thread-local state;
// concurrent access is coordinated by the atomic protocols of the structures
// placed inside it (pools, queues, rings).
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn create_open_roundtrip() {
        let name = unique_name("region_rt");
        let created = ShmRegion::create(&name, 4096).expect("create");
        assert!(created.is_owner());
        assert_eq!(created.size(), 4096);

        // Write through the creator mapping.
        // SAFETY: within the 4096-byte mapping.
        unsafe { *created.as_ptr().add(100) = 0xAB };

        let opened = ShmRegion::open(&name).expect("open");
        assert!(!opened.is_owner());
        assert_eq!(opened.size(), 4096);
        // SAFETY: within the 4096-byte mapping.
        let v = unsafe { *opened.as_ptr().add(100) };
        assert_eq!(v, 0xAB);
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name("region_excl");
        let _first = ShmRegion::create(&name, 1024).expect("create");
        let second = ShmRegion::create(&name, 1024);
        assert!(second.is_err(), "duplicate create must fail");
    }

    #[test]
    fn open_missing_fails() {
        let name = unique_name("region_missing");
        assert!(ShmRegion::open(&name).is_err());
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique_name("region_unlink");
        {
            let _r = ShmRegion::create(&name, 1024).expect("create");
        }
        assert!(ShmRegion::open(&name).is_err(), "region should be gone");
    }

    #[test]
    fn zero_initialized() {
        let name = unique_name("region_zero");
        let r = ShmRegion::create(&name, 4096).expect("create");
        for i in 0..4096 {
            // SAFETY: within the mapping.
            assert_eq!(unsafe { *r.as_ptr().add(i) }, 0, "byte {i} not zeroed");
        }
    }
}
