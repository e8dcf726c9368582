//! Named POSIX shared-memory pages.
//!
//! The agent creates one page per pod, named `shm-<pid>`, truncated to the
//! configured block size and world-readable/writable (single trust domain
//! per host). The pod opens the same object read-write and updates metrics
//! in place; the agent registers the mapping as a remotely-readable RDMA
//! region. The agent owns creation and eventual unlink.

use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

use crate::error::ShmError;

/// Fixed width of the page name field in the registration reply,
/// null-padded ASCII.
pub const NAME_WIRE_LEN: usize = 256;

/// Shared-memory object name for a pod, derived from its OS process id.
pub fn page_name(pid: u32) -> String {
    format!("shm-{}", pid)
}

/// A mapped named shared-memory object.
///
/// Unmapped and closed on drop. Unlinking is a separate, explicit operation:
/// the name must outlive any single mapping so a crashed pod's registration
/// can be retried against the same object.
pub struct SharedPage {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<RawFd>,
}

unsafe impl Send for SharedPage {}
unsafe impl Sync for SharedPage {}

impl SharedPage {
    /// Create (or reopen) the object, size it, and map it read-write.
    /// Permissions are 0666.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        Self::open_with(name, len, OFlag::O_CREAT | OFlag::O_RDWR, true)
    }

    /// Open an existing object read-write and map it. Pod side.
    pub fn open(name: &str, len: usize) -> Result<Self, ShmError> {
        Self::open_with(name, len, OFlag::O_RDWR, false)
    }

    fn open_with(name: &str, len: usize, oflag: OFlag, truncate: bool) -> Result<Self, ShmError> {
        let mode = Mode::from_bits_truncate(0o666);
        let fd = shm_open(name, oflag, mode).map_err(|source| ShmError::Open {
            name: name.to_owned(),
            source,
        })?;

        if truncate {
            if let Err(source) = ftruncate(fd, len as libc::off_t) {
                let _ = close(fd);
                return Err(ShmError::Truncate {
                    name: name.to_owned(),
                    len,
                    source,
                });
            }
        }

        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|source| {
            let _ = close(fd);
            ShmError::Map {
                name: name.to_owned(),
                source,
            }
        })?;

        Ok(Self {
            name: name.to_owned(),
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            len,
            fd: Some(fd),
        })
    }

    /// The object's name (without any `/dev/shm` prefix).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the page as a byte slice.
    ///
    /// Concurrent writers (the pod) and remote readers (RDMA) race with this
    /// view; torn reads are an accepted property of the scrape plane.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable view of the page.
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.len);
        }
        if let Some(fd) = self.fd.take() {
            let _ = close(fd);
        }
    }
}

/// Remove the object's name.
///
/// Existing mappings stay valid; the backing memory is reclaimed once the
/// last mapping goes away. Intermittent failures have been observed here in
/// deployment with an undetermined cause; callers decide whether to
/// propagate (see [`crate::AgentConfig::ignore_unlink_errors`]).
pub fn unlink(name: &str) -> Result<(), ShmError> {
    shm_unlink(name).map_err(|source| ShmError::Unlink {
        name: name.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("microview-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn page_name_format() {
        assert_eq!(page_name(1111), "shm-1111");
        assert_eq!(page_name(0), "shm-0");
    }

    #[test]
    fn create_write_reopen_read() {
        let name = unique_name("rw");
        let page = SharedPage::create(&name, 1024).unwrap();
        assert_eq!(page.len(), 1024);
        page.as_mut_slice()[..5].copy_from_slice(b"hello");

        let other = SharedPage::open(&name, 1024).unwrap();
        assert_eq!(&other.as_slice()[..5], b"hello");

        drop(other);
        drop(page);
        unlink(&name).unwrap();
    }

    #[test]
    fn create_is_idempotent_for_retries() {
        let name = unique_name("retry");
        let first = SharedPage::create(&name, 512).unwrap();
        drop(first);
        // A handler retrying after a failure reuses the same name.
        let second = SharedPage::create(&name, 512).unwrap();
        drop(second);
        unlink(&name).unwrap();
    }

    #[test]
    fn unlink_twice_reports_an_error() {
        let name = unique_name("unlink");
        let page = SharedPage::create(&name, 256).unwrap();
        drop(page);
        unlink(&name).unwrap();
        assert!(matches!(unlink(&name), Err(ShmError::Unlink { .. })));
    }

    #[test]
    fn open_missing_object_fails() {
        assert!(matches!(
            SharedPage::open(&unique_name("missing"), 256),
            Err(ShmError::Open { .. })
        ));
    }

    #[test]
    fn unlink_with_live_mapping_keeps_mapping_valid() {
        let name = unique_name("live");
        let page = SharedPage::create(&name, 128).unwrap();
        page.as_mut_slice()[0] = 42;
        unlink(&name).unwrap();
        assert_eq!(page.as_slice()[0], 42);
    }
}
