//! Local memory regions and remote MR descriptors.

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::ptr::NonNull;

use anyhow::{Context as _, Result};
use rdma_sys::*;

use super::pd::Pd;

/// Registered local memory region.
///
/// Registration pins the backing pages; deregistration happens on drop. The
/// backing memory is *not* owned by this type and must outlive it — the
/// owning connection encodes that in field order (MRs before buffers).
pub struct Mr {
    /// Keeps the protection domain alive for the registration's lifetime.
    #[allow(dead_code)]
    pd: Pd,
    mr: NonNull<ibv_mr>,
    addr: *mut u8,
    len: usize,
}

unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

impl Mr {
    /// Register `len` bytes at `addr` with the given access flags.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must stay valid and mapped until this `Mr` is
    /// dropped.
    pub unsafe fn reg(
        pd: &Pd,
        addr: *mut u8,
        len: usize,
        access: ibv_access_flags,
    ) -> Result<Self> {
        let mr = NonNull::new(ibv_reg_mr(
            pd.as_ptr(),
            addr as *mut c_void,
            len,
            access.0 as i32,
        ))
        .ok_or_else(|| anyhow::anyhow!(io::Error::last_os_error()))
        .with_context(|| format!("failed to register {} bytes at {:p}", len, addr))?;

        Ok(Self {
            pd: pd.clone(),
            mr,
            addr,
            len,
        })
    }

    /// Register a slice for local-write access (receive and READ-sink
    /// buffers).
    pub fn reg_local(pd: &Pd, buf: &mut [u8]) -> Result<Self> {
        // SAFETY: the caller's borrow proves the buffer is live; the owning
        // connection keeps it alive past the Mr.
        unsafe {
            Self::reg(
                pd,
                buf.as_mut_ptr(),
                buf.len(),
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE,
            )
        }
    }

    /// Register a send-only buffer (no special access).
    pub fn reg_send(pd: &Pd, buf: &[u8]) -> Result<Self> {
        unsafe {
            Self::reg(
                pd,
                buf.as_ptr() as *mut u8,
                buf.len(),
                ibv_access_flags(0),
            )
        }
    }

    /// Register a region for one-sided remote reads. Used by the agent on
    /// each pod's shared page; the peer never gets more than READ access.
    ///
    /// # Safety
    ///
    /// Same contract as [`Mr::reg`].
    pub unsafe fn reg_remote_read(pd: &Pd, addr: *mut u8, len: usize) -> Result<Self> {
        Self::reg(pd, addr, len, ibv_access_flags::IBV_ACCESS_REMOTE_READ)
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    /// Describe this region for the remote peer.
    pub fn descriptor(&self) -> RemoteMr {
        RemoteMr {
            addr: self.addr as u64,
            rkey: self.rkey(),
            len: self.len as u32,
        }
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
    }
}

/// Remote memory region descriptor: everything a one-sided READ needs.
///
/// Holds no local resources; this is what travels in the `MR` control
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteMr {
    pub addr: u64,
    pub rkey: u32,
    pub len: u32,
}

impl RemoteMr {
    pub fn new(addr: u64, rkey: u32, len: u32) -> Self {
        Self { addr, rkey, len }
    }
}
