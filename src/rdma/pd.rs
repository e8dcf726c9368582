use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use rdma_sys::*;

use super::cm::VerbsCtx;

#[derive(Debug)]
struct PdInner {
    pd: NonNull<ibv_pd>,
}

unsafe impl Send for PdInner {}
unsafe impl Sync for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
    }
}

/// Protection domain.
///
/// Allocated from the verbs context a CM id resolved to. This type is a
/// simple wrapper of an `Arc`; clone it to share. The connection that
/// allocated it must keep its [`super::CmId`] alive for at least as long as
/// any clone of this PD.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain on the given device context.
    pub fn alloc(ctx: VerbsCtx) -> Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) })
            .ok_or_else(|| anyhow::anyhow!(io::Error::last_os_error()))
            .with_context(|| "failed to allocate protection domain")?;
        Ok(Self {
            inner: Arc::new(PdInner { pd }),
        })
    }

    /// Get the underlying `ibv_pd` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }
}
