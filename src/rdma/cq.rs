//! Completion queues and completion channels.
//!
//! Every connection owns one CQ bound to one completion channel. The
//! connection's poller thread blocks on the channel, acknowledges the event,
//! rearms notification, and drains the CQ without blocking.
//!
//! Completion statuses are not mirrored into a Rust enum; a failed
//! completion surfaces as a [`WcError`] carrying the raw `ibv_wc_status`
//! code, stringified by libibverbs itself.

use std::ptr::NonNull;
use std::{fmt, io, mem, ptr};

use anyhow::{Context as _, Result};
use rdma_sys::*;

use super::cm::VerbsCtx;
use crate::error::WcError;

/// Work completion entry.
///
/// Transparently wraps `ibv_wc`. Trivially copyable, so `Send` and `Sync`.
#[repr(transparent)]
pub struct Wc(ibv_wc);

unsafe impl Send for Wc {}
unsafe impl Sync for Wc {}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    /// Get the raw completion status code (`ibv_wc_status`).
    #[inline]
    pub fn status(&self) -> ibv_wc_status::Type {
        self.0.status
    }

    /// Whether the completion succeeded.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Get the completion as a `Result` over the byte count.
    #[inline]
    pub fn result(&self) -> Result<usize, WcError> {
        if self.is_success() {
            Ok(self.0.byte_len as usize)
        } else {
            Err(WcError::new(self.0.status, self.0.wr_id))
        }
    }

    /// Whether this completion reports a receive (as opposed to a send-side
    /// operation such as SEND or RDMA READ).
    #[inline]
    pub fn is_recv(&self) -> bool {
        self.0.opcode & ibv_wc_opcode::IBV_WC_RECV != 0
    }
}

impl Default for Wc {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .finish()
    }
}

impl Clone for Wc {
    fn clone(&self) -> Self {
        unsafe {
            let mut wc = mem::zeroed();
            ptr::copy_nonoverlapping(&self.0, &mut wc, 1);
            Wc(wc)
        }
    }
}

/// Completion channel: the blocking wait side of a CQ.
#[derive(Debug)]
pub struct CompChannel(NonNull<ibv_comp_channel>);

unsafe impl Send for CompChannel {}
unsafe impl Sync for CompChannel {}

impl CompChannel {
    pub fn new(ctx: VerbsCtx) -> Result<Self> {
        let cc = NonNull::new(unsafe { ibv_create_comp_channel(ctx.as_ptr()) })
            .ok_or_else(|| anyhow::anyhow!(io::Error::last_os_error()))
            .with_context(|| "failed to create completion channel")?;
        Ok(Self(cc))
    }

    /// Get the underlying `ibv_comp_channel` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_comp_channel {
        self.0.as_ptr()
    }

    /// Block until the CQ bound to this channel raises a completion event,
    /// then acknowledge it.
    ///
    /// Callers must rearm notification ([`Cq::req_notify`]) and drain the CQ
    /// afterwards. An error return means the channel is being torn down.
    pub fn wait_and_ack(&self) -> Result<()> {
        let mut cq = ptr::null_mut();
        let mut cq_ctx = ptr::null_mut();
        let ret = unsafe { ibv_get_cq_event(self.0.as_ptr(), &mut cq, &mut cq_ctx) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to get CQ event");
        }
        unsafe { ibv_ack_cq_events(cq, 1) };
        Ok(())
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        unsafe { ibv_destroy_comp_channel(self.0.as_ptr()) };
    }
}

/// Completion queue bound to a completion channel.
///
/// Destroy order: the QP using this CQ goes first, this CQ second, its
/// channel last. Connections encode that in field order.
#[derive(Debug)]
pub struct Cq(NonNull<ibv_cq>);

unsafe impl Send for Cq {}
unsafe impl Sync for Cq {}

impl Cq {
    /// Create a CQ of at least `depth` entries, delivering events to
    /// `channel`, with notification armed.
    pub fn with_channel(ctx: VerbsCtx, depth: i32, channel: &CompChannel) -> Result<Self> {
        let cq = NonNull::new(unsafe {
            ibv_create_cq(ctx.as_ptr(), depth, ptr::null_mut(), channel.as_ptr(), 0)
        })
        .ok_or_else(|| anyhow::anyhow!(io::Error::last_os_error()))
        .with_context(|| "failed to create completion queue")?;

        let cq = Self(cq);
        cq.req_notify()?;
        Ok(cq)
    }

    /// Get the underlying `ibv_cq` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_cq {
        self.0.as_ptr()
    }

    /// Request a completion event for the next completion.
    pub fn req_notify(&self) -> Result<()> {
        let ret = unsafe { ibv_req_notify_cq(self.0.as_ptr(), 0) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::from_raw_os_error(ret)))
                .with_context(|| "failed to request CQ notification");
        }
        Ok(())
    }

    /// Non-blocking poll. Returns the number of completions written into
    /// `wc`; entries beyond that count are not valid. Success of individual
    /// completions is the caller's to check.
    pub fn poll(&self, wc: &mut [Wc]) -> Result<usize> {
        let num =
            unsafe { ibv_poll_cq(self.0.as_ptr(), wc.len() as i32, wc.as_mut_ptr().cast()) };
        if num < 0 {
            Err(anyhow::anyhow!("ibv_poll_cq failed: {}", num))
        } else {
            Ok(num as usize)
        }
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        unsafe { ibv_destroy_cq(self.0.as_ptr()) };
    }
}
