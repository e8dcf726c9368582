use std::ffi::CStr;
use std::fmt;

use rdma_sys::{ibv_wc_status, ibv_wc_status_str};
use thiserror::Error;

/// A work completion finished with a status other than success. Fatal to
/// the connection the completion belongs to.
///
/// Carries the raw `ibv_wc_status` code; the message text comes from
/// libibverbs itself, so there is no status table here to keep in sync with
/// the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WcError {
    status: ibv_wc_status::Type,
    wr_id: u64,
}

impl std::error::Error for WcError {}

impl WcError {
    pub fn new(status: ibv_wc_status::Type, wr_id: u64) -> Self {
        debug_assert_ne!(status, ibv_wc_status::IBV_WC_SUCCESS);
        Self { status, wr_id }
    }

    /// The raw `ibv_wc_status` code.
    pub fn status(&self) -> ibv_wc_status::Type {
        self.status
    }

    /// The failed work request's id.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Whether this is a flush: the status every outstanding work request
    /// drains with once its QP enters the error state, i.e. the expected
    /// noise of a disconnecting connection rather than a data-path fault.
    pub fn is_flush(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_WR_FLUSH_ERR
    }
}

impl fmt::Display for WcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ibv_wc_status_str(self.status)) };
        write!(
            f,
            "work completion failed: {} (status {}, wr_id {})",
            msg.to_string_lossy(),
            self.status,
            self.wr_id
        )
    }
}

/// Control-protocol violations. Fatal to the connection they occur on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown control message tag {0}")]
    UnknownTag(u32),

    #[error("control message truncated: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("unexpected control message {got} in state {state}")]
    UnexpectedMessage {
        got: &'static str,
        state: &'static str,
    },
}

/// Shared-memory object failures.
///
/// On the agent these are fatal to the registration handler that hit them;
/// the accept loop itself survives. Unlink failures at teardown are commonly
/// downgraded to warnings (see [`crate::AgentConfig::ignore_unlink_errors`]).
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm_open(\"{name}\") failed: {source}")]
    Open {
        name: String,
        source: nix::Error,
    },

    #[error("ftruncate(\"{name}\", {len}) failed: {source}")]
    Truncate {
        name: String,
        len: usize,
        source: nix::Error,
    },

    #[error("mmap(\"{name}\") failed: {source}")]
    Map {
        name: String,
        source: nix::Error,
    },

    #[error("shm_unlink(\"{name}\") failed: {source}")]
    Unlink {
        name: String,
        source: nix::Error,
    },
}
