//! Connection-manager side band.
//!
//! The connection manager negotiates RDMA connection establishment over its
//! own event channel: address resolution, route resolution, connect, accept,
//! disconnect. Every MicroView connection owns an independent event channel
//! and CM id; the agent drives the active sequence (resolve, connect) and the
//! collector the passive one (listen, accept).

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::{self, NonNull};

use anyhow::{Context as _, Result};
use rdma_sys::*;

/// A non-owning handle to the verbs device context bound to a CM id.
///
/// The context belongs to librdmacm and stays valid for as long as the CM id
/// it was taken from, which every holder of this handle must outlive-proof by
/// also holding the [`CmId`] (directly or through a [`super::Pd`]).
#[derive(Debug, Clone, Copy)]
pub struct VerbsCtx(NonNull<ibv_context>);

unsafe impl Send for VerbsCtx {}
unsafe impl Sync for VerbsCtx {}

impl VerbsCtx {
    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_context {
        self.0.as_ptr()
    }
}

/// CM event channel.
///
/// Blocking [`EventChannel::get_cm_event`] is the suspension point of every
/// CM task; destroying the channel makes a blocked wait return an error,
/// which callers interpret as teardown.
#[derive(Debug)]
pub struct EventChannel(NonNull<rdma_event_channel>);

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl EventChannel {
    pub fn new() -> Result<Self> {
        let ec = NonNull::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| anyhow::anyhow!(io::Error::last_os_error()))
            .with_context(|| "failed to create CM event channel")?;
        Ok(Self(ec))
    }

    /// Get the underlying `rdma_event_channel` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut rdma_event_channel {
        self.0.as_ptr()
    }

    /// Block until the next CM event arrives on this channel.
    ///
    /// The returned event is acknowledged when dropped. Extract what you need
    /// and drop it before acting: rdmacm serializes further event delivery
    /// and some id operations on the ack.
    pub fn get_cm_event(&self) -> Result<CmEvent> {
        let mut event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(self.0.as_ptr(), &mut event) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to get CM event");
        }
        Ok(CmEvent(NonNull::new(event).unwrap()))
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        unsafe { (*self.0.as_ptr()).fd }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { rdma_destroy_event_channel(self.0.as_ptr()) };
    }
}

/// The CM events MicroView reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    /// Anything else (device removal, timewait exit, ...), kept raw.
    Other(u32),
}

impl From<u32> for CmEventKind {
    fn from(ev: u32) -> Self {
        match ev {
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
            rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
            other => CmEventKind::Other(other),
        }
    }
}

/// One CM event. Acknowledged back to librdmacm on drop.
#[derive(Debug)]
pub struct CmEvent(NonNull<rdma_cm_event>);

unsafe impl Send for CmEvent {}

impl CmEvent {
    /// The kind of this event.
    #[inline]
    pub fn kind(&self) -> CmEventKind {
        CmEventKind::from(unsafe { (*self.0.as_ptr()).event })
    }

    /// The event's status code (nonzero on error events).
    #[inline]
    pub fn status(&self) -> i32 {
        unsafe { (*self.0.as_ptr()).status }
    }

    /// The CM id this event refers to, as an opaque token.
    ///
    /// For listener channels, this identifies which child connection the
    /// event belongs to. The token must not be dereferenced.
    #[inline]
    pub fn id_token(&self) -> usize {
        unsafe { (*self.0.as_ptr()).id as usize }
    }

    /// Take ownership of the child CM id carried by a `ConnectRequest`.
    ///
    /// The returned id outlives the event (acking a connect request does not
    /// destroy the id); the caller must accept or drop it.
    pub fn take_request_id(&self) -> CmId {
        debug_assert_eq!(self.kind(), CmEventKind::ConnectRequest);
        let id = unsafe { (*self.0.as_ptr()).id };
        CmId(NonNull::new(id).unwrap())
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        let ret = unsafe { rdma_ack_cm_event(self.0.as_ptr()) };
        if ret != 0 {
            log::debug!(
                "failed to ack CM event: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Connection parameters for `connect`/`accept`.
///
/// Defaults to one outstanding RDMA READ in each direction and infinite RNR
/// retry, matching the reliable-connection settings the scrape plane needs.
#[derive(Debug, Clone, Copy)]
pub struct ConnParam {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            rnr_retry_count: 7, // 7 = infinite retry
        }
    }
}

impl ConnParam {
    fn to_raw(self) -> rdma_conn_param {
        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.responder_resources = self.responder_resources;
        param.initiator_depth = self.initiator_depth;
        param.rnr_retry_count = self.rnr_retry_count;
        param
    }
}

/// Owned CM id.
///
/// Destroyed on drop; any QP created through this id must be destroyed
/// first (see [`super::CmQp`]).
#[derive(Debug)]
pub struct CmId(NonNull<rdma_cm_id>);

// librdmacm allows concurrent use of an id from the event loop and from
// control paths such as rdma_disconnect.
unsafe impl Send for CmId {}
unsafe impl Sync for CmId {}

impl CmId {
    /// Create a CM id bound to the given event channel, RDMA_PS_TCP port
    /// space (reliable connection).
    pub fn create(channel: &EventChannel) -> Result<Self> {
        let mut id = ptr::null_mut();
        let ret = unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to create CM id");
        }
        Ok(Self(NonNull::new(id).unwrap()))
    }

    /// Get the underlying `rdma_cm_id` pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut rdma_cm_id {
        self.0.as_ptr()
    }

    /// This id's pointer as an opaque token, comparable with
    /// [`CmEvent::id_token`].
    #[inline]
    pub fn token(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The verbs device context this id resolved to. Only valid once address
    /// resolution has completed (active side) or the id was carried by a
    /// connect request (passive side).
    pub fn verbs(&self) -> Result<VerbsCtx> {
        NonNull::new(unsafe { (*self.0.as_ptr()).verbs })
            .map(VerbsCtx)
            .ok_or_else(|| anyhow::anyhow!("CM id has no verbs context yet"))
    }

    /// Bind to a local address (passive side).
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        let mut storage = SockaddrStorage::from(addr);
        let ret = unsafe { rdma_bind_addr(self.0.as_ptr(), storage.as_mut_ptr()) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| format!("failed to bind CM id to {}", addr));
        }
        Ok(())
    }

    /// Start listening for connect requests (passive side).
    pub fn listen(&self, backlog: i32) -> Result<()> {
        let ret = unsafe { rdma_listen(self.0.as_ptr(), backlog) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to listen on CM id");
        }
        Ok(())
    }

    /// The port this id is bound to, host byte order.
    pub fn src_port(&self) -> u16 {
        u16::from_be(unsafe { rdma_get_src_port(self.0.as_ptr()) })
    }

    /// Start address resolution towards `dst` (active side). Completion is
    /// reported as an `AddrResolved` (or `AddrError`) event.
    pub fn resolve_addr(&self, dst: SocketAddr, timeout_ms: i32) -> Result<()> {
        let mut storage = SockaddrStorage::from(dst);
        let ret = unsafe {
            rdma_resolve_addr(
                self.0.as_ptr(),
                ptr::null_mut(),
                storage.as_mut_ptr(),
                timeout_ms,
            )
        };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| format!("failed to resolve address {}", dst));
        }
        Ok(())
    }

    /// Start route resolution (active side, after `AddrResolved`).
    pub fn resolve_route(&self, timeout_ms: i32) -> Result<()> {
        let ret = unsafe { rdma_resolve_route(self.0.as_ptr(), timeout_ms) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to resolve route");
        }
        Ok(())
    }

    /// Initiate the connection (active side, after `RouteResolved`).
    pub fn connect(&self, param: ConnParam) -> Result<()> {
        let mut raw = param.to_raw();
        let ret = unsafe { rdma_connect(self.0.as_ptr(), &mut raw) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to connect");
        }
        Ok(())
    }

    /// Accept a pending connect request (passive side).
    pub fn accept(&self, param: ConnParam) -> Result<()> {
        let mut raw = param.to_raw();
        let ret = unsafe { rdma_accept(self.0.as_ptr(), &mut raw) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to accept");
        }
        Ok(())
    }

    /// Disconnect. The peer observes a `Disconnected` event; so does the
    /// local event loop.
    pub fn disconnect(&self) -> Result<()> {
        let ret = unsafe { rdma_disconnect(self.0.as_ptr()) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to disconnect");
        }
        Ok(())
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        let ret = unsafe { rdma_destroy_id(self.0.as_ptr()) };
        if ret != 0 {
            log::debug!("failed to destroy CM id: {}", io::Error::last_os_error());
        }
    }
}

/// In-place socket address storage for the `rdma_*_addr` calls, which take a
/// mutable `sockaddr` pointer.
enum SockaddrStorage {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl From<SocketAddr> for SockaddrStorage {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                SockaddrStorage::V4(sin)
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                SockaddrStorage::V6(sin6)
            }
        }
    }
}

impl SockaddrStorage {
    fn as_mut_ptr<T>(&mut self) -> *mut T {
        match self {
            SockaddrStorage::V4(sin) => sin as *mut _ as *mut T,
            SockaddrStorage::V6(sin6) => sin6 as *mut _ as *mut T,
        }
    }
}
