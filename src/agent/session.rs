//! Per-pod RDMA session (active side).
//!
//! Each registered pod gets its own event channel and CM id. The session
//! thread drives the CM state machine — resolve address, resolve route,
//! connect, advertise the pod's page, wait for disconnection — and a small
//! poller thread drains the session's completion queue (the MR-send
//! completion and the reserved DONE receive path).
//!
//! The agent never issues RDMA data operations itself: the pod's page is
//! registered for remote read only, and the send/recv rings carry nothing
//! but control messages.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context as _, Result};

use crate::config::RESOLVE_TIMEOUT_MS;
use crate::msg::{self, ControlMessage};
use crate::rdma::qp::QpCaps;
use crate::rdma::{
    CmEventKind, CmId, CmQp, CompChannel, ConnParam, Cq, EventChannel, Mr, Pd, Wc,
};
use crate::shm::SharedPage;

use super::AgentCtx;

/// Send-side protocol state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init,
    MrSent,
}

/// All RDMA resources of one pod's session.
///
/// Field order is teardown order: MRs deregister before the QP is
/// destroyed, which precedes freeing the control buffers and unmapping the
/// page; the CM id goes last.
pub struct AgentConnection {
    connected: AtomicBool,
    send_state: Mutex<SendState>,

    page_mr: Mr,
    send_mr: Mr,
    recv_mr: Mr,
    qp: CmQp,
    #[allow(dead_code)]
    send_buf: Box<[u8]>,
    recv_buf: Box<[u8]>,
    #[allow(dead_code)]
    page: SharedPage,
    cq: Cq,
    chan: CompChannel,
    #[allow(dead_code)]
    pd: Pd,
    #[allow(dead_code)]
    id: Arc<CmId>,
}

impl AgentConnection {
    /// Build the session's resources once the address has resolved: PD, CQ
    /// with completion channel, QP, control buffers, and the pod page
    /// registered for remote read. Posts the initial control receive.
    pub fn build(
        id: Arc<CmId>,
        page: SharedPage,
        mrs_per_pod: usize,
    ) -> Result<Arc<Self>> {
        let verbs = id.verbs()?;
        let pd = Pd::alloc(verbs)?;
        let chan = CompChannel::new(verbs)?;
        let cq = Cq::with_channel(verbs, (10 * mrs_per_pod) as i32, &chan)?;
        let qp = CmQp::create(&id, &pd, &cq, QpCaps::for_batch(mrs_per_pod))?;

        let send_buf = vec![0u8; msg::WIRE_LEN].into_boxed_slice();
        let mut recv_buf = vec![0u8; msg::WIRE_LEN].into_boxed_slice();

        let send_mr = Mr::reg_send(&pd, &send_buf)?;
        let recv_mr = Mr::reg_local(&pd, &mut recv_buf)?;
        // SAFETY: the page mapping lives in this struct and by field order
        // outlives the registration.
        let page_mr = unsafe { Mr::reg_remote_read(&pd, page.as_ptr(), page.len()) }
            .with_context(|| format!("failed to register page {}", page.name()))?;

        qp.post_recv_msg(0, &recv_mr)?;

        Ok(Arc::new(Self {
            connected: AtomicBool::new(false),
            send_state: Mutex::new(SendState::Init),
            page_mr,
            send_mr,
            recv_mr,
            qp,
            send_buf,
            recv_buf,
            page,
            cq,
            chan,
            pd,
            id,
        }))
    }

    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn send_state(&self) -> SendState {
        *self.send_state.lock().unwrap()
    }

    /// Send the MR advertisement for the pod's page.
    pub fn advertise(&self) -> Result<()> {
        let wire = ControlMessage::Mr(self.page_mr.descriptor()).encode();
        // SAFETY: the send buffer is registered over exactly WIRE_LEN bytes
        // and nothing is in flight on it before the first (and only) send.
        unsafe {
            std::ptr::copy_nonoverlapping(wire.as_ptr(), self.send_mr.addr(), wire.len());
        }
        self.qp.post_send_msg(0, &self.send_mr, msg::WIRE_LEN)
    }

    fn mark_mr_sent(&self) {
        *self.send_state.lock().unwrap() = SendState::MrSent;
    }
}

/// Run one pod's session to completion. Returns once the connection is torn
/// down (pod death, peer disconnect, or an error on the way up).
pub fn run(ctx: &AgentCtx, pid: u32, page: SharedPage) -> Result<()> {
    let peer = resolve_peer(&ctx.config.peer_addr, ctx.config.peer_port)?;

    let ec = EventChannel::new()?;
    let id = Arc::new(CmId::create(&ec)?);
    id.resolve_addr(peer, RESOLVE_TIMEOUT_MS)?;

    // From here the watcher can reach this session.
    ctx.registry.register(pid, Arc::clone(&id));
    let result = event_loop(ctx, &ec, &id, pid, page);
    if result.is_err() {
        // Flush outstanding work so a poller blocked on the completion
        // channel observes the teardown.
        let _ = id.disconnect();
    }
    ctx.registry.mark_dead(pid);
    result
}

fn event_loop(
    ctx: &AgentCtx,
    ec: &EventChannel,
    id: &Arc<CmId>,
    pid: u32,
    page: SharedPage,
) -> Result<()> {
    let mut page = Some(page);
    let mut conn: Option<Arc<AgentConnection>> = None;

    loop {
        let event = ec.get_cm_event()?;
        let kind = event.kind();
        let status = event.status();
        drop(event);

        match kind {
            CmEventKind::AddrResolved => {
                log::debug!("pod {}: address resolved", pid);
                conn = Some(AgentConnection::build(
                    Arc::clone(id),
                    page.take().context("address resolved twice")?,
                    ctx.config.mrs_per_pod,
                )?);
                id.resolve_route(RESOLVE_TIMEOUT_MS)?;
            }
            CmEventKind::RouteResolved => {
                log::debug!("pod {}: route resolved", pid);
                id.connect(ConnParam::default())?;
            }
            CmEventKind::Established => {
                let conn = conn
                    .as_ref()
                    .context("connection established before being built")?;
                conn.set_connected();
                // The first completion this session can see is the MR send,
                // so the poller starts here, once there is something for it
                // to wait on.
                let for_poller = Arc::clone(conn);
                thread::Builder::new()
                    .name(format!("agent-poller-{}", pid))
                    .spawn(move || poll_cq(for_poller, pid))
                    .with_context(|| "failed to spawn session poller")?;
                conn.advertise()?;
                log::info!("pod {}: connected, page advertised", pid);
            }
            CmEventKind::Disconnected => {
                log::info!("pod {}: disconnected", pid);
                // Dropping our reference lets the poller's exit run the
                // resource teardown (QP, MRs, buffers, page, CM id).
                drop(conn.take());
                return Ok(());
            }
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::ConnectError
            | CmEventKind::Unreachable
            | CmEventKind::Rejected => {
                bail!("pod {}: CM failure {:?} (status {})", pid, kind, status);
            }
            other => {
                log::debug!("pod {}: ignoring CM event {:?}", pid, other);
            }
        }
    }
}

/// Session poller: observes the MR-send completion and the reserved DONE
/// receive path. Exits on any error status, which at teardown is simply the
/// flushed receive.
fn poll_cq(conn: Arc<AgentConnection>, pid: u32) {
    let result = (|| -> Result<()> {
        let mut wcs = vec![Wc::default(); 4];
        loop {
            conn.chan().wait_and_ack()?;
            conn.cq().req_notify()?;
            loop {
                let n = conn.cq().poll(&mut wcs)?;
                if n == 0 {
                    break;
                }
                for wc in &wcs[..n] {
                    wc.result()?;
                    if wc.is_recv() {
                        let msg = ControlMessage::decode(&conn.recv_buf)?;
                        match msg {
                            ControlMessage::Done => {
                                log::info!("pod {}: peer sent DONE", pid);
                                // Rearm only for further control messages.
                                conn.qp.post_recv_msg(0, &conn.recv_mr)?;
                            }
                            other => bail!(
                                "pod {}: unexpected control message {}",
                                pid,
                                other.tag_name()
                            ),
                        }
                    } else {
                        conn.mark_mr_sent();
                        log::debug!("pod {}: MR advertisement delivered", pid);
                    }
                }
            }
        }
    })();

    match result {
        Ok(()) => log::debug!("pod {}: session poller exited", pid),
        Err(e) => log::debug!("pod {}: session poller exited: {:#}", pid, e),
    }
}

impl AgentConnection {
    #[inline]
    fn chan(&self) -> &CompChannel {
        &self.chan
    }

    #[inline]
    fn cq(&self) -> &Cq {
        &self.cq
    }
}

fn resolve_peer(addr: &str, port: u16) -> Result<SocketAddr> {
    (addr, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve collector address {}:{}", addr, port))?
        .next()
        .with_context(|| format!("collector address {}:{} resolved to nothing", addr, port))
}
