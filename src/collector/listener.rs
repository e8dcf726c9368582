//! Collector CM listen loop (passive side).
//!
//! Accepts one connection per pod, builds its resources, and hands it off to
//! a dedicated poller thread. CM events for child ids arrive on the listen
//! channel and are dispatched by id token.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};

use crate::rdma::{CmEventKind, CmId, EventChannel};

use super::connection::Connection;
use super::poller;
use super::CollectorCtx;

/// Run the listen loop. Does not return in normal operation.
pub fn run(ctx: Arc<CollectorCtx>) -> Result<()> {
    let ec = EventChannel::new()?;
    let listen_id = CmId::create(&ec)?;
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, ctx.config.listen_port));
    listen_id.bind_addr(bind)?;
    listen_id.listen(10)?;
    log::info!("collector listening on port {}", listen_id.src_port());

    let mut conns: HashMap<usize, Arc<Connection>> = HashMap::new();
    let mut next_index = 0usize;

    loop {
        let event = ec.get_cm_event()?;
        let kind = event.kind();
        let token = event.id_token();

        match kind {
            CmEventKind::ConnectRequest => {
                let id = event.take_request_id();
                drop(event);
                if next_index >= ctx.board.capacity() {
                    log::warn!(
                        "connection limit {} reached, rejecting request",
                        ctx.board.capacity()
                    );
                    // Dropping an unaccepted id rejects the request.
                    drop(id);
                    continue;
                }
                let index = next_index;
                next_index += 1;
                match admit(&ctx, id, index) {
                    Ok(conn) => {
                        conns.insert(conn.token(), conn);
                    }
                    Err(e) => log::error!("failed to admit connection {}: {:#}", index, e),
                }
            }
            CmEventKind::Established => {
                drop(event);
                if let Some(conn) = conns.get(&token) {
                    conn.set_connected(true);
                    log::info!("connection {} established", conn.index());
                }
            }
            CmEventKind::Disconnected => {
                drop(event);
                if let Some(conn) = conns.remove(&token) {
                    log::info!("connection {} disconnected by peer", conn.index());
                    // Wake the poller if it is parked on its slot; a poller
                    // blocked on the completion channel is woken by the
                    // flushed completions the disconnect produces.
                    ctx.board.slot(conn.index()).stop();
                }
            }
            other => {
                let status = event.status();
                drop(event);
                log::debug!("ignoring CM event {:?} (status {})", other, status);
            }
        }
    }
}

/// Build a connection for an accepted request and spawn its poller.
fn admit(ctx: &Arc<CollectorCtx>, id: CmId, index: usize) -> Result<Arc<Connection>> {
    let conn = Connection::build(
        id,
        index,
        ctx.config.block_size,
        ctx.config.mrs_per_pod,
    )?;
    conn.accept()?;
    ctx.board.connection_up();

    let poller_ctx = Arc::clone(ctx);
    let poller_conn = Arc::clone(&conn);
    thread::Builder::new()
        .name(format!("poller-{}", index))
        .spawn(move || poller::run(poller_ctx, poller_conn))
        .with_context(|| "failed to spawn poller thread")?;

    log::info!("connection {} admitted", index);
    Ok(conn)
}
