//! Per-connection completion poller.
//!
//! One thread per connection blocks on the completion channel, acks the
//! event, rearms notification, and drains the CQ. Receive completions feed
//! the protocol state machine; READ completions feed batch accounting. When
//! a batch closes and the connection is ready, the poller parks on its tick
//! slot and posts the next batch the moment the scheduler signals.
//!
//! Any completion error ends the poller; so does a stop signal from the CM
//! listener. On the way out the poller writes its latency samples, and the
//! last poller standing also writes the global round samples.

use std::sync::Arc;

use anyhow::Result;

use crate::error::WcError;
use crate::latency::{connection_samples_file, LatencyMeter, ROUND_SAMPLES_FILE};
use crate::msg::ControlMessage;
use crate::rdma::Wc;

use super::connection::Connection;
use super::tick::TickOutcome;
use super::CollectorCtx;

/// What the on-completion handler decided.
enum Flow {
    Continue,
    Exit,
}

/// Poller thread body.
pub fn run(ctx: Arc<CollectorCtx>, conn: Arc<Connection>) {
    let index = conn.index();
    log::info!("poller {}: started", index);

    let mut meter = LatencyMeter::new();
    match poll_loop(&ctx, &conn, &mut meter) {
        Ok(()) => log::info!("poller {}: stopped", index),
        // Flushed completions are how a disconnecting connection drains;
        // anything else is a real data-path failure.
        Err(e) => match e.downcast_ref::<WcError>() {
            Some(wc) if wc.is_flush() => {
                log::info!("poller {}: connection flushed, stopping", index)
            }
            _ => log::warn!("poller {}: terminated: {:#}", index, e),
        },
    }

    let samples = ctx.config.output_dir.join(connection_samples_file(index));
    if let Err(e) = meter.write_to(&samples) {
        log::warn!("poller {}: failed to write {:?}: {}", index, samples, e);
    }

    if ctx.board.connection_down() {
        let rounds = ctx.config.output_dir.join(ROUND_SAMPLES_FILE);
        match ctx.board.round().write_samples_once(&rounds) {
            Ok(true) => log::info!("poller {}: wrote round samples to {:?}", index, rounds),
            Ok(false) => {}
            Err(e) => log::warn!("poller {}: failed to write {:?}: {}", index, rounds, e),
        }
    }
}

fn poll_loop(
    ctx: &CollectorCtx,
    conn: &Connection,
    meter: &mut LatencyMeter,
) -> Result<()> {
    let mut wcs = vec![Wc::default(); 2 * ctx.config.mrs_per_pod.max(1)];
    loop {
        // One blocking wait per connection; everything after is non-blocking.
        conn.chan().wait_and_ack()?;
        conn.cq().req_notify()?;

        loop {
            let n = conn.cq().poll(&mut wcs)?;
            if n == 0 {
                break;
            }
            for wc in &wcs[..n] {
                match on_completion(ctx, conn, wc, meter)? {
                    Flow::Continue => {}
                    Flow::Exit => return Ok(()),
                }
            }
        }
    }
}

/// Handle one work completion, then arm the next batch if the connection is
/// ready for it.
fn on_completion(
    ctx: &CollectorCtx,
    conn: &Connection,
    wc: &Wc,
    meter: &mut LatencyMeter,
) -> Result<Flow> {
    wc.result()?;

    if wc.is_recv() {
        let msg = ControlMessage::decode(conn.recv_bytes())?;
        log::debug!("poller {}: received {}", conn.index(), msg.tag_name());
        conn.progress().on_control_message(msg)?;
        // No re-post: the only further control message would be DONE, which
        // is reserved and never sent.
    } else {
        // READ completion. RC QPs complete in post order, so the N-th one
        // closes the batch.
        let batch_done = conn.progress().on_read_completion();
        if batch_done {
            if let Some(ns) = meter.record() {
                log::debug!(
                    "poller {}: batch done in {} ns, page starts {:?}",
                    conn.index(),
                    ns,
                    String::from_utf8_lossy(conn.sink_prefix(16)),
                );
            }
            let active = ctx.board.active_connections();
            if let Some(ns) = ctx.board.round().connection_finished(active) {
                log::debug!("round complete across {} connections in {} ns", active, ns);
            }
        }
    }

    if conn.progress().ready_to_post() {
        // Park until the scheduler releases this slot; consume the signal
        // before posting so a missed tick never queues up.
        match ctx.board.slot(conn.index()).wait() {
            TickOutcome::Stop => return Ok(Flow::Exit),
            TickOutcome::Proceed => {
                let peer = conn.progress().begin_batch();
                meter.start();
                conn.post_read_batch(&peer)?;
            }
        }
    }

    Ok(Flow::Continue)
}
