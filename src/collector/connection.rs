//! Per-connection state on the collector.
//!
//! A `Connection` owns every RDMA resource of one scrape target: the CM id
//! accepted from the agent, an independent PD/CQ/completion channel, the QP,
//! the control send/recv buffers, and N local READ-sink buffers. It exposes
//! none of its memory for remote access.
//!
//! Progress bookkeeping (states, peer descriptor, batch counter) is split
//! into [`Progress`], which is plain data so the completion rules are
//! testable without hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result};

use crate::error::ProtocolError;
use crate::msg::{self, ControlMessage};
use crate::rdma::qp::QpCaps;
use crate::rdma::{CmId, CmQp, CompChannel, ConnParam, Cq, Mr, Pd, RemoteMr};

/// Receive-side protocol state. Advances monotonically; never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecvState {
    Init,
    MrReceived,
    DoneReceived,
}

/// Send-side protocol state (the collector only ever issues READs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendState {
    Init,
    MrSent,
    RdmaSent,
    DoneSent,
}

/// Batch and protocol progress for one connection.
#[derive(Debug)]
pub struct Progress {
    recv_state: RecvState,
    send_state: SendState,
    peer: Option<RemoteMr>,
    completed: usize,
    batch: usize,
}

impl Progress {
    /// `batch` is N, the number of READs per scrape. `completed` starts at
    /// N so the first batch arms as soon as the MR advertisement lands.
    pub fn new(batch: usize) -> Self {
        Self {
            recv_state: RecvState::Init,
            send_state: SendState::Init,
            peer: None,
            completed: batch,
            batch,
        }
    }

    pub fn recv_state(&self) -> RecvState {
        self.recv_state
    }

    pub fn send_state(&self) -> SendState {
        self.send_state
    }

    pub fn peer(&self) -> Option<RemoteMr> {
        self.peer
    }

    /// Apply a received control message. States only move forward; anything
    /// out of order is fatal to the connection.
    pub fn on_control_message(&mut self, msg: ControlMessage) -> Result<(), ProtocolError> {
        match (self.recv_state, msg) {
            (RecvState::Init, ControlMessage::Mr(peer)) => {
                self.recv_state = RecvState::MrReceived;
                self.peer = Some(peer);
                Ok(())
            }
            (RecvState::MrReceived, ControlMessage::Done) => {
                self.recv_state = RecvState::DoneReceived;
                Ok(())
            }
            (state, msg) => Err(ProtocolError::UnexpectedMessage {
                got: msg.tag_name(),
                state: match state {
                    RecvState::Init => "INIT",
                    RecvState::MrReceived => "MR_RECV",
                    RecvState::DoneReceived => "DONE_RECV",
                },
            }),
        }
    }

    /// Account one READ completion. Returns true when it closes the batch
    /// (the N-th completion, in post order on an RC QP).
    pub fn on_read_completion(&mut self) -> bool {
        debug_assert!(self.completed < self.batch);
        self.completed += 1;
        if self.completed == self.batch {
            self.send_state = SendState::RdmaSent;
            true
        } else {
            false
        }
    }

    /// Whether the next batch may be armed: the peer MR is known and no
    /// READs from the previous batch are outstanding.
    pub fn ready_to_post(&self) -> bool {
        self.recv_state >= RecvState::MrReceived && self.completed == self.batch
    }

    /// Start a new batch: zero the completion counter and hand back the
    /// target descriptor. Callers must have checked [`Self::ready_to_post`].
    pub fn begin_batch(&mut self) -> RemoteMr {
        debug_assert!(self.ready_to_post());
        self.completed = 0;
        self.peer.expect("ready_to_post implies a peer MR")
    }
}

/// One accepted scrape connection and all resources it owns.
///
/// Field order is teardown order: MRs deregister first, the QP second, the
/// backing buffers free third, CQ/channel/PD after, and the CM id last.
pub struct Connection {
    index: usize,
    connected: AtomicBool,
    progress: Mutex<Progress>,

    /// Registered but idle until DONE-based teardown exists.
    #[allow(dead_code)]
    send_mr: Mr,
    recv_mr: Mr,
    sink_mrs: Vec<Mr>,
    qp: CmQp,
    #[allow(dead_code)]
    send_buf: Box<[u8]>,
    recv_buf: Box<[u8]>,
    sinks: Vec<Box<[u8]>>,
    cq: Cq,
    chan: CompChannel,
    #[allow(dead_code)]
    pd: Pd,
    id: CmId,
}

impl Connection {
    /// Build all resources for a connect request's child id and post the
    /// initial control receive. Does not accept yet.
    pub fn build(
        id: CmId,
        index: usize,
        block_size: usize,
        mrs_per_pod: usize,
    ) -> Result<Arc<Self>> {
        let verbs = id.verbs()?;
        let pd = Pd::alloc(verbs)?;
        let chan = CompChannel::new(verbs)?;
        let cq = Cq::with_channel(verbs, (10 * mrs_per_pod) as i32, &chan)?;
        let qp = CmQp::create(&id, &pd, &cq, QpCaps::for_batch(mrs_per_pod))?;

        let send_buf = vec![0u8; msg::WIRE_LEN].into_boxed_slice();
        let mut recv_buf = vec![0u8; msg::WIRE_LEN].into_boxed_slice();
        let mut sinks: Vec<Box<[u8]>> = (0..mrs_per_pod)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();

        let send_mr = Mr::reg_send(&pd, &send_buf)?;
        let recv_mr = Mr::reg_local(&pd, &mut recv_buf)?;
        let sink_mrs = sinks
            .iter_mut()
            .map(|buf| Mr::reg_local(&pd, buf))
            .collect::<Result<Vec<_>>>()
            .with_context(|| "failed to register READ-sink buffers")?;

        qp.post_recv_msg(index as u64, &recv_mr)?;

        Ok(Arc::new(Self {
            index,
            connected: AtomicBool::new(false),
            progress: Mutex::new(Progress::new(mrs_per_pod)),
            send_mr,
            recv_mr,
            sink_mrs,
            qp,
            send_buf,
            recv_buf,
            sinks,
            cq,
            chan,
            pd,
            id,
        }))
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Opaque token of the underlying CM id, for event dispatch.
    #[inline]
    pub fn token(&self) -> usize {
        self.id.token()
    }

    /// Accept the pending connect request.
    pub fn accept(&self) -> Result<()> {
        self.id.accept(ConnParam::default())
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap()
    }

    #[inline]
    pub fn chan(&self) -> &CompChannel {
        &self.chan
    }

    #[inline]
    pub fn cq(&self) -> &Cq {
        &self.cq
    }

    /// The bytes of the last received control message.
    pub fn recv_bytes(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Post one full READ batch against `peer`, all requests chained and
    /// signaled.
    pub fn post_read_batch(&self, peer: &RemoteMr) -> Result<()> {
        self.qp
            .post_read_batch(self.index as u64, peer, &self.sink_mrs)
    }

    /// A short prefix of the first sink buffer, for scrape debug logging.
    pub fn sink_prefix(&self, max: usize) -> &[u8] {
        let first = &self.sinks[0];
        &first[..max.min(first.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_batch_arms_only_after_mr() {
        let mut p = Progress::new(4);
        // completed == batch from the start, but no peer MR yet.
        assert!(!p.ready_to_post());

        p.on_control_message(ControlMessage::Mr(RemoteMr::new(0x1000, 7, 1024)))
            .unwrap();
        assert!(p.ready_to_post());
        assert_eq!(p.peer().unwrap().rkey, 7);
    }

    #[test]
    fn no_batch_overlap() {
        let mut p = Progress::new(3);
        p.on_control_message(ControlMessage::Mr(RemoteMr::new(1, 2, 3)))
            .unwrap();

        let peer = p.begin_batch();
        assert_eq!(peer.addr, 1);
        assert!(!p.ready_to_post());

        assert!(!p.on_read_completion());
        assert!(!p.ready_to_post());
        assert!(!p.on_read_completion());
        // Third completion closes the batch; only now may the next one post.
        assert!(p.on_read_completion());
        assert!(p.ready_to_post());
        assert_eq!(p.send_state(), SendState::RdmaSent);
    }

    #[test]
    fn recv_state_is_monotonic() {
        let mut p = Progress::new(1);
        p.on_control_message(ControlMessage::Mr(RemoteMr::new(1, 2, 3)))
            .unwrap();
        assert_eq!(p.recv_state(), RecvState::MrReceived);

        // A second MR would regress the state machine.
        let err = p
            .on_control_message(ControlMessage::Mr(RemoteMr::new(4, 5, 6)))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
        assert_eq!(p.recv_state(), RecvState::MrReceived);

        p.on_control_message(ControlMessage::Done).unwrap();
        assert_eq!(p.recv_state(), RecvState::DoneReceived);
    }

    #[test]
    fn done_before_mr_is_a_protocol_error() {
        let mut p = Progress::new(1);
        let err = p.on_control_message(ControlMessage::Done).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedMessage {
                got: "DONE",
                state: "INIT",
            }
        );
    }

    #[test]
    fn done_received_still_allows_scraping() {
        let mut p = Progress::new(2);
        p.on_control_message(ControlMessage::Mr(RemoteMr::new(1, 2, 3)))
            .unwrap();
        p.on_control_message(ControlMessage::Done).unwrap();
        assert!(p.ready_to_post());
    }
}
