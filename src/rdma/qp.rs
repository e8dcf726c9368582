//! CM-owned queue pairs.
//!
//! MicroView QPs are always reliable-connection and are created through the
//! CM id (`rdma_create_qp`), so their state transitions are driven by the
//! connection manager rather than by manual `ibv_modify_qp` sequences.

use std::io;
use std::{mem, ptr};

use anyhow::{Context as _, Result};
use rdma_sys::*;

use super::cm::CmId;
use super::cq::Cq;
use super::mr::{Mr, RemoteMr};
use super::pd::Pd;

/// Queue pair capacity. Send and receive queues scale with the batch size so
/// a full READ batch plus control traffic fits outstanding.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

impl QpCaps {
    /// Sizing used on both sides: ten outstanding batches' worth of work
    /// requests, single-SGE.
    pub fn for_batch(batch: usize) -> Self {
        Self {
            max_send_wr: 10 * batch as u32,
            max_recv_wr: 10 * batch as u32,
        }
    }
}

/// A queue pair created on a CM id.
///
/// `rdma_create_qp` ties the QP to the id; destruction goes through
/// `rdma_destroy_qp` on the same id, so this type must be dropped before the
/// [`CmId`] it was created on. Connections encode that in field order.
#[derive(Debug)]
pub struct CmQp {
    id: *mut rdma_cm_id,
    qp: *mut ibv_qp,
}

unsafe impl Send for CmQp {}
unsafe impl Sync for CmQp {}

impl CmQp {
    /// Create an RC QP on `id`, with both work queues completing into `cq`.
    pub fn create(id: &CmId, pd: &Pd, cq: &Cq, caps: QpCaps) -> Result<Self> {
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq.as_ptr();
        attr.recv_cq = cq.as_ptr();
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = caps.max_send_wr;
        attr.cap.max_recv_wr = caps.max_recv_wr;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;

        let ret = unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &mut attr) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::last_os_error()))
                .with_context(|| "failed to create queue pair");
        }
        let qp = unsafe { (*id.as_ptr()).qp };
        Ok(Self {
            id: id.as_ptr(),
            qp,
        })
    }

    /// Post one receive for a control message into `mr`'s region.
    pub fn post_recv_msg(&self, wr_id: u64, mr: &Mr) -> Result<()> {
        let mut sge = ibv_sge {
            addr: mr.addr() as u64,
            length: mr.len() as u32,
            lkey: mr.lkey(),
        };
        let mut wr: ibv_recv_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_recv(self.qp, &mut wr, &mut bad_wr) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::from_raw_os_error(ret)))
                .with_context(|| "failed to post receive");
        }
        Ok(())
    }

    /// Post one signaled SEND of `len` bytes from `mr`'s region.
    pub fn post_send_msg(&self, wr_id: u64, mr: &Mr, len: usize) -> Result<()> {
        let mut sge = ibv_sge {
            addr: mr.addr() as u64,
            length: len as u32,
            lkey: mr.lkey(),
        };
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.qp, &mut wr, &mut bad_wr) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::from_raw_os_error(ret)))
                .with_context(|| "failed to post send");
        }
        Ok(())
    }

    /// Post one batch of `sinks.len()` chained RDMA READs, all targeting the
    /// start of `peer`, each landing in its own sink region, each signaled.
    ///
    /// RC QPs complete READs in post order, which is what makes "the last
    /// completion closes the batch" a valid latency measurement.
    pub fn post_read_batch(&self, wr_id: u64, peer: &RemoteMr, sinks: &[Mr]) -> Result<()> {
        assert!(!sinks.is_empty());

        let mut sges: Vec<ibv_sge> = sinks
            .iter()
            .map(|mr| ibv_sge {
                addr: mr.addr() as u64,
                length: mr.len() as u32,
                lkey: mr.lkey(),
            })
            .collect();

        let mut wrs: Vec<ibv_send_wr> = Vec::with_capacity(sinks.len());
        for sge in sges.iter_mut() {
            let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
            wr.wr_id = wr_id;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            wr.sg_list = sge;
            wr.num_sge = 1;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma = rdma_t {
                remote_addr: peer.addr,
                rkey: peer.rkey,
            };
            wrs.push(wr);
        }
        // Chain after the vector is final so the links stay valid.
        for i in 1..wrs.len() {
            let next: *mut ibv_send_wr = &mut wrs[i];
            wrs[i - 1].next = next;
        }

        let mut bad_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.qp, &mut wrs[0], &mut bad_wr) };
        if ret != 0 {
            return Err(anyhow::anyhow!(io::Error::from_raw_os_error(ret)))
                .with_context(|| "failed to post READ batch");
        }
        Ok(())
    }
}

impl Drop for CmQp {
    fn drop(&mut self) {
        unsafe { rdma_destroy_qp(self.id) };
    }
}
