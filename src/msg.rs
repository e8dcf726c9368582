//! Control-message wire codec.
//!
//! Exactly one control message crosses each connection in steady state: the
//! agent's `MR` advertisement, sent right after establishment. `DONE` is
//! reserved for graceful teardown and currently never sent; disconnection
//! events alone drive teardown.
//!
//! Layout (little-endian, fixed width):
//!
//! ```text
//! offset 0   u32  tag        0 = MR, 1 = DONE
//! offset 4   u32  (reserved)
//! offset 8   u64  remote_addr \
//! offset 16  u32  rkey         } MR payload, zero for DONE
//! offset 20  u32  length      /
//! ```

use crate::error::ProtocolError;
use crate::rdma::RemoteMr;

/// Wire size of every control message.
pub const WIRE_LEN: usize = 24;

const TAG_MR: u32 = 0;
const TAG_DONE: u32 = 1;

/// A control message exchanged over the connection's send/recv rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Memory-region advertisement: "READ me here".
    Mr(RemoteMr),
    /// Reserved graceful-teardown marker.
    Done,
}

impl ControlMessage {
    /// The message's tag name, for diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            ControlMessage::Mr(_) => "MR",
            ControlMessage::Done => "DONE",
        }
    }

    /// Encode into a fixed-width wire buffer.
    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut buf = [0u8; WIRE_LEN];
        match self {
            ControlMessage::Mr(mr) => {
                buf[0..4].copy_from_slice(&TAG_MR.to_le_bytes());
                buf[8..16].copy_from_slice(&mr.addr.to_le_bytes());
                buf[16..20].copy_from_slice(&mr.rkey.to_le_bytes());
                buf[20..24].copy_from_slice(&mr.len.to_le_bytes());
            }
            ControlMessage::Done => {
                buf[0..4].copy_from_slice(&TAG_DONE.to_le_bytes());
            }
        }
        buf
    }

    /// Decode from a received buffer. The buffer may be longer than
    /// [`WIRE_LEN`]; trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < WIRE_LEN {
            return Err(ProtocolError::Truncated {
                got: buf.len(),
                need: WIRE_LEN,
            });
        }
        let tag = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        match tag {
            TAG_MR => {
                let addr = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                let rkey = u32::from_le_bytes(buf[16..20].try_into().unwrap());
                let len = u32::from_le_bytes(buf[20..24].try_into().unwrap());
                Ok(ControlMessage::Mr(RemoteMr::new(addr, rkey, len)))
            }
            TAG_DONE => Ok(ControlMessage::Done),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mr_round_trip_is_byte_identical() {
        let msg = ControlMessage::Mr(RemoteMr::new(0x7f1234567890, 0xdeadbeef, 4096));
        let wire = msg.encode();
        let back = ControlMessage::decode(&wire).unwrap();
        assert_eq!(back, msg);
        // Re-encoding must reproduce the exact bytes the peer saw.
        assert_eq!(back.encode(), wire);
    }

    #[test]
    fn done_has_empty_payload() {
        let wire = ControlMessage::Done.encode();
        assert_eq!(u32::from_le_bytes(wire[0..4].try_into().unwrap()), 1);
        assert!(wire[4..].iter().all(|&b| b == 0));
        assert_eq!(ControlMessage::decode(&wire).unwrap(), ControlMessage::Done);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut wire = ControlMessage::Done.encode();
        wire[0..4].copy_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            ControlMessage::decode(&wire),
            Err(ProtocolError::UnknownTag(7))
        );
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = ControlMessage::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { got: 10, need: 24 });
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let msg = ControlMessage::Mr(RemoteMr::new(1, 2, 3));
        let mut wire = vec![0u8; 64];
        wire[..WIRE_LEN].copy_from_slice(&msg.encode());
        wire[WIRE_LEN..].fill(0xa5);
        assert_eq!(ControlMessage::decode(&wire).unwrap(), msg);
    }
}
