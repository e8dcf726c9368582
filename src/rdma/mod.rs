// Connection-manager side band: event channels, CM ids, CM events.
pub mod cm;

// Completion queues and completion channels.
pub mod cq;

// Local memory regions and remote MR descriptors.
pub mod mr;

// Protection domains.
pub mod pd;

// CM-owned queue pairs and work-request posting.
pub mod qp;

pub use cm::{CmEventKind, CmEvent, CmId, ConnParam, EventChannel, VerbsCtx};
pub use cq::{CompChannel, Cq, Wc};
pub use mr::{Mr, RemoteMr};
pub use pd::Pd;
pub use qp::CmQp;
