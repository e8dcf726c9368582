//! MicroView: a low-overhead metric collection plane for containerized
//! workloads on RDMA-capable hosts.
//!
//! Pods publish metrics by writing into a shared-memory page they obtain
//! from the host agent over a local TCP handshake. The agent pins each page
//! and advertises it to a remote collector as a remotely-readable RDMA
//! memory region. The collector scrapes all pages with periodic batched
//! one-sided RDMA READs, so the steady-state collection path costs the host
//! zero syscalls and zero CPU.
//!
//! The crate is built atop the [`rdma-sys`] crate and splits into:
//!
//! - [`rdma`]: safe wrappings of the connection-manager and verbs resources
//!   this system needs (event channels, CM ids, PDs, CQs with completion
//!   channels, MRs, CM-owned QPs).
//! - [`agent`]: the host-side agent. Registers pods, owns their shared
//!   pages, runs the active side of each RDMA connection, and tears
//!   connections down when pods die.
//! - [`collector`]: the remote scraper. Accepts connections, receives each
//!   peer's memory-region advertisement, and issues synchronized READ
//!   batches across all active connections every sampling interval.
//! - [`pod`]: the pod-side registration client.
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

#[cfg(not(target_os = "linux"))]
compile_error!("`microview` currently only supports Linux");

/// Safe RDMA resource wrappings.
pub mod rdma;

/// Control-message wire codec.
pub mod msg;

/// Named POSIX shared-memory pages.
pub mod shm;

/// Latency sample accounting and output files.
pub mod latency;

/// Error taxonomy shared across components.
pub mod error;

/// Runtime configuration for the agent and the collector.
pub mod config;

/// Host-side agent: pod registration, RDMA active side, liveness watcher.
pub mod agent;

/// Collector: RDMA passive side, completion pollers, scrape scheduler.
pub mod collector;

/// Pod-side registration client.
pub mod pod;

pub use config::{AgentConfig, CollectorConfig};
pub use error::{ProtocolError, ShmError, WcError};
pub use msg::ControlMessage;
pub use rdma::RemoteMr;
pub use shm::SharedPage;
