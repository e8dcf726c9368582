//! The host agent: pod registration, per-pod RDMA sessions, liveness.
//!
//! One accept thread admits pods over TCP and spawns a handler per pod; the
//! handler runs the pod's RDMA session (active side) to completion. A
//! watcher thread disconnects sessions whose pods have died.

mod registry;
mod server;
pub mod session;
mod watcher;

pub use registry::PodRegistry;
pub use session::AgentConnection;
pub use watcher::process_alive;

use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};

use crate::config::AgentConfig;
use crate::rdma::CmId;

/// Process-wide agent context, shared by the accept loop, the pod handlers,
/// and the liveness watcher.
pub struct AgentCtx {
    pub config: AgentConfig,
    pub registry: PodRegistry<Arc<CmId>>,
}

/// Run the agent: spawn the watcher, then serve pod registrations forever.
pub fn run(config: AgentConfig) -> Result<()> {
    let ctx = Arc::new(AgentCtx {
        config,
        registry: PodRegistry::new(),
    });

    let watcher_ctx = Arc::clone(&ctx);
    thread::Builder::new()
        .name("liveness-watcher".to_owned())
        .spawn(move || watcher::run(watcher_ctx))
        .with_context(|| "failed to spawn liveness watcher")?;

    server::run(ctx)
}
