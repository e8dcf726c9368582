//! Pod liveness watcher.
//!
//! Wakes every two seconds and probes each registered pod's process id with
//! a null signal. Dead pods get their RDMA connection disconnected; the
//! disconnect propagates to the collector as a CM event and teardown drains
//! asynchronously — the watcher never blocks on it.

use std::sync::Arc;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::WATCHER_PERIOD;

use super::AgentCtx;

/// Whether a process with this pid currently exists.
pub fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Watcher thread body. Runs for the life of the agent.
pub fn run(ctx: Arc<AgentCtx>) {
    loop {
        std::thread::sleep(WATCHER_PERIOD);
        sweep(&ctx);
    }
}

/// One sweep: disconnect every registered pod whose process has vanished.
pub fn sweep(ctx: &AgentCtx) {
    for (pid, id) in ctx.registry.reap_dead(process_alive) {
        log::info!("pod {} is gone, disconnecting its RDMA session", pid);
        if let Err(e) = id.disconnect() {
            log::warn!("pod {}: disconnect failed: {:#}", pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // Largest valid pid on Linux is bounded well below this.
        assert!(!process_alive(u32::MAX / 2));
    }
}
