//! MicroView host agent.
//!
//! Registers pods over a local TCP handshake, owns their shared-memory
//! pages, and runs the active side of one RDMA connection per pod towards
//! the collector.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use microview::agent;
use microview::AgentConfig;

#[derive(Parser, Debug)]
#[command(about = "MicroView host agent")]
struct Args {
    /// Collector address (IP or hostname), typically the SmartNIC.
    peer_addr: String,

    /// Collector CM port.
    peer_port: u16,

    /// Shared page / READ block size in bytes.
    #[arg(default_value_t = 1024)]
    block_size: usize,

    /// Number of READ-sink regions the collector keeps per pod.
    #[arg(default_value_t = 1)]
    mrs_per_pod: usize,

    /// Registration port (0 = ephemeral; the chosen port lands in `.port`).
    #[arg(long, default_value_t = 0)]
    listen_port: u16,

    /// Directory for the `.port` sidecar file.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Propagate shm_unlink failures instead of logging them.
    #[arg(long)]
    strict_unlink: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    log::info!(
        "agent connecting pods to collector {}:{}, block size {}",
        args.peer_addr,
        args.peer_port,
        args.block_size
    );

    agent::run(AgentConfig {
        peer_addr: args.peer_addr,
        peer_port: args.peer_port,
        block_size: args.block_size,
        mrs_per_pod: args.mrs_per_pod,
        listen_port: args.listen_port,
        work_dir: args.work_dir,
        ignore_unlink_errors: !args.strict_unlink,
    })
}
