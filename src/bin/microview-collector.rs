//! MicroView collector.
//!
//! Accepts one RDMA connection per pod from host agents and scrapes every
//! advertised page with batched one-sided READs at a fixed sampling
//! interval. Latency samples land in per-connection files plus one global
//! round file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use microview::collector;
use microview::config::DEFAULT_MAX_CONNECTIONS;
use microview::CollectorConfig;

#[derive(Parser, Debug)]
#[command(about = "MicroView collector")]
struct Args {
    /// CM listening port.
    listen_port: u16,

    /// Sampling interval in seconds.
    sampling_interval: u64,

    /// READ block size in bytes; must match the agents' block size.
    #[arg(default_value_t = 1024)]
    block_size: usize,

    /// READs per batch (sink regions per pod).
    #[arg(default_value_t = 1)]
    mrs_per_pod: usize,

    /// Connection cap for the process lifetime.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Directory for latency sample files.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    log::info!(
        "collector on port {}, scraping every {} s, {} READs per batch",
        args.listen_port,
        args.sampling_interval,
        args.mrs_per_pod
    );

    collector::run(CollectorConfig {
        listen_port: args.listen_port,
        sampling_interval: Duration::from_secs(args.sampling_interval),
        block_size: args.block_size,
        mrs_per_pod: args.mrs_per_pod,
        max_connections: args.max_connections,
        output_dir: args.output_dir,
    })
}
