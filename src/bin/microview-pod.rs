//! Demo metric producer.
//!
//! Registers with the local agent as a pod and writes a counter into its
//! shared page once per second. Useful for end-to-end smoke runs against a
//! collector; real pods would keep an actual metric layout in the page.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use microview::pod;

#[derive(Parser, Debug)]
#[command(about = "MicroView demo pod")]
struct Args {
    /// Directory containing the agent's `.port` sidecar.
    #[arg(long, default_value = ".")]
    agent_dir: PathBuf,

    /// Page size; must match the agent's block size.
    #[arg(long, default_value_t = 1024)]
    block_size: usize,

    /// How many updates to write before exiting.
    #[arg(long, default_value_t = 500)]
    updates: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let pid = std::process::id();
    let page = pod::attach(&args.agent_dir, pid, args.block_size)?;
    log::info!("pod {}: mapped {} ({} bytes)", pid, page.name(), page.len());

    for i in 0..args.updates {
        let text = format!("counter: {}", i);
        let buf = page.as_mut_slice();
        buf.fill(0);
        let n = text.len().min(buf.len());
        buf[..n].copy_from_slice(&text.as_bytes()[..n]);
        std::thread::sleep(Duration::from_secs(1));
    }

    Ok(())
}
