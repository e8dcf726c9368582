//! The collector: RDMA passive side and scrape scheduler.
//!
//! One CM listen thread admits connections; one poller thread per connection
//! drives its completions; one tick thread synchronizes READ batches across
//! all connections every sampling interval.

mod connection;
mod listener;
mod poller;
pub mod tick;

pub use connection::{Connection, Progress, RecvState, SendState};
pub use tick::{ScrapeBoard, TickOutcome, TickSlot};

use std::sync::Arc;
use std::thread;

use anyhow::{Context as _, Result};

use crate::config::CollectorConfig;

/// Process-wide collector context, shared by the listener, the pollers, and
/// the tick thread.
#[derive(Debug)]
pub struct CollectorCtx {
    pub config: CollectorConfig,
    pub board: Arc<ScrapeBoard>,
}

/// Run the collector: spawn the tick thread, then serve CM events forever.
pub fn run(config: CollectorConfig) -> Result<()> {
    let interval = config.sampling_interval;
    let ctx = Arc::new(CollectorCtx {
        board: Arc::new(ScrapeBoard::new(config.max_connections)),
        config,
    });

    let ticker_board = Arc::clone(&ctx.board);
    thread::Builder::new()
        .name("ticker".to_owned())
        .spawn(move || tick::run_ticker(ticker_board, interval))
        .with_context(|| "failed to spawn tick thread")?;

    listener::run(ctx)
}
