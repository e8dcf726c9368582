//! Scrape tick scheduling.
//!
//! A single tick thread drives all connections in lockstep: every sampling
//! interval it resets the global round and arms every slot's one-shot
//! signal. Each connection's poller consumes its own slot's signal right
//! before posting a READ batch.
//!
//! The signal is deliberately not a queue. If a poller falls behind and two
//! ticks elapse, it finds the flag set once and posts one batch: the plane
//! prefers fresh samples over a backlog.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::latency::LatencyMeter;

/// Outcome of waiting on a tick slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A tick was consumed; post the next batch.
    Proceed,
    /// The connection is being torn down; exit without posting.
    Stop,
}

#[derive(Debug, Default)]
struct SlotState {
    armed: bool,
    stop: bool,
}

/// Per-connection one-shot tick mailbox.
///
/// One producer (the tick thread) and one consumer (the slot's poller).
/// Arming an already-armed slot is a no-op, which is exactly the
/// freshness-over-backlog semantic.
#[derive(Debug, Default)]
pub struct TickSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl TickSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot and wake its poller, if any is waiting.
    pub fn arm(&self) {
        let mut st = self.state.lock().unwrap();
        st.armed = true;
        drop(st);
        self.cond.notify_one();
    }

    /// Mark the slot for teardown and wake its poller.
    pub fn stop(&self) {
        let mut st = self.state.lock().unwrap();
        st.stop = true;
        drop(st);
        self.cond.notify_one();
    }

    /// Block until the slot is armed or stopped; consume the armed flag.
    /// Stop wins over a pending tick.
    pub fn wait(&self) -> TickOutcome {
        let mut st = self.state.lock().unwrap();
        while !st.armed && !st.stop {
            st = self.cond.wait(st).unwrap();
        }
        if st.stop {
            return TickOutcome::Stop;
        }
        st.armed = false;
        TickOutcome::Proceed
    }
}

#[derive(Debug)]
struct RoundState {
    finished: usize,
    meter: LatencyMeter,
    written: bool,
}

/// Global round accounting.
///
/// A round starts at each tick; it completes when every active connection
/// has reported its full batch, at which point the round's latency sample
/// is recorded.
#[derive(Debug)]
pub struct GlobalRound {
    state: Mutex<RoundState>,
}

impl Default for GlobalRound {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalRound {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoundState {
                finished: 0,
                meter: LatencyMeter::new(),
                written: false,
            }),
        }
    }

    /// Reset the finished counter and stamp the round start. Called by the
    /// tick thread before arming the slots.
    pub fn begin(&self) {
        let mut st = self.state.lock().unwrap();
        st.finished = 0;
        st.meter.start();
    }

    /// Report that one connection finished its batch. When `finished`
    /// reaches `active`, the round sample is recorded and returned.
    pub fn connection_finished(&self, active: usize) -> Option<f64> {
        let mut st = self.state.lock().unwrap();
        st.finished += 1;
        if st.finished == active {
            st.meter.record()
        } else {
            None
        }
    }

    /// Write the round samples to `path` exactly once; later calls are
    /// no-ops. The last poller to exit does the write.
    pub fn write_samples_once(&self, path: &std::path::Path) -> std::io::Result<bool> {
        let mut st = self.state.lock().unwrap();
        if st.written {
            return Ok(false);
        }
        st.meter.write_to(path)?;
        st.written = true;
        Ok(true)
    }
}

/// Everything the tick thread and the pollers share.
#[derive(Debug)]
pub struct ScrapeBoard {
    slots: Vec<TickSlot>,
    round: GlobalRound,
    active: AtomicUsize,
}

impl ScrapeBoard {
    /// Preallocate `capacity` slots. Logical indices are never reused, so
    /// `capacity` bounds the connections accepted over a process lifetime.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| TickSlot::new()).collect(),
            round: GlobalRound::new(),
            active: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &TickSlot {
        &self.slots[index]
    }

    pub fn round(&self) -> &GlobalRound {
        &self.round
    }

    /// Number of currently active (established, not torn down) connections.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn connection_up(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the active count; returns true for the last one out, which
    /// is then responsible for writing the round sample file.
    pub fn connection_down(&self) -> bool {
        self.active.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Run one tick: reset the round, then arm every slot. Arming inactive
    /// slots is harmless (no poller waits on them).
    pub fn tick(&self) {
        self.round.begin();
        for slot in &self.slots {
            slot.arm();
        }
    }
}

/// The tick thread body: one [`ScrapeBoard::tick`] per sampling interval.
pub fn run_ticker(board: Arc<ScrapeBoard>, interval: Duration) {
    log::info!(
        "scrape tick running, sampling interval {} s",
        interval.as_secs()
    );
    loop {
        std::thread::sleep(interval);
        log::debug!("tick: arming {} slots", board.capacity());
        board.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn two_arms_one_consume() {
        // A delayed poller that misses a tick gets exactly one batch worth
        // of signal, not two.
        let slot = TickSlot::new();
        slot.arm();
        slot.arm();
        assert_eq!(slot.wait(), TickOutcome::Proceed);

        // Nothing left: a subsequent wait would block. Probe through a
        // thread with a timeout-free handshake instead of blocking the test.
        let slot = Arc::new(slot);
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        slot.stop();
        assert_eq!(waiter.join().unwrap(), TickOutcome::Stop);
    }

    #[test]
    fn stop_wins_over_pending_tick() {
        let slot = TickSlot::new();
        slot.arm();
        slot.stop();
        assert_eq!(slot.wait(), TickOutcome::Stop);
    }

    #[test]
    fn arm_wakes_a_waiting_poller() {
        let slot = Arc::new(TickSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait())
        };
        thread::sleep(Duration::from_millis(20));
        slot.arm();
        assert_eq!(waiter.join().unwrap(), TickOutcome::Proceed);
    }

    #[test]
    fn round_records_only_when_all_finished() {
        let round = GlobalRound::new();
        round.begin();
        assert_eq!(round.connection_finished(3), None);
        assert_eq!(round.connection_finished(3), None);
        let sample = round.connection_finished(3);
        assert!(sample.is_some());
    }

    #[test]
    fn round_resets_each_begin() {
        let round = GlobalRound::new();
        round.begin();
        assert_eq!(round.connection_finished(2), None);
        // Next tick arrives before the second connection finishes.
        round.begin();
        assert_eq!(round.connection_finished(2), None);
        assert!(round.connection_finished(2).is_some());
    }

    #[test]
    fn round_samples_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rounds.txt");

        let round = GlobalRound::new();
        round.begin();
        round.connection_finished(1);
        assert!(round.write_samples_once(&path).unwrap());
        assert!(!round.write_samples_once(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn board_counts_active_connections() {
        let board = ScrapeBoard::new(4);
        board.connection_up();
        board.connection_up();
        assert_eq!(board.active_connections(), 2);
        assert!(!board.connection_down());
        assert!(board.connection_down());
        assert_eq!(board.active_connections(), 0);
    }

    #[test]
    fn board_tick_arms_every_slot() {
        let board = ScrapeBoard::new(3);
        board.tick();
        for i in 0..3 {
            assert_eq!(board.slot(i).wait(), TickOutcome::Proceed);
        }
    }
}
