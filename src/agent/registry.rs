//! Control-plane table: registered pods and their connection handles.
//!
//! Written by registration handlers (on pod arrival) and by the liveness
//! watcher (on pod death); the watcher is also the only reader. The handle
//! is generic so the sweep policy is testable without RDMA: in production it
//! is the session's CM id, on which the watcher calls disconnect.

use std::sync::Mutex;

#[derive(Debug)]
struct PodSlot<T> {
    pid: u32,
    /// `None` marks a dead pod; the slot stays so a pid is never probed
    /// twice after its teardown started.
    handle: Option<T>,
}

/// Pod pid ↔ connection-handle table behind a single mutex.
#[derive(Debug)]
pub struct PodRegistry<T> {
    slots: Mutex<Vec<PodSlot<T>>>,
}

impl<T> Default for PodRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PodRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register a pod. Called by the registration handler once the RDMA
    /// session is starting up.
    pub fn register(&self, pid: u32, handle: T) {
        let mut slots = self.slots.lock().unwrap();
        slots.push(PodSlot {
            pid,
            handle: Some(handle),
        });
    }

    /// Drop a pod's handle without disconnecting, marking it dead. Used by
    /// the session itself once teardown has run; idempotent.
    pub fn mark_dead(&self, pid: u32) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.pid == pid {
                slot.handle = None;
            }
        }
    }

    /// Collect the handles of pods that are no longer alive according to
    /// `alive`, marking their slots dead. The caller disconnects the
    /// returned handles outside the table lock.
    pub fn reap_dead(&self, alive: impl Fn(u32) -> bool) -> Vec<(u32, T)> {
        let mut slots = self.slots.lock().unwrap();
        let mut dead = Vec::new();
        for slot in slots.iter_mut() {
            if slot.handle.is_some() && !alive(slot.pid) {
                let handle = slot.handle.take().unwrap();
                dead.push((slot.pid, handle));
            }
        }
        dead
    }

    /// Number of live (non-sentinel) registrations.
    pub fn active_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().filter(|s| s.handle.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_returns_only_dead_pods() {
        let reg = PodRegistry::new();
        reg.register(1111, "a");
        reg.register(2222, "b");
        reg.register(3333, "c");

        let dead = reg.reap_dead(|pid| pid != 2222);
        assert_eq!(dead, vec![(2222, "b")]);
        assert_eq!(reg.active_count(), 2);
    }

    #[test]
    fn dead_pods_are_not_probed_twice() {
        let reg = PodRegistry::new();
        reg.register(1111, "a");

        assert_eq!(reg.reap_dead(|_| false).len(), 1);

        // The sentinel slot must be skipped even though the probe still
        // reports the pid as dead.
        let mut probed = Vec::new();
        let dead = reg.reap_dead(|pid| {
            probed.push(pid);
            false
        });
        assert!(dead.is_empty());
        assert!(probed.is_empty());
    }

    #[test]
    fn mark_dead_is_idempotent() {
        let reg = PodRegistry::new();
        reg.register(1111, "a");
        reg.mark_dead(1111);
        reg.mark_dead(1111);
        assert_eq!(reg.active_count(), 0);
        assert!(reg.reap_dead(|_| false).is_empty());
    }

    #[test]
    fn same_pid_may_reregister_after_death() {
        let reg = PodRegistry::new();
        reg.register(1111, "first");
        reg.mark_dead(1111);
        reg.register(1111, "second");

        let dead = reg.reap_dead(|_| false);
        assert_eq!(dead, vec![(1111, "second")]);
    }
}
