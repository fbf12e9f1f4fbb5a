//! Wait queue infrastructure for blocking kernel entries
//!
//! Provides the one mechanism by which a process sleeps waiting for an
//! event and is woken by another process, a timer, or signal delivery:
//!
//! - `wait()` parks the current PCB on a queue and yields
//! - `wake_first()` / `wake_all()` release waiters in FIFO order
//! - `wake()` is the single path by which any blocked PCB becomes
//!   runnable again, regardless of what it was blocked on
//!
//! Queues hold PCB identifiers, never pointers; membership is recorded on
//! the PCB (`waiting_on`) and checked by lookup, so a reaped slot can
//! never leave a dangling queue entry behind. A PCB is on at most one
//! queue, and the blocking reason is implicit in which queue that is.
//!
//! There is no predicate re-check and there are no spurious wakeups:
//! every wake is meaningful and exactly one-shot per PCB.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::pcb::{PcbState, Pid};
use crate::sched::Dispatcher;
use crate::syscall::Completion;
use crate::uaccess::UserMem;

/// Handle naming one wait queue in the dispatcher's queue table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct WaitQueueId(u32);

impl WaitQueueId {
    /// Placeholder for a PCB whose queues are not yet allocated
    pub const INVALID: Self = Self(u32::MAX);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordered set of PCBs blocked for the same reason
///
/// Insertion order is the wake order.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Pid>,
}

impl WaitQueue {
    /// Create an empty wait queue
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Append a waiter at the tail
    pub fn push_back(&mut self, pid: Pid) {
        debug_assert!(
            !self.waiters.contains(&pid),
            "double-enqueue of pid {}",
            pid.raw()
        );
        self.waiters.push_back(pid);
    }

    /// Earliest-blocked waiter, if any
    pub fn front(&self) -> Option<Pid> {
        self.waiters.front().copied()
    }

    /// Remove a specific waiter; true if it was present
    pub fn remove(&mut self, pid: Pid) -> bool {
        if let Some(pos) = self.waiters.iter().position(|&p| p == pid) {
            self.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Number of waiters
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Waiters in wake order
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.waiters.iter().copied()
    }
}

/// Table of wait queues, slab-allocated alongside the PCB arena
///
/// Each live PCB owns a fixed set of queues (receive, sigwait, sleep,
/// reply) allocated at creation and freed at reap.
pub struct WaitQueueTable {
    queues: Vec<Option<WaitQueue>>,
}

impl WaitQueueTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Allocate an empty queue
    pub fn alloc(&mut self) -> WaitQueueId {
        if let Some(idx) = self.queues.iter().position(|q| q.is_none()) {
            self.queues[idx] = Some(WaitQueue::new());
            WaitQueueId(idx as u32)
        } else {
            self.queues.push(Some(WaitQueue::new()));
            WaitQueueId((self.queues.len() - 1) as u32)
        }
    }

    /// Free a queue; it must already be empty
    pub fn free(&mut self, id: WaitQueueId) {
        debug_assert!(
            self.get(id).is_empty(),
            "freeing non-empty wait queue {:?}",
            id
        );
        self.queues[id.index()] = None;
    }

    /// Borrow a queue
    pub fn get(&self, id: WaitQueueId) -> &WaitQueue {
        self.queues[id.index()]
            .as_ref()
            .expect("stale wait queue id")
    }

    /// Borrow a queue for mutation
    pub fn get_mut(&mut self, id: WaitQueueId) -> &mut WaitQueue {
        self.queues[id.index()]
            .as_mut()
            .expect("stale wait queue id")
    }
}

impl Default for WaitQueueTable {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: UserMem> Dispatcher<M> {
    /// Park the current process on `queue` and give up the CPU
    ///
    /// The PCB goes RUNNING -> BLOCKED atomically under the dispatcher
    /// lock; the blocking call's eventual return value arrives through
    /// `wait_result` when some wake path resumes it.
    pub(crate) fn wait(&mut self, queue: WaitQueueId) -> Completion {
        let pid = self.take_current("wait");
        let pcb = self
            .table
            .get_mut(pid)
            .expect("current pid not in PCB table");
        pcb.transition(PcbState::Blocked);
        pcb.waiting_on = Some(queue);
        self.queues.get_mut(queue).push_back(pid);
        Completion::Blocked
    }

    /// Make a blocked PCB runnable, delivering `rc` to its pending call
    ///
    /// This is the sole path from BLOCKED back to READY, shared by timer
    /// expiry, IPC reply, and signal delivery. Idempotent: a PCB already
    /// READY or RUNNING is left alone and never re-enqueued.
    pub fn wake(&mut self, pid: Pid, rc: i64) {
        let Some(pcb) = self.table.get_mut(pid) else {
            // Dead or stale target; a late timer may legitimately land here
            return;
        };
        match pcb.state {
            PcbState::Ready | PcbState::Running => {}
            PcbState::Blocked => {
                let queue = pcb
                    .waiting_on
                    .take()
                    .expect("blocked PCB is on no wait queue");
                pcb.wait_result = rc;
                let was_queued = self.queues.get_mut(queue).remove(pid);
                debug_assert!(was_queued, "blocked PCB missing from its queue");
                self.ready(pid);
            }
            other => {
                debug_assert!(false, "wake of PCB in state {:?}", other);
            }
        }
    }

    /// Wake the earliest waiter on `queue`; true if one was woken
    pub fn wake_first(&mut self, queue: WaitQueueId, rc: i64) -> bool {
        match self.queues.get(queue).front() {
            Some(pid) => {
                self.wake(pid, rc);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter on `queue` in queue order, each with `rc`
    ///
    /// Returns the number of processes woken.
    pub fn wake_all(&mut self, queue: WaitQueueId, rc: i64) -> usize {
        let mut woken = 0;
        while let Some(pid) = self.queues.get(queue).front() {
            self.wake(pid, rc);
            woken += 1;
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::Context;
    use crate::uaccess::FlatMem;

    /// Spawn three processes and park them on one shared queue
    fn parked_three(
        d: &mut Dispatcher<FlatMem>,
    ) -> (WaitQueueId, Pid, Pid, Pid) {
        let a = d.spawn(Context::default(), None).unwrap();
        let b = d.spawn(Context::default(), None).unwrap();
        let c = d.spawn(Context::default(), None).unwrap();
        let queue = d.queues.alloc();
        for pid in [a, b, c] {
            while d.schedule() != Some(pid) {}
            assert_eq!(d.wait(queue), Completion::Blocked);
        }
        (queue, a, b, c)
    }

    #[test]
    fn test_wake_first_releases_in_block_order() {
        let mut d = Dispatcher::new(FlatMem::new(8, 64));
        let (queue, a, b, c) = parked_three(&mut d);

        assert!(d.wake_first(queue, 5));
        assert_eq!(d.pcb(a).unwrap().state, PcbState::Ready);
        assert_eq!(d.pcb(a).unwrap().wait_result, 5);
        assert_eq!(d.pcb(b).unwrap().state, PcbState::Blocked);

        assert!(d.wake_first(queue, 6));
        assert_eq!(d.pcb(b).unwrap().wait_result, 6);
        assert!(d.wake_first(queue, 7));
        assert!(!d.wake_first(queue, 8));
        assert_eq!(d.pcb(c).unwrap().wait_result, 7);
    }

    #[test]
    fn test_wake_all_same_rc_in_queue_order() {
        let mut d = Dispatcher::new(FlatMem::new(8, 64));
        let (queue, a, b, c) = parked_three(&mut d);

        assert_eq!(d.wake_all(queue, -9), 3);
        assert!(d.queues.get(queue).is_empty());
        let tail: Vec<Pid> = d
            .run_queue_snapshot()
            .into_iter()
            .filter(|p| [a, b, c].contains(p))
            .collect();
        assert_eq!(tail, vec![a, b, c]);
        for pid in [a, b, c] {
            let pcb = d.pcb(pid).unwrap();
            assert_eq!(pcb.state, PcbState::Ready);
            assert_eq!(pcb.wait_result, -9);
        }
        assert_eq!(d.wake_all(queue, 0), 0);
    }

    #[test]
    fn test_fifo_order() {
        let mut q = WaitQueue::new();
        let a = Pid::from_parts(1, 0);
        let b = Pid::from_parts(2, 0);
        let c = Pid::from_parts(3, 0);
        q.push_back(a);
        q.push_back(b);
        q.push_back(c);
        assert_eq!(q.front(), Some(a));
        assert!(q.remove(a));
        assert_eq!(q.front(), Some(b));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_remove_absent_is_false() {
        let mut q = WaitQueue::new();
        q.push_back(Pid::from_parts(1, 0));
        assert!(!q.remove(Pid::from_parts(9, 0)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_table_alloc_free_reuses_slots() {
        let mut table = WaitQueueTable::new();
        let a = table.alloc();
        let b = table.alloc();
        assert_ne!(a, b);
        table.free(a);
        let c = table.alloc();
        assert_eq!(a, c);
    }
}
