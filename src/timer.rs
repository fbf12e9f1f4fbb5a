//! Tick-driven timer infrastructure
//!
//! Backs `sleep` (wake the owner after a delay) and `alarm` (raise
//! SIGALRM in the owner after a delay). Timers are one-shot: the clock
//! interrupt calls `tick()` once per tick, and every armed timer whose
//! expiry has been reached fires exactly once. Firing order among timers
//! expiring on the same tick is unspecified.
//!
//! Actions are tagged variants naming the dispatcher operation to run,
//! not bare callables; the dispatcher applies them after detaching the
//! fired timers, the same collect-then-fire shape the clock interrupt
//! wants (no action runs while the pending list is being walked).

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::pcb::Pid;
use crate::sched::Dispatcher;
use crate::uaccess::UserMem;

/// Ticks per second; `sleep` takes milliseconds, so one tick is 1 ms
pub const TICK_HZ: u64 = 1000;

/// Timer handle for referencing a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Invalid/null timer handle
    pub const NULL: Self = Self(0);

    /// Check if handle is valid
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

bitflags! {
    /// Timer behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerFlags: u32 {
        /// Run the action synchronously when the timer is destroyed
        /// before expiry
        const FIRE_ON_DESTROY = 1 << 0;
        /// The creating component embeds this timer in its own state;
        /// recorded for teardown bookkeeping
        const CALLER_OWNED = 1 << 1;
        /// Timer is in the pending set and will fire at `expires`
        const ARMED = 1 << 2;
    }
}

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Resume a blocked process with `rc` (sleep expiry)
    Wake { pid: Pid, rc: i64 },
    /// Post a signal to a process (alarm expiry)
    Raise { pid: Pid, signo: u32 },
}

impl TimerAction {
    /// The process this timer is armed on behalf of
    pub fn owner(&self) -> Pid {
        match *self {
            TimerAction::Wake { pid, .. } => pid,
            TimerAction::Raise { pid, .. } => pid,
        }
    }
}

/// A registered timer
#[derive(Debug, Clone)]
pub struct Timer {
    /// Unique handle for identification
    pub handle: TimerHandle,
    /// Absolute expiration tick (meaningful while armed)
    pub expires: u64,
    /// Action to run on expiration
    pub action: TimerAction,
    /// Behavior flags, including the armed bit
    pub flags: TimerFlags,
}

/// The pending-timer list and the tick clock
pub struct TimerList {
    /// Current tick count
    now: u64,
    /// Next handle value to mint
    next_id: u64,
    /// All registered timers, armed or dormant
    timers: Vec<Timer>,
}

impl TimerList {
    /// Create an empty list at tick zero
    pub fn new() -> Self {
        Self {
            now: 0,
            next_id: 1,
            timers: Vec::new(),
        }
    }

    /// Current tick count
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Register a dormant timer
    pub fn create(&mut self, action: TimerAction, flags: TimerFlags) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.timers.push(Timer {
            handle,
            expires: 0,
            action,
            flags: flags - TimerFlags::ARMED,
        });
        handle
    }

    /// Arm a timer to fire `delta` ticks from now; false if the handle
    /// is stale
    pub fn start(&mut self, handle: TimerHandle, delta: u64) -> bool {
        let now = self.now;
        match self.timers.iter_mut().find(|t| t.handle == handle) {
            Some(t) => {
                // Saturate so an absurd delta parks at the end of time
                // instead of wrapping to an already-expired tick
                t.expires = now.saturating_add(delta);
                t.flags.insert(TimerFlags::ARMED);
                true
            }
            None => false,
        }
    }

    /// Look up a registered timer
    pub fn get(&self, handle: TimerHandle) -> Option<&Timer> {
        self.timers.iter().find(|t| t.handle == handle)
    }

    /// Unregister a timer without firing it
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<Timer> {
        let pos = self.timers.iter().position(|t| t.handle == handle)?;
        Some(self.timers.remove(pos))
    }

    /// Ticks remaining until an armed timer fires
    pub fn remaining(&self, handle: TimerHandle) -> Option<u64> {
        self.timers
            .iter()
            .find(|t| t.handle == handle && t.flags.contains(TimerFlags::ARMED))
            .map(|t| t.expires.saturating_sub(self.now))
    }

    /// Advance the clock one tick and extract everything that expired
    ///
    /// Extracted timers are disarmed and removed before any action runs,
    /// which is what makes each firing exactly-once.
    pub fn advance(&mut self) -> Vec<Timer> {
        self.now += 1;
        let now = self.now;
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].flags.contains(TimerFlags::ARMED) && self.timers[i].expires <= now {
                let mut t = self.timers.remove(i);
                t.flags.remove(TimerFlags::ARMED);
                fired.push(t);
            } else {
                i += 1;
            }
        }
        fired
    }

    /// Number of registered timers
    pub fn count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: UserMem> Dispatcher<M> {
    /// Allocate a dormant timer
    pub fn timer_create(&mut self, action: TimerAction, flags: TimerFlags) -> TimerHandle {
        self.timers.create(action, flags)
    }

    /// Arm a timer `delta_ticks` from now and charge it to its owner
    pub fn timer_start(&mut self, handle: TimerHandle, delta_ticks: u64) -> bool {
        let owner = match self.timers.get(handle) {
            Some(timer) => timer.action.owner(),
            None => return false,
        };
        if !self.timers.start(handle, delta_ticks) {
            return false;
        }
        if let Some(pcb) = self.table.get_mut(owner) {
            if !pcb.timers.contains(&handle) {
                pcb.timers.push(handle);
            }
        }
        true
    }

    /// Destroy a timer; honors `FIRE_ON_DESTROY` by running the action
    /// synchronously before returning
    pub fn timer_destroy(&mut self, handle: TimerHandle) -> bool {
        match self.timers.cancel(handle) {
            Some(timer) => {
                self.detach_timer(handle, timer.action.owner());
                if timer.flags.contains(TimerFlags::FIRE_ON_DESTROY) {
                    self.apply_timer_action(timer.action);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a timer so it never fires, regardless of flags
    ///
    /// Used when the timer's owner is being torn down for other reasons,
    /// e.g. a signal interrupting a sleep.
    pub fn timer_remove(&mut self, handle: TimerHandle) -> bool {
        match self.timers.cancel(handle) {
            Some(timer) => {
                self.detach_timer(handle, timer.action.owner());
                true
            }
            None => false,
        }
    }

    /// Clock interrupt: advance one tick and fire expired timers
    pub fn tick(&mut self) {
        let fired = self.timers.advance();
        for timer in fired {
            self.detach_timer(timer.handle, timer.action.owner());
            self.apply_timer_action(timer.action);
        }
    }

    /// Current tick count
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// Drop bookkeeping links from the owner PCB to a fired or
    /// cancelled timer
    fn detach_timer(&mut self, handle: TimerHandle, owner: Pid) {
        if let Some(pcb) = self.table.get_mut(owner) {
            pcb.timers.retain(|&h| h != handle);
            if pcb.sleep_timer == Some(handle) {
                pcb.sleep_timer = None;
            }
            if pcb.alarm_timer == Some(handle) {
                pcb.alarm_timer = None;
            }
        }
    }

    fn apply_timer_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::Wake { pid, rc } => self.wake(pid, rc),
            TimerAction::Raise { pid, signo } => {
                // A late alarm against a reaped slot is not an error
                let _ = self.raise(pid, signo);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_parts(1, 0)
    }

    #[test]
    fn test_fires_exactly_once_at_expiry() {
        let mut list = TimerList::new();
        let h = list.create(
            TimerAction::Wake { pid: pid(), rc: 0 },
            TimerFlags::empty(),
        );
        assert!(list.start(h, 3));

        assert!(list.advance().is_empty()); // tick 1
        assert!(list.advance().is_empty()); // tick 2
        let fired = list.advance(); // tick 3
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].handle, h);
        assert!(list.advance().is_empty()); // never again
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn test_dormant_timer_never_fires() {
        let mut list = TimerList::new();
        let _h = list.create(
            TimerAction::Wake { pid: pid(), rc: 0 },
            TimerFlags::empty(),
        );
        for _ in 0..10 {
            assert!(list.advance().is_empty());
        }
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn test_cancel_before_expiry() {
        let mut list = TimerList::new();
        let h = list.create(
            TimerAction::Raise {
                pid: pid(),
                signo: 14,
            },
            TimerFlags::empty(),
        );
        list.start(h, 2);
        assert!(list.cancel(h).is_some());
        assert!(list.advance().is_empty());
        assert!(list.advance().is_empty());
        assert!(list.cancel(h).is_none());
    }

    #[test]
    fn test_same_tick_multiple_expiry() {
        let mut list = TimerList::new();
        let h1 = list.create(
            TimerAction::Wake { pid: pid(), rc: 1 },
            TimerFlags::empty(),
        );
        let h2 = list.create(
            TimerAction::Wake { pid: pid(), rc: 2 },
            TimerFlags::empty(),
        );
        list.start(h1, 1);
        list.start(h2, 1);
        let fired = list.advance();
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_huge_delta_saturates_instead_of_wrapping() {
        let mut list = TimerList::new();
        list.advance();
        let h = list.create(
            TimerAction::Wake { pid: pid(), rc: 0 },
            TimerFlags::empty(),
        );
        assert!(list.start(h, u64::MAX));
        // A wrapped expiry would fire right away
        for _ in 0..10 {
            assert!(list.advance().is_empty());
        }
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn test_remaining() {
        let mut list = TimerList::new();
        let h = list.create(
            TimerAction::Wake { pid: pid(), rc: 0 },
            TimerFlags::empty(),
        );
        list.start(h, 5);
        assert_eq!(list.remaining(h), Some(5));
        list.advance();
        assert_eq!(list.remaining(h), Some(4));
    }
}
