//! Scheduler subsystem
//!
//! One [`Scheduler`] per core. Every ready context takes part in two
//! schedules at once:
//!
//! - **Claims**: contexts with a non-zero quota, grouped by priority. The
//!   highest-priority context with quota left runs first; within a priority
//!   the one that became ready first wins. A context that used up its quota
//!   moves to the back of its priority band with nothing left.
//! - **Fills**: all ready contexts in one round-robin queue, each getting
//!   `fill_slice` ticks at a time. Fills only run when no claim is left.
//!
//! Consumed time also drains the super period. When the super period ends,
//! every quota is refilled, which bounds how long any context can be kept
//! from its claim.

mod thread;

pub use thread::{
    RegisterState, SchedContext, Thread, ThreadId, ThreadState, REGISTER_ARGS,
};

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Scheduling priority, 0 is the lowest
pub type Priority = u8;

#[derive(Clone, Copy, Debug)]
struct Share {
    priority: Priority,
    quota: u64,
    claim: u64,
    fill: u64,
    ready: bool,
}

/// Per-core CPU scheduler
pub struct Scheduler {
    shares: HashMap<ThreadId, Share>,
    claims: Vec<VecDeque<ThreadId>>,
    fills: VecDeque<ThreadId>,
    head: Option<ThreadId>,
    head_claims: bool,
    head_yields: bool,
    residual: u64,
    super_period: u64,
    fill_slice: u64,
    need_to_schedule: bool,
}

impl Scheduler {
    /// Create a scheduler with `priorities` levels
    pub fn new(priorities: u8, super_period: u64, fill_slice: u64) -> Self {
        Self {
            shares: HashMap::new(),
            claims: (0..priorities.max(1)).map(|_| VecDeque::new()).collect(),
            fills: VecDeque::new(),
            head: None,
            head_claims: false,
            head_yields: false,
            residual: super_period,
            super_period,
            fill_slice,
            need_to_schedule: true,
        }
    }

    /// Register a context, initially not ready
    pub fn insert(&mut self, thread: ThreadId, context: SchedContext) {
        let priority = context.priority.min(self.top_priority());
        self.shares.insert(
            thread,
            Share {
                priority,
                quota: context.quota,
                claim: context.quota,
                fill: self.fill_slice,
                ready: false,
            },
        );
    }

    /// Forget a context
    pub fn remove(&mut self, thread: ThreadId) {
        self.unready(thread);
        self.shares.remove(&thread);
        if self.head == Some(thread) {
            self.head = None;
            self.need_to_schedule = true;
        }
    }

    /// Whether a context is registered here
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.shares.contains_key(&thread)
    }

    /// Make a context ready.
    ///
    /// Returns whether the current head is outdated by this.
    pub fn ready(&mut self, thread: ThreadId) -> bool {
        let Some(share) = self.shares.get_mut(&thread) else {
            return false;
        };
        if share.ready {
            return false;
        }
        share.ready = true;
        let share = *share;

        self.fills.push_back(thread);
        if share.quota > 0 {
            self.claims[share.priority as usize].push_back(thread);
        }

        let outdated = match self.head.and_then(|h| self.shares.get(&h)) {
            None => true,
            Some(_) if share.claim == 0 => false,
            Some(head) => !self.head_claims || head.priority < share.priority,
        };
        if outdated {
            self.need_to_schedule = true;
        }
        outdated
    }

    /// Take a context out of the ready queues
    pub fn unready(&mut self, thread: ThreadId) {
        let Some(share) = self.shares.get_mut(&thread) else {
            return;
        };
        if !share.ready {
            return;
        }
        share.ready = false;
        let priority = share.priority as usize;

        self.fills.retain(|&t| t != thread);
        self.claims[priority].retain(|&t| t != thread);
        if self.head == Some(thread) {
            self.need_to_schedule = true;
        }
    }

    /// Whether a context is in the ready queues
    pub fn is_ready(&self, thread: ThreadId) -> bool {
        self.shares.get(&thread).is_some_and(|s| s.ready)
    }

    /// Let the current head give up the rest of its slice
    pub fn yield_head(&mut self) {
        if self.head.is_some() {
            self.head_yields = true;
            self.need_to_schedule = true;
        }
    }

    /// Change the quota of a context.
    ///
    /// Remaining claim in this super period is capped by the new quota.
    pub fn set_quota(&mut self, thread: ThreadId, quota: u64) {
        let Some(share) = self.shares.get_mut(&thread) else {
            return;
        };
        share.quota = quota;
        share.claim = share.claim.min(quota);
        let (priority, ready) = (share.priority as usize, share.ready);

        if ready {
            let band = &mut self.claims[priority];
            let queued = band.contains(&thread);
            if quota == 0 && queued {
                band.retain(|&t| t != thread);
            } else if quota > 0 && !queued {
                band.push_back(thread);
            }
        }
        self.need_to_schedule = true;
    }

    /// Account `consumed` ticks to the head and choose the next head.
    pub fn update(&mut self, consumed: u64) {
        if let Some(head) = self.head {
            self.account(head, consumed);
        }
        self.head_yields = false;

        if consumed >= self.residual {
            self.residual = self.super_period;
            for share in self.shares.values_mut() {
                share.claim = share.quota;
            }
            log::trace!("super period elapsed, quotas refilled");
        } else {
            self.residual -= consumed;
        }

        self.choose();
        self.need_to_schedule = false;
    }

    fn account(&mut self, head: ThreadId, consumed: u64) {
        let fill_slice = self.fill_slice;
        let yields = self.head_yields;
        let Some(share) = self.shares.get_mut(&head) else {
            return;
        };

        if self.head_claims {
            share.claim = share.claim.saturating_sub(consumed);
            if share.claim == 0 || yields {
                share.claim = 0;
                if share.ready && share.quota > 0 {
                    let band = &mut self.claims[share.priority as usize];
                    band.retain(|&t| t != head);
                    band.push_back(head);
                }
            }
        } else {
            share.fill = share.fill.saturating_sub(consumed);
            if share.fill == 0 || yields {
                share.fill = fill_slice;
                if share.ready {
                    self.fills.retain(|&t| t != head);
                    self.fills.push_back(head);
                }
            }
        }
    }

    fn choose(&mut self) {
        let claim = self.claims.iter().rev().find_map(|band| {
            band.iter()
                .copied()
                .find(|t| self.shares.get(t).is_some_and(|s| s.claim > 0))
        });

        let (head, claims) = match claim {
            Some(thread) => (Some(thread), true),
            None => (self.fills.front().copied(), false),
        };
        if head != self.head {
            log::trace!("head {:?} -> {:?} (claim: {claims})", self.head, head);
        }
        self.head = head;
        self.head_claims = claims;
    }

    /// Context chosen by the last update, `None` means idle
    pub fn head(&self) -> Option<ThreadId> {
        self.head
    }

    /// Whether the head runs on its quota
    pub fn head_claims(&self) -> bool {
        self.head_claims
    }

    /// Remaining claim or fill slice of the head
    pub fn head_quota(&self) -> u64 {
        let Some(share) = self.head.and_then(|h| self.shares.get(&h)) else {
            return self.residual;
        };
        if self.head_claims {
            share.claim
        } else {
            share.fill
        }
    }

    /// Ticks until the next forced scheduling decision
    pub fn current_time_left(&self) -> u64 {
        self.head_quota().min(self.residual)
    }

    /// Ticks left in the current super period
    pub fn residual(&self) -> u64 {
        self.residual
    }

    /// Whether the head may be outdated
    pub fn need_to_schedule(&self) -> bool {
        self.need_to_schedule
    }

    /// Request a new decision on the next update
    pub fn timeout(&mut self) {
        self.need_to_schedule = true;
    }

    /// Remaining claim of a context in this super period
    pub fn claim_left(&self, thread: ThreadId) -> Option<u64> {
        self.shares.get(&thread).map(|s| s.claim)
    }

    /// Number of ready contexts
    pub fn ready_count(&self) -> usize {
        self.fills.len()
    }

    /// Ready contexts in round-robin order
    pub fn ready_threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.fills.iter().copied()
    }

    fn top_priority(&self) -> Priority {
        (self.claims.len() - 1) as Priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::ObjectId;

    fn t(n: u32) -> ThreadId {
        ObjectId::new(n, 0)
    }

    fn ctx(priority: u8, quota: u64) -> SchedContext {
        SchedContext { priority, quota }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(4, 1000, 100)
    }

    #[test]
    fn test_idle_without_contexts() {
        let mut s = scheduler();
        s.update(10);
        assert_eq!(s.head(), None);
        assert_eq!(s.residual(), 990);
    }

    #[test]
    fn test_claim_beats_fill() {
        let mut s = scheduler();
        s.insert(t(1), ctx(0, 0));
        s.insert(t(2), ctx(1, 200));
        s.ready(t(1));
        s.ready(t(2));
        s.update(0);

        assert_eq!(s.head(), Some(t(2)));
        assert!(s.head_claims());
        assert_eq!(s.head_quota(), 200);
    }

    #[test]
    fn test_higher_priority_claim_first() {
        let mut s = scheduler();
        s.insert(t(1), ctx(1, 100));
        s.insert(t(2), ctx(3, 100));
        s.ready(t(1));
        s.ready(t(2));
        s.update(0);
        assert_eq!(s.head(), Some(t(2)));
    }

    #[test]
    fn test_equal_priority_is_fifo_by_readiness() {
        let mut s = scheduler();
        s.insert(t(1), ctx(2, 100));
        s.insert(t(2), ctx(2, 100));
        s.ready(t(2));
        s.ready(t(1));
        s.update(0);
        assert_eq!(s.head(), Some(t(2)));
    }

    #[test]
    fn test_exhausted_claim_moves_to_back() {
        let mut s = scheduler();
        s.insert(t(1), ctx(2, 100));
        s.insert(t(2), ctx(2, 50));
        s.ready(t(1));
        s.ready(t(2));

        s.update(0);
        assert_eq!(s.head(), Some(t(1)));
        s.update(100);
        assert_eq!(s.head(), Some(t(2)));
        assert_eq!(s.claim_left(t(1)), Some(0));
        s.update(50);
        // both claims used up, fills take over in ready order
        assert_eq!(s.head(), Some(t(1)));
        assert!(!s.head_claims());
        assert_eq!(s.head_quota(), 100);
    }

    #[test]
    fn test_fills_round_robin() {
        let mut s = scheduler();
        for n in 1..=3 {
            s.insert(t(n), ctx(0, 0));
            s.ready(t(n));
        }
        s.update(0);
        assert_eq!(s.head(), Some(t(1)));
        s.update(100);
        assert_eq!(s.head(), Some(t(2)));
        s.update(40);
        assert_eq!(s.head(), Some(t(2)));
        assert_eq!(s.head_quota(), 60);
        s.update(60);
        assert_eq!(s.head(), Some(t(3)));
        s.update(100);
        assert_eq!(s.head(), Some(t(1)));
    }

    #[test]
    fn test_super_period_refills_quota() {
        let mut s = scheduler();
        s.insert(t(1), ctx(1, 100));
        s.insert(t(2), ctx(0, 0));
        s.ready(t(1));
        s.ready(t(2));

        s.update(0);
        s.update(100);
        assert_eq!(s.head(), Some(t(1)));
        assert!(!s.head_claims());

        // burn the rest of the super period
        s.update(900);
        assert_eq!(s.residual(), 1000);
        assert_eq!(s.claim_left(t(1)), Some(100));
        assert_eq!(s.head(), Some(t(1)));
        assert!(s.head_claims());
    }

    #[test]
    fn test_ready_outdates_fill_head() {
        let mut s = scheduler();
        s.insert(t(1), ctx(0, 0));
        s.insert(t(2), ctx(0, 100));
        s.ready(t(1));
        s.update(0);
        assert_eq!(s.head(), Some(t(1)));

        assert!(s.ready(t(2)));
        assert!(s.need_to_schedule());
        s.update(10);
        assert_eq!(s.head(), Some(t(2)));
    }

    #[test]
    fn test_ready_lower_claim_keeps_head() {
        let mut s = scheduler();
        s.insert(t(1), ctx(3, 100));
        s.insert(t(2), ctx(1, 100));
        s.ready(t(1));
        s.update(0);
        assert!(!s.ready(t(2)));
        assert!(!s.need_to_schedule());
    }

    #[test]
    fn test_unready_head_forces_decision() {
        let mut s = scheduler();
        s.insert(t(1), ctx(1, 100));
        s.insert(t(2), ctx(0, 0));
        s.ready(t(1));
        s.ready(t(2));
        s.update(0);

        s.unready(t(1));
        assert!(s.need_to_schedule());
        s.update(10);
        assert_eq!(s.head(), Some(t(2)));
        assert_eq!(s.claim_left(t(1)), Some(90));
    }

    #[test]
    fn test_yield_gives_up_claim() {
        let mut s = scheduler();
        s.insert(t(1), ctx(1, 100));
        s.insert(t(2), ctx(1, 100));
        s.ready(t(1));
        s.ready(t(2));
        s.update(0);
        assert_eq!(s.head(), Some(t(1)));

        s.yield_head();
        s.update(10);
        assert_eq!(s.head(), Some(t(2)));
        assert_eq!(s.claim_left(t(1)), Some(0));
    }

    #[test]
    fn test_set_quota_caps_claim() {
        let mut s = scheduler();
        s.insert(t(1), ctx(1, 100));
        s.ready(t(1));
        s.set_quota(t(1), 30);
        s.update(0);
        assert_eq!(s.head_quota(), 30);

        s.set_quota(t(1), 0);
        s.update(0);
        assert!(!s.head_claims());
    }

    #[test]
    fn test_remove_head() {
        let mut s = scheduler();
        s.insert(t(1), ctx(0, 0));
        s.ready(t(1));
        s.update(0);
        s.remove(t(1));
        assert_eq!(s.head(), None);
        assert!(!s.contains(t(1)));
        s.update(0);
        assert_eq!(s.head(), None);
    }

    #[test]
    fn test_priority_clamped_to_levels() {
        let mut s = scheduler();
        s.insert(t(1), ctx(200, 100));
        s.insert(t(2), ctx(3, 100));
        s.ready(t(2));
        s.ready(t(1));
        s.update(0);
        // clamped to the top band, behind t(2) in ready order
        assert_eq!(s.head(), Some(t(2)));
    }
}
