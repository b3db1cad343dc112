// SPDX-License-Identifier: BSD-3-Clause

//! Process & Thread Lifecycle (C9) plus the Looper Controller's (C7) state
//! that lives on each thread record.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use binder_queue::Queue;

use crate::registry::ObjectTable;
use crate::wire::{on_drop_queue_msg, QueueMsg, Transaction};

/// Looper state machine (spec §4.7). `Ready` is part of the data model's
/// enumeration but the spec never describes a transition that reaches it
/// distinctly from `Entered`; DESIGN.md records this as resolved by
/// treating `Ready` as a synonym of `Entered` for the purposes of the gate
/// checks below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperState {
    Invalid,
    Registered,
    Entered,
}

/// Returned when a looper transition is invalid in the current state; the
/// caller turns this into a `BR_FAILED_REPLY` delivered on the thread's own
/// inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LooperTransitionFailed;

struct ThreadTxState {
    pending_replies: i64,
    /// LIFO stack of synchronous incoming transactions this thread still
    /// owes a reply for; push/pop at the end.
    incoming: Vec<Transaction>,
}

/// One thread that has ever called into the device for its process.
pub struct Thread {
    pub pid: u32,
    pub queue: Queue<QueueMsg>,
    pub non_block: bool,
    looper_state: Mutex<LooperState>,
    tx: Mutex<ThreadTxState>,
}

impl Thread {
    fn new(pid: u32, non_block: bool) -> Self {
        Thread {
            pid,
            queue: Queue::create(64, non_block, on_drop_queue_msg),
            non_block,
            looper_state: Mutex::new(LooperState::Invalid),
            tx: Mutex::new(ThreadTxState {
                pending_replies: 0,
                incoming: Vec::new(),
            }),
        }
    }

    pub fn looper_state(&self) -> LooperState {
        *self.looper_state.lock().unwrap()
    }

    pub fn register_looper(&self, pending_loopers: &AtomicU32) {
        *self.looper_state.lock().unwrap() = LooperState::Registered;
        let _ = pending_loopers.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        });
    }

    pub fn enter_looper(&self, num_loopers: &AtomicU32) -> Result<(), LooperTransitionFailed> {
        let mut state = self.looper_state.lock().unwrap();
        if *state == LooperState::Entered {
            return Err(LooperTransitionFailed);
        }
        *state = LooperState::Entered;
        num_loopers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn exit_looper(&self, num_loopers: &AtomicU32) -> Result<(), LooperTransitionFailed> {
        let mut state = self.looper_state.lock().unwrap();
        if *state != LooperState::Entered {
            return Err(LooperTransitionFailed);
        }
        *state = LooperState::Registered;
        num_loopers.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn pending_replies(&self) -> i64 {
        self.tx.lock().unwrap().pending_replies
    }

    pub fn incr_pending_replies(&self) {
        self.tx.lock().unwrap().pending_replies += 1;
    }

    pub fn decr_pending_replies(&self) {
        let mut tx = self.tx.lock().unwrap();
        tx.pending_replies -= 1;
        debug_assert!(tx.pending_replies >= 0);
    }

    pub fn push_incoming(&self, transaction: Transaction) {
        self.tx.lock().unwrap().incoming.push(transaction);
    }

    pub fn pop_incoming(&self) -> Option<Transaction> {
        self.tx.lock().unwrap().incoming.pop()
    }

    pub fn has_incoming(&self) -> bool {
        !self.tx.lock().unwrap().incoming.is_empty()
    }
}

/// One open file descriptor's worth of state (spec §3).
pub struct Process {
    pub pid: u32,
    pub euid: u32,
    pub queue: Queue<QueueMsg>,
    pub non_block: bool,
    pub objects: ObjectTable,
    threads: Mutex<BTreeMap<u32, std::sync::Arc<Thread>>>,
    max_threads: AtomicU32,
    num_loopers: AtomicU32,
    pending_loopers: AtomicU32,
}

impl Process {
    pub fn new(pid: u32, euid: u32, non_block: bool) -> std::sync::Arc<Self> {
        let queue = Queue::create(256, non_block, on_drop_queue_msg);
        let owner = queue.id();
        std::sync::Arc::new(Process {
            pid,
            euid,
            queue,
            non_block,
            objects: ObjectTable::new(owner),
            threads: Mutex::new(BTreeMap::new()),
            max_threads: AtomicU32::new(0),
            num_loopers: AtomicU32::new(0),
            pending_loopers: AtomicU32::new(0),
        })
    }

    pub fn set_max_threads(&self, n: u32) {
        self.max_threads.store(n, Ordering::SeqCst);
    }

    pub fn max_threads(&self) -> u32 {
        self.max_threads.load(Ordering::SeqCst)
    }

    pub fn num_loopers(&self) -> u32 {
        self.num_loopers.load(Ordering::SeqCst)
    }

    pub fn pending_loopers(&self) -> u32 {
        self.pending_loopers.load(Ordering::SeqCst)
    }

    pub fn num_loopers_atomic(&self) -> &AtomicU32 {
        &self.num_loopers
    }

    pub fn pending_loopers_atomic(&self) -> &AtomicU32 {
        &self.pending_loopers
    }

    pub fn inc_pending_loopers(&self) {
        self.pending_loopers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the thread record for `pid`, creating it lazily on first
    /// contact (spec §3 lifecycle note).
    pub fn thread(&self, pid: u32) -> std::sync::Arc<Thread> {
        let mut threads = self.threads.lock().unwrap();
        threads
            .entry(pid)
            .or_insert_with(|| std::sync::Arc::new(Thread::new(pid, self.non_block)))
            .clone()
    }

    pub fn find_thread(&self, pid: u32) -> Option<std::sync::Arc<Thread>> {
        self.threads.lock().unwrap().get(&pid).cloned()
    }

    /// Tears down one thread's record: removes it from the process's
    /// thread table and drains its inbox (spec §9's resolution of the
    /// `cmd_thread_exit` open question).
    pub fn thread_exit(&self, pid: u32) {
        if let Some(thread) = self.threads.lock().unwrap().remove(&pid) {
            thread.queue.close_and_drain();
        }
    }

    /// All thread records, for teardown.
    pub fn all_threads(&self) -> Vec<std::sync::Arc<Thread>> {
        self.threads.lock().unwrap().values().cloned().collect()
    }
}
