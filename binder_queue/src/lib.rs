// SPDX-License-Identifier: BSD-3-Clause

//! A bounded, blocking, refcounted FIFO used as the transport between a
//! binder process/thread and the core engine (spec §6.2).
//!
//! This plays the role the real driver gets from the kernel's generic wait
//! queue plus a linked list of pending transactions: callers `write`/
//! `write_head` entries onto a queue, and block in `read` until one shows
//! up or the queue is closed. Refcounting is just `Queue<T>: Clone`
//! (`get`/`put` in the spec's vocabulary) backed by `Arc`; closing is a
//! separate, explicit state transition so a process can tear down its
//! queue while other processes still hold live references to it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

/// Stable, comparable, process-unique identity for a queue, realized here
/// as the address of its backing allocation. See DESIGN.md for the
/// "pointer as identity" resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue@{:#x}", self.0)
    }
}

/// Returned by a blocking operation that would otherwise need to wait on a
/// non-blocking queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

/// Returned when a write is attempted against a queue that has already been
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Result of a `read`.
pub enum ReadResult<T> {
    /// An entry was dequeued.
    Entry(T),
    /// The queue is closed and all residual entries have been drained.
    Closed,
    /// Non-blocking queue and nothing is available.
    WouldBlock,
}

struct State<T> {
    entries: VecDeque<T>,
    closed: bool,
    capacity: usize,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    non_block: bool,
    /// Invoked once for every entry still resident when the queue's last
    /// reference is dropped (§6.2: `on_drop(entry)` for every residual
    /// entry).
    on_drop: Box<dyn Fn(T) + Send + Sync>,
}

/// A cloneable handle to a shared queue. Cloning is the spec's `get`;
/// dropping the last clone is `put` and runs `on_drop` over any entries
/// still queued.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a new queue with the given bound on resident entries.
    /// `on_drop` fires for every entry still queued when the last handle is
    /// dropped, in FIFO order.
    pub fn create(
        capacity: usize,
        non_block: bool,
        on_drop: impl Fn(T) + Send + Sync + 'static,
    ) -> Queue<T> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                closed: false,
                capacity,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            non_block,
            on_drop: Box::new(on_drop),
        });
        Queue { inner }
    }

    /// This queue's stable identity, usable as an owner key.
    pub fn id(&self) -> QueueId {
        QueueId(Arc::as_ptr(&self.inner) as usize as u64)
    }

    /// Acquires a temporary reference bracketing an operation performed by
    /// a party that does not own this queue. Equivalent to `Clone::clone`.
    pub fn get(&self) -> Queue<T> {
        self.clone()
    }

    /// Appends `entry` to the tail. Blocks while the queue is full unless
    /// this queue was created non-blocking, in which case it returns
    /// `Err(WouldBlock)` disguised as success-with-backpressure is not
    /// modeled; callers that need non-blocking writes should check
    /// `size()` first. Fails if the queue has been closed.
    pub fn write(&self, entry: T) -> Result<(), Closed> {
        self.insert(entry, false)
    }

    /// Same as `write` but inserts at the head, used by the dispatcher to
    /// put back a message that did not fit the caller's read buffer.
    pub fn write_head(&self, entry: T) -> Result<(), Closed> {
        self.insert(entry, true)
    }

    fn insert(&self, entry: T, head: bool) -> Result<(), Closed> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Closed);
            }
            if state.entries.len() < state.capacity || self.inner.non_block {
                break;
            }
            state = self.inner.not_full.wait(state).unwrap();
        }
        if head {
            state.entries.push_front(entry);
        } else {
            state.entries.push_back(entry);
        }
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues the head entry. Blocks unless this queue is non-blocking,
    /// in which case an empty queue yields `ReadResult::WouldBlock`
    /// immediately. Once the queue is closed and drained, every subsequent
    /// read returns `ReadResult::Closed`.
    pub fn read(&self) -> ReadResult<T> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                drop(state);
                self.inner.not_full.notify_one();
                return ReadResult::Entry(entry);
            }
            if state.closed {
                return ReadResult::Closed;
            }
            if self.inner.non_block {
                return ReadResult::WouldBlock;
            }
            state = self.inner.not_empty.wait(state).unwrap();
        }
    }

    /// Number of entries currently resident.
    pub fn size(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    /// True iff there are no entries currently resident.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Marks the queue closed: no further writes succeed, and readers
    /// observe `ReadResult::Closed` once residual entries are drained.
    /// Wakes every thread blocked in `read`/`write`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        let residual = state.entries.len();
        drop(state);
        debug!("queue {} closed with {residual} entries still queued", self.id());
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    /// True iff `close` has been called on this queue (via any handle).
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Closes the queue and synchronously runs `on_drop` over every entry
    /// still resident, in FIFO order, without waiting for the last `Arc`
    /// reference to be dropped. Used by process/thread teardown so in-flight
    /// transactions are rewritten deterministically at release time rather
    /// than whenever the last clone happens to go out of scope.
    pub fn close_and_drain(&self) {
        let residual: Vec<T> = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            state.entries.drain(..).collect()
        };
        debug!("queue {} drained {} residual entries at teardown", self.id(), residual.len());
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
        for entry in residual {
            (self.inner.on_drop)(entry);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut entries = self.state.lock().unwrap();
        while let Some(entry) = entries.entries.pop_front() {
            (self.on_drop)(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q: Queue<i32> = Queue::create(8, false, |_| {});
        q.write(1).unwrap();
        q.write(2).unwrap();
        q.write_head(0).unwrap();
        match q.read() {
            ReadResult::Entry(v) => assert_eq!(v, 0),
            _ => panic!("expected entry"),
        }
        match q.read() {
            ReadResult::Entry(v) => assert_eq!(v, 1),
            _ => panic!("expected entry"),
        }
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let q: Queue<i32> = Queue::create(8, false, |_| {});
        q.write(42).unwrap();
        q.close();
        match q.read() {
            ReadResult::Entry(v) => assert_eq!(v, 42),
            _ => panic!("expected resident entry before closed"),
        }
        match q.read() {
            ReadResult::Closed => {}
            _ => panic!("expected closed"),
        }
        assert!(q.write(1).is_err());
    }

    #[test]
    fn on_drop_fires_for_residual_entries() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        {
            let q: Queue<i32> = Queue::create(8, false, move |_| {
                seen2.fetch_add(1, Ordering::SeqCst);
            });
            q.write(1).unwrap();
            q.write(2).unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let q: Queue<i32> = Queue::create(8, false, |_| {});
        let q2 = q.get();
        let handle = thread::spawn(move || match q2.read() {
            ReadResult::Entry(v) => v,
            _ => panic!("expected entry"),
        });
        thread::sleep(Duration::from_millis(20));
        q.write(7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn non_blocking_read_of_empty_queue() {
        let q: Queue<i32> = Queue::create(8, true, |_| {});
        match q.read() {
            ReadResult::WouldBlock => {}
            _ => panic!("expected WouldBlock"),
        }
    }

    #[test]
    fn close_and_drain_fires_synchronously() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let q: Queue<i32> = Queue::create(8, false, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        q.write(1).unwrap();
        q.write(2).unwrap();
        let q2 = q.get();
        q.close_and_drain();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(q2.is_closed());
        assert!(matches!(q2.read(), ReadResult::Closed));
    }

    #[test]
    fn distinct_queues_have_distinct_ids() {
        let a: Queue<i32> = Queue::create(4, false, |_| {});
        let b: Queue<i32> = Queue::create(4, false, |_| {});
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.get().id());
    }
}
