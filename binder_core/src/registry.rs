// SPDX-License-Identifier: BSD-3-Clause

//! Object Registry (C3, spec §4.2): the per-process ordered map from
//! `(owner, binder)` to an object record, plus the death-notifier list
//! carried on owned entries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use binder_queue::Queue;

use crate::ids::{BinderPtr, Cookie, ObjId, QueueId};
use crate::wire::QueueMsg;

/// A death-notifier subscription, unique by `(cookie, notify_queue)`.
/// Duplicates are permitted at this layer — deduplication is a caller
/// responsibility, per spec §4.5.
pub struct Notifier {
    pub cookie: Cookie,
    pub notify_queue: Queue<QueueMsg>,
}

/// One entry in a process's object table. An entry with
/// `id.owner == <the owning process's queue id>` is *owned*; any other
/// entry is a *reference*. Only owned entries carry notifiers or a
/// meaningful `real_cookie`.
pub struct ObjectRecord {
    pub id: ObjId,
    real_cookie: Mutex<Option<Cookie>>,
    notifiers: Mutex<Vec<Notifier>>,
    /// Per-process integer handle assigned to *reference* entries only
    /// (spec §9 explicitly allows "a handle table with generation
    /// counters or a dedicated id allocator" in place of raw pointer
    /// identity; see DESIGN.md). `None` for owned entries, which are
    /// never addressed by handle.
    handle: Mutex<Option<u32>>,
}

impl ObjectRecord {
    fn new(id: ObjId) -> Self {
        ObjectRecord {
            id,
            real_cookie: Mutex::new(None),
            notifiers: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Option<u32> {
        *self.handle.lock().unwrap()
    }

    /// Stores `cookie` the first time this (owned) entry is interned from
    /// the write path; later calls are no-ops, matching "storing cookie
    /// into obj.real_cookie on first insert."
    pub fn set_real_cookie_if_absent(&self, cookie: Cookie) {
        let mut slot = self.real_cookie.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cookie);
        }
    }

    pub fn real_cookie(&self) -> Option<Cookie> {
        *self.real_cookie.lock().unwrap()
    }

    /// Appends a notifier under the object lock (§4.5).
    pub fn add_notifier(&self, notifier: Notifier) {
        self.notifiers.lock().unwrap().push(notifier);
    }

    /// Removes the first notifier matching `(cookie, notify_queue)`,
    /// returning true if one was found and removed.
    pub fn clear_notifier(&self, cookie: Cookie, notify_queue: QueueId) -> bool {
        let mut notifiers = self.notifiers.lock().unwrap();
        if let Some(pos) = notifiers
            .iter()
            .position(|n| n.cookie == cookie && n.notify_queue.id() == notify_queue)
        {
            notifiers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Detaches every notifier (for exactly-once death fan-out) and
    /// returns them to the caller to enqueue outside any lock.
    pub fn take_notifiers(&self) -> Vec<Notifier> {
        std::mem::take(&mut *self.notifiers.lock().unwrap())
    }
}

/// Per-process ordered object table, guarded by its own lock, separate
/// from the process's thread-table lock (spec §4.2 concurrency note).
pub struct ObjectTable {
    local_owner: QueueId,
    objects: Mutex<BTreeMap<ObjId, Arc<ObjectRecord>>>,
    handles: Mutex<BTreeMap<u32, ObjId>>,
    next_handle: AtomicU32,
}

impl ObjectTable {
    pub fn new(local_owner: QueueId) -> Self {
        ObjectTable {
            local_owner,
            objects: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn find(&self, owner: QueueId, binder: BinderPtr) -> Option<Arc<ObjectRecord>> {
        self.objects
            .lock()
            .unwrap()
            .get(&ObjId::new(owner, binder))
            .cloned()
    }

    pub fn find_local(&self, binder: BinderPtr) -> Option<Arc<ObjectRecord>> {
        self.find(self.local_owner, binder)
    }

    /// Lookup-or-insert. On a race between two interns of the same id, the
    /// loser's allocation is simply dropped and the pre-existing entry is
    /// returned — `BTreeMap::entry` gives us this for free under one lock
    /// acquisition. Reference entries (`owner != local_owner`) are handed a
    /// fresh integer handle the first time they're interned.
    pub fn intern(&self, owner: QueueId, binder: BinderPtr) -> Arc<ObjectRecord> {
        let id = ObjId::new(owner, binder);
        let mut objects = self.objects.lock().unwrap();
        if let Some(existing) = objects.get(&id) {
            return existing.clone();
        }
        let record = Arc::new(ObjectRecord::new(id));
        if owner != self.local_owner {
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            *record.handle.lock().unwrap() = Some(handle);
            self.handles.lock().unwrap().insert(handle, id);
        }
        objects.insert(id, record.clone());
        record
    }

    pub fn intern_local(&self, binder: BinderPtr) -> Arc<ObjectRecord> {
        self.intern(self.local_owner, binder)
    }

    /// Resolves a previously issued reference handle back to its object
    /// record, used to turn a `BC_TRANSACTION` target or a death-notifier
    /// request's handle argument into a concrete `(owner, binder)` pair.
    pub fn find_by_handle(&self, handle: u32) -> Option<Arc<ObjectRecord>> {
        let id = *self.handles.lock().unwrap().get(&handle)?;
        self.objects.lock().unwrap().get(&id).cloned()
    }

    /// All entries owned by this process (`id.owner == local_owner`), for
    /// death fan-out at teardown.
    pub fn owned_entries(&self) -> Vec<Arc<ObjectRecord>> {
        self.objects
            .lock()
            .unwrap()
            .values()
            .filter(|obj| obj.id.owner == self.local_owner)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue<QueueMsg> {
        Queue::create(8, false, |_| {})
    }

    #[test]
    fn intern_is_idempotent() {
        let owner = queue().id();
        let table = ObjectTable::new(owner);
        let a = table.intern_local(0x1000);
        let b = table.intern_local(0x1000);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn owned_vs_reference() {
        let owner = queue().id();
        let other = queue().id();
        let table = ObjectTable::new(owner);
        table.intern_local(1);
        table.intern(other, 2);

        let owned = table.owned_entries();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id.binder, 1);
    }

    #[test]
    fn real_cookie_set_once() {
        let owner = queue().id();
        let table = ObjectTable::new(owner);
        let obj = table.intern_local(5);
        obj.set_real_cookie_if_absent(0xC1);
        obj.set_real_cookie_if_absent(0xC2);
        assert_eq!(obj.real_cookie(), Some(0xC1));
    }

    #[test]
    fn reference_entries_get_handles_owned_entries_dont() {
        let owner = queue().id();
        let other = queue().id();
        let table = ObjectTable::new(owner);

        let owned = table.intern_local(1);
        assert_eq!(owned.handle(), None);

        let reference = table.intern(other, 2);
        let handle = reference.handle().expect("reference should get a handle");
        assert!(Arc::ptr_eq(&reference, &table.find_by_handle(handle).unwrap()));

        // Re-interning the same reference returns the same handle:
        let again = table.intern(other, 2);
        assert_eq!(again.handle(), Some(handle));
    }

    #[test]
    fn clear_notifier_exact_match() {
        let owner = queue().id();
        let table = ObjectTable::new(owner);
        let obj = table.intern_local(1);
        let q = queue();
        obj.add_notifier(Notifier {
            cookie: 0xD1,
            notify_queue: q.clone(),
        });
        assert!(!obj.clear_notifier(0xD2, q.id()));
        assert!(obj.clear_notifier(0xD1, q.id()));
        assert!(obj.take_notifiers().is_empty());
    }
}
