// SPDX-License-Identifier: BSD-3-Clause

//! Context Manager Singleton (C_CTX, spec §4.8): the one well-known object
//! every process can reach through handle 0 without a prior introduction.

use std::sync::Mutex;

use crate::error::Error;
use crate::ids::{BinderPtr, Cookie, QueueId};

#[derive(Debug, Clone, Copy)]
pub struct ContextMgr {
    pub obj: BinderPtr,
    pub cookie: Cookie,
    pub euid: u32,
    pub owner: QueueId,
}

/// Holds at most one context manager for the lifetime of the device. The
/// first `BC_SET_CONTEXT_MGR` wins; a later call from a different euid is
/// rejected with `EPERM` rather than silently replacing the registration,
/// since handle-0 transactions already in flight assume a stable owner.
pub struct ContextMgrTable {
    slot: Mutex<Option<ContextMgr>>,
}

impl ContextMgrTable {
    pub fn new() -> Self {
        ContextMgrTable {
            slot: Mutex::new(None),
        }
    }

    pub fn set(
        &self,
        obj: BinderPtr,
        cookie: Cookie,
        euid: u32,
        owner: QueueId,
    ) -> Result<(), Error> {
        let mut slot = self.slot.lock().unwrap();
        match &*slot {
            None => {
                *slot = Some(ContextMgr {
                    obj,
                    cookie,
                    euid,
                    owner,
                });
                Ok(())
            }
            Some(existing) if existing.euid == euid => {
                *slot = Some(ContextMgr {
                    obj,
                    cookie,
                    euid,
                    owner,
                });
                Ok(())
            }
            Some(_) => Err(Error::Eperm),
        }
    }

    pub fn get(&self) -> Option<ContextMgr> {
        *self.slot.lock().unwrap()
    }

    /// Drops the registration if it belongs to `owner`, releasing handle 0
    /// for a future claimant when the owning process tears down.
    pub fn release_if_owned_by(&self, owner: QueueId) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(&*slot, Some(mgr) if mgr.owner == owner) {
            *slot = None;
        }
    }
}

impl Default for ContextMgrTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binder_queue::Queue;

    fn owner_id() -> QueueId {
        let q: Queue<u8> = Queue::create(1, false, |_| {});
        q.id()
    }

    #[test]
    fn first_set_wins_and_is_visible() {
        let table = ContextMgrTable::new();
        let owner = owner_id();
        table.set(0xC0, 0xC1, 0, owner).unwrap();
        let mgr = table.get().unwrap();
        assert_eq!(mgr.obj, 0xC0);
        assert_eq!(mgr.owner, owner);
    }

    #[test]
    fn second_set_from_different_euid_is_rejected() {
        let table = ContextMgrTable::new();
        let owner = owner_id();
        table.set(0xC0, 0xC1, 0, owner).unwrap();
        let other = owner_id();
        assert!(matches!(table.set(0xC2, 0xC3, 1, other), Err(Error::Eperm)));
        // original registration is untouched:
        assert_eq!(table.get().unwrap().obj, 0xC0);
    }

    #[test]
    fn release_clears_only_the_matching_owner() {
        let table = ContextMgrTable::new();
        let owner = owner_id();
        table.set(0xC0, 0xC1, 0, owner).unwrap();
        let stranger = owner_id();
        table.release_if_owned_by(stranger);
        assert!(table.get().is_some());
        table.release_if_owned_by(owner);
        assert!(table.get().is_none());
    }
}
