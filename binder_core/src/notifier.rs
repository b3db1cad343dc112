// SPDX-License-Identifier: BSD-3-Clause

//! Notifier Engine (C6, spec §4.5): death-notification registration and
//! exactly-once fan-out when an owning process tears down.

use log::debug;

use crate::ids::{BinderPtr, Cookie};
use crate::registry::{Notifier, ObjectTable};
use crate::wire::QueueMsg;
use binder_queue::Queue;

/// Processes a `BC_REQUEST_DEATH_NOTIFICATION` control message once it has
/// reached the owner's queue: appends a notifier to the named object, if
/// the owner still has it. Duplicates are accepted (caller's
/// responsibility to dedup, per spec).
pub fn handle_request(
    objects: &ObjectTable,
    binder: BinderPtr,
    cookie: Cookie,
    notify_queue: Queue<QueueMsg>,
) {
    if let Some(obj) = objects.find_local(binder) {
        obj.add_notifier(Notifier {
            cookie,
            notify_queue,
        });
    }
}

/// Processes a `BC_CLEAR_DEATH_NOTIFICATION` control message on the
/// owner's side. Returns true iff a matching notifier was found and
/// removed — the caller uses this to decide whether to send
/// `BR_CLEAR_DEATH_NOTIFICATION_DONE` back (spec: "succeeds silently" when
/// nothing matches, i.e. the DONE command is only sent when found).
pub fn handle_clear(
    objects: &ObjectTable,
    binder: BinderPtr,
    cookie: Cookie,
    notify_queue: &Queue<QueueMsg>,
) -> bool {
    match objects.find_local(binder) {
        Some(obj) => obj.clear_notifier(cookie, notify_queue.id()),
        None => false,
    }
}

/// Fires `BR_DEAD_BINDER` exactly once per still-registered notifier on
/// every object this process owns. Called at process teardown. Each
/// notifier is detached from its object before the outbound message is
/// enqueued, so a racing clear can never see it twice.
pub fn fire_death_for_process(objects: &ObjectTable) {
    for obj in objects.owned_entries() {
        let notifiers = obj.take_notifiers();
        if !notifiers.is_empty() {
            debug!("object {:?} firing {} death notifier(s)", obj.id, notifiers.len());
        }
        for notifier in notifiers {
            let _ = notifier.notify_queue.write(QueueMsg::DeadBinder {
                cookie: notifier.cookie,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binder_queue::ReadResult;

    fn queue() -> Queue<QueueMsg> {
        Queue::create(8, false, |_| {})
    }

    #[test]
    fn request_then_fire_delivers_dead_binder_once() {
        let owner = queue();
        let objects = ObjectTable::new(owner.id());
        objects.intern_local(0xA1);

        let watcher = queue();
        handle_request(&objects, 0xA1, 0xD1, watcher.clone());

        fire_death_for_process(&objects);

        match watcher.read() {
            ReadResult::Entry(QueueMsg::DeadBinder { cookie }) => assert_eq!(cookie, 0xD1),
            _ => panic!("expected dead binder"),
        }

        // firing again must not redeliver (notifier already detached):
        fire_death_for_process(&objects);
        assert!(watcher.empty());
    }

    #[test]
    fn clear_reports_found_status() {
        let owner = queue();
        let objects = ObjectTable::new(owner.id());
        objects.intern_local(1);
        let watcher = queue();
        handle_request(&objects, 1, 0xD1, watcher.clone());

        assert!(!handle_clear(&objects, 1, 0xD2, &watcher));
        assert!(handle_clear(&objects, 1, 0xD1, &watcher));
        assert!(!handle_clear(&objects, 1, 0xD1, &watcher));
    }
}
