// SPDX-License-Identifier: BSD-3-Clause

//! Flat-Object Translator (C4, spec §4.3): rewrites every embedded
//! `FlatObject` descriptor named by a transaction's `offsets` table, once
//! on the way in from the sender and once on the way out to the receiver.

use crate::error::Error;
use crate::ids::QueueId;
use crate::registry::ObjectTable;
use crate::wire::{Buf, FlatObjectType};

/// Rewrites every descriptor in `buf` as the sender's kernel-side view:
/// owner-typed descriptors become handles carrying the sender's queue id as
/// their cookie; handle-typed descriptors must already be known to the
/// sender's own registry.
pub fn translate_write(
    buf: &mut Buf,
    sender_objects: &ObjectTable,
    sender_owner: QueueId,
) -> Result<(), Error> {
    let offsets = buf.offsets.clone();
    for offset in offsets {
        let obj = buf.flat_object_at(offset)?;
        if obj.ty.is_owner_type() {
            let record = sender_objects.intern_local(obj.binder);
            record.set_real_cookie_if_absent(obj.cookie);
            let mut rewritten = obj;
            rewritten.ty = obj.ty.to_handle();
            rewritten.cookie = sender_owner.0;
            buf.set_flat_object_at(offset, &rewritten)?;
        } else if obj.ty.is_handle_type() {
            let owner = QueueId(obj.cookie);
            if sender_objects.find(owner, obj.binder).is_none() {
                return Err(Error::Einval);
            }
            // passed through unchanged
        } else {
            return Err(Error::Einval);
        }
    }
    Ok(())
}

/// Rewrites every descriptor in `buf` as the receiver's kernel-side view:
/// a handle whose cookie names the receiver becomes the receiver's own
/// owner-typed descriptor, with `cookie` restored from the receiver's
/// table; any other handle is interned into the receiver's registry so it
/// can be re-sent later.
pub fn translate_read(
    buf: &mut Buf,
    receiver_objects: &ObjectTable,
    receiver_owner: QueueId,
) -> Result<(), Error> {
    let offsets = buf.offsets.clone();
    for offset in offsets {
        let obj = buf.flat_object_at(offset)?;
        if !obj.ty.is_handle_type() {
            return Err(Error::Efault);
        }
        let owner = QueueId(obj.cookie);
        if owner == receiver_owner {
            let record = receiver_objects
                .find_local(obj.binder)
                .ok_or(Error::Efault)?;
            let real_cookie = record.real_cookie().ok_or(Error::Efault)?;
            let mut rewritten = obj;
            rewritten.ty = obj.ty.to_owner();
            rewritten.cookie = real_cookie;
            buf.set_flat_object_at(offset, &rewritten)?;
        } else {
            receiver_objects.intern(owner, obj.binder);
            // passed through unchanged
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FlatObject, QueueMsg};
    use binder_queue::Queue;

    fn queue_id() -> QueueId {
        let q: Queue<QueueMsg> = Queue::create(4, false, |_| {});
        q.id()
    }

    #[test]
    fn owner_round_trip() {
        let a = queue_id();
        let b = queue_id();
        let a_objects = ObjectTable::new(a);
        let b_objects = ObjectTable::new(b);

        // A owns 0xA1/cookie 0xC1 and sends it to B:
        let mut buf = Buf {
            data: vec![0u8; 24],
            offsets: vec![0],
        };
        buf.set_flat_object_at(
            0,
            &FlatObject {
                ty: FlatObjectType::Binder,
                binder: 0xA1,
                cookie: 0xC1,
            },
        )
        .unwrap();

        translate_write(&mut buf, &a_objects, a).unwrap();
        translate_read(&mut buf, &b_objects, b).unwrap();

        let seen = buf.flat_object_at(0).unwrap();
        assert_eq!(seen.ty, FlatObjectType::Handle);
        assert_eq!(seen.cookie, a.0);

        // B forwards the same (now handle-typed) descriptor back to A:
        translate_write(&mut buf, &b_objects, b).unwrap();
        translate_read(&mut buf, &a_objects, a).unwrap();

        let back = buf.flat_object_at(0).unwrap();
        assert_eq!(back.ty, FlatObjectType::Binder);
        assert_eq!(back.binder, 0xA1);
        assert_eq!(back.cookie, 0xC1);
    }

    #[test]
    fn unknown_handle_on_write_is_rejected() {
        let a = queue_id();
        let a_objects = ObjectTable::new(a);
        let mut buf = Buf {
            data: vec![0u8; 24],
            offsets: vec![0],
        };
        buf.set_flat_object_at(
            0,
            &FlatObject {
                ty: FlatObjectType::Handle,
                binder: 1,
                cookie: 999,
            },
        )
        .unwrap();
        assert!(translate_write(&mut buf, &a_objects, a).is_err());
    }

    #[test]
    fn owner_typed_descriptor_on_read_is_efault() {
        let b = queue_id();
        let b_objects = ObjectTable::new(b);
        let mut buf = Buf {
            data: vec![0u8; 24],
            offsets: vec![0],
        };
        buf.set_flat_object_at(
            0,
            &FlatObject {
                ty: FlatObjectType::Binder,
                binder: 1,
                cookie: 2,
            },
        )
        .unwrap();
        assert!(translate_read(&mut buf, &b_objects, b).is_err());
    }
}
