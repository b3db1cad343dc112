// SPDX-License-Identifier: BSD-3-Clause

//! Wire-level shapes for the write/read command streams (spec §4.6) and
//! the internal message shape that travels over `binder_queue` queues.
//!
//! The write stream is `(bcmd: u32 LE, payload)*`; the read stream
//! produced by the dispatcher is `(brcmd: u32 LE, payload)*`. Both use
//! little-endian fixed-width integers throughout; this is SPEC_FULL's own
//! choice (the original kernel ABI is out of scope per spec.md §1), so
//! nothing here claims byte-for-byte compatibility with any real driver.

use crate::error::Error;
use crate::ids::{BinderPtr, Cookie};
use binder_queue::Queue;

/// Largest `data_size` accepted for a single transaction (spec §4.6).
pub const MAX_TRANSACTION_SIZE: usize = 4000;

/// Set on a transaction that expects no reply.
pub const TF_ONE_WAY: u32 = 0x0000_0001;

const BC_TRANSACTION: u32 = 1;
const BC_REPLY: u32 = 2;
const BC_REQUEST_DEATH_NOTIFICATION: u32 = 3;
const BC_CLEAR_DEATH_NOTIFICATION: u32 = 4;
const BC_ENTER_LOOPER: u32 = 5;
const BC_EXIT_LOOPER: u32 = 6;
const BC_REGISTER_LOOPER: u32 = 7;

const BR_TRANSACTION: u32 = 1;
const BR_REPLY: u32 = 2;
const BR_TRANSACTION_COMPLETE: u32 = 3;
const BR_FAILED_REPLY: u32 = 4;
const BR_DEAD_REPLY: u32 = 5;
const BR_DEAD_BINDER: u32 = 6;
const BR_CLEAR_DEATH_NOTIFICATION_DONE: u32 = 7;
const BR_SPAWN_LOOPER: u32 = 8;

/// A 24-byte, 8-byte-aligned descriptor embedded in a transaction's data
/// blob at one of its `offsets` (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatObject {
    pub ty: FlatObjectType,
    pub binder: BinderPtr,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatObjectType {
    Binder,
    WeakBinder,
    Handle,
    WeakHandle,
}

impl FlatObjectType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(FlatObjectType::Binder),
            2 => Some(FlatObjectType::WeakBinder),
            3 => Some(FlatObjectType::Handle),
            4 => Some(FlatObjectType::WeakHandle),
            _ => None,
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            FlatObjectType::Binder => 1,
            FlatObjectType::WeakBinder => 2,
            FlatObjectType::Handle => 3,
            FlatObjectType::WeakHandle => 4,
        }
    }

    pub fn is_owner_type(self) -> bool {
        matches!(self, FlatObjectType::Binder | FlatObjectType::WeakBinder)
    }

    pub fn is_handle_type(self) -> bool {
        matches!(self, FlatObjectType::Handle | FlatObjectType::WeakHandle)
    }

    pub fn to_handle(self) -> Self {
        match self {
            FlatObjectType::Binder => FlatObjectType::Handle,
            FlatObjectType::WeakBinder => FlatObjectType::WeakHandle,
            other => other,
        }
    }

    pub fn to_owner(self) -> Self {
        match self {
            FlatObjectType::Handle => FlatObjectType::Binder,
            FlatObjectType::WeakHandle => FlatObjectType::WeakBinder,
            other => other,
        }
    }
}

pub const FLAT_OBJECT_SIZE: usize = 24;

impl FlatObject {
    fn read_at(data: &[u8], offset: usize) -> Result<Self, Error> {
        let end = offset.checked_add(FLAT_OBJECT_SIZE).ok_or(Error::Einval)?;
        let bytes = data.get(offset..end).ok_or(Error::Einval)?;
        let ty = FlatObjectType::from_u32(u32::from_le_bytes(bytes[0..4].try_into().unwrap()))
            .ok_or(Error::Einval)?;
        let binder = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let cookie = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        Ok(FlatObject { ty, binder, cookie })
    }

    fn write_at(&self, data: &mut [u8], offset: usize) {
        data[offset..offset + 4].copy_from_slice(&self.ty.to_u32().to_le_bytes());
        data[offset + 4..offset + 8].copy_from_slice(&0u32.to_le_bytes());
        data[offset + 8..offset + 16].copy_from_slice(&self.binder.to_le_bytes());
        data[offset + 16..offset + 24].copy_from_slice(&self.cookie.to_le_bytes());
    }
}

/// A transaction payload: a flat `data` blob plus an `offsets` table
/// naming where each embedded `FlatObject` descriptor lives (byte offsets
/// into `data`).
#[derive(Debug, Clone, Default)]
pub struct Buf {
    pub data: Vec<u8>,
    pub offsets: Vec<u32>,
}

impl Buf {
    /// Validates the size relationship from spec §4.6:
    /// `offsets_size / sizeof(offset) * sizeof(flat_object) + offsets_size <= data_size`,
    /// and `data_size <= MAX_TRANSACTION_SIZE`.
    pub fn validate_sizes(data_size: usize, offsets_size: usize) -> Result<(), Error> {
        if data_size > MAX_TRANSACTION_SIZE {
            return Err(Error::Einval);
        }
        if offsets_size % 4 != 0 {
            return Err(Error::Einval);
        }
        let count = offsets_size / 4;
        let bound = count
            .checked_mul(FLAT_OBJECT_SIZE)
            .and_then(|v| v.checked_add(offsets_size))
            .ok_or(Error::Einval)?;
        if bound > data_size {
            return Err(Error::Einval);
        }
        Ok(())
    }

    pub fn flat_object_at(&self, offset: u32) -> Result<FlatObject, Error> {
        FlatObject::read_at(&self.data, offset as usize)
    }

    pub fn set_flat_object_at(&mut self, offset: u32, obj: &FlatObject) -> Result<(), Error> {
        let offset = offset as usize;
        let end = offset.checked_add(FLAT_OBJECT_SIZE).ok_or(Error::Einval)?;
        if end > self.data.len() {
            return Err(Error::Einval);
        }
        obj.write_at(&mut self.data, offset);
        Ok(())
    }
}

pub(crate) fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

/// A decoded `BC_TRANSACTION`/`BC_REPLY` payload, before target resolution.
#[derive(Debug, Clone)]
pub struct WireTransaction {
    /// Handle (for `BC_TRANSACTION`, 0 meaning the context manager) or
    /// unused (for `BC_REPLY`, where the destination comes from the
    /// popped incoming transaction instead).
    pub target: u64,
    pub code: u32,
    pub flags: u32,
    pub buf: Buf,
}

/// A single decoded write-stream command.
#[derive(Debug, Clone)]
pub enum BcCommand {
    Transaction(WireTransaction),
    Reply(WireTransaction),
    /// `handle` is the reference handle assigned when this process first
    /// received the object (see `registry::ObjectTable::find_by_handle`);
    /// the spec's payload table names this field `binder`, but it is a
    /// handle, not a raw pointer (§9 permits either representation).
    RequestDeathNotification { handle: u32, cookie: Cookie },
    ClearDeathNotification { handle: u32, cookie: Cookie },
    EnterLooper,
    ExitLooper,
    RegisterLooper,
}

/// Incrementally decodes the write stream, one command at a time, so the
/// dispatcher can execute each command's side effects immediately and stop
/// at the first malformed record with `write_consumed` reflecting exactly
/// the progress made (spec §7).
pub struct BcReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BcReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BcReader { buf, pos: 0 }
    }

    /// Bytes consumed so far (always points at the start of the record
    /// that failed, if `next` last returned `Err`).
    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(len).ok_or(Error::Einval)?;
        let slice = self.buf.get(self.pos..end).ok_or(Error::Einval)?;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn commit(&mut self, len: usize) {
        self.pos += len;
    }

    /// Returns the next command, `Ok(None)` at end of buffer, or `Err` on a
    /// malformed record (position is left at the start of that record).
    pub fn next(&mut self) -> Result<Option<BcCommand>, Error> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let start = self.pos;
        let result = self.decode_one();
        if result.is_err() {
            self.pos = start;
        }
        result.map(Some)
    }

    fn decode_one(&mut self) -> Result<BcCommand, Error> {
        let bcmd = self.take_u32()?;
        self.commit(4);
        match bcmd {
            BC_TRANSACTION | BC_REPLY => {
                let wt = self.decode_transaction_payload()?;
                if bcmd == BC_TRANSACTION {
                    Ok(BcCommand::Transaction(wt))
                } else {
                    Ok(BcCommand::Reply(wt))
                }
            }
            BC_REQUEST_DEATH_NOTIFICATION | BC_CLEAR_DEATH_NOTIFICATION => {
                let raw_handle = self.take_u64()?;
                self.commit(8);
                let cookie = self.take_u64()?;
                self.commit(8);
                let handle = u32::try_from(raw_handle).map_err(|_| Error::Einval)?;
                if bcmd == BC_REQUEST_DEATH_NOTIFICATION {
                    Ok(BcCommand::RequestDeathNotification { handle, cookie })
                } else {
                    Ok(BcCommand::ClearDeathNotification { handle, cookie })
                }
            }
            BC_ENTER_LOOPER => Ok(BcCommand::EnterLooper),
            BC_EXIT_LOOPER => Ok(BcCommand::ExitLooper),
            BC_REGISTER_LOOPER => Ok(BcCommand::RegisterLooper),
            _ => Err(Error::Einval),
        }
    }

    fn decode_transaction_payload(&mut self) -> Result<WireTransaction, Error> {
        let target = self.take_u64()?;
        self.commit(8);
        let code = self.take_u32()?;
        self.commit(4);
        let flags = self.take_u32()?;
        self.commit(4);
        let data_size = self.take_u32()? as usize;
        self.commit(4);
        let offsets_size = self.take_u32()? as usize;
        self.commit(4);

        Buf::validate_sizes(data_size, offsets_size)?;

        let data = self.take(pad8(data_size))?[..data_size].to_vec();
        self.commit(pad8(data_size));

        let mut offsets = Vec::with_capacity(offsets_size / 4);
        let raw = self.take(pad8(offsets_size))?;
        for chunk in raw[..offsets_size].chunks_exact(4) {
            offsets.push(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
        self.commit(pad8(offsets_size));

        Ok(WireTransaction {
            target,
            code,
            flags,
            buf: Buf { data, offsets },
        })
    }
}

/// A single produced read-stream command.
#[derive(Debug, Clone)]
pub enum BinderReturn {
    Transaction(WireReturnTransaction),
    Reply(WireReturnTransaction),
    TransactionComplete,
    FailedReply,
    DeadReply,
    DeadBinder { cookie: Cookie },
    ClearDeathNotificationDone { cookie: Cookie },
    SpawnLooper,
}

#[derive(Debug, Clone)]
pub struct WireReturnTransaction {
    /// The target object's own binder pointer, as seen by its owner — not
    /// the handle the sender addressed it by.
    pub target: u64,
    /// The target object's owner-side cookie, restored from the owner's own
    /// registry entry at delivery time.
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u32,
    pub sender_euid: u32,
    pub buf: Buf,
}

impl WireReturnTransaction {
    fn encoded_len(&self) -> usize {
        4 + 8 + 8 + 4 + 4 + 4 + 4 + 4 + pad8(self.buf.data.len()) + pad8(self.buf.offsets.len() * 4)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.target.to_le_bytes());
        out.extend_from_slice(&self.cookie.to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.sender_pid.to_le_bytes());
        out.extend_from_slice(&self.sender_euid.to_le_bytes());
        out.extend_from_slice(&(self.buf.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&((self.buf.offsets.len() * 4) as u32).to_le_bytes());
        out.extend_from_slice(&self.buf.data);
        out.resize(out.len() + (pad8(self.buf.data.len()) - self.buf.data.len()), 0);
        for off in &self.buf.offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        let offsets_bytes = self.buf.offsets.len() * 4;
        out.resize(out.len() + (pad8(offsets_bytes) - offsets_bytes), 0);
    }
}

impl BinderReturn {
    /// Total bytes this command would occupy in the read buffer, used to
    /// implement §4.6's "read buffer tight fit" rule (property 7).
    pub fn encoded_len(&self) -> usize {
        match self {
            BinderReturn::Transaction(t) | BinderReturn::Reply(t) => 4 + t.encoded_len(),
            BinderReturn::TransactionComplete
            | BinderReturn::FailedReply
            | BinderReturn::DeadReply
            | BinderReturn::SpawnLooper => 4,
            BinderReturn::DeadBinder { .. } | BinderReturn::ClearDeathNotificationDone { .. } => {
                4 + 8
            }
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BinderReturn::Transaction(t) => {
                out.extend_from_slice(&BR_TRANSACTION.to_le_bytes());
                t.encode_into(out);
            }
            BinderReturn::Reply(t) => {
                out.extend_from_slice(&BR_REPLY.to_le_bytes());
                t.encode_into(out);
            }
            BinderReturn::TransactionComplete => {
                out.extend_from_slice(&BR_TRANSACTION_COMPLETE.to_le_bytes());
            }
            BinderReturn::FailedReply => {
                out.extend_from_slice(&BR_FAILED_REPLY.to_le_bytes());
            }
            BinderReturn::DeadReply => {
                out.extend_from_slice(&BR_DEAD_REPLY.to_le_bytes());
            }
            BinderReturn::DeadBinder { cookie } => {
                out.extend_from_slice(&BR_DEAD_BINDER.to_le_bytes());
                out.extend_from_slice(&cookie.to_le_bytes());
            }
            BinderReturn::ClearDeathNotificationDone { cookie } => {
                out.extend_from_slice(&BR_CLEAR_DEATH_NOTIFICATION_DONE.to_le_bytes());
                out.extend_from_slice(&cookie.to_le_bytes());
            }
            BinderReturn::SpawnLooper => {
                out.extend_from_slice(&BR_SPAWN_LOOPER.to_le_bytes());
            }
        }
    }
}

/// A fully resolved synchronous (or one-way) transaction in flight between
/// two processes' queues. This is the internal shape; it never touches the
/// wire directly (it carries a live `reply_queue` handle, which has no
/// byte representation).
#[derive(Clone)]
pub struct Transaction {
    pub is_reply: bool,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: u32,
    pub sender_euid: u32,
    /// The addressed object's own binder pointer and owner-side cookie, as
    /// resolved by the dispatcher at send time (zero for replies, which
    /// address a waiting thread directly rather than an object).
    pub target_ptr: BinderPtr,
    pub target_cookie: Cookie,
    pub buf: Buf,
    /// `None` for one-way transactions and for replies (a reply never
    /// itself expects a reply).
    pub reply_queue: Option<Queue<QueueMsg>>,
}

impl Transaction {
    pub fn is_one_way(&self) -> bool {
        self.flags & TF_ONE_WAY != 0
    }
}

/// Everything that can travel over a process's pool queue or a thread's
/// inbox queue.
#[derive(Clone)]
pub enum QueueMsg {
    Transaction(Transaction),
    TransactionComplete,
    FailedReply,
    DeadReply,
    ClearDeathNotificationDone {
        cookie: Cookie,
    },
    DeadBinder {
        cookie: Cookie,
    },
}

/// The drain callback installed on every process/thread queue (spec §6.2's
/// `on_drop`): an in-flight, non-one-way `BC_TRANSACTION` whose destination
/// just closed is redirected to the sender's reply queue as `BR_DEAD_REPLY`
/// (scenario S4); everything else is simply discarded, since the only party
/// that could still care about it is also gone.
pub fn on_drop_queue_msg(msg: QueueMsg) {
    if let QueueMsg::Transaction(tx) = msg {
        if !tx.is_reply {
            if let Some(reply_queue) = &tx.reply_queue {
                let _ = reply_queue.write(QueueMsg::DeadReply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_transaction_command() {
        let mut data = vec![0u8; 8];
        data[0..4].copy_from_slice(b"ping");
        let mut buf = Vec::new();
        buf.extend_from_slice(&BC_TRANSACTION.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // target
        buf.extend_from_slice(&1u32.to_le_bytes()); // code
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // offsets_size
        buf.extend_from_slice(&data);

        let mut reader = BcReader::new(&buf);
        match reader.next().unwrap().unwrap() {
            BcCommand::Transaction(wt) => {
                assert_eq!(wt.code, 1);
                assert_eq!(&wt.buf.data[0..4], b"ping");
            }
            _ => panic!("expected transaction"),
        }
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn malformed_record_leaves_consumed_at_record_start() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BC_ENTER_LOOPER.to_le_bytes());
        let good_len = buf.len();
        buf.extend_from_slice(&999u32.to_le_bytes());

        let mut reader = BcReader::new(&buf);
        assert!(matches!(reader.next().unwrap(), Some(BcCommand::EnterLooper)));
        assert_eq!(reader.consumed(), good_len);
        assert!(reader.next().is_err());
        assert_eq!(reader.consumed(), good_len);
    }

    #[test]
    fn oversized_transaction_rejected() {
        assert!(Buf::validate_sizes(MAX_TRANSACTION_SIZE + 1, 0).is_err());
    }

    #[test]
    fn offsets_overflow_rejected() {
        // one offset (4 bytes) claiming a flat object (24 bytes) that does
        // not fit inside a tiny data blob:
        assert!(Buf::validate_sizes(10, 4).is_err());
    }

    #[test]
    fn flat_object_round_trip() {
        let mut buf = Buf {
            data: vec![0u8; 24],
            offsets: vec![0],
        };
        let obj = FlatObject {
            ty: FlatObjectType::Binder,
            binder: 0xA1,
            cookie: 0xC1,
        };
        buf.set_flat_object_at(0, &obj).unwrap();
        let back = buf.flat_object_at(0).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn return_command_encoded_len_matches_output() {
        let cmd = BinderReturn::DeadBinder { cookie: 7 };
        let mut out = Vec::new();
        cmd.encode_into(&mut out);
        assert_eq!(out.len(), cmd.encoded_len());
    }
}
