// SPDX-License-Identifier: BSD-3-Clause

//! Transaction Engine & Device (C5/C7/C8, spec §4.4/§4.6/§4.7): the single
//! entry point, `BinderDevice::write_read`, that a simulated ioctl call
//! lands on. Everything upstream of this module (registry, translator,
//! notifier, queues) is orchestrated from here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use binder_queue::{Queue, ReadResult};

use crate::alloc;
use crate::context_mgr::ContextMgrTable;
use crate::error::Error;
use crate::ids::{BinderPtr, Cookie, QueueId};
use crate::notifier;
use crate::process::{Process, Thread};
use crate::registry::ObjectRecord;
use crate::translate::{translate_read, translate_write};
use crate::wire::{
    pad8, BcCommand, BcReader, BinderReturn, Buf, QueueMsg, Transaction, WireReturnTransaction,
    WireTransaction, TF_ONE_WAY,
};

/// Reported by `version()`; bumped whenever the wire format in `wire.rs`
/// changes in an incompatible way.
pub const PROTOCOL_VERSION: u32 = 1;

/// What one `write_read` call produced on its read side, paired with how
/// much of the write buffer was actually consumed.
#[derive(Debug, Default)]
pub struct WriteReadResult {
    pub write_consumed: usize,
    pub read: Vec<u8>,
}

/// An error from `write_read`, carrying the write-side progress made before
/// the failure so the caller can resume past whatever already executed
/// (spec §7: partial progress is always reported, never silently lost).
#[derive(Debug)]
pub struct DispatchError {
    pub write_consumed: usize,
    pub error: Error,
}

/// The whole simulated kernel module: every open process, plus the single
/// context-manager registration they all share.
pub struct BinderDevice {
    processes: Mutex<BTreeMap<QueueId, Arc<Process>>>,
    context_mgr: ContextMgrTable,
}

impl BinderDevice {
    pub fn new() -> Self {
        BinderDevice {
            processes: Mutex::new(BTreeMap::new()),
            context_mgr: ContextMgrTable::new(),
        }
    }

    /// Simulated `open()`: registers a new process record.
    pub fn open(&self, pid: u32, euid: u32, non_block: bool) -> Arc<Process> {
        let process = Process::new(pid, euid, non_block);
        debug!("process {pid} opened, queue {}", process.queue.id());
        self.processes
            .lock()
            .unwrap()
            .insert(process.queue.id(), process.clone());
        process
    }

    /// Simulated `release()`: tears the process down. Every owned object's
    /// death notifiers fire exactly once, every thread inbox is drained
    /// (redirecting in-flight non-one-way transactions to `BR_DEAD_REPLY`
    /// via the queue's own `on_drop`), and a context-manager registration
    /// owned by this process is released for a future claimant.
    pub fn release(&self, process: &Arc<Process>) {
        let owner = process.queue.id();
        debug!("process {} releasing, owner queue {owner}", process.pid);
        self.processes.lock().unwrap().remove(&owner);
        self.context_mgr.release_if_owned_by(owner);
        notifier::fire_death_for_process(&process.objects);
        for thread in process.all_threads() {
            thread.queue.close_and_drain();
        }
        process.queue.close_and_drain();
    }

    pub fn set_max_threads(&self, process: &Process, n: u32) {
        process.set_max_threads(n);
    }

    /// `BC_SET_CONTEXT_MGR`. Rejected with `EPERM` if a different euid
    /// already holds the registration (spec §4.8).
    pub fn set_context_mgr(
        &self,
        process: &Process,
        obj: BinderPtr,
        cookie: Cookie,
    ) -> Result<(), Error> {
        self.context_mgr
            .set(obj, cookie, process.euid, process.queue.id())
    }

    pub fn thread_exit(&self, process: &Process, pid: u32) {
        process.thread_exit(pid);
    }

    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    pub fn find_process(&self, owner: QueueId) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().get(&owner).cloned()
    }

    /// The simulated `ioctl(BINDER_WRITE_READ)`. Executes every command in
    /// `write_buf` in order, stopping at the first malformed record or
    /// failing command, then attempts to deliver one return item into a
    /// buffer of `read_capacity` bytes.
    pub fn write_read(
        &self,
        process: &Arc<Process>,
        thread_pid: u32,
        write_buf: &[u8],
        read_capacity: usize,
    ) -> Result<WriteReadResult, DispatchError> {
        let thread = process.thread(thread_pid);

        let mut reader = BcReader::new(write_buf);
        loop {
            match reader.next() {
                Ok(None) => break,
                Ok(Some(cmd)) => {
                    trace!("pid {thread_pid} decoded {cmd:?}");
                    if let Err(error) = self.execute_bc(process, &thread, cmd) {
                        warn!("pid {thread_pid} command failed: {error}");
                        return Err(DispatchError {
                            write_consumed: reader.consumed(),
                            error,
                        });
                    }
                }
                Err(error) => {
                    warn!("pid {thread_pid} malformed command stream: {error}");
                    return Err(DispatchError {
                        write_consumed: reader.consumed(),
                        error,
                    });
                }
            }
        }
        let write_consumed = reader.consumed();

        match self.read_phase(process, &thread, read_capacity) {
            Ok(read) => Ok(WriteReadResult {
                write_consumed,
                read,
            }),
            Err(error) => Err(DispatchError {
                write_consumed,
                error,
            }),
        }
    }

    fn resolve_handle(&self, process: &Process, handle: u32) -> Result<Arc<ObjectRecord>, Error> {
        process.objects.find_by_handle(handle).ok_or(Error::Einval)
    }

    /// Resolves a `BC_TRANSACTION` target to its owning process plus the
    /// addressed object's own binder pointer and owner-side cookie — the
    /// values the receiver itself would see in `find_local`, not whatever
    /// the sender's reference entry happens to carry.
    fn resolve_target(
        &self,
        process: &Process,
        target: u64,
    ) -> Result<(Arc<Process>, BinderPtr, Cookie), Error> {
        if target == 0 {
            let mgr = self.context_mgr.get().ok_or(Error::Einval)?;
            let target_process = self.find_process(mgr.owner).ok_or(Error::Ebadf)?;
            Ok((target_process, mgr.obj, mgr.cookie))
        } else {
            let handle = u32::try_from(target).map_err(|_| Error::Einval)?;
            let record = self.resolve_handle(process, handle)?;
            let target_process = self.find_process(record.id.owner).ok_or(Error::Ebadf)?;
            let cookie = target_process
                .objects
                .find_local(record.id.binder)
                .and_then(|owned| owned.real_cookie())
                .unwrap_or(0);
            Ok((target_process, record.id.binder, cookie))
        }
    }

    fn execute_bc(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        cmd: BcCommand,
    ) -> Result<(), Error> {
        match cmd {
            BcCommand::Transaction(wt) => self.handle_transaction(process, thread, wt),
            BcCommand::Reply(wt) => self.handle_reply(process, thread, wt),
            BcCommand::RequestDeathNotification { handle, cookie } => {
                let record = self.resolve_handle(process, handle)?;
                let owner_process = self.find_process(record.id.owner).ok_or(Error::Ebadf)?;
                notifier::handle_request(
                    &owner_process.objects,
                    record.id.binder,
                    cookie,
                    thread.queue.clone(),
                );
                Ok(())
            }
            BcCommand::ClearDeathNotification { handle, cookie } => {
                let record = self.resolve_handle(process, handle)?;
                let owner_process = self.find_process(record.id.owner).ok_or(Error::Ebadf)?;
                if notifier::handle_clear(&owner_process.objects, record.id.binder, cookie, &thread.queue)
                {
                    let _ = thread.queue.write(QueueMsg::ClearDeathNotificationDone { cookie });
                }
                Ok(())
            }
            BcCommand::EnterLooper => {
                if thread.enter_looper(process.num_loopers_atomic()).is_err() {
                    let _ = thread.queue.write(QueueMsg::FailedReply);
                }
                Ok(())
            }
            BcCommand::ExitLooper => {
                if thread.exit_looper(process.num_loopers_atomic()).is_err() {
                    let _ = thread.queue.write(QueueMsg::FailedReply);
                }
                Ok(())
            }
            BcCommand::RegisterLooper => {
                thread.register_looper(process.pending_loopers_atomic());
                Ok(())
            }
        }
    }

    /// `BC_TRANSACTION` (spec §4.4 steps 1/3/5). Target-resolution and
    /// translation failures, and a closed destination queue, are in-band
    /// outcomes: they're queued back on `thread.queue` as `BR_FAILED_REPLY`/
    /// `BR_DEAD_REPLY` and the ioctl itself still reports success (spec §7),
    /// mirroring the looper-transition commands below.
    fn handle_transaction(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        wt: WireTransaction,
    ) -> Result<(), Error> {
        let (target_process, target_ptr, target_cookie) = match self.resolve_target(process, wt.target) {
            Ok(resolved) => resolved,
            Err(_) => {
                let _ = thread.queue.write(QueueMsg::FailedReply);
                return Ok(());
            }
        };

        let mut buf = wt.buf;
        if translate_write(&mut buf, &process.objects, process.queue.id()).is_err() {
            let _ = thread.queue.write(QueueMsg::FailedReply);
            return Ok(());
        }

        let one_way = wt.flags & TF_ONE_WAY != 0;
        let reply_queue = if one_way { None } else { Some(thread.queue.clone()) };
        let tx = Transaction {
            is_reply: false,
            code: wt.code,
            flags: wt.flags,
            sender_pid: process.pid,
            sender_euid: process.euid,
            target_ptr,
            target_cookie,
            buf,
            reply_queue,
        };
        if target_process.queue.write(QueueMsg::Transaction(tx)).is_err() {
            let _ = thread.queue.write(QueueMsg::DeadReply);
            return Ok(());
        }
        if !one_way {
            thread.incr_pending_replies();
        }
        let _ = thread.queue.write(QueueMsg::TransactionComplete);
        Ok(())
    }

    /// `BC_REPLY` (spec §4.4 BC_REPLY steps 1/2/3). The same in-band
    /// treatment as `handle_transaction` applies to an empty incoming stack,
    /// a translation failure, and a closed reply queue. Step 2's buffer
    /// reuse is realized by running the popped transaction's own `Buf`
    /// through `alloc::realloc` before the new payload is copied in.
    fn handle_reply(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        wt: WireTransaction,
    ) -> Result<(), Error> {
        let incoming = match thread.pop_incoming() {
            Some(incoming) => incoming,
            None => {
                let _ = thread.queue.write(QueueMsg::FailedReply);
                return Ok(());
            }
        };
        let reply_queue = match incoming.reply_queue.clone() {
            Some(queue) => queue,
            None => {
                let _ = thread.queue.write(QueueMsg::FailedReply);
                return Ok(());
            }
        };

        let data_size = wt.buf.data.len();
        let offsets_size = wt.buf.offsets.len() * 4;
        let mut buf = match alloc::realloc(incoming.buf, data_size, offsets_size) {
            Ok(buf) => buf,
            Err(_) => {
                let _ = thread.queue.write(QueueMsg::FailedReply);
                return Ok(());
            }
        };
        buf.data.copy_from_slice(&wt.buf.data);
        buf.offsets.copy_from_slice(&wt.buf.offsets);

        if translate_write(&mut buf, &process.objects, process.queue.id()).is_err() {
            let _ = thread.queue.write(QueueMsg::FailedReply);
            return Ok(());
        }

        let tx = Transaction {
            is_reply: true,
            code: wt.code,
            flags: wt.flags,
            sender_pid: process.pid,
            sender_euid: process.euid,
            target_ptr: 0,
            target_cookie: 0,
            buf,
            reply_queue: None,
        };
        if reply_queue.write(QueueMsg::Transaction(tx)).is_err() {
            let _ = thread.queue.write(QueueMsg::DeadReply);
            return Ok(());
        }
        let _ = thread.queue.write(QueueMsg::TransactionComplete);
        Ok(())
    }

    fn read_phase(&self, process: &Process, thread: &Thread, capacity: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        if capacity == 0 {
            return Ok(out);
        }

        let read_from_pool = thread.pending_replies() == 0;

        if read_from_pool && should_spawn_looper(process) {
            let spawn = BinderReturn::SpawnLooper;
            if spawn.encoded_len() <= capacity - out.len() {
                process.inc_pending_loopers();
                spawn.encode_into(&mut out);
            }
        }

        // A thread always drains its own inbox first -- that's where its
        // own acks (`BR_TRANSACTION_COMPLETE` after a send, or after a
        // reply) land -- and only falls through to the shared pool queue
        // once its inbox is empty and it isn't itself waiting on a reply.
        let source: &Queue<QueueMsg> = if !read_from_pool || thread.queue.size() > 0 {
            &thread.queue
        } else {
            &process.queue
        };

        match source.read() {
            ReadResult::Closed => {
                if out.is_empty() {
                    Err(Error::Ebadf)
                } else {
                    Ok(out)
                }
            }
            ReadResult::WouldBlock => Ok(out),
            ReadResult::Entry(msg) => {
                self.deliver(process, thread, source, msg, capacity, &mut out)?;
                Ok(out)
            }
        }
    }

    /// Encodes one dequeued message into `out`, putting it back unread (via
    /// `write_head`) if it does not fit in the remaining capacity (spec
    /// §4.6 property 7: never split or truncate a return item).
    fn deliver(
        &self,
        process: &Process,
        thread: &Thread,
        source: &Queue<QueueMsg>,
        msg: QueueMsg,
        capacity: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match msg {
            QueueMsg::Transaction(tx) => {
                let is_reply = tx.is_reply;
                let is_one_way = tx.is_one_way();
                let probe_len = 4
                    + 8 + 8 + 4 + 4 + 4 + 4 + 4
                    + pad8(tx.buf.data.len())
                    + pad8(tx.buf.offsets.len() * 4);
                if out.len() + probe_len > capacity {
                    source
                        .write_head(QueueMsg::Transaction(tx))
                        .map_err(|_| Error::Ebadf)?;
                    return Ok(());
                }
                let mut buf = tx.buf.clone();
                translate_read(&mut buf, &process.objects, process.queue.id())?;
                let wire = WireReturnTransaction {
                    target: tx.target_ptr,
                    cookie: tx.target_cookie,
                    code: tx.code,
                    flags: tx.flags,
                    sender_pid: tx.sender_pid,
                    sender_euid: tx.sender_euid,
                    buf,
                };
                let ret = if is_reply {
                    BinderReturn::Reply(wire)
                } else {
                    BinderReturn::Transaction(wire)
                };
                ret.encode_into(out);
                if is_reply {
                    thread.decr_pending_replies();
                } else if !is_one_way {
                    thread.push_incoming(tx);
                }
                Ok(())
            }
            other => {
                let ret = match &other {
                    QueueMsg::TransactionComplete => BinderReturn::TransactionComplete,
                    QueueMsg::FailedReply => BinderReturn::FailedReply,
                    QueueMsg::DeadReply => BinderReturn::DeadReply,
                    QueueMsg::ClearDeathNotificationDone { cookie } => {
                        BinderReturn::ClearDeathNotificationDone { cookie: *cookie }
                    }
                    QueueMsg::DeadBinder { cookie } => BinderReturn::DeadBinder { cookie: *cookie },
                    QueueMsg::Transaction(_) => unreachable!(),
                };
                if out.len() + ret.encoded_len() > capacity {
                    source.write_head(other).map_err(|_| Error::Ebadf)?;
                    return Ok(());
                }
                if matches!(other, QueueMsg::DeadReply) {
                    thread.decr_pending_replies();
                }
                ret.encode_into(out);
                Ok(())
            }
        }
    }
}

impl Default for BinderDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// `BR_SPAWN_LOOPER` policy (spec §4.7): ask the userspace pool for one
/// more thread whenever work is backing up on the process queue and the
/// pool hasn't hit its configured ceiling yet.
fn should_spawn_looper(process: &Process) -> bool {
    process.queue.size() > 1 && process.num_loopers() + process.pending_loopers() < process.max_threads()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_bc_transaction(target: u64, code: u32, flags: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes()); // BC_TRANSACTION
        out.extend_from_slice(&target.to_le_bytes());
        out.extend_from_slice(&code.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(data);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }

    fn encode_bc_reply(code: u32, flags: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&2u32.to_le_bytes()); // BC_REPLY
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&code.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(data);
        while out.len() % 8 != 0 {
            out.push(0);
        }
        out
    }

    fn decode_first_brcmd(buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[0..4].try_into().unwrap())
    }

    #[test]
    fn hello_round_trip_through_context_manager() {
        let device = BinderDevice::new();
        let server = device.open(1, 0, true);
        let client = device.open(2, 0, true);

        device.set_context_mgr(&server, 0, 0).unwrap();

        // server enters the looper so it can receive pool work:
        let mut enter = Vec::new();
        enter.extend_from_slice(&5u32.to_le_bytes()); // BC_ENTER_LOOPER
        device.write_read(&server, 100, &enter, 64).unwrap();

        // client sends a transaction at handle 0 (the context manager):
        let payload = b"hello!!!";
        let bc = encode_bc_transaction(0, 42, 0, payload);
        let client_result = device.write_read(&client, 200, &bc, 4096).unwrap();
        assert_eq!(client_result.write_consumed, bc.len());
        assert_eq!(decode_first_brcmd(&client_result.read), 3); // BR_TRANSACTION_COMPLETE

        // server's next write_read (empty write) picks the transaction up
        // from the pool:
        let server_result = device.write_read(&server, 100, &[], 4096).unwrap();
        assert_eq!(decode_first_brcmd(&server_result.read), 1); // BR_TRANSACTION
        assert!(server_result.read.windows(8).any(|w| w == payload));

        // server replies:
        let reply = encode_bc_reply(0, 0, b"hi back!");
        let server_reply_result = device.write_read(&server, 100, &reply, 4096).unwrap();
        assert_eq!(decode_first_brcmd(&server_reply_result.read), 3); // BR_TRANSACTION_COMPLETE

        // client blocks on its own thread queue for the reply:
        let client_reply_result = device.write_read(&client, 200, &[], 4096).unwrap();
        assert_eq!(decode_first_brcmd(&client_reply_result.read), 2); // BR_REPLY
    }

    #[test]
    fn death_notification_fires_on_teardown() {
        let device = BinderDevice::new();
        let owner = device.open(1, 0, true);
        let watcher = device.open(2, 0, true);

        device.set_context_mgr(&owner, 0, 0).unwrap();

        // watcher needs a handle to the owner's object to request death on
        // it; model the owner having already sent it out once by interning
        // it directly on both sides, as `translate_write`/`translate_read`
        // would have done for a real cross-process hop.
        owner.objects.intern_local(0x9);
        let record = owner.objects.find_local(0x9).unwrap();
        record.set_real_cookie_if_absent(0x9);
        let handle_record = watcher.objects.intern(owner.queue.id(), 0x9);
        let handle = handle_record.handle().unwrap();

        let mut bc = Vec::new();
        bc.extend_from_slice(&3u32.to_le_bytes()); // BC_REQUEST_DEATH_NOTIFICATION
        bc.extend_from_slice(&(handle as u64).to_le_bytes());
        bc.extend_from_slice(&0xD1u64.to_le_bytes());
        device.write_read(&watcher, 1, &bc, 64).unwrap();

        device.release(&owner);

        let result = device.write_read(&watcher, 1, &[], 64).unwrap();
        assert_eq!(decode_first_brcmd(&result.read), 6); // BR_DEAD_BINDER
    }

    #[test]
    fn second_context_mgr_claim_from_different_euid_is_rejected() {
        let device = BinderDevice::new();
        let a = device.open(1, 0, false);
        let b = device.open(2, 1, false);
        device.set_context_mgr(&a, 0, 0).unwrap();
        assert!(matches!(device.set_context_mgr(&b, 0, 0), Err(Error::Eperm)));
    }
}
