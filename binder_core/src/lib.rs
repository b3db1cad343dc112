// SPDX-License-Identifier: BSD-3-Clause

//! Core of a Binder-style in-kernel IPC multiplexer: an object registry,
//! flat-object translator, transaction engine, and death-notifier fan-out,
//! all driven through one blocking `write_read` call per simulated ioctl.

pub mod alloc;
pub mod context_mgr;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod ioctl;
pub mod notifier;
pub mod process;
pub mod registry;
pub mod translate;
pub mod wire;

pub use context_mgr::{ContextMgr, ContextMgrTable};
pub use dispatch::{BinderDevice, DispatchError, WriteReadResult, PROTOCOL_VERSION};
pub use error::Error;
pub use ids::{BinderPtr, Cookie, ObjId, QueueId};
pub use ioctl::{Ioctl, OpenFile, WriteReadRequest};
pub use process::{LooperState, Process, Thread};
pub use registry::{Notifier, ObjectRecord, ObjectTable};
pub use wire::{
    BcCommand, BcReader, BinderReturn, Buf, FlatObject, FlatObjectType, QueueMsg, Transaction,
    WireReturnTransaction, WireTransaction, MAX_TRANSACTION_SIZE, TF_ONE_WAY,
};
