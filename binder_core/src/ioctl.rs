// SPDX-License-Identifier: BSD-3-Clause

//! The narrow front-end a real character-device driver would implement
//! (spec §6). `BinderDevice::write_read` and friends already do the real
//! work; this module is just the calling convention: one `OpenFile` per
//! simulated `open()`, carrying the process and calling thread implicitly
//! the way a real fd carries them through the kernel's `current` pointer.

use std::sync::Arc;

use crate::dispatch::{BinderDevice, DispatchError};
use crate::error::Error;
use crate::ids::{BinderPtr, Cookie};
use crate::process::Process;

/// One `BINDER_WRITE_READ` call's request/response pair.
pub struct WriteReadRequest<'a> {
    pub write: &'a [u8],
    pub read_capacity: usize,
    pub write_consumed: usize,
    pub read: Vec<u8>,
}

impl<'a> WriteReadRequest<'a> {
    pub fn new(write: &'a [u8], read_capacity: usize) -> Self {
        WriteReadRequest {
            write,
            read_capacity,
            write_consumed: 0,
            read: Vec::new(),
        }
    }
}

/// Simulated ioctl surface. A real driver's `file_operations::unlocked_ioctl`
/// would switch on the ioctl number and land on one of these.
pub trait Ioctl {
    fn write_read(&self, req: &mut WriteReadRequest) -> Result<(), Error>;
    fn set_max_threads(&self, n: u32) -> Result<(), Error>;
    fn set_context_mgr(&self, obj: BinderPtr, cookie: Cookie) -> Result<(), Error>;
    fn thread_exit(&self) -> Result<(), Error>;
    fn version(&self) -> u32;
}

/// Stands in for an open file descriptor: the device it was opened against,
/// the process record `open()` created, and the calling thread's pid.
///
/// Real binder resolves the calling thread from the kernel's `current`
/// pointer on every ioctl; this simulation takes it once at construction
/// since there is no OS thread scheduler underneath to ask.
pub struct OpenFile {
    device: Arc<BinderDevice>,
    process: Arc<Process>,
    thread_pid: u32,
}

impl OpenFile {
    pub fn new(device: Arc<BinderDevice>, process: Arc<Process>, thread_pid: u32) -> Self {
        OpenFile {
            device,
            process,
            thread_pid,
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}

impl Ioctl for OpenFile {
    fn write_read(&self, req: &mut WriteReadRequest) -> Result<(), Error> {
        match self
            .device
            .write_read(&self.process, self.thread_pid, req.write, req.read_capacity)
        {
            Ok(result) => {
                req.write_consumed = result.write_consumed;
                req.read = result.read;
                Ok(())
            }
            Err(DispatchError {
                write_consumed,
                error,
            }) => {
                req.write_consumed = write_consumed;
                Err(error)
            }
        }
    }

    fn set_max_threads(&self, n: u32) -> Result<(), Error> {
        self.device.set_max_threads(&self.process, n);
        Ok(())
    }

    fn set_context_mgr(&self, obj: BinderPtr, cookie: Cookie) -> Result<(), Error> {
        self.device.set_context_mgr(&self.process, obj, cookie)
    }

    fn thread_exit(&self) -> Result<(), Error> {
        self.device.thread_exit(&self.process, self.thread_pid);
        Ok(())
    }

    fn version(&self) -> u32 {
        self.device.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_the_device() {
        let device = Arc::new(BinderDevice::new());
        let process = device.open(1, 0, true);
        let file = OpenFile::new(device.clone(), process, 100);
        assert_eq!(file.version(), device.version());
    }

    #[test]
    fn write_read_through_the_trait_reaches_the_device() {
        let device = Arc::new(BinderDevice::new());
        let process = device.open(1, 0, true);
        let file = OpenFile::new(device, process, 100);

        file.set_context_mgr(0xC0FFEE, 0).unwrap();

        let enter = 5u32.to_le_bytes(); // BC_ENTER_LOOPER
        let mut req = WriteReadRequest::new(&enter, 0);
        file.write_read(&mut req).unwrap();
        assert_eq!(req.write_consumed, 4);
    }
}
