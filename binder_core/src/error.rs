// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

/// Synchronous errors returned directly from the ioctl-equivalent entry
/// points (spec §7: "malformed input, ... allocation failures, unknown
/// command bytes"). Named after the errno the real driver would return so
/// the mapping to §6.1's exit-code table stays obvious.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed command stream, bad offsets, or a non-owner descriptor
    /// passed through the write path.
    Einval,
    /// A descriptor failed to translate on read (owner-typed object
    /// reaching the read path).
    Efault,
    /// Allocation failure in the message/buffer allocator.
    Enomem,
    /// The calling process or thread was not found (closed fd, exited
    /// thread).
    Ebadf,
    /// Device opened twice on the same fd slot.
    Ebusy,
    /// Context-manager euid mismatch.
    Eperm,
    /// Read buffer too small to hold the next produced command.
    Enospc,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Einval => "invalid argument",
            Error::Efault => "bad address",
            Error::Enomem => "out of memory",
            Error::Ebadf => "bad file descriptor",
            Error::Ebusy => "device busy",
            Error::Eperm => "operation not permitted",
            Error::Enospc => "no space left on device",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Error {}
