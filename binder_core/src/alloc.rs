// SPDX-License-Identifier: BSD-3-Clause

//! Message & Buffer Allocator (C2, spec §4.1).
//!
//! The original kernel implementation is a single `align(header) +
//! align(data) + align(offsets)` allocation with an in-place realloc fast
//! path. A `Vec` already gives us that: growing or shrinking within
//! capacity reuses the existing allocation, and only a capacity increase
//! triggers a move — so this module is a thin, explicit wrapper rather than
//! a custom allocator, kept separate so the reuse-vs-reallocate decision
//! stays a named operation instead of being inlined into the transaction
//! engine.

use crate::error::Error;
use crate::wire::Buf;

/// Allocates a zeroed buffer sized for `data_size` bytes of payload and
/// `offsets_size` bytes of offsets table (a `u32` per entry).
pub fn alloc(data_size: usize, offsets_size: usize) -> Result<Buf, Error> {
    Buf::validate_sizes(data_size, offsets_size)?;
    Ok(Buf {
        data: vec![0u8; data_size],
        offsets: vec![0u32; offsets_size / 4],
    })
}

/// Resizes `buf` in place to the new sizes, reusing the existing
/// allocation when it fits and growing it otherwise — the `Vec` analogue
/// of the kernel's "reuse or reallocate" rule.
pub fn realloc(mut buf: Buf, data_size: usize, offsets_size: usize) -> Result<Buf, Error> {
    Buf::validate_sizes(data_size, offsets_size)?;
    buf.data.resize(data_size, 0);
    buf.offsets.resize(offsets_size / 4, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zeroes_requested_sizes() {
        let buf = alloc(16, 4).unwrap();
        assert_eq!(buf.data.len(), 16);
        assert_eq!(buf.offsets.len(), 1);
    }

    #[test]
    fn realloc_shrinks_and_grows() {
        let buf = alloc(32, 0).unwrap();
        let buf = realloc(buf, 8, 0).unwrap();
        assert_eq!(buf.data.len(), 8);
        let buf = realloc(buf, 64, 4).unwrap();
        assert_eq!(buf.data.len(), 64);
        assert_eq!(buf.offsets.len(), 1);
    }

    #[test]
    fn realloc_rejects_oversized_request() {
        let buf = alloc(8, 0).unwrap();
        assert!(realloc(buf, crate::wire::MAX_TRANSACTION_SIZE + 1, 0).is_err());
    }
}
