//! CRC-16 over header+payload (`spec.md` §3, §4.1).
//!
//! Borrows the `crc` crate's const-table-driven API — the teacher crate
//! (`nyx-stream`) has no frame-CRC of its own, so this follows the usage
//! pattern from `dxkb-split-link`, the pack's other frame-oriented link
//! protocol crate that also reaches for `crc` rather than hand-rolling a
//! table.

use crc::{Crc, CRC_16_IBM_3740};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Computes the CRC-16 over `bytes` (header with `crc` field zeroed, then
/// payload, already concatenated by the caller).
pub fn compute(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}
