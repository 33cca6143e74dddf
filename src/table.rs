//! Per-destination column table, the backing store of every communication
//! buffer in the runtime.
//!
//! A [`ColumnTable`] is conceptually a `P x R` matrix of fixed-size slots
//! stored so that one column is contiguous. Column `p` holds the data
//! addressed to (or received from) rank `p`, which lets a whole table be
//! drained with a single variable-length all-to-all: the per-column starts
//! are the send offsets and the per-column used byte counts are the send
//! counts.
//!
//! The table only ever grows, and growth at least doubles the row count, so
//! a steady-state workload converges to zero allocations per superstep.
//! `reset` clears the used counts but keeps the capacity.

use tracing::debug;

use crate::error::{BspError, Result};
use crate::transport::Transport;

/// Size of the alignment unit inside a column. All variable-size records are
/// padded to this boundary and all in-column offsets are expressed in it.
pub const SLOT_BYTES: usize = 8;

/// Number of slots needed to hold `bytes` bytes.
#[inline]
pub fn slot_count(bytes: usize) -> usize {
    (bytes + SLOT_BYTES - 1) / SLOT_BYTES
}

#[inline]
pub(crate) fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

#[inline]
pub(crate) fn write_u32(data: &mut [u8], at: usize, v: u32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

#[inline]
pub(crate) fn write_u64(data: &mut [u8], at: usize, v: u64) {
    data[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Allocate a zeroed byte vector, reporting failure instead of aborting.
fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| BspError::OutOfMemory { requested: len })?;
    v.resize(len, 0);
    Ok(v)
}

/// Append-only table with one contiguous column per peer rank.
#[derive(Debug)]
pub struct ColumnTable {
    nprocs: usize,
    /// Slots currently allocated per column.
    rows: usize,
    /// Slot size in bytes. The delivery table uses [`SLOT_BYTES`]; tables of
    /// fixed-size records use the record size.
    slot: usize,
    data: Vec<u8>,
    /// Used slots per column. Invariant: `used[p] <= rows`.
    used: Vec<usize>,
    // All-to-all scratch, kept here so an exchange allocates nothing.
    send_counts: Vec<usize>,
    send_offsets: Vec<usize>,
    recv_counts: Vec<usize>,
    recv_offsets: Vec<usize>,
}

impl ColumnTable {
    pub fn new(nprocs: usize, rows: usize, slot: usize) -> Result<Self> {
        let data = alloc_zeroed(nprocs * rows * slot)?;
        Ok(ColumnTable {
            nprocs,
            rows,
            slot,
            data,
            used: vec![0; nprocs],
            send_counts: vec![0; nprocs],
            send_offsets: vec![0; nprocs],
            recv_counts: vec![0; nprocs],
            recv_offsets: vec![0; nprocs],
        })
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn used(&self, p: usize) -> usize {
        self.used[p]
    }

    pub fn set_used(&mut self, p: usize, slots: usize) {
        debug_assert!(slots <= self.rows);
        self.used[p] = slots;
    }

    /// Clear the used counts; capacity is retained.
    pub fn reset(&mut self) {
        self.used.iter_mut().for_each(|u| *u = 0);
    }

    /// Shrink back to `rows` rows and clear. Used by the explicit
    /// buffer-reset call; growth elsewhere is monotonic.
    pub fn reset_rows(&mut self, rows: usize) -> Result<()> {
        self.data = alloc_zeroed(self.nprocs * rows * self.slot)?;
        self.rows = rows;
        self.reset();
        Ok(())
    }

    /// Byte offset of the start of column `p`.
    #[inline]
    pub fn col_start(&self, p: usize) -> usize {
        p * self.rows * self.slot
    }

    /// Whole backing store.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grow by at least `extra_rows`, preserving the used prefix of every
    /// column.
    pub fn expand(&mut self, extra_rows: usize) -> Result<()> {
        let new_rows = self.rows + extra_rows;
        let mut new_data = alloc_zeroed(self.nprocs * new_rows * self.slot)?;
        for p in 0..self.nprocs {
            let n = self.used[p] * self.slot;
            let src = p * self.rows * self.slot;
            let dst = p * new_rows * self.slot;
            new_data[dst..dst + n].copy_from_slice(&self.data[src..src + n]);
        }
        debug!(rows = self.rows, new_rows, slot = self.slot, "column table grown");
        self.data = new_data;
        self.rows = new_rows;
        Ok(())
    }

    /// Make sure column `p` can take `needed` more slots, doubling or growing
    /// to exactly what is needed, whichever is larger.
    pub fn ensure_free(&mut self, p: usize, needed: usize) -> Result<()> {
        let free = self.rows - self.used[p];
        if needed > free {
            let extra = self.rows.max(needed - free);
            self.expand(extra)?;
        }
        Ok(())
    }

    /// Drain this table into `recv` with a symmetric variable-length
    /// all-to-all. `recv.used` must already hold the expected slot counts
    /// (established by the fixed-size pre-exchange); they act as receive
    /// capacities.
    pub fn exchange(&mut self, recv: &mut ColumnTable, tp: &mut dyn Transport) -> Result<()> {
        for p in 0..self.nprocs {
            self.send_offsets[p] = self.col_start(p);
            self.send_counts[p] = self.used[p] * self.slot;
            recv.recv_offsets[p] = recv.col_start(p);
            recv.recv_counts[p] = recv.used[p] * recv.slot;
        }
        // recv scratch lives on the receiving table, but the borrow must not
        // overlap with its data buffer; split it out first.
        let recv_counts = std::mem::take(&mut recv.recv_counts);
        let recv_offsets = std::mem::take(&mut recv.recv_offsets);
        let r = tp.alltoallv(
            &self.data,
            &self.send_counts,
            &self.send_offsets,
            &mut recv.data,
            &recv_counts,
            &recv_offsets,
        );
        recv.recv_counts = recv_counts;
        recv.recv_offsets = recv_offsets;
        r
    }
}
