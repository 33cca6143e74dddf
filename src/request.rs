//! The request table: fixed-size records describing the request half of a
//! `get`.
//!
//! A `get` needs the target to act: at the barrier, requests travel to their
//! targets, and each target rewrites every request it received into a `put`
//! delivery carrying the requested bytes back to the requester. The table
//! also keeps, per destination, the exact number of delivery slots those
//! rewritten puts will occupy, so the requester can size its receive-side
//! delivery table before the payload exchange.
//!
//! Record layout (one record = 3 slots = 24 bytes):
//!
//! ```text
//! slot 0: size:u32 | offset:u32
//! slot 1: src:u64   target-space address, already translated
//! slot 2: dst:u64   requester-space destination address
//! ```

use std::slice;

use crate::delivery::{DeliveryTable, RecordInfo, RECORD_SLOTS};
use crate::error::Result;
use crate::table::{read_u32, read_u64, slot_count, write_u32, write_u64, ColumnTable};
use crate::transport::Transport;

/// On-wire size of one request record.
pub const REQ_RECORD_BYTES: usize = 24;

/// One `get` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqRecord {
    /// Bytes requested.
    pub size: u32,
    /// Offset from `src` in bytes.
    pub offset: u32,
    /// Source address in the target's space.
    pub src: u64,
    /// Destination address in the requester's space.
    pub dst: u64,
}

/// Column table of fixed-size get requests.
#[derive(Debug)]
pub struct RequestTable {
    t: ColumnTable,
    /// Delivery slots the rewritten puts will take per destination.
    data_slots: Vec<usize>,
}

impl RequestTable {
    pub fn new(nprocs: usize, rows: usize) -> Result<Self> {
        Ok(RequestTable {
            t: ColumnTable::new(nprocs, rows, REQ_RECORD_BYTES)?,
            data_slots: vec![0; nprocs],
        })
    }

    pub fn rows(&self) -> usize {
        self.t.rows()
    }

    pub fn used(&self, p: usize) -> usize {
        self.t.used(p)
    }

    pub fn set_used(&mut self, p: usize, records: usize) {
        self.t.set_used(p, records)
    }

    /// Delivery slots rank `p` will append for our requests.
    pub fn data_slots(&self, p: usize) -> usize {
        self.data_slots[p]
    }

    pub fn any_used(&self) -> bool {
        (0..self.t.nprocs()).any(|p| self.t.used(p) > 0)
    }

    pub fn reset(&mut self) {
        self.data_slots.iter_mut().for_each(|d| *d = 0);
        self.t.reset();
    }

    pub fn reset_rows(&mut self, rows: usize) -> Result<()> {
        self.data_slots.iter_mut().for_each(|d| *d = 0);
        self.t.reset_rows(rows)
    }

    pub fn expand(&mut self, extra_rows: usize) -> Result<()> {
        self.t.expand(extra_rows)
    }

    pub fn exchange(&mut self, recv: &mut RequestTable, tp: &mut dyn Transport) -> Result<()> {
        self.t.exchange(&mut recv.t, tp)
    }

    /// Queue a request addressed to rank `dst`.
    pub fn push(&mut self, dst: usize, rec: ReqRecord) -> Result<()> {
        self.data_slots[dst] += RECORD_SLOTS + slot_count(rec.size as usize);
        self.t.ensure_free(dst, 1)?;
        let at = self.t.col_start(dst) + self.t.used(dst) * REQ_RECORD_BYTES;
        let data = self.t.bytes_mut();
        write_u32(data, at, rec.size);
        write_u32(data, at + 4, rec.offset);
        write_u64(data, at + 8, rec.src);
        write_u64(data, at + 16, rec.dst);
        let used = self.t.used(dst);
        self.t.set_used(dst, used + 1);
        Ok(())
    }

    fn record(&self, p: usize, i: usize) -> ReqRecord {
        let at = self.t.col_start(p) + i * REQ_RECORD_BYTES;
        let data = self.t.bytes();
        ReqRecord {
            size: read_u32(data, at),
            offset: read_u32(data, at + 4),
            src: read_u64(data, at + 8),
            dst: read_u64(data, at + 16),
        }
    }

    /// Rewrite received requests into put deliveries addressed back to the
    /// requesters, reading the requested bytes out of this process's memory.
    ///
    /// The caller guarantees every `src + offset .. + size` range lies inside
    /// a region this process registered (the requester translated `src`
    /// through its view of our register).
    pub fn execute(&self, deliv: &mut DeliveryTable) -> Result<()> {
        for p in 0..self.t.nprocs() {
            for i in 0..self.t.used(p) {
                let rec = self.record(p, i);
                let src = (rec.src + rec.offset as u64) as usize as *const u8;
                let payload = unsafe { slice::from_raw_parts(src, rec.size as usize) };
                deliv.push(p, RecordInfo::Put { dst: rec.dst }, &[payload])?;
            }
        }
        Ok(())
    }
}
