//! The superstep engine: accumulated-operation state and the barrier
//! protocol that drains it.
//!
//! [`BspState`] owns the four communication tables (send/receive sides of
//! the delivery and request tables), the memory register, and the message
//! queue, and implements both the operation primitives that fill them and
//! the fixed barrier sequence that empties them:
//!
//! 1. drain the message-queue window and clear the receive tables,
//! 2. all-to-all one fixed `(request count, delivery bytes, flags)` triple
//!    per destination,
//! 3. size the receive tables from the advertised counts,
//! 4. if anyone has gets: exchange the request tables and rewrite received
//!    requests into put deliveries,
//! 5. exchange the delivery tables,
//! 6. apply the received deliveries,
//! 7. clear the send tables and pack the register.
//!
//! Pre-exchanging the counts lets both sides allocate exactly enough
//! receive space without per-record acknowledgements, and rewriting gets
//! into puts at the target keeps the payload transport a single
//! variable-length all-to-all.
//!
//! [`Bsp`] couples one engine with one boxed transport and a timer into the
//! process-level API.

use tracing::{error, info, trace};

use crate::collectives;
use crate::defaults::{DELIV_MIN_SLOTS, REQ_MIN_ROWS};
use crate::delivery::{Class, DeliveryTable, RecordInfo};
use crate::error::{BspError, Result};
use crate::global::{GlobalArrays, GlobalHandle};
use crate::memreg::MemoryRegister;
use crate::mesgqueue::MessageQueue;
use crate::request::{ReqRecord, RequestTable};
use crate::table::SLOT_BYTES;
use crate::timing::{warmup, Timer};
use crate::transport::Transport;

/// Bytes of the fixed pre-exchange word per destination.
pub(crate) const TRIPLE_BYTES: usize = 12;

/// Pre-exchange flag: the sender issued at least one get this superstep.
pub(crate) const FLAG_GETS: u32 = 1;
/// Pre-exchange flag: the sender has messages queued.
pub(crate) const FLAG_MESSAGES: u32 = 2;
/// Pre-exchange flag: the sender used high-performance variants.
pub(crate) const FLAG_HP: u32 = 4;
/// Registration-request count occupies the bits above the flags.
pub(crate) const REG_SHIFT: u32 = 4;

pub(crate) fn triple(buf: &[u8], p: usize) -> (u32, u32, u32) {
    let at = p * TRIPLE_BYTES;
    (
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()),
        u32::from_le_bytes(buf[at + 4..at + 8].try_into().unwrap()),
        u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap()),
    )
}

fn set_triple(buf: &mut [u8], p: usize, req: u32, deliv_bytes: u32, flags: u32) {
    let at = p * TRIPLE_BYTES;
    buf[at..at + 4].copy_from_slice(&req.to_le_bytes());
    buf[at + 4..at + 8].copy_from_slice(&deliv_bytes.to_le_bytes());
    buf[at + 8..at + 12].copy_from_slice(&flags.to_le_bytes());
}

/// Accumulated superstep state of one process (or of one node hosting many
/// logical processes).
#[derive(Debug)]
pub struct BspState {
    nprocs: usize,
    rank: usize,
    pub(crate) memreg: MemoryRegister,
    pub(crate) queue: MessageQueue,
    deliv: DeliveryTable,
    deliv_recv: DeliveryTable,
    req: RequestTable,
    req_recv: RequestTable,
    send_index: Vec<u8>,
    recv_index: Vec<u8>,
}

impl BspState {
    pub fn new(nprocs: usize, rank: usize) -> Result<Self> {
        if nprocs == 0 || rank >= nprocs {
            return Err(BspError::Init(format!(
                "rank {rank} outside the {nprocs}-rank group"
            )));
        }
        Ok(BspState {
            nprocs,
            rank,
            memreg: MemoryRegister::new(nprocs, rank),
            queue: MessageQueue::new(),
            deliv: DeliveryTable::new(nprocs, DELIV_MIN_SLOTS)?,
            deliv_recv: DeliveryTable::new(nprocs, DELIV_MIN_SLOTS)?,
            req: RequestTable::new(nprocs, REQ_MIN_ROWS)?,
            req_recv: RequestTable::new(nprocs, REQ_MIN_ROWS)?,
            send_index: vec![0; nprocs * TRIPLE_BYTES],
            recv_index: vec![0; nprocs * TRIPLE_BYTES],
        })
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn check_pid(&self, pid: usize) -> Result<()> {
        if pid >= self.nprocs {
            return Err(BspError::Internal(format!(
                "pid {pid} outside the {}-rank group",
                self.nprocs
            )));
        }
        Ok(())
    }

    // Operation primitives. Each appends to a table; nothing becomes
    // visible before the next sync.

    /// Export the memory at `addr` for one-sided access from the next
    /// superstep on.
    ///
    /// The registration intent is replayed on every process at the barrier;
    /// all processes must issue their push/pop intents in the same order.
    ///
    /// # Safety
    ///
    /// The region `addr .. addr + nbytes` must stay valid, and must not be
    /// read or written by the caller while a `sync` that may deliver into it
    /// is running, until a matching `pop_reg` has taken effect.
    pub unsafe fn push_reg(&mut self, addr: usize, nbytes: usize) -> Result<()> {
        let _ = nbytes; // recorded by the caller's contract, not the wire format
        for p in 0..self.nprocs {
            self.deliv
                .push(p, RecordInfo::PushReg { addr: addr as u64 }, &[])?;
        }
        Ok(())
    }

    /// Retire the most recent registration of `addr` at the next barrier.
    /// An unmatched pop aborts the group when the barrier replays it.
    pub fn pop_reg(&mut self, addr: usize) -> Result<()> {
        self.deliv
            .push(self.rank, RecordInfo::PopReg { addr: addr as u64 }, &[])
    }

    /// Buffered one-sided write: copy `src` into the registered region
    /// `dst + offset` on `pid` at the next barrier. `src` is captured now.
    pub fn put(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.check_pid(pid)?;
        let base = self.memreg.memoized_find(pid, dst as u64)?;
        self.deliv.push(
            pid,
            RecordInfo::Put {
                dst: base + offset as u64,
            },
            &[src],
        )
    }

    /// High-performance put. In the single-context engine this is the
    /// buffered put; callers that need true overlap must keep `src`
    /// untouched until the next barrier anyway, which the buffered form
    /// trivially satisfies.
    pub fn hpput(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.put(pid, src, dst, offset)
    }

    /// One-sided read: at the next barrier, fetch `nbytes` from the
    /// registered region `src + offset` on `pid` into local memory at
    /// `dst`.
    ///
    /// # Safety
    ///
    /// `dst .. dst + nbytes` must be valid for writes when the next `sync`
    /// runs and must not be accessed concurrently with it.
    pub unsafe fn get(
        &mut self,
        pid: usize,
        src: usize,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.check_pid(pid)?;
        let base = self.memreg.memoized_find(pid, src as u64)?;
        self.req.push(
            pid,
            ReqRecord {
                size: nbytes as u32,
                offset: offset as u32,
                src: base,
                dst: dst as u64,
            },
        )
    }

    /// High-performance get; equivalent to [`get`](Self::get) here.
    ///
    /// # Safety
    ///
    /// Same contract as [`get`](Self::get).
    pub unsafe fn hpget(
        &mut self,
        pid: usize,
        src: usize,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.get(pid, src, offset, dst, nbytes)
    }

    /// Queue a message for `pid`'s next inbox window. `tag` must be exactly
    /// the current send tag size.
    pub fn send(&mut self, pid: usize, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.check_pid(pid)?;
        if tag.len() != self.queue.send_tag_size {
            return Err(BspError::Internal(format!(
                "send tag of {} bytes, current tag size is {}",
                tag.len(),
                self.queue.send_tag_size
            )));
        }
        self.deliv.push(
            pid,
            RecordInfo::Send {
                payload_len: payload.len() as u32,
            },
            &[tag, payload],
        )
    }

    /// Request a new tag size and report the previous one through `size`.
    /// The change applies to sends issued from the next superstep on.
    pub fn set_tagsize(&mut self, size: &mut usize) -> Result<()> {
        let requested = *size;
        self.deliv.push(
            self.rank,
            RecordInfo::SetTag {
                size: requested as u32,
            },
            &[],
        )?;
        *size = self.queue.send_tag_size;
        Ok(())
    }

    /// `(messages, payload bytes)` in the current inbox window.
    pub fn qsize(&self) -> (usize, usize) {
        self.queue.qsize()
    }

    /// Tag and payload size of the current message; `None` on an empty
    /// inbox.
    pub fn get_tag(&self) -> Option<(usize, &[u8])> {
        self.queue.get_tag(&self.deliv_recv)
    }

    /// Copy up to `dst.len()` bytes of the current payload and advance.
    pub fn move_into(&mut self, dst: &mut [u8]) -> usize {
        self.queue.move_into(&self.deliv_recv, dst)
    }

    /// Tag and payload of the current message in place; the slices stay
    /// valid until the next barrier. Advances the queue.
    pub fn hpmove(&mut self) -> Option<(&[u8], &[u8])> {
        self.queue.hpmove(&self.deliv_recv)
    }

    // Entry points for the multi-context router: the caller has already
    // translated the destination address through its own register view.

    pub(crate) fn put_translated(&mut self, rank: usize, dst: u64, src: &[u8]) -> Result<()> {
        self.deliv.push(rank, RecordInfo::Put { dst }, &[src])
    }

    pub(crate) fn get_translated(
        &mut self,
        rank: usize,
        src: u64,
        offset: u32,
        dst: u64,
        nbytes: u32,
    ) -> Result<()> {
        self.req.push(
            rank,
            ReqRecord {
                size: nbytes,
                offset,
                src,
                dst,
            },
        )
    }

    pub(crate) fn send_tag_size(&self) -> usize {
        self.queue.send_tag_size
    }

    pub(crate) fn force_tag_size(&mut self, size: usize) {
        self.queue.send_tag_size = size;
        self.queue.recv_tag_size = size;
    }

    // Barrier protocol, split so the multi-context driver can interpose on
    // the pre-exchange word.

    /// Step 1: open the next message window and clear the receive tables.
    pub(crate) fn begin_sync(&mut self) {
        self.queue.sync();
        self.req_recv.reset();
        self.deliv_recv.reset();
    }

    /// Step 2 (send side): fill the per-destination pre-exchange triples.
    /// `extra_flags` is OR-ed in by multi-context callers (hp bit,
    /// registration count).
    pub(crate) fn exchange_plan(&mut self, extra_flags: u32) {
        let mut flags = extra_flags;
        if self.req.any_used() {
            flags |= FLAG_GETS;
        }
        if (0..self.nprocs).any(|p| self.deliv.count(p, Class::Send) > 0) {
            flags |= FLAG_MESSAGES;
        }
        for p in 0..self.nprocs {
            set_triple(
                &mut self.send_index,
                p,
                self.req.used(p) as u32,
                (self.deliv.used(p) * SLOT_BYTES) as u32,
                flags,
            );
        }
    }

    pub(crate) fn recv_index(&self) -> &[u8] {
        &self.recv_index
    }

    /// Steps 3–7, using the received pre-exchange triples in `recv_index`.
    pub(crate) fn finish_sync(&mut self, tp: &mut dyn Transport) -> Result<()> {
        let mut maxreq = 0usize;
        let mut maxdel = 0usize;
        let mut any_gets = false;
        for p in 0..self.nprocs {
            let (req_n, del_bytes, flags) = triple(&self.recv_index, p);
            maxreq = maxreq.max(req_n as usize);
            maxdel = maxdel.max(del_bytes as usize / SLOT_BYTES + self.req.data_slots(p));
            any_gets |= flags & FLAG_GETS != 0;
        }

        if self.req_recv.rows() < maxreq {
            let extra = self.req_recv.rows().max(maxreq - self.req_recv.rows());
            self.req_recv.expand(extra)?;
        }
        if self.deliv_recv.rows() < maxdel {
            let extra = self.deliv_recv.rows().max(maxdel - self.deliv_recv.rows());
            self.deliv_recv.expand(extra)?;
        }
        for p in 0..self.nprocs {
            let (req_n, del_bytes, _) = triple(&self.recv_index, p);
            self.req_recv.set_used(p, req_n as usize);
            self.deliv_recv
                .set_used(p, del_bytes as usize / SLOT_BYTES + self.req.data_slots(p));
        }

        trace!(any_gets, maxreq, maxdel, "barrier sized");

        if any_gets {
            self.req.exchange(&mut self.req_recv, tp)?;
            self.req_recv.execute(&mut self.deliv)?;
        }

        self.deliv.exchange(&mut self.deliv_recv, tp)?;
        self.deliv_recv
            .execute(&mut self.memreg, &mut self.queue, self.rank)?;

        self.req.reset();
        self.deliv.reset();
        self.memreg.pack();
        Ok(())
    }

    /// Step 2 (wire): all-to-all the pre-exchange triples.
    pub(crate) fn exchange_index(&mut self, tp: &mut dyn Transport) -> Result<()> {
        tp.alltoall(&self.send_index, TRIPLE_BYTES, &mut self.recv_index)
    }

    /// Run a full barrier against `tp`.
    pub fn sync(&mut self, tp: &mut dyn Transport) -> Result<()> {
        self.begin_sync();
        self.exchange_plan(0);
        self.exchange_index(tp)?;
        self.finish_sync(tp)
    }

    /// Shrink every table back to its minimum size and drop any undelivered
    /// messages. The send-side tables must be empty (call between
    /// supersteps).
    pub fn reset_buffers(&mut self) -> Result<()> {
        self.req.reset_rows(REQ_MIN_ROWS)?;
        self.req_recv.reset_rows(REQ_MIN_ROWS)?;
        self.deliv.reset_rows(DELIV_MIN_SLOTS)?;
        self.deliv_recv.reset_rows(DELIV_MIN_SLOTS)?;
        self.queue.sync();
        Ok(())
    }

    /// Post-barrier invariant: both send tables fully drained.
    #[cfg(test)]
    pub(crate) fn tables_empty(&self) -> bool {
        self.deliv.is_empty() && !self.req.any_used()
    }
}

/// Process-level runtime handle: one engine, one transport, one clock.
pub struct Bsp {
    state: BspState,
    transport: Box<dyn Transport>,
    globals: GlobalArrays,
    timer: Timer,
}

impl Bsp {
    /// Bring up the runtime on an established transport.
    pub fn init(transport: Box<dyn Transport>) -> Result<Self> {
        let state = BspState::new(transport.nprocs(), transport.rank())?;
        info!(
            nprocs = transport.nprocs(),
            rank = transport.rank(),
            backend = transport.name(),
            "bsp runtime up"
        );
        Ok(Bsp {
            state,
            transport,
            globals: GlobalArrays::new(),
            timer: Timer::new(),
        })
    }

    pub fn nprocs(&self) -> usize {
        self.state.nprocs()
    }

    pub fn pid(&self) -> usize {
        self.state.rank()
    }

    /// Seconds since `init` on this process.
    pub fn time(&self) -> f64 {
        self.timer.elapsed()
    }

    /// Seconds since the previous `dtime` call.
    pub fn dtime(&mut self) -> f64 {
        self.timer.delta()
    }

    /// Busy-wait to bring the CPU to steady clocks before measuring.
    pub fn warmup(&self, seconds: f64) {
        warmup(seconds);
    }

    /// End the superstep: make every queued operation visible group-wide.
    pub fn sync(&mut self) -> Result<()> {
        self.state.sync(&mut *self.transport)?;
        self.globals.drain_graveyard();
        Ok(())
    }

    /// See [`BspState::push_reg`].
    ///
    /// # Safety
    ///
    /// As for [`BspState::push_reg`].
    pub unsafe fn push_reg(&mut self, addr: usize, nbytes: usize) -> Result<()> {
        self.state.push_reg(addr, nbytes)
    }

    pub fn pop_reg(&mut self, addr: usize) -> Result<()> {
        self.state.pop_reg(addr)
    }

    pub fn put(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.state.put(pid, src, dst, offset)
    }

    pub fn hpput(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.state.hpput(pid, src, dst, offset)
    }

    /// See [`BspState::get`].
    ///
    /// # Safety
    ///
    /// As for [`BspState::get`].
    pub unsafe fn get(
        &mut self,
        pid: usize,
        src: usize,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.state.get(pid, src, offset, dst, nbytes)
    }

    /// See [`BspState::hpget`].
    ///
    /// # Safety
    ///
    /// As for [`BspState::get`].
    pub unsafe fn hpget(
        &mut self,
        pid: usize,
        src: usize,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.state.hpget(pid, src, offset, dst, nbytes)
    }

    pub fn send(&mut self, pid: usize, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.state.send(pid, tag, payload)
    }

    pub fn set_tagsize(&mut self, size: &mut usize) -> Result<()> {
        self.state.set_tagsize(size)
    }

    pub fn qsize(&self) -> (usize, usize) {
        self.state.qsize()
    }

    pub fn get_tag(&self) -> Option<(usize, &[u8])> {
        self.state.get_tag()
    }

    pub fn move_into(&mut self, dst: &mut [u8]) -> usize {
        self.state.move_into(dst)
    }

    pub fn hpmove(&mut self) -> Option<(&[u8], &[u8])> {
        self.state.hpmove()
    }

    /// Allocate a logical array of `nbytes` striped over all ranks.
    /// Collective: every rank must allocate in the same order.
    pub fn global_alloc(&mut self, nbytes: usize) -> Result<GlobalHandle> {
        self.globals.alloc(&mut self.state, nbytes)
    }

    /// Collective: retire a global array at the next barrier.
    pub fn global_free(&mut self, handle: GlobalHandle) -> Result<()> {
        self.globals.free(&mut self.state, handle)
    }

    pub fn global_put(
        &mut self,
        src: &[u8],
        handle: GlobalHandle,
        offset: usize,
    ) -> Result<()> {
        self.globals.put(&mut self.state, src, handle, offset)
    }

    /// # Safety
    ///
    /// `dst .. dst + nbytes` must stay valid and untouched until the next
    /// `sync` completes.
    pub unsafe fn global_get(
        &mut self,
        handle: GlobalHandle,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.globals.get(&mut self.state, handle, offset, dst, nbytes)
    }

    pub fn global_hpput(
        &mut self,
        src: &[u8],
        handle: GlobalHandle,
        offset: usize,
    ) -> Result<()> {
        self.globals.put(&mut self.state, src, handle, offset)
    }

    /// # Safety
    ///
    /// As for [`global_get`](Self::global_get).
    pub unsafe fn global_hpget(
        &mut self,
        handle: GlobalHandle,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.globals.get(&mut self.state, handle, offset, dst, nbytes)
    }

    /// Replicate `buf` from `root` everywhere. Collective.
    pub fn broadcast(&mut self, root: usize, buf: &mut [u8]) -> Result<()> {
        collectives::broadcast(&mut *self.transport, root, buf)
    }

    /// Fold every rank's `src` into `dst` left-to-right. Collective.
    pub fn fold(
        &mut self,
        combine: &mut dyn FnMut(&mut [u8], &[u8]),
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<()> {
        collectives::fold(&mut *self.transport, combine, src, dst)
    }

    /// Shrink all communication buffers back to their minimum sizes.
    pub fn reset_buffers(&mut self) -> Result<()> {
        self.state.reset_buffers()
    }

    /// Abort the whole group, reporting `err`'s class as the exit code.
    pub fn abort_with(&mut self, err: &BspError) -> ! {
        error!(error = %err, "aborting group");
        self.transport.abort(err.exit_code())
    }

    /// Abort the whole group at the user's request.
    pub fn abort(&mut self, msg: &str) -> ! {
        let err = BspError::UserAbort(msg.to_string());
        self.abort_with(&err)
    }

    /// Tear the runtime down; blocks until every rank arrives.
    pub fn end(mut self) -> Result<()> {
        self.transport.barrier()?;
        info!(rank = self.state.rank(), "bsp runtime down");
        Ok(())
    }
}
