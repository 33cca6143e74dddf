//! # Transport Abstraction and Backends
//!
//! This module defines the unified interface between the superstep engine
//! and whatever actually moves bytes between ranks, plus the built-in
//! backends. The engine only ever needs bulk collectives: every barrier is a
//! fixed-size all-to-all (the sizing pre-exchange) followed by at most two
//! variable-length all-to-alls (requests, deliveries), and the shared
//! variable layer adds broadcast and all-gather.
//!
//! ## Contract
//!
//! - Every operation is **collective**: all ranks of the group must enter the
//!   same operation in the same order, or the group deadlocks. The runtime
//!   guarantees this by construction (operations are only issued from the
//!   barrier path, one at a time).
//! - Calls are **blocking** and there is at most one in flight per group;
//!   implementations need no internal concurrency.
//! - For [`alltoallv`](Transport::alltoallv), the receive counts are
//!   **capacities**: a rank may deliver fewer bytes than the receiver allowed
//!   for. Delivering more is an error.
//! - Rank `r`'s segment addressed to itself must be copied like any other.
//!
//! ## Backends
//!
//! - [`SingleProcess`]: degenerate group of one rank; pure memcpy.
//! - [`ChannelMesh`]: ranks are threads of one process connected by a full
//!   mesh of FIFO channels. The workhorse for tests and for running a
//!   multi-node group inside one process.
//! - [`TcpMesh`]: ranks are processes connected by a full TCP mesh with
//!   length-prefixed frames.

use crate::error::Result;

pub mod channel;
pub mod single;
pub mod tcp;

pub use channel::ChannelMesh;
pub use single::SingleProcess;
pub use tcp::{TcpMesh, TcpMeshConfig};

/// Bulk collective operations over a fixed group of ranks.
pub trait Transport: Send {
    /// Number of ranks in the group. Fixed for the transport's lifetime.
    fn nprocs(&self) -> usize;

    /// This rank's id in `[0, nprocs)`.
    fn rank(&self) -> usize;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// Exchange one fixed-size item with every rank. `send` and `recv` hold
    /// `nprocs` items of `item_bytes` each, indexed by rank.
    fn alltoall(&mut self, send: &[u8], item_bytes: usize, recv: &mut [u8]) -> Result<()>;

    /// Byte-granular all-to-all. Segment `p` of `send` (at `send_offsets[p]`,
    /// `send_counts[p]` bytes) goes to rank `p`; the segment received from
    /// rank `p` lands at `recv_offsets[p]` and must not exceed
    /// `recv_counts[p]` bytes.
    #[allow(clippy::too_many_arguments)]
    fn alltoallv(
        &mut self,
        send: &[u8],
        send_counts: &[usize],
        send_offsets: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
        recv_offsets: &[usize],
    ) -> Result<()>;

    /// Replicate `buf` from `root` to every rank. `buf` must be the same
    /// length everywhere.
    fn broadcast(&mut self, root: usize, buf: &mut [u8]) -> Result<()>;

    /// Concatenate every rank's `send` block into `recv` in rank order.
    /// `recv.len()` must be `nprocs * send.len()`.
    fn allgather(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()>;

    /// Block until every rank has arrived.
    fn barrier(&mut self) -> Result<()>;

    /// Terminate the whole group unconditionally with `code`.
    fn abort(&mut self, code: i32) -> !;
}
