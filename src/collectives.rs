//! Group-wide collectives built on the transport: broadcast and fold.
//!
//! `fold` is an all-gather of every rank's fixed-size contribution followed
//! by a left-to-right combine on each rank, so all ranks end up with the
//! same folded value without a second broadcast.

use crate::error::{BspError, Result};
use crate::transport::Transport;

/// Replicate `buf` from `root` to all ranks. Identity on a group of one.
pub fn broadcast(tp: &mut dyn Transport, root: usize, buf: &mut [u8]) -> Result<()> {
    if tp.nprocs() == 1 {
        return Ok(());
    }
    tp.broadcast(root, buf)
}

/// Fold every rank's `src` into `dst` with `combine`, applied left-to-right
/// over the rank order. `src` and `dst` must have the same length on every
/// rank. `combine(acc, piece)` merges one rank's contribution into the
/// accumulator.
pub fn fold(
    tp: &mut dyn Transport,
    combine: &mut dyn FnMut(&mut [u8], &[u8]),
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    if src.len() != dst.len() {
        return Err(BspError::Internal(format!(
            "fold source of {} bytes does not match destination of {}",
            src.len(),
            dst.len()
        )));
    }
    let nprocs = tp.nprocs();
    if nprocs == 1 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let n = src.len();
    let mut gathered = vec![0u8; n * nprocs];
    tp.allgather(src, &mut gathered)?;
    dst.copy_from_slice(&gathered[..n]);
    for p in 1..nprocs {
        combine(dst, &gathered[p * n..(p + 1) * n]);
    }
    Ok(())
}
