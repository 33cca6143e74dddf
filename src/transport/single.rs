//! Single-process stub transport.
//!
//! Valid only for a group of one rank: every collective degenerates into a
//! local copy. This keeps the engine free of `P == 1` special cases and
//! gives sequential programs the exact superstep semantics of the parallel
//! ones.

use tracing::error;

use crate::error::{BspError, Result};
use crate::transport::Transport;

/// The degenerate one-rank transport.
#[derive(Debug, Default)]
pub struct SingleProcess;

impl SingleProcess {
    pub fn new() -> Self {
        SingleProcess
    }
}

impl Transport for SingleProcess {
    fn nprocs(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "single-process"
    }

    fn alltoall(&mut self, send: &[u8], item_bytes: usize, recv: &mut [u8]) -> Result<()> {
        recv[..item_bytes].copy_from_slice(&send[..item_bytes]);
        Ok(())
    }

    fn alltoallv(
        &mut self,
        send: &[u8],
        send_counts: &[usize],
        send_offsets: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
        recv_offsets: &[usize],
    ) -> Result<()> {
        let n = send_counts[0].min(recv_counts[0]);
        if send_counts[0] > recv_counts[0] {
            return Err(BspError::Internal(format!(
                "self-delivery of {} bytes exceeds the receive capacity of {}",
                send_counts[0], recv_counts[0]
            )));
        }
        recv[recv_offsets[0]..recv_offsets[0] + n]
            .copy_from_slice(&send[send_offsets[0]..send_offsets[0] + n]);
        Ok(())
    }

    fn broadcast(&mut self, _root: usize, _buf: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn allgather(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        recv[..send.len()].copy_from_slice(send);
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self, code: i32) -> ! {
        error!(code, "group aborted");
        std::process::exit(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alltoall_copies_the_single_item() {
        let mut tp = SingleProcess::new();
        let send = [1u8, 2, 3, 4];
        let mut recv = [0u8; 4];
        tp.alltoall(&send, 4, &mut recv).unwrap();
        assert_eq!(recv, send);
    }

    #[test]
    fn alltoallv_respects_offsets() {
        let mut tp = SingleProcess::new();
        let send = [9u8, 9, 1, 2, 3];
        let mut recv = [0u8; 8];
        tp.alltoallv(&send, &[3], &[2], &mut recv, &[8], &[4]).unwrap();
        assert_eq!(recv, [0, 0, 0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn oversized_self_delivery_is_rejected() {
        let mut tp = SingleProcess::new();
        let send = [0u8; 8];
        let mut recv = [0u8; 8];
        let r = tp.alltoallv(&send, &[8], &[0], &mut recv, &[4], &[0]);
        assert!(r.is_err());
    }
}
