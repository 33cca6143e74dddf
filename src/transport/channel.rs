//! In-process rank mesh over FIFO channels.
//!
//! Every pair of ranks gets a dedicated unbounded channel in each direction,
//! so per-peer ordering is a property of the channel and collectives never
//! block on send. This backend drives the whole test suite and is also the
//! practical way to host a multi-node group inside one process: spawn one
//! thread per rank and hand each its mesh endpoint.

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::error;

use crate::error::{BspError, Result};
use crate::transport::Transport;

/// One rank's endpoint of an in-process mesh.
///
/// Created in bulk by [`ChannelMesh::mesh`]; endpoint `r` of the returned
/// vector belongs to rank `r` and is `Send`, so it can move into the rank's
/// thread.
pub struct ChannelMesh {
    rank: usize,
    nprocs: usize,
    /// `txs[p]` carries frames from this rank to rank `p` (unused for self).
    txs: Vec<Sender<Vec<u8>>>,
    /// `rxs[p]` carries frames from rank `p` to this rank (unused for self).
    rxs: Vec<Receiver<Vec<u8>>>,
}

impl ChannelMesh {
    /// Build a fully connected mesh of `nprocs` endpoints.
    pub fn mesh(nprocs: usize) -> Vec<ChannelMesh> {
        // ends[from][to] channel pairs, built once, then distributed.
        let mut txs: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..nprocs)
            .map(|_| (0..nprocs).map(|_| None).collect())
            .collect();
        let mut rxs: Vec<Vec<Option<Receiver<Vec<u8>>>>> = (0..nprocs)
            .map(|_| (0..nprocs).map(|_| None).collect())
            .collect();
        for from in 0..nprocs {
            for to in 0..nprocs {
                let (tx, rx) = unbounded();
                txs[from][to] = Some(tx);
                rxs[to][from] = Some(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (tx_row, rx_row))| ChannelMesh {
                rank,
                nprocs,
                txs: tx_row.into_iter().map(Option::unwrap).collect(),
                rxs: rx_row.into_iter().map(Option::unwrap).collect(),
            })
            .collect()
    }

    fn send_to(&self, p: usize, bytes: &[u8]) -> Result<()> {
        self.txs[p]
            .send(bytes.to_vec())
            .map_err(|_| BspError::Init(format!("rank {p} left the group")))
    }

    fn recv_from(&self, p: usize) -> Result<Vec<u8>> {
        self.rxs[p]
            .recv()
            .map_err(|_| BspError::Init(format!("rank {p} left the group")))
    }
}

impl Transport for ChannelMesh {
    fn nprocs(&self) -> usize {
        self.nprocs
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn name(&self) -> &'static str {
        "channel-mesh"
    }

    fn alltoall(&mut self, send: &[u8], item_bytes: usize, recv: &mut [u8]) -> Result<()> {
        for p in 0..self.nprocs {
            if p != self.rank {
                self.send_to(p, &send[p * item_bytes..(p + 1) * item_bytes])?;
            }
        }
        let me = self.rank;
        recv[me * item_bytes..(me + 1) * item_bytes]
            .copy_from_slice(&send[me * item_bytes..(me + 1) * item_bytes]);
        for p in 0..self.nprocs {
            if p != self.rank {
                let frame = self.recv_from(p)?;
                if frame.len() != item_bytes {
                    return Err(BspError::Internal(format!(
                        "fixed exchange frame of {} bytes from rank {p}, expected {item_bytes}",
                        frame.len()
                    )));
                }
                recv[p * item_bytes..(p + 1) * item_bytes].copy_from_slice(&frame);
            }
        }
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
        for p in 0..self.nprocs {
            if p != self.rank {
                self.send_to(p, &send[send_offsets[p]..send_offsets[p] + send_counts[p]])?;
            }
        }
        let me = self.rank;
        if send_counts[me] > recv_counts[me] {
            return Err(BspError::Internal(format!(
                "self-delivery of {} bytes exceeds the receive capacity of {}",
                send_counts[me], recv_counts[me]
            )));
        }
        recv[recv_offsets[me]..recv_offsets[me] + send_counts[me]]
            .copy_from_slice(&send[send_offsets[me]..send_offsets[me] + send_counts[me]]);
        for p in 0..self.nprocs {
            if p != self.rank {
                let frame = self.recv_from(p)?;
                if frame.len() > recv_counts[p] {
                    return Err(BspError::Internal(format!(
                        "rank {p} delivered {} bytes, receive capacity is {}",
                        frame.len(),
                        recv_counts[p]
                    )));
                }
                recv[recv_offsets[p]..recv_offsets[p] + frame.len()].copy_from_slice(&frame);
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, root: usize, buf: &mut [u8]) -> Result<()> {
        if self.rank == root {
            for p in 0..self.nprocs {
                if p != root {
                    self.send_to(p, buf)?;
                }
            }
        } else {
            let frame = self.recv_from(root)?;
            if frame.len() != buf.len() {
                return Err(BspError::Internal(format!(
                    "broadcast frame of {} bytes, expected {}",
                    frame.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&frame);
        }
        Ok(())
    }

    fn allgather(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let n = send.len();
        for p in 0..self.nprocs {
            if p != self.rank {
                self.send_to(p, send)?;
            }
        }
        recv[self.rank * n..(self.rank + 1) * n].copy_from_slice(send);
        for p in 0..self.nprocs {
            if p != self.rank {
                let frame = self.recv_from(p)?;
                if frame.len() != n {
                    return Err(BspError::Internal(format!(
                        "allgather frame of {} bytes from rank {p}, expected {n}",
                        frame.len()
                    )));
                }
                recv[p * n..(p + 1) * n].copy_from_slice(&frame);
            }
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        for p in 0..self.nprocs {
            if p != self.rank {
                self.send_to(p, &[])?;
            }
        }
        for p in 0..self.nprocs {
            if p != self.rank {
                self.recv_from(p)?;
            }
        }
        Ok(())
    }

    fn abort(&mut self, code: i32) -> ! {
        error!(code, rank = self.rank, "group aborted");
        std::process::exit(code)
    }
}
