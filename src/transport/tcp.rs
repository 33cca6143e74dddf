//! Networked rank mesh over TCP.
//!
//! Every pair of ranks keeps one persistent connection; frames are
//! length-prefixed with a little-endian `u64`. Collectives are built from
//! pairwise exchanges ordered by rank (the lower rank sends first, the
//! higher rank receives first), which is deadlock-free for blocking sockets
//! and keeps the implementation free of any I/O multiplexing.
//!
//! Mesh establishment: every rank binds its own endpoint first, then
//! connects to all lower ranks (retrying while peers are still binding) and
//! accepts one connection from each higher rank. A one-frame hello carrying
//! the peer's rank slots accepted connections into place.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use socket2::SockRef;
use tracing::{debug, error, info};

use crate::error::{BspError, Result};
use crate::transport::Transport;

/// Configuration of a TCP mesh endpoint.
#[derive(Debug, Clone)]
pub struct TcpMeshConfig {
    /// This rank's id; also the index of its endpoint in `endpoints`.
    pub rank: usize,
    /// One listen address per rank, identical on every rank.
    pub endpoints: Vec<SocketAddr>,
    /// Disable Nagle's algorithm on every connection.
    pub nodelay: bool,
    /// Kernel send/receive buffer size per connection.
    pub buffer_size: usize,
    /// Give up establishing the mesh after this long.
    pub connect_timeout: Duration,
    /// Pause between connect retries while peers are still binding.
    pub connect_retry: Duration,
}

impl TcpMeshConfig {
    pub fn new(rank: usize, endpoints: Vec<SocketAddr>) -> Self {
        TcpMeshConfig {
            rank,
            endpoints,
            nodelay: true,
            buffer_size: 256 * 1024,
            connect_timeout: Duration::from_secs(10),
            connect_retry: Duration::from_millis(50),
        }
    }
}

/// One rank's endpoint of a TCP mesh.
pub struct TcpMesh {
    rank: usize,
    nprocs: usize,
    /// Connection to each peer; `None` at the self index.
    peers: Vec<Option<TcpStream>>,
}

impl TcpMesh {
    /// Bind this rank's endpoint and establish the full mesh.
    pub fn connect(cfg: TcpMeshConfig) -> Result<Self> {
        let listener = TcpListener::bind(cfg.endpoints[cfg.rank])
            .map_err(|e| BspError::Init(format!("bind {}: {e}", cfg.endpoints[cfg.rank])))?;
        Self::from_listener(listener, cfg)
    }

    /// Establish the mesh on an already-bound listener. Useful when the
    /// harness binds port 0 first and distributes the resolved addresses.
    pub fn from_listener(listener: TcpListener, cfg: TcpMeshConfig) -> Result<Self> {
        let nprocs = cfg.endpoints.len();
        let rank = cfg.rank;
        if rank >= nprocs {
            return Err(BspError::Init(format!(
                "rank {rank} outside the {nprocs}-rank group"
            )));
        }
        let mut peers: Vec<Option<TcpStream>> = (0..nprocs).map(|_| None).collect();

        for q in 0..rank {
            let stream = Self::connect_with_retry(cfg.endpoints[q], &cfg)?;
            Self::tune(&stream, &cfg)?;
            let mut hello = (rank as u32).to_le_bytes();
            stream_write(&stream, &hello)?;
            stream_read(&stream, &mut hello)?;
            let echoed = u32::from_le_bytes(hello) as usize;
            if echoed != q {
                return Err(BspError::Init(format!(
                    "peer at {} identified as rank {echoed}, expected {q}",
                    cfg.endpoints[q]
                )));
            }
            peers[q] = Some(stream);
        }

        for _ in rank + 1..nprocs {
            let (stream, addr) = listener
                .accept()
                .map_err(|e| BspError::Init(format!("accept: {e}")))?;
            Self::tune(&stream, &cfg)?;
            let mut hello = [0u8; 4];
            stream_read(&stream, &mut hello)?;
            let peer = u32::from_le_bytes(hello) as usize;
            if peer <= rank || peer >= nprocs || peers[peer].is_some() {
                return Err(BspError::Init(format!(
                    "unexpected hello from rank {peer} at {addr}"
                )));
            }
            stream_write(&stream, &(rank as u32).to_le_bytes())?;
            debug!(peer, %addr, "mesh connection accepted");
            peers[peer] = Some(stream);
        }

        info!(rank, nprocs, "tcp mesh established");
        Ok(TcpMesh { rank, nprocs, peers })
    }

    fn connect_with_retry(addr: SocketAddr, cfg: &TcpMeshConfig) -> Result<TcpStream> {
        let deadline = Instant::now() + cfg.connect_timeout;
        loop {
            match TcpStream::connect(addr) {
                Ok(s) => return Ok(s),
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "connect retry");
                    std::thread::sleep(cfg.connect_retry);
                }
                Err(e) => {
                    return Err(BspError::Init(format!("connect {addr}: {e}")));
                }
            }
        }
    }

    fn tune(stream: &TcpStream, cfg: &TcpMeshConfig) -> Result<()> {
        stream.set_nodelay(cfg.nodelay)?;
        let sock = SockRef::from(stream);
        sock.set_send_buffer_size(cfg.buffer_size)?;
        sock.set_recv_buffer_size(cfg.buffer_size)?;
        Ok(())
    }

    fn stream(&mut self, p: usize) -> Result<&TcpStream> {
        self.peers[p]
            .as_ref()
            .ok_or_else(|| BspError::Internal(format!("no mesh connection to rank {p}")))
    }

    fn send_frame(&mut self, p: usize, bytes: &[u8]) -> Result<()> {
        let stream = self.stream(p)?;
        stream_write(stream, &(bytes.len() as u64).to_le_bytes())?;
        stream_write(stream, bytes)?;
        Ok(())
    }

    fn recv_frame(&mut self, p: usize, max: usize) -> Result<Vec<u8>> {
        let stream = self.stream(p)?;
        let mut len_bytes = [0u8; 8];
        stream_read(stream, &mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        if len > max {
            return Err(BspError::Internal(format!(
                "rank {p} delivered {len} bytes, receive capacity is {max}"
            )));
        }
        let mut frame = vec![0u8; len];
        stream_read(stream, &mut frame)?;
        Ok(frame)
    }

    /// Pairwise exchange with every peer, lower rank sending first.
    fn exchange_all<S, R>(&mut self, mut send_one: S, mut recv_one: R) -> Result<()>
    where
        S: FnMut(&mut Self, usize) -> Result<()>,
        R: FnMut(&mut Self, usize) -> Result<()>,
    {
        for p in 0..self.nprocs {
            if p == self.rank {
                continue;
            }
            if self.rank < p {
                send_one(self, p)?;
                recv_one(self, p)?;
            } else {
                recv_one(self, p)?;
                send_one(self, p)?;
            }
        }
        Ok(())
    }
}

fn stream_write(mut stream: &TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes)?;
    Ok(())
}

fn stream_read(mut stream: &TcpStream, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf)?;
    Ok(())
}

impl Transport for TcpMesh {
    fn nprocs(&self) -> usize {
        self.nprocs
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn name(&self) -> &'static str {
        "tcp-mesh"
    }

    fn alltoall(&mut self, send: &[u8], item_bytes: usize, recv: &mut [u8]) -> Result<()> {
        let me = self.rank;
        recv[me * item_bytes..(me + 1) * item_bytes]
            .copy_from_slice(&send[me * item_bytes..(me + 1) * item_bytes]);
        // recv is written peer by peer; frames are buffered per peer to keep
        // the closure borrows disjoint.
        let mut frames: Vec<Option<Vec<u8>>> = (0..self.nprocs).map(|_| None).collect();
        self.exchange_all(
            |mesh, p| mesh.send_frame(p, &send[p * item_bytes..(p + 1) * item_bytes]),
            |mesh, p| {
                let frame = mesh.recv_frame(p, item_bytes)?;
                if frame.len() != item_bytes {
                    return Err(BspError::Internal(format!(
                        "fixed exchange frame of {} bytes from rank {p}, expected {item_bytes}",
                        frame.len()
                    )));
                }
                frames[p] = Some(frame);
                Ok(())
            },
        )?;
        for (p, frame) in frames.into_iter().enumerate() {
            if let Some(frame) = frame {
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
        let me = self.rank;
        if send_counts[me] > recv_counts[me] {
            return Err(BspError::Internal(format!(
                "self-delivery of {} bytes exceeds the receive capacity of {}",
                send_counts[me], recv_counts[me]
            )));
        }
        recv[recv_offsets[me]..recv_offsets[me] + send_counts[me]]
            .copy_from_slice(&send[send_offsets[me]..send_offsets[me] + send_counts[me]]);
        let mut frames: Vec<Option<Vec<u8>>> = (0..self.nprocs).map(|_| None).collect();
        self.exchange_all(
            |mesh, p| mesh.send_frame(p, &send[send_offsets[p]..send_offsets[p] + send_counts[p]]),
            |mesh, p| {
                frames[p] = Some(mesh.recv_frame(p, recv_counts[p])?);
                Ok(())
            },
        )?;
        for (p, frame) in frames.into_iter().enumerate() {
            if let Some(frame) = frame {
                recv[recv_offsets[p]..recv_offsets[p] + frame.len()].copy_from_slice(&frame);
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, root: usize, buf: &mut [u8]) -> Result<()> {
        if self.rank == root {
            for p in 0..self.nprocs {
                if p != root {
                    self.send_frame(p, buf)?;
                }
            }
        } else {
            let frame = self.recv_frame(root, buf.len())?;
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
        recv[self.rank * n..(self.rank + 1) * n].copy_from_slice(send);
        let mut frames: Vec<Option<Vec<u8>>> = (0..self.nprocs).map(|_| None).collect();
        self.exchange_all(
            |mesh, p| mesh.send_frame(p, send),
            |mesh, p| {
                let frame = mesh.recv_frame(p, n)?;
                if frame.len() != n {
                    return Err(BspError::Internal(format!(
                        "allgather frame of {} bytes from rank {p}, expected {n}",
                        frame.len()
                    )));
                }
                frames[p] = Some(frame);
                Ok(())
            },
        )?;
        for (p, frame) in frames.into_iter().enumerate() {
            if let Some(frame) = frame {
                recv[p * n..(p + 1) * n].copy_from_slice(&frame);
            }
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        self.exchange_all(|mesh, p| mesh.send_frame(p, &[]), |mesh, p| {
            mesh.recv_frame(p, 0).map(|_| ())
        })
    }

    fn abort(&mut self, code: i32) -> ! {
        error!(code, rank = self.rank, "group aborted");
        // Dropping the streams makes every blocked peer fail its next read.
        self.peers.clear();
        std::process::exit(code)
    }
}
