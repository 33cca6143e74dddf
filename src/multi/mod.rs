//! The multi-context layer: many logical BSP processes per transport rank.
//!
//! A deployment runs N physical ranks (*nodes*) but the application wants
//! P = M·N logical processes. This module owns the placement arithmetic,
//! one [`Context`] per logical process on the node, a fixed worker pool,
//! and the routing and barrier logic that stitches the fast in-process
//! paths and the node-level superstep engine together.
//!
//! A superstep is a fork-join: [`ContextGroup::superstep`] runs the user's
//! step function on every local context in parallel, then the calling
//! thread — the barrier root — drains the fast-path queues, validates and
//! installs the batched registrations, drives the node-level exchange, and
//! dispatches arrived messages into the context inboxes. Workers never
//! touch the transport; between barriers a context runs to completion.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, trace};

use crate::engine::{triple, BspState, FLAG_HP, REG_SHIFT};
use crate::error::{BspError, Result};
use crate::transport::Transport;

pub mod context;
pub(crate) mod local;
pub mod shared;

pub use context::Context;

use context::{RegIntent, Registered};
use shared::{decode, encode, SharedDef, SharedSlot, SharedVariableSet, Slot};

/// Bytes prepended to every cross-node message tag, carrying the target
/// logical id.
pub(crate) const PID_PREFIX_BYTES: usize = 4;

/// Bytes of one registration intent on the wire.
const REG_INTENT_BYTES: usize = 32;

/// Placement of logical processes on physical nodes: contiguous blocks of
/// `⌈P/N⌉`, the last node possibly holding fewer.
#[derive(Debug, Clone)]
pub struct TaskMapper {
    nprocs: usize,
    nnodes: usize,
    node: usize,
    ppn: usize,
}

impl TaskMapper {
    pub fn new(nprocs: usize, nnodes: usize, node: usize) -> Result<Self> {
        if nprocs < nnodes {
            return Err(BspError::Init(format!(
                "{nprocs} logical processes cannot span {nnodes} nodes"
            )));
        }
        if node >= nnodes {
            return Err(BspError::Init(format!(
                "node {node} outside the {nnodes}-node group"
            )));
        }
        let ppn = (nprocs + nnodes - 1) / nnodes;
        Ok(TaskMapper {
            nprocs,
            nnodes,
            node,
            ppn,
        })
    }

    /// Total logical processes.
    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Physical nodes.
    pub fn nnodes(&self) -> usize {
        self.nnodes
    }

    /// This node's rank.
    pub fn this_node(&self) -> usize {
        self.node
    }

    /// Maximum logical processes per node.
    pub fn procs_per_node(&self) -> usize {
        self.ppn
    }

    /// Logical processes hosted on `node`.
    pub fn procs_on(&self, node: usize) -> usize {
        self.nprocs
            .saturating_sub(node * self.ppn)
            .min(self.ppn)
    }

    /// Logical processes hosted here.
    pub fn procs_this_node(&self) -> usize {
        self.procs_on(self.node)
    }

    pub fn global_to_node(&self, pid: usize) -> usize {
        pid / self.ppn
    }

    pub fn global_to_local(&self, pid: usize) -> usize {
        pid % self.ppn
    }

    pub fn local_to_global(&self, local: usize) -> usize {
        self.node * self.ppn + local
    }
}

/// State shared between the contexts of one node.
pub(crate) struct NodeState {
    pub mapper: TaskMapper,
    /// The node-level engine. Contexts append remote traffic under this
    /// lock; the barrier root drives the exchange while workers are parked.
    pub engine: Mutex<BspState>,
}

/// A group of logical BSP processes hosted on this node, plus the barrier
/// root that synchronizes them with every other node.
pub struct ContextGroup {
    node: Arc<NodeState>,
    transport: Box<dyn Transport>,
    contexts: Vec<Context>,
    shared: SharedVariableSet,
    pool: rayon::ThreadPool,
}

impl ContextGroup {
    /// Open a group of `nprocs` logical processes over the transport's
    /// ranks. Collective: every node constructs the group with the same
    /// `nprocs`.
    pub fn new(transport: Box<dyn Transport>, nprocs: usize) -> Result<Self> {
        let mapper = TaskMapper::new(nprocs, transport.nprocs(), transport.rank())?;
        let mut engine = BspState::new(transport.nprocs(), transport.rank())?;
        // Cross-node tags always carry the logical-id prefix.
        engine.force_tag_size(PID_PREFIX_BYTES);

        let workers = num_cpus::get().min(mapper.procs_this_node().max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| BspError::Init(format!("worker pool: {e}")))?;

        info!(
            nprocs,
            nodes = mapper.nnodes(),
            node = mapper.this_node(),
            contexts = mapper.procs_this_node(),
            workers,
            "context group up"
        );

        let node = Arc::new(NodeState {
            mapper,
            engine: Mutex::new(engine),
        });
        let contexts = (0..node.mapper.procs_this_node())
            .map(|l| Context::new(Arc::clone(&node), l))
            .collect();

        Ok(ContextGroup {
            node,
            transport,
            contexts,
            shared: SharedVariableSet::new(),
            pool,
        })
    }

    pub fn nprocs(&self) -> usize {
        self.node.mapper.nprocs()
    }

    pub fn node_count(&self) -> usize {
        self.node.mapper.nnodes()
    }

    pub fn this_node(&self) -> usize {
        self.node.mapper.this_node()
    }

    pub fn procs_this_node(&self) -> usize {
        self.node.mapper.procs_this_node()
    }

    /// Run `step` on every local context in parallel, then synchronize the
    /// whole group. Equivalent to one superstep followed by its barrier.
    pub fn superstep<F>(&mut self, step: F) -> Result<()>
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync,
    {
        let pool = &self.pool;
        let contexts = &mut self.contexts;
        pool.install(|| contexts.par_iter_mut().try_for_each(|ctx| step(ctx)))?;
        self.barrier()
    }

    /// A barrier with no local computation.
    pub fn sync(&mut self) -> Result<()> {
        self.barrier()
    }

    /// Declare a shared slot on the parent and on every context. The parent
    /// value starts neutral; set it through [`parent_mut`](Self::parent_mut)
    /// before initializing.
    pub fn share<T>(&mut self, name: &str, def: SharedDef<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if self.shared.slots.contains_key(name) {
            return Err(BspError::Internal(format!(
                "shared slot {name:?} declared twice"
            )));
        }
        self.shared
            .slots
            .insert(name.to_string(), Box::new(Slot::new(def)));
        for ctx in &mut self.contexts {
            ctx.shared
                .insert(name.to_string(), Box::new(Slot::new(def)));
        }
        Ok(())
    }

    /// Read the parent value of a shared slot.
    pub fn parent<T: 'static>(&self, name: &str) -> Result<&T> {
        self.shared
            .slots
            .get(name)
            .ok_or_else(|| BspError::Internal(format!("no shared slot named {name:?}")))?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| {
                BspError::Internal(format!("shared slot {name:?} holds a different type"))
            })
    }

    /// Write the parent value of a shared slot.
    pub fn parent_mut<T: 'static>(&mut self, name: &str) -> Result<&mut T> {
        self.shared
            .slots
            .get_mut(name)
            .ok_or_else(|| BspError::Internal(format!("no shared slot named {name:?}")))?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| {
                BspError::Internal(format!("shared slot {name:?} holds a different type"))
            })
    }

    /// Fan every parent value out to the children: broadcast the parent
    /// images from `master_node`, overwrite the local parents with them,
    /// then copy parent to child on the worker pool. Collective.
    pub fn initialize_shared(&mut self, master_node: usize) -> Result<()> {
        if self.node.mapper.nnodes() > 1 {
            let is_master = self.this_node() == master_node;
            let bytes = if is_master {
                encode(&self.shared.images()?)?
            } else {
                Vec::new()
            };

            let mut len_buf = (bytes.len() as u64).to_le_bytes();
            self.transport.broadcast(master_node, &mut len_buf)?;
            let len = u64::from_le_bytes(len_buf) as usize;

            let mut image = bytes;
            image.resize(len, 0);
            self.transport.broadcast(master_node, &mut image)?;

            if !is_master {
                let images: Vec<(String, Vec<u8>)> = decode(&image)?;
                self.shared
                    .apply_images(images, |slot, bytes| slot.set_bytes(bytes))?;
            }
        }

        let parent = &self.shared;
        let contexts = &mut self.contexts;
        self.pool.install(|| {
            contexts.par_iter_mut().try_for_each(|ctx| {
                for (name, pslot) in parent.slots.iter() {
                    if let Some(slot) = ctx.slot_mut(name) {
                        slot.assign_from(pslot.as_ref())?;
                    }
                }
                Ok(())
            })
        })
    }

    /// Fold every child value into the node parent on the worker pool, then
    /// fold the parents across nodes so all nodes agree. Collective.
    pub fn reduce_shared(&mut self) -> Result<()> {
        let contexts = &self.contexts;
        let pool = &self.pool;
        for (name, pslot) in self.shared.slots.iter_mut() {
            pslot.make_neutral();
            let merged = pool.install(|| {
                contexts
                    .par_iter()
                    .filter_map(|ctx| ctx.slot(name))
                    .map(|slot| Ok(slot.boxed_clone()))
                    .try_reduce_with(|mut a, b| {
                        a.reduce_from(b.as_ref())?;
                        Ok(a)
                    })
            });
            match merged {
                Some(Ok(m)) => pslot.reduce_from(m.as_ref())?,
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        if self.node.mapper.nnodes() > 1 {
            let nnodes = self.node.mapper.nnodes();
            let mine = encode(&self.shared.images()?)?;

            let mut lens = vec![0u8; 8 * nnodes];
            self.transport
                .allgather(&(mine.len() as u64).to_le_bytes(), &mut lens)?;
            let max_len = (0..nnodes)
                .map(|n| u64::from_le_bytes(lens[n * 8..(n + 1) * 8].try_into().unwrap()) as usize)
                .max()
                .unwrap_or(0);

            let block_len = 8 + max_len;
            let mut block = vec![0u8; block_len];
            block[..8].copy_from_slice(&(mine.len() as u64).to_le_bytes());
            block[8..8 + mine.len()].copy_from_slice(&mine);
            let mut gathered = vec![0u8; block_len * nnodes];
            self.transport.allgather(&block, &mut gathered)?;

            for n in 0..nnodes {
                if n == self.this_node() {
                    continue;
                }
                let at = n * block_len;
                let len =
                    u64::from_le_bytes(gathered[at..at + 8].try_into().unwrap()) as usize;
                let images: Vec<(String, Vec<u8>)> = decode(&gathered[at + 8..at + 8 + len])?;
                self.shared
                    .apply_images(images, |slot, bytes| slot.merge_bytes(bytes))?;
            }
        }
        Ok(())
    }

    /// Shrink the node's communication buffers and every context's local
    /// queues back to their minimum sizes.
    pub fn reset_buffers(&mut self) -> Result<()> {
        self.node.engine.lock().reset_buffers()?;
        for ctx in &mut self.contexts {
            ctx.reset_buffers();
        }
        Ok(())
    }

    /// Tear the group down; blocks until every node arrives.
    pub fn end(mut self) -> Result<()> {
        self.transport.barrier()?;
        info!(node = self.this_node(), "context group down");
        Ok(())
    }

    /// The node barrier: drain fast paths, batch registrations, drive the
    /// engine exchange, dispatch inboxes.
    fn barrier(&mut self) -> Result<()> {
        // Registration intents must agree across co-located contexts.
        let reg_local = self.contexts.first().map(|c| c.reg_requests.len()).unwrap_or(0);
        for ctx in &self.contexts {
            if ctx.reg_requests.len() != reg_local {
                return Err(BspError::Registration(format!(
                    "context {} issued {} registration requests, context {} issued {reg_local}",
                    ctx.pid(),
                    ctx.reg_requests.len(),
                    self.contexts[0].pid(),
                )));
            }
        }
        if reg_local > crate::defaults::MAX_REG_REQUESTS {
            return Err(BspError::Registration(format!(
                "{reg_local} registration requests exceed the per-superstep limit"
            )));
        }

        let any_hp = self
            .contexts
            .iter_mut()
            .fold(false, |acc, c| acc | c.take_any_hp());

        // Fast-path deliveries happen before any transport call, on the
        // root, while all workers are parked at the join.
        let mut local_msgs: Vec<(usize, Vec<u8>, Vec<u8>)> = Vec::new();
        for ctx in &mut self.contexts {
            unsafe {
                ctx.local.drain(&mut local_msgs);
            }
        }
        for ctx in &mut self.contexts {
            ctx.begin_window();
        }

        let mut engine = self.node.engine.lock();
        engine.begin_sync();
        let mut flags = (reg_local as u32) << REG_SHIFT;
        if any_hp {
            flags |= FLAG_HP;
        }
        engine.exchange_plan(flags);
        engine.exchange_index(&mut *self.transport)?;

        // Nodes that host at least one context must agree on the count; the
        // batch below is a fixed-size collective sized by the global count.
        let mut reg_global = 0usize;
        for n in 0..self.node.mapper.nnodes() {
            let (_, _, fl) = triple(engine.recv_index(), n);
            let reg_n = (fl >> REG_SHIFT) as usize;
            if self.node.mapper.procs_on(n) > 0 && !self.contexts.is_empty() && reg_n != reg_local {
                return Err(BspError::Registration(format!(
                    "node {n} issued {reg_n} registration requests per context, node {} issued {reg_local}",
                    self.this_node(),
                )));
            }
            reg_global = reg_global.max(reg_n);
        }

        if reg_global > 0 {
            process_registrations(
                &mut self.transport,
                &self.node.mapper,
                &mut self.contexts,
                reg_global,
            )?;
        }

        engine.finish_sync(&mut *self.transport)?;

        // Dispatch cross-node messages to the addressed context inbox.
        loop {
            let Some((tag, payload)) = engine.hpmove() else {
                break;
            };
            let pid = u32::from_le_bytes(tag[..PID_PREFIX_BYTES].try_into().unwrap()) as usize;
            if pid >= self.node.mapper.nprocs()
                || self.node.mapper.global_to_node(pid) != self.this_node()
            {
                return Err(BspError::Internal(format!(
                    "message for pid {pid} routed to node {}",
                    self.this_node()
                )));
            }
            let local = self.node.mapper.global_to_local(pid);
            let user_tag = tag[PID_PREFIX_BYTES..].to_vec();
            let payload = payload.to_vec();
            self.contexts[local].deliver_message(user_tag, payload);
        }
        drop(engine);

        for (dst_local, tag, payload) in local_msgs {
            self.contexts[dst_local].deliver_message(tag, payload);
        }

        trace!(node = self.this_node(), "node barrier complete");
        Ok(())
    }
}

/// Batch, exchange, validate and install the registration intents of every
/// context in the group.
///
/// Wire layout: for each destination node, `reg * ppn` 32-byte intents laid
/// out `[local_pid][request]`, identical to every destination. After the
/// fixed-size exchange, request `i` of every (node, local) pair must carry
/// the same serial, size and direction; the addresses become the per-pid
/// pointer table of the new registration.
fn process_registrations(
    transport: &mut Box<dyn Transport>,
    mapper: &TaskMapper,
    contexts: &mut [Context],
    reg: usize,
) -> Result<()> {
    let ppn = mapper.procs_per_node();
    let nnodes = mapper.nnodes();
    let block = reg * ppn * REG_INTENT_BYTES;

    let mut intents: Vec<Vec<RegIntent>> = Vec::with_capacity(contexts.len());
    for ctx in contexts.iter_mut() {
        intents.push(std::mem::take(&mut ctx.reg_requests));
    }

    let mut send = vec![0u8; block * nnodes];
    for n in 0..nnodes {
        for (lp, ctx_intents) in intents.iter().enumerate() {
            for (i, intent) in ctx_intents.iter().enumerate() {
                let at = n * block + (lp * reg + i) * REG_INTENT_BYTES;
                send[at..at + 8].copy_from_slice(&intent.addr.to_le_bytes());
                send[at + 8..at + 16].copy_from_slice(&intent.nbytes.to_le_bytes());
                send[at + 16..at + 24].copy_from_slice(&intent.serial.to_le_bytes());
                send[at + 24..at + 32]
                    .copy_from_slice(&(intent.push as u64).to_le_bytes());
            }
        }
    }
    let mut recv = vec![0u8; block * nnodes];
    transport.alltoall(&send, block, &mut recv)?;

    let intent_at = |node: usize, lp: usize, i: usize| -> RegIntent {
        let at = node * block + (lp * reg + i) * REG_INTENT_BYTES;
        RegIntent {
            addr: u64::from_le_bytes(recv[at..at + 8].try_into().unwrap()),
            nbytes: u64::from_le_bytes(recv[at + 8..at + 16].try_into().unwrap()),
            serial: u64::from_le_bytes(recv[at + 16..at + 24].try_into().unwrap()),
            push: u64::from_le_bytes(recv[at + 24..at + 32].try_into().unwrap()) != 0,
        }
    };

    for i in 0..reg {
        // Validate the slot across all logical processes and collect the
        // pointer table.
        let mut peers = vec![0u64; mapper.nprocs()];
        let mut reference: Option<RegIntent> = None;
        for pid in 0..mapper.nprocs() {
            let n = mapper.global_to_node(pid);
            let lp = mapper.global_to_local(pid);
            let intent = intent_at(n, lp, i);
            if let Some(r) = reference {
                if r.serial != intent.serial {
                    return Err(BspError::Registration(format!(
                        "registration request {i}: pid {pid} is at serial {}, expected {}; push/pop must be collectively ordered",
                        intent.serial, r.serial
                    )));
                }
                if r.nbytes != intent.nbytes {
                    return Err(BspError::Registration(format!(
                        "registration request {i}: pid {pid} registered {} bytes, expected {}",
                        intent.nbytes, r.nbytes
                    )));
                }
                if r.push != intent.push {
                    return Err(BspError::Registration(format!(
                        "registration request {i}: pid {pid} disagrees on push versus pop"
                    )));
                }
            } else {
                reference = Some(intent);
            }
            peers[pid] = intent.addr;
        }
        let reference = reference
            .ok_or_else(|| BspError::Internal("empty registration batch".to_string()))?;
        let peers = Arc::new(peers);

        for (lp, ctx) in contexts.iter_mut().enumerate() {
            let mine = intent_at(mapper.this_node(), lp, i);
            let addr = mine.addr as usize;
            if reference.push {
                if ctx.registers.contains_key(&addr) {
                    return Err(BspError::Registration(format!(
                        "duplicate push_reg for address {addr:#x} in context {}",
                        ctx.pid()
                    )));
                }
                ctx.registers.insert(
                    addr,
                    Registered {
                        peers: Arc::clone(&peers),
                        nbytes: reference.nbytes as usize,
                        serial: reference.serial,
                    },
                );
            } else if ctx.registers.remove(&addr).is_none() {
                return Err(BspError::Registration(format!(
                    "pop_reg of unregistered address {addr:#x} in context {}",
                    ctx.pid()
                )));
            }
        }
    }
    Ok(())
}
