//! A context: one logical BSP process hosted on a node.
//!
//! Contexts issue the same operations as flat processes, but route them by
//! locality: traffic for a peer on the same node goes through the private
//! fast-path queues, traffic for another node is appended to the node's
//! shared tables under the per-node lock. Registration intents are only
//! collected here; the barrier root batches, validates and installs them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BspError, Result};
use crate::multi::local::LocalDeliveryQueue;
use crate::multi::shared::SharedSlot;
use crate::multi::{NodeState, PID_PREFIX_BYTES};

/// One translated registration: the peer addresses of a local region,
/// indexed by global pid.
#[derive(Debug, Clone)]
pub(crate) struct Registered {
    pub peers: Arc<Vec<u64>>,
    pub nbytes: usize,
    pub serial: u64,
}

/// A pending push/pop intent, batched at the next barrier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegIntent {
    pub addr: u64,
    pub nbytes: u64,
    pub serial: u64,
    pub push: bool,
}

/// A received message in a context inbox.
#[derive(Debug)]
struct InboxMessage {
    tag: Vec<u8>,
    payload: Vec<u8>,
}

/// Handle of one logical process. Obtained from
/// [`ContextGroup::superstep`](crate::ContextGroup::superstep).
pub struct Context {
    node: Arc<NodeState>,
    global_pid: usize,
    local_pid: usize,
    pub(crate) registers: HashMap<usize, Registered>,
    pub(crate) reg_requests: Vec<RegIntent>,
    pub(crate) local: LocalDeliveryQueue,
    inbox: Vec<InboxMessage>,
    inbox_head: usize,
    inbox_bytes: usize,
    pub(crate) shared: HashMap<String, Box<dyn SharedSlot>>,
    pub(crate) any_hp: bool,
}

impl Context {
    pub(crate) fn new(node: Arc<NodeState>, local_pid: usize) -> Self {
        let global_pid = node.mapper.local_to_global(local_pid);
        Context {
            node,
            global_pid,
            local_pid,
            registers: HashMap::new(),
            reg_requests: Vec::new(),
            local: LocalDeliveryQueue::default(),
            inbox: Vec::new(),
            inbox_head: 0,
            inbox_bytes: 0,
            shared: HashMap::new(),
            any_hp: false,
        }
    }

    /// Global id of this logical process.
    pub fn pid(&self) -> usize {
        self.global_pid
    }

    /// Id of this context on its node.
    pub fn local_pid(&self) -> usize {
        self.local_pid
    }

    /// Number of logical processes in the group.
    pub fn nprocs(&self) -> usize {
        self.node.mapper.nprocs()
    }

    /// Number of physical nodes hosting the group.
    pub fn node_count(&self) -> usize {
        self.node.mapper.nnodes()
    }

    fn check_pid(&self, pid: usize) -> Result<()> {
        if pid >= self.node.mapper.nprocs() {
            return Err(BspError::Internal(format!(
                "pid {pid} outside the {}-process group",
                self.node.mapper.nprocs()
            )));
        }
        Ok(())
    }

    fn translate(&self, pid: usize, addr: usize, offset: usize) -> Result<u64> {
        let reg = self.registers.get(&addr).ok_or_else(|| {
            BspError::Registration(format!(
                "address {addr:#x} is not registered in context {}",
                self.global_pid
            ))
        })?;
        Ok(reg.peers[pid] + offset as u64)
    }

    /// Export the region at `addr` from the next superstep on. All contexts
    /// of the group must issue their push/pop intents in the same order and
    /// with the same sizes.
    ///
    /// # Safety
    ///
    /// The region `addr .. addr + nbytes` must stay valid and must not be
    /// accessed while a barrier that may deliver into it runs, until a
    /// matching `pop_reg` has taken effect.
    pub unsafe fn push_reg(&mut self, addr: usize, nbytes: usize) -> Result<()> {
        if self.registers.contains_key(&addr) {
            return Err(BspError::Registration(format!(
                "duplicate push_reg for address {addr:#x}"
            )));
        }
        if self.reg_requests.len() >= crate::defaults::MAX_REG_REQUESTS {
            return Err(BspError::Registration(
                "too many registration requests in one superstep".to_string(),
            ));
        }
        let serial = (self.registers.len() + self.reg_requests.len()) as u64;
        self.reg_requests.push(RegIntent {
            addr: addr as u64,
            nbytes: nbytes as u64,
            serial,
            push: true,
        });
        Ok(())
    }

    /// Retire the registration of `addr` at the next barrier.
    pub fn pop_reg(&mut self, addr: usize) -> Result<()> {
        let reg = self.registers.get(&addr).ok_or_else(|| {
            BspError::Registration(format!(
                "pop_reg of unregistered address {addr:#x}"
            ))
        })?;
        self.reg_requests.push(RegIntent {
            addr: addr as u64,
            nbytes: reg.nbytes as u64,
            serial: reg.serial,
            push: false,
        });
        Ok(())
    }

    /// Buffered one-sided write to logical process `pid`; `src` is captured
    /// now and lands at the next barrier.
    pub fn put(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.check_pid(pid)?;
        let target = self.translate(pid, dst, offset)?;
        let n = self.node.mapper.global_to_node(pid);
        if n == self.node.mapper.this_node() {
            self.local.put(src, target as usize);
            Ok(())
        } else {
            self.node.engine.lock().put_translated(n, target, src)
        }
    }

    /// Unbuffered one-sided write. A local target is copied immediately;
    /// a remote one follows the buffered path.
    pub fn hpput(&mut self, pid: usize, src: &[u8], dst: usize, offset: usize) -> Result<()> {
        self.check_pid(pid)?;
        let target = self.translate(pid, dst, offset)?;
        let n = self.node.mapper.global_to_node(pid);
        if n == self.node.mapper.this_node() {
            unsafe {
                std::ptr::copy(src.as_ptr(), target as usize as *mut u8, src.len());
            }
            Ok(())
        } else {
            self.any_hp = true;
            self.node.engine.lock().put_translated(n, target, src)
        }
    }

    /// One-sided read from logical process `pid` into local memory at
    /// `dst`; the bytes land at the next barrier.
    ///
    /// # Safety
    ///
    /// `dst .. dst + nbytes` must be valid for writes when the barrier runs
    /// and must not be accessed concurrently with it.
    pub unsafe fn get(
        &mut self,
        pid: usize,
        src: usize,
        offset: usize,
        dst: usize,
        nbytes: usize,
    ) -> Result<()> {
        self.check_pid(pid)?;
        let source = self.translate(pid, src, offset)?;
        let n = self.node.mapper.global_to_node(pid);
        if n == self.node.mapper.this_node() {
            // Read at barrier time, like the remote path.
            self.local.raw_copy(source as usize, dst, nbytes);
            Ok(())
        } else {
            self.node
                .engine
                .lock()
                .get_translated(n, source, 0, dst as u64, nbytes as u32)
        }
    }

    /// Unbuffered one-sided read. A local source is copied immediately; a
    /// remote one follows the request path.
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
        self.check_pid(pid)?;
        let source = self.translate(pid, src, offset)?;
        let n = self.node.mapper.global_to_node(pid);
        if n == self.node.mapper.this_node() {
            std::ptr::copy(source as usize as *const u8, dst as *mut u8, nbytes);
            Ok(())
        } else {
            self.any_hp = true;
            self.node
                .engine
                .lock()
                .get_translated(n, source, 0, dst as u64, nbytes as u32)
        }
    }

    /// Queue a message for logical process `pid`. `tag` must match the
    /// current tag size.
    pub fn send(&mut self, pid: usize, tag: &[u8], payload: &[u8]) -> Result<()> {
        self.check_pid(pid)?;
        let n = self.node.mapper.global_to_node(pid);
        let mut engine = self.node.engine.lock();
        let user_tag_size = engine.send_tag_size() - PID_PREFIX_BYTES;
        if tag.len() != user_tag_size {
            return Err(BspError::Internal(format!(
                "send tag of {} bytes, current tag size is {user_tag_size}",
                tag.len()
            )));
        }
        if n == self.node.mapper.this_node() {
            drop(engine);
            self.local
                .send(self.node.mapper.global_to_local(pid), tag, payload);
            Ok(())
        } else {
            // The wire tag carries the target logical id so the receiving
            // node can dispatch to the right inbox.
            let mut wire_tag = Vec::with_capacity(PID_PREFIX_BYTES + tag.len());
            wire_tag.extend_from_slice(&(pid as u32).to_le_bytes());
            wire_tag.extend_from_slice(tag);
            engine.send(n, &wire_tag, payload)
        }
    }

    /// Request a new tag size for the whole group; reports the previous one
    /// through `size`. Collective: every context must request the same size
    /// in the same superstep.
    pub fn set_tagsize(&mut self, size: &mut usize) -> Result<()> {
        let mut wire = *size + PID_PREFIX_BYTES;
        self.node.engine.lock().set_tagsize(&mut wire)?;
        *size = wire - PID_PREFIX_BYTES;
        Ok(())
    }

    /// `(messages, payload bytes)` remaining in this context's inbox.
    pub fn qsize(&self) -> (usize, usize) {
        (self.inbox.len() - self.inbox_head, self.inbox_bytes)
    }

    /// Tag and payload size of the current message.
    pub fn get_tag(&self) -> Option<(usize, &[u8])> {
        self.inbox
            .get(self.inbox_head)
            .map(|m| (m.payload.len(), m.tag.as_slice()))
    }

    /// Copy up to `dst.len()` bytes of the current payload and advance.
    pub fn move_into(&mut self, dst: &mut [u8]) -> usize {
        let Some(m) = self.inbox.get(self.inbox_head) else {
            return 0;
        };
        let n = m.payload.len().min(dst.len());
        dst[..n].copy_from_slice(&m.payload[..n]);
        self.inbox_bytes -= m.payload.len();
        self.inbox_head += 1;
        n
    }

    /// Current tag and payload in place; valid until the next barrier.
    pub fn hpmove(&mut self) -> Option<(&[u8], &[u8])> {
        let m = self.inbox.get(self.inbox_head)?;
        self.inbox_bytes -= m.payload.len();
        self.inbox_head += 1;
        Some((m.tag.as_slice(), m.payload.as_slice()))
    }

    /// Typed read access to a shared slot declared on the group.
    pub fn shared<T: 'static>(&self, name: &str) -> Result<&T> {
        self.slot(name)
            .ok_or_else(|| BspError::Internal(format!("no shared slot named {name:?}")))?
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| {
                BspError::Internal(format!("shared slot {name:?} holds a different type"))
            })
    }

    /// Typed write access to a shared slot declared on the group.
    pub fn shared_mut<T: 'static>(&mut self, name: &str) -> Result<&mut T> {
        self.shared
            .get_mut(name)
            .ok_or_else(|| BspError::Internal(format!("no shared slot named {name:?}")))?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| {
                BspError::Internal(format!("shared slot {name:?} holds a different type"))
            })
    }

    // Barrier-side plumbing, driven by the group root.

    pub(crate) fn slot(&self, name: &str) -> Option<&dyn SharedSlot> {
        self.shared.get(name).map(|s| s.as_ref())
    }

    pub(crate) fn slot_mut(&mut self, name: &str) -> Option<&mut Box<dyn SharedSlot>> {
        self.shared.get_mut(name)
    }

    pub(crate) fn take_any_hp(&mut self) -> bool {
        std::mem::take(&mut self.any_hp)
    }

    /// Open the next inbox window, dropping unconsumed messages.
    pub(crate) fn begin_window(&mut self) {
        self.inbox.clear();
        self.inbox_head = 0;
        self.inbox_bytes = 0;
    }

    pub(crate) fn deliver_message(&mut self, tag: Vec<u8>, payload: Vec<u8>) {
        self.inbox_bytes += payload.len();
        self.inbox.push(InboxMessage { tag, payload });
    }

    pub(crate) fn reset_buffers(&mut self) {
        self.local.reset();
        self.begin_window();
    }
}
