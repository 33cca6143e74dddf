//! Per-context fast path for traffic whose target lives on the same node.
//!
//! Nothing here touches the transport or a lock: each context owns its
//! queues, fills them during the computation phase, and the barrier root
//! drains them (raw copies first, then buffered puts, then message
//! hand-off) before any transport call is issued.

use std::ptr;

/// Doubling byte buffer for data captured at enqueue time. Offsets are
/// 8-byte aligned so captured blocks can be handed out as-is.
#[derive(Debug, Default)]
pub(crate) struct ByteArena {
    storage: Vec<u8>,
}

impl ByteArena {
    /// Copy `src` in and return its offset.
    pub fn buffer(&mut self, src: &[u8]) -> usize {
        let at = self.storage.len();
        self.storage.extend_from_slice(src);
        // pad to the next 8-byte boundary
        let pad = (8 - self.storage.len() % 8) % 8;
        self.storage.resize(self.storage.len() + pad, 0);
        at
    }

    pub fn get(&self, at: usize, len: usize) -> &[u8] {
        &self.storage[at..at + len]
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }

    pub fn reset(&mut self) {
        self.storage = Vec::new();
    }
}

/// A buffered local put: data already captured in the arena.
#[derive(Debug, Clone, Copy)]
struct BufferedPut {
    offset: usize,
    dst: usize,
    nbytes: usize,
}

/// An unbuffered local copy, performed at barrier time.
#[derive(Debug, Clone, Copy)]
struct RawCopy {
    src: usize,
    dst: usize,
    nbytes: usize,
}

/// A message for a co-located context.
#[derive(Debug, Clone, Copy)]
struct LocalSend {
    dst_local: usize,
    tag_at: usize,
    tag_len: usize,
    payload_at: usize,
    payload_len: usize,
}

/// The per-context delivery queues.
#[derive(Debug, Default)]
pub(crate) struct LocalDeliveryQueue {
    puts: Vec<BufferedPut>,
    put_arena: ByteArena,
    raw_copies: Vec<RawCopy>,
    sends: Vec<LocalSend>,
    send_arena: ByteArena,
}

impl LocalDeliveryQueue {
    /// Queue a buffered put; `src` is captured now.
    pub fn put(&mut self, src: &[u8], dst: usize) {
        let offset = self.put_arena.buffer(src);
        self.puts.push(BufferedPut {
            offset,
            dst,
            nbytes: src.len(),
        });
    }

    /// Queue an unbuffered copy executed at the barrier. Used for local
    /// gets (read the source when the superstep ends, not before).
    pub fn raw_copy(&mut self, src: usize, dst: usize, nbytes: usize) {
        self.raw_copies.push(RawCopy { src, dst, nbytes });
    }

    /// Queue a message for a co-located context; tag and payload are
    /// captured now.
    pub fn send(&mut self, dst_local: usize, tag: &[u8], payload: &[u8]) {
        let tag_at = self.send_arena.buffer(tag);
        let payload_at = self.send_arena.buffer(payload);
        self.sends.push(LocalSend {
            dst_local,
            tag_at,
            tag_len: tag.len(),
            payload_at,
            payload_len: payload.len(),
        });
    }

    /// Apply all queued memory deliveries and move the queued messages into
    /// `messages` as `(dst_local, tag, payload)` in issue order.
    ///
    /// # Safety
    ///
    /// Every queued destination (and raw-copy source) must point into a
    /// region covered by an active registration on this node, per the
    /// `push_reg` contract.
    pub unsafe fn drain(&mut self, messages: &mut Vec<(usize, Vec<u8>, Vec<u8>)>) {
        for c in self.raw_copies.drain(..) {
            ptr::copy(c.src as *const u8, c.dst as *mut u8, c.nbytes);
        }
        for p in self.puts.drain(..) {
            let src = self.put_arena.get(p.offset, p.nbytes);
            ptr::copy_nonoverlapping(src.as_ptr(), p.dst as *mut u8, p.nbytes);
        }
        self.put_arena.clear();
        for m in self.sends.drain(..) {
            messages.push((
                m.dst_local,
                self.send_arena.get(m.tag_at, m.tag_len).to_vec(),
                self.send_arena.get(m.payload_at, m.payload_len).to_vec(),
            ));
        }
        self.send_arena.clear();
    }

    /// Drop queued work and release the arenas.
    pub fn reset(&mut self) {
        self.puts = Vec::new();
        self.raw_copies = Vec::new();
        self.sends = Vec::new();
        self.put_arena.reset();
        self.send_arena.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_offsets_are_aligned() {
        let mut a = ByteArena::default();
        let first = a.buffer(&[1, 2, 3]);
        let second = a.buffer(&[4; 10]);
        assert_eq!(first % 8, 0);
        assert_eq!(second % 8, 0);
        assert_eq!(a.get(first, 3), &[1, 2, 3]);
        assert_eq!(a.get(second, 10), &[4; 10]);
    }

    #[test]
    fn drain_applies_raw_copies_before_buffered_puts() {
        let mut q = LocalDeliveryQueue::default();
        let mut target = [0u8; 4];
        let source = [9u8; 4];

        // The buffered put captured its value at enqueue; the raw copy reads
        // at drain time. Queue the raw copy first so the put must win.
        q.raw_copy(source.as_ptr() as usize, target.as_mut_ptr() as usize, 4);
        q.put(&[5u8; 4], target.as_mut_ptr() as usize);

        let mut msgs = Vec::new();
        unsafe { q.drain(&mut msgs) };
        assert_eq!(target, [5u8; 4]);
        assert!(msgs.is_empty());
    }

    #[test]
    fn drain_hands_messages_out_in_issue_order() {
        let mut q = LocalDeliveryQueue::default();
        q.send(1, &[7], b"first");
        q.send(0, &[8], b"second");
        let mut msgs = Vec::new();
        unsafe { q.drain(&mut msgs) };
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], (1, vec![7], b"first".to_vec()));
        assert_eq!(msgs[1], (0, vec![8], b"second".to_vec()));
        // Queues are empty after a drain.
        let mut more = Vec::new();
        unsafe { q.drain(&mut more) };
        assert!(more.is_empty());
    }
}
