//! The bulk-synchronous message inbox: a cursor over the received delivery
//! table.
//!
//! Messages are never copied into a separate queue; after a barrier the
//! `send` records already sit in the received table, chained into a single
//! list that may hop across columns. The queue tracks the head of that chain
//! plus the counters a receiver can query, and the two tag sizes: the one in
//! force for the messages being read (`recv_tag_size`) and the pending one
//! for messages being sent (`send_tag_size`).

use crate::delivery::DeliveryTable;

#[derive(Debug, Clone)]
pub struct MessageQueue {
    /// Tag size of the messages in the current inbox window.
    pub recv_tag_size: usize,
    /// Tag size applied to messages sent this superstep.
    pub send_tag_size: usize,
    /// Messages remaining in the inbox.
    pub n_mesg: usize,
    /// Sum of the payload sizes of the remaining messages.
    pub accum_bytes: usize,
    /// Absolute slot index of the current message in the received delivery
    /// table; `None` when the inbox is empty.
    pub head: Option<usize>,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue {
            recv_tag_size: 0,
            send_tag_size: 0,
            n_mesg: 0,
            accum_bytes: 0,
            head: None,
        }
    }

    /// Open the next inbox window: drop whatever was not consumed and make
    /// the pending tag size current.
    pub fn sync(&mut self) {
        self.recv_tag_size = self.send_tag_size;
        self.n_mesg = 0;
        self.accum_bytes = 0;
        self.head = None;
    }

    /// `(messages, payload bytes)` remaining.
    pub fn qsize(&self) -> (usize, usize) {
        (self.n_mesg, self.accum_bytes)
    }

    /// Tag and payload size of the current message without consuming it.
    /// `None` when the inbox is empty (BSPlib reports status −1).
    pub fn get_tag<'a>(&self, table: &'a DeliveryTable) -> Option<(usize, &'a [u8])> {
        if self.n_mesg == 0 {
            return None;
        }
        let head = self.head?;
        let payload_len = table.record_info(head) as usize;
        Some((payload_len, table.payload(head, 0, self.recv_tag_size)))
    }

    /// Copy up to `dst.len()` payload bytes of the current message and
    /// advance. Returns the number of bytes copied; 0 when the inbox is
    /// empty and `dst` is non-empty only if the payload was empty too.
    pub fn move_into(&mut self, table: &DeliveryTable, dst: &mut [u8]) -> usize {
        let Some(head) = self.head else { return 0 };
        if self.n_mesg == 0 {
            return 0;
        }
        let payload_len = table.record_info(head) as usize;
        let n = payload_len.min(dst.len());
        dst[..n].copy_from_slice(table.payload(head, self.recv_tag_size, n));
        self.advance(table, head, payload_len);
        n
    }

    /// Hand out the current tag and payload in place and advance. The
    /// returned slices stay valid until the next barrier resets the table.
    pub fn hpmove<'a>(&mut self, table: &'a DeliveryTable) -> Option<(&'a [u8], &'a [u8])> {
        if self.n_mesg == 0 {
            return None;
        }
        let head = self.head?;
        let payload_len = table.record_info(head) as usize;
        let tag = table.payload(head, 0, self.recv_tag_size);
        let payload = table.payload(head, self.recv_tag_size, payload_len);
        self.advance(table, head, payload_len);
        Some((tag, payload))
    }

    fn advance(&mut self, table: &DeliveryTable, head: usize, payload_len: usize) {
        self.n_mesg -= 1;
        self.accum_bytes -= payload_len;
        self.head = if self.n_mesg == 0 {
            None
        } else {
            Some(head + table.record_next(head) as usize)
        };
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        MessageQueue::new()
    }
}
