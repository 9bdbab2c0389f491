//! Per-direction reorder buffer: incoming priority queue + window gate,
//! surfacing in-order packets (`spec.md` §4.3).
//!
//! Sequence-space comparisons use the standard wraparound trick (treat the
//! wrapping difference as a signed `i8`) the way the teacher crate's
//! `reorder.rs` compares `u64` sequence numbers directly — `global_seq` here
//! is a `u8` so the same idea is expressed with a signed 8-bit cast instead
//! of unsigned subtraction.

use crate::packet::Packet;
use crate::queue::{PriorityQueue, QueuePolicy};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Signed wraparound distance from `anchor` to `seq`: negative means `seq`
/// is behind `anchor` (already consumed / stale duplicate).
fn signed_delta(seq: u8, anchor: u8) -> i8 {
    seq.wrapping_sub(anchor) as i8
}

struct ReorderPolicy {
    anchor: Arc<AtomicU8>,
    window: u16,
}

impl QueuePolicy<Packet> for ReorderPolicy {
    fn compare(&self, a: &Packet, b: &Packet) -> Ordering {
        let anchor = self.anchor.load(AtomicOrdering::Acquire);
        let da = a.global_seq().wrapping_sub(anchor);
        let db = b.global_seq().wrapping_sub(anchor);
        da.cmp(&db)
    }

    fn is_valid(&self, elem: &Packet) -> bool {
        let anchor = self.anchor.load(AtomicOrdering::Acquire);
        signed_delta(elem.global_seq(), anchor) >= 0
    }

    fn window_exceeded(&self, head: &Packet, new_elem: &Packet) -> bool {
        let span = new_elem.global_seq().wrapping_sub(head.global_seq()) as u16;
        span > self.window
    }
}

/// Outcome of pushing a packet into the window-gated reorder buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Admitted,
    WindowFull,
}

/// Per-direction reorder buffer. One instance guards the whole inbound
/// stream (global sequence space), not per-port — per-port reassembly
/// happens downstream in `rx`.
pub struct ReorderBuffer {
    queue: PriorityQueue<Packet, ReorderPolicy>,
    anchor: Arc<AtomicU8>,
}

impl ReorderBuffer {
    pub fn new(initial_to_consume: u8, window: u16, max_queue_bytes: usize) -> Self {
        let anchor = Arc::new(AtomicU8::new(initial_to_consume));
        let policy = ReorderPolicy {
            anchor: anchor.clone(),
            window,
        };
        Self {
            queue: PriorityQueue::new(policy, max_queue_bytes),
            anchor,
        }
    }

    pub fn to_consume(&self) -> u8 {
        self.anchor.load(AtomicOrdering::Acquire)
    }

    /// Admit `pkt` into the reorder queue. Returns `WindowFull` (and the
    /// last-valid sequence, for `onReceiveWindowFull`) without inserting
    /// when the window-admission policy rejects it.
    pub async fn push(&self, pkt: Packet) -> crate::error::Result<PushOutcome> {
        match self.queue.push(pkt).await {
            Ok(()) => Ok(PushOutcome::Admitted),
            Err(crate::error::Error::QueueFull) => Ok(PushOutcome::WindowFull),
            Err(e) => Err(e),
        }
    }

    /// Walk the queue while the head equals the next expected sequence,
    /// popping and advancing `to_consume_global_seq` by exactly 1 per
    /// delivered packet (monotonic modulo 256, `spec.md` §8).
    pub async fn drain_ready(&self) -> Vec<Packet> {
        let mut out = Vec::new();
        loop {
            let expected = self.to_consume();
            let head_matches = {
                let guard = self.queue.lock().await;
                matches!(guard.first(), Some(p) if p.global_seq() == expected)
            };
            if !head_matches {
                break;
            }
            match self.queue.pop().await {
                Some(pkt) => {
                    self.anchor.store(expected.wrapping_add(1), AtomicOrdering::Release);
                    out.push(pkt);
                }
                None => break,
            }
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.queue.len().await
    }

    pub async fn reset(&self, initial_to_consume: u8) {
        self.queue.clear().await;
        self.anchor.store(initial_to_consume, AtomicOrdering::Release);
    }
}
