//! Generic thread-safe ordered queue parameterised by a policy actor
//! (`spec.md` §4.2), following `original_source/core/PriorityQueue.h`'s
//! operation surface (`push`/`pop`/`peek`/`getSize`/`clear`/explicit
//! `lock`/`unlock`) but built on `tokio::sync::Mutex` instead of a raw
//! `pthread_mutex_t`, matching the teacher crate's async-native idiom for
//! guarding shared mutable state (see e.g. `tx.rs`'s `Mutex<Sequencer>`).

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::ops::Deref;
use tokio::sync::{Mutex, MutexGuard};

/// Policy actor supplying ordering, validity, and window-admission rules for
/// a `PriorityQueue`. Negative `compare` result means `a` is older / higher
/// priority than `b`.
pub trait QueuePolicy<T>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Elements failing validity are dropped lazily on pop/peek, not on
    /// push, so the queue absorbs transient out-of-order arrivals.
    fn is_valid(&self, elem: &T) -> bool;

    /// If true, `new_elem` is rejected with `QueueFull` rather than
    /// admitted alongside `head`.
    fn window_exceeded(&self, head: &T, new_elem: &T) -> bool;
}

/// Backing storage, exposed read-only via `lock()` for callers that need to
/// iterate under their own critical section (mirrors the original's
/// `getHead()` + manual `lock()`/`unlock()` pattern).
#[derive(Debug, Default)]
pub struct Inner<T> {
    items: Vec<T>,
}

impl<T> Deref for Inner<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.items
    }
}

pub struct PriorityQueue<T, P: QueuePolicy<T>> {
    inner: Mutex<Inner<T>>,
    policy: P,
    max_bytes: usize,
}

impl<T, P: QueuePolicy<T>> PriorityQueue<T, P> {
    pub fn new(policy: P, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { items: Vec::new() }),
            policy,
            max_bytes,
        }
    }

    /// Insert `item` in priority order. Rejects with `QueueFull` if the
    /// memory-based capacity gate trips or the policy's window check
    /// rejects the element against the current head.
    pub async fn push(&self, item: T) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let byte_estimate = (guard.items.len() + 1) * std::mem::size_of::<T>();
        if byte_estimate > self.max_bytes {
            return Err(Error::QueueFull);
        }
        if let Some(head) = guard.items.first() {
            if self.policy.window_exceeded(head, &item) {
                return Err(Error::QueueFull);
            }
        }
        let pos = guard
            .items
            .binary_search_by(|existing| self.policy.compare(existing, &item))
            .unwrap_or_else(|insert_at| insert_at);
        guard.items.insert(pos, item);
        Ok(())
    }

    /// Pop the head, skipping (and dropping) any leading elements the
    /// policy now considers invalid.
    pub async fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().await;
        loop {
            let valid = match guard.items.first() {
                Some(head) => self.policy.is_valid(head),
                None => return None,
            };
            if valid {
                return Some(guard.items.remove(0));
            }
            guard.items.remove(0);
        }
    }

    /// Peek the head after dropping any leading invalid elements, without
    /// removing it.
    pub async fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut guard = self.inner.lock().await;
        loop {
            let valid = match guard.items.first() {
                Some(head) => self.policy.is_valid(head),
                None => return None,
            };
            if valid {
                return guard.items.first().cloned();
            }
            guard.items.remove(0);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.inner.lock().await.items.clear();
    }

    /// Explicit critical-section lock for callers that need to iterate the
    /// queue's contents atomically (e.g. `to_consume_global_seq` advancement
    /// in `rx`). Mirrors the original's explicit `lock()`/`unlock()` pair;
    /// the guard's `Drop` is the "unlock".
    pub async fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().await
    }
}
