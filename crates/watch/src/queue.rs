use std::collections::VecDeque;

use declarative_core::OwnerKey;
use metrics::counter;
use rustc_hash::FxHashMap;

use crate::ReconcileRequest;

/// Coalescing request queue keyed by owner, FIFO by first arrival. A request
/// for a key that is already queued replaces the queued one in place, so the
/// queue never holds more entries than there are owners and nothing is ever
/// evicted.
pub struct RequestQueue {
    map: FxHashMap<OwnerKey, ReconcileRequest>,
    order: VecDeque<OwnerKey>,
    coalesced: u64,
}

impl RequestQueue {
    /// `cap` only sizes the initial allocation.
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::with_capacity(cap), coalesced: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn coalesced(&self) -> u64 { self.coalesced }
    pub fn contains(&self, key: &OwnerKey) -> bool { self.map.contains_key(key) }

    /// Returns false when the request merged into one already queued.
    pub fn push(&mut self, req: ReconcileRequest) -> bool {
        let key = req.key.clone();
        if self.map.insert(key.clone(), req).is_some() {
            self.coalesced += 1;
            counter!("queue_coalesced_total", 1u64);
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<ReconcileRequest> {
        while let Some(key) = self.order.pop_front() {
            if let Some(req) = self.map.remove(&key) {
                return Some(req);
            }
        }
        None
    }

    /// Drain everything currently queued, in order.
    pub fn drain_ready(&mut self) -> Vec<ReconcileRequest> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(req) = self.pop() {
            out.push(req);
        }
        out
    }
}
