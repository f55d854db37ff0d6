//! Bounded recency cache of recently stored events.
//!
//! A least-recently-used index keyed by event identity. Entries are only
//! populated after a durable store write, so a hit means "already stored".
//! A miss means nothing more than "ask the store".
//!
//! Layout: a slab of nodes linked into a doubly-linked recency list by index,
//! plus a `HashMap` from identity to slab slot. `put` and `get` are O(1);
//! eviction pops the list tail.

use std::collections::HashMap;

use mxindex_core::{Event, EventSummary};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug)]
struct Node {
  identity: String,
  summary: EventSummary,
  prev: Option<usize>,
  next: Option<usize>,
}

#[derive(Debug, Default)]
struct Lru {
  nodes: Vec<Node>,
  index: HashMap<String, usize>,
  /// Most recently used
  head: Option<usize>,
  /// Least recently used
  tail: Option<usize>,
}

impl Lru {
  fn unlink(&mut self, slot: usize) {
    let (prev, next) = {
      let node = &self.nodes[slot];
      (node.prev, node.next)
    };

    match prev {
      Some(p) => self.nodes[p].next = next,
      None => self.head = next,
    }
    match next {
      Some(n) => self.nodes[n].prev = prev,
      None => self.tail = prev,
    }

    let node = &mut self.nodes[slot];
    node.prev = None;
    node.next = None;
  }

  fn push_front(&mut self, slot: usize) {
    self.nodes[slot].prev = None;
    self.nodes[slot].next = self.head;
    if let Some(h) = self.head {
      self.nodes[h].prev = Some(slot);
    }
    self.head = Some(slot);
    if self.tail.is_none() {
      self.tail = Some(slot);
    }
  }

  fn touch(&mut self, slot: usize) {
    if self.head != Some(slot) {
      self.unlink(slot);
      self.push_front(slot);
    }
  }
}

/// Thread-safe LRU cache of event summaries
#[derive(Debug)]
pub struct RecencyCache {
  capacity: usize,
  inner: Mutex<Lru>,
}

impl RecencyCache {
  /// Create a cache holding at most `capacity` entries (minimum 1)
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      inner: Mutex::new(Lru {
        nodes: Vec::with_capacity(capacity.min(4096)),
        ..Default::default()
      }),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn len(&self) -> usize {
    self.inner.lock().index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Membership check. Does not change recency.
  pub fn contains(&self, identity: &str) -> bool {
    self.inner.lock().index.contains_key(identity)
  }

  /// Look up an entry and mark it most recently used
  pub fn get(&self, identity: &str) -> Option<EventSummary> {
    let mut lru = self.inner.lock();
    let slot = *lru.index.get(identity)?;
    lru.touch(slot);
    Some(lru.nodes[slot].summary.clone())
  }

  /// Insert an event or refresh its recency, evicting the least recently used
  /// entry when full.
  pub fn put(&self, event: &Event) {
    let summary = event.summary();
    let mut lru = self.inner.lock();

    if let Some(&slot) = lru.index.get(&event.identity) {
      lru.nodes[slot].summary = summary;
      lru.touch(slot);
      return;
    }

    let slot = if lru.index.len() >= self.capacity {
      // Reuse the evicted tail slot
      let Some(victim) = lru.tail else {
        return;
      };
      lru.unlink(victim);
      let evicted = std::mem::replace(&mut lru.nodes[victim].identity, event.identity.clone());
      lru.index.remove(&evicted);
      lru.nodes[victim].summary = summary;
      trace!(evicted = %evicted, inserted = %event.identity, "Cache eviction");
      victim
    } else {
      lru.nodes.push(Node {
        identity: event.identity.clone(),
        summary,
        prev: None,
        next: None,
      });
      lru.nodes.len() - 1
    };

    lru.index.insert(event.identity.clone(), slot);
    lru.push_front(slot);
  }
}
