//! Bounded trace cache
//!
//! Owns captured traces under short random ids. Inserting past capacity
//! evicts the oldest insertion; lookups do not refresh an entry's age.
//! The cache has no internal locking: callers sharing one across threads
//! wrap it in a mutex.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use tracing::debug;

use crate::trace::InMemoryTrace;

/// Capacity used by [`TraceCache::default`].
pub const DEFAULT_MAX_SIZE: usize = 100;

#[derive(Debug)]
pub struct TraceCache<T = InMemoryTrace> {
    max_size: usize,
    entries: HashMap<String, T>,
    /// Ids, oldest first
    order: VecDeque<String>,
}

impl<T> Default for TraceCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl<T> TraceCache<T> {
    /// A capacity of 0 is treated as 1.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store `trace` under a fresh id and return the id.
    pub fn insert(&mut self, trace: T) -> String {
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate = format!("{:08x}", rng.gen::<u32>());
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.insert_with_id(id.clone(), trace);
        id
    }

    /// Store `trace` under `id`, replacing (and re-aging) any existing entry.
    pub fn insert_with_id(&mut self, id: impl Into<String>, trace: T) {
        let id = id.into();
        if self.entries.contains_key(&id) {
            self.order.retain(|existing| existing != &id);
        } else {
            while self.entries.len() >= self.max_size {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
                debug!("Evicted trace {oldest}");
            }
        }
        self.order.push_back(id.clone());
        self.entries.insert(id, trace);
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let trace = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(trace)
    }

    /// Ids, oldest first.
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
