//! Correlation registry
//!
//! Maps every live `CorrelationId` to the logical request that owns it. One
//! request may own several identifiers (one per batch, plus replacements
//! issued on retry); each identifier maps to exactly one request.
//!
//! The registry is plain data. It is owned and mutated by the dispatcher only.

use router_types::CorrelationId;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifier of a logical request, stable across retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    correlation_ids: HashSet<CorrelationId>,
}

#[derive(Debug)]
pub struct CorrelationRegistry<H> {
    owners: HashMap<CorrelationId, RequestId>,
    entries: HashMap<RequestId, Entry<H>>,
}

impl<H> Default for CorrelationRegistry<H> {
    fn default() -> Self {
        Self {
            owners: HashMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl<H> CorrelationRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request under its correlation ids
    ///
    /// Nothing is inserted and `false` is returned if the request id or any of
    /// the correlation ids is already registered, or if no ids are given.
    pub fn insert(
        &mut self,
        request_id: RequestId,
        correlation_ids: impl IntoIterator<Item = CorrelationId>,
        handle: H,
    ) -> bool {
        let correlation_ids: HashSet<CorrelationId> = correlation_ids.into_iter().collect();
        if correlation_ids.is_empty()
            || self.entries.contains_key(&request_id)
            || correlation_ids.iter().any(|cid| self.owners.contains_key(cid))
        {
            return false;
        }

        for cid in &correlation_ids {
            self.owners.insert(*cid, request_id);
        }
        self.entries.insert(
            request_id,
            Entry {
                handle,
                correlation_ids,
            },
        );
        true
    }

    pub fn owner(&self, cid: CorrelationId) -> Option<RequestId> {
        self.owners.get(&cid).copied()
    }

    pub fn contains(&self, cid: CorrelationId) -> bool {
        self.owners.contains_key(&cid)
    }

    pub fn get_mut(&mut self, request_id: RequestId) -> Option<&mut H> {
        self.entries.get_mut(&request_id).map(|entry| &mut entry.handle)
    }

    /// Handle owning `cid`
    pub fn lookup_mut(&mut self, cid: CorrelationId) -> Option<(RequestId, &mut H)> {
        let request_id = self.owner(cid)?;
        self.get_mut(request_id).map(|handle| (request_id, handle))
    }

    /// Move ownership from `old` to `new` within the same request
    pub fn rebind(&mut self, old: CorrelationId, new: CorrelationId) -> bool {
        if self.owners.contains_key(&new) {
            return false;
        }
        let Some(request_id) = self.owners.remove(&old) else {
            return false;
        };

        self.owners.insert(new, request_id);
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.correlation_ids.remove(&old);
            entry.correlation_ids.insert(new);
        }
        true
    }

    /// Release one correlation id
    ///
    /// Returns the owning request and how many of its ids are still live. The
    /// entry itself stays until [`remove`](Self::remove) is called.
    pub fn release(&mut self, cid: CorrelationId) -> Option<(RequestId, usize)> {
        let request_id = self.owners.remove(&cid)?;
        let remaining = match self.entries.get_mut(&request_id) {
            Some(entry) => {
                entry.correlation_ids.remove(&cid);
                entry.correlation_ids.len()
            }
            None => 0,
        };
        Some((request_id, remaining))
    }

    /// Remove a request together with every id it still owns
    pub fn remove(&mut self, request_id: RequestId) -> Option<H> {
        let entry = self.entries.remove(&request_id)?;
        for cid in &entry.correlation_ids {
            self.owners.remove(cid);
        }
        Some(entry.handle)
    }

    /// Remove everything, e.g. when the session is lost
    pub fn drain(&mut self) -> Vec<(RequestId, H)> {
        self.owners.clear();
        self.entries
            .drain()
            .map(|(request_id, entry)| (request_id, entry.handle))
            .collect()
    }

    /// Number of logical requests in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live correlation ids across all requests
    pub fn correlation_count(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u64) -> CorrelationId {
        CorrelationId::new(n)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = CorrelationRegistry::new();
        assert!(registry.insert(RequestId::new(1), [cid(10), cid(11)], "batch"));

        assert_eq!(registry.owner(cid(10)), Some(RequestId::new(1)));
        assert_eq!(registry.owner(cid(11)), Some(RequestId::new(1)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.correlation_count(), 2);

        let (request_id, handle) = registry.lookup_mut(cid(11)).unwrap();
        assert_eq!(request_id, RequestId::new(1));
        assert_eq!(*handle, "batch");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut registry = CorrelationRegistry::new();
        assert!(registry.insert(RequestId::new(1), [cid(10)], ()));
        assert!(!registry.insert(RequestId::new(2), [cid(10), cid(12)], ()));
        assert!(!registry.insert(RequestId::new(1), [cid(13)], ()));
        assert!(!registry.insert(RequestId::new(3), Vec::<CorrelationId>::new(), ()));

        // the failed insert left nothing behind
        assert!(!registry.contains(cid(12)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_counts_remaining() {
        let mut registry = CorrelationRegistry::new();
        registry.insert(RequestId::new(1), [cid(10), cid(11)], ());

        assert_eq!(registry.release(cid(10)), Some((RequestId::new(1), 1)));
        assert_eq!(registry.release(cid(10)), None);
        assert_eq!(registry.release(cid(11)), Some((RequestId::new(1), 0)));

        // entry survives until removed explicitly
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(RequestId::new(1)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rebind_keeps_owner() {
        let mut registry = CorrelationRegistry::new();
        registry.insert(RequestId::new(7), [cid(1)], ());

        assert!(registry.rebind(cid(1), cid(2)));
        assert!(!registry.contains(cid(1)));
        assert_eq!(registry.owner(cid(2)), Some(RequestId::new(7)));
        assert_eq!(registry.correlation_count(), 1);

        // unknown source or taken target
        assert!(!registry.rebind(cid(1), cid(3)));
        registry.insert(RequestId::new(8), [cid(4)], ());
        assert!(!registry.rebind(cid(2), cid(4)));
    }

    #[test]
    fn test_remove_and_drain_clear_all_ids() {
        let mut registry = CorrelationRegistry::new();
        registry.insert(RequestId::new(1), [cid(1), cid(2)], 'a');
        registry.insert(RequestId::new(2), [cid(3)], 'b');

        assert_eq!(registry.remove(RequestId::new(1)), Some('a'));
        assert!(!registry.contains(cid(1)));
        assert!(!registry.contains(cid(2)));

        let drained = registry.drain();
        assert_eq!(drained, vec![(RequestId::new(2), 'b')]);
        assert_eq!(registry.correlation_count(), 0);
        assert!(registry.is_empty());
    }
}
