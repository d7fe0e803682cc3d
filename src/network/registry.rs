//! Ordered registry of cluster members
//!
//! Entries keep insertion order and are addressed by a stable
//! `MemberHandle` handed out on insert. Array positions are an internal
//! detail: removing one entry shifts the ones after it, which would silently
//! invalidate any position cached elsewhere, while a handle stays valid until
//! its own entry is removed.
//!
//! Capacity is managed explicitly:
//! - an insert that would reach capacity grows it to
//!   `2 * (capacity + added)`
//! - a removal that leaves `size <= capacity / 4` shrinks it to `size`

use std::collections::HashSet;

// =============================================================================
// Constants
// =============================================================================

/// Growth factor applied to `capacity + added`
const GROWTH_FACTOR: usize = 2;

/// Shrink once size is at or below `capacity / SHRINK_DIVISOR`
const SHRINK_DIVISOR: usize = 4;

// =============================================================================
// Member trait & handle
// =============================================================================

/// Anything that can live in a `Registry`: it exposes a typed identity used
/// for membership tests.
pub trait Member {
    type Id: Eq + ?Sized;

    fn member_id(&self) -> &Self::Id;
}

impl<T: Member + ?Sized> Member for std::sync::Arc<T> {
    type Id = T::Id;

    fn member_id(&self) -> &Self::Id {
        (**self).member_id()
    }
}

/// Stable reference to one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberHandle(u64);

impl std::fmt::Display for MemberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Growable, ordered collection of members
#[derive(Debug)]
pub struct Registry<T> {
    entries: Vec<(MemberHandle, T)>,
    /// Logical capacity, tracked separately from the Vec's allocation
    capacity: usize,
    next_handle: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            capacity: 0,
            next_handle: 1,
        }
    }

    /// Append a value, returning its stable handle
    pub fn add(&mut self, value: T) -> MemberHandle {
        self.grow_by(1);

        let handle = MemberHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push((handle, value));

        handle
    }

    /// Remove the entry behind `handle`. Returns `None` if it is already gone.
    pub fn remove(&mut self, handle: MemberHandle) -> Option<T> {
        let index = self.position(handle)?;
        self.remove_at(index)
    }

    /// Remove by current position, shifting later entries left by one
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        if index >= self.entries.len() {
            return None;
        }

        let (_, value) = self.entries.remove(index);
        self.shrink();

        Some(value)
    }

    pub fn get(&self, handle: MemberHandle) -> Option<&T> {
        self.entries
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, v)| v)
    }

    pub fn get_at(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|(_, v)| v)
    }

    /// Current position of an entry
    pub fn position(&self, handle: MemberHandle) -> Option<usize> {
        self.entries.iter().position(|(h, _)| *h == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Copy out every value in order
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    fn grow_by(&mut self, added: usize) {
        if self.entries.len() + added >= self.capacity {
            self.resize(GROWTH_FACTOR * (self.capacity + added));
        }
    }

    fn shrink(&mut self) {
        if self.entries.len() <= self.capacity / SHRINK_DIVISOR {
            self.resize(self.entries.len());
        }
    }

    fn resize(&mut self, capacity: usize) {
        if capacity > self.entries.capacity() {
            self.entries.reserve_exact(capacity - self.entries.len());
        } else {
            self.entries.shrink_to(capacity);
        }
        self.capacity = capacity;
    }
}

impl<T: Member> Registry<T> {
    /// Is there an entry whose identity equals `id`?
    pub fn contains(&self, id: &T::Id) -> bool {
        self.iter().any(|v| v.member_id() == id)
    }

    pub fn find(&self, id: &T::Id) -> Option<(MemberHandle, &T)> {
        self.entries
            .iter()
            .find(|(_, v)| v.member_id() == id)
            .map(|(h, v)| (*h, v))
    }
}

impl<T> Registry<T>
where
    T: Member<Id = str>,
{
    /// Set of member identities, skipping empty ones
    pub fn identities(&self) -> HashSet<String> {
        self.iter()
            .map(|v| v.member_id())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Peer(String);

    impl Member for Peer {
        type Id = str;

        fn member_id(&self) -> &str {
            &self.0
        }
    }

    fn peer(id: &str) -> Peer {
        Peer(id.to_string())
    }

    #[test]
    fn test_add_grows_capacity() {
        let mut reg = Registry::new();
        assert_eq!(reg.capacity(), 0);

        reg.add(peer("a"));
        assert_eq!(reg.capacity(), 2);

        reg.add(peer("b"));
        // size + 1 reached capacity 2: grows to 2 * (2 + 1)
        assert_eq!(reg.capacity(), 6);

        for i in 0..100 {
            reg.add(peer(&format!("n{}", i)));
            assert!(reg.len() <= reg.capacity());
        }
        assert_eq!(reg.len(), 102);
        assert_eq!(reg.get_at(0), Some(&peer("a")));
        assert_eq!(reg.get_at(101), Some(&peer("n99")));
    }

    #[test]
    fn test_remove_at_shifts_left() {
        let mut reg = Registry::new();
        for id in ["a", "b", "c", "d"] {
            reg.add(peer(id));
        }

        assert_eq!(reg.remove_at(1), Some(peer("b")));
        assert_eq!(reg.values(), vec![peer("a"), peer("c"), peer("d")]);
        assert_eq!(reg.get_at(1), Some(&peer("c")));

        assert_eq!(reg.remove_at(3), None);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_handles_survive_earlier_removal() {
        let mut reg = Registry::new();
        let a = reg.add(peer("a"));
        let b = reg.add(peer("b"));
        let c = reg.add(peer("c"));

        assert_eq!(reg.remove(a), Some(peer("a")));

        // Positions moved, handles did not.
        assert_eq!(reg.position(c), Some(1));
        assert_eq!(reg.get(c), Some(&peer("c")));
        assert_eq!(reg.remove(b), Some(peer("b")));
        assert_eq!(reg.remove(b), None);
        assert_eq!(reg.values(), vec![peer("c")]);
    }

    #[test]
    fn test_shrinks_to_size_and_keeps_order() {
        let mut reg = Registry::new();
        let handles: Vec<_> = (0..16).map(|i| reg.add(peer(&format!("n{}", i)))).collect();
        let before = reg.capacity();
        assert!(before >= 16);

        // Keep every fourth entry.
        for (i, h) in handles.iter().enumerate() {
            if i % 4 != 3 {
                reg.remove(*h);
            }
            assert!(reg.len() <= reg.capacity());
        }

        assert_eq!(reg.len(), 4);
        assert!(reg.capacity() < before);
        assert_eq!(
            reg.values(),
            vec![peer("n3"), peer("n7"), peer("n11"), peer("n15")]
        );
    }

    #[test]
    fn test_shrink_to_exact_size() {
        let mut reg = Registry::new();
        let a = reg.add(peer("a"));
        let b = reg.add(peer("b"));
        assert_eq!(reg.capacity(), 6);

        reg.remove(a);
        // 1 <= 6 / 4
        assert_eq!(reg.capacity(), 1);

        reg.remove(b);
        assert_eq!(reg.capacity(), 0);
        assert!(reg.is_empty());

        reg.add(peer("c"));
        assert_eq!(reg.capacity(), 2);
    }

    #[test]
    fn test_contains_and_identities() {
        let mut reg = Registry::new();
        reg.add(peer("alpha"));
        reg.add(peer(""));
        let h = reg.add(peer("beta"));

        assert!(reg.contains("alpha"));
        assert!(!reg.contains("gamma"));
        assert_eq!(reg.find("beta").map(|(handle, _)| handle), Some(h));

        let ids = reg.identities();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("alpha") && ids.contains("beta"));
    }

    #[test]
    fn test_mixed_sequence_invariants() {
        let mut reg = Registry::new();
        let mut live = Vec::new();

        for round in 0..50usize {
            live.push((reg.add(peer(&round.to_string())), round));
            if round % 3 == 2 {
                let (h, _) = live.remove(round % live.len());
                assert!(reg.remove(h).is_some());
            }
            assert!(reg.len() <= reg.capacity());
            assert_eq!(reg.len(), live.len());
        }

        let expected: Vec<_> = live.iter().map(|(_, n)| peer(&n.to_string())).collect();
        assert_eq!(reg.values(), expected);
    }
}
