//! Slot hashing and the slot-to-node map.

use std::sync::RwLock;

use crc::{Crc, CRC_16_XMODEM};

/// Number of hash slots a cluster distributes keys over.
pub const SLOT_COUNT: u16 = 16384;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Calculates the hash slot for a key.
///
/// Uses CRC16 (XMODEM) modulo 16384. If the key contains a `{...}` hash
/// tag, only the content of the first non-empty brace pair is hashed, so
/// related keys can be forced onto one slot.
///
/// # Examples
///
/// ```
/// use shoal::key_slot;
///
/// assert_eq!(key_slot(b"foo"), 12182);
/// assert_eq!(
///     key_slot(b"{user1000}.following"),
///     key_slot(b"{user1000}.followers")
/// );
/// ```
pub fn key_slot(key: &[u8]) -> u16 {
    let hash_key = extract_hash_tag(key);
    CRC16.checksum(hash_key) % SLOT_COUNT
}

/// Extracts the hash tag from a key, or returns the whole key when no
/// valid tag exists. A tag is the content of the first `{...}` pair and
/// must be non-empty.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|b| *b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|b| *b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// In-memory map from hash slot to the ordered node keys serving it.
///
/// Each entry is either empty or a list whose first element is the
/// primary for the slot and whose remaining elements are replicas. Keys
/// are canonical `host:port` strings owned by the connection pool.
#[derive(Debug)]
pub struct SlotMap {
    slots: RwLock<Vec<Vec<String>>>,
}

impl SlotMap {
    /// Creates an empty map covering all slots.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![Vec::new(); SLOT_COUNT as usize]),
        }
    }

    /// Returns the ordered node keys for a slot, primary first.
    pub fn lookup(&self, slot: u16) -> Vec<String> {
        self.slots.read().unwrap()[slot as usize].clone()
    }

    /// Returns the primary node key for a slot, if the slot is covered.
    pub fn primary(&self, slot: u16) -> Option<String> {
        self.slots.read().unwrap()[slot as usize].first().cloned()
    }

    /// Points a slot's primary at `key`, inserting the slot entry when it
    /// does not exist yet. Replica entries are left alone.
    pub fn set_primary(&self, slot: u16, key: &str) {
        let mut slots = self.slots.write().unwrap();
        let entry = &mut slots[slot as usize];
        if entry.is_empty() {
            entry.push(key.to_string());
        } else {
            entry[0] = key.to_string();
        }
    }

    /// Replaces the whole layout with the given ranges.
    ///
    /// Every range assigns its ordered node-key list to each slot in
    /// `[start, end]`. Slots covered by no range become empty. The swap is
    /// a single atomic replacement, so lookups never observe a half
    /// rebuilt layout.
    pub fn rebuild(&self, ranges: &[(u16, u16, Vec<String>)]) {
        let mut fresh = vec![Vec::new(); SLOT_COUNT as usize];
        for (start, end, keys) in ranges {
            let end = (*end).min(SLOT_COUNT - 1);
            for slot in *start..=end {
                fresh[slot as usize] = keys.clone();
            }
        }
        *self.slots.write().unwrap() = fresh;
    }

    /// Returns true when no slot is covered.
    pub fn is_empty(&self) -> bool {
        self.slots.read().unwrap().iter().all(|entry| entry.is_empty())
    }
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_slot_values() {
        // Well-known values for this hash scheme.
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
    }

    #[test]
    fn slot_in_range() {
        assert!(key_slot(b"") < SLOT_COUNT);
        assert!(key_slot(b"some:key") < SLOT_COUNT);
    }

    #[test]
    fn hash_tag_groups_keys() {
        let a = key_slot(b"{user1000}.following");
        let b = key_slot(b"{user1000}.followers");
        assert_eq!(a, b);
        assert_eq!(a, key_slot(b"user1000"));
    }

    #[test]
    fn hash_tag_edge_cases() {
        assert_eq!(extract_hash_tag(b"foo{bar}baz"), b"bar");
        assert_eq!(extract_hash_tag(b"{a}{b}"), b"a");
        // Empty or unmatched braces fall back to the whole key.
        assert_eq!(extract_hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(extract_hash_tag(b"foo{bar"), b"foo{bar");
        assert_eq!(extract_hash_tag(b"foo}bar"), b"foo}bar");
    }

    #[test]
    fn distribution_over_slots() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            seen.insert(key_slot(format!("key{}", i).as_bytes()));
        }
        assert!(seen.len() >= 50, "keys should spread across slots");
    }

    #[test]
    fn rebuild_and_lookup() {
        let map = SlotMap::new();
        assert!(map.is_empty());

        map.rebuild(&[
            (0, 5460, vec!["a:7000".into(), "a:7001".into()]),
            (5461, 16383, vec!["b:7000".into()]),
        ]);

        assert_eq!(map.primary(0).as_deref(), Some("a:7000"));
        assert_eq!(map.lookup(100), vec!["a:7000", "a:7001"]);
        assert_eq!(map.primary(5461).as_deref(), Some("b:7000"));
        assert_eq!(map.primary(16383).as_deref(), Some("b:7000"));
    }

    #[test]
    fn rebuild_clears_uncovered_slots() {
        let map = SlotMap::new();
        map.rebuild(&[(0, 16383, vec!["a:7000".into()])]);
        map.rebuild(&[(0, 100, vec!["b:7000".into()])]);
        assert_eq!(map.primary(0).as_deref(), Some("b:7000"));
        assert!(map.lookup(101).is_empty());
    }

    #[test]
    fn set_primary_inserts_or_replaces() {
        let map = SlotMap::new();
        map.set_primary(12182, "b:7001");
        assert_eq!(map.lookup(12182), vec!["b:7001"]);

        map.rebuild(&[(0, 16383, vec!["a:7000".into(), "r:7002".into()])]);
        map.set_primary(12182, "b:7001");
        // Replicas survive a primary update.
        assert_eq!(map.lookup(12182), vec!["b:7001", "r:7002"]);

        // Same endpoint twice is one mutation worth of state.
        map.set_primary(12182, "b:7001");
        assert_eq!(map.lookup(12182), vec!["b:7001", "r:7002"]);
    }
}
