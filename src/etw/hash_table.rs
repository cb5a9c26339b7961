// Fixed-size open-addressing tables keyed by a 64-bit content hash
use std::sync::atomic::{AtomicU64, Ordering};

pub const EMPTY_SLOT: u64 = 0;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}

/// Zero marks an empty slot, so a real hash of zero is folded onto one.
pub fn slot_key(hash: u64) -> u64 {
    if hash == EMPTY_SLOT {
        1
    } else {
        hash
    }
}

struct Slot<V> {
    key: AtomicU64,
    value: V,
}

/// Lock-free table where the first `capacity` distinct keys win a slot and
/// later keys are dropped. Slots are claimed with a compare-exchange on the
/// key and are never freed.
pub struct HashSlotTable<V> {
    slots: Box<[Slot<V>]>,
}

impl<V: Default> HashSlotTable<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1))
                .map(|_| Slot {
                    key: AtomicU64::new(EMPTY_SLOT),
                    value: V::default(),
                })
                .collect(),
        }
    }
}

impl<V> HashSlotTable<V> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot for `hash`, claiming one if needed. `None` once full.
    pub fn get_or_insert(&self, hash: u64) -> Option<&V> {
        let key = slot_key(hash);
        let len = self.slots.len();
        let start = (key % len as u64) as usize;

        for probe in 0..len {
            let slot = &self.slots[(start + probe) % len];
            let current = slot.key.load(Ordering::Acquire);
            if current == key {
                return Some(&slot.value);
            }
            if current != EMPTY_SLOT {
                continue;
            }
            match slot
                .key
                .compare_exchange(EMPTY_SLOT, key, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(&slot.value),
                Err(actual) if actual == key => return Some(&slot.value),
                Err(_) => continue,
            }
        }
        None
    }

    pub fn get(&self, hash: u64) -> Option<&V> {
        let key = slot_key(hash);
        let len = self.slots.len();
        let start = (key % len as u64) as usize;

        for probe in 0..len {
            let slot = &self.slots[(start + probe) % len];
            match slot.key.load(Ordering::Acquire) {
                k if k == key => return Some(&slot.value),
                EMPTY_SLOT => return None,
                _ => {}
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.key.load(Ordering::Acquire) != EMPTY_SLOT)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.slots.iter().filter_map(|s| {
            let key = s.key.load(Ordering::Acquire);
            (key != EMPTY_SLOT).then_some((key, &s.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn colliding_buckets_probe_linearly_with_wraparound() {
        let table: HashSlotTable<AtomicU64> = HashSlotTable::new(4);
        // 3, 7 and 11 all start at slot 3; later ones wrap to 0 and 1.
        for key in [3u64, 7, 11] {
            table.get_or_insert(key).unwrap().store(key * 10, Ordering::Relaxed);
        }
        for key in [3u64, 7, 11] {
            assert_eq!(table.get(key).unwrap().load(Ordering::Relaxed), key * 10);
        }
        assert!(table.get(15).is_none());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn full_table_drops_new_keys() {
        let table: HashSlotTable<AtomicU64> = HashSlotTable::new(2);
        assert!(table.get_or_insert(1).is_some());
        assert!(table.get_or_insert(2).is_some());
        assert!(table.get_or_insert(3).is_none());
        assert!(table.get(3).is_none());
        assert!(table.get_or_insert(2).is_some());
    }

    #[test]
    fn zero_hash_is_folded() {
        let table: HashSlotTable<AtomicU64> = HashSlotTable::new(8);
        table.get_or_insert(0).unwrap().store(5, Ordering::Relaxed);
        assert_eq!(table.get(0).unwrap().load(Ordering::Relaxed), 5);
        assert_eq!(table.iter().next().map(|(k, _)| k), Some(1));
    }
}
