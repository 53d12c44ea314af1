//! Cuckoo hash table used by the Receiver to place query items.
//!
//! The Sender never builds a table: it stores every item at all of its
//! candidate locations ([`all_locations`]), so whichever location the
//! Receiver's table settles on is covered.

use crate::error::{Error, Result};
use crate::filter::indexed_hash;
use crate::item::Item;

/// An item placed in the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CuckooEntry {
    pub item: Item,
    /// Position of the item in the caller's input list.
    pub input_index: usize,
    /// Hash function that chose the current slot.
    pub hash_index: usize,
}

/// Table location of `item` under hash function `hash_index`.
pub fn location(item: &Item, hash_index: usize, table_size: usize) -> usize {
    (indexed_hash(hash_index, item.as_bytes()) % table_size as u64) as usize
}

/// Distinct locations of `item` over all `hash_func_count` hash functions.
pub fn all_locations(item: &Item, hash_func_count: usize, table_size: usize) -> Vec<usize> {
    let mut locations: Vec<usize> = (0..hash_func_count)
        .map(|h| location(item, h, table_size))
        .collect();
    locations.sort_unstable();
    locations.dedup();
    locations
}

/// Receiver-side cuckoo table: at most one item per location.
#[derive(Clone, Debug)]
pub struct CuckooTable {
    slots: Vec<Option<CuckooEntry>>,
    hash_func_count: usize,
    max_probes: usize,
}

impl CuckooTable {
    /// Creates an empty table.
    ///
    /// # Arguments
    ///
    /// * `table_size` - Number of locations
    /// * `hash_func_count` - Candidate locations per item (at least 1)
    /// * `max_probes` - Evictions tried before an insert gives up
    pub fn new(table_size: usize, hash_func_count: usize, max_probes: usize) -> Self {
        Self {
            slots: vec![None; table_size],
            hash_func_count: hash_func_count.max(1),
            max_probes,
        }
    }

    /// Number of locations.
    pub fn table_size(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied locations.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True if no location is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Places `item`, evicting occupants to their next hash function.
    ///
    /// Fails with `CuckooTableFull` when an item is still homeless after
    /// `max_probes` displacements; the table then holds every other item but
    /// not the one reported.
    pub fn insert(&mut self, item: Item, input_index: usize) -> Result<()> {
        if self.query(&item).is_some() {
            return Err(Error::DuplicateItem);
        }
        let table_size = self.slots.len();
        let mut entry = CuckooEntry {
            item,
            input_index,
            hash_index: 0,
        };
        for _ in 0..self.max_probes {
            let i = location(&entry.item, entry.hash_index, table_size);
            match self.slots[i].replace(entry) {
                None => return Ok(()),
                Some(evicted) => {
                    entry = evicted;
                    entry.hash_index = (entry.hash_index + 1) % self.hash_func_count;
                }
            }
        }
        Err(Error::CuckooTableFull {
            item_index: entry.input_index,
            max_probes: self.max_probes,
        })
    }

    /// Location currently holding `item`.
    pub fn query(&self, item: &Item) -> Option<usize> {
        all_locations(item, self.hash_func_count, self.slots.len())
            .into_iter()
            .find(|&loc| matches!(&self.slots[loc], Some(e) if e.item == *item))
    }

    /// Entry at `location`, if occupied.
    pub fn get(&self, location: usize) -> Option<&CuckooEntry> {
        self.slots.get(location).and_then(Option::as_ref)
    }

    /// Occupied slots as `(location, entry)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &CuckooEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(loc, slot)| slot.as_ref().map(|e| (loc, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_query() {
        let mut table = CuckooTable::new(64, 3, 200);
        let items: Vec<Item> = (0..32u128).map(Item::from).collect();
        for (i, item) in items.iter().enumerate() {
            table.insert(*item, i).unwrap();
        }
        assert_eq!(table.len(), 32);
        for (i, item) in items.iter().enumerate() {
            let loc = table.query(item).unwrap();
            let entry = table.get(loc).unwrap();
            assert_eq!(entry.input_index, i);
            assert_eq!(location(item, entry.hash_index, 64), loc);
            assert!(all_locations(item, 3, 64).contains(&loc));
        }
        assert_eq!(table.query(&Item::from(1000u128)), None);
    }

    #[test]
    fn test_overflow_reports_table_full() {
        let mut table = CuckooTable::new(4, 2, 50);
        let result = (0..5u128).try_for_each(|i| table.insert(Item::from(i), i as usize));
        assert!(matches!(result, Err(Error::CuckooTableFull { max_probes: 50, .. })));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = CuckooTable::new(8, 3, 10);
        table.insert(Item::from(7u128), 0).unwrap();
        assert!(matches!(table.insert(Item::from(7u128), 1), Err(Error::DuplicateItem)));
    }

    #[test]
    fn test_locations_deduplicated() {
        let item = Item::hash_bytes(b"x");
        let locs = all_locations(&item, 8, 2);
        assert!(!locs.is_empty() && locs.len() <= 2);
        assert!(locs.windows(2).all(|w| w[0] < w[1]));
    }
}
