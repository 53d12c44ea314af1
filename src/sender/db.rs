//! Sender database: every bin bundle of the hash table behind one
//! reader-writer lock.
//!
//! Each item is stored at all of its cuckoo locations. A location maps to a
//! bundle index and a run of `felts_per_item` bins; several bundles may
//! share an index when one bundle cannot take the item (a bin is full or
//! already holds one of the item's felts).
//!
//! Writers regenerate every touched cache before releasing the lock, so a
//! reader never observes a stale or half-built cache.
//!
//! Every mutation has a `*_locked` form that runs on a write guard the
//! caller already holds. The parallel per-bundle work runs on whatever rayon
//! pool the caller is in, so [`super::Sender`] takes the guard on its own
//! thread and only then enters its pool: a pool thread never blocks on the
//! lock.

use std::collections::HashSet;
use std::io::{Read, Write};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::FieldCodec;
use crate::cuckoo::all_locations;
use crate::error::{Error, Result};
use crate::he::HeContext;
use crate::item::{Felt, Item, Label};
use crate::oprf::OprfKey;
use crate::params::PsiParams;

use super::bin_bundle::{BinBundle, BundleShape, FeltPair};

/// An item reduced to what the bins store.
struct PreparedItem {
    item: Item,
    /// One pair per bin the item spans.
    pairs: Vec<FeltPair>,
}

impl PreparedItem {
    fn felts(&self) -> Vec<Felt> {
        self.pairs.iter().map(|(f, _)| *f).collect()
    }
}

#[derive(Default, Serialize, Deserialize)]
pub(crate) struct DbState {
    /// `[bundle_idx][instance]`.
    pub(crate) bundles: Vec<Vec<BinBundle>>,
    items: HashSet<Item>,
    item_count: usize,
    pub(crate) stripped: bool,
}

#[derive(Serialize, Deserialize)]
struct DbHeader {
    params: PsiParams,
    label_byte_count: usize,
    compressed: bool,
    oprf_key: Option<OprfKey>,
}

/// The Sender's items and labels, laid out in bin bundles.
pub struct SenderDb {
    params: PsiParams,
    he: HeContext,
    codec: FieldCodec,
    label_byte_count: usize,
    compressed: bool,
    oprf_key: Option<OprfKey>,
    state: RwLock<DbState>,
}

impl SenderDb {
    /// Creates an empty database.
    ///
    /// # Arguments
    ///
    /// * `params` - Validated before anything is built
    /// * `label_byte_count` - Label length in bytes; 0 for an unlabeled database
    /// * `compressed` - Keep bundle caches in coefficient form (smaller, slower queries)
    /// * `oprf_key` - If set, items are stored as their OPRF outputs
    pub fn new(
        params: PsiParams,
        label_byte_count: usize,
        compressed: bool,
        oprf_key: Option<OprfKey>,
    ) -> Result<Self> {
        params.validate()?;
        let he = HeContext::new(&params.he)?;
        let codec = FieldCodec::new(&params);
        let state = DbState {
            bundles: vec![Vec::new(); params.bundle_idx_count()],
            ..DbState::default()
        };
        info!(
            table_size = params.table.table_size,
            bundle_idx_count = params.bundle_idx_count(),
            label_byte_count,
            compressed,
            oprf = oprf_key.is_some(),
            "created sender database"
        );
        Ok(Self {
            params,
            he,
            codec,
            label_byte_count,
            compressed,
            oprf_key,
            state: RwLock::new(state),
        })
    }

    /// Parameters the database was built with.
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    /// Encryption context for `params`.
    pub fn he(&self) -> &HeContext {
        &self.he
    }

    /// Field codec for `params`.
    pub fn codec(&self) -> &FieldCodec {
        &self.codec
    }

    /// Label length in bytes; 0 for an unlabeled database.
    pub fn label_byte_count(&self) -> usize {
        self.label_byte_count
    }

    /// Label parts per item.
    pub fn label_size(&self) -> usize {
        self.params.label_size(self.label_byte_count)
    }

    /// True if items carry labels.
    pub fn is_labeled(&self) -> bool {
        self.label_byte_count > 0
    }

    /// True if caches are kept in coefficient form.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Key under which items are stored, if any.
    pub fn oprf_key(&self) -> Option<&OprfKey> {
        self.oprf_key.as_ref()
    }

    /// Number of stored items. Still reported after stripping.
    pub fn item_count(&self) -> usize {
        self.state.read().item_count
    }

    /// Total number of bundles over all bundle indices.
    pub fn bin_bundle_count(&self) -> usize {
        self.state.read().bundles.iter().map(Vec::len).sum()
    }

    /// True after [`SenderDb::strip`].
    pub fn is_stripped(&self) -> bool {
        self.state.read().stripped
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read()
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, DbState> {
        self.state.write()
    }

    fn shape(&self) -> BundleShape {
        BundleShape {
            num_bins: self.params.bins_per_bundle(),
            max_bin_size: self.params.max_bin_size(),
            label_size: self.label_size(),
            ps_low_degree: self.params.query.ps_low_degree as usize,
            compressed: self.compressed,
        }
    }

    fn hash_item(&self, item: &Item) -> Item {
        match &self.oprf_key {
            Some(key) => key.evaluate_item(item),
            None => *item,
        }
    }

    fn prepare(&self, item: &Item, label: &[u8]) -> Result<PreparedItem> {
        let item = self.hash_item(item);
        let felts = self.codec.encode_item(&item)?;
        let labels = self
            .codec
            .encode_label(label, self.label_byte_count, self.label_size())?;
        Ok(PreparedItem {
            item,
            pairs: felts.into_iter().zip(labels).collect(),
        })
    }

    /// `(bundle_idx, start_bin)` for every cuckoo location of `item`.
    fn locations(&self, item: &Item) -> Vec<(usize, usize)> {
        all_locations(
            item,
            self.params.table.hash_func_count as usize,
            self.params.table.table_size as usize,
        )
        .into_iter()
        .map(|loc| self.params.bundle_location(loc))
        .collect()
    }

    /// Groups per-location work by bundle index.
    fn group_by_bundle<'a>(
        &self,
        items: &'a [PreparedItem],
    ) -> Vec<Vec<(usize, &'a PreparedItem)>> {
        let mut work = vec![Vec::new(); self.params.bundle_idx_count()];
        for prepared in items {
            for (bundle_idx, start_bin) in self.locations(&prepared.item) {
                work[bundle_idx].push((start_bin, prepared));
            }
        }
        work
    }

    /// Inserts new items. Fails with `DuplicateItem` before touching
    /// anything if an item is already stored or repeated in `data`.
    ///
    /// # Arguments
    ///
    /// * `data` - `(item, label)` pairs; labels may be shorter than
    ///   `label_byte_count` and are zero-padded
    ///
    /// # Errors
    ///
    /// `Stripped` after [`SenderDb::strip`], `EncodingOverflow` for a label
    /// longer than `label_byte_count`.
    pub fn insert(&self, data: &[(Item, Label)]) -> Result<()> {
        self.insert_locked(&mut self.state.write(), data)
    }

    pub(crate) fn insert_locked(&self, state: &mut DbState, data: &[(Item, Label)]) -> Result<()> {
        if state.stripped {
            return Err(Error::Stripped);
        }
        let prepared = data
            .par_iter()
            .map(|(item, label)| self.prepare(item, label))
            .collect::<Result<Vec<_>>>()?;

        let mut seen = HashSet::with_capacity(prepared.len());
        for p in &prepared {
            if state.items.contains(&p.item) || !seen.insert(p.item) {
                return Err(Error::DuplicateItem);
            }
        }

        self.insert_prepared(state, &prepared)?;
        info!(
            inserted = prepared.len(),
            total = state.item_count,
            "inserted items"
        );
        Ok(())
    }

    /// Unlabeled convenience wrapper around [`SenderDb::insert`].
    pub fn insert_items(&self, items: &[Item]) -> Result<()> {
        let data: Vec<(Item, Label)> = items.iter().map(|i| (*i, Vec::new())).collect();
        self.insert(&data)
    }

    fn insert_prepared(&self, state: &mut DbState, prepared: &[PreparedItem]) -> Result<()> {
        let shape = self.shape();
        let fpr = self.params.table.bloom_false_positive_rate;
        let work = self.group_by_bundle(prepared);

        state
            .bundles
            .par_iter_mut()
            .zip(work.par_iter())
            .try_for_each(|(bundles, work)| {
                for (start_bin, item) in work {
                    insert_into(bundles, &item.pairs, *start_bin, shape, fpr)?;
                }
                bundles.iter_mut().try_for_each(|b| b.regen_cache(&self.he))
            })?;

        for p in prepared {
            state.items.insert(p.item);
        }
        state.item_count = state.items.len();
        Ok(())
    }

    /// Inserts new items and replaces the labels of stored ones.
    pub fn insert_or_assign(&self, data: &[(Item, Label)]) -> Result<()> {
        self.insert_or_assign_locked(&mut self.state.write(), data)
    }

    pub(crate) fn insert_or_assign_locked(
        &self,
        state: &mut DbState,
        data: &[(Item, Label)],
    ) -> Result<()> {
        if state.stripped {
            return Err(Error::Stripped);
        }
        let prepared = data
            .par_iter()
            .map(|(item, label)| self.prepare(item, label))
            .collect::<Result<Vec<_>>>()?;
        let (existing, fresh): (Vec<PreparedItem>, Vec<PreparedItem>) = prepared
            .into_iter()
            .partition(|p| state.items.contains(&p.item));

        let mut seen = HashSet::with_capacity(fresh.len());
        if fresh.iter().any(|p| !seen.insert(p.item)) {
            return Err(Error::DuplicateItem);
        }

        let work = self.group_by_bundle(&existing);
        state
            .bundles
            .par_iter_mut()
            .zip(work.par_iter())
            .enumerate()
            .try_for_each(|(bundle_idx, (bundles, work))| {
                for (start_bin, item) in work {
                    let found = bundles
                        .iter_mut()
                        .any(|b| b.try_multi_overwrite(&item.pairs, *start_bin));
                    if !found {
                        return Err(Error::InvalidState(format!(
                            "stored item missing from bundle index {bundle_idx}"
                        )));
                    }
                }
                bundles.iter_mut().try_for_each(|b| b.regen_cache(&self.he))
            })?;

        self.insert_prepared(state, &fresh)?;
        info!(
            overwritten = existing.len(),
            inserted = fresh.len(),
            "insert_or_assign complete"
        );
        Ok(())
    }

    /// Removes `items`, returning how many were present. Absent items are
    /// ignored.
    pub fn remove(&self, items: &[Item]) -> Result<usize> {
        self.remove_locked(&mut self.state.write(), items)
    }

    pub(crate) fn remove_locked(&self, state: &mut DbState, items: &[Item]) -> Result<usize> {
        if state.stripped {
            return Err(Error::Stripped);
        }
        let mut seen = HashSet::new();
        let mut prepared = Vec::new();
        for hashed in items.iter().map(|item| self.hash_item(item)) {
            if !state.items.contains(&hashed) || !seen.insert(hashed) {
                continue;
            }
            let felts = self.codec.encode_item(&hashed)?;
            prepared.push(PreparedItem {
                item: hashed,
                pairs: felts.into_iter().map(|f| (f, Vec::new())).collect(),
            });
        }

        let work = self.group_by_bundle(&prepared);
        state
            .bundles
            .par_iter_mut()
            .zip(work.par_iter())
            .enumerate()
            .try_for_each(|(bundle_idx, (bundles, work))| {
                for (start_bin, item) in work {
                    let felts = item.felts();
                    if !bundles.iter_mut().any(|b| b.try_multi_remove(&felts, *start_bin)) {
                        return Err(Error::InvalidState(format!(
                            "stored item missing from bundle index {bundle_idx}"
                        )));
                    }
                }
                let before = bundles.len();
                bundles.retain(|b| !b.is_empty());
                if bundles.len() != before {
                    debug!(bundle_idx, dropped = before - bundles.len(), "dropped empty bundles");
                }
                bundles.iter_mut().try_for_each(|b| b.regen_cache(&self.he))
            })?;

        for p in &prepared {
            state.items.remove(&p.item);
        }
        state.item_count = state.items.len();
        info!(removed = prepared.len(), total = state.item_count, "removed items");
        Ok(prepared.len())
    }

    /// True if `item` is stored. Items are looked up by their OPRF output
    /// when the database has a key.
    ///
    /// # Errors
    ///
    /// `Stripped` once raw items have been dropped.
    pub fn has_item(&self, item: &Item) -> Result<bool> {
        let state = self.state.read();
        if state.stripped {
            return Err(Error::Stripped);
        }
        Ok(state.items.contains(&self.hash_item(item)))
    }

    /// Label stored with `item`, zero-padded to `label_byte_count`.
    ///
    /// Unlabeled databases return an empty label for stored items.
    pub fn get_label(&self, item: &Item) -> Result<Option<Label>> {
        let state = self.state.read();
        if state.stripped {
            return Err(Error::Stripped);
        }
        let hashed = self.hash_item(item);
        if !state.items.contains(&hashed) {
            return Ok(None);
        }
        let felts = self.codec.encode_item(&hashed)?;
        for (bundle_idx, start_bin) in self.locations(&hashed) {
            let found = state.bundles[bundle_idx]
                .iter()
                .find_map(|b| b.try_get_multi_label(&felts, start_bin));
            if let Some(per_bin) = found {
                return self
                    .codec
                    .decode_label(&per_bin, self.label_byte_count)
                    .map(Some);
            }
        }
        Err(Error::InvalidState("stored item missing from its bundles".into()))
    }

    /// Drops raw bin contents, keeping only what queries need. Irreversible:
    /// afterwards the database only serves queries.
    pub fn strip(&self) -> Result<()> {
        self.strip_locked(&mut self.state.write())
    }

    pub(crate) fn strip_locked(&self, state: &mut DbState) -> Result<()> {
        state
            .bundles
            .par_iter_mut()
            .flatten()
            .try_for_each(|b| b.strip(&self.he))?;
        state.items.clear();
        state.stripped = true;
        info!(bundles = state.bundles.iter().map(Vec::len).sum::<usize>(), "stripped database");
        Ok(())
    }

    /// Writes the database with bincode.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        let header = DbHeader {
            params: self.params.clone(),
            label_byte_count: self.label_byte_count,
            compressed: self.compressed,
            oprf_key: self.oprf_key.clone(),
        };
        bincode::serialize_into(&mut writer, &header)?;
        bincode::serialize_into(&mut writer, &*self.state.read())?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a database written by [`SenderDb::save`].
    pub fn load<R: Read>(mut reader: R) -> Result<Self> {
        let header: DbHeader = bincode::deserialize_from(&mut reader)?;
        let state: DbState = bincode::deserialize_from(&mut reader)?;
        let db = Self::new(
            header.params,
            header.label_byte_count,
            header.compressed,
            header.oprf_key,
        )?;
        if state.bundles.len() != db.params.bundle_idx_count() {
            return Err(Error::MalformedMessage(format!(
                "saved database has {} bundle indices, parameters give {}",
                state.bundles.len(),
                db.params.bundle_idx_count()
            )));
        }
        let shape = db.shape();
        if state.bundles.iter().flatten().any(|b| *b.shape() != shape) {
            return Err(Error::MalformedMessage("bundle shape mismatch".into()));
        }
        *db.state.write() = state;
        info!(items = db.item_count(), bundles = db.bin_bundle_count(), "loaded sender database");
        Ok(db)
    }
}

/// Puts `pairs` into the bundle at this index that ends up with the
/// smallest bins, or into a new bundle if none accepts them.
fn insert_into(
    bundles: &mut Vec<BinBundle>,
    pairs: &[FeltPair],
    start_bin: usize,
    shape: BundleShape,
    fpr: f64,
) -> Result<()> {
    let best = bundles
        .iter_mut()
        .enumerate()
        .filter_map(|(i, b)| b.multi_insert(pairs, start_bin, true).ok().map(|size| (size, i)))
        .min();
    match best {
        Some((_, i)) => {
            bundles[i].multi_insert(pairs, start_bin, false)?;
        }
        None => {
            let mut bundle = BinBundle::new(shape, fpr);
            bundle.multi_insert(pairs, start_bin, false)?;
            bundles.push(bundle);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn labeled_db(label_byte_count: usize) -> SenderDb {
        SenderDb::new(PsiParams::small_test(), label_byte_count, false, None).unwrap()
    }

    fn item(i: u128) -> Item {
        Item::hash_bytes(i.to_le_bytes())
    }

    #[test]
    fn test_insert_and_lookup() {
        let db = labeled_db(4);
        let data: Vec<(Item, Label)> = (0..5u128).map(|i| (item(i), vec![i as u8; 3])).collect();
        db.insert(&data).unwrap();

        assert_eq!(db.item_count(), 5);
        assert!(db.bin_bundle_count() >= 1);
        for (it, label) in &data {
            assert!(db.has_item(it).unwrap());
            let mut expected = label.clone();
            expected.push(0);
            assert_eq!(db.get_label(it).unwrap(), Some(expected));
        }
        assert!(!db.has_item(&item(99)).unwrap());
        assert_eq!(db.get_label(&item(99)).unwrap(), None);
    }

    #[test]
    fn test_duplicate_item_rejected() {
        let db = labeled_db(0);
        db.insert_items(&[item(1)]).unwrap();
        assert!(matches!(db.insert_items(&[item(2), item(1)]), Err(Error::DuplicateItem)));
        assert!(matches!(db.insert_items(&[item(3), item(3)]), Err(Error::DuplicateItem)));
        assert_eq!(db.item_count(), 1);
        assert!(!db.has_item(&item(2)).unwrap());
    }

    #[test]
    fn test_overflowing_slot_opens_new_bundle() {
        let db = labeled_db(0);
        // table size 8 with 3 hash functions: 20 items overflow bins of 4
        let items: Vec<Item> = (0..20u128).map(item).collect();
        db.insert_items(&items).unwrap();
        assert!(db.bin_bundle_count() > 1);
        let state = db.read_state();
        for bundle in state.bundles.iter().flatten() {
            assert!(bundle.max_load() <= 4);
            assert!(bundle.cache_is_valid());
        }
    }

    #[test]
    fn test_insert_or_assign_and_remove() {
        let db = labeled_db(2);
        db.insert(&[(item(1), b"ab".to_vec()), (item(2), b"cd".to_vec())]).unwrap();
        db.insert_or_assign(&[(item(1), b"zz".to_vec()), (item(3), b"ef".to_vec())])
            .unwrap();
        assert_eq!(db.item_count(), 3);
        assert_eq!(db.get_label(&item(1)).unwrap(), Some(b"zz".to_vec()));
        assert_eq!(db.get_label(&item(3)).unwrap(), Some(b"ef".to_vec()));

        assert_eq!(db.remove(&[item(1), item(7), item(1)]).unwrap(), 1);
        assert_eq!(db.item_count(), 2);
        assert!(!db.has_item(&item(1)).unwrap());
        assert_eq!(db.get_label(&item(2)).unwrap(), Some(b"cd".to_vec()));

        assert_eq!(db.remove(&[item(2), item(3)]).unwrap(), 2);
        assert_eq!(db.bin_bundle_count(), 0);
    }

    #[test]
    fn test_readers_see_whole_writes() {
        let db = labeled_db(1);
        db.insert(&[(item(1), b"a".to_vec())]).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        assert_eq!(db.get_label(&item(1)).unwrap(), Some(b"a".to_vec()));
                        let state = db.read_state();
                        assert!(state.bundles.iter().flatten().all(BinBundle::cache_is_valid));
                        assert_eq!(state.item_count, state.items.len());
                    }
                });
            }
            scope.spawn(|| {
                for i in 2..10u128 {
                    db.insert(&[(item(i), vec![i as u8])]).unwrap();
                }
                db.remove(&[item(2), item(3)]).unwrap();
            });
        });
        assert_eq!(db.item_count(), 7);
        assert_eq!(db.get_label(&item(9)).unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_label_too_long() {
        let db = labeled_db(2);
        assert!(matches!(
            db.insert(&[(item(1), b"abc".to_vec())]),
            Err(Error::EncodingOverflow { .. })
        ));
        assert_eq!(db.item_count(), 0);
    }

    #[test]
    fn test_oprf_key_hides_items() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let key = OprfKey::random(&mut rng);
        let db = SenderDb::new(PsiParams::small_test(), 0, false, Some(key.clone())).unwrap();
        db.insert_items(&[item(1)]).unwrap();
        assert!(db.has_item(&item(1)).unwrap());
        let state = db.read_state();
        assert!(state.items.contains(&key.evaluate_item(&item(1))));
        assert!(!state.items.contains(&item(1)));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let db = labeled_db(3);
        db.insert(&[(item(1), b"one".to_vec()), (item(2), b"two".to_vec())])
            .unwrap();
        let mut bytes = Vec::new();
        db.save(&mut bytes).unwrap();

        let loaded = SenderDb::load(bytes.as_slice()).unwrap();
        assert_eq!(loaded.params(), db.params());
        assert_eq!(loaded.item_count(), 2);
        assert_eq!(loaded.bin_bundle_count(), db.bin_bundle_count());
        assert_eq!(loaded.get_label(&item(2)).unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_strip() {
        let db = labeled_db(0);
        db.insert_items(&[item(1), item(2)]).unwrap();
        db.strip().unwrap();
        assert!(db.is_stripped());
        assert_eq!(db.item_count(), 2);
        assert!(matches!(db.has_item(&item(1)), Err(Error::Stripped)));
        assert!(matches!(db.insert_items(&[item(3)]), Err(Error::Stripped)));
        let state = db.read_state();
        assert!(state.bundles.iter().flatten().all(|b| b.is_stripped() && b.cache_is_valid()));
    }
}
