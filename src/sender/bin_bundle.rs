//! Bin bundles: item storage plus the matching and interpolation polynomial
//! cache for one window of `bins_per_bundle` bins.
//!
//! # Cache layout
//!
//! Each bin `b` has a monic matching polynomial `M_b(x) = ∏ (x - a)` over
//! its items and, for labeled databases, one Newton interpolation polynomial
//! `I_{p,b}` per label part `p` with `I_{p,b}(a) = label_p(a)`. The
//! coefficients of degree `i` from every bin are batched into one plaintext
//! `P_i`, so slot `b` of `Σ P_i·y^i` evaluates bin `b`'s polynomial at slot
//! `b` of `y`.
//!
//! Slices that the evaluation multiplies by a ciphertext power are stored in
//! NTT form unless the bundle is compressed. Slices it adds as constants
//! stay in coefficient form: slice 0, and with a Paterson–Stockmeyer split of
//! low degree `L` every slice `j·(L + 1)`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::BatchPowers;
use crate::error::{BinInsertError, Error, Result};
use crate::filter::BloomFilter;
use crate::he::{Ciphertext, HeContext, NttPlaintext, Plaintext, RelinKeys};
use crate::item::Felt;
use crate::math::field_poly;

/// One felt and its label parts, destined for a single bin.
pub type FeltPair = (Felt, Vec<Felt>);

/// Shape of a bundle, fixed for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleShape {
    pub num_bins: usize,
    pub max_bin_size: usize,
    pub label_size: usize,
    /// `ps_low_degree` of the query parameters (0 when unused).
    pub ps_low_degree: usize,
    /// Keep every slice in coefficient form and transform per query.
    pub compressed: bool,
}

impl BundleShape {
    /// True if slice `i` is added as a constant rather than multiplied.
    fn is_constant_slice(&self, i: usize) -> bool {
        if self.ps_low_degree == 0 {
            i == 0
        } else {
            i % (self.ps_low_degree + 1) == 0
        }
    }
}

/// One batched coefficient slice, in the form the evaluation consumes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoeffSlice {
    Plain(Plaintext),
    Ntt(NttPlaintext),
}

impl CoeffSlice {
    fn to_ntt(&self, ctx: &HeContext) -> NttPlaintext {
        match self {
            CoeffSlice::Plain(pt) => ctx.plaintext_to_ntt(pt),
            CoeffSlice::Ntt(pt) => pt.clone(),
        }
    }

    fn as_plain(&self) -> Result<&Plaintext> {
        match self {
            CoeffSlice::Plain(pt) => Ok(pt),
            CoeffSlice::Ntt(_) => Err(Error::InvalidState(
                "constant slice was stored in NTT form".into(),
            )),
        }
    }
}

/// A polynomial per bin, batched by coefficient degree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchedPolyn {
    pub slices: Vec<CoeffSlice>,
}

impl BatchedPolyn {
    fn build(
        ctx: &HeContext,
        shape: &BundleShape,
        per_bin: &[&[Felt]],
    ) -> Result<Self> {
        let degree_count = per_bin.iter().map(|p| p.len()).max().unwrap_or(0).max(1);
        let slices = (0..degree_count)
            .map(|i| {
                let column: Vec<Felt> = per_bin
                    .iter()
                    .map(|p| p.get(i).copied().unwrap_or(0))
                    .collect();
                let pt = ctx.encode_slots(&column)?;
                Ok(if shape.compressed || shape.is_constant_slice(i) {
                    CoeffSlice::Plain(pt)
                } else {
                    CoeffSlice::Ntt(ctx.plaintext_to_ntt(&pt))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slices })
    }

    /// Polynomial degree: one less than the number of slices.
    pub fn degree(&self) -> usize {
        self.slices.len().saturating_sub(1)
    }

    /// `Σ P_i·y^i` over the encrypted powers of `y`.
    fn evaluate(
        &self,
        ctx: &HeContext,
        powers: &BatchPowers<Ciphertext>,
        ps_low_degree: usize,
        rk: &RelinKeys,
    ) -> Result<Ciphertext> {
        let level = powers
            .coeff
            .values()
            .next()
            .map(Ciphertext::level)
            .ok_or_else(|| Error::InvalidState("no powers to evaluate with".into()))?;
        let ntt_power = |i: usize| {
            powers
                .ntt
                .get(&(i as u32))
                .ok_or_else(|| Error::InvalidState(format!("power {i} missing in NTT form")))
        };

        // inner block: Σ_{r=1..width} P_{offset+r}·y^r, then + P_offset
        let block = |offset: usize, width: usize| -> Result<Ciphertext> {
            let mut acc = ctx.zero_ciphertext(level, true);
            for r in 1..=width {
                let Some(slice) = self.slices.get(offset + r) else {
                    break;
                };
                ctx.multiply_plain_acc(&mut acc, ntt_power(r)?, &slice.to_ntt(ctx))?;
            }
            ctx.transform_from_ntt(&mut acc);
            ctx.add_plain_assign(&mut acc, self.slices[offset].as_plain()?)?;
            Ok(acc)
        };

        let degree = self.degree();
        if ps_low_degree == 0 {
            return block(0, degree);
        }

        let stride = ps_low_degree + 1;
        let mut result = block(0, ps_low_degree)?;
        let mut high: Option<Ciphertext> = None;
        for j in 1..=degree / stride {
            let inner = block(j * stride, ps_low_degree)?;
            let power = powers
                .coeff
                .get(&((j * stride) as u32))
                .ok_or_else(|| Error::InvalidState(format!("power {} missing", j * stride)))?;
            let product = ctx.multiply(&inner, power)?;
            match high.as_mut() {
                Some(acc) => ctx.add_assign(acc, &product)?,
                None => high = Some(product),
            }
        }
        if let Some(high) = high {
            ctx.add_assign(&mut result, &ctx.relinearize(&high, rk)?)?;
        }
        Ok(result)
    }
}

/// Polynomials derived from the bins, and their batched slices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleCache {
    /// Per bin, little-endian coefficients.
    pub matching_polyns: Vec<Vec<Felt>>,
    /// `[label_part][bin]`.
    pub interp_polyns: Vec<Vec<Vec<Felt>>>,
    pub batched_matching_polyn: BatchedPolyn,
    pub batched_interp_polyns: Vec<BatchedPolyn>,
}

/// Encrypted evaluation of one bundle against one query batch.
#[derive(Clone, Debug)]
pub struct BundleResult {
    pub matching: Ciphertext,
    pub labels: Vec<Ciphertext>,
}

/// Bins for one window of table locations, with their polynomial cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinBundle {
    shape: BundleShape,
    /// `[bin][position]`.
    item_bins: Vec<Vec<Felt>>,
    /// `[label_part][bin][position]`, parallel to `item_bins`.
    label_bins: Vec<Vec<Vec<Felt>>>,
    filters: Vec<BloomFilter>,
    cache: BundleCache,
    cache_invalid: bool,
    stripped: bool,
}

impl BinBundle {
    /// Creates a bundle with empty bins and an invalid cache.
    ///
    /// # Arguments
    ///
    /// * `shape` - Bin count, capacity, label parts and slice layout
    /// * `bloom_false_positive_rate` - Target rate of each bin's filter
    pub fn new(shape: BundleShape, bloom_false_positive_rate: f64) -> Self {
        let filter =
            BloomFilter::with_false_positive_prob(bloom_false_positive_rate, shape.max_bin_size);
        Self {
            shape,
            item_bins: vec![Vec::new(); shape.num_bins],
            label_bins: vec![vec![Vec::new(); shape.num_bins]; shape.label_size],
            filters: vec![filter; shape.num_bins],
            cache: BundleCache::default(),
            cache_invalid: true,
            stripped: false,
        }
    }

    /// Shape fixed at creation.
    pub fn shape(&self) -> &BundleShape {
        &self.shape
    }

    /// True once raw bin contents were dropped.
    pub fn is_stripped(&self) -> bool {
        self.stripped
    }

    /// True if the cache reflects the current bins.
    pub fn cache_is_valid(&self) -> bool {
        !self.cache_invalid
    }

    /// The cache, unless a mutation made it stale.
    pub fn cache(&self) -> Option<&BundleCache> {
        (!self.cache_invalid).then_some(&self.cache)
    }

    /// Stored felts of bin `bin`. Empty after stripping.
    pub fn bin(&self, bin: usize) -> &[Felt] {
        self.item_bins.get(bin).map_or(&[][..], Vec::as_slice)
    }

    /// True if no bin holds a felt.
    pub fn is_empty(&self) -> bool {
        self.item_bins.iter().all(Vec::is_empty)
    }

    /// Largest bin load.
    pub fn max_load(&self) -> usize {
        self.item_bins.iter().map(Vec::len).max().unwrap_or(0)
    }

    fn position(&self, bin: usize, felt: Felt) -> Option<usize> {
        if !self.filters[bin].contains(felt) {
            return None;
        }
        self.item_bins[bin].iter().position(|&f| f == felt)
    }

    fn check_range(&self, start: usize, len: usize) -> std::result::Result<(), BinInsertError> {
        if self.stripped {
            return Err(BinInsertError::Stripped);
        }
        let end = start + len;
        if end > self.shape.num_bins {
            return Err(BinInsertError::OutOfRange {
                start,
                end,
                width: self.shape.num_bins,
            });
        }
        Ok(())
    }

    fn check_labels(&self, pairs: &[FeltPair]) -> std::result::Result<(), BinInsertError> {
        match pairs.iter().find(|(_, label)| label.len() != self.shape.label_size) {
            Some((_, label)) => Err(BinInsertError::LabelSizeMismatch {
                expected: self.shape.label_size,
                got: label.len(),
            }),
            None => Ok(()),
        }
    }

    /// Inserts `pairs[k]` into bin `start_bin + k` for every `k`.
    ///
    /// Nothing is modified unless every target bin accepts its felt. With
    /// `dry_run` nothing is modified at all.
    ///
    /// # Returns
    ///
    /// The largest bin size among the targeted bins after the insert.
    pub fn multi_insert(
        &mut self,
        pairs: &[FeltPair],
        start_bin: usize,
        dry_run: bool,
    ) -> std::result::Result<usize, BinInsertError> {
        self.check_range(start_bin, pairs.len())?;
        self.check_labels(pairs)?;

        let mut max_size = 0;
        for (k, (felt, _)) in pairs.iter().enumerate() {
            let bin = start_bin + k;
            if self.position(bin, *felt).is_some() {
                return Err(BinInsertError::DuplicateFelt { bin });
            }
            let size = self.item_bins[bin].len();
            if size >= self.shape.max_bin_size {
                return Err(BinInsertError::BinFull {
                    bin,
                    max: self.shape.max_bin_size,
                });
            }
            max_size = max_size.max(size + 1);
        }
        if dry_run {
            return Ok(max_size);
        }

        for (k, (felt, label)) in pairs.iter().enumerate() {
            let bin = start_bin + k;
            self.item_bins[bin].push(*felt);
            self.filters[bin].insert(*felt);
            for (part, &value) in label.iter().enumerate() {
                self.label_bins[part][bin].push(value);
            }
        }
        self.cache_invalid = true;
        Ok(max_size)
    }

    /// Replaces the labels of felts already present in every target bin.
    pub fn try_multi_overwrite(&mut self, pairs: &[FeltPair], start_bin: usize) -> bool {
        if self.check_range(start_bin, pairs.len()).is_err() || self.check_labels(pairs).is_err() {
            return false;
        }
        let Some(positions) = self.find_all(pairs.iter().map(|(f, _)| *f), start_bin) else {
            return false;
        };
        for (k, ((_, label), pos)) in pairs.iter().zip(positions).enumerate() {
            for (part, &value) in label.iter().enumerate() {
                self.label_bins[part][start_bin + k][pos] = value;
            }
        }
        self.cache_invalid = true;
        true
    }

    /// Removes `felts[k]` from bin `start_bin + k`, only if all are present.
    pub fn try_multi_remove(&mut self, felts: &[Felt], start_bin: usize) -> bool {
        if self.check_range(start_bin, felts.len()).is_err() {
            return false;
        }
        let Some(positions) = self.find_all(felts.iter().copied(), start_bin) else {
            return false;
        };
        for (k, pos) in positions.into_iter().enumerate() {
            let bin = start_bin + k;
            self.item_bins[bin].remove(pos);
            for part in self.label_bins.iter_mut() {
                part[bin].remove(pos);
            }
            self.filters[bin].rebuild(&self.item_bins[bin]);
        }
        self.cache_invalid = true;
        true
    }

    /// Label parts stored with `felts[k]` in bin `start_bin + k`, as
    /// `result[k][part]`. `None` unless every felt is present.
    pub fn try_get_multi_label(&self, felts: &[Felt], start_bin: usize) -> Option<Vec<Vec<Felt>>> {
        if self.stripped || start_bin + felts.len() > self.shape.num_bins {
            return None;
        }
        let positions = self.find_all(felts.iter().copied(), start_bin)?;
        Some(
            positions
                .into_iter()
                .enumerate()
                .map(|(k, pos)| {
                    self.label_bins
                        .iter()
                        .map(|part| part[start_bin + k][pos])
                        .collect()
                })
                .collect(),
        )
    }

    fn find_all(&self, felts: impl Iterator<Item = Felt>, start_bin: usize) -> Option<Vec<usize>> {
        felts
            .enumerate()
            .map(|(k, felt)| self.position(start_bin + k, felt))
            .collect()
    }

    /// Recomputes the polynomial cache if it is stale.
    ///
    /// Bins are processed in parallel. The new cache replaces the old one
    /// only once it is complete.
    pub fn regen_cache(&mut self, ctx: &HeContext) -> Result<()> {
        if !self.cache_invalid {
            return Ok(());
        }
        if self.stripped {
            return Err(Error::Stripped);
        }
        let t = ctx.plain_modulus();

        let per_bin: Vec<(Vec<Felt>, Vec<Vec<Felt>>)> = (0..self.shape.num_bins)
            .into_par_iter()
            .map(|bin| {
                let items = &self.item_bins[bin];
                let matching = field_poly::from_roots(items, t);
                let interp = self
                    .label_bins
                    .iter()
                    .map(|part| {
                        field_poly::newton_interpolate(items, &part[bin], t).ok_or_else(|| {
                            Error::InvalidState(format!("bin {bin} holds a repeated felt"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((matching, interp))
            })
            .collect::<Result<_>>()?;

        let (matching_polyns, per_bin_interp): (Vec<_>, Vec<_>) = per_bin.into_iter().unzip();
        let interp_polyns: Vec<Vec<Vec<Felt>>> = (0..self.shape.label_size)
            .map(|part| per_bin_interp.iter().map(|bin| bin[part].clone()).collect())
            .collect();

        let matching_refs: Vec<&[Felt]> = matching_polyns.iter().map(Vec::as_slice).collect();
        let batched_matching_polyn = BatchedPolyn::build(ctx, &self.shape, &matching_refs)?;
        let batched_interp_polyns = interp_polyns
            .par_iter()
            .map(|part| {
                let refs: Vec<&[Felt]> = part.iter().map(Vec::as_slice).collect();
                BatchedPolyn::build(ctx, &self.shape, &refs)
            })
            .collect::<Result<Vec<_>>>()?;

        self.cache = BundleCache {
            matching_polyns,
            interp_polyns,
            batched_matching_polyn,
            batched_interp_polyns,
        };
        self.cache_invalid = false;
        debug!(
            max_load = self.max_load(),
            degree = self.cache.batched_matching_polyn.degree(),
            "regenerated bundle cache"
        );
        Ok(())
    }

    /// Drops bin contents and per-bin polynomials, keeping only the batched
    /// plaintexts. The bundle becomes read-only.
    pub fn strip(&mut self, ctx: &HeContext) -> Result<()> {
        self.regen_cache(ctx)?;
        self.item_bins.iter_mut().for_each(Vec::clear);
        self.label_bins.iter_mut().flatten().for_each(Vec::clear);
        self.filters.iter_mut().for_each(BloomFilter::clear);
        self.cache.matching_polyns.clear();
        self.cache.interp_polyns.clear();
        self.stripped = true;
        Ok(())
    }

    /// Evaluates the matching polynomial and, for labeled bundles, every
    /// label polynomial against one batch of query powers.
    ///
    /// Label results are `I(y) + M(y) ⊙ R` with a fresh uniformly random
    /// `R` per label part, so a slot where `M(y) = 0` carries the clean label
    /// and every other slot carries noise.
    pub fn evaluate(
        &self,
        ctx: &HeContext,
        powers: &BatchPowers<Ciphertext>,
        rk: &RelinKeys,
        seed: [u8; 32],
    ) -> Result<BundleResult> {
        if self.cache_invalid {
            return Err(Error::InvalidState("bundle cache is stale".into()));
        }
        let ps = self.shape.ps_low_degree;
        let matching = self.cache.batched_matching_polyn.evaluate(ctx, powers, ps, rk)?;
        if self.cache.batched_interp_polyns.is_empty() {
            return Ok(BundleResult {
                matching,
                labels: Vec::new(),
            });
        }

        let mut matching_ntt = matching.clone();
        ctx.transform_to_ntt(&mut matching_ntt);
        let mut rng = ChaCha20Rng::from_seed(seed);
        let t = ctx.plain_modulus();

        let labels = self
            .cache
            .batched_interp_polyns
            .iter()
            .map(|interp| {
                let mut label = interp.evaluate(ctx, powers, ps, rk)?;
                let mask: Vec<Felt> = (0..ctx.n()).map(|_| rng.gen_range(0..t)).collect();
                let mask = ctx.plaintext_to_ntt(&ctx.encode_slots(&mask)?);
                let mut masked = ctx.multiply_plain(&matching_ntt, &mask)?;
                ctx.transform_from_ntt(&mut masked);
                ctx.add_assign(&mut label, &masked)?;
                Ok(label)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BundleResult { matching, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PsiParams;

    fn shape(label_size: usize, compressed: bool) -> BundleShape {
        BundleShape {
            num_bins: 64,
            max_bin_size: 4,
            label_size,
            ps_low_degree: 0,
            compressed,
        }
    }

    fn context() -> HeContext {
        HeContext::new(&PsiParams::small_test().he).unwrap()
    }

    fn pairs(felts: &[Felt], label: Felt) -> Vec<FeltPair> {
        felts.iter().map(|&f| (f, vec![label + f])).collect()
    }

    #[test]
    fn test_insert_then_duplicate_fails_unchanged() {
        let mut bundle = BinBundle::new(shape(1, false), 0.01);
        assert_eq!(bundle.multi_insert(&pairs(&[5, 6, 7], 100), 10, false), Ok(1));
        let before = bundle.clone();
        // same felt in bin 11 only
        let err = bundle.multi_insert(&pairs(&[9, 6, 8], 100), 10, false);
        assert_eq!(err, Err(BinInsertError::DuplicateFelt { bin: 11 }));
        assert_eq!(bundle, before);
    }

    #[test]
    fn test_full_bin_is_capacity_error() {
        let mut bundle = BinBundle::new(shape(0, false), 0.01);
        for f in 1..=4 {
            bundle.multi_insert(&[(f, vec![])], 3, false).unwrap();
        }
        let before = bundle.clone();
        assert_eq!(
            bundle.multi_insert(&[(9, vec![])], 3, false),
            Err(BinInsertError::BinFull { bin: 3, max: 4 })
        );
        assert_eq!(bundle, before);
    }

    #[test]
    fn test_range_and_label_checks() {
        let mut bundle = BinBundle::new(shape(2, false), 0.01);
        assert!(matches!(
            bundle.multi_insert(&[(1, vec![0, 0]), (2, vec![0, 0])], 63, false),
            Err(BinInsertError::OutOfRange { start: 63, end: 65, width: 64 })
        ));
        assert_eq!(
            bundle.multi_insert(&[(1, vec![0])], 0, false),
            Err(BinInsertError::LabelSizeMismatch { expected: 2, got: 1 })
        );
    }

    #[test]
    fn test_dry_run_reports_size_without_mutation() {
        let mut bundle = BinBundle::new(shape(0, false), 0.01);
        bundle.multi_insert(&[(1, vec![]), (2, vec![])], 0, false).unwrap();
        let before = bundle.clone();
        assert_eq!(bundle.multi_insert(&[(3, vec![]), (4, vec![])], 1, true), Ok(2));
        assert_eq!(bundle, before);
    }

    #[test]
    fn test_overwrite_is_atomic() {
        let mut bundle = BinBundle::new(shape(1, false), 0.01);
        bundle.multi_insert(&pairs(&[1, 2], 10), 0, false).unwrap();
        let before = bundle.clone();
        assert!(!bundle.try_multi_overwrite(&[(1, vec![99]), (3, vec![99])], 0));
        assert_eq!(bundle, before);

        assert!(bundle.try_multi_overwrite(&[(1, vec![99]), (2, vec![98])], 0));
        assert_eq!(
            bundle.try_get_multi_label(&[1, 2], 0),
            Some(vec![vec![99], vec![98]])
        );
    }

    #[test]
    fn test_remove_is_atomic() {
        let mut bundle = BinBundle::new(shape(1, false), 0.01);
        bundle.multi_insert(&pairs(&[1, 2], 10), 4, false).unwrap();
        bundle.multi_insert(&pairs(&[3, 4], 10), 4, false).unwrap();
        let before = bundle.clone();
        assert!(!bundle.try_multi_remove(&[1, 3], 4));
        assert_eq!(bundle, before);

        assert!(bundle.try_multi_remove(&[1, 2], 4));
        assert_eq!(bundle.bin(4), &[3]);
        assert_eq!(bundle.bin(5), &[4]);
        assert_eq!(bundle.try_get_multi_label(&[3, 4], 4), Some(vec![vec![13], vec![14]]));
        assert_eq!(bundle.try_get_multi_label(&[1, 2], 4), None);
        // the filter forgot the removed felt
        assert!(bundle.multi_insert(&pairs(&[1, 2], 0), 4, false).is_ok());
    }

    /// Asserts that exactly the bins in `range` differ between the two
    /// bundles, counting label bins.
    fn assert_only_changed(before: &BinBundle, after: &BinBundle, range: std::ops::Range<usize>) {
        for bin in 0..before.shape.num_bins {
            let same = before.item_bins[bin] == after.item_bins[bin]
                && before
                    .label_bins
                    .iter()
                    .zip(&after.label_bins)
                    .all(|(b, a)| b[bin] == a[bin]);
            assert_eq!(same, !range.contains(&bin), "bin {bin}, target {range:?}");
        }
    }

    #[test]
    fn test_mutations_touch_only_target_bins() {
        let tagged = |felts: &[Felt], tag: Felt| -> Vec<FeltPair> {
            felts.iter().map(|&f| (f, vec![f + tag, tag])).collect()
        };
        let mut bundle = BinBundle::new(shape(2, false), 0.01);
        for (i, start) in [0usize, 3, 10, 60].into_iter().enumerate() {
            let felts: Vec<Felt> = (0..4).map(|k| (i * 10 + k + 1) as Felt).collect();
            bundle.multi_insert(&tagged(&felts, 0), start, false).unwrap();
        }

        let before = bundle.clone();
        bundle
            .multi_insert(&tagged(&[1001, 1002, 1003], 7), 5, false)
            .unwrap();
        assert_only_changed(&before, &bundle, 5..8);

        let before = bundle.clone();
        assert!(bundle.try_multi_overwrite(&tagged(&[11, 12, 13, 14], 500), 3));
        assert_only_changed(&before, &bundle, 3..7);

        let before = bundle.clone();
        assert!(bundle.try_multi_remove(&[21, 22, 23, 24], 10));
        assert_only_changed(&before, &bundle, 10..14);
    }

    #[test]
    fn test_polynomials_match_bins() {
        let ctx = context();
        let t = ctx.plain_modulus();
        let mut bundle = BinBundle::new(shape(2, true), 0.01);
        let contents: [&[Felt]; 3] = [&[3, 70, 1000], &[42], &[9, 65000]];
        for (bin, felts) in contents.iter().enumerate() {
            for &f in *felts {
                bundle
                    .multi_insert(&[(f, vec![f * 2 % t, f + 1])], bin, false)
                    .unwrap();
            }
        }
        bundle.regen_cache(&ctx).unwrap();
        let cache = bundle.cache().unwrap();

        for (bin, felts) in contents.iter().enumerate() {
            let m = &cache.matching_polyns[bin];
            assert_eq!(m.len(), felts.len() + 1);
            for &f in *felts {
                assert_eq!(field_poly::eval(m, f, t), 0);
                assert_eq!(field_poly::eval(&cache.interp_polyns[0][bin], f, t), f * 2 % t);
                assert_eq!(field_poly::eval(&cache.interp_polyns[1][bin], f, t), f + 1);
            }
            assert_ne!(field_poly::eval(m, 12345, t), 0);
        }
        // an empty bin never matches
        assert_eq!(cache.matching_polyns[10], vec![1]);

        // slice i batches coefficient i of every bin
        let slices = &cache.batched_matching_polyn.slices;
        assert_eq!(slices.len(), 4);
        for (i, slice) in slices.iter().enumerate() {
            let CoeffSlice::Plain(pt) = slice else {
                panic!("compressed bundles keep plain slices");
            };
            let column = ctx.decode_slots(pt);
            for bin in 0..64 {
                let expected = cache.matching_polyns[bin].get(i).copied().unwrap_or(0);
                assert_eq!(column[bin], expected);
            }
        }
    }

    #[test]
    fn test_ntt_slices_layout() {
        let ctx = context();
        let mut bundle = BinBundle::new(
            BundleShape {
                ps_low_degree: 1,
                ..shape(0, false)
            },
            0.01,
        );
        for f in 1..=4 {
            bundle.multi_insert(&[(f, vec![])], 0, false).unwrap();
        }
        bundle.regen_cache(&ctx).unwrap();
        let kinds: Vec<bool> = bundle
            .cache()
            .unwrap()
            .batched_matching_polyn
            .slices
            .iter()
            .map(|s| matches!(s, CoeffSlice::Plain(_)))
            .collect();
        assert_eq!(kinds, vec![true, false, true, false, true]);
    }

    #[test]
    fn test_mutation_invalidates_cache() {
        let ctx = context();
        let mut bundle = BinBundle::new(shape(0, false), 0.01);
        bundle.multi_insert(&[(1, vec![])], 0, false).unwrap();
        assert!(bundle.cache().is_none());
        bundle.regen_cache(&ctx).unwrap();
        assert!(bundle.cache_is_valid());
        bundle.multi_insert(&[(2, vec![])], 0, false).unwrap();
        assert!(!bundle.cache_is_valid());
    }

    #[test]
    fn test_strip_keeps_batched_cache_only() {
        let ctx = context();
        let mut bundle = BinBundle::new(shape(1, false), 0.01);
        bundle.multi_insert(&pairs(&[1, 2], 0), 0, false).unwrap();
        bundle.strip(&ctx).unwrap();

        assert!(bundle.is_stripped());
        assert!(bundle.bin(0).is_empty());
        let cache = bundle.cache().unwrap();
        assert!(cache.matching_polyns.is_empty());
        assert_eq!(cache.batched_matching_polyn.slices.len(), 2);
        assert_eq!(cache.batched_interp_polyns.len(), 1);
        assert_eq!(
            bundle.multi_insert(&pairs(&[3], 0), 0, false),
            Err(BinInsertError::Stripped)
        );
        assert_eq!(bundle.try_get_multi_label(&[1], 0), None);
    }
}
