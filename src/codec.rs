//! Bytes ↔ field elements, and field elements ↔ batched plaintexts.
//!
//! Bits are consumed little-endian (bit `i` is bit `i % 8` of byte `i / 8`)
//! and packed `felt_bits` at a time, where `felt_bits = floor(log2 t)`, so
//! every packed value is strictly below the plaintext modulus.

use crate::error::{Error, Result};
use crate::he::{HeContext, Plaintext};
use crate::item::{Felt, Item};
use crate::params::PsiParams;

/// Converts items and labels to field elements and batches them.
#[derive(Clone, Debug)]
pub struct FieldCodec {
    felt_bits: usize,
    felts_per_item: usize,
}

impl FieldCodec {
    /// Codec for the field and item width of `params`.
    pub fn new(params: &PsiParams) -> Self {
        Self {
            felt_bits: params.felt_bits(),
            felts_per_item: params.felts_per_item(),
        }
    }

    /// Bits packed into each field element.
    pub fn felt_bits(&self) -> usize {
        self.felt_bits
    }

    /// Item bits carried by `felts_per_item` field elements.
    pub fn item_bit_count(&self) -> usize {
        self.felt_bits * self.felts_per_item
    }

    /// Splits the first `bit_length` bits of `bytes` into field elements.
    pub fn encode(&self, bytes: &[u8], bit_length: usize) -> Result<Vec<Felt>> {
        let capacity = bytes.len() * 8;
        if bit_length > capacity {
            return Err(Error::EncodingOverflow {
                bit_length,
                capacity,
            });
        }

        let felt_count = bit_length.div_ceil(self.felt_bits);
        let mut felts = Vec::with_capacity(felt_count);
        for f in 0..felt_count {
            let start = f * self.felt_bits;
            let end = (start + self.felt_bits).min(bit_length);
            let mut value: Felt = 0;
            for (shift, bit) in (start..end).enumerate() {
                let b = (bytes[bit / 8] >> (bit % 8)) & 1;
                value |= (b as Felt) << shift;
            }
            felts.push(value);
        }
        Ok(felts)
    }

    /// Reassembles `bit_length` bits into `ceil(bit_length / 8)` bytes.
    pub fn decode(&self, felts: &[Felt], bit_length: usize) -> Result<Vec<u8>> {
        let capacity = felts.len() * self.felt_bits;
        if bit_length > capacity {
            return Err(Error::EncodingOverflow {
                bit_length,
                capacity,
            });
        }
        if let Some(&bad) = felts.iter().find(|&&f| f >> self.felt_bits != 0) {
            return Err(Error::EncodingOverflow {
                bit_length: (64 - bad.leading_zeros()) as usize,
                capacity: self.felt_bits,
            });
        }

        let mut bytes = vec![0u8; bit_length.div_ceil(8)];
        for bit in 0..bit_length {
            let felt = felts[bit / self.felt_bits];
            let b = (felt >> (bit % self.felt_bits)) & 1;
            bytes[bit / 8] |= (b as u8) << (bit % 8);
        }
        Ok(bytes)
    }

    /// Packs field elements into plaintext slots.
    pub fn batch(&self, ctx: &HeContext, felts: &[Felt]) -> Result<Plaintext> {
        ctx.encode_slots(felts)
    }

    /// Inverse of [`FieldCodec::batch`]: one field element per slot.
    pub fn unbatch(&self, ctx: &HeContext, pt: &Plaintext) -> Vec<Felt> {
        ctx.decode_slots(pt)
    }

    /// `felts_per_item` field elements for one item, one per bin it spans.
    ///
    /// # Errors
    ///
    /// `EncodingOverflow` if the parameters pack more than 128 bits per item.
    pub fn encode_item(&self, item: &Item) -> Result<Vec<Felt>> {
        self.encode(item.as_bytes(), self.item_bit_count())
    }

    /// Label felts laid out per bin: `result[k][p]` is part `p` of the label
    /// as stored in the `k`-th bin of the item.
    pub fn encode_label(
        &self,
        label: &[u8],
        label_byte_count: usize,
        label_size: usize,
    ) -> Result<Vec<Vec<Felt>>> {
        if label.len() > label_byte_count {
            return Err(Error::EncodingOverflow {
                bit_length: label.len() * 8,
                capacity: label_byte_count * 8,
            });
        }
        let total_bits = label_size * self.item_bit_count();
        let mut padded = label.to_vec();
        padded.resize(total_bits.div_ceil(8).max(label_byte_count), 0);
        let flat = self.encode(&padded, total_bits)?;

        let fpi = self.felts_per_item;
        Ok((0..fpi)
            .map(|k| (0..label_size).map(|p| flat[p * fpi + k]).collect())
            .collect())
    }

    /// Inverse of [`FieldCodec::encode_label`].
    pub fn decode_label(&self, per_bin: &[Vec<Felt>], label_byte_count: usize) -> Result<Vec<u8>> {
        let fpi = self.felts_per_item;
        let label_size = per_bin.first().map_or(0, Vec::len);
        if per_bin.len() != fpi || per_bin.iter().any(|parts| parts.len() != label_size) {
            return Err(Error::MalformedMessage("label felt layout mismatch".into()));
        }
        let mut flat = vec![0; label_size * fpi];
        for (k, parts) in per_bin.iter().enumerate() {
            for (p, &felt) in parts.iter().enumerate() {
                flat[p * fpi + k] = felt;
            }
        }
        self.decode(&flat, label_byte_count * 8)
    }
}
