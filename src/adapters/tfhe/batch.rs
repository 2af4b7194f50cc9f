//! Compact batches: an ordered list of mixed-width values encrypted together
//! under the public key, expanded once on the receiving side.

use tfhe::prelude::*;
use tfhe::{
    CompactCiphertextList, CompactCiphertextListBuilder, FheTypes, FheUint10, FheUint16,
    FheUint4, FheUint8,
};

use super::ciphertext::Ciphertext;
use super::keys::PublicKey;
use crate::adapters::bridge;
use crate::domain::{CryptoError, Persist, UintKind};

/// Append-only builder; [`BatchBuilder::seal`] produces the batch.
pub struct BatchBuilder {
    inner: CompactCiphertextListBuilder,
    kinds: Vec<UintKind>,
}

impl BatchBuilder {
    #[must_use]
    pub fn new(key: &PublicKey) -> Self {
        Self {
            inner: CompactCiphertextList::builder(key.inner()),
            kinds: Vec::new(),
        }
    }

    /// Append one value of the given width.
    ///
    /// # Errors
    /// Returns `CryptoError::Range` if `value` does not fit `kind`.
    pub fn push(&mut self, kind: UintKind, value: u32) -> Result<&mut Self, CryptoError> {
        kind.check(value)?;
        let clear = u16::try_from(value).map_err(|_| CryptoError::Range { kind, value })?;
        self.inner
            .push_with_num_bits(clear, kind.bits() as usize)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        self.kinds.push(kind);
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Encrypt everything appended so far into one compact list.
    #[must_use]
    pub fn seal(self) -> CompactBatch {
        tracing::debug!("Sealing compact batch of {} values", self.kinds.len());
        CompactBatch::from_list(self.inner.build())
    }
}

/// A sealed compact list of ciphertexts.
///
/// Items are only addressable after [`CompactBatch::expand`]; the expansion
/// runs at most once per value and its output is cached.
pub struct CompactBatch {
    list: CompactCiphertextList,
    expanded: Option<Vec<Ciphertext>>,
}

impl CompactBatch {
    fn from_list(list: CompactCiphertextList) -> Self {
        Self {
            list,
            expanded: None,
        }
    }

    /// Encrypt `values` in order under `key`.
    ///
    /// # Errors
    /// Returns `CryptoError::Range` on the first value that does not fit its kind.
    pub fn build(values: &[(UintKind, u32)], key: &PublicKey) -> Result<Self, CryptoError> {
        let mut builder = BatchBuilder::new(key);
        for &(kind, value) in values {
            builder.push(kind, value)?;
        }
        Ok(builder.seal())
    }

    /// Encrypt a list of 16-bit values (the `array` decrypt kind).
    ///
    /// # Errors
    /// Returns `CryptoError::Range` if a value exceeds 16 bits.
    pub fn build_u16(values: &[u32], key: &PublicKey) -> Result<Self, CryptoError> {
        let mut builder = BatchBuilder::new(key);
        for &value in values {
            builder.push(UintKind::U16, value)?;
        }
        Ok(builder.seal())
    }

    #[must_use]
    pub fn is_expanded(&self) -> bool {
        self.expanded.is_some()
    }

    /// Individually addressable items, expanding on first call only.
    ///
    /// # Errors
    /// Returns `CryptoError::CiphertextFormat` if the list cannot be expanded
    /// or contains a width outside [`UintKind`].
    pub fn expand(&mut self) -> Result<&[Ciphertext], CryptoError> {
        if self.expanded.is_none() {
            let items = expand_list(&self.list)?;
            tracing::debug!("Expanded compact batch into {} ciphertexts", items.len());
            self.expanded = Some(items);
        }
        Ok(self.expanded.as_deref().unwrap_or_default())
    }

    /// Consume the batch, returning its expanded items.
    ///
    /// # Errors
    /// Same as [`CompactBatch::expand`].
    pub fn into_items(mut self) -> Result<Vec<Ciphertext>, CryptoError> {
        self.expand()?;
        Ok(self.expanded.take().unwrap_or_default())
    }
}

macro_rules! get_item {
    ($expander:expr, $index:expr, $fhe:ty, $variant:ident) => {
        $expander
            .get::<$fhe>($index)
            .map_err(|e| CryptoError::CiphertextFormat(format!("Item {}: {e}", $index)))?
            .map(Ciphertext::$variant)
            .ok_or_else(|| CryptoError::CiphertextFormat(format!("Item {} is missing", $index)))
    };
}

fn expand_list(list: &CompactCiphertextList) -> Result<Vec<Ciphertext>, CryptoError> {
    let expander = list
        .expand()
        .map_err(|e| CryptoError::CiphertextFormat(format!("Failed to expand batch: {e}")))?;

    (0..expander.len())
        .map(|index| {
            let kind = expander.get_kind_of(index).ok_or_else(|| {
                CryptoError::CiphertextFormat(format!("Item {index} has no kind"))
            })?;
            tracing::trace!("Expanding item {index} as {kind:?}");
            match kind {
                FheTypes::Uint4 => get_item!(expander, index, FheUint4, U4),
                FheTypes::Uint8 => get_item!(expander, index, FheUint8, U8),
                FheTypes::Uint10 => get_item!(expander, index, FheUint10, U10),
                FheTypes::Uint16 => get_item!(expander, index, FheUint16, U16),
                other => Err(CryptoError::CiphertextFormat(format!(
                    "Item {index} has unsupported type {other:?}"
                ))),
            }
        })
        .collect()
}

impl Persist for CompactBatch {
    type Layout = ();

    fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bridge::serialize(&self.list)
            .map(bridge::ForeignBuffer::into_vec)
            .map_err(|e| CryptoError::CiphertextFormat(format!("Failed to serialize batch: {e}")))
    }

    fn from_bytes(_: (), bytes: &[u8]) -> Result<Self, CryptoError> {
        bridge::deserialize(bytes)
            .map(Self::from_list)
            .map_err(|e| CryptoError::CiphertextFormat(format!("Failed to deserialize batch: {e}")))
    }
}

impl std::fmt::Debug for CompactBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactBatch")
            .field("expanded", &self.expanded.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tfhe::test_keys;

    #[test]
    fn test_mixed_width_batch_keeps_order_and_kinds() {
        let keys = test_keys::get();
        let values = [
            (UintKind::U4, 3),
            (UintKind::U10, 600),
            (UintKind::U10, 1023),
            (UintKind::U8, 255),
            (UintKind::U16, 700),
        ];
        let batch = CompactBatch::build(&values, &keys.public).expect("build");
        let bytes = batch.to_bytes().expect("serialize");

        let mut restored = CompactBatch::from_bytes((), &bytes).expect("deserialize");
        assert!(!restored.is_expanded());
        let items = restored.expand().expect("expand");
        assert_eq!(items.len(), values.len());
        for (ct, &(kind, value)) in items.iter().zip(values.iter()) {
            assert_eq!(ct.kind(), kind);
            assert_eq!(ct.decrypt(&keys.private), value);
        }
    }

    #[test]
    fn test_expand_is_cached() {
        let keys = test_keys::get();
        let mut batch = CompactBatch::build_u16(&[1, 2, 3], &keys.public).expect("build");

        let first = batch.expand().expect("expand").as_ptr();
        assert!(batch.is_expanded());
        let second = batch.expand().expect("expand").as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_rejects_out_of_range() {
        let keys = test_keys::get();
        let err = CompactBatch::build(&[(UintKind::U4, 16)], &keys.public).unwrap_err();
        assert!(matches!(err, CryptoError::Range { kind: UintKind::U4, value: 16 }));
    }

    #[test]
    fn test_corrupt_batch_rejected() {
        assert!(matches!(
            CompactBatch::from_bytes((), &[1, 2, 3]),
            Err(CryptoError::CiphertextFormat(_))
        ));
    }
}
