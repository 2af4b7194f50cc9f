//! Compute-side activation and homomorphic operations.
//!
//! `tfhe::set_server_key()` writes to a thread-local global. A
//! [`ComputeContext`] owns one decompressed key and installs it only for the
//! duration of a single operation, through an RAII guard that unsets it again.
//! Operations never yield while the key is installed, so two contexts can
//! serve different tenants on the same worker threads.

use std::sync::{Arc, PoisonError, RwLock};

use tfhe::prelude::*;
use tfhe::{set_server_key, unset_server_key, ServerKey};

use super::ciphertext::Ciphertext;
use super::keys::ComputeKey;
use crate::domain::{CryptoError, UintKind};

/// Encrypted `(min, max, avg)` of a list of 16-bit ciphertexts.
#[derive(Debug, Clone)]
pub struct Stats {
    pub min: Ciphertext,
    pub max: Ciphertext,
    pub avg: Ciphertext,
}

/// A decompressed compute key, ready to run operations.
pub struct ComputeContext {
    server_key: ServerKey,
    fingerprint: String,
}

struct ActiveKeyGuard;

impl Drop for ActiveKeyGuard {
    fn drop(&mut self) {
        unset_server_key();
    }
}

macro_rules! same_kind {
    ($a:expr, $b:expr, |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (Ciphertext::U4($x), Ciphertext::U4($y)) => Ok(Ciphertext::U4($body)),
            (Ciphertext::U8($x), Ciphertext::U8($y)) => Ok(Ciphertext::U8($body)),
            (Ciphertext::U10($x), Ciphertext::U10($y)) => Ok(Ciphertext::U10($body)),
            (Ciphertext::U16($x), Ciphertext::U16($y)) => Ok(Ciphertext::U16($body)),
            (a, b) => Err(CryptoError::KindMismatch {
                expected: a.kind(),
                found: b.kind(),
            }),
        }
    };
}

impl ComputeContext {
    /// Decompress `key` into a usable context.
    #[must_use]
    pub fn activate(key: &ComputeKey) -> Self {
        tracing::debug!("Decompressing compute key {}", key.fingerprint());
        Self {
            server_key: key.inner().decompress(),
            fingerprint: key.fingerprint().to_string(),
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn enter(&self) -> ActiveKeyGuard {
        set_server_key(self.server_key.clone());
        ActiveKeyGuard
    }

    /// Homomorphic addition (wrapping at the kind's width).
    ///
    /// # Errors
    /// Returns `CryptoError::KindMismatch` if the operands differ in width.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, CryptoError> {
        let _guard = self.enter();
        same_kind!(a, b, |x, y| x + y)
    }

    /// # Errors
    /// Returns `CryptoError::KindMismatch` if the operands differ in width.
    pub fn min(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, CryptoError> {
        let _guard = self.enter();
        same_kind!(a, b, |x, y| x.min(y))
    }

    /// # Errors
    /// Returns `CryptoError::KindMismatch` if the operands differ in width.
    pub fn max(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, CryptoError> {
        let _guard = self.enter();
        same_kind!(a, b, |x, y| x.max(y))
    }

    /// Truncating integer division by a clear divisor.
    ///
    /// Callers needing fractional precision pre-scale values before
    /// encryption and post-scale after decryption.
    ///
    /// # Errors
    /// Returns `CryptoError::DivisionByZero` for a zero divisor and
    /// `CryptoError::Range` if the divisor does not fit the ciphertext kind.
    pub fn scalar_divide(&self, a: &Ciphertext, divisor: u32) -> Result<Ciphertext, CryptoError> {
        if divisor == 0 {
            return Err(CryptoError::DivisionByZero);
        }
        let kind = a.kind();
        kind.check(divisor)?;
        let range = || CryptoError::Range {
            kind,
            value: divisor,
        };

        let _guard = self.enter();
        Ok(match a {
            Ciphertext::U4(x) => Ciphertext::U4(x / u8::try_from(divisor).map_err(|_| range())?),
            Ciphertext::U8(x) => Ciphertext::U8(x / u8::try_from(divisor).map_err(|_| range())?),
            Ciphertext::U10(x) => {
                Ciphertext::U10(x / u16::try_from(divisor).map_err(|_| range())?)
            }
            Ciphertext::U16(x) => {
                Ciphertext::U16(x / u16::try_from(divisor).map_err(|_| range())?)
            }
        })
    }

    /// Fold `items` into `(min, max, sum / count)`.
    ///
    /// The fold starts from the first element; the sum wraps at 16 bits.
    ///
    /// # Errors
    /// Returns `CryptoError::EmptyBatch` on an empty list and
    /// `CryptoError::KindMismatch` if any item is not 16-bit.
    pub fn stats(&self, items: &[Ciphertext]) -> Result<Stats, CryptoError> {
        let (first, rest) = items.split_first().ok_or(CryptoError::EmptyBatch)?;
        let first = first.as_u16()?;
        let rest = rest
            .iter()
            .map(Ciphertext::as_u16)
            .collect::<Result<Vec<_>, _>>()?;
        let count = u16::try_from(items.len()).map_err(|_| CryptoError::Range {
            kind: UintKind::U16,
            value: u32::try_from(items.len()).unwrap_or(u32::MAX),
        })?;

        let _guard = self.enter();
        let mut min = first.clone();
        let mut max = first.clone();
        let mut sum = first.clone();
        for (i, value) in rest.into_iter().enumerate() {
            min = min.min(value);
            max = max.max(value);
            sum = &sum + value;
            tracing::trace!("Folded item {}", i + 1);
        }
        let avg = &sum / count;

        tracing::debug!("Computed stats over {count} ciphertexts");
        Ok(Stats {
            min: Ciphertext::U16(min),
            max: Ciphertext::U16(max),
            avg: Ciphertext::U16(avg),
        })
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Process-wide "currently active compute key".
///
/// Activation replaces the previous context (last write wins). Callers hold
/// the returned `Arc` for the whole task, so a concurrent re-activation never
/// swaps the key under a running operation.
#[derive(Debug, Default)]
pub struct ComputeKeySlot {
    active: RwLock<Option<Arc<ComputeContext>>>,
}

impl ComputeKeySlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decompress `key` and install it, replacing any previous key.
    pub fn activate(&self, key: &ComputeKey) -> Arc<ComputeContext> {
        let context = Arc::new(ComputeContext::activate(key));
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&context));
        match previous {
            Some(old) if old.fingerprint() != context.fingerprint() => tracing::info!(
                "Compute key {} replaced by {}",
                old.fingerprint(),
                context.fingerprint()
            ),
            _ => tracing::info!("Compute key {} activated", context.fingerprint()),
        }
        context
    }

    /// The active context.
    ///
    /// # Errors
    /// Returns `CryptoError::NoActiveKey` before the first activation.
    pub fn current(&self) -> Result<Arc<ComputeContext>, CryptoError> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CryptoError::NoActiveKey)
    }

    pub fn clear(&self) {
        if self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            tracing::debug!("Compute key cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tfhe::{test_keys, CompactBatch};

    fn u16_ct(value: u32) -> Ciphertext {
        Ciphertext::encrypt(UintKind::U16, value, &test_keys::get().public).expect("encrypt")
    }

    #[test]
    fn test_slot_requires_activation() {
        let slot = ComputeKeySlot::new();
        assert!(matches!(slot.current(), Err(CryptoError::NoActiveKey)));

        slot.activate(&test_keys::get().compute);
        assert!(slot.current().is_ok());

        slot.clear();
        assert!(matches!(slot.current(), Err(CryptoError::NoActiveKey)));
    }

    #[test]
    fn test_binary_ops() {
        let keys = test_keys::get();
        let ctx = test_keys::context();
        let a = u16_ct(700);
        let b = u16_ct(650);

        assert_eq!(ctx.add(&a, &b).expect("add").decrypt(&keys.private), 1350);
        assert_eq!(ctx.min(&a, &b).expect("min").decrypt(&keys.private), 650);
        assert_eq!(ctx.max(&a, &b).expect("max").decrypt(&keys.private), 700);
        assert_eq!(
            ctx.scalar_divide(&a, 3).expect("div").decrypt(&keys.private),
            233
        );
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        let keys = test_keys::get();
        let ctx = test_keys::context();
        let a = u16_ct(1);
        let b = Ciphertext::encrypt(UintKind::U8, 1, &keys.public).expect("encrypt");
        assert!(matches!(
            ctx.add(&a, &b),
            Err(CryptoError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_divide_by_zero_rejected() {
        let ctx = test_keys::context();
        assert!(matches!(
            ctx.scalar_divide(&u16_ct(5), 0),
            Err(CryptoError::DivisionByZero)
        ));
    }

    #[test]
    fn test_stats_over_weights() {
        let keys = test_keys::get();
        let ctx = test_keys::context();
        let weights = [720u32, 710, 690, 710, 700, 730, 650];

        let items = CompactBatch::build_u16(&weights, &keys.public)
            .expect("build")
            .into_items()
            .expect("expand");
        let stats = ctx.stats(&items).expect("stats");

        assert_eq!(stats.min.decrypt(&keys.private), 650);
        assert_eq!(stats.max.decrypt(&keys.private), 730);
        assert_eq!(stats.avg.decrypt(&keys.private), 4910 / 7);
    }

    #[test]
    fn test_stats_on_empty_list() {
        let ctx = test_keys::context();
        assert!(matches!(ctx.stats(&[]), Err(CryptoError::EmptyBatch)));
    }
}
