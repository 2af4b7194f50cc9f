//! Compute side: runs family kernels on ciphertexts under an uploaded key.
//!
//! The worker never sees a private key. Each run activates the tenant's
//! compute key into the worker's slot and holds the returned context for the
//! whole kernel, so a concurrent activation for another tenant cannot swap
//! the key mid-task.

use crate::adapters::tfhe::{CompactBatch, ComputeKey, ComputeKeySlot};
use crate::application::TaskError;
use crate::domain::{Persist, TaskFamily, TaskOutput};
use crate::VaultError;

/// Executes task families in-process.
#[derive(Debug, Default)]
pub struct ComputeWorker {
    slot: ComputeKeySlot,
}

impl ComputeWorker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `family` has a kernel in this worker.
    #[must_use]
    pub const fn supports(family: TaskFamily) -> bool {
        matches!(family, TaskFamily::WeightStats)
    }

    /// Run `family` on `input` under `key`, returning the wire result body.
    ///
    /// # Errors
    /// Returns `TaskError::Unsupported` for families without a local kernel,
    /// and crypto errors for malformed input.
    pub fn run(&self, family: TaskFamily, key: &ComputeKey, input: &[u8]) -> Result<Vec<u8>, VaultError> {
        if !Self::supports(family) {
            return Err(TaskError::Unsupported(family).into());
        }

        let context = self.slot.activate(key);
        tracing::debug!("Running {family} on {} input bytes", input.len());

        let items = CompactBatch::from_bytes((), input)?.into_items()?;
        let stats = context.stats(&items)?;

        let output = TaskOutput::Stats {
            min: stats.min.to_bytes()?,
            max: stats.max.to_bytes()?,
            avg: stats.avg.to_bytes()?,
        };
        let body = output.to_body()?;
        tracing::info!("{family} finished over {} values", items.len());
        Ok(body)
    }

    /// Drop the active key, e.g. between tenants.
    pub fn clear(&self) {
        self.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::tfhe::{test_keys, Ciphertext};
    use crate::domain::{ResultShape, UintKind};

    #[test]
    fn test_weight_stats_kernel() {
        let keys = test_keys::get();
        let input = CompactBatch::build_u16(&[640, 655, 630], &keys.public)
            .expect("build")
            .to_bytes()
            .expect("serialize");

        let body = ComputeWorker::new()
            .run(TaskFamily::WeightStats, &keys.compute, &input)
            .expect("run");

        let TaskOutput::Stats { min, max, avg } =
            TaskOutput::parse(ResultShape::Stats, body).expect("parse")
        else {
            panic!("expected stats output");
        };
        let open = |bytes: &[u8]| {
            Ciphertext::from_bytes(UintKind::U16, bytes)
                .expect("ciphertext")
                .decrypt(&keys.private)
        };
        assert_eq!(open(&min), 630);
        assert_eq!(open(&max), 655);
        assert_eq!(open(&avg), 641);
    }

    #[test]
    fn test_unsupported_family() {
        let keys = test_keys::get();
        let err = ComputeWorker::new()
            .run(TaskFamily::SleepQuality, &keys.compute, &[])
            .unwrap_err();
        assert!(matches!(err, VaultError::Task(TaskError::Unsupported(TaskFamily::SleepQuality))));
    }

    #[test]
    fn test_garbage_input_is_ciphertext_error() {
        let keys = test_keys::get();
        let err = ComputeWorker::new()
            .run(TaskFamily::WeightStats, &keys.compute, b"not a batch")
            .unwrap_err();
        assert!(matches!(err, VaultError::Crypto(_)));
    }
}
