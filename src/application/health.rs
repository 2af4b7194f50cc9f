//! Health flows: encrypt samples into suffixed blobs, run the family task,
//! persist and decrypt the encrypted results.
//!
//! Weights are stored as one `weightList` per date interval and sleep as one
//! `sleepList` per night. Results are written next to their inputs under the
//! same scopes, so any cooperating process holding the private key can open
//! them with `KeyAuthority::decrypt_file`.

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::adapters::tfhe::{Ciphertext, CompactBatch};
use crate::adapters::StorageError;
use crate::application::{KeyAuthority, TaskError, TaskOrchestrator};
use crate::domain::{
    day_suffix, interval_suffix, parse_day_suffix, parse_interval_suffix, scale_weight,
    unscale_weight, CryptoError, Persist, SleepQuality, SleepSample, TaskFamily,
    TaskOutput, UintKind, VaultFile,
};
use crate::ports::{BlobStore, ComputeService};
use crate::VaultError;

/// Decrypted weight statistics, in kilograms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Decrypted sleep score of one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepScore {
    pub night: NaiveDate,
    pub score: u32,
    /// `None` when the service returned a score outside 1..=5.
    pub quality: Option<SleepQuality>,
}

fn storage<E: Into<StorageError>>(e: E) -> VaultError {
    VaultError::Storage(e.into())
}

/// Run key derivation or decryption on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, VaultError>
where
    F: FnOnce() -> Result<T, VaultError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// Client side of the health task families.
pub struct HealthService<C: ComputeService, S: BlobStore> {
    keys: Arc<KeyAuthority<S>>,
    orchestrator: Arc<TaskOrchestrator<C, S>>,
    store: Arc<S>,
}

impl<C, S> HealthService<C, S>
where
    C: ComputeService,
    S: BlobStore + 'static,
    S::Error: Into<StorageError>,
{
    pub fn new(
        keys: Arc<KeyAuthority<S>>,
        orchestrator: Arc<TaskOrchestrator<C, S>>,
        store: Arc<S>,
    ) -> Self {
        Self {
            keys,
            orchestrator,
            store,
        }
    }

    /// Encrypt weights measured between `start` and `end`.
    ///
    /// Replaces any previously stored weight list and its results.
    ///
    /// # Returns
    /// The suffix the list was stored under.
    ///
    /// # Errors
    /// Returns `CryptoError::EmptyBatch` for no weights and
    /// `CryptoError::Range` for weights that do not fit the encoding.
    pub fn encrypt_weights(
        &self,
        weights_kg: &[f64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<String, VaultError> {
        if weights_kg.is_empty() {
            return Err(CryptoError::EmptyBatch.into());
        }
        let scaled = weights_kg
            .iter()
            .map(|&w| scale_weight(w))
            .collect::<Result<Vec<_>, _>>()?;

        self.keys.ensure_keys_exist()?;
        let public = self.keys.public_key()?;
        let bytes = CompactBatch::build_u16(&scaled, &public)?.to_bytes()?;

        for previous in self.store.list_instances(VaultFile::WeightList).map_err(storage)? {
            self.store
                .delete(VaultFile::WeightList, Some(&previous))
                .map_err(storage)?;
        }
        self.store.delete(VaultFile::WeightList, None).map_err(storage)?;
        for result in [VaultFile::WeightMin, VaultFile::WeightMax, VaultFile::WeightAvg] {
            self.store.delete(result, None).map_err(storage)?;
        }

        let suffix = interval_suffix(start, end);
        self.store
            .write(VaultFile::WeightList, Some(&suffix), Some(&bytes))
            .map_err(storage)?;
        tracing::info!("Encrypted {} weights ({} bytes)", scaled.len(), bytes.len());
        Ok(suffix)
    }

    /// Encrypt one night of sleep samples.
    ///
    /// # Returns
    /// The suffix the night was stored under.
    ///
    /// # Errors
    /// Returns `CryptoError::EmptyBatch` for a night without samples.
    pub fn encrypt_night(&self, night: NaiveDate, samples: &[SleepSample]) -> Result<String, VaultError> {
        if samples.is_empty() {
            return Err(CryptoError::EmptyBatch.into());
        }
        let values: Vec<_> = samples.iter().flat_map(SleepSample::encoded).collect();

        self.keys.ensure_keys_exist()?;
        let public = self.keys.public_key()?;
        let bytes = CompactBatch::build(&values, &public)?.to_bytes()?;

        let suffix = day_suffix(night);
        self.store
            .write(VaultFile::SleepList, Some(&suffix), Some(&bytes))
            .map_err(storage)?;
        tracing::info!("Encrypted night {suffix}: {} samples ({} bytes)", samples.len(), bytes.len());
        Ok(suffix)
    }

    /// Date interval of the stored weight list, if any.
    ///
    /// # Errors
    /// Returns error if the store cannot be listed.
    pub fn weight_interval(&self) -> Result<Option<(NaiveDate, NaiveDate)>, VaultError> {
        Ok(self
            .store
            .list_instances(VaultFile::WeightList)
            .map_err(storage)?
            .iter()
            .filter_map(|s| parse_interval_suffix(s))
            .max_by_key(|&(_, end)| end))
    }

    /// Nights with stored sleep samples, oldest first.
    ///
    /// # Errors
    /// Returns error if the store cannot be listed.
    pub fn nights(&self) -> Result<Vec<NaiveDate>, VaultError> {
        let mut nights: Vec<_> = self
            .store
            .list_instances(VaultFile::SleepList)
            .map_err(storage)?
            .iter()
            .filter_map(|s| parse_day_suffix(s))
            .collect();
        nights.sort_unstable();
        Ok(nights)
    }

    /// Run `weight_stats` on the stored weight list and decrypt the result.
    ///
    /// # Errors
    /// Returns `VaultError::Missing` without a stored weight list, and any
    /// task error from the orchestrator.
    pub async fn analyze_weights<F>(&self, cancel: F) -> Result<WeightSummary, VaultError>
    where
        F: Future<Output = ()>,
    {
        let family = TaskFamily::WeightStats;
        let suffix = self
            .weight_interval()?
            .map(|(start, end)| interval_suffix(start, end));
        let input = self
            .store
            .read(VaultFile::WeightList, suffix.as_deref())
            .map_err(storage)?
            .ok_or_else(|| VaultError::Missing(VaultFile::WeightList.file_name(suffix.as_deref())))?;

        let keys = Arc::clone(&self.keys);
        let compute = blocking(move || keys.compute_key()).await?;
        let body = self
            .orchestrator
            .run_task(family, &compute, input, cancel)
            .await?;

        let TaskOutput::Stats { min, max, avg } = TaskOutput::parse(family.result_shape(), body)
            .map_err(|reason| TaskError::InvalidResult { family, reason })?
        else {
            return Err(TaskError::InvalidResult {
                family,
                reason: "expected a statistics triple".to_string(),
            }
            .into());
        };

        let keys = Arc::clone(&self.keys);
        let results = [
            (VaultFile::WeightMin, min),
            (VaultFile::WeightMax, max),
            (VaultFile::WeightAvg, avg),
        ];
        let (results, values) = blocking(move || {
            let private = keys.private_key()?;
            let mut values = [0.0; 3];
            for (slot, (_, bytes)) in values.iter_mut().zip(&results) {
                *slot = unscale_weight(Ciphertext::from_bytes(UintKind::U16, bytes)?.decrypt(&private));
            }
            Ok((results, values))
        })
        .await?;
        for (file, bytes) in &results {
            self.store.write(*file, None, Some(bytes)).map_err(storage)?;
        }
        let [min, max, avg] = values;
        let summary = WeightSummary { min, max, avg };
        tracing::info!("Weight statistics stored");
        Ok(summary)
    }

    /// Run `sleep_quality` on one stored night and decrypt the score.
    ///
    /// # Errors
    /// Returns `VaultError::Missing` if the night is not stored, and any task
    /// error from the orchestrator.
    pub async fn analyze_night<F>(&self, night: NaiveDate, cancel: F) -> Result<SleepScore, VaultError>
    where
        F: Future<Output = ()>,
    {
        let family = TaskFamily::SleepQuality;
        let suffix = day_suffix(night);
        let input = self
            .store
            .read(VaultFile::SleepList, Some(&suffix))
            .map_err(storage)?
            .ok_or_else(|| VaultError::Missing(VaultFile::SleepList.file_name(Some(&suffix))))?;

        let keys = Arc::clone(&self.keys);
        let compute = blocking(move || keys.compute_key()).await?;
        let body = self
            .orchestrator
            .run_task(family, &compute, input, cancel)
            .await?;

        let score = Ciphertext::from_bytes(UintKind::U8, &body).map_err(|e| TaskError::InvalidResult {
            family,
            reason: e.to_string(),
        })?;
        let keys = Arc::clone(&self.keys);
        let score = blocking(move || Ok(score.decrypt(&*keys.private_key()?))).await?;
        self.store
            .write(VaultFile::SleepScore, Some(&suffix), Some(&body))
            .map_err(storage)?;

        tracing::info!("Sleep score for {suffix} stored");
        Ok(SleepScore {
            night,
            score,
            quality: SleepQuality::from_score(score),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_work_reports_result_and_panic() {
        assert_eq!(blocking(|| Ok(7)).await.expect("value"), 7);
        assert!(matches!(
            blocking(|| Err::<(), _>(VaultError::NoIdentity)).await,
            Err(VaultError::NoIdentity)
        ));
        let panicked = blocking::<(), _>(|| panic!("worker down")).await;
        assert!(matches!(panicked, Err(VaultError::Join(_))));
    }
}
