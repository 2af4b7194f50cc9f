//! Health samples in the clear, before encryption and after decryption.
//!
//! Values are encoded into the fixed ciphertext widths used by the health
//! task families: weights as 16-bit integers in tenths of a kilogram, sleep
//! samples as `(level: u4, start: u10, end: u10)` triples.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::crypto::{CryptoError, UintKind};

/// Weights are encrypted as integers with one fractional digit.
pub const WEIGHT_SCALE: u32 = 10;

/// Pre-scale a weight in kilograms for encryption (truncating).
///
/// # Errors
/// Returns `CryptoError::Range` for negative, non-finite or oversized weights.
pub fn scale_weight(kilograms: f64) -> Result<u32, CryptoError> {
    let scaled = (kilograms * f64::from(WEIGHT_SCALE)).trunc();
    if !scaled.is_finite() || scaled < 0.0 || scaled > f64::from(UintKind::U16.max_value()) {
        return Err(CryptoError::Range {
            kind: UintKind::U16,
            value: u32::MAX,
        });
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(scaled as u32)
}

/// Undo [`scale_weight`] for display.
#[must_use]
pub fn unscale_weight(scaled: u32) -> f64 {
    f64::from(scaled) / f64::from(WEIGHT_SCALE)
}

/// Sleep stage of one sample (HealthKit sleep analysis values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SleepLevel {
    InBed = 0,
    AsleepUnspecified = 1,
    Awake = 2,
    AsleepCore = 3,
    AsleepDeep = 4,
    AsleepRem = 5,
}

impl SleepLevel {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::InBed),
            1 => Some(Self::AsleepUnspecified),
            2 => Some(Self::Awake),
            3 => Some(Self::AsleepCore),
            4 => Some(Self::AsleepDeep),
            5 => Some(Self::AsleepRem),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InBed => "In Bed",
            Self::AsleepUnspecified => "Asleep",
            Self::Awake => "Awake",
            Self::AsleepCore => "Core",
            Self::AsleepDeep => "Deep",
            Self::AsleepRem => "REM",
        }
    }
}

/// One sleep sample; `start` and `end` are minutes since the night began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSample {
    pub level: SleepLevel,
    pub start: u16,
    pub end: u16,
}

impl SleepSample {
    /// Build a sample, checking it fits the encrypted layout.
    ///
    /// # Errors
    /// Returns `CryptoError::Range` if `start` or `end` exceed 10 bits.
    pub fn new(level: SleepLevel, start: u16, end: u16) -> Result<Self, CryptoError> {
        UintKind::U10.check(u32::from(start))?;
        UintKind::U10.check(u32::from(end))?;
        Ok(Self { level, start, end })
    }

    /// Widths and clear values in batch order.
    #[must_use]
    pub fn encoded(&self) -> [(UintKind, u32); 3] {
        [
            (UintKind::U4, u32::from(self.level as u8)),
            (UintKind::U10, u32::from(self.start)),
            (UintKind::U10, u32::from(self.end)),
        ]
    }

    /// Inverse of [`SleepSample::encoded`].
    ///
    /// # Errors
    /// Returns `CryptoError::CiphertextFormat` for an unknown level and
    /// `CryptoError::Range` for out-of-width values.
    pub fn decode(level: u32, start: u32, end: u32) -> Result<Self, CryptoError> {
        let level = u8::try_from(level)
            .ok()
            .and_then(SleepLevel::from_raw)
            .ok_or_else(|| CryptoError::CiphertextFormat(format!("unknown sleep level {level}")))?;
        let narrow = |v: u32| {
            u16::try_from(v).map_err(|_| CryptoError::Range {
                kind: UintKind::U10,
                value: v,
            })
        };
        Self::new(level, narrow(start)?, narrow(end)?)
    }
}

/// Sleep quality score computed remotely, 1 (best) to 5 (worst).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleepQuality {
    Excellent = 1,
    Good = 2,
    Moderate = 3,
    Poor = 4,
    VeryPoor = 5,
}

impl SleepQuality {
    #[must_use]
    pub const fn from_score(score: u32) -> Option<Self> {
        match score {
            1 => Some(Self::Excellent),
            2 => Some(Self::Good),
            3 => Some(Self::Moderate),
            4 => Some(Self::Poor),
            5 => Some(Self::VeryPoor),
            _ => None,
        }
    }
}

impl fmt::Display for SleepQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Moderate => "moderate",
            Self::Poor => "poor",
            Self::VeryPoor => "very poor",
        };
        f.write_str(s)
    }
}
