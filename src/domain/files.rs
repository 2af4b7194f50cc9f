//! Persisted file table.
//!
//! Every blob the vault stores is named by a [`VaultFile`]. Its confidentiality
//! scope and decrypt kind are fixed here, statically, so nothing ever has to
//! guess a blob's type from its on-disk name.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::crypto::UintKind;

/// Date format used for day suffixes (`23-03-2025`).
const DAY_FORMAT: &str = "%d-%m-%Y";

/// Confidentiality partition a file is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Readable by every cooperating local process.
    Shared,
    /// Restricted to the health app and its helpers.
    HealthPrivate,
    /// Restricted to the ads app and its helpers.
    AdsPrivate,
}

impl Scope {
    /// Directory name of the scope under the vault root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::HealthPrivate => "health-private",
            Self::AdsPrivate => "ads-private",
        }
    }

    #[must_use]
    pub const fn is_private(self) -> bool {
        !matches!(self, Self::Shared)
    }
}

/// How a stored blob is interpreted when decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptKind {
    /// One scalar ciphertext of the given width.
    Scalar(UintKind),
    /// Compact batch of 16-bit values.
    Array,
    /// Compact batch of `(stage: u4, start: u10, end: u10)` triples.
    CipherTextList,
}

/// Logical identifier of every persisted blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultFile {
    ClientKey,
    PublicKey,
    ServerKey,

    ConcretePrivateKey,
    ConcreteCpuCompressionKey,
    ConcreteEncryptedProfile,
    ConcreteEncryptedResult,

    WeightList,
    WeightMin,
    WeightMax,
    WeightAvg,

    SleepList,
    SleepScore,

    TaskLedger,
}

impl VaultFile {
    pub const ALL: [VaultFile; 14] = [
        Self::ClientKey,
        Self::PublicKey,
        Self::ServerKey,
        Self::ConcretePrivateKey,
        Self::ConcreteCpuCompressionKey,
        Self::ConcreteEncryptedProfile,
        Self::ConcreteEncryptedResult,
        Self::WeightList,
        Self::WeightMin,
        Self::WeightMax,
        Self::WeightAvg,
        Self::SleepList,
        Self::SleepScore,
        Self::TaskLedger,
    ];

    /// Stable on-disk name (without suffix).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ClientKey => "clientKey",
            Self::PublicKey => "publicKeyCompact",
            Self::ServerKey => "serverKeyCompressed",
            Self::ConcretePrivateKey => "concretePrivateKey",
            Self::ConcreteCpuCompressionKey => "concreteCPUCompressionKey",
            Self::ConcreteEncryptedProfile => "concreteProfile.fheencrypted",
            Self::ConcreteEncryptedResult => "concreteResult.fheencryptedAd",
            Self::WeightList => "weightList.fheencrypted",
            Self::WeightMin => "weightMin.fheencrypted",
            Self::WeightMax => "weightMax.fheencrypted",
            Self::WeightAvg => "weightAvg.fheencrypted",
            Self::SleepList => "sleepList.fheencrypted",
            Self::SleepScore => "sleepScore.fheencrypted",
            Self::TaskLedger => "taskLedger.json",
        }
    }

    /// Look up a file by its stable name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    #[must_use]
    pub const fn scope(self) -> Scope {
        match self {
            Self::ClientKey => Scope::HealthPrivate,
            Self::ConcretePrivateKey => Scope::AdsPrivate,
            _ => Scope::Shared,
        }
    }

    #[must_use]
    pub const fn decrypt_kind(self) -> Option<DecryptKind> {
        match self {
            Self::SleepList => Some(DecryptKind::CipherTextList),
            Self::SleepScore => Some(DecryptKind::Scalar(UintKind::U8)),
            Self::WeightList => Some(DecryptKind::Array),
            Self::WeightMin | Self::WeightMax | Self::WeightAvg => {
                Some(DecryptKind::Scalar(UintKind::U16))
            }
            _ => None,
        }
    }

    /// File name with an optional instance suffix.
    ///
    /// The suffix goes before the first `.`: `weightList.fheencrypted` with
    /// `25-03-2025` becomes `weightList-25-03-2025.fheencrypted`. Names without
    /// an extension get `-suffix` appended. An empty suffix is ignored.
    #[must_use]
    pub fn file_name(self, suffix: Option<&str>) -> String {
        let name = self.name();
        match suffix.filter(|s| !s.is_empty()) {
            None => name.to_string(),
            Some(suffix) => match name.split_once('.') {
                Some((stem, ext)) => format!("{stem}-{suffix}.{ext}"),
                None => format!("{name}-{suffix}"),
            },
        }
    }

    /// Recover the instance suffix from a stored file name of this file.
    ///
    /// Returns `None` for names that are not an instance of `self` and for the
    /// `-preview` renderings kept next to real instances.
    #[must_use]
    pub fn suffix_of(self, file_name: &str) -> Option<String> {
        let name = self.name();
        let (stem, ext) = match name.split_once('.') {
            Some((stem, ext)) => (stem, Some(ext)),
            None => (name, None),
        };

        let rest = file_name.strip_prefix(stem)?.strip_prefix('-')?;
        let suffix = match ext {
            Some(ext) => rest.strip_suffix(ext)?.strip_suffix('.')?,
            None => rest,
        };
        if suffix.is_empty() || suffix.ends_with("-preview") || suffix == "preview" {
            return None;
        }
        Some(suffix.to_string())
    }
}

/// Whether `suffix` names an instance without leaving the file's directory.
///
/// Rejects path separators, NUL and `..`, so a suffix can never move a file
/// out of its declared scope.
#[must_use]
pub fn is_valid_suffix(suffix: &str) -> bool {
    !suffix.contains(['/', '\\', '\0']) && !suffix.contains("..")
}

/// Suffix for one calendar day, e.g. one night of sleep data.
#[must_use]
pub fn day_suffix(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Suffix for a date interval, e.g. a range of weight samples.
#[must_use]
pub fn interval_suffix(start: NaiveDate, end: NaiveDate) -> String {
    format!("{}_{}", day_suffix(start), day_suffix(end))
}

/// Inverse of [`day_suffix`].
#[must_use]
pub fn parse_day_suffix(suffix: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(suffix, DAY_FORMAT).ok()
}

/// Inverse of [`interval_suffix`].
#[must_use]
pub fn parse_interval_suffix(suffix: &str) -> Option<(NaiveDate, NaiveDate)> {
    let (start, end) = suffix.split_once('_')?;
    Some((parse_day_suffix(start)?, parse_day_suffix(end)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_inserted_before_extension() {
        assert_eq!(
            VaultFile::WeightList.file_name(Some("25-03-2025")),
            "weightList-25-03-2025.fheencrypted"
        );
        assert_eq!(VaultFile::ClientKey.file_name(Some("x")), "clientKey-x");
        assert_eq!(VaultFile::SleepList.file_name(None), "sleepList.fheencrypted");
        assert_eq!(VaultFile::SleepList.file_name(Some("")), "sleepList.fheencrypted");
    }

    #[test]
    fn test_suffix_of_inverts_file_name() {
        for file in VaultFile::ALL {
            let name = file.file_name(Some("01-02-2025"));
            assert_eq!(file.suffix_of(&name).as_deref(), Some("01-02-2025"));
            assert_eq!(file.suffix_of(file.name()), None);
        }
    }

    #[test]
    fn test_suffix_of_skips_previews_and_other_files() {
        assert_eq!(
            VaultFile::SleepList.suffix_of("sleepList-01-02-2025-preview.fheencrypted"),
            None
        );
        assert_eq!(VaultFile::SleepList.suffix_of("sleepScore-01-02-2025.fheencrypted"), None);
        assert_eq!(VaultFile::SleepList.suffix_of("sleepList-01-02-2025.json"), None);
    }

    #[test]
    fn test_static_scopes() {
        assert_eq!(VaultFile::ClientKey.scope(), Scope::HealthPrivate);
        assert_eq!(VaultFile::ConcretePrivateKey.scope(), Scope::AdsPrivate);
        assert_eq!(VaultFile::PublicKey.scope(), Scope::Shared);
        assert_eq!(VaultFile::ServerKey.scope(), Scope::Shared);
        assert!(VaultFile::ClientKey.scope().is_private());
        assert!(!VaultFile::WeightAvg.scope().is_private());
    }

    #[test]
    fn test_static_decrypt_kinds() {
        assert_eq!(
            VaultFile::WeightAvg.decrypt_kind(),
            Some(DecryptKind::Scalar(UintKind::U16))
        );
        assert_eq!(
            VaultFile::SleepScore.decrypt_kind(),
            Some(DecryptKind::Scalar(UintKind::U8))
        );
        assert_eq!(VaultFile::WeightList.decrypt_kind(), Some(DecryptKind::Array));
        assert_eq!(VaultFile::SleepList.decrypt_kind(), Some(DecryptKind::CipherTextList));
        assert_eq!(VaultFile::ClientKey.decrypt_kind(), None);
    }

    #[test]
    fn test_suffix_validation() {
        for ok in ["25-03-2025", "25-09-2024_25-03-2025", "v2.1", "a b"] {
            assert!(is_valid_suffix(ok), "{ok}");
        }
        for bad in ["x/../../health-private/v12/stolen", "..", "a\\b", "a\0b", "../x", "a/b"] {
            assert!(!is_valid_suffix(bad), "{bad:?}");
        }
    }

    #[test]
    fn test_date_suffixes() {
        let start = NaiveDate::from_ymd_opt(2024, 9, 25).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 25).unwrap();

        assert_eq!(day_suffix(end), "25-03-2025");
        assert_eq!(parse_day_suffix("25-03-2025"), Some(end));

        let interval = interval_suffix(start, end);
        assert_eq!(interval, "25-09-2024_25-03-2025");
        assert_eq!(parse_interval_suffix(&interval), Some((start, end)));
        assert_eq!(parse_interval_suffix("garbage"), None);
    }
}
