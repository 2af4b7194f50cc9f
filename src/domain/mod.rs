//! Domain layer: Core types shared by the client and compute sides.
//!
//! Nothing in here touches the FHE capability library, the filesystem or the
//! network. All types are plain data with strict validation.

mod crypto;
mod files;
mod health;
pub mod kdf;
mod task;

pub use crypto::{fingerprint, CryptoError, Persist, UintKind};
pub use files::{
    day_suffix, interval_suffix, is_valid_suffix, parse_day_suffix, parse_interval_suffix, DecryptKind, Scope,
    VaultFile,
};
pub use health::{
    scale_weight, unscale_weight, SleepLevel, SleepQuality, SleepSample, WEIGHT_SCALE,
};
pub use task::{
    body_status, classify_body, MissingStatusPolicy, ResultShape, StatsWire, StatusClass,
    StatusReport, TaskFamily, TaskId, TaskOutput, TaskStatus, Uid,
};
