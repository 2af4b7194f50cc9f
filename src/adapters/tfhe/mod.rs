//! TFHE adapter: key roles, ciphertexts and homomorphic operations on tfhe-rs.
//!
//! This module provides FHE operations using Zama's tfhe-rs library.
//!
//! # Key roles
//!
//! - [`PrivateKey`] wraps a `ClientKey`: decrypts, and derives the other two.
//! - [`PublicKey`] wraps a `CompactPublicKey`: encrypts scalars and batches.
//! - [`ComputeKey`] wraps a `CompressedServerKey`: uploaded to the compute
//!   side, decompressed into a [`ComputeContext`] only when activated.
//!
//! # Thread Safety
//!
//! **IMPORTANT**: `tfhe::set_server_key()` writes to a *thread-local* (TLS) global.
//!
//! Homomorphic operations are methods on [`ComputeContext`], which sets the
//! server key per operation and scopes it to the current thread via an RAII
//! guard. This prevents key "leakage" into later work executed on the same
//! thread and avoids cross-request key confusion in thread pools, as long as
//! each operation runs to completion without async yields.
//!
//! # Serialization
//!
//! All handles serialize through [`crate::adapters::bridge`] (bincode, fixed
//! integer encoding, trailing bytes rejected), which is byte-compatible with
//! plain `bincode::serialize` on the compute service.

mod batch;
mod ciphertext;
mod compute;
mod keys;

pub use batch::{BatchBuilder, CompactBatch};
pub use ciphertext::{Ciphertext, EncryptionKey};
pub use compute::{ComputeContext, ComputeKeySlot, Stats};
pub use keys::{ComputeKey, PrivateKey, PublicKey};

/// One key set per test binary; generating a compute key takes seconds.
#[cfg(test)]
pub(crate) mod test_keys {
    use std::sync::OnceLock;

    use super::{ComputeContext, ComputeKey, PrivateKey, PublicKey};

    pub(crate) struct TestKeys {
        pub private: PrivateKey,
        pub public: PublicKey,
        pub compute: ComputeKey,
    }

    pub(crate) fn get() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| {
            let private = PrivateKey::generate().expect("generate private key");
            let public = PublicKey::derive(&private).expect("derive public key");
            let compute = ComputeKey::derive(&private).expect("derive compute key");
            TestKeys {
                private,
                public,
                compute,
            }
        })
    }

    pub(crate) fn context() -> &'static ComputeContext {
        static CONTEXT: OnceLock<ComputeContext> = OnceLock::new();
        CONTEXT.get_or_init(|| ComputeContext::activate(&get().compute))
    }
}
