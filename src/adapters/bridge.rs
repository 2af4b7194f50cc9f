//! Byte-buffer bridge between host memory and the capability library's
//! raw-buffer convention (`pointer`, `length`, `destructor`).
//!
//! A [`ForeignBuffer`] owns exactly one allocation and releases it exactly once,
//! in `Drop`. The raw pointer never leaves the wrapper, so double release and
//! use after release cannot be expressed.
//!
//! Every serialize/deserialize path of keys and ciphertexts goes through
//! [`serialize`] / [`deserialize`], which pin the bincode options used on both
//! sides of the wire.

use std::ffi::c_int;
use std::ptr::NonNull;

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroize;

/// Release function bound to one allocation. Returns 0 on success.
pub type Destructor = unsafe extern "C" fn(pointer: *mut u8, length: usize) -> c_int;

/// Raw buffer as laid out by the capability library.
#[repr(C)]
struct RawBuffer {
    pointer: NonNull<u8>,
    length: usize,
    destructor: Destructor,
}

/// Owning handle to a foreign-convention byte buffer.
pub struct ForeignBuffer {
    raw: RawBuffer,
}

// The buffer is uniquely owned; nothing else holds the pointer.
unsafe impl Send for ForeignBuffer {}
unsafe impl Sync for ForeignBuffer {}

/// Release a buffer allocated by [`ForeignBuffer::from_vec`].
///
/// The contents are wiped before the memory is returned to the allocator.
unsafe extern "C" fn release_boxed(pointer: *mut u8, length: usize) -> c_int {
    if pointer.is_null() {
        return 1;
    }
    let slice = std::ptr::slice_from_raw_parts_mut(pointer, length);
    let mut boxed = Box::from_raw(slice);
    boxed.zeroize();
    drop(boxed);
    0
}

impl ForeignBuffer {
    /// Allocate a foreign-owned buffer and copy `bytes` into it.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Hand an existing allocation over to the foreign convention.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let length = boxed.len();
        let pointer = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self {
            raw: RawBuffer {
                pointer,
                length,
                destructor: release_boxed,
            },
        }
    }

    /// Take ownership of a buffer produced by foreign code.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    /// `pointer` must be valid for reads of `length` bytes until `destructor`
    /// is called, and `destructor` must be the release function bound to this
    /// allocation. Ownership moves into the returned value; the caller must not
    /// release the buffer itself.
    pub unsafe fn from_raw_parts(
        pointer: *mut u8,
        length: usize,
        destructor: Destructor,
    ) -> Option<Self> {
        NonNull::new(pointer).map(|pointer| Self {
            raw: RawBuffer {
                pointer,
                length,
                destructor,
            },
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.length == 0
    }

    /// Borrow the contents without copying.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the pointer is valid for `length` bytes until `Drop`, which
        // cannot run while this borrow is alive.
        unsafe { std::slice::from_raw_parts(self.raw.pointer.as_ptr(), self.raw.length) }
    }

    /// Copy the contents out and release the buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for ForeignBuffer {
    fn drop(&mut self) {
        // SAFETY: constructors guarantee `destructor` is bound to this
        // allocation, and `drop` runs at most once.
        let rc = unsafe { (self.raw.destructor)(self.raw.pointer.as_ptr(), self.raw.length) };
        if rc != 0 {
            tracing::warn!("Foreign buffer release returned {rc}");
        }
    }
}

impl std::fmt::Debug for ForeignBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignBuffer")
            .field("length", &self.raw.length)
            .finish_non_exhaustive()
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Serialize a capability-library value into a foreign buffer.
///
/// # Errors
/// Returns the bincode error if serialization fails.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<ForeignBuffer, bincode::Error> {
    options().serialize(value).map(ForeignBuffer::from_vec)
}

/// Deserialize a capability-library value, rejecting trailing bytes.
///
/// # Errors
/// Returns the bincode error on truncated, corrupt or oversized input.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    options().deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RELEASES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_release(pointer: *mut u8, length: usize) -> c_int {
        RELEASES.fetch_add(1, Ordering::SeqCst);
        release_boxed(pointer, length)
    }

    #[test]
    fn test_copy_in_copy_out() {
        let buffer = ForeignBuffer::from_slice(b"ciphertext");
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.as_slice(), b"ciphertext");
        assert_eq!(buffer.into_vec(), b"ciphertext".to_vec());
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ForeignBuffer::from_slice(&[]);
        assert!(buffer.is_empty());
        assert!(buffer.into_vec().is_empty());
    }

    #[test]
    fn test_release_runs_exactly_once() {
        let boxed = vec![7u8; 32].into_boxed_slice();
        let length = boxed.len();
        let pointer = Box::leak(boxed).as_mut_ptr();

        let before = RELEASES.load(Ordering::SeqCst);
        let buffer = unsafe { ForeignBuffer::from_raw_parts(pointer, length, counting_release) }
            .expect("non-null");
        assert_eq!(buffer.as_slice(), &[7u8; 32]);
        let copied = buffer.into_vec();
        assert_eq!(copied.len(), 32);
        assert_eq!(RELEASES.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_null_pointer_rejected() {
        let buffer =
            unsafe { ForeignBuffer::from_raw_parts(std::ptr::null_mut(), 0, counting_release) };
        assert!(buffer.is_none());
    }

    #[test]
    fn test_strict_decode_rejects_trailing_bytes() {
        let encoded = serialize(&(1u16, 2u32)).expect("encode").into_vec();
        let decoded: (u16, u32) = deserialize(&encoded).expect("decode");
        assert_eq!(decoded, (1, 2));

        let mut padded = encoded.clone();
        padded.push(0);
        assert!(deserialize::<(u16, u32)>(&padded).is_err());
        assert!(deserialize::<(u16, u32)>(&encoded[..3]).is_err());
    }

    #[test]
    fn test_fixint_layout_matches_plain_bincode() {
        let value = vec![300u32, 1, 65_536];
        let strict = serialize(&value).expect("encode").into_vec();
        let plain = bincode::serialize(&value).expect("encode");
        assert_eq!(strict, plain);
    }
}
