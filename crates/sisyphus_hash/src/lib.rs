//! The Hasher: a pure, side-effect-free structural fingerprint over the
//! value shapes recipes build jobs out of (primitives, containers, paths,
//! jobs, variables, opaque blobs).
//!
//! The output of [`Fingerprint::fingerprint`] never changes for a given
//! abstract value across releases of this crate — that stability contract
//! is what makes deduplication and incremental re-execution safe across
//! process restarts and machines. Don't change an encoding here without
//! accepting that it invalidates every on-disk work directory.

mod ctx;
mod digest;
mod error;
mod value;

pub use ctx::HashCtx;
pub use digest::Digest;
pub use error::HashError;
pub use value::{opaque, record, Bytes, Fingerprint};

use base64::Engine as _;
use sha2::{Digest as _, Sha256};

/// Hash an arbitrary fingerprintable value to its [`Digest`].
///
/// This is the entry point the rest of the system calls; it owns the
/// (empty) cycle-detection context so callers never need to think about it
/// for a single top-level value.
pub fn hash<T: Fingerprint + ?Sized>(value: &T) -> Result<Digest, HashError> {
    let mut ctx = HashCtx::new();
    value.fingerprint(&mut ctx)
}

/// SHA-256 over an already-canonicalized byte buffer, base64url-encoded
/// (no padding).
///
/// This is the outer digest used for the sisyphus-id itself (`spec.md §3`):
/// `SHA-256(ClassName, kept_input_arguments)`. It is deliberately a
/// different algorithm from the BLAKE3 used internally by [`Fingerprint`]
/// to build up structural digests — the sisyphus-id is the stable,
/// externally-visible identity people see in directory names, while the
/// internal digest is an implementation detail optimized for speed over
/// deeply nested recipe values.
pub fn sha256_base64url(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_pure() {
        let a = hash(&("CountVocab", vec![1u64, 2, 3])).unwrap();
        let b = hash(&("CountVocab", vec![1u64, 2, 3])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_distinguishes_order_in_sequences() {
        let a = hash(&vec![1u64, 2, 3]).unwrap();
        let b = hash(&vec![3u64, 2, 1]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_base64url_is_stable_and_url_safe() {
        let out = sha256_base64url(b"hello");
        assert_eq!(out, sha256_base64url(b"hello"));
        assert!(!out.contains('+'));
        assert!(!out.contains('/'));
        assert!(!out.contains('='));
    }
}
