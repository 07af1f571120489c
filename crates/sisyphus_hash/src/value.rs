use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::ctx::HashCtx;
use crate::digest::Digest;
use crate::error::HashError;

// Tag bytes distinguishing encoded kinds. Appended before the payload so
// that e.g. the integer `1` and the one-element sequence `[1]` never
// collide, and so that NaN/Infinity get their own reserved tokens instead
// of relying on float formatting accidentally being injective.
mod tag {
    pub const UNIT: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const FLOAT_NAN: u8 = 4;
    pub const FLOAT_INF: u8 = 5;
    pub const FLOAT_NEG_INF: u8 = 6;
    pub const STRING: u8 = 7;
    pub const BYTES: u8 = 8;
    pub const SEQ: u8 = 9;
    pub const SET: u8 = 10;
    pub const MAP: u8 = 11;
    pub const SOME: u8 = 12;
    pub const RECORD: u8 = 13;
    pub const OPAQUE: u8 = 14;
}

fn leaf(tag_byte: u8, payload: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag_byte]);
    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    Digest::from_hasher(hasher)
}

/// A value that can be folded into the Hasher's canonical structural
/// digest.
///
/// Built-in impls cover primitives, strings, `Option`, ordered sequences
/// (`Vec`, slices, arrays, tuples), sets (`HashSet`/`BTreeSet`) and
/// string-keyed maps (`HashMap<String, _>`/`BTreeMap<String, _>`). User
/// recipe types implement this directly (the "visitor protocol" from
/// `spec.md §9`) rather than being guessed at structurally; types that
/// can't reasonably be hashed (e.g. live file handles) simply don't
/// implement it, which is a compile error rather than a silent wrong
/// answer.
pub trait Fingerprint {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError>;
}

impl Fingerprint for () {
    fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
        Ok(leaf(tag::UNIT, &[]))
    }
}

impl Fingerprint for bool {
    fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
        Ok(leaf(tag::BOOL, &[*self as u8]))
    }
}

macro_rules! impl_int_fingerprint {
    ($($t:ty),*) => {
        $(
            impl Fingerprint for $t {
                fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
                    // Decimal text form, per `spec.md §4.A`.
                    Ok(leaf(tag::INT, self.to_string().as_bytes()))
                }
            }
        )*
    };
}

impl_int_fingerprint!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

macro_rules! impl_float_fingerprint {
    ($($t:ty),*) => {
        $(
            impl Fingerprint for $t {
                fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
                    if self.is_nan() {
                        Ok(leaf(tag::FLOAT_NAN, &[]))
                    } else if self.is_infinite() && self.is_sign_positive() {
                        Ok(leaf(tag::FLOAT_INF, &[]))
                    } else if self.is_infinite() {
                        Ok(leaf(tag::FLOAT_NEG_INF, &[]))
                    } else {
                        // Rust's Display for floats is the shortest
                        // round-trip representation, matching the
                        // contract in `spec.md §4.A`.
                        Ok(leaf(tag::FLOAT, self.to_string().as_bytes()))
                    }
                }
            }
        )*
    };
}

impl_float_fingerprint!(f32, f64);

impl Fingerprint for str {
    fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
        Ok(leaf(tag::STRING, self.as_bytes()))
    }
}

impl Fingerprint for String {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        self.as_str().fingerprint(ctx)
    }
}

/// Wrapper marking a byte buffer as an opaque byte-string rather than a
/// UTF-8 string, so the two never hash identically even with equal bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Fingerprint for Bytes {
    fn fingerprint(&self, _ctx: &mut HashCtx) -> Result<Digest, HashError> {
        Ok(leaf(tag::BYTES, &self.0))
    }
}

impl<T: Fingerprint> Fingerprint for Option<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        match self {
            None => Ok(leaf(tag::UNIT, &[])),
            Some(v) => {
                let inner = v.fingerprint(ctx)?;
                Ok(leaf(tag::SOME, inner.as_bytes()))
            }
        }
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for &T {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        (**self).fingerprint(ctx)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Box<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        (**self).fingerprint(ctx)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Arc<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        let addr = Arc::as_ptr(self) as *const () as usize;
        let _guard = ctx.enter(addr, std::any::type_name::<T>())?;
        (**self).fingerprint(ctx)
    }
}

/// Fold an ordered sequence of already-computed element digests into one
/// digest: `SEQ(len, elem_0, elem_1, ...)` from `spec.md §4.A`.
fn sequence_digest(elems: &[Digest]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag::SEQ]);
    hasher.update(&(elems.len() as u64).to_le_bytes());
    for e in elems {
        hasher.update(e.as_bytes());
    }
    Digest::from_hasher(hasher)
}

fn fingerprint_sequence<'a, T, I>(items: I, ctx: &mut HashCtx) -> Result<Digest, HashError>
where
    T: Fingerprint + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut elems = Vec::new();
    for item in items {
        elems.push(item.fingerprint(ctx)?);
    }
    Ok(sequence_digest(&elems))
}

impl<T: Fingerprint> Fingerprint for Vec<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        fingerprint_sequence(self.iter(), ctx)
    }
}

impl<T: Fingerprint> Fingerprint for [T] {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        fingerprint_sequence(self.iter(), ctx)
    }
}

macro_rules! impl_tuple_fingerprint {
    ($($idx:tt => $name:ident),+) => {
        impl<$($name: Fingerprint),+> Fingerprint for ($($name,)+) {
            fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
                let elems = [$(self.$idx.fingerprint(ctx)?),+];
                Ok(sequence_digest(&elems))
            }
        }
    };
}

impl_tuple_fingerprint!(0 => A);
impl_tuple_fingerprint!(0 => A, 1 => B);
impl_tuple_fingerprint!(0 => A, 1 => B, 2 => C);
impl_tuple_fingerprint!(0 => A, 1 => B, 2 => C, 3 => D);

/// Sets encode as the **sorted** sequence of their elements' digests
/// (`spec.md §4.A`): order in memory must never leak into the hash.
fn set_digest(mut elems: Vec<Digest>) -> Digest {
    elems.sort();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag::SET]);
    hasher.update(&(elems.len() as u64).to_le_bytes());
    for e in &elems {
        hasher.update(e.as_bytes());
    }
    Digest::from_hasher(hasher)
}

impl<T: Fingerprint + Eq + std::hash::Hash> Fingerprint for HashSet<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        let mut elems = Vec::with_capacity(self.len());
        for item in self {
            elems.push(item.fingerprint(ctx)?);
        }
        Ok(set_digest(elems))
    }
}

impl<T: Fingerprint + Ord> Fingerprint for BTreeSet<T> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        let mut elems = Vec::with_capacity(self.len());
        for item in self {
            elems.push(item.fingerprint(ctx)?);
        }
        Ok(set_digest(elems))
    }
}

/// Mappings with string keys encode as sorted `(key, hash(value))` pairs
/// (`spec.md §4.A`); tie-break is lexicographic byte ordering of the key.
fn map_digest(mut pairs: Vec<(String, Digest)>) -> Digest {
    pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag::MAP]);
    hasher.update(&(pairs.len() as u64).to_le_bytes());
    for (key, value_digest) in &pairs {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update(value_digest.as_bytes());
    }
    Digest::from_hasher(hasher)
}

impl<V: Fingerprint> Fingerprint for HashMap<String, V> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        let mut pairs = Vec::with_capacity(self.len());
        for (k, v) in self {
            pairs.push((k.clone(), v.fingerprint(ctx)?));
        }
        Ok(map_digest(pairs))
    }
}

impl<V: Fingerprint> Fingerprint for BTreeMap<String, V> {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
        let mut pairs = Vec::with_capacity(self.len());
        for (k, v) in self {
            pairs.push((k.clone(), v.fingerprint(ctx)?));
        }
        Ok(map_digest(pairs))
    }
}

/// Fold a structured record (a user job/argument type) into a digest:
/// the type name, then each named field's digest in source-declaration
/// order. Fields opted out of hashing are simply omitted from `fields` by
/// the caller.
pub fn record(type_name: &str, fields: &[(&str, Digest)]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag::RECORD]);
    hasher.update(&(type_name.len() as u64).to_le_bytes());
    hasher.update(type_name.as_bytes());
    hasher.update(&(fields.len() as u64).to_le_bytes());
    for (name, digest) in fields {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(digest.as_bytes());
    }
    Digest::from_hasher(hasher)
}

/// Fold an already-opaque byte blob (e.g. a precomputed artifact hash) into
/// a digest directly, for callers that have their own stable hash and just
/// need it folded into a parent record.
pub fn opaque(bytes: &[u8]) -> Digest {
    leaf(tag::OPAQUE, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    #[test]
    fn sets_are_order_independent() {
        let a: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let b: HashSet<u64> = [3, 2, 1].into_iter().collect();
        assert_eq!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn maps_are_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), 2u64);
        a.insert("a".to_string(), 1u64);
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), 1u64);
        b.insert("b".to_string(), 2u64);
        assert_eq!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn string_and_bytes_with_same_content_differ() {
        let s = "abc".to_string();
        let b = Bytes(b"abc".to_vec());
        assert_ne!(hash(&s).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn none_and_empty_unit_share_encoding_by_design() {
        // None and () both collapse to the single distinguished byte in
        // `spec.md §4.A`; this is intentional, not a collision bug.
        let none: Option<u64> = None;
        assert_eq!(hash(&none).unwrap(), hash(&()).unwrap());
    }

    #[test]
    fn records_distinguish_type_name() {
        let a = record("A", &[("x", leaf(tag::INT, b"1"))]);
        let b = record("B", &[("x", leaf(tag::INT, b"1"))]);
        assert_ne!(a, b);
    }

    #[test]
    fn nan_is_stable_and_distinct_from_zero() {
        let nan_digest = hash(&f64::NAN).unwrap();
        assert_eq!(nan_digest, hash(&f64::NAN).unwrap());
        assert_ne!(nan_digest, hash(&0.0f64).unwrap());
    }
}
