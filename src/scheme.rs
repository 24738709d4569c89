//! Codec and hash boundary between the storage layer and opaque key/value types.
//!
//! The map and sequence never know how keys and values are represented on the wire;
//! they call into a [`MapScheme`] or [`SeqScheme`] implementation for encoding,
//! decoding, hashing, and equality. Bundling these into one associated-type trait per
//! container keeps call sites to a single type parameter instead of four or five loose
//! generics.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::Result;

/// Everything a [`crate::map::PersistentMap`] needs to know about its key and value
/// types.
pub trait MapScheme {
    /// The map's key type.
    type Key;
    /// The map's value type.
    type Value;

    /// Encodes a key to its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if encoding fails.
    fn encode_key(key: &Self::Key) -> Result<Vec<u8>>;

    /// Decodes a key from its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if decoding fails.
    fn decode_key(bytes: &[u8]) -> Result<Self::Key>;

    /// Encodes a value to its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if encoding fails.
    fn encode_value(value: &Self::Value) -> Result<Vec<u8>>;

    /// Decodes a value from its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if decoding fails.
    fn decode_value(bytes: &[u8]) -> Result<Self::Value>;

    /// Hashes a key to the signed word stored in the index.
    fn hash_key(key: &Self::Key) -> i64;

    /// Compares two keys for logical equality (not byte equality of their encodings).
    fn keys_equal(a: &Self::Key, b: &Self::Key) -> bool;
}

/// Everything a [`crate::sequence::PersistentSequence`] needs to know about its value
/// type.
pub trait SeqScheme {
    /// The sequence's element type.
    type Value;

    /// Encodes a value to its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if encoding fails.
    fn encode(value: &Self::Value) -> Result<Vec<u8>>;

    /// Decodes a value from its on-disk byte representation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::CodecError`] if decoding fails.
    fn decode(bytes: &[u8]) -> Result<Self::Value>;
}

/// Default scheme: keys and values are raw byte vectors, encoded with the identity
/// codec and hashed with `rustc_hash`'s `FxHasher`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesScheme;

impl MapScheme for BytesScheme {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn encode_key(key: &Self::Key) -> Result<Vec<u8>> {
        Ok(key.clone())
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Key> {
        Ok(bytes.to_vec())
    }

    fn encode_value(value: &Self::Value) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode_value(bytes: &[u8]) -> Result<Self::Value> {
        Ok(bytes.to_vec())
    }

    fn hash_key(key: &Self::Key) -> i64 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish() as i64
    }

    fn keys_equal(a: &Self::Key, b: &Self::Key) -> bool {
        a == b
    }
}

impl SeqScheme for BytesScheme {
    type Value = Vec<u8>;

    fn encode(value: &Self::Value) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self::Value> {
        Ok(bytes.to_vec())
    }
}

/// A scheme over arbitrary `serde`-typed keys and values, encoded with `bincode` and
/// hashed by deriving a stable hash from the typed key via `FxHasher`.
///
/// # Errors
///
/// Construction has no fallible state; `encode`/`decode` surface `bincode` failures as
/// [`crate::error::Error::CodecError`].
pub struct BincodeScheme<K, V> {
    _key: PhantomData<K>,
    _value: PhantomData<V>,
}

impl<K, V> MapScheme for BincodeScheme<K, V>
where
    K: Hash + Eq + serde::Serialize + serde::de::DeserializeOwned,
    V: serde::Serialize + serde::de::DeserializeOwned,
{
    type Key = K;
    type Value = V;

    fn encode_key(key: &Self::Key) -> Result<Vec<u8>> {
        bincode::serialize(key).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }

    fn decode_key(bytes: &[u8]) -> Result<Self::Key> {
        bincode::deserialize(bytes).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }

    fn encode_value(value: &Self::Value) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }

    fn decode_value(bytes: &[u8]) -> Result<Self::Value> {
        bincode::deserialize(bytes).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }

    fn hash_key(key: &Self::Key) -> i64 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish() as i64
    }

    fn keys_equal(a: &Self::Key, b: &Self::Key) -> bool {
        a == b
    }
}

impl<K, V> SeqScheme for BincodeScheme<K, V>
where
    V: serde::Serialize + serde::de::DeserializeOwned,
{
    type Value = V;

    fn encode(value: &Self::Value) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self::Value> {
        bincode::deserialize(bytes).map_err(|e| crate::error::Error::CodecError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scheme_round_trips() {
        let v = vec![1u8, 2, 3];
        let encoded = BytesScheme::encode_value(&v).unwrap();
        let decoded = BytesScheme::decode_value(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn bytes_scheme_hash_is_deterministic() {
        let a = vec![1u8, 2, 3];
        let b = vec![1u8, 2, 3];
        assert_eq!(BytesScheme::hash_key(&a), BytesScheme::hash_key(&b));
    }

    #[test]
    fn bincode_scheme_round_trips_typed_values() {
        type Scheme = BincodeScheme<String, i32>;
        let encoded = Scheme::encode_value(&42).unwrap();
        assert_eq!(Scheme::decode_value(&encoded).unwrap(), 42);
        let encoded_key = Scheme::encode_key(&"hello".to_string()).unwrap();
        assert_eq!(Scheme::decode_key(&encoded_key).unwrap(), "hello");
    }
}
