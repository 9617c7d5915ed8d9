//! Serialization support.

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::Error;

/// Encode an arkworks value (point or scalar) in compressed form.
pub(crate) fn to_compressed<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::with_capacity(value.compressed_size());
    value
        .serialize_compressed(&mut bytes)
        .map_err(|_| Error::SerializationError)?;
    Ok(bytes)
}

/// Decode a compressed arkworks value. Points are checked to be on the curve
/// and in the prime-order subgroup.
pub(crate) fn from_compressed<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, Error> {
    T::deserialize_compressed(bytes).map_err(|_| Error::MalformedElement)
}

/// `serde(with = ...)` adapter for arkworks values, hex in human readable
/// formats and raw bytes otherwise.
pub(crate) mod ark_compressed {
    use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
    use serde::{de::Error as _, ser::Error as _};

    pub(crate) fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: CanonicalSerialize,
    {
        let mut bytes = Vec::with_capacity(value.compressed_size());
        value
            .serialize_compressed(&mut bytes)
            .map_err(S::Error::custom)?;
        serdect::slice::serialize_hex_lower_or_bin(&bytes, serializer)
    }

    pub(crate) fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: CanonicalDeserialize,
    {
        let bytes = serdect::slice::deserialize_hex_or_bin_vec(deserializer)?;
        T::deserialize_compressed(&bytes[..]).map_err(D::Error::custom)
    }
}
