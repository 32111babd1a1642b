//! Field elements and the canonical field encoding of keys and values

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, SmtError};

/// Bytes in the big-endian encoding of a field element
pub const FIELD_BYTES: usize = 32;

/// Bits a field element may occupy. The two top bits of the encoding are always clear.
pub const FIELD_BITS: usize = 254;

/// Bytes of payload packed into one field element when encoding byte strings
const BYTES_PER_FIELD: usize = 31;

/// A field element, stored big-endian
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Field([u8; FIELD_BYTES]);

impl Field {
    pub const ZERO: Field = Field([0u8; FIELD_BYTES]);

    pub const fn from_u64(value: u64) -> Self {
        let be = value.to_be_bytes();
        let mut bytes = [0u8; FIELD_BYTES];
        let mut i = 0;
        while i < 8 {
            bytes[FIELD_BYTES - 8 + i] = be[i];
            i += 1;
        }
        Self(bytes)
    }

    pub const fn from_u128(value: u128) -> Self {
        let be = value.to_be_bytes();
        let mut bytes = [0u8; FIELD_BYTES];
        let mut i = 0;
        while i < 16 {
            bytes[FIELD_BYTES - 16 + i] = be[i];
            i += 1;
        }
        Self(bytes)
    }

    /// Parse a big-endian encoding, rejecting values wider than [`FIELD_BITS`]
    pub fn from_bytes_be(bytes: [u8; FIELD_BYTES]) -> Result<Self> {
        let field = Self(bytes);
        if !field.fits_in_bits(FIELD_BITS) {
            return Err(SmtError::FieldOverflow);
        }
        Ok(field)
    }

    /// Truncate a digest into the field by clearing the bits above [`FIELD_BITS`]
    pub(crate) fn from_digest(mut bytes: [u8; FIELD_BYTES]) -> Self {
        bytes[0] &= 0xFF >> (FIELD_BYTES * 8 - FIELD_BITS);
        Self(bytes)
    }

    pub fn to_bytes_be(&self) -> [u8; FIELD_BYTES] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; FIELD_BYTES] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; FIELD_BYTES]
    }

    /// Bit `i` counting from the least significant bit
    pub fn bit(&self, i: usize) -> bool {
        if i >= FIELD_BYTES * 8 {
            return false;
        }
        let byte_index = FIELD_BYTES - 1 - (i / 8);
        let bit_index = i % 8;
        ((self.0[byte_index] >> bit_index) & 1) == 1
    }

    /// Bit `i` of the `width`-bit big-endian decomposition (`i = 0` is the most significant bit)
    pub fn bit_from_msb(&self, i: usize, width: usize) -> bool {
        debug_assert!(i < width);
        self.bit(width - 1 - i)
    }

    /// Big-endian decomposition of the low `width` bits
    pub fn to_bits_be(&self, width: usize) -> Vec<bool> {
        (0..width).map(|i| self.bit_from_msb(i, width)).collect()
    }

    /// True when every bit at position `width` or above is clear
    pub fn fits_in_bits(&self, width: usize) -> bool {
        let total = FIELD_BYTES * 8;
        if width >= total {
            return true;
        }
        let full_bytes = (total - width) / 8;
        if self.0[..full_bytes].iter().any(|b| *b != 0) {
            return false;
        }
        let rem_bits = (total - width) % 8;
        if rem_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem_bits);
        self.0[full_bytes] & mask == 0
    }

    /// The low `width` bits, every higher bit cleared
    pub fn low_bits(&self, width: usize) -> Field {
        let total = FIELD_BYTES * 8;
        if width >= total {
            return *self;
        }
        let mut bytes = self.0;
        let full_bytes = (total - width) / 8;
        bytes[..full_bytes].fill(0);
        let rem_bits = (total - width) % 8;
        if rem_bits != 0 {
            bytes[full_bytes] &= 0xFF >> rem_bits;
        }
        Field(bytes)
    }
}

impl From<u64> for Field {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<u32> for Field {
    fn from(value: u32) -> Self {
        Self::from_u64(u64::from(value))
    }
}

impl From<u128> for Field {
    fn from(value: u128) -> Self {
        Self::from_u128(value)
    }
}

impl From<bool> for Field {
    fn from(value: bool) -> Self {
        Self::from_u64(u64::from(value))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field({self})")
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            let digits = text.strip_prefix("0x").unwrap_or(&text);
            let decoded = hex::decode(digits).map_err(de::Error::custom)?;
            <[u8; FIELD_BYTES]>::try_from(decoded.as_slice())
                .map_err(|_| de::Error::invalid_length(decoded.len(), &"32 bytes"))?
        } else {
            <[u8; FIELD_BYTES]>::deserialize(deserializer)?
        };
        Field::from_bytes_be(bytes).map_err(de::Error::custom)
    }
}

/// Canonical, deterministic encoding of a key or value into field elements.
///
/// The encoding is what the tree hashes, and when value hashing is disabled a value must encode to
/// exactly one element, which is then committed as-is.
pub trait ToFields {
    fn to_fields(&self) -> Vec<Field>;
}

impl ToFields for Field {
    fn to_fields(&self) -> Vec<Field> {
        vec![*self]
    }
}

impl ToFields for u64 {
    fn to_fields(&self) -> Vec<Field> {
        vec![Field::from_u64(*self)]
    }
}

impl ToFields for u32 {
    fn to_fields(&self) -> Vec<Field> {
        vec![Field::from(*self)]
    }
}

impl ToFields for bool {
    fn to_fields(&self) -> Vec<Field> {
        vec![Field::from(*self)]
    }
}

impl ToFields for [Field] {
    fn to_fields(&self) -> Vec<Field> {
        self.to_vec()
    }
}

impl ToFields for Vec<Field> {
    fn to_fields(&self) -> Vec<Field> {
        self.clone()
    }
}

impl<const N: usize> ToFields for [Field; N] {
    fn to_fields(&self) -> Vec<Field> {
        self.to_vec()
    }
}

// Length prefix first so that trailing zero bytes stay significant.
impl ToFields for [u8] {
    fn to_fields(&self) -> Vec<Field> {
        let mut fields = Vec::with_capacity(1 + self.len().div_ceil(BYTES_PER_FIELD));
        fields.push(Field::from_u64(self.len() as u64));
        for chunk in self.chunks(BYTES_PER_FIELD) {
            let mut bytes = [0u8; FIELD_BYTES];
            bytes[FIELD_BYTES - chunk.len()..].copy_from_slice(chunk);
            fields.push(Field(bytes));
        }
        fields
    }
}

impl ToFields for Vec<u8> {
    fn to_fields(&self) -> Vec<Field> {
        self.as_slice().to_fields()
    }
}

impl ToFields for str {
    fn to_fields(&self) -> Vec<Field> {
        self.as_bytes().to_fields()
    }
}

impl ToFields for String {
    fn to_fields(&self) -> Vec<Field> {
        self.as_bytes().to_fields()
    }
}
