use hex::{FromHex, ToHex};
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::{H160, H256};
use serde::{
    de::{self, Deserialize, Deserializer, Visitor},
    Serialize, Serializer,
};
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// 20-byte account identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Addr(H160);

/// 32-byte hash (keccak256 everywhere in this crate).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Hash(H256);

/// Arbitrary byte string (code blobs, serialized records).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes(Vec<u8>);

pub type Gas = u64;

// Addr

impl Addr {
    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Addr> = OnceCell::new();
        V.get_or_init(|| U256::zero().into())
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H160::from_slice(s))
    }
}

impl From<U256> for Addr {
    fn from(u: U256) -> Self {
        let mut bytes: [u8; 32] = Default::default();
        u.to_big_endian(&mut bytes);
        Self::from_slice(&bytes[12..])
    }
}

impl From<[u8; 20]> for Addr {
    fn from(bytes: [u8; 20]) -> Self {
        Self(H160(bytes))
    }
}

impl FromStr for Addr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H160::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self.as_bytes()), serializer)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bytes = deserializer.deserialize_identifier(BytesVisitor)?.0;
        if bytes.len() != 20 {
            return Err(D::Error::invalid_length(
                bytes.len(),
                &"length of 20 bytes",
            ))
        }
        Ok(Addr::from_slice(&bytes))
    }
}

// U256

impl From<Hash> for U256 {
    fn from(hash: Hash) -> Self {
        U256::from_big_endian(hash.as_bytes())
    }
}

impl From<Addr> for U256 {
    fn from(addr: Addr) -> Self {
        U256::from_big_endian(addr.as_bytes())
    }
}

/// Two's-complement negation at the 256-bit boundary, so a subtraction can
/// be routed through the same wrap-around addition path as an increase.
#[inline(always)]
pub fn u256_neg(x: &U256) -> U256 {
    U256::zero().overflowing_sub(*x).0
}

// Hash

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak256::digest(slice).as_slice())
    }

    /// keccak256 of the zero-length string; the code hash of every plain
    /// (non-contract) account.
    #[inline(always)]
    pub fn empty_bytes_hash() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| {
            let hasher = sha3::Keccak256::new();
            Self::from_slice(hasher.finalize().as_slice())
        })
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }

    #[inline]
    pub fn to_fixed_bytes(&self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl From<U256> for Hash {
    fn from(u: U256) -> Self {
        let mut bytes: [u8; 32] = Default::default();
        u.to_big_endian(&mut bytes);
        Self::from_slice(&bytes)
    }
}

impl FromStr for Hash {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self.as_bytes()), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bytes = deserializer.deserialize_identifier(BytesVisitor)?.0;
        if bytes.len() != 32 {
            return Err(D::Error::invalid_length(
                bytes.len(),
                &"length of 32 bytes",
            ))
        }
        Ok(Hash::from_slice(&bytes))
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

impl Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self), serializer)
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_identifier(BytesVisitor)
    }
}

pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl<'a> Serialize for BytesRef<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self))
    }
}

pub struct BytesVisitor;
impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Bytes;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("starts with `0x` and has even number of hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<Bytes, E>
    where
        E: de::Error,
    {
        if value.len() < 2 {
            return Err(de::Error::invalid_length(value.len(), &self))
        }
        let bytes = value.as_bytes();
        if bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
            match Vec::from_hex(&value[2..]) {
                Ok(v) => Ok(v.into()),
                Err(_) => Err(de::Error::invalid_value(
                    de::Unexpected::Str(value),
                    &self,
                )),
            }
        } else {
            Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }
}

pub struct U256Visitor;

impl<'de> Visitor<'de> for U256Visitor {
    type Value = U256;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("a string that starts with `0x` and has 64 hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<U256, E>
    where
        E: de::Error,
    {
        U256::from_str(value).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(value), &self)
        })
    }
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let leading_empty_bytes = $size * 8 - (self.0.bits() + 7) / 8;
                let mut buffer = [0u8; $size * 8];
                self.0.to_big_endian(&mut buffer);
                s.encoder().encode_value(&buffer[leading_empty_bytes..]);
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    if !bytes.is_empty() && bytes[0] == 0 {
                        Err(rlp::DecoderError::RlpInvalidIndirection)
                    } else if bytes.len() <= $size * 8 {
                        Ok($wrapper_name($name::from(bytes)))
                    } else {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                })
            }
        }
    };
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_fixed_hash_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                s.encoder().encode_value(self.0.as_ref());
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    match bytes.len().cmp(&$size) {
                        core::cmp::Ordering::Less => {
                            Err(rlp::DecoderError::RlpIsTooShort)
                        }
                        core::cmp::Ordering::Greater => {
                            Err(rlp::DecoderError::RlpIsTooBig)
                        }
                        core::cmp::Ordering::Equal => {
                            let mut t = [0u8; $size];
                            t.copy_from_slice(bytes);
                            Ok($wrapper_name($name(t)))
                        }
                    }
                })
            }
        }
    };
}

/// RLP view of a [U256]: big-endian with leading zeroes stripped.
#[derive(Debug)]
pub struct U256RLP(pub U256);
impl_wrapped_uint_rlp!(U256, U256RLP, 4);
impl_wrapped_fixed_hash_rlp!(H160, Addr, 20);
impl_wrapped_fixed_hash_rlp!(H256, Hash, 32);

#[test]
fn test_u256_neg() {
    let a = U256::from(700u64);
    let b = a.overflowing_add(u256_neg(&U256::from(300u64))).0;
    assert_eq!(b, U256::from(400u64));
    assert_eq!(u256_neg(&U256::zero()), U256::zero());
}

#[test]
fn test_u256_rlp_roundtrip() {
    for v in [0u64, 1, 255, 256, u64::MAX] {
        let enc = rlp::encode(&U256RLP(v.into()));
        let dec: U256RLP = rlp::decode(&enc).unwrap();
        assert_eq!(dec.0, U256::from(v));
    }
}

#[test]
fn test_empty_bytes_hash() {
    // keccak256("")
    assert_eq!(
        Hash::empty_bytes_hash(),
        &Hash::from_str(
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        )
        .unwrap()
    );
}
