//! Fixed-size BLS key and signature byte wrappers.
//!
//! These carry bytes only; the `tbls` crate owns the actual curve operations.

use std::fmt;
use std::str::FromStr;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tree_hash::{Hash256, PackedEncoding, TreeHash, TreeHashType};

/// A compressed BLS12-381 public key. Used both for group public keys (what
/// the beacon chain sees) and public shares (what one validator client sees).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey(pub [u8; 48]);

/// A compressed BLS12-381 signature. Partial and group signatures share the
/// representation; only the key they verify against differs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 96]);

impl PubKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let arr: [u8; 48] = bytes
            .try_into()
            .map_err(|_| format!("invalid public key length {}", bytes.len()))?;
        Ok(PubKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 48] {
        &self.0
    }

    /// Short hex form used in log fields.
    pub fn short(&self) -> String {
        format!("0x{}", hex::encode(&self.0[..3]))
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let arr: [u8; 96] = bytes
            .try_into()
            .map_err(|_| format!("invalid signature length {}", bytes.len()))?;
        Ok(Signature(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 96] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature([0; 96])
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.short())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(&self.0[..4]))
    }
}

impl FromStr for PubKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").ok_or("public key must be 0x-prefixed")?;
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
        PubKey::from_bytes(&bytes)
    }
}

impl FromStr for Signature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").ok_or("signature must be 0x-prefixed")?;
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
        Signature::from_bytes(&bytes)
    }
}

// Human-readable formats get 0x-hex strings (beacon REST JSON); binary
// formats get the raw fixed-size bytes without a length prefix.
macro_rules! impl_fixed_bytes_serde {
    ($type:ident, $len:expr) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_string())
                } else {
                    let mut tuple = serializer.serialize_tuple($len)?;
                    for byte in self.0 {
                        tuple.serialize_element(&byte)?;
                    }
                    tuple.end()
                }
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                } else {
                    struct ArrayVisitor;

                    impl<'de> Visitor<'de> for ArrayVisitor {
                        type Value = [u8; $len];

                        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                            write!(formatter, "{} bytes", $len)
                        }

                        fn visit_seq<A: SeqAccess<'de>>(
                            self,
                            mut seq: A,
                        ) -> Result<Self::Value, A::Error> {
                            let mut arr = [0u8; $len];
                            for (i, byte) in arr.iter_mut().enumerate() {
                                *byte = seq
                                    .next_element()?
                                    .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                            }
                            Ok(arr)
                        }
                    }

                    let arr = deserializer.deserialize_tuple($len, ArrayVisitor)?;
                    Ok($type(arr))
                }
            }
        }

        impl TreeHash for $type {
            fn tree_hash_type() -> TreeHashType {
                TreeHashType::Vector
            }

            fn tree_hash_packed_encoding(&self) -> PackedEncoding {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_packing_factor() -> usize {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_root(&self) -> Hash256 {
                tree_hash::merkle_root(&self.0, 0)
            }
        }
    };
}

impl_fixed_bytes_serde!(PubKey, 48);
impl_fixed_bytes_serde!(Signature, 96);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_hex_round_trip() {
        let pubkey = PubKey([7; 48]);
        let parsed: PubKey = pubkey.to_string().parse().unwrap();
        assert_eq!(pubkey, parsed);
    }

    #[test]
    fn pubkey_rejects_bad_lengths() {
        assert!("0x0102".parse::<PubKey>().is_err());
        assert!("0102".parse::<PubKey>().is_err());
    }

    #[test]
    fn json_uses_hex_strings() {
        let sig = Signature([0xab; 96]);
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.starts_with("\"0xabab"));
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn bincode_round_trip() {
        let pubkey = PubKey([9; 48]);
        let encoded = bincode::serialize(&pubkey).unwrap();
        assert_eq!(encoded.len(), 48);
        let back: PubKey = bincode::deserialize(&encoded).unwrap();
        assert_eq!(pubkey, back);
    }
}
