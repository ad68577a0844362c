use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, U256};

use super::types::{DecodedValue, ValueMetadata, ValueType};

/// Bytes a value of this type occupies inside a slot.
pub fn value_type_width(value_type: ValueType) -> usize {
    match value_type {
        ValueType::Uint8 => 1,
        ValueType::Uint16 => 2,
        ValueType::Uint32 => 4,
        ValueType::Uint48 => 6,
        ValueType::Uint64 => 8,
        ValueType::Uint128 => 16,
        ValueType::Uint256 => 32,
        ValueType::Address => 20,
        ValueType::Bytes32 => 32,
        ValueType::PackedSlot => 32,
    }
}

/// Decode a raw slot value according to its metadata.
///
/// Packed slots are read back-to-front: position 0 is the low-order end of
/// the slot, and each following position takes the trailing bytes of what
/// is left.
pub fn decode(raw: &B256, metadata: &ValueMetadata) -> DecodedValue {
    match metadata.value_type() {
        ValueType::PackedSlot => DecodedValue::Packed(decode_packed(raw, metadata)),
        value_type => DecodedValue::Single(decode_single(raw.as_slice(), value_type)),
    }
}

fn decode_packed(raw: &B256, metadata: &ValueMetadata) -> BTreeMap<usize, String> {
    let mut remaining: &[u8] = raw.as_slice();
    let mut out = BTreeMap::new();

    for (position, value_type) in metadata.packed_types() {
        let width = value_type_width(*value_type);
        let split = remaining.len() - width;
        out.insert(*position, decode_single(&remaining[split..], *value_type));
        remaining = &remaining[..split];
    }

    out
}

/// `bytes` is right-aligned: the value sits in its trailing bytes.
fn decode_single(bytes: &[u8], value_type: ValueType) -> String {
    match value_type {
        ValueType::Uint8
        | ValueType::Uint16
        | ValueType::Uint32
        | ValueType::Uint48
        | ValueType::Uint64
        | ValueType::Uint128
        | ValueType::Uint256 => {
            let width = value_type_width(value_type);
            U256::from_be_slice(&bytes[bytes.len() - width..]).to_string()
        }
        ValueType::Address => {
            Address::from_slice(&bytes[bytes.len() - 20..]).to_checksum(None)
        }
        ValueType::Bytes32 => format!("0x{}", alloy::hex::encode(bytes)),
        ValueType::PackedSlot => unreachable!("nested packed slots are rejected by ValueMetadata"),
    }
}
