//! Hashing utilities for Merkle leaves and nodes.
//!
//! Leaves and internal nodes follow OpenZeppelin's `StandardMerkleTree` so that a
//! proof produced here verifies with `MerkleProof.verify` on-chain as well as with
//! the offline verifier.

use alloy_primitives::{keccak256 as alloy_keccak256, B256};

use crate::types::OrderId;

/// Compute keccak256 hash of input data.
///
/// This is a re-export of Alloy's keccak256 for convenience.
pub fn keccak256(data: &[u8]) -> B256 {
    alloy_keccak256(data)
}

/// ABI-encode `(uint256 orderId, string digest)`.
///
/// Matches Solidity's `abi.encode(uint256, string)`:
/// - word 0: `orderId`, left-padded to 32 bytes
/// - word 1: offset of the string data (`0x40`)
/// - word 2: string length in bytes
/// - the UTF-8 bytes, right-padded to a multiple of 32
pub fn abi_encode_leaf(order_id: OrderId, digest: &str) -> Vec<u8> {
    let bytes = digest.as_bytes();
    let padded_len = bytes.len().div_ceil(32) * 32;
    let mut data = Vec::with_capacity(96 + padded_len);

    data.extend_from_slice(&u256_word(order_id));
    data.extend_from_slice(&u256_word(0x40));
    data.extend_from_slice(&u256_word(bytes.len() as u64));
    data.extend_from_slice(bytes);
    data.resize(96 + padded_len, 0);

    data
}

/// Compute the leaf hash for an audited order.
///
/// The leaf hash is: `keccak256(keccak256(abi.encode(orderId, digest)))`
///
/// Double hashing keeps a 64-byte leaf preimage from ever being confused with an
/// internal node.
pub fn compute_leaf_hash(order_id: OrderId, digest: &str) -> B256 {
    keccak256(keccak256(&abi_encode_leaf(order_id, digest)).as_slice())
}

/// Compute the internal node hash for two children.
///
/// The pair hash is `keccak256(min(a, b) || max(a, b))`; it is commutative, so
/// proofs need not carry left/right flags.
pub fn hash_pair(a: &B256, b: &B256) -> B256 {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(first.as_slice());
    data[32..].copy_from_slice(second.as_slice());
    keccak256(&data)
}

fn u256_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}
