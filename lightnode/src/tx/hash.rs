// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The derived hash family. Every hash here is a pure function of its
//! inputs; the resolver recomputes all of them and rejects submissions whose
//! caller-supplied values disagree.

use super::{Selector, TxInput, Version};
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use sha2::{Digest, Sha256};

/// Payload hash: keccak over the pre-encoded contract argument bytes.
pub fn phash(payload_value: &[u8]) -> H256 {
    H256::from(keccak256(payload_value))
}

/// Selector hash, used as a domain separator inside `ghash`.
pub fn shash(selector: Selector) -> H256 {
    H256::from(keccak256(selector.to_string().as_bytes()))
}

/// Gateway hash: binds payload, selector, recipient and nonce together.
pub fn ghash(phash: H256, shash: H256, to_decoded: &[u8], nonce: H256) -> H256 {
    let mut buf = Vec::with_capacity(32 + 32 + to_decoded.len() + 32);
    buf.extend_from_slice(phash.as_bytes());
    buf.extend_from_slice(shash.as_bytes());
    buf.extend_from_slice(to_decoded);
    buf.extend_from_slice(nonce.as_bytes());
    H256::from(keccak256(buf))
}

/// Nonce hash: binds the nonce to the funding transaction it spends.
pub fn nhash(nonce: H256, txid: &[u8], txindex: u32) -> H256 {
    let mut buf = Vec::with_capacity(32 + txid.len() + 4);
    buf.extend_from_slice(nonce.as_bytes());
    buf.extend_from_slice(txid);
    buf.extend_from_slice(&txindex.to_be_bytes());
    H256::from(keccak256(buf))
}

/// The message the darknodes sign for a shift-in.
pub fn sighash(ghash: H256, nhash: H256, amount: U256, to_decoded: &[u8]) -> H256 {
    let mut amount_be = [0u8; 32];
    amount.to_big_endian(&mut amount_be);
    let mut buf = Vec::with_capacity(32 + 32 + 32 + to_decoded.len());
    buf.extend_from_slice(ghash.as_bytes());
    buf.extend_from_slice(nhash.as_bytes());
    buf.extend_from_slice(&amount_be);
    buf.extend_from_slice(to_decoded);
    H256::from(keccak256(buf))
}

/// Content address of a transaction: SHA-256 over a length-framed encoding
/// of (version, selector, input). Equal hashes imply equal selector and
/// input.
pub fn tx_hash(version: Version, selector: Selector, input: &TxInput) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update([version.as_u8()]);
    frame(&mut hasher, selector.to_string().as_bytes());
    frame(&mut hasher, &input.txid);
    hasher.update(input.txindex.to_be_bytes());
    let mut amount_be = [0u8; 32];
    input.amount.to_big_endian(&mut amount_be);
    hasher.update(amount_be);
    frame(&mut hasher, &input.payload.abi);
    frame(&mut hasher, &input.payload.value);
    frame(&mut hasher, input.payload.func.as_bytes());
    hasher.update(input.phash.as_bytes());
    frame(&mut hasher, input.to.as_bytes());
    hasher.update(input.nonce.as_bytes());
    hasher.update(input.nhash.as_bytes());
    frame(&mut hasher, &input.gpubkey);
    hasher.update(input.ghash.as_bytes());
    H256::from_slice(&hasher.finalize())
}

/// The identifier legacy clients computed for a burn before the current
/// content addressing existed. Kept so old clients can still look their
/// transactions up through the cache mapping.
pub fn legacy_burn_hash(selector: Selector, nonce: U256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(format!("txHash_{selector}_{nonce}").as_bytes());
    H256::from_slice(&hasher.finalize())
}

fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Big-endian 32-byte form of a u64 nonce.
pub fn nonce_bytes(nonce: u64) -> H256 {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&nonce.to_be_bytes());
    H256::from(out)
}
