// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain address codec. The node treats address formats as opaque: it
//! only needs to turn an address string into canonical recipient bytes (for
//! hashing) and to recognize when a legacy client handed us raw payload
//! bytes instead of a string.

use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::Chain;
use ethers::types::Address;
use std::str::FromStr;

pub trait AddressCodec: Send + Sync {
    /// Decode an address string into its canonical byte form.
    fn decode(&self, chain: Chain, addr: &str) -> LightnodeResult<Vec<u8>>;
}

/// Address handling for the supported chains: 0x-hex on contract chains,
/// base58check on the UTXO chains.
pub struct StandardCodec;

impl AddressCodec for StandardCodec {
    fn decode(&self, chain: Chain, addr: &str) -> LightnodeResult<Vec<u8>> {
        match chain {
            Chain::Ethereum | Chain::BinanceSmartChain => {
                let parsed = Address::from_str(addr).map_err(|e| {
                    LightnodeError::InvalidParams(format!("bad {chain} address {addr}: {e}"))
                })?;
                Ok(parsed.as_bytes().to_vec())
            }
            Chain::Bitcoin | Chain::BitcoinCash | Chain::Zcash => bs58::decode(addr)
                .with_check(None)
                .into_vec()
                .map_err(|e| {
                    LightnodeError::InvalidParams(format!("bad {chain} address {addr}: {e}"))
                }),
        }
    }
}

/// Re-encode raw legacy bytes as a base58 string, the fallback the watcher
/// tries when burn log bytes are not a valid address string.
pub fn base58_fallback(raw: &[u8]) -> String {
    bs58::encode(raw).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex_addresses_on_contract_chains() {
        let codec = StandardCodec;
        let raw = codec
            .decode(
                Chain::Ethereum,
                "0x00112233445566778899aabbccddeeff00112233",
            )
            .unwrap();
        assert_eq!(raw.len(), 20);
        assert_eq!(raw[0], 0x00);
        assert_eq!(raw[19], 0x33);

        assert!(codec.decode(Chain::Ethereum, "not-an-address").is_err());
    }

    #[test]
    fn decodes_base58check_on_utxo_chains() {
        let codec = StandardCodec;
        // Version byte 0x00 + 20-byte payload, re-encoded with checksum.
        let payload = {
            let mut p = vec![0u8];
            p.extend_from_slice(&[0x11u8; 20]);
            p
        };
        let addr = bs58::encode(&payload).with_check().into_string();

        let decoded = codec.decode(Chain::Bitcoin, &addr).unwrap();
        assert_eq!(decoded, payload);

        // Flipping a character breaks the checksum.
        let mut corrupted = addr.into_bytes();
        corrupted[3] = if corrupted[3] == b'2' { b'3' } else { b'2' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(codec.decode(Chain::Bitcoin, &corrupted).is_err());
    }

    #[test]
    fn fallback_round_trips_through_base58() {
        let codec = StandardCodec;
        let payload = {
            let mut p = vec![0u8];
            p.extend_from_slice(&[0x42u8; 20]);
            p
        };
        // A legacy client stored the full base58check payload as raw bytes;
        // the fallback re-encoding must produce a decodable address.
        let with_check = bs58::decode(
            bs58::encode(&payload).with_check().into_string().as_str(),
        )
        .into_vec()
        .unwrap();
        let addr = base58_fallback(&with_check);
        assert_eq!(codec.decode(Chain::Bitcoin, &addr).unwrap(), payload);
    }
}
