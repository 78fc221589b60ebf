// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-chain transaction model: selectors, the typed input/output structs,
//! the status state machine and the content-address hash family.

pub mod hash;

use crate::error::{LightnodeError, LightnodeResult};
use ethers::types::{Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chain parameter sets the node can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Localnet,
}

/// Assets that can be lifted across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    BTC,
    BCH,
    ZEC,
}

impl Asset {
    /// The chain the asset natively lives on.
    pub fn origin_chain(&self) -> Chain {
        match self {
            Asset::BTC => Chain::Bitcoin,
            Asset::BCH => Chain::BitcoinCash,
            Asset::ZEC => Chain::Zcash,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::BTC => "BTC",
            Asset::BCH => "BCH",
            Asset::ZEC => "ZEC",
        }
    }
}

impl FromStr for Asset {
    type Err = LightnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(Asset::BTC),
            "BCH" => Ok(Asset::BCH),
            "ZEC" => Ok(Asset::ZEC),
            other => Err(LightnodeError::InvalidParams(format!(
                "unknown asset {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Bitcoin,
    BitcoinCash,
    Zcash,
    Ethereum,
    BinanceSmartChain,
}

impl Chain {
    /// Whether the chain executes smart contracts. Only contract chains can
    /// host gateways and receive settlement transactions.
    pub fn is_contract_chain(&self) -> bool {
        matches!(self, Chain::Ethereum | Chain::BinanceSmartChain)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "Bitcoin",
            Chain::BitcoinCash => "BitcoinCash",
            Chain::Zcash => "Zcash",
            Chain::Ethereum => "Ethereum",
            Chain::BinanceSmartChain => "BinanceSmartChain",
        }
    }
}

impl FromStr for Chain {
    type Err = LightnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bitcoin" => Ok(Chain::Bitcoin),
            "BitcoinCash" => Ok(Chain::BitcoinCash),
            "Zcash" => Ok(Chain::Zcash),
            "Ethereum" => Ok(Chain::Ethereum),
            "BinanceSmartChain" => Ok(Chain::BinanceSmartChain),
            other => Err(LightnodeError::InvalidParams(format!(
                "unknown chain {other}"
            ))),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of the lift relative to the contract chain named in the
/// selector: `to` mints on it (shift-in), `from` burns on it (shift-out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    To,
    From,
}

/// Compact identifier for (asset, source chain, destination chain,
/// direction), written `BTC/toEthereum` or `BTC/fromEthereum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector {
    asset: Asset,
    direction: Direction,
    host: Chain,
}

impl Selector {
    pub fn new(asset: Asset, direction: Direction, host: Chain) -> LightnodeResult<Self> {
        if !host.is_contract_chain() {
            return Err(LightnodeError::InvalidParams(format!(
                "selector host {host} is not a contract chain"
            )));
        }
        Ok(Self {
            asset,
            direction,
            host,
        })
    }

    pub fn asset(&self) -> Asset {
        self.asset
    }

    /// The contract chain named in the selector.
    pub fn host_chain(&self) -> Chain {
        self.host
    }

    /// Shift-in lifts the asset from its origin chain onto the host chain.
    pub fn is_shift_in(&self) -> bool {
        self.direction == Direction::To
    }

    /// The chain the funding transaction lives on.
    pub fn source(&self) -> Chain {
        if self.is_shift_in() {
            self.asset.origin_chain()
        } else {
            self.host
        }
    }

    /// The chain the asset is released or minted on.
    pub fn destination(&self) -> Chain {
        if self.is_shift_in() {
            self.host
        } else {
            self.asset.origin_chain()
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::To => "to",
            Direction::From => "from",
        };
        write!(f, "{}/{}{}", self.asset.as_str(), dir, self.host.as_str())
    }
}

impl FromStr for Selector {
    type Err = LightnodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (asset, rest) = s
            .split_once('/')
            .ok_or_else(|| LightnodeError::InvalidParams(format!("malformed selector {s}")))?;
        let asset: Asset = asset.parse()?;
        let (direction, host) = if let Some(host) = rest.strip_prefix("to") {
            (Direction::To, host)
        } else if let Some(host) = rest.strip_prefix("from") {
            (Direction::From, host)
        } else {
            return Err(LightnodeError::InvalidParams(format!(
                "malformed selector {s}"
            )));
        };
        Selector::new(asset, direction, host.parse()?)
    }
}

impl Serialize for Selector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wire-protocol version of a transaction. Version 0 records come from
/// legacy clients and the base58 burn-address fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Version {
    #[serde(rename = "0")]
    V0,
    #[serde(rename = "1")]
    V1,
}

impl Version {
    pub fn as_u8(&self) -> u8 {
        match self {
            Version::V0 => 0,
            Version::V1 => 1,
        }
    }
}

/// Progress of a cross-chain transaction through the pipeline. Transitions
/// are monotonic along the graph; `predecessors` encodes the only states a
/// transition may come from, which the store uses as a compare-and-set
/// guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirming,
    Confirmed,
    Submitted,
    Done,
    Rejected,
    Failed,
}

impl TxStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Confirming => 1,
            TxStatus::Confirmed => 2,
            TxStatus::Submitted => 3,
            TxStatus::Done => 4,
            TxStatus::Rejected => 5,
            TxStatus::Failed => 6,
        }
    }

    pub fn from_i16(v: i16) -> LightnodeResult<Self> {
        match v {
            0 => Ok(TxStatus::Pending),
            1 => Ok(TxStatus::Confirming),
            2 => Ok(TxStatus::Confirmed),
            3 => Ok(TxStatus::Submitted),
            4 => Ok(TxStatus::Done),
            5 => Ok(TxStatus::Rejected),
            6 => Ok(TxStatus::Failed),
            other => Err(LightnodeError::LogicViolation(format!(
                "unknown status {other}"
            ))),
        }
    }

    /// The statuses a record may hold immediately before entering `self`.
    pub fn predecessors(&self) -> &'static [TxStatus] {
        match self {
            TxStatus::Pending => &[],
            TxStatus::Confirming => &[TxStatus::Pending],
            TxStatus::Confirmed => &[TxStatus::Confirming],
            TxStatus::Submitted => &[TxStatus::Confirmed],
            TxStatus::Done => &[TxStatus::Submitted],
            TxStatus::Rejected => &[TxStatus::Pending],
            TxStatus::Failed => &[TxStatus::Submitted],
        }
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Done | TxStatus::Rejected | TxStatus::Failed)
    }
}

/// The destination-contract call carried by a shift-in: the contract ABI,
/// the pre-encoded argument bytes and the function to invoke. Empty for
/// burns synthesized by the watcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractPayload {
    pub abi: Bytes,
    pub value: Bytes,
    #[serde(rename = "fn")]
    pub func: String,
}

/// Typed input parameters of a transaction. The derived hash fields
/// (`phash`, `nhash`, `ghash`) are recomputed by the resolver and must match
/// when supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub txid: Bytes,
    pub txindex: u32,
    pub amount: U256,
    pub payload: ContractPayload,
    pub phash: H256,
    pub to: String,
    pub nonce: H256,
    pub nhash: H256,
    pub gpubkey: Bytes,
    pub ghash: H256,
}

/// Output parameters filled in once the darknodes have executed the
/// transaction: the settled amount, the signing hash and the signature
/// components used by the submitter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: U256,
    pub sighash: H256,
    pub r: H256,
    pub s: H256,
    pub v: u8,
}

/// A cross-chain transaction. The hash is a deterministic function of
/// (version, selector, input); two records with equal hash carry equal
/// selector and input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tx {
    pub hash: H256,
    pub version: Version,
    pub selector: Selector,
    #[serde(rename = "in")]
    pub input: TxInput,
    #[serde(rename = "out", skip_serializing_if = "Option::is_none")]
    pub output: Option<TxOutput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_round_trip() {
        for raw in ["BTC/toEthereum", "ZEC/fromBinanceSmartChain", "BCH/toEthereum"] {
            let sel: Selector = raw.parse().unwrap();
            assert_eq!(sel.to_string(), raw);
        }
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!("BTC".parse::<Selector>().is_err());
        assert!("BTC/atEthereum".parse::<Selector>().is_err());
        assert!("DOGE/toEthereum".parse::<Selector>().is_err());
        // Host must be a contract chain.
        assert!("BTC/toBitcoin".parse::<Selector>().is_err());
    }

    #[test]
    fn selector_directions() {
        let mint: Selector = "BTC/toEthereum".parse().unwrap();
        assert!(mint.is_shift_in());
        assert_eq!(mint.source(), Chain::Bitcoin);
        assert_eq!(mint.destination(), Chain::Ethereum);

        let burn: Selector = "BTC/fromEthereum".parse().unwrap();
        assert!(!burn.is_shift_in());
        assert_eq!(burn.source(), Chain::Ethereum);
        assert_eq!(burn.destination(), Chain::Bitcoin);
    }

    #[test]
    fn status_graph_is_monotonic() {
        use TxStatus::*;
        let allowed = [
            (Pending, Confirming),
            (Confirming, Confirmed),
            (Confirmed, Submitted),
            (Submitted, Done),
            (Pending, Rejected),
            (Submitted, Failed),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
        }
        // No backward edges, no self edges.
        let all = [
            Pending, Confirming, Confirmed, Submitted, Done, Rejected, Failed,
        ];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(to.as_i16() > from.as_i16() || allowed.contains(&(from, to)));
                    assert_ne!(from, to);
                }
            }
        }
        for terminal in [Done, Rejected, Failed] {
            for to in all {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn status_i16_round_trip() {
        use TxStatus::*;
        for status in [
            Pending, Confirming, Confirmed, Submitted, Done, Rejected, Failed,
        ] {
            assert_eq!(TxStatus::from_i16(status.as_i16()).unwrap(), status);
        }
        assert!(TxStatus::from_i16(42).is_err());
    }

    #[test]
    fn tx_serde_uses_wire_field_names() {
        let sel: Selector = "BTC/toEthereum".parse().unwrap();
        let input = TxInput {
            txid: Bytes::from(vec![1, 2, 3]),
            txindex: 0,
            amount: U256::from(10_000u64),
            payload: ContractPayload::default(),
            phash: H256::zero(),
            to: "0x0000000000000000000000000000000000000001".to_string(),
            nonce: H256::zero(),
            nhash: H256::zero(),
            gpubkey: Bytes::default(),
            ghash: H256::zero(),
        };
        let tx = Tx {
            hash: H256::repeat_byte(7),
            version: Version::V1,
            selector: sel,
            input,
            output: None,
        };
        let raw = serde_json::to_value(&tx).unwrap();
        assert_eq!(raw["version"], "1");
        assert_eq!(raw["selector"], "BTC/toEthereum");
        assert!(raw.get("in").is_some());
        assert!(raw.get("out").is_none());

        let back: Tx = serde_json::from_value(raw).unwrap();
        assert_eq!(back, tx);
    }
}
