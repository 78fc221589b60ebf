// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain collaborators. Each capability the pipeline needs from a chain is a
//! small trait (burn-log fetching for the watcher, funding validation and
//! confirmation counting for the resolver and confirmer, transaction
//! building and broadcast for the submitter) so tests can substitute
//! in-process fakes at composition time.

use crate::codec::base58_fallback;
use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::{Chain, Selector, TxInput};
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A burn observed on a host chain: the user destroyed wrapped assets and
/// wants the underlying released to `to` on the origin chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnEvent {
    /// Host-chain transaction hash the burn was emitted in.
    pub txid: Vec<u8>,
    pub amount: U256,
    /// Recipient, either an address string's bytes or a legacy raw payload.
    pub to: Vec<u8>,
    pub nonce: u64,
    pub block: u64,
}

impl BurnEvent {
    /// The recipient as an address string, falling back to base58 when the
    /// bytes are not UTF-8. The caller decides whether the result decodes.
    pub fn to_string_lossy(&self) -> String {
        match std::str::from_utf8(&self.to) {
            Ok(s) => s.to_string(),
            Err(_) => base58_fallback(&self.to),
        }
    }
}

#[async_trait]
pub trait BurnLogFetcher: Send + Sync {
    /// All burn events in the block range `(from, to]`, ordered by block.
    async fn fetch_burn_logs(&self, from: u64, to: u64) -> LightnodeResult<Vec<BurnEvent>>;
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Zero-confirmation check that the funding output referenced by a
    /// shift-in exists on the source chain and carries the declared amount.
    async fn validate_utxo(&self, selector: Selector, input: &TxInput) -> LightnodeResult<()>;

    /// Current confirmation count of a transaction.
    async fn confirmations_of(&self, chain: Chain, txid: &[u8]) -> LightnodeResult<u64>;
}

/// Read access to a chain's tip, the only thing the watcher needs beyond
/// its log fetcher.
#[async_trait]
pub trait ChainHead: Send + Sync {
    async fn current_height(&self) -> LightnodeResult<u64>;
}

#[async_trait]
pub trait HostChainClient: Send + Sync {
    /// Assemble an unsigned contract call.
    async fn build_tx(&self, to: Address, data: Bytes) -> LightnodeResult<TypedTransaction>;

    /// Sign with the local key and broadcast; returns the published hash.
    async fn publish_signed_tx(&self, tx: TypedTransaction) -> LightnodeResult<H256>;
}

/// [`ChainHead`] over a plain EVM provider.
pub struct EthChainHead {
    provider: Arc<Provider<Http>>,
}

impl EthChainHead {
    pub fn new(provider: Arc<Provider<Http>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ChainHead for EthChainHead {
    async fn current_height(&self) -> LightnodeResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| LightnodeError::TransientDownstream(format!("block number: {e}")))
    }
}

/// `LogBurn(bytes to, uint256 amount, uint256 indexed nonce)`.
pub static BURN_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("LogBurn(bytes,uint256,uint256)")));

/// Decode a gateway burn log into a [`BurnEvent`].
pub fn decode_burn_log(log: &Log) -> LightnodeResult<BurnEvent> {
    let tokens = ethers::abi::decode(
        &[
            ethers::abi::ParamType::Bytes,
            ethers::abi::ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| LightnodeError::LogicViolation(format!("undecodable burn log: {e}")))?;
    let to = tokens[0]
        .clone()
        .into_bytes()
        .ok_or_else(|| LightnodeError::LogicViolation("burn log to is not bytes".into()))?;
    let amount = tokens[1]
        .clone()
        .into_uint()
        .ok_or_else(|| LightnodeError::LogicViolation("burn log amount is not uint".into()))?;
    let nonce = log
        .topics
        .get(1)
        .map(|t| U256::from_big_endian(t.as_bytes()).low_u64())
        .ok_or_else(|| LightnodeError::LogicViolation("burn log has no nonce topic".into()))?;
    Ok(BurnEvent {
        txid: log
            .transaction_hash
            .map(|h| h.as_bytes().to_vec())
            .unwrap_or_default(),
        amount,
        to,
        nonce,
        block: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
    })
}

/// Burn-log source reading a gateway contract through an EVM provider.
pub struct EthBurnLogFetcher {
    provider: Arc<Provider<Http>>,
    gateway: Address,
}

impl EthBurnLogFetcher {
    pub fn new(provider: Arc<Provider<Http>>, gateway: Address) -> Self {
        Self { provider, gateway }
    }
}

#[async_trait]
impl BurnLogFetcher for EthBurnLogFetcher {
    async fn fetch_burn_logs(&self, from: u64, to: u64) -> LightnodeResult<Vec<BurnEvent>> {
        let filter = Filter::new()
            .address(self.gateway)
            .topic0(*BURN_TOPIC)
            .from_block(from + 1)
            .to_block(to);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("get_logs: {e}")))?;
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            events.push(decode_burn_log(log)?);
        }
        events.sort_by_key(|e| e.block);
        Ok(events)
    }
}

/// EVM host-chain client used by the watcher (head queries) and the
/// submitter (build + publish).
pub struct EthHostClient {
    middleware: SignerMiddleware<Provider<Http>, LocalWallet>,
}

impl EthHostClient {
    pub fn new(provider: Provider<Http>, wallet: LocalWallet, chain_id: u64) -> Self {
        Self {
            middleware: SignerMiddleware::new(provider, wallet.with_chain_id(chain_id)),
        }
    }
}

#[async_trait]
impl HostChainClient for EthHostClient {
    async fn build_tx(&self, to: Address, data: Bytes) -> LightnodeResult<TypedTransaction> {
        let request = TransactionRequest::new()
            .from(self.middleware.signer().address())
            .to(to)
            .data(data);
        Ok(request.into())
    }

    async fn publish_signed_tx(&self, tx: TypedTransaction) -> LightnodeResult<H256> {
        let pending = self
            .middleware
            .send_transaction(tx, None)
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("broadcast: {e}")))?;
        Ok(pending.tx_hash())
    }
}

/// Minimal client for bitcoind-style JSON-RPC endpoints.
pub struct UtxoRpcClient {
    url: String,
    http: reqwest::Client,
}

impl UtxoRpcClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> LightnodeResult<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "lightnode",
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("{method}: {e}")))?;
        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| LightnodeError::TransientDownstream(format!("{method}: {e}")))?;
        if !envelope["error"].is_null() {
            return Err(LightnodeError::TransientDownstream(format!(
                "{method}: {}",
                envelope["error"]
            )));
        }
        Ok(envelope["result"].clone())
    }
}

/// Per-chain RPC clients implementing the resolver's and confirmer's view of
/// the outside world.
pub struct ChainClients {
    utxo: HashMap<Chain, UtxoRpcClient>,
    evm: HashMap<Chain, Arc<Provider<Http>>>,
}

impl ChainClients {
    pub fn new() -> Self {
        Self {
            utxo: HashMap::new(),
            evm: HashMap::new(),
        }
    }

    pub fn with_utxo(mut self, chain: Chain, client: UtxoRpcClient) -> Self {
        self.utxo.insert(chain, client);
        self
    }

    pub fn with_evm(mut self, chain: Chain, provider: Arc<Provider<Http>>) -> Self {
        self.evm.insert(chain, provider);
        self
    }
}

#[async_trait]
impl Blockchain for ChainClients {
    async fn validate_utxo(&self, selector: Selector, input: &TxInput) -> LightnodeResult<()> {
        let chain = selector.source();
        let client = self.utxo.get(&chain).ok_or_else(|| {
            LightnodeError::InvalidParams(format!("no rpc configured for {chain}"))
        })?;
        let txid = hex::encode(&input.txid);
        let result = client
            .call("gettxout", json!([txid, input.txindex, true]))
            .await?;
        if result.is_null() {
            return Err(LightnodeError::InvalidParams(format!(
                "utxo {txid}:{} does not exist",
                input.txindex
            )));
        }
        let value_btc = result["value"].as_f64().unwrap_or(0.0);
        let sats = U256::from((value_btc * 1e8).round() as u64);
        if sats != input.amount {
            return Err(LightnodeError::InvalidParams(format!(
                "utxo {txid}:{} value {sats} does not match declared amount {}",
                input.txindex, input.amount
            )));
        }
        debug!("[chain] utxo {txid}:{} validated on {chain}", input.txindex);
        Ok(())
    }

    async fn confirmations_of(&self, chain: Chain, txid: &[u8]) -> LightnodeResult<u64> {
        if let Some(client) = self.utxo.get(&chain) {
            let result = client
                .call("getrawtransaction", json!([hex::encode(txid), 1]))
                .await?;
            return Ok(result["confirmations"].as_u64().unwrap_or(0));
        }
        if let Some(provider) = self.evm.get(&chain) {
            if txid.len() != 32 {
                return Err(LightnodeError::LogicViolation(format!(
                    "stored {chain} txid has {} bytes",
                    txid.len()
                )));
            }
            let hash = H256::from_slice(txid);
            let receipt = provider
                .get_transaction_receipt(hash)
                .await
                .map_err(|e| LightnodeError::TransientDownstream(format!("receipt: {e}")))?;
            let Some(receipt) = receipt else {
                return Ok(0);
            };
            let Some(mined_at) = receipt.block_number else {
                return Ok(0);
            };
            let head = provider
                .get_block_number()
                .await
                .map_err(|e| LightnodeError::TransientDownstream(format!("head: {e}")))?;
            return Ok(head.as_u64().saturating_sub(mined_at.as_u64()) + 1);
        }
        Err(LightnodeError::InvalidParams(format!(
            "no rpc configured for {chain}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burn_topic_is_the_event_signature_hash() {
        assert_eq!(
            *BURN_TOPIC,
            H256::from(keccak256("LogBurn(bytes,uint256,uint256)"))
        );
    }

    #[test]
    fn decodes_a_well_formed_burn_log() {
        let to = b"miKLB7HFuFxUkf2Eh7GJxVWejp5sygyJGB".to_vec();
        let data = ethers::abi::encode(&[
            ethers::abi::Token::Bytes(to.clone()),
            ethers::abi::Token::Uint(U256::from(20_000u64)),
        ]);
        let log = Log {
            address: Address::repeat_byte(3),
            topics: vec![*BURN_TOPIC, H256::from_low_u64_be(7)],
            data: data.into(),
            block_number: Some(100.into()),
            transaction_hash: Some(H256::repeat_byte(0xAB)),
            ..Default::default()
        };

        let event = decode_burn_log(&log).unwrap();
        assert_eq!(event.to, to);
        assert_eq!(event.amount, U256::from(20_000u64));
        assert_eq!(event.nonce, 7);
        assert_eq!(event.block, 100);
        assert_eq!(event.txid, H256::repeat_byte(0xAB).as_bytes().to_vec());
        assert_eq!(event.to_string_lossy(), "miKLB7HFuFxUkf2Eh7GJxVWejp5sygyJGB");
    }

    #[test]
    fn burn_log_without_nonce_topic_is_rejected() {
        let data = ethers::abi::encode(&[
            ethers::abi::Token::Bytes(vec![1, 2, 3]),
            ethers::abi::Token::Uint(U256::one()),
        ]);
        let log = Log {
            topics: vec![*BURN_TOPIC],
            data: data.into(),
            ..Default::default()
        };
        assert!(decode_burn_log(&log).is_err());
    }

    #[test]
    fn non_utf8_recipients_fall_back_to_base58() {
        let event = BurnEvent {
            txid: vec![],
            amount: U256::one(),
            to: vec![0xFF, 0xFE, 0x00, 0x01],
            nonce: 1,
            block: 1,
        };
        let encoded = event.to_string_lossy();
        assert_eq!(bs58::decode(&encoded).into_vec().unwrap(), event.to);
    }
}
