// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runtime options, parsed from the environment. Anything unparseable is a
//! fatal configuration error and aborts startup; defaults cover everything
//! else.

use crate::error::{LightnodeError, LightnodeResult};
use crate::tx::{Asset, Chain, Network};
use ethers::types::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Per-chain connection options.
#[derive(Debug, Clone)]
pub struct ChainOptions {
    /// JSON-RPC endpoint of the chain's full node.
    pub rpc: String,
    /// Gateway contract address, present on contract chains that are
    /// watched for burns.
    pub gateway: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub network: Network,
    pub port: u16,
    /// Inbound queue capacity of the server and each pipeline stage.
    pub cap: usize,
    pub max_batch_size: usize,
    pub server_timeout: Duration,
    pub client_timeout: Duration,
    /// Response-cache TTL.
    pub ttl: Duration,
    pub updater_poll_rate: Duration,
    pub confirmer_poll_rate: Duration,
    pub watcher_poll_rate: Duration,
    pub submitter_poll_rate: Duration,
    /// Age after which a transaction that never started confirming is
    /// rejected.
    pub tx_expiry: Duration,
    /// Peer endpoints used to seed the registry, `hexid@host:port` or bare
    /// `host:port`.
    pub bootstrap_addrs: Vec<String>,
    /// Compressed distributed public key used for shift-in validation.
    pub dist_pubkey: Bytes,
    /// Hex private key the submitter signs settlement transactions with.
    /// Settlement is disabled when absent.
    pub submitter_key: Option<String>,
    pub chains: HashMap<Chain, ChainOptions>,
    /// Confirmation thresholds per source chain.
    pub confirmations: HashMap<Chain, u64>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Upper bound on broadcast fan-out.
    pub max_fanout: usize,
}

impl Default for Options {
    fn default() -> Self {
        let mut confirmations = HashMap::new();
        confirmations.insert(Chain::Bitcoin, 6);
        confirmations.insert(Chain::BitcoinCash, 15);
        confirmations.insert(Chain::Zcash, 24);
        confirmations.insert(Chain::Ethereum, 12);
        confirmations.insert(Chain::BinanceSmartChain, 15);
        Self {
            network: Network::Localnet,
            port: 5000,
            cap: 128,
            max_batch_size: 10,
            server_timeout: Duration::from_secs(15),
            client_timeout: Duration::from_secs(60),
            ttl: Duration::from_secs(3),
            updater_poll_rate: Duration::from_secs(60),
            confirmer_poll_rate: Duration::from_secs(30),
            watcher_poll_rate: Duration::from_secs(15),
            submitter_poll_rate: Duration::from_secs(15),
            tx_expiry: Duration::from_secs(14 * 24 * 3600),
            bootstrap_addrs: Vec::new(),
            dist_pubkey: Bytes::default(),
            submitter_key: None,
            chains: HashMap::new(),
            confirmations,
            database_url: None,
            redis_url: None,
            max_fanout: 8,
        }
    }
}

impl Options {
    /// Parse options from the environment, starting from defaults. Only the
    /// variables that are present override anything.
    pub fn from_env() -> LightnodeResult<Self> {
        let mut opts = Options::default();

        if let Some(network) = var("NETWORK") {
            opts.network = match network.as_str() {
                "mainnet" => Network::Mainnet,
                "testnet" => Network::Testnet,
                "devnet" => Network::Devnet,
                "localnet" => Network::Localnet,
                other => {
                    return Err(LightnodeError::FatalConfig(format!(
                        "unknown network {other}"
                    )))
                }
            };
        }
        if let Some(port) = var("PORT") {
            opts.port = parse(&port, "PORT")?;
        }
        if let Some(cap) = var("CAP") {
            opts.cap = parse(&cap, "CAP")?;
        }
        if let Some(size) = var("MAX_BATCH_SIZE") {
            opts.max_batch_size = parse(&size, "MAX_BATCH_SIZE")?;
        }
        if let Some(v) = var("SERVER_TIMEOUT") {
            opts.server_timeout = seconds(&v, "SERVER_TIMEOUT")?;
        }
        if let Some(v) = var("CLIENT_TIMEOUT") {
            opts.client_timeout = seconds(&v, "CLIENT_TIMEOUT")?;
        }
        if let Some(v) = var("TTL") {
            opts.ttl = seconds(&v, "TTL")?;
        }
        if let Some(v) = var("UPDATER_POLL_RATE") {
            opts.updater_poll_rate = seconds(&v, "UPDATER_POLL_RATE")?;
        }
        if let Some(v) = var("CONFIRMER_POLL_RATE") {
            opts.confirmer_poll_rate = seconds(&v, "CONFIRMER_POLL_RATE")?;
        }
        if let Some(v) = var("WATCHER_POLL_RATE") {
            opts.watcher_poll_rate = seconds(&v, "WATCHER_POLL_RATE")?;
        }
        if let Some(v) = var("SUBMITTER_POLL_RATE") {
            opts.submitter_poll_rate = seconds(&v, "SUBMITTER_POLL_RATE")?;
        }
        if let Some(v) = var("EXPIRY") {
            opts.tx_expiry = seconds(&v, "EXPIRY")?;
        }
        if let Some(addrs) = var("BOOTSTRAP_ADDRS") {
            opts.bootstrap_addrs = addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(key) = var("DIST_PUB_KEY") {
            let raw = hex::decode(key.trim_start_matches("0x")).map_err(|e| {
                LightnodeError::FatalConfig(format!("invalid DIST_PUB_KEY: {e}"))
            })?;
            if raw.len() != 33 {
                return Err(LightnodeError::FatalConfig(format!(
                    "DIST_PUB_KEY must be a 33-byte compressed key, got {} bytes",
                    raw.len()
                )));
            }
            opts.dist_pubkey = Bytes::from(raw);
        }

        for (chain, rpc_var, gateway_var) in [
            (Chain::Bitcoin, "RPC_BITCOIN", None),
            (Chain::BitcoinCash, "RPC_BITCOIN_CASH", None),
            (Chain::Zcash, "RPC_ZCASH", None),
            (Chain::Ethereum, "RPC_ETHEREUM", Some("GATEWAY_ETHEREUM")),
            (
                Chain::BinanceSmartChain,
                "RPC_BINANCE",
                Some("GATEWAY_BINANCE"),
            ),
        ] {
            if let Some(rpc) = var(rpc_var) {
                let gateway = gateway_var.and_then(var);
                opts.chains.insert(chain, ChainOptions { rpc, gateway });
            }
        }

        opts.submitter_key = var("SUBMITTER_KEY");
        opts.database_url = var("DATABASE_URL");
        opts.redis_url = var("REDIS_URL");

        opts.validate()?;
        Ok(opts)
    }

    fn validate(&self) -> LightnodeResult<()> {
        if self.cap == 0 {
            return Err(LightnodeError::FatalConfig("CAP must be nonzero".into()));
        }
        if self.max_batch_size == 0 {
            return Err(LightnodeError::FatalConfig(
                "MAX_BATCH_SIZE must be nonzero".into(),
            ));
        }
        for addr in &self.bootstrap_addrs {
            let host_port = addr.rsplit('@').next().unwrap_or(addr);
            if !host_port.contains(':') {
                return Err(LightnodeError::FatalConfig(format!(
                    "bootstrap address {addr} is not host:port"
                )));
            }
        }
        Ok(())
    }

    /// Confirmation threshold for a source chain.
    pub fn confirmations_for(&self, chain: Chain) -> u64 {
        self.confirmations.get(&chain).copied().unwrap_or(6)
    }

    /// The burn selectors to watch: one per (configured contract chain with
    /// a gateway, supported asset).
    pub fn watch_selectors(&self) -> Vec<crate::tx::Selector> {
        use crate::tx::{Direction, Selector};
        let mut out = Vec::new();
        for (chain, chain_opts) in &self.chains {
            if !chain.is_contract_chain() || chain_opts.gateway.is_none() {
                continue;
            }
            for asset in [Asset::BTC, Asset::BCH, Asset::ZEC] {
                if let Ok(sel) = Selector::new(asset, Direction::From, *chain) {
                    out.push(sel);
                }
            }
        }
        out.sort_by_key(|s| s.to_string());
        out
    }
}

/// EVM chain id per network, used to scope the submitter's signatures.
pub fn evm_chain_id(network: Network, chain: Chain) -> u64 {
    match (chain, network) {
        (Chain::Ethereum, Network::Mainnet) => 1,
        (Chain::Ethereum, Network::Testnet) => 11_155_111,
        (Chain::BinanceSmartChain, Network::Mainnet) => 56,
        (Chain::BinanceSmartChain, Network::Testnet) => 97,
        _ => 1337,
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(value: &str, name: &str) -> LightnodeResult<T> {
    value
        .parse()
        .map_err(|_| LightnodeError::FatalConfig(format!("invalid {name}={value}")))
}

fn seconds(value: &str, name: &str) -> LightnodeResult<Duration> {
    Ok(Duration::from_secs(parse::<u64>(value, name)?))
}
