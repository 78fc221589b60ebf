// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Composition root: builds every component from the parsed options, wires
//! the channel pipeline (server → cacher → resolver → dispatcher), spawns
//! the poll loops and supervises shutdown through one root cancellation
//! token.

use crate::cacher::Cacher;
use crate::chain::{
    ChainClients, EthBurnLogFetcher, EthChainHead, EthHostClient, UtxoRpcClient,
};
use crate::codec::StandardCodec;
use crate::config::{evm_chain_id, Options};
use crate::confirmer::Confirmer;
use crate::dispatcher::Dispatcher;
use crate::jsonrpc;
use crate::kv::{KvStore, MemKv, RedisKv};
use crate::metrics::NodeMetrics;
use crate::registry::PeerRegistry;
use crate::resolver::{Resolver, TxChecker};
use crate::server::{run_server, ServerState};
use crate::store::memory::MemTxStore;
use crate::store::pg::PgTxStore;
use crate::store::TxStore;
use crate::submitter::Submitter;
use crate::updater::Updater;
use crate::watcher::Watcher;
use anyhow::{anyhow, Context};
use ethers::providers::{Http, Provider};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CACHE_CAPACITY: usize = 1024;

/// Build and run the node until the cancellation token fires. Returns once
/// every task wound down (or a grace period expired).
pub async fn run_lightnode(options: Options, cancel: CancellationToken) -> anyhow::Result<()> {
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(NodeMetrics::new(&registry));

    let kv: Arc<dyn KvStore> = match &options.redis_url {
        Some(url) => Arc::new(RedisKv::connect(url).await.context("redis")?),
        None => {
            warn!("[node] REDIS_URL not set, cursors and mappings are in-memory only");
            Arc::new(MemKv::new())
        }
    };

    let store: Arc<dyn TxStore> = match &options.database_url {
        Some(url) => Arc::new(PgTxStore::connect(url, 16).await.context("database")?),
        None => {
            warn!("[node] DATABASE_URL not set, transactions are in-memory only");
            Arc::new(MemTxStore::new())
        }
    };

    let peers = Arc::new(
        PeerRegistry::new(&options.bootstrap_addrs, options.updater_poll_rate * 10)
            .context("bootstrap peers")?,
    );
    info!(
        "[node] bootstrapped registry with {} peers",
        options.bootstrap_addrs.len()
    );

    let client = jsonrpc::Client::new(options.client_timeout);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Gossip.
    let updater = Updater::new(peers.clone(), client.clone(), options.updater_poll_rate);
    handles.push(updater.spawn(cancel.clone()));

    // Dispatcher, the tail of the pipeline.
    let (dispatcher_tx, dispatcher_rx) = mpsc::channel(options.cap);
    let dispatcher = Arc::new(Dispatcher::new(
        peers.clone(),
        client.clone(),
        options.max_fanout,
        metrics.clone(),
    ));
    handles.push(dispatcher.spawn(cancel.clone(), dispatcher_rx));

    // Chain collaborators.
    let mut providers: HashMap<crate::tx::Chain, Arc<Provider<Http>>> = HashMap::new();
    let mut chains = ChainClients::new();
    for (chain, chain_opts) in &options.chains {
        if chain.is_contract_chain() {
            let provider = Arc::new(
                Provider::<Http>::try_from(chain_opts.rpc.as_str())
                    .with_context(|| format!("rpc endpoint for {chain}"))?,
            );
            providers.insert(*chain, provider.clone());
            chains = chains.with_evm(*chain, provider);
        } else {
            chains = chains.with_utxo(*chain, UtxoRpcClient::new(chain_opts.rpc.clone()));
        }
    }
    let chains = Arc::new(chains);

    // Resolver workers.
    let checker = Arc::new(TxChecker::new(
        chains.clone(),
        store.clone(),
        Arc::new(StandardCodec),
        options.dist_pubkey.clone(),
    ));
    let (resolver_tx, resolver_rx) = mpsc::channel(options.cap);
    let resolver = Arc::new(Resolver::new(
        checker.clone(),
        store.clone(),
        dispatcher_tx.clone(),
        metrics.clone(),
    ));
    handles.extend(resolver.spawn_workers(
        cancel.clone(),
        resolver_rx,
        Resolver::default_workers(),
    ));

    // Response cache in front of the resolver.
    let (cacher_tx, cacher_rx) = mpsc::channel(options.cap);
    let cacher = Cacher::new(resolver_tx, CACHE_CAPACITY, options.ttl, metrics.clone());
    handles.push(cacher.spawn(cancel.clone(), cacher_rx));

    // Confirmation scanning.
    let confirmer = Arc::new(Confirmer::new(
        store.clone(),
        chains.clone(),
        dispatcher_tx.clone(),
        options.confirmations.clone(),
        options.confirmer_poll_rate,
        options.tx_expiry,
        metrics.clone(),
    ));
    handles.push(confirmer.spawn(cancel.clone()));

    // Settlement, one submitter per contract chain, only with a key.
    if let Some(key) = &options.submitter_key {
        let wallet = LocalWallet::from_str(key.trim_start_matches("0x"))
            .map_err(|e| anyhow!("invalid SUBMITTER_KEY: {e}"))?;
        for (chain, provider) in &providers {
            let host = Arc::new(EthHostClient::new(
                provider.as_ref().clone(),
                wallet.clone(),
                evm_chain_id(options.network, *chain),
            ));
            let submitter = Arc::new(Submitter::new(
                store.clone(),
                dispatcher_tx.clone(),
                host,
                *chain,
                options.submitter_poll_rate,
                metrics.clone(),
            ));
            handles.extend(submitter.spawn(cancel.clone()));
            info!("[node] submitter enabled for {chain}");
        }
    } else {
        info!("[node] SUBMITTER_KEY not set, settlement disabled");
    }

    // Burn watchers, one per (host chain, selector).
    for selector in options.watch_selectors() {
        let host_chain = selector.host_chain();
        let Some(provider) = providers.get(&host_chain) else {
            continue;
        };
        let gateway = options
            .chains
            .get(&host_chain)
            .and_then(|c| c.gateway.as_deref())
            .ok_or_else(|| anyhow!("watch selector {selector} without gateway"))?;
        let gateway = Address::from_str(gateway)
            .map_err(|e| anyhow!("gateway address for {host_chain}: {e}"))?;
        let watcher = Arc::new(Watcher::new(
            selector,
            Arc::new(EthBurnLogFetcher::new(provider.clone(), gateway)),
            Arc::new(EthChainHead::new(provider.clone())),
            checker.clone(),
            kv.clone(),
            Arc::new(StandardCodec),
            options.dist_pubkey.clone(),
            options.watcher_poll_rate,
            metrics.clone(),
        ));
        handles.push(watcher.spawn(cancel.clone()));
        info!("[node] watching {selector}");
    }

    // Front door.
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), options.port);
    let server_state = ServerState::new(
        cacher_tx,
        options.max_batch_size,
        options.server_timeout,
        metrics.clone(),
        registry.clone(),
    );
    handles.push(run_server(addr, server_state, cancel.clone()));

    cancel.cancelled().await;
    info!("[node] shutting down");
    if tokio::time::timeout(
        Duration::from_secs(5),
        futures::future::join_all(handles),
    )
    .await
    .is_err()
    {
        warn!("[node] some tasks did not stop within the grace period");
    }
    Ok(())
}
