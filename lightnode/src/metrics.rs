// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

/// Process-wide counters and gauges. Constructed once at startup and shared
/// by every component that reports.
#[derive(Debug)]
pub struct NodeMetrics {
    pub requests_total: IntCounterVec,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub dispatch_failures: IntCounterVec,
    pub status_transitions: IntCounterVec,
    pub watcher_last_block: IntGaugeVec,
    pub watcher_burns_ingested: IntCounterVec,
    pub errors_total: IntCounterVec,
}

impl NodeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_total: register_int_counter_vec_with_registry!(
                "lightnode_requests_total",
                "Requests received, by method",
                &["method"],
                registry,
            )
            .unwrap(),
            cache_hits: register_int_counter_with_registry!(
                "lightnode_cache_hits",
                "Responses served from the response cache",
                registry,
            )
            .unwrap(),
            cache_misses: register_int_counter_with_registry!(
                "lightnode_cache_misses",
                "Cacheable requests that went downstream",
                registry,
            )
            .unwrap(),
            dispatch_failures: register_int_counter_vec_with_registry!(
                "lightnode_dispatch_failures",
                "Dispatches that produced no usable response, by method",
                &["method"],
                registry,
            )
            .unwrap(),
            status_transitions: register_int_counter_vec_with_registry!(
                "lightnode_status_transitions",
                "Transaction status transitions, by target status",
                &["to"],
                registry,
            )
            .unwrap(),
            watcher_last_block: register_int_gauge_vec_with_registry!(
                "lightnode_watcher_last_block",
                "Last fully ingested host-chain block, by selector",
                &["selector"],
                registry,
            )
            .unwrap(),
            watcher_burns_ingested: register_int_counter_vec_with_registry!(
                "lightnode_watcher_burns_ingested",
                "Burn events turned into submissions, by selector",
                &["selector"],
                registry,
            )
            .unwrap(),
            errors_total: register_int_counter_vec_with_registry!(
                "lightnode_errors_total",
                "Errors by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}
