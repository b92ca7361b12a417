// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: serde records with environment overrides.

use datadog_netlink::MonitorConfig;
use serde::{Deserialize, Serialize};

use crate::limits::LimitsConfig;
use crate::processor::{BackpressurePolicy, ProcessorConfig};

/// Invalid configuration detected at construction. The operator fixes
/// the value and restarts; nothing in the core retries.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("rate must be positive, got {0}")]
    InvalidRate(f64),
    #[error("burst must be positive, got {0}")]
    InvalidBurst(f64),
    #[error("buffer size must be nonzero, got {0}")]
    InvalidBufferSize(usize),
    #[error("worker threads must be nonzero, got {0}")]
    InvalidWorkerThreads(usize),
    #[error("store capacity must be nonzero, got {0}")]
    InvalidStoreCapacity(usize),
    #[error("unknown backpressure policy {0:?}")]
    InvalidBackpressure(String),
}

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn float(name: &str) -> Option<f64> {
        env::var(name).ok()?.parse::<f64>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        let var = env::var(name).ok()?;
        Some(var == "true" || var == "1")
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig { capacity: 4096 }
    }
}

/// The whole agent's configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub ingestion: MonitorConfig,
    pub processor: ProcessorConfig,
    pub limits: LimitsConfig,
    pub store: StoreConfig,
}

impl AgentConfig {
    // Ingestion
    const ENABLE_ROUTE: &'static str = "DD_NETMON_ENABLE_ROUTE";
    const ENABLE_GENERIC: &'static str = "DD_NETMON_ENABLE_GENERIC";
    const ENABLE_SOCK_DIAG: &'static str = "DD_NETMON_ENABLE_SOCK_DIAG";
    const RECV_BUFFER_BYTES: &'static str = "DD_NETMON_RECV_BUFFER_BYTES";
    const DUMP_ON_ERROR: &'static str = "DD_NETMON_DUMP_ON_ERROR";

    // Processor
    const BUFFER_SIZE: &'static str = "DD_NETMON_BUFFER_SIZE";
    const WORKER_THREADS: &'static str = "DD_NETMON_WORKER_THREADS";
    const DEFAULT_RATE_LIMIT: &'static str = "DD_NETMON_DEFAULT_RATE_LIMIT";
    const BACKPRESSURE: &'static str = "DD_NETMON_BACKPRESSURE";
    const ENABLE_ANOMALY: &'static str = "DD_NETMON_ENABLE_ANOMALY";
    const ANOMALY_WINDOW_SEC: &'static str = "DD_NETMON_ANOMALY_WINDOW_SEC";
    const ANOMALY_THRESHOLD: &'static str = "DD_NETMON_ANOMALY_THRESHOLD_SIGMA";

    // Limits
    const MAX_MEMORY_MB: &'static str = "DD_NETMON_MAX_MEMORY_MB";
    const MAX_MSG_PER_SEC: &'static str = "DD_NETMON_MAX_MSG_PER_SEC";
    const ENABLE_MEMORY_LIMIT: &'static str = "DD_NETMON_ENABLE_MEMORY_LIMIT";
    const ENABLE_RATE_LIMIT: &'static str = "DD_NETMON_ENABLE_RATE_LIMIT";
    const SAMPLE_INTERVAL_SEC: &'static str = "DD_NETMON_SAMPLE_INTERVAL_SEC";

    // Store
    const STORE_CAPACITY: &'static str = "DD_NETMON_STORE_CAPACITY";

    /// Defaults overlaid with `DD_NETMON_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = AgentConfig::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(v) = parse_env::bool(Self::ENABLE_ROUTE) {
            self.ingestion.enable_route = v;
        }
        if let Some(v) = parse_env::bool(Self::ENABLE_GENERIC) {
            self.ingestion.enable_generic = v;
        }
        if let Some(v) = parse_env::bool(Self::ENABLE_SOCK_DIAG) {
            self.ingestion.enable_sock_diag = v;
        }
        if let Some(v) = parse_env::int(Self::RECV_BUFFER_BYTES) {
            self.ingestion.recv_buffer_bytes = v;
        }
        if let Some(v) = parse_env::bool(Self::DUMP_ON_ERROR) {
            self.ingestion.dump_on_error = v;
        }

        if let Some(v) = parse_env::int(Self::BUFFER_SIZE) {
            self.processor.buffer_size = v;
        }
        if let Some(v) = parse_env::int(Self::WORKER_THREADS) {
            self.processor.worker_threads = v;
        }
        if let Some(v) = parse_env::float(Self::DEFAULT_RATE_LIMIT) {
            self.processor.default_rate_limit = Some(v);
        }
        if let Some(v) = parse_env::str_not_empty(Self::BACKPRESSURE) {
            if let Some(policy) = parse_backpressure(&v) {
                self.processor.backpressure = policy;
            }
        }
        if let Some(v) = parse_env::bool(Self::ENABLE_ANOMALY) {
            self.processor.enable_anomaly_detection = v;
        }
        if let Some(v) = parse_env::int(Self::ANOMALY_WINDOW_SEC) {
            self.processor.anomaly_window_sec = v;
        }
        if let Some(v) = parse_env::float(Self::ANOMALY_THRESHOLD) {
            self.processor.anomaly_threshold_sigma = v;
        }

        if let Some(v) = parse_env::int(Self::MAX_MEMORY_MB) {
            self.limits.max_memory_mb = v;
        }
        if let Some(v) = parse_env::int(Self::MAX_MSG_PER_SEC) {
            self.limits.max_msg_per_sec = v;
        }
        if let Some(v) = parse_env::bool(Self::ENABLE_MEMORY_LIMIT) {
            self.limits.enable_memory = v;
        }
        if let Some(v) = parse_env::bool(Self::ENABLE_RATE_LIMIT) {
            self.limits.enable_rate = v;
        }
        if let Some(v) = parse_env::int(Self::SAMPLE_INTERVAL_SEC) {
            self.limits.sample_interval_sec = v;
        }

        if let Some(v) = parse_env::int(Self::STORE_CAPACITY) {
            self.store.capacity = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.processor.buffer_size));
        }
        if self.processor.worker_threads == 0 {
            return Err(ConfigError::InvalidWorkerThreads(
                self.processor.worker_threads,
            ));
        }
        if self.store.capacity == 0 {
            return Err(ConfigError::InvalidStoreCapacity(self.store.capacity));
        }
        if let Some(rate) = self.processor.default_rate_limit {
            if rate <= 0.0 || !rate.is_finite() {
                return Err(ConfigError::InvalidRate(rate));
            }
        }
        for spec in self.processor.per_type_rate_limits.values() {
            if spec.rate <= 0.0 || !spec.rate.is_finite() {
                return Err(ConfigError::InvalidRate(spec.rate));
            }
            if spec.burst <= 0.0 || !spec.burst.is_finite() {
                return Err(ConfigError::InvalidBurst(spec.burst));
            }
        }
        Ok(())
    }
}

fn parse_backpressure(value: &str) -> Option<BackpressurePolicy> {
    match value {
        "drop_oldest" => Some(BackpressurePolicy::DropOldest),
        "drop_new" => Some(BackpressurePolicy::DropNew),
        "block" => Some(BackpressurePolicy::Block),
        _ => None,
    }
}
