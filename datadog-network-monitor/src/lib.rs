// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network observability pipeline over the netlink ingestion layer:
//! admission control, buffering, anomaly scoring, a bounded recent-
//! event cache and self-telemetry.

pub mod agent;
pub mod anomaly;
pub mod config;
pub mod event_store;
pub mod limits;
pub mod processor;
pub mod rate_limiter;
pub mod telemetry;

pub use agent::{AgentError, AgentHealth, AgentStats, NetworkMonitorAgent};
pub use anomaly::{Anomaly, AnomalyDetector};
pub use config::{AgentConfig, ConfigError, StoreConfig};
pub use event_store::{EventFilter, EventStore, StoreStats};
pub use limits::{HealthSnapshot, LimitsConfig, LimitsStats, ResourceLimits};
pub use processor::{
    BackpressurePolicy, EventProcessor, ProcessorConfig, ProcessorStats, SubmitError,
};
pub use rate_limiter::{RateLimiterMap, RateLimiterStats, TokenBucket};
pub use telemetry::{Registry, SystemSampler};
