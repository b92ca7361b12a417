// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-telemetry: metrics registry and process resource sampling.

pub mod metrics;
pub mod process;

pub use metrics::{HistogramSnapshot, MetricValue, Registry};
pub use process::{SystemSampler, SystemStats};
