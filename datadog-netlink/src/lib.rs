// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Netlink ingestion for the network monitor: wire-format decoding,
//! typed events and the per-source receiver layer.

pub mod error;
pub mod events;
pub mod monitor;
pub mod parser;
pub mod wire;

pub use error::{MonitorError, ParseError};
pub use events::{EventKind, EventPayload, EventSource, NetworkEvent};
pub use monitor::{Monitor, MonitorConfig, SourceStats};
pub use parser::FamilyCache;
