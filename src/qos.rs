// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Quality of Service specifications and cubes
//!
//! A flow is requested with a [`QosSpec`]; inside the DIF the spec is
//! mapped onto one of a small set of [`QosCube`]s, each with its own
//! forwarding table.

use crate::error::DtError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of QoS cubes, and hence forwarding tables, per IPCP
pub const QOS_CUBE_MAX: usize = 3;

/// QoS requirements attached to a flow request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosSpec {
    /// Maximum tolerated delay (milliseconds)
    pub delay_ms: u32,
    /// Requested bandwidth (bytes/sec, 0 = unspecified)
    pub bandwidth_bps: u64,
    /// Maximum tolerated loss (parts per million)
    pub loss_ppm: u32,
}

impl Default for QosSpec {
    fn default() -> Self {
        Self::best_effort()
    }
}

impl QosSpec {
    /// No guarantees
    pub fn best_effort() -> Self {
        Self {
            delay_ms: u32::MAX,
            bandwidth_bps: 0,
            loss_ppm: 1_000_000,
        }
    }

    /// High bandwidth, moderate delay
    pub fn video() -> Self {
        Self {
            delay_ms: 100,
            bandwidth_bps: 1_250_000,
            loss_ppm: 1_000,
        }
    }

    /// Low delay, low bandwidth
    pub fn voice() -> Self {
        Self {
            delay_ms: 50,
            bandwidth_bps: 16_000,
            loss_ppm: 10_000,
        }
    }

    /// Maps this spec onto the cube that can satisfy it
    pub fn cube(&self) -> QosCube {
        if self.delay_ms <= 50 {
            QosCube::Voice
        } else if self.bandwidth_bps >= 1_000_000 || self.delay_ms <= 100 {
            QosCube::Video
        } else {
            QosCube::BestEffort
        }
    }
}

/// Discrete traffic class selecting a forwarding table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QosCube {
    BestEffort = 0,
    Video = 1,
    Voice = 2,
}

impl QosCube {
    /// All cubes, in index order
    pub const ALL: [QosCube; QOS_CUBE_MAX] = [QosCube::BestEffort, QosCube::Video, QosCube::Voice];

    /// Index into per-cube tables
    pub fn index(self) -> usize {
        self as usize
    }

    /// The spec a flow in this cube is allocated with
    pub fn spec(self) -> QosSpec {
        match self {
            QosCube::BestEffort => QosSpec::best_effort(),
            QosCube::Video => QosSpec::video(),
            QosCube::Voice => QosSpec::voice(),
        }
    }
}

impl TryFrom<u8> for QosCube {
    type Error = DtError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosCube::BestEffort),
            1 => Ok(QosCube::Video),
            2 => Ok(QosCube::Voice),
            other => Err(DtError::InvalidQosCube(other)),
        }
    }
}

impl fmt::Display for QosCube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosCube::BestEffort => write!(f, "BE"),
            QosCube::Video => write!(f, "VIDEO"),
            QosCube::Voice => write!(f, "VOICE"),
        }
    }
}
