// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Error types for the normal IPCP
//!
//! One typed error per component, with `IpcpError` as the umbrella type
//! that everything converts into.

use crate::shim::FlowId;
use thiserror::Error;

/// Main error type for IPCP operations
#[derive(Error, Debug)]
pub enum IpcpError {
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("CDAP error: {0}")]
    Cdap(#[from] CdapError),

    #[error("Connection manager error: {0}")]
    ConnMgr(#[from] ConnMgrError),

    #[error("Enrollment error: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Data transfer error: {0}")]
    Dt(#[from] DtError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPCP is in state {0}, operation not allowed")]
    InvalidLifecycle(String),
}

/// Lower-layer flow errors (transient I/O)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Flow accept failed: {0}")]
    AcceptFailed(String),

    #[error("Flow allocation to {name} failed: {reason}")]
    AllocFailed { name: String, reason: String },

    #[error("Unknown flow: {0}")]
    UnknownFlow(FlowId),

    #[error("Flow closed: {0}")]
    Closed(FlowId),

    #[error("Write to flow {0} failed")]
    WriteFailed(FlowId),

    #[error("Substrate is shutting down")]
    ShuttingDown,
}

/// Request protocol (CDAP) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CdapError {
    #[error("Failed to encode CDAP message: {0}")]
    EncodeFailed(String),

    #[error("Failed to decode CDAP message: {0}")]
    DecodeFailed(String),

    #[error("No free invoke IDs on instance {0}")]
    InvokeIdsExhausted(u64),

    #[error("Send on instance {instance} failed: {source}")]
    SendFailed {
        instance: u64,
        #[source]
        source: FlowError,
    },
}

/// Connection manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnMgrError {
    #[error("AE already registered: {0}")]
    DuplicateName(String),

    #[error("No AE registered as {0}")]
    UnknownAe(String),

    #[error("Application connection negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("AE {0} was unregistered")]
    AeClosed(String),
}

/// Enrollment-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    #[error("Invalid enrollment state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Failed to decode static DIF information: {0}")]
    DecodeFailed(String),

    #[error("Failed to set up data transfer: {0}")]
    SetupFailed(String),

    #[error("Enrollment timeout after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Enrollment with {0} was rejected")]
    Rejected(String),

    #[error("Address pool exhausted")]
    AddressPoolExhausted,

    #[error(transparent)]
    Cdap(#[from] CdapError),
}

/// Data transfer (PDU dispatch) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DtError {
    #[error("No route to {dst} in QoS cube {qc}")]
    NoRoute { qc: u8, dst: u64 },

    #[error("No local target registered on descriptor {0}")]
    PermissionDenied(u64),

    #[error("Reserved descriptors depleted")]
    ResourceExhausted,

    #[error("Descriptor {0} is not registered")]
    NotRegistered(u64),

    #[error("Invalid PCI: {0}")]
    InvalidPci(String),

    #[error("Invalid data transfer constants: {0}")]
    InvalidConstants(String),

    #[error("Data transfer is not configured")]
    NotConfigured,

    #[error("Destination {0} is the local address")]
    LocalDestination(u64),

    #[error("Invalid QoS cube {0}")]
    InvalidQosCube(u8),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Serialization/deserialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Postcard serialization failed: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("TOML parsing failed: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<String> for IpcpError {
    fn from(s: String) -> Self {
        IpcpError::Config(s)
    }
}

impl From<&str> for IpcpError {
    fn from(s: &str) -> Self {
        IpcpError::Config(s.to_string())
    }
}
