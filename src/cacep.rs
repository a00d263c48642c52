// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Common Application Connection Establishment (CACEP)
//!
//! Two application entities exchange a [`ConnInfo`] over a freshly
//! allocated flow before they talk to each other. The record names the AE
//! and the protocol it speaks, with the version and concrete syntax it
//! prefers.

use crate::error::FlowError;
use crate::shim::{FlowId, FlowSubstrate};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concrete syntax used to encode an application protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcreteSyntax {
    #[default]
    Gpb,
    Asn1,
    Fixed,
}

impl fmt::Display for ConcreteSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteSyntax::Gpb => write!(f, "GPB"),
            ConcreteSyntax::Asn1 => write!(f, "ASN.1"),
            ConcreteSyntax::Fixed => write!(f, "FIXED"),
        }
    }
}

/// Identity record exchanged during connection establishment
///
/// The all-empty default record is the failure reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Name of the application entity
    pub ae_name: String,
    /// Application protocol spoken over the connection
    pub protocol: String,
    /// Preferred protocol version
    pub pref_version: u32,
    /// Preferred concrete syntax
    pub pref_syntax: ConcreteSyntax,
    /// DIF address of the process (0 when not yet known)
    pub addr: u64,
}

impl ConnInfo {
    pub fn new(ae_name: &str, protocol: &str, pref_version: u32, pref_syntax: ConcreteSyntax) -> Self {
        Self {
            ae_name: ae_name.to_string(),
            protocol: protocol.to_string(),
            pref_version,
            pref_syntax,
            addr: 0,
        }
    }

    /// Whether this is the negotiated failure reply
    pub fn is_failure(&self) -> bool {
        self.ae_name.is_empty()
    }

    /// Whether a peer record speaks the same protocol as this one
    pub fn is_compatible(&self, peer: &ConnInfo) -> bool {
        self.protocol == peer.protocol
            && self.pref_version == peer.pref_version
            && self.pref_syntax == peer.pref_syntax
    }
}

/// Identity exchange over a raw flow
#[async_trait]
pub trait Negotiator: Send + Sync + fmt::Debug {
    async fn send_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
        info: &ConnInfo,
    ) -> Result<(), FlowError>;

    async fn receive_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
    ) -> Result<ConnInfo, FlowError>;
}

/// One postcard frame per identity record
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardCacep;

#[async_trait]
impl Negotiator for PostcardCacep {
    async fn send_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
        info: &ConnInfo,
    ) -> Result<(), FlowError> {
        let frame = postcard::to_allocvec(info)
            .map_err(|e| FlowError::AcceptFailed(format!("encode identity: {e}")))?;
        substrate.write(fd, Bytes::from(frame))
    }

    async fn receive_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
    ) -> Result<ConnInfo, FlowError> {
        let frame = substrate.read(fd).await?;
        let info: ConnInfo = postcard::from_bytes(&frame)
            .map_err(|e| FlowError::AcceptFailed(format!("decode identity: {e}")))?;

        if info.is_failure() {
            return Err(FlowError::AcceptFailed("peer refused connection".to_string()));
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QosSpec;
    use crate::shim::MemoryFabric;

    #[tokio::test]
    async fn test_identity_exchange() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let b = fabric.attach("b");
        let fd_a = a.dial("b", QosSpec::default()).await.unwrap();
        let (fd_b, _) = b.accept().await.unwrap();

        let info = ConnInfo {
            addr: 42,
            ..ConnInfo::new("management", "cdap", 1, ConcreteSyntax::Gpb)
        };
        PostcardCacep.send_identity(a.as_ref(), fd_a, &info).await.unwrap();
        let received = PostcardCacep.receive_identity(b.as_ref(), fd_b).await.unwrap();
        assert_eq!(received, info);
    }

    #[tokio::test]
    async fn test_failure_reply_is_error() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let b = fabric.attach("b");
        let fd_a = a.dial("b", QosSpec::default()).await.unwrap();
        let (fd_b, _) = b.accept().await.unwrap();

        PostcardCacep
            .send_identity(b.as_ref(), fd_b, &ConnInfo::default())
            .await
            .unwrap();
        assert!(PostcardCacep.receive_identity(a.as_ref(), fd_a).await.is_err());
    }

    #[test]
    fn test_compatibility() {
        let ours = ConnInfo::new("dt", "dtp", 1, ConcreteSyntax::Fixed);
        let mut theirs = ours.clone();
        theirs.ae_name = "other".to_string();
        assert!(ours.is_compatible(&theirs));

        theirs.pref_version = 2;
        assert!(!ours.is_compatible(&theirs));
    }
}
