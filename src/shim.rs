// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shim Layer - lower-layer flow substrate
//!
//! The normal IPCP runs on top of flows provided by a lower layer. This
//! module defines the [`FlowSubstrate`] contract the IPCP consumes and an
//! in-process implementation, [`MemoryFabric`], that connects any number of
//! IPCPs inside one process.
//!
//! `accept`, `dial` and `read` may suspend. `write` and `release` never do,
//! so that the PDU dispatch path stays non-blocking.

use crate::error::FlowError;
use crate::qos::QosSpec;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handle of a lower-layer flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flow allocation and I/O primitives provided by the layer below
#[async_trait]
pub trait FlowSubstrate: Send + Sync + fmt::Debug {
    /// Waits for the next incoming flow
    async fn accept(&self) -> Result<(FlowId, QosSpec), FlowError>;

    /// Allocates a flow towards a named process
    async fn dial(&self, dst_name: &str, qos: QosSpec) -> Result<FlowId, FlowError>;

    /// Waits for the next unit on a flow
    async fn read(&self, fd: FlowId) -> Result<BytesMut, FlowError>;

    /// Queues a unit on a flow without blocking
    fn write(&self, fd: FlowId, sdu: Bytes) -> Result<(), FlowError>;

    /// Deallocates a flow; unknown flows are ignored
    fn release(&self, fd: FlowId);
}

/// One end of an in-memory flow
#[derive(Debug)]
struct FlowEnd {
    /// Units towards the peer end
    tx: mpsc::UnboundedSender<Bytes>,
    /// Units from the peer end
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    /// Cancelled when this end is released
    closed: CancellationToken,
}

/// Per-process state of a shim attached to the fabric
#[derive(Debug)]
struct ShimCore {
    backlog_tx: mpsc::UnboundedSender<(FlowId, QosSpec)>,
    backlog_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(FlowId, QosSpec)>>,
    flows: Mutex<HashMap<FlowId, FlowEnd>>,
}

impl ShimCore {
    fn new() -> Self {
        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        Self {
            backlog_tx,
            backlog_rx: tokio::sync::Mutex::new(backlog_rx),
            flows: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, fd: FlowId, end: FlowEnd) {
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fd, end);
    }
}

/// In-process lower layer connecting named shims
#[derive(Debug, Default)]
pub struct MemoryFabric {
    shims: Mutex<HashMap<String, Arc<ShimCore>>>,
    next_flow_id: AtomicU64,
}

impl MemoryFabric {
    /// Creates an empty fabric
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shims: Mutex::new(HashMap::new()),
            next_flow_id: AtomicU64::new(1000),
        })
    }

    /// Attaches a process under `name`, replacing any previous attachment
    pub fn attach(self: &Arc<Self>, name: &str) -> Arc<MemoryShim> {
        let core = Arc::new(ShimCore::new());
        self.shims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), core.clone());

        debug!(name, "Attached shim to memory fabric");

        Arc::new(MemoryShim {
            name: name.to_string(),
            core,
            fabric: self.clone(),
        })
    }

    fn lookup(&self, name: &str) -> Option<Arc<ShimCore>> {
        self.shims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn next_flow_id(&self) -> FlowId {
        FlowId(self.next_flow_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A process's view of the [`MemoryFabric`]
pub struct MemoryShim {
    name: String,
    core: Arc<ShimCore>,
    fabric: Arc<MemoryFabric>,
}

impl MemoryShim {
    /// Name this shim is attached under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of flows currently allocated on this shim
    pub fn flow_count(&self) -> usize {
        self.core
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `fd` is currently allocated on this shim
    pub fn has_flow(&self, fd: FlowId) -> bool {
        self.core
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&fd)
    }
}

impl fmt::Debug for MemoryShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryShim")
            .field("name", &self.name)
            .field("flows", &self.flow_count())
            .finish()
    }
}

#[async_trait]
impl FlowSubstrate for MemoryShim {
    async fn accept(&self) -> Result<(FlowId, QosSpec), FlowError> {
        let mut backlog = self.core.backlog_rx.lock().await;
        backlog.recv().await.ok_or(FlowError::ShuttingDown)
    }

    async fn dial(&self, dst_name: &str, qos: QosSpec) -> Result<FlowId, FlowError> {
        let peer = self
            .fabric
            .lookup(dst_name)
            .ok_or_else(|| FlowError::AllocFailed {
                name: dst_name.to_string(),
                reason: "name not attached to fabric".to_string(),
            })?;

        let (to_peer, from_local) = mpsc::unbounded_channel();
        let (to_local, from_peer) = mpsc::unbounded_channel();

        let local_fd = self.fabric.next_flow_id();
        let peer_fd = self.fabric.next_flow_id();

        peer.insert(
            peer_fd,
            FlowEnd {
                tx: to_local,
                rx: Arc::new(tokio::sync::Mutex::new(from_local)),
                closed: CancellationToken::new(),
            },
        );

        if peer.backlog_tx.send((peer_fd, qos)).is_err() {
            peer.flows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&peer_fd);
            return Err(FlowError::AllocFailed {
                name: dst_name.to_string(),
                reason: "peer is not accepting flows".to_string(),
            });
        }

        self.core.insert(
            local_fd,
            FlowEnd {
                tx: to_peer,
                rx: Arc::new(tokio::sync::Mutex::new(from_peer)),
                closed: CancellationToken::new(),
            },
        );

        trace!(from = %self.name, to = dst_name, %local_fd, %peer_fd, "Allocated flow");

        Ok(local_fd)
    }

    async fn read(&self, fd: FlowId) -> Result<BytesMut, FlowError> {
        let (rx, closed) = {
            let flows = self
                .core
                .flows
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let end = flows.get(&fd).ok_or(FlowError::UnknownFlow(fd))?;
            (end.rx.clone(), end.closed.clone())
        };

        let mut rx = rx.lock().await;
        tokio::select! {
            _ = closed.cancelled() => Err(FlowError::Closed(fd)),
            unit = rx.recv() => match unit {
                Some(bytes) => Ok(BytesMut::from(bytes.as_ref())),
                None => Err(FlowError::Closed(fd)),
            },
        }
    }

    fn write(&self, fd: FlowId, sdu: Bytes) -> Result<(), FlowError> {
        let flows = self
            .core
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let end = flows.get(&fd).ok_or(FlowError::UnknownFlow(fd))?;
        end.tx.send(sdu).map_err(|_| FlowError::WriteFailed(fd))
    }

    fn release(&self, fd: FlowId) {
        let end = self
            .core
            .flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);

        if let Some(end) = end {
            end.closed.cancel();
            trace!(shim = %self.name, %fd, "Released flow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_accept_and_exchange() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let b = fabric.attach("b");

        let fd_a = a.dial("b", QosSpec::video()).await.unwrap();
        let (fd_b, qos) = b.accept().await.unwrap();
        assert_eq!(qos, QosSpec::video());

        a.write(fd_a, Bytes::from_static(b"ping")).unwrap();
        assert_eq!(&b.read(fd_b).await.unwrap()[..], b"ping");

        b.write(fd_b, Bytes::from_static(b"pong")).unwrap();
        assert_eq!(&a.read(fd_a).await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_dial_unknown_name() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");

        let result = a.dial("nobody", QosSpec::default()).await;
        assert!(matches!(result, Err(FlowError::AllocFailed { .. })));
    }

    #[tokio::test]
    async fn test_release_closes_both_directions() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let b = fabric.attach("b");

        let fd_a = a.dial("b", QosSpec::default()).await.unwrap();
        let (fd_b, _) = b.accept().await.unwrap();

        a.release(fd_a);
        assert!(!a.has_flow(fd_a));
        assert_eq!(b.read(fd_b).await, Err(FlowError::Closed(fd_b)));
        assert_eq!(
            a.write(fd_a, Bytes::from_static(b"x")),
            Err(FlowError::UnknownFlow(fd_a))
        );
    }

    #[tokio::test]
    async fn test_release_wakes_pending_reader() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let _b = fabric.attach("b");

        let fd = a.dial("b", QosSpec::default()).await.unwrap();
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read(fd).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        a.release(fd);

        assert_eq!(reader.await.unwrap(), Err(FlowError::Closed(fd)));
    }
}
