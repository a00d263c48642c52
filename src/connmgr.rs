// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Connection Manager
//!
//! Multiplexes one acceptor over every application entity (AE) registered
//! by the IPCP. Each incoming flow is negotiated with CACEP, matched to the
//! AE the peer asked for, and queued on that AE until a consumer picks it
//! up with [`ConnectionManager::wait_connection`]. Outbound connections are
//! set up with [`ConnectionManager::dial`].
//!
//! The registry is a reader/writer lock; every AE has its own queue lock and
//! wakeup, so unrelated AEs never contend.

use crate::cacep::{ConnInfo, Negotiator};
use crate::error::{ConnMgrError, FlowError};
use crate::qos::QosSpec;
use crate::shim::{FlowId, FlowSubstrate};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for a peer to send its identity
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A negotiated application connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conn {
    /// Lower-layer flow carrying the connection
    pub fd: FlowId,
    /// QoS the flow was allocated with
    pub qos: QosSpec,
    /// Identity the peer presented
    pub peer: ConnInfo,
}

/// A registered application entity
#[derive(Debug)]
pub struct Ae {
    info: ConnInfo,
    queue: Mutex<VecDeque<Conn>>,
    notify: Notify,
    closed: CancellationToken,
}

/// Shared handle to a registered AE
pub type AeHandle = Arc<Ae>;

impl Ae {
    fn new(info: ConnInfo) -> Self {
        Self {
            info,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.ae_name
    }

    /// Identity presented to peers
    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Connections waiting to be picked up
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the AE has been unregistered
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn push(&self, conn: Conn) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(conn);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Conn> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn drain(&self) -> Vec<Conn> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Registry of local AEs plus the acceptor that feeds them
#[derive(Debug)]
pub struct ConnectionManager {
    substrate: Arc<dyn FlowSubstrate>,
    negotiator: Arc<dyn Negotiator>,
    registry: RwLock<Vec<AeHandle>>,
}

impl ConnectionManager {
    pub fn new(substrate: Arc<dyn FlowSubstrate>, negotiator: Arc<dyn Negotiator>) -> Self {
        Self {
            substrate,
            negotiator,
            registry: RwLock::new(Vec::new()),
        }
    }

    /// Registers an AE; names must be unique
    pub fn register_ae(&self, info: ConnInfo) -> Result<AeHandle, ConnMgrError> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);

        if registry.iter().any(|ae| ae.info.ae_name == info.ae_name) {
            return Err(ConnMgrError::DuplicateName(info.ae_name));
        }

        let ae = Arc::new(Ae::new(info));
        registry.push(ae.clone());

        info!(ae = ae.name(), protocol = %ae.info.protocol, "Registered AE");
        Ok(ae)
    }

    /// Unregisters an AE, releasing any connection still queued on it
    ///
    /// Consumers blocked in `wait_connection` are woken with `AeClosed`.
    pub fn unregister_ae(&self, ae: &AeHandle) -> Result<(), ConnMgrError> {
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let idx = registry
                .iter()
                .position(|r| Arc::ptr_eq(r, ae))
                .ok_or_else(|| ConnMgrError::UnknownAe(ae.name().to_string()))?;
            registry.remove(idx);
            ae.closed.cancel();
        }

        for conn in ae.drain() {
            debug!(ae = ae.name(), fd = %conn.fd, "Releasing queued connection");
            self.substrate.release(conn.fd);
        }

        info!(ae = ae.name(), "Unregistered AE");
        Ok(())
    }

    /// Names of registered AEs, in registration order
    pub fn registered(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|ae| ae.info.ae_name.clone())
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<AeHandle> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|ae| ae.info.ae_name == name)
            .cloned()
    }

    /// Accepts and negotiates incoming flows until `shutdown` fires
    ///
    /// A flow that fails at any step is released; the loop carries on with
    /// the next one. Shutdown is only observed between flows, never in the
    /// middle of a negotiation.
    pub async fn accept_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Connection acceptor started");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.substrate.accept() => accepted,
            };

            let (fd, qos) = match accepted {
                Ok(flow) => flow,
                Err(FlowError::ShuttingDown) => break,
                Err(e) => {
                    warn!(error = %e, "Flow accept failed");
                    continue;
                }
            };

            match self.handle_flow(fd, qos).await {
                Ok(ae) => debug!(%fd, ae, "Queued new connection"),
                Err(e) => {
                    warn!(%fd, error = %e, "Dropping incoming flow");
                    self.substrate.release(fd);
                }
            }
        }

        info!("Connection acceptor stopped");
    }

    async fn handle_flow(&self, fd: FlowId, qos: QosSpec) -> Result<String, ConnMgrError> {
        let peer = self.receive_identity(fd).await?;

        let Some(ae) = self.lookup(&peer.ae_name) else {
            let _ = self
                .negotiator
                .send_identity(self.substrate.as_ref(), fd, &ConnInfo::default())
                .await;
            return Err(ConnMgrError::UnknownAe(peer.ae_name));
        };

        self.negotiator
            .send_identity(self.substrate.as_ref(), fd, &ae.info)
            .await
            .map_err(|e| ConnMgrError::NegotiationFailed(e.to_string()))?;

        // Only queue on an AE that is still registered, so that a
        // concurrent unregistration never leaves a connection behind.
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if !registry.iter().any(|r| Arc::ptr_eq(r, &ae)) {
            return Err(ConnMgrError::AeClosed(ae.info.ae_name.clone()));
        }
        ae.push(Conn { fd, qos, peer });

        Ok(ae.info.ae_name.clone())
    }

    async fn receive_identity(&self, fd: FlowId) -> Result<ConnInfo, ConnMgrError> {
        tokio::time::timeout(
            NEGOTIATION_TIMEOUT,
            self.negotiator.receive_identity(self.substrate.as_ref(), fd),
        )
        .await
        .map_err(|_| ConnMgrError::NegotiationFailed("peer identity timed out".to_string()))?
        .map_err(|e| ConnMgrError::NegotiationFailed(e.to_string()))
    }

    /// Sets up an outbound connection from `ae` to the process `dst_name`
    ///
    /// The peer must agree on protocol, version and syntax; otherwise the
    /// flow is released and the call fails. A flow that cannot be
    /// allocated at all fails the same way.
    pub async fn dial(&self, ae: &AeHandle, dst_name: &str, qos: QosSpec) -> Result<Conn, ConnMgrError> {
        let fd = self
            .substrate
            .dial(dst_name, qos)
            .await
            .map_err(|e| ConnMgrError::NegotiationFailed(format!("flow allocation failed: {e}")))?;

        match self.negotiate_outbound(ae, fd).await {
            Ok(peer) => {
                debug!(ae = ae.name(), dst = dst_name, %fd, "Connection established");
                Ok(Conn { fd, qos, peer })
            }
            Err(e) => {
                self.substrate.release(fd);
                Err(e)
            }
        }
    }

    async fn negotiate_outbound(&self, ae: &AeHandle, fd: FlowId) -> Result<ConnInfo, ConnMgrError> {
        self.negotiator
            .send_identity(self.substrate.as_ref(), fd, &ae.info)
            .await
            .map_err(|e| ConnMgrError::NegotiationFailed(e.to_string()))?;

        let peer = self.receive_identity(fd).await?;

        if !ae.info.is_compatible(&peer) {
            return Err(ConnMgrError::NegotiationFailed(format!(
                "peer speaks {} v{} ({}), expected {} v{} ({})",
                peer.protocol,
                peer.pref_version,
                peer.pref_syntax,
                ae.info.protocol,
                ae.info.pref_version,
                ae.info.pref_syntax
            )));
        }

        Ok(peer)
    }

    /// Waits for the next connection queued on `ae`, oldest first
    ///
    /// Dropping the returned future leaves the queue untouched.
    pub async fn wait_connection(&self, ae: &AeHandle) -> Result<Conn, ConnMgrError> {
        loop {
            if let Some(conn) = ae.pop() {
                return Ok(conn);
            }

            tokio::select! {
                _ = ae.closed.cancelled() => {
                    return Err(ConnMgrError::AeClosed(ae.info.ae_name.clone()));
                }
                _ = ae.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacep::{ConcreteSyntax, PostcardCacep};
    use crate::shim::{MemoryFabric, MemoryShim};
    use bytes::Bytes;

    fn mgmt() -> ConnInfo {
        ConnInfo::new("management", "cdap", 1, ConcreteSyntax::Gpb)
    }

    fn manager(shim: &Arc<MemoryShim>) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(shim.clone(), Arc::new(PostcardCacep)))
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let fabric = MemoryFabric::new();
        let cm = manager(&fabric.attach("a"));

        cm.register_ae(mgmt()).unwrap();
        assert_eq!(
            cm.register_ae(mgmt()).unwrap_err(),
            ConnMgrError::DuplicateName("management".to_string())
        );
        assert_eq!(cm.registered(), vec!["management".to_string()]);
    }

    #[test]
    fn test_unregister_twice_fails() {
        let fabric = MemoryFabric::new();
        let cm = manager(&fabric.attach("a"));

        let ae = cm.register_ae(mgmt()).unwrap();
        cm.unregister_ae(&ae).unwrap();
        assert!(ae.is_closed());
        assert!(matches!(cm.unregister_ae(&ae), Err(ConnMgrError::UnknownAe(_))));

        // The name is free again
        cm.register_ae(mgmt()).unwrap();
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        let ae_b = cm_b.register_ae(mgmt()).unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let conn = cm_a.dial(&ae_a, "b", QosSpec::voice()).await.unwrap();
        assert_eq!(conn.peer.ae_name, "management");

        let accepted = cm_b.wait_connection(&ae_b).await.unwrap();
        assert_eq!(accepted.qos, QosSpec::voice());
        assert_eq!(accepted.peer, mgmt());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dial_unknown_ae_fails() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let result = cm_a.dial(&ae_a, "b", QosSpec::default()).await;
        assert!(matches!(result, Err(ConnMgrError::NegotiationFailed(_))));
        assert_eq!(a.flow_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dial_unreachable_process_fails() {
        let fabric = MemoryFabric::new();
        let a = fabric.attach("a");
        let cm_a = manager(&a);
        let ae_a = cm_a.register_ae(mgmt()).unwrap();

        let Err(ConnMgrError::NegotiationFailed(reason)) =
            cm_a.dial(&ae_a, "nowhere", QosSpec::default()).await
        else {
            panic!("dial to an unattached name must fail negotiation");
        };
        assert!(reason.contains("nowhere"), "{reason}");
        assert_eq!(a.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_incompatible_protocol_fails() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        cm_b.register_ae(ConnInfo::new("management", "cdap", 2, ConcreteSyntax::Gpb))
            .unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let result = cm_a.dial(&ae_a, "b", QosSpec::default()).await;
        assert!(matches!(result, Err(ConnMgrError::NegotiationFailed(_))));
        assert_eq!(a.flow_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_fifo_per_ae() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        let ae_b = cm_b.register_ae(mgmt()).unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let mut dialed = Vec::new();
        for _ in 0..4 {
            dialed.push(cm_a.dial(&ae_a, "b", QosSpec::default()).await.unwrap().fd);
        }

        let mut accepted = Vec::new();
        for _ in 0..4 {
            accepted.push(cm_b.wait_connection(&ae_b).await.unwrap().fd);
        }

        // Peer flow ids are allocated in dial order
        let mut sorted = accepted.clone();
        sorted.sort();
        assert_eq!(accepted, sorted);
        assert_eq!(ae_b.pending(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_acceptor_survives_garbage_flow() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        let ae_b = cm_b.register_ae(mgmt()).unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let raw = a.dial("b", QosSpec::default()).await.unwrap();
        a.write(raw, Bytes::from_static(&[0xff; 4])).unwrap();

        let conn = cm_a.dial(&ae_a, "b", QosSpec::default()).await.unwrap();
        let accepted = cm_b.wait_connection(&ae_b).await.unwrap();
        assert_eq!(accepted.peer.ae_name, conn.peer.ae_name);
        assert_eq!(ae_b.pending(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unregister_wakes_waiter() {
        let fabric = MemoryFabric::new();
        let cm = manager(&fabric.attach("a"));
        let ae = cm.register_ae(mgmt()).unwrap();

        let waiter = {
            let (cm, ae) = (cm.clone(), ae.clone());
            tokio::spawn(async move { cm.wait_connection(&ae).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cm.unregister_ae(&ae).unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            Err(ConnMgrError::AeClosed("management".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cancelled_wait_keeps_queue() {
        let fabric = MemoryFabric::new();
        let (a, b) = (fabric.attach("a"), fabric.attach("b"));
        let (cm_a, cm_b) = (manager(&a), manager(&b));
        let shutdown = CancellationToken::new();

        let ae_a = cm_a.register_ae(mgmt()).unwrap();
        let ae_b = cm_b.register_ae(mgmt()).unwrap();
        tokio::spawn(cm_b.clone().accept_loop(shutdown.clone()));

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), cm_b.wait_connection(&ae_b)).await;
        assert!(timed_out.is_err());

        cm_a.dial(&ae_a, "b", QosSpec::default()).await.unwrap();
        assert!(cm_b.wait_connection(&ae_b).await.is_ok());

        shutdown.cancel();
    }
}
