// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Connection manager behavior with several AEs sharing one substrate

use ari_normal::{
    ConcreteSyntax, ConnInfo, ConnMgrError, ConnectionManager, FlowError, FlowId, FlowSubstrate,
    MemoryFabric, MemoryShim, Negotiator, PostcardCacep, QosSpec,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn manager(shim: &Arc<MemoryShim>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(shim.clone(), Arc::new(PostcardCacep)))
}

/// Holds every outgoing identity until the gate opens
#[derive(Debug, Default)]
struct GatedCacep {
    reached: Notify,
    gate: Notify,
}

#[async_trait]
impl Negotiator for GatedCacep {
    async fn send_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
        info: &ConnInfo,
    ) -> Result<(), FlowError> {
        self.reached.notify_one();
        self.gate.notified().await;
        PostcardCacep.send_identity(substrate, fd, info).await
    }

    async fn receive_identity(
        &self,
        substrate: &dyn FlowSubstrate,
        fd: FlowId,
    ) -> Result<ConnInfo, FlowError> {
        PostcardCacep.receive_identity(substrate, fd).await
    }
}

fn mgmt() -> ConnInfo {
    ConnInfo::new("management", "cdap", 1, ConcreteSyntax::Gpb)
}

fn data() -> ConnInfo {
    ConnInfo::new("dt", "dtp", 1, ConcreteSyntax::Fixed)
}

#[tokio::test]
async fn test_connections_reach_their_own_ae_in_order() {
    let fabric = MemoryFabric::new();
    let server = manager(&fabric.attach("server"));
    let client = manager(&fabric.attach("client"));

    let server_mgmt = server.register_ae(mgmt()).unwrap();
    let server_dt = server.register_ae(data()).unwrap();
    let client_mgmt = client.register_ae(mgmt()).unwrap();
    let client_dt = client.register_ae(data()).unwrap();

    let shutdown = CancellationToken::new();
    let acceptor = tokio::spawn(server.clone().accept_loop(shutdown.clone()));

    let first = client.dial(&client_mgmt, "server", QosSpec::best_effort()).await.unwrap();
    let video = client.dial(&client_dt, "server", QosSpec::video()).await.unwrap();
    let second = client.dial(&client_mgmt, "server", QosSpec::voice()).await.unwrap();
    assert_ne!(first.fd, second.fd);
    assert_eq!(first.peer.ae_name, "management");

    let conn = server.wait_connection(&server_mgmt).await.unwrap();
    assert_eq!(conn.qos, QosSpec::best_effort());
    assert_eq!(conn.peer, mgmt());
    let conn = server.wait_connection(&server_mgmt).await.unwrap();
    assert_eq!(conn.qos, QosSpec::voice());

    let conn = server.wait_connection(&server_dt).await.unwrap();
    assert_eq!(conn.qos, video.qos);
    assert_eq!(conn.peer.protocol, "dtp");
    assert_eq!(server_dt.pending(), 0);

    shutdown.cancel();
    acceptor.await.unwrap();
}

#[tokio::test]
async fn test_incompatible_peer_is_refused() {
    let fabric = MemoryFabric::new();
    let server = manager(&fabric.attach("server"));
    let client = manager(&fabric.attach("client"));

    server
        .register_ae(ConnInfo::new("management", "cdap", 2, ConcreteSyntax::Gpb))
        .unwrap();
    let client_mgmt = client.register_ae(mgmt()).unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(server.clone().accept_loop(shutdown.clone()));

    let result = client.dial(&client_mgmt, "server", QosSpec::default()).await;
    assert!(matches!(result, Err(ConnMgrError::NegotiationFailed(_))));

    shutdown.cancel();
}

#[tokio::test]
async fn test_unregister_wakes_waiter() {
    let fabric = MemoryFabric::new();
    let server = manager(&fabric.attach("server"));
    let ae = server.register_ae(mgmt()).unwrap();

    let waiter = {
        let server = server.clone();
        let ae = ae.clone();
        tokio::spawn(async move { server.wait_connection(&ae).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.unregister_ae(&ae).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConnMgrError::AeClosed(_))));

    // The name can be taken again
    server.register_ae(mgmt()).unwrap();
}

#[tokio::test]
async fn test_unregister_during_negotiation_drops_the_flow() {
    let fabric = MemoryFabric::new();
    let server_shim = fabric.attach("server");
    let negotiator = Arc::new(GatedCacep::default());
    let server = Arc::new(ConnectionManager::new(server_shim.clone(), negotiator.clone()));
    let client = manager(&fabric.attach("client"));

    let ae = server.register_ae(mgmt()).unwrap();
    let client_mgmt = client.register_ae(mgmt()).unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(server.clone().accept_loop(shutdown.clone()));
    tokio::spawn(async move { client.dial(&client_mgmt, "server", QosSpec::default()).await });

    // The server has matched the AE and is answering the peer
    tokio::time::timeout(Duration::from_secs(2), negotiator.reached.notified())
        .await
        .unwrap();
    server.unregister_ae(&ae).unwrap();
    negotiator.gate.notify_one();

    assert_eq!(
        server.wait_connection(&ae).await,
        Err(ConnMgrError::AeClosed("management".to_string()))
    );
    tokio::time::timeout(Duration::from_secs(2), async {
        while server_shim.flow_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(ae.pending(), 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_dial_to_unknown_process_fails_negotiation() {
    let fabric = MemoryFabric::new();
    let client_shim = fabric.attach("client");
    let client = manager(&client_shim);
    let ae = client.register_ae(mgmt()).unwrap();

    let result = client.dial(&ae, "ghost", QosSpec::default()).await;
    assert!(matches!(result, Err(ConnMgrError::NegotiationFailed(_))));
    assert_eq!(client_shim.flow_count(), 0);
}
