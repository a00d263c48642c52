// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! End-to-end PDU dispatch across a chain of enrolled IPCPs

use ari_normal::{Dif, DtError, IpcpConfiguration, QosCube, QosSpec, SduHandler};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Sink(mpsc::UnboundedSender<BytesMut>);

impl SduHandler for Sink {
    fn post_sdu(&self, sdu: BytesMut) {
        let _ = self.0.send(sdu);
    }
}

async fn chain(members: usize) -> Dif {
    let config = IpcpConfiguration {
        name: "hop".to_string(),
        members,
        enrollment_timeout_secs: 2,
        enrollment_initial_backoff_ms: 10,
        ..IpcpConfiguration::default()
    };
    let mut dif = Dif::new(&config).unwrap();
    dif.form().await.unwrap();
    dif.connect_chain(QosSpec::best_effort()).await.unwrap();
    dif
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<BytesMut>) -> BytesMut {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("SDU not delivered")
        .expect("sink closed")
}

#[tokio::test]
async fn test_sdu_crosses_the_chain() {
    let dif = chain(3).await;
    let (first, middle, last) = (&dif.members()[0], &dif.members()[1], &dif.members()[2]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eid = last.dt().register_local_target(Arc::new(Sink(tx))).unwrap();
    let dst = last.address().unwrap();

    first.dt().send(dst, QosCube::BestEffort, eid, b"one").unwrap();
    first.dt().send(dst, QosCube::BestEffort, eid, b"two").unwrap();

    assert_eq!(&recv(&mut rx).await[..], b"one");
    assert_eq!(&recv(&mut rx).await[..], b"two");

    assert_eq!(first.dt().stats().sent, 2);
    tokio::time::timeout(Duration::from_secs(2), async {
        while middle.dt().stats().forwarded < 2 || last.dt().stats().delivered < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(middle.dt().stats().dropped_ttl, 0);

    dif.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reverse_direction() {
    let dif = chain(3).await;
    let (first, last) = (&dif.members()[0], &dif.members()[2]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eid = first.dt().register_local_target(Arc::new(Sink(tx))).unwrap();

    last.dt()
        .send(first.address().unwrap(), QosCube::BestEffort, eid, b"back")
        .unwrap();
    assert_eq!(&recv(&mut rx).await[..], b"back");

    dif.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unroutable_destinations() {
    let dif = chain(2).await;
    let first = &dif.members()[0];
    let second_addr = dif.members()[1].address().unwrap();

    assert!(matches!(
        first.dt().send(200, QosCube::BestEffort, 0, b"x"),
        Err(DtError::NoRoute { dst: 200, .. })
    ));
    // Routes were only installed for the best-effort cube
    assert!(matches!(
        first.dt().send(second_addr, QosCube::Voice, 0, b"x"),
        Err(DtError::NoRoute { qc: 2, .. })
    ));
    assert!(matches!(
        first.dt().send(first.address().unwrap(), QosCube::BestEffort, 0, b"x"),
        Err(DtError::LocalDestination(_))
    ));

    dif.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_target_is_not_delivered() {
    let dif = chain(2).await;
    let (first, second) = (&dif.members()[0], &dif.members()[1]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eid = second.dt().register_local_target(Arc::new(Sink(tx))).unwrap();
    second.dt().unregister_local_target(eid).unwrap();

    first
        .dt()
        .send(second.address().unwrap(), QosCube::BestEffort, eid, b"lost")
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while second.dt().stats().unregistered == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(rx.try_recv().is_err());

    dif.shutdown().await.unwrap();
}
