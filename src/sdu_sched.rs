// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! SDU scheduler
//!
//! Runs one reader task per data-transfer flow and feeds every unit it
//! reads into [`DataTransfer::on_receive`]. A flow whose read fails is
//! dropped and released.

use crate::dt::DataTransfer;
use crate::qos::QosCube;
use crate::shim::{FlowId, FlowSubstrate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct SduScheduler {
    substrate: Arc<dyn FlowSubstrate>,
    dt: Arc<DataTransfer>,
    readers: Mutex<HashMap<FlowId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl SduScheduler {
    pub fn new(
        substrate: Arc<dyn FlowSubstrate>,
        dt: Arc<DataTransfer>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            dt,
            readers: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Starts reading `fd`; returns false if it is already scheduled
    pub fn add(self: &Arc<Self>, fd: FlowId, qc: QosCube) -> bool {
        let token = {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            if readers.contains_key(&fd) {
                return false;
            }
            let token = self.shutdown.child_token();
            readers.insert(fd, token.clone());
            token
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.read_loop(fd, qc, token).await;
        });

        debug!(%fd, %qc, "Scheduled data-transfer flow");
        true
    }

    /// Stops reading `fd`, releases it and forgets the routes through it
    pub fn remove(&self, fd: FlowId) -> bool {
        let token = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);

        match token {
            Some(token) => {
                token.cancel();
                self.substrate.release(fd);
                let purged = self.dt.purge_next_hop(fd);
                debug!(%fd, purged, "Unscheduled data-transfer flow");
                true
            }
            None => false,
        }
    }

    /// Flows currently scheduled
    pub fn flows(&self) -> Vec<FlowId> {
        let mut flows: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        flows.sort();
        flows
    }

    async fn read_loop(&self, fd: FlowId, qc: QosCube, token: CancellationToken) {
        loop {
            let pdu = tokio::select! {
                _ = token.cancelled() => return,
                pdu = self.substrate.read(fd) => pdu,
            };

            match pdu {
                Ok(pdu) => {
                    if let Err(e) = self.dt.on_receive(fd, qc, pdu) {
                        trace!(%fd, error = %e, "Dropped PDU");
                    }
                }
                Err(e) => {
                    debug!(%fd, error = %e, "Data-transfer flow failed");
                    break;
                }
            }
        }

        self.remove(fd);
    }
}
