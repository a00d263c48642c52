// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! The core of a RINA normal IPC Process.
//!
//! This crate contains the connection manager that turns lower-layer flows
//! into negotiated application connections, the enrollment state machine
//! through which an IPCP joins a DIF (Distributed IPC Facility), and the
//! PDU dispatch engine that delivers or forwards data-transfer PDUs.

// Public module declarations
pub mod bmp;
pub mod cacep;
pub mod cdap;
pub mod config;
pub mod connmgr;
pub mod dt;
pub mod error;
pub mod ipcp;
pub mod pci;
pub mod pff;
pub mod qos;
pub mod ribmgr;
pub mod sdu_sched;
pub mod shim;

// Re-export commonly used types
pub use bmp::{AddressPool, AddressRange, IdAllocator};
pub use cacep::{ConcreteSyntax, ConnInfo, Negotiator, PostcardCacep};
pub use cdap::{CdapHandler, CdapInstance, CdapMessage, CdapOpCode};
pub use config::{CliArgs, IpcpConfiguration};
pub use connmgr::{AeHandle, Conn, ConnectionManager};
pub use dt::{DataTransfer, DtStatsSnapshot, SduHandler};
pub use error::{
    CdapError, ConnMgrError, DtError, EnrollmentError, FlowError, IpcpError, SerializationError,
};
pub use ipcp::{IpcProcess, IpcpState, IpcpStatus};
pub use pci::{DtConstants, DtPci, PciCodec};
pub use pff::Pff;
pub use qos::{QosCube, QosSpec};
pub use ribmgr::{EnrollmentState, EnrollmentStatus, RibManager};
pub use sdu_sched::SduScheduler;
pub use shim::{FlowId, FlowSubstrate, MemoryFabric, MemoryShim};

use std::sync::Arc;

/// Represents a Distributed IPC Facility (DIF) hosted in one process.
///
/// All members share one in-memory fabric. The first member bootstraps the
/// DIF and every other member enrolls through its predecessor, which hands
/// it an address and a share of its own address pool. Data-transfer
/// adjacencies form the same chain.
#[derive(Debug)]
pub struct Dif {
    /// Name of this DIF
    pub name: String,
    members: Vec<Arc<IpcProcess>>,
    /// Per member: flows towards the previous and the next member
    links: Vec<(Option<FlowId>, Option<FlowId>)>,
}

impl Dif {
    /// Creates the members described by `config`, without starting them
    pub fn new(config: &IpcpConfiguration) -> Result<Self, IpcpError> {
        let fabric = MemoryFabric::new();
        let members = (0..config.members)
            .map(|i| {
                let member = config.member(i);
                let shim = fabric.attach(&member.name);
                IpcProcess::new(member, shim)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.dif_name.clone(),
            links: vec![(None, None); members.len()],
            members,
        })
    }

    pub fn members(&self) -> &[Arc<IpcProcess>] {
        &self.members
    }

    /// Returns the number of member IPCPs
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Starts every member, bootstraps the first and enrolls each of the
    /// others with the member before it
    pub async fn form(&self) -> Result<(), IpcpError> {
        for member in &self.members {
            member.start()?;
        }

        let Some(first) = self.members.first() else {
            return Ok(());
        };
        first.bootstrap()?;

        for pair in self.members.windows(2) {
            pair[1].enroll(pair[0].name()).await?;
        }
        Ok(())
    }

    /// Opens data-transfer flows between neighbors and fills every
    /// forwarding table along the chain
    pub async fn connect_chain(&mut self, qos: QosSpec) -> Result<(), IpcpError> {
        for i in 1..self.members.len() {
            let (prev, next) = (&self.members[i - 1], &self.members[i]);
            self.links[i - 1].1 = Some(prev.connect_dt(next.name(), qos).await?);
            self.links[i].0 = Some(next.connect_dt(prev.name(), qos).await?);
        }

        let addresses = self
            .members
            .iter()
            .map(|m| m.address().ok_or(DtError::NotConfigured))
            .collect::<Result<Vec<_>, _>>()?;

        let qc = qos.cube();
        for (i, member) in self.members.iter().enumerate() {
            let (towards_prev, towards_next) = self.links[i];
            let pff = member.dt().pff(qc);
            pff.flush();

            for (j, &dst) in addresses.iter().enumerate() {
                let hop = match j.cmp(&i) {
                    std::cmp::Ordering::Less => towards_prev,
                    std::cmp::Ordering::Greater => towards_next,
                    std::cmp::Ordering::Equal => None,
                };
                if let Some(hop) = hop {
                    pff.add(dst, hop);
                }
            }
        }
        Ok(())
    }

    /// Shuts every member down
    pub async fn shutdown(&self) -> Result<(), IpcpError> {
        for member in &self.members {
            member.shutdown().await?;
        }
        Ok(())
    }
}
