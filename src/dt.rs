// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Data Transfer: PDU dispatch
//!
//! Every PDU read off a data-transfer flow is either forwarded towards its
//! destination or, when addressed to this IPCP, stripped of its PCI and
//! handed to the local target named by its endpoint id. Local senders go
//! through [`DataTransfer::send`], which attaches the PCI and picks the
//! next hop.
//!
//! Dispatch never suspends: lookups take short locks, writes go through the
//! substrate's non-blocking `write`. Dropped PDUs are counted in [`DtStats`]
//! and reported, never retried.

use crate::bmp::IdAllocator;
use crate::error::DtError;
use crate::pci::{DtConstants, DtPci, PciCodec};
use crate::pff::Pff;
use crate::qos::{QOS_CUBE_MAX, QosCube};
use crate::ribmgr::DtSetup;
use crate::shim::{FlowId, FlowSubstrate};
use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, trace};

/// Consumer of SDUs delivered to a local descriptor
pub trait SduHandler: Send + Sync {
    /// Takes ownership of an SDU with the PCI already stripped
    fn post_sdu(&self, sdu: BytesMut);
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DtStats {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    sent: AtomicU64,
    dropped_ttl: AtomicU64,
    no_route: AtomicU64,
    unregistered: AtomicU64,
    write_failed: AtomicU64,
    invalid_pci: AtomicU64,
}

/// Point-in-time copy of [`DtStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DtStatsSnapshot {
    pub delivered: u64,
    pub forwarded: u64,
    pub sent: u64,
    pub dropped_ttl: u64,
    pub no_route: u64,
    pub unregistered: u64,
    pub write_failed: u64,
    pub invalid_pci: u64,
}

impl DtStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DtStatsSnapshot {
        DtStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped_ttl: self.dropped_ttl.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            write_failed: self.write_failed.load(Ordering::Relaxed),
            invalid_pci: self.invalid_pci.load(Ordering::Relaxed),
        }
    }
}

/// Parameters committed by bootstrap or enrollment
#[derive(Debug, Clone)]
struct Committed {
    address: u64,
    codec: PciCodec,
}

struct LocalTable {
    ids: IdAllocator,
    targets: Vec<Option<Arc<dyn SduHandler>>>,
}

/// The PDU dispatch engine
pub struct DataTransfer {
    committed: RwLock<Option<Committed>>,
    pff: [Pff; QOS_CUBE_MAX],
    local: RwLock<LocalTable>,
    reserved_fds: u64,
    default_ttl: u64,
    substrate: Arc<dyn FlowSubstrate>,
    stats: DtStats,
}

impl fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTransfer")
            .field("address", &self.address())
            .field("reserved_fds", &self.reserved_fds)
            .field("default_ttl", &self.default_ttl)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl DataTransfer {
    /// Creates an engine with `reserved_fds` local descriptors
    ///
    /// PDUs can only be dispatched once [`DtSetup::setup`] has committed
    /// the constants and the own address.
    pub fn new(substrate: Arc<dyn FlowSubstrate>, reserved_fds: usize, default_ttl: u64) -> Self {
        Self {
            committed: RwLock::new(None),
            pff: std::array::from_fn(|_| Pff::new()),
            local: RwLock::new(LocalTable {
                ids: IdAllocator::new(reserved_fds, 0),
                targets: (0..reserved_fds).map(|_| None).collect(),
            }),
            reserved_fds: reserved_fds as u64,
            default_ttl,
            substrate,
            stats: DtStats::default(),
        }
    }

    /// Own address, once committed
    pub fn address(&self) -> Option<u64> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.address)
    }

    pub fn is_configured(&self) -> bool {
        self.address().is_some()
    }

    /// Forwarding table of a QoS cube
    pub fn pff(&self, qc: QosCube) -> &Pff {
        &self.pff[qc.index()]
    }

    /// Drops every forwarding entry that leads through flow `fd`
    pub fn purge_next_hop(&self, fd: FlowId) -> usize {
        self.pff.iter().map(|pff| pff.remove_next_hop(fd)).sum()
    }

    pub fn stats(&self) -> DtStatsSnapshot {
        self.stats.snapshot()
    }

    /// Descriptors below this bound are local targets
    pub fn reserved_fds(&self) -> u64 {
        self.reserved_fds
    }

    fn committed(&self) -> Result<Committed, DtError> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DtError::NotConfigured)
    }

    /// Registers a local consumer, returning its descriptor
    pub fn register_local_target(&self, handler: Arc<dyn SduHandler>) -> Result<u64, DtError> {
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);

        let fd = local.ids.allocate().ok_or(DtError::ResourceExhausted)?;
        local.targets[fd as usize] = Some(handler);

        debug!(fd, "Registered local target");
        Ok(fd)
    }

    /// Releases a descriptor for reuse
    pub fn unregister_local_target(&self, fd: u64) -> Result<(), DtError> {
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);

        if !local.ids.release(fd) {
            return Err(DtError::NotRegistered(fd));
        }
        local.targets[fd as usize] = None;

        debug!(fd, "Unregistered local target");
        Ok(())
    }

    /// Dispatches a PDU read from flow `fd`, allocated for cube `qc`
    ///
    /// A PDU in transit stays in the cube of the flow it arrived on, so
    /// `qc` picks the forwarding table. Errors describe why the PDU was
    /// dropped; the caller only reports them.
    pub fn on_receive(&self, fd: FlowId, qc: QosCube, mut pdu: BytesMut) -> Result<(), DtError> {
        let committed = self.committed()?;
        let codec = &committed.codec;

        let pci = codec.deserialize(&pdu).inspect_err(|_| {
            DtStats::bump(&self.stats.invalid_pci);
        })?;

        trace!(%fd, %qc, dst = pci.dst_addr, ttl = pci.ttl, "Received PDU");

        if pci.dst_addr != committed.address {
            return self.forward(codec, &pci, qc, pdu);
        }

        codec.shrink(&mut pdu)?;

        if pci.eid >= self.reserved_fds {
            return self.write(FlowId(pci.eid), pdu).map(|()| {
                DtStats::bump(&self.stats.delivered);
            });
        }

        let handler = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .get(pci.eid as usize)
            .cloned()
            .flatten();

        match handler {
            Some(handler) => {
                handler.post_sdu(pdu);
                DtStats::bump(&self.stats.delivered);
                Ok(())
            }
            None => {
                DtStats::bump(&self.stats.unregistered);
                Err(DtError::PermissionDenied(pci.eid))
            }
        }
    }

    fn forward(
        &self,
        codec: &PciCodec,
        pci: &DtPci,
        qc: QosCube,
        mut pdu: BytesMut,
    ) -> Result<(), DtError> {
        if codec.has_ttl() && pci.ttl == 0 {
            DtStats::bump(&self.stats.dropped_ttl);
            trace!(dst = pci.dst_addr, "TTL expired, dropping PDU");
            return Ok(());
        }

        let Some(nhop) = self.pff[qc.index()].nhop(pci.dst_addr) else {
            DtStats::bump(&self.stats.no_route);
            return Err(DtError::NoRoute {
                qc: qc as u8,
                dst: pci.dst_addr,
            });
        };

        if codec.has_ttl() {
            codec.set_ttl(&mut pdu, pci.ttl - 1)?;
        }

        self.write(nhop, pdu)?;
        DtStats::bump(&self.stats.forwarded);
        Ok(())
    }

    /// Sends an SDU to descriptor `eid` of the remote IPCP at `dst_addr`
    pub fn send(&self, dst_addr: u64, qc: QosCube, eid: u64, sdu: &[u8]) -> Result<(), DtError> {
        let committed = self.committed()?;

        if dst_addr == committed.address {
            return Err(DtError::LocalDestination(dst_addr));
        }

        let Some(nhop) = self.pff[qc.index()].nhop(dst_addr) else {
            DtStats::bump(&self.stats.no_route);
            return Err(DtError::NoRoute { qc: qc as u8, dst: dst_addr });
        };

        let pci = DtPci {
            dst_addr,
            qc,
            ttl: self.default_ttl.min(committed.codec.constants().max_ttl()),
            eid,
            seqno: 0,
        };
        let pdu = committed.codec.serialize(&pci, sdu)?;

        self.write(nhop, pdu)?;
        DtStats::bump(&self.stats.sent);
        trace!(dst = dst_addr, %qc, eid, %nhop, "Sent PDU");
        Ok(())
    }

    fn write(&self, fd: FlowId, pdu: BytesMut) -> Result<(), DtError> {
        self.substrate.write(fd, pdu.freeze()).map_err(|e| {
            DtStats::bump(&self.stats.write_failed);
            DtError::from(e)
        })
    }
}

impl DtSetup for DataTransfer {
    fn setup(&self, dtc: &DtConstants, address: u64) -> Result<(), DtError> {
        let codec = PciCodec::new(dtc)?;

        if address > dtc.max_addr() {
            return Err(DtError::InvalidConstants(format!(
                "address {address} does not fit in {} bytes",
                dtc.addr_size
            )));
        }

        *self.committed.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Committed { address, codec });

        info!(address, addr_size = dtc.addr_size, "Data transfer configured");
        Ok(())
    }

    fn teardown(&self) {
        let previous = self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for pff in &self.pff {
            pff.flush();
        }

        if let Some(committed) = previous {
            info!(address = committed.address, "Data transfer unconfigured");
        }
    }
}
