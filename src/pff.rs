// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! PDU Forwarding Function (PFF)
//!
//! Maps a destination address onto the lower-layer flow of the next hop.
//! There is one table per QoS cube; entries are installed by the routing
//! policy.

use crate::shim::FlowId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::trace;

/// Forwarding table for one QoS cube
#[derive(Debug, Default)]
pub struct Pff {
    table: RwLock<HashMap<u64, FlowId>>,
}

impl Pff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry; returns false if `dst_addr` already has one
    pub fn add(&self, dst_addr: u64, next_hop: FlowId) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.contains_key(&dst_addr) {
            return false;
        }
        table.insert(dst_addr, next_hop);
        trace!(dst = dst_addr, %next_hop, "Added forwarding entry");
        true
    }

    /// Installs or replaces an entry
    pub fn update(&self, dst_addr: u64, next_hop: FlowId) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dst_addr, next_hop);
    }

    /// Removes an entry, returning the old next hop
    pub fn remove(&self, dst_addr: u64) -> Option<FlowId> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dst_addr)
    }

    /// Removes every entry pointing at `next_hop`
    pub fn remove_next_hop(&self, next_hop: FlowId) -> usize {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let before = table.len();
        table.retain(|_, fd| *fd != next_hop);
        let removed = before - table.len();
        if removed > 0 {
            trace!(%next_hop, removed, "Purged forwarding entries");
        }
        removed
    }

    /// Drops all entries
    pub fn flush(&self) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Next hop towards `dst_addr`
    pub fn nhop(&self, dst_addr: u64) -> Option<FlowId> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dst_addr)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
