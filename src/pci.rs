// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Data-transfer constants and Protocol Control Information (PCI)
//!
//! The PCI is a fixed-layout big-endian header whose field widths are the
//! data-transfer constants negotiated during enrollment:
//!
//! ```text
//! dst_addr[addr_size] | qos_cube[1] | ttl[ttl_size] | eid[cep_id_size] | seqno[seqno_size]
//! ```
//!
//! A zero width for `ttl` or `seqno` leaves the field out of the header.

use crate::error::DtError;
use crate::qos::QosCube;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Data-transfer constants shared by every member of a DIF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtConstants {
    /// Width of addresses (bytes)
    pub addr_size: u8,
    /// Width of connection-endpoint ids (bytes)
    pub cep_id_size: u8,
    /// Width of the PDU length field (bytes)
    pub pdu_length_size: u8,
    /// Width of sequence numbers (bytes, 0 = absent)
    pub seqno_size: u8,
    /// Width of the TTL (bytes, 0 = absent)
    pub ttl_size: u8,
    /// Width of the checksum trailer (bytes)
    pub chk_size: u8,
    /// Smallest PDU accepted
    pub min_pdu_size: u32,
    /// Largest PDU accepted
    pub max_pdu_size: u32,
}

impl Default for DtConstants {
    fn default() -> Self {
        Self {
            addr_size: 4,
            cep_id_size: 2,
            pdu_length_size: 2,
            seqno_size: 4,
            ttl_size: 1,
            chk_size: 0,
            min_pdu_size: 0,
            max_pdu_size: 9000,
        }
    }
}

impl DtConstants {
    /// Checks that every width can be encoded
    pub fn validate(&self) -> Result<(), DtError> {
        check_width("addr_size", self.addr_size, false)?;
        check_width("cep_id_size", self.cep_id_size, false)?;
        check_width("pdu_length_size", self.pdu_length_size, false)?;
        check_width("seqno_size", self.seqno_size, true)?;
        check_width("ttl_size", self.ttl_size, true)?;

        if self.min_pdu_size > self.max_pdu_size {
            return Err(DtError::InvalidConstants(format!(
                "min_pdu_size {} exceeds max_pdu_size {}",
                self.min_pdu_size, self.max_pdu_size
            )));
        }

        Ok(())
    }

    /// Largest TTL that fits the TTL field
    pub fn max_ttl(&self) -> u64 {
        max_value(self.ttl_size)
    }

    /// Largest address that fits the address field
    pub fn max_addr(&self) -> u64 {
        max_value(self.addr_size)
    }
}

fn check_width(field: &str, width: u8, may_be_absent: bool) -> Result<(), DtError> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        0 if may_be_absent => Ok(()),
        other => Err(DtError::InvalidConstants(format!(
            "{field} must be 1, 2, 4 or 8 bytes, got {other}"
        ))),
    }
}

fn max_value(width: u8) -> u64 {
    match width {
        0 => 0,
        8.. => u64::MAX,
        w => (1u64 << (u32::from(w) * 8)) - 1,
    }
}

/// Decoded PCI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtPci {
    /// Destination address
    pub dst_addr: u64,
    /// QoS cube of the unit
    pub qc: QosCube,
    /// Remaining hops
    pub ttl: u64,
    /// Target descriptor at the destination
    pub eid: u64,
    /// Sequence number (opaque here)
    pub seqno: u64,
}

/// Encodes and decodes PCI for one set of constants
#[derive(Debug, Clone)]
pub struct PciCodec {
    dtc: DtConstants,
    head_size: usize,
    qc_offset: usize,
    ttl_offset: usize,
    eid_offset: usize,
    seqno_offset: usize,
}

impl PciCodec {
    pub fn new(dtc: &DtConstants) -> Result<Self, DtError> {
        dtc.validate()?;

        let qc_offset = usize::from(dtc.addr_size);
        let ttl_offset = qc_offset + 1;
        let eid_offset = ttl_offset + usize::from(dtc.ttl_size);
        let seqno_offset = eid_offset + usize::from(dtc.cep_id_size);
        let head_size = seqno_offset + usize::from(dtc.seqno_size);

        Ok(Self {
            dtc: *dtc,
            head_size,
            qc_offset,
            ttl_offset,
            eid_offset,
            seqno_offset,
        })
    }

    /// Constants this codec was built from
    pub fn constants(&self) -> &DtConstants {
        &self.dtc
    }

    /// Length of the encoded header
    pub fn header_len(&self) -> usize {
        self.head_size
    }

    /// Whether the header carries a TTL
    pub fn has_ttl(&self) -> bool {
        self.dtc.ttl_size > 0
    }

    /// Prepends the header to `sdu`
    pub fn serialize(&self, pci: &DtPci, sdu: &[u8]) -> Result<BytesMut, DtError> {
        let max_pdu = self.dtc.max_pdu_size as usize;
        if self.head_size + sdu.len() > max_pdu {
            return Err(DtError::InvalidPci(format!(
                "PDU of {} bytes exceeds max_pdu_size {}",
                self.head_size + sdu.len(),
                max_pdu
            )));
        }

        let mut buf = BytesMut::with_capacity(self.head_size + sdu.len());
        put_field(&mut buf, "dst_addr", pci.dst_addr, self.dtc.addr_size)?;
        buf.put_u8(pci.qc as u8);
        put_field(&mut buf, "ttl", pci.ttl, self.dtc.ttl_size)?;
        put_field(&mut buf, "eid", pci.eid, self.dtc.cep_id_size)?;
        put_field(&mut buf, "seqno", pci.seqno, self.dtc.seqno_size)?;
        buf.extend_from_slice(sdu);

        Ok(buf)
    }

    /// Reads the header without consuming it
    pub fn deserialize(&self, pdu: &[u8]) -> Result<DtPci, DtError> {
        if pdu.len() < self.head_size {
            return Err(DtError::InvalidPci(format!(
                "unit of {} bytes is shorter than the {} byte header",
                pdu.len(),
                self.head_size
            )));
        }

        Ok(DtPci {
            dst_addr: get_field(&pdu[..self.qc_offset]),
            qc: QosCube::try_from(pdu[self.qc_offset])?,
            ttl: get_field(&pdu[self.ttl_offset..self.eid_offset]),
            eid: get_field(&pdu[self.eid_offset..self.seqno_offset]),
            seqno: get_field(&pdu[self.seqno_offset..self.head_size]),
        })
    }

    /// Strips the header, leaving the SDU
    pub fn shrink(&self, pdu: &mut BytesMut) -> Result<(), DtError> {
        if pdu.len() < self.head_size {
            return Err(DtError::InvalidPci("unit shorter than header".to_string()));
        }
        let _ = pdu.split_to(self.head_size);
        Ok(())
    }

    /// Rewrites the TTL of an encoded PDU in place
    pub fn set_ttl(&self, pdu: &mut [u8], ttl: u64) -> Result<(), DtError> {
        if !self.has_ttl() {
            return Ok(());
        }
        if pdu.len() < self.head_size {
            return Err(DtError::InvalidPci("unit shorter than header".to_string()));
        }
        if ttl > self.dtc.max_ttl() {
            return Err(DtError::InvalidPci(format!("ttl {ttl} does not fit")));
        }

        let field = &mut pdu[self.ttl_offset..self.eid_offset];
        let bytes = ttl.to_be_bytes();
        field.copy_from_slice(&bytes[8 - field.len()..]);
        Ok(())
    }
}

fn put_field(buf: &mut BytesMut, name: &str, value: u64, width: u8) -> Result<(), DtError> {
    if width == 0 {
        return Ok(());
    }
    if value > max_value(width) {
        return Err(DtError::InvalidPci(format!(
            "{name} {value} does not fit in {width} bytes"
        )));
    }
    buf.put_uint(value, usize::from(width));
    Ok(())
}

fn get_field(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
