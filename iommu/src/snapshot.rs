//! Save and restore of the translation state.
//!
//! A snapshot carries the guest-visible state only: domains with their
//! mapping trees, and the set of known endpoints. Endpoint bindings are
//! not encoded twice -- each domain lists its member endpoints, and the
//! back references are rebuilt from those lists on restore. Outer
//! framing (device identity, section lengths) belongs to the migration
//! transport; the payload here uses the same little-endian discipline
//! as the wire formats.
//!
//! Restore validates the whole payload before touching the device, so a
//! corrupt snapshot leaves the current state intact.

use alloc::vec::Vec;
use core::fmt;

use crate::device::Iommu;
use crate::domain::{DomainRegistry, EndpointRegistry, Mapping};
use crate::interval::IovaRange;
use crate::wire::MapPerms;

/// Format version stamped at the head of every snapshot.
const SNAPSHOT_VERSION: u32 = 1;

/// Why a snapshot payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a failed restore leaves the device in its previous state"]
pub enum SnapshotError {
    /// The payload ended in the middle of a record.
    Truncated { offset: usize },
    /// The version stamp is not one this implementation reads.
    UnknownVersion { version: u32 },
    /// Bytes remained after the last record.
    TrailingBytes { len: usize },
    /// A domain lists an endpoint the endpoint table does not carry.
    DanglingEndpoint { domain_id: u32, endpoint_id: u32 },
    /// Two domains list the same endpoint.
    ConflictingBinding { endpoint_id: u32 },
    /// Two mapping records in one domain overlap.
    OverlappingMapping { domain_id: u32 },
    /// A mapping record with inverted bounds or unknown permission bits.
    MalformedMapping { domain_id: u32 },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "snapshot truncated at offset {}", offset),
            Self::UnknownVersion { version } => {
                write!(f, "unknown snapshot version {}", version)
            }
            Self::TrailingBytes { len } => {
                write!(f, "{} trailing bytes after the last record", len)
            }
            Self::DanglingEndpoint {
                domain_id,
                endpoint_id,
            } => write!(
                f,
                "domain {} lists unknown endpoint 0x{:x}",
                domain_id, endpoint_id
            ),
            Self::ConflictingBinding { endpoint_id } => {
                write!(f, "endpoint 0x{:x} is listed by two domains", endpoint_id)
            }
            Self::OverlappingMapping { domain_id } => {
                write!(f, "domain {} carries overlapping mappings", domain_id)
            }
            Self::MalformedMapping { domain_id } => {
                write!(f, "domain {} carries a malformed mapping", domain_id)
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.buf.len() - self.offset < len {
            return Err(SnapshotError::Truncated {
                offset: self.offset,
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl Iommu {
    /// Serialize the translation state. The device must be quiesced by
    /// the caller in the sense that the result is whatever total order
    /// of operations the core mutex admits.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut out = Vec::new();
        put_u32(&mut out, SNAPSHOT_VERSION);

        put_u32(&mut out, state.endpoints.len() as u32);
        for (endpoint_id, _) in state.endpoints.iter() {
            put_u32(&mut out, endpoint_id);
        }

        put_u32(&mut out, state.domains.len() as u32);
        for (domain_id, domain) in state.domains.iter() {
            put_u32(&mut out, domain_id);
            put_u32(&mut out, domain.endpoint_ids().count() as u32);
            for endpoint_id in domain.endpoint_ids() {
                put_u32(&mut out, endpoint_id);
            }
            put_u32(&mut out, domain.mappings().len() as u32);
            for (range, mapping) in domain.mappings().iter() {
                put_u64(&mut out, range.low);
                put_u64(&mut out, range.high);
                put_u64(&mut out, mapping.phys_start);
                put_u32(&mut out, mapping.perms.bits());
            }
        }
        out
    }

    /// Replace the translation state with a previously serialized one.
    ///
    /// The payload is fully parsed and cross-checked first; on any
    /// error the device keeps its current state. Notifier subscriptions
    /// are untouched -- the embedder replays after restore if consumers
    /// need their shadows rebuilt.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut reader = Reader::new(bytes);
        let version = reader.read_u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnknownVersion { version });
        }

        let mut endpoints = EndpointRegistry::new();
        let endpoint_count = reader.read_u32()?;
        for _ in 0..endpoint_count {
            let endpoint_id = reader.read_u32()?;
            endpoints.get_or_create(endpoint_id);
        }

        let mut domains = DomainRegistry::new();
        let domain_count = reader.read_u32()?;
        for _ in 0..domain_count {
            let domain_id = reader.read_u32()?;
            let member_count = reader.read_u32()?;
            let domain = domains.get_or_create(domain_id);
            let mut members = Vec::new();
            for _ in 0..member_count {
                let endpoint_id = reader.read_u32()?;
                domain.endpoints.insert(endpoint_id);
                members.push(endpoint_id);
            }

            let mapping_count = reader.read_u32()?;
            for _ in 0..mapping_count {
                let low = reader.read_u64()?;
                let high = reader.read_u64()?;
                let phys_start = reader.read_u64()?;
                let bits = reader.read_u32()?;
                if low > high {
                    return Err(SnapshotError::MalformedMapping { domain_id });
                }
                let perms = MapPerms::from_bits(bits)
                    .ok_or(SnapshotError::MalformedMapping { domain_id })?;
                domain
                    .mappings
                    .insert(IovaRange::new(low, high), Mapping { phys_start, perms })
                    .map_err(|_| SnapshotError::OverlappingMapping { domain_id })?;
            }

            // Rebuild the endpoint side of each link; every listed
            // endpoint must exist and must not be claimed twice.
            for endpoint_id in members {
                let ep = endpoints.lookup_mut(endpoint_id).ok_or(
                    SnapshotError::DanglingEndpoint {
                        domain_id,
                        endpoint_id,
                    },
                )?;
                if ep.domain.is_some() {
                    return Err(SnapshotError::ConflictingBinding { endpoint_id });
                }
                ep.domain = Some(domain_id);
            }
        }

        if reader.remaining() != 0 {
            return Err(SnapshotError::TrailingBytes {
                len: reader.remaining(),
            });
        }

        let mut state = self.state.lock();
        state.domains = domains;
        state.endpoints = endpoints;
        Ok(())
    }
}
