//! Wire formats for the virtio-iommu request, event, and config spaces.
//!
//! Everything the guest sees is little-endian and defined here: request
//! headers and payloads, the status byte, fault event records, probe
//! properties, the device config layout, and the feature bits.
//!
//! # Request layout
//!
//! Each request descriptor chain carries a device-readable part and a
//! device-writable part:
//!
//! | Part | Size | Contents |
//! |------|------|----------|
//! | header | 4 | `request_type: u8`, 3 reserved bytes |
//! | payload | varies | type-specific, see the `*Req` structs |
//! | status | 1 | written by the device (for PROBE, after the properties) |
//!
//! # Event layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | reason |
//! | 1 | 3 | reserved |
//! | 4 | 4 | flags |
//! | 8 | 4 | endpoint |
//! | 12 | 4 | reserved |
//! | 16 | 8 | address |

use bitflags::bitflags;

// ---------------------------------------------------------------------------
// Request types and status codes
// ---------------------------------------------------------------------------

/// Request type codes carried in the request header.
pub mod request {
    /// Attach an endpoint to a domain.
    pub const ATTACH: u8 = 1;
    /// Detach an endpoint from its domain.
    pub const DETACH: u8 = 2;
    /// Install a virtual -> physical mapping in a domain.
    pub const MAP: u8 = 3;
    /// Remove mappings from a domain.
    pub const UNMAP: u8 = 4;
    /// Query per-endpoint properties (reserved memory regions).
    pub const PROBE: u8 = 5;
}

/// Size of the request header (`request_type` plus reserved bytes).
pub const REQ_HEADER_LEN: usize = 4;

/// Size of the trailing status written back to the guest.
pub const REQ_STATUS_LEN: usize = 1;

/// Status byte written at the tail of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Ok = 0,
    Ioerr = 1,
    Unsupp = 2,
    Deverr = 3,
    Inval = 4,
    Range = 5,
    Noent = 6,
    Fault = 7,
}

impl RequestStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Feature bits
// ---------------------------------------------------------------------------

bitflags! {
    /// Feature bits offered by the device and acknowledged by the driver.
    ///
    /// Bits 0..=5 are device-specific; the high bits are transport-level
    /// and negotiated by the virtqueue layer, listed here so the embedder
    /// can build the full offered set in one place.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u64 {
        /// The config `input_range` field is valid and enforced.
        const INPUT_RANGE = 1 << 0;
        /// The config `domain_range` field is valid and enforced.
        const DOMAIN_RANGE = 1 << 1;
        /// MAP/UNMAP requests are available.
        const MAP_UNMAP = 1 << 2;
        /// Accesses with no endpoint or no domain pass through untranslated.
        const BYPASS = 1 << 3;
        /// PROBE requests are available.
        const PROBE = 1 << 4;
        /// The MMIO mapping flag is accepted.
        const MMIO = 1 << 5;
        /// Transport: indirect descriptors.
        const RING_INDIRECT_DESC = 1 << 28;
        /// Transport: used-ring event index.
        const RING_EVENT_IDX = 1 << 29;
        /// Transport: virtio 1.0 compliance.
        const VERSION_1 = 1 << 32;
    }
}

bitflags! {
    /// Permission flags of a MAP request and of a translation result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Flags carried in a fault event record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The faulting access was a read.
        const READ = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access was an instruction fetch.
        const EXEC = 1 << 2;
        /// The `address` field of the record is valid.
        const ADDRESS_VALID = 1 << 8;
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// ATTACH payload: `{domain: u32, endpoint: u32, reserved: u8[8]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReq {
    pub domain: u32,
    pub endpoint: u32,
}

impl AttachReq {
    pub const LEN: usize = 16;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            domain: read_u32(payload, 0),
            endpoint: read_u32(payload, 4),
        })
    }
}

/// DETACH payload: same layout as ATTACH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachReq {
    pub domain: u32,
    pub endpoint: u32,
}

impl DetachReq {
    pub const LEN: usize = 16;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            domain: read_u32(payload, 0),
            endpoint: read_u32(payload, 4),
        })
    }
}

/// MAP payload: `{domain: u32, virt_start: u64, virt_end: u64,
/// phys_start: u64, flags: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapReq {
    pub domain: u32,
    pub virt_start: u64,
    pub virt_end: u64,
    pub phys_start: u64,
    pub flags: u32,
}

impl MapReq {
    pub const LEN: usize = 32;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            domain: read_u32(payload, 0),
            virt_start: read_u64(payload, 4),
            virt_end: read_u64(payload, 12),
            phys_start: read_u64(payload, 20),
            flags: read_u32(payload, 28),
        })
    }
}

/// UNMAP payload: `{domain: u32, virt_start: u64, virt_end: u64,
/// reserved: u8[4]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapReq {
    pub domain: u32,
    pub virt_start: u64,
    pub virt_end: u64,
}

impl UnmapReq {
    pub const LEN: usize = 24;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            domain: read_u32(payload, 0),
            virt_start: read_u64(payload, 4),
            virt_end: read_u64(payload, 12),
        })
    }
}

/// PROBE payload: `{endpoint: u32, reserved: u8[64]}`. The property
/// buffer and status are device-written and live in the in-buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReq {
    pub endpoint: u32,
}

impl ProbeReq {
    pub const LEN: usize = 68;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LEN {
            return None;
        }
        Some(Self {
            endpoint: read_u32(payload, 0),
        })
    }
}

// ---------------------------------------------------------------------------
// Fault events
// ---------------------------------------------------------------------------

/// Why a translation fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultReason {
    /// No endpoint is known for the stream ID.
    Unknown = 1,
    /// The endpoint is not attached to any domain.
    Domain = 2,
    /// No mapping covers the address, the address lies in a rejecting
    /// reserved region, or permissions do not allow the access.
    Mapping = 3,
}

/// Size of an encoded fault event record.
pub const FAULT_EVENT_LEN: usize = 24;

/// A fault record as posted on the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub reason: FaultReason,
    pub flags: FaultFlags,
    pub endpoint: u32,
    pub address: u64,
}

impl Fault {
    /// Encode the record into its on-wire form.
    pub fn encode(&self) -> [u8; FAULT_EVENT_LEN] {
        let mut buf = [0u8; FAULT_EVENT_LEN];
        buf[0] = self.reason as u8;
        buf[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..12].copy_from_slice(&self.endpoint.to_le_bytes());
        buf[16..24].copy_from_slice(&self.address.to_le_bytes());
        buf
    }
}

// ---------------------------------------------------------------------------
// Probe properties
// ---------------------------------------------------------------------------

/// Probe property type codes.
pub mod probe {
    /// Terminator; ends the property list.
    pub const PROP_NONE: u16 = 0;
    /// A reserved memory region record.
    pub const PROP_RESV_MEM: u16 = 1;
}

/// Size of a property head (`type: u16, length: u16`).
pub const PROBE_PROP_HEAD_LEN: usize = 4;

/// Payload size of a RESV_MEM property.
pub const RESV_MEM_PROP_LEN: usize = 20;

/// Subtype of a reserved memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResvMemSubtype {
    /// All accesses to the region are rejected with a mapping fault.
    Reserved = 0,
    /// MSI doorbell region; accesses pass through untranslated.
    Msi = 1,
}

/// Encode a RESV_MEM property (head plus payload) into `buf`.
///
/// `buf` must hold at least `PROBE_PROP_HEAD_LEN + RESV_MEM_PROP_LEN`
/// bytes; returns the number of bytes written.
pub fn encode_resv_mem_property(
    buf: &mut [u8],
    subtype: ResvMemSubtype,
    start: u64,
    end: u64,
) -> usize {
    buf[0..2].copy_from_slice(&probe::PROP_RESV_MEM.to_le_bytes());
    buf[2..4].copy_from_slice(&(RESV_MEM_PROP_LEN as u16).to_le_bytes());
    buf[4] = subtype as u8;
    buf[5..8].fill(0);
    buf[8..16].copy_from_slice(&start.to_le_bytes());
    buf[16..24].copy_from_slice(&end.to_le_bytes());
    PROBE_PROP_HEAD_LEN + RESV_MEM_PROP_LEN
}

/// Encode the terminator property into `buf`; returns the bytes written.
pub fn encode_none_property(buf: &mut [u8]) -> usize {
    buf[0..PROBE_PROP_HEAD_LEN].fill(0);
    PROBE_PROP_HEAD_LEN
}

// ---------------------------------------------------------------------------
// Device config
// ---------------------------------------------------------------------------

/// Size of the encoded device config space.
pub const CONFIG_LEN: usize = 40;

/// An inclusive range of 64-bit addresses in the config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range64 {
    pub start: u64,
    pub end: u64,
}

/// An inclusive range of 32-bit domain IDs in the config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range32 {
    pub start: u32,
    pub end: u32,
}

/// Device configuration, exposed read-only to the guest.
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0 | 8 | page_size_mask |
/// | 8 | 16 | input_range (start, end) |
/// | 24 | 8 | domain_range (start, end) |
/// | 32 | 4 | probe_size |
/// | 36 | 4 | reserved |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    /// Bitmask of supported translation granules; bit N set means a
    /// page size of 2^N is representable.
    pub page_size_mask: u64,
    /// Inclusive range of valid I/O virtual addresses for MAP.
    pub input_range: Range64,
    /// Inclusive range of valid domain IDs.
    pub domain_range: Range32,
    /// Size in bytes of the PROBE property buffer.
    pub probe_size: u32,
}

/// Default translation granule (4 KiB).
const DEFAULT_PAGE_SIZE: u64 = 4096;

impl Default for IommuConfig {
    fn default() -> Self {
        Self {
            page_size_mask: !(DEFAULT_PAGE_SIZE - 1),
            input_range: Range64 {
                start: 0,
                end: u64::MAX,
            },
            domain_range: Range32 { start: 0, end: 32 },
            probe_size: 512,
        }
    }
}

impl IommuConfig {
    /// Encode the config space as the guest reads it.
    pub fn encode(&self) -> [u8; CONFIG_LEN] {
        let mut buf = [0u8; CONFIG_LEN];
        buf[0..8].copy_from_slice(&self.page_size_mask.to_le_bytes());
        buf[8..16].copy_from_slice(&self.input_range.start.to_le_bytes());
        buf[16..24].copy_from_slice(&self.input_range.end.to_le_bytes());
        buf[24..28].copy_from_slice(&self.domain_range.start.to_le_bytes());
        buf[28..32].copy_from_slice(&self.domain_range.end.to_le_bytes());
        buf[32..36].copy_from_slice(&self.probe_size.to_le_bytes());
        buf
    }
}
