//! Error types for the virtio-iommu device model.
//!
//! Request handlers return structured errors; the request processor maps
//! them onto the wire status byte via [`Error::status`]. Failures of the
//! descriptor transport itself are a separate type ([`TransportError`],
//! in `transport`) because they abort the descriptor instead of producing
//! a status.

use core::fmt;

use crate::wire::RequestStatus;

/// Request-level error.
///
/// Every variant corresponds to exactly one wire status; the variant
/// carries the identifiers a log line or debugger needs to reconstruct
/// what the guest asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "request errors decide the status byte written back to the guest"]
pub enum Error {
    /// The request referenced a domain that does not exist.
    UnknownDomain { domain_id: u32 },
    /// The request referenced an endpoint that was never attached.
    UnknownEndpoint { endpoint_id: u32 },
    /// The domain ID lies outside the configured domain range.
    DomainOutOfRange { domain_id: u32 },
    /// DETACH on an endpoint that is not bound to any domain.
    EndpointNotBound { endpoint_id: u32 },
    /// DETACH named a domain other than the one the endpoint is bound to.
    BindingMismatch {
        endpoint_id: u32,
        requested: u32,
        bound: u32,
    },
    /// MAP collided with an existing mapping (exact duplicate or overlap).
    AlreadyMapped {
        domain_id: u32,
        virt_start: u64,
        virt_end: u64,
    },
    /// MAP range falls outside the configured input range.
    InputOutOfRange { virt_start: u64, virt_end: u64 },
    /// UNMAP would split a live mapping instead of removing it whole.
    WouldSplitMapping { virt_start: u64, virt_end: u64 },
    /// A range payload with `virt_start > virt_end`.
    InvalidRange { virt_start: u64, virt_end: u64 },
    /// MAP flags contained bits outside READ | WRITE | EXEC.
    InvalidFlags { flags: u32 },
    /// Unknown request type, or PROBE without the negotiated feature.
    UnsupportedRequest { request_type: u8 },
    /// The probe property records do not fit in the probe buffer.
    ProbeOverflow { needed: usize, capacity: usize },
    /// The out-buffer held a valid header but a truncated payload.
    ShortPayload {
        request_type: u8,
        expected: usize,
        got: usize,
    },
}

impl Error {
    /// The wire status byte this error is reported as.
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::UnknownDomain { .. }
            | Self::UnknownEndpoint { .. }
            | Self::DomainOutOfRange { .. } => RequestStatus::Noent,
            Self::EndpointNotBound { .. }
            | Self::BindingMismatch { .. }
            | Self::AlreadyMapped { .. }
            | Self::InvalidRange { .. }
            | Self::InvalidFlags { .. }
            | Self::ProbeOverflow { .. } => RequestStatus::Inval,
            Self::InputOutOfRange { .. } | Self::WouldSplitMapping { .. } => RequestStatus::Range,
            Self::UnsupportedRequest { .. } => RequestStatus::Unsupp,
            Self::ShortPayload { .. } => RequestStatus::Deverr,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDomain { domain_id } => {
                write!(f, "unknown domain {}", domain_id)
            }
            Self::UnknownEndpoint { endpoint_id } => {
                write!(f, "unknown endpoint 0x{:x}", endpoint_id)
            }
            Self::DomainOutOfRange { domain_id } => {
                write!(f, "domain {} outside configured domain range", domain_id)
            }
            Self::EndpointNotBound { endpoint_id } => {
                write!(f, "endpoint 0x{:x} is not attached", endpoint_id)
            }
            Self::BindingMismatch {
                endpoint_id,
                requested,
                bound,
            } => write!(
                f,
                "endpoint 0x{:x} is bound to domain {}, not {}",
                endpoint_id, bound, requested
            ),
            Self::AlreadyMapped {
                domain_id,
                virt_start,
                virt_end,
            } => write!(
                f,
                "domain {}: [0x{:x}, 0x{:x}] overlaps an existing mapping",
                domain_id, virt_start, virt_end
            ),
            Self::InputOutOfRange {
                virt_start,
                virt_end,
            } => write!(
                f,
                "[0x{:x}, 0x{:x}] outside configured input range",
                virt_start, virt_end
            ),
            Self::WouldSplitMapping {
                virt_start,
                virt_end,
            } => write!(
                f,
                "unmap [0x{:x}, 0x{:x}] would split a live mapping",
                virt_start, virt_end
            ),
            Self::InvalidRange {
                virt_start,
                virt_end,
            } => write!(f, "invalid range [0x{:x}, 0x{:x}]", virt_start, virt_end),
            Self::InvalidFlags { flags } => write!(f, "invalid mapping flags 0x{:x}", flags),
            Self::UnsupportedRequest { request_type } => {
                write!(f, "unsupported request type {}", request_type)
            }
            Self::ProbeOverflow { needed, capacity } => write!(
                f,
                "probe properties need {} bytes, buffer holds {}",
                needed, capacity
            ),
            Self::ShortPayload {
                request_type,
                expected,
                got,
            } => write!(
                f,
                "request type {}: payload {} bytes, expected {}",
                request_type, got, expected
            ),
        }
    }
}
