//! Interfaces to the virtqueue transport.
//!
//! Descriptor fetching, used-ring bookkeeping, and guest notification
//! live outside this crate. The embedder hands each request chain to
//! [`crate::Iommu::handle_request`] as a device-readable slice and a
//! device-writable slice, and gives the device an [`EventChannel`] to
//! post fault records through. Both seams are deliberately narrow: the
//! device never learns what a descriptor is.

use core::fmt;

/// Failures that break the current descriptor.
///
/// These are not guest-visible statuses: a chain too small to carry even
/// the fixed parts of a request cannot carry a status back either. The
/// embedder detaches the descriptor and drops it; the device keeps
/// running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The device-readable buffer cannot hold a request header.
    ShortRequest { len: usize },
    /// The device-writable buffer cannot hold the response.
    ShortResponse { len: usize, needed: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortRequest { len } => {
                write!(f, "request buffer of {} bytes is too short", len)
            }
            Self::ShortResponse { len, needed } => {
                write!(
                    f,
                    "response buffer of {} bytes cannot hold {} bytes",
                    len, needed
                )
            }
        }
    }
}

/// Outcome of posting an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// The event queue has no buffer available; the record is dropped.
    Empty,
    /// The popped buffer cannot hold the record; the transport is broken.
    Undersized { len: usize, needed: usize },
}

/// The device-to-driver event virtqueue.
///
/// `post` must be non-blocking: pop the next device-writable buffer if
/// one is available, write `event` into it, push it used, and notify the
/// guest. Implementations are called outside the device's core mutex and
/// must be safe against concurrent request processing.
pub trait EventChannel: Send {
    fn post(&mut self, event: &[u8]) -> Result<(), EventError>;
}
