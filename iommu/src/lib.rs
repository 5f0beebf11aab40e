//! Device-side model of a paravirtualized (virtio) IOMMU.
//!
//! The device mediates DMA between guest-assigned endpoints (identified
//! by bus/device/function stream IDs) and host physical memory. Guests
//! manage translation state over a request virtqueue -- attach and
//! detach endpoints to domains, map and unmap IOVA ranges, probe
//! reserved regions -- and every DMA access issued by the emulated
//! fabric is checked synchronously against that state. Blocked accesses
//! surface asynchronously as fault records on an event virtqueue.
//!
//! # Architecture
//!
//! ```text
//!   Iommu (device.rs)
//!     |-- DomainRegistry / EndpointRegistry (domain.rs)
//!     |     +-- IntervalMap of mappings per domain (interval.rs)
//!     |-- NotifierRegistry (notifier.rs)  -- downstream shadow consumers
//!     |-- EventChannel (transport.rs)     -- fault records to the guest
//!     +-- wire formats and config (wire.rs)
//! ```
//!
//! The virtqueue transport itself lives outside this crate: the
//! embedder feeds request chains to [`Iommu::handle_request`] and
//! implements [`EventChannel`] over the event queue. Snapshot save and
//! restore for migration is in [`snapshot`].
//!
//! All translation state sits behind one mutex; mutation handlers fan
//! out install/invalidate callbacks to subscribed consumers while still
//! holding it, so shadow translation structures can never observe a
//! half-applied mutation.
//!
//! # Example
//!
//! ```
//! use virtio_iommu::{EventChannel, EventError, Features, Iommu, IommuConfig, MapPerms};
//!
//! struct NullEvents;
//!
//! impl EventChannel for NullEvents {
//!     fn post(&mut self, _event: &[u8]) -> Result<(), EventError> {
//!         Err(EventError::Empty)
//!     }
//! }
//!
//! let iommu = Iommu::new(IommuConfig::default(), Vec::new(), Box::new(NullEvents));
//! iommu.ack_features(Features::MAP_UNMAP | Features::BYPASS);
//!
//! // No endpoint is known for stream 0x42 and bypass is negotiated,
//! // so the access passes through untranslated.
//! let t = iommu.translate(0x42, 0x1000, MapPerms::READ);
//! assert_eq!(t.addr, 0x1000);
//! assert_eq!(t.perms, MapPerms::READ);
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod device;
pub mod domain;
pub mod error;
pub mod interval;
pub mod notifier;
pub mod snapshot;
pub mod transport;
pub mod wire;

pub use device::{Iommu, ReservedRegion, Translation};
pub use error::Error;
pub use interval::{IntervalMap, IovaRange};
pub use notifier::{MappingNotifier, NotifierRegistry};
pub use snapshot::SnapshotError;
pub use transport::{EventChannel, EventError, TransportError};
pub use wire::{
    Fault, FaultFlags, FaultReason, Features, IommuConfig, MapPerms, RequestStatus, ResvMemSubtype,
};
