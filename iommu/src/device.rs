//! The virtio-iommu device model.
//!
//! This module ties the data model together into the device the
//! transport drives:
//!
//! ```text
//!   transport thread            DMA thread(s)
//!        |                           |
//!   handle_request()            translate()
//!        |                           |
//!        +--------- core mutex ------+
//!        |                           |
//!   domains / endpoints        interval lookup
//!   notifier fan-out           permission check
//!        |                           |
//!   status byte                fault record --> EventChannel
//! ```
//!
//! One `spin::Mutex` serializes every read and write of the domain,
//! endpoint, and notifier registries. Mutation handlers hold it across
//! their whole body, including the synchronous notifier fan-out, so a
//! downstream consumer's shadow state always observes a linear history
//! of the authoritative state. Fault records are built under the mutex
//! but posted to the event channel after it is dropped; the channel is
//! independently thread-safe.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::domain::{Domain, DomainRegistry, EndpointRegistry, Mapping};
use crate::error::Error;
use crate::interval::IovaRange;
use crate::notifier::{MappingNotifier, NotifierRegistry};
use crate::transport::{EventChannel, EventError, TransportError};
use crate::wire::{
    self, request, AttachReq, DetachReq, Fault, FaultFlags, FaultReason, Features, IommuConfig,
    MapPerms, MapReq, ProbeReq, RequestStatus, ResvMemSubtype, UnmapReq,
};

/// A reserved IOVA region with a fixed translation policy.
///
/// Reserved regions are device configuration, global across domains:
/// MSI doorbells pass through untranslated, everything else rejects.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRegion {
    pub range: IovaRange,
    pub subtype: ResvMemSubtype,
}

/// Result of one synchronous translation.
///
/// An empty `perms` means the access is blocked; the reason, if any,
/// went out on the event queue. `mask` is the page-granularity mask
/// from the device config, so the consumer knows the granule the result
/// is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub addr: u64,
    pub perms: MapPerms,
    pub mask: u64,
}

/// Everything the core mutex guards.
pub(crate) struct State {
    pub(crate) domains: DomainRegistry,
    pub(crate) endpoints: EndpointRegistry,
    pub(crate) notifiers: NotifierRegistry,
}

/// The device.
pub struct Iommu {
    config: IommuConfig,
    resv_regions: Vec<ReservedRegion>,
    acked_features: AtomicU64,
    pub(crate) state: Mutex<State>,
    events: Mutex<Box<dyn EventChannel>>,
    event_channel_broken: AtomicBool,
}

impl Iommu {
    /// Create a device from its config, reserved regions, and the event
    /// channel the transport provides. No features are negotiated yet.
    pub fn new(
        config: IommuConfig,
        resv_regions: Vec<ReservedRegion>,
        events: Box<dyn EventChannel>,
    ) -> Self {
        Self {
            config,
            resv_regions,
            acked_features: AtomicU64::new(0),
            state: Mutex::new(State {
                domains: DomainRegistry::new(),
                endpoints: EndpointRegistry::new(),
                notifiers: NotifierRegistry::new(),
            }),
            events: Mutex::new(events),
            event_channel_broken: AtomicBool::new(false),
        }
    }

    /// The feature set this device offers.
    pub fn device_features(&self) -> Features {
        Features::INPUT_RANGE
            | Features::DOMAIN_RANGE
            | Features::MAP_UNMAP
            | Features::BYPASS
            | Features::PROBE
            | Features::MMIO
            | Features::RING_INDIRECT_DESC
            | Features::RING_EVENT_IDX
            | Features::VERSION_1
    }

    /// Record the driver's accepted features. Bits the device does not
    /// offer are silently masked off.
    pub fn ack_features(&self, features: Features) {
        let acked = features & self.device_features();
        self.acked_features.store(acked.bits(), Ordering::Release);
    }

    /// The currently negotiated feature set.
    pub fn acked_features(&self) -> Features {
        Features::from_bits_truncate(self.acked_features.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &IommuConfig {
        &self.config
    }

    fn bypass_enabled(&self) -> bool {
        self.acked_features().contains(Features::BYPASS)
    }

    fn probe_enabled(&self) -> bool {
        self.acked_features().contains(Features::PROBE)
    }

    // -----------------------------------------------------------------
    // Request processing
    // -----------------------------------------------------------------

    /// Process one request descriptor chain.
    ///
    /// `out_buf` is the device-readable part (header + payload),
    /// `in_buf` the device-writable part (for PROBE: property buffer,
    /// then the status byte; otherwise just the status byte). Returns
    /// the number of bytes written into `in_buf`, which the caller
    /// reports in the used ring before notifying the guest.
    ///
    /// A buffer too short for even the fixed layout is a transport
    /// failure: no status can be delivered, the descriptor must be
    /// detached and dropped.
    pub fn handle_request(
        &self,
        out_buf: &[u8],
        in_buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        if out_buf.len() < wire::REQ_HEADER_LEN {
            error!(
                "request descriptor of {} bytes cannot hold a header",
                out_buf.len()
            );
            return Err(TransportError::ShortRequest { len: out_buf.len() });
        }
        if in_buf.len() < wire::REQ_STATUS_LEN {
            error!(
                "response descriptor of {} bytes cannot hold a status",
                in_buf.len()
            );
            return Err(TransportError::ShortResponse {
                len: in_buf.len(),
                needed: wire::REQ_STATUS_LEN,
            });
        }

        let request_type = out_buf[0];
        let payload = &out_buf[wire::REQ_HEADER_LEN..];

        // PROBE writes its property payload ahead of the status byte,
        // so the in-buffer size must be settled before dispatch.
        let probe_active = request_type == request::PROBE && self.probe_enabled();
        let written_payload = if probe_active {
            let probe_size = self.config.probe_size as usize;
            let needed = probe_size + wire::REQ_STATUS_LEN;
            if in_buf.len() < needed {
                error!(
                    "probe response descriptor of {} bytes cannot hold {} bytes",
                    in_buf.len(),
                    needed
                );
                return Err(TransportError::ShortResponse {
                    len: in_buf.len(),
                    needed,
                });
            }
            in_buf[..probe_size].fill(0);
            probe_size
        } else {
            0
        };

        let mut state = self.state.lock();
        let status = match request_type {
            request::ATTACH => match AttachReq::parse(payload) {
                Some(req) => {
                    Self::status_of(request_type, self.attach(&mut state, req.domain, req.endpoint))
                }
                None => Self::short_payload(request_type, AttachReq::LEN, payload.len()),
            },
            request::DETACH => match DetachReq::parse(payload) {
                Some(req) => {
                    Self::status_of(request_type, self.detach(&mut state, req.domain, req.endpoint))
                }
                None => Self::short_payload(request_type, DetachReq::LEN, payload.len()),
            },
            request::MAP => match MapReq::parse(payload) {
                Some(req) => Self::status_of(request_type, self.map(&mut state, req)),
                None => Self::short_payload(request_type, MapReq::LEN, payload.len()),
            },
            request::UNMAP => match UnmapReq::parse(payload) {
                Some(req) => Self::status_of(request_type, self.unmap(&mut state, req)),
                None => Self::short_payload(request_type, UnmapReq::LEN, payload.len()),
            },
            request::PROBE if probe_active => match ProbeReq::parse(payload) {
                Some(req) => Self::status_of(
                    request_type,
                    self.probe(req.endpoint, &mut in_buf[..written_payload]),
                ),
                None => Self::short_payload(request_type, ProbeReq::LEN, payload.len()),
            },
            other => Self::status_of(
                other,
                Err(Error::UnsupportedRequest {
                    request_type: other,
                }),
            ),
        };
        drop(state);

        in_buf[written_payload] = status.as_u8();
        Ok(written_payload + wire::REQ_STATUS_LEN)
    }

    fn status_of(request_type: u8, result: Result<(), Error>) -> RequestStatus {
        match result {
            Ok(()) => {
                trace!("request type {} ok", request_type);
                RequestStatus::Ok
            }
            Err(err) => {
                debug!("request type {} failed: {}", request_type, err);
                err.status()
            }
        }
    }

    fn short_payload(request_type: u8, expected: usize, got: usize) -> RequestStatus {
        Self::status_of(
            request_type,
            Err(Error::ShortPayload {
                request_type,
                expected,
                got,
            }),
        )
    }

    fn check_domain_range(&self, domain_id: u32) -> Result<(), Error> {
        let range = self.config.domain_range;
        if domain_id < range.start || domain_id > range.end {
            return Err(Error::DomainOutOfRange { domain_id });
        }
        Ok(())
    }

    fn attach(&self, state: &mut State, domain_id: u32, endpoint_id: u32) -> Result<(), Error> {
        self.check_domain_range(domain_id)?;
        let State {
            domains,
            endpoints,
            notifiers,
        } = state;

        // Attach is the only request that creates entities.
        let previous = endpoints.get_or_create(endpoint_id).binding();
        match previous {
            // Rebinding to another domain goes through the full detach
            // path first so the subscriber's shadow is flushed.
            Some(bound) if bound != domain_id => {
                Self::detach_endpoint(domains, endpoints, notifiers, endpoint_id, bound);
            }
            _ => {}
        }

        domains.get_or_create(domain_id).endpoints.insert(endpoint_id);
        if let Some(ep) = endpoints.lookup_mut(endpoint_id) {
            ep.domain = Some(domain_id);
        }

        // The subscriber joins with whatever the domain already maps.
        if let Some(notifier) = notifiers.get(endpoint_id) {
            if let Some(domain) = domains.lookup(domain_id) {
                for (range, mapping) in domain.mappings().iter() {
                    trace!("endpoint 0x{:x}: install {:?}", endpoint_id, range);
                    notifier.map(range, mapping.phys_start, mapping.perms);
                }
            }
        }

        debug_assert!(Self::binding_symmetry_holds(state));
        Ok(())
    }

    fn detach(&self, state: &mut State, domain_id: u32, endpoint_id: u32) -> Result<(), Error> {
        self.check_domain_range(domain_id)?;
        let State {
            domains,
            endpoints,
            notifiers,
        } = state;

        let ep = endpoints
            .lookup(endpoint_id)
            .ok_or(Error::UnknownEndpoint { endpoint_id })?;
        let bound = ep.binding().ok_or(Error::EndpointNotBound { endpoint_id })?;
        if bound != domain_id {
            return Err(Error::BindingMismatch {
                endpoint_id,
                requested: domain_id,
                bound,
            });
        }

        Self::detach_endpoint(domains, endpoints, notifiers, endpoint_id, bound);
        debug_assert!(Self::binding_symmetry_holds(state));
        Ok(())
    }

    /// The full detach path: invalidate the subscriber's view of the
    /// domain, unlink both sides, and drop the domain once nothing uses
    /// it. A domain keeping mappings survives unbound; a domain keeping
    /// endpoints is never dropped.
    fn detach_endpoint(
        domains: &mut DomainRegistry,
        endpoints: &mut EndpointRegistry,
        notifiers: &NotifierRegistry,
        endpoint_id: u32,
        domain_id: u32,
    ) {
        let domain = domains.lookup_mut(domain_id);
        debug_assert!(domain.is_some());
        if let Some(domain) = domain {
            if let Some(notifier) = notifiers.get(endpoint_id) {
                for (range, _) in domain.mappings().iter() {
                    trace!("endpoint 0x{:x}: invalidate {:?}", endpoint_id, range);
                    notifier.unmap(range);
                }
            }
            domain.endpoints.remove(&endpoint_id);
            if domain.is_unused() {
                domains.remove(domain_id);
            }
        }
        if let Some(ep) = endpoints.lookup_mut(endpoint_id) {
            ep.domain = None;
        }
    }

    fn map(&self, state: &mut State, req: MapReq) -> Result<(), Error> {
        // Checks mirror the status precedence of the request table: a
        // malformed payload is INVAL, an out-of-bounds IOVA range is
        // RANGE, and only then does the domain resolve (or not).
        if req.virt_start > req.virt_end {
            return Err(Error::InvalidRange {
                virt_start: req.virt_start,
                virt_end: req.virt_end,
            });
        }
        let perms = MapPerms::from_bits(req.flags).ok_or(Error::InvalidFlags { flags: req.flags })?;
        let input = self.config.input_range;
        if req.virt_start < input.start || req.virt_end > input.end {
            return Err(Error::InputOutOfRange {
                virt_start: req.virt_start,
                virt_end: req.virt_end,
            });
        }
        self.check_domain_range(req.domain)?;

        let State {
            domains, notifiers, ..
        } = state;
        let domain = domains
            .lookup_mut(req.domain)
            .ok_or(Error::UnknownDomain {
                domain_id: req.domain,
            })?;

        let range = IovaRange::new(req.virt_start, req.virt_end);
        let mapping = Mapping {
            phys_start: req.phys_start,
            perms,
        };
        // A duplicate of an existing range and a partial overlap both
        // collide with the stored key and are rejected the same way.
        domain
            .mappings
            .insert(range, mapping)
            .map_err(|_| Error::AlreadyMapped {
                domain_id: req.domain,
                virt_start: req.virt_start,
                virt_end: req.virt_end,
            })?;

        Self::for_each_domain_notifier(domain, notifiers, |notifier| {
            notifier.map(range, mapping.phys_start, mapping.perms);
        });
        Ok(())
    }

    fn unmap(&self, state: &mut State, req: UnmapReq) -> Result<(), Error> {
        // Same precedence as map: payload shape before the domain range.
        if req.virt_start > req.virt_end {
            return Err(Error::InvalidRange {
                virt_start: req.virt_start,
                virt_end: req.virt_end,
            });
        }
        self.check_domain_range(req.domain)?;

        let State {
            domains, notifiers, ..
        } = state;
        let domain = domains
            .lookup_mut(req.domain)
            .ok_or(Error::UnknownDomain {
                domain_id: req.domain,
            })?;

        // Remove covered mappings left to right. A mapping the request
        // only partially covers would have to be split; the request
        // fails there, and what was already removed stays removed.
        let request = IovaRange::new(req.virt_start, req.virt_end);
        while let Some(found) = domain.mappings.first_overlapping(&request) {
            if !request.covers(&found) {
                return Err(Error::WouldSplitMapping {
                    virt_start: req.virt_start,
                    virt_end: req.virt_end,
                });
            }
            domain.mappings.remove_exact(&found);
            trace!("domain {}: unmap {:?}", req.domain, found);
            Self::for_each_domain_notifier(domain, notifiers, |notifier| {
                notifier.unmap(found);
            });
        }
        if domain.is_unused() {
            domains.remove(req.domain);
        }
        Ok(())
    }

    fn probe(&self, endpoint_id: u32, buf: &mut [u8]) -> Result<(), Error> {
        let per_prop = wire::PROBE_PROP_HEAD_LEN + wire::RESV_MEM_PROP_LEN;
        let needed = self.resv_regions.len() * per_prop + wire::PROBE_PROP_HEAD_LEN;
        if needed > buf.len() {
            return Err(Error::ProbeOverflow {
                needed,
                capacity: buf.len(),
            });
        }

        trace!(
            "probe endpoint 0x{:x}: {} reserved regions",
            endpoint_id,
            self.resv_regions.len()
        );
        let mut offset = 0;
        for region in &self.resv_regions {
            offset += wire::encode_resv_mem_property(
                &mut buf[offset..],
                region.subtype,
                region.range.low,
                region.range.high,
            );
        }
        wire::encode_none_property(&mut buf[offset..]);
        Ok(())
    }

    /// Run `f` on every notifier subscribed for an endpoint of `domain`.
    fn for_each_domain_notifier<F>(domain: &Domain, notifiers: &NotifierRegistry, f: F)
    where
        F: Fn(&Arc<dyn MappingNotifier>),
    {
        for (endpoint_id, notifier) in notifiers.iter() {
            if domain.has_endpoint(endpoint_id) {
                f(notifier);
            }
        }
    }

    fn binding_symmetry_holds(state: &State) -> bool {
        let forward = state.domains.iter().all(|(domain_id, domain)| {
            domain.endpoint_ids().all(|ep| {
                state
                    .endpoints
                    .lookup(ep)
                    .is_some_and(|e| e.binding() == Some(domain_id))
            })
        });
        let backward = state.endpoints.iter().all(|(endpoint_id, ep)| match ep.binding() {
            Some(domain_id) => state
                .domains
                .lookup(domain_id)
                .is_some_and(|d| d.has_endpoint(endpoint_id)),
            None => state.domains.iter().all(|(_, d)| !d.has_endpoint(endpoint_id)),
        });
        forward && backward
    }

    // -----------------------------------------------------------------
    // Translation
    // -----------------------------------------------------------------

    /// Translate one DMA access.
    ///
    /// Never fails in-band: a blocked access comes back with empty
    /// permissions and the reason goes out on the event queue. The
    /// fault record is built under the core mutex; posting happens
    /// after it is dropped.
    pub fn translate(&self, endpoint_id: u32, addr: u64, access: MapPerms) -> Translation {
        let (result, fault) = self.translate_locked(endpoint_id, addr, access);
        if let Some(fault) = fault {
            self.report_fault(fault);
        }
        result
    }

    fn translate_locked(
        &self,
        endpoint_id: u32,
        addr: u64,
        access: MapPerms,
    ) -> (Translation, Option<Fault>) {
        let mask = self.config.page_size_mask;
        let identity = Translation {
            addr,
            perms: access,
            mask,
        };
        let blocked = Translation {
            addr: 0,
            perms: MapPerms::empty(),
            mask,
        };
        let fault = |reason, flags: FaultFlags| {
            Some(Fault {
                reason,
                flags: flags | FaultFlags::ADDRESS_VALID,
                endpoint: endpoint_id,
                address: addr,
            })
        };

        let state = self.state.lock();

        let Some(ep) = state.endpoints.lookup(endpoint_id) else {
            if self.bypass_enabled() {
                return (identity, None);
            }
            return (blocked, fault(FaultReason::Unknown, FaultFlags::empty()));
        };

        // Reserved regions override whatever the domain maps.
        for region in &self.resv_regions {
            if region.range.contains(addr) {
                return match region.subtype {
                    ResvMemSubtype::Msi => (identity, None),
                    ResvMemSubtype::Reserved => {
                        (blocked, fault(FaultReason::Mapping, FaultFlags::empty()))
                    }
                };
            }
        }

        let Some(domain_id) = ep.binding() else {
            if self.bypass_enabled() {
                return (identity, None);
            }
            return (blocked, fault(FaultReason::Domain, FaultFlags::empty()));
        };
        let domain = state.domains.lookup(domain_id);
        debug_assert!(domain.is_some());
        let Some(domain) = domain else {
            return (blocked, fault(FaultReason::Domain, FaultFlags::empty()));
        };

        let Some((range, mapping)) = domain.mappings().get_containing(addr) else {
            return (blocked, fault(FaultReason::Mapping, FaultFlags::empty()));
        };

        let violated = access - mapping.perms;
        if !violated.is_empty() {
            let flags = FaultFlags::from_bits_truncate(violated.bits());
            return (blocked, fault(FaultReason::Mapping, flags));
        }

        (
            Translation {
                addr: mapping.translate(&range, addr),
                perms: access,
                mask,
            },
            None,
        )
    }

    // -----------------------------------------------------------------
    // Fault reporting
    // -----------------------------------------------------------------

    fn report_fault(&self, fault: Fault) {
        if self.event_channel_broken.load(Ordering::Acquire) {
            return;
        }
        let record = fault.encode();
        let result = self.events.lock().post(&record);
        match result {
            Ok(()) => {}
            Err(EventError::Empty) => {
                warn!(
                    "event queue empty, dropping {:?} fault for endpoint 0x{:x}",
                    fault.reason, fault.endpoint
                );
            }
            Err(EventError::Undersized { len, needed }) => {
                error!(
                    "event buffer of {} bytes cannot hold a {}-byte fault record, \
                     disabling fault reporting",
                    len, needed
                );
                self.event_channel_broken.store(true, Ordering::Release);
            }
        }
    }

    // -----------------------------------------------------------------
    // Subscriptions, replay, reset
    // -----------------------------------------------------------------

    /// Subscribe a downstream consumer for `endpoint_id`. No-op (returns
    /// false) if one is already subscribed.
    pub fn register_notifier(
        &self,
        endpoint_id: u32,
        notifier: Arc<dyn MappingNotifier>,
    ) -> bool {
        self.state.lock().notifiers.register(endpoint_id, notifier)
    }

    /// Drop the subscription for `endpoint_id`, if any.
    pub fn unregister_notifier(&self, endpoint_id: u32) -> bool {
        self.state.lock().notifiers.unregister(endpoint_id)
    }

    /// Re-emit an install event for every live mapping of the endpoint's
    /// domain, so a consumer can rebuild its shadow state from scratch.
    pub fn replay(&self, endpoint_id: u32) -> Result<(), Error> {
        let state = self.state.lock();
        let ep = state
            .endpoints
            .lookup(endpoint_id)
            .ok_or(Error::UnknownEndpoint { endpoint_id })?;
        let domain_id = ep.binding().ok_or(Error::EndpointNotBound { endpoint_id })?;
        let Some(notifier) = state.notifiers.get(endpoint_id) else {
            return Ok(());
        };
        let Some(domain) = state.domains.lookup(domain_id) else {
            debug_assert!(false, "bound endpoint without domain");
            return Ok(());
        };
        for (range, mapping) in domain.mappings().iter() {
            notifier.map(range, mapping.phys_start, mapping.perms);
        }
        Ok(())
    }

    /// Forget all guest-visible state, as on a virtio device reset.
    ///
    /// Subscribers are told to drop their shadows of every live mapping
    /// first. The subscriptions themselves belong to the embedder and
    /// survive; negotiated features do not.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let State {
            domains,
            endpoints,
            notifiers,
        } = &mut *state;

        for (endpoint_id, notifier) in notifiers.iter() {
            let Some(domain_id) = endpoints.lookup(endpoint_id).and_then(|ep| ep.binding())
            else {
                continue;
            };
            if let Some(domain) = domains.lookup(domain_id) {
                for (range, _) in domain.mappings().iter() {
                    notifier.unmap(range);
                }
            }
        }
        domains.clear();
        endpoints.clear();
        drop(state);

        self.acked_features.store(0, Ordering::Release);
        self.event_channel_broken.store(false, Ordering::Release);
        debug!("device reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::test_support::{NotifierEvent, RecordingNotifier};
    use crate::transport::test_support::TestEventChannel;
    use crate::wire::FAULT_EVENT_LEN;

    const OK: u8 = RequestStatus::Ok as u8;

    // -- request builders ---------------------------------------------

    fn attach_req(domain: u32, endpoint: u32) -> Vec<u8> {
        let mut buf = alloc::vec![request::ATTACH, 0, 0, 0];
        buf.extend_from_slice(&domain.to_le_bytes());
        buf.extend_from_slice(&endpoint.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        buf
    }

    fn detach_req(domain: u32, endpoint: u32) -> Vec<u8> {
        let mut buf = attach_req(domain, endpoint);
        buf[0] = request::DETACH;
        buf
    }

    fn map_req(domain: u32, vs: u64, ve: u64, phys: u64, flags: MapPerms) -> Vec<u8> {
        let mut buf = alloc::vec![request::MAP, 0, 0, 0];
        buf.extend_from_slice(&domain.to_le_bytes());
        buf.extend_from_slice(&vs.to_le_bytes());
        buf.extend_from_slice(&ve.to_le_bytes());
        buf.extend_from_slice(&phys.to_le_bytes());
        buf.extend_from_slice(&flags.bits().to_le_bytes());
        buf
    }

    fn unmap_req(domain: u32, vs: u64, ve: u64) -> Vec<u8> {
        let mut buf = alloc::vec![request::UNMAP, 0, 0, 0];
        buf.extend_from_slice(&domain.to_le_bytes());
        buf.extend_from_slice(&vs.to_le_bytes());
        buf.extend_from_slice(&ve.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    fn probe_req(endpoint: u32) -> Vec<u8> {
        let mut buf = alloc::vec![request::PROBE, 0, 0, 0];
        buf.extend_from_slice(&endpoint.to_le_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        buf
    }

    /// Run a non-probe request and return the status byte.
    fn run(iommu: &Iommu, req: &[u8]) -> u8 {
        let mut resp = [0xffu8; 1];
        let written = iommu.handle_request(req, &mut resp).unwrap();
        assert_eq!(written, 1);
        resp[0]
    }

    fn resv(low: u64, high: u64, subtype: ResvMemSubtype) -> ReservedRegion {
        ReservedRegion {
            range: IovaRange::new(low, high),
            subtype,
        }
    }

    fn device_with(regions: Vec<ReservedRegion>) -> (Iommu, TestEventChannel) {
        let channel = TestEventChannel::with_buffers(64, FAULT_EVENT_LEN);
        let iommu = Iommu::new(IommuConfig::default(), regions, Box::new(channel.clone()));
        let all = iommu.device_features();
        iommu.ack_features(all);
        (iommu, channel)
    }

    fn decode_fault(record: &[u8]) -> (u8, u32, u32, u64) {
        (
            record[0],
            u32::from_le_bytes(record[4..8].try_into().unwrap()),
            u32::from_le_bytes(record[8..12].try_into().unwrap()),
            u64::from_le_bytes(record[16..24].try_into().unwrap()),
        )
    }

    // -- scenarios ----------------------------------------------------

    #[test]
    fn test_map_translate_and_reserved_regions() {
        let (iommu, channel) = device_with(alloc::vec![
            resv(0x0, 0xfff, ResvMemSubtype::Reserved),
            resv(0xfee00000, 0xfeefffff, ResvMemSubtype::Msi),
        ]);

        assert_eq!(run(&iommu, &attach_req(7, 0x0100)), OK);
        assert_eq!(
            run(
                &iommu,
                &map_req(7, 0x1000, 0x1fff, 0xaaaa0000, MapPerms::READ | MapPerms::WRITE)
            ),
            OK
        );

        // Hit inside the mapping: offset is preserved.
        let t = iommu.translate(0x0100, 0x1800, MapPerms::READ);
        assert_eq!(t.addr, 0xaaaa0800);
        assert_eq!(t.perms, MapPerms::READ);
        assert_eq!(t.mask, !0xfff);
        // The mapping is read-write, so a write passes too.
        let t = iommu.translate(0x0100, 0x1800, MapPerms::WRITE);
        assert_eq!(t.addr, 0xaaaa0800);
        assert_eq!(t.perms, MapPerms::WRITE);

        // MSI doorbell passes through untranslated.
        let t = iommu.translate(0x0100, 0xfee01234, MapPerms::WRITE);
        assert_eq!(t.addr, 0xfee01234);
        assert_eq!(t.perms, MapPerms::WRITE);

        // Rejecting reserved region, and a hole in the mapping space.
        assert!(iommu.translate(0x0100, 0x200, MapPerms::READ).perms.is_empty());
        assert!(iommu.translate(0x0100, 0x3000, MapPerms::READ).perms.is_empty());

        let posted = channel.posted();
        assert_eq!(posted.len(), 2);
        for record in &posted {
            let (reason, flags, endpoint, _) = decode_fault(record);
            assert_eq!(reason, FaultReason::Mapping as u8);
            assert_eq!(flags, FaultFlags::ADDRESS_VALID.bits());
            assert_eq!(endpoint, 0x0100);
        }
        let (_, _, _, addr0) = decode_fault(&posted[0]);
        let (_, _, _, addr1) = decode_fault(&posted[1]);
        assert_eq!(addr0, 0x200);
        assert_eq!(addr1, 0x3000);
    }

    #[test]
    fn test_overlap_and_split_rejection() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(run(&iommu, &attach_req(1, 0x42)), OK);

        assert_eq!(run(&iommu, &map_req(1, 0, 0xffff, 0, MapPerms::READ)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0x0800, 0x0fff, 0, MapPerms::READ)),
            RequestStatus::Inval.as_u8()
        );
        assert_eq!(
            run(&iommu, &unmap_req(1, 0x0800, 0x0fff)),
            RequestStatus::Range.as_u8()
        );
        assert_eq!(run(&iommu, &unmap_req(1, 0, 0xffff)), OK);
    }

    #[test]
    fn test_reattach_moves_endpoint() {
        let (iommu, _) = device_with(Vec::new());
        let ep_a = 0x0a00;
        let watcher = Arc::new(RecordingNotifier::new());
        iommu.register_notifier(ep_a, watcher.clone());

        // Domain 2 exists with a mapping before A moves in.
        assert_eq!(run(&iommu, &attach_req(2, 0x0b00)), OK);
        assert_eq!(
            run(&iommu, &map_req(2, 0x8000, 0x8fff, 0x2000, MapPerms::READ)),
            OK
        );

        assert_eq!(run(&iommu, &attach_req(1, ep_a)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0x1000, 0x1fff, 0x1000, MapPerms::READ)),
            OK
        );
        watcher.take();

        // Rebinding detaches from domain 1 (invalidates), then attaches
        // to domain 2 (installs what it already maps).
        assert_eq!(run(&iommu, &attach_req(2, ep_a)), OK);
        assert_eq!(
            watcher.take(),
            [
                NotifierEvent::Unmap {
                    range: (0x1000, 0x1fff),
                },
                NotifierEvent::Map {
                    range: (0x8000, 0x8fff),
                    phys_start: 0x2000,
                    perms: MapPerms::READ,
                },
            ]
        );

        // A now translates through domain 2, not domain 1.
        assert!(iommu.translate(ep_a, 0x1800, MapPerms::READ).perms.is_empty());
        assert_eq!(iommu.translate(ep_a, 0x8010, MapPerms::READ).addr, 0x2010);

        // Detaching A from domain 1 must fail: it is bound to domain 2.
        assert_eq!(
            run(&iommu, &detach_req(1, ep_a)),
            RequestStatus::Inval.as_u8()
        );
    }

    #[test]
    fn test_bypass_negotiation() {
        // With BYPASS: an unknown stream ID passes through untouched.
        let (iommu, channel) = device_with(Vec::new());
        let t = iommu.translate(0x9999, 0x5000, MapPerms::READ);
        assert_eq!(t.addr, 0x5000);
        assert_eq!(t.perms, MapPerms::READ);
        assert!(channel.posted().is_empty());

        // Without BYPASS: blocked, and an UNKNOWN fault goes out.
        let channel = TestEventChannel::with_buffers(8, FAULT_EVENT_LEN);
        let iommu = Iommu::new(
            IommuConfig::default(),
            Vec::new(),
            Box::new(channel.clone()),
        );
        iommu.ack_features(Features::MAP_UNMAP);
        let t = iommu.translate(0x9999, 0x5000, MapPerms::READ);
        assert!(t.perms.is_empty());
        let posted = channel.posted();
        assert_eq!(posted.len(), 1);
        let (reason, flags, endpoint, addr) = decode_fault(&posted[0]);
        assert_eq!(reason, FaultReason::Unknown as u8);
        assert_eq!(flags, FaultFlags::ADDRESS_VALID.bits());
        assert_eq!(endpoint, 0x9999);
        assert_eq!(addr, 0x5000);
    }

    #[test]
    fn test_partial_unmap_commits_prefix() {
        let (iommu, _) = device_with(Vec::new());
        let ep = 0x31;
        let watcher = Arc::new(RecordingNotifier::new());
        iommu.register_notifier(ep, watcher.clone());
        assert_eq!(run(&iommu, &attach_req(1, ep)), OK);
        for (vs, ve) in [(0u64, 0xfffu64), (0x1000, 0x1fff), (0x3000, 0x4fff)] {
            assert_eq!(run(&iommu, &map_req(1, vs, ve, vs, MapPerms::READ)), OK);
        }
        watcher.take();

        // The third mapping would be split at 0x3fff: the first two are
        // removed and stay removed, the third survives.
        assert_eq!(
            run(&iommu, &unmap_req(1, 0, 0x3fff)),
            RequestStatus::Range.as_u8()
        );
        assert_eq!(
            watcher.take(),
            [
                NotifierEvent::Unmap { range: (0, 0xfff) },
                NotifierEvent::Unmap {
                    range: (0x1000, 0x1fff),
                },
            ]
        );
        assert!(iommu.translate(ep, 0x0100, MapPerms::READ).perms.is_empty());
        assert!(iommu.translate(ep, 0x1100, MapPerms::READ).perms.is_empty());
        assert_eq!(iommu.translate(ep, 0x3000, MapPerms::READ).addr, 0x3000);
    }

    #[test]
    fn test_probe_properties() {
        let regions: Vec<ReservedRegion> = (0..6)
            .map(|i| {
                resv(
                    0x1_0000 * (i as u64 + 1),
                    0x1_0000 * (i as u64 + 1) + 0xfff,
                    if i == 0 {
                        ResvMemSubtype::Msi
                    } else {
                        ResvMemSubtype::Reserved
                    },
                )
            })
            .collect();
        let (iommu, _) = device_with(regions);

        let probe_size = iommu.config().probe_size as usize;
        let mut resp = alloc::vec![0xffu8; probe_size + 1];
        let written = iommu.handle_request(&probe_req(0x0100), &mut resp).unwrap();
        assert_eq!(written, probe_size + 1);
        assert_eq!(resp[probe_size], OK);

        // Six RESV_MEM properties, then the terminator.
        let mut offset = 0;
        for i in 0..6 {
            let prop_type = u16::from_le_bytes(resp[offset..offset + 2].try_into().unwrap());
            let len = u16::from_le_bytes(resp[offset + 2..offset + 4].try_into().unwrap());
            assert_eq!(prop_type, wire::probe::PROP_RESV_MEM);
            assert_eq!(len as usize, wire::RESV_MEM_PROP_LEN);
            let subtype = resp[offset + 4];
            assert_eq!(subtype, if i == 0 { 1 } else { 0 });
            let start = u64::from_le_bytes(resp[offset + 8..offset + 16].try_into().unwrap());
            assert_eq!(start, 0x1_0000 * (i as u64 + 1));
            offset += wire::PROBE_PROP_HEAD_LEN + wire::RESV_MEM_PROP_LEN;
        }
        assert_eq!(&resp[offset..offset + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_probe_twenty_regions_fit() {
        // At 24 bytes per RESV_MEM property, 20 regions plus the
        // terminator come to 484 bytes and fit the 512-byte buffer.
        let regions: Vec<ReservedRegion> = (0..20)
            .map(|i| resv(0x10000 * i, 0x10000 * i + 0xfff, ResvMemSubtype::Reserved))
            .collect();
        let (iommu, _) = device_with(regions);

        let probe_size = iommu.config().probe_size as usize;
        let mut resp = alloc::vec![0u8; probe_size + 1];
        iommu.handle_request(&probe_req(1), &mut resp).unwrap();
        assert_eq!(resp[probe_size], OK);
    }

    #[test]
    fn test_probe_overflow() {
        // 22 properties plus the terminator need 532 bytes, more than
        // the 512-byte buffer holds.
        let regions: Vec<ReservedRegion> = (0..22)
            .map(|i| resv(0x10000 * i, 0x10000 * i + 0xfff, ResvMemSubtype::Reserved))
            .collect();
        let (iommu, _) = device_with(regions);

        let probe_size = iommu.config().probe_size as usize;
        let mut resp = alloc::vec![0u8; probe_size + 1];
        iommu.handle_request(&probe_req(1), &mut resp).unwrap();
        assert_eq!(resp[probe_size], RequestStatus::Inval.as_u8());
    }

    #[test]
    fn test_probe_without_feature() {
        let channel = TestEventChannel::with_buffers(1, FAULT_EVENT_LEN);
        let iommu = Iommu::new(IommuConfig::default(), Vec::new(), Box::new(channel));
        iommu.ack_features(Features::MAP_UNMAP);
        assert_eq!(
            run(&iommu, &probe_req(1)),
            RequestStatus::Unsupp.as_u8()
        );
    }

    // -- request-level edge cases -------------------------------------

    #[test]
    fn test_unknown_request_type() {
        let (iommu, _) = device_with(Vec::new());
        let req = [0x7fu8, 0, 0, 0];
        assert_eq!(run(&iommu, &req), RequestStatus::Unsupp.as_u8());
    }

    #[test]
    fn test_truncated_payload_is_deverr() {
        let (iommu, _) = device_with(Vec::new());
        let full = map_req(1, 0, 0xfff, 0, MapPerms::READ);
        assert_eq!(
            run(&iommu, &full[..12]),
            RequestStatus::Deverr.as_u8()
        );
    }

    #[test]
    fn test_transport_errors() {
        let (iommu, _) = device_with(Vec::new());
        let mut resp = [0u8; 1];
        assert_eq!(
            iommu.handle_request(&[request::MAP, 0], &mut resp),
            Err(TransportError::ShortRequest { len: 2 })
        );
        assert_eq!(
            iommu.handle_request(&attach_req(1, 2), &mut []),
            Err(TransportError::ShortResponse { len: 0, needed: 1 })
        );
        // Probe needs the full property buffer plus the status byte.
        let mut small = [0u8; 16];
        assert!(matches!(
            iommu.handle_request(&probe_req(1), &mut small),
            Err(TransportError::ShortResponse { len: 16, .. })
        ));
    }

    #[test]
    fn test_lookup_requests_do_not_create() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(
            run(&iommu, &map_req(3, 0, 0xfff, 0, MapPerms::READ)),
            RequestStatus::Noent.as_u8()
        );
        assert_eq!(
            run(&iommu, &unmap_req(3, 0, 0xfff)),
            RequestStatus::Noent.as_u8()
        );
        assert_eq!(
            run(&iommu, &detach_req(3, 0x50)),
            RequestStatus::Noent.as_u8()
        );
    }

    #[test]
    fn test_detach_state_machine() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &detach_req(1, 0x50)), OK);
        // The endpoint still exists but is unbound now.
        assert_eq!(
            run(&iommu, &detach_req(1, 0x50)),
            RequestStatus::Inval.as_u8()
        );
    }

    #[test]
    fn test_detach_erases_visibility() {
        let channel = TestEventChannel::with_buffers(8, FAULT_EVENT_LEN);
        let iommu = Iommu::new(
            IommuConfig::default(),
            Vec::new(),
            Box::new(channel),
        );
        iommu.ack_features(Features::MAP_UNMAP);
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &map_req(1, 0, 0xfff, 0x7000, MapPerms::READ)), OK);
        assert_eq!(iommu.translate(0x50, 0x10, MapPerms::READ).addr, 0x7010);

        assert_eq!(run(&iommu, &detach_req(1, 0x50)), OK);
        assert!(iommu.translate(0x50, 0x10, MapPerms::READ).perms.is_empty());
    }

    #[test]
    fn test_domain_range_enforced() {
        let (iommu, _) = device_with(Vec::new());
        // Default domain range ends at 32.
        assert_eq!(
            run(&iommu, &attach_req(77, 1)),
            RequestStatus::Noent.as_u8()
        );
        assert_eq!(run(&iommu, &attach_req(32, 1)), OK);
    }

    #[test]
    fn test_input_range_enforced() {
        let config = IommuConfig {
            input_range: wire::Range64 {
                start: 0,
                end: 0xffff,
            },
            ..IommuConfig::default()
        };
        let channel = TestEventChannel::with_buffers(1, FAULT_EVENT_LEN);
        let iommu = Iommu::new(config, Vec::new(), Box::new(channel));
        iommu.ack_features(Features::MAP_UNMAP | Features::INPUT_RANGE);
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0x8000, 0x1_0000, 0, MapPerms::READ)),
            RequestStatus::Range.as_u8()
        );
        assert_eq!(run(&iommu, &map_req(1, 0x8000, 0xffff, 0, MapPerms::READ)), OK);
    }

    #[test]
    fn test_map_payload_validation() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        // Inverted range.
        assert_eq!(
            run(&iommu, &map_req(1, 0x2000, 0x1000, 0, MapPerms::READ)),
            RequestStatus::Inval.as_u8()
        );
        // Unknown flag bits.
        let mut req = map_req(1, 0x1000, 0x1fff, 0, MapPerms::READ);
        let len = req.len();
        req[len - 4..].copy_from_slice(&0x80u32.to_le_bytes());
        assert_eq!(run(&iommu, &req), RequestStatus::Inval.as_u8());
    }

    #[test]
    fn test_status_precedence_on_combined_errors() {
        // A request that is malformed AND names an out-of-range domain
        // reports the payload error, not NOENT.
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(
            run(&iommu, &map_req(77, 0x2000, 0x1000, 0, MapPerms::READ)),
            RequestStatus::Inval.as_u8()
        );
        assert_eq!(
            run(&iommu, &unmap_req(77, 0x2000, 0x1000)),
            RequestStatus::Inval.as_u8()
        );

        // An IOVA range outside the input range outranks the domain
        // check as well.
        let config = IommuConfig {
            input_range: wire::Range64 {
                start: 0,
                end: 0xffff,
            },
            ..IommuConfig::default()
        };
        let channel = TestEventChannel::with_buffers(1, FAULT_EVENT_LEN);
        let iommu = Iommu::new(config, Vec::new(), Box::new(channel));
        iommu.ack_features(Features::MAP_UNMAP | Features::INPUT_RANGE);
        assert_eq!(
            run(&iommu, &map_req(77, 0x8000, 0x1_0000, 0, MapPerms::READ)),
            RequestStatus::Range.as_u8()
        );
    }

    // -- domain lifetime ----------------------------------------------

    #[test]
    fn test_domain_survives_detach_while_mapped() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &map_req(1, 0, 0xfff, 0, MapPerms::READ)), OK);
        assert_eq!(run(&iommu, &detach_req(1, 0x50)), OK);

        // The unbound domain still holds its mapping, so UNMAP finds it.
        assert_eq!(run(&iommu, &unmap_req(1, 0, 0xfff)), OK);
        // Now empty and endpoint-less: the domain is gone.
        assert_eq!(
            run(&iommu, &map_req(1, 0, 0xfff, 0, MapPerms::READ)),
            RequestStatus::Noent.as_u8()
        );
    }

    #[test]
    fn test_empty_domain_dropped_on_detach() {
        let (iommu, _) = device_with(Vec::new());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &detach_req(1, 0x50)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0, 0xfff, 0, MapPerms::READ)),
            RequestStatus::Noent.as_u8()
        );
    }

    #[test]
    fn test_shared_domain_fanout() {
        let (iommu, _) = device_with(Vec::new());
        let watcher_a = Arc::new(RecordingNotifier::new());
        let watcher_b = Arc::new(RecordingNotifier::new());
        iommu.register_notifier(0xa, watcher_a.clone());
        iommu.register_notifier(0xb, watcher_b.clone());

        assert_eq!(run(&iommu, &attach_req(1, 0xa)), OK);
        assert_eq!(run(&iommu, &attach_req(1, 0xb)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0x1000, 0x1fff, 0x9000, MapPerms::WRITE)),
            OK
        );

        let expected = [NotifierEvent::Map {
            range: (0x1000, 0x1fff),
            phys_start: 0x9000,
            perms: MapPerms::WRITE,
        }];
        assert_eq!(watcher_a.take(), expected);
        assert_eq!(watcher_b.take(), expected);

        // Detaching B invalidates only B's shadow.
        assert_eq!(run(&iommu, &detach_req(1, 0xb)), OK);
        assert!(watcher_a.take().is_empty());
        assert_eq!(
            watcher_b.take(),
            [NotifierEvent::Unmap {
                range: (0x1000, 0x1fff),
            }]
        );
    }

    // -- replay -------------------------------------------------------

    #[test]
    fn test_replay_idempotent() {
        let (iommu, _) = device_with(Vec::new());
        let watcher = Arc::new(RecordingNotifier::new());
        iommu.register_notifier(0x50, watcher.clone());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &map_req(1, 0, 0xfff, 0x1000, MapPerms::READ)), OK);
        assert_eq!(
            run(&iommu, &map_req(1, 0x4000, 0x4fff, 0x2000, MapPerms::WRITE)),
            OK
        );
        watcher.take();

        let expected = [
            NotifierEvent::Map {
                range: (0, 0xfff),
                phys_start: 0x1000,
                perms: MapPerms::READ,
            },
            NotifierEvent::Map {
                range: (0x4000, 0x4fff),
                phys_start: 0x2000,
                perms: MapPerms::WRITE,
            },
        ];
        iommu.replay(0x50).unwrap();
        assert_eq!(watcher.take(), expected);
        iommu.replay(0x50).unwrap();
        assert_eq!(watcher.take(), expected);

        assert_eq!(
            iommu.replay(0x9999),
            Err(Error::UnknownEndpoint {
                endpoint_id: 0x9999
            })
        );
    }

    // -- fault channel ------------------------------------------------

    #[test]
    fn test_fault_dropped_when_queue_empty() {
        let channel = TestEventChannel::with_buffers(0, FAULT_EVENT_LEN);
        let iommu = Iommu::new(
            IommuConfig::default(),
            Vec::new(),
            Box::new(channel.clone()),
        );
        iommu.ack_features(Features::MAP_UNMAP);
        let t = iommu.translate(0x1, 0x5000, MapPerms::READ);
        assert!(t.perms.is_empty());
        assert!(channel.posted().is_empty());
    }

    #[test]
    fn test_undersized_event_buffer_breaks_channel() {
        let channel = TestEventChannel::with_buffers(8, 4);
        let iommu = Iommu::new(
            IommuConfig::default(),
            Vec::new(),
            Box::new(channel.clone()),
        );
        iommu.ack_features(Features::MAP_UNMAP);
        iommu.translate(0x1, 0x5000, MapPerms::READ);
        iommu.translate(0x1, 0x6000, MapPerms::READ);
        // Nothing was ever posted, and the channel is not touched again
        // after the first undersized buffer.
        assert!(channel.posted().is_empty());
        assert!(iommu.event_channel_broken.load(Ordering::Acquire));
    }

    // -- reset --------------------------------------------------------

    #[test]
    fn test_reset_clears_state() {
        let (iommu, _) = device_with(Vec::new());
        let watcher = Arc::new(RecordingNotifier::new());
        iommu.register_notifier(0x50, watcher.clone());
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &map_req(1, 0, 0xfff, 0, MapPerms::READ)), OK);
        watcher.take();

        iommu.reset();

        // Shadows were invalidated, features forgotten, state emptied.
        assert_eq!(watcher.take(), [NotifierEvent::Unmap { range: (0, 0xfff) }]);
        assert!(iommu.acked_features().is_empty());
        assert_eq!(
            run(&iommu, &detach_req(1, 0x50)),
            RequestStatus::Noent.as_u8()
        );
        // Subscriptions survive: a new attach replays into the watcher.
        assert_eq!(run(&iommu, &attach_req(1, 0x50)), OK);
        assert_eq!(run(&iommu, &map_req(1, 0, 0xfff, 0, MapPerms::READ)), OK);
        assert_eq!(watcher.take().len(), 1);
    }
}
