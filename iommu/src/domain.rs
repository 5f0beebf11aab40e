//! Translation domains, endpoints, and the registries that own them.
//!
//! A domain is a bag of mappings shared by every endpoint attached to it;
//! an endpoint is a DMA-capable device identified by its stream ID. The
//! two sides reference each other by ID only -- the domain stores the
//! stream IDs of its members and the endpoint stores the domain ID it is
//! bound to -- so the cyclic shape of the model never turns into a
//! reference cycle. Both registries resolve IDs at use sites.

use alloc::collections::{BTreeMap, BTreeSet};

use crate::interval::{IntervalMap, IovaRange};
use crate::wire::MapPerms;

/// A translation record: the guest chose `[low, high]`, the device maps
/// it onto `phys_start` with `perms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub phys_start: u64,
    pub perms: MapPerms,
}

impl Mapping {
    /// Translate `addr` within `range` to its physical counterpart.
    pub fn translate(&self, range: &IovaRange, addr: u64) -> u64 {
        debug_assert!(range.contains(addr));
        self.phys_start + (addr - range.low)
    }
}

/// A translation context. Mappings are domain-scoped: every attached
/// endpoint observes the same translations.
#[derive(Debug, Default)]
pub struct Domain {
    pub(crate) mappings: IntervalMap<Mapping>,
    pub(crate) endpoints: BTreeSet<u32>,
}

impl Domain {
    fn new() -> Self {
        Self::default()
    }

    /// The mappings installed in this domain.
    pub fn mappings(&self) -> &IntervalMap<Mapping> {
        &self.mappings
    }

    /// Stream IDs of the endpoints currently attached, ascending.
    pub fn endpoint_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.endpoints.iter().copied()
    }

    /// Whether `endpoint_id` is attached to this domain.
    pub fn has_endpoint(&self, endpoint_id: u32) -> bool {
        self.endpoints.contains(&endpoint_id)
    }

    /// A domain with no endpoints and no mappings is dead weight and may
    /// be dropped by its registry. One with live endpoints never is.
    pub fn is_unused(&self) -> bool {
        self.endpoints.is_empty() && self.mappings.is_empty()
    }
}

/// A DMA-capable device, created lazily by the first attach that names
/// its stream ID.
#[derive(Debug, Default)]
pub struct Endpoint {
    pub(crate) domain: Option<u32>,
}

impl Endpoint {
    /// The domain this endpoint is bound to, if any.
    pub fn binding(&self) -> Option<u32> {
        self.domain
    }
}

/// Registry of domains keyed by guest-chosen domain ID.
///
/// `get_or_create` backs ATTACH, the only request allowed to create
/// entities; everything else goes through `lookup` and reports NOENT on
/// a miss.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: BTreeMap<u32, Domain>,
}

impl DomainRegistry {
    pub const fn new() -> Self {
        Self {
            domains: BTreeMap::new(),
        }
    }

    pub fn get_or_create(&mut self, domain_id: u32) -> &mut Domain {
        self.domains.entry(domain_id).or_insert_with(Domain::new)
    }

    pub fn lookup(&self, domain_id: u32) -> Option<&Domain> {
        self.domains.get(&domain_id)
    }

    pub fn lookup_mut(&mut self, domain_id: u32) -> Option<&mut Domain> {
        self.domains.get_mut(&domain_id)
    }

    pub fn remove(&mut self, domain_id: u32) -> Option<Domain> {
        self.domains.remove(&domain_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Domain)> {
        self.domains.iter().map(|(id, d)| (*id, d))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn clear(&mut self) {
        self.domains.clear();
    }
}

/// Registry of endpoints keyed by stream ID.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<u32, Endpoint>,
}

impl EndpointRegistry {
    pub const fn new() -> Self {
        Self {
            endpoints: BTreeMap::new(),
        }
    }

    pub fn get_or_create(&mut self, endpoint_id: u32) -> &mut Endpoint {
        self.endpoints.entry(endpoint_id).or_default()
    }

    pub fn lookup(&self, endpoint_id: u32) -> Option<&Endpoint> {
        self.endpoints.get(&endpoint_id)
    }

    pub fn lookup_mut(&mut self, endpoint_id: u32) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&endpoint_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Endpoint)> {
        self.endpoints.iter().map(|(id, ep)| (*id, ep))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
    }
}
