//! Notifier handles for downstream translation consumers.
//!
//! A DMA-consuming component (a vhost backend, a userspace device
//! process) that shadows translations subscribes here, keyed by the
//! endpoint it consumes for. The device then mirrors every mapping
//! mutation to the affected subscribers, synchronously and under the
//! core mutex, so shadow state can never drift from the authoritative
//! state across concurrent mutations. Callbacks must not call back into
//! the device.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::interval::IovaRange;
use crate::wire::MapPerms;

/// Callbacks a downstream translation consumer implements.
///
/// Both calls are made while the device's core mutex is held; they must
/// return without blocking and without re-entering the device.
pub trait MappingNotifier: Send + Sync {
    /// A translation for `range` became live; install it.
    fn map(&self, range: IovaRange, phys_start: u64, perms: MapPerms);

    /// Translations covering `range` are gone; drop any shadows of them.
    fn unmap(&self, range: IovaRange);
}

/// Subscribers keyed by endpoint stream ID, one per endpoint.
///
/// The subscription is a two-state machine: registering an endpoint that
/// already has a notifier is a no-op, as is unregistering one that has
/// none. That mirrors how transports report notifier-wanted flag
/// changes: only the edge transitions matter.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: BTreeMap<u32, Arc<dyn MappingNotifier>>,
}

impl NotifierRegistry {
    pub const fn new() -> Self {
        Self {
            notifiers: BTreeMap::new(),
        }
    }

    /// Subscribe `notifier` for `endpoint_id`. Returns false (and keeps
    /// the existing subscription) if one is already active.
    pub fn register(&mut self, endpoint_id: u32, notifier: Arc<dyn MappingNotifier>) -> bool {
        use alloc::collections::btree_map::Entry;
        match self.notifiers.entry(endpoint_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(notifier);
                true
            }
        }
    }

    /// Drop the subscription for `endpoint_id`, if any.
    pub fn unregister(&mut self, endpoint_id: u32) -> bool {
        self.notifiers.remove(&endpoint_id).is_some()
    }

    pub fn get(&self, endpoint_id: u32) -> Option<&Arc<dyn MappingNotifier>> {
        self.notifiers.get(&endpoint_id)
    }

    /// Iterate subscriptions as (endpoint ID, notifier) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Arc<dyn MappingNotifier>)> {
        self.notifiers.iter().map(|(id, n)| (*id, n))
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{NotifierEvent, RecordingNotifier};
    use super::*;

    #[test]
    fn test_subscription_edges() {
        let mut registry = NotifierRegistry::new();
        let notifier = Arc::new(RecordingNotifier::new());

        assert!(registry.register(0x100, notifier.clone()));
        // Second registration for the same endpoint is a no-op.
        assert!(!registry.register(0x100, Arc::new(RecordingNotifier::new())));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(0x100));
        assert!(!registry.unregister(0x100));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_recording() {
        let notifier = RecordingNotifier::new();
        notifier.map(IovaRange::new(0x1000, 0x1fff), 0xaaaa0000, MapPerms::READ);
        notifier.unmap(IovaRange::new(0x1000, 0x1fff));

        assert_eq!(
            notifier.take(),
            [
                NotifierEvent::Map {
                    range: (0x1000, 0x1fff),
                    phys_start: 0xaaaa0000,
                    perms: MapPerms::READ,
                },
                NotifierEvent::Unmap {
                    range: (0x1000, 0x1fff),
                },
            ]
        );
        assert!(notifier.take().is_empty());
    }
}
