use std::collections::HashMap;

use common::ServiceSnapshot;
use parking_lot::RwLock;

/// Last pushed snapshot per subscribed service.
///
/// Pushes from different mutations can overtake each other on the way out of
/// the registry, so anything at or below the cached version is dropped.
#[derive(Default)]
pub(crate) struct ServiceCache {
    services: RwLock<HashMap<String, ServiceSnapshot>>,
}

impl ServiceCache {
    /// Returns whether the snapshot was fresh and applied.
    pub fn update(&self, snapshot: ServiceSnapshot) -> bool {
        let mut services = self.services.write();
        match services.get(&snapshot.name) {
            Some(it) if snapshot.version <= it.version => false,
            _ => {
                services.insert(snapshot.name.clone(), snapshot);

                true
            }
        }
    }

    pub fn get(&self, service: &str) -> Option<ServiceSnapshot> {
        self.services.read().get(service).cloned()
    }

    pub fn remove(&self, service: &str) {
        self.services.write().remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64) -> ServiceSnapshot {
        ServiceSnapshot {
            name: "svc".to_string(),
            version,
            instances: Vec::new(),
        }
    }

    #[test]
    fn stale_versions_are_dropped() {
        let cache = ServiceCache::default();

        assert!(cache.update(snapshot(3)));
        assert!(!cache.update(snapshot(3)));
        assert!(!cache.update(snapshot(1)));
        assert!(cache.update(snapshot(4)));

        assert_eq!(cache.get("svc").unwrap().version, 4);
    }

    #[test]
    fn removed_services_accept_any_version() {
        let cache = ServiceCache::default();

        assert!(cache.update(snapshot(5)));
        cache.remove("svc");
        assert!(cache.get("svc").is_none());
        assert!(cache.update(snapshot(1)));
    }
}
