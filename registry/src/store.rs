use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use common::{is_valid_service_name, make_instance_id, Instance, ServiceSnapshot};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
    #[error("instance {id} is not registered under {service}")]
    InstanceNotFound { service: String, id: String },
}

/// Liveness windows for ephemeral instances, measured from the last beat.
/// The defaults assume clients beating every 5s.
#[derive(Debug, Clone, Copy)]
pub struct BeatPolicy {
    /// Missing beats for this long marks the instance unhealthy.
    pub unhealthy_after: Duration,
    /// Missing beats for this long evicts the instance entirely.
    pub evict_after: Duration,
    /// How often the sweeper wakes up to apply the two windows.
    pub sweep_interval: Duration,
}

impl Default for BeatPolicy {
    fn default() -> Self {
        Self {
            unhealthy_after: Duration::from_secs(15),
            evict_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct InstanceRecord {
    instance: Instance,
    last_beat: Instant,
}

#[derive(Default)]
struct Service {
    version: u64,
    instances: HashMap<String, InstanceRecord>,
}

impl Service {
    fn snapshot(&self, name: &str) -> ServiceSnapshot {
        let mut instances = self
            .instances
            .values()
            .map(|it| it.instance.clone())
            .collect::<Vec<_>>();

        // deterministic order for consumers and logs
        instances.sort_by_key(|it| it.instance_id());

        ServiceSnapshot {
            name: name.to_string(),
            version: self.version,
            instances,
        }
    }
}

/// The authoritative instance tables, namespace first so tenants never
/// observe each other. Every mutation bumps the owning service's version;
/// the snapshot a mutation returns is what subscribers get pushed.
pub struct Store {
    policy: BeatPolicy,
    namespaces: RwLock<HashMap<String, HashMap<String, Service>>>,
}

impl Store {
    pub fn new(policy: BeatPolicy) -> Self {
        Self {
            policy,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> BeatPolicy {
        self.policy
    }

    /// Insert or refresh an instance. Re-registration overwrites the
    /// descriptor and counts as a beat.
    pub fn register(
        &self,
        namespace: &str,
        service: &str,
        instance: Instance,
    ) -> Result<ServiceSnapshot, RegistryError> {
        check_service_name(service)?;

        let mut namespaces = self.namespaces.write();
        let service_entry = namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(service.to_string())
            .or_default();

        service_entry.instances.insert(
            instance.instance_id(),
            InstanceRecord {
                instance,
                last_beat: Instant::now(),
            },
        );
        service_entry.version += 1;

        Ok(service_entry.snapshot(service))
    }

    /// Remove an instance. Unknown instances are an error, matching the
    /// contract that a deregistration must name something registered.
    pub fn deregister(
        &self,
        namespace: &str,
        service: &str,
        ip: IpAddr,
        port: u16,
        cluster: &str,
    ) -> Result<ServiceSnapshot, RegistryError> {
        check_service_name(service)?;

        let id = make_instance_id(ip, port, cluster);
        let mut namespaces = self.namespaces.write();
        let service_entry = namespaces
            .get_mut(namespace)
            .and_then(|it| it.get_mut(service))
            .ok_or_else(|| RegistryError::InstanceNotFound {
                service: service.to_string(),
                id: id.clone(),
            })?;

        if service_entry.instances.remove(&id).is_none() {
            return Err(RegistryError::InstanceNotFound {
                service: service.to_string(),
                id,
            });
        }

        service_entry.version += 1;

        Ok(service_entry.snapshot(service))
    }

    /// The current instance set, optionally narrowed to cluster labels. An
    /// unknown service is an empty set, not an error.
    pub fn query(
        &self,
        namespace: &str,
        service: &str,
        clusters: &[String],
    ) -> Result<ServiceSnapshot, RegistryError> {
        check_service_name(service)?;

        let namespaces = self.namespaces.read();
        let mut snapshot = match namespaces.get(namespace).and_then(|it| it.get(service)) {
            Some(it) => it.snapshot(service),
            None => ServiceSnapshot {
                name: service.to_string(),
                version: 0,
                instances: Vec::new(),
            },
        };

        if !clusters.is_empty() {
            snapshot.instances.retain(|it| clusters.contains(&it.cluster));
        }

        Ok(snapshot)
    }

    /// Refresh an instance's liveness. The returned flag asks the client to
    /// register again when the instance is unknown here, e.g. evicted while
    /// the client was paused. A beat that revives an unhealthy instance
    /// produces a changed snapshot to fan out.
    pub fn beat(
        &self,
        namespace: &str,
        service: &str,
        ip: IpAddr,
        port: u16,
        cluster: &str,
    ) -> (bool, Option<ServiceSnapshot>) {
        let id = make_instance_id(ip, port, cluster);
        let mut namespaces = self.namespaces.write();

        let Some(service_entry) = namespaces
            .get_mut(namespace)
            .and_then(|it| it.get_mut(service))
        else {
            return (true, None);
        };

        let Some(record) = service_entry.instances.get_mut(&id) else {
            return (true, None);
        };

        if !record.instance.ephemeral {
            return (false, None);
        }

        record.last_beat = Instant::now();

        if !record.instance.healthy {
            record.instance.healthy = true;
            service_entry.version += 1;

            return (false, Some(service_entry.snapshot(service)));
        }

        (false, None)
    }

    /// Apply the liveness windows to every ephemeral instance. Returns a
    /// changed snapshot per touched service for fan-out.
    pub fn sweep(&self) -> Vec<(String, ServiceSnapshot)> {
        let mut changed = Vec::new();
        let mut namespaces = self.namespaces.write();

        for (namespace, services) in namespaces.iter_mut() {
            for (name, service) in services.iter_mut() {
                let mut touched = false;

                service.instances.retain(|id, record| {
                    if !record.instance.ephemeral {
                        return true;
                    }

                    let elapsed = record.last_beat.elapsed();
                    if elapsed >= self.policy.evict_after {
                        log::info!(
                            "evicted silent instance, namespace={}, service={}, id={}",
                            namespace,
                            name,
                            id
                        );

                        touched = true;
                        return false;
                    }

                    if elapsed >= self.policy.unhealthy_after && record.instance.healthy {
                        log::info!(
                            "instance stopped beating, marking unhealthy, namespace={}, service={}, id={}",
                            namespace,
                            name,
                            id
                        );

                        record.instance.healthy = false;
                        touched = true;
                    }

                    true
                });

                if touched {
                    service.version += 1;
                    changed.push((namespace.clone(), service.snapshot(name)));
                }
            }
        }

        changed
    }
}

fn check_service_name(name: &str) -> Result<(), RegistryError> {
    if is_valid_service_name(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidServiceName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        thread::sleep,
    };

    use super::*;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(11, 11, 11, 11));

    fn fast_policy() -> BeatPolicy {
        BeatPolicy {
            unhealthy_after: Duration::from_millis(40),
            evict_after: Duration::from_millis(120),
            sweep_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn register_then_query_contains_the_instance() {
        let store = Store::new(BeatPolicy::default());

        store
            .register("public", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();

        let snapshot = store.query("public", "svc", &[]).unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].port, 8888);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn reregistration_overwrites_the_descriptor() {
        let store = Store::new(BeatPolicy::default());

        store
            .register("public", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();

        let mut updated = Instance::new(IP, 8888, "TEST1");
        updated.weight = 3.0;
        store.register("public", "svc", updated).unwrap();

        let snapshot = store.query("public", "svc", &[]).unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].weight, 3.0);
        assert_eq!(snapshot.version, 2);
    }

    #[test]
    fn deregister_removes_and_unknown_errors() {
        let store = Store::new(BeatPolicy::default());

        store
            .register("public", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();
        store
            .deregister("public", "svc", IP, 8888, "TEST1")
            .unwrap();

        assert!(store.query("public", "svc", &[]).unwrap().instances.is_empty());

        assert!(matches!(
            store.deregister("public", "svc", IP, 8888, "TEST1"),
            Err(RegistryError::InstanceNotFound { .. })
        ));

        assert!(matches!(
            store.deregister("public", "other", IP, 8888, "TEST1"),
            Err(RegistryError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = Store::new(BeatPolicy::default());

        store
            .register("tenant-a", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();

        assert!(store.query("tenant-b", "svc", &[]).unwrap().instances.is_empty());
        assert_eq!(store.query("tenant-a", "svc", &[]).unwrap().instances.len(), 1);
    }

    #[test]
    fn cluster_filter_narrows_the_result() {
        let store = Store::new(BeatPolicy::default());

        store
            .register("public", "svc", Instance::new(IP, 1, "TEST1"))
            .unwrap();
        store
            .register("public", "svc", Instance::new(IP, 2, "TEST2"))
            .unwrap();

        let snapshot = store
            .query("public", "svc", &["TEST2".to_string()])
            .unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].cluster, "TEST2");

        let snapshot = store.query("public", "svc", &[]).unwrap();
        assert_eq!(snapshot.instances.len(), 2);
    }

    #[test]
    fn bad_service_names_are_rejected() {
        let store = Store::new(BeatPolicy::default());

        assert!(matches!(
            store.register("public", "has space", Instance::new(IP, 1, "")),
            Err(RegistryError::InvalidServiceName(_))
        ));
        assert!(matches!(
            store.query("public", "", &[]),
            Err(RegistryError::InvalidServiceName(_))
        ));
    }

    #[test]
    fn silent_ephemeral_instances_decay_and_die() {
        let store = Store::new(fast_policy());

        store
            .register("public", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();

        // inside the unhealthy window nothing changes
        assert!(store.sweep().is_empty());

        sleep(Duration::from_millis(60));
        let changed = store.sweep();
        assert_eq!(changed.len(), 1);
        assert!(!changed[0].1.instances[0].healthy);

        sleep(Duration::from_millis(100));
        let changed = store.sweep();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].1.instances.is_empty());
    }

    #[test]
    fn beats_keep_instances_alive_and_revive_them() {
        let store = Store::new(fast_policy());

        store
            .register("public", "svc", Instance::new(IP, 8888, "TEST1"))
            .unwrap();

        for _ in 0..4 {
            sleep(Duration::from_millis(20));
            let (resurrect, _) = store.beat("public", "svc", IP, 8888, "TEST1");
            assert!(!resurrect);
            assert!(store.sweep().is_empty());
        }

        // starve past the unhealthy window, then beat back to health
        sleep(Duration::from_millis(60));
        store.sweep();
        assert!(!store.query("public", "svc", &[]).unwrap().instances[0].healthy);

        let (resurrect, changed) = store.beat("public", "svc", IP, 8888, "TEST1");
        assert!(!resurrect);
        assert!(changed.unwrap().instances[0].healthy);
    }

    #[test]
    fn beat_for_an_unknown_instance_asks_to_resurrect() {
        let store = Store::new(fast_policy());

        let (resurrect, changed) = store.beat("public", "svc", IP, 8888, "TEST1");
        assert!(resurrect);
        assert!(changed.is_none());
    }

    #[test]
    fn persistent_instances_outlive_beat_starvation() {
        let store = Store::new(fast_policy());

        let mut instance = Instance::new(IP, 8888, "TEST1");
        instance.ephemeral = false;
        instance.healthy = false;
        store.register("public", "svc", instance).unwrap();

        sleep(Duration::from_millis(150));
        assert!(store.sweep().is_empty());

        let snapshot = store.query("public", "svc", &[]).unwrap();
        assert_eq!(snapshot.instances.len(), 1);
        assert!(!snapshot.instances[0].healthy);

        // beats on persistent instances are accepted and ignored
        let (resurrect, changed) = store.beat("public", "svc", IP, 8888, "TEST1");
        assert!(!resurrect);
        assert!(changed.is_none());
    }

    #[test]
    fn versions_increase_across_mutations() {
        let store = Store::new(BeatPolicy::default());

        let a = store
            .register("public", "svc", Instance::new(IP, 1, ""))
            .unwrap();
        let b = store
            .register("public", "svc", Instance::new(IP, 2, ""))
            .unwrap();
        let c = store.deregister("public", "svc", IP, 1, "DEFAULT").unwrap();

        assert!(a.version < b.version && b.version < c.version);
    }
}
