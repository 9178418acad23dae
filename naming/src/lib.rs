//! Client library for the waypoint registry.
//!
//! A [`NamingClient`] holds one connection to the registry. Service
//! instances registered through it are ephemeral by default and kept alive
//! by a background beat task per instance; subscribers get every change to a
//! service's instance set pushed as a [`NamingEvent`], delivered on a
//! dedicated worker thread.

mod cache;
mod connection;
mod events;
mod heartbeat;

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use common::{
    is_valid_service_name, make_instance_id,
    protocol::{DeregisterParams, QueryParams, RegisterParams, SubscribeParams},
    DEFAULT_NAMESPACE,
};

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

pub use common::{Instance, ServiceSnapshot, DEFAULT_CLUSTER};

pub use self::events::{EventListener, NamingEvent};

use self::{
    cache::ServiceCache,
    connection::Connection,
    events::Dispatcher,
    heartbeat::{start_beat, BeatHandle},
};

#[derive(Debug, Error)]
pub enum NamingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error("request timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
}

#[derive(Debug, Clone)]
pub struct NamingOptions {
    /// Address of the registry to connect to.
    pub server_addr: SocketAddr,
    /// Registrations and queries are isolated per namespace.
    pub namespace: String,
    /// How often ephemeral instances beat. The registry's liveness windows
    /// are sized for the 5s default.
    pub beat_interval: Duration,
}

impl NamingOptions {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            namespace: DEFAULT_NAMESPACE.to_string(),
            beat_interval: Duration::from_secs(5),
        }
    }
}

pub struct NamingClient {
    id: String,
    options: NamingOptions,
    connection: Arc<Connection>,
    cache: Arc<ServiceCache>,
    dispatcher: Arc<Dispatcher>,
    // beat handle per registered ephemeral instance
    beats: Mutex<HashMap<String, BeatHandle>>,
    // round robin cursor per service
    poll: Mutex<HashMap<String, usize>>,
}

impl NamingClient {
    /// Dial the registry. Fails if the server is unreachable; there is no
    /// background reconnect, a broken connection surfaces as
    /// [`NamingError::ConnectionClosed`] on the next call.
    pub async fn connect(options: NamingOptions) -> Result<Arc<Self>, NamingError> {
        let id = Uuid::new_v4().to_string();
        let cache: Arc<ServiceCache> = Default::default();
        let dispatcher = Arc::new(Dispatcher::new()?);

        let connection = {
            let cache = cache.clone();
            let dispatcher = dispatcher.clone();

            // the push callback runs on the connection reader task: apply
            // the snapshot, hand the event to the worker, return
            Connection::connect(options.server_addr, move |changed| {
                if cache.update(changed.snapshot.clone()) {
                    dispatcher.dispatch(NamingEvent {
                        service_name: changed.snapshot.name,
                        version: changed.snapshot.version,
                        instances: changed.snapshot.instances,
                    });
                }
            })
            .await?
        };

        log::info!(
            "naming client connected, id={}, server={}, namespace={}",
            id,
            options.server_addr,
            options.namespace
        );

        Ok(Arc::new(Self {
            id,
            options,
            connection,
            cache,
            dispatcher,
            beats: Default::default(),
            poll: Default::default(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    /// Register an ephemeral, healthy instance under `service`.
    pub async fn register_instance(
        &self,
        service: &str,
        ip: IpAddr,
        port: u16,
        cluster: &str,
    ) -> Result<(), NamingError> {
        self.register(service, Instance::new(ip, port, cluster)).await
    }

    /// Register a fully described instance. Ephemeral instances get a beat
    /// task that keeps them alive until deregistration or client drop;
    /// persistent instances stay whatever happens to this client.
    pub async fn register(&self, service: &str, instance: Instance) -> Result<(), NamingError> {
        check_service_name(service)?;

        self.connection
            .call::<_, ()>(
                "Register",
                RegisterParams {
                    namespace: self.options.namespace.clone(),
                    service: service.to_string(),
                    instance: instance.clone(),
                },
            )
            .await?;

        log::info!(
            "registered instance, service={}, id={}, ephemeral={}",
            service,
            instance.instance_id(),
            instance.ephemeral
        );

        if instance.ephemeral {
            let key = format!("{}@{}", service, instance.instance_id());
            self.beats.lock().insert(
                key,
                start_beat(
                    &self.connection,
                    self.options.namespace.clone(),
                    service.to_string(),
                    instance,
                    self.options.beat_interval,
                ),
            );
        }

        Ok(())
    }

    /// Remove an instance. Fails with a server error if the instance was
    /// never registered.
    pub async fn deregister_instance(
        &self,
        service: &str,
        ip: IpAddr,
        port: u16,
        cluster: &str,
    ) -> Result<(), NamingError> {
        check_service_name(service)?;

        let cluster = if cluster.is_empty() {
            DEFAULT_CLUSTER
        } else {
            cluster
        };

        // stop beating first so the instance is not resurrected between the
        // deregistration and the next beat
        drop(
            self.beats
                .lock()
                .remove(&format!("{}@{}", service, make_instance_id(ip, port, cluster))),
        );

        self.connection
            .call::<_, ()>(
                "Deregister",
                DeregisterParams {
                    namespace: self.options.namespace.clone(),
                    service: service.to_string(),
                    ip,
                    port,
                    cluster: cluster.to_string(),
                },
            )
            .await?;

        log::info!(
            "deregistered instance, service={}, id={}",
            service,
            make_instance_id(ip, port, cluster)
        );

        Ok(())
    }

    /// All currently known instances of `service`, healthy or not.
    pub async fn get_all_instances(&self, service: &str) -> Result<Vec<Instance>, NamingError> {
        Ok(self.query(service, &[]).await?.instances)
    }

    /// Instances filtered by cluster label and, optionally, to those both
    /// healthy and enabled.
    pub async fn select_instances(
        &self,
        service: &str,
        clusters: &[String],
        healthy_only: bool,
    ) -> Result<Vec<Instance>, NamingError> {
        let mut instances = self.query(service, clusters).await?.instances;
        if healthy_only {
            instances.retain(|it| it.healthy && it.enabled);
        }

        Ok(instances)
    }

    /// Round robin over the healthy instance set.
    pub async fn select_one_healthy_instance(
        &self,
        service: &str,
    ) -> Result<Option<Instance>, NamingError> {
        let instances = self.select_instances(service, &[], true).await?;
        if instances.is_empty() {
            return Ok(None);
        }

        let index = {
            let mut poll = self.poll.lock();
            let it = poll.entry(service.to_string()).or_insert(0);
            *it = it.wrapping_add(1);

            *it % instances.len()
        };

        Ok(instances.get(index).cloned())
    }

    /// Watch `service` for changes. The current snapshot is delivered
    /// immediately, then one event per change. Callbacks run on the event
    /// worker thread, never on the connection.
    pub async fn subscribe<T>(&self, service: &str, listener: T) -> Result<(), NamingError>
    where
        T: EventListener + 'static,
    {
        check_service_name(service)?;

        self.dispatcher.add(service, Arc::new(listener));

        self.connection
            .call::<_, ()>(
                "Subscribe",
                SubscribeParams {
                    namespace: self.options.namespace.clone(),
                    service: service.to_string(),
                },
            )
            .await
    }

    /// Drop all listeners for `service` and stop the registry pushing it.
    pub async fn unsubscribe(&self, service: &str) -> Result<(), NamingError> {
        check_service_name(service)?;

        self.dispatcher.remove(service);
        self.cache.remove(service);

        self.connection
            .call::<_, ()>(
                "Unsubscribe",
                SubscribeParams {
                    namespace: self.options.namespace.clone(),
                    service: service.to_string(),
                },
            )
            .await
    }

    /// The last snapshot pushed for a subscribed service, without a round
    /// trip to the registry.
    pub fn cached_instances(&self, service: &str) -> Option<Vec<Instance>> {
        self.cache.get(service).map(|it| it.instances)
    }

    async fn query(
        &self,
        service: &str,
        clusters: &[String],
    ) -> Result<ServiceSnapshot, NamingError> {
        check_service_name(service)?;

        self.connection
            .call(
                "Query",
                QueryParams {
                    namespace: self.options.namespace.clone(),
                    service: service.to_string(),
                    clusters: clusters.to_vec(),
                },
            )
            .await
    }
}

fn check_service_name(name: &str) -> Result<(), NamingError> {
    if is_valid_service_name(name) {
        Ok(())
    } else {
        Err(NamingError::InvalidServiceName(name.to_string()))
    }
}
