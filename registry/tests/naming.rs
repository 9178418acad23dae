use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::mpsc::{channel, Sender},
    time::Duration,
};

use naming::{Instance, NamingClient, NamingError, NamingEvent, NamingOptions};
use registry::{BeatPolicy, RegistryServer};
use tokio::time::sleep;

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(11, 11, 11, 11));

async fn start_registry(policy: BeatPolicy) -> RegistryServer {
    RegistryServer::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap(), policy)
        .await
        .unwrap()
}

fn fast_policy() -> BeatPolicy {
    BeatPolicy {
        unhealthy_after: Duration::from_millis(150),
        evict_after: Duration::from_millis(400),
        sweep_interval: Duration::from_millis(25),
    }
}

struct ChannelListener(Sender<NamingEvent>);

impl naming::EventListener for ChannelListener {
    fn on_event(&self, event: NamingEvent) {
        let _ = self.0.send(event);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn register_query_deregister_roundtrip() {
    let server = start_registry(BeatPolicy::default()).await;
    let client = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    client
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    let instances = client.get_all_instances("waypoint.test.e1").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].ip, IP);
    assert_eq!(instances[0].port, 8888);
    assert_eq!(instances[0].cluster, "TEST1");
    assert!(instances[0].ephemeral);

    // unknown services are empty, not errors
    assert!(client
        .get_all_instances("waypoint.test.unknown")
        .await
        .unwrap()
        .is_empty());

    let one = client
        .select_one_healthy_instance("waypoint.test.e1")
        .await
        .unwrap();
    assert_eq!(one.unwrap().port, 8888);

    client
        .deregister_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    assert!(client
        .get_all_instances("waypoint.test.e1")
        .await
        .unwrap()
        .is_empty());

    // a second deregistration names nothing registered
    assert!(matches!(
        client
            .deregister_instance("waypoint.test.e1", IP, 8888, "TEST1")
            .await,
        Err(NamingError::Server(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_service_names_fail_client_side() {
    let server = start_registry(BeatPolicy::default()).await;
    let client = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    assert!(matches!(
        client.register_instance("has space", IP, 1, "").await,
        Err(NamingError::InvalidServiceName(_))
    ));
    assert!(matches!(
        client.get_all_instances("").await,
        Err(NamingError::InvalidServiceName(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_get_snapshots_per_change() {
    let server = start_registry(BeatPolicy::default()).await;
    let client = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    let (tx, rx) = channel();
    client
        .subscribe("waypoint.test.e1", ChannelListener(tx))
        .await
        .unwrap();

    // the current, still empty state arrives first
    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.service_name, "waypoint.test.e1");
    assert!(event.instances.is_empty());

    client
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.instances.len(), 1);
    assert_eq!(event.instances[0].port, 8888);

    client
        .deregister_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(event.instances.is_empty());

    // the cache followed the pushes
    assert!(client
        .cached_instances("waypoint.test.e1")
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_from_other_clients_are_pushed() {
    let server = start_registry(BeatPolicy::default()).await;

    let watcher = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();
    let registrant = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    let (tx, rx) = channel();
    watcher
        .subscribe("waypoint.test.e1", ChannelListener(tx))
        .await
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    registrant
        .register_instance("waypoint.test.e1", IP, 9999, "TEST1")
        .await
        .unwrap();

    let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.instances.len(), 1);
    assert_eq!(event.instances[0].port, 9999);
}

#[tokio::test(flavor = "multi_thread")]
async fn beats_keep_ephemeral_instances_alive() {
    let server = start_registry(fast_policy()).await;

    let mut options = NamingOptions::new(server.local_addr());
    options.beat_interval = Duration::from_millis(50);

    let client = NamingClient::connect(options).await.unwrap();
    client
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    // well past both liveness windows, the beats hold the instance up
    sleep(Duration::from_millis(600)).await;

    let instances = client.get_all_instances("waypoint.test.e1").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert!(instances[0].healthy);
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_instances_are_evicted() {
    let server = start_registry(fast_policy()).await;

    let mut options = NamingOptions::new(server.local_addr());
    options.beat_interval = Duration::from_millis(50);

    let client = NamingClient::connect(options).await.unwrap();
    client
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    // dropping the client stops its beats
    drop(client);

    let observer = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    let mut evicted = false;
    for _ in 0..30 {
        sleep(Duration::from_millis(100)).await;

        if observer
            .get_all_instances("waypoint.test.e1")
            .await
            .unwrap()
            .is_empty()
        {
            evicted = true;
            break;
        }
    }

    assert!(evicted, "silent ephemeral instance should be evicted");
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_instances_survive_silence() {
    let server = start_registry(fast_policy()).await;
    let client = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    let mut instance = Instance::new(IP, 8888, "TEST1");
    instance.ephemeral = false;
    instance.healthy = false;
    client.register("waypoint.test.p1", instance).await.unwrap();

    // no beats ever run for persistent instances
    sleep(Duration::from_millis(600)).await;

    let instances = client.get_all_instances("waypoint.test.p1").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert!(!instances[0].healthy);
    assert!(!instances[0].ephemeral);

    client
        .deregister_instance("waypoint.test.p1", IP, 8888, "TEST1")
        .await
        .unwrap();
    assert!(client
        .get_all_instances("waypoint.test.p1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn namespaces_do_not_leak_between_clients() {
    let server = start_registry(BeatPolicy::default()).await;

    let mut options = NamingOptions::new(server.local_addr());
    options.namespace = "tenant-a".to_string();
    let tenant_a = NamingClient::connect(options).await.unwrap();

    let mut options = NamingOptions::new(server.local_addr());
    options.namespace = "tenant-b".to_string();
    let tenant_b = NamingClient::connect(options).await.unwrap();

    tenant_a
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    assert_eq!(
        tenant_a
            .get_all_instances("waypoint.test.e1")
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(tenant_b
        .get_all_instances("waypoint.test.e1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_stops_deliveries() {
    let server = start_registry(BeatPolicy::default()).await;
    let client = NamingClient::connect(NamingOptions::new(server.local_addr()))
        .await
        .unwrap();

    let (tx, rx) = channel();
    client
        .subscribe("waypoint.test.e1", ChannelListener(tx))
        .await
        .unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    client.unsubscribe("waypoint.test.e1").await.unwrap();

    client
        .register_instance("waypoint.test.e1", IP, 8888, "TEST1")
        .await
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}
