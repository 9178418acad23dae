use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use naming::{EventListener, Instance, NamingClient, NamingEvent, NamingOptions};
use tokio::time::sleep;

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Configure {
    /// Address of the waypoint registry to connect to.
    #[arg(long, default_value = "127.0.0.1:8848")]
    server: SocketAddr,
    /// Namespace the demo registers into.
    #[arg(long, default_value = "public")]
    namespace: String,
    /// ephemeral, persistent
    #[arg(long, default_value = "ephemeral")]
    mode: String,
}

struct PrintListener;

impl EventListener for PrintListener {
    // runs on the client's event worker thread, so taking our time here
    // would delay later events but never the connection
    fn on_event(&self, event: NamingEvent) {
        println!("serviceName: {}", event.service_name);
        println!("instances from event: {:?}", event.instances);
    }
}

/// Register an ephemeral instance, watch the service, and keep the process
/// alive so the beats and pushed snapshots can be observed.
async fn run_ephemeral(configure: &Configure) -> Result<()> {
    let mut options = NamingOptions::new(configure.server);
    options.namespace = configure.namespace.clone();

    let naming = NamingClient::connect(options).await?;

    naming
        .register_instance(
            "waypoint.test.e1",
            IpAddr::V4(Ipv4Addr::new(11, 11, 11, 11)),
            8888,
            "TEST1",
        )
        .await?;

    println!(
        "instances after register: {:?}",
        naming.get_all_instances("waypoint.test.e1").await?
    );

    naming.subscribe("waypoint.test.e1", PrintListener).await?;

    sleep(Duration::from_secs(1)).await;

    println!(
        "instances after subscribe: {:?}",
        naming.get_all_instances("waypoint.test.e1").await?
    );

    // hold the registration until interrupted, the registry keeps it alive
    // only as long as this process beats
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Register a persistent, initially unhealthy instance, then explicitly
/// deregister it. Nothing beats here, the instance lives exactly between the
/// two calls.
async fn run_persistent(configure: &Configure) -> Result<()> {
    let mut options = NamingOptions::new(configure.server);
    options.namespace = configure.namespace.clone();

    let naming = NamingClient::connect(options).await?;

    let mut instance = Instance::new(IpAddr::V4(Ipv4Addr::new(11, 11, 11, 11)), 8888, "TEST1");
    instance.healthy = false;
    instance.ephemeral = false;

    naming.register("waypoint.test.p1", instance).await?;

    println!(
        "instances after register: {:?}",
        naming.get_all_instances("waypoint.test.p1").await?
    );

    naming.subscribe("waypoint.test.p1", PrintListener).await?;

    naming
        .deregister_instance(
            "waypoint.test.p1",
            IpAddr::V4(Ipv4Addr::new(11, 11, 11, 11)),
            8888,
            "TEST1",
        )
        .await?;

    sleep(Duration::from_secs(1)).await;

    println!(
        "instances after deregister: {:?}",
        naming.get_all_instances("waypoint.test.p1").await?
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let configure = Configure::parse();
    match configure.mode.as_str() {
        "persistent" => run_persistent(&configure).await,
        _ => run_ephemeral(&configure).await,
    }
}
