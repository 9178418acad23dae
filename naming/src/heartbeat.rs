use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use common::{
    protocol::{BeatAck, BeatParams, RegisterParams},
    Instance,
};

use tokio::{
    sync::broadcast::{channel, Sender},
    time::sleep,
};

use crate::connection::Connection;

/// Keeps one ephemeral instance alive. Dropping the handle stops the beats,
/// after which the registry marks the instance unhealthy and eventually
/// evicts it.
pub(crate) struct BeatHandle {
    _t: Sender<()>,
}

pub(crate) fn start_beat(
    connection: &Arc<Connection>,
    namespace: String,
    service: String,
    instance: Instance,
    interval: Duration,
) -> BeatHandle {
    let (tx, mut rx) = channel::<()>(2);

    let connection: Weak<Connection> = Arc::downgrade(connection);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    let Some(connection) = connection.upgrade() else {
                        break;
                    };

                    let params = BeatParams {
                        namespace: namespace.clone(),
                        service: service.clone(),
                        ip: instance.ip,
                        port: instance.port,
                        cluster: instance.cluster.clone(),
                    };

                    match connection.call::<_, BeatAck>("Beat", params).await {
                        // the registry lost the instance, e.g. it was
                        // evicted while this client was paused
                        Ok(it) if it.resurrect => {
                            log::info!(
                                "instance unknown to registry, registering again, service={}, id={}",
                                service,
                                instance.instance_id()
                            );

                            let params = RegisterParams {
                                namespace: namespace.clone(),
                                service: service.clone(),
                                instance: instance.clone(),
                            };

                            if let Err(e) = connection.call::<_, ()>("Register", params).await {
                                log::warn!(
                                    "failed to register instance again, service={}, err={:?}",
                                    service,
                                    e
                                );
                            }
                        }
                        Ok(_) => (),
                        Err(e) => {
                            log::warn!("beat failed, service={}, err={:?}", service, e);
                        }
                    }
                }
                _ = rx.recv() => {
                    break;
                }
                else => {
                    break;
                }
            }
        }
    });

    BeatHandle { _t: tx }
}
