use std::{
    collections::HashMap,
    io::Error,
    net::SocketAddr,
    sync::Arc,
};

use common::{
    protocol::{
        BeatAck, BeatParams, DeregisterParams, Payload, QueryParams, RegisterParams,
        ResponseContent, ServiceChanged, SubscribeParams,
    },
    ServiceSnapshot,
};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{
        broadcast::{channel, Receiver, Sender},
        mpsc::{unbounded_channel, UnboundedSender},
    },
    time::sleep,
};

use crate::store::{BeatPolicy, Store};

/// Subscriber table: (namespace, service) to the outbound queue of every
/// connection watching it. Frames are serialized once per change and cloned
/// per subscriber.
#[derive(Default)]
struct Subscriptions {
    table: RwLock<HashMap<(String, String), HashMap<u64, UnboundedSender<String>>>>,
}

impl Subscriptions {
    fn add(&self, namespace: &str, service: &str, connection: u64, tx: UnboundedSender<String>) {
        self.table
            .write()
            .entry((namespace.to_string(), service.to_string()))
            .or_default()
            .insert(connection, tx);
    }

    fn remove(&self, namespace: &str, service: &str, connection: u64) {
        let mut table = self.table.write();
        let key = (namespace.to_string(), service.to_string());

        if let Some(subscribers) = table.get_mut(&key) {
            subscribers.remove(&connection);
            if subscribers.is_empty() {
                table.remove(&key);
            }
        }
    }

    fn remove_connection(&self, connection: u64) {
        let mut table = self.table.write();

        table.retain(|_, subscribers| {
            subscribers.remove(&connection);

            !subscribers.is_empty()
        });
    }

    fn publish(&self, namespace: &str, snapshot: &ServiceSnapshot) {
        let table = self.table.read();
        let Some(subscribers) =
            table.get(&(namespace.to_string(), snapshot.name.clone()))
        else {
            return;
        };

        match push_frame(namespace, snapshot) {
            Ok(frame) => {
                for tx in subscribers.values() {
                    let _ = tx.send(frame.clone());
                }
            }
            Err(e) => {
                log::error!("failed to serialize push frame, err={:?}", e);
            }
        }
    }
}

/// The registry endpoint. Accepts naming client connections, answers their
/// requests against the shared store, and fans instance set changes out to
/// subscribers. Dropping the server stops the accept loop, the sweeper and
/// every connection task.
pub struct RegistryServer {
    shutdown: Sender<()>,
    local_addr: SocketAddr,
}

impl RegistryServer {
    pub async fn bind(bind: SocketAddr, policy: BeatPolicy) -> Result<Self, Error> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;

        let store = Arc::new(Store::new(policy));
        let subscriptions = Arc::new(Subscriptions::default());

        let (tx, mut rx) = channel::<()>(2);

        {
            let tx = tx.clone();
            let store = store.clone();
            let subscriptions = subscriptions.clone();
            tokio::spawn(async move {
                let mut sequence = 0u64;

                loop {
                    tokio::select! {
                        Ok((stream, addr)) = listener.accept() => {
                            sequence += 1;

                            log::info!(
                                "accepted naming connection, addr={}, connection={}",
                                addr,
                                sequence
                            );

                            tokio::spawn(handle_connection(
                                stream,
                                sequence,
                                store.clone(),
                                subscriptions.clone(),
                                tx.subscribe(),
                            ));
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
        }

        {
            let mut rx = tx.subscribe();
            let store = store.clone();
            let subscriptions = subscriptions.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sleep(store.policy().sweep_interval) => {
                            for (namespace, snapshot) in store.sweep() {
                                subscriptions.publish(&namespace, &snapshot);
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
        }

        log::info!("registry listening, addr={}", local_addr);

        Ok(Self {
            shutdown: tx,
            local_addr,
        })
    }

    /// Useful when bound to port 0 and the picked port is needed.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// The accept loop keeps a sender clone to mint per-connection shutdown
// receivers, so closing the channel by drop alone is not enough.
impl Drop for RegistryServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection: u64,
    store: Arc<Store>,
    subscriptions: Arc<Subscriptions>,
    mut shutdown: Receiver<()>,
) {
    let (reader, mut writer) = stream.into_split();

    // responses and pushes share one ordered outbound queue per connection
    let (tx, mut rx) = unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(frame.as_bytes()).await.is_err() {
                break;
            }

            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) =
                            handle_frame(&line, connection, &store, &subscriptions, &tx)
                        {
                            log::warn!(
                                "dropped malformed frame, connection={}, err={:?}",
                                connection,
                                e
                            );
                        }
                    }
                    _ => {
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }

    subscriptions.remove_connection(connection);

    log::info!("naming connection closed, connection={}", connection);
}

fn handle_frame(
    line: &str,
    connection: u64,
    store: &Store,
    subscriptions: &Subscriptions,
    tx: &UnboundedSender<String>,
) -> Result<(), serde_json::Error> {
    let (method, sequence, content) = match serde_json::from_str::<Payload<Value>>(line)? {
        Payload::Request {
            method,
            sequence,
            content,
        } => (method, sequence, content),
        // clients only send requests
        _ => return Ok(()),
    };

    let response = match method.as_str() {
        "Register" => {
            let params: RegisterParams = serde_json::from_value(content)?;
            match store.register(&params.namespace, &params.service, params.instance) {
                Ok(snapshot) => {
                    subscriptions.publish(&params.namespace, &snapshot);

                    response_frame(sequence, Ok(()))?
                }
                Err(e) => response_frame::<()>(sequence, Err(e.to_string()))?,
            }
        }
        "Deregister" => {
            let params: DeregisterParams = serde_json::from_value(content)?;
            match store.deregister(
                &params.namespace,
                &params.service,
                params.ip,
                params.port,
                &params.cluster,
            ) {
                Ok(snapshot) => {
                    subscriptions.publish(&params.namespace, &snapshot);

                    response_frame(sequence, Ok(()))?
                }
                Err(e) => response_frame::<()>(sequence, Err(e.to_string()))?,
            }
        }
        "Query" => {
            let params: QueryParams = serde_json::from_value(content)?;
            response_frame(
                sequence,
                store
                    .query(&params.namespace, &params.service, &params.clusters)
                    .map_err(|e| e.to_string()),
            )?
        }
        "Subscribe" => {
            let params: SubscribeParams = serde_json::from_value(content)?;
            match store.query(&params.namespace, &params.service, &[]) {
                Ok(snapshot) => {
                    subscriptions.add(&params.namespace, &params.service, connection, tx.clone());

                    // the subscriber starts from the current state, pushed
                    // right behind the acknowledgement
                    let frame = push_frame(&params.namespace, &snapshot)?;
                    let response = response_frame(sequence, Ok(()))?;
                    let _ = tx.send(response);
                    let _ = tx.send(frame);

                    return Ok(());
                }
                Err(e) => response_frame::<()>(sequence, Err(e.to_string()))?,
            }
        }
        "Unsubscribe" => {
            let params: SubscribeParams = serde_json::from_value(content)?;
            subscriptions.remove(&params.namespace, &params.service, connection);

            response_frame(sequence, Ok(()))?
        }
        "Beat" => {
            let params: BeatParams = serde_json::from_value(content)?;
            let (resurrect, changed) = store.beat(
                &params.namespace,
                &params.service,
                params.ip,
                params.port,
                &params.cluster,
            );

            if let Some(snapshot) = changed {
                subscriptions.publish(&params.namespace, &snapshot);
            }

            response_frame(sequence, Ok(BeatAck { resurrect }))?
        }
        _ => {
            log::warn!(
                "unknown method, connection={}, method={}",
                connection,
                method
            );

            response_frame::<()>(sequence, Err(format!("unknown method: {}", method)))?
        }
    };

    let _ = tx.send(response);

    Ok(())
}

fn response_frame<T: Serialize>(
    sequence: u64,
    result: Result<T, String>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Payload::Response {
        sequence,
        content: ResponseContent::from(result),
    })
}

fn push_frame(namespace: &str, snapshot: &ServiceSnapshot) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Payload::Push {
        content: ServiceChanged {
            namespace: namespace.to_string(),
            snapshot: snapshot.clone(),
        },
    })
}
