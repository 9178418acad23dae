use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use common::protocol::{Payload, ResponseContent, ServiceChanged};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{
        mpsc::{unbounded_channel, UnboundedSender},
        oneshot::{channel, Sender},
        Mutex,
    },
    time::timeout,
};

use crate::NamingError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One TCP connection to the registry. Requests are matched to responses by
/// sequence number; unsolicited push frames are handed to `on_push` on the
/// reader task, which must therefore never block.
pub(crate) struct Connection {
    sequence: AtomicU64,
    outbound: UnboundedSender<String>,
    // pending request table
    pending: Mutex<HashMap<u64, Sender<Value>>>,
}

impl Connection {
    pub async fn connect<T>(addr: SocketAddr, on_push: T) -> Result<Arc<Self>, NamingError>
    where
        T: Fn(ServiceChanged) + Send + Sync + 'static,
    {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();

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

        let this = Arc::new(Self {
            sequence: AtomicU64::new(0),
            outbound: tx,
            pending: Mutex::new(HashMap::with_capacity(100)),
        });

        let this_ = Arc::downgrade(&this);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let Some(this) = this_.upgrade() else {
                    break;
                };

                match serde_json::from_str::<Payload<Value>>(&line) {
                    Ok(Payload::Response { sequence, content }) => {
                        if let Some(tx) = this.pending.lock().await.remove(&sequence) {
                            let _ = tx.send(content);
                        }
                    }
                    Ok(Payload::Push { content }) => {
                        match serde_json::from_value::<ServiceChanged>(content) {
                            Ok(it) => on_push(it),
                            Err(e) => {
                                log::warn!("dropped malformed push frame, err={:?}", e);
                            }
                        }
                    }
                    // the registry never sends requests
                    Ok(Payload::Request { .. }) => (),
                    Err(e) => {
                        log::warn!("dropped malformed frame, err={:?}", e);
                    }
                }
            }
        });

        Ok(this)
    }

    pub async fn call<Q, S>(&self, method: &str, content: Q) -> Result<S, NamingError>
    where
        Q: Serialize,
        S: DeserializeOwned,
    {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&Payload::Request {
            method: method.to_string(),
            sequence,
            content,
        })?;

        // the waiter has to be in the table before the frame goes out, a
        // response can arrive before send returns
        let (tx, rx) = channel();
        self.pending.lock().await.insert(sequence, tx);

        if self.outbound.send(frame).is_err() {
            drop(self.pending.lock().await.remove(&sequence));

            return Err(NamingError::ConnectionClosed);
        }

        let response = match timeout(REQUEST_TIMEOUT, rx).await {
            Err(_) => {
                drop(self.pending.lock().await.remove(&sequence));

                return Err(NamingError::Timeout);
            }
            Ok(Err(_)) => {
                drop(self.pending.lock().await.remove(&sequence));

                return Err(NamingError::ConnectionClosed);
            }
            Ok(Ok(it)) => it,
        };

        let response: ResponseContent<S> = serde_json::from_value(response)?;
        Result::<S, String>::from(response).map_err(NamingError::Server)
    }
}
