use std::{collections::HashMap, io::Error, sync::Arc, thread};

use common::Instance;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::RwLock;

/// A change notification for one subscribed service: the complete instance
/// set as of `version`. Consumed once per delivery, nothing is retained for
/// late listeners.
#[derive(Debug, Clone)]
pub struct NamingEvent {
    pub service_name: String,
    pub version: u64,
    pub instances: Vec<Instance>,
}

/// Receives change notifications for a subscribed service.
///
/// Callbacks run on the client's single event worker thread. A slow callback
/// delays the events queued behind it but never the connection reader, so
/// the registry is never back-pressured by user code.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: NamingEvent);
}

impl<T> EventListener for T
where
    T: Fn(NamingEvent) + Send + Sync,
{
    fn on_event(&self, event: NamingEvent) {
        self(event)
    }
}

pub(crate) struct Dispatcher {
    listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>>,
    tx: Sender<NamingEvent>,
}

impl Dispatcher {
    pub fn new() -> Result<Self, Error> {
        let listeners: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventListener>>>>> =
            Default::default();

        let (tx, rx) = unbounded::<NamingEvent>();

        let listeners_ = listeners.clone();
        thread::Builder::new()
            .name("waypoint-event-worker".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    // snapshot the listener list so callbacks run without
                    // holding the table lock
                    let listeners = listeners_
                        .read()
                        .get(&event.service_name)
                        .cloned()
                        .unwrap_or_default();

                    for listener in listeners {
                        listener.on_event(event.clone());
                    }
                }
            })?;

        Ok(Self { listeners, tx })
    }

    pub fn add(&self, service: &str, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .entry(service.to_string())
            .or_default()
            .push(listener);
    }

    pub fn remove(&self, service: &str) {
        self.listeners.write().remove(service);
    }

    pub fn dispatch(&self, event: NamingEvent) {
        let _ = self.tx.send(event);
    }
}
