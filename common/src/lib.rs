pub mod logger;
pub mod protocol;

use std::{collections::HashMap, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Instances registered without an explicit cluster label land here.
pub const DEFAULT_CLUSTER: &str = "DEFAULT";

/// Registrations that do not name a namespace are isolated under this one.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Service names travel in protocol frames and registry keys, so they are
/// limited to a small safe alphabet.
pub const MAX_SERVICE_NAME_LEN: usize = 512;

/// A single network endpoint registered under a service name.
///
/// Ephemeral instances are kept alive by periodic beats and disappear when
/// the beats stop. Persistent instances stay until explicitly deregistered,
/// whatever their liveness.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Instance {
    pub ip: IpAddr,
    pub port: u16,
    pub cluster: String,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Instance {
    /// An ephemeral, healthy, enabled instance with weight 1.0.
    pub fn new(ip: IpAddr, port: u16, cluster: &str) -> Self {
        Self {
            ip,
            port,
            cluster: if cluster.is_empty() {
                DEFAULT_CLUSTER.to_string()
            } else {
                cluster.to_string()
            },
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            metadata: HashMap::new(),
        }
    }

    /// The identity an instance is stored and deregistered under. Two
    /// registrations with the same ip, port and cluster are the same
    /// instance.
    pub fn instance_id(&self) -> String {
        make_instance_id(self.ip, self.port, &self.cluster)
    }
}

pub fn make_instance_id(ip: IpAddr, port: u16, cluster: &str) -> String {
    format!("{}#{}#{}", ip, port, cluster)
}

/// The current instance set of one service, stamped with the registry's
/// change counter. This is both the query result and the payload pushed to
/// subscribers on every change.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub version: u64,
    pub instances: Vec<Instance>,
}

/// Whether `name` is acceptable as a service name on the wire and in
/// registry keys.
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name
            .bytes()
            .all(|it| it.is_ascii_alphanumeric() || matches!(it, b'.' | b'_' | b':' | b'-'))
}
