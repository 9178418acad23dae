//! Frame types shared by the naming client and the registry.
//!
//! Both sides speak newline delimited JSON over a single TCP connection. The
//! client sends `Request` frames carrying a method name and a sequence
//! number, the registry answers with a `Response` frame echoing the
//! sequence, and additionally pushes unsolicited `Push` frames to
//! subscribers whenever an instance set changes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{Instance, ServiceSnapshot};

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "ty", content = "content")]
pub enum Payload<T> {
    Request {
        method: String,
        sequence: u64,
        content: T,
    },
    Response {
        sequence: u64,
        content: T,
    },
    Push {
        content: T,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "ty", content = "content")]
pub enum ResponseContent<T> {
    Ok(T),
    Err(String),
}

impl<T> From<ResponseContent<T>> for Result<T, String> {
    fn from(value: ResponseContent<T>) -> Self {
        match value {
            ResponseContent::Ok(it) => Ok(it),
            ResponseContent::Err(e) => Err(e),
        }
    }
}

impl<T> From<Result<T, String>> for ResponseContent<T> {
    fn from(value: Result<T, String>) -> Self {
        match value {
            Ok(it) => Self::Ok(it),
            Err(e) => Self::Err(e),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterParams {
    pub namespace: String,
    pub service: String,
    pub instance: Instance,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeregisterParams {
    pub namespace: String,
    pub service: String,
    pub ip: IpAddr,
    pub port: u16,
    pub cluster: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueryParams {
    pub namespace: String,
    pub service: String,
    /// Empty means all clusters.
    #[serde(default)]
    pub clusters: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubscribeParams {
    pub namespace: String,
    pub service: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BeatParams {
    pub namespace: String,
    pub service: String,
    pub ip: IpAddr,
    pub port: u16,
    pub cluster: String,
}

/// `resurrect` is set when the registry no longer knows the beating
/// instance, telling the client to register it again.
#[derive(Debug, Deserialize, Serialize)]
pub struct BeatAck {
    pub resurrect: bool,
}

/// The push frame content: a fresh snapshot of one service's instance set.
#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceChanged {
    pub namespace: String,
    pub snapshot: ServiceSnapshot,
}
