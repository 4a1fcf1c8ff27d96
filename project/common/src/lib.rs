use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

pub mod wire;

#[doc(hidden)]
pub mod _private {
    pub use tracing::error;
}

/// TCP port of the PING/PONG health protocol.
pub const HEALTH_PORT: u16 = 12346;

/// TCP port of the election protocol between coordinator replicas.
pub const ELECTION_PORT: u16 = 12340;

/// Hostname under which replica `id` is published on the deployment network.
pub fn replica_host(id: u32) -> String {
    format!("coordinator-{id}")
}

/// A monitored endpoint: a peer replica or a worker from the deployment
/// manifest. The roster is computed once at startup and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    /// Display name used in logs.
    pub name: String,
    /// Host answering health probes.
    pub host: String,
    /// Health port on `host`.
    pub port: u16,
    /// Container identifier handed to the runtime on restart.
    pub container: String,
}

impl fmt::Display for CheckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{} -> container: {})",
            self.name, self.host, self.port, self.container
        )
    }
}

/// The slice of a compose manifest this service reads: service names mapped
/// to their container names. Everything else in the file is ignored.
#[derive(Debug, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: HashMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeService {
    /// Services without an explicit container_name are not monitored.
    #[serde(default)]
    pub container_name: Option<String>,
}
