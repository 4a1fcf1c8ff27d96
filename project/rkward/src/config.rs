//! Runtime configuration, read from the environment. Every timing knob is a
//! struct field rather than a constant so tests can shrink the intervals to
//! milliseconds.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use common::{ELECTION_PORT, HEALTH_PORT, replica_host};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Settings of one coordinator replica.
#[derive(Debug, Clone)]
pub struct Config {
    pub my_id: u32,
    pub total_replicas: u32,
    /// Manifest listing the workers to monitor.
    pub compose_path: PathBuf,
    /// Bind address of the PING/PONG health server.
    pub health_bind: String,
    /// Cadence of the supervision loop.
    pub check_interval: Duration,
    pub election: ElectionConfig,
}

impl Config {
    /// Reads `MY_ID`, `TOTAL_REPLICAS` and `COMPOSE_PATH`. A value that does
    /// not parse is a startup failure, not something to limp along with.
    pub fn from_env() -> Result<Self> {
        let my_id: u32 = env_or("MY_ID", "1")
            .parse()
            .context("invalid MY_ID, expected an integer >= 1")?;
        let total_replicas: u32 = env_or("TOTAL_REPLICAS", "3")
            .parse()
            .context("invalid TOTAL_REPLICAS, expected an integer >= 1")?;
        if my_id == 0 || my_id > total_replicas {
            bail!("MY_ID {my_id} outside the replica range 1..={total_replicas}");
        }

        Ok(Self {
            my_id,
            total_replicas,
            compose_path: PathBuf::from(env_or("COMPOSE_PATH", "/app/nodes-compose.yml")),
            health_bind: format!("0.0.0.0:{HEALTH_PORT}"),
            check_interval: Duration::from_secs(5),
            election: ElectionConfig::for_replica(my_id, total_replicas),
        })
    }
}

/// Knobs of the Bully election.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub my_id: u32,
    /// Bind address of the election server.
    pub bind_addr: String,
    /// Peer replica id -> election address. Never contains `my_id`.
    pub peers: BTreeMap<u32, String>,
    /// Dial/read/write deadline for election sockets.
    pub socket_timeout: Duration,
    /// Cadence of LEADER broadcasts while leading.
    pub heartbeat_interval: Duration,
    /// Heartbeat silence after which a follower starts an election.
    pub election_timeout: Duration,
    /// Scan cadence of the heartbeat-timeout monitor.
    pub monitor_interval: Duration,
    /// Grace period before the first election, letting peer servers bind.
    pub startup_delay: Duration,
}

impl ElectionConfig {
    /// Deployment defaults: peers at `coordinator-<id>:12340`, second-scale
    /// timings.
    pub fn for_replica(my_id: u32, total_replicas: u32) -> Self {
        let peers = (1..=total_replicas)
            .filter(|id| *id != my_id)
            .map(|id| (id, format!("{}:{ELECTION_PORT}", replica_host(id))))
            .collect();
        Self {
            my_id,
            bind_addr: format!("0.0.0.0:{ELECTION_PORT}"),
            peers,
            socket_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(2),
            election_timeout: Duration::from_secs(6),
            monitor_interval: Duration::from_secs(1),
            startup_delay: Duration::from_secs(2),
        }
    }

    /// Peers that outrank this replica, in ascending id order.
    pub fn higher_peers(&self) -> impl Iterator<Item = (&u32, &String)> {
        self.peers.range(self.my_id + 1..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in ["MY_ID", "TOTAL_REPLICAS", "COMPOSE_PATH"] {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn from_env_defaults() {
        clear_env();
        let cfg = Config::from_env().expect("defaults");
        assert_eq!(cfg.my_id, 1);
        assert_eq!(cfg.total_replicas, 3);
        assert_eq!(cfg.compose_path, PathBuf::from("/app/nodes-compose.yml"));
        assert_eq!(cfg.election.peers.len(), 2);
        assert_eq!(cfg.election.peers[&2], "coordinator-2:12340");
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        clear_env();
        unsafe {
            env::set_var("MY_ID", "2");
            env::set_var("TOTAL_REPLICAS", "5");
            env::set_var("COMPOSE_PATH", "/tmp/workers.yml");
        }
        let cfg = Config::from_env().expect("overrides");
        assert_eq!(cfg.my_id, 2);
        assert_eq!(cfg.total_replicas, 5);
        assert_eq!(cfg.compose_path, PathBuf::from("/tmp/workers.yml"));
        assert!(!cfg.election.peers.contains_key(&2));
        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_rejects_garbage_id() {
        clear_env();
        unsafe { env::set_var("MY_ID", "two") };
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_rejects_out_of_range_id() {
        clear_env();
        unsafe {
            env::set_var("MY_ID", "4");
            env::set_var("TOTAL_REPLICAS", "3");
        }
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn higher_peers_only_returns_larger_ids() {
        let cfg = ElectionConfig::for_replica(2, 4);
        let higher: Vec<u32> = cfg.higher_peers().map(|(id, _)| *id).collect();
        assert_eq!(higher, vec![3, 4]);
    }

    #[test]
    fn solo_replica_has_no_peers() {
        let cfg = ElectionConfig::for_replica(1, 1);
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.higher_peers().count(), 0);
    }
}
