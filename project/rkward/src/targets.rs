//! Assembly of the monitored-target roster: peer replicas first, then the
//! workers declared in the deployment manifest.

use std::path::Path;

use anyhow::{Context, Result};
use common::{CheckTarget, ComposeFile, HEALTH_PORT, replica_host};
use tracing::{info, warn};

use crate::config::Config;

/// Computes the full roster for this replica: every peer coordinator
/// (cross-monitoring, never self) plus every manifest worker. The set is
/// immutable for the process lifetime. A broken manifest downgrades to
/// coordinator-only monitoring instead of failing startup.
pub fn monitored_targets(cfg: &Config) -> Vec<CheckTarget> {
    let mut targets: Vec<CheckTarget> = (1..=cfg.total_replicas)
        .filter(|id| *id != cfg.my_id)
        .map(|id| {
            let host = replica_host(id);
            CheckTarget {
                name: format!("coordinator {id}"),
                host: host.clone(),
                port: HEALTH_PORT,
                container: host,
            }
        })
        .collect();

    match workers_from_compose(&cfg.compose_path) {
        Ok(workers) => {
            info!(
                count = workers.len(),
                path = %cfg.compose_path.display(),
                "loaded workers from the manifest"
            );
            targets.extend(workers);
        }
        Err(e) => warn!(
            "failed to load workers from {}: {e:#}; continuing with coordinator \
             cross-monitoring only",
            cfg.compose_path.display()
        ),
    }
    targets
}

/// Every service with an explicit container_name becomes a worker target.
fn workers_from_compose(path: &Path) -> Result<Vec<CheckTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let compose: ComposeFile =
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;

    let mut workers: Vec<CheckTarget> = compose
        .services
        .into_values()
        .filter_map(|service| service.container_name)
        .map(|name| CheckTarget {
            name: name.clone(),
            host: name.clone(),
            port: HEALTH_PORT,
            container: name,
        })
        .collect();
    // The manifest map has no deterministic order; the tick order should.
    workers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(workers)
}
