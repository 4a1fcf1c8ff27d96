//! Leader-gated supervision: probe every target on a fixed cadence and
//! restart the containers behind the ones that stopped answering.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::CheckTarget;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::election::{ElectionManager, LeadershipChange};
use crate::probe::HealthProbe;
use crate::runtime::ContainerRuntime;

pub struct Supervisor {
    election: ElectionManager,
    probe: HealthProbe,
    runtime: Arc<dyn ContainerRuntime>,
    targets: Vec<CheckTarget>,
    check_interval: Duration,
}

impl Supervisor {
    pub fn new(
        election: ElectionManager,
        probe: HealthProbe,
        runtime: Arc<dyn ContainerRuntime>,
        targets: Vec<CheckTarget>,
        check_interval: Duration,
    ) -> Self {
        Self {
            election,
            probe,
            runtime,
            targets,
            check_interval,
        }
    }

    /// Drives ticks until `shutdown` resolves. An in-flight tick always
    /// drains before the loop returns; the shutdown branch is only polled
    /// between ticks.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            targets = self.targets.len(),
            interval = ?self.check_interval,
            "supervision loop started, waiting for leadership"
        );
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first real tick is one period out.
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_tick().await,
                _ = &mut shutdown => {
                    info!("shutdown requested, supervision loop exiting");
                    return;
                }
            }
        }
    }

    /// One pass over the roster. Followers skip. Each target is probed at
    /// most once and restarted at most once per tick.
    pub async fn run_tick(&self) {
        if !self.election.is_leader() {
            info!(leader_id = ?self.election.leader_id(), "not leader, skipping health checks");
            return;
        }

        info!(targets = self.targets.len(), "leader tick: probing targets");
        for target in &self.targets {
            if self.probe.is_alive(&target.host, target.port).await {
                info!(%target, "healthy");
                continue;
            }
            warn!(%target, "not answering health checks, restarting its container");
            match self.runtime.restart(&target.container).await {
                Ok(()) => info!(container = %target.container, "container restarted"),
                Err(e) => error!(container = %target.container, "restart failed: {e:#}"),
            }
        }
    }
}

/// Logs leadership transitions. Supervision re-reads the election state on
/// every tick, so this task is observability only; a lagged receiver just
/// means intermediate flips were skipped.
pub fn spawn_transition_logger(election: &ElectionManager) -> JoinHandle<()> {
    let mut events = election.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LeadershipChange::Gained) => info!("became leader, active supervision begins"),
                Ok(LeadershipChange::Lost) => info!("lost leadership, entering standby"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed leadership transitions")
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElectionConfig;
    use crate::probe;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::{Duration, sleep, timeout};

    #[derive(Default)]
    struct CountingRuntime {
        restarted: Mutex<Vec<String>>,
    }

    impl CountingRuntime {
        fn restarts(&self) -> Vec<String> {
            self.restarted.lock().expect("poisoned").clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn restart(&self, container: &str) -> Result<()> {
            self.restarted
                .lock()
                .expect("poisoned")
                .push(container.to_string());
            Ok(())
        }
    }

    fn follower_election() -> ElectionManager {
        ElectionManager::new(test_election_config())
    }

    async fn leader_election() -> ElectionManager {
        let mgr = ElectionManager::new(test_election_config());
        // No higher peers configured, so the round wins immediately.
        mgr.start_election().await;
        assert!(mgr.is_leader());
        mgr
    }

    fn test_election_config() -> ElectionConfig {
        ElectionConfig {
            my_id: 1,
            bind_addr: "127.0.0.1:0".to_string(),
            peers: BTreeMap::new(),
            socket_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(400),
            monitor_interval: Duration::from_millis(50),
            startup_delay: Duration::from_millis(10),
        }
    }

    fn quick_probe() -> HealthProbe {
        HealthProbe::new(Duration::from_millis(100), Duration::from_millis(100))
    }

    fn target(port: u16) -> CheckTarget {
        CheckTarget {
            name: "worker-1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            container: "worker-1".to_string(),
        }
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    fn supervisor(
        election: ElectionManager,
        runtime: Arc<CountingRuntime>,
        targets: Vec<CheckTarget>,
    ) -> Supervisor {
        Supervisor::new(
            election,
            quick_probe(),
            runtime,
            targets,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn follower_never_restarts_anything() {
        let runtime = Arc::new(CountingRuntime::default());
        let port = dead_port().await;
        let sup = supervisor(follower_election(), runtime.clone(), vec![target(port)]);

        sup.run_tick().await;
        sup.run_tick().await;

        assert!(runtime.restarts().is_empty());
    }

    #[tokio::test]
    async fn leader_restarts_a_dead_worker_once_per_tick() {
        let runtime = Arc::new(CountingRuntime::default());
        let port = dead_port().await;
        let sup = supervisor(leader_election().await, runtime.clone(), vec![target(port)]);

        sup.run_tick().await;
        assert_eq!(runtime.restarts(), vec!["worker-1"]);

        // Still dead on the next tick: retried exactly once more.
        sup.run_tick().await;
        assert_eq!(runtime.restarts(), vec!["worker-1", "worker-1"]);
    }

    #[tokio::test]
    async fn leader_leaves_healthy_workers_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(probe::serve(listener));

        let runtime = Arc::new(CountingRuntime::default());
        let sup = supervisor(leader_election().await, runtime.clone(), vec![target(port)]);

        sup.run_tick().await;
        assert!(runtime.restarts().is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn recovered_worker_is_not_restarted_again() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(probe::serve(listener));

        let runtime = Arc::new(CountingRuntime::default());
        let sup = supervisor(leader_election().await, runtime.clone(), vec![target(port)]);

        // Healthy, then dead for one tick, then back.
        sup.run_tick().await;
        assert!(runtime.restarts().is_empty());

        server.abort();
        sleep(Duration::from_millis(20)).await;
        sup.run_tick().await;
        assert_eq!(runtime.restarts().len(), 1);

        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("rebind");
        let server = tokio::spawn(probe::serve(listener));
        sup.run_tick().await;
        assert_eq!(runtime.restarts().len(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn run_drains_and_exits_on_shutdown() {
        let runtime = Arc::new(CountingRuntime::default());
        let sup = supervisor(follower_election(), runtime, Vec::new());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };

        let run = sup.run(shutdown);
        tokio::pin!(run);

        // The loop keeps running until the signal arrives.
        assert!(
            timeout(Duration::from_millis(120), &mut run).await.is_err(),
            "loop must not exit on its own"
        );
        shutdown_tx.send(()).expect("signal");
        timeout(Duration::from_millis(200), run)
            .await
            .expect("loop exits once signalled");
    }
}
