//! Bully leader election with leader heartbeats.
//!
//! Every replica binds a TCP server on the election port and runs two
//! permanent background tasks: the acceptor and the heartbeat-timeout
//! monitor. The replica with the highest reachable id wins; a lower replica
//! stands down the moment a higher one answers `OK`. The current leader
//! broadcasts `LEADER` on a fixed cadence, which doubles as the heartbeat
//! followers watch for. All peer communication failures are soft: a dead
//! peer simply never answers, and the algorithm reads that as absence.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use common::log_error;
use common::wire::ElectionMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;

/// Leadership transition, published on the event channel. The channel is a
/// hint for observers; the authoritative value is [`ElectionManager::is_leader`],
/// which the supervision loop re-reads on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipChange {
    Gained,
    Lost,
}

#[derive(Debug)]
struct LeaderState {
    is_leader: bool,
    /// Last known leader id; `None` until some leader has been observed.
    leader_id: Option<u32>,
}

/// Shared handle to the election state machine. Cheap to clone; every clone
/// observes the same state.
#[derive(Clone)]
pub struct ElectionManager {
    cfg: Arc<ElectionConfig>,
    state: Arc<RwLock<LeaderState>>,
    last_heartbeat: Arc<RwLock<Instant>>,
    events: broadcast::Sender<LeadershipChange>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Background tasks of a running [`ElectionManager`]. Aborting the handle
/// takes the replica off the network, which is how tests simulate a crash.
pub struct ElectionHandle {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ElectionHandle {
    pub fn abort(&self) {
        for task in self.tasks.lock().expect("poisoned election task list").iter() {
            task.abort();
        }
    }
}

impl Drop for ElectionHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl ElectionManager {
    pub fn new(cfg: ElectionConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            cfg: Arc::new(cfg),
            state: Arc::new(RwLock::new(LeaderState {
                is_leader: false,
                leader_id: None,
            })),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            events,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().expect("poisoned election state lock").is_leader
    }

    pub fn leader_id(&self) -> Option<u32> {
        self.state.read().expect("poisoned election state lock").leader_id
    }

    /// Arrival time of the most recent LEADER heartbeat.
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.read().expect("poisoned heartbeat lock")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipChange> {
        self.events.subscribe()
    }

    /// Binds the election server and spawns the acceptor, the timeout
    /// monitor, and the initial election round (after the startup delay).
    /// A bind failure is fatal; everything after that is soft.
    pub async fn start(&self) -> Result<ElectionHandle> {
        let listener = TcpListener::bind(&self.cfg.bind_addr).await.with_context(|| {
            format!("failed to bind election server on {}", self.cfg.bind_addr)
        })?;
        info!(
            my_id = self.cfg.my_id,
            addr = %self.cfg.bind_addr,
            "election server listening"
        );

        let mgr = self.clone();
        self.track(tokio::spawn(async move { mgr.accept_loop(listener).await }));

        let mgr = self.clone();
        self.track(tokio::spawn(async move { mgr.monitor_timeouts().await }));

        let mgr = self.clone();
        let delay = self.cfg.startup_delay;
        self.track(tokio::spawn(async move {
            // Let the peer replicas bind their servers before the first round.
            tokio::time::sleep(delay).await;
            mgr.start_election().await;
        }));

        Ok(ElectionHandle {
            tasks: self.tasks.clone(),
        })
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .expect("poisoned election task list")
            .push(task);
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let mgr = self.clone();
                    tokio::spawn(async move {
                        log_error!(mgr.handle_connection(stream).await);
                    });
                }
                Err(e) => warn!("election accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = [0u8; 16];
        let n = timeout(self.cfg.socket_timeout, stream.read(&mut buf))
            .await
            .context("election read deadline expired")?
            .context("failed to read election message")?;
        let Some(msg) = ElectionMessage::parse(&buf[..n]) else {
            debug!("ignoring unknown election payload ({n} bytes)");
            return Ok(());
        };
        match msg {
            ElectionMessage::Election => self.on_election(&mut stream).await?,
            ElectionMessage::Ok => {
                debug!("OK received; a higher replica is handling the election")
            }
            ElectionMessage::Leader => self.on_leader_heartbeat(),
        }
        Ok(())
    }

    /// A lower-id replica asked for an election: answer OK on the same
    /// connection, then either reaffirm our leadership or run our own round.
    async fn on_election(&self, stream: &mut TcpStream) -> Result<()> {
        debug!("ELECTION received, replying OK");
        timeout(
            self.cfg.socket_timeout,
            stream.write_all(ElectionMessage::Ok.as_bytes()),
        )
        .await
        .context("election write deadline expired")?
        .context("failed to reply OK")?;

        let mgr = self.clone();
        if self.is_leader() {
            info!("already leader, reaffirming with a LEADER broadcast");
            tokio::spawn(async move { mgr.broadcast_leadership().await });
        } else {
            tokio::spawn(async move { mgr.start_election().await });
        }
        Ok(())
    }

    /// A LEADER message arrived: stamp the heartbeat clock and, if this
    /// replica believed itself leader, step down.
    fn on_leader_heartbeat(&self) {
        *self.last_heartbeat.write().expect("poisoned heartbeat lock") = Instant::now();

        let was_leader = {
            let mut state = self.state.write().expect("poisoned election state lock");
            let was_leader = state.is_leader;
            if state.leader_id.is_none() || was_leader {
                // The sender's id is not on the wire; what matters is that a
                // higher replica is alive. Record a best-effort hint.
                state.leader_id = Some(self.cfg.my_id + 1);
            }
            state.is_leader = false;
            was_leader
        };

        if was_leader {
            info!(my_id = self.cfg.my_id, "demoted: a higher replica announced leadership");
            let _ = self.events.send(LeadershipChange::Lost);
        } else {
            debug!("LEADER heartbeat received");
        }
    }

    /// One Bully round: consult every higher id; silence all around means we
    /// win. An OK from anyone means a higher replica takes it from here.
    pub async fn start_election(&self) {
        info!(my_id = self.cfg.my_id, "starting election round");
        let mut stood_down = false;
        for (id, addr) in self.cfg.higher_peers() {
            if self.send_message(addr, ElectionMessage::Election).await {
                debug!(peer = id, "peer acknowledged with OK");
                stood_down = true;
            }
        }
        if stood_down {
            // If no LEADER follows, the timeout monitor fires the next round.
            info!("a higher replica is alive, standing down");
        } else {
            self.become_leader().await;
        }
    }

    async fn become_leader(&self) {
        let was_leader = {
            let mut state = self.state.write().expect("poisoned election state lock");
            let was_leader = state.is_leader;
            state.is_leader = true;
            state.leader_id = Some(self.cfg.my_id);
            was_leader
        };
        info!(my_id = self.cfg.my_id, "assuming leadership");

        self.broadcast_leadership().await;

        if !was_leader {
            let mgr = self.clone();
            self.track(tokio::spawn(async move { mgr.heartbeat_loop().await }));
            let _ = self.events.send(LeadershipChange::Gained);
        }
    }

    /// Broadcasts LEADER on a fixed cadence. Exits on its next tick once the
    /// replica observes it is no longer leader.
    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.cfg.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The initial broadcast already went out in become_leader; skip the
        // immediate first tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_leader() {
                info!("no longer leader, stopping heartbeats");
                return;
            }
            self.broadcast_leadership().await;
        }
    }

    /// Sends LEADER to every peer. Unreachable peers are skipped; they are
    /// either dead or partitioned, both consistent with our role.
    async fn broadcast_leadership(&self) {
        for (id, addr) in &self.cfg.peers {
            if !self.send_message(addr, ElectionMessage::Leader).await {
                debug!(peer = id, "peer unreachable for LEADER broadcast");
            }
        }
    }

    /// Follower-side failure detector: starts an election when no heartbeat
    /// arrived within the election timeout.
    async fn monitor_timeouts(&self) {
        let mut ticker = tokio::time::interval(self.cfg.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_leader() {
                continue;
            }
            let silence = self.last_heartbeat().elapsed();
            if silence <= self.cfg.election_timeout {
                continue;
            }
            warn!(?silence, "no heartbeat within the election timeout");
            // Stamp the clock before electing so a fruitless round is
            // retried once per timeout window, not once per scan.
            *self.last_heartbeat.write().expect("poisoned heartbeat lock") = Instant::now();
            self.state
                .write()
                .expect("poisoned election state lock")
                .leader_id = None;
            let mgr = self.clone();
            tokio::spawn(async move { mgr.start_election().await });
        }
    }

    /// Opens one connection, sends one message and, for ELECTION, waits for
    /// the OK reply. Every failure mode is `false`: timeouts, refused
    /// connections and unexpected payloads all read as peer absence.
    async fn send_message(&self, addr: &str, msg: ElectionMessage) -> bool {
        let deadline = self.cfg.socket_timeout;
        let Ok(Ok(mut stream)) = timeout(deadline, TcpStream::connect(addr)).await else {
            return false;
        };
        if !matches!(
            timeout(deadline, stream.write_all(msg.as_bytes())).await,
            Ok(Ok(()))
        ) {
            return false;
        }
        if msg != ElectionMessage::Election {
            return true;
        }
        let mut buf = [0u8; 16];
        match timeout(deadline, stream.read(&mut buf)).await {
            Ok(Ok(n)) => ElectionMessage::parse(&buf[..n]) == Some(ElectionMessage::Ok),
            _ => false,
        }
    }
}
