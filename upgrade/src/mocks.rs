//! Simulated sequencer nodes and a deployer that drives them.
//!
//! Heights advance by one block per [BLOCK_TIME] of (tokio) time, so tests using a paused clock
//! observe a deterministic chain.

use crate::{
    deploy::{Component, Deployer as D, Release},
    Error,
};
use sequencer_harness_client::{
    self as client, proto::ExtendedCommitInfoWithProof, Node as N, SequencerBlock, UpgradesInfo,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

pub const BLOCK_TIME: Duration = Duration::from_secs(1);

enum Status {
    Running { base: u64, since: Instant },
    Down { height: u64, until: Instant },
    Crashed { height: u64 },
}

struct State {
    status: Status,
    crash_at: Option<u64>,
    app_version: u64,
    genesis_app_version: u64,
    vote_extensions_enable_height: u64,
    commit_info_from: Option<u64>,
    upgrades: UpgradesInfo,
    upgrades_queries: usize,
}

impl State {
    /// Applies any transition that has become due.
    fn refresh(&mut self) {
        let now = Instant::now();
        if let Status::Down { height, until } = self.status {
            if now >= until {
                self.status = Status::Running {
                    base: height,
                    since: until,
                };
            }
        }
        if let Status::Running { base, since } = self.status {
            let produced = (now - since).as_millis() / BLOCK_TIME.as_millis();
            let height = base + produced as u64;
            if let Some(crash_at) = self.crash_at {
                if height >= crash_at {
                    self.status = Status::Crashed { height: crash_at };
                }
            }
        }
    }

    fn height(&mut self) -> u64 {
        self.refresh();
        match self.status {
            Status::Running { base, since } => {
                base + ((Instant::now() - since).as_millis() / BLOCK_TIME.as_millis()) as u64
            }
            Status::Down { height, .. } | Status::Crashed { height } => height,
        }
    }

    fn reachable_height(&mut self) -> Result<u64, client::Error> {
        let height = self.height();
        match self.status {
            Status::Running { .. } => Ok(height),
            _ => Err(client::Error::Status(
                reqwest::StatusCode::SERVICE_UNAVAILABLE,
            )),
        }
    }
}

/// A simulated sequencer node.
#[derive(Clone)]
pub struct Node {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Node {
    /// Creates a running node currently at `height`.
    pub fn new(name: &str, height: u64) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State {
                status: Status::Running {
                    base: height,
                    since: Instant::now(),
                },
                crash_at: None,
                app_version: 1,
                genesis_app_version: 1,
                vote_extensions_enable_height: 0,
                commit_info_from: None,
                upgrades: UpgradesInfo::default(),
                upgrades_queries: 0,
            })),
        }
    }

    /// Stops the node once it reaches `height` (as a node running an outdated binary would).
    pub fn crash_at(&self, height: u64) {
        self.state.lock().unwrap().crash_at = Some(height);
    }

    /// Stops the node immediately.
    pub fn crash(&self) {
        let mut state = self.state.lock().unwrap();
        let height = state.height();
        state.status = Status::Crashed { height };
    }

    /// Takes the node down for `downtime`, after which it resumes from its current height
    /// with any scheduled crash cleared.
    pub fn restart(&self, downtime: Duration) {
        let mut state = self.state.lock().unwrap();
        let height = state.height();
        state.crash_at = None;
        state.status = Status::Down {
            height,
            until: Instant::now() + downtime,
        };
    }

    /// Clears any scheduled crash without restarting the node.
    pub fn replace_binary(&self) {
        self.state.lock().unwrap().crash_at = None;
    }

    pub fn is_running(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.refresh();
        matches!(state.status, Status::Running { .. })
    }

    pub fn set_app_version(&self, version: u64) {
        self.state.lock().unwrap().app_version = version;
    }

    pub fn set_genesis_app_version(&self, version: u64) {
        self.state.lock().unwrap().genesis_app_version = version;
    }

    pub fn set_vote_extensions_enable_height(&self, height: u64) {
        self.state.lock().unwrap().vote_extensions_enable_height = height;
    }

    /// Blocks at or above `height` carry extended commit info.
    pub fn set_commit_info_from(&self, height: Option<u64>) {
        self.state.lock().unwrap().commit_info_from = height;
    }

    pub fn set_upgrades(&self, upgrades: UpgradesInfo) {
        self.state.lock().unwrap().upgrades = upgrades;
    }

    /// Number of times the upgrades info has been queried.
    pub fn upgrades_queries(&self) -> usize {
        self.state.lock().unwrap().upgrades_queries
    }
}

impl N for Node {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_last_block_height(&self) -> Result<u64, client::Error> {
        self.state.lock().unwrap().reachable_height()
    }

    async fn last_block_height(&self) -> Result<u64, client::Error> {
        self.state.lock().unwrap().reachable_height()
    }

    async fn current_app_version(&self) -> Result<u64, client::Error> {
        let mut state = self.state.lock().unwrap();
        state.reachable_height()?;
        Ok(state.app_version)
    }

    async fn genesis_app_version(&self) -> Result<u64, client::Error> {
        let mut state = self.state.lock().unwrap();
        state.reachable_height()?;
        Ok(state.genesis_app_version)
    }

    async fn vote_extensions_enable_height(&self) -> Result<u64, client::Error> {
        let mut state = self.state.lock().unwrap();
        state.reachable_height()?;
        Ok(state.vote_extensions_enable_height)
    }

    async fn sequencer_block(&self, height: u64) -> Result<SequencerBlock, client::Error> {
        let mut state = self.state.lock().unwrap();
        let latest = state.reachable_height()?;
        if height > latest {
            return Err(client::Error::MissingField("block".to_string()));
        }
        let extended_commit_info_with_proof = state
            .commit_info_from
            .filter(|from| height >= *from)
            .map(|_| ExtendedCommitInfoWithProof {
                extended_commit_info: height.to_be_bytes().to_vec(),
                proof: vec![0; 32],
            });
        Ok(SequencerBlock {
            block_hash: height.to_be_bytes().to_vec(),
            extended_commit_info_with_proof,
            ..Default::default()
        })
    }

    async fn upgrades_info(&self) -> Result<UpgradesInfo, client::Error> {
        let mut state = self.state.lock().unwrap();
        state.reachable_height()?;
        state.upgrades_queries += 1;
        Ok(state.upgrades.clone())
    }
}

/// A deployment request received by a [Deployer].
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Install(String, Release),
    Upgrade(String, Release),
    Restart(String),
    WaitForRollout(String, Duration),
}

/// Records deployment requests and restarts the simulated nodes they target.
#[derive(Clone)]
pub struct Deployer {
    nodes: HashMap<String, Node>,
    downtime: Duration,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Deployer {
    /// Creates a deployer for `nodes`, each of which is unreachable for `downtime` after a restart.
    pub fn new(nodes: &[Node], downtime: Duration) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|node| (node.name.clone(), node.clone()))
                .collect(),
            downtime,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl D for Deployer {
    async fn install(&self, component: &Component, release: &Release) -> Result<(), Error> {
        self.record(Call::Install(component.name().to_string(), release.clone()));
        if let Some(node) = self.nodes.get(component.name()) {
            node.restart(self.downtime);
        }
        Ok(())
    }

    async fn upgrade(&self, component: &Component, release: &Release) -> Result<(), Error> {
        self.record(Call::Upgrade(component.name().to_string(), release.clone()));

        // A stopped pod is not replaced until it is restarted
        if let Some(node) = self.nodes.get(component.name()) {
            if node.is_running() {
                node.restart(self.downtime);
            } else {
                node.replace_binary();
            }
        }
        Ok(())
    }

    async fn restart(&self, component: &Component) -> Result<(), Error> {
        self.record(Call::Restart(component.name().to_string()));
        if let Some(node) = self.nodes.get(component.name()) {
            node.restart(self.downtime);
        }
        Ok(())
    }

    async fn wait_for_rollout(
        &self,
        component: &Component,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.record(Call::WaitForRollout(component.name().to_string(), timeout));
        Ok(())
    }
}
