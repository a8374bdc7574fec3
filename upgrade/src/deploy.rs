//! Deploy sequencer and rollup releases to the cluster.

use crate::Error;
use sequencer_harness_client::{Participant, DEV_NAMESPACE};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info};

/// Time allowed for a freshly installed component to roll out.
pub const INSTALL_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(600);

/// Pod restarted when a staged sequencer has stopped.
const SEQUENCER_POD: &str = "sequencer-0";

/// Statefulset of the rollup execution node.
const ROLLUP_STATEFULSET: &str = "astria-geth";

/// Container images that can be pinned to a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Image {
    Sequencer,
    SequencerRelayer,
    Conductor,
    Composer,
    BridgeWithdrawer,
    Geth,
}

impl Image {
    /// Chart value holding the tag of this image.
    fn value(&self) -> &'static str {
        match self {
            Image::Sequencer => "images.sequencer.tag",
            Image::SequencerRelayer => "sequencer-relayer.images.sequencerRelayer.tag",
            Image::Conductor => "evm-rollup.images.conductor.tag",
            Image::Composer => "composer.images.composer.devTag",
            Image::BridgeWithdrawer => "evm-bridge-withdrawer.images.evmBridgeWithdrawer.devTag",
            Image::Geth => "evm-rollup.images.geth.tag",
        }
    }

    fn is_sequencer(&self) -> bool {
        matches!(self, Image::Sequencer | Image::SequencerRelayer)
    }
}

/// A deployable component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Component {
    Sequencer { name: String, namespace: String },
    Rollup,
}

impl Component {
    pub fn sequencer(participant: &Participant) -> Self {
        Component::Sequencer {
            name: participant.name.clone(),
            namespace: participant.namespace.clone(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Component::Sequencer { name, .. } => name,
            Component::Rollup => "rollup",
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Component::Sequencer { namespace, .. } => namespace,
            Component::Rollup => DEV_NAMESPACE,
        }
    }

    fn statefulset(&self) -> &'static str {
        match self {
            Component::Sequencer { .. } => "sequencer",
            Component::Rollup => ROLLUP_STATEFULSET,
        }
    }
}

/// An upgrade configured into a sequencer release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upgrade {
    pub name: String,

    /// Height at which the upgrade activates (if `None`, the upgrade is omitted from
    /// `upgrades.json` entirely).
    pub activation_height: Option<u64>,
}

/// What to deploy to a component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Release {
    /// Image tags to override (chart defaults are used for anything missing).
    pub images: BTreeMap<Image, String>,

    /// Whether the sequencer's price feed is enabled.
    pub price_feed: bool,

    /// Set when running an upgrade test.
    pub upgrade: Option<Upgrade>,
}

impl Release {
    /// Returns the height at which the configured upgrade activates.
    pub fn activation_height(&self) -> Option<u64> {
        self.upgrade.as_ref().and_then(|upgrade| upgrade.activation_height)
    }
}

/// Installs, upgrades, and restarts components.
pub trait Deployer: Send + Sync {
    /// Installs `release` as a new deployment of `component`.
    fn install(
        &self,
        component: &Component,
        release: &Release,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replaces the running deployment of `component` with `release`.
    fn upgrade(
        &self,
        component: &Component,
        release: &Release,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Restarts a component whose process has stopped.
    fn restart(&self, component: &Component) -> impl Future<Output = Result<(), Error>> + Send;

    /// Waits for the latest deployment of `component` to be ready.
    fn wait_for_rollout(
        &self,
        component: &Component,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Builds the `helm` arguments that deploy `release` to `component`.
pub fn helm_args(subcommand: &str, component: &Component, release: &Release) -> Vec<String> {
    let mut args = vec![subcommand.to_string(), format!("-n={}", component.namespace())];
    match component {
        Component::Sequencer { name, .. } => {
            args.extend([
                format!("{name}-sequencer-chart"),
                "charts/sequencer".to_string(),
                "--values=dev/values/validators/all.yml".to_string(),
                format!("--values=dev/values/validators/{name}.yml"),
                format!("--set=sequencer.priceFeed.enabled={}", release.price_feed),
                "--set=sequencer.abciUDS=false".to_string(),
            ]);
        }
        Component::Rollup => {
            args.extend([
                "astria-chain-chart".to_string(),
                "charts/evm-stack".to_string(),
                "--values=dev/values/rollup/dev.yaml".to_string(),
                "--set=blockscout-stack.enabled=false".to_string(),
                "--set=postgresql.enabled=false".to_string(),
                "--set=evm-faucet.enabled=false".to_string(),
            ]);
        }
    }

    // Pin images belonging to this chart
    let sequencer = matches!(component, Component::Sequencer { .. });
    for (image, tag) in &release.images {
        if image.is_sequencer() == sequencer {
            args.push(format!("--set={}={tag}", image.value()));
        }
    }
    if subcommand == "install" {
        args.push("--create-namespace".to_string());
    }
    if !sequencer {
        return args;
    }

    // Configure the upgrade under test
    match &release.upgrade {
        Some(upgrade) => {
            let name = &upgrade.name;
            args.push("--set=storage.enabled=true".to_string());
            args.push("--set=sequencer-relayer.storage.enabled=true".to_string());
            args.push(format!("--values=dev/values/validators/{name}.upgrade.yml"));
            match upgrade.activation_height {
                Some(height) => {
                    args.push(format!("--set=upgrades.{name}.baseInfo.activationHeight={height}"))
                }
                None => args.push(format!("--set=upgrades.{name}.enabled=false")),
            }
        }
        None if release.price_feed => {
            args.push("--values=dev/values/validators/priceFeed.genesis.yml".to_string());
        }
        None => {}
    }
    args
}

/// A [Deployer] that shells out to `helm` and `kubectl`.
#[derive(Clone, Debug)]
pub struct Helm {
    root: PathBuf,
}

impl Helm {
    /// Creates a deployer resolving chart and values paths relative to `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Fetches the dependencies of the chart at `charts/<chart>`.
    pub async fn update_dependencies(&self, chart: &str) -> Result<(), Error> {
        let args = vec![
            "dependency".to_string(),
            "update".to_string(),
            format!("charts/{chart}"),
        ];
        self.run("helm", &args).await
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(), Error> {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(%command, "running");
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .status()
            .await?;
        if !status.success() {
            return Err(Error::CommandFailed { command, status });
        }
        Ok(())
    }
}

impl Deployer for Helm {
    async fn install(&self, component: &Component, release: &Release) -> Result<(), Error> {
        info!(component = component.name(), "installing");
        self.run("helm", &helm_args("install", component, release))
            .await
    }

    async fn upgrade(&self, component: &Component, release: &Release) -> Result<(), Error> {
        info!(component = component.name(), "upgrading");
        self.run("helm", &helm_args("upgrade", component, release))
            .await
    }

    async fn restart(&self, component: &Component) -> Result<(), Error> {
        info!(component = component.name(), "restarting pod");
        let args = vec![
            "delete".to_string(),
            "pod".to_string(),
            format!("-n={}", component.namespace()),
            SEQUENCER_POD.to_string(),
        ];
        self.run("kubectl", &args).await
    }

    async fn wait_for_rollout(
        &self,
        component: &Component,
        timeout: Duration,
    ) -> Result<(), Error> {
        info!(component = component.name(), ?timeout, "waiting for rollout");
        let args = vec![
            "rollout".to_string(),
            "status".to_string(),
            format!("statefulset/{}", component.statefulset()),
            format!("-n={}", component.namespace()),
            format!("--timeout={}s", timeout.as_secs()),
        ];
        self.run("kubectl", &args).await
    }
}
