//! End-to-end upgrade scenario.

use crate::{cli::Cli, config::Config, Error};
use futures::{future::try_join_all, stream, Future, StreamExt, TryStreamExt};
use sequencer_harness_client::{
    query, rollup, sequencer, Node, NodeInfo, Participant, SequencerBlock,
};
use sequencer_harness_upgrade::{
    aspen,
    change_info::{check_change_infos, UpgradeGroup, Upgrades},
    consistency::{ensure_consistent, observe},
    deploy::{Component, Deployer, Helm, Image, Release, Upgrade, INSTALL_ROLLOUT_TIMEOUT},
    lifecycle::{
        await_activation, detect_stall, height_after, resume_after_stall, stage, RESTART_MARGIN,
    },
    Error as UpgradeError,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{info, warn};

/// Charts whose dependencies are fetched before deploying.
const CHARTS: [&str; 2] = ["sequencer", "evm-stack"];

/// Time allowed for each node to commit its first block.
const FIRST_BLOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for a node joining after activation to commit past it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for a bridge lock to be credited on the rollup.
const BRIDGE_IN_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for each stage of a withdrawal.
const BRIDGE_OUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for submitted validator names to be reported.
const VALIDATOR_NAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `tasks` with at most `concurrency` in flight, returning once all succeed or as soon as
/// any fails (outstanding tasks are dropped).
pub async fn pool<T, E, I>(tasks: I, concurrency: usize) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T, E>>,
{
    stream::iter(tasks)
        .buffer_unordered(concurrency)
        .try_collect()
        .await
}

/// Installs `release` to `component` and waits for it to roll out. For sequencers, also confirms
/// the node reports the expected moniker.
async fn deploy<D: Deployer>(
    deployer: &D,
    component: &Component,
    release: &Release,
    client: Option<&sequencer::Client>,
) -> Result<Option<NodeInfo>, Error> {
    deployer.install(component, release).await?;
    deployer
        .wait_for_rollout(component, INSTALL_ROLLOUT_TIMEOUT)
        .await?;
    let Some(client) = client else {
        info!(component = component.name(), "running");
        return Ok(None);
    };
    let node_info = client.node_info().await?;
    info!(
        component = component.name(),
        address = %node_info.address,
        voting_power = node_info.voting_power,
        "running"
    );
    Ok(Some(node_info))
}

/// Runs checks specific to the upgrade named `name` before it is staged.
async fn pre_upgrade_checks<N: Node>(name: &str, cohort: &[N]) -> Result<(), UpgradeError> {
    match name {
        aspen::NAME => aspen::assert_pre_upgrade_conditions(cohort).await,
        _ => Err(UpgradeError::UnknownUpgrade(name.to_string())),
    }
}

/// Runs checks specific to the upgrade named `name` once every node has executed it.
async fn post_upgrade_checks<N: Node>(
    name: &str,
    cohort: &[N],
    activation_height: u64,
) -> Result<(), UpgradeError> {
    match name {
        aspen::NAME => aspen::assert_post_upgrade_conditions(cohort, activation_height).await,
        _ => Err(UpgradeError::UnknownUpgrade(name.to_string())),
    }
}

/// Describes a block by its hash.
fn describe(block: &SequencerBlock) -> String {
    hex::encode(&block.block_hash)
}

/// Builds the sequencer release for each participant.
struct Releases<'a> {
    config: &'a Config,
}

impl Releases<'_> {
    fn sequencer(
        &self,
        sequencer: &str,
        relayer: &str,
        price_feed: bool,
        activation_height: Option<u64>,
    ) -> Release {
        Release {
            images: BTreeMap::from([
                (Image::Sequencer, sequencer.to_string()),
                (Image::SequencerRelayer, relayer.to_string()),
            ]),
            price_feed,
            upgrade: Some(Upgrade {
                name: self.config.upgrade_name.clone(),
                activation_height,
            }),
        }
    }

    /// Release run before the upgrade is staged.
    fn pre_upgrade(&self, price_feed: bool) -> Result<Release, Error> {
        let pre = self.config.pre_upgrade()?;
        Ok(self.sequencer(&pre.sequencer, &pre.sequencer_relayer, price_feed, None))
    }

    /// Release executing the upgrade at `activation_height`.
    fn upgraded(&self, price_feed: bool, activation_height: u64) -> Release {
        let tag = &self.config.image_tag;
        self.sequencer(tag, tag, price_feed, Some(activation_height))
    }

    fn rollup(&self) -> Release {
        Release {
            images: self.config.rollup.images.clone(),
            ..Default::default()
        }
    }
}

/// Runs the upgrade scenario described by `config`.
pub async fn run(config: &Config) -> Result<(), Error> {
    let upgrade_name = config.upgrade_name.as_str();
    info!(
        upgrade_name,
        image_tag = %config.image_tag,
        pre_upgrade = ?config.pre_upgrade()?,
        "running sequencer upgrade test"
    );
    let releases = Releases { config };
    let helm = &Helm::new(&config.chart_root);
    let rollup = rollup::Client::new(&config.rollup.url);
    let cli = Cli::docker(&config.image_tag);
    let participants: Vec<Participant> = config
        .validators
        .iter()
        .map(|validator| validator.participant())
        .collect();

    // Fetch chart dependencies
    for chart in CHARTS {
        helm.update_dependencies(chart).await?;
    }

    // Start all but the last validator alongside the rollup
    let Some((joining, initial)) = config.validators.split_last() else {
        return Err(Error::InvalidConfig("no validators".into()));
    };
    let mut clients: Vec<sequencer::Client> = participants[..initial.len()]
        .iter()
        .cloned()
        .map(sequencer::Client::new)
        .collect();
    let mut components: Vec<Component> = participants[..initial.len()]
        .iter()
        .map(Component::sequencer)
        .collect();
    let mut node_infos = vec![None; initial.len()];
    let mut deployments = Vec::with_capacity(initial.len() + 1);
    for (i, validator) in initial.iter().enumerate() {
        deployments.push((
            Some(i),
            components[i].clone(),
            releases.pre_upgrade(validator.price_feed)?,
        ));
    }
    deployments.push((None, Component::Rollup, releases.rollup()));
    info!(sequencers = initial.len(), "starting sequencers and the rollup");
    let deployed = pool(
        deployments.iter().map(|(index, component, release)| {
            let client = index.map(|i| &clients[i]);
            async move {
                deploy(helm, component, release, client)
                    .await
                    .map(|info| (*index, info))
            }
        }),
        config.concurrency,
    )
    .await?;
    for (index, info) in deployed {
        if let Some(i) = index {
            node_infos[i] = info;
        }
    }

    // Record the pre-upgrade state
    try_join_all(
        clients
            .iter()
            .map(|client| client.wait_until_height(1, FIRST_BLOCK_TIMEOUT)),
    )
    .await?;
    let block_1_before =
        ensure_consistent("block 1", &clients, |node| node.sequencer_block(1)).await?;
    let app_version_before = ensure_consistent("current app version", &clients, |node| {
        node.current_app_version()
    })
    .await?;
    let genesis_app_version = ensure_consistent("genesis app version", &clients, |node| {
        node.genesis_app_version()
    })
    .await?;
    if app_version_before != genesis_app_version {
        return Err(Error::StaleNetwork {
            genesis: genesis_app_version,
            current: app_version_before,
        });
    }
    pre_upgrade_checks(upgrade_name, &clients).await?;
    info!(
        upgrade_name,
        app_version = app_version_before,
        block_1 = %describe(&block_1_before),
        "passed pre-upgrade checks"
    );

    // Bridge in
    let bridge = &config.bridge;
    let balance = rollup.balance(&bridge.evm_destination).await?;
    if balance != 0 {
        return Err(Error::UnexpectedBalance {
            address: bridge.evm_destination.clone(),
            balance,
            expected: 0,
        });
    }
    cli.init_bridge_account(&participants[1]).await?;
    cli.bridge_lock(&participants[2], bridge.lock_amount, &bridge.evm_destination)
        .await?;
    rollup
        .wait_until_balance(
            &bridge.evm_destination,
            u128::from(bridge.evm_balance_after_lock),
            BRIDGE_IN_TIMEOUT,
        )
        .await?;
    info!("bridge in succeeded");

    // Schedule the upgrade
    let latest = clients[0].last_block_height().await?;
    let activation_height = height_after(latest, config.activation_offset)?;
    let changes: Vec<&str> = config.changes()?.iter().map(String::as_str).collect();
    let upgrades = Upgrades::new(vec![UpgradeGroup::new(
        upgrade_name,
        &changes,
        activation_height,
    )])?;
    info!(activation_height, "scheduling upgrade");

    // Stage on all but one node, which keeps running the old binary through activation
    let Some(missed) = clients.pop() else {
        return Err(Error::InvalidConfig("no validators".into()));
    };
    let Some(missed_component) = components.pop() else {
        return Err(Error::InvalidConfig("no validators".into()));
    };
    let missed_validator = &initial[clients.len()];
    info!(node = %missed.participant().name, "withholding upgrade");
    let upgraded: Vec<Release> = initial[..clients.len()]
        .iter()
        .map(|validator| releases.upgraded(validator.price_feed, activation_height))
        .collect();
    let mut staged = pool(
        clients
            .iter()
            .zip(&components)
            .zip(&upgraded)
            .enumerate()
            .map(|(i, ((client, component), release))| async move {
                stage(client, helm, component, release)
                    .await
                    .map(|staged| (i, staged))
            }),
        config.concurrency,
    )
    .await?;
    staged.sort_by_key(|(i, _)| *i);

    // Wait for every staged node to execute the upgrade
    info!("waiting for staged nodes to activate");
    pool(
        staged.into_iter().map(|(i, staged)| {
            let (client, component) = (&clients[i], &components[i]);
            let upgrades = &upgrades;
            async move { await_activation(client, helm, component, staged, upgrades).await }
        }),
        config.concurrency,
    )
    .await?;

    // The withheld node must have stopped at activation; upgrade it and let it catch up
    let stalled = detect_stall(&missed, activation_height).await?;
    let release = releases.upgraded(missed_validator.price_feed, activation_height);
    resume_after_stall(
        &missed,
        helm,
        &missed_component,
        &release,
        stalled,
        &clients[0],
        &upgrades,
    )
    .await?;
    info!(node = %missed.participant().name, "caught up");
    clients.push(missed);

    // Join a new validator with the upgrade already scheduled
    let joining_participant = joining.participant();
    let joining_client = sequencer::Client::new(joining_participant.clone());
    let joining_info = deploy(
        helm,
        &Component::sequencer(&joining_participant),
        &releases.upgraded(joining.price_feed, activation_height),
        Some(&joining_client),
    )
    .await?;
    joining_client
        .wait_until_height(height_after(activation_height, RESTART_MARGIN)?, JOIN_TIMEOUT)
        .await?;
    info!(node = %joining_participant.name, "new validator caught up");
    clients.push(joining_client);
    node_infos.push(joining_info);

    // App version must have increased on every node
    let state = observe(&clients, |node| node.current_app_version()).await?;
    for (node, after) in &state.observations {
        if *after <= app_version_before {
            return Err(UpgradeError::AppVersionUnchanged {
                node: node.clone(),
                before: app_version_before,
                after: *after,
            }
            .into());
        }
    }
    let app_version_after = state.into_consistent("current app version")?;
    info!(before = app_version_before, after = app_version_after, "app version increased");

    // History must be preserved across the upgrade
    let block_1_after =
        ensure_consistent("block 1", &clients, |node| node.sequencer_block(1)).await?;
    if block_1_after != block_1_before {
        return Err(UpgradeError::Changed {
            what: "block 1".to_string(),
            before: describe(&block_1_before),
            after: describe(&block_1_after),
        }
        .into());
    }
    info!(block_1 = %describe(&block_1_after), "block 1 unchanged");

    // Every change must be applied and none left scheduled
    let info = ensure_consistent("upgrades info", &clients, |node| node.upgrades_info()).await?;
    if !info.scheduled.is_empty() {
        return Err(UpgradeError::UnexpectedScheduledChanges {
            node: clients[0].participant().name.clone(),
            count: info.scheduled.len(),
        }
        .into());
    }
    check_change_infos(&info.applied, &upgrades, Some(app_version_after))?;
    for change in &info.applied {
        info!(%change, "applied change");
    }

    // Name every validator
    for (client, node_info) in clients.iter().zip(&node_infos) {
        let node_info = match node_info {
            Some(node_info) => node_info.clone(),
            None => client.node_info().await?,
        };
        cli.validator_update(client.participant(), &node_info.pub_key, node_info.voting_power)
            .await?;
    }

    post_upgrade_checks(upgrade_name, &clients, activation_height).await?;
    info!(upgrade_name, "passed post-upgrade checks");

    for validator in &config.validators {
        let operation = format!("report name of {}", validator.address);
        query::poll_until(
            clients[0].participant().name.as_str(),
            &operation,
            VALIDATOR_NAME_TIMEOUT,
            || clients[0].validator_name(&validator.address),
            |name| *name == validator.name,
        )
        .await?;
    }
    info!("validator names reported");

    // Bridge out
    let hash = rollup
        .send_raw_transaction(&bridge.withdraw_transaction)
        .await?;
    if !hash.eq_ignore_ascii_case(&bridge.withdraw_transaction_hash) {
        warn!(%hash, expected = %bridge.withdraw_transaction_hash, "unexpected withdrawal hash");
    }
    rollup
        .wait_until_balance(
            &bridge.evm_destination,
            u128::from(bridge.evm_balance_after_withdraw),
            BRIDGE_OUT_TIMEOUT,
        )
        .await?;
    info!("bridge out succeeded on rollup");
    cli.wait_until_balance(
        &participants[3],
        &bridge.sequencer_account,
        u128::from(bridge.sequencer_balance_after_withdraw),
        BRIDGE_OUT_TIMEOUT,
    )
    .await?;
    info!("bridge out succeeded on sequencer");
    let block = rollup.transaction_block_number(&hash).await?;
    rollup
        .wait_until_finalized_height(block, BRIDGE_OUT_TIMEOUT)
        .await?;
    info!(block, "withdrawal finalized");

    info!(upgrade_name, activation_height, "sequencer network upgraded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_pool_collects() {
        let results: Result<Vec<u64>, Error> = pool(
            (0..5u64).map(|i| async move {
                sleep(Duration::from_secs(5 - i)).await;
                Ok::<_, Error>(i)
            }),
            5,
        )
        .await;
        let mut results = results.unwrap();
        assert_eq!(results, vec![4, 3, 2, 1, 0]);
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let results: Result<Vec<()>, Error> = pool(
            (0..5).map(|_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Error>(())
                }
            }),
            2,
        )
        .await;
        assert_eq!(results.unwrap().len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_fails_fast() {
        let completed = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let result: Result<Vec<()>, Error> = pool(
            (0..3u64).map(|i| {
                let completed = completed.clone();
                async move {
                    if i == 1 {
                        sleep(Duration::from_secs(1)).await;
                        return Err(Error::InvalidConfig("deploy failed".into()));
                    }
                    sleep(Duration::from_secs(100)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            3,
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_upgrade_checks() {
        let cohort: Vec<sequencer::Client> = Vec::new();
        let err = pre_upgrade_checks("birch", &cohort).await.unwrap_err();
        assert!(matches!(err, UpgradeError::UnknownUpgrade(name) if name == "birch"));
        let err = post_upgrade_checks("birch", &cohort, 10).await.unwrap_err();
        assert!(matches!(err, UpgradeError::UnknownUpgrade(_)));
    }

    #[test]
    fn test_releases() {
        let config: Config =
            serde_yaml::from_str("upgrade_name: aspen\nimage_tag: pr-2000\n").unwrap();
        let releases = Releases { config: &config };

        let pre = releases.pre_upgrade(false).unwrap();
        assert_eq!(pre.images[&Image::Sequencer], "2.0.0");
        assert_eq!(pre.images[&Image::SequencerRelayer], "1.0.1");
        assert!(!pre.price_feed);
        assert_eq!(pre.activation_height(), None);
        assert_eq!(pre.upgrade.unwrap().name, "aspen");

        let upgraded = releases.upgraded(true, 42);
        assert_eq!(upgraded.images[&Image::Sequencer], "pr-2000");
        assert_eq!(upgraded.activation_height(), Some(42));

        let rollup = releases.rollup();
        assert!(rollup.images.is_empty());
        assert!(rollup.upgrade.is_none());
    }

    #[test]
    fn test_describe_block() {
        let block = SequencerBlock {
            block_hash: vec![0xde, 0xad, 0xbe, 0xef],
            ..Default::default()
        };
        assert_eq!(describe(&block), "deadbeef");
    }
}
