//! Sequencer Upgrade Harness CLI

use clap::{Arg, ArgAction, Command};
use sequencer_harness::{config::Config, driver};
use std::path::PathBuf;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Run the upgrade test
const RUN_CMD: &str = "run";

/// Entrypoint for the Sequencer Upgrade Harness CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("sequencer-harness")
        .version(crate_version())
        .about("Run end-to-end upgrade tests against a sequencer network.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(RUN_CMD)
                .about("Deploy a sequencer network, upgrade it, and verify every node converges on the upgraded state.")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .help("Path to YAML config file")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("image-tag")
                        .short('t')
                        .long("image-tag")
                        .help("Tag of the images executing the upgrade, e.g. 'latest', 'local', 'pr-2000' (overrides the config)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("upgrade-name")
                        .short('n')
                        .long("upgrade-name")
                        .help("Name of the upgrade to apply (overrides the config)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .help("Maximum deployments to run at once (must be >= 1, overrides the config)")
                        .value_parser(clap::builder::RangedU64ValueParser::<usize>::new().range(1..)),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((RUN_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let mut config = match Config::load(config_path) {
                Ok(config) => config,
                Err(e) => {
                    error!(error=?e, path = ?config_path, "failed to load config");
                    return std::process::ExitCode::FAILURE;
                }
            };
            if let Some(tag) = matches.get_one::<String>("image-tag") {
                config.image_tag = tag.clone();
            }
            if let Some(name) = matches.get_one::<String>("upgrade-name") {
                config.upgrade_name = name.to_lowercase();
            }
            if let Some(concurrency) = matches.get_one::<usize>("concurrency") {
                config.concurrency = *concurrency;
            }
            if let Err(e) = config.validate() {
                error!(error=?e, "invalid config");
                return std::process::ExitCode::FAILURE;
            }
            if let Err(e) = driver::run(&config).await {
                error!(error=?e, "upgrade test failed");
            } else {
                info!("upgrade test passed");
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
