// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use clap::{command, Parser};
use eyre::{eyre, Context, Result};
use merger_core::{
    committee::Committee,
    config::{ImportExport, NodeParameters, NodePrivateConfig},
    network::{channel_pair, route_local},
    types::{ChainId, MergerIndex},
    validator::Validator,
};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    operation: Operation,
}

#[derive(Parser)]
enum Operation {
    /// Generate a committee file, a parameters file and the private config files of all mergers.
    /// This is only suitable for local runs as it derives every key from a public seed.
    Genesis {
        #[clap(long, value_name = "INT")]
        mergers: usize,
        #[clap(long, value_name = "INT", default_value_t = 8)]
        signers: usize,
        #[clap(long, value_name = "INT", default_value_t = 1)]
        chain_id: ChainId,
        #[clap(long, value_name = "FILE", default_value = "genesis")]
        working_directory: PathBuf,
        #[clap(long, value_name = "FILE")]
        node_parameters_path: Option<PathBuf>,
    },
    /// Run every merger of a genesis directory in this process, connected by the local router.
    Run {
        #[clap(long, value_name = "FILE", default_value = "genesis")]
        working_directory: PathBuf,
        /// Catch up with the other mergers before processing blocks.
        #[clap(long, default_value_t = false)]
        bootstrap: bool,
    },
    /// Generate a fresh genesis and run it. Previous state in the working directory is removed.
    DryRun {
        #[clap(long, value_name = "INT", default_value_t = 4)]
        mergers: usize,
        #[clap(long, value_name = "FILE", default_value = "dryrun")]
        working_directory: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Nice colored error messages.
    color_eyre::install()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).init();

    // Parse the command line arguments.
    match Args::parse().operation {
        Operation::Genesis {
            mergers,
            signers,
            chain_id,
            working_directory,
            node_parameters_path,
        } => genesis(
            mergers,
            signers,
            chain_id,
            working_directory,
            node_parameters_path,
        )?,
        Operation::Run {
            working_directory,
            bootstrap,
        } => run(working_directory, bootstrap).await?,
        Operation::DryRun {
            mergers,
            working_directory,
        } => {
            match fs::remove_dir_all(&working_directory) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).wrap_err(format!(
                        "Failed to remove directory '{}'",
                        working_directory.display()
                    ))
                }
            }
            genesis(mergers, 8, 1, working_directory.clone(), None)?;
            run(working_directory, false).await?
        }
    }

    Ok(())
}

fn genesis(
    mergers: usize,
    signers: usize,
    chain_id: ChainId,
    working_directory: PathBuf,
    node_parameters_path: Option<PathBuf>,
) -> Result<()> {
    tracing::info!("Generating genesis files");
    if mergers == 0 {
        return Err(eyre!("A chain needs at least one merger"));
    }
    fs::create_dir_all(&working_directory).wrap_err(format!(
        "Failed to create directory '{}'",
        working_directory.display()
    ))?;

    // Generate the committee file.
    let committee_path = working_directory.join(Committee::DEFAULT_FILENAME);
    Committee::new_for_benchmarks(chain_id, mergers, signers)
        .print(&committee_path)
        .wrap_err("Failed to print committee file")?;
    tracing::info!("Generated committee file: {}", committee_path.display());

    // Generate the parameters file.
    let node_parameters = match node_parameters_path {
        Some(path) => NodeParameters::load(&path).wrap_err(format!(
            "Failed to load parameters file '{}'",
            path.display()
        ))?,
        None => NodeParameters::default(),
    };
    let parameters_path = working_directory.join(NodeParameters::DEFAULT_FILENAME);
    node_parameters
        .print(&parameters_path)
        .wrap_err("Failed to print parameters file")?;
    tracing::info!("Generated parameters file: {}", parameters_path.display());

    // Generate the private config files.
    for private_config in NodePrivateConfig::new_for_benchmarks(&working_directory, mergers) {
        fs::create_dir_all(&private_config.storage_path)
            .wrap_err("Failed to create storage directory")?;
        let path = working_directory.join(NodePrivateConfig::default_filename(
            private_config.merger,
        ));
        private_config
            .print(&path)
            .wrap_err("Failed to print private config file")?;
        tracing::info!("Generated private config file: {}", path.display());
    }

    Ok(())
}

async fn run(working_directory: PathBuf, bootstrap: bool) -> Result<()> {
    let committee_path = working_directory.join(Committee::DEFAULT_FILENAME);
    let committee = Committee::load(&committee_path)
        .wrap_err(format!(
            "Failed to load committee file '{}'",
            committee_path.display()
        ))
        .map(Arc::new)?;
    let parameters_path = working_directory.join(NodeParameters::DEFAULT_FILENAME);
    let parameters = NodeParameters::load(&parameters_path).wrap_err(format!(
        "Failed to load parameters file '{}'",
        parameters_path.display()
    ))?;

    let (endpoints, handles): (Vec<_>, Vec<_>) =
        committee.mergers().map(|_| channel_pair()).unzip();
    let router = route_local(handles);

    let mut validators = Vec::with_capacity(endpoints.len());
    for (merger, endpoint) in committee.mergers().zip(endpoints) {
        let private_config_path =
            working_directory.join(NodePrivateConfig::default_filename(merger));
        let private_config = NodePrivateConfig::load(&private_config_path).wrap_err(format!(
            "Failed to load private configuration file '{}'",
            private_config_path.display()
        ))?;
        if private_config.merger != merger {
            return Err(eyre!(
                "Private config '{}' belongs to merger {}",
                private_config_path.display(),
                private_config.merger
            ));
        }
        let validator = Validator::start(
            merger,
            committee.clone(),
            parameters.clone(),
            private_config,
            endpoint,
            bootstrap,
        )
        .await?;
        validators.push((merger, validator));
    }
    tracing::info!("Started {} mergers, press ctrl-c to stop", validators.len());

    let failed = wait_for_stop(&validators).await;
    let mut outcome = Ok(());
    for (merger, validator) in validators {
        if Some(merger) == failed {
            if let Ok(Err(e)) = validator.await_completion().await {
                outcome = Err(eyre!("Merger {merger} stopped: {e}"));
            }
        } else if let Err(e) = validator.stop().await {
            tracing::error!("Merger {merger} stopped with an error: {e}");
        }
    }
    router.abort();
    outcome
}

/// Waits for ctrl-c or for the first merger that stopped on its own.
async fn wait_for_stop(validators: &[(MergerIndex, Validator)]) -> Option<MergerIndex> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => return None,
            _ = ticker.tick() => {
                if let Some((merger, _)) = validators.iter().find(|(_, v)| v.is_finished()) {
                    return Some(*merger);
                }
            }
        }
    }
}
