use anyhow::{Context, Result};
use blkdio::config::Config;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CheckCmd, Cli, RunCmd};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let cli = <Cli as clap::Parser>::parse();
    match cli {
        Cli::Run(cmd) => run_main(&cmd),
        Cli::Check(cmd) => check_main(&cmd),
    }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    let config = Config::load(path)?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run_main(cmd: &RunCmd) -> Result<()> {
    let config = load_config(&cmd.config_file)?;
    tracing::debug!(?config, "configuration loaded");
    let report = blkdio::workload::run(&config)?;
    tracing::info!(%report, "workload finished");
    Ok(())
}

fn check_main(cmd: &CheckCmd) -> Result<()> {
    let config = load_config(&cmd.config_file)?;
    let out = toml::to_string_pretty(&config).context("failed to serialize configuration")?;
    print!("{out}");
    Ok(())
}
