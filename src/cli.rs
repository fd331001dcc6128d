use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[clap(name = "blkdio", version, about)]
pub enum Cli {
    Run(RunCmd),
    Check(CheckCmd),
}

/// Run the configured workload against the configured device in the foreground.
///
/// Requests are issued through the direct I/O engine, with the concurrency, submission mode and
/// flags given in the `[workload]` section. A throughput report is logged when all requests are
/// done or the time limit is reached. Verification failures and I/O errors abort the run.
#[derive(Debug, clap::Args)]
pub struct RunCmd {
    #[clap(long, short)]
    pub config_file: PathBuf,
}

/// Parse and validate a config file, then print the resolved configuration with all defaults
/// filled in.
#[derive(Debug, clap::Args)]
pub struct CheckCmd {
    #[clap(long, short)]
    pub config_file: PathBuf,
}
