//! CLI argument parsing using clap

use crate::engine::Backend;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// diskaio - asynchronous disk IO engine driver
#[derive(Parser, Debug)]
#[command(name = "diskaio")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a deterministic fixture file
    Gen(GenArgs),
    /// Stream positioned reads of a file through the engine
    Read(ReadArgs),
}

#[derive(Args, Debug)]
pub struct GenArgs {
    /// Fixture file to create
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// File size (e.g., 6M, 1G); must be a multiple of 4 bytes
    #[arg(short = 's', long, default_value = "6M")]
    pub size: String,

    /// Seed of the pseudo-random content
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// File to read
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// TOML configuration file with an [engine] section
    #[arg(short = 'c', long, env = "DISKAIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum outstanding requests (overrides config)
    #[arg(short = 'q', long)]
    pub capacity: Option<usize>,

    /// Retrieve completions through the readiness descriptor
    #[arg(long)]
    pub pollable: bool,

    /// Engine backend (overrides config)
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Open the file with O_DIRECT (implies 512-byte alignment checks)
    #[arg(long)]
    pub direct: bool,

    /// Size of each read (e.g., 4k, 1M)
    #[arg(short = 'b', long, default_value = "4k")]
    pub block_size: String,

    /// Number of reads to issue (default: enough to cover the file once)
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Compare every block against fixture content generated with this seed
    #[arg(long)]
    pub verify_seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Engine backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// Linux kernel AIO
    Kernel,
    /// Blocking syscalls at submission
    Sync,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Kernel => Backend::Kernel,
            BackendArg::Sync => Backend::Sync,
        }
    }
}
