//! diskaio CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use diskaio::config::cli::{Cli, Command, GenArgs, ReadArgs};
use diskaio::config::{self, toml as config_toml, EngineConfig};
use diskaio::stats::ReadReport;
use diskaio::util::fixture;
use diskaio::worker::{self, ReadPlan, BUFFER_ALIGNMENT};
use env_logger::Builder;
use log::LevelFilter;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Command::Gen(args) => run_gen(&args),
        Command::Read(args) => run_read(&args),
    }
}

/// Warnings by default, `-v` debug, `-vv` trace; RUST_LOG still applies on top
fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module("diskaio", level)
        .format_timestamp_millis()
        .parse_default_env();

    let _ = builder.try_init();
}

fn run_gen(args: &GenArgs) -> Result<()> {
    let size = config::parse_size(&args.size)?;
    fixture::write_fixture(&args.path, size, args.seed)?;
    println!(
        "Wrote {} bytes (seed {}) to {}",
        size,
        args.seed,
        args.path.display()
    );
    Ok(())
}

fn run_read(args: &ReadArgs) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => config_toml::parse_toml_file(path)?.engine,
        None => EngineConfig::default(),
    };
    let engine_config = config_toml::merge_cli_with_config(args, file_config)
        .context("Configuration validation failed")?;

    let block_size = usize::try_from(config::parse_size(&args.block_size)?)
        .context("Block size does not fit in memory")?;

    let mut options = OpenOptions::new();
    options.read(true);
    if args.direct {
        options.custom_flags(libc::O_DIRECT);
    }
    let file = options
        .open(&args.path)
        .with_context(|| format!("Failed to open {}", args.path.display()))?;
    let file_size = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", args.path.display()))?
        .len();

    let mut plan = ReadPlan::new(file_size, block_size);
    if let Some(count) = args.count {
        plan.count = count;
    }
    plan.alignment = engine_config.alignment.unwrap_or(0).max(BUFFER_ALIGNMENT);
    plan.verify_seed = args.verify_seed;

    let mut engine = diskaio::open_engine(&engine_config)
        .with_context(|| format!("Failed to open {} engine", engine_config.backend))?;
    let stats = worker::run_reads(engine.as_mut(), file.as_raw_fd(), &plan)?;

    let report = ReadReport::new(
        &stats,
        engine_config.backend,
        engine_config.poll_mode,
        engine_config.capacity,
        block_size,
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if !report.is_clean() {
        anyhow::bail!(
            "{} reads failed and {} blocks did not verify",
            report.errors,
            report.verify_failures
        );
    }
    Ok(())
}
