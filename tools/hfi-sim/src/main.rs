// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host tool that brings up an HFI link against the simulated firmware
//! OWNERS: @gpu
//! STATUS: Functional
//! API_STABILITY: Unstable (developer tool)
//!
//! Starts a link, lets `--threads` senders issue `--requests` GET_VALUE/TEST
//! requests each, prints link statistics and stops the link.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use gmu_hfi::sim::{FirmwareModel, SimFirmware};
use gmu_hfi::{ConfigError, HfiLink, LinkConfig, LinkLifecycle, LmConfig, Request, StaticTables};
use log::{info, LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "hfi-sim", about = "Exercise the GMU HFI link against a simulated firmware")]
struct Args {
    /// Link configuration (TOML); defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Concurrent senders.
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Requests per sender.
    #[arg(long, default_value_t = 1000)]
    requests: u32,
    /// Acknowledge every batch in reverse order.
    #[arg(long)]
    reorder: bool,
    /// Protocol major version, overriding the config file.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    protocol: Option<u8>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("link: {0}")]
    Link(#[from] gmu_hfi::Error),
    #[error("{failed} of {total} requests failed")]
    Requests { failed: u64, total: u64 },
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_config(args: &Args) -> Result<LinkConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };
    if let Some(major) = args.protocol {
        config.protocol_major = major;
        config.fw_major = u32::from(major);
        config.legacy_layout = major < 2;
    }
    config.validate()?;
    Ok(config)
}

fn demo_tables() -> StaticTables {
    StaticTables {
        perf: (0..8).map(|level| 300_000 + level * 100_000).collect(),
        bw: (0..8).collect(),
        acd: None,
        lm: Some(LmConfig { throttle_mask: 0x3, isense_slope: 40 }),
    }
}

fn drive(link: &Arc<HfiLink>, sender: usize, requests: u32) -> u64 {
    let mut failed = 0;
    for n in 0..requests {
        let req = if n % 8 == 0 {
            Request::Test
        } else {
            Request::GetValue { ty: sender as u32, subtype: n }
        };
        if let Err(err) = link.request(&req) {
            log::error!("sender {sender}: request {n} failed: {err}");
            failed += 1;
        }
    }
    failed
}

fn run(args: Args) -> Result<(), CliError> {
    let config = load_config(&args)?;
    let mut model = FirmwareModel::for_protocol(config.protocol());
    model.version = config.fw_version_word();
    model.reverse_batches = args.reorder;
    let fw = SimFirmware::new(model);

    let lc = LinkLifecycle::new(config, fw.platform(), demo_tables());
    lc.start()?;
    let link = lc.link()?;
    info!("link up, firmware {:#010x}", lc.fw_version().unwrap_or(0));

    let began = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|sender| {
            let link = link.clone();
            let requests = args.requests;
            thread::spawn(move || drive(&link, sender, requests))
        })
        .collect();
    let total = args.threads as u64 * u64::from(args.requests);
    let failed = workers
        .into_iter()
        .map(|worker| worker.join().unwrap_or(u64::from(args.requests)))
        .sum::<u64>();
    let elapsed = began.elapsed();

    let stats = link.stats();
    println!("protocol      {}", link.protocol());
    println!("requests      {total} in {:.3}s", elapsed.as_secs_f64());
    println!("sent          {}", stats.sent);
    println!("acked         {}", stats.acked);
    println!("timeouts      {}", stats.timeouts);
    println!("unmatched     {}", stats.unmatched);
    println!("events        {}", stats.events);
    lc.stop();

    if failed > 0 {
        return Err(CliError::Requests { failed, total });
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new().filter_level(log_level(args.verbose)).init();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hfi-sim: {err}");
            ExitCode::FAILURE
        }
    }
}
