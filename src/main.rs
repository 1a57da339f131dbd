/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Command-line front end for the load-balancing evaluation harness.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pushpull::config::SimConfig;
use pushpull::edf::Edf;
use pushpull::index::IndexKind;
use pushpull::measure::{self, MeasureKind};
use pushpull::rt::Rt;
use pushpull::sim::{self, Summary, SIGINT_REQUESTED};

/// Exercise one of the global push/pull index implementations under a
/// multiprocessor scheduling simulation.
///
/// The short `-h` flag selects the heap variant, as the original tool had
/// it; ask for `--help` in full to read this text.
#[derive(Debug, Parser)]
#[command(
    name = "pushpull",
    disable_help_flag = true,
    group(
        ArgGroup::new("index")
            .required(true)
            .args(["heap", "array_heap", "skiplist", "fc_skiplist", "bm_fc_skiplist"])
    )
)]
struct Cli {
    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Binomial heap index.
    #[arg(short = 'h', long)]
    heap: bool,

    /// Indexed array-heap.
    #[arg(short = 'a', long)]
    array_heap: bool,

    /// Doubly-linked skip-list behind a reader-writer lock.
    #[arg(short = 's', long)]
    skiplist: bool,

    /// Flat-combining skip-list.
    #[arg(short = 'f', long)]
    fc_skiplist: bool,

    /// Bitmap-topped flat-combining skip-list.
    #[arg(short = 'b', long)]
    bm_fc_skiplist: bool,

    /// Fixed-priority (RT) scheduling instead of deadline (EDF) scheduling.
    #[arg(long)]
    rt: bool,

    /// YAML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated CPUs.
    #[arg(long)]
    cpus: Option<usize>,

    /// Simulation cycles per CPU.
    #[arg(long)]
    cycles: Option<u64>,

    /// Cycle period in microseconds.
    #[arg(long)]
    cycle_len_us: Option<u64>,

    /// Measurements to record, comma separated.
    #[arg(long, value_enum, value_delimiter = ',')]
    measure: Vec<MeasureKind>,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Abort on the first checker failure.
    #[arg(long)]
    exit_on_errors: bool,

    /// mlockall() the process image to stabilise latency samples.
    #[arg(long)]
    lock_memory: bool,

    /// Disable the consistency checker thread.
    #[arg(long)]
    no_checker: bool,
}

impl Cli {
    fn index_kind(&self) -> IndexKind {
        if self.heap {
            IndexKind::Heap
        } else if self.array_heap {
            IndexKind::ArrayHeap
        } else if self.skiplist {
            IndexKind::SkipList
        } else if self.fc_skiplist {
            IndexKind::FcSkipList
        } else {
            IndexKind::BmFcSkipList
        }
    }

    fn apply(&self, cfg: &mut SimConfig) {
        if let Some(v) = self.cpus {
            cfg.cpus = v;
        }
        if let Some(v) = self.cycles {
            cfg.cycles = v;
        }
        if let Some(v) = self.cycle_len_us {
            cfg.cycle_len = std::time::Duration::from_micros(v);
        }
        if !self.measure.is_empty() {
            cfg.measures = self.measure.clone();
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if self.exit_on_errors {
            cfg.exit_on_errors = true;
        }
        if self.lock_memory {
            cfg.lock_memory = true;
        }
        if self.no_checker {
            cfg.checker = false;
        }
    }
}

extern "C" fn on_sigint(_sig: i32) {
    SIGINT_REQUESTED.store(true, std::sync::atomic::Ordering::Relaxed);
}

fn install_sigint_handler() -> Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: the handler only stores to an atomic flag
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(on_sigint)) }
        .context("cannot install the SIGINT handler")?;
    Ok(())
}

fn lock_memory() {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    // page faults distort latency samples; a failure only costs accuracy
    if let Err(e) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        warn!(error = %e, "mlockall failed, measurements may be noisier");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => SimConfig::load_from_file(path)?,
        None => SimConfig::default(),
    };
    cli.apply(&mut cfg);
    cfg.validate()?;

    install_sigint_handler()?;
    if cfg.lock_memory {
        lock_memory();
    }

    let kind = cli.index_kind();
    info!(index = kind.label(), rt = cli.rt, "initializing the {}", kind.label());

    let summary: Summary = if cli.rt {
        sim::run::<Rt>(cfg.clone(), kind)?
    } else {
        sim::run::<Edf>(cfg.clone(), kind)?
    };

    measure::write_reports(
        &cfg.out_dir,
        &cfg.measures,
        cfg.cycles,
        cfg.cycle_len.as_secs_f64(),
        &summary.measures,
    )
    .context("cannot write measurement reports")?;

    if summary.check_failures > 0 {
        bail!(
            "checker recorded {} invariant violation(s), see error_log.txt",
            summary.check_failures
        );
    }
    Ok(())
}
