/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Simulation configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! cpus: 8
//! cycles: 1000
//! cycle_len_us: 10000
//! dmin: 10
//! dmax: 100
//! runtime_min: 5
//! runtime_max: 15
//! exit_on_errors: false
//! checker: true
//! seed: 42
//! measures: [cycle, push_find]
//! out_dir: "."
//! ```
//!
//! Every field is optional; missing values fall back to the defaults in
//! [`params`](crate::params). Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::measure::MeasureKind;
use crate::params;

// ── Private YAML deserialization type ─────────────────────────────────────────

/// Maps directly onto the YAML file layout. Kept private – callers work
/// with [`SimConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SimConfigFile {
    cpus: Option<usize>,
    cycles: Option<u64>,
    cycle_len_us: Option<u64>,
    dmin: Option<u64>,
    dmax: Option<u64>,
    runtime_min: Option<u32>,
    runtime_max: Option<u32>,
    exit_on_errors: Option<bool>,
    lock_memory: Option<bool>,
    checker: Option<bool>,
    seed: Option<u64>,
    measures: Option<Vec<MeasureKind>>,
    out_dir: Option<PathBuf>,
}

// ── SimConfig ─────────────────────────────────────────────────────────────────

/// Fully-resolved simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of simulated CPUs (worker threads).
    pub cpus: usize,
    /// Simulation cycles per worker.
    pub cycles: u64,
    /// Cycle period.
    pub cycle_len: Duration,
    /// Deadline offset window for EDF arrivals.
    pub dmin: u64,
    pub dmax: u64,
    /// Runtime window for RT arrivals, in cycles.
    pub runtime_min: u32,
    pub runtime_max: u32,
    /// Abort the run on the first checker failure.
    pub exit_on_errors: bool,
    /// `mlockall` the process image before starting.
    pub lock_memory: bool,
    /// Run the consistency checker thread.
    pub checker: bool,
    /// RNG seed; `None` draws one at startup.
    pub seed: Option<u64>,
    /// Enabled measurements.
    pub measures: Vec<MeasureKind>,
    /// Directory for `out_<name>` files and the checker's error log.
    pub out_dir: PathBuf,
}

impl Default for SimConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(params::NR_CPUS);
        SimConfig {
            cpus,
            cycles: params::NCYCLES,
            cycle_len: Duration::from_micros(params::CYCLE_LEN_US),
            dmin: params::DMIN,
            dmax: params::DMAX,
            runtime_min: params::RUNTIME_MIN,
            runtime_max: params::RUNTIME_MAX,
            exit_on_errors: false,
            lock_memory: false,
            checker: true,
            seed: None,
            measures: Vec::new(),
            out_dir: PathBuf::from("."),
        }
    }
}

impl SimConfig {
    /// Parse `path` and overlay it on the defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let file: SimConfigFile = serde_yaml::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;

        debug!(path = %path.display(), "configuration file parsed");

        let mut cfg = SimConfig::default();
        if let Some(v) = file.cpus {
            cfg.cpus = v;
        }
        if let Some(v) = file.cycles {
            cfg.cycles = v;
        }
        if let Some(v) = file.cycle_len_us {
            cfg.cycle_len = Duration::from_micros(v);
        }
        if let Some(v) = file.dmin {
            cfg.dmin = v;
        }
        if let Some(v) = file.dmax {
            cfg.dmax = v;
        }
        if let Some(v) = file.runtime_min {
            cfg.runtime_min = v;
        }
        if let Some(v) = file.runtime_max {
            cfg.runtime_max = v;
        }
        if let Some(v) = file.exit_on_errors {
            cfg.exit_on_errors = v;
        }
        if let Some(v) = file.lock_memory {
            cfg.lock_memory = v;
        }
        if let Some(v) = file.checker {
            cfg.checker = v;
        }
        if file.seed.is_some() {
            cfg.seed = file.seed;
        }
        if let Some(v) = file.measures {
            cfg.measures = v;
        }
        if let Some(v) = file.out_dir {
            cfg.out_dir = v;
        }

        cfg.validate()?;
        info!(
            cpus = cfg.cpus,
            cycles = cfg.cycles,
            "configuration loaded from file"
        );
        Ok(cfg)
    }

    /// Reject parameter combinations the simulation cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cpus == 0 || self.cpus > params::NR_CPUS {
            bail!(
                "cpus must be in 1..={} (got {})",
                params::NR_CPUS,
                self.cpus
            );
        }
        if self.cycles == 0 {
            bail!("cycles must be positive");
        }
        if self.dmin >= self.dmax {
            bail!("dmin ({}) must be below dmax ({})", self.dmin, self.dmax);
        }
        if self.runtime_min >= self.runtime_max {
            bail!(
                "runtime_min ({}) must be below runtime_max ({})",
                self.runtime_min,
                self.runtime_max
            );
        }
        Ok(())
    }

    /// Slot count for the bitmap index: every deadline the simulation can
    /// generate fits, plus one reserved top slot for idle CPUs.
    pub fn bm_slots(&self) -> usize {
        (self.cycles + self.dmax) as usize + 2
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_file_yields_defaults() {
        let f = write_yaml("{}");
        let cfg = SimConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.cycles, params::NCYCLES);
        assert_eq!(cfg.dmin, params::DMIN);
        assert!(cfg.checker);
        assert!(cfg.measures.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let f = write_yaml(
            r#"
cpus: 4
cycles: 200
cycle_len_us: 500
seed: 7
measures: [cycle, push_find]
"#,
        );
        let cfg = SimConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.cpus, 4);
        assert_eq!(cfg.cycles, 200);
        assert_eq!(cfg.cycle_len, Duration::from_micros(500));
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(
            cfg.measures,
            vec![MeasureKind::Cycle, MeasureKind::PushFind]
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let f = write_yaml("cpuz: 4");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn zero_cpus_is_rejected() {
        let f = write_yaml("cpus: 0");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn inverted_deadline_window_is_rejected() {
        let f = write_yaml("dmin: 100\ndmax: 10");
        assert!(SimConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn bm_slots_cover_the_deadline_range() {
        let cfg = SimConfig {
            cycles: 100,
            dmax: 50,
            ..SimConfig::default()
        };
        // largest deadline = cycles + dmax - 1, plus the idle slot on top
        assert!(cfg.bm_slots() > 149);
    }
}
