//! Input locations and analysis constants.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::data::model::DatasetId;
use crate::exposure::EnergyGrid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const SECONDS_PER_DAY: f64 = 86400.0;
pub const GRAMS_PER_KG: f64 = 1000.0;
pub const DAYS_PER_YEAR: f64 = 365.25;

/// Threshold cut sits this many sigma above the trigger turn-on mean.
pub const THRESHOLD_SIGMAS: f64 = 3.0;

/// The rise-noise cut is tuned to keep 99.5% of signal, flat in energy.
pub const RISE_NOISE_EFFICIENCY: f64 = 0.995;

/// Default efficiency grid, keV.
pub const GRID_LO_KEV: f64 = 0.0;
pub const GRID_HI_KEV: f64 = 50.0;
pub const GRID_STEP_KEV: f64 = 0.01;

/// Allowed difference between the summed and summarized livetime report, kg-days.
pub const DEFAULT_SUMMARY_TOLERANCE: f64 = 1e-3;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "GE_EXPOSURE_CONFIG";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Every input file of an analysis pass. Relative paths are resolved against
/// the directory holding the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bkg_runs: PathBuf,
    pub cal_runs: PathBuf,
    pub special_runs: PathBuf,
    /// HV / threshold / channel / pulser-monitor bundle.
    pub settings: PathBuf,
    /// Detector constants; the built-in tables are used when absent.
    #[serde(default)]
    pub detector_tables: Option<PathBuf>,
    #[serde(default)]
    pub threshold_sub_ranges: Option<PathBuf>,
    #[serde(default)]
    pub hv_sub_ranges: Option<PathBuf>,
    pub cut_store: PathBuf,
    #[serde(default)]
    pub burst_list: Option<PathBuf>,
    /// Livetime table per dataset.
    #[serde(default)]
    pub livetime: BTreeMap<DatasetId, PathBuf>,
    /// Text livetime report per dataset, for the summary cross-check.
    #[serde(default)]
    pub livetime_reports: BTreeMap<DatasetId, PathBuf>,
    /// Event table per dataset, input of the final selection.
    #[serde(default)]
    pub events: BTreeMap<DatasetId, PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub energy_grid: EnergyGrid,
    #[serde(default = "default_summary_tolerance")]
    pub summary_tolerance: f64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_summary_tolerance() -> f64 {
    DEFAULT_SUMMARY_TOLERANCE
}

impl Config {
    /// The config path from the command line, else from [`CONFIG_ENV`].
    pub fn locate(cli: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = cli {
            return Ok(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Ok(PathBuf::from(path)),
            None => bail!("no config given: pass --config or set {CONFIG_ENV}"),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.resolve_relative(base);
        Ok(cfg)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.bkg_runs);
        fix(&mut self.cal_runs);
        fix(&mut self.special_runs);
        fix(&mut self.settings);
        fix(&mut self.cut_store);
        fix(&mut self.output_dir);
        for p in [
            &mut self.detector_tables,
            &mut self.threshold_sub_ranges,
            &mut self.hv_sub_ranges,
            &mut self.burst_list,
        ]
        .into_iter()
        .flatten()
        {
            fix(p);
        }
        for p in self
            .livetime
            .values_mut()
            .chain(self.livetime_reports.values_mut())
            .chain(self.events.values_mut())
        {
            fix(p);
        }
    }

    pub fn livetime_for(&self, ds: DatasetId) -> Result<&Path> {
        self.livetime
            .get(&ds)
            .map(PathBuf::as_path)
            .with_context(|| format!("no livetime table configured for DS-{ds}"))
    }

    pub fn events_for(&self, ds: DatasetId) -> Result<&Path> {
        self.events
            .get(&ds)
            .map(PathBuf::as_path)
            .with_context(|| format!("no event table configured for DS-{ds}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_follow_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{
                "bkg_runs": "runs/bkg.json",
                "cal_runs": "/abs/cal.json",
                "special_runs": "runs/special.json",
                "settings": "settings.json",
                "cut_store": "calDB.json",
                "livetime": {"5A": "lt/ds5a.parquet"}
            }"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.bkg_runs, dir.path().join("runs/bkg.json"));
        assert_eq!(cfg.cal_runs, PathBuf::from("/abs/cal.json"));
        assert_eq!(cfg.output_dir, dir.path().join("data"));
        let ds: DatasetId = "5A".parse().unwrap();
        assert_eq!(cfg.livetime_for(ds).unwrap(), dir.path().join("lt/ds5a.parquet"));
        assert!(cfg.events_for(ds).is_err());
        assert_eq!(cfg.energy_grid, EnergyGrid::default());
        assert_eq!(cfg.summary_tolerance, DEFAULT_SUMMARY_TOLERANCE);
    }

    #[test]
    fn explicit_path_wins() {
        let p = Config::locate(Some(PathBuf::from("x.json"))).unwrap();
        assert_eq!(p, PathBuf::from("x.json"));
    }
}
