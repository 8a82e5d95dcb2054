use anyhow::{Context, Result};
use log::info;

use crate::channels::{ChannelRegistry, DetectorTables};
use crate::config::Config;
use crate::coverage::CutCoverageResolver;
use crate::cut_store::CutStore;
use crate::data::loader;
use crate::range_index::RangeIndex;

// ---------------------------------------------------------------------------
// Analysis context
// ---------------------------------------------------------------------------

/// Everything loaded once per process and shared read-only by every pass.
pub struct AnalysisContext {
    /// Run ↔ background / calibration index tables.
    pub index: RangeIndex,

    /// Channel, detector and per-run settings lookups.
    pub registry: ChannelRegistry,

    /// Cut-parameter records (the only state ever written back).
    pub store: CutStore,
}

impl AnalysisContext {
    pub fn new(index: RangeIndex, registry: ChannelRegistry, store: CutStore) -> Self {
        Self {
            index,
            registry,
            store,
        }
    }

    /// Load every static table named by the config.
    pub fn load(cfg: &Config) -> Result<Self> {
        let bkg = loader::load_bkg_table(&cfg.bkg_runs)?;
        let cal = loader::load_cal_table(&cfg.cal_runs)?;
        let special = loader::load_special_table(&cfg.special_runs)?;
        let thr_sub = match &cfg.threshold_sub_ranges {
            Some(p) => loader::load_sub_ranges(p)?,
            None => Vec::new(),
        };
        let hv_sub = match &cfg.hv_sub_ranges {
            Some(p) => loader::load_sub_ranges(p)?,
            None => Vec::new(),
        };
        let index = RangeIndex::new(bkg, cal, special, thr_sub, hv_sub)
            .context("building run index")?;

        let tables = match &cfg.detector_tables {
            Some(p) => DetectorTables::load(p)?,
            None => DetectorTables::builtin(),
        };
        let settings = loader::load_settings(&cfg.settings)?;
        let registry = ChannelRegistry::new(tables, settings);

        let store = CutStore::open(&cfg.cut_store)
            .with_context(|| format!("opening cut store {}", cfg.cut_store.display()))?;

        info!(
            "Loaded {} datasets, {} calibration keys, {} cut records",
            index.dataset_map().len(),
            index.cal_keys(None).len(),
            store.len()
        );
        Ok(Self::new(index, registry, store))
    }

    pub fn resolver(&self) -> CutCoverageResolver<'_> {
        CutCoverageResolver::new(&self.index, &self.registry, &self.store)
    }

    /// Small DS1 context shared by unit tests.
    #[cfg(test)]
    pub(crate) fn sample() -> Self {
        Self::new(
            crate::range_index::tests::sample_index(),
            crate::channels::tests::sample_registry(),
            crate::coverage::tests::sample_store(),
        )
    }
}
