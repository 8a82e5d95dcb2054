//! Per-channel cut coverage of a background index.
//!
//! A background index splits into sub-ranges (threshold tuning periods) and
//! overlaps one or more calibration indices (pulse-shape tuning periods).
//! Every (sub-range, calibration index) cell of every good channel resolves to
//! [`CellStatus::Covered`] or [`CellStatus::Excluded`]; a cell is covered only
//! when every cut the [`CutKind`] needs has a valid record.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::channels::ChannelRegistry;
use crate::cut_store::{CutStore, RiseParams, SlopeParams, ThresholdParams};
use crate::data::filter::Expr;
use crate::data::model::{BkgIdx, CalIdx, Channel, CutKind, DatasetId, Module, RunInterval, RunNumber};
use crate::error::{ExpoError, Result};
use crate::range_index::{RangeIndex, SubRangeSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellStatus {
    Covered,
    Excluded,
}

/// One (sub-range, calibration index) period of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageCell {
    pub sub_idx: usize,
    pub cal_idx: CalIdx,
    pub window: RunInterval,
    pub threshold_ok: bool,
    pub slope_ok: bool,
    pub rise_ok: bool,
    pub status: CellStatus,
}

/// Coverage of one channel over one background index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelCoverage {
    /// One entry per sub-range.
    pub threshold_mask: Vec<bool>,
    /// One entry per calibration index overlapping the background index.
    pub slope_mask: Vec<bool>,
    pub rise_mask: Vec<bool>,
    /// Threshold cut OR-ed over the covered sub-ranges, `None` if none is covered.
    pub threshold_cut: Option<Expr>,
    /// Pulse-shape cut OR-ed over the covered calibration periods.
    pub psa_cut: Option<Expr>,
    pub cells: Vec<CoverageCell>,
}

impl ChannelCoverage {
    pub fn excluded_windows(&self) -> impl Iterator<Item = RunInterval> + '_ {
        self.cells
            .iter()
            .filter(|c| c.status == CellStatus::Excluded)
            .map(|c| c.window)
    }
}

/// Coverage of every good channel of a module over one background index.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub ds: DatasetId,
    pub bkg_idx: BkgIdx,
    pub module: Module,
    pub cut_kind: CutKind,
    pub cal_key: String,
    pub span: RunInterval,
    pub sub_ranges: Vec<RunInterval>,
    /// First and last calibration index overlapping `span`.
    pub cal_lo: CalIdx,
    pub cal_hi: CalIdx,
    pub channels: BTreeMap<Channel, ChannelCoverage>,
}

impl Resolution {
    /// The full selection for a channel: threshold AND the pulse-shape cut the
    /// cut kind requires. `None` when the channel has no covered period.
    pub fn channel_cut(&self, channel: Channel) -> Option<Expr> {
        let cov = self.channels.get(&channel)?;
        let thr = cov.threshold_cut.clone()?;
        if self.cut_kind == CutKind::Threshold {
            return Some(thr);
        }
        Some(Expr::all([thr, cov.psa_cut.clone()?]))
    }
}

/// Excluded run windows per channel, the input of the exposure pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunExclusions(pub BTreeMap<Channel, Vec<RunInterval>>);

impl RunExclusions {
    /// Whether coverage was resolved for `channel` at all. A channel with
    /// an entry and no windows is fully covered.
    pub fn has_channel(&self, channel: Channel) -> bool {
        self.0.contains_key(&channel)
    }

    pub fn is_excluded(&self, channel: Channel, run: RunNumber) -> bool {
        self.0
            .get(&channel)
            .is_some_and(|ivs| ivs.iter().any(|iv| iv.contains(run)))
    }

    pub fn windows(&self, channel: Channel) -> &[RunInterval] {
        self.0.get(&channel).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct CutCoverageResolver<'a> {
    index: &'a RangeIndex,
    registry: &'a ChannelRegistry,
    store: &'a CutStore,
}

fn slope_valid(p: Option<&SlopeParams>) -> bool {
    p.is_some_and(SlopeParams::is_valid)
}

fn rise_valid(p: Option<&RiseParams>) -> bool {
    p.is_some_and(|p| p.fit_pass)
}

fn threshold_valid(p: Option<&ThresholdParams>) -> bool {
    p.is_some_and(|p| !p.is_bad)
}

/// `(run window) && cut`, or just `cut` when there is a single period.
fn windowed(window: RunInterval, cut: Expr, single: bool) -> Expr {
    if single {
        cut
    } else {
        Expr::all([Expr::RunRange(window), cut])
    }
}

impl<'a> CutCoverageResolver<'a> {
    pub fn new(index: &'a RangeIndex, registry: &'a ChannelRegistry, store: &'a CutStore) -> Self {
        CutCoverageResolver {
            index,
            registry,
            store,
        }
    }

    pub fn resolve(
        &self,
        ds: DatasetId,
        bkg_idx: BkgIdx,
        module: Module,
        cut_kind: CutKind,
    ) -> Result<Resolution> {
        let ds_num = ds.number();
        let channels = self.registry.good_channels(ds_num, Some(module), None)?;
        let span = self.index.bkg_span(ds, bkg_idx)?;
        let sub_ranges = self.index.sub_ranges(ds, bkg_idx, SubRangeSource::Threshold)?;

        let cal_key = ds.cal_key(module);
        if !self.index.has_cal_key(&cal_key) {
            return Err(ExpoError::UnknownCalKey(cal_key));
        }
        let cal_lo = self.index.require_cal_idx(&cal_key, span.lo)?;
        let cal_hi = self.index.require_cal_idx(&cal_key, span.hi)?;
        debug!(
            "DS{ds}-{} ({cut_kind}) bIdx {bkg_idx} ({span}) nBkg {} nCal {}",
            module.label(),
            sub_ranges.len(),
            cal_hi + 1 - cal_lo
        );

        let mut out: BTreeMap<Channel, ChannelCoverage> =
            channels.iter().map(|&ch| (ch, ChannelCoverage::default())).collect();

        // 1. threshold cuts, tuned per background sub-range
        let single_sub = sub_ranges.len() == 1;
        let mut thr_parts: BTreeMap<Channel, Vec<Expr>> = BTreeMap::new();
        for (sub_idx, sub) in sub_ranges.iter().enumerate() {
            let thresholds = self.store.thresholds(ds_num, bkg_idx, sub_idx)?;
            for &ch in &channels {
                let params = thresholds.as_ref().and_then(|t| t.get(&ch));
                let ok = threshold_valid(params);
                if let (true, Some(p)) = (ok, params) {
                    let cut = Expr::threshold(p.cut_energy());
                    thr_parts.entry(ch).or_default().push(windowed(*sub, cut, single_sub));
                }
                if let Some(cov) = out.get_mut(&ch) {
                    cov.threshold_mask.push(ok);
                }
            }
        }

        // 2. pulse-shape cuts, tuned per calibration index
        let single_cal = cal_lo == cal_hi;
        let mut psa_parts: BTreeMap<Channel, Vec<Expr>> = BTreeMap::new();
        for cal_idx in cal_lo..=cal_hi {
            let cov_window = self.index.cal_coverage(&cal_key, cal_idx)?;
            let window = cov_window.clamp_to(&span).unwrap_or(cov_window);
            let slopes = self.store.slope_cuts(&cal_key, cal_idx)?;
            let rises = self.store.rise_cuts(&cal_key, cal_idx)?;
            for &ch in &channels {
                let fs = slopes.as_ref().and_then(|m| m.get(&ch));
                let rn = rises.as_ref().and_then(|m| m.get(&ch));
                let fs_ok = slope_valid(fs);
                let rn_ok = rise_valid(rn);

                let fs_cut = fs.filter(|_| fs_ok).map(|p| Expr::slope(p.cut));
                let rn_cut = rn.filter(|_| rn_ok).map(|p| Expr::rise_noise(p.a, p.b, p.c99));
                let cut = match cut_kind {
                    CutKind::Threshold => None,
                    CutKind::Slope => fs_cut,
                    CutKind::RiseNoise => rn_cut,
                    CutKind::Combined => fs_cut.zip(rn_cut).map(|(f, r)| Expr::all([f, r])),
                };
                if let Some(cut) = cut {
                    psa_parts.entry(ch).or_default().push(windowed(window, cut, single_cal));
                }
                if let Some(cov) = out.get_mut(&ch) {
                    cov.slope_mask.push(fs_ok);
                    cov.rise_mask.push(rn_ok);
                }
            }
        }

        // 3. cells: each sub-range split by calibration index
        let bkg_runs = self.index.run_list(ds, Some(bkg_idx))?;
        for (sub_idx, sub) in sub_ranges.iter().enumerate() {
            let c_lo = self.index.require_cal_idx(&cal_key, sub.lo)?;
            let c_hi = self.index.require_cal_idx(&cal_key, sub.hi)?;
            for cal_idx in c_lo..=c_hi {
                let window = if c_lo == c_hi {
                    *sub
                } else {
                    let mut in_cell = Vec::new();
                    for &r in bkg_runs.iter().filter(|r| sub.contains(**r)) {
                        if self.index.cal_idx_for_run(&cal_key, r)? == Some(cal_idx) {
                            in_cell.push(r);
                        }
                    }
                    match (in_cell.first(), in_cell.last()) {
                        (Some(&lo), Some(&hi)) => RunInterval::new(lo, hi),
                        _ => {
                            debug!("No good runs in bIdx {bkg_idx} sub {sub_idx} cIdx {cal_idx}");
                            continue;
                        }
                    }
                };

                let pos = cal_idx.checked_sub(cal_lo).map(|p| p as usize);
                for (&ch, cov) in out.iter_mut() {
                    let threshold_ok = cov.threshold_mask.get(sub_idx).copied().unwrap_or(false);
                    let slope_ok = pos.and_then(|p| cov.slope_mask.get(p)).copied().unwrap_or(false);
                    let rise_ok = pos.and_then(|p| cov.rise_mask.get(p)).copied().unwrap_or(false);
                    let covered = threshold_ok
                        && (!cut_kind.needs_slope() || slope_ok)
                        && (!cut_kind.needs_rise() || rise_ok);
                    let status = if covered {
                        CellStatus::Covered
                    } else {
                        CellStatus::Excluded
                    };
                    debug!(
                        "{cal_key} bIdx {bkg_idx} sbIdx {sub_idx} cIdx {cal_idx} ch {ch} th {} fs {} rn {} {:?} {window}",
                        threshold_ok as u8, slope_ok as u8, rise_ok as u8, status
                    );
                    cov.cells.push(CoverageCell {
                        sub_idx,
                        cal_idx,
                        window,
                        threshold_ok,
                        slope_ok,
                        rise_ok,
                        status,
                    });
                }
            }
        }

        for (ch, cov) in out.iter_mut() {
            cov.threshold_cut = thr_parts.remove(ch).map(Expr::any);
            cov.psa_cut = psa_parts.remove(ch).map(Expr::any);
        }

        Ok(Resolution {
            ds,
            bkg_idx,
            module,
            cut_kind,
            cal_key,
            span,
            sub_ranges,
            cal_lo,
            cal_hi,
            channels: out,
        })
    }

    /// Every module of the dataset, every background index: the run windows
    /// each good channel loses to missing or invalid cuts.
    pub fn psa_cut_runs(&self, ds: DatasetId, cut_kind: CutKind) -> Result<RunExclusions> {
        info!("Getting PSA cut run/ch vals for DS-{ds} ({cut_kind}) ...");
        let mut excluded: BTreeMap<Channel, Vec<RunInterval>> = BTreeMap::new();
        for module in ds.modules() {
            for ch in self.registry.good_channels(ds.number(), Some(module), None)? {
                excluded.entry(ch).or_default();
            }
            for bkg_idx in self.index.bkg_index_span(ds)? {
                let res = self.resolve(ds, bkg_idx, module, cut_kind)?;
                for (ch, cov) in &res.channels {
                    excluded.entry(*ch).or_default().extend(cov.excluded_windows());
                }
            }
        }
        Ok(RunExclusions(excluded))
    }

    /// Full per-(bkgIdx, channel) selection of a dataset; pairs without any
    /// covered period are absent.
    pub fn final_cuts(&self, ds: DatasetId, cut_kind: CutKind) -> Result<BTreeMap<(BkgIdx, Channel), Expr>> {
        let mut cuts = BTreeMap::new();
        for module in ds.modules() {
            for bkg_idx in self.index.bkg_index_span(ds)? {
                let res = self.resolve(ds, bkg_idx, module, cut_kind)?;
                for &ch in res.channels.keys() {
                    if let Some(cut) = res.channel_cut(ch) {
                        debug!("bIdx {bkg_idx} ch {ch}: {cut}");
                        cuts.insert((bkg_idx, ch), cut);
                    }
                }
            }
        }
        Ok(cuts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::tests::sample_registry;
    use crate::cut_store::{rise_key, slope_key, threshold_key, CutRecord};
    use crate::data::model::EventRecord;
    use crate::range_index::tests::{iv, sample_index};
    use serde_json::json;

    fn rec(key: String, vals: serde_json::Value) -> CutRecord {
        serde_json::from_value(json!({ "key": key, "vals": vals })).unwrap()
    }

    /// Channel 592 lacks a threshold in sub-range 0 of bkg 0; every other
    /// cut is valid for both good M1 channels (592, 600).
    pub(crate) fn sample_store() -> CutStore {
        let good_fs = json!({"592": [10.0, 30.0, 8], "600": [11.0, 30.0, 8]});
        let good_rn = json!({"592": [0.0, 0.0, 5.0, 4.0, true], "600": [0.0, 0.0, 6.0, 4.0, true]});
        CutStore::from_records(vec![
            rec(threshold_key(1, 0, 0), json!({"600": [1.0, 0.1, 0]})),
            rec(threshold_key(1, 0, 1), json!({"592": [1.0, 0.2, 0], "600": [1.0, 0.1, 0]})),
            rec(threshold_key(1, 1, 0), json!({"592": [0.8, 0.1, 0], "600": [0.9, 0.1, 1]})),
            rec(slope_key("ds1_m1", 0), good_fs.clone()),
            rec(slope_key("ds1_m1", 1), json!({"592": [-1, -1, -1], "600": [11.0, 30.0, 8]})),
            rec(slope_key("ds1_m1", 2), good_fs),
            rec(rise_key("ds1_m1", 0), good_rn.clone()),
            rec(rise_key("ds1_m1", 1), good_rn.clone()),
            rec(rise_key("ds1_m1", 2), good_rn),
        ])
    }

    fn ev(run: u32, channel: u32, energy: f64, fit_slo: f64) -> EventRecord {
        EventRecord {
            run,
            channel,
            energy,
            fit_slo,
            rise_noise: 0.0,
        }
    }

    #[test]
    fn missing_threshold_excludes_from_combined_cut() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        let res = resolver
            .resolve(DatasetId::Numeric(1), 0, Module::M1, CutKind::Combined)
            .unwrap();
        assert_eq!(res.sub_ranges, vec![iv(9407, 9550), iv(9551, 9600)]);
        assert_eq!((res.cal_lo, res.cal_hi), (0, 0));

        let c592 = &res.channels[&592];
        assert_eq!(c592.threshold_mask, vec![false, true]);
        assert_eq!(c592.slope_mask, vec![true]);
        assert_eq!(c592.rise_mask, vec![true]);
        let status: Vec<_> = c592.cells.iter().map(|c| (c.window, c.status)).collect();
        assert_eq!(
            status,
            vec![
                (iv(9407, 9550), CellStatus::Excluded),
                (iv(9551, 9600), CellStatus::Covered)
            ]
        );
        assert!(res.channels[&600].cells.iter().all(|c| c.status == CellStatus::Covered));
    }

    #[test]
    fn every_cell_resolves_for_every_good_channel() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        let res = resolver
            .resolve(DatasetId::Numeric(1), 1, Module::M1, CutKind::Combined)
            .unwrap();
        assert_eq!(res.channels.keys().copied().collect::<Vec<_>>(), vec![592, 600]);
        assert_eq!((res.cal_lo, res.cal_hi), (0, 2));
        for cov in res.channels.values() {
            let windows: Vec<RunInterval> = cov.cells.iter().map(|c| c.window).collect();
            // runs 9691..9749 fall between calibration windows
            assert_eq!(windows, vec![iv(9501, 9650), iv(9651, 9690), iv(9750, 9800)]);
        }
        let c592: Vec<CellStatus> = res.channels[&592].cells.iter().map(|c| c.status).collect();
        assert_eq!(c592, vec![CellStatus::Covered, CellStatus::Excluded, CellStatus::Covered]);
        // bad threshold flag for 600 in this index
        assert!(res.channels[&600].cells.iter().all(|c| c.status == CellStatus::Excluded));
        assert!(res.channel_cut(600).is_none());
    }

    #[test]
    fn threshold_kind_ignores_psa_records() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        let res = resolver
            .resolve(DatasetId::Numeric(1), 1, Module::M1, CutKind::Threshold)
            .unwrap();
        assert!(res.channels[&592].cells.iter().all(|c| c.status == CellStatus::Covered));
        assert!(res.channels[&592].psa_cut.is_none());
    }

    #[test]
    fn resolution_is_idempotent() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        for kind in [CutKind::Threshold, CutKind::Slope, CutKind::RiseNoise, CutKind::Combined] {
            let a = resolver.resolve(DatasetId::Numeric(1), 1, Module::M1, kind).unwrap();
            let b = resolver.resolve(DatasetId::Numeric(1), 1, Module::M1, kind).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn channel_cut_selects_by_run_window() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        let res = resolver
            .resolve(DatasetId::Numeric(1), 1, Module::M1, CutKind::Slope)
            .unwrap();
        let cut = res.channel_cut(592).unwrap();
        // threshold 0.8 + 3*0.1 = 1.1 keV; slope cut 10 outside cal index 1
        assert!(cut.eval(&ev(9600, 592, 2.0, 5.0)));
        assert!(!cut.eval(&ev(9600, 592, 1.0, 5.0)));
        assert!(!cut.eval(&ev(9600, 592, 2.0, 15.0)));
        assert!(!cut.eval(&ev(9670, 592, 2.0, 5.0)));
        assert!(cut.eval(&ev(9780, 592, 2.0, 5.0)));
    }

    #[test]
    fn psa_cut_runs_collects_excluded_windows() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        let runs = resolver.psa_cut_runs(DatasetId::Numeric(1), CutKind::Combined).unwrap();
        // bkg 2 has no threshold record at all
        assert_eq!(
            runs.windows(592),
            &[iv(9407, 9550), iv(9651, 9690), iv(9801, 14502)]
        );
        assert_eq!(
            runs.windows(600),
            &[iv(9501, 9650), iv(9651, 9690), iv(9750, 9800), iv(9801, 14502)]
        );
        assert!(runs.is_excluded(592, 9500));
        assert!(!runs.is_excluded(592, 9551));
        assert!(!runs.is_excluded(600, 9500));

        let json = serde_json::to_string(&runs).unwrap();
        let back: RunExclusions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, runs);
    }

    #[test]
    fn unknown_cal_key_is_an_error() {
        let (index, reg, store) = (sample_index(), sample_registry(), sample_store());
        let resolver = CutCoverageResolver::new(&index, &reg, &store);
        assert!(matches!(
            resolver.resolve(DatasetId::Numeric(1), 0, Module::M2, CutKind::Combined),
            Err(ExpoError::UnknownCalKey(_))
        ));
    }
}
