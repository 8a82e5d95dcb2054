//! Livetime → exposure folding and exposure-weighted efficiency curves.

use std::collections::{BTreeMap, HashSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

use crate::config::{DAYS_PER_YEAR, GRAMS_PER_KG, RISE_NOISE_EFFICIENCY, SECONDS_PER_DAY};
use crate::coverage::{CellStatus, RunExclusions};
use crate::cut_store::{threshold_key, SlopeEfficiency};
use crate::data::loader::{BurstRow, LivetimeSummary};
use crate::data::model::{
    BkgIdx, Channel, Cpd, CutKind, DatasetId, DetectorType, LivetimeRecord, RunInterval,
};
use crate::error::{ExpoError, Result};
use crate::state::AnalysisContext;

/// Livetime seconds of a detector of `mass_g` grams, in kg-days.
pub fn kg_days(seconds: f64, mass_g: f64) -> f64 {
    seconds * mass_g / SECONDS_PER_DAY / GRAMS_PER_KG
}

/// Exposure of one channel (or a sum of channels), kg-days.
///
/// Every record lands in `raw`; at most one of the rejection buckets also
/// takes it, so the rejections never exceed `raw`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureTotals {
    pub raw: f64,
    pub psa_rejected: f64,
    pub burst_rejected: f64,
}

impl ExposureTotals {
    pub fn net(&self) -> f64 {
        debug_assert!(
            self.psa_rejected + self.burst_rejected <= self.raw + 1e-9 * self.raw.abs().max(1.0),
            "rejections exceed raw exposure: {self:?}"
        );
        self.raw - self.psa_rejected - self.burst_rejected
    }
}

impl std::ops::AddAssign for ExposureTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.raw += rhs.raw;
        self.psa_rejected += rhs.psa_rejected;
        self.burst_rejected += rhs.burst_rejected;
    }
}

/// Burst-noise cuts: detectors removed for a whole background index.
#[derive(Debug, Clone, Default)]
pub struct BurstList {
    cut: HashSet<(u32, Cpd, BkgIdx)>,
}

impl BurstList {
    pub fn from_rows(rows: impl IntoIterator<Item = BurstRow>) -> Self {
        BurstList {
            cut: rows.into_iter().map(|r| (r.ds_code, r.cpd, r.bkg_idx)).collect(),
        }
    }

    pub fn is_cut(&self, ds: DatasetId, cpd: Cpd, bkg_idx: BkgIdx) -> bool {
        self.cut.contains(&(ds.burst_code(), cpd, bkg_idx))
    }

    pub fn len(&self) -> usize {
        self.cut.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cut.is_empty()
    }
}

/// Exposure of one dataset split by detector type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetExposure {
    pub ds: Option<DatasetId>,
    pub enriched: ExposureTotals,
    pub natural: ExposureTotals,
    pub enriched_kg_days: f64,
    pub natural_kg_days: f64,
    pub per_channel: BTreeMap<Channel, ExposureTotals>,
}

/// Sum of net exposure over datasets, `(enriched, natural)` in kg-years.
pub fn grand_totals_kg_years<'a>(all: impl IntoIterator<Item = &'a DatasetExposure>) -> (f64, f64) {
    let (enr, nat) = all
        .into_iter()
        .fold((0.0, 0.0), |(e, n), d| (e + d.enriched_kg_days, n + d.natural_kg_days));
    (enr / DAYS_PER_YEAR, nat / DAYS_PER_YEAR)
}

/// Compare the per-background-index exposure of the livetime report with its
/// own all-channel summary.
///
/// Returns the per-channel difference in live seconds. A channel with exposure
/// but no summary row, or a difference beyond `tolerance` kg-days, aborts.
pub fn check_livetime_summary(summary: &LivetimeSummary, tolerance: f64) -> Result<BTreeMap<Channel, f64>> {
    let mut diffs = BTreeMap::new();
    for (&ch, per_bkg) in &summary.per_bkg {
        let my_sum: f64 = per_bkg.iter().sum();
        let Some(row) = summary.summary.get(&ch) else {
            if my_sum > 0.0 {
                return Err(ExpoError::ExposureMismatch {
                    channel: ch,
                    reason: format!("{my_sum:.4} kg-d summed but no summary row"),
                });
            }
            continue;
        };
        if (row.exposure - my_sum).abs() > tolerance {
            return Err(ExpoError::ExposureMismatch {
                channel: ch,
                reason: format!("summed {my_sum:.4} kg-d, summary {:.4} kg-d", row.exposure),
            });
        }
        let diff = if row.active_mass > 0.0 {
            (row.exposure - my_sum) / row.active_mass * SECONDS_PER_DAY
        } else {
            0.0
        };
        debug!("{ch}   {:.4}   {my_sum:<8.4}    {:<8.4}    {diff:<8.4}", row.active_mass, row.exposure);
        diffs.insert(ch, diff);
    }
    Ok(diffs)
}

// ---------------------------------------------------------------------------
// Efficiency shapes
// ---------------------------------------------------------------------------

/// Regular energy grid `[lo, hi)` in keV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyGrid {
    pub lo: f64,
    pub hi: f64,
    pub step: f64,
}

impl Default for EnergyGrid {
    fn default() -> Self {
        EnergyGrid {
            lo: crate::config::GRID_LO_KEV,
            hi: crate::config::GRID_HI_KEV,
            step: crate::config::GRID_STEP_KEV,
        }
    }
}

impl EnergyGrid {
    pub fn len(&self) -> usize {
        if self.step <= 0.0 || self.hi <= self.lo {
            return 0;
        }
        ((self.hi - self.lo) / self.step - 1e-9).ceil() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.lo + i as f64 * self.step).collect()
    }
}

/// Error-function trigger turn-on, 0.5 at `mu`.
pub fn trigger_turn_on(x: f64, mu: f64, sigma: f64) -> f64 {
    0.5 * (1.0 + erf((x - mu) / (std::f64::consts::SQRT_2 * sigma)))
}

/// Weibull-CDF turn-on, 0 at and below `loc`.
pub fn weibull_turn_on(x: f64, p: &SlopeEfficiency) -> f64 {
    if x <= p.loc {
        return 0.0;
    }
    p.amp * (1.0 - (-((x - p.loc) / p.scale).powf(p.c)).exp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfficiencyMode {
    /// Trigger efficiency only.
    Trigger,
    /// Trigger × slope cut × rise-noise cut.
    All,
}

impl std::str::FromStr for EfficiencyMode {
    type Err = ExpoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trig" | "trigger" => Ok(EfficiencyMode::Trigger),
            "all" => Ok(EfficiencyMode::All),
            other => Err(ExpoError::UnknownOption {
                kind: "efficiency mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Exposure-weighted efficiency curves of one dataset, in kg-days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyCurves {
    pub ds: DatasetId,
    pub mode: EfficiencyMode,
    pub energy: Vec<f64>,
    pub per_channel: BTreeMap<Channel, Vec<f64>>,
    pub enriched: Vec<f64>,
    pub natural: Vec<f64>,
    /// Exposure after PSA and burst cuts that entered the weights.
    pub enriched_kg_days: f64,
    pub natural_kg_days: f64,
}

/// Curve divided by its maximum; for display only.
pub fn normalized(curve: &[f64]) -> Vec<f64> {
    let max = curve.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        curve.iter().map(|v| v / max).collect()
    } else {
        curve.to_vec()
    }
}

// ---------------------------------------------------------------------------
// ExposureAggregator
// ---------------------------------------------------------------------------

pub struct ExposureAggregator<'a> {
    ctx: &'a AnalysisContext,
    ds: DatasetId,
    exclusions: &'a RunExclusions,
    bursts: &'a BurstList,
    totals: BTreeMap<Channel, ExposureTotals>,
}

impl<'a> ExposureAggregator<'a> {
    pub fn new(
        ctx: &'a AnalysisContext,
        ds: DatasetId,
        exclusions: &'a RunExclusions,
        bursts: &'a BurstList,
    ) -> Self {
        ExposureAggregator {
            ctx,
            ds,
            exclusions,
            bursts,
            totals: BTreeMap::new(),
        }
    }

    pub fn totals(&self) -> &BTreeMap<Channel, ExposureTotals> {
        &self.totals
    }

    fn channel_mass(&self, channel: Channel) -> Result<f64> {
        let reg = &self.ctx.registry;
        let id = reg.detector_id_for_channel(self.ds.number(), channel)?;
        reg.active_mass(id)
    }

    fn channel_cpd(&self, channel: Channel) -> Result<Cpd> {
        self.ctx
            .registry
            .cpd_for_channel(self.ds.number(), channel)
            .ok_or(ExpoError::UnknownChannel { ds: self.ds, channel })
    }

    fn burst_cut(&self, bkg_idx: BkgIdx, channel: Channel) -> Result<bool> {
        Ok(self.bursts.is_cut(self.ds, self.channel_cpd(channel)?, bkg_idx))
    }

    /// Fold one channel's livetime rows from one background index into the
    /// running totals; returns this call's contribution.
    ///
    /// The channel must have an entry in the run exclusions, otherwise
    /// [`ExpoError::UnresolvedCoverage`].
    pub fn accumulate(
        &mut self,
        bkg_idx: BkgIdx,
        channel: Channel,
        records: &[LivetimeRecord],
    ) -> Result<ExposureTotals> {
        if !self.exclusions.has_channel(channel) {
            return Err(ExpoError::UnresolvedCoverage { ds: self.ds, channel });
        }
        let mass = self.channel_mass(channel)?;
        let burst = self.burst_cut(bkg_idx, channel)?;
        let mut part = ExposureTotals::default();
        for rec in records.iter().filter(|r| r.channel == channel) {
            let expo = kg_days(rec.seconds, mass);
            part.raw += expo;
            if self.exclusions.is_excluded(channel, rec.run) {
                part.psa_rejected += expo;
            } else if burst {
                part.burst_rejected += expo;
            }
        }
        *self.totals.entry(channel).or_default() += part;
        Ok(part)
    }

    /// Livetime rows of good channels grouped by `(bkgIdx, channel)`.
    ///
    /// Only channels of the modules read out in the dataset count. Each row
    /// goes to the background index whose intervals contain its run; rows
    /// outside the dataset's indices or from other channels are dropped.
    fn group_livetime(
        &self,
        records: &[LivetimeRecord],
    ) -> Result<BTreeMap<(BkgIdx, Channel), Vec<LivetimeRecord>>> {
        let ds_num = self.ds.number();
        let mut good: HashSet<Channel> = HashSet::new();
        for module in self.ds.modules() {
            good.extend(self.ctx.registry.good_channels(ds_num, Some(module), None)?);
        }

        let mut grouped: BTreeMap<(BkgIdx, Channel), Vec<LivetimeRecord>> = BTreeMap::new();
        let (mut off_index, mut off_channel) = (0usize, 0usize);
        for rec in records {
            if !good.contains(&rec.channel) {
                off_channel += 1;
                continue;
            }
            match self.ctx.index.bkg_idx_for_run(self.ds, rec.run) {
                Some(b) => grouped.entry((b, rec.channel)).or_default().push(*rec),
                None => off_index += 1,
            }
        }
        if off_channel > 0 {
            debug!("DS-{}: skipped {off_channel} livetime rows of non-good channels", self.ds);
        }
        if off_index > 0 {
            warn!(
                "DS-{}: {off_index} livetime rows fall outside the dataset's background indices",
                self.ds
            );
        }
        Ok(grouped)
    }

    /// Fold every livetime row of the dataset.
    pub fn accumulate_dataset(&mut self, records: &[LivetimeRecord]) -> Result<()> {
        for ((bkg_idx, ch), rows) in self.group_livetime(records)? {
            self.accumulate(bkg_idx, ch, &rows)?;
        }
        Ok(())
    }

    /// Split the accumulated totals by detector type.
    pub fn finalize(&self) -> Result<DatasetExposure> {
        let ds_num = self.ds.number();
        let mut out = DatasetExposure {
            ds: Some(self.ds),
            per_channel: self.totals.clone(),
            ..DatasetExposure::default()
        };
        for (&ch, t) in &self.totals {
            match self.ctx.registry.detector_type_for_channel(ds_num, ch)? {
                DetectorType::Enriched => {
                    out.enriched += *t;
                    out.enriched_kg_days += t.net();
                }
                DetectorType::Natural => {
                    out.natural += *t;
                    out.natural_kg_days += t.net();
                }
            }
        }
        info!(
            "DS-{}  Enriched (kg-d): {:<8.4}  No cuts {:<8.3} - PSA {:<8.4} - Burst {:<8.4}",
            self.ds,
            out.enriched_kg_days,
            out.enriched.raw,
            out.enriched.psa_rejected,
            out.enriched.burst_rejected
        );
        info!(
            "DS-{}  Natural (kg-d) : {:<8.4}  No cuts {:<8.3} - PSA {:<8.4} - Burst {:<8.4}",
            self.ds,
            out.natural_kg_days,
            out.natural.raw,
            out.natural.psa_rejected,
            out.natural.burst_rejected
        );
        Ok(out)
    }

    /// Exposure-weighted efficiency versus energy.
    ///
    /// For each covered (sub-range, calibration index) cell of each channel,
    /// the trigger turn-on of that sub-range's threshold (zero below
    /// `mu + 3 sigma`) is weighted by the cell's post-cut exposure; in
    /// [`EfficiencyMode::All`] it is further multiplied by the detector's
    /// slope-cut turn-on and the flat rise-noise efficiency. Curves are
    /// summed, never averaged.
    pub fn efficiency_curve(
        &self,
        grid: &EnergyGrid,
        mode: EfficiencyMode,
        records: &[LivetimeRecord],
    ) -> Result<EfficiencyCurves> {
        let ds_num = self.ds.number();
        let energy = grid.points();
        let n = energy.len();
        let grouped = self.group_livetime(records)?;
        let slope_eff = match mode {
            EfficiencyMode::All => self.ctx.store.slope_efficiencies()?,
            EfficiencyMode::Trigger => BTreeMap::new(),
        };
        let resolver = self.ctx.resolver();

        let mut per_channel: BTreeMap<Channel, Vec<f64>> = BTreeMap::new();
        let (mut enr_expo, mut nat_expo) = (0.0, 0.0);

        for module in self.ds.modules() {
            info!("Scanning DS-{}, {} ...", self.ds, module.label());
            for bkg_idx in self.ctx.index.bkg_index_span(self.ds)? {
                let res = resolver.resolve(self.ds, bkg_idx, module, CutKind::Combined)?;
                let mut thresholds = BTreeMap::new();
                for (&ch, cov) in &res.channels {
                    let rows = grouped.get(&(bkg_idx, ch)).map(Vec::as_slice).unwrap_or(&[]);
                    let mass = self.channel_mass(ch)?;
                    let burst = self.burst_cut(bkg_idx, ch)?;
                    let det_type = self.ctx.registry.detector_type_for_channel(ds_num, ch)?;
                    let curve = per_channel.entry(ch).or_insert_with(|| vec![0.0; n]);

                    for cell in &cov.cells {
                        let cell_expo = if burst {
                            0.0
                        } else {
                            self.cell_exposure(ch, cell.window, rows, mass)
                        };
                        match det_type {
                            DetectorType::Enriched => enr_expo += cell_expo,
                            DetectorType::Natural => nat_expo += cell_expo,
                        }
                        if cell.status != CellStatus::Covered {
                            continue;
                        }

                        let key = threshold_key(ds_num, bkg_idx, cell.sub_idx);
                        if !thresholds.contains_key(&cell.sub_idx) {
                            let rec = self.ctx.store.thresholds(ds_num, bkg_idx, cell.sub_idx)?;
                            thresholds.insert(cell.sub_idx, rec);
                        }
                        let th = thresholds
                            .get(&cell.sub_idx)
                            .and_then(|r| r.as_ref())
                            .and_then(|r| r.get(&ch))
                            .ok_or_else(|| ExpoError::MalformedRecord {
                                key: key.clone(),
                                reason: format!("no threshold for covered channel {ch}"),
                            })?;
                        if th.is_bad {
                            return Err(ExpoError::BadThreshold { key, channel: ch });
                        }

                        let psa = match mode {
                            EfficiencyMode::Trigger => None,
                            EfficiencyMode::All => {
                                let cpd = self.channel_cpd(ch)?;
                                Some(slope_eff.get(&cpd).ok_or_else(|| ExpoError::MalformedRecord {
                                    key: crate::cut_store::SLOPE_EFFICIENCY_KEY.to_string(),
                                    reason: format!("no slope efficiency for detector {cpd}"),
                                })?)
                            }
                        };

                        let cut_energy = th.cut_energy();
                        for (i, &x) in energy.iter().enumerate() {
                            if x < cut_energy {
                                continue;
                            }
                            let mut eff = trigger_turn_on(x, th.mu, th.sigma) * cell_expo;
                            if let Some(p) = psa {
                                eff *= weibull_turn_on(x, p) * RISE_NOISE_EFFICIENCY;
                            }
                            curve[i] += eff;
                        }
                    }
                }
            }
        }

        let mut enriched = vec![0.0; n];
        let mut natural = vec![0.0; n];
        for (&ch, curve) in &per_channel {
            let target = match self.ctx.registry.detector_type_for_channel(ds_num, ch)? {
                DetectorType::Enriched => &mut enriched,
                DetectorType::Natural => &mut natural,
            };
            for (t, v) in target.iter_mut().zip(curve) {
                *t += v;
            }
        }

        Ok(EfficiencyCurves {
            ds: self.ds,
            mode,
            energy,
            per_channel,
            enriched,
            natural,
            enriched_kg_days: enr_expo,
            natural_kg_days: nat_expo,
        })
    }

    /// Post-cut exposure of one channel inside a cell window.
    fn cell_exposure(&self, channel: Channel, window: RunInterval, rows: &[LivetimeRecord], mass: f64) -> f64 {
        rows.iter()
            .filter(|r| window.contains(r.run) && !self.exclusions.is_excluded(channel, r.run))
            .map(|r| kg_days(r.seconds, mass))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::loader::SummaryRow;

    fn lt(run: u32, channel: u32, seconds: f64) -> LivetimeRecord {
        LivetimeRecord { run, channel, seconds }
    }

    #[test]
    fn kg_days_conversion() {
        // one day of a 1 kg detector
        assert!((kg_days(86400.0, 1000.0) - 1.0).abs() < 1e-12);
        assert!((kg_days(43200.0, 500.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn psa_and_burst_rejections_never_exceed_raw() {
        let ctx = AnalysisContext::sample();
        let ds = DatasetId::Numeric(1);
        let excl = RunExclusions(BTreeMap::from([
            (592, vec![RunInterval::new(9407, 9550)]),
            (600, vec![]),
        ]));
        let bursts = BurstList::from_rows([BurstRow { ds_code: 1, cpd: Cpd(121), bkg_idx: 0 }]);
        let mut agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);

        let rows = [lt(9500, 592, 86400.0), lt(9560, 592, 86400.0), lt(9560, 600, 86400.0)];
        let t = agg.accumulate(0, 592, &rows).unwrap();
        // 592 is C1P2D1 (560 g); first row PSA-cut, second burst-cut
        assert!((t.raw - 1.12).abs() < 1e-10);
        assert!((t.psa_rejected - 0.56).abs() < 1e-10);
        assert!((t.burst_rejected - 0.56).abs() < 1e-10);
        assert!(t.net() >= 0.0);
        assert!(t.net().abs() < 1e-10);

        let t600 = agg.accumulate(0, 600, &rows).unwrap();
        assert!((t600.raw - 0.979).abs() < 1e-10);
        assert_eq!(t600.net(), t600.raw);
    }

    #[test]
    fn net_is_the_plain_difference() {
        let t = ExposureTotals { raw: 2.0, psa_rejected: 0.5, burst_rejected: 0.25 };
        assert_eq!(t.net(), 1.25);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "rejections exceed raw exposure")]
    fn net_flags_rejections_beyond_raw() {
        let t = ExposureTotals { raw: 1.0, psa_rejected: 0.75, burst_rejected: 0.5 };
        let _ = t.net();
    }

    #[test]
    fn finalize_splits_by_detector_type() {
        let ctx = AnalysisContext::sample();
        let ds = DatasetId::Numeric(1);
        let excl = RunExclusions(BTreeMap::from([(592, vec![]), (600, vec![])]));
        let bursts = BurstList::default();
        let mut agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        let rows = [
            lt(9407, 592, 86400.0),
            lt(9407, 600, 86400.0),
            lt(9501, 600, 86400.0),
            lt(9407, 598, 86400.0), // bad channel
            lt(20000, 600, 86400.0), // outside DS1 indices
        ];
        agg.accumulate_dataset(&rows).unwrap();
        let out = agg.finalize().unwrap();
        assert!((out.natural_kg_days - 0.56).abs() < 1e-10);
        assert!((out.enriched_kg_days - 2.0 * 0.979).abs() < 1e-10);
        assert!(!out.per_channel.contains_key(&598));

        let (enr_y, nat_y) = grand_totals_kg_years([&out, &out]);
        assert!((enr_y - 4.0 * 0.979 / 365.25).abs() < 1e-12);
        assert!((nat_y - 1.12 / 365.25).abs() < 1e-12);
    }

    #[test]
    fn channels_without_resolved_coverage_are_never_counted_good() {
        let ctx = AnalysisContext::sample();
        let ds = DatasetId::Numeric(1);
        let excl = ctx.resolver().psa_cut_runs(ds, CutKind::Combined).unwrap();
        assert!(!excl.has_channel(1106));
        let bursts = BurstList::default();

        // 1106 sits in module 2, which DS1 does not read out
        let rows = [lt(9900, 600, 86400.0), lt(9900, 1106, 86400.0)];
        let mut agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        agg.accumulate_dataset(&rows).unwrap();
        assert!(!agg.totals().contains_key(&1106));
        let t600 = agg.totals()[&600];
        assert!((t600.raw - 0.979).abs() < 1e-10);
        assert!((t600.psa_rejected - 0.979).abs() < 1e-10);
        assert!(t600.net().abs() < 1e-10);

        // exclusions from another pass that never resolved channel 600
        let stale = RunExclusions(BTreeMap::from([(592, vec![])]));
        let mut agg = ExposureAggregator::new(&ctx, ds, &stale, &bursts);
        assert!(matches!(
            agg.accumulate_dataset(&rows),
            Err(ExpoError::UnresolvedCoverage { channel: 600, .. })
        ));
        assert!(agg.totals().is_empty());
    }

    #[test]
    fn summary_cross_check() {
        let mut s = LivetimeSummary::default();
        s.per_bkg.insert(592, vec![1.0, 0.5]);
        s.summary.insert(592, SummaryRow { exposure: 1.5, active_mass: 0.56 });
        assert!(check_livetime_summary(&s, 1e-3).is_ok());

        s.summary.insert(592, SummaryRow { exposure: 1.7, active_mass: 0.56 });
        assert!(matches!(
            check_livetime_summary(&s, 1e-3),
            Err(ExpoError::ExposureMismatch { channel: 592, .. })
        ));

        s.summary.clear();
        assert!(check_livetime_summary(&s, 1e-3).is_err());
        s.per_bkg.insert(592, vec![0.0]);
        assert!(check_livetime_summary(&s, 1e-3).unwrap().is_empty());
    }

    #[test]
    fn turn_on_shapes() {
        assert!((trigger_turn_on(1.0, 1.0, 0.2) - 0.5).abs() < 1e-10);
        assert!(trigger_turn_on(3.0, 1.0, 0.2) > 0.999);
        let p = SlopeEfficiency { amp: 0.9, c: 2.0, loc: 0.0, scale: 1.0 };
        assert_eq!(weibull_turn_on(0.0, &p), 0.0);
        assert!((weibull_turn_on(1.0, &p) - 0.9 * (1.0 - (-1.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn grid_and_normalization() {
        let g = EnergyGrid::default();
        assert_eq!(g.len(), 5000);
        assert_eq!(g.points()[1], 0.01);
        let n = normalized(&[0.0, 2.0, 4.0]);
        assert_eq!(n, vec![0.0, 0.5, 1.0]);
        assert_eq!(normalized(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn efficiency_is_exposure_weighted_sum() {
        let ctx = AnalysisContext::sample();
        let ds = DatasetId::Numeric(1);
        let excl = ctx.resolver().psa_cut_runs(ds, CutKind::Combined).unwrap();
        let bursts = BurstList::default();
        let agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        let grid = EnergyGrid { lo: 0.0, hi: 10.0, step: 0.5 };
        let rows = [lt(9560, 600, 86400.0), lt(9420, 600, 86400.0)];
        let curves = agg.efficiency_curve(&grid, EfficiencyMode::Trigger, &rows).unwrap();

        // 600 covered over all of bkg 0: 2 days of 979 g; plateau ≈ 1.958 kg-d
        let c600 = &curves.per_channel[&600];
        assert_eq!(c600[0], 0.0);
        assert!((c600[19] - 1.958).abs() < 1e-6);
        assert!((curves.enriched_kg_days - 1.958).abs() < 1e-10);
        assert_eq!(curves.enriched, *c600);
        assert!(curves.natural.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn all_mode_requires_slope_efficiency() {
        let ctx = AnalysisContext::sample();
        let ds = DatasetId::Numeric(1);
        let excl = RunExclusions::default();
        let bursts = BurstList::default();
        let agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        let rows = [lt(9560, 600, 86400.0)];
        let err = agg.efficiency_curve(&EnergyGrid::default(), EfficiencyMode::All, &rows);
        assert!(matches!(err, Err(ExpoError::MalformedRecord { .. })));
    }
}
