//! Run-number ↔ dataset / background-index / calibration-index mapping.
//!
//! Background and calibration periods are two independent partitions of the
//! run number line. A background index may span several calibration
//! indices and vice versa; callers intersect them through the lookups here.

use std::collections::BTreeMap;
use std::str::FromStr;

use log::warn;

use crate::data::model::{BkgIdx, CalIdx, DatasetId, Module, RunInterval, RunNumber};
use crate::error::{ExpoError, Result};

/// `{ds: {bkgIdx: [intervals]}}`
pub type BkgTable = BTreeMap<u8, BTreeMap<BkgIdx, Vec<RunInterval>>>;
/// `{calKey: {calIdx: entry}}`
pub type CalTable = BTreeMap<String, BTreeMap<CalIdx, CalEntry>>;
/// `{key: {idx: [runLo, runHi]}}`
pub type SpecialTable = BTreeMap<String, BTreeMap<u32, RunInterval>>;

/// Dataset-level run bounds. DS6 is open-ended.
pub const DATASET_BOUNDS: [(u8, RunInterval); 7] = [
    (0, RunInterval { lo: 2571, hi: 7614 }),
    (1, RunInterval { lo: 9407, hi: 14502 }),
    (2, RunInterval { lo: 14699, hi: 15892 }),
    (3, RunInterval { lo: 16797, hi: 18589 }),
    (4, RunInterval { lo: 60000791, hi: 60002394 }),
    (5, RunInterval { lo: 18623, hi: 25508 }),
    (6, RunInterval { lo: 25672, hi: 100000 }),
];

/// Special (non-background, non-calibration) runs with no data files.
const NO_FILE_RUNS: [RunNumber; 18] = [
    6936, 6937, 6940, 6942, 6944, 6965, 6968, 6969, 6974, 6977, 7224, 7267, 7268, 7269, 7270, 7271,
    7272, 13168,
];

/// One calibration index: the calibration runs themselves and the
/// background-run window they apply to.
#[derive(Debug, Clone, PartialEq)]
pub struct CalEntry {
    pub runs: Vec<RunInterval>,
    pub coverage: RunInterval,
}

/// One row of a sub-range table, produced by threshold or HV change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRangeRow {
    pub ds: DatasetId,
    pub sub: BkgIdx,
    pub runs: RunInterval,
    pub n_runs: u32,
}

/// Which change-detection table subdivides a background index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubRangeSource {
    #[default]
    Threshold,
    HighVoltage,
}

impl FromStr for SubRangeSource {
    type Err = ExpoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "thr" => Ok(SubRangeSource::Threshold),
            "hv" => Ok(SubRangeSource::HighVoltage),
            other => Err(ExpoError::UnknownOption {
                kind: "sub-range",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RangeIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RangeIndex {
    bkg: BkgTable,
    cal: CalTable,
    /// Per cal key, the `hi` edge of each calibration window, in index order.
    cal_hi: BTreeMap<String, Vec<RunNumber>>,
    special: SpecialTable,
    thr_sub: Vec<SubRangeRow>,
    hv_sub: Vec<SubRangeRow>,
}

impl RangeIndex {
    /// Build the index, checking the table invariants:
    /// * background intervals are not inverted and, once sorted within each
    ///   index, do not overlap across the dataset,
    /// * calibration indices are contiguous from 0 and their windows are
    ///   non-inverted and strictly increasing (window *n* ends before *n+1* begins).
    pub fn new(
        mut bkg: BkgTable,
        cal: CalTable,
        special: SpecialTable,
        thr_sub: Vec<SubRangeRow>,
        hv_sub: Vec<SubRangeRow>,
    ) -> Result<Self> {
        for (ds, per_ds) in bkg.iter_mut() {
            for (idx, ivs) in per_ds.iter_mut() {
                if let Some(iv) = ivs.iter().find(|iv| iv.lo > iv.hi) {
                    return Err(ExpoError::InvalidRunTable(format!(
                        "DS{ds} bkgIdx {idx}: inverted interval {} - {}",
                        iv.lo, iv.hi
                    )));
                }
                ivs.sort();
            }
            let mut all: Vec<RunInterval> = per_ds.values().flatten().copied().collect();
            all.sort();
            for w in all.windows(2) {
                if w[1].lo <= w[0].hi {
                    return Err(ExpoError::InvalidRunTable(format!(
                        "DS{ds}: background intervals {} and {} overlap",
                        w[0], w[1]
                    )));
                }
            }
        }

        let mut cal_hi = BTreeMap::new();
        for (key, entries) in &cal {
            let mut his = Vec::with_capacity(entries.len());
            let mut prev: Option<&CalEntry> = None;
            for (pos, (idx, entry)) in entries.iter().enumerate() {
                if *idx as usize != pos {
                    return Err(ExpoError::InvalidRunTable(format!(
                        "{key}: calibration indices are not contiguous at {idx}"
                    )));
                }
                if entry.coverage.lo > entry.coverage.hi {
                    return Err(ExpoError::InvalidRunTable(format!(
                        "{key}: window {idx} ({}) is inverted",
                        entry.coverage
                    )));
                }
                if let Some(p) = prev {
                    if entry.coverage.lo <= p.coverage.hi {
                        return Err(ExpoError::InvalidRunTable(format!(
                            "{key}: window {idx} ({}) does not start after window {} ({})",
                            entry.coverage,
                            idx - 1,
                            p.coverage
                        )));
                    }
                }
                his.push(entry.coverage.hi);
                prev = Some(entry);
            }
            cal_hi.insert(key.clone(), his);
        }

        Ok(RangeIndex {
            bkg,
            cal,
            cal_hi,
            special,
            thr_sub,
            hv_sub,
        })
    }

    // -- background indices --

    /// `{ds: last bkgIdx}` for every dataset in the table.
    pub fn dataset_map(&self) -> BTreeMap<u8, BkgIdx> {
        self.bkg
            .iter()
            .filter_map(|(ds, per_ds)| per_ds.keys().next_back().map(|last| (*ds, *last)))
            .collect()
    }

    pub fn dataset_bounds(ds: u8) -> Option<RunInterval> {
        DATASET_BOUNDS.iter().find(|(n, _)| *n == ds).map(|(_, iv)| *iv)
    }

    /// Background interval table for a dataset; lettered partitions of DS5
    /// return their slice of the index range.
    pub fn ranges_for_dataset(&self, ds: DatasetId) -> Result<BTreeMap<BkgIdx, &[RunInterval]>> {
        let per_ds = self
            .bkg
            .get(&ds.number())
            .ok_or_else(|| ExpoError::UnknownDataset(ds.to_string()))?;
        let slice = ds.bkg_slice();
        Ok(per_ds
            .iter()
            .filter(|(idx, _)| slice.as_ref().map_or(true, |s| s.contains(*idx)))
            .map(|(idx, ivs)| (*idx, ivs.as_slice()))
            .collect())
    }

    /// Inclusive range of background indices processed for `ds`.
    pub fn bkg_index_span(&self, ds: DatasetId) -> Result<Vec<BkgIdx>> {
        Ok(self.ranges_for_dataset(ds)?.keys().copied().collect())
    }

    /// First and last run of a background index.
    pub fn bkg_span(&self, ds: DatasetId, bkg_idx: BkgIdx) -> Result<RunInterval> {
        let ivs = self.intervals(ds, bkg_idx)?;
        match (ivs.first(), ivs.last()) {
            (Some(first), Some(last)) => Ok(RunInterval::new(first.lo, last.hi)),
            _ => Err(ExpoError::UnknownBkgIdx { ds, bkg_idx }),
        }
    }

    fn intervals(&self, ds: DatasetId, bkg_idx: BkgIdx) -> Result<&[RunInterval]> {
        self.bkg
            .get(&ds.number())
            .and_then(|per_ds| per_ds.get(&bkg_idx))
            .map(Vec::as_slice)
            .ok_or(ExpoError::UnknownBkgIdx { ds, bkg_idx })
    }

    /// Every run of the dataset (or of one background index), in table order.
    pub fn run_list(&self, ds: DatasetId, bkg_idx: Option<BkgIdx>) -> Result<Vec<RunNumber>> {
        let mut runs = Vec::new();
        match bkg_idx {
            Some(idx) => {
                for iv in self.intervals(ds, idx)? {
                    runs.extend(iv.runs());
                }
            }
            None => {
                for ivs in self.ranges_for_dataset(ds)?.values() {
                    for iv in ivs.iter() {
                        runs.extend(iv.runs());
                    }
                }
            }
        }
        Ok(runs)
    }

    /// Dataset containing `run`. Linear scan over [`DATASET_BOUNDS`]; if
    /// bounds ever overlapped, the last matching dataset would win.
    pub fn dataset_for_run(run: RunNumber) -> Result<u8> {
        let mut found = None;
        for (ds, iv) in DATASET_BOUNDS.iter() {
            if iv.contains(run) {
                found = Some(*ds);
            }
        }
        found.ok_or(ExpoError::RunOutOfRange(run))
    }

    /// Background index of `run` within dataset `ds`, or `None` if uncovered.
    /// A lettered partition only sees its own slice of indices.
    pub fn bkg_idx_for_run(&self, ds: DatasetId, run: RunNumber) -> Option<BkgIdx> {
        let slice = ds.bkg_slice();
        self.bkg
            .get(&ds.number())?
            .iter()
            .filter(|(idx, _)| slice.as_ref().map_or(true, |s| s.contains(*idx)))
            .find_map(|(idx, ivs)| ivs.iter().any(|iv| iv.contains(run)).then_some(*idx))
    }

    /// Runs inside the dataset bounds not covered by any background index.
    pub fn coverage_gaps(&self, ds: u8) -> Vec<RunInterval> {
        let Some(per_ds) = self.bkg.get(&ds) else {
            return Vec::new();
        };
        let mut all: Vec<RunInterval> = per_ds.values().flatten().copied().collect();
        all.sort();
        let mut gaps = Vec::new();
        for w in all.windows(2) {
            if w[1].lo > w[0].hi + 1 {
                gaps.push(RunInterval::new(w[0].hi + 1, w[1].lo - 1));
            }
        }
        gaps
    }

    /// Finer windows of a background index from change detection; falls back
    /// to the whole background span when the table has no rows for it.
    ///
    /// Rows are matched on the dataset number, so `5`, `5A`, `5B` and `5C`
    /// rows are interchangeable (background indices are unique within DS5).
    pub fn sub_ranges(
        &self,
        ds: DatasetId,
        bkg_idx: BkgIdx,
        source: SubRangeSource,
    ) -> Result<Vec<RunInterval>> {
        let found: Vec<RunInterval> = self
            .sub_range_rows(ds, source)
            .filter(|row| row.sub == bkg_idx)
            .map(|row| row.runs)
            .collect();
        if found.is_empty() {
            return Ok(vec![self.bkg_span(ds, bkg_idx)?]);
        }
        Ok(found)
    }

    pub fn sub_range_rows(
        &self,
        ds: DatasetId,
        source: SubRangeSource,
    ) -> impl Iterator<Item = &SubRangeRow> {
        let rows = match source {
            SubRangeSource::Threshold => &self.thr_sub,
            SubRangeSource::HighVoltage => &self.hv_sub,
        };
        rows.iter().filter(move |row| row.ds.number() == ds.number())
    }

    // -- calibration indices --

    /// All calibration keys, or those belonging to dataset `ds`.
    pub fn cal_keys(&self, ds: Option<u8>) -> Vec<&str> {
        self.cal
            .keys()
            .map(String::as_str)
            .filter(|k| ds.map_or(true, |n| k.contains(&format!("ds{n}"))))
            .collect()
    }

    pub fn has_cal_key(&self, key: &str) -> bool {
        self.cal.contains_key(key)
    }

    fn cal_entries(&self, key: &str) -> Result<&BTreeMap<CalIdx, CalEntry>> {
        self.cal
            .get(key)
            .ok_or_else(|| ExpoError::UnknownCalKey(key.to_string()))
    }

    fn cal_entry(&self, key: &str, idx: CalIdx) -> Result<&CalEntry> {
        self.cal_entries(key)?
            .get(&idx)
            .ok_or_else(|| ExpoError::UnknownCalIdx {
                key: key.to_string(),
                idx,
            })
    }

    /// Number of calibration indices under `key`.
    pub fn cal_index_count(&self, key: &str) -> Result<usize> {
        Ok(self.cal_entries(key)?.len())
    }

    /// Number of calibration indices for a dataset/module, 0 if none.
    pub fn cal_index_count_for(&self, ds: u8, module: Module) -> usize {
        let tag = format!("m{}", module.number());
        self.cal_keys(Some(ds))
            .into_iter()
            .find(|k| k.contains(&tag))
            .and_then(|k| self.cal_index_count(k).ok())
            .unwrap_or(0)
    }

    /// Calibration index whose window contains `run`.
    ///
    /// Binary-searches the window upper edges, then verifies the run lies in
    /// that window (runs between windows resolve to `None`). An unknown key is
    /// an error; a miss is logged and returned as `None`.
    pub fn cal_idx_for_run(&self, key: &str, run: RunNumber) -> Result<Option<CalIdx>> {
        let his = self
            .cal_hi
            .get(key)
            .ok_or_else(|| ExpoError::UnknownCalKey(key.to_string()))?;
        let pos = his.partition_point(|&hi| hi < run);
        let Some(entry) = self.cal.get(key).and_then(|e| e.get(&(pos as CalIdx))) else {
            warn!("Run {run} out of range of key {key}. calIdx was {pos}");
            return Ok(None);
        };
        if entry.coverage.contains(run) {
            Ok(Some(pos as CalIdx))
        } else {
            warn!(
                "Run {run} not found with key {key}, lo={} hi={}",
                entry.coverage.lo, entry.coverage.hi
            );
            Ok(None)
        }
    }

    /// Like [`cal_idx_for_run`](Self::cal_idx_for_run) but a miss is an error.
    pub fn require_cal_idx(&self, key: &str, run: RunNumber) -> Result<CalIdx> {
        self.cal_idx_for_run(key, run)?
            .ok_or_else(|| ExpoError::CalibrationGap {
                key: key.to_string(),
                run,
            })
    }

    /// Calibration runs of one index, optionally truncated to the first `limit`.
    pub fn cal_runs(&self, key: &str, idx: CalIdx, limit: Option<usize>) -> Result<Vec<RunNumber>> {
        let mut runs: Vec<RunNumber> = self
            .cal_entry(key, idx)?
            .runs
            .iter()
            .flat_map(|iv| iv.runs())
            .collect();
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    /// Background-run window covered by one calibration index.
    pub fn cal_coverage(&self, key: &str, idx: CalIdx) -> Result<RunInterval> {
        Ok(self.cal_entry(key, idx)?.coverage)
    }

    // -- special runs --

    pub fn special_keys(&self) -> impl Iterator<Item = &str> {
        self.special.keys().map(String::as_str)
    }

    pub fn special_index_count(&self, key: &str) -> usize {
        self.special.get(key).map_or(0, BTreeMap::len)
    }

    /// Special runs under `key` (one index or all), minus runs with no files.
    pub fn special_runs(&self, key: &str, idx: Option<u32>) -> Result<Vec<RunNumber>> {
        let per_key = self
            .special
            .get(key)
            .ok_or_else(|| ExpoError::UnknownCalKey(key.to_string()))?;
        let windows: Vec<&RunInterval> = match idx {
            Some(i) => vec![per_key.get(&i).ok_or_else(|| ExpoError::UnknownCalIdx {
                key: key.to_string(),
                idx: i,
            })?],
            None => per_key.values().collect(),
        };
        Ok(windows
            .into_iter()
            .flat_map(|iv| iv.runs())
            .filter(|r| !NO_FILE_RUNS.contains(r))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::model::Partition;

    pub(crate) fn iv(lo: RunNumber, hi: RunNumber) -> RunInterval {
        RunInterval::new(lo, hi)
    }

    pub(crate) fn sample_index() -> RangeIndex {
        let mut bkg = BkgTable::new();
        bkg.insert(
            1,
            BTreeMap::from([
                (0, vec![iv(9407, 9500), iv(9502, 9600)]),
                (1, vec![iv(9501, 9501), iv(9601, 9800)]),
                (2, vec![iv(9801, 14502)]),
            ]),
        );
        let mut cal = CalTable::new();
        cal.insert(
            "ds1_m1".into(),
            BTreeMap::from([
                (0, CalEntry { runs: vec![iv(9410, 9412)], coverage: iv(9407, 9650) }),
                (1, CalEntry { runs: vec![iv(9700, 9701)], coverage: iv(9651, 9690) }),
                (2, CalEntry { runs: vec![iv(9800, 9803)], coverage: iv(9750, 14502) }),
            ]),
        );
        let mut special = SpecialTable::new();
        special.insert("extPulser".into(), BTreeMap::from([(0, iv(6935, 6938)), (1, iv(7000, 7001))]));
        let thr = vec![
            SubRangeRow { ds: DatasetId::Numeric(1), sub: 0, runs: iv(9407, 9550), n_runs: 0 },
            SubRangeRow { ds: DatasetId::Numeric(1), sub: 0, runs: iv(9551, 9600), n_runs: 0 },
        ];
        RangeIndex::new(bkg, cal, special, thr, Vec::new()).unwrap()
    }

    #[test]
    fn dataset_for_run_uses_bounds() {
        assert_eq!(RangeIndex::dataset_for_run(9407).unwrap(), 1);
        assert_eq!(RangeIndex::dataset_for_run(14502).unwrap(), 1);
        assert_eq!(RangeIndex::dataset_for_run(14699).unwrap(), 2);
        assert!(RangeIndex::dataset_for_run(14503).is_err());
        assert_eq!(RangeIndex::dataset_for_run(60000800).unwrap(), 4);
    }

    #[test]
    fn bkg_idx_lookup_round_trips() {
        let idx = sample_index();
        let ds = DatasetId::Numeric(1);
        for (b, ivs) in idx.ranges_for_dataset(ds).unwrap() {
            for iv in ivs {
                for run in iv.runs().step_by(37).chain([iv.hi]) {
                    assert_eq!(idx.bkg_idx_for_run(ds, run), Some(b), "run {run}");
                }
            }
        }
        assert_eq!(idx.bkg_idx_for_run(ds, 9406), None);
        assert_eq!(idx.bkg_idx_for_run(DatasetId::Numeric(3), 9500), None);
    }

    #[test]
    fn bkg_intervals_tile_the_dataset() {
        let idx = sample_index();
        assert!(idx.coverage_gaps(1).is_empty());
        let mut all: Vec<RunInterval> = idx
            .ranges_for_dataset(DatasetId::Numeric(1))
            .unwrap()
            .values()
            .flat_map(|v| v.iter().copied())
            .collect();
        all.sort();
        let bounds = RangeIndex::dataset_bounds(1).unwrap();
        assert_eq!(all.first().unwrap().lo, bounds.lo);
        assert_eq!(all.last().unwrap().hi, bounds.hi);
    }

    #[test]
    fn bkg_intervals_are_sorted_and_inverted_ones_rejected() {
        let mut bkg = BkgTable::new();
        bkg.insert(1, BTreeMap::from([(0, vec![iv(9502, 9600), iv(9407, 9500)])]));
        let idx = RangeIndex::new(bkg, CalTable::new(), SpecialTable::new(), vec![], vec![]).unwrap();
        let ds = DatasetId::Numeric(1);
        assert_eq!(idx.bkg_span(ds, 0).unwrap(), iv(9407, 9600));
        assert_eq!(idx.run_list(ds, Some(0)).unwrap()[0], 9407);

        let mut bkg = BkgTable::new();
        bkg.insert(1, BTreeMap::from([(0, vec![iv(9500, 9407)])]));
        let err = RangeIndex::new(bkg, CalTable::new(), SpecialTable::new(), vec![], vec![]);
        assert!(matches!(err, Err(ExpoError::InvalidRunTable(_))));
    }

    #[test]
    fn lettered_partition_sees_only_its_slice() {
        let mut bkg = BkgTable::new();
        bkg.insert(5, BTreeMap::from([(79, vec![iv(18623, 18700)]), (80, vec![iv(18701, 18800)])]));
        let idx = RangeIndex::new(bkg, CalTable::new(), SpecialTable::new(), vec![], vec![]).unwrap();
        let a = DatasetId::Lettered(5, Partition::A);
        let b = DatasetId::Lettered(5, Partition::B);
        assert_eq!(idx.bkg_idx_for_run(a, 18650), Some(79));
        assert_eq!(idx.bkg_idx_for_run(a, 18750), None);
        assert_eq!(idx.bkg_idx_for_run(b, 18750), Some(80));
        assert_eq!(idx.bkg_idx_for_run(DatasetId::Numeric(5), 18750), Some(80));
    }

    #[test]
    fn overlapping_bkg_intervals_are_rejected() {
        let mut bkg = BkgTable::new();
        bkg.insert(1, BTreeMap::from([(0, vec![iv(1, 10)]), (1, vec![iv(10, 20)])]));
        let err = RangeIndex::new(bkg, CalTable::new(), SpecialTable::new(), vec![], vec![]);
        assert!(matches!(err, Err(ExpoError::InvalidRunTable(_))));
    }

    #[test]
    fn cal_idx_found_and_gap_returns_none() {
        let idx = sample_index();
        assert_eq!(idx.cal_idx_for_run("ds1_m1", 9500).unwrap(), Some(0));
        assert_eq!(idx.cal_idx_for_run("ds1_m1", 9651).unwrap(), Some(1));
        // between window 1 (ends 9690) and window 2 (starts 9750)
        assert_eq!(idx.cal_idx_for_run("ds1_m1", 9700).unwrap(), None);
        assert_eq!(idx.cal_idx_for_run("ds1_m1", 20000).unwrap(), None);
        assert!(idx.cal_idx_for_run("ds9_m1", 9500).is_err());
        assert!(matches!(
            idx.require_cal_idx("ds1_m1", 9700),
            Err(ExpoError::CalibrationGap { .. })
        ));
    }

    #[test]
    fn cal_idx_is_monotonic_in_run() {
        let idx = sample_index();
        let mut last = 0;
        for run in 9407..=10000 {
            if let Some(c) = idx.cal_idx_for_run("ds1_m1", run).unwrap() {
                assert!(c >= last);
                last = c;
            }
        }
        assert_eq!(last, 2);
    }

    #[test]
    fn non_monotonic_cal_windows_are_rejected() {
        let mut cal = CalTable::new();
        cal.insert(
            "ds1_m1".into(),
            BTreeMap::from([
                (0, CalEntry { runs: vec![], coverage: iv(100, 200) }),
                (1, CalEntry { runs: vec![], coverage: iv(150, 300) }),
            ]),
        );
        assert!(RangeIndex::new(BkgTable::new(), cal, SpecialTable::new(), vec![], vec![]).is_err());
    }

    #[test]
    fn sub_ranges_fall_back_to_bkg_span() {
        let idx = sample_index();
        let ds = DatasetId::Numeric(1);
        assert_eq!(
            idx.sub_ranges(ds, 0, SubRangeSource::Threshold).unwrap(),
            vec![iv(9407, 9550), iv(9551, 9600)]
        );
        assert_eq!(
            idx.sub_ranges(ds, 1, SubRangeSource::Threshold).unwrap(),
            vec![iv(9501, 9800)]
        );
        assert_eq!(
            idx.sub_ranges(ds, 0, SubRangeSource::HighVoltage).unwrap(),
            vec![iv(9407, 9600)]
        );
    }

    #[test]
    fn lettered_partition_restricts_indices() {
        let mut bkg = BkgTable::new();
        bkg.insert(5, (0..=121).map(|i| (i, vec![iv(20000 + i * 10, 20009 + i * 10)])).collect());
        let idx = RangeIndex::new(bkg, CalTable::new(), SpecialTable::new(), vec![], vec![]).unwrap();
        let c = idx.bkg_index_span(DatasetId::Lettered(5, Partition::C)).unwrap();
        assert_eq!(c.first(), Some(&113));
        assert_eq!(c.last(), Some(&121));
        assert_eq!(idx.bkg_index_span(DatasetId::Lettered(5, Partition::A)).unwrap().len(), 80);
        assert_eq!(idx.dataset_map()[&5], 121);
    }

    #[test]
    fn cal_runs_and_special_runs() {
        let idx = sample_index();
        assert_eq!(idx.cal_runs("ds1_m1", 2, Some(2)).unwrap(), vec![9800, 9801]);
        assert_eq!(idx.cal_coverage("ds1_m1", 1).unwrap(), iv(9651, 9690));
        assert_eq!(idx.cal_index_count_for(1, Module::M1), 3);
        assert_eq!(idx.cal_index_count_for(1, Module::M2), 0);
        assert_eq!(idx.special_runs("extPulser", Some(0)).unwrap(), vec![6935, 6938]);
        assert_eq!(idx.special_runs("extPulser", None).unwrap().len(), 4);
    }
}
