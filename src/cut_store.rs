//! Persisted cut-parameter records.
//!
//! The store is a JSON document of `{"key": name, "vals": {"<int>": value}}`
//! entries, either as a bare list or in the single-table layout
//! `{"_default": {"1": entry, ...}}`. Saving keeps whichever layout was read.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::data::model::{BkgIdx, CalIdx, Channel, Cpd};
use crate::error::{ExpoError, Result};

/// Record holding the per-CPD slope-cut efficiency parameters.
pub const SLOPE_EFFICIENCY_KEY: &str = "fitSlo_cpd_eff";

pub fn threshold_key(ds: u8, bkg_idx: BkgIdx, sub_idx: usize) -> String {
    format!("thresh_ds{ds}_bkg{bkg_idx}_sub{sub_idx}")
}

pub fn slope_key(cal_key: &str, cal_idx: CalIdx) -> String {
    format!("fitSlo_{cal_key}_idx{cal_idx}_m2s238")
}

pub fn rise_key(cal_key: &str, cal_idx: CalIdx) -> String {
    format!("riseNoise_{cal_key}_ci{cal_idx}_pol")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutRecord {
    pub key: String,
    pub vals: BTreeMap<String, JsonValue>,
}

impl CutRecord {
    pub fn new(key: impl Into<String>, vals: BTreeMap<u32, JsonValue>) -> Self {
        CutRecord {
            key: key.into(),
            vals: vals.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    /// Values keyed by their integer key, in numeric order.
    pub fn values(&self) -> Result<BTreeMap<u32, &JsonValue>> {
        self.vals
            .iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<u32>()
                    .map(|k| (k, v))
                    .map_err(|_| self.malformed(format!("non-integer key '{k}'")))
            })
            .collect()
    }

    fn malformed(&self, reason: String) -> ExpoError {
        ExpoError::MalformedRecord {
            key: self.key.clone(),
            reason,
        }
    }

    /// Numeric array stored under `k`; `None` for a JSON null.
    fn numbers(&self, k: u32, v: &JsonValue, min_len: usize) -> Result<Option<Vec<f64>>> {
        if v.is_null() {
            return Ok(None);
        }
        let arr = v
            .as_array()
            .ok_or_else(|| self.malformed(format!("entry {k} is not an array")))?;
        if arr.len() < min_len {
            return Err(self.malformed(format!(
                "entry {k} has {} values, expected {min_len}",
                arr.len()
            )));
        }
        arr.iter()
            .map(|x| match x {
                JsonValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
                _ => x
                    .as_f64()
                    .ok_or_else(|| self.malformed(format!("entry {k} holds non-numeric {x}"))),
            })
            .collect::<Result<Vec<f64>>>()
            .map(Some)
    }

    fn typed<T>(&self, min_len: usize, build: impl Fn(&[f64]) -> T) -> Result<BTreeMap<u32, Option<T>>> {
        let mut out = BTreeMap::new();
        for (k, v) in self.values()? {
            let parsed = self.numbers(k, v, min_len)?;
            out.insert(k, parsed.as_deref().map(&build));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

/// Trigger threshold fit for one channel: `[mu, sigma, isBad]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdParams {
    pub mu: f64,
    pub sigma: f64,
    pub is_bad: bool,
}

impl ThresholdParams {
    /// Energy above which the channel is considered fully triggered.
    pub fn cut_energy(&self) -> f64 {
        self.mu + crate::config::THRESHOLD_SIGMAS * self.sigma
    }
}

/// Pulse-shape slope cut for one channel: `[cut, fs200, nBin]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlopeParams {
    pub cut: f64,
    pub fs200: f64,
    pub n_bin: f64,
}

impl SlopeParams {
    /// A failed tuning is stored as `cut <= 0`.
    pub fn is_valid(&self) -> bool {
        self.cut > 0.0
    }
}

/// Rise-noise cut for one channel: `[a, b, c99, c, fitPass]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiseParams {
    pub a: f64,
    pub b: f64,
    pub c99: f64,
    pub c: f64,
    pub fit_pass: bool,
}

/// Weibull turn-on of the slope cut for one detector: `[_, _, amp, c, loc, scale]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlopeEfficiency {
    pub amp: f64,
    pub c: f64,
    pub loc: f64,
    pub scale: f64,
}

// ---------------------------------------------------------------------------
// CutStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Layout {
    #[default]
    List,
    Table,
}

const TABLE_NAME: &str = "_default";

/// Result of [`CutStore::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    /// A record with identical values already exists.
    Unchanged,
    /// A different record exists and `force` was not given; nothing changed.
    Conflict,
    Updated,
}

#[derive(Debug, Clone, Default)]
pub struct CutStore {
    path: Option<PathBuf>,
    layout: Layout,
    records: Vec<CutRecord>,
}

impl CutStore {
    pub fn from_records(records: Vec<CutRecord>) -> Self {
        CutStore {
            path: None,
            layout: Layout::List,
            records,
        }
    }

    /// Open a store file; a missing file is an empty store that will be
    /// created on the first [`save`](Self::save).
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Cut store {} does not exist yet, starting empty", path.display());
            return Ok(CutStore {
                path: Some(path.to_path_buf()),
                ..CutStore::default()
            });
        }
        let text = fs::read_to_string(path)?;
        let mut store = Self::parse(&text)?;
        store.path = Some(path.to_path_buf());
        debug!("Loaded {} cut records from {}", store.records.len(), path.display());
        Ok(store)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let root: JsonValue = serde_json::from_str(text)?;
        let (layout, records) = match root {
            JsonValue::Array(_) => (Layout::List, serde_json::from_value(root)?),
            JsonValue::Object(mut tables) => {
                let table = tables.remove(TABLE_NAME).unwrap_or(JsonValue::Object(Default::default()));
                let by_id: BTreeMap<String, CutRecord> = serde_json::from_value(table)?;
                let mut ordered: Vec<(u64, CutRecord)> = by_id
                    .into_iter()
                    .map(|(id, rec)| (id.parse().unwrap_or(u64::MAX), rec))
                    .collect();
                ordered.sort_by_key(|(id, _)| *id);
                (Layout::Table, ordered.into_iter().map(|(_, r)| r).collect())
            }
            _ => {
                return Err(ExpoError::MalformedRecord {
                    key: "<store>".into(),
                    reason: "expected a list or a table object".into(),
                })
            }
        };
        Ok(CutStore {
            path: None,
            layout,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.key.as_str())
    }

    /// Exact-key lookup. More than one match is reported, never resolved.
    pub fn get(&self, key: &str) -> Result<Option<&CutRecord>> {
        let mut found = self.records.iter().filter(|r| r.key == key);
        let first = found.next();
        if found.next().is_some() {
            warn!("Found multiple records for key: {key}. Need to do some cleanup!");
            return Err(ExpoError::AmbiguousRecord(key.to_string()));
        }
        Ok(first)
    }

    /// Insert a new record, or replace a differing one when `force` is set.
    pub fn set(&mut self, record: CutRecord, force: bool) -> Result<SetOutcome> {
        let matches: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.key == record.key)
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [] => {
                debug!("Record '{}' doesn't exist, adding it", record.key);
                self.records.push(record);
                Ok(SetOutcome::Inserted)
            }
            [i] if self.records[*i].vals == record.vals => Ok(SetOutcome::Unchanged),
            [i] => {
                if !force {
                    warn!(
                        "An old version of record '{}' exists and does not match the new one",
                        record.key
                    );
                    return Ok(SetOutcome::Conflict);
                }
                info!("Updating record: {}", record.key);
                self.records[*i] = record;
                Ok(SetOutcome::Updated)
            }
            _ => Err(ExpoError::AmbiguousRecord(record.key)),
        }
    }

    /// Write back to the file the store was opened from.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Err(ExpoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cut store has no backing file",
            ))),
        }
    }

    /// Atomic write: serialize to a sibling temp file, then rename over `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let doc = match self.layout {
            Layout::List => serde_json::to_value(&self.records)?,
            Layout::Table => {
                let table: serde_json::Map<String, JsonValue> = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| Ok(((i + 1).to_string(), serde_json::to_value(r)?)))
                    .collect::<Result<_>>()?;
                let mut root = serde_json::Map::new();
                root.insert(TABLE_NAME.to_string(), JsonValue::Object(table));
                JsonValue::Object(root)
            }
        };

        let tmp_path = path.with_extension("json.tmp");
        let write_result = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            serde_json::to_writer(&mut file, &doc)?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            ExpoError::Io(e)
        })
    }

    // -- typed views --

    /// Threshold fits of one background sub-range, `None` when no record exists.
    pub fn thresholds(
        &self,
        ds: u8,
        bkg_idx: BkgIdx,
        sub_idx: usize,
    ) -> Result<Option<BTreeMap<Channel, ThresholdParams>>> {
        let Some(rec) = self.get(&threshold_key(ds, bkg_idx, sub_idx))? else {
            return Ok(None);
        };
        let typed = rec.typed(3, |v| ThresholdParams {
            mu: v[0],
            sigma: v[1],
            is_bad: v[2] != 0.0,
        })?;
        Ok(Some(typed.into_iter().filter_map(|(ch, p)| Some((ch, p?))).collect()))
    }

    pub fn slope_cuts(&self, cal_key: &str, cal_idx: CalIdx) -> Result<Option<BTreeMap<Channel, SlopeParams>>> {
        let Some(rec) = self.get(&slope_key(cal_key, cal_idx))? else {
            return Ok(None);
        };
        let typed = rec.typed(1, |v| SlopeParams {
            cut: v[0],
            fs200: v.get(1).copied().unwrap_or(-1.0),
            n_bin: v.get(2).copied().unwrap_or(-1.0),
        })?;
        Ok(Some(typed.into_iter().filter_map(|(ch, p)| Some((ch, p?))).collect()))
    }

    pub fn rise_cuts(&self, cal_key: &str, cal_idx: CalIdx) -> Result<Option<BTreeMap<Channel, RiseParams>>> {
        let Some(rec) = self.get(&rise_key(cal_key, cal_idx))? else {
            return Ok(None);
        };
        let typed = rec.typed(5, |v| RiseParams {
            a: v[0],
            b: v[1],
            c99: v[2],
            c: v[3],
            fit_pass: v[4] != 0.0,
        })?;
        Ok(Some(typed.into_iter().filter_map(|(ch, p)| Some((ch, p?))).collect()))
    }

    /// Per-detector slope-cut efficiency, empty when the record is absent.
    pub fn slope_efficiencies(&self) -> Result<BTreeMap<Cpd, SlopeEfficiency>> {
        let Some(rec) = self.get(SLOPE_EFFICIENCY_KEY)? else {
            return Ok(BTreeMap::new());
        };
        let typed = rec.typed(6, |v| SlopeEfficiency {
            amp: v[2],
            c: v[3],
            loc: v[4],
            scale: v[5],
        })?;
        let mut out = BTreeMap::new();
        for (cpd, p) in typed {
            let cpd = u16::try_from(cpd).map_err(|_| rec.malformed(format!("CPD {cpd} out of range")))?;
            if let Some(p) = p {
                out.insert(Cpd(cpd), p);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(key: &str, vals: JsonValue) -> CutRecord {
        serde_json::from_value(json!({ "key": key, "vals": vals })).unwrap()
    }

    #[test]
    fn get_sorts_integer_keys_numerically() {
        let r = rec("x", json!({"10": [1], "9": [2], "100": [3]}));
        let keys: Vec<u32> = r.values().unwrap().keys().copied().collect();
        assert_eq!(keys, vec![9, 10, 100]);
        let bad = rec("y", json!({"ch1": [1]}));
        assert!(matches!(bad.values(), Err(ExpoError::MalformedRecord { .. })));
    }

    #[test]
    fn duplicate_keys_are_ambiguous() {
        let store = CutStore::from_records(vec![rec("a", json!({})), rec("a", json!({"1": 1}))]);
        assert!(matches!(store.get("a"), Err(ExpoError::AmbiguousRecord(_))));
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn set_insert_unchanged_conflict_update() {
        let mut store = CutStore::default();
        let v1 = rec("k", json!({"1": [1.0, 2.0, 0]}));
        let v2 = rec("k", json!({"1": [1.5, 2.0, 0]}));
        assert_eq!(store.set(v1.clone(), false).unwrap(), SetOutcome::Inserted);
        assert_eq!(store.set(v1.clone(), false).unwrap(), SetOutcome::Unchanged);
        assert_eq!(store.set(v2.clone(), false).unwrap(), SetOutcome::Conflict);
        assert_eq!(store.get("k").unwrap(), Some(&v1));
        assert_eq!(store.set(v2.clone(), true).unwrap(), SetOutcome::Updated);
        assert_eq!(store.get("k").unwrap(), Some(&v2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn typed_threshold_view() {
        let store = CutStore::from_records(vec![rec(
            &threshold_key(1, 3, 0),
            json!({"592": [0.9, 0.1, 0], "600": [1.0, 0.2, 1], "610": null}),
        )]);
        let th = store.thresholds(1, 3, 0).unwrap().unwrap();
        assert_eq!(th.len(), 2);
        assert!(!th[&592].is_bad);
        assert!(th[&600].is_bad);
        assert!((th[&592].cut_energy() - 1.2).abs() < 1e-10);
        assert!(store.thresholds(1, 3, 1).unwrap().is_none());
    }

    #[test]
    fn typed_psa_views() {
        let store = CutStore::from_records(vec![
            rec(&slope_key("ds1_m1", 0), json!({"592": [12.5, 30.0, 8], "600": [-1, -1, -1]})),
            rec(
                &rise_key("ds1_m1", 0),
                json!({"592": [0.001, 0.01, 2.0, 1.5, true], "600": [0, 0, 0, 0, false]}),
            ),
        ]);
        let fs = store.slope_cuts("ds1_m1", 0).unwrap().unwrap();
        assert!(fs[&592].is_valid());
        assert!(!fs[&600].is_valid());
        let rn = store.rise_cuts("ds1_m1", 0).unwrap().unwrap();
        assert!(rn[&592].fit_pass);
        assert!(!rn[&600].fit_pass);
    }

    #[test]
    fn short_arrays_are_malformed() {
        let store = CutStore::from_records(vec![rec(&rise_key("ds1_m1", 0), json!({"592": [1, 2]}))]);
        assert!(matches!(
            store.rise_cuts("ds1_m1", 0),
            Err(ExpoError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn save_round_trips_both_layouts() {
        let dir = tempfile::tempdir().unwrap();

        let list_path = dir.path().join("list.json");
        let mut store = CutStore::open(&list_path).unwrap();
        assert!(store.is_empty());
        store.set(rec("a", json!({"1": [1, 2]})), false).unwrap();
        store.save().unwrap();
        let back = CutStore::open(&list_path).unwrap();
        assert_eq!(back.keys().collect::<Vec<_>>(), vec!["a"]);
        assert!(!dir.path().join("list.json.tmp").exists());

        let table_path = dir.path().join("table.json");
        fs::write(
            &table_path,
            r#"{"_default": {"2": {"key": "b", "vals": {}}, "1": {"key": "a", "vals": {}}}}"#,
        )
        .unwrap();
        let store = CutStore::open(&table_path).unwrap();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        store.save().unwrap();
        let text = fs::read_to_string(&table_path).unwrap();
        assert!(text.starts_with("{\"_default\""));
    }
}
