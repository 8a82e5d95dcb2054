use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array, UInt32Array, UInt64Array};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::model::{
    BkgIdx, CalIdx, Channel, Cpd, DatasetId, EventRecord, LivetimeRecord, RunInterval, RunNumber,
};
use crate::channels::RunSettings;
use crate::range_index::{BkgTable, CalEntry, CalTable, SpecialTable, SubRangeRow};

// ---------------------------------------------------------------------------
// Run tables (hierarchical JSON)
// ---------------------------------------------------------------------------

/// Drop every top-level or second-level key containing `"note"`.
///
/// The run tables carry free-text annotations under keys like
/// `"note"` or `"note2"`; they are not part of the index.
pub fn scrub_notes(mut root: JsonValue) -> JsonValue {
    if let Some(top) = root.as_object_mut() {
        top.retain(|k, _| !k.contains("note"));
        for inner in top.values_mut() {
            if let Some(obj) = inner.as_object_mut() {
                obj.retain(|k, _| !k.contains("note"));
            }
        }
    }
    root
}

fn read_json(path: &Path) -> Result<JsonValue> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let root: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(scrub_notes(root))
}

/// Iterate `{outer: {inner: value}}` with both key levels parsed as integers.
fn nested_int_keys<'a>(
    root: &'a JsonValue,
    what: &str,
) -> Result<Vec<(&'a str, Vec<(u32, &'a JsonValue)>)>> {
    let top = root
        .as_object()
        .with_context(|| format!("{what}: expected top-level JSON object"))?;
    let mut out = Vec::with_capacity(top.len());
    for (outer, inner) in top {
        let obj = inner
            .as_object()
            .with_context(|| format!("{what}: entry '{outer}' is not an object"))?;
        let mut entries = Vec::with_capacity(obj.len());
        for (k, v) in obj {
            let idx: u32 = k
                .parse()
                .with_context(|| format!("{what}: key '{outer}/{k}' is not an integer"))?;
            entries.push((idx, v));
        }
        entries.sort_by_key(|(idx, _)| *idx);
        out.push((outer.as_str(), entries));
    }
    Ok(out)
}

fn json_runs(val: &JsonValue, ctx: &str) -> Result<Vec<RunNumber>> {
    let arr = val
        .as_array()
        .with_context(|| format!("{ctx}: expected an array of run numbers"))?;
    arr.iter()
        .enumerate()
        .map(|(j, v)| {
            v.as_u64()
                .and_then(|r| RunNumber::try_from(r).ok())
                .with_context(|| format!("{ctx}[{j}]: not a run number"))
        })
        .collect()
}

/// Pair up a flat `[lo1, hi1, lo2, hi2, ...]` list.
fn pair_runs(flat: &[RunNumber], ctx: &str) -> Result<Vec<RunInterval>> {
    if flat.len() % 2 != 0 {
        bail!("{ctx}: odd number of run boundaries ({})", flat.len());
    }
    let mut out = Vec::with_capacity(flat.len() / 2);
    for pair in flat.chunks_exact(2) {
        if pair[0] > pair[1] {
            bail!("{ctx}: inverted interval {} - {}", pair[0], pair[1]);
        }
        out.push(RunInterval::new(pair[0], pair[1]));
    }
    Ok(out)
}

/// Background run table: `{ds: {bkgIdx: [runLo1, runHi1, runLo2, runHi2, ...]}}`.
pub fn load_bkg_table(path: &Path) -> Result<BkgTable> {
    parse_bkg_table(&read_json(path)?)
}

pub fn parse_bkg_table(root: &JsonValue) -> Result<BkgTable> {
    let mut table = BkgTable::new();
    for (ds, entries) in nested_int_keys(root, "bkg table")? {
        let ds: u8 = ds
            .parse()
            .with_context(|| format!("bkg table: dataset key '{ds}' is not a number"))?;
        let mut per_ds = BTreeMap::new();
        for (bkg_idx, val) in entries {
            let ctx = format!("bkg table DS{ds} idx {bkg_idx}");
            let flat = json_runs(val, &ctx)?;
            per_ds.insert(bkg_idx as BkgIdx, pair_runs(&flat, &ctx)?);
        }
        table.insert(ds, per_ds);
    }
    Ok(table)
}

/// Calibration run table: `{calKey: {calIdx: [[calRuns...], covLo, covHi]}}`.
pub fn load_cal_table(path: &Path) -> Result<CalTable> {
    parse_cal_table(&read_json(path)?)
}

pub fn parse_cal_table(root: &JsonValue) -> Result<CalTable> {
    let mut table = CalTable::new();
    for (key, entries) in nested_int_keys(root, "cal table")? {
        let mut per_key = BTreeMap::new();
        for (cal_idx, val) in entries {
            let ctx = format!("cal table {key} idx {cal_idx}");
            let arr = val
                .as_array()
                .filter(|a| a.len() == 3)
                .with_context(|| format!("{ctx}: expected [[runs], covLo, covHi]"))?;
            let runs = pair_runs(&json_runs(&arr[0], &ctx)?, &ctx)?;
            let bounds = json_runs(&JsonValue::Array(arr[1..].to_vec()), &ctx)?;
            if bounds[0] > bounds[1] {
                bail!("{ctx}: coverage {} - {} is inverted", bounds[0], bounds[1]);
            }
            per_key.insert(
                cal_idx as CalIdx,
                CalEntry {
                    runs,
                    coverage: RunInterval::new(bounds[0], bounds[1]),
                },
            );
        }
        table.insert(key.to_string(), per_key);
    }
    Ok(table)
}

/// Special run table: `{key: {idx: [runLo, runHi]}}`.
pub fn load_special_table(path: &Path) -> Result<SpecialTable> {
    parse_special_table(&read_json(path)?)
}

pub fn parse_special_table(root: &JsonValue) -> Result<SpecialTable> {
    let mut table = SpecialTable::new();
    for (key, entries) in nested_int_keys(root, "special table")? {
        let mut per_key = BTreeMap::new();
        for (idx, val) in entries {
            let ctx = format!("special table {key} idx {idx}");
            let flat = json_runs(val, &ctx)?;
            if flat.len() != 2 {
                bail!("{ctx}: expected [runLo, runHi]");
            }
            per_key.insert(idx, RunInterval::new(flat[0], flat[1]));
        }
        table.insert(key.to_string(), per_key);
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Derived settings bundle
// ---------------------------------------------------------------------------

/// Settings bundle layout:
///
/// ```json
/// {
///   "hv":   { "1": { "111": [[9407, 1200], [9600, 1250]] } },
///   "th":   { "1": { "111": [[9407, 3.2]] } },
///   "ch":   { "1": { "111": [[9407, 598]] } },
///   "pmon": { "1": [644, 676] }
/// }
/// ```
#[derive(Debug, Deserialize)]
struct RawSettings {
    hv: BTreeMap<String, BTreeMap<String, Vec<(RunNumber, f64)>>>,
    th: BTreeMap<String, BTreeMap<String, Vec<(RunNumber, f64)>>>,
    ch: BTreeMap<String, BTreeMap<String, Vec<(RunNumber, Channel)>>>,
    #[serde(default)]
    pmon: BTreeMap<String, Vec<Channel>>,
}

pub fn load_settings(path: &Path) -> Result<RunSettings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings bundle {}", path.display()))?;
    parse_settings(&text)
}

pub fn parse_settings(text: &str) -> Result<RunSettings> {
    let raw: RawSettings = serde_json::from_str(text).context("parsing settings bundle")?;

    fn by_ds<T: Clone>(
        m: &BTreeMap<String, BTreeMap<String, Vec<(RunNumber, T)>>>,
        what: &str,
    ) -> Result<BTreeMap<u8, BTreeMap<Cpd, Vec<(RunNumber, T)>>>> {
        let mut out = BTreeMap::new();
        for (ds, dets) in m {
            let ds: u8 = ds
                .parse()
                .with_context(|| format!("{what}: dataset key '{ds}' is not a number"))?;
            let mut per_ds = BTreeMap::new();
            for (cpd, points) in dets {
                let cpd: Cpd = cpd
                    .parse()
                    .with_context(|| format!("{what}: bad detector position '{cpd}'"))?;
                per_ds.insert(cpd, points.clone());
            }
            out.insert(ds, per_ds);
        }
        Ok(out)
    }

    let mut pulser_monitors = BTreeMap::new();
    for (ds, chans) in &raw.pmon {
        let ds: u8 = ds
            .parse()
            .with_context(|| format!("pmon: dataset key '{ds}' is not a number"))?;
        pulser_monitors.insert(ds, chans.clone());
    }

    Ok(RunSettings {
        high_voltage: by_ds(&raw.hv, "hv")?,
        trap_threshold: by_ds(&raw.th, "th")?,
        channel: by_ds(&raw.ch, "ch")?,
        pulser_monitors,
    })
}

// ---------------------------------------------------------------------------
// Sub-range tables (threshold / HV change detection)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubRangeCsvRow {
    ds: String,
    sub: BkgIdx,
    run_lo: RunNumber,
    run_hi: RunNumber,
    #[serde(default)]
    n_runs: u32,
}

/// Load sub-range rows `(ds, sub, run_lo, run_hi, n_runs)` from `.csv` or `.json`.
pub fn load_sub_ranges(path: &Path) -> Result<Vec<SubRangeRow>> {
    let rows: Vec<SubRangeCsvRow> = match extension(path).as_str() {
        "csv" => {
            let mut reader = csv::Reader::from_path(path).context("opening sub-range CSV")?;
            reader
                .deserialize()
                .enumerate()
                .map(|(i, r)| r.with_context(|| format!("sub-range CSV row {i}")))
                .collect::<Result<_>>()?
        }
        "json" => {
            let text = std::fs::read_to_string(path).context("reading sub-range JSON")?;
            serde_json::from_str(&text).context("parsing sub-range JSON")?
        }
        other => bail!("Unsupported sub-range file extension: .{other}"),
    };

    rows.into_iter()
        .map(|r| {
            let ds: DatasetId = r.ds.parse().with_context(|| format!("sub-range dataset '{}'", r.ds))?;
            Ok(SubRangeRow {
                ds,
                sub: r.sub,
                runs: RunInterval::new(r.run_lo, r.run_hi),
                n_runs: r.n_runs,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Burst-cut list
// ---------------------------------------------------------------------------

/// One burst-cut entry: `(dsCode, cpd, bkgIdx)`, dsCode 50/51/52 for 5A/5B/5C.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct BurstRow {
    pub ds_code: u32,
    pub cpd: Cpd,
    pub bkg_idx: BkgIdx,
}

pub fn load_burst_list(path: &Path) -> Result<Vec<BurstRow>> {
    let mut reader = csv::Reader::from_path(path).context("opening burst list CSV")?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, r)| r.with_context(|| format!("burst list row {i}")))
        .collect()
}

// ---------------------------------------------------------------------------
// Livetime and event tables (CSV / Parquet)
// ---------------------------------------------------------------------------

/// Load livetime rows `(run, channel, livetime)`.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – numeric columns `run`, `channel`, `livetime`
/// * `.csv`     – same columns, header row required
pub fn load_livetime(path: &Path) -> Result<Vec<LivetimeRecord>> {
    match extension(path).as_str() {
        "parquet" | "pq" => {
            let mut out = Vec::new();
            for batch in read_parquet_batches(path)? {
                let run = numeric_column(&batch, "run")?;
                let channel = numeric_column(&batch, "channel")?;
                let live = numeric_column(&batch, "livetime")?;
                for i in 0..batch.num_rows() {
                    out.push(LivetimeRecord {
                        run: run[i] as RunNumber,
                        channel: channel[i] as Channel,
                        seconds: live[i],
                    });
                }
            }
            Ok(out)
        }
        "csv" => {
            #[derive(Deserialize)]
            struct Row {
                run: RunNumber,
                channel: Channel,
                livetime: f64,
            }
            let mut reader = csv::Reader::from_path(path).context("opening livetime CSV")?;
            reader
                .deserialize()
                .enumerate()
                .map(|(i, r)| {
                    let row: Row = r.with_context(|| format!("livetime CSV row {i}"))?;
                    Ok(LivetimeRecord {
                        run: row.run,
                        channel: row.channel,
                        seconds: row.livetime,
                    })
                })
                .collect()
        }
        other => bail!("Unsupported livetime file extension: .{other}"),
    }
}

/// Load event rows `(run, channel, trapENFCal, fitSlo, riseNoise)`.
pub fn load_events(path: &Path) -> Result<Vec<EventRecord>> {
    match extension(path).as_str() {
        "parquet" | "pq" => {
            let mut out = Vec::new();
            for batch in read_parquet_batches(path)? {
                let run = numeric_column(&batch, "run")?;
                let channel = numeric_column(&batch, "channel")?;
                let energy = numeric_column(&batch, "trapENFCal")?;
                let fit_slo = numeric_column(&batch, "fitSlo")?;
                let rise = numeric_column(&batch, "riseNoise")?;
                for i in 0..batch.num_rows() {
                    out.push(EventRecord {
                        run: run[i] as RunNumber,
                        channel: channel[i] as Channel,
                        energy: energy[i],
                        fit_slo: fit_slo[i],
                        rise_noise: rise[i],
                    });
                }
            }
            Ok(out)
        }
        "csv" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Row {
                run: RunNumber,
                channel: Channel,
                #[serde(rename = "trapENFCal")]
                trap_enf_cal: f64,
                fit_slo: f64,
                rise_noise: f64,
            }
            let mut reader = csv::Reader::from_path(path).context("opening event CSV")?;
            reader
                .deserialize()
                .enumerate()
                .map(|(i, r)| {
                    let row: Row = r.with_context(|| format!("event CSV row {i}"))?;
                    Ok(EventRecord {
                        run: row.run,
                        channel: row.channel,
                        energy: row.trap_enf_cal,
                        fit_slo: row.fit_slo,
                        rise_noise: row.rise_noise,
                    })
                })
                .collect()
        }
        other => bail!("Unsupported event file extension: .{other}"),
    }
}

// -- Parquet / Arrow helpers --

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn read_parquet_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening parquet file {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;
    reader
        .map(|b| b.context("reading parquet record batch"))
        .collect()
}

/// Read a numeric column as `f64`, whatever its integer/float width.
fn numeric_column(batch: &RecordBatch, name: &str) -> Result<Vec<f64>> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| anyhow::anyhow!("Parquet file missing '{name}' column"))?;
    let col: &Arc<dyn Array> = batch.column(idx);
    if col.null_count() > 0 {
        bail!("column '{name}' contains nulls");
    }

    macro_rules! collect_as_f64 {
        ($ty:ty) => {
            col.as_any()
                .downcast_ref::<$ty>()
                .with_context(|| format!("column '{name}': unexpected array type"))?
                .values()
                .iter()
                .map(|v| *v as f64)
                .collect()
        };
    }

    Ok(match col.data_type() {
        DataType::Float64 => collect_as_f64!(Float64Array),
        DataType::Float32 => collect_as_f64!(Float32Array),
        DataType::Int64 => collect_as_f64!(Int64Array),
        DataType::Int32 => collect_as_f64!(Int32Array),
        DataType::UInt64 => collect_as_f64!(UInt64Array),
        DataType::UInt32 => collect_as_f64!(UInt32Array),
        other => bail!("column '{name}' has type {other:?}, expected a numeric type"),
    })
}

// ---------------------------------------------------------------------------
// Granular livetime summary (text output of the livetime job)
// ---------------------------------------------------------------------------

/// Per-channel summary row from the all-channel summary block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryRow {
    pub exposure: f64,
    pub active_mass: f64,
}

/// Parsed livetime text output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LivetimeSummary {
    /// Per channel, exposure for each background index in file order.
    pub per_bkg: BTreeMap<Channel, Vec<f64>>,
    /// Per channel, the independently summed total.
    pub summary: BTreeMap<Channel, SummaryRow>,
}

/// Parse the granular livetime text report.
///
/// Layout: blocks headed by `bkgIdx N`, each with `ch : expo ...` lines,
/// followed by an `All-channel summary:` line, one header line, and rows
/// `ch detID activeMass runTime exposure`. Only `channels` are collected;
/// channels absent from a block get `0.0` for that block.
pub fn parse_livetime_summary(text: &str, channels: &[Channel]) -> Result<LivetimeSummary> {
    let mut per_bkg: BTreeMap<Channel, Vec<f64>> = channels.iter().map(|&c| (c, Vec::new())).collect();
    let mut block: Option<BTreeMap<Channel, f64>> = None;
    let mut lines = text.lines();

    let flush = |block: Option<BTreeMap<Channel, f64>>, per_bkg: &mut BTreeMap<Channel, Vec<f64>>| {
        if let Some(block) = block {
            for (ch, vals) in per_bkg.iter_mut() {
                vals.push(block.get(ch).copied().unwrap_or(0.0));
            }
        }
    };

    let mut in_summary = false;
    for line in lines.by_ref() {
        let tok: Vec<&str> = line.split_whitespace().collect();
        if line.trim_start().starts_with("All-channel summary") {
            in_summary = true;
            break;
        }
        match tok.as_slice() {
            ["bkgIdx", _idx, ..] => {
                flush(block.take(), &mut per_bkg);
                block = Some(BTreeMap::new());
            }
            [ch, ":", expo, ..] => {
                let (Ok(ch), Some(blk)) = (ch.parse::<Channel>(), block.as_mut()) else {
                    continue;
                };
                if per_bkg.contains_key(&ch) {
                    let expo: f64 = expo
                        .parse()
                        .with_context(|| format!("bad exposure value '{expo}' for channel {ch}"))?;
                    blk.insert(ch, expo);
                }
            }
            _ => {}
        }
    }
    flush(block.take(), &mut per_bkg);

    if !in_summary {
        bail!("livetime report has no 'All-channel summary' block");
    }

    let mut summary = BTreeMap::new();
    // one header line after the marker
    for line in lines.skip(1) {
        let tok: Vec<&str> = line.split_whitespace().collect();
        if tok.len() < 5 {
            continue;
        }
        let ch: Channel = tok[0]
            .parse()
            .with_context(|| format!("summary row '{line}': bad channel"))?;
        let active_mass: f64 = tok[2]
            .parse()
            .with_context(|| format!("summary row '{line}': bad active mass"))?;
        let exposure: f64 = tok[4]
            .parse()
            .with_context(|| format!("summary row '{line}': bad exposure"))?;
        if per_bkg.contains_key(&ch) {
            summary.insert(ch, SummaryRow { exposure, active_mass });
        }
    }

    Ok(LivetimeSummary { per_bkg, summary })
}
