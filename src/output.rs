//! Persisted products: run exclusions, exposure totals, efficiency curves
//! and the final event tables.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Float64Builder, ListBuilder, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channels::ChannelRegistry;
use crate::data::filter::{Expr, filtered_indices};
use crate::data::model::{BkgIdx, Channel, CutKind, DatasetId, EventRecord};
use crate::exposure::{BurstList, DatasetExposure, EfficiencyCurves, EfficiencyMode};
use crate::range_index::RangeIndex;

/// Metadata keys carrying the exposure of a final event table.
pub const ENRICHED_EXPOSURE_KEY: &str = "enrExp (kg-d)";
pub const NATURAL_EXPOSURE_KEY: &str = "natExp (kg-d)";

// -- file names --

pub fn exclusions_path(dir: &Path, ds: DatasetId, kind: CutKind) -> PathBuf {
    dir.join(format!("psa_run_cut_{kind}_ds{ds}.json"))
}

pub fn exposure_totals_path(dir: &Path) -> PathBuf {
    dir.join("expo_totals.json")
}

pub fn efficiency_path(dir: &Path, mode: EfficiencyMode) -> PathBuf {
    let tag = match mode {
        EfficiencyMode::Trigger => "trig",
        EfficiencyMode::All => "all",
    };
    dir.join(format!("expo_efficiency_{tag}.parquet"))
}

pub fn final_events_path(dir: &Path, ds: DatasetId) -> PathBuf {
    dir.join(format!("final_DS{ds}.parquet"))
}

// -- JSON bundles --

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, value).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Exposure per dataset, keyed by dataset label.
pub type ExposureBundle = BTreeMap<DatasetId, DatasetExposure>;

// -- Parquet --

fn create_parquet(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    File::create(path).with_context(|| format!("creating {}", path.display()))
}

fn list_column(rows: impl Iterator<Item = Vec<f64>>) -> arrow::array::ListArray {
    let mut builder = ListBuilder::new(Float64Builder::new());
    for row in rows {
        builder.values().append_slice(&row);
        builder.append(true);
    }
    builder.finish()
}

/// One row per dataset: the grid and the enriched / natural curves as lists.
pub fn write_efficiency(path: &Path, curves: &[EfficiencyCurves]) -> Result<()> {
    let item = || Arc::new(Field::new("item", DataType::Float64, true));
    let schema = Arc::new(Schema::new(vec![
        Field::new("ds", DataType::Utf8, false),
        Field::new("energy", DataType::List(item()), false),
        Field::new("enriched", DataType::List(item()), false),
        Field::new("natural", DataType::List(item()), false),
        Field::new("enriched_kg_days", DataType::Float64, false),
        Field::new("natural_kg_days", DataType::Float64, false),
    ]));

    let ds = StringArray::from(curves.iter().map(|c| c.ds.to_string()).collect::<Vec<_>>());
    let energy = list_column(curves.iter().map(|c| c.energy.clone()));
    let enriched = list_column(curves.iter().map(|c| c.enriched.clone()));
    let natural = list_column(curves.iter().map(|c| c.natural.clone()));
    let enr_expo = Float64Array::from(curves.iter().map(|c| c.enriched_kg_days).collect::<Vec<_>>());
    let nat_expo = Float64Array::from(curves.iter().map(|c| c.natural_kg_days).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(ds),
            Arc::new(energy),
            Arc::new(enriched),
            Arc::new(natural),
            Arc::new(enr_expo),
            Arc::new(nat_expo),
        ],
    )
    .context("building efficiency batch")?;

    let mut writer = ArrowWriter::try_new(create_parquet(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    info!("Wrote {} efficiency curves to {}", curves.len(), path.display());
    Ok(())
}

/// Events of a dataset passing their (bkgIdx, channel) selection and not
/// removed by the burst cut.
pub fn select_final_events(
    index: &RangeIndex,
    registry: &ChannelRegistry,
    ds: DatasetId,
    cuts: &BTreeMap<(BkgIdx, Channel), Expr>,
    bursts: &BurstList,
    events: &[EventRecord],
) -> Vec<EventRecord> {
    let ds_num = ds.number();
    let keep = filtered_indices(events, |ev| {
        let bkg_idx = index.bkg_idx_for_run(ds, ev.run)?;
        let cpd = registry.cpd_for_channel(ds_num, ev.channel)?;
        if bursts.is_cut(ds, cpd, bkg_idx) {
            return None;
        }
        cuts.get(&(bkg_idx, ev.channel))
    });
    keep.into_iter().map(|i| events[i]).collect()
}

/// Final event table with the dataset's exposure in the file metadata.
pub fn write_final_events(path: &Path, events: &[EventRecord], exposure: &DatasetExposure) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("run", DataType::UInt32, false),
        Field::new("channel", DataType::UInt32, false),
        Field::new("trapENFCal", DataType::Float64, false),
        Field::new("fitSlo", DataType::Float64, false),
        Field::new("riseNoise", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(events.iter().map(|e| e.run).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(events.iter().map(|e| e.channel).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(events.iter().map(|e| e.energy).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(events.iter().map(|e| e.fit_slo).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(events.iter().map(|e| e.rise_noise).collect::<Vec<_>>())),
        ],
    )
    .context("building event batch")?;

    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![
            KeyValue::new(
                ENRICHED_EXPOSURE_KEY.to_string(),
                format!("{:.4}", exposure.enriched_kg_days),
            ),
            KeyValue::new(
                NATURAL_EXPOSURE_KEY.to_string(),
                format!("{:.4}", exposure.natural_kg_days),
            ),
        ]))
        .build();

    let mut writer = ArrowWriter::try_new(create_parquet(path)?, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    info!("Writing final output: {} ({} events)", path.display(), events.len());
    Ok(())
}
