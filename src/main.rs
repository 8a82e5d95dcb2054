use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::{Parser, Subcommand};
use log::{info, warn};

use ge_exposure::config::Config;
use ge_exposure::coverage::RunExclusions;
use ge_exposure::cut_store::{CutRecord, SetOutcome};
use ge_exposure::data::loader;
use ge_exposure::data::model::{CutKind, DatasetId, RunNumber};
use ge_exposure::exposure::{
    BurstList, DatasetExposure, EfficiencyMode, EnergyGrid, ExposureAggregator, check_livetime_summary,
    grand_totals_kg_years,
};
use ge_exposure::output::{self, ExposureBundle};
use ge_exposure::range_index::RangeIndex;
use ge_exposure::state::AnalysisContext;

#[derive(Parser)]
#[command(name = "ge-exposure")]
#[command(about = "Cut coverage, exposure and efficiency for the germanium array")]
#[command(version)]
struct Cli {
    /// Config file (JSON). Falls back to $GE_EXPOSURE_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the run windows each channel loses to missing or bad cuts
    Coverage {
        /// Datasets (0-6, 5A/5B/5C). Defaults to the full analysis list.
        #[arg(long = "ds", num_args = 1..)]
        datasets: Vec<DatasetId>,

        /// Cut type: thr, fs, rn or fr
        #[arg(long, default_value = "fr")]
        cut: CutKind,
    },

    /// Fold livetime into enriched / natural exposure
    Exposure {
        #[arg(long = "ds", num_args = 1..)]
        datasets: Vec<DatasetId>,

        /// Run exclusions produced by `coverage` with this cut type
        #[arg(long, default_value = "fr")]
        cut: CutKind,
    },

    /// Exposure-weighted efficiency curves
    Efficiency {
        #[arg(long = "ds", num_args = 1..)]
        datasets: Vec<DatasetId>,

        /// trig (trigger only) or all (trigger x PSA)
        #[arg(long, default_value = "trig")]
        mode: EfficiencyMode,

        #[arg(long, default_value = "fr")]
        cut: CutKind,
    },

    /// Write the final event tables with their exposure attached
    Final {
        #[arg(long = "ds", num_args = 1..)]
        datasets: Vec<DatasetId>,

        #[arg(long, default_value = "fr")]
        cut: CutKind,
    },

    /// Show where a run falls: dataset, background and calibration indices
    Locate {
        run: RunNumber,
    },

    /// Inspect or edit the cut-record store
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// Print one record, values in numeric key order
    Get { key: String },

    /// Insert a record, or replace a differing one with --force
    Set {
        key: String,

        /// Values as a JSON object, e.g. '{"592": [1.1, 0.2, 0]}'
        vals: String,

        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg_path = Config::locate(cli.config)?;
    let cfg = Config::load(&cfg_path)?;

    match cli.command {
        Commands::Coverage { datasets, cut } => cmd_coverage(&cfg, &datasets_or_all(datasets), cut),
        Commands::Exposure { datasets, cut } => cmd_exposure(&cfg, &datasets_or_all(datasets), cut),
        Commands::Efficiency {
            datasets,
            mode,
            cut,
        } => cmd_efficiency(&cfg, &datasets_or_all(datasets), mode, cut),
        Commands::Final { datasets, cut } => cmd_final(&cfg, &datasets_or_all(datasets), cut),
        Commands::Locate { run } => cmd_locate(&cfg, run),
        Commands::Record { action } => cmd_record(&cfg, action),
    }
}

fn datasets_or_all(datasets: Vec<DatasetId>) -> Vec<DatasetId> {
    if datasets.is_empty() {
        DatasetId::analysis_list()
    } else {
        datasets
    }
}

fn load_bursts(cfg: &Config) -> Result<BurstList> {
    match &cfg.burst_list {
        Some(path) => Ok(BurstList::from_rows(loader::load_burst_list(path)?)),
        None => {
            warn!("No burst list configured; no burst cut applied");
            Ok(BurstList::default())
        }
    }
}

fn load_exclusions(cfg: &Config, ds: DatasetId, cut: CutKind) -> Result<RunExclusions> {
    let path = output::exclusions_path(&cfg.output_dir, ds, cut);
    output::read_json(&path).with_context(|| format!("run `coverage --ds {ds} --cut {cut}` first"))
}

fn cmd_coverage(cfg: &Config, datasets: &[DatasetId], cut: CutKind) -> Result<()> {
    let ctx = AnalysisContext::load(cfg)?;
    let resolver = ctx.resolver();
    for &ds in datasets {
        let excl = resolver.psa_cut_runs(ds, cut)?;
        let n_windows: usize = excl.0.values().map(Vec::len).sum();
        info!("DS-{ds}: {n_windows} excluded windows over {} channels", excl.0.len());
        output::write_json(&output::exclusions_path(&cfg.output_dir, ds, cut), &excl)?;
    }
    Ok(())
}

fn cmd_exposure(cfg: &Config, datasets: &[DatasetId], cut: CutKind) -> Result<()> {
    let ctx = AnalysisContext::load(cfg)?;
    let bursts = load_bursts(cfg)?;
    let mut bundle = ExposureBundle::new();

    for &ds in datasets {
        if let Some(report) = cfg.livetime_reports.get(&ds) {
            let text = std::fs::read_to_string(report)
                .with_context(|| format!("reading livetime report {}", report.display()))?;
            let channels = ctx.registry.good_channels(ds.number(), None, None)?;
            let summary = loader::parse_livetime_summary(&text, &channels)?;
            check_livetime_summary(&summary, cfg.summary_tolerance)?;
        }

        let excl = load_exclusions(cfg, ds, cut)?;
        let livetime = loader::load_livetime(cfg.livetime_for(ds)?)?;
        let mut agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        agg.accumulate_dataset(&livetime)?;
        bundle.insert(ds, agg.finalize()?);
    }

    let (enr, nat) = grand_totals_kg_years(bundle.values());
    print_exposure_table(&bundle)?;
    println!("\nTotals for DS: {}", datasets.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "));
    println!("Enriched (kg-y): {enr:.4}");
    println!("Natural (kg-y) : {nat:.4}");

    output::write_json(&output::exposure_totals_path(&cfg.output_dir), &bundle)
}

fn print_exposure_table(bundle: &ExposureBundle) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("ds", DataType::Utf8, false),
        Field::new("enr kg-d", DataType::Float64, false),
        Field::new("enr raw", DataType::Float64, false),
        Field::new("enr psa", DataType::Float64, false),
        Field::new("enr burst", DataType::Float64, false),
        Field::new("nat kg-d", DataType::Float64, false),
        Field::new("nat raw", DataType::Float64, false),
        Field::new("nat psa", DataType::Float64, false),
        Field::new("nat burst", DataType::Float64, false),
    ]));
    let col = |f: fn(&DatasetExposure) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(bundle.values().map(f).collect::<Vec<_>>()))
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(bundle.keys().map(ToString::to_string).collect::<Vec<_>>())),
            col(|d| d.enriched_kg_days),
            col(|d| d.enriched.raw),
            col(|d| d.enriched.psa_rejected),
            col(|d| d.enriched.burst_rejected),
            col(|d| d.natural_kg_days),
            col(|d| d.natural.raw),
            col(|d| d.natural.psa_rejected),
            col(|d| d.natural.burst_rejected),
        ],
    )?;
    println!("{}", pretty_format_batches(&[batch])?);
    Ok(())
}

fn cmd_efficiency(cfg: &Config, datasets: &[DatasetId], mode: EfficiencyMode, cut: CutKind) -> Result<()> {
    let ctx = AnalysisContext::load(cfg)?;
    let bursts = load_bursts(cfg)?;
    let grid: EnergyGrid = cfg.energy_grid;
    let mut curves = Vec::with_capacity(datasets.len());
    for &ds in datasets {
        let excl = load_exclusions(cfg, ds, cut)?;
        let livetime = loader::load_livetime(cfg.livetime_for(ds)?)?;
        let agg = ExposureAggregator::new(&ctx, ds, &excl, &bursts);
        let c = agg.efficiency_curve(&grid, mode, &livetime)?;
        info!(
            "DS-{ds}: enriched {:.3} kg-d, natural {:.3} kg-d",
            c.enriched_kg_days, c.natural_kg_days
        );
        curves.push(c);
    }
    output::write_efficiency(&output::efficiency_path(&cfg.output_dir, mode), &curves)
}

fn cmd_final(cfg: &Config, datasets: &[DatasetId], cut: CutKind) -> Result<()> {
    let ctx = AnalysisContext::load(cfg)?;
    let bursts = load_bursts(cfg)?;
    let bundle: ExposureBundle = output::read_json(&output::exposure_totals_path(&cfg.output_dir))
        .context("run `exposure` first")?;
    for &ds in datasets {
        let Some(expo) = bundle.get(&ds) else {
            bail!("no exposure totals for DS-{ds}");
        };
        let cuts = ctx.resolver().final_cuts(ds, cut)?;
        let events = loader::load_events(cfg.events_for(ds)?)?;
        let kept = output::select_final_events(&ctx.index, &ctx.registry, ds, &cuts, &bursts, &events);
        info!("DS-{ds}: {} of {} events pass", kept.len(), events.len());
        output::write_final_events(&output::final_events_path(&cfg.output_dir, ds), &kept, expo)?;
    }
    Ok(())
}

fn cmd_locate(cfg: &Config, run: RunNumber) -> Result<()> {
    let ctx = AnalysisContext::load(cfg)?;
    let ds = RangeIndex::dataset_for_run(run)?;
    println!("run {run}: DS{ds}");
    match ctx.index.bkg_idx_for_run(DatasetId::Numeric(ds), run) {
        Some(b) => println!("  bkgIdx {b}"),
        None => println!("  not in any background index"),
    }
    for key in ctx.index.cal_keys(Some(ds)) {
        match ctx.index.cal_idx_for_run(key, run)? {
            Some(c) => println!("  {key} calIdx {c} ({})", ctx.index.cal_coverage(key, c)?),
            None => println!("  {key} no calibration window"),
        }
    }
    let hv = ctx.registry.keyed_by_channel(ds, ctx.registry.high_voltage_map(ds, run));
    let th = ctx.registry.keyed_by_channel(ds, ctx.registry.trap_threshold_map(ds, run));
    for (ch, v) in &hv {
        println!("  ch {ch:>4}  HV {v:>7.1}  TRAP {:>6.2}", th.get(ch).copied().unwrap_or(-1.0));
    }
    Ok(())
}

fn cmd_record(cfg: &Config, action: RecordAction) -> Result<()> {
    let mut store = ge_exposure::cut_store::CutStore::open(&cfg.cut_store)?;
    match action {
        RecordAction::Get { key } => match store.get(&key)? {
            None => println!("Record {key} doesn't exist"),
            Some(rec) => {
                println!("Found record:\n{key}");
                for (k, v) in rec.values()? {
                    println!("{k} {v}");
                }
            }
        },
        RecordAction::Set { key, vals, force } => {
            let vals: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(&vals).context("parsing record values")?;
            let record = CutRecord { key: key.clone(), vals };
            record.values()?;
            match store.set(record, force)? {
                SetOutcome::Inserted | SetOutcome::Updated => {
                    store.save()?;
                    println!("Saved record {key}");
                }
                SetOutcome::Unchanged => println!("Record {key} already up to date"),
                SetOutcome::Conflict => bail!(ge_exposure::ExpoError::RecordConflict { key }),
            }
        }
    }
    Ok(())
}
