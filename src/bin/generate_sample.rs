//! Synthetic livetime and event tables for one dataset, shaped like the
//! real ones so the `exposure`, `efficiency` and `final` passes can run
//! end-to-end without detector data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Parser;
use parquet::arrow::ArrowWriter;

use ge_exposure::config::Config;
use ge_exposure::data::model::{Channel, DatasetId, EventRecord, LivetimeRecord, RunNumber};
use ge_exposure::state::AnalysisContext;

#[derive(Parser)]
#[command(name = "generate-sample")]
struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long = "ds", default_value = "1")]
    dataset: DatasetId,

    /// Output directory for `livetime_ds*.parquet` / `events_ds*.parquet`
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Keep every n-th run of the dataset
    #[arg(long, default_value_t = 1)]
    stride: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    fn exponential(&mut self, scale: f64) -> f64 {
        -scale * self.next_f64().max(1e-15).ln()
    }
}

/// Flat-plus-falling continuum with the 10.37 keV Ge K-shell line on top.
fn sample_energy(rng: &mut SimpleRng) -> f64 {
    let u = rng.next_f64();
    if u < 0.1 {
        rng.gauss(10.37, 0.15)
    } else if u < 0.6 {
        0.5 + rng.exponential(2.0)
    } else {
        rng.next_f64() * 50.0
    }
}

fn write_livetime(path: &Path, rows: &[LivetimeRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("run", DataType::UInt32, false),
        Field::new("channel", DataType::UInt32, false),
        Field::new("livetime", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.run).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.channel).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.seconds).collect::<Vec<_>>())),
        ],
    )
    .context("building livetime batch")?;

    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn write_events(path: &Path, rows: &[EventRecord]) -> Result<()> {
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
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.run).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.channel).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.energy).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.fit_slo).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.rise_noise).collect::<Vec<_>>())),
        ],
    )
    .context("building event batch")?;

    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let cfg = Config::load(&Config::locate(args.config)?)?;
    let ctx = AnalysisContext::load(&cfg)?;
    let mut rng = SimpleRng::new(args.seed);

    let ds = args.dataset;
    let mut channels: Vec<Channel> = Vec::new();
    for module in ds.modules() {
        channels.extend(ctx.registry.good_channels(ds.number(), Some(module), None)?);
    }
    let runs: Vec<RunNumber> = ctx
        .index
        .run_list(ds, None)?
        .into_iter()
        .step_by(args.stride.max(1))
        .collect();

    let mut livetime = Vec::with_capacity(runs.len() * channels.len());
    let mut events = Vec::new();
    for &run in &runs {
        // roughly one hour per run, a few percent of channels dropped out
        let run_seconds = rng.gauss(3600.0, 120.0).max(0.0);
        for &channel in &channels {
            if rng.next_f64() < 0.03 {
                continue;
            }
            livetime.push(LivetimeRecord {
                run,
                channel,
                seconds: run_seconds * rng.gauss(0.99, 0.005).clamp(0.0, 1.0),
            });
            let n_hits = (rng.exponential(2.0)) as usize;
            for _ in 0..n_hits {
                events.push(EventRecord {
                    run,
                    channel,
                    energy: sample_energy(&mut rng),
                    fit_slo: rng.gauss(60.0, 15.0),
                    rise_noise: rng.gauss(0.0, 1.0),
                });
            }
        }
    }

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let tag = ds.to_string().to_lowercase();
    let lt_path = args.out_dir.join(format!("livetime_ds{tag}.parquet"));
    let ev_path = args.out_dir.join(format!("events_ds{tag}.parquet"));
    write_livetime(&lt_path, &livetime)?;
    write_events(&ev_path, &events)?;

    println!(
        "Wrote {} livetime rows to {} and {} events to {} ({} runs, {} channels)",
        livetime.len(),
        lt_path.display(),
        events.len(),
        ev_path.display(),
        runs.len(),
        channels.len()
    );
    Ok(())
}
