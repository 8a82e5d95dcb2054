/// Data layer: core types, loading, and event predicates.
///
/// Architecture:
/// ```text
///  .json / .csv / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  run tables, settings, livetime / event rows
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  model    │  DatasetId, RunInterval, LivetimeRecord, EventRecord
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  Expr predicate tree → passing event indices
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod filter;
