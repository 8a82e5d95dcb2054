//! Run indexing, cut coverage and exposure / efficiency aggregation for a
//! germanium detector array.
//!
//! ```text
//!  run tables ─► RangeIndex ─┐
//!  settings   ─► ChannelRegistry ─┼─► CutCoverageResolver ─► RunExclusions
//!  cut store  ─► CutStore ───┘                                 │
//!  livetime rows ──────────────────────────────► ExposureAggregator ─► kg-days, efficiency
//! ```

pub mod channels;
pub mod config;
pub mod coverage;
pub mod cut_store;
pub mod data;
pub mod error;
pub mod exposure;
pub mod output;
pub mod range_index;
pub mod state;

pub use error::{ExpoError, Result};
