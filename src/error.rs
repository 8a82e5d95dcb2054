use thiserror::Error;

use crate::data::model::{Channel, DatasetId, RunNumber};

pub type Result<T> = std::result::Result<T, ExpoError>;

#[derive(Error, Debug)]
pub enum ExpoError {
    // -- configuration --
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),
    #[error("run {0} is outside every known dataset range")]
    RunOutOfRange(RunNumber),
    #[error("background index {bkg_idx} not found in DS-{ds}")]
    UnknownBkgIdx { ds: DatasetId, bkg_idx: u32 },
    #[error("unknown calibration key: {0}")]
    UnknownCalKey(String),
    #[error("calibration index {idx} not found for key {key}")]
    UnknownCalIdx { key: String, idx: u32 },
    #[error("run {run} is not covered by any calibration window of {key}")]
    CalibrationGap { key: String, run: RunNumber },
    #[error("channel {channel} is not mapped to a detector in DS-{ds}")]
    UnknownChannel { ds: DatasetId, channel: Channel },
    #[error("unknown detector position {0}")]
    UnknownCpd(String),
    #[error("unknown detector ID {0}")]
    UnknownDetectorId(u32),
    #[error("no settings recorded for DS-{0}")]
    MissingSettings(DatasetId),
    #[error("unknown {kind} option: {value}")]
    UnknownOption { kind: &'static str, value: String },

    // -- data inconsistency (fatal) --
    #[error("multiple records found for key '{0}', manual cleanup needed")]
    AmbiguousRecord(String),
    #[error("record '{key}' already exists with different values (use force to overwrite)")]
    RecordConflict { key: String },
    #[error("malformed record '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },
    #[error("threshold for channel {channel} in '{key}' is flagged bad but the period is covered")]
    BadThreshold { key: String, channel: Channel },
    #[error("channel {channel} has no resolved cut coverage in the DS-{ds} exclusions")]
    UnresolvedCoverage { ds: DatasetId, channel: Channel },
    #[error("exposure mismatch for channel {channel}: {reason}")]
    ExposureMismatch { channel: Channel, reason: String },
    #[error("invalid run table: {0}")]
    InvalidRunTable(String),

    // -- I/O --
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
