use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExpoError;

pub type RunNumber = u32;
pub type Channel = u32;
pub type DetectorId = u32;
pub type BkgIdx = u32;
pub type CalIdx = u32;

/// Detector-ID threshold separating enriched from natural detectors.
pub const ENRICHED_ID_THRESHOLD: DetectorId = 100_000;

// ---------------------------------------------------------------------------
// DatasetId – numeric dataset or a lettered partition of DS5
// ---------------------------------------------------------------------------

/// Lettered sub-partition of dataset 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    A,
    B,
    C,
}

impl Partition {
    fn letter(self) -> char {
        match self {
            Partition::A => 'A',
            Partition::B => 'B',
            Partition::C => 'C',
        }
    }
}

/// A dataset identifier, resolved once at the API boundary.
///
/// `"5A"`, `"5b"` parse to [`DatasetId::Lettered`]; `"0"`..`"6"` parse to
/// [`DatasetId::Numeric`]. Only dataset 5 has lettered partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatasetId {
    Numeric(u8),
    Lettered(u8, Partition),
}

/// Highest dataset number known to the run tables.
pub const MAX_DATASET: u8 = 6;

impl DatasetId {
    /// The datasets processed by a full batch pass, DS5 split into its partitions.
    pub fn analysis_list() -> Vec<DatasetId> {
        let mut out: Vec<DatasetId> = (0..=4).map(DatasetId::Numeric).collect();
        out.extend([Partition::A, Partition::B, Partition::C].map(|p| DatasetId::Lettered(5, p)));
        out
    }

    /// The underlying dataset number (`5` for `5A`).
    pub fn number(self) -> u8 {
        match self {
            DatasetId::Numeric(n) | DatasetId::Lettered(n, _) => n,
        }
    }

    pub fn partition(self) -> Option<Partition> {
        match self {
            DatasetId::Numeric(_) => None,
            DatasetId::Lettered(_, p) => Some(p),
        }
    }

    /// Background-index slice for a lettered partition; `None` means "all indices".
    pub fn bkg_slice(self) -> Option<RangeInclusive<BkgIdx>> {
        match self.partition()? {
            Partition::A => Some(0..=79),
            Partition::B => Some(80..=112),
            Partition::C => Some(113..=121),
        }
    }

    /// Code used by the burst-cut lists: the dataset number, or 50/51/52 for 5A/5B/5C.
    pub fn burst_code(self) -> u32 {
        match self.partition() {
            None => self.number() as u32,
            Some(Partition::A) => 50,
            Some(Partition::B) => 51,
            Some(Partition::C) => 52,
        }
    }

    /// Detector modules read out in this dataset.
    pub fn modules(self) -> Vec<Module> {
        match self.number() {
            4 => vec![Module::M2],
            5 => vec![Module::M1, Module::M2],
            _ => vec![Module::M1],
        }
    }

    /// The calibration key for a module: `ds{N}_m{M}`, or `ds5c` for partition 5C.
    pub fn cal_key(self, module: Module) -> String {
        match self.partition() {
            Some(Partition::C) => "ds5c".to_string(),
            _ => format!("ds{}_m{}", self.number(), module.number()),
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetId::Numeric(n) => write!(f, "{n}"),
            DatasetId::Lettered(n, p) => write!(f, "{n}{}", p.letter()),
        }
    }
}

impl FromStr for DatasetId {
    type Err = ExpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || ExpoError::UnknownDataset(s.to_string());
        let (digits, letter) = match s.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], Some(c.to_ascii_uppercase())),
            Some(_) => (s, None),
            None => return Err(unknown()),
        };
        let n: u8 = digits.parse().map_err(|_| unknown())?;
        if n > MAX_DATASET {
            return Err(unknown());
        }
        match letter {
            None => Ok(DatasetId::Numeric(n)),
            Some(l) if n == 5 => {
                let p = match l {
                    'A' => Partition::A,
                    'B' => Partition::B,
                    'C' => Partition::C,
                    _ => return Err(unknown()),
                };
                Ok(DatasetId::Lettered(n, p))
            }
            Some(_) => Err(unknown()),
        }
    }
}

impl TryFrom<String> for DatasetId {
    type Error = ExpoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetId> for String {
    fn from(value: DatasetId) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Module / detector classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Module {
    M1,
    M2,
}

impl Module {
    pub fn number(self) -> u8 {
        match self {
            Module::M1 => 1,
            Module::M2 => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Module> {
        match n {
            1 => Some(Module::M1),
            2 => Some(Module::M2),
            _ => None,
        }
    }

    /// Module 1 channels are below 1000, module 2 channels above.
    pub fn of_channel(channel: Channel) -> Module {
        if channel < 1000 {
            Module::M1
        } else {
            Module::M2
        }
    }

    /// Key used by the detector tables (`"M1"`/`"M2"`).
    pub fn label(self) -> &'static str {
        match self {
            Module::M1 => "M1",
            Module::M2 => "M2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorType {
    Enriched,
    Natural,
}

impl DetectorType {
    pub fn of(detector_id: DetectorId) -> DetectorType {
        if detector_id > ENRICHED_ID_THRESHOLD {
            DetectorType::Enriched
        } else {
            DetectorType::Natural
        }
    }
}

impl FromStr for DetectorType {
    type Err = ExpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enr" | "enriched" => Ok(DetectorType::Enriched),
            "nat" | "natural" => Ok(DetectorType::Natural),
            _ => Err(ExpoError::UnknownOption {
                kind: "detector type",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Cpd – detector position code (cryostat, string, position)
// ---------------------------------------------------------------------------

/// Detector physical position code, e.g. `111` = C1P1D1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cpd(pub u16);

impl Cpd {
    pub fn module(self) -> Module {
        if self.0 / 100 == 1 {
            Module::M1
        } else {
            Module::M2
        }
    }
}

impl fmt::Display for Cpd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cpd {
    type Err = ExpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(Cpd)
            .map_err(|_| ExpoError::UnknownCpd(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Run intervals
// ---------------------------------------------------------------------------

/// Inclusive run interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunInterval {
    pub lo: RunNumber,
    pub hi: RunNumber,
}

impl RunInterval {
    pub fn new(lo: RunNumber, hi: RunNumber) -> Self {
        RunInterval { lo, hi }
    }

    pub fn contains(&self, run: RunNumber) -> bool {
        self.lo <= run && run <= self.hi
    }

    pub fn runs(&self) -> RangeInclusive<RunNumber> {
        self.lo..=self.hi
    }

    /// Intersection with another interval, if non-empty.
    pub fn clamp_to(&self, other: &RunInterval) -> Option<RunInterval> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        (lo <= hi).then_some(RunInterval { lo, hi })
    }
}

impl fmt::Display for RunInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Cut kinds
// ---------------------------------------------------------------------------

/// Which data-quality cuts a coverage pass requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CutKind {
    /// Trigger threshold only (`thr`).
    Threshold,
    /// Threshold and pulse-shape slope (`fs`).
    Slope,
    /// Threshold and rise-noise (`rn`).
    RiseNoise,
    /// Threshold, slope and rise-noise (`fr`).
    Combined,
}

impl CutKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CutKind::Threshold => "thr",
            CutKind::Slope => "fs",
            CutKind::RiseNoise => "rn",
            CutKind::Combined => "fr",
        }
    }

    pub fn needs_slope(self) -> bool {
        matches!(self, CutKind::Slope | CutKind::Combined)
    }

    pub fn needs_rise(self) -> bool {
        matches!(self, CutKind::RiseNoise | CutKind::Combined)
    }
}

impl fmt::Display for CutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CutKind {
    type Err = ExpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thr" | "th" | "-b" => Ok(CutKind::Threshold),
            "fs" => Ok(CutKind::Slope),
            "rn" => Ok(CutKind::RiseNoise),
            "fr" => Ok(CutKind::Combined),
            other => Err(ExpoError::UnknownOption {
                kind: "cut type",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// External row types
// ---------------------------------------------------------------------------

/// One livetime row: seconds of live time for a channel in a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivetimeRecord {
    pub run: RunNumber,
    pub channel: Channel,
    pub seconds: f64,
}

/// One detector hit from the event table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub run: RunNumber,
    pub channel: Channel,
    /// Calibrated energy (keV).
    pub energy: f64,
    pub fit_slo: f64,
    pub rise_noise: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_lettered_datasets() {
        assert_eq!("1".parse::<DatasetId>().unwrap(), DatasetId::Numeric(1));
        assert_eq!(
            "5a".parse::<DatasetId>().unwrap(),
            DatasetId::Lettered(5, Partition::A)
        );
        assert_eq!("5C".parse::<DatasetId>().unwrap().to_string(), "5C");
        assert!("3A".parse::<DatasetId>().is_err());
        assert!("7".parse::<DatasetId>().is_err());
        assert!("".parse::<DatasetId>().is_err());
    }

    #[test]
    fn lettered_partitions_slice_bkg_indices() {
        let b: DatasetId = "5B".parse().unwrap();
        assert_eq!(b.bkg_slice(), Some(80..=112));
        assert_eq!(b.burst_code(), 51);
        assert_eq!(DatasetId::Numeric(5).bkg_slice(), None);
    }

    #[test]
    fn cal_keys_follow_module_and_partition() {
        assert_eq!(DatasetId::Numeric(1).cal_key(Module::M1), "ds1_m1");
        assert_eq!(DatasetId::Lettered(5, Partition::C).cal_key(Module::M2), "ds5c");
        assert_eq!(DatasetId::Numeric(4).modules(), vec![Module::M2]);
    }

    #[test]
    fn dataset_id_serializes_as_string() {
        let json = serde_json::to_string(&DatasetId::Lettered(5, Partition::A)).unwrap();
        assert_eq!(json, "\"5A\"");
        let back: DatasetId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DatasetId::Lettered(5, Partition::A));
    }

    #[test]
    fn detector_type_uses_id_threshold() {
        assert_eq!(DetectorType::of(1426981), DetectorType::Enriched);
        assert_eq!(DetectorType::of(28474), DetectorType::Natural);
    }

    #[test]
    fn interval_clamp() {
        let a = RunInterval::new(10, 20);
        assert_eq!(a.clamp_to(&RunInterval::new(15, 30)), Some(RunInterval::new(15, 20)));
        assert_eq!(a.clamp_to(&RunInterval::new(21, 30)), None);
    }
}
