//! Static channel/detector identity and per-run detector settings.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::model::{Channel, Cpd, DetectorId, DetectorType, Module, RunNumber};
use crate::error::{ExpoError, Result};

/// `(first run, value)` breakpoints; a value holds until superseded.
pub type Breakpoints<T> = Vec<(RunNumber, T)>;

/// Derived per-dataset settings, keyed by dataset number then detector position.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub high_voltage: BTreeMap<u8, BTreeMap<Cpd, Breakpoints<f64>>>,
    pub trap_threshold: BTreeMap<u8, BTreeMap<Cpd, Breakpoints<f64>>>,
    /// High-gain analysis channel of each detector.
    pub channel: BTreeMap<u8, BTreeMap<Cpd, Breakpoints<Channel>>>,
    pub pulser_monitors: BTreeMap<u8, Vec<Channel>>,
}

/// Value effective at `run`: the last breakpoint with `run >= breakpoint`.
///
/// Every entry is visited, so unsorted or duplicated breakpoints resolve to
/// the last satisfying entry in list order. Returns `default` when the list is
/// empty or `run` precedes every breakpoint.
pub fn value_at<T: Copy>(points: &[(RunNumber, T)], run: RunNumber, default: T) -> T {
    let mut value = default;
    for &(first_run, v) in points {
        if run >= first_run {
            value = v;
        }
    }
    value
}

// ---------------------------------------------------------------------------
// DetectorTables – physical detector constants
// ---------------------------------------------------------------------------

/// Detector constants: positions, IDs, active masses and the per-dataset
/// bad / veto-only detector lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorTables {
    pub positions: BTreeMap<Module, Vec<Cpd>>,
    pub detector_ids: BTreeMap<Cpd, DetectorId>,
    /// Active mass in grams.
    pub active_mass: BTreeMap<DetectorId, f64>,
    pub bad: BTreeMap<u8, Vec<DetectorId>>,
    pub veto_only: BTreeMap<u8, Vec<DetectorId>>,
}

impl DetectorTables {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading detector tables {}", path.display()))?;
        serde_json::from_str(&text).context("parsing detector tables")
    }

    /// The as-built array: 29 detectors in each module.
    pub fn builtin() -> Self {
        const M1: [(u16, DetectorId, f64); 29] = [
            (111, 1426981, 510.0), (112, 1425750, 979.0), (113, 1426612, 811.0), (114, 1425380, 968.0),
            (121, 28474, 560.0), (122, 1426640, 723.0), (123, 1426650, 659.0), (124, 1426622, 689.0),
            (131, 28480, 551.0), (132, 1426980, 886.0), (133, 1425381, 949.0), (134, 1425730, 1024.0),
            (141, 28455, 558.0), (142, 28470, 564.0), (143, 28463, 567.0), (144, 28465, 545.0), (145, 28469, 557.0),
            (151, 28477, 553.0), (152, 1425751, 730.0), (153, 1426610, 632.0), (154, 1425731, 982.0),
            (161, 1425742, 732.0), (162, 1426611, 675.0), (163, 1425740, 701.0), (164, 1426620, 572.2),
            (171, 28482, 561.0), (172, 1425741, 710.0), (173, 1426621, 590.8), (174, 1425370, 964.0),
        ];
        const M2: [(u16, DetectorId, f64); 29] = [
            (211, 28459, 556.0), (212, 1426641, 576.0), (213, 1427481, 903.0), (214, 1427480, 917.0),
            (221, 28481, 581.0), (222, 28576, 562.0), (223, 28594, 559.0), (224, 28595, 558.0), (225, 28461, 577.0),
            (231, 1427490, 872.0), (232, 1427491, 852.0), (233, 1428530, 996.0),
            (241, 28607, 558.0), (242, 28456, 579.0), (243, 28621, 565.0), (244, 28466, 566.0), (245, 28473, 562.0),
            (251, 28487, 557.0), (252, 1426651, 591.0), (253, 1428531, 1031.0), (254, 1427120, 802.0),
            (261, 1235170, 462.2), (262, 1429091, 775.0), (263, 1429092, 821.0), (264, 1426652, 778.0),
            (271, 28619, 566.0), (272, 1427121, 968.0), (273, 1429090, 562.0), (274, 28717, 567.0),
        ];

        let mut positions = BTreeMap::new();
        let mut detector_ids = BTreeMap::new();
        let mut active_mass = BTreeMap::new();
        for (module, table) in [(Module::M1, &M1), (Module::M2, &M2)] {
            let mut cpds = Vec::with_capacity(table.len());
            for &(cpd, id, mass) in table.iter() {
                cpds.push(Cpd(cpd));
                detector_ids.insert(Cpd(cpd), id);
                active_mass.insert(id, mass);
            }
            positions.insert(module, cpds);
        }

        let bad = BTreeMap::from([
            (0, vec![28474, 1426622, 28480, 1426980, 1426620, 1425370]),
            (1, vec![1426981, 1426622, 28455, 28470, 28463, 28465, 28469, 28477, 1425751, 1425731, 1426611]),
            (2, vec![1426981, 1426622, 28455, 28470, 28463, 28465, 28469, 28477, 1425731, 1426611]),
            (3, vec![1426981, 1426622, 28477, 1425731, 1426611]),
            (4, vec![28595, 28461, 1428530, 28621, 28473, 1426651, 1429092, 1426652, 28619]),
            (5, vec![
                1426981, 1426622, 28477, 1425731, 1426611, 28595, 28461, 1428530, 28621, 28473,
                1426651, 1429092, 1426652, 28619, 1427121,
            ]),
            (6, vec![
                1426981, 28474, 1426622, 28477, 1425731, 1426611, 28595, 28461, 1428530, 28621,
                28473, 1426651, 1429092, 1426652, 28619, 1427121,
            ]),
        ]);
        let veto_only = BTreeMap::from([
            (0, vec![1425381, 1425742]),
            (1, vec![28480]),
            (2, vec![28480, 1425751, 1426621]),
            (3, vec![28480, 28470, 28463]),
            (4, vec![28459, 1426641, 1427481, 28456, 1427120, 1427121]),
            (5, vec![28480, 1426641, 1427481, 1235170]),
            (6, vec![28480, 1426641, 1427481, 1235170]),
        ]);

        DetectorTables {
            positions,
            detector_ids,
            active_mass,
            bad,
            veto_only,
        }
    }
}

/// A detector addressed either by analysis channel or by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorRef {
    Channel(Channel),
    Cpd(Cpd),
}

impl From<Cpd> for DetectorRef {
    fn from(cpd: Cpd) -> Self {
        DetectorRef::Cpd(cpd)
    }
}

// ---------------------------------------------------------------------------
// ChannelRegistry
// ---------------------------------------------------------------------------

/// Read-only channel/detector lookups, built once and shared by reference.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    tables: DetectorTables,
    settings: RunSettings,
    /// Per dataset, `cpd → channel` for detectors active at some point.
    by_cpd: BTreeMap<u8, BTreeMap<Cpd, Channel>>,
    /// Per dataset, `channel → cpd`; the lowest CPD wins on a shared channel.
    by_channel: BTreeMap<u8, BTreeMap<Channel, Cpd>>,
}

impl ChannelRegistry {
    pub fn new(tables: DetectorTables, settings: RunSettings) -> Self {
        let mut by_cpd = BTreeMap::new();
        let mut by_channel = BTreeMap::new();
        for (&ds, table) in &settings.channel {
            // the analysis channel does not change within a dataset
            let forward: BTreeMap<Cpd, Channel> = table
                .iter()
                .filter_map(|(cpd, points)| points.first().map(|&(_, ch)| (*cpd, ch)))
                .collect();
            let mut reverse = BTreeMap::new();
            for (&cpd, &ch) in &forward {
                reverse.entry(ch).or_insert(cpd);
            }
            by_cpd.insert(ds, forward);
            by_channel.insert(ds, reverse);
        }
        ChannelRegistry {
            tables,
            settings,
            by_cpd,
            by_channel,
        }
    }

    pub fn tables(&self) -> &DetectorTables {
        &self.tables
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn channel_map(&self, ds: u8) -> Result<&BTreeMap<Cpd, Channel>> {
        self.by_cpd
            .get(&ds)
            .ok_or(ExpoError::MissingSettings(crate::data::model::DatasetId::Numeric(ds)))
    }

    /// Every high-gain channel of the dataset, sorted.
    pub fn channels(&self, ds: u8) -> Result<Vec<Channel>> {
        let mut chans: Vec<Channel> = self.channel_map(ds)?.values().copied().collect();
        chans.sort_unstable();
        Ok(chans)
    }

    pub fn cpd_for_channel(&self, ds: u8, channel: Channel) -> Option<Cpd> {
        self.by_channel.get(&ds)?.get(&channel).copied()
    }

    pub fn channel_for_cpd(&self, ds: u8, cpd: Cpd) -> Option<Channel> {
        self.by_cpd.get(&ds)?.get(&cpd).copied()
    }

    pub fn detector_id(&self, cpd: Cpd) -> Result<DetectorId> {
        self.tables
            .detector_ids
            .get(&cpd)
            .copied()
            .ok_or_else(|| ExpoError::UnknownCpd(cpd.to_string()))
    }

    /// Channel of a detector ID, `None` if the detector is not enabled in the dataset.
    pub fn channel_for_detector_id(&self, ds: u8, id: DetectorId) -> Option<Channel> {
        let cpd = self
            .tables
            .detector_ids
            .iter()
            .find_map(|(cpd, did)| (*did == id).then_some(*cpd))?;
        self.channel_for_cpd(ds, cpd)
    }

    pub fn detector_id_for_channel(&self, ds: u8, channel: Channel) -> Result<DetectorId> {
        let cpd = self
            .cpd_for_channel(ds, channel)
            .ok_or(ExpoError::UnknownChannel {
                ds: crate::data::model::DatasetId::Numeric(ds),
                channel,
            })?;
        self.detector_id(cpd)
    }

    pub fn detector_type_for_channel(&self, ds: u8, channel: Channel) -> Result<DetectorType> {
        Ok(DetectorType::of(self.detector_id_for_channel(ds, channel)?))
    }

    /// Active mass in grams.
    pub fn active_mass(&self, id: DetectorId) -> Result<f64> {
        self.tables
            .active_mass
            .get(&id)
            .copied()
            .ok_or(ExpoError::UnknownDetectorId(id))
    }

    pub fn pulser_monitors(&self, ds: u8) -> &[Channel] {
        self.settings
            .pulser_monitors
            .get(&ds)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Bad and veto-only channels enabled in this dataset.
    pub fn bad_channels(&self, ds: u8) -> Vec<Channel> {
        let bad = self.tables.bad.get(&ds).into_iter().flatten();
        let veto = self.tables.veto_only.get(&ds).into_iter().flatten();
        bad.chain(veto)
            .filter_map(|id| self.channel_for_detector_id(ds, *id))
            .collect()
    }

    /// Good high-gain channels: no bad, no veto-only, no pulser monitors.
    pub fn good_channels(
        &self,
        ds: u8,
        module: Option<Module>,
        det_type: Option<DetectorType>,
    ) -> Result<Vec<Channel>> {
        let bad = self.bad_channels(ds);
        let pmon = self.pulser_monitors(ds);
        let mut good = Vec::new();
        for ch in self.channels(ds)? {
            if bad.contains(&ch) || pmon.contains(&ch) {
                continue;
            }
            if module.is_some_and(|m| Module::of_channel(ch) != m) {
                continue;
            }
            if let Some(t) = det_type {
                if self.detector_type_for_channel(ds, ch)? != t {
                    continue;
                }
            }
            good.push(ch);
        }
        Ok(good)
    }

    /// Positions of a list of channels (`None` for unmapped channels).
    pub fn detector_list(&self, ds: u8, channels: &[Channel]) -> Vec<Option<Cpd>> {
        channels.iter().map(|&ch| self.cpd_for_channel(ds, ch)).collect()
    }

    fn resolve_cpd(&self, ds: u8, det: DetectorRef) -> Result<Cpd> {
        match det {
            DetectorRef::Cpd(cpd) => Ok(cpd),
            DetectorRef::Channel(channel) => {
                self.cpd_for_channel(ds, channel)
                    .ok_or(ExpoError::UnknownChannel {
                        ds: crate::data::model::DatasetId::Numeric(ds),
                        channel,
                    })
            }
        }
    }

    /// HV effective at `run`; 0 when the detector has no entry or is not yet powered.
    pub fn high_voltage_at(&self, ds: u8, run: RunNumber, det: impl Into<DetectorRef>) -> Result<f64> {
        let cpd = self.resolve_cpd(ds, det.into())?;
        let points = self.settings.high_voltage.get(&ds).and_then(|m| m.get(&cpd));
        Ok(points.map_or(0.0, |p| value_at(p, run, 0.0)))
    }

    /// TRAP threshold effective at `run`; -1 when the detector is not active.
    pub fn trap_threshold_at(&self, ds: u8, run: RunNumber, det: impl Into<DetectorRef>) -> Result<f64> {
        let cpd = self.resolve_cpd(ds, det.into())?;
        let points = self.settings.trap_threshold.get(&ds).and_then(|m| m.get(&cpd));
        Ok(points.map_or(-1.0, |p| value_at(p, run, -1.0)))
    }

    /// HV of every detector with settings in the dataset at `run`.
    pub fn high_voltage_map(&self, ds: u8, run: RunNumber) -> BTreeMap<Cpd, f64> {
        self.settings
            .high_voltage
            .get(&ds)
            .map(|m| m.iter().map(|(cpd, p)| (*cpd, value_at(p, run, 0.0))).collect())
            .unwrap_or_default()
    }

    /// TRAP threshold of every detector with settings in the dataset at `run`.
    pub fn trap_threshold_map(&self, ds: u8, run: RunNumber) -> BTreeMap<Cpd, f64> {
        self.settings
            .trap_threshold
            .get(&ds)
            .map(|m| m.iter().map(|(cpd, p)| (*cpd, value_at(p, run, -1.0))).collect())
            .unwrap_or_default()
    }

    /// Re-key a per-position map by channel, dropping positions without a channel.
    pub fn keyed_by_channel<T>(&self, ds: u8, by_cpd: BTreeMap<Cpd, T>) -> BTreeMap<Channel, T> {
        by_cpd
            .into_iter()
            .filter_map(|(cpd, v)| self.channel_for_cpd(ds, cpd).map(|ch| (ch, v)))
            .collect()
    }
}

impl From<Channel> for DetectorRef {
    fn from(channel: Channel) -> Self {
        DetectorRef::Channel(channel)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_registry() -> ChannelRegistry {
        let mut settings = RunSettings::default();
        let chans = BTreeMap::from([
            (Cpd(111), vec![(9407, 598)]),   // bad in DS1
            (Cpd(112), vec![(9407, 600)]),   // enriched
            (Cpd(121), vec![(9407, 592)]),   // natural
            (Cpd(131), vec![(9407, 626)]),   // veto-only in DS1
            (Cpd(164), vec![(9407, 644)]),   // pulser monitor slot
            (Cpd(211), vec![(9407, 1106)]),  // module 2
            (Cpd(222), vec![]),              // never enabled
        ]);
        settings.channel.insert(1, chans);
        settings.pulser_monitors.insert(1, vec![644]);
        settings.high_voltage.insert(
            1,
            BTreeMap::from([(Cpd(111), vec![(9407, 1200.0), (9600, 1250.0)]), (Cpd(112), vec![])]),
        );
        settings.trap_threshold.insert(1, BTreeMap::from([(Cpd(112), vec![(9500, 3.5)])]));
        ChannelRegistry::new(DetectorTables::builtin(), settings)
    }

    #[test]
    fn breakpoint_walk_last_entry_wins() {
        let pts = [(9407, 1200.0), (9600, 1250.0)];
        assert_eq!(value_at(&pts, 9500, 0.0), 1200.0);
        assert_eq!(value_at(&pts, 9600, 0.0), 1250.0);
        assert_eq!(value_at(&pts, 9000, 0.0), 0.0);
        // unsorted input: the last satisfying entry in list order wins
        let unsorted = [(9600, 1250.0), (9407, 1200.0)];
        assert_eq!(value_at(&unsorted, 9700, 0.0), 1200.0);
        let dup = [(9407, 1.0), (9407, 2.0)];
        assert_eq!(value_at(&dup, 9407, 0.0), 2.0);
        assert_eq!(value_at::<f64>(&[], 9407, -1.0), -1.0);
    }

    #[test]
    fn high_voltage_and_threshold_defaults() {
        let reg = sample_registry();
        assert_eq!(reg.high_voltage_at(1, 9500, Cpd(111)).unwrap(), 1200.0);
        assert_eq!(reg.high_voltage_at(1, 9500, 598u32).unwrap(), 1200.0);
        assert_eq!(reg.high_voltage_at(1, 9500, Cpd(112)).unwrap(), 0.0);
        assert_eq!(reg.high_voltage_at(1, 9000, Cpd(111)).unwrap(), 0.0);
        assert_eq!(reg.trap_threshold_at(1, 9400, Cpd(112)).unwrap(), -1.0);
        assert_eq!(reg.trap_threshold_at(1, 9501, Cpd(112)).unwrap(), 3.5);
        assert_eq!(reg.trap_threshold_at(1, 9501, Cpd(121)).unwrap(), -1.0);
        assert!(reg.high_voltage_at(1, 9500, 9999u32).is_err());
    }

    #[test]
    fn channel_cpd_lookups_are_inverse() {
        let reg = sample_registry();
        assert_eq!(reg.channels(1).unwrap(), vec![592, 598, 600, 626, 644, 1106]);
        for ch in reg.channels(1).unwrap() {
            let cpd = reg.cpd_for_channel(1, ch).unwrap();
            assert_eq!(reg.channel_for_cpd(1, cpd), Some(ch));
        }
        assert_eq!(reg.cpd_for_channel(1, 7), None);
        assert_eq!(reg.channel_for_detector_id(1, 1425750), Some(600));
        assert_eq!(reg.channel_for_detector_id(1, 28576), None);
        assert!(reg.channels(2).is_err());
    }

    #[test]
    fn channel_maps_are_per_dataset() {
        let mut settings = RunSettings::default();
        settings.channel.insert(
            2,
            BTreeMap::from([
                (Cpd(112), vec![(14699, 600)]),
                (Cpd(113), vec![(14699, 600), (15000, 602)]), // shares 600 with 112
                (Cpd(121), vec![(14699, 592)]),
            ]),
        );
        let reg = ChannelRegistry::new(DetectorTables::builtin(), settings);
        assert_eq!(reg.cpd_for_channel(2, 600), Some(Cpd(112)));
        assert_eq!(reg.channel_for_cpd(2, Cpd(113)), Some(600));
        assert_eq!(reg.cpd_for_channel(1, 600), None);
        assert_eq!(reg.channel_for_cpd(1, Cpd(112)), None);
        assert!(matches!(reg.channels(1), Err(ExpoError::MissingSettings(_))));

        let sample = sample_registry();
        assert_eq!(sample.cpd_for_channel(1, 600), Some(Cpd(112)));
        assert_eq!(sample.cpd_for_channel(2, 600), None);
    }

    #[test]
    fn good_channels_exclude_bad_veto_and_pulser() {
        let reg = sample_registry();
        assert_eq!(reg.good_channels(1, None, None).unwrap(), vec![592, 600, 1106]);
        assert_eq!(reg.good_channels(1, Some(Module::M1), None).unwrap(), vec![592, 600]);
        assert_eq!(reg.good_channels(1, Some(Module::M2), None).unwrap(), vec![1106]);
        assert_eq!(
            reg.good_channels(1, None, Some(DetectorType::Enriched)).unwrap(),
            vec![600]
        );
        assert_eq!(
            reg.good_channels(1, Some(Module::M1), Some(DetectorType::Natural)).unwrap(),
            vec![592]
        );
    }

    #[test]
    fn active_mass_lookup() {
        let reg = sample_registry();
        assert_eq!(reg.active_mass(1425750).unwrap(), 979.0);
        assert!(matches!(reg.active_mass(42), Err(ExpoError::UnknownDetectorId(42))));
    }

    #[test]
    fn maps_rekey_by_channel() {
        let reg = sample_registry();
        let hv = reg.keyed_by_channel(1, reg.high_voltage_map(1, 9700));
        assert_eq!(hv[&598], 1250.0);
        assert_eq!(hv[&600], 0.0);
    }
}
