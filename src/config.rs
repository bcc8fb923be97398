//! Slave configurations: the application-visible handle describing how one
//! slave is to be configured, attached to an actual slave after each scan.

use crate::coe::EmergencyMessage;
use crate::fmt;
use crate::pdo::PdoList;
use crate::slave::Slave;
use crate::sync_manager_channel::Direction;

/// One DC sync signal: cycle and shift time in ns.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncSignal {
    /// Cycle time in ns, 0 to leave the signal unused.
    pub cycle_time: u32,
    /// Shift relative to the cycle start in ns.
    pub shift_time: i32,
}

/// Distributed clock configuration of one slave.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DcConfig {
    /// The AssignActivate word written to register `0x0980`, device specific
    /// (from the device description / ESI).
    pub assign_activate: u16,
    /// SYNC0 signal.
    pub sync0: SyncSignal,
    /// SYNC1 signal.
    pub sync1: SyncSignal,
}

/// An SDO value to be downloaded during configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SdoConfig {
    pub index: u16,
    pub sub_index: u8,
    pub complete_access: bool,
    pub data: Vec<u8>,
}

/// A process data mapping of one sync manager into one domain, with its
/// logical placement resolved at activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FmmuMapping {
    pub sync_index: u8,
    pub direction: Direction,
    pub domain: usize,
    /// Assigned by the domain layout pass.
    pub logical_start: u32,
    pub data_size: u16,
}

/// Capacity of the per-config emergency message ring.
const EMERGENCY_RING_CAPACITY: usize = 32;

/// Application-side configuration for one slave, keyed by
/// `(alias, position, vendor id, product code)`.
#[derive(Debug, Default)]
pub struct SlaveConfig {
    pub(crate) alias: u16,
    pub(crate) position: u16,
    pub(crate) vendor_id: u32,
    pub(crate) product_code: u32,

    /// Watchdog divider for register `0x0400`.
    pub(crate) watchdog_divider: Option<u16>,
    /// Sync manager watchdog intervals for register `0x0420`.
    pub(crate) watchdog_intervals: Option<u16>,

    pub(crate) dc: Option<DcConfig>,

    /// Configured PDO assignment (and optionally mapping) per sync manager.
    /// `None` leaves the slave's own assignment untouched.
    pub(crate) sm_pdos: [Option<PdoList>; 16],

    /// SDO downloads applied in order during configuration.
    pub(crate) sdo_configs: Vec<SdoConfig>,

    /// Resolved process data mappings, rebuilt at each activation.
    pub(crate) fmmu_mappings: Vec<FmmuMapping>,

    /// Emergency messages received from the attached slave, newest last.
    /// Overwrites the oldest entry when full.
    pub(crate) emergencies: heapless::Deque<EmergencyMessage, EMERGENCY_RING_CAPACITY>,

    /// Index of the attached slave in the master's slave array. `None` until
    /// a scan found a matching slave.
    pub(crate) slave_index: Option<usize>,
}

impl SlaveConfig {
    pub(crate) fn new(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_code,
            ..Self::default()
        }
    }

    /// The `(alias, position)` address of this config.
    pub fn address(&self) -> (u16, u16) {
        (self.alias, self.position)
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    /// Whether this config is currently attached to a slave.
    pub fn is_attached(&self) -> bool {
        self.slave_index.is_some()
    }

    /// Set the watchdog divider and sync manager watchdog intervals.
    pub fn set_watchdog(&mut self, divider: u16, intervals: u16) {
        self.watchdog_divider = Some(divider);
        self.watchdog_intervals = Some(intervals);
    }

    /// Enable distributed clocks for this slave.
    pub fn set_dc(&mut self, dc: DcConfig) {
        self.dc = Some(dc);
    }

    /// Queue an SDO download to be applied during every configuration run,
    /// in insertion order.
    pub fn add_sdo_config(&mut self, index: u16, sub_index: u8, data: &[u8]) {
        self.sdo_configs.push(SdoConfig {
            index,
            sub_index,
            complete_access: false,
            data: data.to_vec(),
        });
    }

    /// Queue a complete-access SDO download covering all subindices.
    pub fn add_complete_sdo_config(&mut self, index: u16, data: &[u8]) {
        self.sdo_configs.push(SdoConfig {
            index,
            sub_index: 0,
            complete_access: true,
            data: data.to_vec(),
        });
    }

    /// Configure the PDO assignment (and mapping, for PDOs with entries) of
    /// one sync manager.
    pub fn config_sm_pdos(&mut self, sync_index: u8, pdos: PdoList) {
        self.sm_pdos[usize::from(sync_index)] = Some(pdos);
    }

    /// Pop the oldest pending emergency message, if any.
    pub fn pop_emergency(&mut self) -> Option<EmergencyMessage> {
        self.emergencies.pop_front()
    }

    pub(crate) fn push_emergency(&mut self, message: EmergencyMessage) {
        if self.emergencies.is_full() {
            self.emergencies.pop_front();
        }

        // Cannot fail, one slot was just freed if needed
        let _ = self.emergencies.push_back(message);
    }

    /// Whether `slave` matches this config's identity.
    pub(crate) fn matches(&self, slave: &Slave) -> bool {
        self.vendor_id == slave.vendor_id() && self.product_code == slave.product_code()
    }

    /// Point this config at the slave at `slave_index`. Idempotent, so it can
    /// be re-run after every scan.
    pub(crate) fn attach(&mut self, slave_index: usize, slave: &Slave) {
        if self.slave_index == Some(slave_index) {
            return;
        }

        fmt::debug!(
            "Attaching config ({}, {}) to slave {:#06x}",
            self.alias,
            self.position,
            slave.station_address
        );

        self.slave_index = Some(slave_index);
    }

    pub(crate) fn detach(&mut self) {
        if self.slave_index.is_some() {
            fmt::debug!(
                "Detaching config ({}, {})",
                self.alias,
                self.position
            );
        }

        self.slave_index = None;
    }
}

/// Resolve every config against the scanned slaves and (re)attach matches.
///
/// Idempotent; runs after every scan and whenever a config is added. A
/// config whose alias/position resolves to no slave, or whose identity does
/// not match the slave found there, is detached.
pub(crate) fn attach_all(slaves: &mut [Slave], configs: &mut [SlaveConfig]) {
    for (config_index, config) in configs.iter_mut().enumerate() {
        let (alias, position) = config.address();

        let resolved = if alias != 0 {
            slaves
                .iter()
                .position(|slave| slave.alias() == alias)
                .map(|base| base + usize::from(position))
        } else {
            Some(usize::from(position))
        };

        let Some(slave_index) = resolved.filter(|index| *index < slaves.len()) else {
            config.detach();
            continue;
        };

        let slave = &mut slaves[slave_index];

        if !config.matches(slave) {
            fmt::warn!(
                "Slave {:#06x} ({:#010x}/{:#010x}) does not match config \
                 ({}, {}) expecting {:#010x}/{:#010x}",
                slave.station_address(),
                slave.vendor_id(),
                slave.product_code(),
                alias,
                position,
                config.vendor_id(),
                config.product_code()
            );

            config.detach();
            continue;
        }

        config.attach(slave_index, slave);
        slave.config_index = Some(config_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_ring_overwrites_oldest() {
        let mut config = SlaveConfig::new(0, 0, 0, 0);

        for i in 0..40u16 {
            config.push_emergency(EmergencyMessage {
                error_code: i,
                error_register: 0,
                data: [0; 5],
            });
        }

        // The first eight were pushed out
        assert_eq!(config.pop_emergency().unwrap().error_code, 8);
        assert_eq!(config.emergencies.len(), 31);
    }

    #[test]
    fn sdo_configs_keep_insertion_order() {
        let mut config = SlaveConfig::new(0, 0, 2, 0x0c1e);

        config.add_sdo_config(0x8000, 1, &[0x01]);
        config.add_sdo_config(0x6040, 0, &[0x06, 0x00]);

        assert_eq!(config.sdo_configs[0].index, 0x8000);
        assert_eq!(config.sdo_configs[1].index, 0x6040);
    }
}
