//! Slave register address map.
//!
//! Defined in ETG1000.4, Table 31 onwards.

/// Slave device register address abstraction.
///
/// This enum makes it easier to work with raw EtherCAT addresses by giving
/// them nice names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum RegisterAddress {
    /// Type, `u8`.
    Type = 0x0000u16,
    /// EtherCAT revision, `u8`.
    Revision = 0x0001,
    /// Slave build, `u16`.
    Build = 0x0002,
    /// Number of supported FMMU entities, `u8`.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels, `u8`.
    SyncManagerChannels = 0x0005,
    /// RAM size in kilo-octets (1024 octets), `u8`.
    RamSize = 0x0006,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// Feature support flags, `u16`.
    SupportFlags = 0x0008,
    /// The slave's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The slave's station alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// ESC DL control, `u16`.
    DlControl = 0x0100,
    /// DL status, `u16`. ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// Application Layer (AL) control register, `u8`. ETG1000.4 Table 35.
    AlControl = 0x0120,
    /// Application Layer (AL) status register, `u8`.
    AlStatus = 0x0130,
    /// Application Layer (AL) status code register, `u16`.
    AlStatusCode = 0x0134,

    /// Watchdog divider, `u16`. ETG1000.4 section 6.3.
    WatchdogDivider = 0x0400,
    /// PDI watchdog timeout, `u16`.
    PdiWatchdog = 0x0410,
    /// Sync manager (process data) watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// EEPROM (SII) access config/assignment register, `u16`.
    SiiAccess = 0x0500,
    /// EEPROM (SII) control/status register, `u16`.
    SiiControl = 0x0502,
    /// EEPROM (SII) word address register, `u16`.
    SiiAddress = 0x0504,
    /// EEPROM (SII) data register, 4 bytes on read.
    SiiData = 0x0508,

    /// First Fieldbus Memory Management Unit (FMMU) page. Pages are 16 bytes
    /// apart, see [`RegisterAddress::fmmu`]. ETG1000.4 Table 57.
    Fmmu0 = 0x0600,

    /// First sync manager page. Pages are 8 bytes apart, see
    /// [`RegisterAddress::sync_manager`]. ETG1000.4 Table 59.
    Sm0 = 0x0800,

    /// Distributed clock (DC) port 0 receive time in ns. Ports 1-3 follow at
    /// 4 byte intervals. ETG1000.4 Table 60.
    DcTimePort0 = 0x0900,
    /// DC system time, `u64`.
    DcSystemTime = 0x0910,
    /// DC system time offset, `u64`.
    DcSystemTimeOffset = 0x0920,
    /// DC transmission delay, `u32`.
    DcTransmissionDelay = 0x0928,
    /// DC system time difference (drift), `u32` with sign-magnitude encoding.
    DcSystemTimeDifference = 0x092C,

    /// DC sync unit activation (assign/activate), `u16`.
    DcActivation = 0x0980,
    /// DC cyclic operation start time, `u64`.
    DcSyncStartTime = 0x0990,
    /// DC SYNC0 cycle time in ns, `u32`.
    DcSync0CycleTime = 0x09A0,
    /// DC SYNC1 cycle time in ns, `u32`.
    DcSync1CycleTime = 0x09A4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// FMMU page base address by index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(index < 16, "bad FMMU index {}", index);

        Self::Fmmu0 as u16 + u16::from(index) * 0x10
    }

    /// Sync manager page base address by index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(index < 16, "bad SM index {}", index);

        Self::Sm0 as u16 + u16::from(index) * 0x08
    }

    /// Sync manager status byte address by SM index.
    ///
    /// The status register is the 6th byte of the SM page.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }
}

/// ESC feature support flags, register `0x0008`.
#[derive(Default, Clone, Copy, Debug, PartialEq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct SupportFlags {
    #[wire(bits = 1)]
    pub fmmu_supports_bit_ops: bool,
    #[wire(bits = 1)]
    pub reserved_register_support: bool,
    #[wire(bits = 1)]
    pub dc_supported: bool,
    #[wire(bits = 1)]
    pub has_64bit_dc: bool,
    #[wire(bits = 1)]
    pub low_jitter: bool,
    #[wire(bits = 1)]
    pub ebus_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub mii_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub separate_fcs_error_handling: bool,
    #[wire(bits = 1)]
    pub enhanced_dc_sync: bool,
    #[wire(bits = 1)]
    pub lrw_supported: bool,
    #[wire(bits = 1)]
    pub brw_aprw_fprw_supported: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub special_fmmu: bool,
}

impl core::fmt::Display for SupportFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DC: ")?;

        if self.dc_supported {
            f.write_str("yes")?;

            if self.has_64bit_dc {
                f.write_str(" (64 bit)")?;
            } else {
                f.write_str(" (32 bit)")?;
            }
        } else {
            f.write_str("no")?;
        }

        if !self.lrw_supported {
            f.write_str(", no LRW")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn page_addresses() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(2), 0x0620);
        assert_eq!(RegisterAddress::sync_manager(0), 0x0800);
        assert_eq!(RegisterAddress::sync_manager(3), 0x0818);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080d);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn support_flags_fuzz() {
        heckcheck::check(|status: SupportFlags| {
            let mut buf = [0u8; 2];

            let packed = status.pack_to_slice(&mut buf).expect("Pack");

            let unpacked = SupportFlags::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }
}
