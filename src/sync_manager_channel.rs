//! Sync manager channel register pages, written to `0x0800 + 8·i`.

use core::fmt;

/// Sync manager channel page.
///
/// Defined in ETG1000.4 6.7.2.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    #[wire(bytes = 2)]
    pub physical_start_address: u16,
    #[wire(bytes = 2)]
    pub length_bytes: u16,
    #[wire(bytes = 1)]
    pub control: Control,
    #[wire(bytes = 1)]
    pub status: Status,
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// Mailbox sync manager written by the master (SM0).
    pub(crate) fn mailbox_write(offset: u16, size: u16) -> Self {
        Self {
            physical_start_address: offset,
            length_bytes: size,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MasterWrite,
                dls_user_event_enable: true,
                ..Control::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Enable::default()
            },
        }
    }

    /// Mailbox sync manager read by the master (SM1).
    pub(crate) fn mailbox_read(offset: u16, size: u16) -> Self {
        Self {
            physical_start_address: offset,
            length_bytes: size,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction: Direction::MasterRead,
                dls_user_event_enable: true,
                ..Control::default()
            },
            status: Status::default(),
            enable: Enable {
                enable: true,
                ..Enable::default()
            },
        }
    }

    /// Buffered process data sync manager.
    pub(crate) fn process_data(
        offset: u16,
        size: u16,
        direction: Direction,
        watchdog: bool,
    ) -> Self {
        Self {
            physical_start_address: offset,
            length_bytes: size,
            control: Control {
                operation_mode: OperationMode::Normal,
                direction,
                watchdog_enable: watchdog,
                ..Control::default()
            },
            status: Status::default(),
            enable: Enable {
                // A zero length channel must stay disabled
                enable: size > 0,
                ..Enable::default()
            },
        }
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field(
                "length_bytes",
                &format_args!("{:#06x} ({})", self.length_bytes, self.length_bytes),
            )
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "start {:#06x}, size {}, direction {:?}, mode {:?}, {}",
            self.physical_start_address,
            self.length_bytes,
            self.control.direction,
            self.control.operation_mode,
            if self.enable.enable {
                "enabled"
            } else {
                "disabled"
            },
        ))
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Control {
    #[wire(bits = 2)]
    pub operation_mode: OperationMode,
    #[wire(bits = 2)]
    pub direction: Direction,
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    #[wire(bits = 1)]
    pub dls_user_event_enable: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub watchdog_enable: bool,
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Status {
    #[wire(bits = 1)]
    pub has_write_event: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub has_read_event: bool,
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    #[wire(bits = 2)]
    pub buffer_state: BufferState,
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// Described in ETG1000.4 6.7.2 Sync Manager Attributes.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct Enable {
    #[wire(bits = 1)]
    pub enable: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    /// DC Event 0 with EtherCAT write.
    #[wire(bits = 1)]
    pub enable_dc_event_bus_write: bool,
    /// DC Event 0 with local write.
    #[wire(bits = 1)]
    pub enable_dc_event_local_write: bool,
    #[wire(bits = 1)]
    pub channel_pdi_disabled: bool,
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0x00,
    Mailbox = 0x02,
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum Direction {
    /// Process data inputs or the slave-to-master mailbox.
    #[default]
    MasterRead = 0x00,
    /// Process data outputs or the master-to-slave mailbox.
    MasterWrite = 0x01,
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum BufferState {
    #[default]
    First = 0x00,
    Second = 0x01,
    Third = 0x02,
    Next = 0x03,
}
