//! The slave model: everything the master learns about one device on the
//! ring, populated by the scan and configuration state machines.

pub mod ports;

use crate::al_status_code::AlStatusCode;
use crate::pdo::PdoList;
use crate::register::SupportFlags;
use crate::request::RequestHandle;
use crate::sii::{SiiCategories, SiiImage, SiiString};
use crate::slave_state::AlState;
use ports::Ports;
use std::collections::VecDeque;

/// Configured station addresses are assigned as `BASE_STATION_ADDRESS +
/// ring_position`; the first slave answers at `0x1001`.
pub(crate) const BASE_STATION_ADDRESS: u16 = 0x1001;

/// Access rights of an object dictionary entry, one bit per AL state, from
/// the SDO information entry description.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdoEntryAccess(pub u16);

impl SdoEntryAccess {
    pub fn readable_in(self, state: AlState) -> bool {
        match state {
            AlState::PreOp => self.0 & 0x0001 != 0,
            AlState::SafeOp => self.0 & 0x0002 != 0,
            AlState::Op => self.0 & 0x0004 != 0,
            _ => false,
        }
    }

    pub fn writable_in(self, state: AlState) -> bool {
        match state {
            AlState::PreOp => self.0 & 0x0008 != 0,
            AlState::SafeOp => self.0 & 0x0010 != 0,
            AlState::Op => self.0 & 0x0020 != 0,
            _ => false,
        }
    }
}

/// Description of one subindex of a dictionary object.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SdoEntryInfo {
    pub sub_index: u8,
    /// CoE data type index.
    pub data_type: u16,
    pub bit_length: u16,
    pub access: SdoEntryAccess,
    pub description: String,
}

/// One object of the slave's object dictionary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SdoObject {
    pub index: u16,
    /// CoE object code (7 = VAR, 8 = ARRAY, 9 = RECORD).
    pub object_code: u8,
    pub max_sub_index: u8,
    pub name: String,
    pub entries: Vec<SdoEntryInfo>,
}

/// Mailbox offsets and sizes a slave was actually configured with, as opposed
/// to what its SII declares.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfiguredMailbox {
    pub rx_offset: u16,
    pub rx_size: u16,
    pub tx_offset: u16,
    pub tx_size: u16,
}

impl ConfiguredMailbox {
    pub(crate) fn is_configured(&self) -> bool {
        self.rx_size > 0 && self.tx_size > 0
    }
}

/// One slave on the ring.
#[derive(Debug, Default)]
pub struct Slave {
    /// Position in the ring, starting at 0.
    pub(crate) ring_position: u16,
    /// Configured station address, `BASE_STATION_ADDRESS + ring_position`.
    pub(crate) station_address: u16,
    /// Alias read back from register `0x0012` after the SII fetch.
    pub(crate) effective_alias: u16,

    // Base information from registers 0x0000..0x000B.
    pub(crate) base_type: u8,
    pub(crate) base_revision: u8,
    pub(crate) base_build: u16,
    pub(crate) base_fmmu_count: u8,
    pub(crate) base_sync_count: u8,
    pub(crate) flags: SupportFlags,
    /// The slave answered a read of the system time register `0x0910`, i.e.
    /// it implements DC system time and not just the receive time latches.
    pub(crate) has_dc_system_time: bool,

    pub(crate) ports: Ports,

    pub(crate) sii_image: SiiImage,
    pub(crate) sii: SiiCategories,

    pub(crate) current_state: AlState,
    pub(crate) requested_state: AlState,
    /// Set when configuration failed; the slave is skipped until explicitly
    /// reset.
    pub(crate) error_flag: bool,
    pub(crate) last_al_status_code: Option<AlStatusCode>,

    pub(crate) configured_mailbox: ConfiguredMailbox,
    /// Mailbox sequence counter, 1..=7.
    pub(crate) mailbox_counter: u8,

    /// Index of the attached [`SlaveConfig`](crate::SlaveConfig), if any.
    pub(crate) config_index: Option<usize>,

    /// One way delay from the reference clock, ns. Written to register
    /// `0x0928`.
    pub(crate) transmission_delay: u32,

    /// PDO assignment and mapping per sync manager, as read from (or written
    /// to) the `0x1C1x` and `0x16xx`/`0x1Axx` objects. Indexed by sync
    /// manager.
    pub(crate) sync_pdos: Vec<PdoList>,

    /// Object dictionary, populated on demand by the dictionary scan.
    pub(crate) dictionary: Vec<SdoObject>,

    /// External requests waiting to be serviced for this slave.
    pub(crate) requests: VecDeque<RequestHandle>,
}

impl Slave {
    pub(crate) fn new(ring_position: u16) -> Self {
        Self {
            ring_position,
            station_address: BASE_STATION_ADDRESS + ring_position,
            requested_state: AlState::PreOp,
            mailbox_counter: 7,
            sync_pdos: vec![PdoList::new(); 16],
            ..Self::default()
        }
    }

    /// Position of this slave in the ring, starting at 0.
    pub fn ring_position(&self) -> u16 {
        self.ring_position
    }

    /// The station address assigned by the master.
    pub fn station_address(&self) -> u16 {
        self.station_address
    }

    /// The alias read from register `0x0012`, 0 if none is set.
    pub fn alias(&self) -> u16 {
        self.effective_alias
    }

    /// Current AL state as of the last state read.
    pub fn state(&self) -> AlState {
        self.current_state
    }

    /// Base information from registers `0x0000..0x0005`:
    /// `(type, revision, build, FMMU count, sync manager count)`.
    pub fn base_info(&self) -> (u8, u8, u16, u8, u8) {
        (
            self.base_type,
            self.base_revision,
            self.base_build,
            self.base_fmmu_count,
            self.base_sync_count,
        )
    }

    /// The AL status code reported by the slave's last refused or failed
    /// state transition.
    pub fn last_al_status_code(&self) -> Option<AlStatusCode> {
        self.last_al_status_code
    }

    /// Whether configuration of this slave failed.
    pub fn error_flag(&self) -> bool {
        self.error_flag
    }

    pub fn vendor_id(&self) -> u32 {
        self.sii_image.vendor_id()
    }

    pub fn product_code(&self) -> u32 {
        self.sii_image.product_code()
    }

    pub fn revision_number(&self) -> u32 {
        self.sii_image.revision_number()
    }

    pub fn serial_number(&self) -> u32 {
        self.sii_image.serial_number()
    }

    /// The device name from the SII general category, empty if none.
    pub fn name(&self) -> SiiString {
        self.sii
            .general
            .as_ref()
            .map(|general| general.name.clone())
            .unwrap_or_default()
    }

    /// The mailbox layout this slave was configured with:
    /// `(rx offset, rx size, tx offset, tx size)`. All zero before
    /// configuration.
    pub fn mailbox_layout(&self) -> (u16, u16, u16, u16) {
        (
            self.configured_mailbox.rx_offset,
            self.configured_mailbox.rx_size,
            self.configured_mailbox.tx_offset,
            self.configured_mailbox.tx_size,
        )
    }

    /// Whether this slave declares any mailbox protocol support.
    pub fn has_mailbox(&self) -> bool {
        !self.sii_image.mailbox_protocols().is_empty()
    }

    /// Whether this slave supports CoE.
    pub fn has_coe(&self) -> bool {
        self.sii_image
            .mailbox_protocols()
            .contains(crate::mailbox::MailboxProtocols::COE)
    }

    /// Whether this slave takes part in distributed clocks.
    pub fn dc_capable(&self) -> bool {
        self.flags.dc_supported
    }

    /// The object dictionary discovered by the dictionary scan.
    pub fn dictionary(&self) -> &[SdoObject] {
        &self.dictionary
    }

    /// Clear the error flag so the master retries configuration.
    pub fn reset_error(&mut self) {
        self.error_flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_address_from_ring_position() {
        assert_eq!(Slave::new(0).station_address(), 0x1001);
        assert_eq!(Slave::new(1).station_address(), 0x1002);
        assert_eq!(Slave::new(0x0ffe).station_address(), 0x1fff);
    }

    #[test]
    fn entry_access_bits() {
        let access = SdoEntryAccess(0x0007 | 0x0008);

        assert!(access.readable_in(AlState::PreOp));
        assert!(access.readable_in(AlState::Op));
        assert!(access.writable_in(AlState::PreOp));
        assert!(!access.writable_in(AlState::SafeOp));
        assert!(!access.readable_in(AlState::Init));
    }
}
