//! Mailbox framing, shared by every mailbox protocol.

use bitflags::bitflags;

/// Mailbox header length on the wire.
pub(crate) const MAILBOX_HEADER_LEN: usize = 6;

/// Mailbox priority.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    #[default]
    Lowest = 0x00,
    Low = 0x01,
    High = 0x02,
    Highest = 0x03,
}

/// Mailbox protocol selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MailboxType {
    /// Error reply (ERR).
    Err = 0x00,
    /// ADS over EtherCAT (AoE).
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE).
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE).
    Coe = 0x03,
    /// File Access over EtherCAT (FoE).
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE).
    Soe = 0x05,
    // 0x06-0x0e reserved
    /// Vendor specific (VoE).
    VendorSpecific = 0x0f,
}

/// Mailbox header.
///
/// Defined in ETG1000.6 under `TMBXHEADER`, e.g. Table 29 – CoE Elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Mailbox data payload length, headers excluded.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Station address of the source (slave to master) or destination (master
    /// to slave).
    #[wire(bytes = 2)]
    pub address: u16,
    // channel: u6, unused by this master
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: Priority,
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Sequence counter, 1 to 7 inclusive. Wraps to 1, 0 is reserved.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
}

impl MailboxHeader {
    pub(crate) fn new(length: u16, mailbox_type: MailboxType, counter: u8) -> Self {
        Self {
            length,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type,
            counter,
        }
    }
}

/// Advance a mailbox sequence counter, skipping the reserved value 0.
pub(crate) fn next_counter(counter: &mut u8) -> u8 {
    *counter = if *counter >= 7 { 1 } else { *counter + 1 };

    *counter
}

/// A mailbox error code carried by an `ERR` type reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MailboxErrorCode(pub u16);

impl MailboxErrorCode {
    const TABLE: &'static [(u16, &'static str)] = &[
        (0x0001, "Syntax of 6 octet mailbox header is wrong"),
        (0x0002, "The mailbox protocol is not supported"),
        (0x0003, "Channel field contains wrong value"),
        (0x0004, "The service in the mailbox protocol is not supported"),
        (0x0005, "The mailbox protocol header is wrong"),
        (0x0006, "The length of the received mailbox data is too short"),
        (0x0007, "No more memory in slave"),
        (0x0008, "The length of the data is inconsistent"),
    ];

    /// The fixed text for a known code.
    pub fn message(self) -> Option<&'static str> {
        Self::TABLE
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, message)| *message)
    }
}

impl core::fmt::Display for MailboxErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{:#06x}: {}", self.0, message),
            None => write!(f, "{:#06x}: unknown mailbox error code", self.0),
        }
    }
}

/// Parse the error code out of an `ERR` type mailbox payload.
///
/// The payload is `u16` command (always 0x01) followed by the `u16` code.
pub(crate) fn parse_error_reply(payload: &[u8]) -> Option<MailboxErrorCode> {
    if payload.len() < 4 {
        return None;
    }

    Some(MailboxErrorCode(u16::from_le_bytes([
        payload[2], payload[3],
    ])))
}

bitflags! {
    /// Mailbox protocols a slave declares support for in its SII word
    /// `0x001C`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CAN application protocol over EtherCAT.
        const COE = 0x0004;
        /// File Access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific.
        const VOE = 0x0020;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn header_image() {
        let header = MailboxHeader::new(10, MailboxType::Coe, 3);

        let mut buf = [0u8; 6];

        header.pack_to_slice(&mut buf).unwrap();

        assert_eq!(buf, [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33]);
    }

    #[test]
    fn header_decode() {
        let raw = [0x0au8, 0x00, 0x01, 0x10, 0x00, 0x23];

        let header = MailboxHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(header.length, 10);
        assert_eq!(header.address, 0x1001);
        assert_eq!(header.mailbox_type, MailboxType::Coe);
        assert_eq!(header.counter, 2);
    }

    #[test]
    fn counter_skips_zero() {
        let mut counter = 6;

        assert_eq!(next_counter(&mut counter), 7);
        assert_eq!(next_counter(&mut counter), 1);
        assert_eq!(next_counter(&mut counter), 2);
    }

    #[test]
    fn error_reply() {
        let payload = [0x01, 0x00, 0x02, 0x00];

        let code = parse_error_reply(&payload).unwrap();

        assert_eq!(code, MailboxErrorCode(0x0002));
        assert_eq!(
            code.to_string(),
            "0x0002: The mailbox protocol is not supported"
        );
    }
}
