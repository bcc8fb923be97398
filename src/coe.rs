//! CANopen over EtherCAT (CoE) headers, SDO command specifiers and abort
//! codes.

/// CoE header length on the wire.
pub(crate) const COE_HEADER_LEN: usize = 2;

/// CoE service numbers, ETG1000.6 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CoeService {
    /// Emergency.
    Emergency = 0x01,
    /// SDO Request.
    SdoRequest = 0x02,
    /// SDO Response.
    SdoResponse = 0x03,
    /// TxPDO.
    TxPdo = 0x04,
    /// RxPDO.
    RxPdo = 0x05,
    /// TxPDO remote request.
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request.
    RxPdoRemoteRequest = 0x07,
    /// SDO Information.
    SdoInformation = 0x08,
}

/// CoE header: `number:9 | reserved:3 | service:4`.
///
/// Defined in ETG1000.6 Section 5.6.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct CoeHeader {
    #[wire(pre_skip = 12, bits = 4)]
    pub service: CoeService,
}

/// SDO command specifier values for the 3 bit `command` field of
/// [`SdoHeader`] and [`SdoSegmentHeader`].
///
/// Request (client) and response (server) specifiers overlap numerically but
/// mean different things; both sets are listed here.
pub(crate) mod sdo_command {
    /// Download segment request.
    pub const CCS_DOWNLOAD_SEGMENT: u8 = 0x00;
    /// Initiate download request.
    pub const CCS_DOWNLOAD: u8 = 0x01;
    /// Initiate upload request.
    pub const CCS_UPLOAD: u8 = 0x02;
    /// Upload segment request.
    pub const CCS_UPLOAD_SEGMENT: u8 = 0x03;

    /// Upload segment response.
    pub const SCS_UPLOAD_SEGMENT: u8 = 0x00;
    /// Download segment response.
    pub const SCS_DOWNLOAD_SEGMENT: u8 = 0x01;
    /// Initiate upload response.
    pub const SCS_UPLOAD: u8 = 0x02;
    /// Initiate download response.
    pub const SCS_DOWNLOAD: u8 = 0x03;

    /// Abort transfer, in either direction.
    pub const ABORT: u8 = 0x04;
}

/// SDO initiate header, request or response.
///
/// Defined in ETG1000.6 Section 5.6.2.1.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 4)]
pub struct SdoHeader {
    /// Data set size is indicated (expedited transfers).
    #[wire(bits = 1)]
    pub size_indicator: bool,
    /// Expedited transfer: up to 4 data bytes live in the initiate frame
    /// itself.
    #[wire(bits = 1)]
    pub expedited: bool,
    /// For expedited transfers, the number of bytes of the 4 byte data field
    /// that do *not* contain data.
    #[wire(bits = 2)]
    pub size: u8,
    /// Complete access: transfer the whole object including all subindices.
    #[wire(bits = 1)]
    pub complete_access: bool,
    /// Command specifier, see [`sdo_command`].
    #[wire(bits = 3)]
    pub command: u8,
    /// Object index.
    #[wire(bytes = 2)]
    pub index: u16,
    /// Object subindex.
    #[wire(bytes = 1)]
    pub sub_index: u8,
}

/// SDO segment header (single byte, follows the CoE header in segment
/// requests and responses).
///
/// Defined in ETG1000.6 Section 5.6.2.3.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct SdoSegmentHeader {
    /// Last segment of the transfer.
    #[wire(bits = 1)]
    pub is_last: bool,
    /// Number of bytes of a minimal 7 byte segment that do not contain data.
    #[wire(bits = 3)]
    pub seg_data_size: u8,
    /// Toggle bit, alternating 0, 1, 0, 1, … starting at 0.
    #[wire(bits = 1)]
    pub toggle: bool,
    /// Command specifier, see [`sdo_command`].
    #[wire(bits = 3)]
    pub command: u8,
}

/// SDO information service opcodes, ETG1000.6 5.6.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SdoInfoOpCode {
    GetObjectDescriptionListRequest = 0x01,
    GetObjectDescriptionListResponse = 0x02,
    GetObjectDescriptionRequest = 0x03,
    GetObjectDescriptionResponse = 0x04,
    GetEntryDescriptionRequest = 0x05,
    GetEntryDescriptionResponse = 0x06,
    SdoInfoErrorRequest = 0x07,
}

/// SDO information service header, follows the CoE header.
///
/// Defined in ETG1000.6 5.6.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 4)]
pub struct SdoInfoHeader {
    #[wire(bits = 7)]
    pub op_code: SdoInfoOpCode,
    /// More fragments follow this response.
    #[wire(bits = 1)]
    pub incomplete: bool,
    /// Number of fragments which still follow.
    #[wire(pre_skip = 8, bytes = 2)]
    pub fragments_left: u16,
}

/// A CoE emergency message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct EmergencyMessage {
    /// Error code, device profile specific.
    #[wire(bytes = 2)]
    pub error_code: u16,
    /// CANopen error register.
    #[wire(bytes = 1)]
    pub error_register: u8,
    /// Manufacturer specific error data.
    #[wire(bytes = 5)]
    pub data: [u8; 5],
}

impl core::fmt::Display for EmergencyMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "code {:#06x}, register {:#04x}, data {:02x} {:02x} {:02x} {:02x} {:02x}",
            self.error_code,
            self.error_register,
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
            self.data[4]
        )
    }
}

/// An SDO abort code.
///
/// Known codes are mapped to the texts of ETG1000.6 Table 41; unknown codes
/// are reported numerically.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoeAbortCode(pub u32);

impl CoeAbortCode {
    /// SDO protocol timeout, also used by this master when a response never
    /// arrives.
    pub const TIMEOUT: Self = Self(0x05040000);

    /// The object does not exist in the object directory.
    pub const NOT_FOUND: Self = Self(0x06020000);

    /// Subindex does not exist.
    pub const SUBINDEX_NOT_FOUND: Self = Self(0x06090011);

    /// Toggle bit not changed.
    pub const TOGGLE: Self = Self(0x05030000);

    const TABLE: &'static [(u32, &'static str)] = &[
        (0x05030000, "Toggle bit not changed"),
        (0x05040000, "SDO protocol timeout"),
        (0x05040001, "Client/Server command specifier not valid or unknown"),
        (0x05040005, "Out of memory"),
        (0x06010000, "Unsupported access to an object"),
        (0x06010001, "Attempt to read a write-only object"),
        (0x06010002, "Attempt to write a read-only object"),
        (0x06010003, "Subindex cannot be written, SI0 must be 0 for write access"),
        (0x06010004, "SDO complete access not supported for variable length objects"),
        (0x06010005, "Object length exceeds mailbox size"),
        (0x06010006, "Object mapped to RxPDO, SDO download blocked"),
        (0x06020000, "This object does not exist in the object directory"),
        (0x06040041, "The object cannot be mapped into the PDO"),
        (0x06040042, "The number and length of the objects to be mapped would exceed the PDO length"),
        (0x06040043, "General parameter incompatibility reason"),
        (0x06040047, "General internal incompatibility in the device"),
        (0x06060000, "Access failed due to a hardware error"),
        (0x06070010, "Data type does not match, length of service parameter does not match"),
        (0x06070012, "Data type does not match, length of service parameter too high"),
        (0x06070013, "Data type does not match, length of service parameter too low"),
        (0x06090011, "Subindex does not exist"),
        (0x06090030, "Value range of parameter exceeded"),
        (0x06090031, "Value of parameter written too high"),
        (0x06090032, "Value of parameter written too low"),
        (0x06090036, "Maximum value is less than minimum value"),
        (0x08000000, "General error"),
        (0x08000020, "Data cannot be transferred or stored to the application"),
        (
            0x08000021,
            "Data cannot be transferred or stored to the application because of local control",
        ),
        (
            0x08000022,
            "Data cannot be transferred or stored to the application because of the present device state",
        ),
        (0x08000023, "Object dictionary dynamic generation fails or no object dictionary is present"),
    ];

    /// The fixed text for a known code.
    pub fn message(self) -> Option<&'static str> {
        Self::TABLE
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, message)| *message)
    }
}

impl From<u32> for CoeAbortCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{:#010x}: {}", self.0, message),
            None => write!(f, "{:#010x}: unknown abort code", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn coe_header_image() {
        let header = CoeHeader {
            service: CoeService::SdoRequest,
        };

        let mut buf = [0u8; 2];

        header.pack_to_slice(&mut buf).unwrap();

        assert_eq!(buf, [0x00, 0x20]);
    }

    #[test]
    fn expedited_download_specifier() {
        // 2 byte expedited download: size indicated, expedited, 2 unused
        // bytes, download command
        let header = SdoHeader {
            size_indicator: true,
            expedited: true,
            size: 2,
            complete_access: false,
            command: sdo_command::CCS_DOWNLOAD,
            index: 0x6040,
            sub_index: 0,
        };

        let mut buf = [0u8; 4];

        header.pack_to_slice(&mut buf).unwrap();

        assert_eq!(buf, [0x2b, 0x40, 0x60, 0x00]);
    }

    #[test]
    fn download_response_specifier() {
        let raw = [0x60u8, 0x40, 0x60, 0x00];

        let header = SdoHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(header.command, sdo_command::SCS_DOWNLOAD);
        assert_eq!(header.index, 0x6040);
    }

    #[test]
    fn segment_toggle() {
        let header = SdoSegmentHeader {
            is_last: false,
            seg_data_size: 0,
            toggle: true,
            command: sdo_command::CCS_UPLOAD_SEGMENT,
        };

        let mut buf = [0u8; 1];

        header.pack_to_slice(&mut buf).unwrap();

        assert_eq!(buf, [0x70]);
    }

    #[test]
    fn abort_code_text() {
        assert_eq!(
            CoeAbortCode(0x06020000).to_string(),
            "0x06020000: This object does not exist in the object directory"
        );
        assert_eq!(
            CoeAbortCode(0x12345678).to_string(),
            "0x12345678: unknown abort code"
        );
    }

    #[test]
    fn sdo_info_header() {
        let raw = [0x82u8, 0x00, 0x02, 0x00];

        let header = SdoInfoHeader::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            header.op_code,
            SdoInfoOpCode::GetObjectDescriptionListResponse
        );
        assert!(header.incomplete);
        assert_eq!(header.fragments_left, 2);
    }
}
