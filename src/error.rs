//! Ferrocat error types.

use crate::al_status_code::AlStatusCode;
use crate::coe::CoeAbortCode;
use crate::mailbox::MailboxErrorCode;
use crate::slave_state::AlState;
use core::num::TryFromIntError;

/// Top level error type for all fallible operations in this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A low level error occurred when producing or consuming a datagram.
    Pdu(PduError),
    /// A working counter mismatch was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out.
    Timeout,
    /// The Ethernet link of the addressed device is down.
    ///
    /// Datagrams routed to a downed device fail fast with this error; there is
    /// no retry at this level.
    LinkDown,
    /// An SII (EEPROM) error was encountered.
    Sii(SiiError),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// An SDO transfer was aborted by the other side.
    ///
    /// The abort code is surfaced verbatim; [`CoeAbortCode`]'s `Display` impl
    /// maps known codes to text.
    SdoAbort(CoeAbortCode),
    /// A slave signalled an error through its AL status register.
    AlStatus(AlStatusCode),
    /// A slave refused or failed a requested state transition.
    StateTransition {
        /// The state that was requested.
        requested: AlState,
        /// The state the slave reported instead.
        actual: AlState,
    },
    /// There is a problem with the discovered bus topology.
    Topology,
    /// A fixed size buffer or list was not large enough to hold a given item.
    Capacity(Item),
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,
        /// An index into a list of items.
        index: Option<usize>,
    },
    /// An externally injected datagram did not fit into the cyclic byte budget
    /// before its injection timeout elapsed.
    BudgetExceeded,
    /// A pending request was withdrawn by its caller.
    Cancelled,
    /// The operation is not permitted in the master's current phase.
    Phase,
    /// A value could not be converted into a narrower integer type.
    IntegerTypeConversion,
    /// An error occurred encoding or decoding an item.
    Wire(ethercrab_wire::WireError),
    /// An internal error occurred. This indicates a bug in this crate.
    Internal,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::LinkDown => f.write_str("link is down"),
            Error::Sii(e) => write!(f, "SII: {}", e),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::SdoAbort(code) => write!(f, "SDO transfer aborted: {}", code),
            Error::AlStatus(code) => write!(f, "AL status error: {}", code),
            Error::StateTransition { requested, actual } => write!(
                f,
                "state transition to {} failed, slave is in {}",
                requested, actual
            ),
            Error::Topology => f.write_str("topology"),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::BudgetExceeded => {
                f.write_str("datagram did not fit into the cyclic byte budget")
            }
            Error::Cancelled => f.write_str("request cancelled"),
            Error::Phase => f.write_str("operation not permitted in current master phase"),
            Error::IntegerTypeConversion => {
                f.write_str("failed to convert between integer types")
            }
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item being looked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Item {
    /// An EtherCAT slave device.
    Slave,
    /// A slave configuration.
    SlaveConfig,
    /// A process data domain.
    Domain,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync manager.
    SyncManager,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// A ring device.
    Device,
    /// An external datagram ring slot.
    RingSlot,
    /// An external request.
    Request,
}

/// Low level datagram/frame error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduError {
    /// Failed to decode raw datagram data into a given data type.
    Decode,
    /// Something went wrong when encoding/decoding the raw Ethernet II frame.
    Ethernet,
    /// Datagram payload is too long to fit in the given buffer.
    TooLong,
    /// A received frame failed its length self check and was discarded.
    CorruptedFrame,
    /// A frame or datagram was addressed to a device that does not exist.
    InvalidDevice,
    /// The datagram is in the wrong lifecycle state for the attempted
    /// operation.
    InvalidState,
    /// A station address of zero was used with a configured-address command.
    ZeroStationAddress,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw datagram data into type"),
            PduError::Ethernet => f.write_str("network"),
            PduError::TooLong => f.write_str("data is too long to fit in given buffer"),
            PduError::CorruptedFrame => f.write_str("received frame is corrupted"),
            PduError::InvalidDevice => f.write_str("no such device"),
            PduError::InvalidState => f.write_str("invalid datagram state"),
            PduError::ZeroStationAddress => {
                f.write_str("station address 0x0000 used with configured addressing")
            }
        }
    }
}

/// Mailbox transfer error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MailboxError {
    /// The slave returned a mailbox error response.
    Code(MailboxErrorCode),
    /// The slave has no mailbox but one is required for the attempted action.
    NoMailbox,
    /// The response to a mailbox request is malformed or has the wrong
    /// protocol.
    ResponseInvalid,
    /// Mailbox response data is too long for the given buffer.
    TooLong,
    /// The mailbox response did not arrive within the response timeout.
    NoResponse,
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Code(code) => write!(f, "error response {}", code),
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::ResponseInvalid => f.write_str("invalid response from device"),
            MailboxError::TooLong => f.write_str("returned data is too long"),
            MailboxError::NoResponse => f.write_str("no response within timeout"),
        }
    }
}

/// SII (EEPROM) access error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SiiError {
    /// Failed to decode data read from the EEPROM.
    Decode,
    /// A category header or the category walk overran the declared EEPROM
    /// size.
    SizeExceeded,
    /// The EEPROM interface reported an error condition.
    AccessError,
    /// A read operation did not complete within the poll budget.
    Busy,
}

impl core::fmt::Display for SiiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SiiError::Decode => f.write_str("failed to decode data"),
            SiiError::SizeExceeded => f.write_str("category walk exceeded EEPROM size"),
            SiiError::AccessError => f.write_str("EEPROM interface error"),
            SiiError::Busy => f.write_str("EEPROM interface stayed busy"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<SiiError> for Error {
    fn from(e: SiiError) -> Self {
        Self::Sii(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<CoeAbortCode> for Error {
    fn from(e: CoeAbortCode) -> Self {
        Self::SdoAbort(e)
    }
}

impl From<TryFromIntError> for Error {
    fn from(_e: TryFromIntError) -> Self {
        Self::IntegerTypeConversion
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(value: ethercrab_wire::WireError) -> Self {
        Self::Wire(value)
    }
}
