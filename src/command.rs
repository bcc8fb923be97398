//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, etc.

use ethercrab_wire::EtherCrabWireWrite;

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0A;
const LWR: u8 = 0x0B;
const LRW: u8 = 0x0C;
const ARMW: u8 = 0x0D;
const FRMW: u8 = 0x0E;

/// Datagram command with its typed address.
///
/// Auto-increment (`Ap*`, `Armw`) commands address a slave by ring position
/// which is negated on the wire; configured-address (`Fp*`, `Frmw`) commands
/// use the station address assigned during the scan; broadcast (`B*`)
/// commands address every slave; logical (`L*`) commands carry a 32 bit
/// offset into the master's logical process data space.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// No operation.
    #[default]
    Nop,
    /// Auto-increment physical read.
    Aprd {
        /// Ring position, 0 for the first slave.
        position: u16,
        /// Physical register address.
        register: u16,
    },
    /// Auto-increment physical write.
    Apwr {
        /// Ring position.
        position: u16,
        /// Physical register address.
        register: u16,
    },
    /// Auto-increment physical read/write.
    Aprw {
        /// Ring position.
        position: u16,
        /// Physical register address.
        register: u16,
    },
    /// Configured address physical read.
    Fprd {
        /// Configured station address.
        station: u16,
        /// Physical register address.
        register: u16,
    },
    /// Configured address physical write.
    Fpwr {
        /// Configured station address.
        station: u16,
        /// Physical register address.
        register: u16,
    },
    /// Configured address physical read/write.
    Fprw {
        /// Configured station address.
        station: u16,
        /// Physical register address.
        register: u16,
    },
    /// Broadcast read.
    Brd {
        /// Physical register address.
        register: u16,
    },
    /// Broadcast write.
    Bwr {
        /// Physical register address.
        register: u16,
    },
    /// Broadcast read/write.
    Brw {
        /// Physical register address.
        register: u16,
    },
    /// Logical read.
    Lrd {
        /// Logical address.
        address: u32,
    },
    /// Logical write.
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// Logical read/write.
    Lrw {
        /// Logical address.
        address: u32,
    },
    /// Auto-increment read, multiple write.
    Armw {
        /// Ring position.
        position: u16,
        /// Physical register address.
        register: u16,
    },
    /// Configured address read, multiple write.
    ///
    /// Distributes a value read from one slave to all others on the network,
    /// e.g. the system time of the distributed clock reference.
    Frmw {
        /// Configured station address.
        station: u16,
        /// Physical register address.
        register: u16,
    },
}

impl Command {
    /// The command code transmitted on the wire.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,
            Self::Aprd { .. } => APRD,
            Self::Apwr { .. } => APWR,
            Self::Aprw { .. } => APRW,
            Self::Fprd { .. } => FPRD,
            Self::Fpwr { .. } => FPWR,
            Self::Fprw { .. } => FPRW,
            Self::Brd { .. } => BRD,
            Self::Bwr { .. } => BWR,
            Self::Brw { .. } => BRW,
            Self::Lrd { .. } => LRD,
            Self::Lwr { .. } => LWR,
            Self::Lrw { .. } => LRW,
            Self::Armw { .. } => ARMW,
            Self::Frmw { .. } => FRMW,
        }
    }

    /// Whether the response carries read data that must be copied back into
    /// the datagram's payload buffer.
    pub(crate) const fn is_read_like(&self) -> bool {
        matches!(
            self,
            Self::Aprd { .. }
                | Self::Aprw { .. }
                | Self::Fprd { .. }
                | Self::Fprw { .. }
                | Self::Brd { .. }
                | Self::Brw { .. }
                | Self::Lrd { .. }
                | Self::Lrw { .. }
                | Self::Armw { .. }
                | Self::Frmw { .. }
        )
    }

    /// Pack the 4 byte address field.
    ///
    /// Auto-increment positions are negated so that each slave that forwards
    /// the datagram increments the field, and the slave reading zero executes
    /// it.
    pub(crate) fn pack_address(&self, buf: &mut [u8; 4]) {
        match *self {
            Command::Nop => buf.fill(0),
            Command::Aprd { position, register }
            | Command::Apwr { position, register }
            | Command::Aprw { position, register }
            | Command::Armw { position, register } => {
                buf[0..2].copy_from_slice(&0u16.wrapping_sub(position).to_le_bytes());
                buf[2..4].copy_from_slice(&register.to_le_bytes());
            }
            Command::Fprd { station, register }
            | Command::Fpwr { station, register }
            | Command::Fprw { station, register }
            | Command::Frmw { station, register } => {
                buf[0..2].copy_from_slice(&station.to_le_bytes());
                buf[2..4].copy_from_slice(&register.to_le_bytes());
            }
            Command::Brd { register } | Command::Bwr { register } | Command::Brw { register } => {
                buf[0..2].fill(0);
                buf[2..4].copy_from_slice(&register.to_le_bytes());
            }
            Command::Lrd { address } | Command::Lwr { address } | Command::Lrw { address } => {
                buf.copy_from_slice(&address.to_le_bytes());
            }
        }
    }
}

impl EtherCrabWireWrite for Command {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let mut addr = [0u8; 4];

        self.pack_address(&mut addr);

        buf[0..4].copy_from_slice(&addr);

        &buf[0..4]
    }

    fn packed_len(&self) -> usize {
        // Either 2x u16 or 1x u32
        4
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),
            Command::Aprd { position, register } => {
                write!(f, "APRD(pos {}, reg {:#06x})", position, register)
            }
            Command::Apwr { position, register } => {
                write!(f, "APWR(pos {}, reg {:#06x})", position, register)
            }
            Command::Aprw { position, register } => {
                write!(f, "APRW(pos {}, reg {:#06x})", position, register)
            }
            Command::Fprd { station, register } => {
                write!(f, "FPRD(addr {:#06x}, reg {:#06x})", station, register)
            }
            Command::Fpwr { station, register } => {
                write!(f, "FPWR(addr {:#06x}, reg {:#06x})", station, register)
            }
            Command::Fprw { station, register } => {
                write!(f, "FPRW(addr {:#06x}, reg {:#06x})", station, register)
            }
            Command::Brd { register } => write!(f, "BRD(reg {:#06x})", register),
            Command::Bwr { register } => write!(f, "BWR(reg {:#06x})", register),
            Command::Brw { register } => write!(f, "BRW(reg {:#06x})", register),
            Command::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
            Command::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
            Command::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
            Command::Armw { position, register } => {
                write!(f, "ARMW(pos {}, reg {:#06x})", position, register)
            }
            Command::Frmw { station, register } => {
                write!(f, "FRMW(addr {:#06x}, reg {:#06x})", station, register)
            }
        }
    }
}
