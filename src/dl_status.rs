//! DL status register `0x0110`, ETG1000.4 Table 34.

/// Data link layer status of one slave.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct DlStatus {
    #[wire(bits = 1)]
    pub pdi_operational: bool,
    #[wire(bits = 1)]
    pub watchdog_ok: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub extended_link_detection: bool,
    /// True if port 0 has a physical link present.
    #[wire(bits = 1)]
    pub link_port0: bool,
    /// True if port 1 has a physical link present.
    #[wire(bits = 1)]
    pub link_port1: bool,
    /// True if port 2 has a physical link present.
    #[wire(bits = 1)]
    pub link_port2: bool,
    /// True if port 3 has a physical link present.
    #[wire(bits = 1)]
    pub link_port3: bool,
    /// True if port 0 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port0: bool,
    /// RX signal detected on port 0.
    #[wire(bits = 1)]
    pub signal_port0: bool,
    /// True if port 1 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port1: bool,
    /// RX signal detected on port 1.
    #[wire(bits = 1)]
    pub signal_port1: bool,
    /// True if port 2 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port2: bool,
    /// RX signal detected on port 2.
    #[wire(bits = 1)]
    pub signal_port2: bool,
    /// True if port 3 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port3: bool,
    /// RX signal detected on port 3.
    #[wire(bits = 1)]
    pub signal_port3: bool,
}

impl DlStatus {
    /// Link state of a port by number.
    pub(crate) fn link(&self, port: usize) -> bool {
        match port {
            0 => self.link_port0,
            1 => self.link_port1,
            2 => self.link_port2,
            _ => self.link_port3,
        }
    }

    /// Loop state of a port by number.
    pub(crate) fn loopback(&self, port: usize) -> bool {
        match port {
            0 => self.loopback_port0,
            1 => self.loopback_port1,
            2 => self.loopback_port2,
            _ => self.loopback_port3,
        }
    }

    /// RX signal detection of a port by number.
    pub(crate) fn signal(&self, port: usize) -> bool {
        match port {
            0 => self.signal_port0,
            1 => self.signal_port1,
            2 => self.signal_port2,
            _ => self.signal_port3,
        }
    }
}
