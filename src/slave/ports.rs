//! Per-slave port records: descriptors, link state, DC receive times and the
//! downstream topology links discovered during the scan.

/// Physical layer of one port, from the port descriptor register `0x0007`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortDescriptor {
    #[default]
    NotImplemented = 0x00,
    NotConfigured = 0x01,
    Ebus = 0x02,
    Mii = 0x03,
}

impl PortDescriptor {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x01 => Self::NotConfigured,
            0x02 => Self::Ebus,
            0x03 => Self::Mii,
            _ => Self::NotImplemented,
        }
    }
}

/// One of the four ports of a slave.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Port {
    /// The EtherCAT port number. Frames traverse ports in the order
    /// 0 → 3 → 1 → 2.
    pub number: usize,
    /// Physical layer descriptor.
    pub descriptor: PortDescriptor,
    /// Physical link detected.
    pub link_up: bool,
    /// Port forwards to itself (loop closed).
    pub loop_closed: bool,
    /// RX signal detected.
    pub signal_detected: bool,
    /// DC receive time latched at this port, ns.
    pub receive_time: u32,
    /// Index of the downstream slave connected to this port.
    pub downstream_to: Option<usize>,
    /// Propagation delay from this port to the next DC capable slave, ns.
    pub delay_to_next_dc: u32,
}

impl Port {
    /// Whether frames travel through this port to another slave.
    pub fn active(&self) -> bool {
        self.link_up && !self.loop_closed
    }
}

/// Shape of a slave within the topology, derived from its open port count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Two open ports: upstream and downstream neighbours only.
    Passthrough,
    /// One open port: last device of its branch.
    LineEnd,
    /// Three open ports: the slave forks the tree.
    Fork,
    /// Four open ports.
    Cross,
}

impl Topology {
    pub(crate) fn is_junction(&self) -> bool {
        matches!(self, Self::Fork | Self::Cross)
    }
}

/// All four ports of a slave, stored in processing order 0, 3, 1, 2.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ports(pub [Port; 4]);

impl Ports {
    /// Build from per-port activity flags, in processing order.
    pub(crate) fn new(active0: bool, active3: bool, active1: bool, active2: bool) -> Self {
        let mut ports = Self::default();

        for (port, (number, active)) in ports
            .0
            .iter_mut()
            .zip([(0, active0), (3, active3), (1, active1), (2, active2)])
        {
            port.number = number;
            port.link_up = active;
            port.signal_detected = active;
        }

        ports
    }

    /// Latch the DC receive times, in processing order.
    pub(crate) fn set_receive_times(&mut self, t0: u32, t3: u32, t1: u32, t2: u32) {
        for (port, time) in self.0.iter_mut().zip([t0, t3, t1, t2]) {
            port.receive_time = time;
        }
    }

    fn open_ports(&self) -> u8 {
        self.0.iter().filter(|port| port.active()).count() as u8
    }

    /// The port that first sees EtherCAT traffic.
    pub fn entry_port(&self) -> Option<Port> {
        self.0
            .into_iter()
            .filter(|port| port.active())
            .min_by_key(|port| port.receive_time)
    }

    /// Find the next open port after `port` in processing order.
    fn next_open_port(&self, port: &Port) -> Option<&Port> {
        let position = self.0.iter().position(|p| p.number == port.number)?;

        (1..4)
            .map(|offset| &self.0[(position + offset) % 4])
            .find(|p| p.active())
    }

    /// Assign the next unassigned open port after the entry port to a
    /// downstream slave, returning the port number used.
    pub(crate) fn assign_next_downstream_port(
        &mut self,
        downstream_index: usize,
    ) -> Option<usize> {
        let entry = self.entry_port()?;
        let position = self.0.iter().position(|p| p.number == entry.number)?;

        for offset in 1..4 {
            let port = &mut self.0[(position + offset) % 4];

            if port.active() && port.downstream_to.is_none() {
                port.downstream_to = Some(downstream_index);

                return Some(port.number);
            }
        }

        None
    }

    /// Topology shape of this slave.
    pub fn topology(&self) -> Topology {
        match self.open_ports() {
            1 => Topology::LineEnd,
            2 => Topology::Passthrough,
            3 => Topology::Fork,
            _ => Topology::Cross,
        }
    }

    /// Time in ns for a frame to traverse all active ports of this slave and
    /// its downstream subtree: the difference between the latest and earliest
    /// port receive times.
    pub fn propagation_time(&self) -> Option<u32> {
        let times = self
            .0
            .iter()
            .filter_map(|port| port.active().then_some(port.receive_time));

        times
            .clone()
            .max()
            .and_then(|max| times.min().map(|min| max - min))
            .filter(|t| *t > 0)
    }

    /// Propagation time from the entry port up to (and including) the subtree
    /// hanging off `up_to`, used for fork delay calculations.
    pub(crate) fn propagation_time_to(&self, up_to: usize) -> Option<u32> {
        let entry = self.entry_port()?;

        let up_to_port = self.0.iter().find(|p| p.number == up_to)?;
        let after = self.next_open_port(up_to_port)?;

        (after.receive_time > entry.receive_time)
            .then(|| after.receive_time - entry.receive_time)
    }
}
