//! Distributed clocks: reference clock selection and propagation delay
//! calculation over the scanned topology.
//!
//! The per-cycle reference sync (`FPWR 0x0910`) and drift compensation
//! (`FRMW 0x0910`) datagrams are owned by the master runtime; this module
//! contains the math that feeds them.

use crate::config::SlaveConfig;
use crate::fmt;
use crate::slave::ports::Topology;
use crate::slave::Slave;

/// Pick the reference clock: the application-nominated config's slave if it
/// is DC capable, otherwise the first DC capable slave in ring order.
pub(crate) fn select_reference(
    slaves: &[Slave],
    configs: &[SlaveConfig],
    nominated: Option<usize>,
) -> Option<usize> {
    if let Some(config_index) = nominated {
        if let Some(slave_index) = configs
            .get(config_index)
            .and_then(|config| config.slave_index)
        {
            let slave = &slaves[slave_index];

            if slave.dc_capable() && slave.has_dc_system_time {
                return Some(slave_index);
            }

            fmt::warn!(
                "Nominated reference clock slave {:#06x} has no DC system \
                 time, falling back to ring order",
                slave.station_address()
            );
        }
    }

    slaves
        .iter()
        .position(|slave| slave.dc_capable() && slave.has_dc_system_time)
}

/// Find a slave's parent in the list of slaves before it in ring order.
///
/// The previous slave is the parent unless it is the end of a branch, in
/// which case the chain is walked back to the junction the branch hangs off.
fn find_parent(parents: &[Slave]) -> Option<usize> {
    let mut iter = parents.iter().enumerate().rev();

    let (index, parent) = iter.next()?;

    if parent.ports.topology() != Topology::LineEnd {
        return Some(index);
    }

    iter.find(|(_, slave)| slave.ports.topology().is_junction())
        .map(|(index, _)| index)
}

/// Assign parent/child port relationships and accumulate each DC slave's
/// one-way propagation delay from the start of the ring.
///
/// Returns the per-slave delay from the first slave, in ns.
fn accumulate_delays(slaves: &mut [Slave]) -> Vec<u32> {
    let mut delays = vec![0u32; slaves.len()];
    let mut delay_accum = 0u32;

    for i in 0..slaves.len() {
        let (parents, rest) = slaves.split_at_mut(i);
        let slave = &mut rest[0];

        let Some(parent_index) = find_parent(parents) else {
            continue;
        };

        let parent = &mut parents[parent_index];

        let Some(parent_port) = parent.ports.assign_next_downstream_port(i) else {
            fmt::warn!(
                "No free downstream port for slave {:#06x}",
                slave.station_address()
            );

            continue;
        };

        if !slave.dc_capable() {
            continue;
        }

        let parent_prop = parent.ports.propagation_time().unwrap_or(0);
        let this_prop = slave.ports.propagation_time().unwrap_or(0);

        let hop_delay = match parent.ports.topology() {
            Topology::Passthrough | Topology::LineEnd => {
                parent_prop.saturating_sub(this_prop) / 2
            }
            Topology::Fork | Topology::Cross => {
                // Delay through the subtree hanging off the assigned port
                let subtree = parent
                    .ports
                    .propagation_time_to(parent_port)
                    .unwrap_or(parent_prop);

                subtree.saturating_sub(this_prop) / 2
            }
        };

        delay_accum += hop_delay;
        delays[i] = delay_accum;

        // Record the hop on the parent port for diagnostics
        if let Some(port) = parent
            .ports
            .0
            .iter_mut()
            .find(|port| port.number == parent_port)
        {
            port.delay_to_next_dc = hop_delay;
        }
    }

    delays
}

/// Compute every DC slave's transmission delay relative to the reference
/// clock and store it on the slave, ready to be written to register `0x0928`.
pub(crate) fn calc_transmission_delays(slaves: &mut [Slave], reference: usize) {
    let delays = accumulate_delays(slaves);

    let ref_delay = delays.get(reference).copied().unwrap_or(0);

    for (slave, delay) in slaves.iter_mut().zip(&delays) {
        slave.transmission_delay = if slave.dc_capable() {
            delay.saturating_sub(ref_delay)
        } else {
            0
        };
    }

    fmt::debug!("Distributed clock delay calculation complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::SupportFlags;
    use crate::slave::ports::Ports;

    fn dc_slave(position: u16, ports: Ports) -> Slave {
        let mut slave = Slave::new(position);

        slave.ports = ports;
        slave.has_dc_system_time = true;
        slave.flags = SupportFlags {
            dc_supported: true,
            ..SupportFlags::default()
        };

        slave
    }

    fn ports_with_times(
        active: (bool, bool, bool, bool),
        times: (u32, u32, u32, u32),
    ) -> Ports {
        let mut ports = Ports::new(active.0, active.1, active.2, active.3);

        ports.set_receive_times(times.0, times.1, times.2, times.3);

        ports
    }

    #[test]
    fn line_topology_delays_monotonic() {
        // Three slaves in a line; port deltas give 700, 300 and 0 ns of
        // downstream round trip time
        let mut slaves = vec![
            dc_slave(
                0,
                ports_with_times((true, true, false, false), (1000, 1700, 0, 0)),
            ),
            dc_slave(
                1,
                ports_with_times((true, true, false, false), (2000, 2300, 0, 0)),
            ),
            dc_slave(
                2,
                ports_with_times((true, false, false, false), (3000, 0, 0, 0)),
            ),
        ];

        calc_transmission_delays(&mut slaves, 0);

        let delays: Vec<u32> = slaves
            .iter()
            .map(|slave| slave.transmission_delay)
            .collect();

        assert_eq!(delays[0], 0);
        assert!(delays[0] < delays[1]);
        assert!(delays[1] < delays[2]);

        // (700 - 300) / 2, then + (300 - 0) / 2
        assert_eq!(delays[1], 200);
        assert_eq!(delays[2], 350);
    }

    #[test]
    fn reference_selection_prefers_nomination() {
        let mut slaves = vec![
            dc_slave(0, Ports::new(true, true, false, false)),
            dc_slave(1, Ports::new(true, false, false, false)),
        ];

        // Without a nomination: first DC slave
        assert_eq!(select_reference(&slaves, &[], None), Some(0));

        // With a nominated config attached to slave 1
        let mut config = SlaveConfig::new(0, 1, 0, 0);
        config.slave_index = Some(1);

        let configs = vec![config];

        assert_eq!(select_reference(&slaves, &configs, Some(0)), Some(1));

        // A nominated slave without DC falls back to ring order
        slaves[1].has_dc_system_time = false;

        assert_eq!(select_reference(&slaves, &configs, Some(0)), Some(0));
    }

    #[test]
    fn non_dc_slaves_get_no_delay() {
        let mut slaves = vec![
            dc_slave(
                0,
                ports_with_times((true, true, false, false), (1000, 1600, 0, 0)),
            ),
            Slave::new(1),
        ];

        slaves[1].ports = ports_with_times((true, false, false, false), (2000, 0, 0, 0));

        calc_transmission_delays(&mut slaves, 0);

        assert_eq!(slaves[1].transmission_delay, 0);
    }

    #[test]
    fn parent_of_branch_end_is_junction() {
        // Index 2 hangs off the fork at index 0, not off the line end at 1
        let parents = vec![
            dc_slave(0, Ports::new(true, true, true, false)),
            dc_slave(1, Ports::new(true, false, false, false)),
        ];

        assert_eq!(find_parent(&parents), Some(0));
    }
}
