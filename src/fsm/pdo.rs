//! PDO assignment machine: reads or writes the `0x1C1x` sync manager
//! assignment objects and dispatches the mapping machine per PDO.

use super::coe::CoeFsm;
use super::pdo_entry::PdoEntryFsm;
use super::{Response, Step};
use crate::coe::EmergencyMessage;
use crate::config::SlaveConfig;
use crate::datagram::Datagram;
use crate::error::Error;
use crate::fmt;
use crate::pdo::{Pdo, PdoList};
use crate::slave::Slave;
use std::time::Instant;

/// First sync manager assignment object.
const PDO_ASSIGN_BASE: u16 = 0x1c10;

/// Process data sync managers start here; SM0/SM1 carry the mailboxes.
const FIRST_PDO_SYNC: u8 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    // Reading
    ReadCount,
    ReadIndex,
    ReadMapping,
    // Writing
    WriteZero,
    WriteMapping,
    WriteIndex,
    WriteCount,
    End,
    Error,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct PdoFsm {
    state: State,
    coe: CoeFsm,
    entry_fsm: PdoEntryFsm,

    /// Sync manager currently worked on.
    sync: u8,
    /// Upper bound (exclusive) of sync managers to visit.
    sync_end: u8,
    /// Assignment being read or written for the current sync manager.
    list: PdoList,
    cursor: usize,
    count: u8,

    /// For writes: the configured assignment per sync manager, cloned from
    /// the slave config at start.
    desired: Vec<(u8, PdoList)>,

    pub(crate) emergencies: Vec<EmergencyMessage>,

    error: Option<Error>,
}

impl PdoFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            coe: CoeFsm::new(),
            entry_fsm: PdoEntryFsm::new(),
            sync: 0,
            sync_end: 0,
            list: PdoList::new(),
            cursor: 0,
            count: 0,
            desired: Vec::new(),
            emergencies: Vec::new(),
            error: None,
        }
    }

    /// Arm a read of the PDO assignment and mapping of every process data
    /// sync manager.
    pub(crate) fn read(&mut self, slave: &Slave) {
        self.sync = FIRST_PDO_SYNC;
        self.sync_end = slave.base_sync_count.min(16);
        self.list = PdoList::new();
        self.cursor = 0;
        self.count = 0;
        self.desired.clear();
        self.error = None;

        if self.sync >= self.sync_end {
            self.state = State::End;
        } else {
            self.state = State::ReadCount;
        }
    }

    /// Arm a write of the assignments configured on `config`.
    pub(crate) fn write(&mut self, slave: &Slave, config: &SlaveConfig) {
        self.sync = FIRST_PDO_SYNC;
        self.sync_end = slave.base_sync_count.min(16);
        self.list = PdoList::new();
        self.cursor = 0;
        self.count = 0;
        self.desired = config
            .sm_pdos
            .iter()
            .enumerate()
            .filter_map(|(sync, list)| {
                list.as_ref()
                    .map(|list| (sync as u8, list.clone()))
            })
            .collect();
        self.error = None;

        self.state = State::WriteZero;
    }

    pub(crate) fn running(&self) -> bool {
        !matches!(self.state, State::Idle | State::End | State::Error)
    }

    pub(crate) fn success(&self) -> bool {
        self.state == State::End
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn step(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if matches!(self.state, State::Idle | State::End | State::Error) {
            return Step::Done;
        }

        // Route the response to whichever nested machine is in flight.
        if self.entry_fsm.running() {
            match self.entry_fsm.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    self.emergencies.extend(self.entry_fsm.take_emergencies());

                    return self.after_entry_fsm(slave, dg, now);
                }
            }
        }

        if self.coe.running() {
            match self.coe.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    self.emergencies.append(&mut self.coe.emergencies);

                    return self.after_coe(slave, dg, now);
                }
            }
        }

        // Nothing in flight: enter the current state fresh.
        self.enter(slave, dg, now)
    }

    /// Begin the action of the current state.
    fn enter(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        match self.state {
            State::ReadCount => {
                self.coe.upload(PDO_ASSIGN_BASE + u16::from(self.sync), 0, false);

                self.coe.step(slave, Response::NONE, dg, now)
            }
            State::WriteZero => {
                let Some(list) = self.desired_for(self.sync) else {
                    return self.next_sync_write(slave, dg, now);
                };

                if !self.assign_allowed(slave) {
                    let current = slave
                        .sync_pdos
                        .get(usize::from(self.sync))
                        .cloned()
                        .unwrap_or_default();

                    if !list.assignment_equals(&current) {
                        fmt::warn!(
                            "Slave {:#06x}: SM{} assignment differs but SII forbids \
                             PDO assignment, leaving it untouched",
                            slave.station_address,
                            self.sync
                        );
                    }

                    return self.next_sync_write(slave, dg, now);
                }

                fmt::debug!(
                    "Slave {:#06x}: writing SM{} PDO assignment ({} PDOs)",
                    slave.station_address,
                    self.sync,
                    list.len()
                );

                self.list = list;
                self.cursor = 0;
                self.coe.download(
                    PDO_ASSIGN_BASE + u16::from(self.sync),
                    0,
                    false,
                    vec![0],
                );

                self.coe.step(slave, Response::NONE, dg, now)
            }
            _ => Step::Idle,
        }
    }

    /// A CoE transfer finished; advance the assignment flow.
    fn after_coe(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if !self.coe.success() {
            match self.state {
                // Reading tolerates slaves without assignment objects
                State::ReadCount => {
                    fmt::debug!(
                        "Slave {:#06x}: no PDO assignment object for SM{}",
                        slave.station_address,
                        self.sync
                    );

                    return self.next_sync_read(slave, dg, now);
                }
                _ => {
                    self.error = self.coe.error();
                    self.state = State::Error;

                    return Step::Done;
                }
            }
        }

        match self.state {
            State::ReadCount => {
                let data = self.coe.take_data();

                self.count = data.first().copied().unwrap_or(0);
                self.list = PdoList::new();
                self.cursor = 0;

                if self.count == 0 {
                    return self.finish_sync_read(slave, dg, now);
                }

                self.cursor = 1;
                self.coe.upload(
                    PDO_ASSIGN_BASE + u16::from(self.sync),
                    self.cursor as u8,
                    false,
                );
                self.state = State::ReadIndex;

                self.coe.step(slave, Response::NONE, dg, now)
            }
            State::ReadIndex => {
                let data = self.coe.take_data();

                if data.len() < 2 {
                    self.error = Some(Error::Pdu(crate::error::PduError::Decode));
                    self.state = State::Error;

                    return Step::Done;
                }

                let index = u16::from_le_bytes([data[0], data[1]]);

                let mut pdo = Pdo::new(index);
                pdo.sync_index = Some(self.sync);
                self.list.push(pdo);

                if self.cursor < usize::from(self.count) {
                    self.cursor += 1;
                    self.coe.upload(
                        PDO_ASSIGN_BASE + u16::from(self.sync),
                        self.cursor as u8,
                        false,
                    );

                    return self.coe.step(slave, Response::NONE, dg, now);
                }

                // All indices known; read each PDO's mapping
                self.cursor = 0;
                self.state = State::ReadMapping;

                self.read_next_mapping(slave, dg, now)
            }
            State::WriteZero => {
                // Count zeroed; write mappings first, then the indices
                self.cursor = 0;
                self.state = State::WriteMapping;

                self.write_next_mapping(slave, dg, now)
            }
            State::WriteIndex => {
                if self.cursor < self.list.len() {
                    return self.write_index(slave, dg, now);
                }

                self.coe.download(
                    PDO_ASSIGN_BASE + u16::from(self.sync),
                    0,
                    false,
                    vec![self.list.len() as u8],
                );
                self.state = State::WriteCount;

                self.coe.step(slave, Response::NONE, dg, now)
            }
            State::WriteCount => {
                // Assignment complete for this sync manager
                let sync = usize::from(self.sync);
                let list = core::mem::take(&mut self.list);

                if let Some(slot) = slave.sync_pdos.get_mut(sync) {
                    *slot = list;
                }

                self.next_sync_write(slave, dg, now)
            }
            _ => Step::Idle,
        }
    }

    /// The mapping machine finished for one PDO.
    fn after_entry_fsm(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        match self.state {
            State::ReadMapping => {
                if self.entry_fsm.success() {
                    let pdo = self.entry_fsm.take_pdo();
                    let sync = self.sync;

                    if let Some(slot) = self.list.pdos_mut().get_mut(self.cursor) {
                        *slot = Pdo {
                            sync_index: Some(sync),
                            ..pdo
                        };
                    }
                } else {
                    fmt::debug!(
                        "Slave {:#06x}: failed to read mapping of PDO, skipping",
                        slave.station_address
                    );
                }

                self.cursor += 1;

                self.read_next_mapping(slave, dg, now)
            }
            State::WriteMapping => {
                if !self.entry_fsm.success() {
                    self.error = self.entry_fsm.error();
                    self.state = State::Error;

                    return Step::Done;
                }

                self.cursor += 1;

                self.write_next_mapping(slave, dg, now)
            }
            _ => Step::Idle,
        }
    }

    // Reading helpers

    fn read_next_mapping(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if self.cursor >= self.list.len() {
            return self.finish_sync_read(slave, dg, now);
        }

        let index = self.list.pdos()[self.cursor].index;

        self.entry_fsm.read(index);

        self.entry_fsm.step(slave, Response::NONE, dg, now)
    }

    fn finish_sync_read(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        let sync = usize::from(self.sync);
        let list = core::mem::take(&mut self.list);

        fmt::debug!(
            "Slave {:#06x}: SM{} assigns {} PDO(s)",
            slave.station_address,
            self.sync,
            list.len()
        );

        if let Some(slot) = slave.sync_pdos.get_mut(sync) {
            *slot = list;
        }

        self.next_sync_read(slave, dg, now)
    }

    fn next_sync_read(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        self.sync += 1;

        if self.sync >= self.sync_end {
            self.state = State::End;

            return Step::Done;
        }

        self.state = State::ReadCount;

        self.enter(slave, dg, now)
    }

    // Writing helpers

    fn desired_for(&self, sync: u8) -> Option<PdoList> {
        self.desired
            .iter()
            .find(|(s, _)| *s == sync)
            .map(|(_, list)| list.clone())
    }

    fn assign_allowed(&self, slave: &Slave) -> bool {
        slave
            .sii
            .general
            .as_ref()
            .map_or(true, |general| general.coe_details.enable_pdo_assign)
    }

    fn mapping_allowed(&self, slave: &Slave) -> bool {
        slave.sii.general.as_ref().map_or(true, |general| {
            general.coe_details.enable_pdo_configuration
        })
    }

    fn write_next_mapping(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if self.list.is_empty() {
            // Nothing assigned; the zero write already cleared the slave
            if let Some(slot) = slave.sync_pdos.get_mut(usize::from(self.sync)) {
                slot.clear();
            }

            return self.next_sync_write(slave, dg, now);
        }

        while self.cursor < self.list.len() {
            let pdo = &self.list.pdos()[self.cursor];

            if pdo.entries.is_empty() {
                // No mapping configured for this PDO, keep the slave's own
                self.cursor += 1;
                continue;
            }

            if !self.mapping_allowed(slave) {
                let current = slave
                    .sync_pdos
                    .get(usize::from(self.sync))
                    .and_then(|list| list.find(pdo.index));

                if current.map_or(true, |current| current.entries != pdo.entries) {
                    fmt::warn!(
                        "Slave {:#06x}: mapping of PDO {:#06x} differs but SII forbids \
                         PDO configuration, leaving it untouched",
                        slave.station_address,
                        pdo.index
                    );
                }

                self.cursor += 1;
                continue;
            }

            let pdo = pdo.clone();

            self.entry_fsm.write(pdo);

            return self.entry_fsm.step(slave, Response::NONE, dg, now);
        }

        // Mappings done; write the assignment indices
        self.cursor = 0;
        self.state = State::WriteIndex;

        self.write_index(slave, dg, now)
    }

    fn write_index(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        let index = self.list.pdos()[self.cursor].index;

        self.cursor += 1;

        self.coe.download(
            PDO_ASSIGN_BASE + u16::from(self.sync),
            self.cursor as u8,
            false,
            index.to_le_bytes().to_vec(),
        );

        self.coe.step(slave, Response::NONE, dg, now)
    }

    fn next_sync_write(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        self.sync += 1;

        if self.sync >= self.sync_end {
            self.state = State::End;

            return Step::Done;
        }

        self.state = State::WriteZero;

        self.enter(slave, dg, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramState;
    use crate::slave::ConfiguredMailbox;

    fn pdo_slave() -> Slave {
        let mut slave = Slave::new(1);

        slave.base_sync_count = 4;
        slave.configured_mailbox = ConfiguredMailbox {
            rx_offset: 0x1000,
            rx_size: 128,
            tx_offset: 0x1080,
            tx_size: 128,
        };

        slave
    }

    fn received(wkc: u16, data: &[u8]) -> Response<'_> {
        Response {
            state: DatagramState::Received,
            working_counter: wkc,
            data,
        }
    }

    fn mbox_response(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 128];

        out[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        out[5] = 0x13;
        out[6..6 + payload.len()].copy_from_slice(payload);

        out
    }

    fn sm_full() -> Vec<u8> {
        let mut status = vec![0u8; 8];

        status[5] = 0x08;

        status
    }

    fn expedited_upload(index: u16, sub: u8, value: &[u8]) -> Vec<u8> {
        let size = (4 - value.len()) as u8;

        let mut payload = vec![
            0x00,
            0x30,
            0x43 | size << 2,
            index as u8,
            (index >> 8) as u8,
            sub,
        ];

        let mut data = [0u8; 4];
        data[..value.len()].copy_from_slice(value);
        payload.extend_from_slice(&data);

        mbox_response(&payload)
    }

    /// Drive one CoE upload round trip: confirm, mailbox full, response.
    fn round_trip(
        fsm: &mut PdoFsm,
        slave: &mut Slave,
        dg: &mut Datagram,
        now: Instant,
        response: &[u8],
    ) -> Step {
        assert_eq!(fsm.step(slave, received(1, &[]), dg, now), Step::Queued);
        assert_eq!(fsm.step(slave, received(1, &sm_full()), dg, now), Step::Queued);

        fsm.step(slave, received(1, response), dg, now)
    }

    #[test]
    fn reads_assignment_and_mapping() {
        let mut slave = pdo_slave();
        let mut fsm = PdoFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.read(&slave);

        // SM2: count upload goes out
        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);

        // SM2 assigns one PDO
        let step = round_trip(&mut fsm, &mut slave, &mut dg, now, &expedited_upload(0x1c12, 0, &[1]));
        assert_eq!(step, Step::Queued);

        // 0x1c12:1 = 0x1600
        let step = round_trip(
            &mut fsm,
            &mut slave,
            &mut dg,
            now,
            &expedited_upload(0x1c12, 1, &0x1600u16.to_le_bytes()),
        );
        assert_eq!(step, Step::Queued);

        // Mapping of 0x1600: zero entries
        let step = round_trip(&mut fsm, &mut slave, &mut dg, now, &expedited_upload(0x1600, 0, &[0]));
        assert_eq!(step, Step::Queued);

        // SM3: no assignment object; the slave aborts and the machine moves on
        let abort = mbox_response(&[
            0x00, 0x30, 0x80, 0x13, 0x1c, 0x00, 0x00, 0x00, 0x02, 0x06,
        ]);

        let step = round_trip(&mut fsm, &mut slave, &mut dg, now, &abort);

        assert_eq!(step, Step::Done);
        assert!(fsm.success());

        assert_eq!(slave.sync_pdos[2].len(), 1);
        assert_eq!(slave.sync_pdos[2].pdos()[0].index, 0x1600);
        assert_eq!(slave.sync_pdos[2].pdos()[0].sync_index, Some(2));
        assert!(slave.sync_pdos[3].is_empty());
    }

    #[test]
    fn write_skipped_when_sii_forbids_assignment() {
        let mut slave = pdo_slave();

        // SII general category says: no PDO assignment changes
        slave.sii.general = Some(crate::sii::CategoryGeneral::default());

        let mut config = SlaveConfig::new(0, 1, 0, 0);
        let mut list = PdoList::new();
        list.push(Pdo::new(0x1600));
        config.sm_pdos[2] = Some(list);

        let mut fsm = PdoFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.write(&slave, &config);

        // Nothing to send at all: every sync manager is skipped
        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Done);
        assert!(fsm.success());
    }
}
