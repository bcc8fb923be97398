//! Slave scan machine: assigns the station address, reads base info, DC
//! capabilities, DL status and the SII image, then discovers the PDO setup
//! of CoE slaves.

use super::pdo::PdoFsm;
use super::sii::SiiFsm;
use super::slave_config::{ConfigCtx, SlaveConfigFsm};
use super::{Response, Step, FSM_RETRIES};
use crate::datagram::Datagram;
use crate::dl_status::DlStatus;
use crate::error::{Error, SiiError};
use crate::fmt;
use crate::register::{RegisterAddress, SupportFlags};
use crate::sii::{SiiImage, CATEGORY_TERMINATOR};
use crate::slave::ports::PortDescriptor;
use crate::slave::Slave;
use crate::slave_state::AlState;
use ethercrab_wire::EtherCrabWireRead;
use std::time::Instant;

/// Upper bound for the SII category walk, in words.
const MAX_SII_SIZE: u16 = 4096;

/// First category header.
const FIRST_CATEGORY_WORD: u16 = 0x0040;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Address,
    AlStatus,
    BaseInfo,
    DcProbe,
    DcTimes,
    DlStatus,
    AssignSii,
    SiiSize,
    SiiData,
    Alias,
    PreOp,
    Pdos,
    End,
    Error,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct SlaveScanFsm {
    state: State,
    sii: SiiFsm,
    /// Brings CoE slaves to PREOP for the PDO readout.
    config: Box<SlaveConfigFsm>,
    pdo: PdoFsm,

    /// Category walk cursor during the size determination.
    sii_offset: u16,
    /// Number of words to fetch, determined by the size walk.
    sii_limit: u16,
    /// Fetched words.
    sii_words: Vec<u16>,

    retries: u8,
    error: Option<Error>,
}

impl SlaveScanFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            sii: SiiFsm::new(),
            config: Box::new(SlaveConfigFsm::new()),
            pdo: PdoFsm::new(),
            sii_offset: 0,
            sii_limit: 0,
            sii_words: Vec::new(),
            retries: 0,
            error: None,
        }
    }

    /// Arm a scan of one slave.
    pub(crate) fn start(&mut self) {
        self.state = State::Address;
        self.sii_offset = 0;
        self.sii_limit = 0;
        self.sii_words = Vec::new();
        self.retries = FSM_RETRIES;
        self.error = None;
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

        // Nested machines first.
        if self.sii.running() {
            match self.sii.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => return self.after_sii(slave, dg, now),
            }
        }

        if self.config.running() {
            let ctx = ConfigCtx {
                app_time: 0,
                dc_ref_time: 0,
            };

            match self.config.step(slave, None, resp, dg, now, ctx) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => return self.after_preop(slave, dg, now),
            }
        }

        if self.pdo.running() {
            match self.pdo.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    if !self.pdo.success() {
                        fmt::debug!(
                            "Slave {:#06x}: PDO discovery failed, continuing",
                            slave.station_address
                        );
                    }

                    self.state = State::End;

                    return Step::Done;
                }
            }
        }

        match self.state {
            State::Address => {
                fmt::debug!(
                    "Scanning slave at ring position {}",
                    slave.ring_position
                );

                self.write_station_address(slave, dg);
                self.state = State::AlStatus;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::AlStatus => {
                if let Some(step) = self.confirm(slave, &resp, dg, |fsm, slave, dg| {
                    fsm.write_station_address(slave, dg)
                }) {
                    return step;
                }

                dg.fprd(slave.station_address, RegisterAddress::AlStatus.into(), 2);
                self.state = State::BaseInfo;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::BaseInfo => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fprd(slave.station_address, RegisterAddress::AlStatus.into(), 2)
                }) {
                    return step;
                }

                let (state, error_bit) = AlState::split_register(resp.data[0]);

                slave.current_state = state;
                slave.error_flag = false;

                if error_bit {
                    fmt::warn!(
                        "Slave {:#06x} has its error indicator set",
                        slave.station_address
                    );
                }

                dg.fprd(slave.station_address, RegisterAddress::Type.into(), 12);
                self.state = State::DcProbe;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DcProbe => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fprd(slave.station_address, RegisterAddress::Type.into(), 12)
                }) {
                    return step;
                }

                self.parse_base_info(slave, resp.data);

                if !slave.flags.dc_supported {
                    return self.enter_dl_status(slave, dg);
                }

                // Probe the system time register; slaves with receive time
                // latches only do not answer it
                dg.fprd(
                    slave.station_address,
                    RegisterAddress::DcSystemTime.into(),
                    4,
                );
                self.state = State::DcTimes;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DcTimes => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    dg.fprd(
                        slave.station_address,
                        RegisterAddress::DcSystemTime.into(),
                        4,
                    );

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout);
                }

                slave.has_dc_system_time = resp.working_counter != 0;

                if !slave.has_dc_system_time {
                    fmt::debug!(
                        "Slave {:#06x} has no system time register",
                        slave.station_address
                    );
                }

                dg.fprd(
                    slave.station_address,
                    RegisterAddress::DcTimePort0.into(),
                    16,
                );
                self.state = State::DlStatus;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DlStatus => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fprd(
                        slave.station_address,
                        RegisterAddress::DcTimePort0.into(),
                        16,
                    )
                }) {
                    return step;
                }

                // Port receive times from the 0x0900 block, in processing
                // order 0, 3, 1, 2
                let mut times = [0u32; 4];

                for (i, chunk) in resp.data.chunks_exact(4).enumerate() {
                    times[i] =
                        u32::from_le_bytes(fmt::unwrap!(chunk.try_into()));
                }

                slave
                    .ports
                    .set_receive_times(times[0], times[3], times[1], times[2]);

                self.enter_dl_status(slave, dg)
            }
            State::AssignSii => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fprd(slave.station_address, RegisterAddress::DlStatus.into(), 2)
                }) {
                    return step;
                }

                let Ok(status) = DlStatus::unpack_from_slice(resp.data) else {
                    return self.fail(slave, Error::Pdu(crate::error::PduError::Decode));
                };

                for port in slave.ports.0.iter_mut() {
                    port.link_up = status.link(port.number);
                    port.loop_closed = status.loopback(port.number);
                    port.signal_detected = status.signal(port.number);
                }

                // Hand the EEPROM to the EtherCAT side for the fetch
                dg.fpwr(slave.station_address, RegisterAddress::SiiAccess.into(), 2);
                self.state = State::SiiSize;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::SiiSize => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fpwr(slave.station_address, RegisterAddress::SiiAccess.into(), 2)
                }) {
                    return step;
                }

                // Walk the category chain to size the EEPROM
                self.sii_offset = FIRST_CATEGORY_WORD;
                self.sii.read(self.sii_offset);

                self.sii.step(slave, Response::NONE, dg, now)
            }
            State::Alias => {
                if let Some(step) = self.confirm(slave, &resp, dg, |_fsm, slave, dg| {
                    dg.fprd(
                        slave.station_address,
                        RegisterAddress::ConfiguredStationAlias.into(),
                        2,
                    )
                }) {
                    return step;
                }

                slave.effective_alias = u16::from_le_bytes([resp.data[0], resp.data[1]]);

                self.after_alias(slave, dg, now)
            }
            _ => Step::Idle,
        }
    }

    /// An SII word read finished; continue the size walk or the data fetch.
    fn after_sii(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if !self.sii.success() {
            self.error = self.sii.error();
            slave.error_flag = true;
            self.state = State::Error;

            return Step::Done;
        }

        let value = self.sii.value();

        match self.state {
            State::SiiSize => {
                let category_type = u16::from_le_bytes([value[0], value[1]]);
                let size = u16::from_le_bytes([value[2], value[3]]);

                if category_type == CATEGORY_TERMINATOR {
                    // Include the terminator word so the parser sees it too
                    self.sii_limit = self.sii_offset + 1;
                    self.sii_words = Vec::with_capacity(usize::from(self.sii_limit));
                    self.sii_offset = 0;
                    self.state = State::SiiData;

                    self.sii.read(0);

                    return self.sii.step(slave, Response::NONE, dg, now);
                }

                let next = self.sii_offset.saturating_add(2 + size);

                if next >= MAX_SII_SIZE {
                    fmt::error!(
                        "Slave {:#06x}: unterminated SII category chain",
                        slave.station_address
                    );

                    self.error = Some(Error::Sii(SiiError::SizeExceeded));
                    slave.error_flag = true;
                    self.state = State::Error;

                    return Step::Done;
                }

                self.sii_offset = next;
                self.sii.read(self.sii_offset);

                self.sii.step(slave, Response::NONE, dg, now)
            }
            State::SiiData => {
                self.sii_words
                    .push(u16::from_le_bytes([value[0], value[1]]));
                self.sii_words
                    .push(u16::from_le_bytes([value[2], value[3]]));

                if self.sii_words.len() < usize::from(self.sii_limit) {
                    self.sii_offset += 2;
                    self.sii.read(self.sii_offset);

                    return self.sii.step(slave, Response::NONE, dg, now);
                }

                self.apply_sii(slave);

                // Read the alias the slave actually uses
                dg.fprd(
                    slave.station_address,
                    RegisterAddress::ConfiguredStationAlias.into(),
                    2,
                );
                self.state = State::Alias;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            _ => Step::Idle,
        }
    }

    /// Decode the fetched image and store the categories on the slave.
    fn apply_sii(&mut self, slave: &mut Slave) {
        slave.sii_image = SiiImage::new(core::mem::take(&mut self.sii_words));

        match slave.sii_image.parse_categories() {
            Ok(categories) => {
                slave.sii = categories;

                fmt::debug!(
                    "Slave {:#06x}: {} ({:#010x} / {:#010x})",
                    slave.station_address,
                    slave.name().as_str(),
                    slave.vendor_id(),
                    slave.product_code()
                );
            }
            Err(e) => {
                fmt::warn!(
                    "Slave {:#06x}: failed to parse SII categories: {}",
                    slave.station_address,
                    e
                );
            }
        }
    }

    /// Shared "retry on timeout, fail on anything but WC 1" handling for the
    /// plain register reads of the scan. Returns `None` when the response is
    /// good.
    fn confirm(
        &mut self,
        slave: &mut Slave,
        resp: &Response<'_>,
        dg: &mut Datagram,
        reissue: impl FnOnce(&mut Self, &mut Slave, &mut Datagram),
    ) -> Option<Step> {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            reissue(self, slave, dg);

            return Some(Step::Queued);
        }

        if !resp.is_received() {
            return Some(self.fail(slave, Error::Timeout));
        }

        if resp.working_counter != 1 {
            return Some(self.fail(
                slave,
                Error::WorkingCounter {
                    expected: 1,
                    received: resp.working_counter,
                },
            ));
        }

        None
    }

    fn write_station_address(&self, slave: &Slave, dg: &mut Datagram) {
        dg.apwr(
            slave.ring_position,
            RegisterAddress::ConfiguredStationAddress.into(),
            2,
        );
        dg.data_mut()
            .copy_from_slice(&slave.station_address.to_le_bytes());
    }

    fn parse_base_info(&mut self, slave: &mut Slave, data: &[u8]) {
        slave.base_type = data[0];
        slave.base_revision = data[1];
        slave.base_build = u16::from_le_bytes([data[2], data[3]]);
        slave.base_fmmu_count = data[4].min(16);
        slave.base_sync_count = data[5].min(16);

        for (port, bits) in slave.ports.0.iter_mut().zip([0u8, 3, 1, 2]) {
            port.number = usize::from(bits);
            port.descriptor = PortDescriptor::from_bits(data[7] >> (bits * 2));
        }

        slave.flags = SupportFlags::unpack_from_slice(&data[8..10]).unwrap_or_default();
    }

    fn enter_dl_status(&mut self, slave: &mut Slave, dg: &mut Datagram) -> Step {
        dg.fprd(slave.station_address, RegisterAddress::DlStatus.into(), 2);
        self.state = State::AssignSii;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    /// Alias read finished; decide whether a PREOP + PDO discovery pass is
    /// worthwhile.
    fn after_alias(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if slave.has_coe() && slave.current_state.mailbox_capable() {
            // Already in a mailbox state from a previous run; read the PDO
            // setup directly
            self.state = State::Pdos;
            self.pdo.read(slave);

            return self.pdo.step(slave, Response::NONE, dg, now);
        }

        if slave.has_coe() {
            self.state = State::PreOp;
            self.config.start(false, AlState::PreOp);

            return self.config.step(
                slave,
                None,
                Response::NONE,
                dg,
                now,
                ConfigCtx {
                    app_time: 0,
                    dc_ref_time: 0,
                },
            );
        }

        self.state = State::End;

        Step::Done
    }

    fn after_preop(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if !self.config.success() {
            fmt::warn!(
                "Slave {:#06x}: could not reach PREOP during scan, skipping \
                 PDO discovery",
                slave.station_address
            );

            self.state = State::End;

            return Step::Done;
        }

        self.state = State::Pdos;
        self.pdo.read(slave);

        self.pdo.step(slave, Response::NONE, dg, now)
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> Step {
        fmt::error!(
            "Slave {:#06x}: scan failed: {}",
            slave.station_address,
            error
        );

        slave.error_flag = true;
        self.error = Some(error);
        self.state = State::Error;

        Step::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramState;

    fn received(wkc: u16, data: &[u8]) -> Response<'_> {
        Response {
            state: DatagramState::Received,
            working_counter: wkc,
            data,
        }
    }

    #[test]
    fn scan_of_simple_slave() {
        let mut slave = Slave::new(1);
        let mut fsm = SlaveScanFsm::new();
        let mut dg = Datagram::new(64);
        let now = Instant::now();

        fsm.start();

        // Station address write: APWR to 0x0010 carrying 0x1002
        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);
        assert_eq!(dg.data(), &[0x02, 0x10]);

        // Confirmed; AL status read
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);

        // Slave is in INIT; base info read goes out
        assert_eq!(
            fsm.step(&mut slave, received(1, &[0x01, 0x00]), &mut dg, now),
            Step::Queued
        );
        assert_eq!(dg.data_size(), 12);

        // Base info: 2 FMMUs, 2 SMs, MII ports 0/1, no DC
        let base = [
            0x11, 0x02, 0x02, 0x00, // type, revision, build
            0x02, 0x02, 0x08, // fmmus, syncs, ram
            0x0f, // ports: MII, MII
            0x00, 0x00, // features: no DC
            0x00, 0x00,
        ];

        // No DC: straight to DL status
        assert_eq!(fsm.step(&mut slave, received(1, &base), &mut dg, now), Step::Queued);

        assert_eq!(slave.base_fmmu_count, 2);
        assert_eq!(slave.base_sync_count, 2);
        assert!(!slave.flags.dc_supported);
        assert_eq!(slave.current_state, AlState::Init);

        // DL status: link on port 0, no loop
        assert_eq!(
            fsm.step(&mut slave, received(1, &[0x10, 0x02]), &mut dg, now),
            Step::Queued
        );

        assert!(slave.ports.0[0].link_up);

        // SII assigned; the size walk starts at word 0x40
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);
        assert_eq!(dg.data(), &[0x80, 0x01, 0x40, 0x00]);
    }

    #[test]
    fn sii_size_walk_and_fetch() {
        let mut slave = Slave::new(0);
        let mut fsm = SlaveScanFsm::new();
        let mut dg = Datagram::new(64);
        let now = Instant::now();

        // Jump straight to the size walk
        fsm.start();
        fsm.state = State::SiiSize;
        fsm.retries = FSM_RETRIES;

        // Trigger the first category read (the confirmed SII assign write)
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);

        // Category header at 0x40: type 30, size 16 words
        let confirm = received(1, &[]);
        assert_eq!(fsm.step(&mut slave, confirm, &mut dg, now), Step::Queued);

        let header = [0x80u8, 0x00, 0x40, 0x00, 0, 0, 30, 0, 16, 0];
        assert_eq!(fsm.step(&mut slave, received(1, &header), &mut dg, now), Step::Queued);

        // Next header at 0x52 is requested
        assert_eq!(dg.data(), &[0x80, 0x01, 0x52, 0x00]);
    }
}
