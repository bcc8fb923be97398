//! EEPROM (SII) word read machine: drives the ESC's EEPROM interface
//! registers to fetch two words per round trip.

use super::{Response, Step, FSM_RETRIES};
use crate::datagram::Datagram;
use crate::error::{Error, SiiError};
use crate::fmt;
use crate::register::RegisterAddress;
use crate::slave::Slave;
use std::time::{Duration, Instant};

/// How long the EEPROM interface may stay busy after a read was issued.
const SII_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    StartReading,
    ReadCheck,
    ReadFetch,
    End,
    Error,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct SiiFsm {
    state: State,
    word_offset: u16,
    retries: u8,
    /// One more poll is allowed after the timeout hits, in case the final
    /// read raced the busy bit.
    check_once_more: bool,
    started: Option<Instant>,
    value: [u8; 4],
    error: Option<Error>,
}

impl SiiFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            word_offset: 0,
            retries: 0,
            check_once_more: true,
            started: None,
            value: [0; 4],
            error: None,
        }
    }

    /// Arm a read of two words starting at `word_offset`.
    pub(crate) fn read(&mut self, word_offset: u16) {
        self.state = State::StartReading;
        self.word_offset = word_offset;
        self.retries = FSM_RETRIES;
        self.check_once_more = true;
        self.started = None;
        self.value = [0; 4];
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

    /// The two words fetched by the last successful read.
    pub(crate) fn value(&self) -> [u8; 4] {
        self.value
    }

    pub(crate) fn step(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        match self.state {
            State::Idle | State::End | State::Error => Step::Done,
            State::StartReading => {
                self.issue_read(slave, dg);
                self.state = State::ReadCheck;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::ReadCheck => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.issue_read(slave, dg);

                    return Step::Queued;
                }

                if !resp.is_received() || resp.working_counter != 1 {
                    return self.fail(slave, "read command write failed");
                }

                self.started = Some(now);
                self.check_once_more = true;
                self.poll(slave, dg);
                self.state = State::ReadFetch;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::ReadFetch => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.poll(slave, dg);

                    return Step::Queued;
                }

                if !resp.is_received() || resp.working_counter != 1 {
                    return self.fail(slave, "poll failed");
                }

                if resp.data[1] & 0x20 != 0 {
                    self.error = Some(Error::Sii(SiiError::AccessError));

                    return self.fail(slave, "EEPROM interface signalled a command error");
                }

                // Busy, or read operation still pending
                if resp.data[1] & 0x81 != 0 {
                    let elapsed = self
                        .started
                        .map_or(Duration::ZERO, |at| now.duration_since(at));

                    if elapsed >= SII_TIMEOUT {
                        if self.check_once_more {
                            self.check_once_more = false;
                        } else {
                            self.error = Some(Error::Sii(SiiError::Busy));

                            return self.fail(slave, "EEPROM interface stayed busy");
                        }
                    }

                    self.poll(slave, dg);
                    self.retries = FSM_RETRIES;

                    return Step::Queued;
                }

                self.value.copy_from_slice(&resp.data[6..10]);
                self.state = State::End;

                Step::Done
            }
        }
    }

    /// Issue the read command: control word and word address in one write.
    fn issue_read(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fpwr(slave.station_address, RegisterAddress::SiiControl.into(), 4);

        let data = dg.data_mut();

        // Two address octets, then the read trigger
        data[0] = 0x80;
        data[1] = 0x01;
        data[2..4].copy_from_slice(&self.word_offset.to_le_bytes());
    }

    /// Poll control, address and data registers in one read.
    fn poll(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fprd(slave.station_address, RegisterAddress::SiiControl.into(), 10);
    }

    fn fail(&mut self, slave: &mut Slave, what: &str) -> Step {
        fmt::error!(
            "Slave {:#06x}: SII read of word {:#06x} failed: {}",
            slave.station_address,
            self.word_offset,
            what
        );

        self.error.get_or_insert(Error::Timeout);
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
    fn two_word_read() {
        let mut slave = Slave::new(0);
        let mut fsm = SiiFsm::new();
        let mut dg = Datagram::new(16);
        let now = Instant::now();

        fsm.read(0x0018);

        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);
        assert_eq!(dg.data(), &[0x80, 0x01, 0x18, 0x00]);

        // Command accepted; poll goes out
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);
        assert_eq!(dg.data_size(), 10);

        // Still busy once
        let busy = [0x80u8, 0x81, 0x18, 0x00, 0, 0, 0, 0, 0, 0];

        assert_eq!(fsm.step(&mut slave, received(1, &busy), &mut dg, now), Step::Queued);

        // Data ready
        let ready = [0x80u8, 0x00, 0x18, 0x00, 0, 0, 0x00, 0x10, 0x80, 0x00];

        assert_eq!(fsm.step(&mut slave, received(1, &ready), &mut dg, now), Step::Done);
        assert!(fsm.success());
        assert_eq!(fsm.value(), [0x00, 0x10, 0x80, 0x00]);
    }

    #[test]
    fn busy_timeout_allows_one_extra_poll() {
        let mut slave = Slave::new(0);
        let mut fsm = SiiFsm::new();
        let mut dg = Datagram::new(16);
        let now = Instant::now();

        fsm.read(0x0000);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);

        let busy = [0x80u8, 0x81, 0, 0, 0, 0, 0, 0, 0, 0];
        let late = now + Duration::from_millis(50);

        // Timeout reached: one more poll is granted
        assert_eq!(fsm.step(&mut slave, received(1, &busy), &mut dg, late), Step::Queued);

        // Still busy: give up
        assert_eq!(fsm.step(&mut slave, received(1, &busy), &mut dg, late), Step::Done);
        assert!(!fsm.success());
        assert_eq!(fsm.error(), Some(Error::Sii(SiiError::Busy)));
    }

    #[test]
    fn command_error_bit() {
        let mut slave = Slave::new(0);
        let mut fsm = SiiFsm::new();
        let mut dg = Datagram::new(16);
        let now = Instant::now();

        fsm.read(0x0040);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);

        let error = [0x80u8, 0x20, 0, 0, 0, 0, 0, 0, 0, 0];

        assert_eq!(fsm.step(&mut slave, received(1, &error), &mut dg, now), Step::Done);
        assert_eq!(fsm.error(), Some(Error::Sii(SiiError::AccessError)));
    }
}
