//! AL state change machine: writes the requested state to `0x0120`, polls
//! `0x0130`, and resolves refused transitions through the AL status code
//! register.

use super::{Response, Step, FSM_RETRIES};
use crate::al_status_code::AlStatusCode;
use crate::datagram::Datagram;
use crate::error::Error;
use crate::fmt;
use crate::register::RegisterAddress;
use crate::slave::Slave;
use crate::slave_state::{AlState, AL_ERROR_FLAG};
use std::time::{Duration, Instant};

/// A slave must reach the requested state within this budget.
const CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether the machine performs the full transition or only acknowledges a
/// pending error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChangeMode {
    Full,
    AckOnly,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Start,
    Check,
    Status,
    Code,
    StartAck,
    CheckAck,
    End,
    Error,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct ChangeFsm {
    state: State,
    mode: ChangeMode,
    requested: AlState,
    /// The last state the slave announced; spontaneous changes move this
    /// baseline instead of failing the transition.
    old_state: AlState,
    spontaneous_change: bool,
    /// In `CheckAck`, whether the acknowledge write has been confirmed and
    /// the machine is now polling the status register.
    ack_polling: bool,
    retries: u8,
    started: Option<Instant>,
    error: Option<Error>,
}

impl ChangeFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            mode: ChangeMode::Full,
            requested: AlState::Init,
            old_state: AlState::Unknown,
            spontaneous_change: false,
            ack_polling: false,
            retries: 0,
            started: None,
            error: None,
        }
    }

    /// Arm the machine for a full transition of `slave` to `requested`.
    pub(crate) fn start(&mut self, slave: &mut Slave, requested: AlState) {
        slave.requested_state = requested;

        self.state = State::Start;
        self.mode = ChangeMode::Full;
        self.requested = requested;
        self.old_state = slave.current_state;
        self.spontaneous_change = false;
        self.ack_polling = false;
        self.retries = FSM_RETRIES;
        self.started = None;
        self.error = None;
    }

    /// Arm the machine to only acknowledge a slave-signalled error.
    pub(crate) fn start_ack(&mut self, slave: &Slave) {
        self.state = State::StartAck;
        self.mode = ChangeMode::AckOnly;
        self.requested = slave.current_state;
        self.old_state = slave.current_state;
        self.spontaneous_change = false;
        self.ack_polling = false;
        self.retries = FSM_RETRIES;
        self.started = None;
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
        match self.state {
            State::Idle | State::End | State::Error => Step::Done,
            State::Start => {
                fmt::debug!(
                    "Slave {:#06x}: changing state to {}",
                    slave.station_address,
                    self.requested
                );

                self.write_control(slave, dg, self.requested.code());
                self.state = State::Check;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::Check => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.write_control(slave, dg, self.requested.code());

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout, "AL control write lost");
                }

                if resp.working_counter != 1 {
                    return self.fail(
                        slave,
                        Error::WorkingCounter {
                            expected: 1,
                            received: resp.working_counter,
                        },
                        "AL control write refused",
                    );
                }

                self.started = Some(now);
                self.read_status(slave, dg);
                self.state = State::Status;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::Status => self.step_status(slave, resp, dg, now),
            State::Code => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    dg.fprd(
                        slave.station_address,
                        RegisterAddress::AlStatusCode.into(),
                        2,
                    );

                    return Step::Queued;
                }

                if resp.is_received() && resp.working_counter == 1 {
                    let code =
                        AlStatusCode(u16::from_le_bytes([resp.data[0], resp.data[1]]));

                    fmt::error!(
                        "Slave {:#06x}: AL status code {}",
                        slave.station_address,
                        code
                    );

                    slave.last_al_status_code = Some(code);
                    self.error = Some(Error::AlStatus(code));
                } else {
                    // No code register, keep the generic error
                    fmt::warn!(
                        "Slave {:#06x}: refused state change, unable to read status code",
                        slave.station_address
                    );
                }

                // Acknowledge the error by writing the current state back
                self.write_control(
                    slave,
                    dg,
                    slave.current_state.code() | AL_ERROR_FLAG,
                );
                self.state = State::CheckAck;
                self.ack_polling = false;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::StartAck => {
                self.write_control(
                    slave,
                    dg,
                    slave.current_state.code() | AL_ERROR_FLAG,
                );
                self.state = State::CheckAck;
                self.ack_polling = false;
                self.retries = FSM_RETRIES;
                self.started = Some(now);

                Step::Queued
            }
            State::CheckAck => self.step_check_ack(slave, resp, dg, now),
        }
    }

    fn step_status(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            self.read_status(slave, dg);

            return Step::Queued;
        }

        if !resp.is_received() {
            return self.fail(slave, Error::Timeout, "AL status read lost");
        }

        if resp.working_counter != 1 {
            return self.fail(
                slave,
                Error::WorkingCounter {
                    expected: 1,
                    received: resp.working_counter,
                },
                "AL status read refused",
            );
        }

        let (announced, error_bit) = AlState::split_register(resp.data[0]);

        slave.current_state = announced;

        if error_bit {
            // Transition refused; find out why, then acknowledge
            dg.fprd(
                slave.station_address,
                RegisterAddress::AlStatusCode.into(),
                2,
            );
            self.state = State::Code;
            self.retries = FSM_RETRIES;

            return Step::Queued;
        }

        if announced == self.requested {
            if self.spontaneous_change {
                fmt::debug!(
                    "Slave {:#06x}: reached {} after a spontaneous detour",
                    slave.station_address,
                    announced
                );
            }

            self.state = State::End;

            return Step::Done;
        }

        if announced != self.old_state {
            // The slave changed state on its own before our request landed.
            // Accept the announcement as the new baseline and keep waiting.
            fmt::debug!(
                "Slave {:#06x}: spontaneous state change to {}",
                slave.station_address,
                announced
            );

            self.spontaneous_change = true;
            self.old_state = announced;
        }

        let elapsed = self
            .started
            .map_or(Duration::ZERO, |at| now.duration_since(at));

        if elapsed >= CHANGE_TIMEOUT {
            return self.fail(
                slave,
                Error::StateTransition {
                    requested: self.requested,
                    actual: announced,
                },
                "state change timed out",
            );
        }

        self.read_status(slave, dg);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn step_check_ack(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;

            if self.ack_polling {
                self.read_status(slave, dg);
            } else {
                self.write_control(
                    slave,
                    dg,
                    slave.current_state.code() | AL_ERROR_FLAG,
                );
            }

            return Step::Queued;
        }

        if !resp.is_received() || resp.working_counter != 1 {
            fmt::warn!(
                "Slave {:#06x}: acknowledge failed",
                slave.station_address
            );

            self.state = State::Error;
            self.error.get_or_insert(Error::Timeout);

            return Step::Done;
        }

        if !self.ack_polling {
            // Response to the acknowledge write; start polling the status
            self.ack_polling = true;
            self.started.get_or_insert(now);
            self.read_status(slave, dg);
            self.retries = FSM_RETRIES;

            return Step::Queued;
        }

        let (announced, error_bit) = AlState::split_register(resp.data[0]);

        slave.current_state = announced;

        if !error_bit {
            fmt::info!(
                "Slave {:#06x}: acknowledged state {}",
                slave.station_address,
                announced
            );

            if self.mode == ChangeMode::AckOnly {
                self.state = State::End;
            } else {
                // The transition itself still failed
                self.state = State::Error;
                self.error.get_or_insert(Error::StateTransition {
                    requested: self.requested,
                    actual: announced,
                });
            }

            return Step::Done;
        }

        let elapsed = self
            .started
            .map_or(Duration::ZERO, |at| now.duration_since(at));

        if elapsed >= CHANGE_TIMEOUT {
            fmt::warn!(
                "Slave {:#06x}: timed out acknowledging state {}",
                slave.station_address,
                announced
            );

            self.state = State::Error;
            self.error.get_or_insert(Error::Timeout);

            return Step::Done;
        }

        self.read_status(slave, dg);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn write_control(&self, slave: &Slave, dg: &mut Datagram, value: u8) {
        dg.fpwr(slave.station_address, RegisterAddress::AlControl.into(), 2);
        dg.data_mut()[0] = value;
    }

    fn read_status(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fprd(slave.station_address, RegisterAddress::AlStatus.into(), 2);
    }

    fn fail(&mut self, slave: &mut Slave, error: Error, what: &str) -> Step {
        fmt::error!(
            "Slave {:#06x}: {}: {}",
            slave.station_address,
            what,
            error
        );

        slave.error_flag = true;
        self.error = Some(error);
        self.state = State::Error;

        Step::Done
    }
}
