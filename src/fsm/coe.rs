//! CoE SDO transfer machine: expedited and segmented upload/download, the
//! SDO information (dictionary) services and emergency handling.
//!
//! Every mailbox round trip is three datagram exchanges: write the request
//! into the slave's receive mailbox, poll the sync manager 1 status until the
//! response is ready, then fetch it from the transmit mailbox. Emergencies
//! can arrive in place of any response; they are collected and the mailbox is
//! checked again for the real response.

use super::{Response, Step, FSM_RETRIES};
use crate::coe::{
    sdo_command, CoeHeader, CoeService, EmergencyMessage, SdoHeader, SdoInfoHeader,
    SdoInfoOpCode, SdoSegmentHeader, COE_HEADER_LEN,
};
use crate::datagram::Datagram;
use crate::error::{Error, MailboxError};
use crate::fmt;
use crate::mailbox::{
    next_counter, parse_error_reply, MailboxHeader, MailboxType, MAILBOX_HEADER_LEN,
};
use crate::register::RegisterAddress;
use crate::slave::{SdoEntryAccess, SdoEntryInfo, SdoObject, Slave};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};
use std::time::{Duration, Instant};

/// How long to wait for a mailbox response before giving up with abort code
/// `0x05040000`.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Overall per-response budget during dictionary scans.
const DICT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Headers of a normal download/upload initiate request: mailbox + CoE + SDO
/// + 4 byte complete size.
const INITIATE_OVERHEAD: usize = MAILBOX_HEADER_LEN + COE_HEADER_LEN + 4 + 4;

/// Headers of a segment request: mailbox + CoE + segment specifier.
const SEGMENT_OVERHEAD: usize = MAILBOX_HEADER_LEN + COE_HEADER_LEN + 1;

/// Minimum segment payload; shorter trailers are padded and sized via the
/// `seg_data_size` field.
const MIN_SEGMENT_DATA: usize = 7;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    End,
    Error,

    DownStart,
    DownRequest,
    DownCheck,
    DownResponse,
    DownSegRequest,
    DownSegCheck,
    DownSegResponse,

    UpStart,
    UpRequest,
    UpCheck,
    UpResponse,
    UpSegRequest,
    UpSegCheck,
    UpSegResponse,

    DictStart,
    DictRequest,
    DictCheck,
    DictResponse,
    DescRequest,
    DescCheck,
    DescResponse,
    EntryRequest,
    EntryCheck,
    EntryResponse,
}

/// Outcome of the send-confirm classification.
enum Confirm {
    Ok,
    Resend,
    Fail(Error),
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct CoeFsm {
    state: State,

    index: u16,
    sub_index: u8,
    complete_access: bool,

    /// Download source or upload destination.
    buffer: Vec<u8>,
    /// Bytes transferred so far.
    offset: usize,
    /// Declared complete size of a segmented upload.
    complete_size: usize,
    /// Bytes carried by the download segment currently in flight; the
    /// offset only advances once the segment is acknowledged, so resends
    /// repeat the same chunk.
    pending_chunk: usize,
    toggle: bool,

    retries: u8,
    /// Start of the current wait phase, for the response timeout.
    wait_started: Option<Instant>,

    error: Option<Error>,

    /// Emergency messages received in place of responses, drained by the
    /// owner into the slave config's emergency ring.
    pub(crate) emergencies: Vec<EmergencyMessage>,

    // Dictionary cursor.
    dict_indices: Vec<u16>,
    dict_cursor: usize,
    dict_first_fragment: bool,
    current_object: Option<SdoObject>,
    entry_sub: u8,
}

impl CoeFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            index: 0,
            sub_index: 0,
            complete_access: false,
            buffer: Vec::new(),
            offset: 0,
            complete_size: 0,
            pending_chunk: 0,
            toggle: false,
            retries: 0,
            wait_started: None,
            error: None,
            emergencies: Vec::new(),
            dict_indices: Vec::new(),
            dict_cursor: 0,
            dict_first_fragment: true,
            current_object: None,
            entry_sub: 0,
        }
    }

    /// Arm an SDO download of `data` to `index:sub_index`.
    pub(crate) fn download(
        &mut self,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: Vec<u8>,
    ) {
        self.reset(index, sub_index, complete_access);
        self.buffer = data;
        self.state = State::DownStart;
    }

    /// Arm an SDO upload from `index:sub_index`.
    pub(crate) fn upload(&mut self, index: u16, sub_index: u8, complete_access: bool) {
        self.reset(index, sub_index, complete_access);
        self.state = State::UpStart;
    }

    /// Arm a full dictionary scan.
    pub(crate) fn read_dictionary(&mut self) {
        self.reset(0, 0, false);
        self.dict_indices.clear();
        self.dict_cursor = 0;
        self.dict_first_fragment = true;
        self.current_object = None;
        self.state = State::DictStart;
    }

    fn reset(&mut self, index: u16, sub_index: u8, complete_access: bool) {
        self.index = index;
        self.sub_index = sub_index;
        self.complete_access = complete_access;
        self.buffer = Vec::new();
        self.offset = 0;
        self.complete_size = 0;
        self.pending_chunk = 0;
        self.toggle = false;
        self.retries = FSM_RETRIES;
        self.wait_started = None;
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

    /// The assembled upload data after a successful upload.
    pub(crate) fn take_data(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buffer)
    }

    pub(crate) fn step(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if self.running() && !slave.configured_mailbox.is_configured() {
            return self.fail(slave, Error::Mailbox(MailboxError::NoMailbox));
        }

        match self.state {
            State::Idle | State::End | State::Error => Step::Done,

            // Download
            State::DownStart => {
                fmt::debug!(
                    "Slave {:#06x}: downloading SDO {:#06x}:{:02x}, {} bytes",
                    slave.station_address,
                    self.index,
                    self.sub_index,
                    self.buffer.len()
                );

                self.send_down_initiate(slave, dg);
                self.state = State::DownRequest;
                self.wait_started = Some(now);
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DownRequest => match self.classify_confirm(&resp, now, RESPONSE_TIMEOUT) {
                Confirm::Resend => {
                    self.send_down_initiate(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::DownCheck),
            },
            State::DownCheck => self.step_check(slave, resp, dg, now, State::DownResponse),
            State::DownResponse => {
                let payload = match self.take_fetch(slave, resp, dg, State::DownCheck) {
                    Fetched::Data(payload) => payload,
                    Fetched::Again(step) => return step,
                    Fetched::Failed => return Step::Done,
                };

                match self.parse_sdo_response(slave, &payload, sdo_command::SCS_DOWNLOAD) {
                    Ok(()) => {}
                    Err(again) => return self.retry_or_fail(slave, dg, again, State::DownCheck),
                }

                if self.offset >= self.buffer.len() {
                    self.state = State::End;

                    return Step::Done;
                }

                // More data; start segmenting with toggle 0
                self.toggle = false;
                self.send_down_segment(slave, dg);
                self.state = State::DownSegRequest;
                self.wait_started = Some(now);
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DownSegRequest => match self.classify_confirm(&resp, now, RESPONSE_TIMEOUT) {
                Confirm::Resend => {
                    self.send_down_segment(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::DownSegCheck),
            },
            State::DownSegCheck => {
                self.step_check(slave, resp, dg, now, State::DownSegResponse)
            }
            State::DownSegResponse => {
                let payload = match self.take_fetch(slave, resp, dg, State::DownSegCheck) {
                    Fetched::Data(payload) => payload,
                    Fetched::Again(step) => return step,
                    Fetched::Failed => return Step::Done,
                };

                let seg = match self.parse_segment_response(
                    slave,
                    &payload,
                    sdo_command::SCS_DOWNLOAD_SEGMENT,
                ) {
                    Ok(seg) => seg,
                    Err(again) => {
                        return self.retry_or_fail(slave, dg, again, State::DownSegCheck)
                    }
                };

                if seg.toggle != self.toggle {
                    fmt::error!(
                        "Slave {:#06x}: download segment toggle mismatch",
                        slave.station_address
                    );

                    return self.fail(
                        slave,
                        Error::SdoAbort(crate::coe::CoeAbortCode::TOGGLE),
                    );
                }

                // The in-flight chunk is confirmed delivered
                self.offset += self.pending_chunk;
                self.pending_chunk = 0;

                if self.offset >= self.buffer.len() {
                    self.state = State::End;

                    return Step::Done;
                }

                self.toggle = !self.toggle;
                self.send_down_segment(slave, dg);
                self.state = State::DownSegRequest;
                self.wait_started = Some(now);
                self.retries = FSM_RETRIES;

                Step::Queued
            }

            // Upload
            State::UpStart => {
                fmt::debug!(
                    "Slave {:#06x}: uploading SDO {:#06x}:{:02x}",
                    slave.station_address,
                    self.index,
                    self.sub_index
                );

                self.send_up_initiate(slave, dg);
                self.state = State::UpRequest;
                self.wait_started = Some(now);
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::UpRequest => match self.classify_confirm(&resp, now, RESPONSE_TIMEOUT) {
                Confirm::Resend => {
                    self.send_up_initiate(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::UpCheck),
            },
            State::UpCheck => self.step_check(slave, resp, dg, now, State::UpResponse),
            State::UpResponse => self.step_up_response(slave, resp, dg, now),
            State::UpSegRequest => match self.classify_confirm(&resp, now, RESPONSE_TIMEOUT) {
                Confirm::Resend => {
                    self.send_up_segment(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::UpSegCheck),
            },
            State::UpSegCheck => self.step_check(slave, resp, dg, now, State::UpSegResponse),
            State::UpSegResponse => self.step_up_seg_response(slave, resp, dg, now),

            // Dictionary
            State::DictStart => {
                fmt::debug!("Slave {:#06x}: reading SDO dictionary", slave.station_address);

                self.send_dict_list(slave, dg);
                self.state = State::DictRequest;
                self.wait_started = Some(now);
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DictRequest => match self.classify_confirm(&resp, now, DICT_TIMEOUT) {
                Confirm::Resend => {
                    self.send_dict_list(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::DictCheck),
            },
            State::DictCheck => self.step_check(slave, resp, dg, now, State::DictResponse),
            State::DictResponse => self.step_dict_response(slave, resp, dg, now),
            State::DescRequest => match self.classify_confirm(&resp, now, DICT_TIMEOUT) {
                Confirm::Resend => {
                    self.send_desc_request(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::DescCheck),
            },
            State::DescCheck => self.step_check(slave, resp, dg, now, State::DescResponse),
            State::DescResponse => self.step_desc_response(slave, resp, dg, now),
            State::EntryRequest => match self.classify_confirm(&resp, now, DICT_TIMEOUT) {
                Confirm::Resend => {
                    self.send_entry_request(slave, dg);

                    Step::Queued
                }
                Confirm::Fail(error) => self.fail(slave, error),
                Confirm::Ok => self.enter_check(slave, dg, now, State::EntryCheck),
            },
            State::EntryCheck => self.step_check(slave, resp, dg, now, State::EntryResponse),
            State::EntryResponse => self.step_entry_response(slave, resp, dg, now),
        }
    }

    // Mailbox plumbing

    /// Prepare the datagram that writes `payload` (CoE data, mailbox header
    /// excluded) into the slave's receive mailbox.
    fn prepare_send(&self, slave: &mut Slave, dg: &mut Datagram, payload: &[u8]) {
        let mbox = slave.configured_mailbox;
        let counter = next_counter(&mut slave.mailbox_counter);

        dg.fpwr(
            slave.station_address,
            mbox.rx_offset,
            usize::from(mbox.rx_size),
        );

        let header = MailboxHeader::new(payload.len() as u16, MailboxType::Coe, counter);

        let data = dg.data_mut();

        header.pack_to_slice_unchecked(&mut data[..MAILBOX_HEADER_LEN]);
        data[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + payload.len()].copy_from_slice(payload);
    }

    /// Prepare the sync manager 1 status poll.
    fn prepare_check(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fprd(slave.station_address, RegisterAddress::sync_manager(1), 8);
    }

    /// Prepare the transmit mailbox fetch.
    fn prepare_fetch(&self, slave: &Slave, dg: &mut Datagram) {
        let mbox = slave.configured_mailbox;

        dg.fprd(
            slave.station_address,
            mbox.tx_offset,
            usize::from(mbox.tx_size),
        );
    }

    /// Classify the response to a mailbox write: accepted, to be resent
    /// (mailbox not ready yet), or failed.
    fn classify_confirm(&mut self, resp: &Response<'_>, now: Instant, timeout: Duration) -> Confirm {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;

            return Confirm::Resend;
        }

        if !resp.is_received() {
            return Confirm::Fail(Error::Timeout);
        }

        if resp.working_counter != 1 {
            // The slave did not take the data; covers slaves that need a
            // moment after a state change before their mailbox works.
            let waited = self
                .wait_started
                .map_or(Duration::ZERO, |at| now.duration_since(at));

            if waited < timeout {
                return Confirm::Resend;
            }

            return Confirm::Fail(Error::Mailbox(MailboxError::NoResponse));
        }

        Confirm::Ok
    }

    fn enter_check(
        &mut self,
        slave: &Slave,
        dg: &mut Datagram,
        now: Instant,
        check_state: State,
    ) -> Step {
        self.prepare_check(slave, dg);
        self.state = check_state;
        self.wait_started = Some(now);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    /// Poll the sync manager status until the response mailbox is full, then
    /// fetch it.
    fn step_check(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
        response_state: State,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            self.prepare_check(slave, dg);

            return Step::Queued;
        }

        if !resp.is_received() {
            return self.fail(slave, Error::Timeout);
        }

        if resp.working_counter != 1 {
            return self.fail(
                slave,
                Error::WorkingCounter {
                    expected: 1,
                    received: resp.working_counter,
                },
            );
        }

        let mailbox_full = resp.data.len() >= 6 && resp.data[5] & 0x08 != 0;

        if !mailbox_full {
            let waited = self
                .wait_started
                .map_or(Duration::ZERO, |at| now.duration_since(at));

            if waited >= RESPONSE_TIMEOUT {
                fmt::error!(
                    "Slave {:#06x}: timeout while waiting for SDO response",
                    slave.station_address
                );

                return self.fail(
                    slave,
                    Error::SdoAbort(crate::coe::CoeAbortCode::TIMEOUT),
                );
            }

            self.prepare_check(slave, dg);
            self.retries = FSM_RETRIES;

            return Step::Queued;
        }

        self.prepare_fetch(slave, dg);
        self.state = response_state;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    /// Common fetch handling: datagram errors, mailbox error replies,
    /// emergencies, protocol validation. Returns the CoE payload.
    fn take_fetch<'a>(
        &mut self,
        slave: &mut Slave,
        resp: Response<'a>,
        dg: &mut Datagram,
        check_state: State,
    ) -> Fetched<'a> {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            self.prepare_fetch(slave, dg);

            return Fetched::Again(Step::Queued);
        }

        if !resp.is_received() {
            self.fail(slave, Error::Timeout);

            return Fetched::Failed;
        }

        if resp.working_counter != 1 {
            self.fail(
                slave,
                Error::WorkingCounter {
                    expected: 1,
                    received: resp.working_counter,
                },
            );

            return Fetched::Failed;
        }

        let Ok(header) = MailboxHeader::unpack_from_slice(resp.data) else {
            self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));

            return Fetched::Failed;
        };

        let end = MAILBOX_HEADER_LEN + usize::from(header.length);

        if resp.data.len() < end {
            self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));

            return Fetched::Failed;
        }

        let payload = &resp.data[MAILBOX_HEADER_LEN..end];

        match header.mailbox_type {
            MailboxType::Err => {
                let code = parse_error_reply(payload);

                fmt::error!(
                    "Slave {:#06x}: mailbox error reply: {:?}",
                    slave.station_address,
                    code
                );

                self.fail(
                    slave,
                    code.map_or(Error::Mailbox(MailboxError::ResponseInvalid), |code| {
                        Error::Mailbox(MailboxError::Code(code))
                    }),
                );

                Fetched::Failed
            }
            MailboxType::Coe => {
                // An emergency may arrive in place of the response; stash it
                // and look again.
                if let Ok(coe) = CoeHeader::unpack_from_slice(payload) {
                    if coe.service == CoeService::Emergency {
                        if let Ok(emergency) =
                            EmergencyMessage::unpack_from_slice(&payload[COE_HEADER_LEN..])
                        {
                            fmt::warn!(
                                "Slave {:#06x}: CoE emergency: {}",
                                slave.station_address,
                                emergency
                            );

                            self.emergencies.push(emergency);
                        }

                        self.prepare_check(slave, dg);
                        self.state = check_state;
                        self.retries = FSM_RETRIES;

                        return Fetched::Again(Step::Queued);
                    }
                }

                Fetched::Data(payload)
            }
            other => {
                fmt::error!(
                    "Slave {:#06x}: received mailbox protocol {:?} as response",
                    slave.station_address,
                    other
                );

                self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));

                Fetched::Failed
            }
        }
    }

    /// An invalid-but-not-fatal response: poll the mailbox again, or fail if
    /// the error is terminal.
    fn retry_or_fail(
        &mut self,
        slave: &mut Slave,
        dg: &mut Datagram,
        error: Option<Error>,
        check_state: State,
    ) -> Step {
        match error {
            Some(error) => self.fail(slave, error),
            None => {
                self.prepare_check(slave, dg);
                self.state = check_state;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
        }
    }

    /// Validate a CoE SDO response frame against an expected server command
    /// specifier. `Err(None)` means "not our response, check again";
    /// `Err(Some(e))` is fatal.
    fn parse_sdo_response(
        &mut self,
        slave: &Slave,
        payload: &[u8],
        expected_command: u8,
    ) -> Result<(), Option<Error>> {
        if payload.len() < COE_HEADER_LEN + 4 {
            return Err(Some(Error::Mailbox(MailboxError::ResponseInvalid)));
        }

        let coe = CoeHeader::unpack_from_slice(payload)
            .map_err(|_| Some(Error::Mailbox(MailboxError::ResponseInvalid)))?;

        if coe.service != CoeService::SdoResponse {
            fmt::debug!(
                "Slave {:#06x}: unexpected CoE service {:?}, retrying",
                slave.station_address,
                coe.service
            );

            return Err(None);
        }

        let sdo = SdoHeader::unpack_from_slice(&payload[COE_HEADER_LEN..])
            .map_err(|_| Some(Error::Mailbox(MailboxError::ResponseInvalid)))?;

        if sdo.command == sdo_command::ABORT {
            let code = self.abort_code(payload);

            fmt::error!(
                "Slave {:#06x}: SDO {:#06x}:{:02x} aborted: {}",
                slave.station_address,
                self.index,
                self.sub_index,
                code
            );

            return Err(Some(Error::SdoAbort(code)));
        }

        if sdo.command != expected_command
            || sdo.index != self.index
            || (!self.complete_access && sdo.sub_index != self.sub_index)
        {
            return Err(None);
        }

        Ok(())
    }

    fn abort_code(&self, payload: &[u8]) -> crate::coe::CoeAbortCode {
        if payload.len() < 10 {
            return crate::coe::CoeAbortCode(0);
        }

        crate::coe::CoeAbortCode(u32::from_le_bytes([
            payload[6],
            payload[7],
            payload[8],
            payload[9],
        ]))
    }

    /// Validate a segment response, returning its header.
    fn parse_segment_response(
        &mut self,
        slave: &Slave,
        payload: &[u8],
        expected_command: u8,
    ) -> Result<SdoSegmentHeader, Option<Error>> {
        if payload.len() < COE_HEADER_LEN + 1 {
            return Err(Some(Error::Mailbox(MailboxError::ResponseInvalid)));
        }

        let coe = CoeHeader::unpack_from_slice(payload)
            .map_err(|_| Some(Error::Mailbox(MailboxError::ResponseInvalid)))?;

        if coe.service != CoeService::SdoResponse {
            return Err(None);
        }

        let seg = SdoSegmentHeader::unpack_from_slice(&payload[COE_HEADER_LEN..])
            .map_err(|_| Some(Error::Mailbox(MailboxError::ResponseInvalid)))?;

        if seg.command == sdo_command::ABORT {
            let code = self.abort_code(payload);

            fmt::error!(
                "Slave {:#06x}: SDO {:#06x}:{:02x} aborted: {}",
                slave.station_address,
                self.index,
                self.sub_index,
                code
            );

            return Err(Some(Error::SdoAbort(code)));
        }

        if seg.command != expected_command {
            return Err(None);
        }

        Ok(seg)
    }

    // Download request builders

    fn send_down_initiate(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let mbox_cap = usize::from(slave.configured_mailbox.rx_size);

        let mut payload = Vec::with_capacity(mbox_cap - MAILBOX_HEADER_LEN);

        let expedited = self.buffer.len() <= 4;

        let mut coe = [0u8; COE_HEADER_LEN];
        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut coe);
        payload.extend_from_slice(&coe);

        if expedited {
            let header = SdoHeader {
                size_indicator: true,
                expedited: true,
                size: (4 - self.buffer.len()) as u8,
                complete_access: self.complete_access,
                command: sdo_command::CCS_DOWNLOAD,
                index: self.index,
                sub_index: self.sub_index,
            };

            let mut sdo = [0u8; 4];
            header.pack_to_slice_unchecked(&mut sdo);
            payload.extend_from_slice(&sdo);

            let mut data = [0u8; 4];
            data[..self.buffer.len()].copy_from_slice(&self.buffer);
            payload.extend_from_slice(&data);

            self.offset = self.buffer.len();
        } else {
            let header = SdoHeader {
                size_indicator: true,
                expedited: false,
                size: 0,
                complete_access: self.complete_access,
                command: sdo_command::CCS_DOWNLOAD,
                index: self.index,
                sub_index: self.sub_index,
            };

            let mut sdo = [0u8; 4];
            header.pack_to_slice_unchecked(&mut sdo);
            payload.extend_from_slice(&sdo);

            payload.extend_from_slice(&(self.buffer.len() as u32).to_le_bytes());

            let first_chunk = (mbox_cap - INITIATE_OVERHEAD).min(self.buffer.len());

            payload.extend_from_slice(&self.buffer[..first_chunk]);

            self.offset = first_chunk;
        }

        self.prepare_send(slave, dg, &payload);
    }

    fn send_down_segment(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let mbox_cap = usize::from(slave.configured_mailbox.rx_size);
        let seg_cap = mbox_cap - SEGMENT_OVERHEAD;

        let remaining = self.buffer.len() - self.offset;
        let chunk = seg_cap.min(remaining);
        let is_last = chunk == remaining;

        let mut payload = Vec::with_capacity(SEGMENT_OVERHEAD + chunk.max(MIN_SEGMENT_DATA));

        let mut coe = [0u8; COE_HEADER_LEN];
        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut coe);
        payload.extend_from_slice(&coe);

        let header = SdoSegmentHeader {
            is_last,
            seg_data_size: MIN_SEGMENT_DATA.saturating_sub(chunk) as u8,
            toggle: self.toggle,
            command: sdo_command::CCS_DOWNLOAD_SEGMENT,
        };

        let mut seg = [0u8; 1];
        header.pack_to_slice_unchecked(&mut seg);
        payload.extend_from_slice(&seg);

        payload.extend_from_slice(&self.buffer[self.offset..self.offset + chunk]);

        // Minimal segments are padded to 7 data bytes
        for _ in chunk..MIN_SEGMENT_DATA {
            payload.push(0);
        }

        self.pending_chunk = chunk;

        self.prepare_send(slave, dg, &payload);
    }

    // Upload request builders

    fn send_up_initiate(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let mut payload = Vec::with_capacity(10);

        let mut coe = [0u8; COE_HEADER_LEN];
        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut coe);
        payload.extend_from_slice(&coe);

        let header = SdoHeader {
            size_indicator: false,
            expedited: false,
            size: 0,
            complete_access: self.complete_access,
            command: sdo_command::CCS_UPLOAD,
            index: self.index,
            sub_index: self.sub_index,
        };

        let mut sdo = [0u8; 4];
        header.pack_to_slice_unchecked(&mut sdo);
        payload.extend_from_slice(&sdo);

        // Reserved
        payload.extend_from_slice(&[0u8; 4]);

        self.prepare_send(slave, dg, &payload);
    }

    fn send_up_segment(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let mut payload = Vec::with_capacity(10);

        let mut coe = [0u8; COE_HEADER_LEN];
        CoeHeader {
            service: CoeService::SdoRequest,
        }
        .pack_to_slice_unchecked(&mut coe);
        payload.extend_from_slice(&coe);

        let header = SdoSegmentHeader {
            is_last: false,
            seg_data_size: 0,
            toggle: self.toggle,
            command: sdo_command::CCS_UPLOAD_SEGMENT,
        };

        let mut seg = [0u8; 1];
        header.pack_to_slice_unchecked(&mut seg);
        payload.extend_from_slice(&seg);

        // Pad to the minimal segment frame
        payload.extend_from_slice(&[0u8; 7]);

        self.prepare_send(slave, dg, &payload);
    }

    fn step_up_response(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let payload = match self.take_fetch(slave, resp, dg, State::UpCheck) {
            Fetched::Data(payload) => payload,
            Fetched::Again(step) => return step,
            Fetched::Failed => return Step::Done,
        };

        match self.parse_sdo_response(slave, &payload, sdo_command::SCS_UPLOAD) {
            Ok(()) => {}
            Err(again) => return self.retry_or_fail(slave, dg, again, State::UpCheck),
        }

        let Ok(sdo) = SdoHeader::unpack_from_slice(&payload[COE_HEADER_LEN..]) else {
            return self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));
        };

        if sdo.expedited {
            let size = if sdo.size_indicator {
                4 - usize::from(sdo.size)
            } else {
                4
            };

            if payload.len() < 6 + size {
                return self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));
            }

            self.buffer = payload[6..6 + size].to_vec();
            self.state = State::End;

            return Step::Done;
        }

        // Normal transfer: complete size plus the first chunk
        if payload.len() < 10 {
            return self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));
        }

        self.complete_size =
            u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]) as usize;

        let chunk = &payload[10..];

        self.buffer = Vec::with_capacity(self.complete_size);
        self.buffer
            .extend_from_slice(&chunk[..chunk.len().min(self.complete_size)]);

        if self.buffer.len() >= self.complete_size {
            self.state = State::End;

            return Step::Done;
        }

        self.toggle = false;
        self.send_up_segment(slave, dg);
        self.state = State::UpSegRequest;
        self.wait_started = Some(now);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn step_up_seg_response(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let payload = match self.take_fetch(slave, resp, dg, State::UpSegCheck) {
            Fetched::Data(payload) => payload,
            Fetched::Again(step) => return step,
            Fetched::Failed => return Step::Done,
        };

        let seg = match self.parse_segment_response(
            slave,
            &payload,
            sdo_command::SCS_UPLOAD_SEGMENT,
        ) {
            Ok(seg) => seg,
            Err(again) => return self.retry_or_fail(slave, dg, again, State::UpSegCheck),
        };

        if seg.toggle != self.toggle {
            fmt::error!(
                "Slave {:#06x}: upload segment toggle mismatch",
                slave.station_address
            );

            return self.fail(slave, Error::SdoAbort(crate::coe::CoeAbortCode::TOGGLE));
        }

        let data = &payload[COE_HEADER_LEN + 1..];

        let mut len = data.len();

        if len == MIN_SEGMENT_DATA {
            // Short trailers are padded; the header says how much is real
            len -= usize::from(seg.seg_data_size);
        }

        let wanted = self.complete_size - self.buffer.len();

        self.buffer.extend_from_slice(&data[..len.min(wanted)]);

        if seg.is_last || self.buffer.len() >= self.complete_size {
            if self.buffer.len() != self.complete_size {
                fmt::warn!(
                    "Slave {:#06x}: SDO upload ended with {} of {} bytes",
                    slave.station_address,
                    self.buffer.len(),
                    self.complete_size
                );
            }

            self.state = State::End;

            return Step::Done;
        }

        self.toggle = !self.toggle;
        self.send_up_segment(slave, dg);
        self.state = State::UpSegRequest;
        self.wait_started = Some(now);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    // Dictionary request builders and parsers

    fn send_dict_list(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let mut payload = Vec::with_capacity(8);

        self.push_info_header(&mut payload, SdoInfoOpCode::GetObjectDescriptionListRequest);

        // List type 0x01: all objects
        payload.extend_from_slice(&0x0001u16.to_le_bytes());

        self.prepare_send(slave, dg, &payload);
    }

    fn send_desc_request(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let index = self.dict_indices[self.dict_cursor];

        let mut payload = Vec::with_capacity(8);

        self.push_info_header(&mut payload, SdoInfoOpCode::GetObjectDescriptionRequest);
        payload.extend_from_slice(&index.to_le_bytes());

        self.prepare_send(slave, dg, &payload);
    }

    fn send_entry_request(&mut self, slave: &mut Slave, dg: &mut Datagram) {
        let index = self.dict_indices[self.dict_cursor];

        let mut payload = Vec::with_capacity(10);

        self.push_info_header(&mut payload, SdoInfoOpCode::GetEntryDescriptionRequest);
        payload.extend_from_slice(&index.to_le_bytes());
        payload.push(self.entry_sub);
        // Value info: access rights only
        payload.push(0x01);

        self.prepare_send(slave, dg, &payload);
    }

    fn push_info_header(&self, payload: &mut Vec<u8>, op_code: SdoInfoOpCode) {
        let mut coe = [0u8; COE_HEADER_LEN];
        CoeHeader {
            service: CoeService::SdoInformation,
        }
        .pack_to_slice_unchecked(&mut coe);
        payload.extend_from_slice(&coe);

        let mut info = [0u8; 4];
        SdoInfoHeader {
            op_code,
            incomplete: false,
            fragments_left: 0,
        }
        .pack_to_slice_unchecked(&mut info);
        payload.extend_from_slice(&info);
    }

    /// Validate an SDO information response. Returns the info header.
    ///
    /// `Err(None)` means "unexpected frame, check the mailbox again";
    /// `Err(Some(code))` carries an info error response's abort code.
    fn parse_info_response(
        &self,
        payload: &[u8],
        expected: SdoInfoOpCode,
    ) -> Result<SdoInfoHeader, Option<crate::coe::CoeAbortCode>> {
        if payload.len() < 6 {
            return Err(None);
        }

        let Ok(coe) = CoeHeader::unpack_from_slice(payload) else {
            return Err(None);
        };

        if coe.service != CoeService::SdoInformation {
            return Err(None);
        }

        let Ok(info) = SdoInfoHeader::unpack_from_slice(&payload[COE_HEADER_LEN..]) else {
            return Err(None);
        };

        if info.op_code == SdoInfoOpCode::SdoInfoErrorRequest {
            let code = if payload.len() >= 10 {
                crate::coe::CoeAbortCode(u32::from_le_bytes([
                    payload[6],
                    payload[7],
                    payload[8],
                    payload[9],
                ]))
            } else {
                crate::coe::CoeAbortCode(0)
            };

            return Err(Some(code));
        }

        if info.op_code != expected {
            return Err(None);
        }

        Ok(info)
    }

    fn step_dict_response(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let payload = match self.take_fetch(slave, resp, dg, State::DictCheck) {
            Fetched::Data(payload) => payload,
            Fetched::Again(step) => return step,
            Fetched::Failed => return Step::Done,
        };

        let info = match self.parse_info_response(
            &payload,
            SdoInfoOpCode::GetObjectDescriptionListResponse,
        ) {
            Ok(info) => info,
            Err(Some(code)) => {
                fmt::error!(
                    "Slave {:#06x}: SDO information error: {}",
                    slave.station_address,
                    code
                );

                return self.fail(slave, Error::SdoAbort(code));
            }
            Err(None) => return self.retry_or_fail(slave, dg, None, State::DictCheck),
        };

        // The first fragment leads with the list type word, later fragments
        // go straight into indices.
        let list_offset = if self.dict_first_fragment { 8 } else { 6 };

        if payload.len() < list_offset || (payload.len() - list_offset) % 2 != 0 {
            return self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));
        }

        self.dict_first_fragment = false;

        for chunk in payload[list_offset..].chunks_exact(2) {
            let index = u16::from_le_bytes([chunk[0], chunk[1]]);

            if index != 0 {
                self.dict_indices.push(index);
            }
        }

        if info.incomplete || info.fragments_left > 0 {
            // More fragments are already on the way; go back to polling
            self.prepare_check(slave, dg);
            self.state = State::DictCheck;
            self.wait_started = Some(now);
            self.retries = FSM_RETRIES;

            return Step::Queued;
        }

        fmt::debug!(
            "Slave {:#06x}: dictionary lists {} objects",
            slave.station_address,
            self.dict_indices.len()
        );

        slave.dictionary.clear();
        self.dict_cursor = 0;

        self.next_object(slave, dg, now)
    }

    /// Request the next object description, or finish the scan.
    fn next_object(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if let Some(object) = self.current_object.take() {
            slave.dictionary.push(object);
        }

        if self.dict_cursor >= self.dict_indices.len() {
            self.state = State::End;

            return Step::Done;
        }

        self.send_desc_request(slave, dg);
        self.state = State::DescRequest;
        self.wait_started = Some(now);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn step_desc_response(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let payload = match self.take_fetch(slave, resp, dg, State::DescCheck) {
            Fetched::Data(payload) => payload,
            Fetched::Again(step) => return step,
            Fetched::Failed => return Step::Done,
        };

        let index = self.dict_indices[self.dict_cursor];

        let info = match self
            .parse_info_response(&payload, SdoInfoOpCode::GetObjectDescriptionResponse)
        {
            Ok(info) => info,
            Err(Some(code)) => {
                fmt::error!(
                    "Slave {:#06x}: object description of {:#06x} failed: {}",
                    slave.station_address,
                    index,
                    code
                );

                return self.fail(slave, Error::SdoAbort(code));
            }
            Err(None) => return self.retry_or_fail(slave, dg, None, State::DescCheck),
        };

        if info.incomplete {
            // Fragmented descriptions are not supported; failing beats
            // returning a silently truncated dictionary.
            fmt::error!(
                "Slave {:#06x}: fragmented object description response for {:#06x}",
                slave.station_address,
                index
            );

            return self.fail(slave, Error::Mailbox(MailboxError::ResponseInvalid));
        }

        if payload.len() < 12 || u16::from_le_bytes([payload[6], payload[7]]) != index {
            return self.retry_or_fail(slave, dg, None, State::DescCheck);
        }

        let max_sub_index = payload[10];
        let object_code = payload[11];
        let name = String::from_utf8_lossy(&payload[12..]).into_owned();

        self.current_object = Some(SdoObject {
            index,
            object_code,
            max_sub_index,
            name,
            entries: Vec::new(),
        });

        self.entry_sub = 0;
        self.send_entry_request(slave, dg);
        self.state = State::EntryRequest;
        self.wait_started = Some(now);
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn step_entry_response(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let payload = match self.take_fetch(slave, resp, dg, State::EntryCheck) {
            Fetched::Data(payload) => payload,
            Fetched::Again(step) => return step,
            Fetched::Failed => return Step::Done,
        };

        let index = self.dict_indices[self.dict_cursor];

        match self.parse_info_response(&payload, SdoInfoOpCode::GetEntryDescriptionResponse) {
            Ok(_info) => {
                if payload.len() < 16 {
                    return self.retry_or_fail(slave, dg, None, State::EntryCheck);
                }

                let entry = SdoEntryInfo {
                    sub_index: payload[8],
                    data_type: u16::from_le_bytes([payload[10], payload[11]]),
                    bit_length: u16::from_le_bytes([payload[12], payload[13]]),
                    access: SdoEntryAccess(u16::from_le_bytes([payload[14], payload[15]])),
                    description: String::from_utf8_lossy(&payload[16..]).into_owned(),
                };

                if let Some(object) = self.current_object.as_mut() {
                    object.entries.push(entry);
                }
            }
            Err(Some(code))
                if code == crate::coe::CoeAbortCode::NOT_FOUND
                    || code == crate::coe::CoeAbortCode::SUBINDEX_NOT_FOUND =>
            {
                // Subindex gap; skip it and carry on with the next one
                fmt::debug!(
                    "Slave {:#06x}: no entry {:#06x}:{:02x}, skipping",
                    slave.station_address,
                    index,
                    self.entry_sub
                );
            }
            Err(Some(code)) => {
                fmt::error!(
                    "Slave {:#06x}: entry description of {:#06x}:{:02x} failed: {}",
                    slave.station_address,
                    index,
                    self.entry_sub,
                    code
                );

                return self.fail(slave, Error::SdoAbort(code));
            }
            Err(None) => return self.retry_or_fail(slave, dg, None, State::EntryCheck),
        }

        let max_sub = self
            .current_object
            .as_ref()
            .map_or(0, |object| object.max_sub_index);

        if self.entry_sub < max_sub {
            self.entry_sub += 1;
            self.send_entry_request(slave, dg);
            self.state = State::EntryRequest;
            self.wait_started = Some(now);
            self.retries = FSM_RETRIES;

            return Step::Queued;
        }

        self.dict_cursor += 1;

        self.next_object(slave, dg, now)
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> Step {
        fmt::debug!(
            "Slave {:#06x}: CoE transfer failed: {}",
            slave.station_address,
            error
        );

        self.error = Some(error);
        self.state = State::Error;

        Step::Done
    }
}

enum Fetched<'a> {
    Data(&'a [u8]),
    Again(Step),
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramState;
    use crate::slave::ConfiguredMailbox;

    fn mailbox_slave() -> Slave {
        let mut slave = Slave::new(1);

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

    /// Mailbox response bytes: header + payload, padded to the mailbox size.
    fn mbox_response(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 128];

        out[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        out[5] = 0x13; // CoE, counter 1
        out[6..6 + payload.len()].copy_from_slice(payload);

        out
    }

    fn sm_full() -> Vec<u8> {
        let mut status = vec![0u8; 8];

        status[5] = 0x08;

        status
    }

    #[test]
    fn expedited_download_byte_image() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.download(0x6040, 0x00, false, vec![0x06, 0x00]);

        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);

        // Exactly one CoE request frame: mailbox header + CoE header + SDO
        // header + 4 data bytes
        let data = dg.data();

        assert_eq!(&data[0..2], &[0x0a, 0x00]); // length 10
        assert_eq!(data[5] & 0x0f, 0x03); // CoE
        assert_eq!(
            &data[6..16],
            &[
                0x00, 0x20, // SDO request
                0x2b, 0x40, 0x60, 0x00, // expedited download, 2 bytes
                0x06, 0x00, 0x00, 0x00, // data
            ]
        );

        // Write confirmed
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);

        // Mailbox full
        assert_eq!(
            fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
            Step::Queued
        );

        // Download response: service 3, command specifier bits 011
        let response = mbox_response(&[0x00, 0x30, 0x60, 0x40, 0x60, 0x00, 0, 0, 0, 0]);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert!(fsm.success());
    }

    #[test]
    fn segmented_upload_reassembles() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        let content: Vec<u8> = (0..20u8).collect();

        fsm.upload(0x2000, 0x01, false);

        // Initiate request
        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);
        // Confirm, check
        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);
        assert_eq!(
            fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
            Step::Queued
        );

        // Normal initiate response: complete size 20, first 6 bytes in band
        let mut payload = vec![
            0x00, 0x30, // SDO response
            0x41, 0x00, 0x20, 0x01, // normal upload response, size indicated
            20, 0, 0, 0, // complete size
        ];
        payload.extend_from_slice(&content[..6]);

        let response = mbox_response(&payload);

        // First segment request goes out (toggle 0)
        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Queued
        );
        assert_eq!(dg.data()[8] & 0x10, 0x00);

        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);
        assert_eq!(
            fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
            Step::Queued
        );

        // Segment response, toggle 0, 8 more bytes
        let mut payload = vec![0x00, 0x30, 0x00];
        payload.extend_from_slice(&content[6..14]);

        let response = mbox_response(&payload);

        // Second segment request goes out (toggle 1)
        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Queued
        );
        assert_eq!(dg.data()[8] & 0x10, 0x10);

        assert_eq!(fsm.step(&mut slave, received(1, &[]), &mut dg, now), Step::Queued);
        assert_eq!(
            fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
            Step::Queued
        );

        // Last segment, toggle 1, final 6 bytes
        let mut payload = vec![0x00, 0x30, 0x11];
        payload.extend_from_slice(&content[14..20]);

        let response = mbox_response(&payload);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert!(fsm.success());
        assert_eq!(fsm.take_data(), content);
    }

    #[test]
    fn segment_count_matches_mailbox_capacity() {
        // 300 bytes with a 128 byte mailbox: 112 in the initiate request,
        // then ceil(188 / 119) = 2 segments
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.download(0x2000, 0x01, false, vec![0xab; 300]);

        let mut segment_requests = 0;

        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);

        loop {
            // Confirm the write
            let step = fsm.step(&mut slave, received(1, &[]), &mut dg, now);

            assert_eq!(step, Step::Queued);

            // Mailbox full
            assert_eq!(
                fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
                Step::Queued
            );

            // Matching response: initiate first, then segment acks with the
            // matching toggle
            let response = if segment_requests == 0 {
                mbox_response(&[0x00, 0x30, 0x60, 0x00, 0x20, 0x01, 0, 0, 0, 0])
            } else {
                let toggle = if segment_requests % 2 == 1 { 0x00 } else { 0x10 };

                mbox_response(&[0x00, 0x30, 0x20 | toggle])
            };

            let step = fsm.step(&mut slave, received(1, &response), &mut dg, now);

            if step == Step::Done {
                break;
            }

            segment_requests += 1;

            assert!(segment_requests < 10, "runaway segmenting");
        }

        assert!(fsm.success());
        assert_eq!(segment_requests, 2);
    }

    #[test]
    fn payload_filling_the_mailbox_needs_no_segments() {
        // Exactly rx_mailbox_size - 16 bytes fit the initiate request alone
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.download(0x2000, 0x01, false, vec![0x55; 128 - 16]);

        assert_eq!(fsm.step(&mut slave, Response::NONE, &mut dg, now), Step::Queued);

        // The whole mailbox is used
        assert_eq!(u16::from_le_bytes([dg.data()[0], dg.data()[1]]), 122);

        fsm.step(&mut slave, received(1, &[]), &mut dg, now);
        fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now);

        let response = mbox_response(&[0x00, 0x30, 0x60, 0x00, 0x20, 0x01, 0, 0, 0, 0]);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert!(fsm.success());
    }

    #[test]
    fn toggle_mismatch_aborts_upload() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.upload(0x2000, 0x01, false);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);
        fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now);

        // Normal response, 20 bytes total, 6 in band
        let mut payload = vec![0x00, 0x30, 0x41, 0x00, 0x20, 0x01, 20, 0, 0, 0];
        payload.extend_from_slice(&[0u8; 6]);

        let response = mbox_response(&payload);

        fsm.step(&mut slave, received(1, &response), &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);
        fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now);

        // Segment response with toggle 1 where 0 was expected
        let mut payload = vec![0x00, 0x30, 0x10];
        payload.extend_from_slice(&[0u8; 8]);

        let response = mbox_response(&payload);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert_eq!(
            fsm.error(),
            Some(Error::SdoAbort(crate::coe::CoeAbortCode::TOGGLE))
        );
    }

    #[test]
    fn abort_surfaces_code() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.upload(0x1018, 0x01, false);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);
        fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now);

        // Abort: command specifier 4, code 0x06020000
        let response = mbox_response(&[
            0x00, 0x30, 0x80, 0x18, 0x10, 0x01, 0x00, 0x00, 0x02, 0x06,
        ]);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert!(!fsm.success());
        assert_eq!(
            fsm.error(),
            Some(Error::SdoAbort(crate::coe::CoeAbortCode(0x06020000)))
        );
    }

    #[test]
    fn emergency_is_stashed_and_mailbox_rechecked() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.upload(0x6041, 0x00, false);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);
        fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now);

        // An emergency arrives in place of the response
        let emergency = mbox_response(&[
            0x00, 0x10, // CoE service 1
            0x01, 0x43, // error code 0x4301
            0x02, // error register
            1, 2, 3, 4, 5,
        ]);

        // The machine re-checks the mailbox
        assert_eq!(
            fsm.step(&mut slave, received(1, &emergency), &mut dg, now),
            Step::Queued
        );
        assert_eq!(fsm.emergencies.len(), 1);
        assert_eq!(fsm.emergencies[0].error_code, 0x4301);

        // Now the real (expedited) response
        assert_eq!(
            fsm.step(&mut slave, received(1, &sm_full()), &mut dg, now),
            Step::Queued
        );

        let response = mbox_response(&[
            0x00, 0x30, 0x4f, 0x41, 0x60, 0x00, 0x37, 0x02, 0x00, 0x00,
        ]);

        assert_eq!(
            fsm.step(&mut slave, received(1, &response), &mut dg, now),
            Step::Done
        );
        assert!(fsm.success());
        assert_eq!(fsm.take_data(), vec![0x37]);
    }

    #[test]
    fn response_timeout_aborts_with_0x05040000() {
        let mut slave = mailbox_slave();
        let mut fsm = CoeFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.upload(0x1000, 0x00, false);

        fsm.step(&mut slave, Response::NONE, &mut dg, now);
        fsm.step(&mut slave, received(1, &[]), &mut dg, now);

        // The mailbox never fills
        let empty = vec![0u8; 8];
        let later = now + Duration::from_secs(2);

        assert_eq!(
            fsm.step(&mut slave, received(1, &empty), &mut dg, later),
            Step::Done
        );
        assert_eq!(
            fsm.error(),
            Some(Error::SdoAbort(crate::coe::CoeAbortCode::TIMEOUT))
        );
    }
}
