//! The master state machine: cyclic broadcast poll, topology supervision,
//! slave scanning and configuration scheduling, and external request
//! dispatch.

use super::change::ChangeFsm;
use super::coe::CoeFsm;
use super::slave_config::{ConfigCtx, SlaveConfigFsm};
use super::slave_scan::SlaveScanFsm;
use super::{FsmDatagram, Response, Step, FSM_RETRIES};
use crate::config::SlaveConfig;
use crate::datagram::Datagram;
use crate::dc;
use crate::error::{Error, Item};
use crate::ext_ring::ExtRing;
use crate::fmt;
use crate::register::RegisterAddress;
use crate::request::{RequestHandle, RequestOp};
use crate::slave::Slave;
use crate::slave_state::AlState;
use std::collections::VecDeque;
use std::time::Instant;

/// How many external requests may be in flight at once.
const MAX_CONCURRENT_REQUESTS: usize = 8;

/// Everything of the master the state machine may touch, borrowed for one
/// cycle.
pub(crate) struct FsmContext<'a> {
    pub slaves: &'a mut Vec<Slave>,
    pub configs: &'a mut Vec<SlaveConfig>,
    /// Scanning is gated so the operation phase does not re-scan while the
    /// application cycles.
    pub allow_scan: bool,
    /// Whether the master is in its operation phase (slaves with configs are
    /// driven to OP instead of PREOP).
    pub operation: bool,
    pub app_time: u64,
    pub dc_ref_time: u64,
    /// Index of the DC reference clock slave, maintained across scans.
    pub dc_reference: &'a mut Option<usize>,
    /// Application-nominated reference config, if any.
    pub dc_nominated: Option<usize>,
    pub link_up: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Broadcast,
    AwaitBroadcast,
    ReadState,
    AwaitState,
    Acknowledge,
    Configure,
    LatchDcTimes,
    Scanning,
    WriteDelay,
    AwaitDelay,
}

/// A serviced external request with its own in-flight datagram.
struct RequestExec {
    slave: usize,
    handle: RequestHandle,
    dg: FsmDatagram,
    kind: ExecKind,
}

enum ExecKind {
    Coe {
        fsm: Box<CoeFsm>,
        upload: bool,
    },
    Reg {
        address: u16,
        write_data: Option<Vec<u8>>,
        size: usize,
        sent: bool,
        retries: u8,
    },
}

/// See module docs.
pub(crate) struct MasterFsm {
    state: State,
    dg: FsmDatagram,
    resp_buf: Vec<u8>,

    scan: Box<SlaveScanFsm>,
    config: Box<SlaveConfigFsm>,
    change: ChangeFsm,

    /// Slaves responding to the last broadcast, per the working counter.
    slaves_responding: u16,
    /// Union of AL states seen by the last broadcast.
    al_states: u8,
    rescan_required: bool,

    /// Cursor for state reads, scanning and delay writes.
    slave_cursor: usize,
    /// Slaves queued for (re)configuration this pass.
    config_queue: VecDeque<usize>,

    requests: Vec<RequestExec>,

    retries: u8,
}

impl MasterFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Broadcast,
            dg: FsmDatagram::default(),
            resp_buf: Vec::with_capacity(64),
            scan: Box::new(SlaveScanFsm::new()),
            config: Box::new(SlaveConfigFsm::new()),
            change: ChangeFsm::new(),
            slaves_responding: 0,
            al_states: 0,
            rescan_required: false,
            slave_cursor: 0,
            config_queue: VecDeque::new(),
            requests: Vec::new(),
            retries: FSM_RETRIES,
        }
    }

    /// Whether a bus scan is in progress.
    pub(crate) fn scanning(&self) -> bool {
        matches!(self.state, State::Scanning | State::LatchDcTimes)
    }

    /// Force a rescan on the next broadcast evaluation.
    pub(crate) fn request_rescan(&mut self) {
        self.rescan_required = true;
    }

    /// Number of slaves responding to the last broadcast.
    pub(crate) fn slaves_responding(&self) -> u16 {
        self.slaves_responding
    }

    /// Union of AL states from the last broadcast.
    pub(crate) fn al_states(&self) -> u8 {
        self.al_states
    }

    /// Run one cycle: service external requests, then step the main machine.
    pub(crate) fn cycle(&mut self, ctx: &mut FsmContext<'_>, ring: &ExtRing, now: Instant) {
        self.service_requests(ctx, ring, now);
        self.drive_main(ctx, ring, now);
    }

    // Main machine driving

    fn drive_main(&mut self, ctx: &mut FsmContext<'_>, ring: &ExtRing, now: Instant) {
        // Resolve the previous round trip
        let resp_state = match self.dg.slot {
            Some(slot) => {
                let state = ring.state(slot);

                if !state.is_terminal() {
                    // Still in flight; wait for the next cycle
                    return;
                }

                let mut wkc = 0;

                let buf = &mut self.resp_buf;

                buf.clear();

                ring.with_response(slot, |dg| {
                    wkc = dg.working_counter();
                    buf.extend_from_slice(dg.data());
                });

                self.dg.clear();

                Some((state, wkc))
            }
            None => None,
        };

        let buf = core::mem::take(&mut self.resp_buf);

        let resp = match resp_state {
            Some((state, working_counter)) => Response {
                state,
                working_counter,
                data: &buf,
            },
            None => Response::NONE,
        };

        if let Some(mut slot) = ring.claim() {
            let step = self.step_main(ctx, resp, slot.datagram(), now);

            if step == Step::Queued {
                self.dg.slot = Some(slot.commit(0, now));
            }
        }

        self.resp_buf = buf;
    }

    fn step_main(
        &mut self,
        ctx: &mut FsmContext<'_>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        match self.state {
            State::Broadcast => {
                if !ctx.link_up {
                    return Step::Idle;
                }

                dg.brd(RegisterAddress::AlStatus.into(), 2);
                self.state = State::AwaitBroadcast;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::AwaitBroadcast => self.step_broadcast(ctx, resp, dg, now),
            State::ReadState => {
                if self.slave_cursor >= ctx.slaves.len() {
                    return self.enter_configure(ctx, dg, now);
                }

                let slave = &ctx.slaves[self.slave_cursor];

                dg.fprd(
                    slave.station_address(),
                    RegisterAddress::AlStatus.into(),
                    2,
                );
                self.state = State::AwaitState;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::AwaitState => self.step_await_state(ctx, resp, dg, now),
            State::Acknowledge => {
                let slave = &mut ctx.slaves[self.slave_cursor];

                match self.change.step(slave, resp, dg, now) {
                    Step::Queued => Step::Queued,
                    Step::Idle => Step::Idle,
                    Step::Done => {
                        self.slave_cursor += 1;
                        self.state = State::ReadState;

                        self.step_main(ctx, Response::NONE, dg, now)
                    }
                }
            }
            State::Configure => self.step_configure(ctx, resp, dg, now),
            State::LatchDcTimes => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    dg.bwr(RegisterAddress::DcTimePort0.into(), 4);

                    return Step::Queued;
                }

                // Slaves without DC do not answer; any working counter is
                // acceptable here
                self.state = State::Scanning;
                self.scan.start();

                self.step_scanning(ctx, Response::NONE, dg, now)
            }
            State::Scanning => self.step_scanning(ctx, resp, dg, now),
            State::WriteDelay => {
                // Find the next DC slave that needs its transmission delay
                while self.slave_cursor < ctx.slaves.len() {
                    let slave = &ctx.slaves[self.slave_cursor];

                    if slave.dc_capable() {
                        dg.fpwr(
                            slave.station_address(),
                            RegisterAddress::DcTransmissionDelay.into(),
                            4,
                        );
                        dg.data_mut()
                            .copy_from_slice(&slave.transmission_delay.to_le_bytes());
                        self.state = State::AwaitDelay;
                        self.retries = FSM_RETRIES;

                        return Step::Queued;
                    }

                    self.slave_cursor += 1;
                }

                self.state = State::Broadcast;

                self.step_main(ctx, Response::NONE, dg, now)
            }
            State::AwaitDelay => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;

                    let slave = &ctx.slaves[self.slave_cursor];

                    dg.fpwr(
                        slave.station_address(),
                        RegisterAddress::DcTransmissionDelay.into(),
                        4,
                    );
                    dg.data_mut()
                        .copy_from_slice(&slave.transmission_delay.to_le_bytes());

                    return Step::Queued;
                }

                if !resp.is_received() || resp.working_counter != 1 {
                    fmt::warn!(
                        "Failed to write transmission delay of slave {:#06x}",
                        ctx.slaves[self.slave_cursor].station_address()
                    );
                }

                self.slave_cursor += 1;
                self.state = State::WriteDelay;

                self.step_main(ctx, Response::NONE, dg, now)
            }
        }
    }

    fn step_broadcast(
        &mut self,
        ctx: &mut FsmContext<'_>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            dg.brd(RegisterAddress::AlStatus.into(), 2);

            return Step::Queued;
        }

        if !resp.is_received() {
            // Link trouble; start over next cycle
            self.state = State::Broadcast;

            return Step::Idle;
        }

        let responding = resp.working_counter;
        let states = if responding > 0 { resp.data[0] } else { 0 };

        if responding != self.slaves_responding {
            fmt::info!("{} slave(s) responding on the main device", responding);

            self.slaves_responding = responding;
            self.rescan_required = true;
        }

        self.al_states = states;

        // A WC of zero with no slaves configured is a valid, empty bus; no
        // state entries are created for it.
        if self.rescan_required && ctx.allow_scan {
            self.rescan_required = false;

            return self.start_scan(ctx, dg, now);
        }

        self.slave_cursor = 0;
        self.state = State::ReadState;

        self.step_main(ctx, Response::NONE, dg, now)
    }

    fn step_await_state(
        &mut self,
        ctx: &mut FsmContext<'_>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;

            let slave = &ctx.slaves[self.slave_cursor];

            dg.fprd(
                slave.station_address(),
                RegisterAddress::AlStatus.into(),
                2,
            );

            return Step::Queued;
        }

        if resp.is_received() && resp.working_counter == 1 {
            let slave = &mut ctx.slaves[self.slave_cursor];

            let (state, error_bit) = AlState::split_register(resp.data[0]);

            if state != slave.current_state {
                fmt::debug!(
                    "Slave {:#06x} changed state to {}",
                    slave.station_address(),
                    state
                );
            }

            slave.current_state = state;

            if error_bit && !slave.error_flag {
                // Resolve the error indicator before anything else
                self.change.start_ack(slave);
                self.state = State::Acknowledge;

                return self.change.step(slave, Response::NONE, dg, now);
            }
        }

        self.slave_cursor += 1;
        self.state = State::ReadState;

        self.step_main(ctx, Response::NONE, dg, now)
    }

    fn enter_configure(
        &mut self,
        ctx: &mut FsmContext<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        // Collect slaves that are below their requested state
        self.config_queue.clear();

        for (index, slave) in ctx.slaves.iter_mut().enumerate() {
            let target = self.target_for(ctx.operation, slave);

            slave.requested_state = target;

            if slave.current_state != target && !slave.error_flag {
                self.config_queue.push_back(index);
            }
        }

        self.step_configure(ctx, Response::NONE, dg, now)
    }

    fn target_for(&self, operation: bool, slave: &Slave) -> AlState {
        if operation && slave.config_index.is_some() {
            AlState::Op
        } else {
            AlState::PreOp
        }
    }

    fn step_configure(
        &mut self,
        ctx: &mut FsmContext<'_>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if self.config.running() {
            let slave_index = self.config_queue[0];

            let config_ctx = ConfigCtx {
                app_time: ctx.app_time,
                dc_ref_time: ctx.dc_ref_time,
            };

            // Split so the config borrow does not alias the slave borrow
            let config = ctx.slaves[slave_index]
                .config_index
                .and_then(|ci| ctx.configs.get_mut(ci));

            let slave = &mut ctx.slaves[slave_index];

            match self.config.step(slave, config, resp, dg, now, config_ctx) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    self.config_queue.pop_front();
                }
            }
        }

        // Start configuration of the next queued slave
        while let Some(&slave_index) = self.config_queue.front() {
            let Some(slave) = ctx.slaves.get(slave_index) else {
                self.config_queue.pop_front();
                continue;
            };

            let target = slave.requested_state;

            self.state = State::Configure;
            self.config.start(slave.config_index.is_some(), target);

            return self.step_configure(ctx, Response::NONE, dg, now);
        }

        // Pass complete, poll the bus again next cycle
        self.state = State::Broadcast;

        Step::Idle
    }

    fn start_scan(&mut self, ctx: &mut FsmContext<'_>, dg: &mut Datagram, now: Instant) -> Step {
        fmt::info!("Scanning bus, {} slave(s)", self.slaves_responding);

        for config in ctx.configs.iter_mut() {
            config.detach();
        }

        ctx.slaves.clear();

        for position in 0..self.slaves_responding {
            ctx.slaves.push(Slave::new(position));
        }

        *ctx.dc_reference = None;
        self.slave_cursor = 0;

        if ctx.slaves.is_empty() {
            self.state = State::Scanning;

            return self.finish_scan(ctx, dg, now);
        }

        // Latch the DC receive times on every port of every slave at the
        // same instant; the per-slave scans read them back afterwards
        dg.bwr(RegisterAddress::DcTimePort0.into(), 4);
        self.state = State::LatchDcTimes;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn step_scanning(
        &mut self,
        ctx: &mut FsmContext<'_>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        let slave = &mut ctx.slaves[self.slave_cursor];

        match self.scan.step(slave, resp, dg, now) {
            Step::Queued => Step::Queued,
            Step::Idle => Step::Idle,
            Step::Done => {
                if !self.scan.success() {
                    fmt::warn!(
                        "Scan of slave {:#06x} failed",
                        slave.station_address()
                    );
                }

                self.slave_cursor += 1;

                if self.slave_cursor < ctx.slaves.len() {
                    self.scan.start();

                    return self.step_scanning(ctx, Response::NONE, dg, now);
                }

                self.finish_scan(ctx, dg, now)
            }
        }
    }

    fn finish_scan(&mut self, ctx: &mut FsmContext<'_>, dg: &mut Datagram, now: Instant) -> Step {
        self.attach_configs(ctx);

        *ctx.dc_reference = dc::select_reference(ctx.slaves, ctx.configs, ctx.dc_nominated);

        if let Some(reference) = *ctx.dc_reference {
            dc::calc_transmission_delays(ctx.slaves, reference);

            fmt::info!(
                "Using slave {:#06x} as the DC reference clock",
                ctx.slaves[reference].station_address()
            );

            self.slave_cursor = 0;
            self.state = State::WriteDelay;

            return self.step_main(ctx, Response::NONE, dg, now);
        }

        self.state = State::Broadcast;

        Step::Idle
    }

    /// Rebind configs to scanned slaves after a scan pass.
    fn attach_configs(&mut self, ctx: &mut FsmContext<'_>) {
        crate::config::attach_all(ctx.slaves, ctx.configs);
    }

    // External request servicing

    fn service_requests(&mut self, ctx: &mut FsmContext<'_>, ring: &ExtRing, now: Instant) {
        // Take new requests into service, at most one per slave at a time
        if self.requests.len() < MAX_CONCURRENT_REQUESTS {
            for (slave_index, slave) in ctx.slaves.iter_mut().enumerate() {
                if self.requests.len() >= MAX_CONCURRENT_REQUESTS {
                    break;
                }

                if self
                    .requests
                    .iter()
                    .any(|exec| exec.slave == slave_index)
                {
                    continue;
                }

                while let Some(handle) = slave.requests.pop_front() {
                    let Some(op) = handle.begin() else {
                        // Withdrawn while queued
                        continue;
                    };

                    let kind = match op {
                        RequestOp::SdoUpload {
                            index,
                            sub_index,
                            complete_access,
                        } => {
                            let mut fsm = Box::new(CoeFsm::new());

                            fsm.upload(index, sub_index, complete_access);

                            ExecKind::Coe { fsm, upload: true }
                        }
                        RequestOp::SdoDownload {
                            index,
                            sub_index,
                            complete_access,
                            data,
                        } => {
                            let mut fsm = Box::new(CoeFsm::new());

                            fsm.download(index, sub_index, complete_access, data);

                            ExecKind::Coe { fsm, upload: false }
                        }
                        RequestOp::Dictionary => {
                            let mut fsm = Box::new(CoeFsm::new());

                            fsm.read_dictionary();

                            ExecKind::Coe { fsm, upload: false }
                        }
                        RequestOp::RegRead { address, size } => ExecKind::Reg {
                            address,
                            write_data: None,
                            size,
                            sent: false,
                            retries: FSM_RETRIES,
                        },
                        RequestOp::RegWrite { address, data } => {
                            let size = data.len();

                            ExecKind::Reg {
                                address,
                                write_data: Some(data),
                                size,
                                sent: false,
                                retries: FSM_RETRIES,
                            }
                        }
                    };

                    self.requests.push(RequestExec {
                        slave: slave_index,
                        handle,
                        dg: FsmDatagram::default(),
                        kind,
                    });

                    break;
                }
            }
        }

        // Drive every exec one step
        let mut execs = core::mem::take(&mut self.requests);

        execs.retain_mut(|exec| !Self::drive_request(exec, ctx, ring, now));

        self.requests = execs;
    }

    /// Returns `true` when the request finished.
    fn drive_request(
        exec: &mut RequestExec,
        ctx: &mut FsmContext<'_>,
        ring: &ExtRing,
        now: Instant,
    ) -> bool {
        // Resolve the previous round trip into a local buffer
        let mut resp_data = Vec::new();
        let mut resp_state = None;

        if let Some(slot) = exec.dg.slot {
            let state = ring.state(slot);

            if !state.is_terminal() {
                return false;
            }

            let mut wkc = 0;

            ring.with_response(slot, |dg| {
                wkc = dg.working_counter();
                resp_data.extend_from_slice(dg.data());
            });

            exec.dg.clear();
            resp_state = Some((state, wkc));
        }

        let resp = match resp_state {
            Some((state, working_counter)) => Response {
                state,
                working_counter,
                data: &resp_data,
            },
            None => Response::NONE,
        };

        let Some(slave) = ctx.slaves.get_mut(exec.slave) else {
            exec.handle.complete(Err(Error::NotFound {
                item: Item::Slave,
                index: Some(exec.slave),
            }));

            return true;
        };

        let Some(mut slot) = ring.claim() else {
            return false;
        };

        match &mut exec.kind {
            ExecKind::Coe { fsm, upload } => {
                match fsm.step(slave, resp, slot.datagram(), now) {
                    Step::Queued => {
                        exec.dg.slot = Some(slot.commit(0, now));

                        false
                    }
                    Step::Idle => false,
                    Step::Done => {
                        // Emergencies go to the attached config's ring
                        if let Some(config) = slave
                            .config_index
                            .and_then(|ci| ctx.configs.get_mut(ci))
                        {
                            for emergency in fsm.emergencies.drain(..) {
                                config.push_emergency(emergency);
                            }
                        }

                        let result = if fsm.success() {
                            Ok(if *upload { fsm.take_data() } else { Vec::new() })
                        } else {
                            Err(fsm.error().unwrap_or(Error::Internal))
                        };

                        exec.handle.complete(result);

                        true
                    }
                }
            }
            ExecKind::Reg {
                address,
                write_data,
                size,
                sent,
                retries,
            } => {
                if *sent {
                    if resp.timed_out() && *retries > 0 {
                        *retries -= 1;
                        *sent = false;
                    } else if !resp.is_received() {
                        exec.handle.complete(Err(Error::Timeout));

                        return true;
                    } else if resp.working_counter != 1 {
                        exec.handle.complete(Err(Error::WorkingCounter {
                            expected: 1,
                            received: resp.working_counter,
                        }));

                        return true;
                    } else {
                        let result = if write_data.is_some() {
                            Vec::new()
                        } else {
                            resp_data.clone()
                        };

                        exec.handle.complete(Ok(result));

                        return true;
                    }
                }

                let dg = slot.datagram();

                match write_data {
                    Some(data) => {
                        dg.fpwr(slave.station_address(), *address, *size);
                        dg.data_mut().copy_from_slice(data);
                    }
                    None => {
                        dg.fprd(slave.station_address(), *address, *size);
                    }
                }

                *sent = true;
                exec.dg.slot = Some(slot.commit(0, now));

                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramState;
    use crate::ext_ring::ExtRing;

    fn empty_ctx<'a>(
        slaves: &'a mut Vec<Slave>,
        configs: &'a mut Vec<SlaveConfig>,
        dc_reference: &'a mut Option<usize>,
    ) -> FsmContext<'a> {
        FsmContext {
            slaves,
            configs,
            allow_scan: true,
            operation: false,
            app_time: 0,
            dc_ref_time: 0,
            dc_reference,
            dc_nominated: None,
            link_up: true,
        }
    }

    #[test]
    fn broadcast_poll_goes_out() {
        let mut slaves = Vec::new();
        let mut configs = Vec::new();
        let mut dc_reference = None;
        let ring = ExtRing::new();

        let mut fsm = MasterFsm::new();

        let mut ctx = empty_ctx(&mut slaves, &mut configs, &mut dc_reference);

        fsm.cycle(&mut ctx, &ring, Instant::now());

        let slot = fsm.dg.slot.expect("broadcast datagram committed");

        assert_eq!(ring.state(slot), DatagramState::Init);
    }

    #[test]
    fn empty_bus_creates_no_slaves() {
        let mut slaves = Vec::new();
        let mut configs = Vec::new();
        let mut dc_reference = None;
        let ring = ExtRing::new();

        let mut fsm = MasterFsm::new();
        let now = Instant::now();

        {
            let mut ctx = empty_ctx(&mut slaves, &mut configs, &mut dc_reference);

            fsm.cycle(&mut ctx, &ring, now);
        }

        // Feed a WC 0 response back into the committed slot
        let slot = fsm.dg.slot.unwrap();

        ring.with_slot(slot, &mut |dg| {
            dg.working_counter = 0;
            dg.state = DatagramState::Received;
        });

        {
            let mut ctx = empty_ctx(&mut slaves, &mut configs, &mut dc_reference);

            fsm.cycle(&mut ctx, &ring, now);
        }

        assert!(slaves.is_empty());
        assert_eq!(fsm.slaves_responding(), 0);
    }

    #[test]
    fn responding_count_change_triggers_scan() {
        let mut slaves = Vec::new();
        let mut configs = Vec::new();
        let mut dc_reference = None;
        let ring = ExtRing::new();

        let mut fsm = MasterFsm::new();
        let now = Instant::now();

        {
            let mut ctx = empty_ctx(&mut slaves, &mut configs, &mut dc_reference);

            fsm.cycle(&mut ctx, &ring, now);
        }

        let slot = fsm.dg.slot.unwrap();

        ring.with_slot(slot, &mut |dg| {
            dg.working_counter = 2;
            dg.data_mut()[0] = 0x01;
            dg.state = DatagramState::Received;
        });

        {
            let mut ctx = empty_ctx(&mut slaves, &mut configs, &mut dc_reference);

            fsm.cycle(&mut ctx, &ring, now);
        }

        // Two fresh slave entries exist and the scan has begun with the
        // station address write of slave 0
        assert_eq!(slaves.len(), 2);
        assert!(fsm.scanning());
        assert_eq!(slaves[0].station_address(), 0x1001);
        assert_eq!(slaves[1].station_address(), 0x1002);
    }
}
