//! Per-slave configuration machine: drives one slave from INIT through sync
//! manager, mailbox, SDO, PDO, watchdog, FMMU and DC configuration up to its
//! requested state.

use super::change::ChangeFsm;
use super::coe::CoeFsm;
use super::pdo::PdoFsm;
use super::{Response, Step, FSM_RETRIES};
use crate::config::SlaveConfig;
use crate::datagram::Datagram;
use crate::error::Error;
use crate::fmmu::Fmmu;
use crate::fmt;
use crate::register::RegisterAddress;
use crate::slave::{ConfiguredMailbox, Slave};
use crate::slave_state::AlState;
use crate::sync_manager_channel::{Direction, SyncManagerChannel};
use ethercrab_wire::EtherCrabWireWrite;
use std::time::{Duration, Instant};

/// Some slaves need a moment after INIT before they accept their first
/// mailbox sync manager write; keep resending on WC 0 for this long.
const MBOX_SYNC_RETRY_BUDGET: Duration = Duration::from_secs(1);

/// A DC slave must report its sync difference below
/// [`DC_MAX_SYNC_DIFF_NS`] within this budget.
const DC_SYNC_WAIT: Duration = Duration::from_secs(5);

/// Accepted DC system time difference, ns.
const DC_MAX_SYNC_DIFF_NS: u32 = 10_000;

/// Cyclic operation starts this far in the future, before phase correction.
const DC_START_OFFSET_NS: u64 = 100_000_000;

/// Standard mailbox layout for slaves whose SII declares none.
const DEFAULT_MAILBOX: (u16, u16, u16, u16) = (0x1000, 0x0080, 0x1080, 0x0080);

/// Compute the DC cyclic start time: now plus a safety margin, aligned to the
/// sync0/sync1 cycle phase of the reference clock.
pub(crate) fn dc_start_time(
    app_time: u64,
    dc_ref_time: u64,
    cycle0: u32,
    cycle1: u32,
    shift0: i32,
) -> u64 {
    let start = app_time + DC_START_OFFSET_NS;

    if cycle0 == 0 || dc_ref_time == 0 {
        return start;
    }

    let cycle = u64::from(cycle0) + u64::from(cycle1);
    let remainder = (start - dc_ref_time) % cycle;

    (start + cycle - remainder).wrapping_add_signed(i64::from(shift0))
}

/// Timing context handed in by the master each step.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ConfigCtx {
    /// Application time in ns.
    pub app_time: u64,
    /// Application time captured when the DC reference clock was started.
    pub dc_ref_time: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Start,
    ClearFmmus,
    ClearSyncs,
    ClearDc,
    MboxSync,
    AssignPdi,
    PreopChange,
    AssignEcat,
    SdoConf,
    PdoConf,
    WatchdogDivider,
    WatchdogIntervals,
    PdoSyncs,
    Fmmus,
    DcCycle,
    DcSyncCheck,
    DcStart,
    DcAssign,
    SafeopChange,
    OpChange,
    End,
    Error,
}

/// See module docs.
#[derive(Debug)]
pub(crate) struct SlaveConfigFsm {
    state: State,
    change: ChangeFsm,
    coe: CoeFsm,
    pdo: PdoFsm,

    /// The end state the pipeline drives the slave to.
    target: AlState,

    retries: u8,
    /// SDO config cursor.
    sdo_cursor: usize,
    /// Start of the mailbox sync resend window / DC sync check window.
    window_start: Option<Instant>,
    /// Whether this run had an attached config when it started; losing it
    /// mid-sequence restarts the pipeline.
    had_config: bool,

    error: Option<Error>,
}

impl SlaveConfigFsm {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Idle,
            change: ChangeFsm::new(),
            coe: CoeFsm::new(),
            pdo: PdoFsm::new(),
            target: AlState::PreOp,
            retries: 0,
            sdo_cursor: 0,
            window_start: None,
            had_config: false,
            error: None,
        }
    }

    /// Arm the pipeline for one slave, driving it to `target`.
    pub(crate) fn start(&mut self, config_attached: bool, target: AlState) {
        self.state = State::Start;
        self.target = target;
        self.retries = FSM_RETRIES;
        self.sdo_cursor = 0;
        self.window_start = None;
        self.had_config = config_attached;
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
        mut config: Option<&mut SlaveConfig>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        if matches!(self.state, State::Idle | State::End | State::Error) {
            return Step::Done;
        }

        // A config that disappeared mid-sequence invalidates everything done
        // so far; start over from INIT.
        if self.had_config && config.is_none() && self.state != State::Start {
            fmt::debug!(
                "Slave {:#06x}: config detached, restarting configuration",
                slave.station_address
            );

            self.start(false, AlState::PreOp);
        }

        // Route responses into whichever nested machine runs.
        if self.change.running() {
            match self.change.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => return self.after_change(slave, config, dg, now, ctx),
            }
        }

        if self.coe.running() {
            match self.coe.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    if let Some(config) = config.as_deref_mut() {
                        for emergency in self.coe.emergencies.drain(..) {
                            config.push_emergency(emergency);
                        }
                    }

                    return self.after_coe(slave, config, dg, now, ctx);
                }
            }
        }

        if self.pdo.running() {
            match self.pdo.step(slave, resp, dg, now) {
                Step::Queued => return Step::Queued,
                Step::Idle => return Step::Idle,
                Step::Done => {
                    if let Some(config) = config.as_deref_mut() {
                        for emergency in self.pdo.emergencies.drain(..) {
                            config.push_emergency(emergency);
                        }
                    }

                    return self.after_pdo(slave, config, dg, now, ctx);
                }
            }
        }

        match self.state {
            State::Start => {
                fmt::debug!("Configuring slave {:#06x}", slave.station_address);

                self.change.start(slave, AlState::Init);

                // The INIT transition is only the pipeline's first step;
                // keep the overall goal on the slave.
                slave.requested_state = self.target;

                self.change.step(slave, Response::NONE, dg, now)
            }
            State::ClearFmmus => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::ClearSyncs => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::ClearDc => {
                // WC 1 is not required here; slaves without DC simply do not
                // answer this register.
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.prepare_clear_dc(slave, dg);

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout);
                }

                if resp.working_counter != 1 {
                    fmt::debug!(
                        "Slave {:#06x}: no DC activation register",
                        slave.station_address
                    );
                }

                self.enter_mbox_sync(slave, config.as_deref(), dg, now)
            }
            State::MboxSync => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.prepare_mbox_sync(slave, dg);

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout);
                }

                if resp.working_counter == 0 {
                    // The slave has not booted far enough to answer; keep
                    // trying within the budget.
                    let waited = self
                        .window_start
                        .map_or(Duration::ZERO, |at| now.duration_since(at));

                    if waited < MBOX_SYNC_RETRY_BUDGET {
                        self.prepare_mbox_sync(slave, dg);
                        self.retries = FSM_RETRIES;

                        return Step::Queued;
                    }

                    return self.fail(
                        slave,
                        Error::WorkingCounter {
                            expected: 1,
                            received: 0,
                        },
                    );
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

                self.enter_assign_pdi(slave, dg)
            }
            State::AssignPdi => {
                // Tolerated like the DC clear; old ESCs have no assign
                // register
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.prepare_sii_assign(slave, dg, 0x01);

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout);
                }

                let next = if self.target == AlState::Boot {
                    AlState::Boot
                } else {
                    AlState::PreOp
                };

                self.change.start(slave, next);
                slave.requested_state = self.target;
                self.state = State::PreopChange;

                self.change.step(slave, Response::NONE, dg, now)
            }
            State::AssignEcat => {
                if resp.timed_out() && self.retries > 0 {
                    self.retries -= 1;
                    self.prepare_sii_assign(slave, dg, 0x00);

                    return Step::Queued;
                }

                if !resp.is_received() {
                    return self.fail(slave, Error::Timeout);
                }

                self.enter_sdo_conf(slave, config, dg, now, ctx)
            }
            State::WatchdogDivider => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::WatchdogIntervals => {
                self.write_confirmed(slave, resp, dg, now, ctx, config)
            }
            State::PdoSyncs => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::Fmmus => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::DcCycle => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::DcSyncCheck => self.step_dc_sync_check(slave, config, resp, dg, now, ctx),
            State::DcStart => self.write_confirmed(slave, resp, dg, now, ctx, config),
            State::DcAssign => self.write_confirmed(slave, resp, dg, now, ctx, config),
            _ => Step::Idle,
        }
    }

    /// Generic handler for plain register writes: validate WC 1, then enter
    /// the next pipeline stage.
    fn write_confirmed(
        &mut self,
        slave: &mut Slave,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
        config: Option<&mut SlaveConfig>,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            self.reissue(slave, config.as_deref(), dg, ctx);

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

        match self.state {
            State::ClearFmmus => self.enter_clear_syncs(slave, config.as_deref(), dg, now),
            State::ClearSyncs => self.enter_clear_dc(slave, dg),
            State::WatchdogDivider => {
                self.enter_watchdog_intervals(slave, config.as_deref(), dg, now, ctx)
            }
            State::WatchdogIntervals => {
                self.enter_pdo_syncs(slave, config.as_deref(), dg, now, ctx)
            }
            State::PdoSyncs => self.enter_fmmus(slave, config.as_deref(), dg, now, ctx),
            State::Fmmus => self.enter_dc_cycle(slave, config.as_deref(), dg, now, ctx),
            State::DcCycle => {
                fmt::debug!(
                    "Slave {:#06x}: checking for DC synchrony",
                    slave.station_address
                );

                self.window_start = Some(now);
                self.prepare_sync_diff_read(slave, dg);
                self.state = State::DcSyncCheck;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DcStart => {
                let assign_activate = config
                    .as_deref()
                    .and_then(|config| config.dc.as_ref())
                    .map_or(0, |dc| dc.assign_activate);

                dg.fpwr(
                    slave.station_address,
                    RegisterAddress::DcActivation.into(),
                    2,
                );
                dg.data_mut()[0..2].copy_from_slice(&assign_activate.to_le_bytes());
                self.state = State::DcAssign;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::DcAssign => self.enter_safeop(slave, dg, now),
            _ => Step::Idle,
        }
    }

    /// Rebuild the datagram of the current plain-write state for a retry.
    fn reissue(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        ctx: ConfigCtx,
    ) {
        match self.state {
            State::ClearFmmus => self.prepare_clear_fmmus(slave, dg),
            State::ClearSyncs => self.prepare_clear_syncs(slave, dg),
            State::WatchdogDivider => {
                let divider = config
                    .and_then(|config| config.watchdog_divider)
                    .unwrap_or_default();

                Self::prepare_u16_write(
                    slave,
                    dg,
                    RegisterAddress::WatchdogDivider.into(),
                    divider,
                );
            }
            State::WatchdogIntervals => {
                let intervals = config
                    .and_then(|config| config.watchdog_intervals)
                    .unwrap_or_default();

                Self::prepare_u16_write(
                    slave,
                    dg,
                    RegisterAddress::SyncManagerWatchdog.into(),
                    intervals,
                );
            }
            State::PdoSyncs => self.prepare_pdo_syncs(slave, dg),
            State::Fmmus => {
                if let Some(config) = config {
                    self.prepare_fmmus(slave, config, dg);
                }
            }
            State::DcCycle => {
                if let Some(dc) = config.and_then(|config| config.dc.as_ref()) {
                    Self::prepare_dc_cycle(slave, dg, dc.sync0.cycle_time, dc.sync1.cycle_time);
                }
            }
            State::DcStart => {
                // Recomputing the start time on retry keeps it in the future
                if let Some(dc) = config.and_then(|config| config.dc.as_ref()) {
                    let start = dc_start_time(
                        ctx.app_time,
                        ctx.dc_ref_time,
                        dc.sync0.cycle_time,
                        dc.sync1.cycle_time,
                        dc.sync0.shift_time,
                    );

                    dg.fpwr(
                        slave.station_address,
                        RegisterAddress::DcSyncStartTime.into(),
                        8,
                    );
                    dg.data_mut().copy_from_slice(&start.to_le_bytes());
                }
            }
            State::DcAssign => {
                let assign_activate = config
                    .and_then(|config| config.dc.as_ref())
                    .map_or(0, |dc| dc.assign_activate);

                Self::prepare_u16_write(
                    slave,
                    dg,
                    RegisterAddress::DcActivation.into(),
                    assign_activate,
                );
            }
            _ => {}
        }
    }

    // Nested machine completions

    fn after_change(
        &mut self,
        slave: &mut Slave,
        config: Option<&mut SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        _ctx: ConfigCtx,
    ) -> Step {
        if !self.change.success() {
            self.error = self.change.error();
            slave.error_flag = true;
            self.state = State::Error;

            return Step::Done;
        }

        match self.state {
            State::Start => self.enter_clear_fmmus(slave, config.as_deref(), dg, now),
            State::PreopChange => {
                // Hand the SII back to the EtherCAT side
                self.prepare_sii_assign(slave, dg, 0x00);
                self.state = State::AssignEcat;
                self.retries = FSM_RETRIES;

                Step::Queued
            }
            State::SafeopChange => {
                // SoE SAFEOP-scope configuration would run here; no SoE
                // engine is attached, so the list is always empty.
                if self.target == AlState::Op {
                    self.change.start(slave, AlState::Op);
                    self.state = State::OpChange;

                    return self.change.step(slave, Response::NONE, dg, now);
                }

                self.finish(slave)
            }
            State::OpChange => self.finish(slave),
            _ => Step::Idle,
        }
    }

    fn after_coe(
        &mut self,
        slave: &mut Slave,
        config: Option<&mut SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        debug_assert!(self.state == State::SdoConf);

        if !self.coe.success() {
            fmt::error!(
                "Slave {:#06x}: SDO configuration failed: {:?}",
                slave.station_address,
                self.coe.error()
            );

            self.error = self.coe.error();
            slave.error_flag = true;
            self.state = State::Error;

            return Step::Done;
        }

        self.sdo_cursor += 1;

        self.enter_sdo_conf(slave, config, dg, now, ctx)
    }

    fn after_pdo(
        &mut self,
        slave: &mut Slave,
        config: Option<&mut SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        if !self.pdo.success() {
            self.error = self.pdo.error();
            slave.error_flag = true;
            self.state = State::Error;

            return Step::Done;
        }

        self.enter_watchdog_divider(slave, config.as_deref(), dg, now, ctx)
    }

    // Pipeline stage entries. Each either queues a datagram for its stage or
    // skips ahead when the stage does not apply.

    fn enter_clear_fmmus(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if slave.base_fmmu_count == 0 {
            return self.enter_clear_syncs(slave, config, dg, now);
        }

        self.prepare_clear_fmmus(slave, dg);
        self.state = State::ClearFmmus;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_clear_fmmus(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fpwr(
            slave.station_address,
            RegisterAddress::Fmmu0.into(),
            usize::from(slave.base_fmmu_count) * 16,
        );
    }

    fn enter_clear_syncs(
        &mut self,
        slave: &mut Slave,
        _config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        _now: Instant,
    ) -> Step {
        if slave.base_sync_count == 0 {
            return self.enter_clear_dc(slave, dg);
        }

        self.prepare_clear_syncs(slave, dg);
        self.state = State::ClearSyncs;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_clear_syncs(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fpwr(
            slave.station_address,
            RegisterAddress::Sm0.into(),
            usize::from(slave.base_sync_count) * 8,
        );
    }

    fn enter_clear_dc(&mut self, slave: &mut Slave, dg: &mut Datagram) -> Step {
        self.prepare_clear_dc(slave, dg);
        self.state = State::ClearDc;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_clear_dc(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fpwr(
            slave.station_address,
            RegisterAddress::DcActivation.into(),
            2,
        );
    }

    fn enter_mbox_sync(
        &mut self,
        slave: &mut Slave,
        _config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
    ) -> Step {
        if !slave.has_mailbox() {
            // No mailbox protocols at all: skip straight to the PDI
            // handover; there is nothing to configure on SM0/SM1.
            return self.enter_assign_pdi(slave, dg);
        }

        self.window_start = Some(now);
        self.prepare_mbox_sync(slave, dg);
        self.state = State::MboxSync;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_mbox_sync(&self, slave: &mut Slave, dg: &mut Datagram) {
        let std = slave.sii_image.std_mailbox();
        let boot = slave.sii_image.boot_mailbox();

        let (rx_offset, rx_size, tx_offset, tx_size) =
            if self.target == AlState::Boot && boot.1 > 0 && boot.3 > 0 {
                boot
            } else if std.1 > 0 && std.3 > 0 {
                std
            } else {
                DEFAULT_MAILBOX
            };

        slave.configured_mailbox = ConfiguredMailbox {
            rx_offset,
            rx_size,
            tx_offset,
            tx_size,
        };

        dg.fpwr(slave.station_address, RegisterAddress::Sm0.into(), 16);

        let data = dg.data_mut();

        SyncManagerChannel::mailbox_write(rx_offset, rx_size)
            .pack_to_slice_unchecked(&mut data[0..8]);
        SyncManagerChannel::mailbox_read(tx_offset, tx_size)
            .pack_to_slice_unchecked(&mut data[8..16]);
    }

    fn enter_assign_pdi(&mut self, slave: &mut Slave, dg: &mut Datagram) -> Step {
        self.prepare_sii_assign(slave, dg, 0x01);
        self.state = State::AssignPdi;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_sii_assign(&self, slave: &Slave, dg: &mut Datagram, owner: u8) {
        dg.fpwr(slave.station_address, RegisterAddress::SiiAccess.into(), 2);
        dg.data_mut()[0] = owner;
    }

    fn enter_sdo_conf(
        &mut self,
        slave: &mut Slave,
        mut config: Option<&mut SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        // BOOT and PREOP end the pipeline after the mailbox configuration
        if matches!(self.target, AlState::Boot | AlState::PreOp) {
            return self.finish(slave);
        }

        let next_sdo = config.as_deref().and_then(|config| {
            config
                .sdo_configs
                .get(self.sdo_cursor)
                .cloned()
                .filter(|_| slave.has_coe())
        });

        if let Some(sdo) = next_sdo {
            self.state = State::SdoConf;
            self.coe
                .download(sdo.index, sdo.sub_index, sdo.complete_access, sdo.data);

            return self.coe.step(slave, Response::NONE, dg, now);
        }

        // SoE PREOP-scope configuration would be applied here (by IDN); no
        // SoE engine is attached, so there is never anything to do.

        self.enter_pdo_conf(slave, config.take(), dg, now, ctx)
    }

    fn enter_pdo_conf(
        &mut self,
        slave: &mut Slave,
        config: Option<&mut SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        let configured = config
            .as_deref()
            .is_some_and(|config| config.sm_pdos.iter().any(Option::is_some));

        if !configured || !slave.has_coe() {
            return self.enter_watchdog_divider(slave, config.as_deref(), dg, now, ctx);
        }

        self.state = State::PdoConf;
        self.pdo.write(slave, fmt::unwrap_opt!(config.as_deref()));

        self.pdo.step(slave, Response::NONE, dg, now)
    }

    fn enter_watchdog_divider(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        let Some(divider) = config.and_then(|config| config.watchdog_divider) else {
            return self.enter_pdo_syncs(slave, config, dg, now, ctx);
        };

        Self::prepare_u16_write(slave, dg, RegisterAddress::WatchdogDivider.into(), divider);
        self.state = State::WatchdogDivider;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn enter_watchdog_intervals(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        let Some(intervals) = config.and_then(|config| config.watchdog_intervals) else {
            return self.enter_pdo_syncs(slave, config, dg, now, ctx);
        };

        Self::prepare_u16_write(
            slave,
            dg,
            RegisterAddress::SyncManagerWatchdog.into(),
            intervals,
        );
        self.state = State::WatchdogIntervals;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_u16_write(slave: &Slave, dg: &mut Datagram, register: u16, value: u16) {
        dg.fpwr(slave.station_address, register, 2);
        dg.data_mut().copy_from_slice(&value.to_le_bytes());
    }

    fn enter_pdo_syncs(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        let has_pd_syncs = slave.sii.sync_managers.len() > 2;

        if !has_pd_syncs {
            return self.enter_fmmus(slave, config, dg, now, ctx);
        }

        self.prepare_pdo_syncs(slave, dg);
        self.state = State::PdoSyncs;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    /// Write the process data sync manager pages, sized from the mapped PDO
    /// lengths.
    fn prepare_pdo_syncs(&self, slave: &Slave, dg: &mut Datagram) {
        let first = 2usize;
        let count = slave.sii.sync_managers.len() - first;

        dg.fpwr(
            slave.station_address,
            RegisterAddress::sync_manager(first as u8),
            count * 8,
        );

        let data = dg.data_mut();

        for (slot, (sync_index, sii_sync)) in slave
            .sii
            .sync_managers
            .iter()
            .enumerate()
            .skip(first)
            .enumerate()
        {
            let mapped_len = slave
                .sync_pdos
                .get(sync_index)
                .map(|pdos| pdos.byte_length())
                .unwrap_or(0);

            let length = if mapped_len > 0 {
                mapped_len
            } else {
                sii_sync.default_length
            };

            let page = &mut data[slot * 8..slot * 8 + 8];

            page[0..2].copy_from_slice(&sii_sync.physical_start_address.to_le_bytes());
            page[2..4].copy_from_slice(&length.to_le_bytes());
            page[4] = sii_sync.control;
            page[5] = 0x00;
            // A zero length sync manager must stay disabled
            page[6] = if length > 0 { sii_sync.enable } else { 0x00 };
            page[7] = 0x00;
        }
    }

    fn enter_fmmus(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        let Some(config) = config.filter(|config| !config.fmmu_mappings.is_empty()) else {
            return self.enter_dc_cycle(slave, config, dg, now, ctx);
        };

        self.prepare_fmmus(slave, config, dg);
        self.state = State::Fmmus;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_fmmus(&self, slave: &Slave, config: &SlaveConfig, dg: &mut Datagram) {
        let count = config.fmmu_mappings.len();

        dg.fpwr(
            slave.station_address,
            RegisterAddress::Fmmu0.into(),
            count * 16,
        );

        let data = dg.data_mut();

        for (i, mapping) in config.fmmu_mappings.iter().enumerate() {
            let physical_start = slave
                .sii
                .sync_managers
                .get(usize::from(mapping.sync_index))
                .map(|sync| sync.physical_start_address)
                .unwrap_or(0);

            let fmmu = Fmmu {
                logical_start_address: mapping.logical_start,
                length_bytes: mapping.data_size,
                logical_start_bit: 0,
                logical_end_bit: 7,
                physical_start_address: physical_start,
                physical_start_bit: 0,
                read_enable: mapping.direction == Direction::MasterRead,
                write_enable: mapping.direction == Direction::MasterWrite,
                enable: true,
            };

            fmmu.pack_to_slice_unchecked(&mut data[i * 16..i * 16 + 16]);
        }
    }

    fn enter_dc_cycle(
        &mut self,
        slave: &mut Slave,
        config: Option<&SlaveConfig>,
        dg: &mut Datagram,
        now: Instant,
        _ctx: ConfigCtx,
    ) -> Step {
        let Some(dc) = config.and_then(|config| config.dc.as_ref()) else {
            return self.enter_safeop(slave, dg, now);
        };

        if !slave.dc_capable() || !slave.has_dc_system_time {
            fmt::warn!(
                "Slave {:#06x} seems not to support distributed clocks",
                slave.station_address
            );
        }

        fmt::debug!(
            "Slave {:#06x}: setting DC cycle times to {} / {}",
            slave.station_address,
            dc.sync0.cycle_time,
            dc.sync1.cycle_time
        );

        Self::prepare_dc_cycle(slave, dg, dc.sync0.cycle_time, dc.sync1.cycle_time);
        self.state = State::DcCycle;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn prepare_dc_cycle(slave: &Slave, dg: &mut Datagram, cycle0: u32, cycle1: u32) {
        dg.fpwr(
            slave.station_address,
            RegisterAddress::DcSync0CycleTime.into(),
            8,
        );

        let data = dg.data_mut();

        data[0..4].copy_from_slice(&cycle0.to_le_bytes());
        data[4..8].copy_from_slice(&cycle1.to_le_bytes());
    }

    fn prepare_sync_diff_read(&self, slave: &Slave, dg: &mut Datagram) {
        dg.fprd(
            slave.station_address,
            RegisterAddress::DcSystemTimeDifference.into(),
            4,
        );
    }

    fn step_dc_sync_check(
        &mut self,
        slave: &mut Slave,
        config: Option<&mut SlaveConfig>,
        resp: Response<'_>,
        dg: &mut Datagram,
        now: Instant,
        ctx: ConfigCtx,
    ) -> Step {
        if resp.timed_out() && self.retries > 0 {
            self.retries -= 1;
            self.prepare_sync_diff_read(slave, dg);

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

        let raw = u32::from_le_bytes([resp.data[0], resp.data[1], resp.data[2], resp.data[3]]);
        let abs_diff = raw & 0x7fff_ffff;

        let waited = self
            .window_start
            .map_or(Duration::ZERO, |at| now.duration_since(at));

        if abs_diff > DC_MAX_SYNC_DIFF_NS {
            if waited < DC_SYNC_WAIT {
                self.prepare_sync_diff_read(slave, dg);
                self.retries = FSM_RETRIES;

                return Step::Queued;
            }

            fmt::warn!(
                "Slave {:#06x} did not sync after {} ms ({} ns difference)",
                slave.station_address,
                waited.as_millis() as u32,
                abs_diff
            );
        } else {
            fmt::debug!(
                "Slave {:#06x}: {} ns difference after {} ms",
                slave.station_address,
                abs_diff,
                waited.as_millis() as u32
            );
        }

        let Some(dc) = config.as_deref().and_then(|config| config.dc.as_ref()) else {
            return self.enter_safeop(slave, dg, now);
        };

        if ctx.dc_ref_time == 0 && dc.sync0.cycle_time != 0 {
            fmt::warn!(
                "Slave {:#06x}: no application time supplied, cyclic start \
                 time will not be in phase",
                slave.station_address
            );
        }

        let start = dc_start_time(
            ctx.app_time,
            ctx.dc_ref_time,
            dc.sync0.cycle_time,
            dc.sync1.cycle_time,
            dc.sync0.shift_time,
        );

        fmt::debug!(
            "Slave {:#06x}: setting DC cyclic start time to {}",
            slave.station_address,
            start
        );

        dg.fpwr(
            slave.station_address,
            RegisterAddress::DcSyncStartTime.into(),
            8,
        );
        dg.data_mut().copy_from_slice(&start.to_le_bytes());
        self.state = State::DcStart;
        self.retries = FSM_RETRIES;

        Step::Queued
    }

    fn enter_safeop(&mut self, slave: &mut Slave, dg: &mut Datagram, now: Instant) -> Step {
        if matches!(self.target, AlState::SafeOp | AlState::Op) {
            self.change.start(slave, AlState::SafeOp);
            slave.requested_state = self.target;
            self.state = State::SafeopChange;

            return self.change.step(slave, Response::NONE, dg, now);
        }

        self.finish(slave)
    }

    fn finish(&mut self, slave: &mut Slave) -> Step {
        fmt::info!(
            "Slave {:#06x} configured, state {}",
            slave.station_address,
            slave.current_state
        );

        self.state = State::End;

        Step::Done
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> Step {
        fmt::error!(
            "Slave {:#06x}: configuration failed: {}",
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

    fn ctx() -> ConfigCtx {
        ConfigCtx {
            app_time: 0,
            dc_ref_time: 0,
        }
    }

    /// Spec scenario: a mailbox-less slave is configured through the
    /// register stages only, never touching SM0/SM1 or CoE.
    #[test]
    fn mailboxless_slave_to_preop() {
        let mut slave = Slave::new(1);

        slave.base_fmmu_count = 2;
        slave.base_sync_count = 2;
        slave.current_state = AlState::Init;
        slave.requested_state = AlState::PreOp;

        let mut fsm = SlaveConfigFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.start(false, AlState::PreOp);

        // INIT request goes out through the change machine
        assert_eq!(
            fsm.step(&mut slave, None, Response::NONE, &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data()[0], 0x01);

        // Control write confirmed; status poll
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );

        // Slave reports INIT; FMMU clear goes out
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[0x01, 0x00]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data_size(), 32);

        // FMMUs cleared; sync manager clear
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data_size(), 16);

        // Syncs cleared; DC activation clear
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );

        // DC clear tolerated with WC 0; no mailbox, so the machine skips
        // straight to the PDI handover
        assert_eq!(
            fsm.step(&mut slave, None, received(0, &[]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data()[0], 0x01);
        assert_eq!(slave.configured_mailbox.rx_size, 0);

        // PDI assign confirmed; PREOP request
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data()[0], 0x02);

        // Control confirmed; status poll; slave reaches PREOP
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[0x02, 0x00]), &mut dg, now, ctx()),
            Step::Queued
        );

        // SII back to EtherCAT; then, with PREOP as the goal, we are done
        assert_eq!(dg.data()[0], 0x00);
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Done
        );

        assert!(fsm.success());
        assert_eq!(slave.current_state, AlState::PreOp);
        assert!(!slave.error_flag);
    }

    #[test]
    fn dc_start_time_phase_correction() {
        // Reference started at 1000 ns, 1 ms cycle; the start time must land
        // on a cycle boundary plus shift
        let start = dc_start_time(2_000_000_000, 1000, 1_000_000, 0, 0);

        assert_eq!((start - 1000) % 1_000_000, 0);
        assert!(start > 2_000_000_000 + DC_START_OFFSET_NS);

        let shifted = dc_start_time(2_000_000_000, 1000, 1_000_000, 0, 250_000);

        assert_eq!(shifted, start + 250_000);
    }

    #[test]
    fn dc_start_time_without_reference() {
        // No phase correction possible without a reference time
        assert_eq!(
            dc_start_time(5_000_000_000, 0, 1_000_000, 0, 0),
            5_000_000_000 + DC_START_OFFSET_NS
        );
    }

    #[test]
    fn mbox_sync_resends_on_wc_zero() {
        let mut slave = Slave::new(1);

        slave.base_fmmu_count = 0;
        slave.base_sync_count = 2;
        slave.current_state = AlState::Init;

        // Declare a CoE mailbox in the SII image
        let mut words = vec![0u16; 0x40];
        words[0x18] = 0x1000;
        words[0x19] = 0x0080;
        words[0x1a] = 0x1080;
        words[0x1b] = 0x0080;
        words[0x1c] = 0x0004;
        slave.sii_image = crate::sii::SiiImage::new(words);

        let mut fsm = SlaveConfigFsm::new();
        let mut dg = Datagram::new(256);
        let now = Instant::now();

        fsm.start(false, AlState::PreOp);

        // INIT transition
        fsm.step(&mut slave, None, Response::NONE, &mut dg, now, ctx());
        fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx());
        fsm.step(&mut slave, None, received(1, &[0x01, 0x00]), &mut dg, now, ctx());

        // Sync clear confirmed; DC clear; mailbox sync write goes out
        fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx());
        assert_eq!(
            fsm.step(&mut slave, None, received(1, &[]), &mut dg, now, ctx()),
            Step::Queued
        );

        assert_eq!(dg.data_size(), 16);
        assert_eq!(slave.configured_mailbox.rx_offset, 0x1000);
        assert_eq!(slave.configured_mailbox.rx_size, 0x0080);

        // WC 0 within the budget: the write is repeated
        assert_eq!(
            fsm.step(&mut slave, None, received(0, &[]), &mut dg, now, ctx()),
            Step::Queued
        );
        assert_eq!(dg.data_size(), 16);

        // WC 0 after the budget: hard failure
        let late = now + Duration::from_secs(2);

        assert_eq!(
            fsm.step(&mut slave, None, received(0, &[]), &mut dg, late, ctx()),
            Step::Done
        );
        assert!(!fsm.success());
        assert!(slave.error_flag);
    }
}
