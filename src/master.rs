//! The master runtime: devices, domains, the two-phase thread, the external
//! datagram ring and the application-facing cyclic API.

use crate::config::{self, SlaveConfig};
use crate::datagram::Datagram;
use crate::device::{Device, DeviceStats, Link};
use crate::domain::{Domain, DomainState};
use crate::error::{Error, Item};
use crate::ext_ring::ExtRing;
use crate::fmt;
use crate::frame::{DatagramStore, DgToken, EngineStats, FrameEngine};
use crate::fsm::master::{FsmContext, MasterFsm};
use crate::pdo::PdoList;
use crate::register::RegisterAddress;
use crate::request::{Request, RequestHandle, RequestOp};
use crate::slave::{SdoObject, Slave};
use crate::slave_state::AlState;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Nominal cycle of the idle thread.
const IDLE_CYCLE: Duration = Duration::from_millis(1);

/// Wire time per byte at 100 Mbit/s, used for the injection byte budget.
const BYTE_TRANSMISSION_TIME_NS: u64 = 80;

/// Default timeout for blocking request helpers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle phase of a master.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MasterPhase {
    /// No Ethernet device attached yet.
    #[default]
    Orphaned = 0,
    /// Bus supervision runs and slaves are brought to PREOP; the idle thread
    /// drives all I/O itself.
    Idle = 1,
    /// The application's realtime loop drives send/receive; slaves with
    /// configs are driven to OP.
    Operation = 2,
}

impl MasterPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Idle,
            2 => Self::Operation,
            _ => Self::Orphaned,
        }
    }
}

/// Bus summary as seen by the cyclic broadcast poll.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MasterState {
    /// Slaves responding on the main device.
    pub slaves_responding: u16,
    /// Union of the AL states of all responding slaves.
    pub al_states: u8,
    /// Whether the main device link is up.
    pub link_up: bool,
}

/// Handle to a process data domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHandle(pub(crate) usize);

/// Handle to a slave configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigHandle(pub(crate) usize);

/// Application callbacks used by the state machine thread in the operation
/// phase to borrow the application's I/O context between cycles.
pub struct Callbacks {
    /// Must perform a `receive()` under the application's locking rules.
    pub receive: Box<dyn FnMut() + Send>,
    /// Must perform a `send()` under the application's locking rules.
    pub send: Box<dyn FnMut() + Send>,
}

/// The cyclic DC alignment datagrams.
struct DcCyclic {
    /// FPWR of the application time to the reference clock's system time
    /// register.
    reference: Datagram,
    /// FRMW distributing the reference clock's time to all other DC slaves.
    sync: Datagram,
    /// Station address of the reference clock, 0 when DC is unused.
    ref_station: u16,
}

impl DcCyclic {
    fn new() -> Self {
        Self {
            reference: Datagram::new(8),
            sync: Datagram::new(4),
            ref_station: 0,
        }
    }
}

/// Topology half, guarded by the master lock.
struct Topology {
    slaves: Vec<Slave>,
    configs: Vec<SlaveConfig>,
    fsm: MasterFsm,
    dc_reference: Option<usize>,
    dc_nominated: Option<usize>,
}

/// I/O half, guarded by the I/O lock.
struct Io {
    devices: Vec<Device>,
    engines: Vec<FrameEngine>,
    domains: Vec<Domain>,
    dc: DcCyclic,
    last_rate_update: Option<Instant>,
}

/// Resolves datagram tokens for the frame engines.
struct IoStore<'a> {
    ring: &'a ExtRing,
    domains: &'a mut Vec<Domain>,
    dc: &'a mut DcCyclic,
}

impl DatagramStore for IoStore<'_> {
    fn with_datagram(
        &mut self,
        token: DgToken,
        f: &mut dyn FnMut(&mut Datagram),
    ) -> Option<()> {
        match token {
            DgToken::Ring(index) => {
                self.ring.with_slot(index, f);

                Some(())
            }
            DgToken::Domain { domain, pair, slot } => {
                let dg = self.domains.get_mut(domain)?.datagram_mut(pair, slot)?;

                f(dg);

                Some(())
            }
            DgToken::DcRef => {
                f(&mut self.dc.reference);

                Some(())
            }
            DgToken::DcSync => {
                f(&mut self.dc.sync);

                Some(())
            }
        }
    }
}

impl Io {
    /// Drain received frames of every device into its frame engine.
    fn receive(&mut self, ring: &ExtRing, now: Instant) {
        let Self {
            devices,
            engines,
            domains,
            dc,
            ..
        } = self;

        let mut store = IoStore { ring, domains, dc };

        for (index, device) in devices.iter_mut().enumerate() {
            device.check_link();

            let engine = &mut engines[index];

            let _ = device.receive(|payload| {
                engine.receive_frame(payload, &mut store, now);
            });
        }
    }

    /// Inject ring datagrams within `budget` and transmit all queues.
    fn send(&mut self, ring: &ExtRing, budget: usize, now: Instant) {
        let Self {
            devices,
            engines,
            domains,
            dc,
            ..
        } = self;

        let mut store = IoStore { ring, domains, dc };

        ring.inject(engines, &mut store, budget, now);

        for (index, engine) in engines.iter_mut().enumerate() {
            let _ = engine.send(&mut store, &mut devices[index], now);
        }
    }

    /// Once per second: feed the device statistics rate filters.
    fn update_rates(&mut self, now: Instant) {
        let due = self
            .last_rate_update
            .map_or(true, |at| now.duration_since(at) >= Duration::from_secs(1));

        if due {
            for device in &mut self.devices {
                device.stats.update_rates();
            }

            self.last_rate_update = Some(now);
        }
    }
}

struct Inner {
    index: usize,
    topology: Mutex<Topology>,
    io: Mutex<Io>,
    ring: ExtRing,
    phase: AtomicU8,
    stop: AtomicBool,
    /// Sampled from the main device's carrier by the I/O paths.
    link_up: AtomicBool,
    /// Set on a link-up transition; makes the next FSM cycle rescan.
    rescan_pending: AtomicBool,
    app_time: AtomicU64,
    dc_ref_time: AtomicU64,
    /// Cycle send interval in ns; bounds the injection byte budget.
    send_interval_ns: AtomicU64,
    /// Last broadcast results, mirrored for the lock free state query.
    slaves_responding: AtomicUsize,
    al_states: AtomicU8,
    callbacks: Mutex<Option<Callbacks>>,
    /// Signals phase changes to the thread.
    wakeup: Condvar,
    wakeup_guard: Mutex<()>,
}

impl Inner {
    fn phase(&self) -> MasterPhase {
        MasterPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn injection_budget(&self) -> usize {
        let interval = self.send_interval_ns.load(Ordering::Relaxed);

        (interval / BYTE_TRANSMISSION_TIME_NS) as usize
    }
}

/// An EtherCAT master.
///
/// Create one, attach an Ethernet [`Link`], let the idle phase bring the bus
/// to PREOP, then configure slaves and domains and call [`Master::activate`]
/// to enter cyclic operation.
pub struct Master {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Master {
    /// Create master `index`, with its state machine thread parked until a
    /// device is attached.
    pub fn new(index: usize) -> Self {
        let inner = Arc::new(Inner {
            index,
            topology: Mutex::new(Topology {
                slaves: Vec::new(),
                configs: Vec::new(),
                fsm: MasterFsm::new(),
                dc_reference: None,
                dc_nominated: None,
            }),
            io: Mutex::new(Io {
                devices: Vec::new(),
                engines: Vec::new(),
                domains: Vec::new(),
                dc: DcCyclic::new(),
                last_rate_update: None,
            }),
            ring: ExtRing::new(),
            phase: AtomicU8::new(MasterPhase::Orphaned as u8),
            stop: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            rescan_pending: AtomicBool::new(false),
            app_time: AtomicU64::new(0),
            dc_ref_time: AtomicU64::new(0),
            send_interval_ns: AtomicU64::new(IDLE_CYCLE.as_nanos() as u64),
            slaves_responding: AtomicUsize::new(0),
            al_states: AtomicU8::new(0),
            callbacks: Mutex::new(None),
            wakeup: Condvar::new(),
            wakeup_guard: Mutex::new(()),
        });

        let thread_inner = Arc::clone(&inner);

        let thread = std::thread::Builder::new()
            .name(format!("ecm{}", index))
            .spawn(move || thread_main(thread_inner))
            .expect("failed to spawn master thread");

        fmt::info!("Master {} ready", index);

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Master index.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Current phase.
    pub fn phase(&self) -> MasterPhase {
        self.inner.phase()
    }

    /// Attach an Ethernet link. The first device moves the master from
    /// ORPHANED to IDLE and starts bus supervision.
    ///
    /// Additional devices act as redundant backup links for process data.
    pub fn attach_device(&self, link: Box<dyn Link>) -> Result<usize, Error> {
        if self.inner.phase() == MasterPhase::Operation {
            return Err(Error::Phase);
        }

        let mut io = self.inner.io.lock().unwrap();

        let index = io.devices.len();
        let device = Device::new(link, index);

        if index == 0 {
            self.inner
                .link_up
                .store(device.link_up(), Ordering::Relaxed);
        }

        io.devices.push(device);
        io.engines.push(FrameEngine::new());

        drop(io);

        if index == 0 {
            self.inner
                .phase
                .store(MasterPhase::Idle as u8, Ordering::Release);
            self.inner.wakeup.notify_all();

            fmt::info!("Master {}: entering idle phase", self.inner.index);
        }

        Ok(index)
    }

    /// Bus summary from the last broadcast cycle.
    pub fn state(&self) -> MasterState {
        MasterState {
            slaves_responding: self.inner.slaves_responding.load(Ordering::Relaxed) as u16,
            al_states: self.inner.al_states.load(Ordering::Relaxed),
            link_up: self.inner.link_up.load(Ordering::Relaxed),
        }
    }

    /// Number of scanned slaves.
    pub fn slave_count(&self) -> usize {
        self.inner.topology.lock().unwrap().slaves.len()
    }

    /// Whether a bus scan is currently in progress.
    pub fn scan_busy(&self) -> bool {
        self.inner.topology.lock().unwrap().fsm.scanning()
    }

    /// Run `f` on the scanned slave at `position`.
    pub fn with_slave<R>(
        &self,
        position: u16,
        f: impl FnOnce(&Slave) -> R,
    ) -> Result<R, Error> {
        let topology = self.inner.topology.lock().unwrap();

        topology
            .slaves
            .get(usize::from(position))
            .map(f)
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(usize::from(position)),
            })
    }

    /// Statistics of device `index`.
    pub fn device_stats(&self, index: usize) -> Result<DeviceStats, Error> {
        let io = self.inner.io.lock().unwrap();

        io.devices
            .get(index)
            .map(|device| device.stats)
            .ok_or(Error::NotFound {
                item: Item::Device,
                index: Some(index),
            })
    }

    /// Frame engine statistics of device `index`.
    pub fn engine_stats(&self, index: usize) -> Result<EngineStats, Error> {
        let io = self.inner.io.lock().unwrap();

        io.engines
            .get(index)
            .map(|engine| engine.stats)
            .ok_or(Error::NotFound {
                item: Item::Device,
                index: Some(index),
            })
    }

    // Configuration API (IDLE phase)

    /// Obtain a slave configuration for the slave expected at
    /// `(alias, position)` with the given identity.
    pub fn slave_config(
        &self,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> Result<ConfigHandle, Error> {
        if self.inner.phase() == MasterPhase::Operation {
            return Err(Error::Phase);
        }

        let mut topology = self.inner.topology.lock().unwrap();

        // Reuse an existing config with the same key
        if let Some(existing) = topology.configs.iter().position(|config| {
            config.address() == (alias, position)
                && config.vendor_id() == vendor_id
                && config.product_code() == product_code
        }) {
            return Ok(ConfigHandle(existing));
        }

        let handle = ConfigHandle(topology.configs.len());

        topology
            .configs
            .push(SlaveConfig::new(alias, position, vendor_id, product_code));

        let Topology {
            slaves, configs, ..
        } = &mut *topology;

        config::attach_all(slaves, configs);

        Ok(handle)
    }

    /// Run `f` on a slave configuration, e.g. to add SDO configs or DC
    /// settings.
    pub fn configure<R>(
        &self,
        handle: ConfigHandle,
        f: impl FnOnce(&mut SlaveConfig) -> R,
    ) -> Result<R, Error> {
        let mut topology = self.inner.topology.lock().unwrap();

        topology
            .configs
            .get_mut(handle.0)
            .map(f)
            .ok_or(Error::NotFound {
                item: Item::SlaveConfig,
                index: Some(handle.0),
            })
    }

    /// Nominate `handle`'s slave as the DC reference clock.
    pub fn select_reference_clock(&self, handle: ConfigHandle) -> Result<(), Error> {
        let mut topology = self.inner.topology.lock().unwrap();

        if handle.0 >= topology.configs.len() {
            return Err(Error::NotFound {
                item: Item::SlaveConfig,
                index: Some(handle.0),
            });
        }

        topology.dc_nominated = Some(handle.0);

        Ok(())
    }

    /// Create a process data domain.
    pub fn create_domain(&self) -> Result<DomainHandle, Error> {
        if self.inner.phase() == MasterPhase::Operation {
            return Err(Error::Phase);
        }

        let mut io = self.inner.io.lock().unwrap();

        let handle = DomainHandle(io.domains.len());

        io.domains.push(Domain::new(handle.0));

        Ok(handle)
    }

    /// Register a PDO entry of `config`'s slave for exchange in `domain`.
    ///
    /// Returns the byte offset of the entry within the domain's data image
    /// and its bit position within that byte.
    pub fn register_pdo_entry(
        &self,
        config: ConfigHandle,
        domain: DomainHandle,
        index: u16,
        sub_index: u8,
    ) -> Result<(usize, u8), Error> {
        if self.inner.phase() == MasterPhase::Operation {
            return Err(Error::Phase);
        }

        let topology = self.inner.topology.lock().unwrap();

        let config_ref = topology.configs.get(config.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(config.0),
        })?;

        // Search the configured assignments first, then what the scan found
        // on the attached slave
        let mut located = None;

        for (sync_index, list) in config_ref.sm_pdos.iter().enumerate() {
            if let Some(list) = list {
                if let Some((bit_offset, bit_length)) = list.entry_position(index, sub_index) {
                    located = Some((sync_index as u8, list.clone(), bit_offset, bit_length));
                    break;
                }
            }
        }

        if located.is_none() {
            if let Some(slave) = config_ref
                .slave_index
                .and_then(|si| topology.slaves.get(si))
            {
                for (sync_index, list) in slave.sync_pdos.iter().enumerate() {
                    if let Some((bit_offset, bit_length)) =
                        list.entry_position(index, sub_index)
                    {
                        located = Some((sync_index as u8, list.clone(), bit_offset, bit_length));
                        break;
                    }
                }
            }
        }

        let Some((sync_index, list, bit_offset, _bit_length)) = located else {
            return Err(Error::NotFound {
                item: Item::PdoEntry,
                index: None,
            });
        };

        let direction = list
            .pdos()
            .first()
            .map(|pdo| pdo.direction())
            .unwrap_or(crate::sync_manager_channel::Direction::MasterRead);

        drop(topology);

        let mut io = self.inner.io.lock().unwrap();

        let domain_ref = io.domains.get_mut(domain.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(domain.0),
        })?;

        let fmmu_offset = match domain_ref.find_fmmu(config.0, sync_index) {
            Some(fmmu) => fmmu.domain_offset,
            None => domain_ref.add_fmmu(config.0, sync_index, direction, list.byte_length()),
        };

        let byte = fmmu_offset + (bit_offset / 8) as usize;
        let bit = (bit_offset % 8) as u8;

        Ok((byte, bit))
    }

    // Phase transitions

    /// Finish the configuration and enter the operation phase: lay out all
    /// domains, resolve FMMU mappings and hand cyclic I/O to the
    /// application.
    ///
    /// Re-activating after [`Master::deactivate`] with the same
    /// configuration reproduces the same logical offsets.
    pub fn activate(&self) -> Result<(), Error> {
        match self.inner.phase() {
            MasterPhase::Idle => {}
            _ => return Err(Error::Phase),
        }

        // Lock order: topology, then I/O
        let mut topology = self.inner.topology.lock().unwrap();
        let mut io = self.inner.io.lock().unwrap();

        let backup_devices = io.devices.len().saturating_sub(1);

        // Deterministic logical layout in domain order
        let mut logical_base = 0u32;

        for config in &mut topology.configs {
            config.fmmu_mappings.clear();
        }

        for domain in &mut io.domains {
            logical_base = domain.finish(logical_base, backup_devices);

            for fmmu in domain.fmmus() {
                if let Some(config) = topology.configs.get_mut(fmmu.config_index) {
                    config.fmmu_mappings.push(config::FmmuMapping {
                        sync_index: fmmu.sync_index,
                        direction: fmmu.direction,
                        domain: domain.index(),
                        logical_start: fmmu.logical_start,
                        data_size: fmmu.data_size,
                    });
                }
            }
        }

        // Arm the cyclic DC datagrams
        if let Some(reference) = topology.dc_reference {
            let station = topology.slaves[reference].station_address();

            io.dc.ref_station = station;
            io.dc
                .reference
                .fpwr(station, RegisterAddress::DcSystemTime.into(), 8);
            io.dc
                .sync
                .frmw(station, RegisterAddress::DcSystemTime.into(), 4);
        } else {
            io.dc.ref_station = 0;
        }

        drop(io);
        drop(topology);

        self.inner
            .phase
            .store(MasterPhase::Operation as u8, Ordering::Release);
        self.inner.wakeup.notify_all();

        fmt::info!("Master {}: activated", self.inner.index);

        Ok(())
    }

    /// Leave the operation phase: slaves fall back to PREOP and the idle
    /// thread takes over I/O again. The configuration is kept, so a
    /// following [`Master::activate`] restores the same layout.
    pub fn deactivate(&self) -> Result<(), Error> {
        match self.inner.phase() {
            MasterPhase::Operation => {}
            _ => return Err(Error::Phase),
        }

        self.inner
            .phase
            .store(MasterPhase::Idle as u8, Ordering::Release);

        let mut topology = self.inner.topology.lock().unwrap();

        for slave in &mut topology.slaves {
            slave.requested_state = AlState::PreOp;
            slave.reset_error();
        }

        drop(topology);

        fmt::info!("Master {}: deactivated", self.inner.index);

        Ok(())
    }

    /// Register callbacks that allow the state machine thread to drive I/O
    /// through the application's context in the operation phase.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.inner.callbacks.lock().unwrap() = Some(callbacks);
    }

    // Cyclic API (OPERATION phase, called from the application's realtime
    // loop)

    /// Supply the application's monotonic time in ns, used for DC alignment.
    ///
    /// The first supplied time becomes the DC reference epoch.
    pub fn set_application_time(&self, time: u64) {
        self.inner.app_time.store(time, Ordering::Relaxed);

        // First call pins the epoch the sync0 phase correction is based on
        let _ = self.inner.dc_ref_time.compare_exchange(
            0,
            time,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Queue the DC reference clock sync datagram carrying the application
    /// time.
    pub fn sync_reference_clock(&self) {
        let mut io = self.inner.io.lock().unwrap();

        if io.dc.ref_station == 0 {
            return;
        }

        let app_time = self.inner.app_time.load(Ordering::Relaxed);
        let station = io.dc.ref_station;

        io.dc
            .reference
            .fpwr(station, RegisterAddress::DcSystemTime.into(), 8);
        io.dc
            .reference
            .data_mut()
            .copy_from_slice(&app_time.to_le_bytes());

        let Io { engines, domains, dc, .. } = &mut *io;

        let mut store = IoStore {
            ring: &self.inner.ring,
            domains,
            dc,
        };

        engines[0].queue(DgToken::DcRef, &mut store);
    }

    /// Queue the DC drift compensation datagram.
    pub fn sync_slave_clocks(&self) {
        let mut io = self.inner.io.lock().unwrap();

        if io.dc.ref_station == 0 {
            return;
        }

        let station = io.dc.ref_station;

        io.dc
            .sync
            .frmw(station, RegisterAddress::DcSystemTime.into(), 4);

        let Io { engines, domains, dc, .. } = &mut *io;

        let mut store = IoStore {
            ring: &self.inner.ring,
            domains,
            dc,
        };

        engines[0].queue(DgToken::DcSync, &mut store);
    }

    /// Drain received frames into the outstanding datagrams.
    pub fn receive(&self) {
        let now = Instant::now();
        let mut io = self.inner.io.lock().unwrap();

        io.receive(&self.inner.ring, now);

        self.sample_link(&io);
    }

    /// Evaluate a domain's received cycle.
    pub fn domain_process(&self, handle: DomainHandle) -> Result<(), Error> {
        let mut io = self.inner.io.lock().unwrap();

        io.domains
            .get_mut(handle.0)
            .map(|domain| domain.process(Instant::now()))
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(handle.0),
            })
    }

    /// Queue a domain's process data datagrams for the next `send()`.
    pub fn domain_queue(&self, handle: DomainHandle) -> Result<(), Error> {
        let mut io = self.inner.io.lock().unwrap();

        let Io {
            engines,
            domains,
            dc,
            ..
        } = &mut *io;

        let domain = domains.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })?;

        domain.queue();

        let tokens: Vec<(usize, DgToken)> = domain.tokens().collect();

        let mut store = IoStore {
            ring: &self.inner.ring,
            domains,
            dc,
        };

        for (device, token) in tokens {
            if let Some(engine) = engines.get_mut(device) {
                engine.queue(token, &mut store);
            }
        }

        Ok(())
    }

    /// Run `f` on a domain, e.g. to access its process data image.
    pub fn with_domain<R>(
        &self,
        handle: DomainHandle,
        f: impl FnOnce(&mut Domain) -> R,
    ) -> Result<R, Error> {
        let mut io = self.inner.io.lock().unwrap();

        io.domains.get_mut(handle.0).map(f).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(handle.0),
        })
    }

    /// State of a domain's last cycle.
    pub fn domain_state(&self, handle: DomainHandle) -> Result<DomainState, Error> {
        self.with_domain(handle, |domain| domain.state())
    }

    /// Inject pending external datagrams and transmit all queued traffic.
    pub fn send(&self) {
        let now = Instant::now();
        let budget = self.inner.injection_budget();
        let mut io = self.inner.io.lock().unwrap();

        io.send(&self.inner.ring, budget, now);
        io.update_rates(now);

        self.sample_link(&io);
    }

    /// Set the application's cyclic send interval, which bounds how many
    /// external datagram bytes are injected per cycle.
    pub fn set_send_interval(&self, interval: Duration) {
        self.inner
            .send_interval_ns
            .store(interval.as_nanos() as u64, Ordering::Relaxed);
    }

    fn sample_link(&self, io: &Io) {
        let up = io.devices.first().map(Device::link_up).unwrap_or(false);

        let was = self.inner.link_up.swap(up, Ordering::Relaxed);

        if up && !was {
            // Link returned; the next idle cycle scans anew
            self.inner.rescan_pending.store(true, Ordering::Relaxed);
        }
    }

    // Blocking request helpers

    fn submit(&self, position: u16, op: RequestOp) -> Result<RequestHandle, Error> {
        let mut topology = self.inner.topology.lock().unwrap();

        let slave = topology
            .slaves
            .get_mut(usize::from(position))
            .ok_or(Error::NotFound {
                item: Item::Slave,
                index: Some(usize::from(position)),
            })?;

        let handle = Request::new(op);

        slave.requests.push_back(Arc::clone(&handle));

        Ok(handle)
    }

    /// Download an SDO value to a slave, blocking until completion.
    pub fn sdo_download(
        &self,
        position: u16,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.submit(
            position,
            RequestOp::SdoDownload {
                index,
                sub_index,
                complete_access: false,
                data: data.to_vec(),
            },
        )?
        .wait(Some(REQUEST_TIMEOUT))
        .map(|_| ())
    }

    /// Upload an SDO value from a slave, blocking until completion.
    pub fn sdo_upload(
        &self,
        position: u16,
        index: u16,
        sub_index: u8,
    ) -> Result<Vec<u8>, Error> {
        self.submit(
            position,
            RequestOp::SdoUpload {
                index,
                sub_index,
                complete_access: false,
            },
        )?
        .wait(Some(REQUEST_TIMEOUT))
    }

    /// Fetch a slave's object dictionary via the SDO information services,
    /// blocking until the scan finished.
    pub fn fetch_dictionary(&self, position: u16) -> Result<Vec<SdoObject>, Error> {
        self.submit(position, RequestOp::Dictionary)?
            .wait(Some(REQUEST_TIMEOUT))?;

        self.with_slave(position, |slave| slave.dictionary().to_vec())
    }

    /// Read a slave register, blocking until completion.
    pub fn register_read(
        &self,
        position: u16,
        address: u16,
        size: usize,
    ) -> Result<Vec<u8>, Error> {
        self.submit(position, RequestOp::RegRead { address, size })?
            .wait(Some(REQUEST_TIMEOUT))
    }

    /// Write a slave register, blocking until completion.
    pub fn register_write(
        &self,
        position: u16,
        address: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.submit(
            position,
            RequestOp::RegWrite {
                address,
                data: data.to_vec(),
            },
        )?
        .wait(Some(REQUEST_TIMEOUT))
        .map(|_| ())
    }

    /// Access the PDO assignment discovered on (or configured for) a slave.
    pub fn slave_sync_pdos(&self, position: u16, sync_index: u8) -> Result<PdoList, Error> {
        self.with_slave(position, |slave| {
            slave
                .sync_pdos
                .get(usize::from(sync_index))
                .cloned()
                .unwrap_or_default()
        })
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.wakeup.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The master thread: cooperative in IDLE (sleeps one cycle between
/// send/receive), FSM-only in OPERATION where the application drives I/O.
fn thread_main(inner: Arc<Inner>) {
    fmt::debug!("Master {} thread running", inner.index);

    while !inner.stop.load(Ordering::Acquire) {
        match inner.phase() {
            MasterPhase::Orphaned => {
                // Nothing to do until a device arrives
                let guard = inner.wakeup_guard.lock().unwrap();
                let _ = inner
                    .wakeup
                    .wait_timeout(guard, Duration::from_millis(100))
                    .unwrap();
            }
            MasterPhase::Idle => {
                let now = Instant::now();

                {
                    let mut io = inner.io.lock().unwrap();

                    io.receive(&inner.ring, now);

                    let up = io.devices.first().map(Device::link_up).unwrap_or(false);
                    let was = inner.link_up.swap(up, Ordering::Relaxed);

                    if up && !was {
                        // Link returned; scan the bus anew
                        inner.rescan_pending.store(true, Ordering::Relaxed);
                    }
                }

                run_fsm_cycle(&inner, now);

                {
                    let mut io = inner.io.lock().unwrap();

                    io.send(&inner.ring, inner.injection_budget(), now);
                    io.update_rates(now);
                }

                std::thread::sleep(IDLE_CYCLE);
            }
            MasterPhase::Operation => {
                let now = Instant::now();

                // The application drives receive/send; callbacks let the
                // state machines piggyback on its cycle for mailbox traffic.
                {
                    let mut callbacks = inner.callbacks.lock().unwrap();

                    if let Some(callbacks) = callbacks.as_mut() {
                        (callbacks.receive)();
                    }
                }

                run_fsm_cycle(&inner, now);

                {
                    let mut callbacks = inner.callbacks.lock().unwrap();

                    if let Some(callbacks) = callbacks.as_mut() {
                        (callbacks.send)();
                    }
                }

                std::thread::sleep(IDLE_CYCLE);
            }
        }
    }

    fmt::debug!("Master {} thread stopping", inner.index);
}

fn run_fsm_cycle(inner: &Arc<Inner>, now: Instant) {
    let mut topology = inner.topology.lock().unwrap();

    let Topology {
        slaves,
        configs,
        fsm,
        dc_reference,
        dc_nominated,
    } = &mut *topology;

    if inner.rescan_pending.swap(false, Ordering::Relaxed) {
        fsm.request_rescan();
    }

    let operation = inner.phase() == MasterPhase::Operation;

    let mut ctx = FsmContext {
        slaves,
        configs,
        // The realtime phase must not re-scan while the application cycles
        allow_scan: !operation,
        operation,
        app_time: inner.app_time.load(Ordering::Relaxed),
        dc_ref_time: inner.dc_ref_time.load(Ordering::Relaxed),
        dc_reference,
        dc_nominated: *dc_nominated,
        link_up: inner.link_up.load(Ordering::Relaxed),
    };

    fsm.cycle(&mut ctx, &inner.ring, now);

    inner
        .slaves_responding
        .store(usize::from(fsm.slaves_responding()), Ordering::Relaxed);
    inner.al_states.store(fsm.al_states(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::LoopbackLink;
    use std::sync::atomic::Ordering;

    #[test]
    fn phases_follow_device_attach() {
        let master = Master::new(0);

        assert_eq!(master.phase(), MasterPhase::Orphaned);

        let (link, _handle) = LoopbackLink::with_handle();

        master.attach_device(Box::new(link)).unwrap();

        assert_eq!(master.phase(), MasterPhase::Idle);

        // No domains, no configs: activation is trivial but allowed
        master.activate().unwrap();
        assert_eq!(master.phase(), MasterPhase::Operation);

        // No scanning in the realtime phase
        assert!(master.attach_device(Box::new(LoopbackLink::default())).is_err());

        master.deactivate().unwrap();
        assert_eq!(master.phase(), MasterPhase::Idle);
    }

    #[test]
    fn activation_layout_is_idempotent() {
        let master = Master::new(1);

        let (link, _handle) = LoopbackLink::with_handle();

        master.attach_device(Box::new(link)).unwrap();

        let config = master.slave_config(0, 0, 2, 0x0c1e).unwrap();
        let domain = master.create_domain().unwrap();

        // Configure an output mapping by hand so registration works without
        // a scanned bus
        master
            .configure(config, |config| {
                let mut list = PdoList::new();
                let mut pdo = crate::pdo::Pdo::new(0x1600);

                pdo.entries.push(crate::pdo::PdoEntry {
                    index: 0x7000,
                    sub_index: 1,
                    bit_length: 16,
                });
                list.push(pdo);

                config.config_sm_pdos(2, list);
            })
            .unwrap();

        let (offset, bit) = master
            .register_pdo_entry(config, domain, 0x7000, 1)
            .unwrap();

        assert_eq!((offset, bit), (0, 0));

        master.activate().unwrap();

        let first = master
            .configure(config, |config| config.fmmu_mappings.clone())
            .unwrap();

        master.deactivate().unwrap();
        master.activate().unwrap();

        let second = master
            .configure(config, |config| config.fmmu_mappings.clone())
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].logical_start, 0);
        assert_eq!(first[0].data_size, 2);

        drop(master);
    }

    #[test]
    fn state_query_defaults() {
        let master = Master::new(2);

        let state = master.state();

        assert_eq!(state.slaves_responding, 0);
        assert!(!state.link_up);

        let _ = master.inner.link_up.load(Ordering::Relaxed);
    }
}
