//! An EtherCAT master with a cooperative state machine core.
//!
//! The master owns one or more Ethernet devices, cycles process data over
//! them with deterministic timing, walks every slave through the EtherCAT
//! application layer state machine (INIT → PREOP → SAFEOP → OP), configures
//! sync managers, FMMUs and mailboxes, services CoE SDO traffic and keeps
//! distributed clocks in phase across the bus.
//!
//! # Architecture
//!
//! All protocol logic lives in a tree of cooperative state machines, each a
//! struct with a single step function. Machines never block and never
//! allocate datagrams; they borrow pre-sized slots from a fixed external
//! datagram ring that decouples them from the cyclic send path.
//!
//! The runtime has two phases. In the idle phase the master thread drives
//! everything itself: receive, machine stepping, send, one millisecond at a
//! time, bringing every slave to PREOP. After [`Master::activate`] the
//! application's realtime loop owns send and receive through
//! [`Master::receive`], [`Master::domain_queue`] and [`Master::send`], while
//! the master thread keeps stepping the machines, reaching the bus only
//! through the ring.
//!
//! # Example
//!
//! ```no_run
//! use ferrocat::{Master, RawSocketLink};
//!
//! let master = Master::new(0);
//!
//! master.attach_device(Box::new(RawSocketLink::open("eth0")?))?;
//!
//! // Let the idle phase discover the bus, then configure and activate
//! let config = master.slave_config(0, 0, 0x0000_0002, 0x0444_3052)?;
//! let domain = master.create_domain()?;
//!
//! let (output_offset, _bit) = master.register_pdo_entry(config, domain, 0x7000, 1)?;
//!
//! master.activate()?;
//!
//! loop {
//!     master.receive();
//!     master.domain_process(domain)?;
//!
//!     master.with_domain(domain, |d| d.data_mut()[output_offset] ^= 1)?;
//!
//!     master.domain_queue(domain)?;
//!     master.send();
//!     # break;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This mod MUST go first so the others see its macros.
pub(crate) mod fmt;

mod al_status_code;
mod coe;
mod command;
mod config;
mod datagram;
mod dc;
mod device;
mod dl_status;
mod domain;
pub mod error;
mod ethernet;
mod ext_ring;
mod fmmu;
mod frame;
mod fsm;
mod mailbox;
mod master;
mod pdo;
mod register;
mod request;
mod sii;
mod slave;
mod slave_state;
mod sync_manager_channel;

pub use al_status_code::AlStatusCode;
pub use coe::{CoeAbortCode, EmergencyMessage};
pub use command::Command;
pub use config::{DcConfig, SlaveConfig, SyncSignal};
pub use datagram::{Datagram, DatagramState};
pub use device::{Device, DeviceStats, Link};
#[cfg(all(unix, target_os = "linux"))]
pub use device::RawSocketLink;
pub use domain::{Domain, DomainState};
pub use error::Error;
pub use ethernet::{EthernetAddress, ETHERCAT_ETHERTYPE};
pub use frame::EngineStats;
pub use master::{
    Callbacks, ConfigHandle, DomainHandle, Master, MasterPhase, MasterState,
};
pub use mailbox::{MailboxErrorCode, MailboxProtocols};
pub use pdo::{Pdo, PdoEntry, PdoList};
pub use register::RegisterAddress;
pub use request::RequestState;
pub use sii::{CategoryGeneral, CoeDetails, SiiCategories, SiiImage, SiiString, SiiSyncManager};
pub use slave::{SdoEntryAccess, SdoEntryInfo, SdoObject, Slave};
pub use slave_state::AlState;
pub use sync_manager_channel::Direction;

/// Station addresses assigned by the master start here; the address of a
/// slave is `BASE_SLAVE_ADDR + ring position`.
pub const BASE_SLAVE_ADDR: u16 = slave::BASE_STATION_ADDRESS;
