//! Process data domains: FMMU configurations packed into logical address
//! datagram pairs, with redundant-link reconciliation.

use crate::datagram::{Datagram, DatagramState};
use crate::fmt;
use crate::frame::{DgToken, MAX_FRAME_DATA};
use crate::sync_manager_channel::Direction;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Aggregate working counter verdict of one domain cycle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DomainState {
    /// No slave processed any datagram of the domain.
    #[default]
    Zero,
    /// Some but not all expected exchanges happened.
    Incomplete,
    /// Every datagram was processed by every addressed slave.
    Complete,
}

/// One FMMU configuration inside a domain, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DomainFmmu {
    /// The slave config this mapping belongs to.
    pub config_index: usize,
    pub sync_index: u8,
    pub direction: Direction,
    pub data_size: u16,
    /// Offset of this FMMU's data within the domain, fixed at registration.
    pub domain_offset: usize,
    /// Logical address, assigned by `finish()`.
    pub logical_start: u32,
}

/// Process data memory: owned by the domain, or supplied by the application.
enum Memory {
    Owned(Vec<u8>),
    External { ptr: *mut u8, len: usize },
}

// SAFETY: External memory is only registered through an unsafe API whose
// contract requires the region to outlive the domain and to be accessed
// exclusively through it.
unsafe impl Send for Memory {}

/// One logical-address exchange: a datagram per link device, kept in sync.
pub(crate) struct DatagramPair {
    /// Offset of the pair's data within the domain memory.
    data_offset: usize,
    data_size: usize,
    logical_start: u32,
    expected_working_counter: u16,
    /// Datagram per device: `[0]` is the main link, the rest backups.
    datagrams: SmallVec<[Datagram; 2]>,
    /// Input FMMU ranges (relative to the pair) for reconciliation.
    input_ranges: SmallVec<[(usize, usize); 4]>,
}

impl DatagramPair {
    fn working_counter_sum(&self) -> u16 {
        self.datagrams
            .iter()
            .map(|dg| {
                if dg.state == DatagramState::Received {
                    dg.working_counter
                } else {
                    0
                }
            })
            .sum()
    }
}

/// A grouping of FMMUs whose process data is transported together.
pub struct Domain {
    index: usize,
    fmmus: Vec<DomainFmmu>,
    memory: Memory,
    pairs: Vec<DatagramPair>,
    /// Pre-send copy of the main payload, for redundancy reconciliation.
    shadow: Vec<u8>,
    expected_working_counter: u16,
    last_working_counter: u16,
    state: DomainState,
    /// Rate limiting for working counter change logs.
    wc_changes: u32,
    last_wc_log: Option<Instant>,
}

impl Domain {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            fmmus: Vec::new(),
            memory: Memory::Owned(Vec::new()),
            pairs: Vec::new(),
            shadow: Vec::new(),
            expected_working_counter: 0,
            last_working_counter: 0,
            state: DomainState::Zero,
            wc_changes: 0,
            last_wc_log: None,
        }
    }

    /// Domain position in the master's domain list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total mapped process data size in bytes.
    pub fn data_size(&self) -> usize {
        self.fmmus
            .iter()
            .map(|fmmu| usize::from(fmmu.data_size))
            .sum()
    }

    /// The working counter every cycle should achieve.
    pub fn expected_working_counter(&self) -> u16 {
        self.expected_working_counter
    }

    /// The sum of working counters received in the last `process()` cycle.
    pub fn working_counter(&self) -> u16 {
        self.last_working_counter
    }

    /// Aggregate state of the last `process()` cycle.
    pub fn state(&self) -> DomainState {
        self.state
    }

    /// The process data image.
    pub fn data(&self) -> &[u8] {
        match &self.memory {
            Memory::Owned(buf) => buf,
            // SAFETY: Per the `use_external_memory` contract.
            Memory::External { ptr, len } => unsafe {
                core::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    /// Mutable access to the process data image.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.memory {
            Memory::Owned(buf) => buf,
            // SAFETY: Per the `use_external_memory` contract, plus `&mut
            // self`.
            Memory::External { ptr, len } => unsafe {
                core::slice::from_raw_parts_mut(*ptr, *len)
            },
        }
    }

    /// Replace the domain's owned buffer with application supplied memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// lifetime of the domain and must not be accessed while `process()` or
    /// the frame engine run; the usual range checks are elided. `len` must
    /// be at least [`Self::data_size`].
    pub unsafe fn use_external_memory(&mut self, ptr: *mut u8, len: usize) {
        self.memory = Memory::External { ptr, len };
    }

    /// Register one FMMU configuration. Returns the offset of its data
    /// within the domain.
    pub(crate) fn add_fmmu(
        &mut self,
        config_index: usize,
        sync_index: u8,
        direction: Direction,
        data_size: u16,
    ) -> usize {
        let domain_offset = self.data_size();

        self.fmmus.push(DomainFmmu {
            config_index,
            sync_index,
            direction,
            data_size,
            domain_offset,
            logical_start: 0,
        });

        domain_offset
    }

    /// Find the FMMU for `(config, sync)` if one was already registered.
    pub(crate) fn find_fmmu(&self, config_index: usize, sync_index: u8) -> Option<&DomainFmmu> {
        self.fmmus
            .iter()
            .find(|fmmu| fmmu.config_index == config_index && fmmu.sync_index == sync_index)
    }

    /// The resolved FMMU configurations, for the slave configurator.
    pub(crate) fn fmmus(&self) -> &[DomainFmmu] {
        &self.fmmus
    }

    /// Lay the domain out at `logical_base`: allocate memory, assign logical
    /// addresses and build the datagram pairs.
    ///
    /// Pairs are closed when the next FMMU would overflow a single
    /// datagram's payload. Returns the first logical address after the
    /// domain.
    pub(crate) fn finish(&mut self, logical_base: u32, backup_devices: usize) -> u32 {
        let total = self.data_size();

        if matches!(&self.memory, Memory::Owned(_)) {
            self.memory = Memory::Owned(vec![0; total]);
        }

        self.shadow = vec![0; total];
        self.pairs.clear();

        let mut pair_start = 0usize;
        let mut cursor = 0usize;
        let mut outputs = 0u16;
        let mut inputs = 0u16;
        let mut input_ranges: SmallVec<[(usize, usize); 4]> = SmallVec::new();

        let fmmu_count = self.fmmus.len();

        for i in 0..fmmu_count {
            let size = usize::from(self.fmmus[i].data_size);

            if cursor - pair_start + size > MAX_FRAME_DATA && cursor > pair_start {
                self.close_pair(
                    pair_start,
                    cursor,
                    logical_base,
                    outputs,
                    inputs,
                    core::mem::take(&mut input_ranges),
                    backup_devices,
                );

                pair_start = cursor;
                outputs = 0;
                inputs = 0;
            }

            self.fmmus[i].logical_start = logical_base + cursor as u32;

            match self.fmmus[i].direction {
                Direction::MasterWrite => outputs += 1,
                Direction::MasterRead => {
                    inputs += 1;
                    input_ranges.push((cursor - pair_start, size));
                }
            }

            cursor += size;
        }

        if cursor > pair_start {
            self.close_pair(
                pair_start,
                cursor,
                logical_base,
                outputs,
                inputs,
                input_ranges,
                backup_devices,
            );
        }

        // With redundancy each slave is reached over exactly one of the
        // links, so the pair's expectation covers main and backups combined.
        self.expected_working_counter = self
            .pairs
            .iter()
            .map(|pair| pair.expected_working_counter)
            .sum();

        fmt::debug!(
            "Domain {}: {} bytes in {} pair(s) at {:#010x}, expecting WC {}",
            self.index,
            total,
            self.pairs.len(),
            logical_base,
            self.expected_working_counter
        );

        logical_base + total as u32
    }

    #[allow(clippy::too_many_arguments)]
    fn close_pair(
        &mut self,
        pair_start: usize,
        pair_end: usize,
        logical_base: u32,
        outputs: u16,
        inputs: u16,
        input_ranges: SmallVec<[(usize, usize); 4]>,
        backup_devices: usize,
    ) {
        let data_size = pair_end - pair_start;
        let logical_start = logical_base + pair_start as u32;

        // LRW when both directions share the pair; the expected working
        // counter counts writes twice
        let (expected, build): (u16, fn(&mut Datagram, u32, usize)) =
            match (outputs > 0, inputs > 0) {
                (true, true) => (2 * outputs + inputs, |dg, addr, size| {
                    dg.prepare(crate::command::Command::Lrw { address: addr }, size)
                }),
                (true, false) => (outputs, |dg, addr, size| {
                    dg.prepare(crate::command::Command::Lwr { address: addr }, size)
                }),
                (false, _) => (inputs, |dg, addr, size| {
                    dg.prepare(crate::command::Command::Lrd { address: addr }, size)
                }),
            };

        let mut datagrams = SmallVec::new();

        // The main datagram transports the domain memory itself; backups get
        // their own buffers and receive a copy on queue()
        let memory_ptr = match &mut self.memory {
            Memory::Owned(buf) => buf[pair_start..pair_end].as_mut_ptr(),
            Memory::External { ptr, .. } => {
                // SAFETY: Offset stays within the registered region per the
                // `use_external_memory` contract.
                unsafe { ptr.add(pair_start) }
            }
        };

        // SAFETY: The pointer targets this domain's process data region
        // which lives exactly as long as the pair and is only accessed
        // through the domain.
        let mut main = unsafe { Datagram::external(memory_ptr, data_size) };

        build(&mut main, logical_start, data_size);
        main.device_index = 0;
        datagrams.push(main);

        for backup in 0..backup_devices {
            let mut dg = Datagram::new(data_size);

            build(&mut dg, logical_start, data_size);
            dg.device_index = backup + 1;
            datagrams.push(dg);
        }

        fmt::debug!(
            "Domain {}: pair at {:#010x}, {} bytes, expecting WC {}",
            self.index,
            logical_start,
            data_size,
            expected
        );

        self.pairs.push(DatagramPair {
            data_offset: pair_start,
            data_size,
            logical_start,
            expected_working_counter: expected,
            datagrams,
            input_ranges,
        });
    }

    /// Tokens of every datagram of every pair, for the send path.
    pub(crate) fn tokens(&self) -> impl Iterator<Item = (usize, DgToken)> + '_ {
        let domain = self.index;

        self.pairs.iter().enumerate().flat_map(move |(pair, p)| {
            p.datagrams
                .iter()
                .enumerate()
                .map(move |(slot, dg)| {
                    (
                        dg.device_index,
                        DgToken::Domain { domain, pair, slot },
                    )
                })
                .collect::<SmallVec<[(usize, DgToken); 2]>>()
        })
    }

    pub(crate) fn datagram_mut(&mut self, pair: usize, slot: usize) -> Option<&mut Datagram> {
        self.pairs.get_mut(pair)?.datagrams.get_mut(slot)
    }

    /// Prepare this cycle's transmission: snapshot the outgoing payload into
    /// the shadow buffer and clone it into every backup datagram.
    ///
    /// The caller queues the pair datagrams afterwards.
    pub(crate) fn queue(&mut self) {
        for pair in &mut self.pairs {
            let range = pair.data_offset..pair.data_offset + pair.data_size;

            let current = match &self.memory {
                Memory::Owned(buf) => &buf[range.clone()],
                // SAFETY: As in `data()`.
                Memory::External { ptr, .. } => unsafe {
                    core::slice::from_raw_parts(ptr.add(pair.data_offset), pair.data_size)
                },
            };

            self.shadow[range].copy_from_slice(current);

            let Some((main, backups)) = pair.datagrams.split_first_mut() else {
                continue;
            };

            for backup in backups {
                backup.data_mut().copy_from_slice(main.data());
            }
        }
    }

    /// Evaluate the received cycle: sum working counters, derive the domain
    /// state and reconcile redundant inputs.
    pub fn process(&mut self, now: Instant) {
        let mut total = 0u16;

        for pair in &mut self.pairs {
            total += pair.working_counter_sum();
        }

        self.reconcile_inputs();

        if total != self.last_working_counter {
            self.wc_changes += 1;
            self.last_working_counter = total;
        }

        if self.wc_changes > 0 {
            let due = self
                .last_wc_log
                .map_or(true, |at| now.duration_since(at) >= Duration::from_secs(1));

            if due {
                fmt::debug!(
                    "Domain {}: {} working counter change(s), now {}/{}",
                    self.index,
                    self.wc_changes,
                    self.last_working_counter,
                    self.expected_working_counter
                );

                self.last_wc_log = Some(now);
                self.wc_changes = 0;
            }
        }

        self.state = if total == 0 {
            DomainState::Zero
        } else if total == self.expected_working_counter {
            DomainState::Complete
        } else {
            DomainState::Incomplete
        };
    }

    /// Per input FMMU, per byte: prefer data the main link changed, fall
    /// back to changes seen only by the backup link, and otherwise keep the
    /// pre-send value.
    fn reconcile_inputs(&mut self) {
        for pair in &mut self.pairs {
            let (main, backups) = match pair.datagrams.split_first_mut() {
                Some(split) => split,
                None => continue,
            };

            if main.state != DatagramState::Received {
                // Main link lost this cycle; take the backup image wholesale
                if let Some(backup) = backups
                    .iter_mut()
                    .find(|dg| dg.state == DatagramState::Received)
                {
                    main.data_mut().copy_from_slice(backup.data());
                }

                continue;
            }

            let Some(backup) = backups
                .iter()
                .find(|dg| dg.state == DatagramState::Received)
            else {
                continue;
            };

            for (offset, size) in &pair.input_ranges {
                let range = *offset..*offset + *size;
                let shadow_range =
                    pair.data_offset + *offset..pair.data_offset + *offset + *size;

                let shadow = &self.shadow[shadow_range];
                let backup_data = &backup.data()[range.clone()];

                // Byte-wise: keep main where it changed, adopt backup where
                // only the backup changed
                let main_data = main.data_mut();

                for i in 0..*size {
                    let main_byte = &mut main_data[range.start + i];

                    if *main_byte == shadow[i] && backup_data[i] != shadow[i] {
                        *main_byte = backup_data[i];
                    }
                }
            }
        }
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("index", &self.index)
            .field("fmmus", &self.fmmus.len())
            .field("data_size", &self.data_size())
            .field("pairs", &self.pairs.len())
            .field(
                "expected_working_counter",
                &self.expected_working_counter,
            )
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn one_output_one_input_pair() {
        let mut domain = Domain::new(0);

        domain.add_fmmu(0, 2, Direction::MasterWrite, 6);
        domain.add_fmmu(0, 3, Direction::MasterRead, 4);

        let next = domain.finish(0x0000_0000, 0);

        assert_eq!(next, 10);
        assert_eq!(domain.pairs.len(), 1);

        let pair = &domain.pairs[0];

        assert_eq!(pair.data_size, 10);
        assert_eq!(pair.logical_start, 0x0000_0000);
        assert_eq!(pair.expected_working_counter, 3);
        assert_eq!(
            pair.datagrams[0].command,
            Command::Lrw {
                address: 0x0000_0000
            }
        );
        assert_eq!(domain.expected_working_counter(), 3);
    }

    #[test]
    fn directions_pick_command_and_wc() {
        let mut outputs_only = Domain::new(0);

        outputs_only.add_fmmu(0, 2, Direction::MasterWrite, 8);
        outputs_only.add_fmmu(1, 2, Direction::MasterWrite, 8);
        outputs_only.finish(0, 0);

        assert_eq!(outputs_only.expected_working_counter(), 2);
        assert!(matches!(
            outputs_only.pairs[0].datagrams[0].command,
            Command::Lwr { .. }
        ));

        let mut inputs_only = Domain::new(1);

        inputs_only.add_fmmu(0, 3, Direction::MasterRead, 8);
        inputs_only.finish(0, 0);

        assert_eq!(inputs_only.expected_working_counter(), 1);
        assert!(matches!(
            inputs_only.pairs[0].datagrams[0].command,
            Command::Lrd { .. }
        ));
    }

    #[test]
    fn oversize_opens_new_pair() {
        let mut domain = Domain::new(0);

        // 1400 + 200 bytes cannot share a 1486 byte datagram
        domain.add_fmmu(0, 2, Direction::MasterWrite, 1400);
        domain.add_fmmu(1, 2, Direction::MasterWrite, 200);

        domain.finish(0x0001_0000, 0);

        assert_eq!(domain.pairs.len(), 2);
        assert_eq!(domain.pairs[0].logical_start, 0x0001_0000);
        assert_eq!(domain.pairs[1].logical_start, 0x0001_0000 + 1400);
        assert_eq!(domain.expected_working_counter(), 2);
    }

    #[test]
    fn logical_offsets_follow_registration_order() {
        let mut domain = Domain::new(0);

        let a = domain.add_fmmu(0, 2, Direction::MasterWrite, 6);
        let b = domain.add_fmmu(1, 3, Direction::MasterRead, 4);
        let c = domain.add_fmmu(2, 3, Direction::MasterRead, 2);

        assert_eq!((a, b, c), (0, 6, 10));

        domain.finish(0x100, 0);

        assert_eq!(domain.fmmus()[0].logical_start, 0x100);
        assert_eq!(domain.fmmus()[1].logical_start, 0x106);
        assert_eq!(domain.fmmus()[2].logical_start, 0x10a);
    }

    #[test]
    fn process_state_from_working_counters() {
        let mut domain = Domain::new(0);

        domain.add_fmmu(0, 2, Direction::MasterWrite, 4);
        domain.add_fmmu(0, 3, Direction::MasterRead, 4);
        domain.finish(0, 0);

        let now = Instant::now();

        // Nothing received yet
        domain.process(now);
        assert_eq!(domain.state(), DomainState::Zero);

        // Full exchange
        {
            let dg = domain.datagram_mut(0, 0).unwrap();
            dg.state = DatagramState::Received;
            dg.working_counter = 3;
        }

        domain.process(now);
        assert_eq!(domain.state(), DomainState::Complete);
        assert_eq!(domain.working_counter(), 3);

        // Partial exchange
        {
            let dg = domain.datagram_mut(0, 0).unwrap();
            dg.working_counter = 1;
        }

        domain.process(now);
        assert_eq!(domain.state(), DomainState::Incomplete);
    }

    #[test]
    fn redundancy_prefers_main_changes() {
        let mut domain = Domain::new(0);

        domain.add_fmmu(0, 3, Direction::MasterRead, 4);
        domain.finish(0, 1);

        // Snapshot the all-zero image
        domain.queue();

        let now = Instant::now();

        // Main saw a change on byte 0; backup saw a change on byte 1
        {
            let dg = domain.datagram_mut(0, 0).unwrap();
            dg.state = DatagramState::Received;
            dg.working_counter = 1;
            dg.data_mut()[0] = 0xaa;
        }
        {
            let dg = domain.datagram_mut(0, 1).unwrap();
            dg.state = DatagramState::Received;
            dg.working_counter = 0;
            dg.data_mut()[1] = 0xbb;
        }

        domain.process(now);

        // Main's change wins on byte 0, backup's change is adopted on byte 1
        assert_eq!(domain.data()[0], 0xaa);
        assert_eq!(domain.data()[1], 0xbb);
    }

    #[test]
    fn backup_image_taken_when_main_lost() {
        let mut domain = Domain::new(0);

        domain.add_fmmu(0, 3, Direction::MasterRead, 2);
        domain.finish(0, 1);

        domain.queue();

        {
            let dg = domain.datagram_mut(0, 0).unwrap();
            dg.state = DatagramState::TimedOut;
        }
        {
            let dg = domain.datagram_mut(0, 1).unwrap();
            dg.state = DatagramState::Received;
            dg.working_counter = 1;
            dg.data_mut().copy_from_slice(&[0x11, 0x22]);
        }

        domain.process(Instant::now());

        assert_eq!(domain.data(), &[0x11, 0x22]);
        assert_eq!(domain.state(), DomainState::Incomplete);
    }
}
