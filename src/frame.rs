//! The frame engine: packs queued datagrams into EtherCAT frames, transmits
//! them through a device and demultiplexes received datagrams back onto their
//! senders.

use crate::datagram::{Datagram, DatagramState, DATAGRAM_OVERHEAD, LEN_MASK};
use crate::device::Device;
use crate::error::Error;
use crate::ethernet::ETH_DATA_LEN;
use crate::fmt;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EtherCAT frame header length (16 bit: `len:11 | reserved:1 | type:4`).
pub(crate) const ECAT_FRAME_HEADER_LEN: usize = 2;

/// Frame type for EtherCAT DL PDUs.
const FRAME_TYPE_PDU: u16 = 0x01;

/// Maximum payload of a single datagram.
pub(crate) const MAX_FRAME_DATA: usize =
    ETH_DATA_LEN - ECAT_FRAME_HEADER_LEN - DATAGRAM_OVERHEAD;

/// Maximum number of datagram bytes (headers included) in one frame.
const MAX_DATAGRAM_AREA: usize = ETH_DATA_LEN - ECAT_FRAME_HEADER_LEN;

/// How long a sent datagram may remain unanswered before it is timed out.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_micros(500);

/// Minimum gap between repeated fast-path warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies a datagram wherever it is owned, so queues never hold
/// references.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DgToken {
    /// A slot of the external datagram ring.
    Ring(usize),
    /// A datagram of a domain's datagram pair. `slot` 0 is the main device
    /// datagram, higher slots address backup devices.
    Domain {
        domain: usize,
        pair: usize,
        slot: usize,
    },
    /// The cyclic DC reference clock sync datagram.
    DcRef,
    /// The cyclic DC drift compensation datagram.
    DcSync,
}

/// Resolves [`DgToken`]s to the datagrams they name.
///
/// Implemented by the master's I/O half, which owns (or can reach) every
/// datagram that can appear in a queue.
pub(crate) trait DatagramStore {
    /// Run `f` on the datagram named by `token`, or return `None` if the
    /// token no longer resolves (e.g. its domain was dropped).
    fn with_datagram(
        &mut self,
        token: DgToken,
        f: &mut dyn FnMut(&mut Datagram),
    ) -> Option<()>;
}

/// Frame engine statistics. Counted, never fatal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Datagrams sent.
    pub sent: u64,
    /// Datagrams received and matched.
    pub received: u64,
    /// Datagrams that timed out.
    pub timeouts: u64,
    /// Frames that failed their length self check.
    pub corrupted: u64,
    /// Received datagrams that matched no outstanding datagram, e.g. late
    /// arrivals.
    pub unmatched: u64,
}

struct PendingDatagram {
    token: DgToken,
    index: u8,
    code: u8,
    data_size: usize,
    read_like: bool,
    sent_at: Instant,
}

/// Per-device frame engine.
pub(crate) struct FrameEngine {
    queue: VecDeque<DgToken>,
    queued_bytes: usize,
    pending: Vec<PendingDatagram>,
    next_index: u8,
    pub(crate) stats: EngineStats,
    last_timeout_warn: Option<Instant>,
    suppressed_timeouts: u64,
    last_unmatched_warn: Option<Instant>,
    suppressed_unmatched: u64,
}

impl FrameEngine {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(32),
            queued_bytes: 0,
            pending: Vec::with_capacity(64),
            next_index: 0,
            stats: EngineStats::default(),
            last_timeout_warn: None,
            suppressed_timeouts: 0,
            last_unmatched_warn: None,
            suppressed_unmatched: 0,
        }
    }

    /// Bytes currently waiting to be packed, headers included.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Accept a datagram into the TX queue.
    ///
    /// The datagram must be in [`DatagramState::Init`]; a datagram that is
    /// still in flight is skipped and its skip counter incremented.
    pub(crate) fn queue(&mut self, token: DgToken, store: &mut dyn DatagramStore) {
        let mut accepted = None;

        store.with_datagram(token, &mut |dg| {
            match dg.state {
                DatagramState::Queued | DatagramState::Sent => {
                    // Still owned by a previous cycle. Never reuse a slot
                    // until it clears.
                    dg.skip_count += 1;
                    accepted = None;
                }
                _ => {
                    dg.state = DatagramState::Queued;
                    accepted = Some(dg.frame_size());
                }
            }
        });

        if let Some(size) = accepted {
            self.queue.push_back(token);
            self.queued_bytes += size;
        }
    }

    /// Fail every queued and outstanding datagram, e.g. because the link went
    /// down. No retry happens at this level.
    pub(crate) fn fail_all(&mut self, store: &mut dyn DatagramStore) {
        for token in self.queue.drain(..) {
            store.with_datagram(token, &mut |dg| {
                dg.state = DatagramState::Error;
            });
        }

        self.queued_bytes = 0;

        for entry in self.pending.drain(..) {
            store.with_datagram(entry.token, &mut |dg| {
                dg.state = DatagramState::Error;
            });
        }
    }

    /// Move any sent datagram older than [`IO_TIMEOUT`] to
    /// [`DatagramState::TimedOut`] and release its slot.
    pub(crate) fn sweep_timeouts(&mut self, store: &mut dyn DatagramStore, now: Instant) {
        let mut timed_out = 0u64;

        self.pending.retain(|entry| {
            if now.duration_since(entry.sent_at) < IO_TIMEOUT {
                return true;
            }

            store.with_datagram(entry.token, &mut |dg| {
                dg.state = DatagramState::TimedOut;
            });

            timed_out += 1;

            false
        });

        if timed_out > 0 {
            self.stats.timeouts += timed_out;
            self.suppressed_timeouts += timed_out;

            let due = self
                .last_timeout_warn
                .map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL);

            if due {
                fmt::warn!(
                    "{} datagram(s) timed out",
                    self.suppressed_timeouts
                );

                self.last_timeout_warn = Some(now);
                self.suppressed_timeouts = 0;
            }
        }
    }

    /// Pack the queue into frames and transmit them.
    ///
    /// Starts with a timeout sweep so stale slots clear before new traffic
    /// claims indices.
    pub(crate) fn send(
        &mut self,
        store: &mut dyn DatagramStore,
        device: &mut Device,
        now: Instant,
    ) -> Result<(), Error> {
        self.sweep_timeouts(store, now);

        if !device.link_up() {
            if !self.queue.is_empty() || !self.pending.is_empty() {
                fmt::debug!("Link down, failing all datagrams");

                self.fail_all(store);
            }

            return Ok(());
        }

        while !self.queue.is_empty() {
            self.send_one_frame(store, device, now)?;
        }

        Ok(())
    }

    fn send_one_frame(
        &mut self,
        store: &mut dyn DatagramStore,
        device: &mut Device,
        now: Instant,
    ) -> Result<(), Error> {
        // Tokens going into this frame along with their serialised sizes.
        let mut contents: SmallVec<[(DgToken, usize); 16]> = SmallVec::new();
        let mut used = 0usize;

        while let Some(&token) = self.queue.front() {
            let mut size = None;

            let resolved = store.with_datagram(token, &mut |dg| {
                size = Some(dg.frame_size());
            });

            if resolved.is_none() {
                // Stale token, owner is gone.
                self.queue.pop_front();
                continue;
            }

            let size = fmt::unwrap_opt!(size);

            if size > MAX_DATAGRAM_AREA {
                fmt::error!("Datagram too large to transmit ({} bytes)", size);

                store.with_datagram(token, &mut |dg| {
                    dg.state = DatagramState::Error;
                });
                self.queue.pop_front();
                self.queued_bytes = self.queued_bytes.saturating_sub(size);
                continue;
            }

            if used + size > MAX_DATAGRAM_AREA {
                // Frame full, the remainder starts a new one.
                break;
            }

            self.queue.pop_front();
            self.queued_bytes = self.queued_bytes.saturating_sub(size);
            contents.push((token, size));
            used += size;
        }

        if contents.is_empty() {
            return Ok(());
        }

        let payload = device.tx_payload_mut();

        let header = (used as u16 & LEN_MASK) | (FRAME_TYPE_PDU << 12);
        payload[0..2].copy_from_slice(&header.to_le_bytes());

        let mut cursor = ECAT_FRAME_HEADER_LEN;
        let count = contents.len();

        for (slot, (token, _size)) in contents.iter().enumerate() {
            let index = self.next_index;
            self.next_index = self.next_index.wrapping_add(1);

            let more_follows = slot + 1 < count;
            let mut entry = None;

            store.with_datagram(*token, &mut |dg| {
                dg.index = index;
                cursor += dg.serialize(&mut payload[cursor..], more_follows);
                dg.state = DatagramState::Sent;
                dg.sent_at = Some(now);

                entry = Some(PendingDatagram {
                    token: *token,
                    index,
                    code: dg.command.code(),
                    data_size: dg.data_size(),
                    read_like: dg.command.is_read_like(),
                    sent_at: now,
                });
            });

            if let Some(entry) = entry {
                self.stats.sent += 1;
                self.pending.push(entry);
            }
        }

        device.transmit(ECAT_FRAME_HEADER_LEN + used)
    }

    /// Demultiplex one received frame payload (everything after the Ethernet
    /// header) back onto the outstanding datagrams.
    pub(crate) fn receive_frame(
        &mut self,
        payload: &[u8],
        store: &mut dyn DatagramStore,
        now: Instant,
    ) {
        if payload.len() < ECAT_FRAME_HEADER_LEN {
            self.stats.corrupted += 1;
            return;
        }

        let header = u16::from_le_bytes([payload[0], payload[1]]);
        let frame_len = usize::from(header & LEN_MASK);
        let frame_type = header >> 12;

        if frame_type != FRAME_TYPE_PDU
            || frame_len + ECAT_FRAME_HEADER_LEN > payload.len()
        {
            self.stats.corrupted += 1;
            return;
        }

        let mut cursor = ECAT_FRAME_HEADER_LEN;
        let end = ECAT_FRAME_HEADER_LEN + frame_len;
        let mut more = true;

        while more {
            if cursor + DATAGRAM_OVERHEAD > end {
                self.stats.corrupted += 1;
                return;
            }

            let code = payload[cursor];
            let index = payload[cursor + 1];
            let flags =
                u16::from_le_bytes([payload[cursor + 6], payload[cursor + 7]]);
            let data_size = usize::from(flags & LEN_MASK);

            more = flags & 0x8000 != 0;

            let total = DATAGRAM_OVERHEAD + data_size;

            if cursor + total > end {
                self.stats.corrupted += 1;
                return;
            }

            let data = &payload[cursor + 10..cursor + 10 + data_size];
            let wkc = u16::from_le_bytes([
                payload[cursor + total - 2],
                payload[cursor + total - 1],
            ]);

            self.dispatch(index, code, data_size, data, wkc, store, now);

            cursor += total;
        }
    }

    fn dispatch(
        &mut self,
        index: u8,
        code: u8,
        data_size: usize,
        data: &[u8],
        wkc: u16,
        store: &mut dyn DatagramStore,
        now: Instant,
    ) {
        let position = self.pending.iter().position(|entry| {
            entry.index == index && entry.code == code && entry.data_size == data_size
        });

        let Some(position) = position else {
            self.stats.unmatched += 1;
            self.suppressed_unmatched += 1;

            let due = self
                .last_unmatched_warn
                .map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL);

            if due {
                fmt::debug!(
                    "{} unmatched datagram(s), most recent: index {}, command {:#04x}",
                    self.suppressed_unmatched,
                    index,
                    code
                );

                self.last_unmatched_warn = Some(now);
                self.suppressed_unmatched = 0;
            }

            return;
        };

        let entry = self.pending.swap_remove(position);

        let matched = store.with_datagram(entry.token, &mut |dg| {
            if entry.read_like {
                dg.data_mut().copy_from_slice(data);
            }

            dg.working_counter = wkc;
            dg.received_at = Some(now);
            dg.state = DatagramState::Received;
        });

        if matched.is_some() {
            self.stats.received += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    /// A store over a plain vec of datagrams; tokens index into it via the
    /// ring variant.
    struct VecStore(Vec<Datagram>);

    impl DatagramStore for VecStore {
        fn with_datagram(
            &mut self,
            token: DgToken,
            f: &mut dyn FnMut(&mut Datagram),
        ) -> Option<()> {
            let DgToken::Ring(idx) = token else {
                return None;
            };

            self.0.get_mut(idx).map(f)
        }
    }

    use crate::device::tests::loopback_device;
    use std::sync::atomic::Ordering;

    #[test]
    fn queue_then_send_marks_sent() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();
        let (mut device, _handle) = loopback_device();

        engine.queue(DgToken::Ring(0), &mut store);

        assert_eq!(store.0[0].state, DatagramState::Queued);
        assert_eq!(engine.queued_bytes(), 14);

        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        assert_eq!(store.0[0].state, DatagramState::Sent);
        assert_eq!(engine.queued_bytes(), 0);
        assert_eq!(engine.stats.sent, 1);
    }

    #[test]
    fn emitted_in_queue_order_with_next_flags() {
        let mut store = VecStore(vec![
            Datagram::new(16),
            Datagram::new(16),
            Datagram::new(16),
        ]);

        store.0[0].brd(0x0130, 2);
        store.0[1].fprd(0x1001, 0x0130, 1);
        store.0[2].brd(0x0110, 2);

        let mut engine = FrameEngine::new();
        let (mut device, handle) = loopback_device();

        for i in 0..3 {
            engine.queue(DgToken::Ring(i), &mut store);
        }

        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        let frame = handle.sent.lock().unwrap().pop().unwrap();
        let payload = &frame[14..];

        // One frame: 2 + (12 + 2) + (12 + 1) + (12 + 2)
        let header = u16::from_le_bytes([payload[0], payload[1]]);

        assert_eq!(header & LEN_MASK, 41);
        assert_eq!(header >> 12, 1);

        // First datagram: BRD, index 0, next follows
        assert_eq!(payload[2], 0x07);
        assert_eq!(payload[3], 0x00);
        assert_eq!(payload[8] & 0x02, 0x02);
        assert_eq!(payload[9] & 0x80, 0x80);

        // Second datagram: FPRD, index 1
        let second = &payload[2 + 14..];
        assert_eq!(second[0], 0x04);
        assert_eq!(second[1], 0x01);

        // Third datagram: no next flag
        let third = &second[13..];
        assert_eq!(third[0], 0x07);
        assert_eq!(third[7] & 0x80, 0x00);
    }

    #[test]
    fn response_dispatch_round_trip() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();
        let (mut device, handle) = loopback_device();

        engine.queue(DgToken::Ring(0), &mut store);
        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        // Simulate the response: same frame with AL states and working
        // counter filled in.
        let mut frame = handle.sent.lock().unwrap().pop().unwrap();
        frame[12 + 2 + 10] = 0x02; // AL state PREOP
        frame[12 + 2 + 12] = 0x03; // working counter 3

        engine.receive_frame(&frame[14..], &mut store, Instant::now());

        let dg = &store.0[0];

        assert_eq!(dg.state, DatagramState::Received);
        assert_eq!(dg.working_counter(), 3);
        assert_eq!(dg.data(), &[0x02, 0x00]);
        assert_eq!(engine.stats.received, 1);
        assert_eq!(engine.stats.unmatched, 0);
    }

    #[test]
    fn late_response_is_unmatched() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();

        // Response for an index that was never sent
        let mut payload = vec![0u8; 16];
        payload[0..2].copy_from_slice(&(14u16 | 1 << 12).to_le_bytes());
        payload[2] = 0x07;
        payload[3] = 0x09;
        payload[8] = 0x02;

        engine.receive_frame(&payload, &mut store, Instant::now());

        assert_eq!(engine.stats.unmatched, 1);
        assert_eq!(store.0[0].state, DatagramState::Init);
    }

    #[test]
    fn corrupted_frame_counted_not_fatal() {
        let mut store = VecStore(vec![]);
        let mut engine = FrameEngine::new();

        // Claims 100 bytes of content in a 4 byte buffer
        let payload = [0x64u8 | 0x00, 0x10, 0x07, 0x00];

        engine.receive_frame(&payload, &mut store, Instant::now());

        assert_eq!(engine.stats.corrupted, 1);
    }

    #[test]
    fn timeout_sweep() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();
        let (mut device, _handle) = loopback_device();

        let sent_at = Instant::now();

        engine.queue(DgToken::Ring(0), &mut store);
        engine.send(&mut store, &mut device, sent_at).unwrap();

        // Nothing expires right away
        engine.sweep_timeouts(&mut store, sent_at);
        assert_eq!(store.0[0].state, DatagramState::Sent);

        engine.sweep_timeouts(&mut store, sent_at + Duration::from_millis(1));

        assert_eq!(store.0[0].state, DatagramState::TimedOut);
        assert_eq!(engine.stats.timeouts, 1);
    }

    #[test]
    fn link_down_fails_fast() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();
        let (mut device, handle) = loopback_device();

        handle.up.store(false, Ordering::Relaxed);
        device.check_link();

        engine.queue(DgToken::Ring(0), &mut store);
        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        assert_eq!(store.0[0].state, DatagramState::Error);
        assert!(handle.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn big_queue_splits_into_frames() {
        let mut dgs = Vec::new();

        for _ in 0..4 {
            let mut dg = Datagram::new(600);
            dg.brd(0x1000, 500);
            dgs.push(dg);
        }

        let mut store = VecStore(dgs);
        let mut engine = FrameEngine::new();
        let (mut device, handle) = loopback_device();

        for i in 0..4 {
            engine.queue(DgToken::Ring(i), &mut store);
        }

        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        // 4 x 512 byte datagrams don't fit a single 1498 byte area
        assert_eq!(handle.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn rejects_command_mismatch() {
        let mut store = VecStore(vec![Datagram::new(16)]);

        store.0[0].brd(0x0130, 2);

        let mut engine = FrameEngine::new();
        let (mut device, handle) = loopback_device();

        engine.queue(DgToken::Ring(0), &mut store);
        engine.send(&mut store, &mut device, Instant::now()).unwrap();

        let mut frame = handle.sent.lock().unwrap().pop().unwrap();

        // Flip the command code to FPRD
        frame[14 + 2] = 0x04;

        engine.receive_frame(&frame[14..], &mut store, Instant::now());

        assert_eq!(engine.stats.unmatched, 1);
        assert_eq!(store.0[0].state, DatagramState::Sent);
    }

    #[test]
    fn command_codes() {
        assert_eq!(Command::Brd { register: 0 }.code(), 0x07);
        assert_eq!(
            Command::Frmw {
                station: 1,
                register: 0
            }
            .code(),
            0x0e
        );
        assert_eq!(Command::Lrw { address: 0 }.code(), 0x0c);
    }
}
