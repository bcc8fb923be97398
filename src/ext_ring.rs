//! The external datagram ring: a fixed, lock free hand-off buffer between
//! the state machine thread (producer) and the cyclic send path (consumer).
//!
//! State machines never allocate datagrams. They claim a pre-sized slot,
//! fill it, and commit it; the send path walks committed slots, injects them
//! into the frame engine within a per-cycle byte budget, and writes the
//! response back into the slot where the producing machine picks it up on its
//! next step.

use crate::datagram::{AtomicDatagramState, Datagram, DatagramState};
use crate::fmt;
use crate::frame::{DatagramStore, DgToken, FrameEngine, MAX_FRAME_DATA};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Number of slots. Power of two.
pub(crate) const EXT_RING_SIZE: usize = 32;

/// How long a committed datagram may wait for injection before it is failed
/// to guarantee forward progress.
pub(crate) const INJECTION_TIMEOUT: Duration = Duration::from_millis(10);

struct RingSlot {
    /// Authoritative lifecycle state of the slot's datagram, and the
    /// acquire/release hand-off point between the two sides.
    ///
    /// [`DatagramState::Error`] doubles as the vacant state: it is what slots
    /// start out as, what a claim scratches the slot to, and (like the other
    /// terminal states) what makes a slot claimable again.
    state: AtomicDatagramState,
    dg: UnsafeCell<Datagram>,
}

/// See module docs.
pub(crate) struct ExtRing {
    slots: Box<[RingSlot]>,
    /// Index of the slot most recently claimed by the producer.
    producer: AtomicUsize,
    /// Index of the slot most recently handled by the consumer.
    consumer: AtomicUsize,
}

// SAFETY: Slot contents are only accessed by the side that currently owns
// the slot. Ownership passes producer → consumer through `commit()`
// (release store of `Init`, then release store of the producer cursor) and
// consumer → producer through the release store of a terminal state. Each
// side is a single thread (the FSM thread produces, whichever thread drives
// `send()` consumes, and the two-phase runtime guarantees that is one thread
// at a time).
unsafe impl Sync for ExtRing {}

impl ExtRing {
    pub(crate) fn new() -> Self {
        let slots = (0..EXT_RING_SIZE)
            .map(|_| RingSlot {
                state: AtomicDatagramState::new(DatagramState::Error),
                dg: UnsafeCell::new(Datagram::new(MAX_FRAME_DATA)),
            })
            .collect();

        Self {
            slots,
            producer: AtomicUsize::new(0),
            consumer: AtomicUsize::new(0),
        }
    }

    /// Producer side: claim the next slot, or yield until the next cycle if
    /// the ring is full or the slot is still in flight from a previous lap.
    pub(crate) fn claim(&self) -> Option<ProducerSlot<'_>> {
        let producer = self.producer.load(Ordering::Relaxed);
        let next = (producer + 1) % EXT_RING_SIZE;

        if next == self.consumer.load(Ordering::Acquire) {
            return None;
        }

        let state = self.slots[next].state.load(Ordering::Acquire);

        if matches!(state, DatagramState::Queued | DatagramState::Sent) {
            // A previous lap's datagram is still in flight here.
            return None;
        }

        // Scratch the slot so an abandoned claim is never injected.
        self.slots[next].state.store(DatagramState::Error, Ordering::Relaxed);
        self.producer.store(next, Ordering::Release);

        Some(ProducerSlot {
            ring: self,
            index: next,
        })
    }

    /// Producer side: lifecycle state of a slot, used by state machines to
    /// poll their in-flight datagram.
    pub(crate) fn state(&self, index: usize) -> DatagramState {
        self.slots[index].state.load(Ordering::Acquire)
    }

    /// Producer side: read a completed slot.
    ///
    /// Must only be called after [`Self::state`] returned a terminal state
    /// for `index`.
    pub(crate) fn with_response<R>(&self, index: usize, f: impl FnOnce(&Datagram) -> R) -> R {
        debug_assert!(self.state(index).is_terminal());

        // SAFETY: The consumer released the slot with its terminal state
        // store and will not touch it again; the producer thread (us) is the
        // only other accessor.
        f(unsafe { &*self.slots[index].dg.get() })
    }

    /// Consumer side: run `f` on a slot's datagram, then publish its updated
    /// lifecycle state.
    ///
    /// Must only be called between injection and the terminal state of the
    /// slot, i.e. while the consumer owns it.
    pub(crate) fn with_slot(&self, index: usize, f: &mut dyn FnMut(&mut Datagram)) {
        let slot = &self.slots[index];

        // SAFETY: Consumer-owned per the call contract; the producer only
        // polls the atomic state until it observes a terminal value.
        let dg = unsafe { &mut *slot.dg.get() };

        f(dg);

        slot.state.store(dg.state, Ordering::Release);
    }

    /// Consumer side: walk all committed slots and queue each onto its
    /// device's frame engine, bounded by `budget` bytes per cycle so a burst
    /// of external datagrams cannot blow the cable's byte budget for the
    /// configured send interval.
    ///
    /// Slots that do not fit the remaining budget stay in the ring for the
    /// next cycle; once a slot has waited [`INJECTION_TIMEOUT`] it is failed
    /// instead.
    pub(crate) fn inject(
        &self,
        engines: &mut [FrameEngine],
        store: &mut dyn DatagramStore,
        mut budget: usize,
        now: Instant,
    ) {
        let producer = self.producer.load(Ordering::Acquire);
        let mut consumer = self.consumer.load(Ordering::Relaxed);

        while consumer != producer {
            let next = (consumer + 1) % EXT_RING_SIZE;
            let slot = &self.slots[next];

            if slot.state.load(Ordering::Acquire) != DatagramState::Init {
                // Abandoned claim or already handled; skip it.
                consumer = next;
                continue;
            }

            // SAFETY: Committed (`Init`) slots between the cursors belong to
            // the consumer.
            let dg = unsafe { &mut *slot.dg.get() };

            let size = dg.frame_size();

            if size > budget {
                let expired = dg
                    .produced_at
                    .is_some_and(|at| now.duration_since(at) >= INJECTION_TIMEOUT);

                if expired {
                    fmt::warn!(
                        "External datagram did not fit the send budget within {} ms, failing it",
                        INJECTION_TIMEOUT.as_millis() as u32
                    );

                    dg.state = DatagramState::Error;
                    slot.state.store(DatagramState::Error, Ordering::Release);

                    consumer = next;
                    continue;
                }

                // Try again next cycle; later slots must wait to preserve
                // ordering.
                break;
            }

            let Some(engine) = engines.get_mut(dg.device_index) else {
                // Routed to a device that no longer exists.
                dg.state = DatagramState::Error;
                slot.state.store(DatagramState::Error, Ordering::Release);

                consumer = next;
                continue;
            };

            budget = budget.saturating_sub(size);

            engine.queue(DgToken::Ring(next), store);

            consumer = next;
        }

        self.consumer.store(consumer, Ordering::Release);
    }
}

/// An exclusively claimed, not yet committed ring slot.
pub(crate) struct ProducerSlot<'ring> {
    ring: &'ring ExtRing,
    index: usize,
}

impl ProducerSlot<'_> {
    /// The slot's datagram, ready to be prepared.
    pub(crate) fn datagram(&mut self) -> &mut Datagram {
        // SAFETY: Claiming advanced the producer cursor, so no other claim
        // can alias this slot, and the consumer does not look at slots whose
        // state is not `Init`.
        unsafe { &mut *self.ring.slots[self.index].dg.get() }
    }

    /// Publish the filled slot for injection. Returns the slot index for the
    /// producing machine to poll.
    pub(crate) fn commit(mut self, device_index: usize, now: Instant) -> usize {
        let dg = self.datagram();

        dg.device_index = device_index;
        dg.produced_at = Some(now);
        dg.state = DatagramState::Init;

        self.ring.slots[self.index]
            .state
            .store(DatagramState::Init, Ordering::Release);

        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::loopback_device;

    struct RingStore(std::sync::Arc<ExtRing>);

    impl DatagramStore for RingStore {
        fn with_datagram(
            &mut self,
            token: DgToken,
            f: &mut dyn FnMut(&mut Datagram),
        ) -> Option<()> {
            match token {
                DgToken::Ring(index) => {
                    self.0.with_slot(index, f);

                    Some(())
                }
                _ => None,
            }
        }
    }

    #[test]
    fn claim_commit_inject_complete() {
        let ring = std::sync::Arc::new(ExtRing::new());
        let mut store = RingStore(std::sync::Arc::clone(&ring));
        let mut engine = FrameEngine::new();
        let (mut device, _handle) = loopback_device();

        let now = Instant::now();

        let mut slot = ring.claim().unwrap();

        slot.datagram().brd(0x0130, 2);

        let token = slot.commit(0, now);

        assert_eq!(ring.state(token), DatagramState::Init);

        ring.inject(core::slice::from_mut(&mut engine), &mut store, 1500, now);

        assert_eq!(ring.state(token), DatagramState::Queued);

        engine.send(&mut store, &mut device, now).unwrap();

        assert_eq!(ring.state(token), DatagramState::Sent);

        // Time the datagram out; the slot becomes terminal and reclaimable
        engine.sweep_timeouts(&mut store, now + Duration::from_millis(1));

        assert_eq!(ring.state(token), DatagramState::TimedOut);
        assert!(ring.state(token).is_terminal());

        ring.with_response(token, |dg| {
            assert_eq!(dg.working_counter(), 0);
        });
    }

    #[test]
    fn ring_full_yields() {
        let ring = ExtRing::new();

        let mut claimed = Vec::new();

        // One slot is always kept free to distinguish full from empty
        for _ in 0..EXT_RING_SIZE - 1 {
            let mut slot = ring.claim().expect("ring should have capacity");

            slot.datagram().brd(0x0130, 2);
            claimed.push(slot.commit(0, Instant::now()));
        }

        assert!(ring.claim().is_none());
    }

    #[test]
    fn budget_defers_injection() {
        let ring = std::sync::Arc::new(ExtRing::new());
        let mut store = RingStore(std::sync::Arc::clone(&ring));
        let mut engine = FrameEngine::new();

        let now = Instant::now();

        let mut slot = ring.claim().unwrap();
        slot.datagram().brd(0x0000, 100);
        let first = slot.commit(0, now);

        let mut slot = ring.claim().unwrap();
        slot.datagram().brd(0x0000, 100);
        let second = slot.commit(0, now);

        // Budget only covers the first datagram (112 bytes framed)
        ring.inject(core::slice::from_mut(&mut engine), &mut store, 150, now);

        assert_eq!(ring.state(first), DatagramState::Queued);
        assert_eq!(ring.state(second), DatagramState::Init);

        // Next cycle has budget again
        ring.inject(core::slice::from_mut(&mut engine), &mut store, 150, now);

        assert_eq!(ring.state(second), DatagramState::Queued);
    }

    #[test]
    fn injection_timeout_fails_oversize_stragglers() {
        let ring = std::sync::Arc::new(ExtRing::new());
        let mut store = RingStore(std::sync::Arc::clone(&ring));
        let mut engine = FrameEngine::new();

        let produced = Instant::now();

        let mut slot = ring.claim().unwrap();
        slot.datagram().brd(0x0000, 500);
        let token = slot.commit(0, produced);

        // Never enough budget; before the timeout the slot just waits
        ring.inject(core::slice::from_mut(&mut engine), &mut store, 100, produced);

        assert_eq!(ring.state(token), DatagramState::Init);

        ring.inject(
            core::slice::from_mut(&mut engine),
            &mut store,
            100,
            produced + INJECTION_TIMEOUT,
        );

        assert_eq!(ring.state(token), DatagramState::Error);

        // The slot is reclaimable afterwards
        assert!(ring.claim().is_some());
    }

    #[test]
    fn abandoned_claim_is_skipped() {
        let ring = std::sync::Arc::new(ExtRing::new());
        let mut store = RingStore(std::sync::Arc::clone(&ring));
        let mut engine = FrameEngine::new();

        let now = Instant::now();

        // Claim and drop without committing
        drop(ring.claim().unwrap());

        let mut slot = ring.claim().unwrap();
        slot.datagram().brd(0x0130, 2);
        let token = slot.commit(0, now);

        ring.inject(core::slice::from_mut(&mut engine), &mut store, 1500, now);

        // The abandoned slot was passed over, the committed one injected
        assert_eq!(ring.state(token), DatagramState::Queued);
    }
}
