//! Master cycle timeline
//!
//! A stable min-heap of future hardware events keyed by absolute cycle count. Events that
//! share a cycle dispatch in insertion order; cancellation invalidates the event's id rather
//! than digging it out of the heap, and stale entries are skipped at pop time.

use bincode::{Decode, Encode};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct EventId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum EventKind {
    /// End of the visible frame; `run_until_vblank` stops here
    VBlank,
    /// Horizontal blanking for the current scanline
    HBlank,
    /// CD block drive activity (sector delivery pacing)
    CdDrive,
    /// SMPC command completion
    SmpcCommand,
    /// Sound sample tick
    ScspSample,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub payload: u32,
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct QueuedEvent {
    event: Event,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event.cycle == other.event.cycle && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // The sequence number breaks cycle ties so equal-cycle events pop FIFO
        self.event.cycle.cmp(&other.event.cycle).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePastCycleError {
    pub requested: u64,
    pub current: u64,
}

impl std::fmt::Display for SchedulePastCycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempted to schedule an event at cycle {} but the timeline is at {}",
            self.requested, self.current
        )
    }
}

impl std::error::Error for SchedulePastCycleError {}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Scheduler {
    cycle_counter: u64,
    next_event_id: u64,
    next_seq: u64,
    queue: Heap,
    cancelled: Vec<EventId>,
}

// BinaryHeap has no bincode impl; round-trip through the sorted Vec form
#[derive(Debug, Clone, Default)]
struct Heap(BinaryHeap<Reverse<QueuedEvent>>);

impl Encode for Heap {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        // Canonical (sorted) order so that encode/decode/encode is byte-stable
        let mut entries: Vec<QueuedEvent> = self.0.iter().map(|Reverse(e)| *e).collect();
        entries.sort_unstable();
        entries.encode(encoder)
    }
}

impl<Context> Decode<Context> for Heap {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let entries = Vec::<QueuedEvent>::decode(decoder)?;
        Ok(Self(entries.into_iter().map(Reverse).collect()))
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for Heap {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Decode::decode(decoder)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cycle_counter: 0,
            next_event_id: 0,
            next_seq: 0,
            queue: Heap::default(),
            cancelled: Vec::new(),
        }
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle_counter
    }

    pub fn advance_by(&mut self, cycles: u64) {
        self.cycle_counter += cycles;
    }

    /// Queue an event at an absolute cycle. Scheduling into the past is a caller bug and is
    /// rejected.
    pub fn schedule_at(
        &mut self,
        cycle: u64,
        kind: EventKind,
        payload: u32,
    ) -> Result<EventId, SchedulePastCycleError> {
        if cycle < self.cycle_counter {
            return Err(SchedulePastCycleError { requested: cycle, current: self.cycle_counter });
        }

        let id = EventId(self.next_event_id);
        self.next_event_id += 1;

        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.0.push(Reverse(QueuedEvent { event: Event { id, kind, payload, cycle }, seq }));
        Ok(id)
    }

    /// Convenience for scheduling relative to the current cycle.
    pub fn schedule_in(
        &mut self,
        cycles_from_now: u64,
        kind: EventKind,
        payload: u32,
    ) -> EventId {
        self.schedule_at(self.cycle_counter + cycles_from_now, kind, payload)
            .expect("scheduling relative to the current cycle cannot land in the past")
    }

    pub fn cancel(&mut self, id: EventId) {
        self.cancelled.push(id);
    }

    /// Cycle of the next live event, if any.
    #[must_use]
    pub fn next_event_cycle(&self) -> Option<u64> {
        self.queue
            .0
            .iter()
            .filter(|Reverse(queued)| !self.cancelled.contains(&queued.event.id))
            .map(|Reverse(queued)| queued.event.cycle)
            .min()
    }

    /// Pop the earliest event with cycle <= `target`, advancing the master counter to the
    /// event's cycle. Cancelled events are discarded silently.
    pub fn pop_due(&mut self, target: u64) -> Option<Event> {
        while let Some(Reverse(queued)) = self.queue.0.peek().copied() {
            if queued.event.cycle > target {
                return None;
            }

            self.queue.0.pop();

            if let Some(index) = self.cancelled.iter().position(|&id| id == queued.event.id) {
                self.cancelled.swap_remove(index);
                continue;
            }

            self.cycle_counter = self.cycle_counter.max(queued.event.cycle);
            return Some(queued.event);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_pop_in_cycle_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(300, EventKind::VBlank, 0).unwrap();
        scheduler.schedule_at(100, EventKind::HBlank, 1).unwrap();
        scheduler.schedule_at(200, EventKind::CdDrive, 2).unwrap();

        assert_eq!(scheduler.pop_due(1000).unwrap().payload, 1);
        assert_eq!(scheduler.pop_due(1000).unwrap().payload, 2);
        assert_eq!(scheduler.pop_due(1000).unwrap().payload, 0);
        assert!(scheduler.pop_due(1000).is_none());
    }

    #[test]
    fn equal_cycles_dispatch_fifo() {
        let mut scheduler = Scheduler::new();
        for payload in 0..5 {
            scheduler.schedule_at(100, EventKind::HBlank, payload).unwrap();
        }

        for payload in 0..5 {
            assert_eq!(scheduler.pop_due(100).unwrap().payload, payload);
        }
    }

    #[test]
    fn scheduling_into_the_past_is_rejected() {
        let mut scheduler = Scheduler::new();
        scheduler.advance_by(500);

        let error = scheduler.schedule_at(499, EventKind::VBlank, 0).unwrap_err();
        assert_eq!(error, SchedulePastCycleError { requested: 499, current: 500 });
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let mut scheduler = Scheduler::new();
        let keep = scheduler.schedule_at(100, EventKind::HBlank, 1).unwrap();
        let cancel = scheduler.schedule_at(50, EventKind::HBlank, 2).unwrap();
        scheduler.cancel(cancel);

        let event = scheduler.pop_due(1000).unwrap();
        assert_eq!(event.id, keep);
        assert!(scheduler.pop_due(1000).is_none());
    }

    #[test]
    fn pop_respects_the_target_cycle() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(100, EventKind::HBlank, 0).unwrap();
        scheduler.schedule_at(200, EventKind::VBlank, 1).unwrap();

        assert_eq!(scheduler.pop_due(150).unwrap().payload, 0);
        assert_eq!(scheduler.current_cycle(), 100);
        assert!(scheduler.pop_due(150).is_none());
    }
}
