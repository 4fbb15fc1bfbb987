// Event Scheduler — process-wide timed injection queue
//
// One time-ordered queue for every circuit's pending padding events,
// drained by the reactor's periodic tick. Entries hold circuit handles,
// not owned references: a handler decides liveness, stale entries are
// dropped rather than executed, and teardown purges a circuit's entries
// synchronously before its runtime is released.

use crate::circuit::CircuitId;
use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

/// Period of the global drain tick
pub const TICK_PERIOD_MS: u64 = 5;

/// Maximum age an unprocessed entry may reach before being discarded
pub const STALENESS_WINDOW_MS: u64 = 500;

/// What a scheduled entry does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    /// Inject one dummy cell on the circuit
    InjectDummy,
    /// Insert a delay marker gating `pkt_count` cells until `trigger_ms`
    DelayStart { trigger_ms: u64, pkt_count: u32 },
    /// Wake the circuit after a delay gap ends
    WakeNotify,
}

/// One scheduled injection event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQueueEntry {
    pub circuit: CircuitId,
    pub scheduled_ms: u64,
    /// Insertion sequence; breaks ties FIFO at equal scheduled times
    pub seq: u64,
    pub op: EventOp,
}

impl Ord for EventQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled_ms
            .cmp(&other.scheduled_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EventQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handler verdict for one due entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Executed; drop the entry
    Handled,
    /// Circuit transiently unready; re-queue at the tail for a later tick
    NotReady,
    /// Circuit handle no longer resolves; drop the entry
    Dead,
}

/// Counters for one drain tick, logged for offline analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub processed: usize,
    pub expired: usize,
    pub requeued: usize,
    pub discarded: usize,
    pub remaining: usize,
}

/// The process-wide event queue
///
/// Lazily started by the first unit install; `tick` is a no-op until
/// then. Min-ordering comes from wrapping entries in `Reverse`.
#[derive(Debug, Default)]
pub struct EventScheduler {
    heap: BinaryHeap<Reverse<EventQueueEntry>>,
    next_seq: u64,
    watermark: u64,
    staleness_window_ms: u64,
    started: bool,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::with_staleness(STALENESS_WINDOW_MS)
    }

    pub fn with_staleness(staleness_window_ms: u64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            watermark: 0,
            staleness_window_ms,
            started: false,
        }
    }

    /// Lazy start: called on first unit install
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            debug!("padding event scheduler started");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Times processed so far never exceed this mark
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedule a dummy injection at `at_ms`
    pub fn enqueue_dummy(&mut self, circuit: CircuitId, at_ms: u64) {
        self.push(circuit, at_ms, EventOp::InjectDummy);
    }

    /// Schedule a delay gap: a blocking DelayStart at `at_ms` plus its
    /// paired WakeNotify at `delay_to_ms`
    pub fn enqueue_delay(
        &mut self,
        circuit: CircuitId,
        at_ms: u64,
        delay_to_ms: u64,
        pkt_count: u32,
    ) {
        self.push(
            circuit,
            at_ms,
            EventOp::DelayStart {
                trigger_ms: delay_to_ms,
                pkt_count,
            },
        );
        self.push(circuit, delay_to_ms, EventOp::WakeNotify);
    }

    /// Re-queue an entry at the tail of its scheduled time
    ///
    /// The fresh sequence number sorts it after everything already
    /// queued for that time; the staleness window still bounds how long
    /// it may keep bouncing.
    pub fn requeue(&mut self, entry: EventQueueEntry) {
        self.push(entry.circuit, entry.scheduled_ms, entry.op);
    }

    /// Drop every entry referencing a circuit; returns how many
    ///
    /// Must run synchronously with circuit teardown, before the
    /// circuit's runtime is released.
    pub fn purge_circuit(&mut self, circuit: CircuitId) -> usize {
        let before = self.heap.len();
        let kept: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(e)| e.circuit != circuit)
            .collect();
        self.heap = kept.into();
        let purged = before - self.heap.len();
        if purged > 0 {
            debug!("{}: purged {} scheduled events", circuit, purged);
        }
        purged
    }

    /// Drain one tick: purge stale entries, process everything due
    ///
    /// Entries older than `now − staleness_window` are dropped in bulk
    /// with a single overload warning. Due entries are handed to the
    /// handler in (time, seq) order; NotReady entries are re-queued at
    /// the tail. The watermark advances to max(last processed, now).
    pub fn tick<F>(&mut self, now_ms: u64, mut handle: F) -> TickStats
    where
        F: FnMut(&EventQueueEntry) -> EventDisposition,
    {
        let mut stats = TickStats::default();
        if !self.started {
            stats.remaining = self.heap.len();
            return stats;
        }

        let stale_cutoff = now_ms.saturating_sub(self.staleness_window_ms);
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.scheduled_ms >= stale_cutoff {
                break;
            }
            self.heap.pop();
            stats.expired += 1;
        }
        if stats.expired > 0 {
            warn!(
                "padding event queue overload: dropped {} entries older than {}ms",
                stats.expired, self.staleness_window_ms
            );
        }

        // Collect the due prefix first so NotReady re-queues (which keep
        // their scheduled time but get a fresh seq) are not reprocessed
        // within the same tick.
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.scheduled_ms > now_ms {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }

        let mut last_processed = 0u64;
        for entry in due {
            match handle(&entry) {
                EventDisposition::Handled => {
                    stats.processed += 1;
                    last_processed = last_processed.max(entry.scheduled_ms);
                }
                EventDisposition::NotReady => {
                    stats.requeued += 1;
                    self.requeue(entry);
                }
                EventDisposition::Dead => {
                    stats.discarded += 1;
                }
            }
        }

        self.watermark = self.watermark.max(last_processed).max(now_ms);
        stats.remaining = self.heap.len();
        debug!(
            "padding tick: processed={} expired={} requeued={} discarded={} remaining={}",
            stats.processed, stats.expired, stats.requeued, stats.discarded, stats.remaining
        );
        stats
    }

    fn push(&mut self, circuit: CircuitId, scheduled_ms: u64, op: EventOp) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(EventQueueEntry {
            circuit,
            scheduled_ms,
            seq,
            op,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_started_scheduler(staleness: u64) -> EventScheduler {
        let mut sched = EventScheduler::with_staleness(staleness);
        sched.start();
        sched
    }

    #[test]
    fn test_tick_noop_before_start() {
        let mut sched = EventScheduler::new();
        sched.enqueue_dummy(CircuitId::from_raw(1), 10);
        let stats = sched.tick(100, |_| EventDisposition::Handled);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.remaining, 1);
    }

    #[test]
    fn test_scenario_c_event_window() {
        // Entries at t=100,105,110; tick at t=107 with staleness=500
        let mut sched = create_started_scheduler(500);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_dummy(circ, 100);
        sched.enqueue_dummy(circ, 105);
        sched.enqueue_dummy(circ, 110);

        let mut seen = Vec::new();
        let stats = sched.tick(107, |e| {
            seen.push(e.scheduled_ms);
            EventDisposition::Handled
        });

        assert_eq!(seen, vec![100, 105]);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.remaining, 1);
        assert_eq!(sched.watermark(), 107);
    }

    #[test]
    fn test_stale_entries_bulk_dropped() {
        let mut sched = create_started_scheduler(500);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_dummy(circ, 10);
        sched.enqueue_dummy(circ, 20);
        sched.enqueue_dummy(circ, 900);

        let mut handled = 0;
        let stats = sched.tick(1000, |_| {
            handled += 1;
            EventDisposition::Handled
        });

        // 10 and 20 fall outside [500, 1000]; 900 is processed
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(handled, 1);
    }

    #[test]
    fn test_boundary_entry_is_not_stale() {
        let mut sched = create_started_scheduler(500);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_dummy(circ, 500);
        let stats = sched.tick(1000, |_| EventDisposition::Handled);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn test_fifo_tie_break_at_equal_times() {
        let mut sched = create_started_scheduler(500);
        let a = CircuitId::from_raw(1);
        let b = CircuitId::from_raw(2);
        sched.enqueue_dummy(a, 50);
        sched.enqueue_dummy(b, 50);

        let mut order = Vec::new();
        sched.tick(60, |e| {
            order.push(e.circuit);
            EventDisposition::Handled
        });
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn test_not_ready_requeued_not_reprocessed_same_tick() {
        let mut sched = create_started_scheduler(500);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_dummy(circ, 10);

        let mut calls = 0;
        let stats = sched.tick(20, |_| {
            calls += 1;
            EventDisposition::NotReady
        });
        assert_eq!(calls, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.remaining, 1);

        // Still deliverable on the next tick within the staleness bound
        let stats = sched.tick(25, |_| EventDisposition::Handled);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn test_not_ready_eventually_expires() {
        let mut sched = create_started_scheduler(100);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_dummy(circ, 10);

        let stats = sched.tick(20, |_| EventDisposition::NotReady);
        assert_eq!(stats.requeued, 1);

        let stats = sched.tick(500, |_| {
            panic!("stale entry must not be executed");
        });
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.remaining, 0);
    }

    #[test]
    fn test_dead_circuit_discarded() {
        let mut sched = create_started_scheduler(500);
        sched.enqueue_dummy(CircuitId::from_raw(1), 10);
        let stats = sched.tick(20, |_| EventDisposition::Dead);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.remaining, 0);
    }

    #[test]
    fn test_enqueue_delay_inserts_pair() {
        let mut sched = create_started_scheduler(500);
        let circ = CircuitId::from_raw(1);
        sched.enqueue_delay(circ, 100, 250, 2);
        assert_eq!(sched.len(), 2);

        let mut ops = Vec::new();
        sched.tick(300, |e| {
            ops.push((e.scheduled_ms, e.op));
            EventDisposition::Handled
        });
        assert_eq!(
            ops,
            vec![
                (
                    100,
                    EventOp::DelayStart {
                        trigger_ms: 250,
                        pkt_count: 2
                    }
                ),
                (250, EventOp::WakeNotify),
            ]
        );
    }

    #[test]
    fn test_purge_circuit() {
        let mut sched = create_started_scheduler(500);
        let a = CircuitId::from_raw(1);
        let b = CircuitId::from_raw(2);
        sched.enqueue_dummy(a, 10);
        sched.enqueue_delay(a, 20, 50, 1);
        sched.enqueue_dummy(b, 30);

        assert_eq!(sched.purge_circuit(a), 3);
        assert_eq!(sched.len(), 1);

        let mut seen = Vec::new();
        sched.tick(100, |e| {
            seen.push(e.circuit);
            EventDisposition::Handled
        });
        assert_eq!(seen, vec![b]);
    }

    #[test]
    fn test_purge_preserves_order_of_survivors() {
        let mut sched = create_started_scheduler(500);
        let a = CircuitId::from_raw(1);
        let b = CircuitId::from_raw(2);
        sched.enqueue_dummy(b, 40);
        sched.enqueue_dummy(a, 10);
        sched.enqueue_dummy(b, 20);
        sched.purge_circuit(a);

        let mut times = Vec::new();
        sched.tick(100, |e| {
            times.push(e.scheduled_ms);
            EventDisposition::Handled
        });
        assert_eq!(times, vec![20, 40]);
    }

    #[test]
    fn test_watermark_monotonic() {
        let mut sched = create_started_scheduler(500);
        sched.enqueue_dummy(CircuitId::from_raw(1), 50);
        sched.tick(100, |_| EventDisposition::Handled);
        assert_eq!(sched.watermark(), 100);

        // A tick with nothing due still advances to now
        sched.tick(150, |_| EventDisposition::Handled);
        assert_eq!(sched.watermark(), 150);
    }

    #[test]
    fn test_future_entries_untouched() {
        let mut sched = create_started_scheduler(500);
        sched.enqueue_dummy(CircuitId::from_raw(1), 1000);
        let stats = sched.tick(100, |_| panic!("future entry must not fire"));
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.remaining, 1);
    }

    #[test]
    fn test_lazy_start_flag() {
        let mut sched = EventScheduler::new();
        assert!(!sched.is_started());
        sched.start();
        sched.start();
        assert!(sched.is_started());
    }
}
