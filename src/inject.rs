// Cell Injection — turning program decisions into cell traffic
//
// Dummy injection rides the normal encrypted transmit path. Delay
// injection plants a sentinel marker in the circuit's own outbound
// queue; the paired dequeue routine withholds cells until the marker's
// trigger time, synthesizing dummies when no real traffic is waiting.
// Every operation updates the shared per-circuit counters the next
// program invocation reads.

use crate::cell::{RelayCell, RelayCommand};
use crate::circuit::{CellTransport, CircuitId, TransportError};
use crate::mux::delay::DelayPolicy;
use crate::runtime::CircuitStatus;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

/// A delay marker older than this past its trigger degrades to normal
/// sending instead of gating the queue
pub const DELAY_MARKER_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("Transport: {0}")]
    Transport(#[from] TransportError),
}

/// One element of a circuit's outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedCell {
    /// A real cell awaiting transmit
    Real(Vec<u8>),
    /// Sentinel gating the cells behind it until `trigger_ms`
    DelayMarker {
        inserted_ms: u64,
        trigger_ms: u64,
        pending: u32,
    },
}

/// Result of one dequeue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    /// A cell ready for the wire (real or synthesized dummy)
    Cell(Vec<u8>),
    /// A delay marker is holding the queue shut
    Withheld,
    /// Nothing queued
    Empty,
}

/// Per-circuit outbound cell queue with delay-marker support
#[derive(Debug, Default)]
pub struct OutboundQueue {
    cells: VecDeque<QueuedCell>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            cells: VecDeque::new(),
        }
    }

    /// Queue a real cell behind any pending marker
    pub fn push_real(&mut self, bytes: Vec<u8>) {
        self.cells.push_back(QueuedCell::Real(bytes));
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of real cells waiting (markers excluded)
    pub fn real_backlog(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| matches!(c, QueuedCell::Real(_)))
            .count()
    }

    /// Whether the queue head is a delay marker
    pub fn head_is_marker(&self) -> bool {
        matches!(self.cells.front(), Some(QueuedCell::DelayMarker { .. }))
    }

    /// Remove the first real cell behind the head marker, if any
    fn take_real_behind_marker(&mut self) -> Option<Vec<u8>> {
        let pos = self
            .cells
            .iter()
            .skip(1)
            .position(|c| matches!(c, QueuedCell::Real(_)))?
            + 1;
        match self.cells.remove(pos) {
            Some(QueuedCell::Real(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

/// Build a dummy cell, encrypt it to the unit's target hop, and place
/// it on the normal transmit queue
///
/// Fails (logged by the caller, non-fatal) while the target hop's
/// handshake is incomplete; the program simply retries next tick.
pub fn inject_dummy(
    transport: &dyn CellTransport,
    circuit: CircuitId,
    target_hop: u8,
    status: &mut CircuitStatus,
    now_ms: u64,
) -> Result<(), InjectError> {
    if !transport.hop_established(circuit, target_hop) {
        return Err(InjectError::Transport(TransportError::HopUnavailable(
            target_hop,
        )));
    }
    transport.encrypt_and_queue(circuit, target_hop, &RelayCell::dummy_bytes())?;
    status.note_padding_sent(now_ms);
    debug!("{}: dummy cell queued to hop {}", circuit, target_hop);
    Ok(())
}

/// Plant a delay marker ahead of `pending` cells in the outbound queue
///
/// A marker already at the head is updated in place rather than
/// stacked: consecutive delay decisions coalesce into one gap.
pub fn inject_delay(
    queue: &mut OutboundQueue,
    circuit: CircuitId,
    trigger_ms: u64,
    pending: u32,
    now_ms: u64,
) {
    if let Some(QueuedCell::DelayMarker {
        trigger_ms: t,
        pending: p,
        ..
    }) = queue.cells.front_mut()
    {
        *t = trigger_ms;
        *p = pending;
        debug!("{}: delay marker updated (trigger={}ms)", circuit, trigger_ms);
    } else {
        queue.cells.push_front(QueuedCell::DelayMarker {
            inserted_ms: now_ms,
            trigger_ms,
            pending,
        });
        debug!(
            "{}: delay marker planted (trigger={}ms, pending={})",
            circuit, trigger_ms, pending
        );
    }
}

/// Annotate the Delay mux policy instead of planting an in-queue marker
pub fn delay_gap(
    policy: &mut DelayPolicy,
    circuit: CircuitId,
    trigger_ms: u64,
    pending: u32,
    now_ms: u64,
) {
    policy.annotate_gap(circuit, trigger_ms, pending, now_ms);
    debug!(
        "{}: mux gap annotated (until={}ms, pending={})",
        circuit, trigger_ms, pending
    );
}

/// Dequeue one cell, honoring any delay marker at the head
///
/// A marker stale beyond its trigger plus `DELAY_MARKER_TIMEOUT_MS`
/// is discarded and sending degrades to normal. Before the trigger
/// the queue withholds. On or after the trigger each call releases
/// the next real cell if present, else a synthesized dummy, until
/// the marker's pending count reaches zero.
pub fn dequeue(
    queue: &mut OutboundQueue,
    circuit: CircuitId,
    status: &mut CircuitStatus,
    now_ms: u64,
) -> Dequeued {
    loop {
        let (trigger, count, inserted) = match queue.cells.front() {
            None => return Dequeued::Empty,
            Some(QueuedCell::Real(_)) => {
                if let Some(QueuedCell::Real(bytes)) = queue.cells.pop_front() {
                    status.note_sent(RelayCommand::Data, now_ms);
                    return Dequeued::Cell(bytes);
                }
                return Dequeued::Empty;
            }
            Some(QueuedCell::DelayMarker {
                inserted_ms,
                trigger_ms,
                pending,
            }) => (*trigger_ms, *pending, *inserted_ms),
        };

        if now_ms > trigger.saturating_add(DELAY_MARKER_TIMEOUT_MS) {
            warn!(
                "{}: delay marker stale ({}ms past trigger), degrading to normal sending",
                circuit,
                now_ms - trigger
            );
            queue.cells.pop_front();
            continue;
        }
        if now_ms < trigger {
            return Dequeued::Withheld;
        }

        // Trigger reached: release one gated cell per call
        let released = match queue.take_real_behind_marker() {
            Some(bytes) => {
                status.note_sent(RelayCommand::Data, now_ms);
                bytes
            }
            None => {
                status.note_padding_sent(now_ms);
                RelayCell::dummy_bytes()
            }
        };

        let remaining = count.saturating_sub(1);
        if remaining == 0 {
            queue.cells.pop_front();
            debug!("{}: delay marker drained (inserted={}ms)", circuit, inserted);
        } else if let Some(QueuedCell::DelayMarker { pending, .. }) = queue.cells.front_mut() {
            *pending = remaining;
        }
        return Dequeued::Cell(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CELL_LEN;
    use parking_lot::Mutex;

    struct FakeTransport {
        established: bool,
        queued: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl FakeTransport {
        fn new(established: bool) -> Self {
            Self {
                established,
                queued: Mutex::new(Vec::new()),
            }
        }
    }

    impl CellTransport for FakeTransport {
        fn send_control_cell(&self, _circuit: CircuitId, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn encrypt_and_queue(
            &self,
            _circuit: CircuitId,
            hop_index: u8,
            bytes: &[u8],
        ) -> Result<(), TransportError> {
            self.queued.lock().push((hop_index, bytes.to_vec()));
            Ok(())
        }

        fn hop_established(&self, _circuit: CircuitId, _hop_index: u8) -> bool {
            self.established
        }
    }

    fn circ() -> CircuitId {
        CircuitId::from_raw(5)
    }

    #[test]
    fn test_inject_dummy_queues_cell() {
        let transport = FakeTransport::new(true);
        let mut status = CircuitStatus::default();

        inject_dummy(&transport, circ(), 1, &mut status, 100).unwrap();

        let queued = transport.queued.lock();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, 1);
        assert_eq!(queued[0].1.len(), CELL_LEN);
        assert_eq!(status.padding_sent, 1);
        assert_eq!(status.cells_sent, 1);
        assert_eq!(status.last_padding_time, 100);
        assert_eq!(status.padding_start_time, 100);
    }

    #[test]
    fn test_inject_dummy_hop_not_established() {
        let transport = FakeTransport::new(false);
        let mut status = CircuitStatus::default();

        let result = inject_dummy(&transport, circ(), 2, &mut status, 100);
        assert!(matches!(
            result,
            Err(InjectError::Transport(TransportError::HopUnavailable(2)))
        ));
        assert_eq!(status.padding_sent, 0);
        assert!(transport.queued.lock().is_empty());
    }

    #[test]
    fn test_dequeue_empty() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        assert_eq!(dequeue(&mut queue, circ(), &mut status, 0), Dequeued::Empty);
    }

    #[test]
    fn test_dequeue_plain_real_cell() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        queue.push_real(vec![1, 2, 3]);

        assert_eq!(
            dequeue(&mut queue, circ(), &mut status, 10),
            Dequeued::Cell(vec![1, 2, 3])
        );
        assert_eq!(status.cells_sent, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_marker_withholds_before_trigger() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        queue.push_real(vec![9]);
        inject_delay(&mut queue, circ(), 1000, 1, 0);

        assert_eq!(dequeue(&mut queue, circ(), &mut status, 500), Dequeued::Withheld);
        assert_eq!(dequeue(&mut queue, circ(), &mut status, 999), Dequeued::Withheld);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_marker_releases_real_cell_on_trigger() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        queue.push_real(vec![9]);
        inject_delay(&mut queue, circ(), 1000, 1, 0);

        assert_eq!(
            dequeue(&mut queue, circ(), &mut status, 1000),
            Dequeued::Cell(vec![9])
        );
        // Marker drained with its pending count
        assert!(queue.is_empty());
        assert_eq!(status.padding_sent, 0);
    }

    #[test]
    fn test_scenario_e_synthesized_dummies() {
        // Two consecutive injectDelay(trigger=now+1000, pending=2) calls
        // with no real cells arriving
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        let now = 100;

        inject_delay(&mut queue, circ(), now + 1000, 2, now);
        inject_delay(&mut queue, circ(), now + 1000, 2, now);
        // Coalesced into a single marker
        assert_eq!(queue.len(), 1);

        // Withheld until the trigger
        assert_eq!(dequeue(&mut queue, circ(), &mut status, now + 999), Dequeued::Withheld);

        // On trigger: two synthesized dummy cells
        let first = dequeue(&mut queue, circ(), &mut status, now + 1000);
        let second = dequeue(&mut queue, circ(), &mut status, now + 1001);
        for released in [&first, &second] {
            match released {
                Dequeued::Cell(bytes) => {
                    let cell = RelayCell::from_bytes(bytes).unwrap();
                    assert!(cell.is_noop());
                }
                other => panic!("expected a synthesized dummy, got {:?}", other),
            }
        }
        assert_eq!(status.padding_sent, 2);

        // Marker gone; normal dequeue resumes
        assert_eq!(dequeue(&mut queue, circ(), &mut status, now + 1002), Dequeued::Empty);
        queue.push_real(vec![7]);
        assert_eq!(
            dequeue(&mut queue, circ(), &mut status, now + 1003),
            Dequeued::Cell(vec![7])
        );
    }

    #[test]
    fn test_marker_mixes_real_and_dummy() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        inject_delay(&mut queue, circ(), 100, 2, 0);
        queue.push_real(vec![4]);

        // One real cell gated, then a synthesized dummy
        assert_eq!(dequeue(&mut queue, circ(), &mut status, 100), Dequeued::Cell(vec![4]));
        match dequeue(&mut queue, circ(), &mut status, 101) {
            Dequeued::Cell(bytes) => assert!(RelayCell::from_bytes(&bytes).unwrap().is_noop()),
            other => panic!("expected dummy, got {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_marker_degrades_to_normal() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        queue.push_real(vec![8]);
        inject_delay(&mut queue, circ(), 100, 2, 0);

        // Well past trigger + timeout: marker dropped, real cell flows
        let result = dequeue(
            &mut queue,
            circ(),
            &mut status,
            100 + DELAY_MARKER_TIMEOUT_MS + 1,
        );
        assert_eq!(result, Dequeued::Cell(vec![8]));
        assert!(!queue.head_is_marker());
        assert_eq!(status.padding_sent, 0);
    }

    #[test]
    fn test_marker_exact_timeout_boundary_still_gates() {
        let mut queue = OutboundQueue::new();
        let mut status = CircuitStatus::default();
        inject_delay(&mut queue, circ(), 100, 1, 0);

        // now == trigger + timeout is the last gated instant
        match dequeue(&mut queue, circ(), &mut status, 100 + DELAY_MARKER_TIMEOUT_MS) {
            Dequeued::Cell(bytes) => assert!(RelayCell::from_bytes(&bytes).unwrap().is_noop()),
            other => panic!("expected dummy, got {:?}", other),
        }
    }

    #[test]
    fn test_real_backlog_counts_markers_out() {
        let mut queue = OutboundQueue::new();
        queue.push_real(vec![1]);
        inject_delay(&mut queue, circ(), 50, 1, 0);
        queue.push_real(vec![2]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.real_backlog(), 2);
        assert!(queue.head_is_marker());
    }
}
