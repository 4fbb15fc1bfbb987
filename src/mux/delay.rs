// Delay Scheduling Policy — burst/gap schedules per circuit
//
// Circuits carry a planned burst size and a gap annotation from the
// padding layer. While a circuit sits inside its gap it is withheld
// from selection; otherwise the policy picks the circuit with the
// highest remaining real-packet backlog (ties broken arbitrarily by
// circuit id).

use super::{ChannelLoad, CircuitMuxPolicy};
use crate::circuit::CircuitId;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Per-circuit burst/gap schedule
#[derive(Debug, Clone, Copy, Default)]
pub struct DelaySchedule {
    /// When the current burst finished (gap start)
    pub burst_finish_ms: u64,
    /// Gap length; selection resumes at burst_finish + gap
    pub gap_ms: u64,
    /// Cells planned for transmit after the gap
    pub planned: u64,
    /// Cells transmitted against the plan
    pub sent: u64,
    /// Real cells currently queued
    pub queued: u64,
    /// Whether the circuit is schedulable right now
    active: bool,
    /// Whether the circuit is waiting out a gap
    in_gap: bool,
}

impl DelaySchedule {
    /// Remaining real-packet backlog: planned-but-unsent plus queued
    pub fn backlog(&self) -> u64 {
        self.planned.saturating_sub(self.sent) + self.queued
    }

    /// When the gap annotation expires
    pub fn gap_until(&self) -> u64 {
        self.burst_finish_ms.saturating_add(self.gap_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BacklogKey {
    backlog: u64,
    circuit: CircuitId,
}

/// Delay circuit-mux policy
#[derive(Debug, Default)]
pub struct DelayPolicy {
    entries: HashMap<CircuitId, DelaySchedule>,
    /// Active circuits ordered by backlog; pick takes the last (max)
    ordered: BTreeSet<BacklogKey>,
}

impl DelayPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The schedule recorded for a circuit, if any
    pub fn schedule(&self, circuit: CircuitId) -> Option<&DelaySchedule> {
        self.entries.get(&circuit)
    }

    /// Record a gap ending at `gap_until_ms` gating `pkt_count` planned
    /// cells; the circuit is withheld from selection until then
    ///
    /// This is the `delay_gap` injection path: the annotation replaces
    /// an in-queue delay marker.
    pub fn annotate_gap(
        &mut self,
        circuit: CircuitId,
        gap_until_ms: u64,
        pkt_count: u32,
        now_ms: u64,
    ) {
        self.remove_ordered(circuit);
        let entry = self.entries.entry(circuit).or_default();
        entry.burst_finish_ms = now_ms;
        entry.gap_ms = gap_until_ms.saturating_sub(now_ms);
        entry.planned = entry.planned.saturating_add(pkt_count as u64);
        entry.in_gap = true;
        entry.active = false;
        debug!("{}: gap until {}ms, planned {}", circuit, gap_until_ms, entry.planned);
    }

    fn insert_ordered(&mut self, circuit: CircuitId) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            if !entry.active && !entry.in_gap && entry.backlog() > 0 {
                entry.active = true;
                let key = BacklogKey {
                    backlog: entry.backlog(),
                    circuit,
                };
                self.ordered.insert(key);
            }
        }
    }

    fn remove_ordered(&mut self, circuit: CircuitId) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            if entry.active {
                entry.active = false;
                self.ordered.remove(&BacklogKey {
                    backlog: entry.backlog(),
                    circuit,
                });
            }
        }
    }

    /// Re-key an active circuit after its backlog changed
    fn rekey(&mut self, circuit: CircuitId, old_backlog: u64) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            if entry.active {
                self.ordered.remove(&BacklogKey {
                    backlog: old_backlog,
                    circuit,
                });
                if entry.backlog() > 0 {
                    self.ordered.insert(BacklogKey {
                        backlog: entry.backlog(),
                        circuit,
                    });
                } else {
                    entry.active = false;
                }
            }
        }
    }
}

impl CircuitMuxPolicy for DelayPolicy {
    fn activate(&mut self, circuit: CircuitId, _now_ms: u64) {
        self.entries.entry(circuit).or_default();
        self.insert_ordered(circuit);
    }

    fn deactivate(&mut self, circuit: CircuitId) {
        self.remove_ordered(circuit);
    }

    fn is_active(&self, circuit: CircuitId) -> bool {
        self.entries.get(&circuit).map(|e| e.active).unwrap_or(false)
    }

    fn notify_queued(&mut self, circuit: CircuitId, cells: u32, _now_ms: u64) {
        let old = self
            .entries
            .get(&circuit)
            .map(|e| e.backlog())
            .unwrap_or(0);
        let entry = self.entries.entry(circuit).or_default();
        entry.queued += cells as u64;
        if entry.active {
            self.rekey(circuit, old);
        } else {
            self.insert_ordered(circuit);
        }
    }

    fn notify_transmitted(&mut self, circuit: CircuitId, cells: u32, _now_ms: u64) {
        let old = match self.entries.get(&circuit) {
            Some(e) => e.backlog(),
            None => return,
        };
        if let Some(entry) = self.entries.get_mut(&circuit) {
            entry.sent = entry.sent.saturating_add(cells as u64);
            entry.queued = entry.queued.saturating_sub(cells as u64);
        }
        self.rekey(circuit, old);
        self.insert_ordered(circuit);
    }

    /// Remove and return the circuit with the highest backlog
    fn pick(&mut self, _now_ms: u64) -> Option<CircuitId> {
        let key = *self.ordered.iter().next_back()?;
        self.ordered.remove(&key);
        if let Some(entry) = self.entries.get_mut(&key.circuit) {
            entry.active = false;
        }
        Some(key.circuit)
    }

    /// Release circuits whose gap has expired
    fn tick(&mut self, now_ms: u64) {
        let expired: Vec<CircuitId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.in_gap && now_ms >= e.gap_until())
            .map(|(c, _)| *c)
            .collect();
        for circuit in expired {
            if let Some(entry) = self.entries.get_mut(&circuit) {
                entry.in_gap = false;
            }
            self.insert_ordered(circuit);
            debug!("{}: gap expired, schedulable again", circuit);
        }
    }

    /// Total real-packet backlog across all circuits
    fn channel_load(&self) -> ChannelLoad {
        ChannelLoad::Backlog(self.entries.values().map(|e| e.backlog()).sum())
    }

    fn active_count(&self) -> usize {
        self.ordered.len()
    }

    fn forget(&mut self, circuit: CircuitId) {
        self.remove_ordered(circuit);
        self.entries.remove(&circuit);
    }
}
