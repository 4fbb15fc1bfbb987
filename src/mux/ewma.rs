// EWMA Scheduling Policy — decaying per-circuit activity scores
//
// Each circuit's score rises with transmitted cells and decays
// geometrically every tick, so intermittently-active circuits are
// never starved by bulk flows. Uniform decay preserves relative order,
// which lets decay be applied as a growing cell weight instead of
// touching every entry; the weight is renormalized before it can
// overflow.

use super::{ChannelLoad, CircuitMuxPolicy};
use crate::circuit::CircuitId;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Weight renormalization threshold
const RESCALE_THRESHOLD: f64 = 1e60;

/// EWMA policy parameters
#[derive(Debug, Clone, Copy)]
pub struct EwmaConfig {
    /// Ticks for a circuit's score to halve
    pub half_life_ticks: u32,
}

impl Default for EwmaConfig {
    fn default() -> Self {
        Self { half_life_ticks: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScoreKey {
    // Raw bits order identically to the underlying non-negative f64
    bits: u64,
    circuit: CircuitId,
}

impl ScoreKey {
    fn new(score: f64, circuit: CircuitId) -> Self {
        Self {
            bits: score.to_bits(),
            circuit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CircuitScore {
    /// Score in current-weight units (divide by cell_weight to read)
    score: f64,
    queued: u64,
    active: bool,
}

/// EWMA circuit-mux policy
#[derive(Debug)]
pub struct EwmaPolicy {
    config: EwmaConfig,
    entries: HashMap<CircuitId, CircuitScore>,
    ordered: BTreeSet<ScoreKey>,
    /// Per-tick growth applied to new transmissions; equivalent to
    /// decaying every stored score each tick
    cell_weight: f64,
    growth_per_tick: f64,
}

impl EwmaPolicy {
    pub fn new(config: EwmaConfig) -> Self {
        let half_life = config.half_life_ticks.max(1) as f64;
        Self {
            config,
            entries: HashMap::new(),
            ordered: BTreeSet::new(),
            cell_weight: 1.0,
            growth_per_tick: 2f64.powf(1.0 / half_life),
        }
    }

    pub fn config(&self) -> &EwmaConfig {
        &self.config
    }

    /// A circuit's score in absolute units (for tests and diagnostics)
    pub fn effective_score(&self, circuit: CircuitId) -> Option<f64> {
        self.entries.get(&circuit).map(|e| e.score / self.cell_weight)
    }

    fn insert_active(&mut self, circuit: CircuitId) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            if !entry.active {
                entry.active = true;
                self.ordered.insert(ScoreKey::new(entry.score, circuit));
            }
        }
    }

    fn remove_active(&mut self, circuit: CircuitId) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            if entry.active {
                entry.active = false;
                self.ordered.remove(&ScoreKey::new(entry.score, circuit));
            }
        }
    }

    fn rescore(&mut self, circuit: CircuitId, delta: f64) {
        if let Some(entry) = self.entries.get_mut(&circuit) {
            let was_active = entry.active;
            if was_active {
                self.ordered.remove(&ScoreKey::new(entry.score, circuit));
            }
            entry.score += delta;
            if was_active {
                self.ordered.insert(ScoreKey::new(entry.score, circuit));
            }
        }
    }

    /// Divide every score by the accumulated weight so the weight can
    /// return to 1.0 without changing relative order
    fn renormalize(&mut self) {
        let weight = self.cell_weight;
        self.ordered.clear();
        for (circuit, entry) in self.entries.iter_mut() {
            entry.score /= weight;
            if entry.active {
                self.ordered.insert(ScoreKey::new(entry.score, *circuit));
            }
        }
        self.cell_weight = 1.0;
        debug!("ewma scores renormalized");
    }
}

impl CircuitMuxPolicy for EwmaPolicy {
    fn activate(&mut self, circuit: CircuitId, _now_ms: u64) {
        self.entries.entry(circuit).or_default();
        self.insert_active(circuit);
    }

    fn deactivate(&mut self, circuit: CircuitId) {
        self.remove_active(circuit);
    }

    fn is_active(&self, circuit: CircuitId) -> bool {
        self.entries.get(&circuit).map(|e| e.active).unwrap_or(false)
    }

    fn notify_queued(&mut self, circuit: CircuitId, cells: u32, _now_ms: u64) {
        let entry = self.entries.entry(circuit).or_default();
        entry.queued += cells as u64;
        self.insert_active(circuit);
    }

    fn notify_transmitted(&mut self, circuit: CircuitId, cells: u32, _now_ms: u64) {
        let delta = cells as f64 * self.cell_weight;
        if let Some(entry) = self.entries.get_mut(&circuit) {
            entry.queued = entry.queued.saturating_sub(cells as u64);
        }
        self.rescore(circuit, delta);

        let drained = self
            .entries
            .get(&circuit)
            .map(|e| e.queued == 0)
            .unwrap_or(true);
        if drained {
            self.remove_active(circuit);
        } else {
            self.insert_active(circuit);
        }
    }

    /// Remove and return the lowest-score active circuit
    fn pick(&mut self, _now_ms: u64) -> Option<CircuitId> {
        let key = *self.ordered.iter().next()?;
        self.ordered.remove(&key);
        if let Some(entry) = self.entries.get_mut(&key.circuit) {
            entry.active = false;
        }
        Some(key.circuit)
    }

    /// One decay step: new transmissions weigh more from here on
    fn tick(&mut self, _now_ms: u64) {
        self.cell_weight *= self.growth_per_tick;
        if self.cell_weight > RESCALE_THRESHOLD {
            self.renormalize();
        }
    }

    fn channel_load(&self) -> ChannelLoad {
        match self.ordered.iter().next() {
            Some(key) => ChannelLoad::Score(f64::from_bits(key.bits) / self.cell_weight),
            None => ChannelLoad::Score(f64::INFINITY),
        }
    }

    fn active_count(&self) -> usize {
        self.ordered.len()
    }

    fn forget(&mut self, circuit: CircuitId) {
        self.remove_active(circuit);
        self.entries.remove(&circuit);
    }
}
