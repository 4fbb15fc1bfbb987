// Algorithm Executor — the sandboxed decision contract
//
// Each padding unit wraps an opaque program. Every ticker fire hands
// the program a fixed status snapshot plus its two host-owned stores
// and gets back one tagged decision with an optional next-tick delay.
// The same contract serves Schedule programs (when to switch, enable
// or disable units) and Padding programs (how many dummy or delay
// cells this tick). The host, not the program, mutates circuit state.

use crate::cell::RelayCommand;
use crate::circuit::CircuitId;
use crate::runtime::UnitCategory;
use std::collections::HashMap;
use std::collections::VecDeque;
use thiserror::Error;

/// Maximum events a single program invocation may enqueue.
/// Bounds runaway event storms from a misbehaving program.
pub const MAX_EVENTS_PER_TICK: u32 = 5;

/// Capacity of a unit's scheduled-offset data stream
pub const DATA_STREAM_CAPACITY: usize = 64;

/// Maximum distinct keys in a unit's histogram
pub const HISTOGRAM_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unknown program tag: {0:#04x}")]
    UnknownProgram(u8),
    #[error("Empty program bytecode")]
    EmptyBytecode,
    #[error("Program operand error: {0}")]
    BadOperand(String),
    #[error("Program tag {0:#04x} not valid for category {1:?}")]
    CategoryMismatch(u8, UnitCategory),
}

/// Fixed snapshot handed to every program invocation
///
/// Timestamps are monotonic milliseconds since an arbitrary process
/// epoch; they do not wrap within a circuit's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    /// Uuid of the unit being invoked
    pub unit_uuid: u8,
    /// Live version of the unit being invoked
    pub unit_version: u32,
    /// Category of the unit being invoked
    pub category: UnitCategory,
    /// Circuit the unit is installed on
    pub circuit: CircuitId,
    /// Current monotonic time
    pub now: u64,
    /// When padding first started on this circuit (0 = never)
    pub padding_start_time: u64,
    /// Last time a padding cell was sent (0 = never)
    pub last_padding_time: u64,
    /// Last time any cell moved on the circuit (0 = never)
    pub last_cell_time: u64,
    /// Cells sent on the circuit, padding included
    pub sent_count: u64,
    /// Cells received on the circuit, padding included
    pub recv_count: u64,
    /// Uuid of the active padding unit, if any
    pub current_unit: Option<u8>,
    /// Relay command of the previous cell observed
    pub last_relay_cmd: Option<RelayCommand>,
    /// Relay command of the most recent cell observed
    pub current_relay_cmd: Option<RelayCommand>,
}

/// One tagged decision returned by a program invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramAction {
    /// Do nothing this tick
    Idle,
    /// Inject `count` dummy cells immediately
    InjectDummy { count: u32 },
    /// Enqueue a dummy injection `offset_ms` from now
    ScheduleDummy { offset_ms: u64 },
    /// Enqueue a delay gap: marker at `offset_ms`, wake after `gap_ms`,
    /// gating `pkt_count` cells
    ScheduleDelay {
        offset_ms: u64,
        gap_ms: u64,
        pkt_count: u32,
    },
    /// Reset another unit's stores and set its activation state
    ResetUnit { uuid: u8, enabled: bool },
    /// Make the named unit the active one in its category
    ActivateUnit { uuid: u8 },
}

/// Full invocation result: one action plus the next ticker delay
///
/// `next_tick_delay_ms == None` falls back to the unit's configured
/// tick interval; programs override it to pace themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramOutcome {
    pub action: ProgramAction,
    pub next_tick_delay_ms: Option<u64>,
}

impl ProgramOutcome {
    /// An idle outcome that rearms the ticker after `delay_ms`
    pub fn idle(delay_ms: u64) -> Self {
        Self {
            action: ProgramAction::Idle,
            next_tick_delay_ms: Some(delay_ms),
        }
    }
}

/// Bounded FIFO ring of scheduled offsets, owned by the host
///
/// Programs drain offsets with `next()` and must refill before
/// scheduling further delays once the stream reports exhaustion.
#[derive(Debug)]
pub struct DataStream {
    buf: VecDeque<u64>,
    capacity: usize,
    exhausted: bool,
}

impl DataStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            exhausted: true,
        }
    }

    /// Append offsets up to capacity; returns how many were accepted
    pub fn refill(&mut self, offsets: &[u64]) -> usize {
        let room = self.capacity.saturating_sub(self.buf.len());
        let accepted = offsets.len().min(room);
        self.buf.extend(offsets.iter().take(accepted).copied());
        if !self.buf.is_empty() {
            self.exhausted = false;
        }
        accepted
    }

    /// Pop the next scheduled offset; flags exhaustion on the last one
    pub fn next(&mut self) -> Option<u64> {
        let value = self.buf.pop_front();
        if self.buf.is_empty() {
            self.exhausted = true;
        }
        value
    }

    /// Whether the stream has run dry since the last refill
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all pending offsets and mark exhausted
    pub fn clear(&mut self) {
        self.buf.clear();
        self.exhausted = true;
    }
}

/// Bounded key → counter map, owned by the host
#[derive(Debug)]
pub struct Histogram {
    bins: HashMap<u64, u64>,
    capacity: usize,
}

impl Histogram {
    pub fn new(capacity: usize) -> Self {
        Self {
            bins: HashMap::new(),
            capacity,
        }
    }

    /// Increment a bin; returns false when a new key would exceed capacity
    pub fn increment(&mut self, key: u64) -> bool {
        if let Some(count) = self.bins.get_mut(&key) {
            *count = count.saturating_add(1);
            return true;
        }
        if self.bins.len() >= self.capacity {
            return false;
        }
        self.bins.insert(key, 1);
        true
    }

    /// Current count for a key (0 when absent)
    pub fn get(&self, key: u64) -> u64 {
        self.bins.get(&key).copied().unwrap_or(0)
    }

    /// Drop all bins
    pub fn reset(&mut self) {
        self.bins.clear();
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// Private per-unit state, created with the unit and destroyed with it
#[derive(Debug)]
pub struct UnitStores {
    pub stream: DataStream,
    pub histogram: Histogram,
}

impl UnitStores {
    pub fn new() -> Self {
        Self {
            stream: DataStream::new(DATA_STREAM_CAPACITY),
            histogram: Histogram::new(HISTOGRAM_CAPACITY),
        }
    }

    /// Reset both stores to their just-created state
    pub fn reset(&mut self) {
        self.stream.clear();
        self.histogram.reset();
    }
}

impl Default for UnitStores {
    fn default() -> Self {
        Self::new()
    }
}

/// The opaque program contract
///
/// Implementations must not block and must not retain references into
/// the snapshot; all persistent state lives in the provided stores.
pub trait PaddingProgram: Send {
    fn invoke(&mut self, status: &StatusSnapshot, stores: &mut UnitStores) -> ProgramOutcome;
}

/// Turns configured bytecode blobs into executable programs
pub trait ProgramLoader: Send + Sync {
    fn load(
        &self,
        category: UnitCategory,
        bytecode: &[u8],
    ) -> Result<Box<dyn PaddingProgram>, ExecutorError>;
}
