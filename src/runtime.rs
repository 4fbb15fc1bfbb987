// Unit Lifecycle — per-circuit padding units and their slot arrays
//
// Each circuit carries a small runtime: two bounded slot arrays (one
// per unit category), an activation context per category, and the
// shared traffic counters every program snapshot reads. Units are
// created on install, destroyed on STOP, replacement, or circuit
// teardown. Lifecycle failures are never fatal to the circuit.

use crate::cell::RelayCommand;
use crate::circuit::CircuitId;
use crate::executor::{PaddingProgram, UnitStores};
use crate::inject::OutboundQueue;
use crate::ticker::Ticker;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Slots per category; a full array deterministically evicts slot 0
pub const MAX_UNIT_SLOTS: usize = 2;

/// Number of unit categories
pub const CATEGORY_COUNT: usize = 2;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No algorithm configured for uuid {0}")]
    ConfigNotFound(u8),
}

/// Which kind of algorithm a unit runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitCategory {
    /// Decides when to switch, enable, or disable padding units
    Schedule,
    /// Decides how many dummy/delay cells to emit each tick
    Padding,
}

impl UnitCategory {
    /// Slot-array index for this category
    pub fn index(&self) -> usize {
        match self {
            UnitCategory::Schedule => 0,
            UnitCategory::Padding => 1,
        }
    }

    /// Both categories, in slot-array order
    pub fn all() -> [UnitCategory; CATEGORY_COUNT] {
        [UnitCategory::Schedule, UnitCategory::Padding]
    }
}

/// Peer-side lifecycle state, advanced only by acknowledged negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerUnitState {
    /// No acknowledgement from the peer yet
    None = 0x00,
    /// Peer confirmed the install
    Created = 0x01,
    /// Peer's ticker is armed
    Working = 0x02,
    /// Peer's ticker is disarmed but the unit survives
    Paused = 0x03,
    /// Peer cleared the unit's state
    Cleared = 0x04,
}

impl PeerUnitState {
    /// Convert from the STATE command's counter payload
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PeerUnitState::None),
            0x01 => Some(PeerUnitState::Created),
            0x02 => Some(PeerUnitState::Working),
            0x03 => Some(PeerUnitState::Paused),
            0x04 => Some(PeerUnitState::Cleared),
            _ => None,
        }
    }

    /// Convert to the STATE command's counter payload
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Shared per-circuit traffic counters consumed by program snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitStatus {
    pub last_cell_time: u64,
    pub cells_sent: u64,
    pub cells_recv: u64,
    pub padding_sent: u64,
    pub padding_recv: u64,
    pub padding_start_time: u64,
    pub last_padding_time: u64,
    pub last_relay_cmd: Option<RelayCommand>,
    pub current_relay_cmd: Option<RelayCommand>,
}

impl CircuitStatus {
    /// Record an outbound cell
    pub fn note_sent(&mut self, cmd: RelayCommand, now_ms: u64) {
        self.cells_sent += 1;
        self.last_cell_time = now_ms;
        self.last_relay_cmd = self.current_relay_cmd;
        self.current_relay_cmd = Some(cmd);
    }

    /// Record an inbound cell
    pub fn note_received(&mut self, cmd: RelayCommand, now_ms: u64) {
        self.cells_recv += 1;
        self.last_cell_time = now_ms;
        self.last_relay_cmd = self.current_relay_cmd;
        self.current_relay_cmd = Some(cmd);
        if cmd == RelayCommand::Drop {
            self.padding_recv += 1;
        }
    }

    /// Record an outbound padding cell
    pub fn note_padding_sent(&mut self, now_ms: u64) {
        self.note_sent(RelayCommand::Drop, now_ms);
        self.padding_sent += 1;
        self.last_padding_time = now_ms;
        if self.padding_start_time == 0 {
            self.padding_start_time = now_ms;
        }
    }
}

/// A versioned, installed instance of a padding algorithm
pub struct PaddingUnit {
    pub uuid: u8,
    /// Monotonic per circuit+category; 0 is reserved, wraps to 1
    pub version: u32,
    pub category: UnitCategory,
    pub peer_state: PeerUnitState,
    pub retry_count: u8,
    pub target_hop: u8,
    pub tick_interval_ms: u64,
    pub program: Box<dyn PaddingProgram>,
    pub stores: UnitStores,
}

impl std::fmt::Debug for PaddingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaddingUnit")
            .field("uuid", &self.uuid)
            .field("version", &self.version)
            .field("category", &self.category)
            .field("peer_state", &self.peer_state)
            .field("retry_count", &self.retry_count)
            .field("target_hop", &self.target_hop)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .finish_non_exhaustive()
    }
}

/// Per-category activation context
#[derive(Debug, Default)]
pub struct UnitContext {
    /// Which slot is active in this category, if any
    pub active_slot: Option<usize>,
    /// Whether the active unit's ticker may fire
    pub enabled: bool,
    pub ticker: Ticker,
    pub last_tick_time: u64,
}

/// Result of a lifecycle install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Placed in an empty (or evicted) slot with a fresh version
    Installed { slot: usize, version: u32 },
    /// Same uuid already present and `replace` was not requested
    AlreadyInstalled { slot: usize, version: u32 },
    /// Same uuid re-installed in place with a fresh version
    Replaced { slot: usize, version: u32 },
}

impl InstallOutcome {
    /// Version of the unit occupying the slot after the call
    pub fn version(&self) -> u32 {
        match self {
            InstallOutcome::Installed { version, .. }
            | InstallOutcome::AlreadyInstalled { version, .. }
            | InstallOutcome::Replaced { version, .. } => *version,
        }
    }
}

type UnitSlots = [Option<PaddingUnit>; MAX_UNIT_SLOTS];

/// Per-circuit padding state, lazily created on first install and
/// released exactly once with the circuit
#[derive(Debug)]
pub struct CircuitPaddingRuntime {
    circuit: CircuitId,
    slots: [UnitSlots; CATEGORY_COUNT],
    contexts: [UnitContext; CATEGORY_COUNT],
    version_counters: [u32; CATEGORY_COUNT],
    pub status: CircuitStatus,
    pub outbound: OutboundQueue,
}

impl CircuitPaddingRuntime {
    pub fn new(circuit: CircuitId) -> Self {
        Self {
            circuit,
            slots: Default::default(),
            contexts: Default::default(),
            version_counters: [0; CATEGORY_COUNT],
            status: CircuitStatus::default(),
            outbound: OutboundQueue::new(),
        }
    }

    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    /// Next version for a category: strictly increasing, 0 reserved,
    /// wrapping from u32::MAX back to 1
    fn next_version(&mut self, category: UnitCategory) -> u32 {
        let counter = &mut self.version_counters[category.index()];
        *counter = counter.wrapping_add(1);
        if *counter == 0 {
            *counter = 1;
        }
        *counter
    }

    /// Install a unit built from a descriptor
    ///
    /// Idempotent for an already-present uuid unless `replace` is set.
    /// With all slots full the unit in slot 0 is deterministically
    /// evicted (logged; the peer is expected to STOP it first).
    pub fn install(
        &mut self,
        uuid: u8,
        category: UnitCategory,
        target_hop: u8,
        tick_interval_ms: u64,
        program: Box<dyn PaddingProgram>,
        replace: bool,
    ) -> InstallOutcome {
        let cat = category.index();

        if let Some(slot) = self.slot_of(category, uuid) {
            if !replace {
                let version = self.slots[cat][slot].as_ref().map(|u| u.version).unwrap_or(0);
                debug!("{}: unit {} already installed (v{})", self.circuit, uuid, version);
                return InstallOutcome::AlreadyInstalled { slot, version };
            }
            let version = self.next_version(category);
            self.clear_slot(category, slot);
            self.slots[cat][slot] = Some(PaddingUnit {
                uuid,
                version,
                category,
                peer_state: PeerUnitState::None,
                retry_count: 0,
                target_hop,
                tick_interval_ms,
                program,
                stores: UnitStores::new(),
            });
            debug!("{}: replaced unit {} (v{})", self.circuit, uuid, version);
            return InstallOutcome::Replaced { slot, version };
        }

        let slot = match self.slots[cat].iter().position(|s| s.is_none()) {
            Some(free) => free,
            None => {
                let evicted = self.slots[cat][0].as_ref().map(|u| u.uuid);
                warn!(
                    "{}: {:?} slots full, evicting slot 0 (uuid {:?})",
                    self.circuit, category, evicted
                );
                self.clear_slot(category, 0);
                self.slots[cat][0] = None;
                0
            }
        };

        let version = self.next_version(category);
        self.slots[cat][slot] = Some(PaddingUnit {
            uuid,
            version,
            category,
            peer_state: PeerUnitState::None,
            retry_count: 0,
            target_hop,
            tick_interval_ms,
            program,
            stores: UnitStores::new(),
        });
        debug!("{}: installed unit {} (v{}) in slot {}", self.circuit, uuid, version, slot);
        InstallOutcome::Installed { slot, version }
    }

    /// Remove a unit by uuid, tolerant of a stale expected version
    ///
    /// A version mismatch is logged but the removal proceeds; returns
    /// whether a unit was found.
    pub fn remove(&mut self, uuid: u8, expected_version: u32) -> bool {
        for category in UnitCategory::all() {
            if let Some(slot) = self.slot_of(category, uuid) {
                let cat = category.index();
                if let Some(unit) = &self.slots[cat][slot] {
                    if unit.version != expected_version {
                        warn!(
                            "{}: removing unit {} with version mismatch: expected v{}, have v{}",
                            self.circuit, uuid, expected_version, unit.version
                        );
                    }
                }
                self.clear_slot(category, slot);
                self.slots[cat][slot] = None;
                debug!("{}: removed unit {}", self.circuit, uuid);
                return true;
            }
        }
        false
    }

    /// Find a unit across both categories
    pub fn unit_by_uuid(&self, uuid: u8) -> Option<&PaddingUnit> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|s| s.as_ref())
            .find(|u| u.uuid == uuid)
    }

    /// Mutable lookup across both categories
    pub fn unit_by_uuid_mut(&mut self, uuid: u8) -> Option<&mut PaddingUnit> {
        self.slots
            .iter_mut()
            .flatten()
            .filter_map(|s| s.as_mut())
            .find(|u| u.uuid == uuid)
    }

    /// Make the named unit the active one in its category and arm its
    /// ticker; false if no such unit is installed
    pub fn activate_by_uuid(&mut self, uuid: u8, now_ms: u64) -> bool {
        for category in UnitCategory::all() {
            if let Some(slot) = self.slot_of(category, uuid) {
                let interval = self.slots[category.index()][slot]
                    .as_ref()
                    .map(|u| u.tick_interval_ms)
                    .unwrap_or(0);
                let ctx = &mut self.contexts[category.index()];
                ctx.active_slot = Some(slot);
                ctx.enabled = true;
                ctx.ticker.arm(now_ms, interval);
                debug!("{}: activated unit {} ({:?})", self.circuit, uuid, category);
                return true;
            }
        }
        false
    }

    /// Disarm a category's ticker without forgetting the active slot
    pub fn pause_category(&mut self, category: UnitCategory) {
        let ctx = &mut self.contexts[category.index()];
        ctx.enabled = false;
        ctx.ticker.disarm();
    }

    /// The active unit of a category, if one is armed
    pub fn active_unit(&self, category: UnitCategory) -> Option<&PaddingUnit> {
        let ctx = &self.contexts[category.index()];
        ctx.active_slot
            .and_then(|slot| self.slots[category.index()][slot].as_ref())
    }

    /// Activation context for a category
    pub fn context(&self, category: UnitCategory) -> &UnitContext {
        &self.contexts[category.index()]
    }

    /// Mutable activation context for a category
    pub fn context_mut(&mut self, category: UnitCategory) -> &mut UnitContext {
        &mut self.contexts[category.index()]
    }

    /// Split borrow used by the drive loop: the active unit of a
    /// category together with its context and the shared status
    pub fn active_parts_mut(
        &mut self,
        category: UnitCategory,
    ) -> Option<(&mut PaddingUnit, &mut UnitContext, &mut CircuitStatus)> {
        let cat = category.index();
        let slot = self.contexts[cat].active_slot?;
        let (contexts, slots, status) = (&mut self.contexts, &mut self.slots, &mut self.status);
        let unit = slots[cat][slot].as_mut()?;
        Some((unit, &mut contexts[cat], status))
    }

    /// Whether any unit is installed in either category
    pub fn has_units(&self) -> bool {
        self.slots.iter().flatten().any(|s| s.is_some())
    }

    /// Disarm every ticker; used on teardown before release
    pub fn disable_all_tickers(&mut self) {
        for ctx in &mut self.contexts {
            ctx.enabled = false;
            ctx.ticker.disarm();
        }
    }

    fn slot_of(&self, category: UnitCategory, uuid: u8) -> Option<usize> {
        self.slots[category.index()]
            .iter()
            .position(|s| s.as_ref().map(|u| u.uuid) == Some(uuid))
    }

    /// Drop activation if it points at `slot` before the slot is reused
    fn clear_slot(&mut self, category: UnitCategory, slot: usize) {
        let ctx = &mut self.contexts[category.index()];
        if ctx.active_slot == Some(slot) {
            ctx.active_slot = None;
            ctx.enabled = false;
            ctx.ticker.disarm();
        }
    }
}
